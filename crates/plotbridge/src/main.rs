mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(
    name = "plotbridge",
    version,
    about = "Send typed data and script text to a plotting companion"
)]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "info",
        env = "PLOTBRIDGE_LOG_LEVEL",
        global = true
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_subcommand() {
        let cli = Cli::try_parse_from([
            "plotbridge",
            "run",
            "plot.py",
            "--companion",
            "python3",
            "--companion-arg",
            "-u",
            "--var",
            "x=1,2,3",
            "--var",
            "y=4,5,6",
            "--send-back",
            "y",
        ])
        .expect("run args should parse");

        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.companion_args, ["-u"]);
        assert_eq!(args.vars, ["x=1,2,3", "y=4,5,6"]);
        assert_eq!(args.send_back, ["y"]);
    }

    #[test]
    fn parses_companion_subcommand() {
        let cli = Cli::try_parse_from([
            "plotbridge",
            "--log-level",
            "error",
            "companion",
            "--endpoint",
            "/tmp/pb.sock",
            "--reply-endpoint",
            "/tmp/pb-reply.sock",
        ])
        .expect("companion args should parse");

        assert_eq!(cli.log_level, LogLevel::Error);
        assert!(matches!(cli.command, Command::Companion(_)));
    }

    #[test]
    fn run_requires_a_script() {
        let err = Cli::try_parse_from(["plotbridge", "run", "--companion", "python3"])
            .expect_err("missing script should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
