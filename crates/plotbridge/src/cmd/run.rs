use std::time::Duration;

use plotbridge_session::{Arg, CompanionCommand, ProcessLauncher, Session, SessionConfig};

use crate::cmd::RunArgs;
use crate::exit::{io_error, session_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_report, OutputFormat};

/// Establish a session, send the script with its bindings as one batch, tear down.
pub fn run(args: RunArgs, format: OutputFormat) -> CliResult<i32> {
    let script = std::fs::read_to_string(&args.script)
        .map_err(|err| io_error(&format!("cannot read {}", args.script.display()), err))?;

    let mut vars = args
        .vars
        .iter()
        .map(|var| parse_var(var))
        .collect::<CliResult<Vec<_>>>()?;
    for name in &args.send_back {
        if !vars.iter().any(|(var, _)| var == name) {
            return Err(CliError::new(
                USAGE,
                format!("--send-back {name}: no --var named {name}"),
            ));
        }
    }

    let mut config =
        SessionConfig::default().with_attach_timeout(parse_duration(&args.attach_timeout)?);
    if let Some(endpoint) = args.endpoint {
        config = config.with_endpoint(endpoint);
    }
    if !args.send_back.is_empty() {
        config = config.with_duplex();
    }
    if let Some(token) = args.token {
        config = config.with_token(token);
    }
    if let Some(timeout) = &args.reply_timeout {
        config = config.with_reply_timeout(Some(parse_duration(timeout)?));
    }

    let launcher =
        ProcessLauncher::new(CompanionCommand::new(&args.companion).args(&args.companion_args));
    let mut session = Session::with_launcher(config, launcher);
    session
        .establish()
        .map_err(|err| session_error("establish failed", err))?;

    let mut bindings: Vec<Arg<'_>> = vars
        .iter_mut()
        .map(|(name, values)| {
            if args.send_back.contains(name) {
                Arg::send_back(name, values)
            } else {
                Arg::new(name, &*values)
            }
        })
        .collect();
    let report = session
        .raw_with(&script, &mut bindings)
        .map_err(|err| session_error("batch failed", err))?;
    drop(bindings);

    session
        .teardown()
        .map_err(|err| session_error("teardown failed", err))?;

    let returned: Vec<(String, Vec<f64>)> = vars
        .into_iter()
        .filter(|(name, _)| args.send_back.contains(name))
        .collect();
    print_report(&report, &returned, format);
    Ok(SUCCESS)
}

/// Parse `name=v,v,..` into a float64 vector binding.
fn parse_var(var: &str) -> CliResult<(String, Vec<f64>)> {
    let (name, values) = var
        .split_once('=')
        .ok_or_else(|| CliError::new(USAGE, format!("--var {var}: expected NAME=V,V,..")))?;
    plotbridge_data::validate_name(name)
        .map_err(|err| CliError::new(USAGE, format!("--var {var}: {err}")))?;

    let values = if values.trim().is_empty() {
        Vec::new()
    } else {
        values
            .split(',')
            .map(|value| {
                value.trim().parse::<f64>().map_err(|_| {
                    CliError::new(USAGE, format!("--var {var}: {value:?} is not a number"))
                })
            })
            .collect::<CliResult<Vec<_>>>()?
    };
    Ok((name.to_string(), values))
}

fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
