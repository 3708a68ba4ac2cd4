use clap::{Args, Subcommand};
use std::path::PathBuf;

use crate::exit::CliResult;
use crate::output::OutputFormat;

pub mod companion;
pub mod run;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Attach to a session as a stand-in companion and print every batch.
    Companion(CompanionArgs),
    /// Send a script file and vector bindings to a companion as one batch.
    Run(RunArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Companion(args) => companion::run(args, format),
        Command::Run(args) => run::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct CompanionArgs {
    /// Data endpoint of the host session.
    #[arg(long, env = "PLOTBRIDGE_ENDPOINT")]
    pub endpoint: PathBuf,
    /// Reply endpoint of a duplex session.
    #[arg(long)]
    pub reply_endpoint: Option<PathBuf>,
    /// Session token to present during the handshake.
    #[arg(long, env = "PLOTBRIDGE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Script file sent as the batch's script text.
    pub script: PathBuf,
    /// Companion program to launch.
    #[arg(long, env = "PLOTBRIDGE_COMPANION")]
    pub companion: PathBuf,
    /// Argument passed to the companion before the endpoint arguments.
    #[arg(long = "companion-arg", value_name = "ARG", allow_hyphen_values = true)]
    pub companion_args: Vec<String>,
    /// float64 vector binding, e.g. `x=0,0.5,1`.
    #[arg(long = "var", value_name = "NAME=V,V,..")]
    pub vars: Vec<String>,
    /// Binding the companion writes back; makes the session duplex.
    #[arg(long = "send-back", value_name = "NAME")]
    pub send_back: Vec<String>,
    /// Data endpoint to bind. Default: a per-process socket in the temp dir.
    #[arg(long, env = "PLOTBRIDGE_ENDPOINT")]
    pub endpoint: Option<PathBuf>,
    /// Session token the companion must present.
    #[arg(long, env = "PLOTBRIDGE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,
    /// How long to wait for the companion to attach (e.g. 10s, 500ms).
    #[arg(long, default_value = "10s")]
    pub attach_timeout: String,
    /// Bound on waiting for replies (e.g. 30s). Default: wait indefinitely.
    #[arg(long)]
    pub reply_timeout: Option<String>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}
