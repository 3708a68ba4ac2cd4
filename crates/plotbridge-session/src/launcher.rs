//! Starting and stopping the companion process.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Result, SessionError};

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Environment variable carrying the session token to a launched companion.
pub const TOKEN_ENV: &str = "PLOTBRIDGE_TOKEN";

/// Where a freshly launched companion should attach.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub endpoint: &'a Path,
    /// Present in duplex sessions.
    pub reply_endpoint: Option<&'a Path>,
    pub token: Option<&'a str>,
}

/// Starts the companion for a session and stops it again at teardown.
pub trait Launcher: Send {
    /// Start the companion. Returns its process id when known.
    fn launch(&mut self, request: &LaunchRequest<'_>) -> Result<Option<u32>>;

    /// Wait up to `grace` for the companion to exit, then stop it.
    fn reap(&mut self, grace: Duration) -> Result<()>;
}

/// Program and leading arguments of the companion.
///
/// The endpoint arguments are appended at launch:
/// `<program> <args...> --endpoint <path> [--reply-endpoint <path>]`.
/// The session token travels in [`TOKEN_ENV`], never on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl CompanionCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Build the full command line for `request`.
    pub fn to_command(&self, request: &LaunchRequest<'_>) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("--endpoint").arg(request.endpoint);
        if let Some(reply) = request.reply_endpoint {
            command.arg("--reply-endpoint").arg(reply);
        }
        match request.token {
            Some(token) => command.env(TOKEN_ENV, token),
            None => command.env_remove(TOKEN_ENV),
        };
        command
    }
}

/// Launches the companion as a child process.
#[derive(Debug)]
pub struct ProcessLauncher {
    command: CompanionCommand,
    child: Option<Child>,
}

impl ProcessLauncher {
    pub fn new(command: CompanionCommand) -> Self {
        Self {
            command,
            child: None,
        }
    }

    pub fn command(&self) -> &CompanionCommand {
        &self.command
    }

    /// Process id of the running companion, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    fn launch_error(&self, source: std::io::Error) -> SessionError {
        SessionError::Launch {
            program: self.command.program.display().to_string(),
            source,
        }
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&mut self, request: &LaunchRequest<'_>) -> Result<Option<u32>> {
        if self.child.is_some() {
            return Err(SessionError::Config(
                "companion already running; reap it before launching again".to_string(),
            ));
        }

        let child = self
            .command
            .to_command(request)
            .stdin(Stdio::null())
            .spawn()
            .map_err(|source| self.launch_error(source))?;
        let pid = child.id();
        info!(program = %self.command.program.display(), pid, "companion launched");
        self.child = Some(child);
        Ok(Some(pid))
    }

    fn reap(&mut self, grace: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let deadline = Instant::now() + grace;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!(pid = child.id(), %status, "companion exited");
                    return Ok(());
                }
                Ok(None) if Instant::now() < deadline => std::thread::sleep(REAP_POLL_INTERVAL),
                Ok(None) => break,
                Err(source) => return Err(self.launch_error(source)),
            }
        }

        warn!(pid = child.id(), ?grace, "companion still running after grace period; killing it");
        child.kill().map_err(|source| self.launch_error(source))?;
        child.wait().map_err(|source| self.launch_error(source))?;
        Ok(())
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}
