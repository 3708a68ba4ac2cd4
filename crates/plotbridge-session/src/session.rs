//! Host side of a session: lifecycle, batches and duplex replies.

use std::collections::HashSet;
use std::fmt;
use std::io::ErrorKind as IoErrorKind;
use std::time::Duration;

use bytes::Bytes;
use plotbridge_data::{Container, ContainerMut, ContainerView, ReplyPolicy};
use plotbridge_frame::{
    Frame, FrameConfig, FrameError, FrameReader, FrameWriter, CONTROL, DATA, REPLY, SCRIPT,
};
use plotbridge_transport::{Endpoint, IpcStream};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::control::ControlMessage;
use crate::error::{BatchStage, Result, SessionError};
use crate::handshake::{handshake_server, EndpointRole};
use crate::launcher::{LaunchRequest, Launcher};
use crate::script::ScriptBuffer;

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Uninitialized,
    /// Binding the data (and reply) endpoints.
    Binding,
    /// Waiting for the companion to attach and complete the handshake.
    AwaitCompanion,
    Established,
    /// A batch is on the wire.
    SendBatch,
    Teardown,
    Closed,
}

/// How a batch argument is bound.
pub enum Binding<'a> {
    /// Sent and never returned.
    Send(&'a dyn Container),
    /// Sent, then overwritten in place by the companion's reply.
    SendBack(&'a mut dyn ContainerMut),
}

/// A named argument of one batch.
pub struct Arg<'a> {
    name: &'a str,
    binding: Binding<'a>,
}

impl<'a> Arg<'a> {
    /// Bind `value` for sending only.
    pub fn new<C: Container>(name: &'a str, value: &'a C) -> Self {
        Self {
            name,
            binding: Binding::Send(value),
        }
    }

    /// Bind `value` so the companion's reply is written back into it.
    pub fn send_back<C: ContainerMut>(name: &'a str, value: &'a mut C) -> Self {
        Self {
            name,
            binding: Binding::SendBack(value),
        }
    }

    pub fn from_binding(name: &'a str, binding: Binding<'a>) -> Self {
        Self { name, binding }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    pub fn policy(&self) -> ReplyPolicy {
        match self.binding {
            Binding::Send(_) => ReplyPolicy::DontSendBack,
            Binding::SendBack(_) => ReplyPolicy::SendBack,
        }
    }

    pub fn wants_reply(&self) -> bool {
        self.policy() == ReplyPolicy::SendBack
    }

    fn view(&self) -> plotbridge_data::Result<ContainerView<'_>> {
        match &self.binding {
            Binding::Send(value) => ContainerView::new(self.name, *value),
            Binding::SendBack(value) => ContainerView::new(self.name, &**value),
        }
    }
}

impl fmt::Debug for Arg<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arg")
            .field("name", &self.name)
            .field("policy", &self.policy())
            .finish()
    }
}

/// Summary of a batch that reached the companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// 1-based sequence number within the session.
    pub batch: u64,
    pub bindings: usize,
    pub payload_bytes: usize,
    pub script_bytes: usize,
    /// Buffers overwritten by replies.
    pub replies: usize,
}

struct Link {
    session_id: String,
    writer: FrameWriter<IpcStream>,
    reply: Option<FrameReader<IpcStream>>,
    companion_pid: Option<u32>,
    // Held so the socket files live exactly as long as the link.
    _endpoint: Endpoint,
    _reply_endpoint: Option<Endpoint>,
}

struct Attached {
    reader: FrameReader<IpcStream>,
    writer: FrameWriter<IpcStream>,
    peer_pid: Option<u32>,
}

/// A host-side session with one companion.
///
/// ```no_run
/// use plotbridge_session::{Arg, CompanionCommand, ProcessLauncher, Session, SessionConfig};
///
/// # fn main() -> plotbridge_session::Result<()> {
/// let launcher = ProcessLauncher::new(CompanionCommand::new("plot-companion"));
/// let mut session = Session::with_launcher(SessionConfig::default(), launcher);
/// session.establish()?;
///
/// let x: Vec<f64> = (0..100).map(|i| i as f64 / 10.0).collect();
/// let y: Vec<f64> = x.iter().map(|v| v.sin()).collect();
/// session.push("plt.plot(x, y)");
/// session.flush(&mut [Arg::new("x", &x), Arg::new("y", &y)])?;
/// session.teardown()?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    config: SessionConfig,
    launcher: Option<Box<dyn Launcher>>,
    state: SessionState,
    link: Option<Link>,
    script: ScriptBuffer,
    batches: u64,
    generation: u64,
    poisoned: bool,
}

impl Session {
    /// Session whose companion is started by someone else.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            launcher: None,
            state: SessionState::Uninitialized,
            link: None,
            script: ScriptBuffer::new(),
            batches: 0,
            generation: 0,
            poisoned: false,
        }
    }

    /// Session that launches its companion through `launcher`.
    pub fn with_launcher(config: SessionConfig, launcher: impl Launcher + 'static) -> Self {
        let mut session = Self::new(config);
        session.launcher = Some(Box::new(launcher));
        session
    }

    /// Bind the endpoints, launch the companion and wait for it to attach.
    ///
    /// A no-op on an established session.
    pub fn establish(&mut self) -> Result<()> {
        match self.state {
            SessionState::Established => return Ok(()),
            SessionState::Uninitialized | SessionState::Closed => {}
            other => {
                return Err(SessionError::Config(format!(
                    "cannot establish a session in state {other:?}"
                )));
            }
        }

        self.generation += 1;
        let session_id = format!("plotbridge-{}-{}", std::process::id(), self.generation);

        match self.attach(&session_id) {
            Ok(link) => {
                info!(
                    session_id = %session_id,
                    endpoint = %self.config.endpoint.display(),
                    duplex = link.reply.is_some(),
                    companion_pid = ?link.companion_pid,
                    "session established"
                );
                self.link = Some(link);
                self.state = SessionState::Established;
                self.poisoned = false;
                Ok(())
            }
            Err(err) => {
                if let Some(launcher) = self.launcher.as_mut() {
                    if let Err(reap_err) = launcher.reap(Duration::ZERO) {
                        warn!(error = %reap_err, "failed to stop companion after attach failure");
                    }
                }
                self.state = SessionState::Closed;
                Err(err)
            }
        }
    }

    fn attach(&mut self, session_id: &str) -> Result<Link> {
        self.state = SessionState::Binding;
        let endpoint = Endpoint::bind(&self.config.endpoint)?;
        let reply_endpoint = self
            .config
            .reply_endpoint
            .as_ref()
            .map(Endpoint::bind)
            .transpose()?;

        self.state = SessionState::AwaitCompanion;
        let launched_pid = match self.launcher.as_mut() {
            Some(launcher) => launcher.launch(&LaunchRequest {
                endpoint: endpoint.path(),
                reply_endpoint: reply_endpoint.as_ref().map(Endpoint::path),
                token: self.config.handshake.token.as_deref(),
            })?,
            None => None,
        };

        let data = accept_companion(&endpoint, EndpointRole::Data, session_id, &self.config)?;
        let reply = match &reply_endpoint {
            Some(endpoint) => Some(
                accept_companion(endpoint, EndpointRole::Reply, session_id, &self.config)?.reader,
            ),
            None => None,
        };

        if let (Some(expected), Some(actual)) = (launched_pid, data.peer_pid) {
            if expected != actual {
                warn!(
                    expected,
                    actual, "attached companion is not the launched process"
                );
            }
        }

        Ok(Link {
            session_id: session_id.to_string(),
            writer: data.writer,
            reply,
            companion_pid: data.peer_pid.or(launched_pid),
            _endpoint: endpoint,
            _reply_endpoint: reply_endpoint,
        })
    }

    /// Append one line to the pending script.
    pub fn push(&mut self, line: &str) {
        self.script.push(line);
    }

    /// Append a dedented multi-line block to the pending script.
    pub fn raw(&mut self, block: &str) {
        self.script.raw(block);
    }

    /// Script text the next flush will send.
    pub fn pending_script(&self) -> &str {
        self.script.as_str()
    }

    /// Append `block` and flush it together with `args`.
    pub fn raw_with(&mut self, block: &str, args: &mut [Arg<'_>]) -> Result<BatchReport> {
        self.script.raw(block);
        self.flush(args)
    }

    /// Send `args` and the pending script as one batch.
    ///
    /// Every argument is validated and adapted before the first byte is sent.
    /// The pending script is cleared whether or not the batch succeeds.
    pub fn flush(&mut self, args: &mut [Arg<'_>]) -> Result<BatchReport> {
        let script = self.script.take();

        if self.poisoned {
            return Err(SessionError::Protocol(
                "an earlier batch was left incomplete; tear down and re-establish the session"
                    .to_string(),
            ));
        }
        let duplex = self.config.is_duplex();
        let max_payload = self.config.max_payload_size;
        let Some(link) = self.link.as_mut() else {
            return Err(SessionError::NotEstablished);
        };

        validate_args(args, duplex)?;
        if script.len() > max_payload {
            return Err(SessionError::Config(format!(
                "script of {} bytes exceeds the {max_payload} byte payload limit",
                script.len()
            )));
        }

        let views = args
            .iter()
            .map(|arg| -> Result<_> { Ok((arg.view()?, duplex.then_some(arg.policy()))) })
            .collect::<Result<Vec<_>>>()?;
        for (view, _) in &views {
            if view.byte_len() > max_payload {
                return Err(SessionError::Config(format!(
                    "{:?} is {} bytes, over the {max_payload} byte payload limit",
                    view.name(),
                    view.byte_len()
                )));
            }
        }

        let batch = self.batches + 1;
        let payload_bytes: usize = views.iter().map(|(view, _)| view.byte_len()).sum();
        let pending_replies: Vec<(usize, usize)> = views
            .iter()
            .enumerate()
            .filter(|(_, (_, marker))| *marker == Some(ReplyPolicy::SendBack))
            .map(|(index, (view, _))| (index, view.byte_len()))
            .collect();

        self.state = SessionState::SendBatch;
        let mut sent = 0;
        let outcome = send_batch(&mut link.writer, &views, &script, &mut sent);
        drop(views);
        if let Err((stage, source)) = outcome {
            self.poisoned = true;
            self.state = SessionState::Established;
            warn!(
                session_id = %link.session_id,
                batch,
                %stage,
                sent,
                error = %source,
                "batch incomplete; session poisoned"
            );
            return Err(SessionError::BatchIncomplete {
                batch,
                stage,
                sent,
                source: Box::new(source.into()),
            });
        }

        let received = match link.reply.as_mut() {
            Some(reader) => {
                receive_replies(reader, args, &pending_replies, self.config.reply_timeout)
            }
            None => Ok(0),
        };
        let replies = match received {
            Ok(replies) => replies,
            Err((name, source)) => {
                self.poisoned = true;
                self.state = SessionState::Established;
                warn!(
                    session_id = %link.session_id,
                    batch,
                    reply = %name,
                    error = %source,
                    "reply failed; session poisoned"
                );
                return Err(SessionError::BatchIncomplete {
                    batch,
                    stage: BatchStage::Reply { name },
                    sent,
                    source: Box::new(source),
                });
            }
        };
        self.batches = batch;
        self.state = SessionState::Established;

        debug!(
            session_id = %link.session_id,
            batch,
            bindings = args.len(),
            payload_bytes,
            script_bytes = script.len(),
            replies,
            "batch finalized"
        );

        Ok(BatchReport {
            batch,
            bindings: args.len(),
            payload_bytes,
            script_bytes: script.len(),
            replies,
        })
    }

    /// Send `exit`, close the endpoints and stop the companion.
    ///
    /// Does nothing on a session that is not established, so `exit` is sent
    /// at most once per established session.
    pub fn teardown(&mut self) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };
        self.state = SessionState::Teardown;

        let mut outcome = Ok(());
        if let Err(err) = link.writer.send(CONTROL, ControlMessage::Exit.as_bytes()) {
            warn!(session_id = %link.session_id, error = %err, "failed to send exit");
            outcome = Err(err.into());
        }
        if let Err(err) = link.writer.get_ref().shutdown() {
            debug!(error = %err, "data endpoint already closed");
        }
        if let Some(reply) = &link.reply {
            if let Err(err) = reply.get_ref().shutdown() {
                debug!(error = %err, "reply endpoint already closed");
            }
        }
        let session_id = link.session_id.clone();
        drop(link);

        if let Some(launcher) = self.launcher.as_mut() {
            if let Err(err) = launcher.reap(self.config.reap_grace) {
                warn!(session_id = %session_id, error = %err, "failed to reap companion");
                if outcome.is_ok() {
                    outcome = Err(err);
                }
            }
        }

        self.state = SessionState::Closed;
        self.poisoned = false;
        info!(session_id = %session_id, batches = self.batches, "session closed");
        outcome
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.link.is_some()
    }

    pub fn is_duplex(&self) -> bool {
        self.config.is_duplex()
    }

    /// Identifier agreed with the companion during the handshake.
    pub fn session_id(&self) -> Option<&str> {
        self.link.as_ref().map(|link| link.session_id.as_str())
    }

    pub fn companion_pid(&self) -> Option<u32> {
        self.link.as_ref().and_then(|link| link.companion_pid)
    }

    /// Batches fully sent over the session's lifetime.
    pub fn batches_sent(&self) -> u64 {
        self.batches
    }

    /// Whether an incomplete batch has blocked further flushes.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.link.is_some() {
            if let Err(err) = self.teardown() {
                warn!(error = %err, "teardown on drop failed");
            }
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("session_id", &self.session_id())
            .field("endpoint", &self.config.endpoint)
            .field("duplex", &self.is_duplex())
            .field("batches", &self.batches)
            .field("poisoned", &self.poisoned)
            .finish()
    }
}

fn accept_companion(
    endpoint: &Endpoint,
    role: EndpointRole,
    session_id: &str,
    config: &SessionConfig,
) -> Result<Attached> {
    let stream = endpoint.accept_timeout(config.attach_timeout)?;
    let peer_pid = stream.peer_pid();
    let reader_stream = stream.try_clone()?;

    let frame_config = FrameConfig {
        max_payload_size: config.handshake.max_handshake_payload,
        read_timeout: Some(config.handshake.timeout),
        write_timeout: Some(config.handshake.timeout),
    };

    let mut reader = FrameReader::with_config_ipc(reader_stream, frame_config.clone())?;
    let mut writer = FrameWriter::with_config_ipc(stream, frame_config)?;

    handshake_server(&mut reader, &mut writer, role, session_id, &config.handshake)?;
    reader.set_max_payload_size(config.max_payload_size);
    writer.set_max_payload_size(config.max_payload_size);
    reader.set_read_timeout(config.reply_timeout)?;
    writer.set_write_timeout(None)?;

    Ok(Attached {
        reader,
        writer,
        peer_pid,
    })
}

fn validate_args(args: &[Arg<'_>], duplex: bool) -> Result<()> {
    let mut names = HashSet::with_capacity(args.len());
    for arg in args {
        if !names.insert(arg.name) {
            return Err(SessionError::Config(format!(
                "binding {:?} appears twice in one batch",
                arg.name
            )));
        }
        if arg.wants_reply() && !duplex {
            return Err(SessionError::Config(format!(
                "{:?} requests a reply but the session has no reply endpoint",
                arg.name
            )));
        }
    }
    Ok(())
}

fn send_batch(
    writer: &mut FrameWriter<IpcStream>,
    views: &[(ContainerView<'_>, Option<ReplyPolicy>)],
    script: &str,
    sent: &mut usize,
) -> std::result::Result<(), (BatchStage, FrameError)> {
    for (view, marker) in views {
        let header = view.header(*marker);
        writer.send(DATA, header.as_bytes()).map_err(|err| {
            (
                BatchStage::Header {
                    name: view.name().to_string(),
                },
                err,
            )
        })?;
        *sent += 1;
        debug!(header = %header, "header sent");

        writer.send(DATA, view.bytes()).map_err(|err| {
            (
                BatchStage::Payload {
                    name: view.name().to_string(),
                },
                err,
            )
        })?;
        *sent += 1;
        debug!(name = view.name(), len = view.byte_len(), "payload sent");
    }

    writer
        .send(SCRIPT, script.as_bytes())
        .map_err(|err| (BatchStage::Script, err))?;
    *sent += 1;
    debug!(len = script.len(), "script sent");

    writer
        .send(CONTROL, ControlMessage::Finalize.as_bytes())
        .map_err(|err| (BatchStage::Finalize, err))?;
    *sent += 1;
    Ok(())
}

/// Receive every requested reply, then write them back together.
///
/// A receive failure leaves every buffer untouched. The error names the
/// reply that failed.
fn receive_replies(
    reader: &mut FrameReader<IpcStream>,
    args: &mut [Arg<'_>],
    pending: &[(usize, usize)],
    timeout: Option<Duration>,
) -> std::result::Result<usize, (String, SessionError)> {
    let mut received = Vec::with_capacity(pending.len());
    for &(index, expected) in pending {
        let name = args[index].name;
        let payload =
            receive_reply(reader, name, expected, timeout).map_err(|err| (name.to_string(), err))?;
        received.push((index, payload));
    }

    for (index, payload) in &received {
        let arg = &mut args[*index];
        let name = arg.name;
        if let Binding::SendBack(target) = &mut arg.binding {
            target
                .write_back(payload)
                .map_err(|err| (name.to_string(), SessionError::from(err)))?;
            debug!(name, len = payload.len(), "reply written back");
        }
    }
    Ok(received.len())
}

fn receive_reply(
    reader: &mut FrameReader<IpcStream>,
    name: &str,
    expected: usize,
    timeout: Option<Duration>,
) -> Result<Bytes> {
    let frame = read_reply_frame(reader, timeout)?;
    match frame.text() {
        Some(echoed) if echoed == name => {}
        Some(echoed) => {
            return Err(SessionError::Protocol(format!(
                "expected a reply for {name:?}, companion answered {echoed:?}"
            )));
        }
        None => {
            return Err(SessionError::Protocol(format!(
                "reply name for {name:?} is not UTF-8"
            )));
        }
    }

    let frame = read_reply_frame(reader, timeout)?;
    if frame.payload.len() != expected {
        return Err(plotbridge_data::DataError::ReplyLengthMismatch {
            expected,
            found: frame.payload.len(),
        }
        .into());
    }
    Ok(frame.payload)
}

fn read_reply_frame(
    reader: &mut FrameReader<IpcStream>,
    timeout: Option<Duration>,
) -> Result<Frame> {
    let frame = reader.read_frame().map_err(|err| match err {
        FrameError::ConnectionClosed => {
            SessionError::Disconnected("companion closed the reply endpoint".to_string())
        }
        FrameError::Io(io)
            if matches!(io.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut) =>
        {
            SessionError::Timeout(timeout.unwrap_or_default())
        }
        other => other.into(),
    })?;

    if frame.channel != REPLY {
        return Err(SessionError::Protocol(format!(
            "unexpected channel {} on the reply endpoint",
            frame.channel
        )));
    }
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc, Mutex};
    use std::thread::{self, JoinHandle};

    use super::*;
    use crate::companion::{CompanionClient, CompanionEvent};
    use crate::error::ErrorKind;
    use crate::handshake::{handshake_client, HandshakeConfig};

    #[derive(Debug, Clone)]
    struct Attach {
        launch: usize,
        endpoint: PathBuf,
        reply_endpoint: Option<PathBuf>,
        token: Option<String>,
    }

    impl Attach {
        fn connect(&self) -> CompanionClient {
            let config = HandshakeConfig {
                token: self.token.clone(),
                ..HandshakeConfig::default()
            };
            CompanionClient::connect(&self.endpoint, self.reply_endpoint.as_deref(), &config)
                .expect("companion should attach")
        }
    }

    type CompanionFn = Arc<dyn Fn(Attach) + Send + Sync>;

    /// Runs the companion in a thread of the test process.
    struct ThreadLauncher {
        companion: CompanionFn,
        launches: Arc<AtomicUsize>,
        panicked: Arc<AtomicBool>,
        handle: Option<JoinHandle<()>>,
    }

    impl ThreadLauncher {
        fn new(companion: CompanionFn) -> Self {
            Self {
                companion,
                launches: Arc::new(AtomicUsize::new(0)),
                panicked: Arc::new(AtomicBool::new(false)),
                handle: None,
            }
        }
    }

    impl Launcher for ThreadLauncher {
        fn launch(&mut self, request: &LaunchRequest<'_>) -> Result<Option<u32>> {
            let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let attach = Attach {
                launch,
                endpoint: request.endpoint.to_path_buf(),
                reply_endpoint: request.reply_endpoint.map(Path::to_path_buf),
                token: request.token.map(str::to_string),
            };
            let companion = Arc::clone(&self.companion);
            self.handle = Some(thread::spawn(move || companion(attach)));
            Ok(None)
        }

        fn reap(&mut self, _grace: Duration) -> Result<()> {
            if let Some(handle) = self.handle.take() {
                if handle.join().is_err() {
                    self.panicked.store(true, Ordering::SeqCst);
                }
            }
            Ok(())
        }
    }

    struct Fixture {
        dir: PathBuf,
        launches: Arc<AtomicUsize>,
        panicked: Arc<AtomicBool>,
    }

    impl Fixture {
        fn endpoint(&self) -> PathBuf {
            self.dir.join("bridge.sock")
        }

        fn launches(&self) -> usize {
            self.launches.load(Ordering::SeqCst)
        }

        fn assert_companion_ok(&self) {
            assert!(
                !self.panicked.load(Ordering::SeqCst),
                "companion thread panicked"
            );
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "pbs-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ));
        std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
        dir
    }

    fn session(tag: &str, duplex: bool, companion: CompanionFn) -> (Session, Fixture) {
        let dir = temp_dir(tag);
        let mut config = SessionConfig::default()
            .with_endpoint(dir.join("bridge.sock"))
            .with_attach_timeout(Duration::from_secs(5))
            .with_reply_timeout(Some(Duration::from_secs(5)));
        if duplex {
            config = config.with_duplex();
        }
        let launcher = ThreadLauncher::new(companion);
        let fixture = Fixture {
            dir,
            launches: Arc::clone(&launcher.launches),
            panicked: Arc::clone(&launcher.panicked),
        };
        (Session::with_launcher(config, launcher), fixture)
    }

    /// Records every event; echoes reply requests unchanged.
    fn recording(log: Arc<Mutex<Vec<CompanionEvent>>>) -> CompanionFn {
        Arc::new(move |attach: Attach| {
            let mut client = attach.connect();
            while let Ok(event) = client.next_event() {
                let exit = event == CompanionEvent::Exit;
                if let CompanionEvent::Batch(batch) = &event {
                    for binding in batch.reply_requests() {
                        client
                            .send_reply(binding.name(), &binding.payload)
                            .expect("reply should send");
                    }
                }
                log.lock().unwrap().push(event);
                if exit {
                    break;
                }
            }
        })
    }

    /// Records raw frames after the handshake until the host hangs up.
    fn raw_recorder(frames: Arc<Mutex<Vec<(u16, Vec<u8>)>>>) -> CompanionFn {
        Arc::new(move |attach: Attach| {
            let stream = Endpoint::connect(&attach.endpoint).unwrap();
            let mut reader = FrameReader::new(stream.try_clone().unwrap());
            let mut writer = FrameWriter::new(stream);
            handshake_client(
                &mut reader,
                &mut writer,
                EndpointRole::Data,
                &HandshakeConfig::default(),
            )
            .unwrap();
            while let Ok(frame) = reader.read_frame() {
                frames
                    .lock()
                    .unwrap()
                    .push((frame.channel, frame.payload.to_vec()));
            }
        })
    }

    /// Answers every reply request with `reply(name, payload)`.
    fn replying(reply: fn(&str, &[u8]) -> (String, Vec<u8>)) -> CompanionFn {
        Arc::new(move |attach: Attach| {
            let mut client = attach.connect();
            while let Ok(CompanionEvent::Batch(batch)) = client.next_event() {
                for binding in batch.reply_requests() {
                    let (name, bytes) = reply(binding.name(), &binding.payload);
                    if client.send_reply(&name, &bytes).is_err() {
                        return;
                    }
                }
            }
        })
    }

    fn doubled(name: &str, payload: &[u8]) -> (String, Vec<u8>) {
        let bytes = payload
            .chunks_exact(8)
            .map(|chunk| f64::from_ne_bytes(chunk.try_into().unwrap()) * 2.0)
            .flat_map(f64::to_ne_bytes)
            .collect();
        (name.to_string(), bytes)
    }

    fn frame(channel: u16, payload: &[u8]) -> (u16, Vec<u8>) {
        (channel, payload.to_vec())
    }

    #[test]
    fn establish_is_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("idem", false, recording(Arc::clone(&log)));

        assert_eq!(session.state(), SessionState::Uninitialized);
        session.establish().unwrap();
        session.establish().unwrap();
        assert_eq!(session.state(), SessionState::Established);
        assert_eq!(fixture.launches(), 1);
        assert!(session.session_id().unwrap().starts_with("plotbridge-"));

        session.teardown().unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        fixture.assert_companion_ok();
        assert_eq!(*log.lock().unwrap(), vec![CompanionEvent::Exit]);
    }

    #[test]
    fn flush_sends_bindings_script_then_finalize() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("order", false, raw_recorder(Arc::clone(&frames)));
        session.establish().unwrap();

        let a = vec![1i32, 2];
        let b = 2.5f32;
        let c = vec![vec![1u8, 2], vec![3, 4]];
        session.push("plot(a, b)");
        session.push("show(c)");
        let report = session
            .flush(&mut [Arg::new("a", &a), Arg::new("b", &b), Arg::new("c", &c)])
            .unwrap();
        assert_eq!(report.batch, 1);
        assert_eq!(report.bindings, 3);
        assert_eq!(report.payload_bytes, 8 + 4 + 4);
        assert_eq!(report.replies, 0);
        assert_eq!(session.pending_script(), "");

        session.teardown().unwrap();
        fixture.assert_companion_ok();

        let expected = vec![
            frame(DATA, b"data|a|i|2|(2,)"),
            (DATA, [1i32, 2].iter().flat_map(|v| v.to_ne_bytes()).collect()),
            frame(DATA, b"data|b|f|1|()"),
            (DATA, 2.5f32.to_ne_bytes().to_vec()),
            frame(DATA, b"data|c|B|4|(2,2,)"),
            frame(DATA, &[1, 2, 3, 4]),
            frame(SCRIPT, b"plot(a, b)\nshow(c)\n"),
            frame(CONTROL, b"finalize"),
            frame(CONTROL, b"exit"),
        ];
        assert_eq!(*frames.lock().unwrap(), expected);
    }

    #[test]
    fn script_is_cleared_even_when_flush_fails() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("clear", false, recording(Arc::clone(&log)));
        session.establish().unwrap();

        let ragged = vec![vec![1i32, 2], vec![3]];
        session.push("bad()");
        let err = session.flush(&mut [Arg::new("m", &ragged)]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
        assert!(!session.is_poisoned());
        assert_eq!(session.pending_script(), "");

        session.push("good()");
        session.flush(&mut []).unwrap();
        session.teardown().unwrap();
        fixture.assert_companion_ok();

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        let CompanionEvent::Batch(batch) = &log[0] else {
            panic!("expected a batch");
        };
        assert_eq!(batch.script, "good()\n");
        assert!(batch.bindings.is_empty());
    }

    #[test]
    fn duplex_reply_overwrites_in_place() {
        let dir = temp_dir("duplex");
        let config = SessionConfig::default()
            .with_endpoint(dir.join("bridge.sock"))
            .with_duplex()
            .with_token("tok-9f3e")
            .with_reply_timeout(Some(Duration::from_secs(5)));
        let launcher = ThreadLauncher::new(replying(doubled));
        let panicked = Arc::clone(&launcher.panicked);
        let mut session = Session::with_launcher(config, launcher);
        session.establish().unwrap();
        assert!(session.is_duplex());

        let mut values = vec![1.0f64, 2.5];
        let label = String::from("scaled");
        let report = session
            .raw_with(
                "
                y = x * 2
                ",
                &mut [Arg::send_back("x", &mut values), Arg::new("label", &label)],
            )
            .unwrap();
        assert_eq!(report.replies, 1);
        assert_eq!(values, vec![2.0, 5.0]);

        session.teardown().unwrap();
        assert!(!panicked.load(Ordering::SeqCst));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn duplex_headers_carry_explicit_markers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("markers", true, recording(Arc::clone(&log)));
        session.establish().unwrap();

        let mut returned = [7u16, 8, 9];
        let kept = 3i64;
        session
            .flush(&mut [Arg::new("kept", &kept), Arg::send_back("returned", &mut returned)])
            .unwrap();
        assert_eq!(returned, [7, 8, 9]);
        session.teardown().unwrap();
        fixture.assert_companion_ok();

        let log = log.lock().unwrap();
        let CompanionEvent::Batch(batch) = &log[0] else {
            panic!("expected a batch");
        };
        assert_eq!(
            batch.get("kept").unwrap().header.reply,
            Some(ReplyPolicy::DontSendBack)
        );
        assert_eq!(
            batch.get("returned").unwrap().header.reply,
            Some(ReplyPolicy::SendBack)
        );
        let names: Vec<&str> = batch.reply_requests().map(|b| b.name()).collect();
        assert_eq!(names, ["returned"]);
    }

    #[test]
    fn reply_length_mismatch_is_a_protocol_violation() {
        fn truncated(name: &str, payload: &[u8]) -> (String, Vec<u8>) {
            (name.to_string(), payload[..payload.len() - 1].to_vec())
        }
        let (mut session, fixture) = session("shortreply", true, replying(truncated));
        session.establish().unwrap();

        let mut values = vec![1.0f64, 2.0];
        let err = session
            .flush(&mut [Arg::send_back("x", &mut values)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert!(session.is_poisoned());
        assert_eq!(values, vec![1.0, 2.0]);

        session.teardown().unwrap();
        fixture.assert_companion_ok();
    }

    #[test]
    fn reply_for_the_wrong_name_is_a_protocol_violation() {
        fn misnamed(_name: &str, payload: &[u8]) -> (String, Vec<u8>) {
            ("other".to_string(), payload.to_vec())
        }
        let (mut session, fixture) = session("wrongname", true, replying(misnamed));
        session.establish().unwrap();

        let mut value = 4i32;
        let err = session
            .flush(&mut [Arg::send_back("x", &mut value)])
            .unwrap_err();
        let SessionError::BatchIncomplete { stage, source, .. } = &err else {
            panic!("expected an incomplete batch, got {err:?}");
        };
        assert_eq!(stage, &BatchStage::Reply { name: "x".into() });
        assert!(matches!(**source, SessionError::Protocol(_)));
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(value, 4);

        session.teardown().unwrap();
        fixture.assert_companion_ok();
    }

    #[test]
    fn companion_hangup_between_replies_leaves_buffers_untouched() {
        let first_reply_only: CompanionFn = Arc::new(|attach: Attach| {
            let mut client = attach.connect();
            if let Ok(CompanionEvent::Batch(batch)) = client.next_event() {
                let binding = batch.reply_requests().next().expect("a reply request");
                let (name, bytes) = doubled(binding.name(), &binding.payload);
                client.send_reply(&name, &bytes).expect("first reply should send");
            }
        });
        let (mut session, fixture) = session("hangup", true, first_reply_only);
        session.establish().unwrap();

        let mut a = vec![1.0f64, 2.0];
        let mut b = vec![10.0f64];
        let err = session
            .flush(&mut [Arg::send_back("a", &mut a), Arg::send_back("b", &mut b)])
            .unwrap_err();

        let SessionError::BatchIncomplete {
            batch,
            stage,
            sent,
            source,
        } = &err
        else {
            panic!("expected an incomplete batch, got {err:?}");
        };
        assert_eq!(*batch, 1);
        assert_eq!(stage, &BatchStage::Reply { name: "b".into() });
        assert_eq!(*sent, 6);
        assert!(matches!(**source, SessionError::Disconnected(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);

        assert_eq!(a, vec![1.0, 2.0]);
        assert_eq!(b, vec![10.0]);
        assert_eq!(session.batches_sent(), 0);
        assert!(session.is_poisoned());

        let _ = session.teardown();
        fixture.assert_companion_ok();
    }

    #[test]
    fn silent_companion_trips_the_reply_timeout() {
        let dir = temp_dir("replytimeout");
        let config = SessionConfig::default()
            .with_endpoint(dir.join("bridge.sock"))
            .with_duplex()
            .with_reply_timeout(Some(Duration::from_millis(100)));
        let silent: CompanionFn = Arc::new(|attach: Attach| {
            let mut client = attach.connect();
            while let Ok(CompanionEvent::Batch(_)) = client.next_event() {}
        });
        let launcher = ThreadLauncher::new(silent);
        let panicked = Arc::clone(&launcher.panicked);
        let mut session = Session::with_launcher(config, launcher);
        session.establish().unwrap();

        let mut values = [3u32, 4];
        let err = session
            .flush(&mut [Arg::send_back("x", &mut values)])
            .unwrap_err();
        let SessionError::BatchIncomplete { stage, source, .. } = &err else {
            panic!("expected an incomplete batch, got {err:?}");
        };
        assert_eq!(stage, &BatchStage::Reply { name: "x".into() });
        assert!(matches!(**source, SessionError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(session.is_poisoned());
        assert_eq!(values, [3, 4]);

        session.teardown().unwrap();
        assert!(!panicked.load(Ordering::SeqCst));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn send_back_in_simplex_session_is_rejected_before_sending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("simplex", false, recording(Arc::clone(&log)));
        session.establish().unwrap();

        let mut values = vec![1.0f32];
        let err = session
            .flush(&mut [Arg::send_back("x", &mut values)])
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(!session.is_poisoned());

        session.flush(&mut [Arg::new("x", &values)]).unwrap();
        assert_eq!(session.batches_sent(), 1);
        session.teardown().unwrap();
        fixture.assert_companion_ok();

        let log = log.lock().unwrap();
        let CompanionEvent::Batch(batch) = &log[0] else {
            panic!("expected a batch");
        };
        assert_eq!(batch.get("x").unwrap().header.reply, None);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("dupe", false, recording(Arc::clone(&log)));
        session.establish().unwrap();

        let a = 1u8;
        let b = 2u8;
        let err = session
            .flush(&mut [Arg::new("v", &a), Arg::new("v", &b)])
            .unwrap_err();
        assert!(matches!(err, SessionError::Config(_)));

        session.teardown().unwrap();
        fixture.assert_companion_ok();
        assert_eq!(*log.lock().unwrap(), vec![CompanionEvent::Exit]);
    }

    #[test]
    fn invalid_name_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("badname", false, recording(log));
        session.establish().unwrap();

        let value = 1u8;
        let err = session
            .flush(&mut [Arg::new("a|b", &value)])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        session.teardown().unwrap();
        fixture.assert_companion_ok();
    }

    #[test]
    fn flush_requires_an_established_session() {
        let dir = temp_dir("noest");
        let mut session = Session::new(SessionConfig::default().with_endpoint(dir.join("x.sock")));
        session.push("plot()");

        let value = 1.0f64;
        let err = session.flush(&mut [Arg::new("v", &value)]).unwrap_err();
        assert!(matches!(err, SessionError::NotEstablished));
        assert_eq!(session.pending_script(), "");
        session.teardown().unwrap();
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn incomplete_batch_poisons_until_reestablished() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (hung_up_tx, hung_up_rx) = mpsc::channel();
        let hung_up_tx = Arc::new(Mutex::new(hung_up_tx));
        let record = recording(Arc::clone(&log));
        let companion: CompanionFn = Arc::new(move |attach: Attach| {
            if attach.launch == 1 {
                drop(attach.connect());
                hung_up_tx.lock().unwrap().send(()).unwrap();
            } else {
                record(attach);
            }
        });
        let (mut session, fixture) = session("poison", false, companion);

        session.establish().unwrap();
        hung_up_rx.recv().unwrap();

        let values = vec![0u8; 64];
        let err = session.flush(&mut [Arg::new("v", &values)]).unwrap_err();
        let SessionError::BatchIncomplete { batch, sent, .. } = &err else {
            panic!("expected an incomplete batch, got {err:?}");
        };
        assert_eq!(*batch, 1);
        assert_eq!(*sent, 0);
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert!(session.is_poisoned());
        assert_eq!(session.batches_sent(), 0);

        let err = session.flush(&mut []).unwrap_err();
        assert!(matches!(err, SessionError::Protocol(_)));

        let _ = session.teardown();
        assert!(!session.is_poisoned());
        session.establish().unwrap();
        assert_eq!(fixture.launches(), 2);

        session.push("recovered()");
        let report = session.flush(&mut [Arg::new("v", &values)]).unwrap();
        assert_eq!(report.batch, 1);
        session.teardown().unwrap();
        fixture.assert_companion_ok();

        let log = log.lock().unwrap();
        let CompanionEvent::Batch(batch) = &log[0] else {
            panic!("expected a batch");
        };
        assert_eq!(batch.script, "recovered()\n");
    }

    #[test]
    fn exit_is_sent_exactly_once() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("exit", false, raw_recorder(Arc::clone(&frames)));
        session.establish().unwrap();

        session.teardown().unwrap();
        session.teardown().unwrap();
        drop(session);
        fixture.assert_companion_ok();

        let exits = frames
            .lock()
            .unwrap()
            .iter()
            .filter(|(channel, payload)| *channel == CONTROL && payload == b"exit")
            .count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn drop_tears_down() {
        let frames = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("drop", false, raw_recorder(Arc::clone(&frames)));
        session.establish().unwrap();
        assert!(fixture.endpoint().exists());

        drop(session);
        fixture.assert_companion_ok();
        assert!(!fixture.endpoint().exists());
        assert_eq!(*frames.lock().unwrap(), vec![frame(CONTROL, b"exit")]);
    }

    #[test]
    fn attach_timeout_without_companion() {
        let dir = temp_dir("timeout");
        let endpoint = dir.join("bridge.sock");
        let mut session = Session::new(
            SessionConfig::default()
                .with_endpoint(&endpoint)
                .with_attach_timeout(Duration::from_millis(50)),
        );

        let err = session.establish().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.is_established());
        assert!(!endpoint.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn raw_with_dedents_the_block() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (mut session, fixture) = session("dedent", false, recording(Arc::clone(&log)));
        session.establish().unwrap();

        session.push("import numpy");
        session
            .raw_with(
                "
                for row in m:
                    plot(row)
                ",
                &mut [],
            )
            .unwrap();
        session.teardown().unwrap();
        fixture.assert_companion_ok();

        let log = log.lock().unwrap();
        let CompanionEvent::Batch(batch) = &log[0] else {
            panic!("expected a batch");
        };
        assert_eq!(batch.script, "import numpy\nfor row in m:\n    plot(row)\n");
    }
}
