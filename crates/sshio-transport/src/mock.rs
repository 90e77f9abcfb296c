//! In-memory transport for tests
//!
//! [`MockTransport`] plays the remote server: it holds accounts, a remote
//! file table and scripted failures, and records every request a session
//! or channel makes so tests can assert on the exact conversation.

use crate::error::codes;
use crate::transport::{PtySize, ScpTimes, SftpSession, SshChannel, SshConfig, SshSession, Transport};
use crate::TransportError;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A request observed by the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRequest {
    /// Public key authentication attempt
    AuthPubkey {
        /// Username
        username: String,
        /// Public key file
        pubkey: PathBuf,
    },
    /// Password authentication attempt
    AuthPassword {
        /// Username
        username: String,
    },
    /// Environment variable on a channel
    Setenv {
        /// Variable name
        name: String,
        /// Variable value
        value: String,
    },
    /// Pseudo-terminal request
    Pty {
        /// Terminal type
        term: String,
        /// Requested size
        size: PtySize,
    },
    /// Interactive shell request
    Shell,
    /// Command execution request
    Exec(String),
    /// Direct TCP/IP forwarding request
    DirectTcpip {
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },
    /// SCP download
    ScpRecv(String),
    /// SCP upload
    ScpSend {
        /// Remote path
        path: String,
        /// Permission bits
        mode: i32,
        /// Announced size
        size: u64,
        /// Announced timestamps
        times: Option<ScpTimes>,
    },
    /// SFTP subsystem start
    Sftp,
}

/// Points where the mock server can be told to refuse
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailPoint {
    /// TCP connect / handshake
    Connect,
    /// Opening a session channel
    ChannelOpen,
    /// Pseudo-terminal request
    Pty,
    /// Shell request
    Shell,
    /// Exec request
    Exec,
    /// Direct TCP/IP channel
    Tunnel,
    /// SCP download
    ScpRecv,
    /// SCP upload
    ScpSend,
    /// SFTP subsystem
    Sftp,
}

/// One scripted result for a channel read or write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    /// Perform the call normally
    Pass,
    /// Report "would block"
    WouldBlock,
    /// Fail with the given transport code
    Fail(i32),
}

/// A file on the mock server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    /// File bytes
    pub content: Vec<u8>,
    /// Permission bits
    pub mode: i32,
    /// Timestamps announced on upload
    pub times: Option<ScpTimes>,
    /// Size announced on download when it differs from the content
    pub declared_size: Option<u64>,
}

/// What a mock channel was opened for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Session channel (shell / exec)
    Session,
    /// Direct TCP/IP channel
    DirectTcpip,
    /// SCP download of a path
    ScpRecv(String),
    /// SCP upload to a path
    ScpSend(String),
}

#[derive(Debug, Default)]
struct Account {
    password: Option<String>,
    keys: Vec<(PathBuf, PathBuf)>,
}

#[derive(Debug, Default)]
struct Counters {
    connects: usize,
    channels_opened: usize,
    channels_dropped: usize,
    sessions_dropped: usize,
    sftp_dropped: usize,
}

type ChannelHook = Arc<dyn Fn(&MockChannelHandle) + Send + Sync>;

#[derive(Default)]
struct MockState {
    accounts: HashMap<String, Account>,
    files: BTreeMap<String, MockFile>,
    failures: BTreeSet<FailPoint>,
    refused_env: BTreeSet<String>,
    requests: Vec<MockRequest>,
    counters: Counters,
    timeouts: Vec<u32>,
    configs: Vec<SshConfig>,
    channels: Vec<MockChannelHandle>,
    hooks: Vec<ChannelHook>,
}

/// In-memory SSH server and transport
#[derive(Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MockTransport")
            .field("accounts", &state.accounts.len())
            .field("files", &state.files.len())
            .field("requests", &state.requests.len())
            .finish()
    }
}

impl MockTransport {
    /// Empty server: no accounts, no files
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept `password` for `username`
    pub fn with_account(self, username: &str, password: &str) -> Self {
        self.state
            .lock()
            .accounts
            .entry(username.to_string())
            .or_default()
            .password = Some(password.to_string());
        self
    }

    /// Accept the key pair at the given paths for `username`
    pub fn with_key(self, username: &str, pubkey: impl Into<PathBuf>, privkey: impl Into<PathBuf>) -> Self {
        self.state
            .lock()
            .accounts
            .entry(username.to_string())
            .or_default()
            .keys
            .push((pubkey.into(), privkey.into()));
        self
    }

    /// Place a file on the server
    pub fn with_file(self, path: &str, content: impl Into<Vec<u8>>, mode: i32) -> Self {
        self.state.lock().files.insert(
            path.to_string(),
            MockFile { content: content.into(), mode, times: None, declared_size: None },
        );
        self
    }

    /// Announce `size` bytes when `path` is downloaded, whatever its content
    pub fn with_declared_size(self, path: &str, size: u64) -> Self {
        if let Some(file) = self.state.lock().files.get_mut(path) {
            file.declared_size = Some(size);
        }
        self
    }

    /// Run `hook` on every channel as soon as it is opened
    pub fn with_channel_hook(self, hook: impl Fn(&MockChannelHandle) + Send + Sync + 'static) -> Self {
        self.state.lock().hooks.push(Arc::new(hook));
        self
    }

    /// Refuse requests at `point`
    pub fn with_failure(self, point: FailPoint) -> Self {
        self.state.lock().failures.insert(point);
        self
    }

    /// Refuse `setenv` for `name`
    pub fn with_refused_env(self, name: &str) -> Self {
        self.state.lock().refused_env.insert(name.to_string());
        self
    }

    /// Every request seen so far, in order
    pub fn requests(&self) -> Vec<MockRequest> {
        self.state.lock().requests.clone()
    }

    /// Requests seen after authentication, excluding auth attempts
    pub fn channel_requests(&self) -> Vec<MockRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !matches!(r, MockRequest::AuthPubkey { .. } | MockRequest::AuthPassword { .. }))
            .collect()
    }

    /// A file currently on the server
    pub fn file(&self, path: &str) -> Option<MockFile> {
        self.state.lock().files.get(path).cloned()
    }

    /// Number of completed connects
    pub fn connects(&self) -> usize {
        self.state.lock().counters.connects
    }

    /// Number of channels opened
    pub fn channels_opened(&self) -> usize {
        self.state.lock().counters.channels_opened
    }

    /// Number of channels freed
    pub fn channels_dropped(&self) -> usize {
        self.state.lock().counters.channels_dropped
    }

    /// Number of sessions freed
    pub fn sessions_dropped(&self) -> usize {
        self.state.lock().counters.sessions_dropped
    }

    /// Number of SFTP handles freed
    pub fn sftp_dropped(&self) -> usize {
        self.state.lock().counters.sftp_dropped
    }

    /// Session timeouts set, in order
    pub fn timeouts(&self) -> Vec<u32> {
        self.state.lock().timeouts.clone()
    }

    /// Configurations passed to `connect`, in order
    pub fn configs(&self) -> Vec<SshConfig> {
        self.state.lock().configs.clone()
    }

    /// Most recently opened channel
    pub fn last_channel(&self) -> Option<MockChannelHandle> {
        self.state.lock().channels.last().cloned()
    }

    /// Channel by opening order
    pub fn channel(&self, index: usize) -> Option<MockChannelHandle> {
        self.state.lock().channels.get(index).cloned()
    }

    fn fails(&self, point: FailPoint) -> bool {
        self.state.lock().failures.contains(&point)
    }

    fn record(&self, request: MockRequest) {
        self.state.lock().requests.push(request);
    }
}

impl Transport for MockTransport {
    fn connect(&self, config: &SshConfig) -> Result<Box<dyn SshSession>, TransportError> {
        if self.fails(FailPoint::Connect) {
            return Err(TransportError::Connection(format!(
                "Unable to connect to {}:{}",
                config.host, config.port
            )));
        }
        let mut state = self.state.lock();
        state.counters.connects += 1;
        state.configs.push(config.clone());
        drop(state);

        Ok(Box::new(MockSession {
            server: self.clone(),
            authenticated: AtomicBool::new(false),
        }))
    }
}

struct MockSession {
    server: MockTransport,
    authenticated: AtomicBool,
}

impl MockSession {
    fn open(&self, kind: ChannelKind, fail: FailPoint) -> Result<MockChannel, TransportError> {
        if !self.authenticated() {
            return Err(TransportError::Channel("session is not authenticated".to_string()));
        }
        if self.server.fails(fail) || self.server.fails(FailPoint::ChannelOpen) {
            return Err(TransportError::Channel("channel open refused".to_string()));
        }
        let handle = MockChannelHandle(Arc::new(Mutex::new(ChannelIo::new(kind))));
        let mut state = self.server.state.lock();
        state.counters.channels_opened += 1;
        state.channels.push(handle.clone());
        let hooks = state.hooks.clone();
        drop(state);

        for hook in hooks {
            hook(&handle);
        }

        Ok(MockChannel { io: handle, server: self.server.clone() })
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.server.state.lock().counters.sessions_dropped += 1;
    }
}

impl SshSession for MockSession {
    fn userauth_pubkey_file(
        &self,
        username: &str,
        pubkey: &Path,
        privkey: &Path,
        _passphrase: Option<&str>,
    ) -> Result<(), TransportError> {
        self.server.record(MockRequest::AuthPubkey {
            username: username.to_string(),
            pubkey: pubkey.to_path_buf(),
        });
        let state = self.server.state.lock();
        let accepted = state
            .accounts
            .get(username)
            .map(|a| a.keys.iter().any(|(p, k)| p == pubkey && k == privkey))
            .unwrap_or(false);
        drop(state);

        if accepted {
            self.authenticated.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(TransportError::Authentication(format!("public key rejected for {}", username)))
        }
    }

    fn userauth_password(&self, username: &str, password: &str) -> Result<(), TransportError> {
        self.server.record(MockRequest::AuthPassword { username: username.to_string() });
        let state = self.server.state.lock();
        let accepted = state
            .accounts
            .get(username)
            .and_then(|a| a.password.as_deref())
            .map(|p| p == password)
            .unwrap_or(false);
        drop(state);

        if accepted {
            self.authenticated.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(TransportError::Authentication(format!("password rejected for {}", username)))
        }
    }

    fn authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    fn set_blocking(&self, _blocking: bool) {}

    fn set_timeout(&self, timeout_ms: u32) {
        self.server.state.lock().timeouts.push(timeout_ms);
    }

    fn channel_session(&self) -> Result<Box<dyn SshChannel>, TransportError> {
        Ok(Box::new(self.open(ChannelKind::Session, FailPoint::ChannelOpen)?))
    }

    fn channel_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn SshChannel>, TransportError> {
        self.server.record(MockRequest::DirectTcpip { host: host.to_string(), port });
        Ok(Box::new(self.open(ChannelKind::DirectTcpip, FailPoint::Tunnel)?))
    }

    fn scp_recv(&self, path: &str) -> Result<(Box<dyn SshChannel>, u64), TransportError> {
        self.server.record(MockRequest::ScpRecv(path.to_string()));
        let file = self
            .server
            .file(path)
            .ok_or_else(|| TransportError::from_code(-28, format!("{}: No such file or directory", path)))?;
        let channel = self.open(ChannelKind::ScpRecv(path.to_string()), FailPoint::ScpRecv)?;
        {
            let mut io = channel.io.0.lock();
            let inbound = io.inbound.entry(0).or_default();
            inbound.extend(file.content.iter().copied());
            // the protocol leaves a trailing status byte after the content
            inbound.push_back(0);
            io.remote_eof = true;
        }
        let size = file.declared_size.unwrap_or(file.content.len() as u64);
        Ok((Box::new(channel), size))
    }

    fn scp_send(
        &self,
        path: &str,
        mode: i32,
        size: u64,
        times: Option<ScpTimes>,
    ) -> Result<Box<dyn SshChannel>, TransportError> {
        self.server.record(MockRequest::ScpSend { path: path.to_string(), mode, size, times });
        let channel = self.open(ChannelKind::ScpSend(path.to_string()), FailPoint::ScpSend)?;
        {
            let mut io = channel.io.0.lock();
            io.upload = Some((mode, times));
        }
        Ok(Box::new(channel))
    }

    fn sftp(&self) -> Result<Box<dyn SftpSession>, TransportError> {
        self.server.record(MockRequest::Sftp);
        if !self.authenticated() || self.server.fails(FailPoint::Sftp) {
            return Err(TransportError::Channel("Unable to startup SFTP subsystem".to_string()));
        }
        Ok(Box::new(MockSftp { server: self.server.clone() }))
    }
}

struct MockSftp {
    server: MockTransport,
}

impl Drop for MockSftp {
    fn drop(&mut self) {
        self.server.state.lock().counters.sftp_dropped += 1;
    }
}

impl SftpSession for MockSftp {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Inspectable I/O state of one mock channel
#[derive(Debug)]
struct ChannelIo {
    kind: ChannelKind,
    inbound: BTreeMap<i32, VecDeque<u8>>,
    outbound: BTreeMap<i32, Vec<u8>>,
    read_script: VecDeque<IoStep>,
    write_script: VecDeque<IoStep>,
    max_write: Option<usize>,
    flushed: Vec<i32>,
    remote_eof: bool,
    exit_status: i32,
    blocking: Option<bool>,
    closed: bool,
    upload: Option<(i32, Option<ScpTimes>)>,
}

impl ChannelIo {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            inbound: BTreeMap::new(),
            outbound: BTreeMap::new(),
            read_script: VecDeque::new(),
            write_script: VecDeque::new(),
            max_write: None,
            flushed: Vec::new(),
            remote_eof: false,
            exit_status: 0,
            blocking: None,
            closed: false,
            upload: None,
        }
    }

    fn drained(&self) -> bool {
        self.inbound.values().all(VecDeque::is_empty)
    }
}

fn step_error(step: IoStep) -> Option<TransportError> {
    match step {
        IoStep::Pass => None,
        IoStep::WouldBlock => Some(TransportError::WouldBlock),
        IoStep::Fail(code) => Some(TransportError::from_code(code, "scripted failure")),
    }
}

/// Test-side handle onto a mock channel
#[derive(Debug, Clone)]
pub struct MockChannelHandle(Arc<Mutex<ChannelIo>>);

impl MockChannelHandle {
    /// What the channel was opened for
    pub fn kind(&self) -> ChannelKind {
        self.0.lock().kind.clone()
    }

    /// Queue bytes the remote end sends on `stream_id`
    pub fn push_inbound(&self, stream_id: i32, data: &[u8]) {
        self.0.lock().inbound.entry(stream_id).or_default().extend(data.iter().copied());
    }

    /// Bytes written by the client on `stream_id`
    pub fn outbound(&self, stream_id: i32) -> Vec<u8> {
        self.0.lock().outbound.get(&stream_id).cloned().unwrap_or_default()
    }

    /// Mark the remote end as finished sending
    pub fn set_remote_eof(&self) {
        self.0.lock().remote_eof = true;
    }

    /// Exit status the remote process reports
    pub fn set_exit_status(&self, status: i32) {
        self.0.lock().exit_status = status;
    }

    /// Queue a scripted read result, one per call
    pub fn script_read(&self, step: IoStep) {
        self.0.lock().read_script.push_back(step);
    }

    /// Queue a scripted write result, one per call
    pub fn script_write(&self, step: IoStep) {
        self.0.lock().write_script.push_back(step);
    }

    /// Accept at most `max` bytes per write
    pub fn set_max_write(&self, max: usize) {
        self.0.lock().max_write = Some(max);
    }

    /// Stream ids flushed, in order
    pub fn flushed(&self) -> Vec<i32> {
        self.0.lock().flushed.clone()
    }

    /// Last blocking mode the client set, if any
    pub fn blocking(&self) -> Option<bool> {
        self.0.lock().blocking
    }

    /// Whether the client closed the channel
    pub fn is_closed(&self) -> bool {
        self.0.lock().closed
    }
}

struct MockChannel {
    io: MockChannelHandle,
    server: MockTransport,
}

impl MockChannel {
    fn commit_upload(&self) {
        let mut io = self.io.0.lock();
        let (mode, times) = match io.upload.take() {
            Some(upload) => upload,
            None => return,
        };
        let path = match &io.kind {
            ChannelKind::ScpSend(path) => path.clone(),
            _ => return,
        };
        let content = io.outbound.get(&0).cloned().unwrap_or_default();
        drop(io);

        self.server
            .state
            .lock()
            .files
            .insert(path, MockFile { content, mode, times, declared_size: None });
    }
}

impl Drop for MockChannel {
    fn drop(&mut self) {
        self.commit_upload();
        self.server.state.lock().counters.channels_dropped += 1;
    }
}

impl SshChannel for MockChannel {
    fn setenv(&mut self, name: &str, value: &str) -> Result<(), TransportError> {
        self.server.record(MockRequest::Setenv { name: name.to_string(), value: value.to_string() });
        if self.server.state.lock().refused_env.contains(name) {
            return Err(TransportError::from_code(-22, "Unable to complete request for channel-setenv"));
        }
        Ok(())
    }

    fn request_pty(&mut self, term: &str, size: PtySize) -> Result<(), TransportError> {
        self.server.record(MockRequest::Pty { term: term.to_string(), size });
        if self.server.fails(FailPoint::Pty) {
            return Err(TransportError::Channel("pty request denied".to_string()));
        }
        Ok(())
    }

    fn shell(&mut self) -> Result<(), TransportError> {
        self.server.record(MockRequest::Shell);
        if self.server.fails(FailPoint::Shell) {
            return Err(TransportError::Channel("shell request denied".to_string()));
        }
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.server.record(MockRequest::Exec(command.to_string()));
        if self.server.fails(FailPoint::Exec) {
            return Err(TransportError::Channel("exec request denied".to_string()));
        }
        Ok(())
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.io.0.lock().blocking = Some(blocking);
    }

    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> Result<usize, TransportError> {
        let mut io = self.io.0.lock();
        if let Some(err) = io.read_script.pop_front().and_then(step_error) {
            return Err(err);
        }
        let remote_eof = io.remote_eof;
        let blocking = io.blocking.unwrap_or(true);
        let queue = io.inbound.entry(stream_id).or_default();
        if queue.is_empty() {
            return if remote_eof {
                Ok(0)
            } else if blocking {
                Err(TransportError::from_code(codes::TIMEOUT, "Timed out waiting on socket"))
            } else {
                Err(TransportError::WouldBlock)
            };
        }
        let n = buf.len().min(queue.len());
        for (slot, byte) in buf.iter_mut().zip(queue.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_stream(&mut self, stream_id: i32, buf: &[u8]) -> Result<usize, TransportError> {
        let mut io = self.io.0.lock();
        if let Some(err) = io.write_script.pop_front().and_then(step_error) {
            return Err(err);
        }
        if io.closed {
            return Err(TransportError::from_code(codes::CHANNEL_EOF_SENT, "EOF has already been sent"));
        }
        let n = io.max_write.map_or(buf.len(), |max| buf.len().min(max));
        io.outbound.entry(stream_id).or_default().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush_stream(&mut self, stream_id: i32) -> Result<(), TransportError> {
        let mut io = self.io.0.lock();
        io.flushed.push(stream_id);
        // flushing discards unread inbound data on the selected streams
        match stream_id {
            crate::transport::FLUSH_ALL => io.inbound.clear(),
            crate::transport::FLUSH_EXTENDED_DATA => io.inbound.retain(|id, _| *id == 0),
            id => {
                io.inbound.remove(&id);
            }
        }
        Ok(())
    }

    fn eof(&self) -> bool {
        let io = self.io.0.lock();
        io.remote_eof && io.drained()
    }

    fn exit_status(&self) -> Result<i32, TransportError> {
        Ok(self.io.0.lock().exit_status)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.io.0.lock().closed = true;
        self.commit_upload();
        Ok(())
    }
}
