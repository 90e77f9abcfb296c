//! Channels exposed as byte streams
//!
//! A [`ChannelStream`] reads and writes one logical stream of a channel.
//! Further logical streams over the same channel come from
//! [`ChannelStream::substream`] / [`fetch_stream`]; they share the channel,
//! its blocking flag and its timeout, and the channel is freed when the last
//! of them closes.

use crate::registry::{ResourceId, ResourceRegistry, SessionRef};
use crate::{Result, SshioError};
use parking_lot::Mutex;
use serde::Serialize;
use sshio_transport::{SshChannel, TransportError, PRIMARY_STREAM};
use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Type name reported by channel streams
pub const CHANNEL_STREAM_NAME: &str = "SSH2 Channel";

/// Default limit on streams sharing one channel
pub const DEFAULT_MAX_SUBSTREAMS: u16 = 255;

/// Operations every stream handed out by this crate supports
pub trait StreamOps: Send {
    /// Write bytes; 0 means no progress (would block, or the stream failed)
    fn write_bytes(&mut self, buf: &[u8]) -> usize;

    /// Read bytes; 0 means no progress or end of stream
    fn read_bytes(&mut self, buf: &mut [u8]) -> usize;

    /// Close the stream
    fn close(&mut self);

    /// Flush outgoing data of this stream
    fn flush_stream(&mut self) -> Result<()>;

    /// Query or change a stream option
    fn set_option(&mut self, option: StreamOption) -> OptionOutcome;

    /// Name of the stream type
    fn stream_type(&self) -> &'static str;

    /// Whether the stream reached end of file
    fn is_eof(&self) -> bool;

    /// Concrete stream, for callers that need more than the common operations
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Options understood by [`StreamOps::set_option`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOption {
    /// Set blocking mode
    Blocking(bool),
    /// Set the timeout applied to blocking calls; zero disables it
    ReadTimeout(Duration),
    /// Report stream metadata including the remote exit status
    MetaData,
    /// Re-check end of file without doing I/O
    CheckLiveness,
}

/// Result of [`StreamOps::set_option`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionOutcome {
    /// Blocking mode before the change
    Blocking(bool),
    /// Timeout before the change
    ReadTimeout(Duration),
    /// Stream metadata
    MetaData(StreamMetadata),
    /// End of file flag
    Eof(bool),
}

/// Metadata of a channel stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamMetadata {
    /// Stream type name
    pub stream_type: &'static str,
    /// Logical stream id
    pub stream_id: i32,
    /// Exit status of the remote process, once the channel has one
    pub exit_status: Option<i32>,
    /// End of file flag
    pub eof: bool,
    /// Blocking mode
    pub blocking: bool,
    /// Timeout for blocking calls in milliseconds
    pub timeout_ms: u32,
}

/// Channel state shared by all streams over one channel
struct ChannelState {
    channel: Option<Box<dyn SshChannel>>,
    blocking: bool,
    timeout_ms: u32,
    /// `None` until a second stream shares the channel
    owners: Option<u16>,
}

/// What one read or write attempt achieved
enum Progress {
    Bytes(usize),
    WouldBlock,
    Failed(String),
}

/// One logical stream of a channel
pub struct ChannelStream {
    shared: Arc<Mutex<ChannelState>>,
    session: SessionRef,
    session_id: ResourceId,
    registry: ResourceRegistry,
    stream_id: i32,
    eof: bool,
    closed: bool,
    remaining: Option<u64>,
    max_substreams: u16,
    last_error: Option<String>,
}

impl fmt::Debug for ChannelStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelStream")
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("eof", &self.eof)
            .field("closed", &self.closed)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl ChannelStream {
    /// Wrap the primary stream of `channel`
    ///
    /// The stream owns one reference on `session_id` and releases it when the
    /// channel is freed.
    pub fn new(
        channel: Box<dyn SshChannel>,
        session: SessionRef,
        session_id: ResourceId,
        registry: ResourceRegistry,
    ) -> Self {
        Self {
            shared: Arc::new(Mutex::new(ChannelState {
                channel: Some(channel),
                blocking: false,
                timeout_ms: 0,
                owners: None,
            })),
            session,
            session_id,
            registry,
            stream_id: PRIMARY_STREAM,
            eof: false,
            closed: false,
            remaining: None,
            max_substreams: DEFAULT_MAX_SUBSTREAMS,
            last_error: None,
        }
    }

    /// Limit on streams sharing this channel
    pub fn with_max_substreams(mut self, max: u16) -> Self {
        self.max_substreams = max.max(1);
        self
    }

    /// Stop reading after `bytes` bytes
    pub fn with_read_limit(mut self, bytes: u64) -> Self {
        self.remaining = Some(bytes);
        self
    }

    /// Logical stream id
    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    /// Registry handle of the owning session
    pub fn session_id(&self) -> ResourceId {
        self.session_id
    }

    /// Whether this stream was closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Diagnostic of the last failed read or write
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Take the diagnostic of the last failed read or write
    pub fn take_error(&mut self) -> Option<String> {
        self.last_error.take()
    }

    /// Number of streams sharing the channel, `None` if never shared
    pub fn shared_owners(&self) -> Option<u16> {
        self.shared.lock().owners
    }

    /// Open another logical stream over this channel
    pub fn substream(&self, stream_id: i32) -> Result<ChannelStream> {
        if stream_id < 0 {
            return Err(SshioError::InvalidArgument("Invalid stream ID requested".to_string()));
        }
        if self.closed {
            return Err(SshioError::Channel("stream is closed".to_string()));
        }

        let mut state = self.shared.lock();
        if state.channel.is_none() {
            return Err(SshioError::Channel("channel is closed".to_string()));
        }
        let owners = state.owners.get_or_insert(1);
        if *owners >= self.max_substreams {
            warn!("Too many streams associated to a single channel");
            return Err(SshioError::TooManyStreams { max: self.max_substreams });
        }
        *owners += 1;
        debug!("Opened stream {} on channel of {}, {} owners", stream_id, self.session_id, owners);
        drop(state);

        Ok(ChannelStream {
            shared: Arc::clone(&self.shared),
            session: Arc::clone(&self.session),
            session_id: self.session_id,
            registry: self.registry.clone(),
            stream_id,
            eof: false,
            closed: false,
            remaining: None,
            max_substreams: self.max_substreams,
            last_error: None,
        })
    }

    /// Set blocking mode for every stream of the channel, returning the old mode
    pub fn set_blocking(&mut self, blocking: bool) -> bool {
        std::mem::replace(&mut self.shared.lock().blocking, blocking)
    }

    /// Current blocking mode
    pub fn is_blocking(&self) -> bool {
        self.shared.lock().blocking
    }

    /// Set the blocking-call timeout, returning the old one
    ///
    /// Stored with millisecond precision.
    pub fn set_timeout(&mut self, timeout: Duration) -> Duration {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        let previous = std::mem::replace(&mut self.shared.lock().timeout_ms, millis);
        Duration::from_millis(previous as u64)
    }

    /// Current blocking-call timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.shared.lock().timeout_ms as u64)
    }

    /// Exit status reported by the remote process
    pub fn exit_status(&self) -> Option<i32> {
        let state = self.shared.lock();
        state.channel.as_ref().and_then(|c| c.exit_status().ok())
    }

    /// Re-derive the end of file flag from the channel
    pub fn check_liveness(&mut self) -> bool {
        let channel_eof = {
            let state = self.shared.lock();
            state.channel.as_ref().map_or(true, |c| c.eof())
        };
        self.eof = channel_eof || self.remaining == Some(0);
        self.eof
    }

    /// Metadata snapshot
    pub fn metadata(&self) -> StreamMetadata {
        let state = self.shared.lock();
        StreamMetadata {
            stream_type: CHANNEL_STREAM_NAME,
            stream_id: self.stream_id,
            exit_status: state.channel.as_ref().and_then(|c| c.exit_status().ok()),
            eof: self.eof,
            blocking: state.blocking,
            timeout_ms: state.timeout_ms,
        }
    }

    /// Run one channel call with the shared blocking mode and timeout applied
    fn with_channel<T>(
        &self,
        call: impl FnOnce(&mut dyn SshChannel) -> std::result::Result<T, TransportError>,
    ) -> Option<std::result::Result<T, TransportError>> {
        let mut state = self.shared.lock();
        let blocking = state.blocking;
        let timeout_ms = state.timeout_ms;
        let channel = state.channel.as_mut()?;

        channel.set_blocking(blocking);
        if blocking {
            self.session.set_timeout(timeout_ms);
        }
        let result = call(channel.as_mut());
        if blocking {
            self.session.set_timeout(0);
        }
        Some(result)
    }

    fn settle(&mut self, result: Option<std::result::Result<usize, TransportError>>) -> Progress {
        match result {
            None => {
                self.eof = true;
                Progress::Bytes(0)
            }
            Some(Ok(n)) => Progress::Bytes(n),
            Some(Err(e)) if e.is_would_block() => Progress::WouldBlock,
            Some(Err(e)) => {
                let message = e.to_string();
                warn!("{}", message);
                self.last_error = Some(message.clone());
                self.eof = true;
                Progress::Failed(message)
            }
        }
    }

    fn write_progress(&mut self, buf: &[u8]) -> Progress {
        if self.closed {
            return Progress::Bytes(0);
        }
        let stream_id = self.stream_id;
        let result = self.with_channel(|channel| channel.write_stream(stream_id, buf));
        self.settle(result)
    }

    fn read_progress(&mut self, buf: &mut [u8]) -> Progress {
        if self.closed {
            return Progress::Bytes(0);
        }
        self.check_liveness();

        let want = match self.remaining {
            Some(0) => return Progress::Bytes(0),
            Some(left) => buf.len().min(usize::try_from(left).unwrap_or(usize::MAX)),
            None => buf.len(),
        };
        let stream_id = self.stream_id;
        let result = self.with_channel(|channel| channel.read_stream(stream_id, &mut buf[..want]));
        let progress = self.settle(result);

        if let (Progress::Bytes(n), Some(left)) = (&progress, self.remaining.as_mut()) {
            *left -= *n as u64;
            if *left == 0 {
                self.eof = true;
            }
        }
        progress
    }
}

impl StreamOps for ChannelStream {
    fn write_bytes(&mut self, buf: &[u8]) -> usize {
        match self.write_progress(buf) {
            Progress::Bytes(n) => n,
            Progress::WouldBlock | Progress::Failed(_) => 0,
        }
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> usize {
        match self.read_progress(buf) {
            Progress::Bytes(n) => n,
            Progress::WouldBlock | Progress::Failed(_) => 0,
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.eof = true;

        let mut state = self.shared.lock();
        let last = match state.owners.as_mut() {
            None => true,
            Some(owners) => {
                *owners -= 1;
                *owners == 0
            }
        };
        if !last {
            debug!("Closed stream {}, channel stays open", self.stream_id);
            return;
        }

        let channel = state.channel.take();
        drop(state);
        drop(channel);
        debug!("Freed channel of {}", self.session_id);

        if let Err(e) = self.registry.release(self.session_id) {
            warn!("Releasing {} after channel close: {}", self.session_id, e);
        }
    }

    fn flush_stream(&mut self) -> Result<()> {
        let stream_id = self.stream_id;
        match self.with_channel(|channel| channel.flush_stream(stream_id)) {
            Some(result) => Ok(result?),
            None => Err(SshioError::Channel("channel is closed".to_string())),
        }
    }

    fn set_option(&mut self, option: StreamOption) -> OptionOutcome {
        match option {
            StreamOption::Blocking(blocking) => OptionOutcome::Blocking(self.set_blocking(blocking)),
            StreamOption::ReadTimeout(timeout) => OptionOutcome::ReadTimeout(self.set_timeout(timeout)),
            StreamOption::MetaData => OptionOutcome::MetaData(self.metadata()),
            StreamOption::CheckLiveness => OptionOutcome::Eof(self.check_liveness()),
        }
    }

    fn stream_type(&self) -> &'static str {
        CHANNEL_STREAM_NAME
    }

    fn is_eof(&self) -> bool {
        self.eof
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for ChannelStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl io::Read for ChannelStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.read_progress(buf) {
            Progress::Bytes(n) => Ok(n),
            Progress::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            Progress::Failed(message) => Err(io::Error::new(io::ErrorKind::Other, message)),
        }
    }
}

impl io::Write for ChannelStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.write_progress(buf) {
            Progress::Bytes(0) if self.eof && !buf.is_empty() => Err(io::ErrorKind::BrokenPipe.into()),
            Progress::Bytes(n) => Ok(n),
            Progress::WouldBlock => Err(io::ErrorKind::WouldBlock.into()),
            Progress::Failed(message) => Err(io::Error::new(io::ErrorKind::Other, message)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }
}

/// Open logical stream `stream_id` over the channel behind `parent`
///
/// Fails when `parent` is not a channel stream, when the id is negative or
/// when the channel has no room for another stream.
pub fn fetch_stream(parent: &mut dyn StreamOps, stream_id: i32) -> Result<ChannelStream> {
    if stream_id < 0 {
        warn!("Invalid stream ID requested");
        return Err(SshioError::InvalidArgument("Invalid stream ID requested".to_string()));
    }
    let parent = parent
        .as_any_mut()
        .downcast_mut::<ChannelStream>()
        .ok_or(SshioError::WrongStreamKind { expected: CHANNEL_STREAM_NAME })?;
    parent.substream(stream_id)
}
