//! SCP bulk copy
//!
//! Both directions move an exact byte count in fixed-size chunks and drive
//! the channel directly instead of going through [`crate::ChannelStream`].

use sshio_transport::{codes, ScpTimes, SshSession, TransportError, FLUSH_ALL, PRIMARY_STREAM};
use std::fs::{File, Metadata};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Bytes moved per loop iteration unless configured otherwise
pub const DEFAULT_CHUNK_SIZE: usize = 8192;

/// Why a single write to the remote file failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteFailure {
    /// The channel would have blocked
    #[error("Operation would block")]
    WouldBlock,
    /// Allocation failure inside the transport
    #[error("An internal memory allocation call failed")]
    Alloc,
    /// The socket refused the data
    #[error("Unable to send data on socket")]
    SocketSend,
    /// The remote end closed the channel
    #[error("The channel has been closed")]
    ChannelClosed,
    /// EOF was already sent
    #[error("The channel has been requested to be closed")]
    EofSent,
    /// Anything else
    #[error("{0}")]
    Other(String),
}

impl From<&TransportError> for WriteFailure {
    fn from(err: &TransportError) -> Self {
        match err.code() {
            Some(codes::EAGAIN) => Self::WouldBlock,
            Some(codes::ALLOC) => Self::Alloc,
            Some(codes::SOCKET_SEND) => Self::SocketSend,
            Some(codes::CHANNEL_CLOSED) => Self::ChannelClosed,
            Some(codes::CHANNEL_EOF_SENT) => Self::EofSent,
            _ => Self::Other(err.to_string()),
        }
    }
}

/// Bulk transfer failures
#[derive(Debug, Error)]
pub enum TransferError {
    /// The remote file could not be opened for download
    #[error("Unable to receive remote file: {0}")]
    RemoteOpen(String),

    /// The local destination could not be created
    #[error("Unable to write to local file: {0}")]
    LocalOpen(#[source] io::Error),

    /// Reading from the channel failed
    #[error("Error reading from remote file: {0}")]
    RemoteRead(String),

    /// The remote end stopped before the announced size
    #[error("Remote file ended after {received} of {expected} bytes")]
    Truncated {
        /// Bytes received
        received: u64,
        /// Bytes announced
        expected: u64,
    },

    /// Writing to the local destination failed
    #[error("Unable to write to local file: {0}")]
    LocalWrite(#[source] io::Error),

    /// The local source could not be opened
    #[error("Unable to read source file: {0}")]
    SourceOpen(#[source] io::Error),

    /// The local source could not be stat'ed
    #[error("Failed statting local file: {0}")]
    SourceStat(#[source] io::Error),

    /// The remote end refused the upload
    #[error("Failure creating remote file: {0}")]
    RemoteCreate(String),

    /// The local source returned an unusable amount of data
    #[error("Failed copying file: {0}")]
    SourceRead(String),

    /// A write to the remote file failed
    #[error(transparent)]
    Write(#[from] WriteFailure),

    /// Flushing or closing the remote file failed
    #[error("Failed finishing remote file: {0}")]
    Finish(String),
}

/// SCP copy engine
#[derive(Debug, Clone, Copy)]
pub struct BulkTransfer {
    chunk_size: usize,
}

impl Default for BulkTransfer {
    fn default() -> Self {
        Self { chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

impl BulkTransfer {
    /// Engine with the default chunk size
    pub fn new() -> Self {
        Self::default()
    }

    /// Move at most `chunk_size` bytes per iteration
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Configured chunk size
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Download `remote` into a local file
    ///
    /// A partially written destination is left in place on failure.
    pub fn receive_file(&self, session: &dyn SshSession, remote: &str, local: &Path) -> Result<u64, TransferError> {
        info!("Receiving {} into {}", remote, local.display());
        // the remote side is opened first so a refused download leaves no empty file behind
        let (mut channel, size) = session.scp_recv(remote).map_err(|e| {
            warn!("Unable to receive remote file: {}", e);
            TransferError::RemoteOpen(e.to_string())
        })?;
        let mut file = File::create(local).map_err(|e| {
            warn!("Unable to write to local file: {}", e);
            TransferError::LocalOpen(e)
        })?;
        self.pull(channel.as_mut(), size, &mut file)
    }

    /// Download `remote` into `sink`, returning the byte count
    pub fn receive_into<W: Write>(
        &self,
        session: &dyn SshSession,
        remote: &str,
        sink: &mut W,
    ) -> Result<u64, TransferError> {
        let (mut channel, size) = session.scp_recv(remote).map_err(|e| {
            warn!("Unable to receive remote file: {}", e);
            TransferError::RemoteOpen(e.to_string())
        })?;
        self.pull(channel.as_mut(), size, sink)
    }

    fn pull<W: Write>(
        &self,
        channel: &mut dyn sshio_transport::SshChannel,
        size: u64,
        sink: &mut W,
    ) -> Result<u64, TransferError> {
        channel.set_blocking(true);
        let mut buffer = vec![0u8; self.chunk_size];
        let mut remaining = size;

        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
            let read = match channel.read_stream(PRIMARY_STREAM, &mut buffer[..want]) {
                Ok(0) if channel.eof() => {
                    let received = size - remaining;
                    warn!("Remote file ended after {} of {} bytes", received, size);
                    return Err(TransferError::Truncated { received, expected: size });
                }
                Ok(n) => n,
                Err(e) => {
                    warn!("Error reading from remote file: {}", e);
                    return Err(TransferError::RemoteRead(e.to_string()));
                }
            };
            sink.write_all(&buffer[..read]).map_err(TransferError::LocalWrite)?;
            remaining -= read as u64;
        }

        sink.flush().map_err(TransferError::LocalWrite)?;
        debug!("Received {} bytes", size);
        Ok(size)
    }

    /// Upload a local file to `remote`
    ///
    /// Without `mode` the source's permission bits are announced.
    pub fn send_file(
        &self,
        session: &dyn SshSession,
        local: &Path,
        remote: &str,
        mode: Option<i32>,
    ) -> Result<u64, TransferError> {
        info!("Sending {} to {}", local.display(), remote);
        let mut file = File::open(local).map_err(|e| {
            warn!("Unable to read source file: {}", e);
            TransferError::SourceOpen(e)
        })?;
        let metadata = file.metadata().map_err(|e| {
            warn!("Failed statting local file: {}", e);
            TransferError::SourceStat(e)
        })?;

        let mode = mode.unwrap_or_else(|| permission_bits(&metadata));
        let times = file_times(&metadata);
        self.send_from(session, &mut file, remote, mode, metadata.len(), times)
    }

    /// Upload exactly `size` bytes from `source` to `remote`
    pub fn send_from<R: Read>(
        &self,
        session: &dyn SshSession,
        source: &mut R,
        remote: &str,
        mode: i32,
        size: u64,
        times: Option<ScpTimes>,
    ) -> Result<u64, TransferError> {
        let mut channel = session.scp_send(remote, mode, size, times).map_err(|e| {
            warn!("Failure creating remote file: {}", e);
            TransferError::RemoteCreate(e.to_string())
        })?;
        channel.set_blocking(true);

        let mut buffer = vec![0u8; self.chunk_size];
        let mut remaining = size;
        while remaining > 0 {
            let want = usize::try_from(remaining).map_or(self.chunk_size, |r| r.min(self.chunk_size));
            let read = match source.read(&mut buffer[..want]) {
                Ok(0) => {
                    let reason = format!("source ended with {} bytes still announced", remaining);
                    warn!("Failed copying file: {}", reason);
                    return Err(TransferError::SourceRead(reason));
                }
                Ok(n) if n > want => {
                    let reason = format!("read {} bytes for a {} byte request", n, want);
                    warn!("Failed copying file: {}", reason);
                    return Err(TransferError::SourceRead(reason));
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Failed copying file: {}", e);
                    return Err(TransferError::SourceRead(e.to_string()));
                }
            };

            let mut sent = 0;
            while sent < read {
                match channel.write_stream(PRIMARY_STREAM, &buffer[sent..read]) {
                    Ok(0) => {
                        warn!("{}", WriteFailure::WouldBlock);
                        return Err(WriteFailure::WouldBlock.into());
                    }
                    Ok(n) => sent += n,
                    Err(e) => {
                        let failure = WriteFailure::from(&e);
                        warn!("{}", failure);
                        return Err(failure.into());
                    }
                }
            }
            remaining -= read as u64;
        }

        channel.flush_stream(FLUSH_ALL).map_err(|e| TransferError::Finish(e.to_string()))?;
        channel.close().map_err(|e| {
            warn!("Failed finishing remote file: {}", e);
            TransferError::Finish(e.to_string())
        })?;
        debug!("Sent {} bytes to {}", size, remote);
        Ok(size)
    }
}

#[cfg(unix)]
fn permission_bits(metadata: &Metadata) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    (metadata.permissions().mode() & 0o777) as i32
}

#[cfg(not(unix))]
fn permission_bits(_metadata: &Metadata) -> i32 {
    0o644
}

fn file_times(metadata: &Metadata) -> Option<ScpTimes> {
    let seconds = |t: std::time::SystemTime| t.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs());
    let mtime = metadata.modified().ok().and_then(seconds)?;
    let atime = metadata.accessed().ok().and_then(seconds)?;
    Some(ScpTimes { mtime, atime })
}
