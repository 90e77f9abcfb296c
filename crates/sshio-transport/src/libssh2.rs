//! libssh2 backend built on the `ssh2` crate

use crate::transport::{
    MethodKind, PtySize, ScpTimes, SftpSession, SshChannel, SshConfig, SshSession, Transport,
};
use crate::TransportError;
use parking_lot::Mutex;
use std::any::Any;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use tracing::{debug, info, warn};

/// Transport that opens libssh2 sessions over TCP
#[derive(Debug, Default, Clone)]
pub struct Libssh2Transport;

impl Libssh2Transport {
    /// Create a new libssh2 transport
    pub fn new() -> Self {
        Self
    }
}

fn method_type(kind: MethodKind) -> ssh2::MethodType {
    match kind {
        MethodKind::Kex => ssh2::MethodType::Kex,
        MethodKind::Hostkey => ssh2::MethodType::HostKey,
        MethodKind::CryptCs => ssh2::MethodType::CryptCs,
        MethodKind::CryptSc => ssh2::MethodType::CryptSc,
        MethodKind::MacCs => ssh2::MethodType::MacCs,
        MethodKind::MacSc => ssh2::MethodType::MacSc,
        MethodKind::CompCs => ssh2::MethodType::CompCs,
        MethodKind::CompSc => ssh2::MethodType::CompSc,
    }
}

/// Recover the transport code from an I/O error produced by an `ssh2::Stream`
fn from_stream_error(err: io::Error) -> TransportError {
    if err.kind() == io::ErrorKind::WouldBlock {
        return TransportError::WouldBlock;
    }
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ssh2::Error>()) {
        return match inner.code() {
            ssh2::ErrorCode::Session(code) => TransportError::from_code(code, inner.message()),
            ssh2::ErrorCode::SFTP(code) => TransportError::Session {
                code,
                message: inner.message().to_string(),
            },
        };
    }
    TransportError::Io(err)
}

impl Transport for Libssh2Transport {
    fn connect(&self, config: &SshConfig) -> Result<Box<dyn SshSession>, TransportError> {
        info!("Connecting to {}:{}", config.host, config.port);

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("Unable to resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("No address for {}", config.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout).map_err(|e| {
            TransportError::Connection(format!("Unable to connect to {}:{}: {}", config.host, config.port, e))
        })?;

        let mut session = ssh2::Session::new()
            .map_err(|e| TransportError::Connection(format!("Unable to initialize SSH session: {}", e)))?;

        for (kind, prefs) in &config.methods {
            session.method_pref(method_type(*kind), prefs).map_err(|e| {
                TransportError::Configuration(format!("Failed overriding {:?} method: {}", kind, e))
            })?;
        }

        if !config.callbacks.is_empty() {
            let names: Vec<&str> = config.callbacks.keys().map(String::as_str).collect();
            warn!("libssh2 backend does not install session callbacks: {}", names.join(", "));
        }

        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| {
            TransportError::Connection(format!("Error starting up SSH connection: {}", e))
        })?;

        debug!("Handshake with {}:{} complete", config.host, config.port);
        Ok(Box::new(Libssh2Session { session }))
    }
}

/// libssh2 session
pub struct Libssh2Session {
    session: ssh2::Session,
}

impl Libssh2Session {
    fn wrap(&self, channel: ssh2::Channel) -> Box<dyn SshChannel> {
        Box::new(Libssh2Channel { channel, session: self.session.clone() })
    }
}

impl SshSession for Libssh2Session {
    fn userauth_pubkey_file(
        &self,
        username: &str,
        pubkey: &Path,
        privkey: &Path,
        passphrase: Option<&str>,
    ) -> Result<(), TransportError> {
        self.session
            .userauth_pubkey_file(username, Some(pubkey), privkey, passphrase)
            .map_err(|e| TransportError::Authentication(e.to_string()))
    }

    fn userauth_password(&self, username: &str, password: &str) -> Result<(), TransportError> {
        self.session
            .userauth_password(username, password)
            .map_err(|e| TransportError::Authentication(e.to_string()))
    }

    fn authenticated(&self) -> bool {
        self.session.authenticated()
    }

    fn set_blocking(&self, blocking: bool) {
        self.session.set_blocking(blocking);
    }

    fn set_timeout(&self, timeout_ms: u32) {
        self.session.set_timeout(timeout_ms);
    }

    fn channel_session(&self) -> Result<Box<dyn SshChannel>, TransportError> {
        let channel = self.session.channel_session()?;
        Ok(self.wrap(channel))
    }

    fn channel_direct_tcpip(&self, host: &str, port: u16) -> Result<Box<dyn SshChannel>, TransportError> {
        let channel = self.session.channel_direct_tcpip(host, port, None)?;
        Ok(self.wrap(channel))
    }

    fn scp_recv(&self, path: &str) -> Result<(Box<dyn SshChannel>, u64), TransportError> {
        let (channel, stat) = self.session.scp_recv(Path::new(path))?;
        Ok((self.wrap(channel), stat.size()))
    }

    fn scp_send(
        &self,
        path: &str,
        mode: i32,
        size: u64,
        times: Option<ScpTimes>,
    ) -> Result<Box<dyn SshChannel>, TransportError> {
        let times = times.map(|t| (t.mtime, t.atime));
        let channel = self.session.scp_send(Path::new(path), mode, size, times)?;
        Ok(self.wrap(channel))
    }

    fn sftp(&self) -> Result<Box<dyn SftpSession>, TransportError> {
        let sftp = self.session.sftp()?;
        Ok(Box::new(Libssh2Sftp { sftp: Mutex::new(sftp) }))
    }
}

/// libssh2 channel; keeps its session alive for blocking toggles
pub struct Libssh2Channel {
    channel: ssh2::Channel,
    session: ssh2::Session,
}

impl SshChannel for Libssh2Channel {
    fn setenv(&mut self, name: &str, value: &str) -> Result<(), TransportError> {
        self.channel.setenv(name, value).map_err(Into::into)
    }

    fn request_pty(&mut self, term: &str, size: PtySize) -> Result<(), TransportError> {
        self.channel
            .request_pty(term, None, Some(size.dimensions()))
            .map_err(|e| TransportError::Channel(e.to_string()))
    }

    fn shell(&mut self) -> Result<(), TransportError> {
        self.channel.shell().map_err(|e| TransportError::Channel(e.to_string()))
    }

    fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        self.channel.exec(command).map_err(|e| TransportError::Channel(e.to_string()))
    }

    fn set_blocking(&mut self, blocking: bool) {
        // libssh2 keeps the blocking flag on the session
        self.session.set_blocking(blocking);
    }

    fn read_stream(&mut self, stream_id: i32, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.channel.stream(stream_id).read(buf).map_err(from_stream_error)
    }

    fn write_stream(&mut self, stream_id: i32, buf: &[u8]) -> Result<usize, TransportError> {
        self.channel.stream(stream_id).write(buf).map_err(from_stream_error)
    }

    fn flush_stream(&mut self, stream_id: i32) -> Result<(), TransportError> {
        self.channel.stream(stream_id).flush().map_err(from_stream_error)
    }

    fn eof(&self) -> bool {
        self.channel.eof()
    }

    fn exit_status(&self) -> Result<i32, TransportError> {
        self.channel.exit_status().map_err(Into::into)
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.channel.send_eof()?;
        self.channel.wait_eof()?;
        self.channel.close()?;
        self.channel.wait_close()?;
        Ok(())
    }
}

/// libssh2 SFTP subsystem
pub struct Libssh2Sftp {
    sftp: Mutex<ssh2::Sftp>,
}

impl Libssh2Sftp {
    /// Run `f` against the underlying SFTP handle
    pub fn with_sftp<R>(&self, f: impl FnOnce(&ssh2::Sftp) -> R) -> R {
        f(&self.sftp.lock())
    }
}

impl SftpSession for Libssh2Sftp {
    fn as_any(&self) -> &dyn Any {
        self
    }
}
