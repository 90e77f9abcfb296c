//! Shell, exec, tunnel and SCP channels turned into streams
//!
//! A launcher hands back a [`ChannelStream`] that owns one reference on the
//! session; the caller must have taken that reference before launching. On
//! failure the half-built channel is freed and no reference is consumed.

use crate::context::{EnvKey, Environment};
use crate::registry::{ResourceId, ResourceRegistry, SessionRef};
use crate::stream::{ChannelStream, DEFAULT_MAX_SUBSTREAMS};
use crate::{Result, SshioError};
use sshio_transport::{PtySize, SshChannel, TermUnit};
use tracing::{debug, warn};

/// Session a launcher opens its channel on
#[derive(Clone)]
pub struct LaunchTarget {
    session: SessionRef,
    session_id: ResourceId,
    registry: ResourceRegistry,
    max_substreams: u16,
}

impl std::fmt::Debug for LaunchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LaunchTarget")
            .field("session_id", &self.session_id)
            .field("max_substreams", &self.max_substreams)
            .finish()
    }
}

impl LaunchTarget {
    /// Target the session registered as `session_id`
    pub fn new(session: SessionRef, session_id: ResourceId, registry: ResourceRegistry) -> Self {
        Self { session, session_id, registry, max_substreams: DEFAULT_MAX_SUBSTREAMS }
    }

    /// Limit on streams sharing a launched channel
    pub fn with_max_substreams(mut self, max: u16) -> Self {
        self.max_substreams = max;
        self
    }

    /// Registry handle of the session
    pub fn session_id(&self) -> ResourceId {
        self.session_id
    }

    /// The session itself
    pub fn session(&self) -> &SessionRef {
        &self.session
    }

    fn open_session_channel(&self) -> Result<Box<dyn SshChannel>> {
        self.session.set_blocking(true);
        self.session.channel_session().map_err(|e| {
            warn!("Unable to request a channel from remote host: {}", e);
            SshioError::Channel(format!("Unable to request a channel from remote host: {}", e))
        })
    }

    fn wrap(&self, channel: Box<dyn SshChannel>) -> ChannelStream {
        ChannelStream::new(channel, self.session.clone(), self.session_id, self.registry.clone())
            .with_max_substreams(self.max_substreams)
    }
}

/// Send every named variable; refusals and positional entries only warn
pub fn apply_environment(channel: &mut dyn SshChannel, env: &Environment) {
    for (key, value) in env.iter() {
        match key {
            EnvKey::Name(name) => {
                if let Err(e) = channel.setenv(name, value) {
                    warn!("Failed setting {}={} on remote end: {}", name, value, e);
                }
            }
            EnvKey::Index(_) => warn!("Skipping numeric index in environment array"),
        }
    }
}

fn request_pty(channel: &mut dyn SshChannel, term: &str, size: PtySize) -> Result<()> {
    channel.request_pty(term, size).map_err(|e| {
        let unit = match size.unit {
            TermUnit::Chars => "characters",
            TermUnit::Pixels => "pixels",
        };
        let message = format!("Failed allocating {} pty at {}x{} {}", term, size.width, size.height, unit);
        warn!("{}: {}", message, e);
        SshioError::Channel(message)
    })
}

/// Open an interactive shell with a pseudo-terminal
pub fn open_shell(
    target: &LaunchTarget,
    term: &str,
    env: Option<&Environment>,
    size: PtySize,
) -> Result<ChannelStream> {
    let mut channel = target.open_session_channel()?;
    if let Some(env) = env {
        apply_environment(channel.as_mut(), env);
    }
    request_pty(channel.as_mut(), term, size)?;
    channel.shell().map_err(|e| {
        warn!("Unable to request shell from remote host: {}", e);
        SshioError::Channel(format!("Unable to request shell from remote host: {}", e))
    })?;

    debug!("Started {} shell on {}", term, target.session_id);
    Ok(target.wrap(channel))
}

/// Run `command`; a pseudo-terminal is requested only when `term` is given
pub fn exec_command(
    target: &LaunchTarget,
    command: &str,
    term: Option<&str>,
    env: Option<&Environment>,
    size: PtySize,
) -> Result<ChannelStream> {
    let mut channel = target.open_session_channel()?;
    if let Some(env) = env {
        apply_environment(channel.as_mut(), env);
    }
    if let Some(term) = term {
        request_pty(channel.as_mut(), term, size)?;
    }
    channel.exec(command).map_err(|e| {
        warn!("Unable to request command execution on remote host: {}", e);
        SshioError::Channel(format!("Unable to request command execution on remote host: {}", e))
    })?;

    debug!("Executing {:?} on {}", command, target.session_id);
    Ok(target.wrap(channel))
}

/// Forward a channel to `host:port` as seen from the remote end
pub fn open_tunnel(target: &LaunchTarget, host: &str, port: u16) -> Result<ChannelStream> {
    if host.is_empty() || port == 0 {
        return Err(SshioError::InvalidArgument(format!("invalid tunnel target {}:{}", host, port)));
    }
    let channel = target.session.channel_direct_tcpip(host, port).map_err(|e| {
        warn!("Unable to request a channel from remote host: {}", e);
        SshioError::Channel(format!("Unable to request a channel from remote host: {}", e))
    })?;

    debug!("Tunnel to {}:{} over {}", host, port, target.session_id);
    Ok(target.wrap(channel))
}

/// Read-only stream over an SCP download of `path`
///
/// The stream ends after the file's declared size.
pub fn open_scp_read(target: &LaunchTarget, path: &str) -> Result<ChannelStream> {
    let (channel, size) = target.session.scp_recv(path).map_err(|e| {
        warn!("Unable to request a channel from remote host: {}", e);
        SshioError::Channel(format!("Unable to request a channel from remote host: {}", e))
    })?;

    debug!("Receiving {} ({} bytes) over {}", path, size, target.session_id);
    Ok(target.wrap(channel).with_read_limit(size))
}

/// Leading decimal digits of `s` as a number, 0 when there are none
fn leading_number(s: &str) -> u64 {
    s.bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0u64, |n, d| n.saturating_mul(10).saturating_add(u64::from(d - b'0')))
}

/// Split a tunnel path `/host:port` or `/[v6addr]:port`
pub fn parse_tunnel_target(path: &str) -> Result<(String, u16)> {
    let invalid = || SshioError::InvalidArgument(format!("Invalid tunnel target {:?}", path));
    let rest = path.strip_prefix('/').ok_or_else(invalid)?;

    let (host, port) = match rest.strip_prefix('[') {
        Some(bracketed) => match bracketed.split_once("]:") {
            Some((host, port)) => (host, leading_number(port)),
            None => (bracketed, 0),
        },
        None => match rest.split_once(':') {
            Some((host, port)) => (host, leading_number(port)),
            None => (rest, 0),
        },
    };

    if host.is_empty() || port == 0 || port > u64::from(u16::MAX) {
        return Err(invalid());
    }
    Ok((host.to_string(), port as u16))
}
