//! Caller-facing entry points
//!
//! [`StreamWrapper`] owns the registry and the resolver. It opens streams
//! from `ssh2.<type>://` identifiers and offers the same launchers on an
//! already registered session handle, plus SCP file copy.

use crate::context::{Context, Environment, DEFAULT_TERMINAL};
use crate::launcher::{self, LaunchTarget};
use crate::path::ResourcePath;
use crate::registry::{ResourceId, ResourceRegistry};
use crate::resolver::{KeyAccessPolicy, Resolved, Resolver, WrapperKind};
use crate::stream::{self, ChannelStream, StreamOps, DEFAULT_MAX_SUBSTREAMS};
use crate::transfer::{BulkTransfer, DEFAULT_CHUNK_SIZE};
use crate::{Result, SshioError};
use serde::{Deserialize, Serialize};
use sshio_transport::{PtySize, Transport};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Wrapper settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WrapperConfig {
    /// Scheme family, the part before the dot
    pub family: String,
    /// Bytes per SCP copy iteration
    pub chunk_size: usize,
    /// Streams allowed to share one channel
    pub max_substreams: u16,
    /// Directories key files must live in; `None` allows any
    pub allowed_key_dirs: Option<Vec<PathBuf>>,
    /// TCP connect timeout in seconds
    pub connect_timeout_secs: u64,
}

impl Default for WrapperConfig {
    fn default() -> Self {
        Self {
            family: "ssh2".to_string(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_substreams: DEFAULT_MAX_SUBSTREAMS,
            allowed_key_dirs: None,
            connect_timeout_secs: 30,
        }
    }
}

impl WrapperConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the wrapper cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.family.is_empty() || self.family.contains(['.', ':', '/']) {
            return Err(SshioError::Configuration(format!("invalid scheme family {:?}", self.family)));
        }
        if self.chunk_size == 0 {
            return Err(SshioError::Configuration("chunk_size must be greater than zero".to_string()));
        }
        if self.max_substreams == 0 {
            return Err(SshioError::Configuration("max_substreams must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Connect timeout as a duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn policy(&self) -> KeyAccessPolicy {
        match &self.allowed_key_dirs {
            Some(dirs) => KeyAccessPolicy::restricted_to(dirs.iter().cloned()),
            None => KeyAccessPolicy::allow_all(),
        }
    }
}

/// Stream I/O over SSH sessions
pub struct StreamWrapper {
    registry: ResourceRegistry,
    resolver: Resolver,
    transfer: BulkTransfer,
    config: WrapperConfig,
}

impl fmt::Debug for StreamWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWrapper")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}

impl StreamWrapper {
    /// Wrapper with default settings
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self::build(transport, WrapperConfig::default())
    }

    /// Wrapper with validated settings
    pub fn with_config(transport: Arc<dyn Transport>, config: WrapperConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(transport, config))
    }

    fn build(transport: Arc<dyn Transport>, config: WrapperConfig) -> Self {
        let registry = ResourceRegistry::new();
        let resolver = Resolver::new(transport, registry.clone())
            .with_family(config.family.clone())
            .with_policy(config.policy())
            .with_connect_timeout(config.connect_timeout());
        let transfer = BulkTransfer::new().with_chunk_size(config.chunk_size);
        Self { registry, resolver, transfer, config }
    }

    /// Handle table shared by every stream this wrapper opens
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Identifier resolver
    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    /// Active settings
    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Open the stream an identifier names, dispatching on its type
    pub fn open(&self, identifier: &str, mode: &str, context: &Context) -> Result<ChannelStream> {
        let (family, kind) = ResourcePath::scheme(identifier)?;
        if family != self.config.family {
            return Err(SshioError::NotMine(identifier.to_string()));
        }
        match kind {
            "shell" => self.open_shell_url(identifier, context),
            "exec" => self.open_exec_url(identifier, context),
            "scp" => self.open_scp_url(identifier, mode, context),
            "tunnel" => self.open_tunnel_url(identifier, context),
            _ => Err(SshioError::NotMine(identifier.to_string())),
        }
    }

    /// `ssh2.shell://host/term`; the first path segment picks the terminal type
    pub fn open_shell_url(&self, identifier: &str, context: &Context) -> Result<ChannelStream> {
        let resolved = self.resolver.resolve(identifier, WrapperKind::Shell, false, context)?;
        let term = terminal_from_path(&resolved.path.decoded_path())
            .or_else(|| context.term.clone())
            .unwrap_or_else(|| DEFAULT_TERMINAL.to_string());
        let target = self.launch_target(&resolved);

        let result = launcher::open_shell(&target, &term, context.env.as_ref(), context.pty_size());
        self.settle(resolved, result)
    }

    /// `ssh2.exec://host/command`; the decoded path is the command line
    pub fn open_exec_url(&self, identifier: &str, context: &Context) -> Result<ChannelStream> {
        let resolved = self.resolver.resolve(identifier, WrapperKind::Exec, false, context)?;
        if resolved.path.raw_path().is_empty() {
            warn!("Invalid path specified");
            self.give_back(resolved);
            return Err(SshioError::InvalidArgument("Invalid path specified".to_string()));
        }
        let command = resolved.path.decoded_path();
        let target = self.launch_target(&resolved);

        let result = launcher::exec_command(
            &target,
            &command,
            context.term.as_deref(),
            context.env.as_ref(),
            context.pty_size(),
        );
        self.settle(resolved, result)
    }

    /// `ssh2.scp://host/path`, read-only
    pub fn open_scp_url(&self, identifier: &str, mode: &str, context: &Context) -> Result<ChannelStream> {
        if mode.contains(['w', 'a', '+']) {
            warn!("SCP only supports reading");
            return Err(SshioError::InvalidArgument(format!("SCP streams are read-only, got mode {:?}", mode)));
        }
        let resolved = self.resolver.resolve(identifier, WrapperKind::Scp, false, context)?;
        let remote = resolved.path.decoded_path();
        let target = self.launch_target(&resolved);

        let result = launcher::open_scp_read(&target, &remote);
        self.settle(resolved, result)
    }

    /// `ssh2.tunnel://host/target:port` or `/[v6addr]:port`
    pub fn open_tunnel_url(&self, identifier: &str, context: &Context) -> Result<ChannelStream> {
        let parsed = ResourcePath::parse_for(identifier, &self.config.family, WrapperKind::Tunnel.as_str())?;
        // checked before any session is touched
        let (host, port) = launcher::parse_tunnel_target(&parsed.decoded_path())?;

        let resolved = self.resolver.resolve(identifier, WrapperKind::Tunnel, false, context)?;
        let target = self.launch_target(&resolved);
        let result = launcher::open_tunnel(&target, &host, port);
        self.settle(resolved, result)
    }

    /// Connect and authenticate a new session, returning its handle
    pub fn connect(&self, host: &str, port: u16, context: &Context) -> Result<ResourceId> {
        self.resolver.connect(host, port, context)
    }

    /// Drop one reference on a handle returned by [`Self::connect`]
    pub fn disconnect(&self, id: ResourceId) -> Result<u32> {
        self.registry.release(id)
    }

    /// Interactive shell on a registered session
    pub fn shell(
        &self,
        session: ResourceId,
        term: Option<&str>,
        env: Option<&Environment>,
        size: PtySize,
    ) -> Result<ChannelStream> {
        self.launch_on(session, |target| launcher::open_shell(target, term.unwrap_or(DEFAULT_TERMINAL), env, size))
    }

    /// Remote command on a registered session
    pub fn exec(
        &self,
        session: ResourceId,
        command: &str,
        pty: Option<&str>,
        env: Option<&Environment>,
        size: PtySize,
    ) -> Result<ChannelStream> {
        self.launch_on(session, |target| launcher::exec_command(target, command, pty, env, size))
    }

    /// Direct TCP/IP tunnel on a registered session
    pub fn tunnel(&self, session: ResourceId, host: &str, port: u16) -> Result<ChannelStream> {
        self.launch_on(session, |target| launcher::open_tunnel(target, host, port))
    }

    /// Copy a remote file to `local`
    pub fn scp_recv(&self, session: ResourceId, remote: &str, local: &Path) -> Result<u64> {
        let target = self.session_target(session)?;
        Ok(self.transfer.receive_file(target.session().as_ref(), remote, local)?)
    }

    /// Copy `local` to a remote file; `mode` defaults to the local permission bits
    pub fn scp_send(&self, session: ResourceId, local: &Path, remote: &str, mode: Option<i32>) -> Result<u64> {
        let target = self.session_target(session)?;
        Ok(self.transfer.send_file(target.session().as_ref(), local, remote, mode)?)
    }

    /// Extended data stream `stream_id` of an open channel stream
    pub fn fetch_stream(&self, parent: &mut dyn StreamOps, stream_id: i32) -> Result<ChannelStream> {
        stream::fetch_stream(parent, stream_id)
    }

    fn session_target(&self, id: ResourceId) -> Result<LaunchTarget> {
        let session = self.registry.session(id)?;
        if !session.authenticated() {
            warn!("Connection not authenticated");
            return Err(SshioError::NotAuthenticated);
        }
        Ok(LaunchTarget::new(session, id, self.registry.clone()).with_max_substreams(self.config.max_substreams))
    }

    fn launch_target(&self, resolved: &Resolved) -> LaunchTarget {
        LaunchTarget::new(resolved.session.clone(), resolved.session_id, self.registry.clone())
            .with_max_substreams(self.config.max_substreams)
    }

    /// The stream now owns the resolved reference; a failed launch gives it back
    fn settle(&self, resolved: Resolved, result: Result<ChannelStream>) -> Result<ChannelStream> {
        if result.is_err() {
            self.give_back(resolved);
        }
        result
    }

    fn give_back(&self, resolved: Resolved) {
        let id = resolved.handle();
        if let Err(e) = resolved.release(&self.registry) {
            warn!("Releasing {} failed: {}", id, e);
        }
    }

    /// Launch on a registered session, holding the reference the stream
    /// releases when it closes; a failed launch gives it back
    fn launch_on<F>(&self, session: ResourceId, launch: F) -> Result<ChannelStream>
    where
        F: FnOnce(&LaunchTarget) -> Result<ChannelStream>,
    {
        let target = self.session_target(session)?;
        let refs = self.registry.add_ref(session)?;
        debug!("Session {} now has {} references", session, refs);

        let result = launch(&target);
        if result.is_err() {
            if let Err(e) = self.registry.release(session) {
                warn!("Releasing {} failed: {}", session, e);
            }
        }
        result
    }
}

/// First path segment, when there is a non-empty one
fn terminal_from_path(path: &str) -> Option<String> {
    let rest = path.strip_prefix('/')?;
    let segment = rest.split('/').next().unwrap_or("");
    if segment.is_empty() {
        None
    } else {
        Some(segment.to_string())
    }
}
