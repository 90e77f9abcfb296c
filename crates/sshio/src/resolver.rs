//! Identifier to session resolution
//!
//! A [`Resolver`] walks an ordered list of [`ResolveStrategy`] values until
//! one of them produces a session:
//!
//! 1. [`ResourceIdStrategy`] reuses the handle named in the identifier's host.
//! 2. [`ContextHandleStrategy`] reuses a handle from the [`Context`] when the
//!    identifier has no host.
//! 3. [`ConnectStrategy`] connects and authenticates a new session.
//!
//! Every successful resolution hands the caller exactly one registry
//! reference: on the SFTP handle when one was requested, on the session
//! otherwise. A failed resolution leaves the registry as it found it.

use crate::context::Context;
use crate::path::ResourcePath;
use crate::registry::{ResourceId, ResourceRegistry, SessionRef, SftpRef};
use crate::{Result, SshioError};
use serde::{Deserialize, Serialize};
use sshio_transport::{SshConfig, SshSession, Transport};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Channel family an identifier is resolved for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WrapperKind {
    /// Interactive shell
    Shell,
    /// Remote command
    Exec,
    /// SCP download stream
    Scp,
    /// Direct TCP/IP forward
    Tunnel,
}

impl WrapperKind {
    /// Type part of the scheme
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Shell => "shell",
            Self::Exec => "exec",
            Self::Scp => "scp",
            Self::Tunnel => "tunnel",
        }
    }
}

impl fmt::Display for WrapperKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where key files may be read from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyAccessPolicy {
    allowed_dirs: Option<Vec<PathBuf>>,
}

impl KeyAccessPolicy {
    /// Allow key files anywhere
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Allow key files only below `dirs`
    pub fn restricted_to(dirs: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self { allowed_dirs: Some(dirs.into_iter().map(Into::into).collect()) }
    }

    /// Check one key file against the policy
    pub fn check(&self, file: &Path) -> Result<()> {
        let dirs = match &self.allowed_dirs {
            Some(dirs) => dirs,
            None => return Ok(()),
        };
        let file = normalize(file);
        let allowed = dirs.iter().any(|dir| file.starts_with(normalize(dir)));
        if allowed {
            Ok(())
        } else {
            Err(SshioError::AccessDenied(file.display().to_string()))
        }
    }
}

/// Canonical form of `path`, resolving through the parent for files that do not exist yet
fn normalize(path: &Path) -> PathBuf {
    if let Ok(canonical) = path.canonicalize() {
        return canonical;
    }
    match (path.parent().and_then(|p| p.canonicalize().ok()), path.file_name()) {
        (Some(parent), Some(name)) => parent.join(name),
        _ => path.to_path_buf(),
    }
}

/// An SFTP handle held by a resolution
#[derive(Clone)]
pub struct SftpHandle {
    /// Registry handle
    pub id: ResourceId,
    /// The sub-session
    pub sftp: SftpRef,
}

/// Outcome of a successful resolution
pub struct Resolved {
    /// Parsed identifier
    pub path: ResourcePath,
    /// Session to open channels on
    pub session: SessionRef,
    /// Registry handle of `session`
    pub session_id: ResourceId,
    /// SFTP sub-session, when one was requested
    pub sftp: Option<SftpHandle>,
}

impl fmt::Debug for Resolved {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolved")
            .field("path", &self.path)
            .field("session_id", &self.session_id)
            .field("sftp", &self.sftp.as_ref().map(|s| s.id))
            .finish()
    }
}

impl Resolved {
    /// Handle carrying the caller's reference
    pub fn handle(&self) -> ResourceId {
        self.sftp.as_ref().map_or(self.session_id, |s| s.id)
    }

    /// Give the caller's reference back
    pub fn release(self, registry: &ResourceRegistry) -> Result<u32> {
        registry.release(self.handle())
    }
}

/// Session and optional SFTP handle produced by a strategy
pub struct Handles {
    /// Session to open channels on
    pub session: SessionRef,
    /// Registry handle of `session`
    pub session_id: ResourceId,
    /// SFTP sub-session, when one was requested
    pub sftp: Option<SftpHandle>,
}

/// What a strategy gets to look at
#[derive(Debug)]
pub struct ResolveRequest<'a> {
    /// Parsed identifier
    pub path: &'a ResourcePath,
    /// Whether the caller wants an SFTP sub-session
    pub want_sftp: bool,
    /// Ambient options
    pub context: &'a Context,
}

/// One step of the resolution chain
///
/// `Ok(None)` passes to the next strategy; an error ends resolution.
pub trait ResolveStrategy: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &'static str;

    /// Try to produce handles for `request`
    fn attempt(&self, resolver: &Resolver, request: &ResolveRequest<'_>) -> Result<Option<Handles>>;
}

/// Reuses the handle spelled in the identifier's host
#[derive(Debug, Default)]
pub struct ResourceIdStrategy;

impl ResolveStrategy for ResourceIdStrategy {
    fn name(&self) -> &'static str {
        "resource id"
    }

    fn attempt(&self, resolver: &Resolver, request: &ResolveRequest<'_>) -> Result<Option<Handles>> {
        let id = match request.path.resource() {
            Some(id) => id,
            None => return Ok(None),
        };
        if request.want_sftp {
            if let Some(handles) = reuse_sftp(resolver.registry(), id)? {
                return Ok(Some(handles));
            }
        }
        reuse_session(resolver.registry(), id, request.want_sftp).map(Some)
    }
}

/// Reuses the `sftp` or `session` handle of the context
///
/// Only consulted when the identifier has no host.
#[derive(Debug, Default)]
pub struct ContextHandleStrategy;

impl ResolveStrategy for ContextHandleStrategy {
    fn name(&self) -> &'static str {
        "context handle"
    }

    fn attempt(&self, resolver: &Resolver, request: &ResolveRequest<'_>) -> Result<Option<Handles>> {
        if !request.path.host().is_empty() {
            return Ok(None);
        }
        if request.want_sftp {
            if let Some(id) = request.context.sftp {
                match reuse_sftp(resolver.registry(), id)? {
                    Some(handles) => return Ok(Some(handles)),
                    // a stale sftp handle defers to the session handle
                    None if request.context.session.is_some() => {
                        debug!("Context sftp {} is not an sftp handle, trying the session", id)
                    }
                    None => return Err(SshioError::ResourceNotFound { id, kind: "sftp" }),
                }
            }
        }
        match request.context.session {
            Some(id) => reuse_session(resolver.registry(), id, request.want_sftp).map(Some),
            None => Ok(None),
        }
    }
}

/// Connects and authenticates a new session
#[derive(Debug, Default)]
pub struct ConnectStrategy;

impl ResolveStrategy for ConnectStrategy {
    fn name(&self) -> &'static str {
        "connect"
    }

    fn attempt(&self, resolver: &Resolver, request: &ResolveRequest<'_>) -> Result<Option<Handles>> {
        let path = request.path;
        let login = Login { user: path.user(), pass: path.pass() };
        resolver
            .open_session(path.host(), path.port_or_default(), login, request.context, request.want_sftp)
            .map(Some)
    }
}

/// Credentials spelled in the identifier; they win over the context
#[derive(Debug, Clone, Copy, Default)]
struct Login<'a> {
    user: Option<&'a str>,
    pass: Option<&'a str>,
}

fn authenticate(
    session: &dyn SshSession,
    username: &str,
    password: Option<&str>,
    keys: Option<(&Path, &Path)>,
) -> Result<()> {
    if let Some((public, private)) = keys {
        match session.userauth_pubkey_file(username, public, private, password) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Public key authentication failed for {}: {}", username, e),
        }
    }
    if let Some(password) = password {
        match session.userauth_password(username, password) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Password authentication failed for {}: {}", username, e),
        }
    }
    Err(SshioError::Auth(format!("Unable to login as {}", username)))
}

/// SFTP entry `id`, with one more reference, if `id` is one
fn reuse_sftp(registry: &ResourceRegistry, id: ResourceId) -> Result<Option<Handles>> {
    let entry = match registry.sftp(id) {
        Ok(entry) => entry,
        Err(_) => return Ok(None),
    };
    registry.add_ref(id)?;
    debug!("Reusing sftp {} over session {}", id, entry.session_id);
    Ok(Some(Handles {
        session: entry.session,
        session_id: entry.session_id,
        sftp: Some(SftpHandle { id, sftp: entry.sftp }),
    }))
}

/// Session `id`; with `want_sftp` a fresh SFTP entry holds the new reference
fn reuse_session(registry: &ResourceRegistry, id: ResourceId, want_sftp: bool) -> Result<Handles> {
    let session = registry.session(id)?;
    if !session.authenticated() {
        return Err(SshioError::NotAuthenticated);
    }

    if want_sftp {
        let sftp = session.sftp()?;
        let sftp_id = registry.register_sftp(id, sftp)?;
        let sftp = registry.sftp(sftp_id)?.sftp;
        debug!("Opened sftp {} over session {}", sftp_id, id);
        return Ok(Handles { session, session_id: id, sftp: Some(SftpHandle { id: sftp_id, sftp }) });
    }

    registry.add_ref(id)?;
    debug!("Reusing session {}", id);
    Ok(Handles { session, session_id: id, sftp: None })
}

/// Releases a handle unless disarmed
struct Rollback<'a> {
    registry: &'a ResourceRegistry,
    id: Option<ResourceId>,
}

impl<'a> Rollback<'a> {
    fn new(registry: &'a ResourceRegistry, id: ResourceId) -> Self {
        Self { registry, id: Some(id) }
    }

    fn disarm(&mut self) {
        self.id = None;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            debug!("Rolling back {}", id);
            if let Err(e) = self.registry.release(id) {
                warn!("Rollback of {} failed: {}", id, e);
            }
        }
    }
}

/// Turns identifiers into sessions
pub struct Resolver {
    transport: Arc<dyn Transport>,
    registry: ResourceRegistry,
    family: String,
    policy: KeyAccessPolicy,
    connect_timeout: Duration,
    strategies: Vec<Box<dyn ResolveStrategy>>,
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("family", &self.family)
            .field("policy", &self.policy)
            .field("connect_timeout", &self.connect_timeout)
            .field("strategies", &self.strategies.iter().map(|s| s.name()).collect::<Vec<_>>())
            .finish()
    }
}

impl Resolver {
    /// Resolver for the `ssh2` family with the default strategy chain
    pub fn new(transport: Arc<dyn Transport>, registry: ResourceRegistry) -> Self {
        Self {
            transport,
            registry,
            family: "ssh2".to_string(),
            policy: KeyAccessPolicy::allow_all(),
            connect_timeout: Duration::from_secs(30),
            strategies: vec![
                Box::new(ResourceIdStrategy),
                Box::new(ContextHandleStrategy),
                Box::new(ConnectStrategy),
            ],
        }
    }

    /// Scheme family to accept
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = family.into();
        self
    }

    /// Key file access policy
    pub fn with_policy(mut self, policy: KeyAccessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// TCP connect timeout for fresh sessions
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Replace the strategy chain
    pub fn with_strategies(mut self, strategies: Vec<Box<dyn ResolveStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Registry handles are issued from
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    /// Accepted scheme family
    pub fn family(&self) -> &str {
        &self.family
    }

    /// Connect, authenticate and register a new session
    ///
    /// The returned handle carries one reference.
    pub fn connect(&self, host: &str, port: u16, context: &Context) -> Result<ResourceId> {
        self.open_session(host, port, Login::default(), context, false)
            .map(|handles| handles.session_id)
            .map_err(|e| {
                warn!("Unable to connect to {}:{}: {}", host, port, e);
                e
            })
    }

    fn open_session(
        &self,
        host: &str,
        port: u16,
        login: Login<'_>,
        context: &Context,
        want_sftp: bool,
    ) -> Result<Handles> {
        if host.is_empty() {
            return Err(SshioError::Resolve("No host specified".to_string()));
        }

        let username = login
            .user
            .or(context.username.as_deref())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SshioError::Resolve("Username required".to_string()))?;
        let password = login.pass.or(context.password.as_deref());
        let keys = match (&context.pubkey_file, &context.privkey_file) {
            (Some(public), Some(private)) => Some((public.as_path(), private.as_path())),
            _ => None,
        };
        if keys.is_none() && password.is_none() {
            return Err(SshioError::Auth(format!("No credentials supplied for {}", username)));
        }
        if let Some((public, private)) = keys {
            self.policy.check(public)?;
            self.policy.check(private)?;
        }

        let config = SshConfig {
            host: host.to_string(),
            port,
            methods: context.methods.clone(),
            callbacks: context.callbacks.clone(),
            connect_timeout: self.connect_timeout,
        };
        info!("Connecting to {}:{}", config.host, config.port);
        let session = self.transport.connect(&config).map_err(|e| {
            SshioError::Resolve(format!("Unable to connect to {}:{}: {}", config.host, config.port, e))
        })?;

        authenticate(session.as_ref(), username, password, keys)?;
        debug!("Authenticated as {} on {}:{}", username, config.host, config.port);

        let session_id = self.registry.register_session(session);
        let mut guard = Rollback::new(&self.registry, session_id);
        let session = self.registry.session(session_id)?;

        let sftp = if want_sftp {
            let sftp = session.sftp()?;
            let sftp_id = self.registry.register_sftp(session_id, sftp)?;
            let sftp = self.registry.sftp(sftp_id)?.sftp;
            // the SFTP entry now holds the session; the caller holds the SFTP entry
            self.registry.release(session_id)?;
            Some(SftpHandle { id: sftp_id, sftp })
        } else {
            None
        };

        guard.disarm();
        Ok(Handles { session, session_id, sftp })
    }

    /// Resolve `identifier` for `kind`
    ///
    /// A different family or type yields [`SshioError::NotMine`] without
    /// touching the registry.
    pub fn resolve(
        &self,
        identifier: &str,
        kind: WrapperKind,
        want_sftp: bool,
        context: &Context,
    ) -> Result<Resolved> {
        let path = ResourcePath::parse_for(identifier, &self.family, kind.as_str())?;
        let request = ResolveRequest { path: &path, want_sftp, context };

        for strategy in &self.strategies {
            match strategy.attempt(self, &request) {
                Ok(Some(handles)) => {
                    debug!("Resolved {} via {}", handles.session_id, strategy.name());
                    return Ok(Resolved {
                        path,
                        session: handles.session,
                        session_id: handles.session_id,
                        sftp: handles.sftp,
                    });
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!("Unable to resolve {}://{}: {}", kind, path.host(), e);
                    return Err(e);
                }
            }
        }
        Err(SshioError::Resolve(format!("No session available for {}", path.host())))
    }
}

#[cfg(test)]
mod tests;
