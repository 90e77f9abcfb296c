//! Handle table for sessions and SFTP sub-sessions
//!
//! Every live session gets a small integer handle. Handles are reference
//! counted; a slot turns into a tombstone when its count reaches zero and its
//! number is never handed out again. An SFTP entry keeps one reference on the
//! session it was opened over, so releasing the SFTP entry to zero releases
//! the parent as well.

use crate::{Result, SshioError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sshio_transport::{SftpSession, SshSession};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// Prefix used when a handle is rendered as text
pub const RESOURCE_PREFIX: &str = "Resource id #";

/// Shared session handle
pub type SessionRef = Arc<dyn SshSession>;

/// Shared SFTP handle
pub type SftpRef = Arc<dyn SftpSession>;

/// Registry handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(u32);

impl ResourceId {
    /// Numeric value of the handle
    pub fn get(self) -> u32 {
        self.0
    }

    /// Handle for a raw number; the registry decides whether it is live
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", RESOURCE_PREFIX, self.0)
    }
}

impl FromStr for ResourceId {
    type Err = SshioError;

    /// Accepts `N` and `Resource id #N`
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix(RESOURCE_PREFIX).unwrap_or(s);
        digits
            .parse::<u32>()
            .map(Self)
            .map_err(|_| SshioError::InvalidArgument(format!("not a resource id: {:?}", s)))
    }
}

/// An SFTP entry together with the session it runs over
#[derive(Clone)]
pub struct SftpEntry {
    /// SFTP subsystem handle
    pub sftp: SftpRef,
    /// Parent session
    pub session: SessionRef,
    /// Registry handle of the parent session
    pub session_id: ResourceId,
}

enum Slot {
    Session {
        session: SessionRef,
        refs: u32,
    },
    Sftp {
        entry: SftpEntry,
        refs: u32,
    },
    Tombstone,
}

impl Slot {
    fn refs_mut(&mut self) -> Option<&mut u32> {
        match self {
            Slot::Session { refs, .. } | Slot::Sftp { refs, .. } => Some(refs),
            Slot::Tombstone => None,
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: Vec<Slot>,
    generation: u64,
}

impl Inner {
    fn slot_mut(&mut self, id: ResourceId) -> Option<&mut Slot> {
        id.index().and_then(|i| self.slots.get_mut(i))
    }

    fn push(&mut self, slot: Slot) -> ResourceId {
        self.slots.push(slot);
        self.generation += 1;
        ResourceId(self.slots.len() as u32)
    }
}

/// Something dropped by a release, freed after the table lock is gone
enum Freed {
    Sftp(SftpRef),
    Session(SessionRef),
}

/// Reference counted handle table
#[derive(Clone, Default)]
pub struct ResourceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for ResourceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        let live = inner
            .slots
            .iter()
            .filter(|s| !matches!(s, Slot::Tombstone))
            .count();
        f.debug_struct("ResourceRegistry")
            .field("slots", &inner.slots.len())
            .field("live", &live)
            .field("generation", &inner.generation)
            .finish()
    }
}

impl ResourceRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an authenticated session with one reference
    pub fn register_session(&self, session: Box<dyn SshSession>) -> ResourceId {
        let id = self.inner.lock().push(Slot::Session { session: Arc::from(session), refs: 1 });
        debug!("Registered session {}", id);
        id
    }

    /// Register an SFTP sub-session over `session_id`
    ///
    /// The new entry starts with one reference and adds one to its parent.
    pub fn register_sftp(&self, session_id: ResourceId, sftp: Box<dyn SftpSession>) -> Result<ResourceId> {
        let mut inner = self.inner.lock();
        let session = match inner.slot_mut(session_id) {
            Some(Slot::Session { session, refs }) => {
                *refs += 1;
                session.clone()
            }
            _ => return Err(not_found(session_id, "session")),
        };
        let entry = SftpEntry { sftp: Arc::from(sftp), session, session_id };
        let id = inner.push(Slot::Sftp { entry, refs: 1 });
        drop(inner);

        debug!("Registered sftp {} over session {}", id, session_id);
        Ok(id)
    }

    /// Add a reference to a live handle, returning the new count
    pub fn add_ref(&self, id: ResourceId) -> Result<u32> {
        let mut inner = self.inner.lock();
        let refs = inner
            .slot_mut(id)
            .and_then(Slot::refs_mut)
            .ok_or_else(|| not_found(id, "registry"))?;
        *refs += 1;
        let count = *refs;
        inner.generation += 1;
        Ok(count)
    }

    /// Drop one reference, returning what is left on `id`
    ///
    /// At zero the slot becomes a tombstone; an SFTP slot frees its
    /// sub-session and then releases its parent session.
    pub fn release(&self, id: ResourceId) -> Result<u32> {
        let mut freed = Vec::new();
        let remaining = {
            let mut inner = self.inner.lock();
            let remaining = Self::release_locked(&mut inner, id, &mut freed)?;
            inner.generation += 1;
            remaining
        };

        // sub-sessions go before the sessions they run over
        for item in freed {
            match item {
                Freed::Sftp(sftp) => drop(sftp),
                Freed::Session(session) => drop(session),
            }
        }
        Ok(remaining)
    }

    fn release_locked(inner: &mut Inner, id: ResourceId, freed: &mut Vec<Freed>) -> Result<u32> {
        let slot = inner.slot_mut(id).ok_or_else(|| not_found(id, "registry"))?;
        let refs = slot.refs_mut().ok_or_else(|| not_found(id, "registry"))?;
        *refs -= 1;
        if *refs > 0 {
            return Ok(*refs);
        }

        match std::mem::replace(slot, Slot::Tombstone) {
            Slot::Session { session, .. } => {
                debug!("Freeing session {}", id);
                freed.push(Freed::Session(session));
            }
            Slot::Sftp { entry, .. } => {
                debug!("Freeing sftp {}, releasing session {}", id, entry.session_id);
                let SftpEntry { sftp, session, session_id } = entry;
                freed.push(Freed::Sftp(sftp));
                freed.push(Freed::Session(session));
                Self::release_locked(inner, session_id, freed)?;
            }
            Slot::Tombstone => {}
        }
        Ok(0)
    }

    /// Session registered under `id`
    pub fn session(&self, id: ResourceId) -> Result<SessionRef> {
        match self.inner.lock().slot_mut(id) {
            Some(Slot::Session { session, .. }) => Ok(session.clone()),
            _ => Err(not_found(id, "session")),
        }
    }

    /// SFTP entry registered under `id`
    pub fn sftp(&self, id: ResourceId) -> Result<SftpEntry> {
        match self.inner.lock().slot_mut(id) {
            Some(Slot::Sftp { entry, .. }) => Ok(entry.clone()),
            _ => Err(not_found(id, "sftp")),
        }
    }

    /// Current reference count, `None` once freed or never issued
    pub fn ref_count(&self, id: ResourceId) -> Option<u32> {
        self.inner.lock().slot_mut(id).and_then(|s| s.refs_mut().map(|r| *r))
    }

    /// Whether `id` names a live entry
    pub fn is_live(&self, id: ResourceId) -> bool {
        self.ref_count(id).is_some()
    }

    /// Number of live entries
    pub fn live_count(&self) -> usize {
        self.inner
            .lock()
            .slots
            .iter()
            .filter(|s| !matches!(s, Slot::Tombstone))
            .count()
    }

    /// Counter bumped by every mutation
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }
}

fn not_found(id: ResourceId, kind: &'static str) -> SshioError {
    SshioError::ResourceNotFound { id, kind }
}
