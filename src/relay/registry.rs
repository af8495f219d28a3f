//! # Session Registry
//!
//! Process-wide map from call identifier to live [`CallSession`]. Calls enter when
//! the telephony socket is accepted and leave during teardown.
//!
//! ## Guarantees:
//! - **Bounded**: refuses new calls at the configured capacity
//! - **Unique ids**: a rebind never overwrites another live call
//! - **Owner-checked removal**: removing a session never evicts a different
//!   session that happens to share its id

use crate::relay::session::{CallSession, CallSnapshot, TelephonyHandle};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use uuid::Uuid;

/// Why a call could not be registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Already at `max_calls` live sessions
    AtCapacity { max_calls: usize },
    /// Another live session owns this id
    DuplicateId(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::AtCapacity { max_calls } => {
                write!(f, "Maximum concurrent calls ({}) reached", max_calls)
            }
            RegistryError::DuplicateId(id) => write!(f, "Call ID '{}' already exists", id),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Result of [`SessionRegistry::rebind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rebind {
    /// The session is now stored under the new id
    Rebound { previous: String },
    /// The session already carries this id
    Unchanged,
    /// The session already has a carrier-assigned id and keeps it
    AlreadyBound { current: String },
    /// Another live call owns the requested id
    Conflict,
    /// The session is no longer registered
    NotRegistered,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<CallSession>>>,
    max_calls: usize,
}

impl SessionRegistry {
    pub fn new(max_calls: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_calls,
        }
    }

    /// Create and register a session under a generated provisional id.
    pub fn open(&self, telephony: TelephonyHandle) -> Result<Arc<CallSession>, RegistryError> {
        let session = Arc::new(CallSession::new(Uuid::new_v4().to_string(), telephony));
        self.insert(session.clone())?;
        Ok(session)
    }

    /// Register an existing session under its current id.
    pub fn insert(&self, session: Arc<CallSession>) -> Result<(), RegistryError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);

        if sessions.len() >= self.max_calls {
            return Err(RegistryError::AtCapacity { max_calls: self.max_calls });
        }

        let id = session.id();
        if sessions.contains_key(&id) {
            return Err(RegistryError::DuplicateId(id));
        }

        sessions.insert(id, session);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<CallSession>> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(id).cloned()
    }

    /// Remove `session` if it is still the one registered under its id.
    ///
    /// Returns `true` only for the call that actually removed it.
    pub fn remove(&self, session: &Arc<CallSession>) -> bool {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let id = session.id();
        match sessions.get(&id) {
            Some(existing) if Arc::ptr_eq(existing, session) => {
                sessions.remove(&id);
                true
            }
            _ => false,
        }
    }

    /// Move `session` to the carrier-assigned `new_id`, atomically.
    ///
    /// The id is bound at most once; a session never takes an id another live
    /// call already holds.
    pub fn rebind(&self, session: &Arc<CallSession>, new_id: &str) -> Rebind {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let current = session.id();

        if current == new_id {
            return Rebind::Unchanged;
        }
        if session.is_id_bound() {
            return Rebind::AlreadyBound { current };
        }
        match sessions.get(&current) {
            Some(existing) if Arc::ptr_eq(existing, session) => {}
            _ => return Rebind::NotRegistered,
        }
        if sessions.contains_key(new_id) {
            return Rebind::Conflict;
        }

        sessions.remove(&current);
        session.bind_id(new_id.to_string());
        sessions.insert(new_id.to_string(), session.clone());
        Rebind::Rebound { previous: current }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_calls
    }

    /// Snapshots of every live call, oldest first.
    pub fn snapshots(&self) -> Vec<CallSnapshot> {
        let sessions: Vec<Arc<CallSession>> = {
            let guard = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
            guard.values().cloned().collect()
        };
        let mut snapshots: Vec<CallSnapshot> = sessions.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by_key(|s| s.started_at);
        snapshots
    }

    /// Ask every live call to tear down.
    pub fn close_all(&self) -> usize {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            session.request_close();
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn handle() -> TelephonyHandle {
        let (tx, _rx) = mpsc::unbounded_channel();
        TelephonyHandle::new(tx)
    }

    #[test]
    fn test_open_get_remove() {
        let registry = SessionRegistry::new(4);
        let session = registry.open(handle()).unwrap();
        let id = session.id();

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&id).unwrap(), &session));

        assert!(registry.remove(&session));
        assert!(!registry.remove(&session));
        assert!(registry.get(&id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let registry = SessionRegistry::new(2);
        let first = registry.open(handle()).unwrap();
        registry.open(handle()).unwrap();

        assert!(registry.is_full());
        assert!(matches!(
            registry.open(handle()),
            Err(RegistryError::AtCapacity { max_calls: 2 })
        ));

        registry.remove(&first);
        assert!(registry.open(handle()).is_ok());
    }

    #[test]
    fn test_rebind_moves_entry() {
        let registry = SessionRegistry::new(4);
        let session = registry.open(handle()).unwrap();
        let provisional = session.id();

        assert_eq!(
            registry.rebind(&session, "ucid-42"),
            Rebind::Rebound { previous: provisional.clone() }
        );
        assert_eq!(session.id(), "ucid-42");
        assert!(session.is_id_bound());
        assert!(registry.get(&provisional).is_none());
        assert!(Arc::ptr_eq(&registry.get("ucid-42").unwrap(), &session));
        assert_eq!(registry.len(), 1);

        assert_eq!(registry.rebind(&session, "ucid-42"), Rebind::Unchanged);
        assert_eq!(
            registry.rebind(&session, "ucid-43"),
            Rebind::AlreadyBound { current: "ucid-42".to_string() }
        );
    }

    #[test]
    fn test_rebind_refuses_live_id() {
        let registry = SessionRegistry::new(4);
        let owner = registry.open(handle()).unwrap();
        registry.rebind(&owner, "ucid-1");

        let other = registry.open(handle()).unwrap();
        let other_id = other.id();
        assert_eq!(registry.rebind(&other, "ucid-1"), Rebind::Conflict);

        assert_eq!(other.id(), other_id);
        assert!(Arc::ptr_eq(&registry.get("ucid-1").unwrap(), &owner));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_ignores_impostor_with_same_id() {
        let registry = SessionRegistry::new(4);
        let session = registry.open(handle()).unwrap();
        let impostor = Arc::new(CallSession::new(session.id(), handle()));

        assert!(!registry.remove(&impostor));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.rebind(&impostor, "x"), Rebind::NotRegistered);
    }

    #[test]
    fn test_snapshots_are_oldest_first() {
        let registry = SessionRegistry::new(4);
        let a = registry.open(handle()).unwrap();
        let b = registry.open(handle()).unwrap();

        let snapshots = registry.snapshots();
        assert_eq!(snapshots.len(), 2);
        let mut ids: Vec<String> = snapshots.iter().map(|s| s.call_id.clone()).collect();
        ids.sort();
        let mut expected = vec![a.id(), b.id()];
        expected.sort();
        assert_eq!(ids, expected);
        assert!(snapshots[0].started_at <= snapshots[1].started_at);
    }
}
