use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use serde::Serialize;
use tokio::net::TcpStream;

use crate::narwhal::telemetry;
use crate::narwhal::tunnel::{acl::PortRule, bind::PairingQueue};

/// An authenticated control session, as seen by the registry and by the
/// data connections that refer to it by auth context.
pub struct Session {
    pub sid: String,
    pub uid: String,
    pub remote: String,
    pub started_at_unix_ms: u64,
    bound_port: OnceLock<u16>,
    pairing: Arc<PairingQueue<TcpStream>>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("sid", &self.sid)
            .field("uid", &self.uid)
            .field("bound_port", &self.bound_port.get())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(sid: String, uid: String, remote: String, pairing_capacity: usize) -> Self {
        Self {
            sid,
            uid,
            remote,
            started_at_unix_ms: telemetry::now_unix_ms(),
            bound_port: OnceLock::new(),
            pairing: Arc::new(PairingQueue::new(pairing_capacity)),
        }
    }

    pub fn pairing(&self) -> &Arc<PairingQueue<TcpStream>> {
        &self.pairing
    }

    pub fn bound_port(&self) -> Option<u16> {
        self.bound_port.get().copied()
    }

    pub fn set_bound_port(&self, port: u16) {
        let _ = self.bound_port.set(port);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub sid: String,
    pub uid: String,
    pub remote: String,
    pub bound_port: Option<u16>,
    pub pending_pairings: usize,
    pub started_at_unix_ms: u64,
}

#[derive(Default)]
struct State {
    contexts: HashMap<String, Arc<Session>>,
    rules: HashMap<String, Arc<PortRule>>,
}

/// Known users, their port rules, and the auth contexts issued to live
/// sessions. Contexts and the parsed-rule cache share one lock.
pub struct AuthRegistry {
    users: HashMap<String, String>,
    state: Mutex<State>,
}

impl std::fmt::Debug for AuthRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthRegistry")
            .field("users", &self.users.len())
            .finish_non_exhaustive()
    }
}

impl AuthRegistry {
    /// `users` maps uid to its port rule string.
    pub fn new(users: HashMap<String, String>) -> Self {
        Self {
            users,
            state: Mutex::new(State::default()),
        }
    }

    pub fn authenticate(&self, uid: &str) -> bool {
        self.users.contains_key(uid)
    }

    /// 128 bits from the thread-local CSPRNG, hex encoded.
    pub fn generate_context() -> String {
        format!("{:032x}", rand::random::<u128>())
    }

    pub fn allows(&self, uid: &str, port: u16) -> bool {
        let Some(raw) = self.users.get(uid) else {
            return false;
        };
        let rule = self
            .lock()
            .rules
            .entry(uid.to_string())
            .or_insert_with(|| Arc::new(PortRule::parse(raw)))
            .clone();
        rule.allows(port)
    }

    pub fn register(&self, context: String, session: Arc<Session>) {
        self.lock().contexts.insert(context, session);
    }

    pub fn lookup(&self, context: &str) -> Option<Arc<Session>> {
        self.lock().contexts.get(context).cloned()
    }

    pub fn remove(&self, context: &str) -> Option<Arc<Session>> {
        self.lock().contexts.remove(context)
    }

    pub fn len(&self) -> usize {
        self.lock().contexts.len()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let st = self.lock();
        let mut out: Vec<SessionSnapshot> = st
            .contexts
            .values()
            .map(|s| SessionSnapshot {
                sid: s.sid.clone(),
                uid: s.uid.clone(),
                remote: s.remote.clone(),
                bound_port: s.bound_port(),
                pending_pairings: s.pairing.len(),
                started_at_unix_ms: s.started_at_unix_ms,
            })
            .collect();
        drop(st);
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
