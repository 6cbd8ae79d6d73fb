//! Group router (component G): tracks which `ClientSession`s are registered under each
//! `GroupId` and picks one to dispatch an inbound proxy request to, round-robin, skipping
//! sessions that have gone dead without waiting for their eventual cleanup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rtun_core::error::ErrorKind;
use rtun_core::types::{ClientId, GroupId};
use tokio::sync::RwLock;

/// Anything the router can dispatch a `CONNECT` to. `GatewaySession` implements this;
/// the router itself only needs to know whether a session is worth trying.
pub trait DispatchTarget: Send + Sync + 'static {
    fn client_id(&self) -> &ClientId;
    fn is_alive(&self) -> bool;
}

struct GroupEntry<T> {
    sessions: Vec<Arc<T>>,
    cursor: AtomicUsize,
}

impl<T> GroupEntry<T> {
    fn new() -> Self {
        Self { sessions: Vec::new(), cursor: AtomicUsize::new(0) }
    }
}

/// Registry of live sessions per group, with round-robin dispatch.
pub struct GroupRouter<T> {
    groups: RwLock<HashMap<GroupId, GroupEntry<T>>>,
}

impl<T> Default for GroupRouter<T> {
    fn default() -> Self {
        Self { groups: RwLock::new(HashMap::new()) }
    }
}

impl<T: DispatchTarget> GroupRouter<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, group_id: GroupId, session: Arc<T>) {
        let mut groups = self.groups.write().await;
        groups.entry(group_id).or_insert_with(GroupEntry::new).sessions.push(session);
    }

    pub async fn unregister(&self, group_id: &GroupId, client_id: &ClientId) {
        let mut groups = self.groups.write().await;
        if let Some(entry) = groups.get_mut(group_id) {
            entry.sessions.retain(|s| s.client_id() != client_id);
        }
    }

    pub async fn group_size(&self, group_id: &GroupId) -> usize {
        self.groups.read().await.get(group_id).map_or(0, |e| e.sessions.len())
    }

    /// Picks the next live session in `group_id` by round-robin, retrying up to
    /// `len(sessions)` times to skip over sessions that have died but not yet been
    /// unregistered.
    pub async fn dispatch(&self, group_id: &GroupId) -> Result<Arc<T>, ErrorKind> {
        let groups = self.groups.read().await;
        let entry = groups.get(group_id).ok_or_else(|| ErrorKind::NoClientAvailable { group_id: group_id.to_string() })?;

        let len = entry.sessions.len();
        if len == 0 {
            return Err(ErrorKind::NoClientAvailable { group_id: group_id.to_string() });
        }

        for _ in 0..len {
            let idx = entry.cursor.fetch_add(1, Ordering::Relaxed) % len;
            let candidate = &entry.sessions[idx];
            if candidate.is_alive() {
                return Ok(candidate.clone());
            }
        }

        Err(ErrorKind::NoClientAvailable { group_id: group_id.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct FakeSession {
        id: ClientId,
        alive: AtomicBool,
    }

    impl DispatchTarget for FakeSession {
        fn client_id(&self) -> &ClientId {
            &self.id
        }
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::Relaxed)
        }
    }

    fn session(name: &str) -> Arc<FakeSession> {
        Arc::new(FakeSession { id: ClientId::new(name), alive: AtomicBool::new(true) })
    }

    #[tokio::test]
    async fn round_robins_across_registered_sessions() {
        let router = GroupRouter::new();
        let group = GroupId::new("g1").unwrap();
        router.register(group.clone(), session("a")).await;
        router.register(group.clone(), session("b")).await;

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(router.dispatch(&group).await.unwrap().id.as_str().to_owned());
        }
        assert_eq!(seen, vec!["a", "b", "a", "b"]);
    }

    #[tokio::test]
    async fn skips_dead_sessions_up_to_group_size() {
        let router = GroupRouter::new();
        let group = GroupId::new("g1").unwrap();
        let dead = session("dead");
        dead.alive.store(false, Ordering::Relaxed);
        router.register(group.clone(), dead).await;
        router.register(group.clone(), session("alive")).await;

        for _ in 0..4 {
            assert_eq!(router.dispatch(&group).await.unwrap().id.as_str(), "alive");
        }
    }

    #[tokio::test]
    async fn empty_or_all_dead_group_is_no_client_available() {
        let router: GroupRouter<FakeSession> = GroupRouter::new();
        let group = GroupId::new("empty").unwrap();
        assert!(matches!(router.dispatch(&group).await, Err(ErrorKind::NoClientAvailable { .. })));

        let dead = session("dead");
        dead.alive.store(false, Ordering::Relaxed);
        router.register(group.clone(), dead).await;
        assert!(matches!(router.dispatch(&group).await, Err(ErrorKind::NoClientAvailable { .. })));
    }
}
