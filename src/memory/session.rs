//! Per-session context and the registry that owns live sessions
//!
//! Each session holds its own conversation memory behind its own mutex.
//! Ending a session discards its memory.

use crate::error::{AssistantError, Result};
use crate::memory::ConversationMemory;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Who is chatting, and which records they may see
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserProfile {
    pub display_name: String,
    /// Record owner this user is scoped to; `None` sees every owner
    pub owner: Option<String>,
}

impl UserProfile {
    pub fn admin() -> Self {
        Self {
            display_name: "Admin".to_string(),
            owner: None,
        }
    }

    pub fn owner(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            display_name: name.clone(),
            owner: Some(name),
        }
    }

    pub fn role(&self) -> &'static str {
        if self.owner.is_some() {
            "owner"
        } else {
            "admin"
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::admin()
    }
}

/// State private to one chat session
#[derive(Debug)]
pub struct SessionContext {
    pub session_id: Uuid,
    pub profile: UserProfile,
    pub memory: ConversationMemory,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(profile: UserProfile, max_turns: usize) -> Self {
        Self::with_id(Uuid::new_v4(), profile, max_turns)
    }

    pub fn with_id(session_id: Uuid, profile: UserProfile, max_turns: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            profile,
            memory: ConversationMemory::new(max_turns),
            created_at: now,
            last_active: now,
        }
    }

    pub fn touch(&mut self) {
        self.last_active = Utc::now();
    }
}

pub type SharedSession = Arc<Mutex<SessionContext>>;

/// Live sessions keyed by id
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SharedSession>>,
    max_turns: usize,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(max_turns: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_turns,
            idle_timeout,
        }
    }

    /// Start a new session and return its id
    pub async fn create(&self, profile: UserProfile) -> Uuid {
        self.prune_idle().await;

        let context = SessionContext::new(profile, self.max_turns);
        let session_id = context.session_id;

        self.sessions
            .write()
            .await
            .insert(session_id, Arc::new(Mutex::new(context)));

        info!(%session_id, "Session created");
        session_id
    }

    pub async fn get(&self, session_id: Uuid) -> Option<SharedSession> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Fetch a session, creating it under the given id if absent.
    ///
    /// An existing session is only handed out to the same owner scope it was
    /// created for; anything else is a `SessionConflict`.
    pub async fn get_or_create(&self, session_id: Uuid, profile: UserProfile) -> Result<SharedSession> {
        if let Some(session) = self.get(session_id).await {
            return Self::claim(session_id, session, &profile).await;
        }

        self.prune_idle().await;

        let mut locked = self.sessions.write().await;
        if let Some(session) = locked.get(&session_id).cloned() {
            drop(locked);
            return Self::claim(session_id, session, &profile).await;
        }

        info!(%session_id, "Session created");
        let session = Arc::new(Mutex::new(SessionContext::with_id(
            session_id,
            profile,
            self.max_turns,
        )));
        locked.insert(session_id, session.clone());
        Ok(session)
    }

    async fn claim(session_id: Uuid, session: SharedSession, profile: &UserProfile) -> Result<SharedSession> {
        let owner_matches = session.lock().await.profile.owner == profile.owner;
        if owner_matches {
            Ok(session)
        } else {
            warn!(%session_id, "Session requested under a different owner scope");
            Err(AssistantError::SessionConflict(session_id))
        }
    }

    /// End a session, discarding its memory. Returns false if unknown.
    pub async fn end(&self, session_id: Uuid) -> bool {
        let removed = self.sessions.write().await.remove(&session_id).is_some();
        if removed {
            info!(%session_id, "Session ended");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop sessions idle for longer than the timeout. Sessions currently
    /// handling a request are skipped.
    pub async fn prune_idle(&self) -> usize {
        let Ok(idle) = chrono::Duration::from_std(self.idle_timeout) else {
            return 0;
        };
        let cutoff = Utc::now() - idle;

        let mut locked = self.sessions.write().await;
        let before = locked.len();
        locked.retain(|_, session| match session.try_lock() {
            Ok(context) => context.last_active >= cutoff,
            Err(_) => true,
        });

        let pruned = before - locked.len();
        if pruned > 0 {
            debug!(pruned, "Pruned idle sessions");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::ConversationTurn;

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let registry = SessionRegistry::new(10, Duration::from_secs(3600));
        let a = registry.create(UserProfile::owner("Kumaran V")).await;
        let b = registry.create(UserProfile::owner("Soniya M")).await;

        {
            let session = registry.get(a).await.unwrap();
            let mut ctx = session.lock().await;
            ctx.memory.append(ConversationTurn::user("Acme Corp status?"));
        }

        let session_b = registry.get(b).await.unwrap();
        let ctx_b = session_b.lock().await;
        assert_eq!(ctx_b.memory.recent(10).count(), 0);

        let session_a = registry.get(a).await.unwrap();
        assert_eq!(session_a.lock().await.memory.recent(10).count(), 1);
    }

    #[tokio::test]
    async fn test_end_discards_session() {
        let registry = SessionRegistry::new(10, Duration::from_secs(3600));
        let id = registry.create(UserProfile::admin()).await;

        assert!(registry.end(id).await);
        assert!(registry.get(id).await.is_none());
        assert!(!registry.end(id).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_session() {
        let registry = SessionRegistry::new(10, Duration::from_secs(3600));
        let id = Uuid::new_v4();

        let first = registry.get_or_create(id, UserProfile::owner("Ram Kumar")).await.unwrap();
        first.lock().await.memory.append(ConversationTurn::user("hello"));

        let mut renamed = UserProfile::owner("Ram Kumar");
        renamed.display_name = "Ram".to_string();
        let second = registry.get_or_create(id, renamed).await.unwrap();
        let ctx = second.lock().await;
        assert_eq!(ctx.memory.len(), 1);
        assert_eq!(ctx.profile.display_name, "Ram Kumar");
    }

    #[tokio::test]
    async fn test_get_or_create_rejects_other_owner() {
        let registry = SessionRegistry::new(10, Duration::from_secs(3600));
        let id = Uuid::new_v4();

        let first = registry.get_or_create(id, UserProfile::owner("Kumaran V")).await.unwrap();
        first.lock().await.memory.append(ConversationTurn::user("Acme pipeline?"));

        let err = registry
            .get_or_create(id, UserProfile::owner("Soniya M"))
            .await
            .unwrap_err();
        assert!(matches!(err, AssistantError::SessionConflict(found) if found == id));
        assert!(registry.get_or_create(id, UserProfile::admin()).await.is_err());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_get_or_create_prunes_idle_sessions() {
        let registry = SessionRegistry::new(10, Duration::from_millis(1));
        for _ in 0..50 {
            registry.get_or_create(Uuid::new_v4(), UserProfile::admin()).await.unwrap();
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        let id = Uuid::new_v4();
        registry.get_or_create(id, UserProfile::admin()).await.unwrap();

        assert_eq!(registry.len().await, 1);
        assert!(registry.get(id).await.is_some());
    }

    #[tokio::test]
    async fn test_prune_idle() {
        let registry = SessionRegistry::new(10, Duration::from_secs(60));
        let stale = registry.create(UserProfile::admin()).await;
        let fresh = registry.create(UserProfile::admin()).await;

        registry.get(stale).await.unwrap().lock().await.last_active =
            Utc::now() - chrono::Duration::minutes(5);

        assert_eq!(registry.prune_idle().await, 1);
        assert!(registry.get(stale).await.is_none());
        assert!(registry.get(fresh).await.is_some());
    }

    #[test]
    fn test_profile_roles() {
        assert_eq!(UserProfile::admin().role(), "admin");
        assert_eq!(UserProfile::owner("Manoj R").role(), "owner");
    }
}
