//! Space membership collaborator
//!
//! The signaling registry consults a [`MembershipStore`] before admitting a
//! participant into a space. Two implementations are provided: a SQLite store
//! sharing the configuration database, and an in-memory store.

mod sqlite;

pub use sqlite::SqliteMembershipStore;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::signaling::Role;

/// Space settings relevant to admission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceRecord {
    pub id: String,
    pub name: String,
    /// Public spaces auto-enroll participants whose role is allowed
    pub is_public: bool,
    pub allow_humans: bool,
    pub allow_agents: bool,
}

impl SpaceRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_public: false,
            allow_humans: true,
            allow_agents: true,
        }
    }

    pub fn public(mut self) -> Self {
        self.is_public = true;
        self
    }

    /// Whether the space settings admit this role
    pub fn allows(&self, role: Role) -> bool {
        match role {
            Role::Human => self.allow_humans,
            Role::Agent => self.allow_agents,
        }
    }
}

/// Membership store consulted on join and on activity
#[async_trait]
pub trait MembershipStore: Send + Sync {
    async fn find_space(&self, space_id: &str) -> Result<Option<SpaceRecord>>;
    async fn is_member(&self, space_id: &str, participant_id: &str) -> Result<bool>;
    async fn add_member(&self, space_id: &str, participant_id: &str, role: Role) -> Result<()>;
    async fn touch_last_active(&self, space_id: &str, participant_id: &str) -> Result<()>;
}

/// In-memory membership store
#[derive(Default)]
pub struct MemoryMembershipStore {
    spaces: RwLock<HashMap<String, SpaceRecord>>,
    members: RwLock<HashMap<String, HashSet<String>>>,
    touches: RwLock<HashMap<(String, String), u64>>,
}

impl MemoryMembershipStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_space(&self, space: SpaceRecord) {
        self.spaces.write().insert(space.id.clone(), space);
    }

    pub fn insert_member(&self, space_id: &str, participant_id: &str) {
        self.members
            .write()
            .entry(space_id.to_string())
            .or_default()
            .insert(participant_id.to_string());
    }

    /// Number of activity touches recorded for a participant
    pub fn touch_count(&self, space_id: &str, participant_id: &str) -> u64 {
        self.touches
            .read()
            .get(&(space_id.to_string(), participant_id.to_string()))
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl MembershipStore for MemoryMembershipStore {
    async fn find_space(&self, space_id: &str) -> Result<Option<SpaceRecord>> {
        Ok(self.spaces.read().get(space_id).cloned())
    }

    async fn is_member(&self, space_id: &str, participant_id: &str) -> Result<bool> {
        Ok(self
            .members
            .read()
            .get(space_id)
            .is_some_and(|m| m.contains(participant_id)))
    }

    async fn add_member(&self, space_id: &str, participant_id: &str, _role: Role) -> Result<()> {
        self.insert_member(space_id, participant_id);
        Ok(())
    }

    async fn touch_last_active(&self, space_id: &str, participant_id: &str) -> Result<()> {
        *self
            .touches
            .write()
            .entry((space_id.to_string(), participant_id.to_string()))
            .or_insert(0) += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_allows_roles() {
        let mut space = SpaceRecord::new("s1", "Lobby");
        space.allow_agents = false;
        assert!(space.allows(Role::Human));
        assert!(!space.allows(Role::Agent));
    }

    #[tokio::test]
    async fn test_memory_store_membership() {
        let store = MemoryMembershipStore::new();
        store.insert_space(SpaceRecord::new("s1", "Lobby"));

        assert!(!store.is_member("s1", "alice").await.unwrap());
        store.add_member("s1", "alice", Role::Human).await.unwrap();
        assert!(store.is_member("s1", "alice").await.unwrap());
        assert!(!store.is_member("s2", "alice").await.unwrap());

        store.touch_last_active("s1", "alice").await.unwrap();
        store.touch_last_active("s1", "alice").await.unwrap();
        assert_eq!(store.touch_count("s1", "alice"), 2);
    }
}
