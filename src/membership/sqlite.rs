use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Pool, Sqlite};

use super::{MembershipStore, SpaceRecord};
use crate::error::Result;
use crate::signaling::Role;

/// Membership store backed by SQLite
#[derive(Clone)]
pub struct SqliteMembershipStore {
    pool: Pool<Sqlite>,
}

impl SqliteMembershipStore {
    /// Create a new membership store on an existing pool
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create the `spaces` and `space_members` tables
    pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS spaces (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                is_public INTEGER NOT NULL DEFAULT 0,
                allow_humans INTEGER NOT NULL DEFAULT 1,
                allow_agents INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS space_members (
                space_id TEXT NOT NULL,
                participant_id TEXT NOT NULL,
                role TEXT NOT NULL,
                joined_at TEXT NOT NULL,
                last_active_at TEXT,
                PRIMARY KEY (space_id, participant_id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Insert or replace a space record
    pub async fn upsert_space(&self, space: &SpaceRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO spaces (id, name, is_public, allow_humans, allow_agents)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO UPDATE SET
                name = ?2, is_public = ?3, allow_humans = ?4, allow_agents = ?5
            "#,
        )
        .bind(&space.id)
        .bind(&space.name)
        .bind(space.is_public)
        .bind(space.allow_humans)
        .bind(space.allow_agents)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Last activity timestamp (RFC 3339) of a member
    pub async fn last_active(&self, space_id: &str, participant_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> = sqlx::query_as(
            "SELECT last_active_at FROM space_members WHERE space_id = ?1 AND participant_id = ?2",
        )
        .bind(space_id)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(ts,)| ts))
    }
}

#[async_trait]
impl MembershipStore for SqliteMembershipStore {
    async fn find_space(&self, space_id: &str) -> Result<Option<SpaceRecord>> {
        let row: Option<(String, String, bool, bool, bool)> = sqlx::query_as(
            "SELECT id, name, is_public, allow_humans, allow_agents FROM spaces WHERE id = ?1",
        )
        .bind(space_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(
            |(id, name, is_public, allow_humans, allow_agents)| SpaceRecord {
                id,
                name,
                is_public,
                allow_humans,
                allow_agents,
            },
        ))
    }

    async fn is_member(&self, space_id: &str, participant_id: &str) -> Result<bool> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM space_members WHERE space_id = ?1 AND participant_id = ?2",
        )
        .bind(space_id)
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.is_some())
    }

    async fn add_member(&self, space_id: &str, participant_id: &str, role: Role) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO space_members (space_id, participant_id, role, joined_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(space_id, participant_id) DO NOTHING
            "#,
        )
        .bind(space_id)
        .bind(participant_id)
        .bind(role.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn touch_last_active(&self, space_id: &str, participant_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE space_members SET last_active_at = ?3 WHERE space_id = ?1 AND participant_id = ?2",
        )
        .bind(space_id)
        .bind(participant_id)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_sqlite_membership_roundtrip() {
        let dir = tempdir().unwrap();
        let config = ConfigStore::new(&dir.path().join("test.db")).await.unwrap();
        let store = SqliteMembershipStore::new(config.pool().clone());

        assert!(store.find_space("s1").await.unwrap().is_none());

        store
            .upsert_space(&SpaceRecord::new("s1", "Studio").public())
            .await
            .unwrap();
        let space = store.find_space("s1").await.unwrap().unwrap();
        assert!(space.is_public);
        assert!(space.allows(Role::Agent));

        assert!(!store.is_member("s1", "bot").await.unwrap());
        store.add_member("s1", "bot", Role::Agent).await.unwrap();
        // Adding twice keeps a single row
        store.add_member("s1", "bot", Role::Agent).await.unwrap();
        assert!(store.is_member("s1", "bot").await.unwrap());

        assert!(store.last_active("s1", "bot").await.unwrap().is_none());
        store.touch_last_active("s1", "bot").await.unwrap();
        assert!(store.last_active("s1", "bot").await.unwrap().is_some());
    }
}
