//! # Multicast Group Repository
//!
//! Local relational mirror of multicast groups and their device membership.
//!
//! The authoritative copy lives on the network server; `fuota-ns` writes
//! there and keeps this mirror in step so deployments and provisioning
//! sessions can join against it.

use chrono::Utc;
use fuota_core::validation::{validate_name, validate_uuid};
use fuota_core::{DevEui, MulticastGroup};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

const COLUMNS: &str = "id, created_at, updated_at, name, application_id, mc_app_s_key, mc_key";

/// Repository for multicast group operations.
#[derive(Debug, Clone)]
pub struct MulticastGroupRepository {
    pool: SqlitePool,
}

impl MulticastGroupRepository {
    /// Creates a new MulticastGroupRepository.
    pub fn new(pool: SqlitePool) -> Self {
        MulticastGroupRepository { pool }
    }

    /// Inserts the local row. Timestamps are assigned here.
    ///
    /// ## Errors
    /// - `Validation` for an empty name or a non-UUID id
    /// - `UniqueViolation` if the id is taken
    /// - `ForeignKeyViolation` for an unknown application
    pub async fn create(&self, group: &MulticastGroup) -> DbResult<MulticastGroup> {
        validate_uuid("id", &group.id)?;
        validate_name("name", &group.name)?;

        let now = Utc::now();
        debug!(id = %group.id, application_id = group.application_id, "Creating multicast group");

        sqlx::query(
            r#"
            INSERT INTO multicast_group (
                id, created_at, updated_at, name, application_id, mc_app_s_key, mc_key
            ) VALUES (?1, ?2, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&group.id)
        .bind(now)
        .bind(&group.name)
        .bind(group.application_id)
        .bind(group.mc_app_s_key.to_vec())
        .bind(group.mc_key.to_vec())
        .execute(&self.pool)
        .await?;

        Ok(MulticastGroup {
            created_at: now,
            updated_at: now,
            ..group.clone()
        })
    }

    pub async fn get(&self, id: &str) -> DbResult<MulticastGroup> {
        let sql = format!("SELECT {} FROM multicast_group WHERE id = ?1", COLUMNS);
        sqlx::query_as::<_, MulticastGroup>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("MulticastGroup", id))
    }

    /// Replaces name and key material.
    pub async fn update(&self, group: &MulticastGroup) -> DbResult<()> {
        validate_name("name", &group.name)?;

        let result = sqlx::query(
            r#"
            UPDATE multicast_group SET
                updated_at = ?2,
                name = ?3,
                mc_app_s_key = ?4,
                mc_key = ?5
            WHERE id = ?1
            "#,
        )
        .bind(&group.id)
        .bind(Utc::now())
        .bind(&group.name)
        .bind(group.mc_app_s_key.to_vec())
        .bind(group.mc_key.to_vec())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("MulticastGroup", &group.id));
        }

        Ok(())
    }

    /// Deletes the group; membership and provisioning rows cascade.
    pub async fn delete(&self, id: &str) -> DbResult<()> {
        let result = sqlx::query("DELETE FROM multicast_group WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("MulticastGroup", id));
        }

        debug!(id = %id, "Deleted multicast group");
        Ok(())
    }

    /// Groups ordered by name, optionally restricted to one application.
    pub async fn list(
        &self,
        application_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> DbResult<Vec<MulticastGroup>> {
        let sql = format!(
            r#"
            SELECT {} FROM multicast_group
            WHERE (?1 IS NULL OR application_id = ?1)
            ORDER BY name, id
            LIMIT ?2 OFFSET ?3
            "#,
            COLUMNS
        );
        let groups = sqlx::query_as::<_, MulticastGroup>(&sql)
            .bind(application_id)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;
        Ok(groups)
    }

    pub async fn count(&self, application_id: Option<i64>) -> DbResult<i64> {
        let count = sqlx::query_scalar(
            "SELECT COUNT(*) FROM multicast_group WHERE (?1 IS NULL OR application_id = ?1)",
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    pub async fn add_device(&self, multicast_group_id: &str, dev_eui: &DevEui) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO multicast_group_device (multicast_group_id, dev_eui, created_at)
            VALUES (?1, ?2, ?3)
            "#,
        )
        .bind(multicast_group_id)
        .bind(dev_eui)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        debug!(multicast_group_id = %multicast_group_id, dev_eui = %dev_eui, "Added device to multicast group");
        Ok(())
    }

    pub async fn remove_device(&self, multicast_group_id: &str, dev_eui: &DevEui) -> DbResult<()> {
        let result = sqlx::query(
            "DELETE FROM multicast_group_device WHERE multicast_group_id = ?1 AND dev_eui = ?2",
        )
        .bind(multicast_group_id)
        .bind(dev_eui)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(
                "MulticastGroupDevice",
                format!("{}/{}", multicast_group_id, dev_eui),
            ));
        }

        Ok(())
    }

    /// Member devices, ordered by EUI.
    pub async fn list_devices(&self, multicast_group_id: &str) -> DbResult<Vec<DevEui>> {
        let devices = sqlx::query_scalar::<_, DevEui>(
            r#"
            SELECT dev_eui FROM multicast_group_device
            WHERE multicast_group_id = ?1
            ORDER BY dev_eui
            "#,
        )
        .bind(multicast_group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(devices)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use crate::pool::{Database, DbConfig};
    use crate::repository::testing::Fixture;
    use fuota_core::{Aes128Key, ErrorKind};

    #[tokio::test]
    async fn test_create_get_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 0).await;

        let created = fixture.group(&db, "meters").await;
        let loaded = db.multicast_groups().get(&created.id).await.unwrap();

        assert_eq!(loaded, created);
        assert_eq!(loaded.mc_key, Aes128Key::new([2; 16]));
        assert!(loaded.network_server.is_none());
    }

    #[tokio::test]
    async fn test_update_delete_and_not_found() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 0).await;
        let repo = db.multicast_groups();

        let mut group = fixture.group(&db, "a").await;
        group.name = "renamed".to_string();
        group.mc_app_s_key = Aes128Key::new([9; 16]);
        repo.update(&group).await.unwrap();

        let loaded = repo.get(&group.id).await.unwrap();
        assert_eq!(loaded.name, "renamed");
        assert_eq!(loaded.mc_app_s_key, Aes128Key::new([9; 16]));

        repo.delete(&group.id).await.unwrap();
        assert_eq!(repo.get(&group.id).await.unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(repo.delete(&group.id).await.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_and_count_by_application() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 0).await;
        let repo = db.multicast_groups();

        fixture.group(&db, "b").await;
        fixture.group(&db, "a").await;

        let groups = repo.list(Some(fixture.application_id), 10, 0).await.unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "a");
        assert_eq!(repo.count(None).await.unwrap(), 2);
        assert_eq!(repo.count(Some(fixture.application_id + 1)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_membership() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let fixture = Fixture::new(&db, 2).await;
        let repo = db.multicast_groups();
        let group = fixture.group(&db, "g").await;

        repo.add_device(&group.id, &fixture.devices[1]).await.unwrap();
        repo.add_device(&group.id, &fixture.devices[0]).await.unwrap();
        let err = repo.add_device(&group.id, &fixture.devices[0]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        assert_eq!(
            repo.list_devices(&group.id).await.unwrap(),
            vec![fixture.devices[0].clone(), fixture.devices[1].clone()]
        );

        repo.remove_device(&group.id, &fixture.devices[0]).await.unwrap();
        assert!(repo.remove_device(&group.id, &fixture.devices[0]).await.is_err());
        assert_eq!(repo.list_devices(&group.id).await.unwrap().len(), 1);
    }
}
