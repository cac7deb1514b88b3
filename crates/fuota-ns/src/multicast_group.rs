//! # Multicast Group Service
//!
//! Keeps the local multicast-group mirror and the network server in step.
//!
//! ## Write Order
//! ```text
//! create:  local INSERT ──► remote create   (remote failure leaves the local row)
//! update:  local UPDATE ──► remote update
//! delete:  local DELETE ──► remote delete   (remote "not found" is ignored)
//! members: local row    ──► remote add/remove
//! ```
//!
//! Reads come from the mirror; `get` additionally fetches the remote half
//! unless `local_only` is set.

use fuota_core::validation::validate_uuid;
use fuota_core::{DevEui, MulticastGroup, NsMulticastGroup, ValidationError};
use fuota_db::Database;
use tracing::{debug, info, warn};

use crate::error::{NsError, NsResult};
use crate::resolver::NetworkServerResolver;

/// Multicast-group CRUD across the local mirror and the network server.
#[derive(Debug, Clone)]
pub struct MulticastGroupService {
    db: Database,
    resolver: NetworkServerResolver,
}

impl MulticastGroupService {
    pub fn new(db: Database, resolver: NetworkServerResolver) -> Self {
        MulticastGroupService { db, resolver }
    }

    /// Creates the group locally, then on the network server of its
    /// application.
    ///
    /// The remote half takes the local id and the application's service
    /// profile. If the remote create fails the local row stays in place and
    /// the error is returned.
    ///
    /// ## Errors
    /// - `Validation` if the network server assigns an id other than the
    ///   local one; the remote group is deleted again and the local row kept
    pub async fn create(
        &self,
        group: &MulticastGroup,
        remote: NsMulticastGroup,
    ) -> NsResult<MulticastGroup> {
        validate_uuid("id", &group.id)?;
        let resolved = self.resolver.resolve(group.application_id).await?;

        let mut created = self.db.multicast_groups().create(group).await?;

        let remote = NsMulticastGroup {
            id: group.id.clone(),
            service_profile_id: resolved.service_profile_id,
            ..remote
        };

        let remote_id = match resolved.client.create_multicast_group(&remote).await {
            Ok(id) => id,
            Err(err) => {
                warn!(
                    id = %group.id,
                    server = %resolved.network_server.server,
                    error = %err,
                    "Remote multicast group create failed, local row kept"
                );
                return Err(err);
            }
        };

        if remote_id != group.id {
            warn!(
                id = %group.id,
                remote_id = %remote_id,
                server = %resolved.network_server.server,
                "Network server assigned its own multicast group id, removing remote group"
            );
            if let Err(err) = resolved.client.delete_multicast_group(&remote_id).await {
                warn!(remote_id = %remote_id, error = %err, "Failed to remove mismatched remote group");
            }
            return Err(ValidationError::Inconsistent {
                field: "network_server.id".to_string(),
                reason: format!("expected {}, got {}", group.id, remote_id),
            }
            .into());
        }

        info!(id = %group.id, server = %resolved.network_server.server, "Created multicast group");

        created.network_server = Some(remote);
        Ok(created)
    }

    /// Reads the local row and, unless `local_only`, the remote half.
    pub async fn get(&self, id: &str, local_only: bool) -> NsResult<MulticastGroup> {
        let mut group = self.db.multicast_groups().get(id).await?;
        if local_only {
            return Ok(group);
        }

        let resolved = self.resolver.resolve(group.application_id).await?;
        group.network_server = Some(resolved.client.get_multicast_group(id).await?);
        Ok(group)
    }

    /// Updates the local row and the remote half.
    ///
    /// ## Errors
    /// - `Validation` if `group.network_server` is missing or names another id
    pub async fn update(&self, group: &MulticastGroup) -> NsResult<()> {
        let remote = group
            .network_server
            .as_ref()
            .ok_or_else(|| ValidationError::Required {
                field: "network_server".to_string(),
            })?;
        if remote.id != group.id {
            return Err(ValidationError::Inconsistent {
                field: "network_server.id".to_string(),
                reason: format!("expected {}, got {}", group.id, remote.id),
            }
            .into());
        }

        let resolved = self.resolver.resolve(group.application_id).await?;
        self.db.multicast_groups().update(group).await?;

        let remote = NsMulticastGroup {
            service_profile_id: resolved.service_profile_id,
            ..remote.clone()
        };
        resolved.client.update_multicast_group(&remote).await?;

        debug!(id = %group.id, "Updated multicast group");
        Ok(())
    }

    /// Deletes the local row (cascading its sessions), then the remote group.
    pub async fn delete(&self, id: &str) -> NsResult<()> {
        let group = self.db.multicast_groups().get(id).await?;
        let resolved = self.resolver.resolve(group.application_id).await?;

        self.db.multicast_groups().delete(id).await?;

        match resolved.client.delete_multicast_group(id).await {
            Ok(()) => {}
            Err(NsError::RemoteNotFound { .. }) => {
                warn!(id = %id, "Multicast group already absent on network server");
            }
            Err(err) => return Err(err),
        }

        info!(id = %id, "Deleted multicast group");
        Ok(())
    }

    pub async fn list(
        &self,
        application_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> NsResult<Vec<MulticastGroup>> {
        Ok(self
            .db
            .multicast_groups()
            .list(application_id, limit, offset)
            .await?)
    }

    pub async fn count(&self, application_id: Option<i64>) -> NsResult<i64> {
        Ok(self.db.multicast_groups().count(application_id).await?)
    }

    // =========================================================================
    // Membership
    // =========================================================================

    pub async fn add_device(&self, multicast_group_id: &str, dev_eui: &DevEui) -> NsResult<()> {
        let group = self.db.multicast_groups().get(multicast_group_id).await?;
        let resolved = self.resolver.resolve(group.application_id).await?;

        self.db
            .multicast_groups()
            .add_device(multicast_group_id, dev_eui)
            .await?;
        resolved
            .client
            .add_device_to_multicast_group(multicast_group_id, dev_eui)
            .await
    }

    pub async fn remove_device(&self, multicast_group_id: &str, dev_eui: &DevEui) -> NsResult<()> {
        let group = self.db.multicast_groups().get(multicast_group_id).await?;
        let resolved = self.resolver.resolve(group.application_id).await?;

        self.db
            .multicast_groups()
            .remove_device(multicast_group_id, dev_eui)
            .await?;
        resolved
            .client
            .remove_device_from_multicast_group(multicast_group_id, dev_eui)
            .await
    }

    pub async fn list_devices(&self, multicast_group_id: &str) -> NsResult<Vec<DevEui>> {
        Ok(self
            .db
            .multicast_groups()
            .list_devices(multicast_group_id)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ClientPool;
    use crate::testing::FakeFactory;
    use chrono::Utc;
    use fuota_core::{Aes128Key, DevAddr, ErrorKind, GroupType, NetworkServer, ServiceProfile};
    use fuota_db::DbConfig;
    use std::sync::Arc;
    use std::time::Duration;

    struct Setup {
        db: Database,
        factory: Arc<FakeFactory>,
        service: MulticastGroupService,
        application_id: i64,
        devices: Vec<DevEui>,
    }

    async fn setup() -> Setup {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let now = Utc::now();
        let lookups = db.lookups();
        let ns = lookups
            .create_network_server(&NetworkServer {
                id: 0,
                created_at: now,
                updated_at: now,
                name: "ns".to_string(),
                server: "ns.local:8000".to_string(),
                ca_cert: String::new(),
                tls_cert: String::new(),
                tls_key: String::new(),
            })
            .await
            .unwrap();
        lookups
            .create_service_profile(&ServiceProfile {
                id: "sp-1".to_string(),
                name: "sp".to_string(),
                network_server_id: ns.id,
            })
            .await
            .unwrap();
        let app = lookups.create_application("app", "sp-1").await.unwrap();

        let mut devices = Vec::new();
        for i in 1..=3u8 {
            let eui = DevEui::from_bytes([0x70, 0xb3, 0xd5, 0x7e, 0, 0, 0, i]);
            lookups
                .create_device(&eui, &format!("device-{}", i), app.id)
                .await
                .unwrap();
            devices.push(eui);
        }

        let factory = Arc::new(FakeFactory::default());
        let pool = Arc::new(ClientPool::new(factory.clone(), Duration::from_secs(1)));
        let resolver = NetworkServerResolver::new(db.clone(), pool);

        Setup {
            service: MulticastGroupService::new(db.clone(), resolver),
            db,
            factory,
            application_id: app.id,
            devices,
        }
    }

    fn group(application_id: i64, name: &str) -> MulticastGroup {
        let now = Utc::now();
        MulticastGroup {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            application_id,
            mc_app_s_key: Aes128Key::new([1; 16]),
            mc_key: Aes128Key::new([2; 16]),
            network_server: None,
        }
    }

    fn remote() -> NsMulticastGroup {
        NsMulticastGroup {
            id: String::new(),
            mc_addr: DevAddr::from_bytes([1, 2, 3, 4]),
            mc_nwk_s_key: Aes128Key::new([3; 16]),
            f_cnt: 0,
            group_type: GroupType::C,
            dr: 5,
            frequency: 869_525_000,
            ping_slot_period: 0,
            service_profile_id: String::new(),
        }
    }

    #[tokio::test]
    async fn test_create_writes_both_sides() {
        let s = setup().await;
        let g = group(s.application_id, "fleet");

        let created = s.service.create(&g, remote()).await.unwrap();
        let ns = created.network_server.unwrap();
        assert_eq!(ns.id, g.id);
        assert_eq!(ns.service_profile_id, "sp-1");

        let on_server = s.factory.client.group(&g.id).unwrap();
        assert_eq!(on_server.frequency, 869_525_000);

        let fetched = s.service.get(&g.id, false).await.unwrap();
        assert_eq!(fetched.name, "fleet");
        assert_eq!(fetched.network_server.unwrap().mc_addr, DevAddr::from_bytes([1, 2, 3, 4]));

        let local = s.service.get(&g.id, true).await.unwrap();
        assert!(local.network_server.is_none());
    }

    #[tokio::test]
    async fn test_create_rejects_server_assigned_id() {
        let s = setup().await;
        s.factory.client.set_assign_ids(true);
        let g = group(s.application_id, "renamed");

        let err = s.service.create(&g, remote()).await.unwrap_err();
        assert!(matches!(
            err,
            NsError::Validation(ValidationError::Inconsistent { .. })
        ));
        assert!(!err.is_retryable());

        assert!(s.service.get(&g.id, true).await.is_ok());
        assert!(s.factory.client.group(&g.id).is_none());
        assert!(s.factory.client.group(&format!("ns-{}", g.id)).is_none());
    }

    #[tokio::test]
    async fn test_remote_failure_keeps_local_row() {
        let s = setup().await;
        s.factory.client.set_fail_writes(true);
        let g = group(s.application_id, "orphan");

        let err = s.service.create(&g, remote()).await.unwrap_err();
        assert!(err.is_retryable());

        assert!(s.service.get(&g.id, true).await.is_ok());
        assert!(s.factory.client.group(&g.id).is_none());

        let err = s.service.get(&g.id, false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_update_requires_remote_half() {
        let s = setup().await;
        let g = group(s.application_id, "fleet");
        let mut created = s.service.create(&g, remote()).await.unwrap();

        let mut without_remote = created.clone();
        without_remote.network_server = None;
        let err = s.service.update(&without_remote).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Invalid);

        created.name = "renamed".to_string();
        if let Some(ns) = created.network_server.as_mut() {
            ns.dr = 3;
        }
        s.service.update(&created).await.unwrap();

        assert_eq!(s.service.get(&g.id, true).await.unwrap().name, "renamed");
        assert_eq!(s.factory.client.group(&g.id).unwrap().dr, 3);
    }

    #[tokio::test]
    async fn test_delete_removes_both_sides() {
        let s = setup().await;
        let g = group(s.application_id, "fleet");
        s.service.create(&g, remote()).await.unwrap();

        s.service.delete(&g.id).await.unwrap();
        assert!(s.factory.client.group(&g.id).is_none());
        assert_eq!(
            s.service.get(&g.id, true).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            s.service.delete(&g.id).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_delete_tolerates_missing_remote() {
        let s = setup().await;
        s.factory.client.set_fail_writes(true);
        let g = group(s.application_id, "local-only");
        let _ = s.service.create(&g, remote()).await;
        s.factory.client.set_fail_writes(false);

        s.service.delete(&g.id).await.unwrap();
        assert_eq!(s.service.count(Some(s.application_id)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_membership_forwarded() {
        let s = setup().await;
        let g = group(s.application_id, "fleet");
        s.service.create(&g, remote()).await.unwrap();

        for dev in &s.devices {
            s.service.add_device(&g.id, dev).await.unwrap();
        }
        s.service.remove_device(&g.id, &s.devices[1]).await.unwrap();

        let local = s.service.list_devices(&g.id).await.unwrap();
        assert_eq!(local, vec![s.devices[0].clone(), s.devices[2].clone()]);
        assert_eq!(s.factory.client.members(&g.id), local);

        let err = s
            .service
            .remove_device(&g.id, &s.devices[1])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_list_and_count_per_application() {
        let s = setup().await;
        for name in ["b", "a", "c"] {
            s.service
                .create(&group(s.application_id, name), remote())
                .await
                .unwrap();
        }

        let page = s
            .service
            .list(Some(s.application_id), 2, 0)
            .await
            .unwrap();
        let names: Vec<_> = page.iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, ["a", "b"]);
        assert_eq!(s.service.count(None).await.unwrap(), 3);
        assert_eq!(s.service.count(Some(s.application_id + 1)).await.unwrap(), 0);
        assert_eq!(s.db.multicast_groups().count(None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_unknown_application_rejected_before_write() {
        let s = setup().await;
        let g = group(s.application_id + 42, "nowhere");

        let err = s.service.create(&g, remote()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(s.service.count(None).await.unwrap(), 0);
        assert_eq!(s.factory.connects(), 0);
    }
}
