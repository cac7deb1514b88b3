//! # Lookup Repository
//!
//! Network servers, service profiles, applications and devices.
//!
//! These rows are owned by the wider platform; the orchestrator only reads
//! them for joins (filtering deployments by application, resolving which
//! network server a multicast group lives on). The insert methods exist for
//! seeding and tests.
//!
//! ## Resolver Chain
//! ```text
//! application ──► service_profile ──► network_server
//!      ▲                                   │
//!      └── device                          └── server address + certificates
//! ```

use chrono::Utc;
use fuota_core::{Application, DevEui, Device, NetworkServer, ServiceProfile};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

const NETWORK_SERVER_COLUMNS: &str =
    "id, created_at, updated_at, name, server, ca_cert, tls_cert, tls_key";

const DEVICE_COLUMNS: &str = "dev_eui, created_at, updated_at, name, application_id";

/// Repository for the read-mostly lookup tables.
#[derive(Debug, Clone)]
pub struct LookupRepository {
    pool: SqlitePool,
}

impl LookupRepository {
    /// Creates a new LookupRepository.
    pub fn new(pool: SqlitePool) -> Self {
        LookupRepository { pool }
    }

    // =========================================================================
    // Network servers
    // =========================================================================

    /// Inserts a network server. `id` and timestamps are assigned here.
    pub async fn create_network_server(&self, ns: &NetworkServer) -> DbResult<NetworkServer> {
        let now = Utc::now();

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO network_server (
                created_at, updated_at, name, server, ca_cert, tls_cert, tls_key
            ) VALUES (?1, ?1, ?2, ?3, ?4, ?5, ?6)
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(&ns.name)
        .bind(&ns.server)
        .bind(&ns.ca_cert)
        .bind(&ns.tls_cert)
        .bind(&ns.tls_key)
        .fetch_one(&self.pool)
        .await?;

        debug!(id, server = %ns.server, "Created network server");

        Ok(NetworkServer {
            id,
            created_at: now,
            updated_at: now,
            ..ns.clone()
        })
    }

    pub async fn get_network_server(&self, id: i64) -> DbResult<NetworkServer> {
        let sql = format!(
            "SELECT {} FROM network_server WHERE id = ?1",
            NETWORK_SERVER_COLUMNS
        );
        sqlx::query_as::<_, NetworkServer>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("NetworkServer", id.to_string()))
    }

    /// Replaces address and certificates (e.g. after certificate rotation).
    pub async fn update_network_server(&self, ns: &NetworkServer) -> DbResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE network_server SET
                updated_at = ?2,
                name = ?3,
                server = ?4,
                ca_cert = ?5,
                tls_cert = ?6,
                tls_key = ?7
            WHERE id = ?1
            "#,
        )
        .bind(ns.id)
        .bind(Utc::now())
        .bind(&ns.name)
        .bind(&ns.server)
        .bind(&ns.ca_cert)
        .bind(&ns.tls_cert)
        .bind(&ns.tls_key)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found("NetworkServer", ns.id.to_string()));
        }

        Ok(())
    }

    /// Resolves the network server an application's devices are served by.
    pub async fn network_server_for_application(
        &self,
        application_id: i64,
    ) -> DbResult<NetworkServer> {
        sqlx::query_as::<_, NetworkServer>(
            r#"
            SELECT ns.id, ns.created_at, ns.updated_at, ns.name, ns.server,
                   ns.ca_cert, ns.tls_cert, ns.tls_key
            FROM application a
            JOIN service_profile sp ON sp.id = a.service_profile_id
            JOIN network_server ns ON ns.id = sp.network_server_id
            WHERE a.id = ?1
            "#,
        )
        .bind(application_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found("Application", application_id.to_string()))
    }

    // =========================================================================
    // Service profiles & applications
    // =========================================================================

    pub async fn create_service_profile(&self, sp: &ServiceProfile) -> DbResult<()> {
        sqlx::query("INSERT INTO service_profile (id, name, network_server_id) VALUES (?1, ?2, ?3)")
            .bind(&sp.id)
            .bind(&sp.name)
            .bind(sp.network_server_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_service_profile(&self, id: &str) -> DbResult<ServiceProfile> {
        sqlx::query_as::<_, ServiceProfile>(
            "SELECT id, name, network_server_id FROM service_profile WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found("ServiceProfile", id))
    }

    /// Inserts an application. `id` is assigned here.
    pub async fn create_application(
        &self,
        name: &str,
        service_profile_id: &str,
    ) -> DbResult<Application> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO application (name, service_profile_id) VALUES (?1, ?2) RETURNING id",
        )
        .bind(name)
        .bind(service_profile_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(Application {
            id,
            name: name.to_string(),
            service_profile_id: service_profile_id.to_string(),
        })
    }

    pub async fn get_application(&self, id: i64) -> DbResult<Application> {
        sqlx::query_as::<_, Application>(
            "SELECT id, name, service_profile_id FROM application WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::not_found("Application", id.to_string()))
    }

    // =========================================================================
    // Devices
    // =========================================================================

    pub async fn create_device(
        &self,
        dev_eui: &DevEui,
        name: &str,
        application_id: i64,
    ) -> DbResult<Device> {
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO device (dev_eui, created_at, updated_at, name, application_id)
            VALUES (?1, ?2, ?2, ?3, ?4)
            "#,
        )
        .bind(dev_eui)
        .bind(now)
        .bind(name)
        .bind(application_id)
        .execute(&self.pool)
        .await?;

        Ok(Device {
            dev_eui: dev_eui.clone(),
            created_at: now,
            updated_at: now,
            name: name.to_string(),
            application_id,
        })
    }

    pub async fn get_device(&self, dev_eui: &DevEui) -> DbResult<Device> {
        let sql = format!("SELECT {} FROM device WHERE dev_eui = ?1", DEVICE_COLUMNS);
        sqlx::query_as::<_, Device>(&sql)
            .bind(dev_eui)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::not_found("Device", dev_eui.as_str()))
    }

    /// Devices of an application, ordered by name.
    pub async fn list_devices(&self, application_id: i64) -> DbResult<Vec<Device>> {
        let sql = format!(
            "SELECT {} FROM device WHERE application_id = ?1 ORDER BY name, dev_eui",
            DEVICE_COLUMNS
        );
        let devices = sqlx::query_as::<_, Device>(&sql)
            .bind(application_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(devices)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
