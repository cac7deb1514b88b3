//! Application → service profile → network server → client.

use fuota_core::NetworkServer;
use fuota_db::Database;
use std::sync::Arc;
use tracing::debug;

use crate::client::{Endpoint, NetworkServerClient};
use crate::error::NsResult;
use crate::pool::ClientPool;

/// Outcome of resolving an application.
pub struct Resolved {
    pub network_server: NetworkServer,
    pub service_profile_id: String,
    pub client: Arc<dyn NetworkServerClient>,
}

impl std::fmt::Debug for Resolved {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resolved")
            .field("network_server", &self.network_server.server)
            .field("service_profile_id", &self.service_profile_id)
            .finish_non_exhaustive()
    }
}

/// Finds the network server behind an application and hands out a pooled
/// client for it.
#[derive(Debug, Clone)]
pub struct NetworkServerResolver {
    db: Database,
    pool: Arc<ClientPool>,
}

impl NetworkServerResolver {
    pub fn new(db: Database, pool: Arc<ClientPool>) -> Self {
        NetworkServerResolver { db, pool }
    }

    pub fn pool(&self) -> &Arc<ClientPool> {
        &self.pool
    }

    /// ## Errors
    /// - `Database(NotFound)` for an unknown application
    /// - connect errors from the pool
    pub async fn resolve(&self, application_id: i64) -> NsResult<Resolved> {
        let lookups = self.db.lookups();
        let application = lookups.get_application(application_id).await?;
        let network_server = lookups.network_server_for_application(application_id).await?;

        debug!(
            application_id,
            server = %network_server.server,
            "Resolved network server"
        );

        let client = self.pool.get(&Endpoint::from(&network_server)).await?;

        Ok(Resolved {
            network_server,
            service_profile_id: application.service_profile_id,
            client,
        })
    }
}
