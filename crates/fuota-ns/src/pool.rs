//! # Network-Server Client Pool
//!
//! One live client per network-server address, reused while the
//! certificate triple it was built with still matches.
//!
//! ## Lookup Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  get(endpoint)                                                          │
//! │     │                                                                   │
//! │     ├── read lock: entry for server with same certs? ──► reuse          │
//! │     │                                                                   │
//! │     ├── connect, no lock held (bounded by timeout)                      │
//! │     │                                                                   │
//! │     └── write lock: re-check                                            │
//! │              ├── same certs cached meanwhile ──► reuse, drop new client │
//! │              ├── entry existed with other certs ──► replaced (rotation) │
//! │              └── no entry ──► inserted                                  │
//! │                                                                         │
//! │  invalidate(server) drops the entry; next get() reconnects              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A slow or unreachable server only delays callers asking for that server.
//! Two callers racing on the same cold entry may both connect; the first
//! insert wins and the other client is dropped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::client::{CertificateTriple, ClientFactory, Endpoint, NetworkServerClient};
use crate::error::{NsError, NsResult};

struct PooledClient {
    certs: CertificateTriple,
    client: Arc<dyn NetworkServerClient>,
}

/// Cache of network-server clients keyed by server address.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct ClientPool {
    factory: Arc<dyn ClientFactory>,
    connect_timeout: Duration,
    clients: RwLock<HashMap<String, PooledClient>>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

impl ClientPool {
    pub fn new(factory: Arc<dyn ClientFactory>, connect_timeout: Duration) -> Self {
        ClientPool {
            factory,
            connect_timeout,
            clients: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the client for `endpoint`, connecting if needed.
    ///
    /// ## Errors
    /// - `Timeout` if connecting exceeds the configured timeout
    /// - whatever the factory returns on connect failure
    pub async fn get(&self, endpoint: &Endpoint) -> NsResult<Arc<dyn NetworkServerClient>> {
        {
            let clients = self.clients.read().await;
            if let Some(pooled) = clients.get(&endpoint.server) {
                if pooled.certs == endpoint.certs {
                    return Ok(pooled.client.clone());
                }
            }
        }

        let client = tokio::time::timeout(self.connect_timeout, self.factory.connect(endpoint))
            .await
            .map_err(|_| NsError::Timeout {
                server: endpoint.server.clone(),
                secs: self.connect_timeout.as_secs(),
            })??;

        debug!(server = %endpoint.server, tls = endpoint.certs.is_tls(), "Network-server client connected");

        let mut clients = self.clients.write().await;

        // Another task may have connected while this one was connecting.
        if let Some(pooled) = clients.get(&endpoint.server) {
            if pooled.certs == endpoint.certs {
                return Ok(pooled.client.clone());
            }
            info!(server = %endpoint.server, "Network-server certificates changed, replacing client");
        }

        clients.insert(
            endpoint.server.clone(),
            PooledClient {
                certs: endpoint.certs.clone(),
                client: client.clone(),
            },
        );
        Ok(client)
    }

    /// Drops the cached client for `server`. Returns whether one existed.
    pub async fn invalidate(&self, server: &str) -> bool {
        let removed = self.clients.write().await.remove(server).is_some();
        if removed {
            info!(server = %server, "Network-server client invalidated");
        }
        removed
    }

    /// Number of cached clients.
    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
