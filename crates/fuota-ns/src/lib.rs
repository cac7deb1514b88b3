//! # fuota-ns: Network-Server Seam
//!
//! Everything the orchestrator needs from a LoRaWAN network server, plus the
//! configuration that wires the store and the network side together.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  MulticastGroupService ──► NetworkServerResolver ──► ClientPool         │
//! │         │                        │                       │              │
//! │         ▼                        ▼                       ▼              │
//! │   fuota-db mirror         fuota-db lookups        ClientFactory         │
//! │  (multicast_group)  (application → service    (supplied by the          │
//! │                        profile → server)        embedding service)      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`client`] - Client and factory traits, endpoints
//! - [`pool`] - One cached client per server and certificate triple
//! - [`resolver`] - Application to network-server resolution
//! - [`multicast_group`] - Multicast group CRUD and membership
//! - [`config`] - Layered TOML/environment configuration
//! - [`error`] - Network-server error types
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fuota_ns::{ClientPool, FuotaConfig, MulticastGroupService, NetworkServerResolver};
//!
//! let config = FuotaConfig::load(None)?;
//! let db = Database::new(config.db_config()).await?;
//! let pool = Arc::new(ClientPool::new(factory, config.connect_timeout()));
//! let groups = MulticastGroupService::new(db.clone(), NetworkServerResolver::new(db, pool));
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod multicast_group;
pub mod pool;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testing;

pub use client::{CertificateTriple, ClientFactory, Endpoint, NetworkServerClient};
pub use config::{DatabaseSettings, FuotaConfig, NetworkServerSettings, SchedulerSettings};
pub use error::{NsError, NsResult};
pub use multicast_group::MulticastGroupService;
pub use pool::ClientPool;
pub use resolver::{NetworkServerResolver, Resolved};
