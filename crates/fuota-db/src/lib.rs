//! # fuota-db: Store and Claim Queue for the FUOTA Orchestrator
//!
//! This crate persists deployments, per-device outcomes and the three kinds
//! of device provisioning sessions, and hands due work to step executors
//! through a lease-based claim queue. It uses SQLite with sqlx.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FUOTA Data Flow                                  │
//! │                                                                         │
//! │  Step executor (poll loop)                                             │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fuota-db (THIS CRATE)                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌───────────────┐    ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories │    │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │               │    │  (embedded)  │  │   │
//! │  │   │               │    │ Deployment    │    │ 001_initial  │  │   │
//! │  │   │ SqlitePool    │◄───│ MulticastSetup│    │ _schema.sql  │  │   │
//! │  │   │ claim lease   │    │ Fragmentation │    │              │  │   │
//! │  │   │               │    │ ClassCSession │    │              │  │   │
//! │  │   └───────────────┘    └───────┬───────┘    └──────────────┘  │   │
//! │  │                                │                                │   │
//! │  │                        ┌───────▼───────┐                        │   │
//! │  │                        │   claim.rs    │                        │   │
//! │  │                        │ lease + token │                        │   │
//! │  │                        └───────────────┘                        │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database (WAL)                       │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! - [`pool`] - Connection pool creation and configuration
//! - [`migrations`] - Embedded database migrations
//! - [`error`] - Database error types
//! - [`claim`] - Lease-based claim queue shared by the claimable tables
//! - [`repository`] - Repository implementations
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fuota_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("fuota.db")).await?;
//!
//! // Claim due setups, act on them, persist the outcome
//! let claim = db.multicast_setups().get_pending(10, 5).await?;
//! let token = claim.token().to_string();
//! for mut setup in claim {
//!     setup.mark_provisioned(Utc::now());
//!     db.multicast_setups().update(&setup, Some(&token)).await?;
//! }
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod claim;
pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use claim::Claim;
pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

// Repository re-exports for convenience
pub use repository::class_c_session::ClassCSessionRepository;
pub use repository::deployment::DeploymentRepository;
pub use repository::fragmentation_session::FragmentationSessionRepository;
pub use repository::lookup::LookupRepository;
pub use repository::multicast_group::MulticastGroupRepository;
pub use repository::multicast_setup::MulticastSetupRepository;
