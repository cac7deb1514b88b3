//! # fuota-core: Domain Model for the FUOTA Orchestrator
//!
//! Pure types and rules for firmware-update-over-the-air rollouts. Nothing in
//! this crate performs I/O; persistence lives in `fuota-db` and the
//! network-server seam in `fuota-ns`.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      FUOTA Orchestrator                                 │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │            Step executor (external scheduler loop)              │   │
//! │  │   poll due ──► act on network server ──► persist result        │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fuota-core (THIS CRATE) ★                       │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌───────────┐  │   │
//! │  │   │   types   │  │  session  │  │   retry   │  │ validation│  │   │
//! │  │   │Deployment │  │ McSetup   │  │  Policy   │  │   rules   │  │   │
//! │  │   │ Device    │  │ FragSess  │  │  Schedule │  │  checks   │  │   │
//! │  │   │ McGroup   │  │ ClassC    │  │           │  │           │  │   │
//! │  │   └───────────┘  └───────────┘  └───────────┘  └───────────┘  │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │          fuota-db (SQLite store + claim queue)                  │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Identifiers, deployment and device outcome, multicast group, lookups
//! - [`session`] - The three provisioning-session records and their prerequisites
//! - [`retry`] - Retry schedule columns and pluggable backoff policies
//! - [`error`] - Domain error types and [`ErrorKind`]
//! - [`validation`] - Checks run before any write
//!
//! ## Features
//!
//! - `sqlx`: derives `sqlx::Type` / `sqlx::FromRow` on the stored types.
//!
//! ## Example Usage
//!
//! ```rust
//! use fuota_core::{DeploymentState, FuotaDeployment, GroupType};
//! use chrono::Utc;
//!
//! let mut deployment = FuotaDeployment::new("fw-2.0.1", GroupType::C, vec![0xAA; 200]);
//! assert_eq!(deployment.state, DeploymentState::McCreate);
//!
//! deployment.advance_to_next(Utc::now()).unwrap();
//! assert_eq!(deployment.state, DeploymentState::McSetup);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod retry;
pub mod session;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use error::{CoreError, CoreResult, ErrorKind, ValidationError};
pub use retry::{ExponentialBackoff, FixedInterval, RetryPolicy, RetrySchedule};
pub use session::{
    Prerequisite, ProvisioningSession, RemoteFragmentationSession, RemoteMulticastClassCSession,
    RemoteMulticastSetup, SessionKind, SessionState,
};
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Default number of rows a worker claims per poll.
pub const DEFAULT_BATCH_SIZE: i64 = 10;

/// Default retry bound for provisioning sessions.
///
/// Rows at or above this count are no longer handed out by the claim queue.
pub const DEFAULT_MAX_RETRY_COUNT: i32 = 5;

/// Highest device-local multicast group slot (LoRaWAN remote multicast setup).
pub const MAX_MC_GROUP_ID: i32 = 3;

/// Highest device-local fragmentation session slot.
pub const MAX_FRAG_INDEX: i32 = 3;

/// Length of the fragmentation session descriptor in bytes.
pub const DESCRIPTOR_LEN: usize = 4;

/// Maximum length of deployment and multicast-group names.
pub const MAX_NAME_LEN: usize = 100;
