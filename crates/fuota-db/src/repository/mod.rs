//! # Repository Module
//!
//! Database repository implementations for the FUOTA store.
//!
//! ## Repository Pattern
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Repository Layout                                    │
//! │                                                                         │
//! │  Step executor                                                         │
//! │       │                                                                 │
//! │       │  db.fragmentation_sessions().get_pending(10, 5)                │
//! │       ▼                                                                 │
//! │  <Kind>Repository                                                      │
//! │  ├── create(&self, row)                                                │
//! │  ├── get(&self, key) / get_for_update(&self, key)                      │
//! │  ├── get_pending(&self, batch, max_retry)  ← claim queue               │
//! │  ├── update(&self, row)                    ← persist + release lease   │
//! │  ├── release(&self, claim)                 ← abandon                   │
//! │  └── delete(&self, key)                                                │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  SQLite Database                                                       │
//! │                                                                         │
//! │  Only the payload columns and the prerequisite predicate differ        │
//! │  between the three session repositories.                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Available Repositories
//!
//! - [`DeploymentRepository`] - Deployments, device outcomes, deployment claims
//! - [`MulticastSetupRepository`] - Remote multicast group setup sessions
//! - [`FragmentationSessionRepository`] - Remote fragmentation sessions
//! - [`ClassCSessionRepository`] - Remote class-C multicast sessions
//! - [`MulticastGroupRepository`] - Local multicast group mirror and membership
//! - [`LookupRepository`] - Network servers, service profiles, applications, devices

pub mod class_c_session;
pub mod deployment;
pub mod fragmentation_session;
pub mod lookup;
pub mod multicast_group;
pub mod multicast_setup;

#[cfg(test)]
pub(crate) mod testing;

pub use class_c_session::ClassCSessionRepository;
pub use deployment::DeploymentRepository;
pub use fragmentation_session::FragmentationSessionRepository;
pub use lookup::LookupRepository;
pub use multicast_group::MulticastGroupRepository;
pub use multicast_setup::MulticastSetupRepository;
