//! # Provisioning Sessions
//!
//! Per-device provisioning records for the three sub-protocols used during a
//! rollout, and the dependencies between them.
//!
//! ## Dependency Chain
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │   RemoteMulticastSetup (device, group)                                 │
//! │        │ state_provisioned = true                                      │
//! │        ├──────────────────────────────┐                                │
//! │        ▼                              ▼                                │
//! │   RemoteFragmentationSession     RemoteMulticastClassCSession          │
//! │   (device, frag_index)           (device, group)                       │
//! │   every mc_group_id provisioned  matching setup provisioned            │
//! │   (or no groups: unicast)        and its intent is SETUP               │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The chain is a re-checked predicate, not a trigger: a session simply is
//! not pending until [`ProvisioningSession::prerequisite_satisfied`] holds.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::retry::{RetryPolicy, RetrySchedule};
use crate::types::DevEui;

// =============================================================================
// Session Kind / Prerequisite
// =============================================================================

/// The three provisioning sub-protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    MulticastSetup,
    FragmentationSession,
    MulticastClassCSession,
}

impl SessionKind {
    pub const ALL: [SessionKind; 3] = [
        SessionKind::MulticastSetup,
        SessionKind::FragmentationSession,
        SessionKind::MulticastClassCSession,
    ];

    /// What must hold before a session of this kind may be dispatched.
    pub const fn prerequisite(self) -> Prerequisite {
        match self {
            SessionKind::MulticastSetup => Prerequisite::None,
            SessionKind::FragmentationSession => Prerequisite::AllGroupsProvisioned,
            SessionKind::MulticastClassCSession => Prerequisite::GroupSetupProvisioned,
        }
    }
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::MulticastSetup => f.write_str("remote_multicast_setup"),
            SessionKind::FragmentationSession => f.write_str("remote_fragmentation_session"),
            SessionKind::MulticastClassCSession => {
                f.write_str("remote_multicast_class_c_session")
            }
        }
    }
}

/// Declarative dependency of a session on multicast-setup rows of the
/// same device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prerequisite {
    /// Always eligible.
    None,
    /// Every referenced `mc_group_id` has a provisioned setup row.
    /// An empty list means unicast delivery and is always satisfied.
    AllGroupsProvisioned,
    /// The setup row for the same multicast group is provisioned with
    /// intent SETUP.
    GroupSetupProvisioned,
}

// =============================================================================
// Session State
// =============================================================================

/// What a multicast or fragmentation session is being provisioned for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionState {
    /// Install the session on the device.
    Setup,
    /// Remove the session from the device.
    Delete,
}

impl Default for SessionState {
    fn default() -> Self {
        SessionState::Setup
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Setup => f.write_str("SETUP"),
            SessionState::Delete => f.write_str("DELETE"),
        }
    }
}

// =============================================================================
// Shared Behaviour
// =============================================================================

/// Common shape of the three session records.
pub trait ProvisioningSession {
    const KIND: SessionKind;

    fn dev_eui(&self) -> &DevEui;
    fn is_provisioned(&self) -> bool;
    fn set_provisioned(&mut self, provisioned: bool);
    fn retry(&self) -> &RetrySchedule;
    fn retry_mut(&mut self) -> &mut RetrySchedule;
    fn touch(&mut self, now: DateTime<Utc>);

    /// Pure form of the claim-queue dependency predicate, evaluated against
    /// the device's multicast-setup rows.
    fn prerequisite_satisfied(&self, setups: &[RemoteMulticastSetup]) -> bool;

    /// Device confirmed the session.
    fn mark_provisioned(&mut self, now: DateTime<Utc>) {
        self.set_provisioned(true);
        self.touch(now);
    }

    /// Attempt failed or is still unanswered; push the due time out.
    fn schedule_retry(&mut self, policy: &dyn RetryPolicy, now: DateTime<Utc>) {
        self.retry_mut().schedule_retry(policy, now);
        self.touch(now);
    }

    /// Eligible for dispatch under the claim-queue rules at `now`.
    fn is_pending(
        &self,
        now: DateTime<Utc>,
        max_retry_count: i32,
        setups: &[RemoteMulticastSetup],
    ) -> bool {
        !self.is_provisioned()
            && !self.retry().is_exhausted(max_retry_count)
            && self.retry().is_due(now)
            && self.prerequisite_satisfied(setups)
    }
}

// =============================================================================
// Remote Multicast Setup
// =============================================================================

/// Multicast-group membership on a device (McGroupSetup).
///
/// Unique per (device, multicast group) and per (device, mc_group_id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RemoteMulticastSetup {
    pub dev_eui: DevEui,
    pub multicast_group_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Device-local group slot (0..=3).
    pub mc_group_id: i32,
    pub mc_addr: crate::types::DevAddr,
    /// Multicast key encrypted with the device's McKEKey.
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "Vec<u8>"))]
    pub mc_key_encrypted: crate::types::Aes128Key,
    pub min_mc_f_cnt: i64,
    pub max_mc_f_cnt: i64,
    pub state: SessionState,
    pub state_provisioned: bool,
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub retry: RetrySchedule,
}

impl ProvisioningSession for RemoteMulticastSetup {
    const KIND: SessionKind = SessionKind::MulticastSetup;

    fn dev_eui(&self) -> &DevEui {
        &self.dev_eui
    }

    fn is_provisioned(&self) -> bool {
        self.state_provisioned
    }

    fn set_provisioned(&mut self, provisioned: bool) {
        self.state_provisioned = provisioned;
    }

    fn retry(&self) -> &RetrySchedule {
        &self.retry
    }

    fn retry_mut(&mut self) -> &mut RetrySchedule {
        &mut self.retry
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn prerequisite_satisfied(&self, _setups: &[RemoteMulticastSetup]) -> bool {
        true
    }
}

// =============================================================================
// Remote Fragmentation Session
// =============================================================================

/// Fragmentation transport session on a device (FragSessionSetup).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RemoteFragmentationSession {
    pub dev_eui: DevEui,
    /// Device-local fragmentation slot (0..=3).
    pub frag_index: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Multicast slots the session listens on; empty means unicast.
    #[cfg_attr(feature = "sqlx", sqlx(json))]
    pub mc_group_ids: Vec<i32>,
    pub nb_frag: i32,
    pub frag_size: i32,
    pub fragmentation_matrix: i32,
    pub block_ack_delay: i32,
    pub padding: i32,
    pub descriptor: Vec<u8>,
    pub state: SessionState,
    pub state_provisioned: bool,
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub retry: RetrySchedule,
}

impl ProvisioningSession for RemoteFragmentationSession {
    const KIND: SessionKind = SessionKind::FragmentationSession;

    fn dev_eui(&self) -> &DevEui {
        &self.dev_eui
    }

    fn is_provisioned(&self) -> bool {
        self.state_provisioned
    }

    fn set_provisioned(&mut self, provisioned: bool) {
        self.state_provisioned = provisioned;
    }

    fn retry(&self) -> &RetrySchedule {
        &self.retry
    }

    fn retry_mut(&mut self) -> &mut RetrySchedule {
        &mut self.retry
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn prerequisite_satisfied(&self, setups: &[RemoteMulticastSetup]) -> bool {
        self.mc_group_ids.iter().all(|slot| {
            setups.iter().any(|s| {
                s.dev_eui == self.dev_eui && s.mc_group_id == *slot && s.state_provisioned
            })
        })
    }
}

// =============================================================================
// Remote Multicast Class-C Session
// =============================================================================

/// Scheduled class-C receive window on a device (McClassCSession).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct RemoteMulticastClassCSession {
    pub dev_eui: DevEui,
    pub multicast_group_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub mc_group_id: i32,
    /// When the device opens its receive window.
    pub session_time: DateTime<Utc>,
    /// Session timeout exponent (2^n seconds).
    pub session_time_out: i32,
    pub dl_frequency: i64,
    pub dr: i32,
    pub state_provisioned: bool,
    #[cfg_attr(feature = "sqlx", sqlx(flatten))]
    pub retry: RetrySchedule,
}

impl ProvisioningSession for RemoteMulticastClassCSession {
    const KIND: SessionKind = SessionKind::MulticastClassCSession;

    fn dev_eui(&self) -> &DevEui {
        &self.dev_eui
    }

    fn is_provisioned(&self) -> bool {
        self.state_provisioned
    }

    fn set_provisioned(&mut self, provisioned: bool) {
        self.state_provisioned = provisioned;
    }

    fn retry(&self) -> &RetrySchedule {
        &self.retry
    }

    fn retry_mut(&mut self) -> &mut RetrySchedule {
        &mut self.retry
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn prerequisite_satisfied(&self, setups: &[RemoteMulticastSetup]) -> bool {
        setups.iter().any(|s| {
            s.dev_eui == self.dev_eui
                && s.multicast_group_id == self.multicast_group_id
                && s.state == SessionState::Setup
                && s.state_provisioned
        })
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Aes128Key, DevAddr};
    use chrono::Duration;

    fn setup(dev: &DevEui, group: &str, slot: i32, provisioned: bool) -> RemoteMulticastSetup {
        let now = Utc::now();
        RemoteMulticastSetup {
            dev_eui: dev.clone(),
            multicast_group_id: group.to_string(),
            created_at: now,
            updated_at: now,
            mc_group_id: slot,
            mc_addr: DevAddr::from_bytes([1, 2, 3, 4]),
            mc_key_encrypted: Aes128Key::new([9; 16]),
            min_mc_f_cnt: 0,
            max_mc_f_cnt: 1000,
            state: SessionState::Setup,
            state_provisioned: provisioned,
            retry: RetrySchedule::due_now(),
        }
    }

    fn frag(dev: &DevEui, slots: Vec<i32>) -> RemoteFragmentationSession {
        let now = Utc::now();
        RemoteFragmentationSession {
            dev_eui: dev.clone(),
            frag_index: 0,
            created_at: now,
            updated_at: now,
            mc_group_ids: slots,
            nb_frag: 10,
            frag_size: 50,
            fragmentation_matrix: 0,
            block_ack_delay: 1,
            padding: 0,
            descriptor: vec![0; 4],
            state: SessionState::Setup,
            state_provisioned: false,
            retry: RetrySchedule::due_now(),
        }
    }

    #[test]
    fn test_kind_prerequisites() {
        assert_eq!(SessionKind::MulticastSetup.prerequisite(), Prerequisite::None);
        assert_eq!(
            SessionKind::FragmentationSession.prerequisite(),
            Prerequisite::AllGroupsProvisioned
        );
        assert_eq!(
            SessionKind::MulticastClassCSession.prerequisite(),
            Prerequisite::GroupSetupProvisioned
        );
    }

    #[test]
    fn test_unicast_fragmentation_has_no_dependency() {
        let dev = DevEui::from_bytes([1; 8]);
        assert!(frag(&dev, vec![]).prerequisite_satisfied(&[]));
    }

    #[test]
    fn test_fragmentation_waits_for_every_group() {
        let dev = DevEui::from_bytes([1; 8]);
        let session = frag(&dev, vec![0, 2]);

        let partial = vec![setup(&dev, "g0", 0, true), setup(&dev, "g2", 2, false)];
        assert!(!session.prerequisite_satisfied(&partial));

        let other_device = DevEui::from_bytes([2; 8]);
        let wrong_dev = vec![setup(&dev, "g0", 0, true), setup(&other_device, "g2", 2, true)];
        assert!(!session.prerequisite_satisfied(&wrong_dev));

        let all = vec![setup(&dev, "g0", 0, true), setup(&dev, "g2", 2, true)];
        assert!(session.prerequisite_satisfied(&all));
    }

    #[test]
    fn test_class_c_requires_setup_intent() {
        let dev = DevEui::from_bytes([1; 8]);
        let now = Utc::now();
        let session = RemoteMulticastClassCSession {
            dev_eui: dev.clone(),
            multicast_group_id: "g".to_string(),
            created_at: now,
            updated_at: now,
            mc_group_id: 1,
            session_time: now + Duration::minutes(5),
            session_time_out: 8,
            dl_frequency: 869_525_000,
            dr: 5,
            state_provisioned: false,
            retry: RetrySchedule::due_now(),
        };

        let mut s = setup(&dev, "g", 1, true);
        assert!(session.prerequisite_satisfied(std::slice::from_ref(&s)));

        s.state = SessionState::Delete;
        assert!(!session.prerequisite_satisfied(&[s]));
    }

    #[test]
    fn test_is_pending_honours_retry_bound() {
        let dev = DevEui::from_bytes([1; 8]);
        let mut s = setup(&dev, "g", 0, false);
        let now = Utc::now() + Duration::seconds(1);
        assert!(s.is_pending(now, 3, &[]));

        s.retry.retry_count = 3;
        assert!(!s.is_pending(now, 3, &[]));

        s.retry.retry_count = 0;
        s.mark_provisioned(now);
        assert!(!s.is_pending(now, 3, &[]));
    }
}
