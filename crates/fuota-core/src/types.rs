//! # Domain Types
//!
//! Core domain types used throughout the FUOTA orchestrator.
//!
//! ## Type Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────────┐   ┌─────────────────┐   │
//! │  │ FuotaDeployment │──►│FuotaDeploymentDevice│   │ MulticastGroup  │   │
//! │  │  ─────────────  │ 1:n  ─────────────────  │   │  ─────────────  │   │
//! │  │  id (UUID)      │   │  (deployment, dev)  │   │  id (UUID)      │   │
//! │  │  state (9)      │   │  state (3)          │   │  application_id │   │
//! │  │  next_step_after│   │  error_message      │   │  keys           │   │
//! │  └─────────────────┘   └─────────────────────┘   └─────────────────┘   │
//! │                                                                         │
//! │  Lookups (read-only joins):                                            │
//! │  NetworkServer ◄── ServiceProfile ◄── Application ◄── Device           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The three provisioning-session records live in [`crate::session`].

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult, ValidationError};

// =============================================================================
// Identifiers
// =============================================================================

fn parse_hex(field: &str, s: &str, bytes: usize) -> Result<String, ValidationError> {
    let s = s.trim();
    if s.len() != bytes * 2 {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("expected {} hex characters, got {}", bytes * 2, s.len()),
        });
    }
    if !s.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must contain only hex characters".to_string(),
        });
    }
    Ok(s.to_ascii_lowercase())
}

/// 64-bit device EUI, stored as 16 lower-case hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(transparent))]
#[serde(try_from = "String", into = "String")]
pub struct DevEui(String);

impl DevEui {
    /// Builds an EUI from its 8 raw bytes.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        DevEui(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Returns the hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DevEui {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex("dev_eui", s, 8).map(DevEui)
    }
}

impl TryFrom<String> for DevEui {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DevEui> for String {
    fn from(eui: DevEui) -> Self {
        eui.0
    }
}

impl fmt::Display for DevEui {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// 32-bit (multicast) device address, stored as 8 lower-case hex characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(transparent))]
#[serde(try_from = "String", into = "String")]
pub struct DevAddr(String);

impl DevAddr {
    /// Builds an address from its 4 raw bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        DevAddr(bytes.iter().map(|b| format!("{:02x}", b)).collect())
    }

    /// Returns the hex representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for DevAddr {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_hex("mc_addr", s, 4).map(DevAddr)
    }
}

impl TryFrom<String> for DevAddr {
    type Error = ValidationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<DevAddr> for String {
    fn from(addr: DevAddr) -> Self {
        addr.0
    }
}

impl fmt::Display for DevAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// AES-128 key material (session keys, encrypted multicast keys).
///
/// `Debug` never prints the key bytes.
#[derive(Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Aes128Key([u8; 16]);

impl Aes128Key {
    /// Wraps raw key bytes.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Aes128Key(bytes)
    }

    /// Returns the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Returns the key bytes as an owned vector (database encoding).
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl TryFrom<Vec<u8>> for Aes128Key {
    type Error = ValidationError;

    fn try_from(bytes: Vec<u8>) -> Result<Self, Self::Error> {
        let actual = bytes.len();
        let key: [u8; 16] = bytes
            .try_into()
            .map_err(|_| ValidationError::InvalidLength {
                field: "aes128_key".to_string(),
                expected: 16,
                actual,
            })?;
        Ok(Aes128Key(key))
    }
}

impl fmt::Debug for Aes128Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Aes128Key(..)")
    }
}

// =============================================================================
// Multicast Group Type
// =============================================================================

/// LoRaWAN multicast class used for a group or a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
pub enum GroupType {
    /// Class-B: downlinks in scheduled ping slots.
    B,
    /// Class-C: downlinks during a continuous receive window.
    C,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupType::B => f.write_str("B"),
            GroupType::C => f.write_str("C"),
        }
    }
}

// =============================================================================
// Deployment State
// =============================================================================

/// Top-level state of a FUOTA deployment.
///
/// ## State Order
/// ```text
/// MC_CREATE ─► MC_SETUP ─► FRAG_SESS_SETUP ─► MC_SESS_C_SETUP ─► ENQUEUE
///     ─► STATUS_REQUEST ─► SET_DEVICE_STATUS ─► CLEANUP ─► DONE
/// ```
///
/// The step executor performs one state's worth of work per invocation and
/// then moves forward. States may be skipped (a class-B rollout has no
/// class-C session step) but never revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "SCREAMING_SNAKE_CASE"))]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentState {
    McCreate,
    McSetup,
    FragSessSetup,
    McSessCSetup,
    Enqueue,
    StatusRequest,
    SetDeviceStatus,
    Cleanup,
    Done,
}

impl DeploymentState {
    /// All states in execution order.
    pub const ALL: [DeploymentState; 9] = [
        DeploymentState::McCreate,
        DeploymentState::McSetup,
        DeploymentState::FragSessSetup,
        DeploymentState::McSessCSetup,
        DeploymentState::Enqueue,
        DeploymentState::StatusRequest,
        DeploymentState::SetDeviceStatus,
        DeploymentState::Cleanup,
        DeploymentState::Done,
    ];

    /// Position of this state in [`DeploymentState::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// The state that follows this one, or `None` for DONE.
    pub fn next(self) -> Option<DeploymentState> {
        Self::ALL.get(self.index() + 1).copied()
    }

    /// True only for DONE.
    pub fn is_terminal(self) -> bool {
        self == DeploymentState::Done
    }

    /// True if `target` lies strictly after this state.
    pub fn can_advance_to(self, target: DeploymentState) -> bool {
        target.index() > self.index()
    }

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            DeploymentState::McCreate => "MC_CREATE",
            DeploymentState::McSetup => "MC_SETUP",
            DeploymentState::FragSessSetup => "FRAG_SESS_SETUP",
            DeploymentState::McSessCSetup => "MC_SESS_C_SETUP",
            DeploymentState::Enqueue => "ENQUEUE",
            DeploymentState::StatusRequest => "STATUS_REQUEST",
            DeploymentState::SetDeviceStatus => "SET_DEVICE_STATUS",
            DeploymentState::Cleanup => "CLEANUP",
            DeploymentState::Done => "DONE",
        }
    }
}

impl Default for DeploymentState {
    fn default() -> Self {
        DeploymentState::McCreate
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentState {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|state| state.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| ValidationError::InvalidFormat {
                field: "state".to_string(),
                reason: format!("unknown deployment state '{}'", s),
            })
    }
}

// =============================================================================
// Per-Device Outcome State
// =============================================================================

/// Outcome of a deployment for a single device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "UPPERCASE"))]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceState {
    Pending,
    Success,
    Error,
}

impl DeviceState {
    /// SUCCESS and ERROR are terminal.
    pub fn is_terminal(self) -> bool {
        !matches!(self, DeviceState::Pending)
    }

    /// Outcomes only move from PENDING to a terminal state.
    pub fn can_transition_to(self, target: DeviceState) -> bool {
        self == DeviceState::Pending && target.is_terminal()
    }

    /// Database / wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Pending => "PENDING",
            DeviceState::Success => "SUCCESS",
            DeviceState::Error => "ERROR",
        }
    }
}

impl Default for DeviceState {
    fn default() -> Self {
        DeviceState::Pending
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// FUOTA Deployment
// =============================================================================

/// A firmware rollout to a set of devices over a multicast group.
///
/// ## Invariants
/// - `state` only moves forward (see [`DeploymentState`])
/// - `next_step_after` is refreshed on every state change
/// - the target device set is bound at creation and never changes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FuotaDeployment {
    /// Unique identifier (UUID v4).
    pub id: String,

    /// When the deployment was created.
    pub created_at: DateTime<Utc>,

    /// When the deployment was last written.
    pub updated_at: DateTime<Utc>,

    /// Human readable name.
    pub name: String,

    /// Multicast group used for the rollout (set during MC_CREATE).
    pub multicast_group_id: Option<String>,

    /// Class B or class C delivery.
    pub group_type: GroupType,

    /// Downlink data rate.
    pub dr: i32,

    /// Downlink frequency (Hz).
    pub frequency: i64,

    /// Class-B ping-slot period.
    pub ping_slot_period: i32,

    /// Fragmentation matrix selector.
    pub fragmentation_matrix: i32,

    /// 4-byte fragmentation session descriptor.
    pub descriptor: Vec<u8>,

    /// Firmware image to deliver.
    pub payload: Vec<u8>,

    /// Size of each fragment in bytes.
    pub frag_size: i32,

    /// Number of redundancy fragments.
    pub redundancy: i32,

    /// Block-ack delay exponent.
    pub block_ack_delay: i32,

    /// Multicast session timeout exponent (2^n seconds).
    pub multicast_timeout: i32,

    /// Time to wait for a unicast answer, in seconds.
    pub unicast_timeout_secs: i64,

    /// Current top-level state.
    pub state: DeploymentState,

    /// Earliest time the next step may run.
    pub next_step_after: DateTime<Utc>,
}

impl FuotaDeployment {
    /// Creates a deployment in MC_CREATE with default radio and
    /// fragmentation parameters, due immediately.
    pub fn new(name: impl Into<String>, group_type: GroupType, payload: Vec<u8>) -> Self {
        let now = Utc::now();
        FuotaDeployment {
            id: uuid::Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            name: name.into(),
            multicast_group_id: None,
            group_type,
            dr: 5,
            frequency: 869_525_000,
            ping_slot_period: 128,
            fragmentation_matrix: 0,
            descriptor: vec![0; 4],
            payload,
            frag_size: 50,
            redundancy: 5,
            block_ack_delay: 1,
            multicast_timeout: 7,
            unicast_timeout_secs: 60,
            state: DeploymentState::McCreate,
            next_step_after: now,
        }
    }

    /// Unicast timeout as a duration.
    pub fn unicast_timeout(&self) -> Duration {
        Duration::seconds(self.unicast_timeout_secs)
    }

    /// Number of data fragments the payload splits into (before redundancy).
    pub fn fragment_count(&self) -> i64 {
        if self.frag_size <= 0 {
            return 0;
        }
        let size = self.frag_size as i64;
        (self.payload.len() as i64 + size - 1) / size
    }

    /// Padding bytes appended to the last fragment.
    pub fn padding(&self) -> i64 {
        let count = self.fragment_count();
        count * self.frag_size as i64 - self.payload.len() as i64
    }

    /// Moves the deployment forward to `target` and sets its next due time.
    ///
    /// ## Errors
    /// `CoreError::InvalidTransition` if `target` is not after the current state.
    pub fn advance(
        &mut self,
        target: DeploymentState,
        next_step_after: DateTime<Utc>,
    ) -> CoreResult<()> {
        if !self.state.can_advance_to(target) {
            return Err(CoreError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        self.next_step_after = next_step_after;
        Ok(())
    }

    /// Moves to the state directly after the current one.
    pub fn advance_to_next(&mut self, next_step_after: DateTime<Utc>) -> CoreResult<()> {
        let target = self.state.next().ok_or_else(|| CoreError::InvalidTransition {
            from: self.state.to_string(),
            to: "<none>".to_string(),
        })?;
        self.advance(target, next_step_after)
    }
}

/// One device bound to a deployment, with its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FuotaDeploymentDevice {
    pub fuota_deployment_id: String,
    pub dev_eui: DevEui,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub state: DeviceState,
    /// Set only when `state` is ERROR.
    pub error_message: Option<String>,
}

impl FuotaDeploymentDevice {
    /// Records a terminal outcome.
    ///
    /// ## Rules
    /// - only PENDING rows may change
    /// - ERROR requires a message, SUCCESS forbids one
    pub fn set_outcome(&mut self, state: DeviceState, error_message: Option<String>) -> CoreResult<()> {
        if !self.state.can_transition_to(state) {
            return Err(CoreError::DeviceStateTerminal {
                dev_eui: self.dev_eui.to_string(),
                state: self.state.to_string(),
            });
        }
        crate::validation::validate_device_outcome(state, error_message.as_deref())?;
        self.state = state;
        self.error_message = error_message;
        Ok(())
    }
}

/// Summary row for deployment listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FuotaDeploymentListItem {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub state: DeploymentState,
    pub next_step_after: DateTime<Utc>,
}

/// Device outcome row joined with the device name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct FuotaDeploymentDeviceListItem {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub fuota_deployment_id: String,
    pub dev_eui: DevEui,
    pub device_name: String,
    pub state: DeviceState,
    pub error_message: Option<String>,
}

/// Filters for listing and counting deployments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentFilters {
    /// Only deployments targeting this device.
    pub dev_eui: Option<DevEui>,
    /// Only deployments targeting devices of this application.
    pub application_id: Option<i64>,
}

// =============================================================================
// Lookups
// =============================================================================

/// A network server and the client certificates used to reach it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct NetworkServer {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    /// `host:port` of the network-server API.
    pub server: String,
    pub ca_cert: String,
    pub tls_cert: String,
    pub tls_key: String,
}

/// Service profile binding applications to a network server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ServiceProfile {
    pub id: String,
    pub name: String,
    pub network_server_id: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Application {
    pub id: i64,
    pub name: String,
    pub service_profile_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Device {
    pub dev_eui: DevEui,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub application_id: i64,
}

// =============================================================================
// Multicast Group
// =============================================================================

/// Local mirror of a multicast group.
///
/// The authoritative copy (address, network session key, radio settings)
/// lives on the network server; `network_server` carries it when the group
/// was read with the remote lookup enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct MulticastGroup {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub application_id: i64,
    /// Application session key shared by the group.
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "Vec<u8>"))]
    pub mc_app_s_key: Aes128Key,
    /// Root multicast key, from which the session keys are derived.
    #[cfg_attr(feature = "sqlx", sqlx(try_from = "Vec<u8>"))]
    pub mc_key: Aes128Key,
    #[cfg_attr(feature = "sqlx", sqlx(skip))]
    pub network_server: Option<NsMulticastGroup>,
}

/// The network-server side of a multicast group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NsMulticastGroup {
    pub id: String,
    pub mc_addr: DevAddr,
    pub mc_nwk_s_key: Aes128Key,
    pub f_cnt: u32,
    pub group_type: GroupType,
    pub dr: i32,
    pub frequency: i64,
    pub ping_slot_period: i32,
    pub service_profile_id: String,
}

// =============================================================================
// Unit Tests
// =============================================================================
