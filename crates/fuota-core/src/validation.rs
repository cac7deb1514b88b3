//! # Validation Module
//!
//! Input validation for deployments, per-device outcomes, provisioning
//! sessions and multicast groups.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Caller (step executor / API layer)                           │
//! │  └── Deserialisation into typed values (DevEui, Aes128Key, ...)        │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Repository create/update                                     │
//! │  └── THIS MODULE: ranges, lengths, cross-field rules                   │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Database (SQLite)                                            │
//! │  ├── NOT NULL / CHECK constraints                                      │
//! │  ├── UNIQUE constraints (AlreadyExists)                                │
//! │  └── Foreign key constraints                                           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//! ```rust
//! use fuota_core::validation::{validate_mc_group_id, validate_frag_index};
//!
//! assert!(validate_mc_group_id(2).is_ok());
//! assert!(validate_frag_index(4).is_err());
//! ```

use std::collections::HashSet;

use crate::error::ValidationError;
use crate::session::{
    RemoteFragmentationSession, RemoteMulticastClassCSession, RemoteMulticastSetup,
};
use crate::types::{DevEui, DeviceState, FuotaDeployment};
use crate::{DESCRIPTOR_LEN, MAX_FRAG_INDEX, MAX_MC_GROUP_ID, MAX_NAME_LEN};

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

fn check_range(field: &str, value: i64, min: i64, max: i64) -> ValidationResult<()> {
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            min,
            max,
        });
    }
    Ok(())
}

fn check_descriptor(descriptor: &[u8]) -> ValidationResult<()> {
    if descriptor.len() != DESCRIPTOR_LEN {
        return Err(ValidationError::InvalidLength {
            field: "descriptor".to_string(),
            expected: DESCRIPTOR_LEN,
            actual: descriptor.len(),
        });
    }
    Ok(())
}

// =============================================================================
// String Validators
// =============================================================================

/// Validates a deployment or multicast-group name.
///
/// ## Rules
/// - Must not be empty (after trimming)
/// - At most 100 characters
pub fn validate_name(field: &str, name: &str) -> ValidationResult<()> {
    let name = name.trim();

    if name.is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }

    if name.chars().count() > MAX_NAME_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_NAME_LEN,
        });
    }

    Ok(())
}

/// Validates a UUID string identifier.
///
/// ## Example
/// ```rust
/// use fuota_core::validation::validate_uuid;
///
/// assert!(validate_uuid("id", "67e55044-10b1-426f-9247-bb680e5fe0c8").is_ok());
/// assert!(validate_uuid("id", "not-a-uuid").is_err());
/// ```
pub fn validate_uuid(field: &str, id: &str) -> ValidationResult<()> {
    uuid::Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: e.to_string(),
        })
}

// =============================================================================
// Slot Validators
// =============================================================================

/// Device-local multicast group slot: 0..=3.
pub fn validate_mc_group_id(mc_group_id: i32) -> ValidationResult<()> {
    check_range("mc_group_id", mc_group_id as i64, 0, MAX_MC_GROUP_ID as i64)
}

/// Device-local fragmentation session slot: 0..=3.
pub fn validate_frag_index(frag_index: i32) -> ValidationResult<()> {
    check_range("frag_index", frag_index as i64, 0, MAX_FRAG_INDEX as i64)
}

// =============================================================================
// Deployment Validators
// =============================================================================

/// Validates a deployment before it is written.
///
/// ## Rules
/// - name required, at most 100 characters
/// - payload must not be empty
/// - descriptor exactly 4 bytes
/// - frag_size 1..=255, redundancy >= 0, matrix 0..=255
/// - block_ack_delay 0..=7, multicast_timeout 0..=15, dr 0..=15
/// - frequency and unicast timeout strictly positive
pub fn validate_deployment(deployment: &FuotaDeployment) -> ValidationResult<()> {
    validate_name("name", &deployment.name)?;

    if deployment.payload.is_empty() {
        return Err(ValidationError::Required {
            field: "payload".to_string(),
        });
    }

    check_descriptor(&deployment.descriptor)?;
    check_range("frag_size", deployment.frag_size as i64, 1, 255)?;
    check_range("redundancy", deployment.redundancy as i64, 0, i32::MAX as i64)?;
    check_range(
        "fragmentation_matrix",
        deployment.fragmentation_matrix as i64,
        0,
        255,
    )?;
    check_range("block_ack_delay", deployment.block_ack_delay as i64, 0, 7)?;
    check_range("multicast_timeout", deployment.multicast_timeout as i64, 0, 15)?;
    check_range("dr", deployment.dr as i64, 0, 15)?;
    check_range("frequency", deployment.frequency, 1, i64::MAX)?;
    check_range(
        "unicast_timeout_secs",
        deployment.unicast_timeout_secs,
        1,
        i64::MAX,
    )?;

    if let Some(group_id) = &deployment.multicast_group_id {
        validate_uuid("multicast_group_id", group_id)?;
    }

    Ok(())
}

/// Validates the device set bound to a new deployment.
///
/// ## Rules
/// - At least one device
/// - No device listed twice
pub fn validate_device_list(devices: &[DevEui]) -> ValidationResult<()> {
    if devices.is_empty() {
        return Err(ValidationError::Required {
            field: "devices".to_string(),
        });
    }

    let mut seen = HashSet::with_capacity(devices.len());
    for dev_eui in devices {
        if !seen.insert(dev_eui) {
            return Err(ValidationError::Duplicate {
                field: "dev_eui".to_string(),
                value: dev_eui.to_string(),
            });
        }
    }

    Ok(())
}

/// An ERROR outcome carries a non-empty message; any other outcome carries none.
pub fn validate_device_outcome(
    state: DeviceState,
    error_message: Option<&str>,
) -> ValidationResult<()> {
    match (state, error_message) {
        (DeviceState::Error, Some(msg)) if !msg.trim().is_empty() => Ok(()),
        (DeviceState::Error, _) => Err(ValidationError::Required {
            field: "error_message".to_string(),
        }),
        (_, None) => Ok(()),
        (_, Some(_)) => Err(ValidationError::Inconsistent {
            field: "error_message".to_string(),
            reason: format!("only allowed when state is ERROR, got {}", state),
        }),
    }
}

// =============================================================================
// Session Validators
// =============================================================================

pub fn validate_multicast_setup(setup: &RemoteMulticastSetup) -> ValidationResult<()> {
    validate_uuid("multicast_group_id", &setup.multicast_group_id)?;
    validate_mc_group_id(setup.mc_group_id)?;

    if setup.min_mc_f_cnt < 0 || setup.max_mc_f_cnt < setup.min_mc_f_cnt {
        return Err(ValidationError::Inconsistent {
            field: "max_mc_f_cnt".to_string(),
            reason: format!(
                "frame counter range {}..={} is empty or negative",
                setup.min_mc_f_cnt, setup.max_mc_f_cnt
            ),
        });
    }

    Ok(())
}

pub fn validate_fragmentation_session(
    session: &RemoteFragmentationSession,
) -> ValidationResult<()> {
    validate_frag_index(session.frag_index)?;

    let mut seen = HashSet::new();
    for slot in &session.mc_group_ids {
        validate_mc_group_id(*slot)?;
        if !seen.insert(*slot) {
            return Err(ValidationError::Duplicate {
                field: "mc_group_ids".to_string(),
                value: slot.to_string(),
            });
        }
    }

    check_descriptor(&session.descriptor)?;
    check_range("nb_frag", session.nb_frag as i64, 1, u16::MAX as i64)?;
    check_range("frag_size", session.frag_size as i64, 1, 255)?;
    check_range("padding", session.padding as i64, 0, 255)?;
    check_range("block_ack_delay", session.block_ack_delay as i64, 0, 7)?;
    Ok(())
}

pub fn validate_class_c_session(session: &RemoteMulticastClassCSession) -> ValidationResult<()> {
    validate_uuid("multicast_group_id", &session.multicast_group_id)?;
    validate_mc_group_id(session.mc_group_id)?;
    check_range("session_time_out", session.session_time_out as i64, 0, 15)?;
    check_range("dr", session.dr as i64, 0, 15)?;
    check_range("dl_frequency", session.dl_frequency, 1, i64::MAX)?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================
