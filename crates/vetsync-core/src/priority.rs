//! Operation classes and admission priorities.
//!
//! Every server call is tagged with an [`OperationClass`]. The class selects
//! the circuit breaker and rate-limit bucket it is accounted against, and
//! maps onto an [`AdmissionPriority`] that orders the connection admission
//! queue.
//!
//! # Priority levels
//!
//! | Priority   | Value | Typical classes                          |
//! |------------|-------|------------------------------------------|
//! | Critical   | 4     | Administration and inventory writes      |
//! | Auth       | 3     | Session and token checks                 |
//! | Read       | 2     | General reads                            |
//! | Analytics  | 1     | Reports, dashboards                      |
//! | Batch      | 0     | Bulk imports, maintenance                |

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// =============================================================================
// AdmissionPriority
// =============================================================================

/// Priority used to order waiters in the admission queue.
///
/// Ordered from lowest (Batch = 0) to highest (Critical = 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionPriority {
    /// Bulk and maintenance work, first to be starved.
    Batch = 0,
    /// Analytics and report generation.
    Analytics = 1,
    /// General reads.
    Read = 2,
    /// Authentication traffic.
    Auth = 3,
    /// User-facing writes (recorded administrations).
    Critical = 4,
}

impl AdmissionPriority {
    /// Numeric value (0–4) for metrics and comparison.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Batch => "batch",
            Self::Analytics => "analytics",
            Self::Read => "read",
            Self::Auth => "auth",
            Self::Critical => "critical",
        }
    }
}

// =============================================================================
// OperationClass
// =============================================================================

/// Class of server operation guarded by the resilience layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    AdministrationWrite,
    InventoryWrite,
    Auth,
    Read,
    Analytics,
    Batch,
}

impl OperationClass {
    /// All classes, in registry order.
    pub const ALL: [Self; 6] = [
        Self::AdministrationWrite,
        Self::InventoryWrite,
        Self::Auth,
        Self::Read,
        Self::Analytics,
        Self::Batch,
    ];

    /// Stable name used for config keys, logs and health output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AdministrationWrite => "administration_write",
            Self::InventoryWrite => "inventory_write",
            Self::Auth => "auth",
            Self::Read => "read",
            Self::Analytics => "analytics",
            Self::Batch => "batch",
        }
    }

    /// Admission priority for this class.
    pub fn priority(self) -> AdmissionPriority {
        match self {
            Self::AdministrationWrite | Self::InventoryWrite => AdmissionPriority::Critical,
            Self::Auth => AdmissionPriority::Auth,
            Self::Read => AdmissionPriority::Read,
            Self::Analytics => AdmissionPriority::Analytics,
            Self::Batch => AdmissionPriority::Batch,
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| format!("unknown operation class: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering() {
        assert!(AdmissionPriority::Critical > AdmissionPriority::Auth);
        assert!(AdmissionPriority::Auth > AdmissionPriority::Read);
        assert!(AdmissionPriority::Read > AdmissionPriority::Analytics);
        assert!(AdmissionPriority::Analytics > AdmissionPriority::Batch);
        assert_eq!(AdmissionPriority::Critical.as_u8(), 4);
    }

    #[test]
    fn writes_are_critical() {
        assert_eq!(
            OperationClass::AdministrationWrite.priority(),
            AdmissionPriority::Critical
        );
        assert_eq!(
            OperationClass::InventoryWrite.priority(),
            AdmissionPriority::Critical
        );
        assert_eq!(OperationClass::Batch.priority(), AdmissionPriority::Batch);
    }

    #[test]
    fn class_name_roundtrip() {
        for class in OperationClass::ALL {
            assert_eq!(class.as_str().parse::<OperationClass>().unwrap(), class);
            assert_eq!(class.to_string(), class.as_str());
        }
        assert!("nope".parse::<OperationClass>().is_err());
    }

    #[test]
    fn class_serde_uses_snake_case() {
        let json = serde_json::to_string(&OperationClass::InventoryWrite).unwrap();
        assert_eq!(json, "\"inventory_write\"");
    }
}
