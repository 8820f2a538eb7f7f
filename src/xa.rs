//! XA return codes and their classification
//!
//! Resource proxies and remote domains answer prepare/commit/rollback with a
//! standard XA code; the transaction manager's state machine branches on the
//! classification, not on individual values.

use serde::{Deserialize, Serialize};

/// XA return codes surfaced by resource managers.
///
/// The numeric values are the ones defined by the XA specification and are
/// stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum XaCode {
    Ok,
    ReadOnly,
    HeuristicHazard,
    HeuristicCommit,
    HeuristicRollback,
    HeuristicMixed,
    Retry,
    RollbackUnspecified,
    RollbackCommunication,
    RollbackDeadlock,
    RollbackIntegrity,
    RollbackOther,
    RollbackProtocol,
    RollbackTimeout,
    RollbackTransient,
    AsyncOperation,
    ResourceError,
    ResourceFailure,
    InvalidXid,
    InvalidArguments,
    ProtocolError,
    Duplicate,
    OutsideGlobal,
}

impl XaCode {
    /// Wire value per the XA specification
    #[must_use]
    pub fn value(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::ReadOnly => 3,
            Self::HeuristicHazard => 8,
            Self::HeuristicCommit => 7,
            Self::HeuristicRollback => 6,
            Self::HeuristicMixed => 5,
            Self::Retry => 4,
            Self::RollbackUnspecified => 100,
            Self::RollbackCommunication => 101,
            Self::RollbackDeadlock => 102,
            Self::RollbackIntegrity => 103,
            Self::RollbackOther => 104,
            Self::RollbackProtocol => 105,
            Self::RollbackTimeout => 106,
            Self::RollbackTransient => 107,
            Self::AsyncOperation => -2,
            Self::ResourceError => -3,
            Self::ResourceFailure => -7,
            Self::InvalidXid => -4,
            Self::InvalidArguments => -5,
            Self::ProtocolError => -6,
            Self::Duplicate => -8,
            Self::OutsideGlobal => -9,
        }
    }

    /// Decodes a wire value; unknown values map to [`XaCode::ResourceError`]
    #[must_use]
    pub fn from_value(value: i32) -> Self {
        match value {
            0 => Self::Ok,
            3 => Self::ReadOnly,
            8 => Self::HeuristicHazard,
            7 => Self::HeuristicCommit,
            6 => Self::HeuristicRollback,
            5 => Self::HeuristicMixed,
            4 => Self::Retry,
            100 => Self::RollbackUnspecified,
            101 => Self::RollbackCommunication,
            102 => Self::RollbackDeadlock,
            103 => Self::RollbackIntegrity,
            104 => Self::RollbackOther,
            105 => Self::RollbackProtocol,
            106 => Self::RollbackTimeout,
            107 => Self::RollbackTransient,
            -2 => Self::AsyncOperation,
            -4 => Self::InvalidXid,
            -5 => Self::InvalidArguments,
            -6 => Self::ProtocolError,
            -7 => Self::ResourceFailure,
            -8 => Self::Duplicate,
            -9 => Self::OutsideGlobal,
            _ => Self::ResourceError,
        }
    }

    /// A prepare answered with this code lets the transaction proceed
    #[must_use]
    pub fn prepare_ok(self) -> bool {
        matches!(self, Self::Ok | Self::ReadOnly)
    }

    /// The resource has made a unilateral (heuristic) decision; the
    /// transaction becomes terminal and the log keeps the evidence
    #[must_use]
    pub fn is_heuristic(self) -> bool {
        matches!(
            self,
            Self::HeuristicHazard
                | Self::HeuristicCommit
                | Self::HeuristicRollback
                | Self::HeuristicMixed
        )
    }

    /// The resource already rolled the branch back
    #[must_use]
    pub fn is_rollback(self) -> bool {
        (100..=107).contains(&self.value())
    }
}

impl std::fmt::Display for XaCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}({})", self.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_value_round_trip() {
        let codes = [
            XaCode::Ok,
            XaCode::ReadOnly,
            XaCode::HeuristicHazard,
            XaCode::HeuristicCommit,
            XaCode::HeuristicRollback,
            XaCode::HeuristicMixed,
            XaCode::Retry,
            XaCode::RollbackUnspecified,
            XaCode::RollbackDeadlock,
            XaCode::RollbackTimeout,
            XaCode::ResourceFailure,
            XaCode::InvalidXid,
            XaCode::ProtocolError,
        ];
        for code in codes {
            assert_eq!(XaCode::from_value(code.value()), code);
        }
    }

    #[test]
    fn classification() {
        assert!(XaCode::Ok.prepare_ok());
        assert!(XaCode::ReadOnly.prepare_ok());
        assert!(!XaCode::RollbackDeadlock.prepare_ok());
        assert!(XaCode::HeuristicMixed.is_heuristic());
        assert!(XaCode::RollbackTimeout.is_rollback());
        assert!(!XaCode::Ok.is_rollback());
    }

    #[test]
    fn unknown_wire_value_degrades_to_resource_error() {
        assert_eq!(XaCode::from_value(4711), XaCode::ResourceError);
    }
}
