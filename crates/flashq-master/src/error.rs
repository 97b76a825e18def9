//! Error types for master coordination operations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result code carried by every client-facing response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Success,
    BadRequest,
    HbNoNode,
    InternalError,
    NotLeader,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Success => 200,
            ErrorCode::BadRequest => 400,
            ErrorCode::HbNoNode => 411,
            ErrorCode::InternalError => 500,
            ErrorCode::NotLeader => 503,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::Success => "SUCCESS",
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::HbNoNode => "HB_NO_NODE",
            ErrorCode::InternalError => "INTERNAL_ERROR",
            ErrorCode::NotLeader => "NOT_LEADER",
        };
        write!(f, "{name}({})", self.as_u16())
    }
}

/// Main error type for master operations.
#[derive(Debug, Clone, PartialEq)]
pub enum MasterError {
    /// Malformed or inconsistent request input. No state was mutated.
    BadRequest {
        context: String,
        reason: String,
    },
    /// Heartbeat from a node that is not registered.
    NoSuchNode {
        node: String,
    },
    /// This instance is not the active primary.
    NotLeader {
        master: String,
    },
    /// Row lock could not be acquired within the configured wait.
    LockTimeout {
        lock: String,
        key: String,
    },
    BrokerNotConfigured {
        broker_id: u32,
    },
    /// Invalid configuration or manifest content.
    InvalidConfig {
        context: String,
        reason: String,
    },
    /// Configuration or manifest file I/O error.
    ConfigIo {
        context: String,
        reason: String,
    },
    Internal {
        context: String,
        reason: String,
    },
}

impl fmt::Display for MasterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MasterError::BadRequest { context, reason } => {
                write!(f, "Bad request in {context}: {reason}")
            }
            MasterError::NoSuchNode { node } => {
                write!(f, "Node {node} is not registered")
            }
            MasterError::NotLeader { master } => {
                write!(f, "Master {master} is not the current leader")
            }
            MasterError::LockTimeout { lock, key } => {
                write!(f, "Timed out acquiring {lock} row lock for '{key}'")
            }
            MasterError::BrokerNotConfigured { broker_id } => {
                write!(f, "Broker with ID {broker_id} has no configuration")
            }
            MasterError::InvalidConfig { context, reason } => {
                write!(f, "Invalid configuration in {context}: {reason}")
            }
            MasterError::ConfigIo { context, reason } => {
                write!(f, "Configuration I/O error in {context}: {reason}")
            }
            MasterError::Internal { context, reason } => {
                write!(f, "Internal error in {context}: {reason}")
            }
        }
    }
}

impl std::error::Error for MasterError {}

impl MasterError {
    /// Result code reported to the client for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            MasterError::BadRequest { .. } | MasterError::BrokerNotConfigured { .. } => {
                ErrorCode::BadRequest
            }
            MasterError::NoSuchNode { .. } => ErrorCode::HbNoNode,
            MasterError::NotLeader { .. } => ErrorCode::NotLeader,
            MasterError::LockTimeout { .. }
            | MasterError::InvalidConfig { .. }
            | MasterError::ConfigIo { .. }
            | MasterError::Internal { .. } => ErrorCode::InternalError,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MasterError::BadRequest { .. }
                | MasterError::NoSuchNode { .. }
                | MasterError::BrokerNotConfigured { .. }
        )
    }

    /// Errors the caller may retry later, possibly against another master.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MasterError::NotLeader { .. } | MasterError::LockTimeout { .. }
        )
    }

    pub fn bad_request(context: &str, reason: impl Into<String>) -> Self {
        MasterError::BadRequest {
            context: context.to_string(),
            reason: reason.into(),
        }
    }

    pub fn from_io_error(e: std::io::Error, context: &str) -> Self {
        MasterError::ConfigIo {
            context: context.to_string(),
            reason: e.to_string(),
        }
    }

    pub fn from_parse_error(e: impl std::fmt::Display, context: &str) -> Self {
        MasterError::InvalidConfig {
            context: context.to_string(),
            reason: e.to_string(),
        }
    }
}
