use thiserror::Error;

use crate::call::CallStatus;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HavenError {
    #[error("insufficient wallet balance")]
    InsufficientFunds,
    #[error("invalid amount: {0}")]
    InvalidAmount(String),
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("peer identity already registered: {0}")]
    IdentityTaken(String),
    #[error("precondition failed: {0}")]
    Precondition(String),
    #[error("cannot {op} while {from:?}")]
    InvalidTransition { from: CallStatus, op: &'static str },
    #[error("another {0} is already in progress")]
    OperationPending(&'static str),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error("call coordinator destroyed")]
    Destroyed,
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("configuration error: {0}")]
    Config(String),
}

impl HavenError {
    /// User-facing status line. Money, permission and connectivity problems
    /// each read differently so the user knows what is blocking them.
    pub fn status_text(&self) -> &'static str {
        match self {
            HavenError::InsufficientFunds => "Insufficient balance. Please top up your wallet.",
            HavenError::InvalidAmount(_) => "Please enter a valid amount.",
            HavenError::PermissionDenied(_) => "Camera or microphone permission denied.",
            HavenError::DeviceUnavailable(_) => "Camera or microphone not available.",
            HavenError::Signaling(_) => "Connection failed. Please retry.",
            HavenError::IdentityTaken(_) => "This account is already in a call elsewhere.",
            HavenError::Precondition(_) => "Turn on your camera or microphone first.",
            HavenError::InvalidTransition { .. } => "That action is not available right now.",
            HavenError::OperationPending(_) => "Please wait, still connecting.",
            HavenError::Timeout(_) => "The other person did not respond.",
            HavenError::Cancelled => "Call cancelled.",
            HavenError::Destroyed => "Call closed.",
            HavenError::Persistence(_) => "Could not save your progress; retrying.",
            HavenError::Config(_) => "Invalid settings.",
        }
    }
}
