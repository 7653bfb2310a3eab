//! Call failure taxonomy.
//!
//! Every failure a session can hit is reported as one of these values. The
//! `Display` text is what the user sees; raw platform or fabric errors are
//! logged where they are translated and never shown.

use serde::Serialize;
use thiserror::Error;

/// What a call failure means to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallError {
    #[error("This feature requires a secure connection (HTTPS). Please check your connection.")]
    InsecureContext,
    #[error("Camera and microphone access was denied. Please allow access in your browser settings.")]
    PermissionDenied,
    #[error("No camera or microphone found. Please check your device.")]
    DeviceNotFound,
    #[error("Could not access your camera/microphone. Please make sure no other application is using them.")]
    DeviceUnavailable,
    #[error("This browser does not support camera and microphone access.")]
    Unsupported,
    #[error("Could not connect to patient. Please try again.")]
    ResolutionTimeout,
    #[error("Connection error. Please try again.")]
    SignalingError,
    #[error("Connection lost. Please rejoin the call to try again.")]
    ConnectionLost,
    #[error("Failed to access media devices. Please check your permissions and try again.")]
    Unknown,
}

/// The single action offered next to an error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryAction {
    TryAgain,
    Back,
}

impl RecoveryAction {
    pub fn label(&self) -> &'static str {
        match self {
            RecoveryAction::TryAgain => "Try again",
            RecoveryAction::Back => "Back to Appointments",
        }
    }
}

impl CallError {
    /// Whether this failure came from camera/microphone access.
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            CallError::InsecureContext
                | CallError::PermissionDenied
                | CallError::DeviceNotFound
                | CallError::DeviceUnavailable
                | CallError::Unsupported
                | CallError::Unknown
        )
    }

    /// Failures the user can fix and retry get "try again", the rest send
    /// them back.
    pub fn recovery_action(&self) -> RecoveryAction {
        match self {
            CallError::PermissionDenied
            | CallError::DeviceNotFound
            | CallError::DeviceUnavailable
            | CallError::ResolutionTimeout
            | CallError::SignalingError => RecoveryAction::TryAgain,
            CallError::InsecureContext
            | CallError::Unsupported
            | CallError::ConnectionLost
            | CallError::Unknown => RecoveryAction::Back,
        }
    }
}
