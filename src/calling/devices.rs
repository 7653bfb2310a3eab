//! Camera/microphone access.
//!
//! `DeviceAccessManager` requests media from a platform `MediaDevices`
//! implementation and translates platform failures into `CallError`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use super::error::CallError;
use super::media::LocalMediaStream;
use crate::config::{FacingMode, MediaConfig};

/// Preferred video capture settings. The platform may pick something else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoConstraints {
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub facing_mode: FacingMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoRequest {
    Off,
    Any,
    Preferred(VideoConstraints),
}

/// What to ask the platform for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: VideoRequest,
}

impl MediaConstraints {
    /// Audio and any camera. Used only to trigger the permission prompt.
    pub fn probe() -> Self {
        Self {
            audio: true,
            video: VideoRequest::Any,
        }
    }

    /// The consultation request: unconstrained audio, preferred-resolution
    /// video unless the configuration turns the camera off.
    pub fn consultation(media: &MediaConfig) -> Self {
        let video = if media.video {
            VideoRequest::Preferred(VideoConstraints {
                ideal_width: media.ideal_width,
                ideal_height: media.ideal_height,
                facing_mode: media.facing_mode,
            })
        } else {
            VideoRequest::Off
        };
        Self { audio: true, video }
    }
}

/// A raw failure as reported by the platform's media API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformMediaError {
    pub name: String,
    pub message: String,
}

impl PlatformMediaError {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl CallError {
    /// Map a platform media failure onto the taxonomy.
    pub fn from_platform(err: &PlatformMediaError) -> Self {
        match err.name.as_str() {
            "NotAllowedError" | "PermissionDeniedError" | "SecurityError" => {
                CallError::PermissionDenied
            }
            "NotFoundError" | "DevicesNotFoundError" | "OverconstrainedError" => {
                CallError::DeviceNotFound
            }
            "NotReadableError" | "TrackStartError" | "AbortError" => CallError::DeviceUnavailable,
            "NotSupportedError" | "TypeError" => CallError::Unsupported,
            _ if err.message.to_lowercase().contains("secure context") => {
                CallError::InsecureContext
            }
            _ => CallError::Unknown,
        }
    }
}

/// Platform media API.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Loopback or encrypted origin.
    fn is_secure_context(&self) -> bool;

    /// Whether the platform exposes camera/microphone capture at all.
    fn supports_media(&self) -> bool;

    async fn get_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, PlatformMediaError>;
}

/// Camera/microphone permission as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionStatus {
    #[default]
    Prompt,
    Granted,
    Denied,
}

/// Requests devices and interprets failures. Cheap to clone; holds no
/// per-attempt state so it can be called again after a failure.
#[derive(Clone)]
pub struct DeviceAccessManager {
    devices: Arc<dyn MediaDevices>,
}

impl DeviceAccessManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self { devices }
    }

    fn check_platform(&self) -> Result<(), CallError> {
        if !self.devices.is_secure_context() {
            return Err(CallError::InsecureContext);
        }
        if !self.devices.supports_media() {
            return Err(CallError::Unsupported);
        }
        Ok(())
    }

    /// Trigger the permission prompt and immediately stop whatever was
    /// captured.
    pub async fn probe_permission(&self) -> Result<PermissionStatus, CallError> {
        let mut stream = self.acquire(&MediaConstraints::probe()).await?;
        let stopped = stream.release();
        tracing::debug!("Permission probe granted, stopped {} probe tracks", stopped);
        Ok(PermissionStatus::Granted)
    }

    /// Acquire a stream for the call.
    pub async fn acquire(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<LocalMediaStream, CallError> {
        self.check_platform()?;

        match self.devices.get_user_media(constraints).await {
            Ok(stream) => {
                tracing::info!(
                    "Acquired local media: {} audio, {} video tracks",
                    stream.audio_tracks().count(),
                    stream.video_tracks().count(),
                );
                Ok(stream)
            }
            Err(e) => {
                let kind = CallError::from_platform(&e);
                tracing::warn!("Media access failed: {}: {} ({:?})", e.name, e.message, kind);
                Err(kind)
            }
        }
    }
}
