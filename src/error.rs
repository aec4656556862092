//! Error types for conf-media.
//!
//! The pipeline boundary does not leak failures: device problems are logged
//! with device identity plus requested/actual format, the affected output
//! becomes `None`, and the session retries on the next access. The variants
//! here name the failure taxonomy for logs and for the external collaborators
//! (device enumeration, transport) that return `Result`s into the core. Only
//! caller misuse ([`MediaError::KindMismatch`]) fails fast.

use crate::format::MediaKind;

/// Failures raised by devices, pipelines, and the mixer.
#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    /// Pipeline construction failed because the capture device could not be
    /// opened or connected.
    ///
    /// Non-fatal: the session's output becomes `None` and construction is
    /// retried on the next output access or format change.
    #[error("device unavailable: {device}: {reason}")]
    DeviceUnavailable {
        /// Identity of the device that failed.
        device: String,
        /// Why the device could not be used.
        reason: String,
    },

    /// The requested format is absent from the device's supported list.
    ///
    /// The affected track is disabled; the rest of the session continues.
    #[error("format not supported by {device}: requested {requested}")]
    FormatUnsupported {
        /// Identity of the device that rejected the format.
        device: String,
        /// The format that was requested.
        requested: String,
    },

    /// The pipeline closed before it was expected to.
    ///
    /// Flagged on the owning session; not retried automatically. The next
    /// format-set or output access forces a rebuild instead of reusing the
    /// dead pipeline.
    #[error("pipeline closed prematurely on {device}: {reason}")]
    PrematureClosure {
        /// Identity of the device whose pipeline closed.
        device: String,
        /// Why the pipeline closed, as reported by the worker.
        reason: String,
    },

    /// An optional codec/effect stage could not be inserted.
    ///
    /// Logged and skipped; the pipeline continues without the stage, so
    /// levels/effects degrade gracefully while media still flows.
    #[error("optional stage '{stage}' unavailable: {reason}")]
    PluginMissing {
        /// Name of the stage that could not be created.
        stage: String,
        /// Why the stage was unavailable.
        reason: String,
    },

    /// A format of the wrong media kind was passed to a session.
    ///
    /// Caller misuse; fails fast rather than being absorbed.
    #[error("media kind mismatch: expected {expected}, got {actual}")]
    KindMismatch {
        /// The kind the session handles.
        expected: MediaKind,
        /// The kind the caller supplied.
        actual: MediaKind,
    },

    /// A device cannot serve the role it was given (e.g. a render-only
    /// device handed to the mixer as its capture).
    #[error("invalid device {device}: {reason}")]
    InvalidDevice {
        /// Identity of the offending device.
        device: String,
        /// Why the device cannot be used in this role.
        reason: String,
    },

    /// A renderer failed to consume a chunk.
    #[error("renderer '{renderer}' failed: {reason}")]
    RenderFailed {
        /// Name of the renderer that failed.
        renderer: String,
        /// Description of the failure.
        reason: String,
    },
}

impl MediaError {
    /// Creates a [`MediaError::DeviceUnavailable`] with the given identity
    /// and reason.
    pub fn device_unavailable(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`MediaError::PluginMissing`] for the given stage.
    pub fn plugin_missing(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PluginMissing {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Creates a [`MediaError::RenderFailed`] for the given renderer.
    pub fn render_failed(renderer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RenderFailed {
            renderer: renderer.into(),
            reason: reason.into(),
        }
    }
}
