//! Device capability traits and the device registry.
//!
//! Platform device discovery lives outside this crate. What the core
//! consumes is a small capability surface: a [`MediaDevice`] can report its
//! direction and supported formats, open a [`CaptureHandle`], and create a
//! [`Renderer`]. Specialized behavior (mixing, translation) composes by
//! wrapping a device, not by subclassing it — see
//! [`MixerDevice`](crate::MixerDevice).

mod mock;

pub use mock::{MockCapture, MockDevice, MockInbound, MockRenderer};

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::chunk::AudioChunk;
use crate::direction::MediaDirection;
use crate::error::MediaError;
use crate::format::{AudioFormat, MediaFormat, MediaKind};

/// A source of captured media, pulled one chunk at a time.
///
/// Implementations wrap whatever the platform provides (a capture callback
/// draining into a ring buffer, a file, a test script). `read_chunk` is
/// called from the pipeline worker at media rate and must not block.
pub trait CaptureSource: Send {
    /// The format the source produces.
    fn format(&self) -> AudioFormat;

    /// Establishes the connection to the underlying device.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::DeviceUnavailable`] when the device cannot be
    /// reached.
    fn connect(&mut self) -> Result<(), MediaError>;

    /// Pulls the next chunk, or `None` when no data is available yet.
    fn read_chunk(&mut self) -> Option<AudioChunk>;
}

/// An opaque, exclusively-owned handle to a capture source.
///
/// The handle is owned by one pipeline at a time; sharing a capture between
/// sessions goes through the mixer, which wraps the one handle rather than
/// opening the device twice. `connect` is idempotent; reads before a
/// successful connect yield `None`.
pub struct CaptureHandle {
    name: String,
    source: Box<dyn CaptureSource>,
    connected: bool,
}

impl CaptureHandle {
    /// Creates a handle over a capture source.
    pub fn new(name: impl Into<String>, source: Box<dyn CaptureSource>) -> Self {
        Self {
            name: name.into(),
            source,
            connected: false,
        }
    }

    /// Returns the device identity this handle captures from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the capture format.
    pub fn format(&self) -> AudioFormat {
        self.source.format()
    }

    /// Returns `true` once `connect` has succeeded.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Connects to the underlying device. Safe to call repeatedly.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::DeviceUnavailable`] when the device cannot be
    /// reached; the handle stays usable and the connect can be retried.
    pub fn connect(&mut self) -> Result<(), MediaError> {
        if self.connected {
            return Ok(());
        }
        self.source.connect()?;
        self.connected = true;
        Ok(())
    }

    /// Pulls the next captured chunk.
    ///
    /// Returns `None` when not connected or when no data is available.
    pub fn read_chunk(&mut self) -> Option<AudioChunk> {
        if !self.connected {
            return None;
        }
        self.source.read_chunk()
    }
}

impl std::fmt::Debug for CaptureHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureHandle")
            .field("name", &self.name)
            .field("format", &self.source.format())
            .field("connected", &self.connected)
            .finish()
    }
}

/// A destination for rendered media, created by a device.
///
/// The playback registry drives renderers from per-playback pump tasks, so
/// `render` is async and may apply backpressure.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    /// Renders one chunk.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::RenderFailed`] on failure; render errors are
    /// logged by the pump and do not stop the playback.
    async fn render(&self, chunk: &AudioChunk) -> Result<(), MediaError>;
}

/// One inbound media stream, supplied by the transport collaborator.
///
/// Implementations are shared (`Arc`) between the playback pump and the
/// mixer, so `read_chunk` takes `&self` and uses interior mutability.
pub trait InboundSource: Send + Sync {
    /// Stable identity for registry deduplication.
    fn id(&self) -> &str;

    /// The SSRC of the stream, when known.
    fn ssrc(&self) -> Option<u32>;

    /// The format the stream decodes to.
    fn format(&self) -> AudioFormat;

    /// Pulls the next decoded chunk, or `None` when none is pending.
    fn read_chunk(&self) -> Option<AudioChunk>;
}

/// Capability surface of a capture/render device.
///
/// Implemented by the device-enumeration collaborator; the core only ever
/// talks to this trait.
pub trait MediaDevice: Send + Sync {
    /// Device identity used in logs and errors.
    fn name(&self) -> &str;

    /// The kind of media this device handles.
    fn kind(&self) -> MediaKind;

    /// The directions this device supports.
    fn direction(&self) -> MediaDirection;

    /// The formats this device can capture or render.
    fn supported_formats(&self) -> Vec<MediaFormat>;

    /// Opens a capture handle on this device.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::DeviceUnavailable`] when the device cannot
    /// capture right now, or [`MediaError::InvalidDevice`] when it cannot
    /// capture at all.
    fn open_capture(&self) -> Result<CaptureHandle, MediaError>;

    /// Creates a renderer for playback on this device, or `None` for
    /// send-only devices.
    fn create_renderer(&self) -> Option<Box<dyn Renderer>>;
}

/// An explicit registry of known devices.
///
/// Constructed once by the application and passed by reference to the
/// components that need discovery; there is no process-wide device state.
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<Vec<Arc<dyn MediaDevice>>>,
}

impl DeviceRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a device.
    pub fn register(&self, device: Arc<dyn MediaDevice>) {
        self.devices.write().push(device);
    }

    /// Returns all registered devices.
    pub fn devices(&self) -> Vec<Arc<dyn MediaDevice>> {
        self.devices.read().clone()
    }

    /// Finds a device by name.
    pub fn find(&self, name: &str) -> Option<Arc<dyn MediaDevice>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }

    /// Returns the first registered device of the given kind able to
    /// capture, if any.
    pub fn default_capture(&self, kind: MediaKind) -> Option<Arc<dyn MediaDevice>> {
        self.devices
            .read()
            .iter()
            .find(|d| d.kind() == kind && d.direction().allows_sending())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_register_and_find() {
        let registry = DeviceRegistry::new();
        registry.register(Arc::new(MockDevice::audio("mic")));
        registry.register(Arc::new(MockDevice::audio("headset")));

        assert_eq!(registry.devices().len(), 2);
        assert!(registry.find("mic").is_some());
        assert!(registry.find("webcam").is_none());
    }

    #[test]
    fn test_registry_default_capture() {
        let registry = DeviceRegistry::new();
        assert!(registry.default_capture(MediaKind::Audio).is_none());

        registry.register(Arc::new(MockDevice::audio("mic")));
        let device = registry.default_capture(MediaKind::Audio).unwrap();
        assert_eq!(device.name(), "mic");
        assert!(registry.default_capture(MediaKind::Video).is_none());
    }

    #[test]
    fn test_capture_handle_requires_connect() {
        let device = MockDevice::audio("mic");
        let mut handle = device.open_capture().unwrap();

        assert!(!handle.is_connected());
        assert!(handle.read_chunk().is_none());

        handle.connect().unwrap();
        assert!(handle.is_connected());
        // connect is idempotent
        handle.connect().unwrap();
    }

    #[test]
    fn test_capture_handle_connect_failure() {
        let device = MockDevice::audio("mic").failing_connect();
        let mut handle = device.open_capture().unwrap();

        assert!(matches!(
            handle.connect(),
            Err(MediaError::DeviceUnavailable { .. })
        ));
        assert!(!handle.is_connected());
    }
}
