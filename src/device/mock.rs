//! Mock devices and streams for testing without hardware.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::chunk::AudioChunk;
use crate::direction::MediaDirection;
use crate::error::MediaError;
use crate::format::{AudioFormat, MediaFormat, MediaKind};

use super::{CaptureHandle, CaptureSource, InboundSource, MediaDevice, Renderer};

/// Generates synthetic PCM test signals.
fn sine(format: AudioFormat, frequency: f64, duration_ms: u64) -> Vec<i16> {
    let frames = (u64::from(format.sample_rate) * duration_ms / 1000) as usize;
    let mut samples = Vec::with_capacity(frames * format.channels as usize);
    for i in 0..frames {
        let t = i as f64 / f64::from(format.sample_rate);
        let value = (2.0 * std::f64::consts::PI * frequency * t).sin();
        let sample = (value * 32767.0) as i16;
        for _ in 0..format.channels {
            samples.push(sample);
        }
    }
    samples
}

fn silence(format: AudioFormat, duration_ms: u64) -> Vec<i16> {
    let frames = (u64::from(format.sample_rate) * duration_ms / 1000) as usize;
    vec![0i16; frames * format.channels as usize]
}

/// A capture source that replays a pre-generated sample script.
///
/// Reads hand out at most `chunk_frames` frames at a time and return `None`
/// once the script is exhausted, which lets tests drive the pipeline
/// deterministically.
pub struct MockCapture {
    format: AudioFormat,
    samples: VecDeque<i16>,
    chunk_frames: usize,
    timestamp: Duration,
    fail_connect: bool,
    device_name: String,
}

impl MockCapture {
    /// Creates a capture source producing the given format in 20ms chunks.
    pub fn new(device_name: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            format,
            samples: VecDeque::new(),
            chunk_frames: (format.sample_rate / 50) as usize,
            timestamp: Duration::ZERO,
            fail_connect: false,
            device_name: device_name.into(),
        }
    }

    /// Makes `connect` fail with [`MediaError::DeviceUnavailable`].
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Appends a sine tone to the capture script.
    pub fn push_tone(&mut self, frequency: f64, duration_ms: u64) {
        self.samples.extend(sine(self.format, frequency, duration_ms));
    }

    /// Appends silence to the capture script.
    pub fn push_silence(&mut self, duration_ms: u64) {
        self.samples.extend(silence(self.format, duration_ms));
    }

    /// Appends raw samples to the capture script.
    pub fn push_samples(&mut self, samples: &[i16]) {
        self.samples.extend(samples.iter().copied());
    }
}

impl CaptureSource for MockCapture {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn connect(&mut self) -> Result<(), MediaError> {
        if self.fail_connect {
            return Err(MediaError::device_unavailable(
                self.device_name.clone(),
                "mock device configured to fail",
            ));
        }
        Ok(())
    }

    fn read_chunk(&mut self) -> Option<AudioChunk> {
        if self.samples.is_empty() {
            return None;
        }
        let want = self.chunk_frames * self.format.channels as usize;
        let take = want.min(self.samples.len());
        let samples: Vec<i16> = self.samples.drain(..take).collect();

        let chunk = AudioChunk::new(
            samples,
            self.timestamp,
            self.format.sample_rate,
            self.format.channels,
        );
        self.timestamp += chunk.duration();
        Some(chunk)
    }
}

/// A scriptable [`MediaDevice`] for tests and examples.
///
/// The capture script is shared: samples pushed through
/// [`MockDevice::push_tone`] (and friends) are seen by the next capture
/// handle opened from this device.
pub struct MockDevice {
    name: String,
    kind: MediaKind,
    direction: MediaDirection,
    formats: Vec<MediaFormat>,
    capture_format: AudioFormat,
    script: Mutex<Vec<i16>>,
    fail_connect: bool,
}

impl MockDevice {
    /// Creates an audio device supporting 16kHz mono and 48kHz stereo.
    pub fn audio(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MediaKind::Audio,
            direction: MediaDirection::SendRecv,
            formats: vec![
                MediaFormat::Audio(AudioFormat::new(16000, 1)),
                MediaFormat::Audio(AudioFormat::new(48000, 2)),
            ],
            capture_format: AudioFormat::new(16000, 1),
            script: Mutex::new(Vec::new()),
            fail_connect: false,
        }
    }

    /// Creates a video device with the given supported formats.
    pub fn video(name: impl Into<String>, formats: Vec<MediaFormat>) -> Self {
        Self {
            name: name.into(),
            kind: MediaKind::Video,
            direction: MediaDirection::SendRecv,
            formats,
            capture_format: AudioFormat::new(0, 0),
            script: Mutex::new(Vec::new()),
            fail_connect: false,
        }
    }

    /// Replaces the supported format list.
    pub fn with_formats(mut self, formats: Vec<MediaFormat>) -> Self {
        self.formats = formats;
        self
    }

    /// Restricts the device direction.
    pub fn with_direction(mut self, direction: MediaDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Makes every opened capture fail to connect.
    pub fn failing_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Appends a sine tone to the capture script.
    pub fn push_tone(&self, frequency: f64, duration_ms: u64) {
        self.script
            .lock()
            .extend(sine(self.capture_format, frequency, duration_ms));
    }

    /// Appends silence to the capture script.
    pub fn push_silence(&self, duration_ms: u64) {
        self.script
            .lock()
            .extend(silence(self.capture_format, duration_ms));
    }

    /// Appends raw samples to the capture script.
    pub fn push_samples(&self, samples: &[i16]) {
        self.script.lock().extend(samples.iter().copied());
    }
}

impl MediaDevice for MockDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn direction(&self) -> MediaDirection {
        self.direction
    }

    fn supported_formats(&self) -> Vec<MediaFormat> {
        self.formats.clone()
    }

    fn open_capture(&self) -> Result<CaptureHandle, MediaError> {
        let mut capture = MockCapture::new(self.name.clone(), self.capture_format);
        if self.fail_connect {
            capture = capture.failing_connect();
        }
        capture.push_samples(&std::mem::take(&mut *self.script.lock()));
        Ok(CaptureHandle::new(self.name.clone(), Box::new(capture)))
    }

    fn create_renderer(&self) -> Option<Box<dyn Renderer>> {
        Some(Box::new(MockRenderer::new(format!("{}-out", self.name))))
    }
}

/// An inbound stream fed from a test script.
pub struct MockInbound {
    id: String,
    ssrc: Option<u32>,
    format: AudioFormat,
    chunks: Mutex<VecDeque<AudioChunk>>,
    timestamp: Mutex<Duration>,
}

impl MockInbound {
    /// Creates a stream with the given identity and SSRC.
    pub fn new(id: impl Into<String>, ssrc: u32, format: AudioFormat) -> Self {
        Self {
            id: id.into(),
            ssrc: Some(ssrc),
            format,
            chunks: Mutex::new(VecDeque::new()),
            timestamp: Mutex::new(Duration::ZERO),
        }
    }

    /// Creates a bare data source with no stream identity.
    pub fn unbound(id: impl Into<String>, format: AudioFormat) -> Self {
        Self {
            id: id.into(),
            ssrc: None,
            format,
            chunks: Mutex::new(VecDeque::new()),
            timestamp: Mutex::new(Duration::ZERO),
        }
    }

    /// Queues raw samples as one chunk.
    pub fn queue_samples(&self, samples: &[i16]) {
        let mut timestamp = self.timestamp.lock();
        let chunk = AudioChunk::from_arc(
            Arc::new(samples.to_vec()),
            *timestamp,
            self.format.sample_rate,
            self.format.channels,
            self.ssrc,
        );
        *timestamp += chunk.duration();
        self.chunks.lock().push_back(chunk);
    }

    /// Queues a sine tone split into 20ms chunks.
    pub fn queue_tone(&self, frequency: f64, duration_ms: u64) {
        let samples = sine(self.format, frequency, duration_ms);
        let chunk_len = (self.format.sample_rate / 50) as usize * self.format.channels as usize;
        for part in samples.chunks(chunk_len.max(1)) {
            self.queue_samples(part);
        }
    }

    /// Returns the number of queued chunks.
    pub fn pending(&self) -> usize {
        self.chunks.lock().len()
    }
}

impl InboundSource for MockInbound {
    fn id(&self) -> &str {
        &self.id
    }

    fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn read_chunk(&self) -> Option<AudioChunk> {
        self.chunks.lock().pop_front()
    }
}

/// A renderer that records everything it is asked to render.
pub struct MockRenderer {
    name: String,
    chunks: Mutex<Vec<AudioChunk>>,
}

impl MockRenderer {
    /// Creates a recording renderer.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Returns the number of rendered chunks.
    pub fn rendered(&self) -> usize {
        self.chunks.lock().len()
    }

    /// Returns copies of all rendered chunks.
    pub fn chunks(&self) -> Vec<AudioChunk> {
        self.chunks.lock().clone()
    }
}

#[async_trait]
impl Renderer for MockRenderer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn render(&self, chunk: &AudioChunk) -> Result<(), MediaError> {
        self.chunks.lock().push(chunk.clone());
        Ok(())
    }
}
