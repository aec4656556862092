//! Audio data chunk with metadata.

use std::sync::Arc;
use std::time::Duration;

use crate::format::AudioFormat;

/// A discrete buffer of audio samples with associated metadata.
///
/// `AudioChunk` is the fundamental unit of audio data on every pipeline and
/// mixing path. Each chunk carries PCM samples along with timing and format
/// information, and optionally the SSRC of the contributing source when the
/// chunk originates from an inbound stream.
///
/// Samples are stored in an `Arc<Vec<i16>>` so that cloning a chunk (for
/// example when one contribution feeds several mix outputs) never copies the
/// sample data.
///
/// # Example
///
/// ```
/// use conf_media::AudioChunk;
/// use std::time::Duration;
///
/// let chunk = AudioChunk::new(vec![0i16; 1600], Duration::ZERO, 16000, 1);
/// assert_eq!(chunk.duration(), Duration::from_millis(100));
///
/// let cheap = chunk.clone(); // shares sample data
/// assert_eq!(cheap.frame_count(), 1600);
/// ```
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// PCM audio samples in 16-bit signed integer format.
    pub samples: Arc<Vec<i16>>,

    /// Timestamp from the start of the producing source.
    pub timestamp: Duration,

    /// Sample rate in Hz (e.g., 16000, 48000).
    pub sample_rate: u32,

    /// Number of audio channels (1 = mono, 2 = stereo).
    pub channels: u16,

    /// SSRC of the contributing source, or `None` for local capture and
    /// mixed output.
    pub ssrc: Option<u32>,
}

impl AudioChunk {
    /// Creates a new chunk with no contributing-source tag.
    pub fn new(samples: Vec<i16>, timestamp: Duration, sample_rate: u32, channels: u16) -> Self {
        Self {
            samples: Arc::new(samples),
            timestamp,
            sample_rate,
            channels,
            ssrc: None,
        }
    }

    /// Creates a new chunk tagged with the SSRC of its contributing source.
    pub fn with_ssrc(
        samples: Vec<i16>,
        timestamp: Duration,
        sample_rate: u32,
        channels: u16,
        ssrc: u32,
    ) -> Self {
        Self {
            samples: Arc::new(samples),
            timestamp,
            sample_rate,
            channels,
            ssrc: Some(ssrc),
        }
    }

    /// Creates a chunk from pre-wrapped Arc samples.
    pub fn from_arc(
        samples: Arc<Vec<i16>>,
        timestamp: Duration,
        sample_rate: u32,
        channels: u16,
        ssrc: Option<u32>,
    ) -> Self {
        Self {
            samples,
            timestamp,
            sample_rate,
            channels,
            ssrc,
        }
    }

    /// Returns the audio format of this chunk.
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    /// Returns the duration of this chunk.
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 || self.channels == 0 {
            return Duration::ZERO;
        }
        let frames = self.samples.len() / self.channels as usize;
        Duration::from_secs_f64(frames as f64 / self.sample_rate as f64)
    }

    /// Returns the number of audio frames (one sample per channel).
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.samples.len() / self.channels as usize
    }

    /// Returns `true` if this chunk contains no samples.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}
