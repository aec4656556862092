//! Media format types and negotiation.
//!
//! Formats describe how a capture source or pipeline produces media. Audio
//! formats carry sample rate and channel count; video formats carry output
//! size and frame rate. A field value of `0` means "unspecified" and matches
//! anything during negotiation, so a caller can request "48kHz, any channel
//! count" and let the device pick.

mod convert;

pub use convert::normalize;

/// The kind of media a device or session handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    /// Audio capture and playback.
    Audio,
    /// Video capture and rendering.
    Video,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// PCM audio format: sample rate and channel count.
///
/// A `0` in either field means "unspecified" for matching purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// Sample rate in Hz, or 0 for unspecified.
    pub sample_rate: u32,
    /// Channel count, or 0 for unspecified.
    pub channels: u16,
}

impl AudioFormat {
    /// Creates a new audio format.
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// Returns `true` if `other` satisfies this format, treating 0 fields
    /// as wildcards on either side.
    pub fn matches(&self, other: &Self) -> bool {
        let rate_ok = self.sample_rate == 0
            || other.sample_rate == 0
            || self.sample_rate == other.sample_rate;
        let channels_ok =
            self.channels == 0 || other.channels == 0 || self.channels == other.channels;
        rate_ok && channels_ok
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}Hz/{}ch", self.sample_rate, self.channels)
    }
}

/// Video format: output size and frame rate.
///
/// A `0` in any field means "unspecified" for matching purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VideoFormat {
    /// Output width in pixels, or 0 for unspecified.
    pub width: u32,
    /// Output height in pixels, or 0 for unspecified.
    pub height: u32,
    /// Frames per second, or 0 for unspecified.
    pub frame_rate: u32,
}

impl VideoFormat {
    /// Creates a new video format.
    pub const fn new(width: u32, height: u32, frame_rate: u32) -> Self {
        Self {
            width,
            height,
            frame_rate,
        }
    }

    /// Returns the output size as (width, height).
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns `true` if `other` satisfies this format, treating 0 fields
    /// as wildcards on either side.
    pub fn matches(&self, other: &Self) -> bool {
        let dim = |a: u32, b: u32| a == 0 || b == 0 || a == b;
        dim(self.width, other.width)
            && dim(self.height, other.height)
            && dim(self.frame_rate, other.frame_rate)
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.frame_rate)
    }
}

/// A media format for either kind of media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaFormat {
    /// An audio format.
    Audio(AudioFormat),
    /// A video format.
    Video(VideoFormat),
}

impl MediaFormat {
    /// Returns the kind of media this format describes.
    pub fn kind(&self) -> MediaKind {
        match self {
            Self::Audio(_) => MediaKind::Audio,
            Self::Video(_) => MediaKind::Video,
        }
    }

    /// Returns the inner audio format, if this is an audio format.
    pub fn as_audio(&self) -> Option<AudioFormat> {
        match self {
            Self::Audio(f) => Some(*f),
            Self::Video(_) => None,
        }
    }

    /// Returns the output size for video formats.
    pub fn size(&self) -> Option<(u32, u32)> {
        match self {
            Self::Audio(_) => None,
            Self::Video(f) => Some(f.size()),
        }
    }

    /// Returns `true` if `other` satisfies this format (same kind, wildcard
    /// fields match anything).
    pub fn matches(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Audio(a), Self::Audio(b)) => a.matches(b),
            (Self::Video(a), Self::Video(b)) => a.matches(b),
            _ => false,
        }
    }
}

impl std::fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio(a) => write!(f, "audio {a}"),
            Self::Video(v) => write!(f, "video {v}"),
        }
    }
}

/// Finds the first supported format matching the requested one.
///
/// Returns the concrete supported format, which may be more specific than
/// the request when the request carries wildcard fields.
pub fn find_first_matching(
    supported: &[MediaFormat],
    requested: &MediaFormat,
) -> Option<MediaFormat> {
    supported.iter().find(|s| requested.matches(s)).copied()
}
