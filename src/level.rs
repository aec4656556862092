//! Per-source audio level measurement and caching.
//!
//! Buffers arrive at media rate (commonly ~50 per second), so the dispatcher
//! computes nothing unless a listener is attached. The last computed value is
//! cached per SSRC in a [`LevelCache`] shared across dispatchers, letting a
//! late-binding caller poll [`LevelCache::level`] without waiting for the
//! next push and regardless of current listener presence.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::event::LevelListener;

/// The lowest reportable audio level (silence).
pub const MIN_AUDIO_LEVEL: u8 = 0;

/// The highest reportable audio level.
pub const MAX_AUDIO_LEVEL: u8 = 127;

/// Computes the scalar level of a buffer of PCM samples.
///
/// The level is the RMS amplitude mapped linearly onto
/// `MIN_AUDIO_LEVEL..=MAX_AUDIO_LEVEL`: silence measures 0 and a full-scale
/// square wave measures 127.
pub fn measure_level(samples: &[i16]) -> u8 {
    if samples.is_empty() {
        return MIN_AUDIO_LEVEL;
    }
    let sum_squares: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    let rms = (sum_squares / samples.len() as f64).sqrt();
    let level = (rms / f64::from(i16::MAX) * f64::from(MAX_AUDIO_LEVEL)).round();
    level.min(f64::from(MAX_AUDIO_LEVEL)) as u8
}

/// Cache of last measured audio levels keyed by SSRC.
///
/// Shared between the per-stream dispatchers of one mixer so a single lookup
/// answers "how loud was participant X last time we heard them".
#[derive(Default)]
pub struct LevelCache {
    levels: RwLock<HashMap<u32, u8>>,
}

impl LevelCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last measured level for `ssrc`, or `None` if that source
    /// has never been measured.
    pub fn level(&self, ssrc: u32) -> Option<u8> {
        self.levels.read().get(&ssrc).copied()
    }

    /// Records the most recent level for `ssrc`.
    pub fn update(&self, ssrc: u32, level: u8) {
        self.levels.write().insert(ssrc, level);
    }

    /// Drops the cached level for `ssrc`.
    ///
    /// Called when the stream leaves the conference so stale levels are not
    /// reported for a reused SSRC.
    pub fn evict(&self, ssrc: u32) {
        self.levels.write().remove(&ssrc);
    }
}

/// Computes audio levels for one source and pushes them to a listener.
///
/// A dispatcher is bound to at most one listener at a time. With no listener
/// attached, [`submit`] returns without touching the samples, so idle
/// sources cost nothing. When a cache binding is set, every computed level
/// is also recorded there.
///
/// [`submit`]: LevelDispatcher::submit
pub struct LevelDispatcher {
    name: &'static str,
    listener: RwLock<Option<LevelListener>>,
    cache: RwLock<Option<(Arc<LevelCache>, u32)>>,
}

impl LevelDispatcher {
    /// Creates a dispatcher. The name appears in trace output only.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            listener: RwLock::new(None),
            cache: RwLock::new(None),
        }
    }

    /// Returns the dispatcher's name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Attaches or detaches the listener.
    pub fn set_listener(&self, listener: Option<LevelListener>) {
        *self.listener.write() = listener;
    }

    /// Returns `true` if a listener is currently attached.
    pub fn has_listener(&self) -> bool {
        self.listener.read().is_some()
    }

    /// Binds a shared cache entry that receives every computed level.
    pub fn bind_cache(&self, cache: Arc<LevelCache>, ssrc: u32) {
        *self.cache.write() = Some((cache, ssrc));
    }

    /// Removes the cache binding.
    pub fn unbind_cache(&self) {
        *self.cache.write() = None;
    }

    /// Accepts one buffer of samples.
    ///
    /// Computes and dispatches a level only when a listener is attached; the
    /// computation is skipped entirely otherwise. The listener runs without
    /// any dispatcher lock held.
    pub fn submit(&self, samples: &[i16]) {
        let Some(listener) = self.listener.read().clone() else {
            return;
        };

        let level = measure_level(samples);

        let cache = self.cache.read().clone();
        if let Some((cache, ssrc)) = cache {
            cache.update(ssrc, level);
        }

        listener(level);
    }
}
