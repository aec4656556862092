//! Conference audio mixing.
//!
//! An [`AudioMixer`] composes one local capture contribution and M inbound
//! stream contributions into per-listener output. The defining rule is
//! mix-minus-self: the local output is the sum of every contribution except
//! the local capture's own, so participants never hear themselves back.
//!
//! [`MixerDevice`] wraps an ordinary capture device so several sessions can
//! share one hardware capture (a media-translator scenario) without opening
//! the device twice. The mixer itself is created lazily when the first
//! dependent session appears and torn down when the last one closes.

mod mix_buffer;

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::chunk::AudioChunk;
use crate::device::{CaptureHandle, CaptureSource, InboundSource, MediaDevice};
use crate::error::MediaError;
use crate::event::{level_listener, LevelListener};
use crate::format::{normalize, AudioFormat};
use crate::level::{LevelCache, LevelDispatcher};
use crate::ssrc::SsrcRegistry;

use mix_buffer::MixBuffer;

/// Identifies one contribution registered with the mixer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MixContributor {
    /// The local capture device.
    LocalCapture,
    /// One inbound stream, by SSRC.
    Stream(u32),
}

impl std::fmt::Display for MixContributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCapture => write!(f, "local-capture"),
            Self::Stream(ssrc) => write!(f, "stream({ssrc})"),
        }
    }
}

/// Observer of raw inbound buffers as the mixer reads them, before mixing.
pub type RawBufferObserver = Arc<dyn Fn(u32, &AudioChunk) + Send + Sync>;

enum MixInputSource {
    Capture(CaptureHandle),
    Stream(Arc<dyn InboundSource>),
}

/// A named contribution registered with the mixer.
struct MixInput {
    contributor: MixContributor,
    source: MixInputSource,
}

/// One local-level listener and how many times it was subscribed.
///
/// The same logical listener may be attached multiple times; it is only
/// fully removed when its count reaches zero. Identity is the `Arc`
/// allocation.
struct ListenerEntry {
    listener: LevelListener,
    count: usize,
}

impl Clone for ListenerEntry {
    fn clone(&self) -> Self {
        Self {
            listener: self.listener.clone(),
            count: self.count,
        }
    }
}

/// Copy-on-write fan-out of local audio levels.
///
/// The listener list is an immutable `Arc<Vec<_>>` swapped on mutation, so
/// the ~50/s dispatch path snapshots it and iterates without holding any
/// structural lock.
#[derive(Default)]
struct LocalLevelFanout {
    last: AtomicU8,
    listeners: Mutex<Arc<Vec<ListenerEntry>>>,
}

impl LocalLevelFanout {
    fn has_listeners(&self) -> bool {
        !self.listeners.lock().is_empty()
    }

    fn dispatch(&self, level: u8) {
        self.last.store(level, Ordering::SeqCst);
        let snapshot = self.listeners.lock().clone();
        for entry in snapshot.iter() {
            (entry.listener)(level);
        }
    }

    /// Adds a subscription; returns `true` if this was the first listener.
    fn add(&self, listener: &LevelListener) -> bool {
        let mut guard = self.listeners.lock();
        let was_empty = guard.is_empty();
        let mut next: Vec<ListenerEntry> = guard.iter().cloned().collect();
        match next
            .iter_mut()
            .find(|e| Arc::ptr_eq(&e.listener, listener))
        {
            Some(entry) => entry.count += 1,
            None => next.push(ListenerEntry {
                listener: listener.clone(),
                count: 1,
            }),
        }
        *guard = Arc::new(next);
        was_empty
    }

    /// Drops one subscription; returns `true` if no listeners remain.
    fn remove(&self, listener: &LevelListener) -> bool {
        let mut guard = self.listeners.lock();
        let mut next: Vec<ListenerEntry> = guard.iter().cloned().collect();
        if let Some(index) = next.iter().position(|e| Arc::ptr_eq(&e.listener, listener)) {
            if next[index].count > 1 {
                next[index].count -= 1;
            } else {
                next.remove(index);
            }
            *guard = Arc::new(next);
        }
        guard.is_empty()
    }
}

/// Mixes one local capture and M inbound streams into per-listener output.
///
/// Every output excludes exactly one contributor; the local output excludes
/// the local capture. On every buffer read the mixer feeds the level
/// machinery: local chunks go to the local dispatcher only while a listener
/// is subscribed, inbound chunks go to their per-stream dispatcher and the
/// optional raw-receive observer. Heterogeneous input formats are
/// normalized to the mix format before summation; summation clamps rather
/// than wraps.
pub struct AudioMixer {
    out_format: AudioFormat,
    capture_format: AudioFormat,
    chunk_duration: Duration,
    inputs: Mutex<Vec<MixInput>>,
    local_dispatcher: LevelDispatcher,
    fanout: Arc<LocalLevelFanout>,
    stream_dispatchers: Mutex<HashMap<u32, Arc<LevelDispatcher>>>,
    level_cache: Arc<LevelCache>,
    raw_observer: RwLock<Option<RawBufferObserver>>,
    timestamp: Mutex<Duration>,
}

impl AudioMixer {
    /// Creates a mixer over an exclusive (already opened) capture handle.
    pub fn new(capture: CaptureHandle, out_format: AudioFormat, chunk_duration: Duration) -> Self {
        let capture_format = capture.format();
        Self {
            out_format,
            capture_format,
            chunk_duration,
            inputs: Mutex::new(vec![MixInput {
                contributor: MixContributor::LocalCapture,
                source: MixInputSource::Capture(capture),
            }]),
            local_dispatcher: LevelDispatcher::new("local-level"),
            fanout: Arc::new(LocalLevelFanout::default()),
            stream_dispatchers: Mutex::new(HashMap::new()),
            level_cache: Arc::new(LevelCache::new()),
            raw_observer: RwLock::new(None),
            timestamp: Mutex::new(Duration::ZERO),
        }
    }

    /// Returns the format of mixed output chunks.
    pub fn out_format(&self) -> AudioFormat {
        self.out_format
    }

    /// Returns the format of the wrapped capture.
    pub fn capture_format(&self) -> AudioFormat {
        self.capture_format
    }

    /// Returns the registered contributors.
    pub fn contributors(&self) -> Vec<MixContributor> {
        self.inputs.lock().iter().map(|i| i.contributor).collect()
    }

    /// Registers one inbound stream as a contribution.
    ///
    /// Returns `false` (no-op) when a contribution with the same SSRC is
    /// already registered or the stream carries no SSRC.
    pub fn add_stream_input(&self, stream: Arc<dyn InboundSource>) -> bool {
        let Some(ssrc) = stream.ssrc() else {
            tracing::warn!(source = stream.id(), "stream without SSRC not mixed");
            return false;
        };
        let mut inputs = self.inputs.lock();
        if inputs
            .iter()
            .any(|i| i.contributor == MixContributor::Stream(ssrc))
        {
            return false;
        }
        inputs.push(MixInput {
            contributor: MixContributor::Stream(ssrc),
            source: MixInputSource::Stream(stream),
        });
        true
    }

    /// Unregisters an inbound stream and evicts its cached level.
    pub fn remove_stream_input(&self, ssrc: u32) -> bool {
        let removed = {
            let mut inputs = self.inputs.lock();
            let before = inputs.len();
            inputs.retain(|i| i.contributor != MixContributor::Stream(ssrc));
            inputs.len() != before
        };
        if removed {
            if let Some(dispatcher) = self.stream_dispatchers.lock().remove(&ssrc) {
                dispatcher.set_listener(None);
                dispatcher.unbind_cache();
            }
            self.level_cache.evict(ssrc);
        }
        removed
    }

    /// Reads the local output: the mix of every contribution except the
    /// local capture's own.
    pub fn read_local_output(&self) -> Option<AudioChunk> {
        self.read_output(MixContributor::LocalCapture)
    }

    /// Reads one mixed chunk excluding the given contributor.
    ///
    /// Every input is read (feeding level dispatchers and the raw
    /// observer); the excluded contribution is simply left out of the sum.
    /// Returns `None` when no other contribution had data.
    pub fn read_output(&self, exclude: MixContributor) -> Option<AudioChunk> {
        let frames = (u64::from(self.out_format.sample_rate)
            * self.chunk_duration.as_millis() as u64
            / 1000) as usize;
        let mut mix = MixBuffer::new(frames.max(1) * self.out_format.channels as usize);

        {
            let mut inputs = self.inputs.lock();
            for input in inputs.iter_mut() {
                let Some(chunk) = self.read_input(input) else {
                    continue;
                };
                if input.contributor == exclude {
                    continue;
                }
                let contribution = normalize(&chunk.samples, chunk.format(), self.out_format);
                mix.accumulate(&contribution);
            }
        }

        if mix.contributions() == 0 {
            return None;
        }

        let samples = mix.finish();
        let timestamp = {
            let mut ts = self.timestamp.lock();
            let current = *ts;
            *ts += self.chunk_duration;
            current
        };
        Some(AudioChunk::new(
            samples,
            timestamp,
            self.out_format.sample_rate,
            self.out_format.channels,
        ))
    }

    /// Reads one chunk from the wrapped capture (shared capture access).
    ///
    /// Level bookkeeping runs exactly as on the mixing path.
    pub fn read_capture(&self) -> Option<AudioChunk> {
        let mut inputs = self.inputs.lock();
        let input = inputs
            .iter_mut()
            .find(|i| i.contributor == MixContributor::LocalCapture)?;
        self.read_input(input)
    }

    /// Reads one chunk from an input, feeding the level machinery.
    fn read_input(&self, input: &mut MixInput) -> Option<AudioChunk> {
        match &mut input.source {
            MixInputSource::Capture(handle) => {
                let chunk = handle.read_chunk()?;
                // Skip level computation entirely while nobody listens.
                if self.fanout.has_listeners() {
                    self.local_dispatcher.submit(&chunk.samples);
                }
                Some(chunk)
            }
            MixInputSource::Stream(stream) => {
                let chunk = stream.read_chunk()?;
                if let MixContributor::Stream(ssrc) = input.contributor {
                    if !chunk.is_empty() {
                        let dispatcher = self.stream_dispatchers.lock().get(&ssrc).cloned();
                        if let Some(dispatcher) = dispatcher {
                            dispatcher.submit(&chunk.samples);
                        }
                        let observer = self.raw_observer.read().clone();
                        if let Some(observer) = observer {
                            observer(ssrc, &chunk);
                        }
                    }
                }
                Some(chunk)
            }
        }
    }

    /// Subscribes a listener to local capture levels.
    ///
    /// Subscribing the same listener (same `Arc`) again only bumps its
    /// reference count.
    pub fn add_local_level_listener(&self, listener: &LevelListener) {
        if self.fanout.add(listener) {
            // First listener: arm the dispatcher with the fan-out delegate.
            let fanout = self.fanout.clone();
            self.local_dispatcher
                .set_listener(Some(level_listener(move |level| fanout.dispatch(level))));
        }
    }

    /// Drops one subscription of a local level listener.
    ///
    /// The listener is fully removed when its count reaches zero; when the
    /// last listener goes, level computation stops.
    pub fn remove_local_level_listener(&self, listener: &LevelListener) {
        if self.fanout.remove(listener) {
            self.local_dispatcher.set_listener(None);
        }
    }

    /// Returns `true` while any local level listener is subscribed.
    pub fn has_local_level_listeners(&self) -> bool {
        self.fanout.has_listeners()
    }

    /// Sets or clears the level listener for one inbound stream.
    pub fn set_stream_level_listener(&self, ssrc: u32, listener: Option<LevelListener>) {
        let mut dispatchers = self.stream_dispatchers.lock();
        match listener {
            None => {
                if let Some(dispatcher) = dispatchers.remove(&ssrc) {
                    dispatcher.set_listener(None);
                    dispatcher.unbind_cache();
                }
            }
            Some(listener) => {
                let dispatcher = dispatchers.entry(ssrc).or_insert_with(|| {
                    let dispatcher = Arc::new(LevelDispatcher::new("stream-level"));
                    dispatcher.bind_cache(self.level_cache.clone(), ssrc);
                    dispatcher
                });
                dispatcher.set_listener(Some(listener));
            }
        }
    }

    /// Sets or clears the raw inbound-buffer observer.
    pub fn set_raw_observer(&self, observer: Option<RawBufferObserver>) {
        *self.raw_observer.write() = observer;
    }

    /// Returns the last measured level of an inbound stream.
    pub fn last_level(&self, ssrc: u32) -> Option<u8> {
        self.level_cache.level(ssrc)
    }

    /// Returns the last measured level of the local capture.
    pub fn last_local_level(&self) -> u8 {
        self.fanout.last.load(Ordering::SeqCst)
    }
}

/// A device decorator that enables audio mixing on a capture device.
///
/// Sessions created from the same `MixerDevice` share one hardware capture
/// and one contributing-source list. The underlying [`AudioMixer`] is
/// created when the first dependent session appears and torn down when the
/// last one closes.
pub struct MixerDevice {
    inner: Arc<dyn MediaDevice>,
    out_format: AudioFormat,
    chunk_duration: Duration,
    mixer: Mutex<Option<Arc<AudioMixer>>>,
    dependents: Mutex<HashSet<u64>>,
    next_id: AtomicU64,
    ssrcs: Arc<SsrcRegistry>,
    /// Self-reference handed to dependent sessions so they can retract
    /// themselves on close.
    weak_self: Weak<MixerDevice>,
}

impl MixerDevice {
    /// Default mix output format: 16kHz mono.
    pub const DEFAULT_OUT_FORMAT: AudioFormat = AudioFormat::new(16000, 1);

    /// Wraps a capture-capable device for mixing with the default output
    /// format and 20ms chunks.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::InvalidDevice`] when `inner` cannot capture.
    pub fn new(inner: Arc<dyn MediaDevice>) -> Result<Arc<Self>, MediaError> {
        Self::with_output(inner, Self::DEFAULT_OUT_FORMAT, Duration::from_millis(20))
    }

    /// Wraps a capture-capable device with an explicit mix format and chunk
    /// duration.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::InvalidDevice`] when `inner` cannot capture.
    pub fn with_output(
        inner: Arc<dyn MediaDevice>,
        out_format: AudioFormat,
        chunk_duration: Duration,
    ) -> Result<Arc<Self>, MediaError> {
        if !inner.direction().allows_sending() {
            return Err(MediaError::InvalidDevice {
                device: inner.name().to_string(),
                reason: "mixing requires a capture-capable device".to_string(),
            });
        }
        Ok(Arc::new_cyclic(|weak| Self {
            inner,
            out_format,
            chunk_duration,
            mixer: Mutex::new(None),
            dependents: Mutex::new(HashSet::new()),
            next_id: AtomicU64::new(1),
            ssrcs: Arc::new(SsrcRegistry::new()),
            weak_self: weak.clone(),
        }))
    }

    /// Returns the wrapped device.
    pub fn inner(&self) -> Arc<dyn MediaDevice> {
        self.inner.clone()
    }

    /// Returns the shared contributing-source registry.
    pub fn ssrc_registry(&self) -> &SsrcRegistry {
        &self.ssrcs
    }

    /// Returns the number of dependent sessions.
    pub fn dependent_count(&self) -> usize {
        self.dependents.lock().len()
    }

    /// Returns `true` while the mixer (and its capture) is alive.
    pub fn is_active(&self) -> bool {
        self.mixer.lock().is_some()
    }

    /// Creates a dependent session, lazily creating the mixer (and opening
    /// the shared capture) on the first one.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::DeviceUnavailable`] when the capture cannot be
    /// opened; nothing is retained and the next call retries.
    pub fn create_session(&self) -> Result<MixerSession, MediaError> {
        let Some(device) = self.weak_self.upgrade() else {
            return Err(MediaError::device_unavailable(
                self.inner.name(),
                "mixer device dropped",
            ));
        };
        let mixer = self.ensure_mixer()?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let dependents = {
            let mut dependents = self.dependents.lock();
            dependents.insert(id);
            dependents.len()
        };
        tracing::debug!(device = self.inner.name(), dependents, "mixer session created");
        Ok(MixerSession {
            device,
            mixer,
            id,
            streams: Mutex::new(HashSet::new()),
            local_listener: Mutex::new(None),
            stream_listener: Mutex::new(None),
            mute: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_mixer(&self) -> Result<Arc<AudioMixer>, MediaError> {
        let mut guard = self.mixer.lock();
        if let Some(mixer) = guard.as_ref() {
            return Ok(mixer.clone());
        }
        let mut capture = self.inner.open_capture()?;
        capture.connect()?;
        tracing::debug!(
            device = self.inner.name(),
            format = %capture.format(),
            "shared capture opened"
        );
        let mixer = Arc::new(AudioMixer::new(
            capture,
            self.out_format,
            self.chunk_duration,
        ));
        *guard = Some(mixer.clone());
        Ok(mixer)
    }

    fn release(&self, id: u64) {
        let mut dependents = self.dependents.lock();
        if dependents.remove(&id) && dependents.is_empty() {
            self.mixer.lock().take();
            tracing::debug!(
                device = self.inner.name(),
                "last dependent closed; mixer torn down"
            );
        }
    }
}

/// One stream's use of a [`MixerDevice`]: its contribution to the mix and
/// its view of the shared state.
///
/// Dropping the session closes it.
pub struct MixerSession {
    device: Arc<MixerDevice>,
    mixer: Arc<AudioMixer>,
    id: u64,
    /// SSRCs this session added, so close can retract exactly its own.
    streams: Mutex<HashSet<u32>>,
    local_listener: Mutex<Option<LevelListener>>,
    stream_listener: Mutex<Option<LevelListener>>,
    mute: AtomicBool,
    closed: AtomicBool,
}

impl MixerSession {
    /// Registers an inbound stream as a contribution of this session.
    ///
    /// Records the SSRC in the shared contributing-source list and binds a
    /// pending stream level listener, if one was set before the stream
    /// arrived.
    pub fn add_stream(&self, stream: Arc<dyn InboundSource>) -> bool {
        let Some(ssrc) = stream.ssrc() else {
            tracing::warn!(source = stream.id(), "stream without SSRC not added to mix");
            return false;
        };
        if !self.mixer.add_stream_input(stream) {
            return false;
        }
        self.streams.lock().insert(ssrc);
        self.device.ssrcs.add(ssrc);
        if let Some(listener) = self.stream_listener.lock().clone() {
            self.mixer.set_stream_level_listener(ssrc, Some(listener));
        }
        true
    }

    /// Removes one of this session's stream contributions.
    pub fn remove_stream(&self, ssrc: u32) -> bool {
        if !self.mixer.remove_stream_input(ssrc) {
            return false;
        }
        self.streams.lock().remove(&ssrc);
        self.device.ssrcs.remove(ssrc);
        true
    }

    /// Reads the mix of all contributions except the local capture.
    pub fn read_local_output(&self) -> Option<AudioChunk> {
        self.mixer.read_local_output()
    }

    /// Opens shared access to the one hardware capture.
    ///
    /// The returned handle reads through the mixer; the device itself is
    /// opened exactly once for all dependent sessions.
    pub fn open_shared_capture(&self) -> CaptureHandle {
        CaptureHandle::new(
            format!("{}-shared", self.device.inner.name()),
            Box::new(SharedCapture {
                mixer: self.mixer.clone(),
                format: self.mixer.capture_format(),
            }),
        )
    }

    /// Sets this session's local level listener, replacing any previous
    /// one. Muted sessions keep the listener but leave it detached until
    /// unmuted.
    pub fn set_local_level_listener(&self, listener: Option<LevelListener>) {
        let mut current = self.local_listener.lock();
        if let Some(old) = current.take() {
            self.mixer.remove_local_level_listener(&old);
        }
        if let Some(listener) = listener {
            *current = Some(listener.clone());
            if !self.is_mute() {
                self.mixer.add_local_level_listener(&listener);
            }
        }
    }

    /// Sets the level listener applied to this session's streams, present
    /// and future.
    pub fn set_stream_level_listener(&self, listener: Option<LevelListener>) {
        *self.stream_listener.lock() = listener.clone();
        for &ssrc in self.streams.lock().iter() {
            self.mixer.set_stream_level_listener(ssrc, listener.clone());
        }
    }

    /// Mutes or unmutes this session's contribution.
    ///
    /// Muting detaches the local level listener (a muted participant shows
    /// silence, not their real input level); unmuting reattaches it.
    pub fn set_mute(&self, mute: bool) {
        if self.mute.swap(mute, Ordering::SeqCst) == mute {
            return;
        }
        let listener = self.local_listener.lock().clone();
        if let Some(listener) = listener {
            if mute {
                self.mixer.remove_local_level_listener(&listener);
            } else {
                self.mixer.add_local_level_listener(&listener);
            }
        }
    }

    /// Returns `true` while muted.
    pub fn is_mute(&self) -> bool {
        self.mute.load(Ordering::SeqCst)
    }

    /// Returns the last measured level of a conference participant, or
    /// `None` when the SSRC was never measured.
    pub fn last_measured_level(&self, ssrc: u32) -> Option<u8> {
        self.mixer.last_level(ssrc)
    }

    /// Returns the last measured level of the local capture.
    pub fn last_measured_local_level(&self) -> u8 {
        self.mixer.last_local_level()
    }

    /// Returns the shared contributing-source list.
    pub fn remote_ssrcs(&self) -> Arc<[u32]> {
        self.device.ssrcs.snapshot()
    }

    /// Returns the shared SSRC registry for change subscriptions.
    pub fn ssrc_registry(&self) -> &SsrcRegistry {
        &self.device.ssrcs
    }

    /// Closes this session: retracts its streams and listeners and, when
    /// it was the last dependent, tears the mixer down.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(listener) = self.local_listener.lock().take() {
            self.mixer.remove_local_level_listener(&listener);
        }
        let ssrcs: Vec<u32> = self.streams.lock().drain().collect();
        for ssrc in ssrcs {
            self.mixer.remove_stream_input(ssrc);
            self.device.ssrcs.remove(ssrc);
        }
        self.device.release(self.id);
    }
}

impl Drop for MixerSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Shared read access to the mixer's one hardware capture.
pub struct SharedCapture {
    mixer: Arc<AudioMixer>,
    format: AudioFormat,
}

impl CaptureSource for SharedCapture {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn connect(&mut self) -> Result<(), MediaError> {
        // The underlying device was connected when the mixer was created.
        Ok(())
    }

    fn read_chunk(&mut self) -> Option<AudioChunk> {
        self.mixer.read_capture()
    }
}
