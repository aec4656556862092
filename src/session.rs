//! The use of one media device by one stream.
//!
//! A [`MediaSession`] owns a pipeline's lifecycle: the direction state
//! machine, lazy pipeline construction, format negotiation, the playback
//! registry for inbound streams, and the SSRC bookkeeping that supports
//! conferencing. Failures never cross the session boundary — a broken
//! capture or unmatched format logs, yields `None` output, and is retried
//! on the next access.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::device::{InboundSource, MediaDevice};
use crate::direction::MediaDirection;
use crate::error::MediaError;
use crate::event::{SessionEvent, SessionEventCallback};
use crate::format::MediaFormat;
use crate::pipeline::{
    ContentType, Pipeline, PipelineConfig, PipelineEvent, PipelineEventCallback, PipelineState,
    SharedOutput, StageFactory,
};
use crate::playback::{PlaybackListener, PlaybackRegistry};
use crate::ssrc::SsrcRegistry;

/// Plain configuration values supplied by the configuration collaborator.
///
/// The session never polls configuration; changes arrive as new calls into
/// the session (e.g. [`MediaSession::set_format`], [`MediaSession::set_mute`]).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Content type the pipeline outputs.
    pub content_type: ContentType,
    /// Duration of each pumped chunk. Default 20ms.
    pub chunk_duration: Duration,
    /// Capacity of the pipeline output ring. Default 2 seconds.
    pub output_capacity: Duration,
    /// Deadline for waits on pipeline state transitions. Default 2 seconds.
    pub state_timeout: Duration,
    /// Format parameters for parameter-aware stages.
    pub format_params: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            content_type: ContentType::RtpStream,
            chunk_duration: Duration::from_millis(20),
            output_capacity: Duration::from_secs(2),
            state_timeout: Duration::from_secs(2),
            format_params: HashMap::new(),
        }
    }
}

struct SessionShared {
    device: Arc<dyn MediaDevice>,
    config: SessionConfig,
    stages: Mutex<Vec<Arc<dyn StageFactory>>>,
    format: Mutex<Option<MediaFormat>>,
    pipeline: Mutex<Option<Pipeline>>,
    /// Incremented per pipeline build; events from a replaced pipeline are
    /// ignored so a stale closure cannot flag the live one.
    pipeline_generation: AtomicU64,
    /// Set when the pipeline closed at an unexpected time. Distinct from an
    /// absent pipeline: a later format-set or output access must force a
    /// rebuild rather than silently reuse the dead pipeline.
    prematurely_closed: AtomicBool,
    output_size_changed: AtomicBool,
    started_direction: Mutex<MediaDirection>,
    mute: AtomicBool,
    playbacks: PlaybackRegistry,
    ssrcs: SsrcRegistry,
    event_callback: RwLock<Option<SessionEventCallback>>,
}

impl SessionShared {
    fn emit(&self, event: SessionEvent) {
        let callback = self.event_callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn current_pipeline(&self) -> Option<Pipeline> {
        self.pipeline.lock().clone()
    }

    fn on_pipeline_event(&self, generation: u64, event: PipelineEvent) {
        if self.pipeline_generation.load(Ordering::SeqCst) != generation {
            tracing::debug!(
                device = self.device.name(),
                ?event,
                "event from replaced pipeline ignored"
            );
            return;
        }
        match event {
            PipelineEvent::Configured => {
                if let Some(pipeline) = self.current_pipeline() {
                    // Apply any already-requested format, then drive on to
                    // realization.
                    if let Some(format) = *self.format.lock() {
                        pipeline.set_format(format);
                    }
                    pipeline.realize();
                }
                self.emit(SessionEvent::PipelineConfigured);
            }
            PipelineEvent::Realized => {
                if let Some(pipeline) = self.current_pipeline() {
                    if pipeline.realized_format().is_none() {
                        let requested = self
                            .format
                            .lock()
                            .map_or_else(|| "unspecified".to_string(), |f| f.to_string());
                        self.emit(SessionEvent::TrackDisabled {
                            device: self.device.name().to_string(),
                            requested,
                        });
                    }
                }
                self.emit(SessionEvent::PipelineRealized);
            }
            PipelineEvent::StageSkipped { stage, reason } => {
                self.emit(SessionEvent::StageSkipped { stage, reason });
            }
            PipelineEvent::Closed { error } => {
                let unexpected = error.is_some();
                if unexpected {
                    self.prematurely_closed.store(true, Ordering::SeqCst);
                    let closure = MediaError::PrematureClosure {
                        device: self.device.name().to_string(),
                        reason: error.clone().unwrap_or_default(),
                    };
                    tracing::warn!(error = %closure, "will rebuild on next access");
                }
                self.emit(SessionEvent::PipelineClosed {
                    unexpected,
                    reason: error,
                });
            }
        }
    }
}

/// The use of a specific [`MediaDevice`] by one media stream.
///
/// Cloning a session is cheap and yields a second handle to the same
/// session. Sessions require a Tokio runtime: pipeline workers and render
/// pumps are spawned tasks.
///
/// # Lifecycle
///
/// 1. Create with [`MediaSession::new`]; nothing is built yet.
/// 2. [`start`](Self::start) a direction; the send side lazily constructs
///    the pipeline.
/// 3. Pull encoded media via [`output`](Self::output); bind inbound streams
///    via [`add_stream`](Self::add_stream).
/// 4. [`close`](Self::close) tears down capture first, then playback.
#[derive(Clone)]
pub struct MediaSession {
    shared: Arc<SessionShared>,
}

impl MediaSession {
    /// Creates a session over `device` with the given configuration.
    pub fn new(device: Arc<dyn MediaDevice>, config: SessionConfig) -> Self {
        let playbacks = PlaybackRegistry::new(config.chunk_duration);
        Self {
            shared: Arc::new(SessionShared {
                device,
                config,
                stages: Mutex::new(Vec::new()),
                format: Mutex::new(None),
                pipeline: Mutex::new(None),
                pipeline_generation: AtomicU64::new(0),
                prematurely_closed: AtomicBool::new(false),
                output_size_changed: AtomicBool::new(false),
                started_direction: Mutex::new(MediaDirection::Inactive),
                mute: AtomicBool::new(false),
                playbacks,
                ssrcs: SsrcRegistry::new(),
                event_callback: RwLock::new(None),
            }),
        }
    }

    /// Returns the device this session uses.
    pub fn device(&self) -> Arc<dyn MediaDevice> {
        self.shared.device.clone()
    }

    /// Appends a codec/effect stage factory to the pipeline chain.
    ///
    /// Takes effect on the next pipeline build.
    pub fn add_stage(&self, factory: Arc<dyn StageFactory>) {
        self.shared.stages.lock().push(factory);
    }

    /// Sets or clears the session event callback.
    pub fn set_event_callback(&self, callback: Option<SessionEventCallback>) {
        *self.shared.event_callback.write() = callback;
    }

    /// Sets or clears the playback membership listener.
    pub fn set_playback_listener(&self, listener: Option<Arc<dyn PlaybackListener>>) {
        self.shared.playbacks.set_listener(listener);
    }

    /// Returns the direction this session has been started in.
    pub fn started_direction(&self) -> MediaDirection {
        *self.shared.started_direction.lock()
    }

    /// Starts processing in `direction`, unioned into the current state.
    pub fn start(&self, direction: MediaDirection) {
        let (old, new) = {
            let mut started = self.shared.started_direction.lock();
            let old = *started;
            *started = old.or(direction);
            (old, *started)
        };
        if old != new {
            self.direction_changed(old, new);
        }
    }

    /// Stops processing in `direction`, subtracted from the current state.
    pub fn stop(&self, direction: MediaDirection) {
        let (old, new) = {
            let mut started = self.shared.started_direction.lock();
            let old = *started;
            *started = old.subtract(direction);
            (old, *started)
        };
        if old != new {
            self.direction_changed(old, new);
        }
    }

    fn direction_changed(&self, old: MediaDirection, new: MediaDirection) {
        tracing::debug!(
            device = self.shared.device.name(),
            %old,
            %new,
            "started direction changed"
        );
        if new.allows_sending() {
            let pipeline = self.ensure_pipeline();
            pipeline.start();
        } else if let Some(pipeline) = self.shared.current_pipeline() {
            let state = pipeline.state();
            if state.at_least(PipelineState::Realizing) && state != PipelineState::Closed {
                pipeline.stop();
            }
        }
    }

    /// Sets the format this session outputs in.
    ///
    /// Non-blocking. With no pipeline the format is stored for the next
    /// build. A pipeline at or before `Configured` takes the format in
    /// place. Past that, a divergent format, a prematurely-closed pipeline,
    /// or a changed output size forces teardown; the pipeline is rebuilt
    /// lazily on the next output access.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::KindMismatch`] when the format's kind differs
    /// from the device's.
    pub fn set_format(&self, format: MediaFormat) -> Result<(), MediaError> {
        if format.kind() != self.shared.device.kind() {
            return Err(MediaError::KindMismatch {
                expected: self.shared.device.kind(),
                actual: format.kind(),
            });
        }

        {
            let mut stored = self.shared.format.lock();
            if let (Some(MediaFormat::Video(old)), MediaFormat::Video(new)) = (*stored, format) {
                if old.size() != new.size() {
                    self.shared.output_size_changed.store(true, Ordering::SeqCst);
                }
            }
            *stored = Some(format);
        }
        tracing::debug!(device = self.shared.device.name(), %format, "format set");

        if let Some(pipeline) = self.shared.current_pipeline() {
            let state = pipeline.state();
            if state == PipelineState::Closed {
                // Dead pipeline; the next access rebuilds with the new format.
            } else if state <= PipelineState::Configured {
                pipeline.set_format(format);
            } else {
                let differs = pipeline.realized_format() != Some(format);
                let rebuild = self.shared.prematurely_closed.load(Ordering::SeqCst)
                    || differs
                    || self.shared.output_size_changed.load(Ordering::SeqCst);
                if rebuild {
                    self.shared.output_size_changed.store(false, Ordering::SeqCst);
                    self.discard_pipeline();
                }
            }
        }
        Ok(())
    }

    /// Returns the last requested format.
    pub fn format(&self) -> Option<MediaFormat> {
        *self.shared.format.lock()
    }

    /// Returns the format the current pipeline realized with, if any.
    pub fn realized_format(&self) -> Option<MediaFormat> {
        self.shared
            .current_pipeline()
            .and_then(|p| p.realized_format())
    }

    /// Returns the current pipeline state, or `None` before first build.
    pub fn pipeline_state(&self) -> Option<PipelineState> {
        self.shared.current_pipeline().map(|p| p.state())
    }

    /// Returns `true` while the session is flagged for rebuild after an
    /// unexpected pipeline closure.
    pub fn is_prematurely_closed(&self) -> bool {
        self.shared.prematurely_closed.load(Ordering::SeqCst)
    }

    /// Gets the session's pull-based output, building the pipeline if
    /// needed.
    ///
    /// Waits (bounded by the configured state timeout) for the pipeline to
    /// realize, then starts it in accord with the started direction.
    /// Returns `None` when construction failed or the track is disabled;
    /// the failure was logged and the next call retries.
    pub async fn output(&self) -> Option<SharedOutput> {
        let pipeline = self.ensure_pipeline();
        if !pipeline
            .wait_for_state(PipelineState::Realized, self.shared.config.state_timeout)
            .await
        {
            tracing::warn!(
                device = self.shared.device.name(),
                state = %pipeline.state(),
                "pipeline not realized; output unavailable"
            );
            return None;
        }
        if self.started_direction().allows_sending() {
            pipeline.start();
        }
        pipeline.output()
    }

    /// Mutes or unmutes the outgoing side without rebuilding.
    ///
    /// While muted the pipeline outputs silence in place of captured media.
    pub fn set_mute(&self, mute: bool) {
        if self.shared.mute.swap(mute, Ordering::SeqCst) != mute {
            if let Some(pipeline) = self.shared.current_pipeline() {
                pipeline.set_mute(mute);
            }
        }
    }

    /// Returns `true` while the outgoing side is muted.
    pub fn is_mute(&self) -> bool {
        self.shared.mute.load(Ordering::SeqCst)
    }

    /// Binds a data source for playback on this device.
    pub fn add_playback_source(&self, source: Arc<dyn InboundSource>) -> bool {
        let renderer = self.shared.device.create_renderer();
        self.shared.playbacks.add_source(source, renderer)
    }

    /// Unbinds a playback data source.
    pub fn remove_playback_source(&self, id: &str) -> bool {
        self.shared.playbacks.remove_source(id)
    }

    /// Binds an inbound stream for playback and records its SSRC.
    pub fn add_stream(&self, stream: Arc<dyn InboundSource>) -> bool {
        let Some(ssrc) = stream.ssrc() else {
            tracing::warn!(
                source = stream.id(),
                "inbound stream without SSRC; use add_playback_source"
            );
            return false;
        };
        let renderer = self.shared.device.create_renderer();
        let added = self.shared.playbacks.add_stream(stream, renderer);
        if added {
            self.shared.ssrcs.add(ssrc);
        }
        added
    }

    /// Unbinds an inbound stream and forgets its SSRC.
    pub fn remove_stream(&self, ssrc: u32) -> bool {
        let removed = self.shared.playbacks.remove_stream(ssrc);
        if removed {
            self.shared.ssrcs.remove(ssrc);
        }
        removed
    }

    /// Returns the SSRCs of the parties this session receives from.
    pub fn remote_ssrcs(&self) -> Arc<[u32]> {
        self.shared.ssrcs.snapshot()
    }

    /// Returns the SSRC registry for change subscriptions.
    pub fn ssrc_registry(&self) -> &SsrcRegistry {
        &self.shared.ssrcs
    }

    /// Returns the playback registry.
    pub fn playbacks(&self) -> &PlaybackRegistry {
        &self.shared.playbacks
    }

    /// Stops `direction` and releases the session's resources.
    ///
    /// Capture stops before playback: echo-cancellation paths read across
    /// both, so the reverse order can stall the playback side. The pipeline
    /// shutdown is bounded by the configured state timeout, and teardown
    /// from within a pipeline callback skips the wait instead of joining
    /// the worker it is running on.
    pub async fn close(&self, direction: MediaDirection) {
        self.stop(direction);

        // capture
        let pipeline = self.shared.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            if !pipeline.shutdown(self.shared.config.state_timeout).await {
                tracing::warn!(
                    device = self.shared.device.name(),
                    "pipeline shutdown timed out; construction abandoned"
                );
            }
        }

        // playback
        self.shared.playbacks.clear();
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            content_type: self.shared.config.content_type,
            chunk_duration: self.shared.config.chunk_duration,
            output_capacity: self.shared.config.output_capacity,
            format_params: self.shared.config.format_params.clone(),
        }
    }

    fn pipeline_callback(&self, generation: u64) -> PipelineEventCallback {
        let weak: Weak<SessionShared> = Arc::downgrade(&self.shared);
        Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.on_pipeline_event(generation, event);
            }
        })
    }

    /// Returns the live pipeline, building one when absent or closed.
    fn ensure_pipeline(&self) -> Pipeline {
        let mut guard = self.shared.pipeline.lock();
        if let Some(pipeline) = guard.as_ref() {
            if pipeline.state() != PipelineState::Closed {
                return pipeline.clone();
            }
        }
        let replacing = guard.is_some();
        self.shared.prematurely_closed.store(false, Ordering::SeqCst);
        let generation = self
            .shared
            .pipeline_generation
            .fetch_add(1, Ordering::SeqCst)
            + 1;

        let pipeline = Pipeline::spawn(
            self.shared.device.clone(),
            self.shared.stages.lock().clone(),
            self.pipeline_config(),
            Some(self.pipeline_callback(generation)),
        );
        pipeline.set_mute(self.shared.mute.load(Ordering::SeqCst));
        *guard = Some(pipeline.clone());
        drop(guard);

        pipeline.configure();
        if replacing {
            self.shared.emit(SessionEvent::OutputChanged);
        }
        pipeline
    }

    fn discard_pipeline(&self) {
        let pipeline = self.shared.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            pipeline.close();
            self.shared.emit(SessionEvent::OutputChanged);
        }
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("device", &self.shared.device.name())
            .field("direction", &self.started_direction())
            .field("format", &self.format())
            .field("pipeline_state", &self.pipeline_state())
            .finish()
    }
}
