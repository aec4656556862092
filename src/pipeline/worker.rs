//! The pipeline worker task.
//!
//! One worker owns one pipeline's capture handle, stage chain, and output
//! producer. Commands arrive over an unbounded channel; while started, an
//! interval pump pulls capture chunks through the stage chain into the
//! output ring. Lifecycle callbacks are dispatched from this task with the
//! dispatching OS thread recorded, so teardown can detect self-teardown.

use parking_lot::Mutex;
use ringbuf::traits::Producer;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::chunk::AudioChunk;
use crate::device::{CaptureHandle, MediaDevice};
use crate::error::MediaError;
use crate::format::{find_first_matching, MediaFormat, MediaKind};

use super::{
    output, PipelineCommand, PipelineConfig, PipelineEvent, PipelineShared, PipelineState, Stage,
    StageFactory,
};

pub(crate) struct WorkerContext {
    pub(crate) shared: Arc<PipelineShared>,
    pub(crate) device: Arc<dyn MediaDevice>,
    pub(crate) stages: Vec<Arc<dyn StageFactory>>,
    pub(crate) config: PipelineConfig,
}

pub(crate) async fn run(ctx: WorkerContext, mut cmd_rx: mpsc::UnboundedReceiver<PipelineCommand>) {
    let poll_interval = (ctx.config.chunk_duration / 2).max(Duration::from_millis(1));
    let mut worker = Worker {
        shared: ctx.shared,
        device: ctx.device,
        factories: ctx.stages,
        config: ctx.config,
        capture: None,
        chain: Vec::new(),
        producer: None,
        requested_format: None,
        track_enabled: true,
        pending_start: false,
    };

    let mut tick = tokio::time::interval(poll_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    // All handles dropped: tear down quietly.
                    None => {
                        worker.enter_closed(None);
                        break;
                    }
                    Some(cmd) => {
                        if worker.handle(cmd).is_break() {
                            break;
                        }
                    }
                }
            }
            _ = tick.tick(), if worker.pumping() => worker.pump(),
        }
    }
}

struct Worker {
    shared: Arc<PipelineShared>,
    device: Arc<dyn MediaDevice>,
    factories: Vec<Arc<dyn StageFactory>>,
    config: PipelineConfig,
    capture: Option<CaptureHandle>,
    chain: Vec<Box<dyn Stage>>,
    producer: Option<ringbuf::HeapProd<i16>>,
    requested_format: Option<MediaFormat>,
    track_enabled: bool,
    pending_start: bool,
}

impl Worker {
    fn state(&self) -> PipelineState {
        *self.shared.state_tx.borrow()
    }

    fn set_state(&self, state: PipelineState) {
        tracing::debug!(device = self.device.name(), %state, "pipeline state");
        self.shared.state_tx.send_replace(state);
    }

    /// Invokes the event callback with the dispatching thread recorded so
    /// that a teardown triggered from inside the callback can detect it is
    /// running on the pipeline's own worker.
    fn dispatch(&self, event: PipelineEvent) {
        let callback = self.shared.callback.read().clone();
        if let Some(callback) = callback {
            *self.shared.dispatch_thread.lock() = Some(std::thread::current().id());
            callback(event);
            *self.shared.dispatch_thread.lock() = None;
        }
    }

    fn handle(&mut self, cmd: PipelineCommand) -> ControlFlow<()> {
        match cmd {
            PipelineCommand::Configure => self.configure(),
            PipelineCommand::SetFormat(format) => {
                if self.state().at_least(PipelineState::Realizing) {
                    tracing::debug!(
                        device = self.device.name(),
                        %format,
                        "format set past Configured ignored; session rebuilds instead"
                    );
                } else {
                    self.requested_format = Some(format);
                }
                ControlFlow::Continue(())
            }
            PipelineCommand::Realize => self.realize(),
            PipelineCommand::Start => {
                match self.state() {
                    PipelineState::Realized | PipelineState::Stopped => {
                        self.set_state(PipelineState::Started);
                    }
                    PipelineState::Started | PipelineState::Closed => {}
                    // Not realized yet: remember the start and apply it
                    // once realization completes.
                    _ => self.pending_start = true,
                }
                ControlFlow::Continue(())
            }
            PipelineCommand::Stop => {
                if self.state() == PipelineState::Started {
                    self.set_state(PipelineState::Stopped);
                }
                self.pending_start = false;
                ControlFlow::Continue(())
            }
            PipelineCommand::Close => {
                self.enter_closed(None);
                ControlFlow::Break(())
            }
        }
    }

    fn configure(&mut self) -> ControlFlow<()> {
        if self.state() != PipelineState::Unconfigured {
            tracing::debug!(
                device = self.device.name(),
                state = %self.state(),
                "ignoring configure"
            );
            return ControlFlow::Continue(());
        }
        self.set_state(PipelineState::Configuring);

        let connected = self.device.open_capture().and_then(|mut handle| {
            handle.connect()?;
            Ok(handle)
        });

        match connected {
            Ok(handle) => {
                tracing::debug!(
                    device = self.device.name(),
                    format = %handle.format(),
                    content_type = ?self.config.content_type,
                    "capture connected"
                );
                self.capture = Some(handle);
                self.set_state(PipelineState::Configured);
                self.dispatch(PipelineEvent::Configured);
                ControlFlow::Continue(())
            }
            Err(error) => {
                tracing::warn!(
                    device = self.device.name(),
                    %error,
                    "pipeline construction failed"
                );
                self.enter_closed(Some(error.to_string()));
                ControlFlow::Break(())
            }
        }
    }

    fn realize(&mut self) -> ControlFlow<()> {
        if self.state() != PipelineState::Configured {
            tracing::debug!(
                device = self.device.name(),
                state = %self.state(),
                "ignoring realize"
            );
            return ControlFlow::Continue(());
        }
        self.set_state(PipelineState::Realizing);

        if let Some(format) = self.negotiate() {
            self.build_chain(&format);

            if let MediaFormat::Audio(audio) = format {
                let (producer, out) = output::create_output(
                    audio,
                    self.config.chunk_duration,
                    self.config.output_capacity,
                );
                self.producer = Some(producer);
                *self.shared.output.lock() = Some(Arc::new(Mutex::new(out)));
            }
            *self.shared.realized_format.lock() = Some(format);
            self.track_enabled = true;
        } else {
            self.track_enabled = false;
            *self.shared.realized_format.lock() = None;
        }

        self.set_state(PipelineState::Realized);
        self.dispatch(PipelineEvent::Realized);

        if self.pending_start {
            self.pending_start = false;
            self.set_state(PipelineState::Started);
        }
        ControlFlow::Continue(())
    }

    /// Picks the concrete format: the requested one matched against the
    /// device's supported list, falling back to the capture's native format
    /// when nothing was requested.
    fn negotiate(&self) -> Option<MediaFormat> {
        let supported = self.device.supported_formats();
        let requested = self.requested_format.or_else(|| {
            if self.device.kind() == MediaKind::Audio {
                self.capture
                    .as_ref()
                    .map(|c| MediaFormat::Audio(c.format()))
            } else {
                supported.first().copied()
            }
        })?;

        match find_first_matching(&supported, &requested) {
            Some(format) => {
                tracing::debug!(
                    device = self.device.name(),
                    requested = %requested,
                    actual = %format,
                    "format negotiated"
                );
                Some(format)
            }
            None => {
                let error = MediaError::FormatUnsupported {
                    device: self.device.name().to_string(),
                    requested: requested.to_string(),
                };
                tracing::warn!(%error, "disabling track");
                None
            }
        }
    }

    fn build_chain(&mut self, format: &MediaFormat) {
        self.chain.clear();
        for factory in &self.factories {
            match factory.create(format) {
                Ok(stage) => self.chain.push(stage),
                Err(error) => {
                    tracing::warn!(
                        device = self.device.name(),
                        stage = factory.name(),
                        %error,
                        "optional stage unavailable; continuing without it"
                    );
                    self.dispatch(PipelineEvent::StageSkipped {
                        stage: factory.name().to_string(),
                        reason: error.to_string(),
                    });
                }
            }
        }

        if !self.config.format_params.is_empty() {
            for stage in &mut self.chain {
                stage.set_format_parameters(&self.config.format_params);
            }
        }
    }

    fn pumping(&self) -> bool {
        self.state() == PipelineState::Started
            && self.track_enabled
            && self.capture.is_some()
            && self.producer.is_some()
    }

    fn pump(&mut self) {
        let muted = self.shared.muted.load(Ordering::SeqCst);
        let mut overflowed = 0usize;

        while let Some(chunk) = self.capture.as_mut().and_then(CaptureHandle::read_chunk) {
            let mut chunk = if muted {
                AudioChunk::new(
                    vec![0i16; chunk.samples.len()],
                    chunk.timestamp,
                    chunk.sample_rate,
                    chunk.channels,
                )
            } else {
                chunk
            };

            for stage in &mut self.chain {
                chunk = stage.process(chunk);
            }

            let Some(producer) = self.producer.as_mut() else {
                return;
            };
            for &sample in chunk.samples.iter() {
                if producer.try_push(sample).is_err() {
                    overflowed += 1;
                }
            }
        }

        if overflowed > 0 {
            tracing::debug!(
                device = self.device.name(),
                dropped = overflowed,
                "output ring full; dropping samples"
            );
        }
    }

    fn enter_closed(&mut self, error: Option<String>) {
        if self.state() == PipelineState::Closed {
            return;
        }
        // Capture is released before the output so the next pipeline can
        // reconnect the device immediately.
        self.capture = None;
        self.producer = None;
        self.shared.output.lock().take();
        self.set_state(PipelineState::Closed);
        self.dispatch(PipelineEvent::Closed { error });
    }
}
