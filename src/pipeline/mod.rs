//! Pipeline lifecycle: configure → realize → start.
//!
//! A [`Pipeline`] turns a capture source into a pull-based output through an
//! ordered chain of opaque stages:
//!
//! ```text
//! CaptureHandle → Stage chain → Output ring → PipelineOutput (transport pulls)
//! ```
//!
//! All lifecycle work happens on a dedicated worker task. Callers send
//! commands and either react to [`PipelineEvent`]s (delivered on the worker,
//! never synchronously on the caller) or await [`Pipeline::wait_for_state`]
//! with a timeout when synchronous sequencing is required.

mod output;
mod stage;
mod worker;

pub use output::PipelineOutput;
pub use stage::{Stage, StageFactory};

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::device::MediaDevice;
use crate::format::MediaFormat;

/// A shareable handle to a pipeline's pull-based output.
pub type SharedOutput = Arc<Mutex<PipelineOutput>>;

/// The lifecycle states of a pipeline.
///
/// States advance in declaration order; `Closed` is terminal. `Stopped` is a
/// realized pipeline whose pump is paused, not a teardown state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    /// Created, no construction attempted yet.
    Unconfigured,
    /// Construction in progress on the worker.
    Configuring,
    /// Capture connected, content type accepted.
    Configured,
    /// Format negotiation and stage creation in progress.
    Realizing,
    /// Stages built, output allocated.
    Realized,
    /// Pumping media.
    Started,
    /// Realized but paused.
    Stopped,
    /// Torn down. Terminal.
    Closed,
}

impl PipelineState {
    /// Returns `true` if this state is at or past `other` in the lifecycle.
    ///
    /// `Closed` is past everything; callers waiting for a working state must
    /// treat it separately.
    pub fn at_least(self, other: Self) -> bool {
        self >= other
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unconfigured => "unconfigured",
            Self::Configuring => "configuring",
            Self::Configured => "configured",
            Self::Realizing => "realizing",
            Self::Realized => "realized",
            Self::Started => "started",
            Self::Stopped => "stopped",
            Self::Closed => "closed",
        };
        write!(f, "{s}")
    }
}

/// The content type a pipeline outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContentType {
    /// Packetized media for a transport stream.
    #[default]
    RtpStream,
    /// Raw media for local consumption.
    Raw,
}

/// Events delivered by the pipeline worker.
///
/// Delivered on the worker task via [`PipelineEventCallback`], never
/// synchronously on the thread that issued the triggering command.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    /// Construction finished; the capture is connected.
    Configured,
    /// Format negotiated (or track disabled) and stages built.
    Realized,
    /// An optional stage could not be created and was skipped.
    StageSkipped {
        /// Name of the skipped stage.
        stage: String,
        /// Why the stage was unavailable.
        reason: String,
    },
    /// The pipeline closed.
    Closed {
        /// Worker-reported failure when the closure was not requested.
        error: Option<String>,
    },
}

/// Callback for [`PipelineEvent`]s, invoked on the worker task.
pub type PipelineEventCallback = Arc<dyn Fn(PipelineEvent) + Send + Sync>;

/// Commands processed by the pipeline worker.
pub(crate) enum PipelineCommand {
    Configure,
    Realize,
    Start,
    Stop,
    Close,
    SetFormat(MediaFormat),
}

/// Static configuration for one pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Content type of the output.
    pub content_type: ContentType,
    /// Duration of each pumped chunk. Default 20ms (~50 buffers/s).
    pub chunk_duration: Duration,
    /// Capacity of the output ring. Default 2 seconds.
    pub output_capacity: Duration,
    /// Format parameters applied to parameter-aware stages after realize.
    pub format_params: HashMap<String, String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            content_type: ContentType::RtpStream,
            chunk_duration: Duration::from_millis(20),
            output_capacity: Duration::from_secs(2),
            format_params: HashMap::new(),
        }
    }
}

/// State shared between the [`Pipeline`] handle and its worker.
pub(crate) struct PipelineShared {
    pub(crate) state_tx: watch::Sender<PipelineState>,
    pub(crate) realized_format: Mutex<Option<MediaFormat>>,
    pub(crate) output: Mutex<Option<SharedOutput>>,
    pub(crate) callback: RwLock<Option<PipelineEventCallback>>,
    /// OS thread currently dispatching a callback, used by teardown to
    /// detect self-teardown from within a callback.
    pub(crate) dispatch_thread: Mutex<Option<ThreadId>>,
    pub(crate) muted: AtomicBool,
}

/// Handle to one pipeline and its worker task.
///
/// Cloning the handle is cheap; all clones address the same worker. Command
/// methods never block: they enqueue work for the worker and return.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<PipelineShared>,
    cmd_tx: mpsc::UnboundedSender<PipelineCommand>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Pipeline {
    /// Spawns a pipeline worker for `device`.
    ///
    /// Must be called within a Tokio runtime. The pipeline starts in
    /// `Unconfigured`; send [`Pipeline::configure`] to begin construction.
    pub(crate) fn spawn(
        device: Arc<dyn MediaDevice>,
        stages: Vec<Arc<dyn StageFactory>>,
        config: PipelineConfig,
        callback: Option<PipelineEventCallback>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PipelineState::Unconfigured);
        let shared = Arc::new(PipelineShared {
            state_tx,
            realized_format: Mutex::new(None),
            output: Mutex::new(None),
            callback: RwLock::new(callback),
            dispatch_thread: Mutex::new(None),
            muted: AtomicBool::new(false),
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker::run(
            worker::WorkerContext {
                shared: shared.clone(),
                device,
                stages,
                config,
            },
            cmd_rx,
        ));

        Self {
            shared,
            cmd_tx,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> PipelineState {
        *self.shared.state_tx.borrow()
    }

    /// Returns the format the pipeline realized with, if any.
    pub fn realized_format(&self) -> Option<MediaFormat> {
        *self.shared.realized_format.lock()
    }

    /// Returns the pull-based output once realized, or `None`.
    pub fn output(&self) -> Option<SharedOutput> {
        self.shared.output.lock().clone()
    }

    /// Begins asynchronous construction. Completion is signaled by a
    /// [`PipelineEvent::Configured`] on the worker.
    pub fn configure(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Configure);
    }

    /// Requests realization of a configured pipeline.
    pub fn realize(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Realize);
    }

    /// Starts the media pump. A start before realization is remembered and
    /// applied once the pipeline realizes.
    pub fn start(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Start);
    }

    /// Pauses the media pump.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Stop);
    }

    /// Requests teardown without waiting for it.
    pub fn close(&self) {
        let _ = self.cmd_tx.send(PipelineCommand::Close);
    }

    /// Sets the target format on a pipeline at or before `Configured`.
    ///
    /// Past that point the owning session rebuilds instead; an in-place set
    /// on a realized pipeline is ignored by the worker.
    pub fn set_format(&self, format: MediaFormat) {
        let _ = self.cmd_tx.send(PipelineCommand::SetFormat(format));
    }

    /// Replaces captured samples with silence without rebuilding.
    pub fn set_mute(&self, mute: bool) {
        self.shared.muted.store(mute, Ordering::SeqCst);
    }

    /// Returns `true` if the calling thread is currently dispatching one of
    /// this pipeline's callbacks.
    pub fn on_worker_thread(&self) -> bool {
        *self.shared.dispatch_thread.lock() == Some(std::thread::current().id())
    }

    /// Waits until the pipeline reaches `target`, with a deadline.
    ///
    /// Returns `false` on timeout, on closure before `target` was reached,
    /// or immediately when called from the pipeline's own callback (waiting
    /// there would deadlock the worker).
    pub async fn wait_for_state(&self, target: PipelineState, timeout: Duration) -> bool {
        let current = self.state();
        if target == PipelineState::Closed {
            if current == PipelineState::Closed {
                return true;
            }
        } else if current.at_least(target) && current != PipelineState::Closed {
            return true;
        }

        if self.on_worker_thread() {
            return false;
        }

        let mut rx = self.shared.state_tx.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.at_least(target) || *s == PipelineState::Closed),
        )
        .await;

        match reached {
            Ok(Ok(state)) => {
                let state = *state;
                if target == PipelineState::Closed {
                    state == PipelineState::Closed
                } else {
                    state.at_least(target) && state != PipelineState::Closed
                }
            }
            _ => false,
        }
    }

    /// Closes the pipeline and waits (bounded) for the worker to finish.
    ///
    /// When invoked from within one of this pipeline's own callbacks the
    /// wait is skipped: the worker is tearing itself down and joining it
    /// from its own dispatch would deadlock. On timeout the in-flight
    /// construction is abandoned and the state forced to `Closed`; the next
    /// access simply rebuilds.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let _ = self.cmd_tx.send(PipelineCommand::Close);

        if self.on_worker_thread() {
            return true;
        }

        if self.wait_for_state(PipelineState::Closed, timeout).await {
            self.worker.lock().take();
            true
        } else {
            if let Some(handle) = self.worker.lock().take() {
                handle.abort();
            }
            self.shared.state_tx.send_replace(PipelineState::Closed);
            self.shared.output.lock().take();
            false
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("state", &self.state())
            .field("realized_format", &self.realized_format())
            .finish()
    }
}
