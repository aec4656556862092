//! Session events and named callback types.
//!
//! Events are non-fatal notifications about session and pipeline behavior.
//! Every callback type here carries the same contract: it is invoked on a
//! worker task (the pipeline worker or the mixer read path), never
//! synchronously on the thread that registered it, so implementations must
//! be quick and must not block.

use std::sync::Arc;

/// Notifications emitted by a [`MediaSession`] as its pipeline moves through
/// its lifecycle.
///
/// The session keeps running after any of these; they exist so that senders
/// can rebuild network legs ([`OutputChanged`]) and so applications can
/// observe pipeline health.
///
/// [`MediaSession`]: crate::MediaSession
/// [`OutputChanged`]: SessionEvent::OutputChanged
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session's output was replaced or discarded.
    ///
    /// Fired whenever the pipeline is rebuilt or torn down. Consumers that
    /// pull the session's output should re-request it.
    OutputChanged,

    /// The pipeline finished configuring and accepted its content type.
    PipelineConfigured,

    /// The pipeline was realized; codec-chain post-processing has run.
    PipelineRealized,

    /// The pipeline closed.
    PipelineClosed {
        /// `true` when closure arrived unexpectedly (the session did not
        /// request it). The session flags itself for rebuild in that case.
        unexpected: bool,
        /// Worker-reported reason, when the closure was caused by an error.
        reason: Option<String>,
    },

    /// Format negotiation found no supported format; the track was disabled.
    ///
    /// Media on other tracks continues; this session's output is `None`
    /// until a compatible format is set.
    TrackDisabled {
        /// Identity of the device that rejected the format.
        device: String,
        /// The format that was requested.
        requested: String,
    },

    /// An optional stage could not be created and was skipped.
    StageSkipped {
        /// Name of the skipped stage.
        stage: String,
        /// Why the stage was unavailable.
        reason: String,
    },
}

/// Callback type for receiving [`SessionEvent`]s.
///
/// Invoked on the pipeline worker task.
pub type SessionEventCallback = Arc<dyn Fn(SessionEvent) + Send + Sync>;

/// Creates a [`SessionEventCallback`] from a closure.
///
/// # Example
///
/// ```
/// use conf_media::{session_event_callback, SessionEvent};
///
/// let callback = session_event_callback(|event| {
///     tracing::debug!(?event, "session event");
/// });
/// callback(SessionEvent::OutputChanged);
/// ```
pub fn session_event_callback<F>(f: F) -> SessionEventCallback
where
    F: Fn(SessionEvent) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Callback type for audio-level notifications.
///
/// Receives a scalar level in `0..=127`. Invoked at media rate (commonly
/// ~50 times per second) on the mixer read path; implementations must not
/// block. Listener identity (for reference-counted subscription) is the
/// `Arc` allocation, so subscribe and unsubscribe with clones of the same
/// value.
pub type LevelListener = Arc<dyn Fn(u8) + Send + Sync>;

/// Creates a [`LevelListener`] from a closure.
///
/// # Example
///
/// ```
/// use conf_media::level_listener;
///
/// let listener = level_listener(|level| {
///     assert!(level <= 127);
/// });
/// listener(64);
/// ```
pub fn level_listener<F>(f: F) -> LevelListener
where
    F: Fn(u8) + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Callback fired when the SSRC set is replaced.
///
/// Receives the old and new contributing-source arrays so dependents (e.g.
/// an outgoing CSRC-list encoder) can react without polling.
pub type SsrcChangeCallback = Arc<dyn Fn(&[u32], &[u32]) + Send + Sync>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

    #[test]
    fn test_session_event_debug() {
        let event = SessionEvent::PipelineClosed {
            unexpected: true,
            reason: Some("device unplugged".to_string()),
        };
        let debug = format!("{event:?}");
        assert!(debug.contains("PipelineClosed"));
        assert!(debug.contains("device unplugged"));
    }

    #[test]
    fn test_session_event_callback_helper() {
        let called = Arc::new(AtomicBool::new(false));
        let called_clone = called.clone();

        let callback = session_event_callback(move |_| {
            called_clone.store(true, Ordering::SeqCst);
        });
        callback(SessionEvent::OutputChanged);
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_level_listener_helper() {
        let seen = Arc::new(AtomicU8::new(0));
        let seen_clone = seen.clone();

        let listener = level_listener(move |level| {
            seen_clone.store(level, Ordering::SeqCst);
        });
        listener(101);
        assert_eq!(seen.load(Ordering::SeqCst), 101);
    }

    #[test]
    fn test_level_listener_identity_is_arc() {
        let a = level_listener(|_| {});
        let b = a.clone();
        let c = level_listener(|_| {});

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
