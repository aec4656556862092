//! Inbound-stream-to-renderer bindings.
//!
//! The registry tracks which inbound sources and streams are being rendered
//! on a device. Structural access goes through a read-write lock: listing
//! proceeds concurrently, mutation is serialized, and add/remove
//! notifications run while holding only a read lock (the write lock is
//! atomically downgraded first) so a slow listener cannot block concurrent
//! structural operations.

use parking_lot::{RwLock, RwLockWriteGuard};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::device::{InboundSource, Renderer};

/// Observer of playback membership changes.
///
/// Callbacks fire only on the absent→present / present→absent transition
/// and run under the registry's read lock; keep them quick.
pub trait PlaybackListener: Send + Sync {
    /// A data source was bound for playback.
    fn source_added(&self, _id: &str) {}

    /// A data source was unbound.
    fn source_removed(&self, _id: &str) {}

    /// An inbound stream was bound for playback.
    fn stream_added(&self, _ssrc: u32) {}

    /// An inbound stream was unbound.
    fn stream_removed(&self, _ssrc: u32) {}
}

/// One playback binding: an optional source, an optional stream identity,
/// and the render pump driving the renderer.
///
/// The entry is destroyed when both its source and stream references are
/// cleared.
struct Playback {
    source: Option<Arc<dyn InboundSource>>,
    ssrc: Option<u32>,
    pump: Option<JoinHandle<()>>,
}

impl Playback {
    fn stop_pump(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Registry of inbound-stream-to-renderer bindings on one device.
///
/// All operations are idempotent: re-adding a known source or stream is a
/// no-op and fires no notification.
pub struct PlaybackRegistry {
    playbacks: RwLock<Vec<Playback>>,
    listener: RwLock<Option<Arc<dyn PlaybackListener>>>,
    pump_interval: Duration,
}

impl PlaybackRegistry {
    /// Creates an empty registry whose render pumps tick at
    /// `pump_interval`.
    pub fn new(pump_interval: Duration) -> Self {
        Self {
            playbacks: RwLock::new(Vec::new()),
            listener: RwLock::new(None),
            pump_interval,
        }
    }

    /// Sets or clears the membership listener.
    pub fn set_listener(&self, listener: Option<Arc<dyn PlaybackListener>>) {
        *self.listener.write() = listener;
    }

    /// Returns the number of playback entries.
    pub fn len(&self) -> usize {
        self.playbacks.read().len()
    }

    /// Returns `true` if no playbacks exist.
    pub fn is_empty(&self) -> bool {
        self.playbacks.read().is_empty()
    }

    /// Returns `true` if a source with this identity is bound.
    pub fn has_source(&self, id: &str) -> bool {
        self.playbacks
            .read()
            .iter()
            .any(|p| p.source.as_ref().is_some_and(|s| s.id() == id))
    }

    /// Returns `true` if a stream with this SSRC is bound.
    pub fn has_stream(&self, ssrc: u32) -> bool {
        self.playbacks.read().iter().any(|p| p.ssrc == Some(ssrc))
    }

    /// Returns the bound streams (entries with a stream identity).
    pub fn streams(&self) -> Vec<Arc<dyn InboundSource>> {
        self.playbacks
            .read()
            .iter()
            .filter(|p| p.ssrc.is_some())
            .filter_map(|p| p.source.clone())
            .collect()
    }

    /// Binds a data source for playback, driving `renderer` when given.
    ///
    /// A source whose SSRC matches an existing source-less stream entry
    /// joins that entry instead of creating a second one. Returns `true`
    /// and fires `source_added` exactly once per absent→present transition.
    ///
    /// Must be called within a Tokio runtime when `renderer` is `Some`.
    pub fn add_source(
        &self,
        source: Arc<dyn InboundSource>,
        renderer: Option<Box<dyn Renderer>>,
    ) -> bool {
        let mut playbacks = self.playbacks.write();
        let known = playbacks
            .iter()
            .any(|p| p.source.as_ref().is_some_and(|s| s.id() == source.id()));
        if known {
            return false;
        }

        let pump = renderer.map(|r| spawn_render_pump(source.clone(), r, self.pump_interval));
        let joined = playbacks
            .iter_mut()
            .find(|p| p.source.is_none() && p.ssrc.is_some() && p.ssrc == source.ssrc());
        match joined {
            Some(entry) => {
                entry.source = Some(source.clone());
                entry.pump = pump;
            }
            None => playbacks.push(Playback {
                source: Some(source.clone()),
                ssrc: None,
                pump,
            }),
        }

        let playbacks = RwLockWriteGuard::downgrade(playbacks);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.source_added(source.id());
        }
        drop(playbacks);
        true
    }

    /// Unbinds a data source.
    ///
    /// The playback entry survives if it still references a stream.
    /// Returns `true` and fires `source_removed` only when the source was
    /// actually bound.
    pub fn remove_source(&self, id: &str) -> bool {
        let mut playbacks = self.playbacks.write();
        let Some(index) = playbacks
            .iter()
            .position(|p| p.source.as_ref().is_some_and(|s| s.id() == id))
        else {
            return false;
        };

        playbacks[index].stop_pump();
        playbacks[index].source = None;
        if playbacks[index].ssrc.is_none() {
            playbacks.remove(index);
        }

        let playbacks = RwLockWriteGuard::downgrade(playbacks);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.source_removed(id);
        }
        drop(playbacks);
        true
    }

    /// Binds an inbound stream (which must carry an SSRC) for playback.
    ///
    /// Returns `true` and fires `stream_added` exactly once per
    /// absent→present transition; re-adding a known SSRC is a no-op.
    pub fn add_stream(
        &self,
        stream: Arc<dyn InboundSource>,
        renderer: Option<Box<dyn Renderer>>,
    ) -> bool {
        let Some(ssrc) = stream.ssrc() else {
            tracing::warn!(source = stream.id(), "stream without SSRC not bound");
            return false;
        };

        let mut playbacks = self.playbacks.write();
        if playbacks.iter().any(|p| p.ssrc == Some(ssrc)) {
            return false;
        }

        let pump = renderer.map(|r| spawn_render_pump(stream.clone(), r, self.pump_interval));
        playbacks.push(Playback {
            source: Some(stream),
            ssrc: Some(ssrc),
            pump,
        });

        let playbacks = RwLockWriteGuard::downgrade(playbacks);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.stream_added(ssrc);
        }
        drop(playbacks);
        true
    }

    /// Unbinds an inbound stream, destroying its playback entry.
    ///
    /// Removing an unknown SSRC is a no-op.
    pub fn remove_stream(&self, ssrc: u32) -> bool {
        let mut playbacks = self.playbacks.write();
        let Some(index) = playbacks.iter().position(|p| p.ssrc == Some(ssrc)) else {
            return false;
        };

        playbacks[index].stop_pump();
        playbacks.remove(index);

        let playbacks = RwLockWriteGuard::downgrade(playbacks);
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.stream_removed(ssrc);
        }
        drop(playbacks);
        true
    }

    /// Drops every playback and stops its pump. Fires no notifications;
    /// used during session teardown.
    pub fn clear(&self) {
        let mut playbacks = self.playbacks.write();
        for playback in playbacks.iter_mut() {
            playback.stop_pump();
        }
        playbacks.clear();
    }
}

impl Drop for PlaybackRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

/// Drives one renderer from one source until aborted.
fn spawn_render_pump(
    source: Arc<dyn InboundSource>,
    renderer: Box<dyn Renderer>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            while let Some(chunk) = source.read_chunk() {
                if let Err(error) = renderer.render(&chunk).await {
                    tracing::warn!(renderer = renderer.name(), %error, "render failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockInbound, MockRenderer};
    use crate::format::AudioFormat;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingListener {
        source_added: AtomicUsize,
        source_removed: AtomicUsize,
        stream_added: AtomicUsize,
        stream_removed: AtomicUsize,
    }

    impl PlaybackListener for CountingListener {
        fn source_added(&self, _id: &str) {
            self.source_added.fetch_add(1, Ordering::SeqCst);
        }
        fn source_removed(&self, _id: &str) {
            self.source_removed.fetch_add(1, Ordering::SeqCst);
        }
        fn stream_added(&self, _ssrc: u32) {
            self.stream_added.fetch_add(1, Ordering::SeqCst);
        }
        fn stream_removed(&self, _ssrc: u32) {
            self.stream_removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn registry_with_listener() -> (PlaybackRegistry, Arc<CountingListener>) {
        let registry = PlaybackRegistry::new(Duration::from_millis(5));
        let listener = Arc::new(CountingListener::default());
        registry.set_listener(Some(listener.clone()));
        (registry, listener)
    }

    #[tokio::test]
    async fn test_add_source_is_idempotent() {
        let (registry, listener) = registry_with_listener();
        let source = Arc::new(MockInbound::unbound("ds-1", AudioFormat::new(16000, 1)));

        assert!(registry.add_source(source.clone(), None));
        assert!(!registry.add_source(source.clone(), None));

        assert_eq!(registry.len(), 1);
        assert_eq!(listener.source_added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_remove_source_notifies_once() {
        let (registry, listener) = registry_with_listener();
        let source = Arc::new(MockInbound::unbound("ds-1", AudioFormat::new(16000, 1)));

        registry.add_source(source, None);
        assert!(registry.remove_source("ds-1"));
        assert!(!registry.remove_source("ds-1"));

        assert!(registry.is_empty());
        assert_eq!(listener.source_removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_add_stream_is_idempotent() {
        let (registry, listener) = registry_with_listener();
        let stream = Arc::new(MockInbound::new("peer-1", 0x10, AudioFormat::new(16000, 1)));

        assert!(registry.add_stream(stream.clone(), None));
        assert!(!registry.add_stream(stream, None));

        assert!(registry.has_stream(0x10));
        assert_eq!(listener.stream_added.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stream_without_ssrc_rejected() {
        let (registry, listener) = registry_with_listener();
        let bare = Arc::new(MockInbound::unbound("ds-1", AudioFormat::new(16000, 1)));

        assert!(!registry.add_stream(bare, None));
        assert!(registry.is_empty());
        assert_eq!(listener.stream_added.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_entry_survives_until_both_references_cleared() {
        let (registry, _) = registry_with_listener();
        let stream = Arc::new(MockInbound::new("peer-1", 0x20, AudioFormat::new(16000, 1)));

        registry.add_stream(stream, None);
        // Unbinding the source leaves the stream reference in place.
        assert!(registry.remove_source("peer-1"));
        assert_eq!(registry.len(), 1);
        assert!(registry.has_stream(0x20));

        // Clearing the stream reference destroys the entry.
        assert!(registry.remove_stream(0x20));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_render_pump_drives_renderer() {
        let registry = PlaybackRegistry::new(Duration::from_millis(2));
        let stream = Arc::new(MockInbound::new("peer-1", 0x30, AudioFormat::new(16000, 1)));
        stream.queue_samples(&[100i16; 320]);
        stream.queue_samples(&[200i16; 320]);

        let renderer = Arc::new(MockRenderer::new("speaker"));

        struct ForwardingRenderer(Arc<MockRenderer>);

        #[async_trait::async_trait]
        impl Renderer for ForwardingRenderer {
            fn name(&self) -> &str {
                self.0.name()
            }
            async fn render(&self, chunk: &crate::AudioChunk) -> Result<(), crate::MediaError> {
                self.0.render(chunk).await
            }
        }

        registry.add_stream(stream, Some(Box::new(ForwardingRenderer(renderer.clone()))));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(renderer.rendered(), 2);

        registry.remove_stream(0x30);
    }

    #[tokio::test]
    async fn test_source_joins_existing_stream_entry() {
        let (registry, listener) = registry_with_listener();
        let stream = Arc::new(MockInbound::new("peer-1", 0x40, AudioFormat::new(16000, 1)));

        registry.add_stream(stream, None);
        registry.remove_source("peer-1");
        assert_eq!(registry.len(), 1);

        // A new source carrying the same SSRC joins the orphaned entry.
        let replacement = Arc::new(MockInbound::new("peer-1b", 0x40, AudioFormat::new(16000, 1)));
        assert!(registry.add_source(replacement, None));
        assert_eq!(registry.len(), 1);
        assert!(registry.has_source("peer-1b"));
        assert_eq!(listener.source_added.load(Ordering::SeqCst), 1);
    }
}
