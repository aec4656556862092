//! Integration tests for conf-media.
//!
//! Everything here runs against mock devices and streams; no audio
//! hardware is required.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conf_media::{
    level_listener, AudioChunk, AudioFormat, MediaDirection, MediaError, MediaFormat,
    MediaSession, MixerDevice, MockDevice, MockInbound, PipelineState, PlaybackListener,
    SessionConfig, Stage, StageFactory,
};
use parking_lot::Mutex;

const FMT: AudioFormat = AudioFormat::new(16000, 1);

fn audio_device(name: &str) -> Arc<MockDevice> {
    Arc::new(MockDevice::audio(name))
}

fn stream_with_samples(id: &str, ssrc: u32, value: i16, chunks: usize) -> Arc<MockInbound> {
    let stream = Arc::new(MockInbound::new(id, ssrc, FMT));
    for _ in 0..chunks {
        stream.queue_samples(&[value; 320]);
    }
    stream
}

// ---------------------------------------------------------------------------
// Send path: capture → stages → pull output
// ---------------------------------------------------------------------------

struct GainStage {
    factor: i32,
}

impl Stage for GainStage {
    fn name(&self) -> &str {
        "gain"
    }

    fn process(&mut self, chunk: AudioChunk) -> AudioChunk {
        let samples: Vec<i16> = chunk
            .samples
            .iter()
            .map(|&s| (i32::from(s) * self.factor).clamp(-32768, 32767) as i16)
            .collect();
        AudioChunk::new(samples, chunk.timestamp, chunk.sample_rate, chunk.channels)
    }

    fn set_format_parameters(&mut self, params: &HashMap<String, String>) {
        if let Some(factor) = params.get("gain").and_then(|v| v.parse().ok()) {
            self.factor = factor;
        }
    }
}

struct GainFactory;

impl StageFactory for GainFactory {
    fn name(&self) -> &str {
        "gain"
    }

    fn create(&self, _format: &MediaFormat) -> Result<Box<dyn Stage>, MediaError> {
        Ok(Box::new(GainStage { factor: 2 }))
    }
}

struct MissingFactory;

impl StageFactory for MissingFactory {
    fn name(&self) -> &str {
        "fancy-codec"
    }

    fn create(&self, format: &MediaFormat) -> Result<Box<dyn Stage>, MediaError> {
        Err(MediaError::plugin_missing(
            "fancy-codec",
            format!("not built for {format}"),
        ))
    }
}

#[tokio::test]
async fn send_path_flows_through_stage_chain() {
    let device = audio_device("mic");
    device.push_samples(&[100i16; 1600]); // 100ms of constant signal

    let session = MediaSession::new(device, SessionConfig::default());
    session.add_stage(Arc::new(GainFactory));
    session
        .set_format(MediaFormat::Audio(FMT))
        .expect("audio format accepted");
    session.start(MediaDirection::SendOnly);

    let output = session.output().await.expect("realized output");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let chunks = output.lock().drain();
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert!(chunk.samples.iter().all(|&s| s == 200), "gain applied");
    }
    session.close(MediaDirection::SendRecv).await;
}

#[tokio::test]
async fn missing_stage_degrades_gracefully() {
    let device = audio_device("mic");
    device.push_samples(&[100i16; 640]);

    let session = MediaSession::new(device, SessionConfig::default());
    session.add_stage(Arc::new(MissingFactory));
    session.set_format(MediaFormat::Audio(FMT)).unwrap();
    session.start(MediaDirection::SendOnly);

    // The optional stage is skipped; media still flows unmodified.
    let output = session.output().await.expect("output despite missing stage");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let chunks = output.lock().drain();
    assert!(!chunks.is_empty());
    assert!(chunks
        .iter()
        .all(|c| c.samples.iter().all(|&s| s == 100)));
    session.close(MediaDirection::SendRecv).await;
}

#[tokio::test]
async fn format_params_reach_parameter_aware_stages() {
    let device = audio_device("mic");
    device.push_samples(&[10i16; 640]);

    let mut config = SessionConfig::default();
    config.format_params.insert("gain".into(), "3".into());

    let session = MediaSession::new(device, config);
    session.add_stage(Arc::new(GainFactory));
    session.set_format(MediaFormat::Audio(FMT)).unwrap();
    session.start(MediaDirection::SendOnly);

    let output = session.output().await.expect("output");
    tokio::time::sleep(Duration::from_millis(80)).await;

    let chunks = output.lock().drain();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.samples.iter().all(|&s| s == 30)));
    session.close(MediaDirection::SendRecv).await;
}

// ---------------------------------------------------------------------------
// Failure semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unavailable_device_keeps_session_usable() {
    let device = Arc::new(MockDevice::audio("mic").failing_connect());
    let session = MediaSession::new(device, SessionConfig::default());
    session.start(MediaDirection::SendRecv);

    // Output is null, not an error...
    assert!(session.output().await.is_none());
    assert!(session.is_prematurely_closed());

    // ...and the playback side keeps working.
    let inbound = stream_with_samples("peer", 0x42, 50, 1);
    assert!(session.add_stream(inbound));
    assert_eq!(&*session.remote_ssrcs(), &[0x42]);
    session.close(MediaDirection::SendRecv).await;
}

#[tokio::test]
async fn teardown_mid_configuring_leaves_null_output_until_rebuilt() {
    let device = audio_device("mic");
    device.push_silence(40);
    let session = MediaSession::new(device.clone(), SessionConfig::default());

    // Kick off construction and immediately tear down.
    session.start(MediaDirection::SendOnly);
    session.close(MediaDirection::SendRecv).await;
    assert_eq!(session.pipeline_state(), None);

    // The next access rebuilds from scratch and succeeds.
    device.push_silence(40);
    session.start(MediaDirection::SendOnly);
    let rebuilt = session.output().await;
    assert!(rebuilt.is_some());
    assert!(session
        .pipeline_state()
        .expect("pipeline exists")
        .at_least(PipelineState::Realized));
    session.close(MediaDirection::SendRecv).await;
}

// ---------------------------------------------------------------------------
// Playback and SSRC wiring
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MembershipLog {
    added: AtomicUsize,
    removed: AtomicUsize,
}

impl PlaybackListener for MembershipLog {
    fn stream_added(&self, _ssrc: u32) {
        self.added.fetch_add(1, Ordering::SeqCst);
    }
    fn stream_removed(&self, _ssrc: u32) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn stream_membership_notifies_exactly_once() {
    let session = MediaSession::new(audio_device("mic"), SessionConfig::default());
    let log = Arc::new(MembershipLog::default());
    session.set_playback_listener(Some(log.clone()));

    let stream = stream_with_samples("peer", 0x77, 1, 1);
    assert!(session.add_stream(stream.clone()));
    assert!(!session.add_stream(stream));
    assert!(session.remove_stream(0x77));
    assert!(!session.remove_stream(0x77));

    assert_eq!(log.added.load(Ordering::SeqCst), 1);
    assert_eq!(log.removed.load(Ordering::SeqCst), 1);
    session.close(MediaDirection::SendRecv).await;
}

#[tokio::test]
async fn ssrc_changes_notify_with_old_and_new() {
    let session = MediaSession::new(audio_device("mic"), SessionConfig::default());
    let transitions: Arc<Mutex<Vec<(usize, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let transitions_clone = transitions.clone();

    session
        .ssrc_registry()
        .set_change_callback(Some(Arc::new(move |old: &[u32], new: &[u32]| {
            transitions_clone.lock().push((old.len(), new.len()));
        })));

    session.add_stream(stream_with_samples("b", 0xB, 1, 1));
    session.add_stream(stream_with_samples("c", 0xC, 1, 1));
    session.remove_stream(0xB);

    assert_eq!(&*transitions.lock(), &[(0, 1), (1, 2), (2, 1)]);
    session.close(MediaDirection::SendRecv).await;
}

// ---------------------------------------------------------------------------
// Conference mixing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn conference_local_mix_excludes_own_capture() {
    // Participant A's machine: capture + inbound B and C.
    let inner = audio_device("mic");
    inner.push_samples(&[1000i16; 960]); // 60ms of A's own voice
    let device = MixerDevice::new(inner).unwrap();
    let a = device.create_session().unwrap();

    a.add_stream(stream_with_samples("b", 0xB, 100, 3));
    a.add_stream(stream_with_samples("c", 0xC, 10, 3));

    for _ in 0..3 {
        let mix = a.read_local_output().expect("mix available");
        // B + C only; A's own 1000-valued capture never appears.
        assert!(mix.samples.iter().all(|&s| s == 110));
    }
    a.close();
}

#[tokio::test]
async fn conference_levels_gate_and_cache() {
    let inner = audio_device("mic");
    inner.push_samples(&[20000i16; 640]);
    let device = MixerDevice::new(inner).unwrap();
    let session = device.create_session().unwrap();

    let b = stream_with_samples("b", 0xB, 12000, 2);
    session.add_stream(b);

    // No listeners anywhere: reads must not measure anything.
    session.read_local_output();
    assert_eq!(session.last_measured_local_level(), 0);
    assert_eq!(session.last_measured_level(0xB), None);

    // Attach listeners; the next read measures and caches.
    let local_levels = Arc::new(AtomicUsize::new(0));
    let local_levels_clone = local_levels.clone();
    session.set_local_level_listener(Some(level_listener(move |_| {
        local_levels_clone.fetch_add(1, Ordering::SeqCst);
    })));
    session.set_stream_level_listener(Some(level_listener(|_| {})));

    session.read_local_output();
    assert_eq!(local_levels.load(Ordering::SeqCst), 1);
    assert!(session.last_measured_local_level() > 0);

    let cached = session.last_measured_level(0xB).expect("cached level");
    assert!(cached > 0);

    // Late poll without listeners still answers from the cache.
    session.set_stream_level_listener(None);
    assert_eq!(session.last_measured_level(0xB), Some(cached));
    session.close();
}

#[tokio::test]
async fn translator_shares_one_capture_across_sessions() {
    let inner = audio_device("mic");
    inner.push_samples(&[300i16; 640]);
    let device = MixerDevice::new(inner).unwrap();

    let a = device.create_session().unwrap();
    let b = device.create_session().unwrap();
    assert_eq!(device.dependent_count(), 2);

    // Both sessions read the same hardware capture through the mixer.
    let mut capture_a = a.open_shared_capture();
    capture_a.connect().unwrap();
    let chunk = capture_a.read_chunk().expect("shared capture data");
    assert!(chunk.samples.iter().all(|&s| s == 300));

    let mut capture_b = b.open_shared_capture();
    capture_b.connect().unwrap();
    assert!(capture_b.read_chunk().is_some());

    // The mixer lives until the last dependent closes.
    a.close();
    assert!(device.is_active());
    b.close();
    assert!(!device.is_active());
}

#[tokio::test]
async fn conference_session_feeds_send_pipeline_from_shared_capture() {
    // A translator-style send leg: a MediaSession whose device hands out
    // the mixer's shared capture instead of reopening the hardware.
    use conf_media::{CaptureHandle, MediaDevice, MediaKind, Renderer};

    let inner = audio_device("mic");
    inner.push_samples(&[400i16; 1600]);
    let mixer_device = MixerDevice::new(inner.clone()).unwrap();
    let conference = Arc::new(mixer_device.create_session().unwrap());

    struct SharedCaptureDevice {
        inner: Arc<MockDevice>,
        conference: Arc<conf_media::MixerSession>,
    }

    impl MediaDevice for SharedCaptureDevice {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn kind(&self) -> MediaKind {
            MediaKind::Audio
        }
        fn direction(&self) -> MediaDirection {
            MediaDirection::SendRecv
        }
        fn supported_formats(&self) -> Vec<MediaFormat> {
            self.inner.supported_formats()
        }
        fn open_capture(&self) -> Result<CaptureHandle, MediaError> {
            Ok(self.conference.open_shared_capture())
        }
        fn create_renderer(&self) -> Option<Box<dyn Renderer>> {
            self.inner.create_renderer()
        }
    }

    let send_device = Arc::new(SharedCaptureDevice {
        inner,
        conference: conference.clone(),
    });
    let session = MediaSession::new(send_device, SessionConfig::default());
    session.set_format(MediaFormat::Audio(FMT)).unwrap();
    session.start(MediaDirection::SendOnly);

    let output = session.output().await.expect("send leg output");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let chunks = output.lock().drain();
    assert!(!chunks.is_empty());
    assert!(chunks
        .iter()
        .all(|c| c.samples.iter().all(|&s| s == 400)));

    session.close(MediaDirection::SendRecv).await;
    conference.close();
}
