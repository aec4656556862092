//! Opaque codec/effect stages.
//!
//! Codec implementations live outside this crate. The pipeline only knows
//! an ordered chain of [`Stage`]s created from [`StageFactory`]s at realize
//! time. A factory that fails produces a [`MediaError::PluginMissing`]: the
//! stage is logged and skipped, and media flows without it.

use std::collections::HashMap;

use crate::chunk::AudioChunk;
use crate::error::MediaError;
use crate::format::MediaFormat;

/// One stage of a pipeline's codec chain.
///
/// Stages run on the pipeline worker at media rate and must not block.
pub trait Stage: Send {
    /// Name for logging.
    fn name(&self) -> &str;

    /// Processes one chunk, returning the transformed chunk.
    fn process(&mut self, chunk: AudioChunk) -> AudioChunk;

    /// Receives fmtp-style format parameters after realization.
    ///
    /// Stages that are not parameter-aware keep the default no-op.
    fn set_format_parameters(&mut self, _params: &HashMap<String, String>) {}
}

/// Creates [`Stage`]s for a negotiated format.
pub trait StageFactory: Send + Sync {
    /// Name of the stage this factory creates, for logging.
    fn name(&self) -> &str;

    /// Creates a stage for the given format.
    ///
    /// # Errors
    ///
    /// Returns [`MediaError::PluginMissing`] when the stage cannot be built
    /// for this format; the pipeline continues without it.
    fn create(&self, format: &MediaFormat) -> Result<Box<dyn Stage>, MediaError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::AudioFormat;
    use std::time::Duration;

    struct HalveStage;

    impl Stage for HalveStage {
        fn name(&self) -> &str {
            "halve"
        }

        fn process(&mut self, chunk: AudioChunk) -> AudioChunk {
            let samples: Vec<i16> = chunk.samples.iter().map(|&s| s / 2).collect();
            AudioChunk::new(samples, chunk.timestamp, chunk.sample_rate, chunk.channels)
        }
    }

    struct HalveFactory;

    impl StageFactory for HalveFactory {
        fn name(&self) -> &str {
            "halve"
        }

        fn create(&self, _format: &MediaFormat) -> Result<Box<dyn Stage>, MediaError> {
            Ok(Box::new(HalveStage))
        }
    }

    struct BrokenFactory;

    impl StageFactory for BrokenFactory {
        fn name(&self) -> &str {
            "broken"
        }

        fn create(&self, format: &MediaFormat) -> Result<Box<dyn Stage>, MediaError> {
            Err(MediaError::plugin_missing(
                "broken",
                format!("no implementation for {format}"),
            ))
        }
    }

    #[test]
    fn test_stage_processes_chunk() {
        let factory = HalveFactory;
        let mut stage = factory
            .create(&MediaFormat::Audio(AudioFormat::new(16000, 1)))
            .unwrap();

        let chunk = AudioChunk::new(vec![100, -100, 80], Duration::ZERO, 16000, 1);
        let out = stage.process(chunk);
        assert_eq!(&*out.samples, &[50, -50, 40]);
    }

    #[test]
    fn test_default_format_parameters_is_noop() {
        let mut stage = HalveStage;
        let mut params = HashMap::new();
        params.insert("useinbandfec".to_string(), "1".to_string());
        stage.set_format_parameters(&params);
    }

    #[test]
    fn test_broken_factory_reports_plugin_missing() {
        let err = match BrokenFactory.create(&MediaFormat::Audio(AudioFormat::new(16000, 1))) {
            Ok(_) => panic!("expected BrokenFactory to fail"),
            Err(e) => e,
        };
        assert!(matches!(err, MediaError::PluginMissing { .. }));
    }
}
