//! Pull-based pipeline output over a ring buffer.

use ringbuf::traits::{Consumer, Observer, Split};
use ringbuf::HeapRb;
use std::time::Duration;

use crate::chunk::AudioChunk;
use crate::format::AudioFormat;

/// The pull side of a realized pipeline.
///
/// The worker pushes processed samples into the ring; the transport
/// collaborator pulls them back out in whole chunks. Reads never block: a
/// chunk is returned only once enough samples have accumulated.
pub struct PipelineOutput {
    consumer: ringbuf::HeapCons<i16>,
    format: AudioFormat,
    chunk_size: usize,
    samples_read: u64,
}

impl PipelineOutput {
    /// Returns the format of the produced chunks.
    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Returns the number of samples currently buffered.
    pub fn available(&self) -> usize {
        self.consumer.occupied_len()
    }

    /// Returns `true` if a complete chunk can be read.
    pub fn has_chunk(&self) -> bool {
        self.available() >= self.chunk_size
    }

    /// Reads the next complete chunk, or `None` if not enough samples have
    /// accumulated.
    pub fn try_read_chunk(&mut self) -> Option<AudioChunk> {
        if !self.has_chunk() {
            return None;
        }

        let mut samples = Vec::with_capacity(self.chunk_size);
        for _ in 0..self.chunk_size {
            match self.consumer.try_pop() {
                Some(sample) => samples.push(sample),
                None => break,
            }
        }
        if samples.is_empty() {
            return None;
        }

        Some(self.make_chunk(samples))
    }

    /// Drains everything buffered, the final chunk possibly short.
    pub fn drain(&mut self) -> Vec<AudioChunk> {
        let mut chunks = Vec::new();
        while let Some(chunk) = self.try_read_chunk() {
            chunks.push(chunk);
        }

        let mut rest = Vec::with_capacity(self.available());
        while let Some(sample) = self.consumer.try_pop() {
            rest.push(sample);
        }
        if !rest.is_empty() {
            chunks.push(self.make_chunk(rest));
        }
        chunks
    }

    fn make_chunk(&mut self, samples: Vec<i16>) -> AudioChunk {
        let timestamp = Duration::from_secs_f64(
            self.samples_read as f64
                / f64::from(self.format.sample_rate)
                / f64::from(self.format.channels),
        );
        self.samples_read += samples.len() as u64;
        AudioChunk::new(
            samples,
            timestamp,
            self.format.sample_rate,
            self.format.channels,
        )
    }
}

/// Creates the producer/output pair for a realized pipeline.
pub(crate) fn create_output(
    format: AudioFormat,
    chunk_duration: Duration,
    capacity: Duration,
) -> (ringbuf::HeapProd<i16>, PipelineOutput) {
    let frames_per_chunk =
        (f64::from(format.sample_rate) * chunk_duration.as_secs_f64()) as usize;
    let chunk_size = frames_per_chunk.max(1) * format.channels as usize;

    let capacity_samples = ((f64::from(format.sample_rate) * capacity.as_secs_f64()) as usize
        * format.channels as usize)
        .max(chunk_size);

    let ring = HeapRb::<i16>::new(capacity_samples);
    let (producer, consumer) = ring.split();

    (
        producer,
        PipelineOutput {
            consumer,
            format,
            chunk_size,
            samples_read: 0,
        },
    )
}
