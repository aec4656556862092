//! Audio normalization for mixing.
//!
//! Contributions arrive at whatever rate and channel count their source
//! produces. Before summation the mixer normalizes every contribution to the
//! mix format: channel conversion first, then linear-interpolation
//! resampling. Linear interpolation is sufficient for conference speech; a
//! dedicated resampling crate can replace it behind this function.

use super::AudioFormat;

/// Normalizes samples from one audio format to another.
///
/// Returns the input unchanged when the formats already agree. Only mono and
/// stereo are supported; other channel counts are downmixed to mono first.
pub fn normalize(samples: &[i16], from: AudioFormat, to: AudioFormat) -> Vec<i16> {
    if from == to {
        return samples.to_vec();
    }

    let channel_converted = match (from.channels, to.channels) {
        (a, b) if a == b => samples.to_vec(),
        (2, 1) => stereo_to_mono(samples),
        (1, 2) => mono_to_stereo(samples),
        (n, _) if n > 2 => {
            let mono = downmix_to_mono(samples, n);
            if to.channels == 2 {
                mono_to_stereo(&mono)
            } else {
                mono
            }
        }
        _ => samples.to_vec(),
    };

    if from.sample_rate == to.sample_rate || from.sample_rate == 0 || to.sample_rate == 0 {
        return channel_converted;
    }

    if to.channels == 2 {
        resample_stereo(&channel_converted, from.sample_rate, to.sample_rate)
    } else {
        resample(&channel_converted, from.sample_rate, to.sample_rate)
    }
}

/// Converts stereo samples to mono by averaging channel pairs.
fn stereo_to_mono(stereo: &[i16]) -> Vec<i16> {
    stereo
        .chunks_exact(2)
        .map(|pair| ((i32::from(pair[0]) + i32::from(pair[1])) / 2) as i16)
        .collect()
}

/// Converts mono samples to stereo by duplicating each sample.
fn mono_to_stereo(mono: &[i16]) -> Vec<i16> {
    mono.iter().flat_map(|&s| [s, s]).collect()
}

/// Downmixes an arbitrary channel count to mono by averaging each frame.
fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    let channels = channels as usize;
    samples
        .chunks_exact(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| i32::from(s)).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Resamples mono audio between rates using linear interpolation.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let output_len = (samples.len() as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_len);

    for i in 0..output_len {
        let src_pos = i as f64 / ratio;
        let src_idx = src_pos.floor() as usize;
        let frac = src_pos - src_idx as f64;

        let sample = if src_idx + 1 < samples.len() {
            let s1 = f64::from(samples[src_idx]);
            let s2 = f64::from(samples[src_idx + 1]);
            (s1 + (s2 - s1) * frac) as i16
        } else if src_idx < samples.len() {
            samples[src_idx]
        } else {
            *samples.last().unwrap_or(&0)
        };

        output.push(sample);
    }

    output
}

/// Resamples interleaved stereo audio, processing each channel separately.
fn resample_stereo(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let mut left = Vec::with_capacity(samples.len() / 2);
    let mut right = Vec::with_capacity(samples.len() / 2);
    for frame in samples.chunks_exact(2) {
        left.push(frame[0]);
        right.push(frame[1]);
    }

    let left = resample(&left, from_rate, to_rate);
    let right = resample(&right, from_rate, to_rate);

    let mut output = Vec::with_capacity(left.len() * 2);
    for (l, r) in left.into_iter().zip(right) {
        output.push(l);
        output.push(r);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_identity() {
        let fmt = AudioFormat::new(16000, 1);
        let samples = vec![100i16, -200, 300];
        assert_eq!(normalize(&samples, fmt, fmt), samples);
    }

    #[test]
    fn test_normalize_stereo_to_mono() {
        let out = normalize(
            &[100i16, 200, 300, 400],
            AudioFormat::new(16000, 2),
            AudioFormat::new(16000, 1),
        );
        assert_eq!(out, vec![150, 350]);
    }

    #[test]
    fn test_normalize_mono_to_stereo() {
        let out = normalize(
            &[100i16, 200],
            AudioFormat::new(16000, 1),
            AudioFormat::new(16000, 2),
        );
        assert_eq!(out, vec![100, 100, 200, 200]);
    }

    #[test]
    fn test_normalize_downsample() {
        // 48kHz -> 16kHz is 3:1
        let samples: Vec<i16> = (0..480).map(|i| (i * 10) as i16).collect();
        let out = normalize(
            &samples,
            AudioFormat::new(48000, 1),
            AudioFormat::new(16000, 1),
        );
        assert_eq!(out.len(), 160);
    }

    #[test]
    fn test_normalize_rate_and_channels() {
        // 48kHz stereo -> 16kHz mono: both conversions apply
        let samples = vec![0i16; 960]; // 10ms at 48kHz stereo
        let out = normalize(
            &samples,
            AudioFormat::new(48000, 2),
            AudioFormat::new(16000, 1),
        );
        assert_eq!(out.len(), 160); // 10ms at 16kHz mono
    }

    #[test]
    fn test_stereo_cancellation() {
        let out = stereo_to_mono(&[1000, -1000]);
        assert_eq!(out, vec![0]);
    }

    #[test]
    fn test_resample_interpolates() {
        let out = resample(&[0i16, 1000], 1, 2);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], 0);
        assert!(out[1] > 0 && out[1] < 1000);
    }

    #[test]
    fn test_resample_single_sample() {
        let out = resample(&[500i16], 1, 10);
        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|&s| s == 500));
    }

    #[test]
    fn test_downmix_quad() {
        let out = downmix_to_mono(&[100, 200, 300, 400], 4);
        assert_eq!(out, vec![250]);
    }
}
