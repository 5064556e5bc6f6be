use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use std::io::Cursor;
use tripot_core::VoiceError;

// The conversation server expects 16 kHz, mono, 16-bit PCM WAV.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;
pub const CAPTURE_CHANNELS: u16 = 1;
pub const CAPTURE_BITS_PER_SAMPLE: u16 = 16;

const RESAMPLER_CHUNK_SIZE: usize = 1024;

/// A mono resampler consuming `chunk_size` frames per call.
pub fn create_resampler(
    from_rate: f64,
    to_rate: f64,
    chunk_size: usize,
) -> Result<FastFixedIn<f32>, VoiceError> {
    // Fixed ratio, cubic interpolation, one channel.
    FastFixedIn::<f32>::new(to_rate / from_rate, 1.0, PolynomialDegree::Cubic, chunk_size, 1)
    .map_err(|e| VoiceError::Device(format!("Failed to create resampler: {}", e)))
}

/// Averages interleaved frames down to a single channel.
pub fn downmix_to_mono(interleaved: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels as usize)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Resamples a mono signal from `from_rate` to `to_rate`.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, VoiceError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }
    let mut resampler = create_resampler(from_rate as f64, to_rate as f64, RESAMPLER_CHUNK_SIZE)?;
    let resample_err = |e: rubato::ResampleError| VoiceError::Device(format!("Resampling failed: {}", e));

    let mut resampled =
        Vec::with_capacity(samples.len() * to_rate as usize / from_rate as usize + RESAMPLER_CHUNK_SIZE);
    let mut remaining = samples;
    while remaining.len() >= resampler.input_frames_next() {
        let (chunk, rest) = remaining.split_at(resampler.input_frames_next());
        let out = resampler.process(&[chunk], None).map_err(resample_err)?;
        resampled.extend_from_slice(&out[0]);
        remaining = rest;
    }
    if !remaining.is_empty() {
        let out = resampler
            .process_partial(Some(&[remaining][..]), None)
            .map_err(resample_err)?;
        resampled.extend_from_slice(&out[0]);
    }
    Ok(resampled)
}

/// Scales `[-1.0, 1.0]` samples to PCM16, saturating out-of-range input.
pub fn convert_f32_to_i16(samples: &[f32]) -> Vec<i16> {
    let scale = i16::MAX as f32;
    samples
        .iter()
        .map(|&s| (s * scale).clamp(i16::MIN as f32, scale) as i16)
        .collect()
}

/// Wraps PCM16 samples in a WAV container.
pub fn encode_wav(samples: &[i16], sample_rate: u32, channels: u16) -> Result<Vec<u8>, VoiceError> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: CAPTURE_BITS_PER_SAMPLE,
        sample_format: hound::SampleFormat::Int,
    };
    let wav_err = |e: hound::Error| VoiceError::Device(format!("Failed to encode WAV: {}", e));

    let mut wav_cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut wav_cursor, spec).map_err(wav_err)?;
        for sample in samples {
            writer.write_sample(*sample).map_err(wav_err)?;
        }
        writer.finalize().map_err(wav_err)?;
    }
    Ok(wav_cursor.into_inner())
}

/// Turns raw device samples into the WAV the conversation server expects.
pub fn prepare_capture(
    interleaved: &[f32],
    device_rate: u32,
    device_channels: u16,
) -> Result<Vec<u8>, VoiceError> {
    let mono = downmix_to_mono(interleaved, device_channels);
    let resampled = resample(&mono, device_rate, CAPTURE_SAMPLE_RATE)?;
    encode_wav(
        &convert_f32_to_i16(&resampled),
        CAPTURE_SAMPLE_RATE,
        CAPTURE_CHANNELS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_create_resampler_for_common_rates() {
        assert!(create_resampler(48000.0, 16000.0, 1024).is_ok());
        assert!(create_resampler(16000.0, 16000.0, 1024).is_ok());
        assert!(create_resampler(44100.0, 16000.0, 512).is_ok());
    }

    #[test]
    fn test_downmix_to_mono() {
        let stereo = vec![0.5f32, -0.5, 1.0, 0.0, 0.2, 0.4];
        let mono = downmix_to_mono(&stereo, 2);
        assert_eq!(mono.len(), 3);
        assert_abs_diff_eq!(mono[0], 0.0, epsilon = 0.0001);
        assert_abs_diff_eq!(mono[1], 0.5, epsilon = 0.0001);
        assert_abs_diff_eq!(mono[2], 0.3, epsilon = 0.0001);

        // A trailing partial frame is dropped.
        assert_eq!(downmix_to_mono(&[0.1, 0.2, 0.3], 2).len(), 1);
        assert_eq!(downmix_to_mono(&[0.1, 0.2, 0.3], 1), vec![0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_resample_length_follows_ratio() {
        let one_second_48k = vec![0.0f32; 48_000];
        let resampled = resample(&one_second_48k, 48_000, 16_000).unwrap();
        let expected = 16_000.0;
        assert!(
            (resampled.len() as f64 - expected).abs() < expected * 0.05,
            "got {} samples",
            resampled.len()
        );
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1f32, -0.2, 0.3];
        assert_eq!(resample(&samples, 16_000, 16_000).unwrap(), samples);
        assert!(resample(&[], 48_000, 16_000).unwrap().is_empty());
    }

    #[test]
    fn test_convert_f32_to_i16_scales_and_saturates() {
        let pcm = convert_f32_to_i16(&[1.0, -1.0, 0.0, 0.5]);
        // Full negative scale stops one short of i16::MIN.
        assert_eq!(pcm, vec![i16::MAX, -32767, 0, 16383]);

        let clamped = convert_f32_to_i16(&[2.0f32, -2.0f32]);
        assert_eq!(clamped, vec![i16::MAX, i16::MIN]);
    }

    #[test]
    fn test_encode_wav_header() {
        let wav = encode_wav(&[0, 1000, -1000], CAPTURE_SAMPLE_RATE, CAPTURE_CHANNELS).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.sample_rate, 16_000);
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.bits_per_sample, 16);
        assert_eq!(reader.len(), 3);
    }

    #[test]
    fn test_prepare_capture_from_stereo_48k() {
        let frames = 4_800; // 100 ms
        let interleaved: Vec<f32> = (0..frames)
            .flat_map(|i| {
                let v = (i as f32 / frames as f32) - 0.5;
                [v, v]
            })
            .collect();

        let wav = prepare_capture(&interleaved, 48_000, 2).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, CAPTURE_SAMPLE_RATE);
        assert_eq!(reader.spec().channels, CAPTURE_CHANNELS);
        let len = reader.len() as i64;
        assert!((len - 1_600).abs() < 250, "got {} samples", len);
    }
}
