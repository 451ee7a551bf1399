//! WAV container encoding for synthesized audio.

use std::io::Cursor;

use parley_core::types::RawAudio;

/// Convert float samples in [-1.0, 1.0] to 16-bit PCM, clamping out-of-range values.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_finite() { s.clamp(-1.0, 1.0) } else { 0.0 };
            (s * i16::MAX as f32).round() as i16
        })
        .collect()
}

/// Convert 16-bit PCM to float samples.
pub fn pcm16_to_float(pcm: &[i16]) -> Vec<f32> {
    pcm.iter().map(|&s| s as f32 / i16::MAX as f32).collect()
}

/// Encode a synthesized waveform as an in-memory mono 16-bit WAV file.
pub fn encode_wav(audio: &RawAudio) -> Result<Vec<u8>, hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: audio.sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut bytes = Vec::with_capacity(44 + audio.samples.len() * 2);
    let mut writer = hound::WavWriter::new(Cursor::new(&mut bytes), spec)?;
    for sample in float_to_pcm16(&audio.samples) {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_conversion_clamps() {
        let pcm = float_to_pcm16(&[0.0, 1.0, -1.0, 2.5, f32::NAN]);
        assert_eq!(pcm, vec![0, i16::MAX, -i16::MAX, i16::MAX, 0]);
    }

    #[test]
    fn test_encode_wav_reads_back() {
        let audio = RawAudio {
            samples: vec![0.5, -0.25, 0.0],
            sample_rate: 16000,
        };
        let wav = encode_wav(&audio).unwrap();
        assert_eq!(&wav[0..4], b"RIFF");

        let mut reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        let spec = reader.spec();
        assert_eq!(spec.channels, 1);
        assert_eq!(spec.sample_rate, 16000);
        assert_eq!(spec.bits_per_sample, 16);
        let pcm: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(pcm, float_to_pcm16(&audio.samples));
    }

    #[test]
    fn test_encode_empty_waveform_is_header_only() {
        let audio = RawAudio {
            samples: Vec::new(),
            sample_rate: 24000,
        };
        let wav = encode_wav(&audio).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.duration(), 0);
        assert_eq!(reader.spec().sample_rate, 24000);
    }

    #[test]
    fn test_pcm16_to_float_range() {
        let samples = pcm16_to_float(&[0, i16::MAX]);
        assert_eq!(samples, vec![0.0, 1.0]);
    }
}
