//! Synthesized-file framing: decode an mp3/wav file and slice it into
//! wire frames of the negotiated downlink format.
//!
//! The frame sender needs both the frames and the total playout
//! duration (pacing is wall-clock driven), so every conversion returns
//! `(frames, duration_secs)`.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use vx_domain::audio::{AudioFormat, AudioParams};

use crate::codec::OpusFrameEncoder;
use crate::AudioError;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File decode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode an audio file into interleaved 16-bit PCM.
fn decode_file(path: &Path) -> Result<(Vec<i16>, u32, u8), AudioError> {
    let file = File::open(path)?;
    let stream = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(format!("probe failed: {e}")))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| AudioError::Decode("no audio track".into()))?
        .clone();
    let track_id = track.id;
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("no sample rate".into()))?;
    let channels = track
        .codec_params
        .channels
        .map(|c| c.count() as u8)
        .unwrap_or(1);

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(format!("no decoder: {e}")))?;

    let mut samples: Vec<i16> = Vec::new();
    let mut sample_buf: Option<SampleBuffer<i16>> = None;

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymError::IoError(e))
                if e.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                break
            }
            Err(SymError::ResetRequired) => break,
            Err(e) => return Err(AudioError::Decode(format!("read packet: {e}"))),
        };
        if packet.track_id() != track_id {
            continue;
        }
        match decoder.decode(&packet) {
            Ok(audio_buf) => {
                if sample_buf.is_none() {
                    let spec = *audio_buf.spec();
                    let capacity = audio_buf.capacity() as u64;
                    sample_buf = Some(SampleBuffer::<i16>::new(capacity, spec));
                }
                if let Some(buf) = &mut sample_buf {
                    buf.copy_interleaved_ref(audio_buf);
                    samples.extend_from_slice(buf.samples());
                }
            }
            // Recoverable per-packet corruption; keep going.
            Err(SymError::DecodeError(_)) => continue,
            Err(e) => return Err(AudioError::Decode(format!("decode: {e}"))),
        }
    }

    Ok((samples, sample_rate, channels))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// PCM shaping
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Average interleaved channels down to mono.
fn downmix(samples: &[i16], channels: u8) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / ch as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resample of mono PCM. Adequate for speech
/// synthesis output feeding a lossy codec.
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).floor() as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = pos as usize;
        let frac = pos - idx as f64;
        let a = samples[idx] as f64;
        let b = samples[(idx + 1).min(samples.len() - 1)] as f64;
        out.push((a + (b - a) * frac) as i16);
    }
    out
}

/// Split mono PCM into equal frames, zero-padding the final frame.
fn split_frames(samples: &[i16], samples_per_frame: usize) -> Vec<Vec<i16>> {
    let mut frames = Vec::with_capacity(samples.len() / samples_per_frame + 1);
    for chunk in samples.chunks(samples_per_frame) {
        let mut frame = chunk.to_vec();
        frame.resize(samples_per_frame, 0);
        frames.push(frame);
    }
    frames
}

fn pcm_to_le_bytes(frame: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(frame.len() * 2);
    for s in frame {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    bytes
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public conversions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Decode `path` and return downlink frames in `params.format` plus
/// the total playout duration in seconds.
pub fn audio_to_frames(
    path: &Path,
    params: &AudioParams,
) -> Result<(Vec<Vec<u8>>, f64), AudioError> {
    match params.format {
        AudioFormat::Pcm => audio_to_pcm_frames(path, params),
        AudioFormat::Opus => audio_to_opus_frames(path, params),
    }
}

/// Decode `path` into raw 16-bit little-endian PCM frames.
pub fn audio_to_pcm_frames(
    path: &Path,
    params: &AudioParams,
) -> Result<(Vec<Vec<u8>>, f64), AudioError> {
    let mono = load_mono(path, params.sample_rate)?;
    let duration = mono.len() as f64 / params.sample_rate as f64;
    let frames = split_frames(&mono, params.samples_per_frame())
        .iter()
        .map(|f| pcm_to_le_bytes(f))
        .collect();
    Ok((frames, duration))
}

/// Decode `path` and encode each frame as Opus.
pub fn audio_to_opus_frames(
    path: &Path,
    params: &AudioParams,
) -> Result<(Vec<Vec<u8>>, f64), AudioError> {
    let mono = load_mono(path, params.sample_rate)?;
    let duration = mono.len() as f64 / params.sample_rate as f64;

    let mut encoder = OpusFrameEncoder::new(params.sample_rate, 1)?;
    let mut frames = Vec::new();
    for frame in split_frames(&mono, params.samples_per_frame()) {
        frames.push(encoder.encode(&frame)?);
    }
    Ok((frames, duration))
}

fn load_mono(path: &Path, target_rate: u32) -> Result<Vec<i16>, AudioError> {
    let (samples, rate, channels) = decode_file(path)?;
    let mono = downmix(&samples, channels);
    Ok(resample(&mono, rate, target_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(rate: u32, secs: f64) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer =
            hound::WavWriter::create(dir.path().join("tone.wav"), spec).unwrap();
        let total = (rate as f64 * secs) as usize;
        for i in 0..total {
            let s = ((i as f32 * 0.03).sin() * 9000.0) as i16;
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
        dir
    }

    fn server_params() -> AudioParams {
        AudioParams::server_default()
    }

    #[test]
    fn pcm_frames_cover_duration() {
        let dir = write_wav(24_000, 1.2);
        let (frames, duration) =
            audio_to_pcm_frames(&dir.path().join("tone.wav"), &server_params()).unwrap();
        assert!((duration - 1.2).abs() < 0.01);
        // 1.2 s at 60 ms frames = 20 frames.
        assert_eq!(frames.len(), 20);
        // 60 ms at 24 kHz mono, 2 bytes per sample.
        assert_eq!(frames[0].len(), 1440 * 2);
    }

    #[test]
    fn last_pcm_frame_is_zero_padded() {
        let dir = write_wav(24_000, 0.05); // under one frame
        let (frames, _) =
            audio_to_pcm_frames(&dir.path().join("tone.wav"), &server_params()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 1440 * 2);
        // The pad region is silence.
        let tail = &frames[0][frames[0].len() - 2..];
        assert_eq!(tail, &[0, 0]);
    }

    #[test]
    fn opus_frames_are_compressed() {
        let dir = write_wav(24_000, 0.6);
        let (frames, duration) =
            audio_to_opus_frames(&dir.path().join("tone.wav"), &server_params()).unwrap();
        assert_eq!(frames.len(), 10);
        assert!((duration - 0.6).abs() < 0.01);
        for frame in &frames {
            assert!(!frame.is_empty());
            assert!(frame.len() < 1440 * 2);
        }
    }

    #[test]
    fn resamples_non_native_rates() {
        let dir = write_wav(16_000, 1.0);
        let (frames, duration) =
            audio_to_pcm_frames(&dir.path().join("tone.wav"), &server_params()).unwrap();
        // Duration is preserved across the 16 k → 24 k resample,
        // within one frame of rounding.
        assert!((duration - 1.0).abs() < 0.06);
        assert!((16..=17).contains(&frames.len()));
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = audio_to_pcm_frames(Path::new("/nonexistent/x.wav"), &server_params());
        assert!(err.is_err());
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [100i16, 200, -100, -200];
        assert_eq!(downmix(&stereo, 2), vec![150, -150]);
    }

    #[test]
    fn resample_identity_when_rates_match() {
        let pcm = [1i16, 2, 3];
        assert_eq!(resample(&pcm, 24_000, 24_000), vec![1, 2, 3]);
    }
}
