use anyhow::{anyhow, Context, Result};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::time::Duration;

/// Decoded PCM16 clip. Samples are interleaved by channel.
#[derive(Debug, Clone)]
pub struct PcmAudio {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

struct WavInfo {
    audio_format: u16,
    channels: u16,
    sample_rate: u32,
    bits_per_sample: u16,
    data_offset: u64,
    data_size: u32,
}

fn scan_wav(bytes: &[u8]) -> Result<WavInfo> {
    let mut f = Cursor::new(bytes);

    let mut id = [0u8; 4];
    f.read_exact(&mut id).context("Unexpected EOF reading RIFF header")?;
    if &id != b"RIFF" {
        return Err(anyhow!("Not a RIFF file"));
    }

    // Skip File Size
    f.seek(SeekFrom::Current(4))?;

    f.read_exact(&mut id).context("Unexpected EOF reading WAVE id")?;
    if &id != b"WAVE" {
        return Err(anyhow!("Not a WAVE file"));
    }

    let mut fmt: Option<(u16, u16, u32, u16)> = None;
    let mut data: Option<(u64, u32)> = None;

    loop {
        let mut chunk_id = [0u8; 4];
        let n = f.read(&mut chunk_id)?;
        if n == 0 {
            break;
        }
        if n < 4 {
            return Err(anyhow!("Unexpected EOF reading chunk ID"));
        }

        let mut size_buf = [0u8; 4];
        f.read_exact(&mut size_buf)?;
        let chunk_size = u32::from_le_bytes(size_buf);

        // Chunks are padded to an even length.
        let padded_size = chunk_size as u64 + (chunk_size & 1) as u64;

        if &chunk_id == b"fmt " {
            let remaining = bytes.len() as u64 - f.position().min(bytes.len() as u64);
            if chunk_size as u64 > remaining {
                return Err(anyhow!("Truncated fmt chunk: {} bytes declared, {} left", chunk_size, remaining));
            }
            let mut buf = vec![0u8; chunk_size as usize];
            f.read_exact(&mut buf).context("Truncated fmt chunk")?;
            f.seek(SeekFrom::Current((padded_size - chunk_size as u64) as i64))?;
            if buf.len() < 16 {
                return Err(anyhow!("fmt chunk too short: {} bytes", buf.len()));
            }
            fmt = Some((
                u16::from_le_bytes([buf[0], buf[1]]),
                u16::from_le_bytes([buf[2], buf[3]]),
                u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
                u16::from_le_bytes([buf[14], buf[15]]),
            ));
        } else if &chunk_id == b"data" {
            data = Some((f.stream_position()?, chunk_size));
            break;
        } else {
            f.seek(SeekFrom::Current(padded_size as i64))?;
        }
    }

    let (audio_format, channels, sample_rate, bits_per_sample) =
        fmt.ok_or_else(|| anyhow!("Missing fmt chunk"))?;
    let (data_offset, data_size) = data.ok_or_else(|| anyhow!("Missing data chunk"))?;

    Ok(WavInfo {
        audio_format,
        channels,
        sample_rate,
        bits_per_sample,
        data_offset,
        data_size,
    })
}

/// Decodes an in-memory PCM16 WAV file.
pub fn decode_wav(bytes: &[u8]) -> Result<PcmAudio> {
    let info = scan_wav(bytes)?;
    if info.audio_format != 1 || info.bits_per_sample != 16 {
        return Err(anyhow!(
            "Unsupported WAV encoding: format {} with {} bits per sample",
            info.audio_format,
            info.bits_per_sample
        ));
    }
    if info.channels == 0 || info.sample_rate == 0 {
        return Err(anyhow!("WAV header has zero channels or sample rate"));
    }

    let start = info.data_offset as usize;
    // Tolerate a data size that overstates what was actually written.
    let end = (start + info.data_size as usize).min(bytes.len());
    let samples = bytes[start..end]
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect();

    Ok(PcmAudio {
        sample_rate: info.sample_rate,
        channels: info.channels,
        samples,
    })
}

impl PcmAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Fills `out` with per-bin levels (0-255) of the analysis window that
    /// starts at `position`. The window spans two frames per bin; anything
    /// past the end of the clip reads as silence.
    pub fn level_bins(&self, position: Duration, out: &mut [u8]) {
        out.fill(0);
        if out.is_empty() {
            return;
        }

        let channels = self.channels.max(1) as usize;
        let start = (position.as_secs_f64() * self.sample_rate as f64) as usize;
        let frames_per_bin = 2;

        for (i, level) in out.iter_mut().enumerate() {
            let first = start + i * frames_per_bin;
            if first >= self.frames() {
                break;
            }
            let last = (first + frames_per_bin).min(self.frames());

            let mut sum = 0u64;
            for frame in first..last {
                let base = frame * channels;
                for s in &self.samples[base..base + channels] {
                    sum += s.unsigned_abs() as u64;
                }
            }
            let count = ((last - first) * channels) as u64;
            let mean = sum / count;
            *level = (mean * 255 / 32768).min(255) as u8;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;

    pub(crate) fn create_dummy_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
        let size = (samples.len() * 2) as u32;
        let mut buf = Vec::new();
        buf.write_all(b"RIFF").unwrap();
        buf.write_all(&(36 + size).to_le_bytes()).unwrap();
        buf.write_all(b"WAVE").unwrap();

        buf.write_all(b"fmt ").unwrap();
        buf.write_all(&16u32.to_le_bytes()).unwrap();
        // PCM (1), Mono (1), SampleRate, ByteRate, BlockAlign (2), Bits (16)
        buf.write_all(&1u16.to_le_bytes()).unwrap();
        buf.write_all(&1u16.to_le_bytes()).unwrap();
        buf.write_all(&sample_rate.to_le_bytes()).unwrap();
        buf.write_all(&(sample_rate * 2).to_le_bytes()).unwrap();
        buf.write_all(&2u16.to_le_bytes()).unwrap();
        buf.write_all(&16u16.to_le_bytes()).unwrap();

        buf.write_all(b"data").unwrap();
        buf.write_all(&size.to_le_bytes()).unwrap();
        for s in samples {
            buf.write_all(&s.to_le_bytes()).unwrap();
        }
        buf
    }

    #[test]
    fn test_decode_wav() -> Result<()> {
        let wav = create_dummy_wav(&vec![1000i16; 8000], 8000);
        let audio = decode_wav(&wav)?;

        assert_eq!(audio.sample_rate, 8000);
        assert_eq!(audio.channels, 1);
        assert_eq!(audio.frames(), 8000);
        assert_eq!(audio.duration(), Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_decode_skips_unknown_chunks() -> Result<()> {
        let wav = create_dummy_wav(&[0, 0, 0, 0], 16000);
        // splice a LIST chunk between the header and fmt
        let mut spliced = wav[..12].to_vec();
        spliced.extend_from_slice(b"LIST");
        spliced.extend_from_slice(&4u32.to_le_bytes());
        spliced.extend_from_slice(b"abcd");
        spliced.extend_from_slice(&wav[12..]);

        let audio = decode_wav(&spliced)?;
        assert_eq!(audio.frames(), 4);
        Ok(())
    }

    #[test]
    fn test_decode_skips_odd_sized_chunk_padding() -> Result<()> {
        let wav = create_dummy_wav(&[100, 200, 300], 16000);
        // a 3-byte LIST chunk is followed by one pad byte
        let mut spliced = wav[..12].to_vec();
        spliced.extend_from_slice(b"LIST");
        spliced.extend_from_slice(&3u32.to_le_bytes());
        spliced.extend_from_slice(b"abc\0");
        spliced.extend_from_slice(&wav[12..]);

        let audio = decode_wav(&spliced)?;
        assert_eq!(audio.samples, vec![100, 200, 300]);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_oversized_fmt_chunk() {
        let wav = create_dummy_wav(&[0, 0], 16000);
        let mut forged = wav.clone();
        // fmt chunk size field sits right after "fmt " at offset 12
        forged[16..20].copy_from_slice(&u32::MAX.to_le_bytes());

        let err = decode_wav(&forged).unwrap_err();
        assert!(err.to_string().contains("Truncated fmt chunk"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_wav(b"not a wav file at all").is_err());
        assert!(decode_wav(b"RIFF").is_err());
    }

    #[test]
    fn test_level_bins_track_loudness() -> Result<()> {
        let mut samples = vec![0i16; 100];
        samples.extend(vec![i16::MAX; 100]);
        let audio = decode_wav(&create_dummy_wav(&samples, 100))?;

        let mut bins = [0u8; 8];
        audio.level_bins(Duration::ZERO, &mut bins);
        assert!(bins.iter().all(|&b| b == 0));

        audio.level_bins(Duration::from_secs(1), &mut bins);
        assert!(bins.iter().all(|&b| b >= 254));

        audio.level_bins(Duration::from_secs(5), &mut bins);
        assert!(bins.iter().all(|&b| b == 0));
        Ok(())
    }
}
