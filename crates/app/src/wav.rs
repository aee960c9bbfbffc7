use anyhow::{bail, Context, Result};
use bargein_core::constants::SAMPLE_RATE;
use bargein_core::echo_cancel::f32_to_i16;
use hound::{SampleFormat, WavReader, WavSpec, WavWriter};
use std::path::Path;

/// Reads a 48kHz WAV file as mono i16. Multi-channel files keep the first
/// channel; float and other integer widths are rescaled to 16 bits.
pub fn read_mono(path: &Path) -> Result<Vec<i16>> {
    let mut reader =
        WavReader::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE {
        bail!(
            "{}: sample rate {} Hz, expected {} Hz",
            path.display(),
            spec.sample_rate,
            SAMPLE_RATE
        );
    }
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<i16> = match (spec.sample_format, spec.bits_per_sample) {
        (SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .step_by(channels)
            .collect::<Result<_, _>>()?,
        (SampleFormat::Int, bits) if bits <= 32 => reader
            .samples::<i32>()
            .step_by(channels)
            .map(|s| s.map(|v| to_i16(v, bits)))
            .collect::<Result<_, _>>()?,
        (SampleFormat::Float, _) => reader
            .samples::<f32>()
            .step_by(channels)
            .map(|s| s.map(f32_to_i16))
            .collect::<Result<_, _>>()?,
        (_, bits) => bail!("{}: unsupported {}-bit samples", path.display(), bits),
    };
    Ok(samples)
}

fn to_i16(sample: i32, bits: u16) -> i16 {
    if bits < 16 {
        (sample << (16 - bits)) as i16
    } else {
        (sample >> (bits - 16)) as i16
    }
}

pub fn write_mono(path: &Path, samples: &[i16]) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };
    let mut writer = WavWriter::create(path, spec)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for s in samples {
        writer.write_sample(*s)?;
    }
    writer.finalize()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mono_file_is_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        let samples: Vec<i16> = (0..1000).map(|i| (i * 7) as i16).collect();
        write_mono(&path, &samples).unwrap();
        assert_eq!(read_mono(&path).unwrap(), samples);
    }

    #[test]
    fn test_stereo_keeps_first_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let spec = WavSpec {
            channels: 2,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for i in 0..100i16 {
            writer.write_sample(i).unwrap();
            writer.write_sample(-1000i16).unwrap();
        }
        writer.finalize().unwrap();

        let samples = read_mono(&path).unwrap();
        assert_eq!(samples, (0..100i16).collect::<Vec<_>>());
    }

    #[test]
    fn test_narrow_and_wide_ints_scale_to_16_bit() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("8bit.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: SAMPLE_RATE,
            bits_per_sample: 8,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for v in [-128i8, -1, 0, 64, 127] {
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();
        assert_eq!(read_mono(&path).unwrap(), vec![i16::MIN, -256, 0, 16384, 32512]);

        let path = dir.path().join("24bit.wav");
        let spec = WavSpec {
            bits_per_sample: 24,
            ..spec
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        for v in [-8_388_608i32, 256, 8_388_607] {
            writer.write_sample(v).unwrap();
        }
        writer.finalize().unwrap();
        assert_eq!(read_mono(&path).unwrap(), vec![i16::MIN, 1, i16::MAX]);
    }

    #[test]
    fn test_wrong_sample_rate_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("16k.wav");
        let spec = WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let mut writer = WavWriter::create(&path, spec).unwrap();
        writer.write_sample(0i16).unwrap();
        writer.finalize().unwrap();

        assert!(read_mono(&path).is_err());
    }
}
