//! Sample file I/O: WAV (mono) and raw little-endian f32 PCM.

use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use tracing::warn;

/// Mono samples plus the rate stored in the file, if the format has one.
#[derive(Debug)]
pub struct Samples {
    pub data: Vec<f32>,
    pub sample_rate: Option<u32>,
}

/// True for paths ending in `.wav`.
pub fn is_wav(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("wav"))
}

/// Read a WAV or raw f32 file, chosen by extension.
pub fn read_samples(path: &Path) -> Result<Samples> {
    if is_wav(path) {
        read_wav(path)
    } else {
        Ok(Samples {
            data: read_samples_f32(path)?,
            sample_rate: None,
        })
    }
}

/// Write a WAV (32-bit float) or raw f32 file, chosen by extension.
pub fn write_samples(samples: &[f32], path: &Path, sample_rate: u32) -> Result<()> {
    if is_wav(path) {
        write_wav(samples, path, sample_rate)
    } else {
        write_samples_f32(samples, path)
    }
}

fn clamp_unit(sample: f32) -> f32 {
    sample.clamp(-1.0, 1.0)
}

pub fn read_wav(path: &Path) -> Result<Samples> {
    let file = File::open(path).context("Failed to open input file")?;
    let mut reader = BufReader::new(file);
    let (header, data) = wav::read(&mut reader).context("Failed to parse WAV file")?;

    if header.channel_count != 1 {
        bail!(
            "{}: expected mono audio, found {} channels",
            path.display(),
            header.channel_count
        );
    }

    let data = match data {
        wav::BitDepth::Sixteen(pcm) => pcm
            .iter()
            .map(|&s| clamp_unit(s as f32 / u16::MAX as f32))
            .collect(),
        wav::BitDepth::ThirtyTwoFloat(pcm) => pcm.into_iter().map(clamp_unit).collect(),
        _ => bail!(
            "{}: unsupported WAV sample format ({} bits)",
            path.display(),
            header.bits_per_sample
        ),
    };

    Ok(Samples {
        data,
        sample_rate: Some(header.sampling_rate),
    })
}

pub fn write_wav(samples: &[f32], path: &Path, sample_rate: u32) -> Result<()> {
    let header = wav::Header::new(wav::WAV_FORMAT_IEEE_FLOAT, 1, sample_rate, 32);
    let file = File::create(path).context("Failed to create output file")?;
    let mut writer = BufWriter::new(file);
    wav::write(
        header,
        &wav::BitDepth::ThirtyTwoFloat(samples.to_vec()),
        &mut writer,
    )
    .context("Failed to write WAV file")?;
    writer.flush()?;
    Ok(())
}

pub fn read_samples_f32(path: &Path) -> Result<Vec<f32>> {
    let file = File::open(path).context("Failed to open input file")?;
    let metadata = file.metadata()?;
    if metadata.len() % 4 != 0 {
        warn!(
            "input length {} is not a multiple of 4, trailing bytes ignored",
            metadata.len()
        );
    }
    let num_samples = metadata.len() as usize / 4;

    let mut reader = BufReader::new(file);
    let mut samples = Vec::with_capacity(num_samples);
    for _ in 0..num_samples {
        samples.push(reader.read_f32::<LittleEndian>()?);
    }

    Ok(samples)
}

pub fn write_samples_f32(samples: &[f32], path: &Path) -> Result<()> {
    let file = File::create(path).context("Failed to create output file")?;
    let mut writer = BufWriter::new(file);

    for &sample in samples {
        writer.write_f32::<LittleEndian>(sample)?;
    }

    writer.flush()?;
    Ok(())
}
