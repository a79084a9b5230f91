use std::{fs, num::NonZeroUsize, path::Path};

use log::{debug, info};
use ndarray::{Array1, Array2, Array3};

use super::InMemorySource;
use crate::{Batch, MlErr, Result, RunPosition};

/// Samples per conditioning frame.
pub const HOP: usize = 64;

/// Conditioning channels per frame: RMS energy and zero crossing rate.
pub const FEATURES: usize = 2;

/// Computes the per frame conditioning features of a signal.
///
/// # Arguments
/// * `signal` - The raw samples.
/// * `hop` - Samples per frame, trailing samples that don't fill a frame are ignored.
///
/// # Returns
/// A `(FEATURES, signal.len() / hop)` array.
pub fn frame_features(signal: &[f32], hop: usize) -> Array2<f32> {
    let frames = signal.len() / hop;
    let mut out = Array2::zeros((FEATURES, frames));

    for (f, frame) in signal.chunks_exact(hop).enumerate() {
        let energy = frame.iter().map(|x| x * x).sum::<f32>() / hop as f32;
        let crossings = frame
            .windows(2)
            .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
            .count();

        out[[0, f]] = energy.sqrt();
        out[[1, f]] = crossings as f32 / hop as f32;
    }

    out
}

/// Loads every `.wav` file in `dir` and cuts it into fixed size windows.
///
/// Files are visited in name order and each file's index is its identity label. Samples that
/// don't fill a window, and windows that don't fill a batch, are dropped.
///
/// # Arguments
/// * `dir` - The directory to scan, not recursively.
/// * `window` - Samples per item, must be a multiple of `HOP`.
/// * `batch_size` - Items per batch.
/// * `epochs` - How many times the data is replayed.
///
/// # Returns
/// An in memory source or an error if a file can't be decoded or sample rates disagree.
pub fn load_wav_dir(
    dir: &Path,
    window: usize,
    batch_size: NonZeroUsize,
    epochs: usize,
) -> Result<InMemorySource> {
    if window == 0 || window % HOP != 0 {
        return Err(MlErr::SizeMismatch {
            what: "window (multiple of hop)",
            got: window,
            expected: window.div_ceil(HOP).max(1) * HOP,
        });
    }

    let mut files: Vec<_> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("wav")))
        .collect();
    files.sort();

    let mut sample_rate = None;
    let mut items = Vec::new();

    for (voice, path) in files.iter().enumerate() {
        let (rate, samples) = read_mono(path)?;

        match sample_rate {
            None => sample_rate = Some(rate),
            Some(expected) if expected != rate => {
                return Err(MlErr::Audio {
                    path: path.display().to_string(),
                    msg: format!("sample rate {rate} differs from {expected}"),
                });
            }
            _ => {}
        }

        for chunk in samples.chunks_exact(window) {
            items.push((chunk.to_vec(), voice as u32, path.clone()));
        }
        debug!(voice = voice; "loaded {}", path.display());
    }

    let frames = window / HOP;
    let size = batch_size.get();
    let batches = items
        .chunks_exact(size)
        .enumerate()
        .map(|(b, chunk)| {
            let mut wav = Array2::zeros((size, window));
            let mut mel = Array3::zeros((size, FEATURES, frames));
            let mut voice = Array1::zeros(size);

            for (i, (samples, label, _)) in chunk.iter().enumerate() {
                wav.row_mut(i).assign(&Array1::from_vec(samples.clone()));
                mel.index_axis_mut(ndarray::Axis(0), i)
                    .assign(&frame_features(samples, HOP));
                voice[i] = *label;
            }

            let paths = chunk.iter().map(|(_, _, p)| p.clone()).collect();
            Batch::new(
                wav,
                mel,
                voice,
                Array2::zeros((size, frames)),
                RunPosition::new(0, b),
                paths,
            )
        })
        .collect::<Result<Vec<_>>>()?;

    info!(
        "loaded {} file(s) from {} into {} batch(es)",
        files.len(),
        dir.display(),
        batches.len()
    );

    Ok(InMemorySource::new(
        batches,
        epochs,
        sample_rate.unwrap_or(16_000),
    ))
}

fn read_mono(path: &Path) -> Result<(u32, Vec<f32>)> {
    let with_path = |e: hound::Error| MlErr::Audio {
        path: path.display().to_string(),
        msg: e.to_string(),
    };

    let mut reader = hound::WavReader::open(path).map_err(with_path)?;
    let spec = reader.spec();

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let max = (1_i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| s as f32 / max))
                .collect::<std::result::Result<_, _>>()
                .map_err(with_path)?
        }
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<std::result::Result<_, _>>()
            .map_err(with_path)?,
    };

    let channels = spec.channels.max(1) as usize;
    let mono = samples
        .chunks(channels)
        .map(|c| c.iter().sum::<f32>() / c.len() as f32)
        .collect();

    Ok((spec.sample_rate, mono))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{BatchSource, ShardSpec};

    #[test]
    fn features_track_energy_and_crossings() {
        let mut signal = vec![0.5_f32; HOP];
        signal.extend((0..HOP).map(|i| if i % 2 == 0 { 1.0 } else { -1.0 }));

        let feats = frame_features(&signal, HOP);
        assert_eq!(feats.dim(), (FEATURES, 2));
        assert!((feats[[0, 0]] - 0.5).abs() < 1e-6);
        assert_eq!(feats[[1, 0]], 0.0);
        assert!((feats[[0, 1]] - 1.0).abs() < 1e-6);
        assert!(feats[[1, 1]] > 0.9);
    }

    #[test]
    fn loads_directory_into_batches() {
        let dir = tempfile::tempdir().unwrap();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 8_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };

        for name in ["a.wav", "b.wav"] {
            let mut writer = hound::WavWriter::create(dir.path().join(name), spec).unwrap();
            for i in 0..(HOP * 4) {
                writer.write_sample(((i % 50) as i16) * 100).unwrap();
            }
            writer.finalize().unwrap();
        }

        let src = load_wav_dir(dir.path(), HOP * 2, NonZeroUsize::new(2).unwrap(), 1).unwrap();
        assert_eq!(src.sample_rate(), 8_000);
        // 2 files x 2 windows = 4 items = 2 batches of 2.
        assert_eq!(src.batches_per_epoch(), 2);

        let first = src
            .shard(ShardSpec::single(), RunPosition::default())
            .next()
            .unwrap()
            .unwrap();
        assert_eq!(first.mel.dim(), (2, FEATURES, 2));
        assert_eq!(first.voice.to_vec(), vec![0, 0]);
    }
}
