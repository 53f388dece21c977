//! Raw sensor series loading
//!
//! Accepts a `.npz` archive holding a `data` array of shape
//! (timestep, sensor, feature), a single `.npy` of the same shape, or a
//! directory with either `pems04.npz` or one `(timestep, sensor)` file per
//! feature.

use ndarray::{s, Array2, Array3, ArrayD, ArrayView2, Axis, Ix2, Ix3};
use ndarray_npy::{read_npy, NpzReader, ReadNpyError};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::ops::Range;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ForecastError, Result};
use crate::models::{Feature, NUM_FEATURES};

/// Sampling interval of the reference dataset
pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;

const DEFAULT_ARCHIVE: &str = "pems04.npz";

/// A (timestep, sensor, feature) array with non-empty axes and three features
#[derive(Debug, Clone, PartialEq)]
pub struct RawSeries {
    data: Array3<f32>,
    interval_minutes: u32,
}

/// Shape summary of a loaded series
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesInfo {
    pub num_timesteps: usize,
    pub num_sensors: usize,
    pub features: Vec<String>,
    pub interval_minutes: u32,
}

impl RawSeries {
    /// Wrap an in-memory array, validating its shape
    pub fn from_array(data: Array3<f32>) -> Result<Self> {
        let (t, s, f) = data.dim();
        if t == 0 || s == 0 {
            return Err(ForecastError::config(format!(
                "raw series must have non-empty timestep and sensor axes, got ({t}, {s}, {f})"
            )));
        }
        if f != NUM_FEATURES {
            return Err(ForecastError::config(format!(
                "raw series must have {NUM_FEATURES} features (flow, occupancy, speed), got {f}"
            )));
        }
        Ok(Self {
            data,
            interval_minutes: DEFAULT_INTERVAL_MINUTES,
        })
    }

    pub fn with_interval(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes;
        self
    }

    /// Load from an archive, an array file or a dataset directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ForecastError::not_found("raw data", path));
        }

        let data = if path.is_dir() {
            load_directory(path)?
        } else {
            match path.extension().and_then(|e| e.to_str()) {
                Some("npz") => load_npz(path)?,
                Some("npy") => to_rank3(read_array(path)?, path)?,
                _ => {
                    return Err(ForecastError::config(format!(
                        "unsupported raw data file {}, expected .npz or .npy",
                        path.display()
                    )))
                }
            }
        };

        let series = Self::from_array(data)?;
        info!(
            path = %path.display(),
            num_timesteps = series.num_timesteps(),
            num_sensors = series.num_sensors(),
            "Loaded raw series"
        );
        Ok(series)
    }

    pub fn data(&self) -> &Array3<f32> {
        &self.data
    }

    pub fn into_array(self) -> Array3<f32> {
        self.data
    }

    pub fn num_timesteps(&self) -> usize {
        self.data.dim().0
    }

    pub fn num_sensors(&self) -> usize {
        self.data.dim().1
    }

    pub fn interval_minutes(&self) -> u32 {
        self.interval_minutes
    }

    /// (timestep, sensor) view of one feature
    pub fn feature(&self, feature: Feature) -> ArrayView2<'_, f32> {
        self.data.index_axis(Axis(2), feature.index())
    }

    /// (timestep, feature) view of one sensor
    pub fn sensor(&self, index: usize) -> Result<ArrayView2<'_, f32>> {
        self.check_sensor(index)?;
        Ok(self.data.index_axis(Axis(1), index))
    }

    /// Average every feature across sensors, giving a (timestep, feature) series
    pub fn mean_over_sensors(&self) -> Array2<f32> {
        // Non-empty sensor axis is guaranteed by construction
        self.data
            .mean_axis(Axis(1))
            .unwrap_or_else(|| Array2::zeros((self.num_timesteps(), NUM_FEATURES)))
    }

    /// Select a set of sensors (all when `None`) over a timestep range
    pub fn subset(&self, sensors: Option<&[usize]>, time: Range<usize>) -> Result<Self> {
        if time.start >= time.end || time.end > self.num_timesteps() {
            return Err(ForecastError::config(format!(
                "time range {}..{} is invalid for a series of {} timesteps",
                time.start,
                time.end,
                self.num_timesteps()
            )));
        }
        let window = self.data.slice(s![time, .., ..]);
        let data = match sensors {
            Some(indices) => {
                for &idx in indices {
                    self.check_sensor(idx)?;
                }
                window.select(Axis(1), indices)
            }
            None => window.to_owned(),
        };
        Ok(Self::from_array(data)?.with_interval(self.interval_minutes))
    }

    pub fn info(&self) -> SeriesInfo {
        SeriesInfo {
            num_timesteps: self.num_timesteps(),
            num_sensors: self.num_sensors(),
            features: Feature::ALL.iter().map(|f| f.name().to_string()).collect(),
            interval_minutes: self.interval_minutes,
        }
    }

    pub(crate) fn check_sensor(&self, index: usize) -> Result<()> {
        if index >= self.num_sensors() {
            return Err(ForecastError::SensorOutOfRange {
                index,
                num_sensors: self.num_sensors(),
            });
        }
        Ok(())
    }
}

/// Chronological split ratios
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitRatios {
    pub train: f64,
    pub val: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.1,
        }
    }
}

impl SplitRatios {
    pub fn test(&self) -> f64 {
        1.0 - self.train - self.val
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.train)
            || !(0.0..=1.0).contains(&self.val)
            || self.train + self.val > 1.0 + 1e-9
        {
            return Err(ForecastError::config(format!(
                "split ratios train={} val={} must be in [0, 1] and sum to at most 1",
                self.train, self.val
            )));
        }
        Ok(())
    }
}

/// Split a (timestep, ...) array along time into train, validation and test parts
pub fn split_chronological<A, D>(
    data: &ndarray::Array<A, D>,
    ratios: SplitRatios,
) -> Result<(ndarray::Array<A, D>, ndarray::Array<A, D>, ndarray::Array<A, D>)>
where
    A: Clone,
    D: ndarray::Dimension,
{
    ratios.validate()?;
    let n = data.len_of(Axis(0));
    let train_end = (n as f64 * ratios.train) as usize;
    let val_end = (train_end + (n as f64 * ratios.val) as usize).min(n);

    let train = data.slice_axis(Axis(0), (0..train_end).into()).to_owned();
    let val = data.slice_axis(Axis(0), (train_end..val_end).into()).to_owned();
    let test = data.slice_axis(Axis(0), (val_end..n).into()).to_owned();
    debug!(
        train = train_end,
        val = val_end - train_end,
        test = n - val_end,
        "Split series chronologically"
    );
    Ok((train, val, test))
}

fn read_array(path: &Path) -> Result<ArrayD<f32>> {
    match read_npy::<_, ArrayD<f64>>(path) {
        Ok(arr) => Ok(arr.mapv(|v| v as f32)),
        Err(ReadNpyError::WrongDescriptor(_)) => Ok(read_npy::<_, ArrayD<f32>>(path)?),
        Err(e) => Err(e.into()),
    }
}

fn to_rank3(arr: ArrayD<f32>, path: &Path) -> Result<Array3<f32>> {
    let shape = arr.shape().to_vec();
    arr.into_dimensionality::<Ix3>().map_err(|_| {
        ForecastError::config(format!(
            "{} has shape {:?}, expected (timestep, sensor, feature)",
            path.display(),
            shape
        ))
    })
}

fn load_npz(path: &Path) -> Result<Array3<f32>> {
    let mut npz = NpzReader::new(File::open(path)?)?;
    let name = npz
        .names()?
        .into_iter()
        .find(|n| n == "data" || n == "data.npy")
        .ok_or_else(|| {
            ForecastError::config(format!("{} has no 'data' array", path.display()))
        })?;

    let arr: ArrayD<f32> = match npz.by_name::<ndarray::OwnedRepr<f64>, ndarray::IxDyn>(&name) {
        Ok(arr) => arr.mapv(|v| v as f32),
        Err(_) => npz.by_name::<ndarray::OwnedRepr<f32>, ndarray::IxDyn>(&name)?,
    };
    to_rank3(arr, path)
}

fn load_directory(dir: &Path) -> Result<Array3<f32>> {
    let archive = dir.join(DEFAULT_ARCHIVE);
    if archive.exists() {
        return load_npz(&archive);
    }

    let mut columns = Vec::with_capacity(NUM_FEATURES);
    for feature in Feature::ALL {
        let file = find_feature_file(dir, feature)?;
        let arr = read_array(&file)?;
        let shape = arr.shape().to_vec();
        let column = arr.into_dimensionality::<Ix2>().map_err(|_| {
            ForecastError::config(format!(
                "{} has shape {:?}, expected (timestep, sensor)",
                file.display(),
                shape
            ))
        })?;
        columns.push(column);
    }

    let dim = columns[0].dim();
    if columns.iter().any(|c| c.dim() != dim) {
        return Err(ForecastError::config(format!(
            "per-feature files in {} disagree on shape",
            dir.display()
        )));
    }
    let views: Vec<_> = columns.iter().map(|c| c.view()).collect();
    ndarray::stack(Axis(2), &views)
        .map_err(|e| ForecastError::config(format!("failed to stack feature files: {e}")))
}

fn find_feature_file(dir: &Path, feature: Feature) -> Result<PathBuf> {
    let needle = format!("_{}", feature.name());
    let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.extension().and_then(|e| e.to_str()) == Some("npy")
                && p
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains(&needle))
                    .unwrap_or(false)
        })
        .collect();
    candidates.sort();
    candidates
        .into_iter()
        .next()
        .ok_or_else(|| ForecastError::not_found("raw data", dir.join(format!("*{needle}*.npy"))))
}
