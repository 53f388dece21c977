//! Sliding-window (history, target) samples over a time series

use candle_core::{Device, Tensor};
use ndarray::{s, Array2, Array3, ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, Result};

/// What a sample's target covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetMode {
    /// The next `H` timesteps
    Horizon(usize),
    /// The single timestep right after the window
    NextStep,
}

impl TargetMode {
    /// Timesteps consumed after the history window
    pub fn span(self) -> usize {
        match self {
            TargetMode::Horizon(h) => h,
            TargetMode::NextStep => 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    pub lookback: usize,
    pub horizon: usize,
    pub stride: usize,
    /// Average sensors together and predict only the next step
    pub simplified: bool,
    pub batch_size: usize,
    pub shuffle_seed: u64,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            lookback: 12,
            horizon: 12,
            stride: 1,
            simplified: true,
            batch_size: 64,
            shuffle_seed: 42,
        }
    }
}

impl DatasetConfig {
    pub fn target_mode(&self) -> TargetMode {
        if self.simplified {
            TargetMode::NextStep
        } else {
            TargetMode::Horizon(self.horizon)
        }
    }
}

/// Target part of a sample
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Target<'a> {
    /// (horizon, features)
    Horizon(ArrayView2<'a, f32>),
    /// (features,)
    NextStep(ArrayView1<'a, f32>),
}

impl<'a> Target<'a> {
    /// The first predicted timestep
    pub fn first_step(&self) -> ArrayView1<'a, f32> {
        match *self {
            Target::Horizon(view) => view.index_axis_move(Axis(0), 0),
            Target::NextStep(view) => view,
        }
    }
}

/// One (history, target) pair, borrowed from the dataset
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window<'a> {
    pub index: usize,
    /// (lookback, features)
    pub input: ArrayView2<'a, f32>,
    pub target: Target<'a>,
}

/// Indexed, restartable sequence of windows over a (timestep, features) array
#[derive(Debug, Clone)]
pub struct WindowedDataset {
    data: Array2<f32>,
    lookback: usize,
    mode: TargetMode,
    stride: usize,
    len: usize,
}

impl WindowedDataset {
    /// Validates window sizes up front; a series shorter than
    /// `lookback + horizon` is a configuration error.
    pub fn new(data: Array2<f32>, lookback: usize, mode: TargetMode, stride: usize) -> Result<Self> {
        if lookback == 0 {
            return Err(ForecastError::config("lookback must be at least 1"));
        }
        if stride == 0 {
            return Err(ForecastError::config("stride must be at least 1"));
        }
        if mode.span() == 0 {
            return Err(ForecastError::config("horizon must be at least 1"));
        }
        let timesteps = data.nrows();
        let needed = lookback + mode.span();
        let len = match timesteps.checked_sub(needed) {
            Some(slack) => slack / stride + 1,
            None => {
                return Err(ForecastError::config(format!(
                    "series of {timesteps} timesteps is too short for lookback {lookback} + horizon {}",
                    mode.span()
                )))
            }
        };
        Ok(Self {
            data,
            lookback,
            mode,
            stride,
            len,
        })
    }

    /// Flatten each timestep of a (timestep, sensor, feature) array into one row
    pub fn from_series(data: Array3<f32>, lookback: usize, mode: TargetMode, stride: usize) -> Result<Self> {
        let (t, s, f) = data.dim();
        let flat = data
            .into_shape((t, s * f))
            .map_err(|e| ForecastError::config(format!("cannot flatten series: {e}")))?;
        Self::new(flat, lookback, mode, stride)
    }

    pub fn from_config(data: Array2<f32>, config: &DatasetConfig) -> Result<Self> {
        Self::new(data, config.lookback, config.target_mode(), config.stride)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn mode(&self) -> TargetMode {
        self.mode
    }

    /// Width of one timestep row
    pub fn num_features(&self) -> usize {
        self.data.ncols()
    }

    pub fn get(&self, index: usize) -> Option<Window<'_>> {
        if index >= self.len {
            return None;
        }
        let start = index * self.stride;
        let split = start + self.lookback;
        let input = self.data.slice(s![start..split, ..]);
        let target = match self.mode {
            TargetMode::Horizon(h) => Target::Horizon(self.data.slice(s![split..split + h, ..])),
            TargetMode::NextStep => Target::NextStep(self.data.row(split)),
        };
        Some(Window {
            index,
            input,
            target,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Window<'_>> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }

    /// Batches in index order, or in a seeded random order when `shuffle_seed` is set
    pub fn batches(&self, batch_size: usize, shuffle_seed: Option<u64>, device: &Device) -> BatchIter<'_> {
        let mut order: Vec<usize> = (0..self.len).collect();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        BatchIter {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            position: 0,
            device: device.clone(),
        }
    }

    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len.div_ceil(batch_size.max(1))
    }
}

/// Yields `(x: (B, lookback, features), y: (B, features))` tensors
pub struct BatchIter<'a> {
    dataset: &'a WindowedDataset,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
    device: Device,
}

impl BatchIter<'_> {
    fn build(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let lookback = self.dataset.lookback;
        let width = self.dataset.num_features();
        let mut xs = Vec::with_capacity(indices.len() * lookback * width);
        let mut ys = Vec::with_capacity(indices.len() * width);
        for &i in indices {
            let window = self
                .dataset
                .get(i)
                .ok_or_else(|| ForecastError::InvalidInput(format!("sample {i} out of range")))?;
            xs.extend(window.input.iter().copied());
            ys.extend(window.target.first_step().iter().copied());
        }
        let x = Tensor::from_vec(xs, (indices.len(), lookback, width), &self.device)?;
        let y = Tensor::from_vec(ys, (indices.len(), width), &self.device)?;
        Ok((x, y))
    }
}

impl Iterator for BatchIter<'_> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let indices = self.order[self.position..end].to_vec();
        self.position = end;
        Some(self.build(&indices))
    }
}
