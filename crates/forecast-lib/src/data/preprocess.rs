//! Per-sensor cleaning and rescaling
//!
//! Every (sensor, feature) column is treated independently: missing values
//! are imputed along time, outliers are detected and clipped or re-imputed,
//! and a scaler is fitted to the cleaned column. Fitted scalers are kept so
//! model outputs can be mapped back to physical units.

use ndarray::{Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

use super::loader::RawSeries;
use crate::error::{ForecastError, Result};
use crate::models::{Feature, NUM_FEATURES};

/// How gaps (NaN) in a column are filled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingStrategy {
    /// Linear in time, edges filled from the nearest observation
    #[default]
    Interpolate,
    ForwardFill,
    BackwardFill,
    Mean,
}

impl FromStr for MissingStrategy {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "interpolate" => Ok(Self::Interpolate),
            "forward_fill" | "ffill" => Ok(Self::ForwardFill),
            "backward_fill" | "bfill" => Ok(Self::BackwardFill),
            "mean" => Ok(Self::Mean),
            other => Err(ForecastError::config(format!(
                "unknown missing-value strategy '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierMethod {
    #[default]
    Iqr,
    Zscore,
}

impl FromStr for OutlierMethod {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "iqr" => Ok(Self::Iqr),
            "zscore" => Ok(Self::Zscore),
            other => Err(ForecastError::config(format!(
                "unknown outlier method '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutlierAction {
    /// Clamp to the detection bounds
    #[default]
    Clip,
    /// Mark as missing and impute again
    Interpolate,
}

impl FromStr for OutlierAction {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "clip" => Ok(Self::Clip),
            "interpolate" => Ok(Self::Interpolate),
            other => Err(ForecastError::config(format!(
                "unknown outlier action '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalerKind {
    #[default]
    #[serde(alias = "min_max")]
    Minmax,
    Standard,
    Robust,
}

impl FromStr for ScalerKind {
    type Err = ForecastError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "minmax" | "min_max" => Ok(Self::Minmax),
            "standard" => Ok(Self::Standard),
            "robust" => Ok(Self::Robust),
            other => Err(ForecastError::config(format!(
                "unknown scaler method '{other}'"
            ))),
        }
    }
}

/// Speed thresholds for the training-time congestion labels
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedLabelThresholds {
    /// Speeds strictly above this are "clear" (label 0)
    pub clear: f32,
    /// Speeds strictly below this are "congested" (label 2)
    pub slow: f32,
}

impl Default for SpeedLabelThresholds {
    fn default() -> Self {
        Self {
            clear: 60.0,
            slow: 30.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub missing: MissingStrategy,
    pub handle_outliers: bool,
    pub outlier_method: OutlierMethod,
    /// IQR multiplier, or |z| cutoff for `zscore`
    pub outlier_threshold: f32,
    pub outlier_action: OutlierAction,
    pub scaler: ScalerKind,
    /// Target range for `minmax`
    pub feature_range: (f32, f32),
    pub labels: SpeedLabelThresholds,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            missing: MissingStrategy::Interpolate,
            handle_outliers: true,
            outlier_method: OutlierMethod::Iqr,
            outlier_threshold: 1.5,
            outlier_action: OutlierAction::Clip,
            scaler: ScalerKind::Minmax,
            feature_range: (0.0, 1.0),
            labels: SpeedLabelThresholds::default(),
        }
    }
}

impl PreprocessConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.outlier_threshold > 0.0) {
            return Err(ForecastError::config(format!(
                "outlier threshold must be positive, got {}",
                self.outlier_threshold
            )));
        }
        let (lo, hi) = self.feature_range;
        if !(lo < hi) {
            return Err(ForecastError::config(format!(
                "feature range ({lo}, {hi}) must be increasing"
            )));
        }
        if !(self.labels.slow <= self.labels.clear) {
            return Err(ForecastError::config(
                "speed label thresholds must satisfy slow <= clear",
            ));
        }
        Ok(())
    }
}

/// Fill NaN entries of one column in place; anything left over becomes 0
pub fn impute(column: &mut [f32], strategy: MissingStrategy) {
    match strategy {
        MissingStrategy::Interpolate => interpolate_linear(column),
        MissingStrategy::ForwardFill => forward_fill(column),
        MissingStrategy::BackwardFill => backward_fill(column),
        MissingStrategy::Mean => {
            let observed: Vec<f64> = column
                .iter()
                .filter(|v| !v.is_nan())
                .map(|&v| v as f64)
                .collect();
            if !observed.is_empty() {
                let mean = (observed.iter().sum::<f64>() / observed.len() as f64) as f32;
                column.iter_mut().filter(|v| v.is_nan()).for_each(|v| *v = mean);
            }
        }
    }
    column.iter_mut().filter(|v| !v.is_finite()).for_each(|v| *v = 0.0);
}

fn interpolate_linear(column: &mut [f32]) {
    let known: Vec<usize> = (0..column.len()).filter(|&i| !column[i].is_nan()).collect();
    let (Some(&first), Some(&last)) = (known.first(), known.last()) else {
        return;
    };

    let head = column[first];
    column[..first].iter_mut().for_each(|v| *v = head);
    let tail = column[last];
    column[last + 1..].iter_mut().for_each(|v| *v = tail);

    for pair in known.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if b - a < 2 {
            continue;
        }
        let (va, vb) = (column[a], column[b]);
        let span = (b - a) as f32;
        for i in a + 1..b {
            let t = (i - a) as f32 / span;
            column[i] = va + (vb - va) * t;
        }
    }
}

fn forward_fill(column: &mut [f32]) {
    let mut last = f32::NAN;
    for v in column.iter_mut() {
        if v.is_nan() {
            *v = last;
        } else {
            last = *v;
        }
    }
}

fn backward_fill(column: &mut [f32]) {
    let mut next = f32::NAN;
    for v in column.iter_mut().rev() {
        if v.is_nan() {
            *v = next;
        } else {
            next = *v;
        }
    }
}

/// Percentile of sorted data with linear interpolation between order statistics
pub fn percentile(sorted: &[f64], q: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let rank = q.clamp(0.0, 1.0) * (n - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
        }
    }
}

fn sorted_finite(column: &[f32]) -> Vec<f64> {
    let mut values: Vec<f64> = column
        .iter()
        .filter(|v| v.is_finite())
        .map(|&v| v as f64)
        .collect();
    values.sort_by(|a, b| a.total_cmp(b));
    values
}

fn mean_std(column: &[f32]) -> (f64, f64) {
    let n = column.len().max(1) as f64;
    let mean = column.iter().map(|&v| v as f64).sum::<f64>() / n;
    let var = column.iter().map(|&v| (v as f64 - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Acceptance interval of a column for the given detection method
pub fn outlier_bounds(column: &[f32], method: OutlierMethod, threshold: f32) -> (f32, f32) {
    let k = threshold as f64;
    let (lo, hi) = match method {
        OutlierMethod::Iqr => {
            let sorted = sorted_finite(column);
            let q1 = percentile(&sorted, 0.25);
            let q3 = percentile(&sorted, 0.75);
            let iqr = q3 - q1;
            (q1 - k * iqr, q3 + k * iqr)
        }
        OutlierMethod::Zscore => {
            let (mean, std) = mean_std(column);
            (mean - k * std, mean + k * std)
        }
    };
    (lo as f32, hi as f32)
}

/// Flags entries that fall outside the acceptance interval
pub fn detect_outliers(column: &[f32], method: OutlierMethod, threshold: f32) -> Vec<bool> {
    let (lo, hi) = outlier_bounds(column, method, threshold);
    column.iter().map(|&v| v < lo || v > hi).collect()
}

/// Clip or re-impute outliers of one column in place, returning how many were found
pub fn treat_outliers(column: &mut [f32], config: &PreprocessConfig) -> usize {
    let (lo, hi) = outlier_bounds(column, config.outlier_method, config.outlier_threshold);
    let mut count = 0;
    for v in column.iter_mut() {
        if *v < lo || *v > hi {
            count += 1;
            *v = match config.outlier_action {
                OutlierAction::Clip => v.clamp(lo, hi),
                OutlierAction::Interpolate => f32::NAN,
            };
        }
    }
    if count > 0 && config.outlier_action == OutlierAction::Interpolate {
        impute(column, MissingStrategy::Interpolate);
    }
    count
}

/// Affine map of one column: `y = (x - center) / scale + shift`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColumnScaler {
    pub center: f32,
    pub scale: f32,
    pub shift: f32,
}

impl ColumnScaler {
    pub const IDENTITY: ColumnScaler = ColumnScaler {
        center: 0.0,
        scale: 1.0,
        shift: 0.0,
    };

    /// Fit to a cleaned column; a zero spread falls back to unit scale
    pub fn fit(column: &[f32], kind: ScalerKind, range: (f32, f32)) -> Self {
        let nonzero = |spread: f64| if spread.abs() < f64::EPSILON { 1.0 } else { spread };
        match kind {
            ScalerKind::Minmax => {
                let sorted = sorted_finite(column);
                let (min, max) = match (sorted.first(), sorted.last()) {
                    (Some(&min), Some(&max)) => (min, max),
                    _ => return Self::IDENTITY,
                };
                let width = (range.1 - range.0) as f64;
                Self {
                    center: min as f32,
                    scale: (nonzero(max - min) / width) as f32,
                    shift: range.0,
                }
            }
            ScalerKind::Standard => {
                let (mean, std) = mean_std(column);
                Self {
                    center: mean as f32,
                    scale: nonzero(std) as f32,
                    shift: 0.0,
                }
            }
            ScalerKind::Robust => {
                let sorted = sorted_finite(column);
                let median = percentile(&sorted, 0.5);
                let iqr = percentile(&sorted, 0.75) - percentile(&sorted, 0.25);
                Self {
                    center: median as f32,
                    scale: nonzero(iqr) as f32,
                    shift: 0.0,
                }
            }
        }
    }

    #[inline]
    pub fn transform(&self, x: f32) -> f32 {
        (x - self.center) / self.scale + self.shift
    }

    #[inline]
    pub fn inverse(&self, y: f32) -> f32 {
        (y - self.shift) * self.scale + self.center
    }
}

/// Scalers fitted per (sensor, feature) column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FittedScalers {
    pub kind: ScalerKind,
    pub num_sensors: usize,
    /// Indexed by `sensor * NUM_FEATURES + feature`
    columns: Vec<ColumnScaler>,
}

impl FittedScalers {
    /// Fit one scaler per column of a (timestep, sensor, feature) array
    pub fn fit(data: &Array3<f32>, kind: ScalerKind, range: (f32, f32)) -> Self {
        let (_, num_sensors, num_features) = data.dim();
        let mut columns = Vec::with_capacity(num_sensors * num_features);
        for sensor in 0..num_sensors {
            for feature in 0..num_features {
                let column: Vec<f32> = data.slice(ndarray::s![.., sensor, feature]).to_vec();
                columns.push(ColumnScaler::fit(&column, kind, range));
            }
        }
        Self {
            kind,
            num_sensors,
            columns,
        }
    }

    pub fn column(&self, sensor: usize, feature: Feature) -> Result<&ColumnScaler> {
        if sensor >= self.num_sensors {
            return Err(ForecastError::SensorOutOfRange {
                index: sensor,
                num_sensors: self.num_sensors,
            });
        }
        Ok(&self.columns[sensor * NUM_FEATURES + feature.index()])
    }

    pub fn transform_value(&self, sensor: usize, feature: Feature, x: f32) -> Result<f32> {
        Ok(self.column(sensor, feature)?.transform(x))
    }

    pub fn inverse_value(&self, sensor: usize, feature: Feature, y: f32) -> Result<f32> {
        Ok(self.column(sensor, feature)?.inverse(y))
    }

    /// Scale a full (timestep, sensor, feature) array in place
    pub fn transform_series(&self, data: &mut Array3<f32>) -> Result<()> {
        let (_, num_sensors, _) = data.dim();
        if num_sensors != self.num_sensors {
            return Err(ForecastError::InvalidInput(format!(
                "scalers were fitted on {} sensors, series has {num_sensors}",
                self.num_sensors
            )));
        }
        for (sensor, mut block) in data.axis_iter_mut(Axis(1)).enumerate() {
            self.transform_window(sensor, block.view_mut())?;
        }
        Ok(())
    }

    /// Scale one sensor's (timestep, feature) window in place
    pub fn transform_window(&self, sensor: usize, mut window: ArrayViewMut2<'_, f32>) -> Result<()> {
        for feature in Feature::ALL {
            let scaler = *self.column(sensor, feature)?;
            window
                .column_mut(feature.index())
                .mapv_inplace(|x| scaler.transform(x));
        }
        Ok(())
    }

    /// Map one sensor's scaled (timestep, feature) window back to physical units
    pub fn inverse_window(&self, sensor: usize, window: ArrayView2<'_, f32>) -> Result<Array2<f32>> {
        let mut out = window.to_owned();
        for feature in Feature::ALL {
            let scaler = *self.column(sensor, feature)?;
            out.column_mut(feature.index())
                .mapv_inplace(|y| scaler.inverse(y));
        }
        Ok(out)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        debug!(path = %path.display(), "Saved fitted scalers");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ForecastError::not_found("scaler file", path));
        }
        let scalers: Self = serde_json::from_slice(&std::fs::read(path)?)?;
        if scalers.columns.len() != scalers.num_sensors * NUM_FEATURES {
            return Err(ForecastError::config(format!(
                "scaler file {} is inconsistent: {} columns for {} sensors",
                path.display(),
                scalers.columns.len(),
                scalers.num_sensors
            )));
        }
        Ok(scalers)
    }
}

/// Training-time labels from speed: 0 clear, 1 slow, 2 congested
pub fn congestion_labels(speed: ArrayView2<'_, f32>, thresholds: SpeedLabelThresholds) -> Array2<u8> {
    speed.mapv(|v| {
        if v > thresholds.clear {
            0
        } else if v >= thresholds.slow {
            1
        } else {
            2
        }
    })
}

/// Output of the full preprocessing pipeline
#[derive(Debug, Clone)]
pub struct ProcessedSeries {
    /// Scaled (timestep, sensor, feature) data
    pub data: Array3<f32>,
    /// (timestep, sensor) labels from the cleaned, unscaled speed
    pub labels: Array2<u8>,
    pub scalers: FittedScalers,
}

#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Impute gaps and treat outliers in every column, without scaling
    pub fn clean(&self, data: &mut Array3<f32>) -> usize {
        let mut outliers = 0;
        for mut lane in data.lanes_mut(Axis(0)) {
            let mut column = lane.to_vec();
            impute(&mut column, self.config.missing);
            if self.config.handle_outliers {
                outliers += treat_outliers(&mut column, &self.config);
            }
            lane.iter_mut().zip(column).for_each(|(dst, src)| *dst = src);
        }
        outliers
    }

    pub fn process(&self, raw: &RawSeries) -> Result<ProcessedSeries> {
        self.process_array(raw.data().clone())
    }

    /// Clean, label and scale a (timestep, sensor, feature) array
    pub fn process_array(&self, mut data: Array3<f32>) -> Result<ProcessedSeries> {
        if data.dim().2 != NUM_FEATURES {
            return Err(ForecastError::config(format!(
                "expected {NUM_FEATURES} features, got {}",
                data.dim().2
            )));
        }

        // Labels come from imputed speed before outlier treatment
        let mut speed = data.index_axis(Axis(2), Feature::Speed.index()).to_owned();
        for mut lane in speed.lanes_mut(Axis(0)) {
            let mut column = lane.to_vec();
            impute(&mut column, self.config.missing);
            lane.iter_mut().zip(column).for_each(|(dst, src)| *dst = src);
        }
        let labels = congestion_labels(speed.view(), self.config.labels);

        let outliers = self.clean(&mut data);
        let scalers = FittedScalers::fit(&data, self.config.scaler, self.config.feature_range);
        scalers.transform_series(&mut data)?;

        info!(
            num_timesteps = data.dim().0,
            num_sensors = data.dim().1,
            outliers = outliers,
            scaler = ?self.config.scaler,
            "Preprocessed series"
        );
        Ok(ProcessedSeries {
            data,
            labels,
            scalers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-5
    }

    #[test]
    fn test_interpolate_fills_gaps_and_edges() {
        let mut col = vec![f32::NAN, 1.0, f32::NAN, f32::NAN, 4.0, f32::NAN];
        impute(&mut col, MissingStrategy::Interpolate);
        assert_eq!(col, vec![1.0, 1.0, 2.0, 3.0, 4.0, 4.0]);
    }

    #[test]
    fn test_fill_strategies() {
        let mut ffill = vec![f32::NAN, 2.0, f32::NAN, 5.0];
        impute(&mut ffill, MissingStrategy::ForwardFill);
        assert_eq!(ffill, vec![0.0, 2.0, 2.0, 5.0]);

        let mut bfill = vec![f32::NAN, 2.0, f32::NAN, 5.0, f32::NAN];
        impute(&mut bfill, MissingStrategy::BackwardFill);
        assert_eq!(bfill, vec![2.0, 2.0, 5.0, 5.0, 0.0]);

        let mut mean = vec![1.0, f32::NAN, 3.0];
        impute(&mut mean, MissingStrategy::Mean);
        assert_eq!(mean, vec![1.0, 2.0, 3.0]);

        let mut empty = vec![f32::NAN, f32::NAN];
        impute(&mut empty, MissingStrategy::Interpolate);
        assert_eq!(empty, vec![0.0, 0.0]);
    }

    #[test]
    fn test_percentile_linear() {
        let sorted = [1.0, 2.0, 3.0, 4.0];
        assert!((percentile(&sorted, 0.25) - 1.75).abs() < 1e-12);
        assert!((percentile(&sorted, 0.5) - 2.5).abs() < 1e-12);
        assert_eq!(percentile(&sorted, 1.0), 4.0);
    }

    #[test]
    fn test_iqr_clip() {
        let mut col = vec![1.0, 2.0, 3.0, 4.0, 100.0];
        let config = PreprocessConfig::default();
        // q1 = 2, q3 = 4, iqr = 2, bounds [-1, 7]
        assert_eq!(
            detect_outliers(&col, OutlierMethod::Iqr, 1.5),
            vec![false, false, false, false, true]
        );
        let found = treat_outliers(&mut col, &config);
        assert_eq!(found, 1);
        assert_eq!(col[4], 7.0);
    }

    #[test]
    fn test_outlier_interpolate_action() {
        let mut col = vec![1.0, 2.0, 100.0, 4.0, 5.0];
        let config = PreprocessConfig {
            outlier_action: OutlierAction::Interpolate,
            ..Default::default()
        };
        treat_outliers(&mut col, &config);
        assert_eq!(col[2], 3.0);
    }

    #[test]
    fn test_unknown_method_names() {
        assert!("median".parse::<MissingStrategy>().is_err());
        assert!("mad".parse::<OutlierMethod>().is_err());
        assert!("drop".parse::<OutlierAction>().is_err());
        assert!(matches!(
            "log".parse::<ScalerKind>(),
            Err(ForecastError::Configuration(_))
        ));
        assert_eq!("robust".parse::<ScalerKind>().unwrap(), ScalerKind::Robust);
    }

    #[test]
    fn test_column_scalers() {
        let col = [2.0, 4.0, 6.0, 10.0];

        let minmax = ColumnScaler::fit(&col, ScalerKind::Minmax, (0.0, 1.0));
        assert!(approx(minmax.transform(2.0), 0.0));
        assert!(approx(minmax.transform(10.0), 1.0));
        assert!(approx(minmax.inverse(0.5), 6.0));

        let ranged = ColumnScaler::fit(&col, ScalerKind::Minmax, (-1.0, 1.0));
        assert!(approx(ranged.transform(2.0), -1.0));
        assert!(approx(ranged.transform(10.0), 1.0));

        let standard = ColumnScaler::fit(&col, ScalerKind::Standard, (0.0, 1.0));
        assert!(approx(standard.transform(5.5), 0.0));

        let robust = ColumnScaler::fit(&col, ScalerKind::Robust, (0.0, 1.0));
        assert!(approx(robust.transform(5.0), 0.0));

        let flat = ColumnScaler::fit(&[3.0, 3.0], ScalerKind::Standard, (0.0, 1.0));
        assert!(approx(flat.transform(4.0), 1.0));
    }

    #[test]
    fn test_scalers_are_per_sensor_column() {
        let mut data = Array3::<f32>::zeros((4, 2, NUM_FEATURES));
        for t in 0..4 {
            data[[t, 0, 0]] = t as f32;
            data[[t, 1, 0]] = 10.0 * t as f32;
        }
        let scalers = FittedScalers::fit(&data, ScalerKind::Minmax, (0.0, 1.0));
        scalers.transform_series(&mut data).unwrap();
        assert!(approx(data[[3, 0, 0]], 1.0));
        assert!(approx(data[[3, 1, 0]], 1.0));
        assert!(approx(
            scalers.inverse_value(1, Feature::Flow, 1.0).unwrap(),
            30.0
        ));

        let window = data.index_axis(Axis(1), 1);
        let restored = scalers.inverse_window(1, window).unwrap();
        assert!(approx(restored[[2, 0]], 20.0));
        assert!(scalers.column(2, Feature::Flow).is_err());
    }

    #[test]
    fn test_scalers_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalers.json");
        let data = Array3::from_shape_fn((5, 3, NUM_FEATURES), |(t, s, f)| (t * s + f) as f32);
        let scalers = FittedScalers::fit(&data, ScalerKind::Robust, (0.0, 1.0));
        scalers.save(&path).unwrap();
        assert_eq!(FittedScalers::load(&path).unwrap(), scalers);
        assert!(matches!(
            FittedScalers::load(dir.path().join("missing.json")),
            Err(ForecastError::NotFound { .. })
        ));
    }

    #[test]
    fn test_congestion_labels_from_speed() {
        let speed = array![[65.0f32, 60.0, 45.0], [30.0, 29.9, 0.0]];
        let labels = congestion_labels(speed.view(), SpeedLabelThresholds::default());
        assert_eq!(labels, array![[0u8, 1, 1], [1, 2, 2]]);
    }

    #[test]
    fn test_process_pipeline() {
        let mut data = Array3::from_shape_fn((20, 2, NUM_FEATURES), |(t, s, f)| {
            (t + s * 5) as f32 + f as f32 * 20.0
        });
        data[[4, 0, 0]] = f32::NAN;
        data[[10, 1, 2]] = 10_000.0;

        let processed = Preprocessor::default().process_array(data).unwrap();
        assert_eq!(processed.data.dim(), (20, 2, NUM_FEATURES));
        assert!(processed.data.iter().all(|v| v.is_finite()));
        assert!(processed.data.iter().all(|&v| (-1e-5..=1.0 + 1e-5).contains(&v)));
        assert_eq!(processed.labels.dim(), (20, 2));
        // the spike was labelled before clipping: 10000 > 60
        assert_eq!(processed.labels[[10, 1]], 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = PreprocessConfig {
            feature_range: (1.0, 0.0),
            ..Default::default()
        };
        assert!(Preprocessor::new(config).is_err());
    }
}
