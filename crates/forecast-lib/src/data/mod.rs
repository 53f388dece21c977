//! Raw series loading, preprocessing and windowed datasets

pub mod dataset;
pub mod loader;
pub mod preprocess;

pub use dataset::{BatchIter, DatasetConfig, Target, TargetMode, Window, WindowedDataset};
pub use loader::{split_chronological, RawSeries, SeriesInfo, SplitRatios};
pub use preprocess::{
    ColumnScaler, FittedScalers, MissingStrategy, OutlierAction, OutlierMethod, PreprocessConfig,
    Preprocessor, ProcessedSeries, ScalerKind, SpeedLabelThresholds,
};
