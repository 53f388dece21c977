//! Inference: sampling inputs, running the model, classifying congestion

mod confidence;
mod congestion;
mod inference;
mod sampler;

pub use confidence::{spread_to_confidence, ConfidenceMode, DEFAULT_CONFIDENCE};
pub use congestion::CongestionCalibration;
pub use inference::{
    InferenceStats, LoadedModel, ModelHandle, Prediction, Predictor, PredictorConfig,
};
pub use sampler::{SamplerConfig, SamplingMode, SensorSample, SensorSampler};
