//! DigitPad — draw a digit, get a live prediction from an ONNX classifier.

#[macro_use]
pub mod logger;
pub mod app;
pub mod canvas;
pub mod cli;
pub mod ops;

pub use app::DigitApp;
pub use ops::ai::{DigitModel, ModelError, OnnxDigitModel};
pub use ops::predict::{Prediction, PredictError, PredictionScheduler};
pub use ops::preprocess::{ModelInput, to_model_input};
