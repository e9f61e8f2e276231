//! Operating modes, scaling decisions and load prediction

pub mod manager;
pub mod mode;
pub mod predictor;

pub use manager::{DecisionKind, ManagerStatus, ScalabilityManager, ScalingDecision};
pub use mode::ScalabilityMode;
pub use predictor::{LoadPrediction, LoadPredictor};
