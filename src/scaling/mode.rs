use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::ScalingConfig;

/// Process-wide operating mode of one instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalabilityMode {
    #[default]
    Normal,
    HighLoad,
    Degraded,
    Emergency,
}

impl ScalabilityMode {
    /// Mode implied by the latest cpu and memory usage
    ///
    /// The most severe threshold pair reached by either resource wins.
    pub fn classify(cpu: f64, memory: f64, config: &ScalingConfig) -> Self {
        if config.emergency.reached_by(cpu, memory) {
            ScalabilityMode::Emergency
        } else if config.degradation.reached_by(cpu, memory) {
            ScalabilityMode::Degraded
        } else if config.scale_up.reached_by(cpu, memory) {
            ScalabilityMode::HighLoad
        } else {
            ScalabilityMode::Normal
        }
    }

    /// Modes in which only the manager may resize pools
    pub fn suspends_auto_scaling(self) -> bool {
        matches!(self, ScalabilityMode::Degraded | ScalabilityMode::Emergency)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScalabilityMode::Normal => "normal",
            ScalabilityMode::HighLoad => "high_load",
            ScalabilityMode::Degraded => "degraded",
            ScalabilityMode::Emergency => "emergency",
        }
    }
}

impl fmt::Display for ScalabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
