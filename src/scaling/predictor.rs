//! Best-effort load prediction from a rolling window of samples

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::config::PredictiveConfig;
use crate::stats::linear_regression;

#[derive(Debug, Clone, Copy, PartialEq)]
struct LoadSample {
    at: DateTime<Utc>,
    cpu: f64,
    memory: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadPrediction {
    pub predicted_cpu: f64,
    pub predicted_memory: f64,
    /// r² of the fit behind the dominant resource
    pub confidence: f64,
    pub horizon_minutes: u64,
    /// Worker multiplier that brings the predicted peak to the target utilization
    pub scale_ratio: f64,
    pub recommended_workers: usize,
    pub samples: usize,
    pub made_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LoadPredictor {
    config: PredictiveConfig,
    samples: VecDeque<LoadSample>,
}

impl LoadPredictor {
    pub fn new(config: PredictiveConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    pub fn config(&self) -> &PredictiveConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Add a sample and forget those that fell out of the window
    pub fn record(&mut self, at: DateTime<Utc>, cpu: f64, memory: f64) {
        self.samples.push_back(LoadSample { at, cpu, memory });

        let window = TimeDelta::minutes(self.config.window_minutes as i64);
        while self
            .samples
            .front()
            .is_some_and(|sample| at - sample.at > window)
        {
            self.samples.pop_front();
        }
    }

    /// Project load `horizon_minutes` past the newest sample
    ///
    /// `None` until `min_samples` are collected or when the samples share a
    /// single timestamp.
    pub fn predict(&self, current_workers: usize) -> Option<LoadPrediction> {
        if self.samples.len() < self.config.min_samples.max(2) {
            return None;
        }

        let origin = self.samples.front()?.at;
        let minutes = |at: DateTime<Utc>| (at - origin).num_milliseconds() as f64 / 60_000.0;

        let cpu_points: Vec<(f64, f64)> =
            self.samples.iter().map(|s| (minutes(s.at), s.cpu)).collect();
        let memory_points: Vec<(f64, f64)> = self
            .samples
            .iter()
            .map(|s| (minutes(s.at), s.memory))
            .collect();
        let cpu_fit = linear_regression(&cpu_points)?;
        let memory_fit = linear_regression(&memory_points)?;

        let newest = self.samples.back()?;
        let target = minutes(newest.at) + self.config.horizon_minutes as f64;
        let predicted_cpu = cpu_fit.predict(target).clamp(0.0, 100.0);
        let predicted_memory = memory_fit.predict(target).clamp(0.0, 100.0);

        let (peak, confidence) = if predicted_cpu >= predicted_memory {
            (predicted_cpu, cpu_fit.r_squared)
        } else {
            (predicted_memory, memory_fit.r_squared)
        };

        let scale_ratio = peak / self.config.target_utilization.max(1.0);
        let recommended_workers = (current_workers.max(1) as f64 * scale_ratio).ceil() as usize;

        Some(LoadPrediction {
            predicted_cpu,
            predicted_memory,
            confidence,
            horizon_minutes: self.config.horizon_minutes,
            scale_ratio,
            recommended_workers: recommended_workers.max(1),
            samples: self.samples.len(),
            made_at: newest.at,
        })
    }

    pub fn is_confident(&self, prediction: &LoadPrediction) -> bool {
        prediction.confidence > self.config.confidence_threshold
    }
}
