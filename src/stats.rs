//! Least-squares helpers used for load prediction and storage growth projection

/// Result of a simple linear fit `y = slope * x + intercept`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    /// Coefficient of determination, clamped to `0.0..=1.0`
    pub r_squared: f64,
    pub samples: usize,
}

impl LinearFit {
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Fit a line through `(x, y)` points.
///
/// Returns `None` for fewer than two points or when all `x` values coincide.
/// A perfectly flat series has an undefined `r²`; it is reported as `1.0` when
/// the fit is exact and `0.0` otherwise.
pub fn linear_regression(points: &[(f64, f64)]) -> Option<LinearFit> {
    if points.len() < 2 {
        return None;
    }

    let n = points.len() as f64;
    let sum_x: f64 = points.iter().map(|(x, _)| x).sum();
    let sum_y: f64 = points.iter().map(|(_, y)| y).sum();
    let sum_xy: f64 = points.iter().map(|(x, y)| x * y).sum();
    let sum_xx: f64 = points.iter().map(|(x, _)| x * x).sum();

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator.abs() < f64::EPSILON {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    let intercept = (sum_y - slope * sum_x) / n;

    let mean_y = sum_y / n;
    let ss_tot: f64 = points.iter().map(|(_, y)| (y - mean_y).powi(2)).sum();
    let ss_res: f64 = points
        .iter()
        .map(|(x, y)| (y - (slope * x + intercept)).powi(2))
        .sum();

    let r_squared = if ss_tot.abs() < f64::EPSILON {
        if ss_res.abs() < f64::EPSILON { 1.0 } else { 0.0 }
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
        samples: points.len(),
    })
}
