//! Scoring functions
//!
//! A scoring function is loaded once at startup and then shared read-only by
//! every dispatcher, so implementations must be `Send + Sync` and must not
//! need `&mut self` to predict.

use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ScoringError {
    #[error("expected {expected} features, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("feature vector contains a non-finite value at position {0}")]
    NonFiniteInput(usize),

    #[error("model produced a non-finite prediction")]
    NonFiniteOutput,
}

#[derive(Debug, thiserror::Error)]
pub enum ModelLoadError {
    #[error("cannot read model artifact {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid model artifact: {0}")]
    Invalid(String),
}

/// Black-box model mapping an ordered feature vector to a prediction
pub trait ScoringFunction: Send + Sync {
    fn predict(&self, features: &[f64]) -> Result<f64, ScoringError>;

    /// Stamped on every prediction this model produces
    fn model_version(&self) -> &str;

    /// Feature order the model was trained on, when the artifact records it
    fn feature_names(&self) -> Option<&[String]> {
        None
    }
}

/// Linear regression exported as JSON by the training pipeline
///
/// ```json
/// {
///   "name": "inventory-demand-forecaster",
///   "version": "3",
///   "features": ["historical_demand_7d", "historical_demand_30d", "price", "day_of_week", "month"],
///   "intercept": 1.5,
///   "coefficients": [0.6, 0.3, -0.01, 0.2, 0.05]
/// }
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct LinearModel {
    name: String,
    version: String,
    features: Vec<String>,
    intercept: f64,
    coefficients: Vec<f64>,
}

impl LinearModel {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelLoadError> {
        let model: LinearModel = serde_json::from_slice(bytes)?;
        model.check()?;
        Ok(model)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ModelLoadError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| ModelLoadError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&bytes)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn check(&self) -> Result<(), ModelLoadError> {
        if self.version.trim().is_empty() {
            return Err(ModelLoadError::Invalid("version cannot be empty".to_string()));
        }
        if self.features.is_empty() {
            return Err(ModelLoadError::Invalid("model has no features".to_string()));
        }
        if self.features.len() != self.coefficients.len() {
            return Err(ModelLoadError::Invalid(format!(
                "{} features but {} coefficients",
                self.features.len(),
                self.coefficients.len()
            )));
        }
        if !self.intercept.is_finite() || self.coefficients.iter().any(|c| !c.is_finite()) {
            return Err(ModelLoadError::Invalid("non-finite parameter".to_string()));
        }
        Ok(())
    }
}

impl ScoringFunction for LinearModel {
    fn predict(&self, features: &[f64]) -> Result<f64, ScoringError> {
        if features.len() != self.coefficients.len() {
            return Err(ScoringError::DimensionMismatch {
                expected: self.coefficients.len(),
                got: features.len(),
            });
        }
        if let Some(pos) = features.iter().position(|x| !x.is_finite()) {
            return Err(ScoringError::NonFiniteInput(pos));
        }

        let value = self.intercept
            + features
                .iter()
                .zip(&self.coefficients)
                .map(|(x, w)| x * w)
                .sum::<f64>();

        if !value.is_finite() {
            return Err(ScoringError::NonFiniteOutput);
        }
        Ok(value)
    }

    fn model_version(&self) -> &str {
        &self.version
    }

    fn feature_names(&self) -> Option<&[String]> {
        Some(&self.features)
    }
}
