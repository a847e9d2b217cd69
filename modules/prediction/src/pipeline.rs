use crate::classifier::EntityType;
use crate::scoring::ScoringFunction;
use std::collections::HashMap;
use std::sync::Arc;

/// Features of the default product demand forecast, in model order
pub const DEMAND_FORECAST_FEATURES: [&str; 5] = [
    "historical_demand_7d",
    "historical_demand_30d",
    "price",
    "day_of_week",
    "month",
];

pub const DEMAND_FORECAST: &str = "demand_forecast";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("pipeline for {entity_type} expects features {expected:?}, model was trained on {model:?}")]
    FeatureOrderMismatch {
        entity_type: EntityType,
        expected: Vec<String>,
        model: Vec<String>,
    },

    #[error("confidence must be within 0.0..=1.0, got {0}")]
    InvalidConfidence(f64),
}

/// How one entity type is turned into a prediction
pub struct PredictionPipeline {
    pub entity_type: EntityType,
    pub prediction_type: String,
    /// Ordered; the model receives values in exactly this order
    pub feature_names: Vec<String>,
    pub model: Arc<dyn ScoringFunction>,
    pub confidence: f64,
}

impl PredictionPipeline {
    pub fn new(
        entity_type: EntityType,
        prediction_type: impl Into<String>,
        feature_names: Vec<String>,
        model: Arc<dyn ScoringFunction>,
        confidence: f64,
    ) -> Result<Self, PipelineError> {
        if !(0.0..=1.0).contains(&confidence) {
            return Err(PipelineError::InvalidConfidence(confidence));
        }
        if let Some(trained) = model.feature_names() {
            if trained != feature_names.as_slice() {
                return Err(PipelineError::FeatureOrderMismatch {
                    entity_type,
                    expected: feature_names,
                    model: trained.to_vec(),
                });
            }
        }

        Ok(Self {
            entity_type,
            prediction_type: prediction_type.into(),
            feature_names,
            model,
            confidence,
        })
    }

    /// Order `features` for the model, or list the names that are missing
    pub fn feature_vector(&self, features: &HashMap<String, f64>) -> Result<Vec<f64>, Vec<String>> {
        let missing: Vec<String> = self
            .feature_names
            .iter()
            .filter(|name| !features.contains_key(*name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(missing);
        }

        Ok(self
            .feature_names
            .iter()
            .filter_map(|name| features.get(name).copied())
            .collect())
    }
}

impl std::fmt::Debug for PredictionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionPipeline")
            .field("entity_type", &self.entity_type)
            .field("prediction_type", &self.prediction_type)
            .field("feature_names", &self.feature_names)
            .field("model_version", &self.model.model_version())
            .field("confidence", &self.confidence)
            .finish()
    }
}

/// Pipelines by entity type; types without one are not actionable
#[derive(Debug, Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<EntityType, PredictionPipeline>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Product demand forecast only
    pub fn with_default(model: Arc<dyn ScoringFunction>, confidence: f64) -> Result<Self, PipelineError> {
        let pipeline = PredictionPipeline::new(
            EntityType::Product,
            DEMAND_FORECAST,
            DEMAND_FORECAST_FEATURES.iter().map(|s| s.to_string()).collect(),
            model,
            confidence,
        )?;

        let mut registry = Self::new();
        registry.register(pipeline);
        Ok(registry)
    }

    /// Replaces any pipeline already registered for the same entity type
    pub fn register(&mut self, pipeline: PredictionPipeline) {
        self.pipelines.insert(pipeline.entity_type, pipeline);
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&PredictionPipeline> {
        self.pipelines.get(&entity_type)
    }
}
