//! Feature store clients
//!
//! The store itself is an external service; this module only knows how to
//! ask it for the latest values of named features for one entity.

use crate::classifier::EntityType;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FeatureStoreError {
    #[error("no features for {entity_type} {entity_id}")]
    NotFound {
        entity_type: EntityType,
        entity_id: String,
    },

    #[error("feature store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid feature store response: {0}")]
    InvalidResponse(String),
}

impl FeatureStoreError {
    /// Worth retrying against the same store
    pub fn is_transient(&self) -> bool {
        matches!(self, FeatureStoreError::Unavailable(_))
    }
}

#[async_trait]
pub trait FeatureStore: Send + Sync {
    /// Latest values of `feature_names` for one entity.
    ///
    /// Features the store has no value for are absent from the map. An entity
    /// with no value at all is `NotFound`.
    async fn get_features(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        feature_names: &[String],
    ) -> Result<HashMap<String, f64>, FeatureStoreError>;
}

/// Feature store backed by a map; for tests and local runs
#[derive(Debug, Default)]
pub struct InMemoryFeatureStore {
    rows: RwLock<HashMap<(EntityType, String), HashMap<String, f64>>>,
}

impl InMemoryFeatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `features` into the row of one entity
    pub fn insert<I, K>(&self, entity_type: EntityType, entity_id: &str, features: I)
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        let mut rows = self.rows.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        let row = rows
            .entry((entity_type, entity_id.to_string()))
            .or_default();
        row.extend(features.into_iter().map(|(k, v)| (k.into(), v)));
    }
}

#[async_trait]
impl FeatureStore for InMemoryFeatureStore {
    async fn get_features(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        feature_names: &[String],
    ) -> Result<HashMap<String, f64>, FeatureStoreError> {
        let rows = self.rows.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        let found: HashMap<String, f64> = rows
            .get(&(entity_type, entity_id.to_string()))
            .map(|row| {
                feature_names
                    .iter()
                    .filter_map(|name| row.get(name).map(|v| (name.clone(), *v)))
                    .collect()
            })
            .unwrap_or_default();

        if found.is_empty() {
            return Err(FeatureStoreError::NotFound {
                entity_type,
                entity_id: entity_id.to_string(),
            });
        }
        Ok(found)
    }
}

/// Feature view and join key serving one entity type
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureView {
    pub name: String,
    pub join_key: String,
}

impl FeatureView {
    fn new(name: &str, join_key: &str) -> Self {
        Self {
            name: name.to_string(),
            join_key: join_key.to_string(),
        }
    }
}

/// Default views of the online store
pub fn default_feature_views() -> HashMap<EntityType, FeatureView> {
    HashMap::from([
        (
            EntityType::Product,
            FeatureView::new("product_demand_features", "product_id"),
        ),
        (
            EntityType::Customer,
            FeatureView::new("customer_behavior_features", "customer_id"),
        ),
        (
            EntityType::Supplier,
            FeatureView::new("supplier_performance_features", "supplier_id"),
        ),
    ])
}

#[derive(Deserialize)]
struct OnlineFeaturesResponse {
    metadata: OnlineFeaturesMetadata,
    results: Vec<FeatureResult>,
}

#[derive(Deserialize)]
struct OnlineFeaturesMetadata {
    feature_names: Vec<String>,
}

#[derive(Deserialize)]
struct FeatureResult {
    values: Vec<Value>,
    #[serde(default)]
    statuses: Vec<String>,
}

/// Client of a Feast feature server (`POST /get-online-features`)
pub struct FeastFeatureStore {
    client: reqwest::Client,
    base_url: String,
    views: HashMap<EntityType, FeatureView>,
}

impl FeastFeatureStore {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self::with_views(client, base_url, default_feature_views())
    }

    pub fn with_views(
        client: reqwest::Client,
        base_url: impl Into<String>,
        views: HashMap<EntityType, FeatureView>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            views,
        }
    }
}

#[async_trait]
impl FeatureStore for FeastFeatureStore {
    async fn get_features(
        &self,
        entity_type: EntityType,
        entity_id: &str,
        feature_names: &[String],
    ) -> Result<HashMap<String, f64>, FeatureStoreError> {
        let view = self.views.get(&entity_type).ok_or_else(|| FeatureStoreError::NotFound {
            entity_type,
            entity_id: entity_id.to_string(),
        })?;

        let refs: Vec<String> = feature_names
            .iter()
            .map(|name| format!("{}:{}", view.name, name))
            .collect();
        let mut entities = Map::new();
        entities.insert(view.join_key.clone(), json!([entity_id]));
        let body = json!({ "features": refs, "entities": entities });

        let response = self
            .client
            .post(format!("{}/get-online-features", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| FeatureStoreError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FeatureStoreError::Unavailable(format!("HTTP {}", status)));
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FeatureStoreError::NotFound {
                entity_type,
                entity_id: entity_id.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FeatureStoreError::InvalidResponse(format!("HTTP {}", status)));
        }

        let parsed: OnlineFeaturesResponse = response
            .json()
            .await
            .map_err(|e| FeatureStoreError::InvalidResponse(e.to_string()))?;

        let found = extract_features(parsed, &view.join_key, feature_names)?;
        if found.is_empty() {
            return Err(FeatureStoreError::NotFound {
                entity_type,
                entity_id: entity_id.to_string(),
            });
        }

        tracing::debug!(
            entity_type = %entity_type,
            entity_id = %entity_id,
            requested = feature_names.len(),
            found = found.len(),
            "Online features fetched"
        );
        Ok(found)
    }
}

/// Pair column names with their first row, keeping present numeric values
fn extract_features(
    response: OnlineFeaturesResponse,
    join_key: &str,
    requested: &[String],
) -> Result<HashMap<String, f64>, FeatureStoreError> {
    let names = response.metadata.feature_names;
    if names.len() != response.results.len() {
        return Err(FeatureStoreError::InvalidResponse(format!(
            "{} feature names but {} result columns",
            names.len(),
            response.results.len()
        )));
    }

    let mut found = HashMap::new();
    for (name, column) in names.iter().zip(response.results) {
        // Feature references may come back as `view:name` or `view__name`
        let short = name
            .rsplit_once(':')
            .map(|(_, n)| n)
            .or_else(|| name.split_once("__").map(|(_, n)| n))
            .unwrap_or(name);
        if short == join_key || !requested.iter().any(|r| r == short) {
            continue;
        }

        let present = column
            .statuses
            .first()
            .map_or(true, |status| status == "PRESENT");
        let value = column.values.first().and_then(Value::as_f64);
        if let (true, Some(value)) = (present, value) {
            found.insert(short.to_string(), value);
        }
    }
    Ok(found)
}
