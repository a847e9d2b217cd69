//! Entity classification from the open `event_type` vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Product,
    Order,
    Customer,
    Supplier,
    Unknown,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Product => "product",
            EntityType::Order => "order",
            EntityType::Customer => "customer",
            EntityType::Supplier => "supplier",
            EntityType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered, case-sensitive substring rules; the first rule found in the
/// event type wins
#[derive(Debug, Clone)]
pub struct EntityClassifier {
    rules: Vec<(String, EntityType)>,
}

impl Default for EntityClassifier {
    fn default() -> Self {
        Self::new(vec![
            ("INVENTORY".to_string(), EntityType::Product),
            ("SALE".to_string(), EntityType::Order),
            ("CUSTOMER".to_string(), EntityType::Customer),
            ("SUPPLIER".to_string(), EntityType::Supplier),
        ])
    }
}

impl EntityClassifier {
    pub fn new(rules: Vec<(String, EntityType)>) -> Self {
        Self { rules }
    }

    pub fn classify(&self, event_type: &str) -> EntityType {
        self.rules
            .iter()
            .find(|(needle, _)| event_type.contains(needle.as_str()))
            .map(|(_, entity_type)| *entity_type)
            .unwrap_or(EntityType::Unknown)
    }
}
