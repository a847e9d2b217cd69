//! # Event Envelopes
//!
//! The canonical envelope every source event is normalized into, and the
//! prediction envelope the enrichment stage derives from it.
//!
//! ## Design Principles
//!
//! 1. **Single Source of Truth**: one canonical shape for every source adapter
//! 2. **Validation**: invariants are checked before every publish and after every decode
//! 3. **Versioning**: `schema_version` allows payloads to evolve
//! 4. **Immutability**: fields are private; an envelope can be read but not changed
//!
//! ## Canonical Envelope Fields
//!
//! - `event_id`: deterministic UUIDv5 over `(source_system, source id)`
//! - `event_type`: open vocabulary tag (e.g. `SALE_ORDER_CREATED`)
//! - `entity_id`: business entity; also the publish key
//! - `timestamp`: event time (not ingestion time)
//! - `payload`: source-specific JSON object
//! - `source_system`: adapter that produced the event
//! - `schema_version`: payload schema version

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Schema version stamped on envelopes produced by this codec
pub const SCHEMA_VERSION: &str = "1.0";

/// Codec failures
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EnvelopeError {
    /// A source event could not be normalized; it is dropped and counted.
    #[error("malformed source event: {0}")]
    MalformedSourceEvent(String),

    /// An envelope breaks an invariant; it is quarantined, never retried.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),
}

/// Behaviour shared by every envelope that crosses the bus
pub trait Envelope: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Partition key used when publishing
    fn key(&self) -> &str;

    /// Check every invariant of the envelope
    fn validate(&self) -> Result<(), EnvelopeError>;

    /// Decode a consumed payload and validate it
    fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let envelope: Self = serde_json::from_slice(bytes)
            .map_err(|e| EnvelopeError::InvalidEnvelope(format!("undecodable envelope: {}", e)))?;
        envelope.validate()?;
        Ok(envelope)
    }
}

/// A record as returned by a source system, before normalization
///
/// Every field is optional so that a malformed record can still be read and
/// then rejected by [`normalize`] with a precise reason.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceEvent {
    #[serde(default, alias = "event_id")]
    pub id: Option<String>,

    #[serde(default, rename = "type", alias = "event_type")]
    pub event_type: Option<String>,

    #[serde(default)]
    pub entity_id: Option<String>,

    #[serde(default)]
    pub timestamp: Option<String>,

    #[serde(default)]
    pub data: Option<Value>,
}

impl SourceEvent {
    pub fn new(
        id: impl Into<String>,
        event_type: impl Into<String>,
        entity_id: impl Into<String>,
        timestamp: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Some(id.into()),
            event_type: Some(event_type.into()),
            entity_id: Some(entity_id.into()),
            timestamp: Some(timestamp.into()),
            data: Some(data),
        }
    }
}

/// Canonical event envelope
///
/// Constructed by [`normalize`] on the producer side, or decoded from the bus
/// on the consumer side. There are no setters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEnvelope {
    event_id: String,
    event_type: String,
    entity_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    payload: Map<String, Value>,
    source_system: String,
    #[serde(alias = "version")]
    schema_version: String,
}

impl CanonicalEnvelope {
    /// Build an envelope from already-extracted parts.
    ///
    /// No invariant is checked here; call [`Envelope::validate`] before
    /// handing the envelope to a publisher.
    pub fn new(
        event_id: String,
        event_type: String,
        entity_id: String,
        timestamp: DateTime<Utc>,
        payload: Map<String, Value>,
        source_system: String,
    ) -> Self {
        Self {
            event_id,
            event_type,
            entity_id,
            timestamp,
            payload,
            source_system,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn source_system(&self) -> &str {
        &self.source_system
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }
}

impl Envelope for CanonicalEnvelope {
    fn key(&self) -> &str {
        &self.entity_id
    }

    /// # Validation Rules
    ///
    /// - `event_id`, `event_type`, `entity_id`: non-empty
    /// - `source_system`, `schema_version`: non-empty
    /// - `timestamp`: guaranteed absolute by its type
    fn validate(&self) -> Result<(), EnvelopeError> {
        require_non_empty("event_id", &self.event_id)?;
        require_non_empty("event_type", &self.event_type)?;
        require_non_empty("entity_id", &self.entity_id)?;
        require_non_empty("source_system", &self.source_system)?;
        require_non_empty("schema_version", &self.schema_version)?;
        Ok(())
    }
}

/// Derived prediction, one per successful enrichment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionEnvelope {
    prediction_id: String,
    entity_type: String,
    entity_id: String,
    prediction_type: String,
    prediction_value: f64,
    confidence: f64,
    model_version: String,
    timestamp: DateTime<Utc>,
}

impl PredictionEnvelope {
    /// Build a prediction for the entity of `source`.
    ///
    /// The id and timestamp come from the source envelope, so scoring the
    /// same input twice yields the same `prediction_id`.
    pub fn for_source(
        source: &CanonicalEnvelope,
        entity_type: impl Into<String>,
        prediction_type: impl Into<String>,
        prediction_value: f64,
        confidence: f64,
        model_version: impl Into<String>,
    ) -> Self {
        Self {
            prediction_id: prediction_id(source.entity_id(), source.timestamp()),
            entity_type: entity_type.into(),
            entity_id: source.entity_id().to_string(),
            prediction_type: prediction_type.into(),
            prediction_value,
            confidence,
            model_version: model_version.into(),
            timestamp: source.timestamp(),
        }
    }

    pub fn prediction_id(&self) -> &str {
        &self.prediction_id
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn prediction_type(&self) -> &str {
        &self.prediction_type
    }

    pub fn prediction_value(&self) -> f64 {
        self.prediction_value
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    pub fn model_version(&self) -> &str {
        &self.model_version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Envelope for PredictionEnvelope {
    fn key(&self) -> &str {
        &self.entity_id
    }

    fn validate(&self) -> Result<(), EnvelopeError> {
        require_non_empty("prediction_id", &self.prediction_id)?;
        require_non_empty("entity_type", &self.entity_type)?;
        require_non_empty("entity_id", &self.entity_id)?;
        require_non_empty("prediction_type", &self.prediction_type)?;
        require_non_empty("model_version", &self.model_version)?;

        if !self.prediction_value.is_finite() {
            return Err(EnvelopeError::InvalidEnvelope(format!(
                "prediction_value must be finite, got {}",
                self.prediction_value
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(EnvelopeError::InvalidEnvelope(format!(
                "confidence must be within 0.0..=1.0, got {}",
                self.confidence
            )));
        }
        Ok(())
    }
}

/// `pred_{entity_id}_{timestamp}`, timestamp in RFC 3339 with a `Z` suffix
pub fn prediction_id(entity_id: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "pred_{}_{}",
        entity_id,
        timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    )
}

/// Normalize a source-native event into the canonical envelope
///
/// Fails with [`EnvelopeError::MalformedSourceEvent`] when the id, type,
/// entity reference or timestamp is missing, blank or unparsable, or when
/// `data` is present but not a JSON object. A missing `data` becomes an empty
/// payload.
pub fn normalize(
    event: &SourceEvent,
    source_system: &str,
) -> Result<CanonicalEnvelope, EnvelopeError> {
    let source_id = required_field("id", event.id.as_deref())?;
    let event_type = required_field("type", event.event_type.as_deref())?;
    let entity_id = required_field("entity_id", event.entity_id.as_deref())?;
    let raw_timestamp = required_field("timestamp", event.timestamp.as_deref())?;

    let timestamp = DateTime::parse_from_rfc3339(raw_timestamp)
        .map_err(|_| {
            EnvelopeError::MalformedSourceEvent(format!(
                "timestamp must be RFC 3339, got '{}'",
                raw_timestamp
            ))
        })?
        .with_timezone(&Utc);

    let payload = match &event.data {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => {
            return Err(EnvelopeError::MalformedSourceEvent(
                "data must be an object".to_string(),
            ))
        }
    };

    Ok(CanonicalEnvelope::new(
        derive_event_id(source_system, source_id),
        event_type.to_string(),
        entity_id.to_string(),
        timestamp,
        payload,
        source_system.to_string(),
    ))
}

fn derive_event_id(source_system: &str, source_id: &str) -> String {
    let name = format!("{}:{}", source_system, source_id);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

fn required_field<'a>(name: &str, value: Option<&'a str>) -> Result<&'a str, EnvelopeError> {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        Some(_) => Err(EnvelopeError::MalformedSourceEvent(format!(
            "{} must be non-empty",
            name
        ))),
        None => Err(EnvelopeError::MalformedSourceEvent(format!(
            "missing required field: {}",
            name
        ))),
    }
}

fn require_non_empty(name: &str, value: &str) -> Result<(), EnvelopeError> {
    if value.trim().is_empty() {
        return Err(EnvelopeError::InvalidEnvelope(format!(
            "{} cannot be empty",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inventory_event() -> SourceEvent {
        SourceEvent::new(
            "e1",
            "INVENTORY_UPDATED",
            "PROD-001",
            "2024-01-15T10:35:00Z",
            json!({"warehouse": "WH-01", "new_quantity": 48}),
        )
    }

    #[test]
    fn test_normalize_valid_event() {
        let envelope = normalize(&inventory_event(), "jde_erp").unwrap();

        assert_eq!(envelope.event_type(), "INVENTORY_UPDATED");
        assert_eq!(envelope.entity_id(), "PROD-001");
        assert_eq!(envelope.key(), "PROD-001");
        assert_eq!(envelope.source_system(), "jde_erp");
        assert_eq!(envelope.schema_version(), SCHEMA_VERSION);
        assert_eq!(envelope.payload()["warehouse"], "WH-01");
        assert_eq!(
            envelope.timestamp().to_rfc3339_opts(SecondsFormat::AutoSi, true),
            "2024-01-15T10:35:00Z"
        );
        assert!(envelope.validate().is_ok());
    }

    #[test]
    fn test_event_id_is_deterministic_per_source() {
        let a = normalize(&inventory_event(), "jde_erp").unwrap();
        let b = normalize(&inventory_event(), "jde_erp").unwrap();
        let other_source = normalize(&inventory_event(), "weather").unwrap();

        assert_eq!(a.event_id(), b.event_id());
        assert_ne!(a.event_id(), other_source.event_id());
        assert!(Uuid::parse_str(a.event_id()).is_ok());
    }

    #[test]
    fn test_normalize_missing_entity_reference() {
        let mut event = inventory_event();
        event.entity_id = None;

        assert_eq!(
            normalize(&event, "jde_erp").unwrap_err(),
            EnvelopeError::MalformedSourceEvent("missing required field: entity_id".to_string())
        );
    }

    #[test]
    fn test_normalize_missing_timestamp() {
        let mut event = inventory_event();
        event.timestamp = None;

        assert!(matches!(
            normalize(&event, "jde_erp"),
            Err(EnvelopeError::MalformedSourceEvent(_))
        ));
    }

    #[test]
    fn test_normalize_unparsable_timestamp() {
        let mut event = inventory_event();
        event.timestamp = Some("yesterday".to_string());

        let err = normalize(&event, "jde_erp").unwrap_err();
        assert!(err.to_string().contains("RFC 3339"));
    }

    #[test]
    fn test_normalize_blank_id() {
        let mut event = inventory_event();
        event.id = Some("   ".to_string());

        assert_eq!(
            normalize(&event, "jde_erp").unwrap_err(),
            EnvelopeError::MalformedSourceEvent("id must be non-empty".to_string())
        );
    }

    #[test]
    fn test_normalize_non_object_data() {
        let mut event = inventory_event();
        event.data = Some(json!([1, 2, 3]));

        assert!(normalize(&event, "jde_erp").is_err());
    }

    #[test]
    fn test_normalize_missing_data_yields_empty_payload() {
        let mut event = inventory_event();
        event.data = None;

        let envelope = normalize(&event, "jde_erp").unwrap();
        assert!(envelope.payload().is_empty());
    }

    #[test]
    fn test_source_event_reads_erp_wire_shape() {
        let raw = json!({
            "id": "event_001",
            "type": "SALE_ORDER_CREATED",
            "entity_id": "SO-2024-001",
            "timestamp": "2024-01-15T10:30:00Z",
            "data": {"order_number": "SO-2024-001", "total_amount": 1500.00}
        });

        let event: SourceEvent = serde_json::from_value(raw).unwrap();
        assert_eq!(event.id.as_deref(), Some("event_001"));
        assert_eq!(event.event_type.as_deref(), Some("SALE_ORDER_CREATED"));
        assert!(normalize(&event, "jde_erp").is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_entity_id() {
        let envelope = CanonicalEnvelope::new(
            "id-1".to_string(),
            "INVENTORY_UPDATED".to_string(),
            " ".to_string(),
            Utc::now(),
            Map::new(),
            "jde_erp".to_string(),
        );

        assert_eq!(
            envelope.validate().unwrap_err(),
            EnvelopeError::InvalidEnvelope("entity_id cannot be empty".to_string())
        );
    }

    #[test]
    fn test_decode_wire_envelope() {
        let wire = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "INVENTORY_UPDATED",
            "entity_id": "PROD-001",
            "timestamp": "2024-01-15T10:35:00Z",
            "payload": {"warehouse": "WH-01"},
            "source_system": "jde_erp",
            "version": "1.0"
        });

        let envelope = CanonicalEnvelope::decode(&serde_json::to_vec(&wire).unwrap()).unwrap();
        assert_eq!(envelope.schema_version(), "1.0");
        assert_eq!(envelope.entity_id(), "PROD-001");
    }

    #[test]
    fn test_decode_rejects_bad_timestamp() {
        let wire = json!({
            "event_id": "550e8400-e29b-41d4-a716-446655440000",
            "event_type": "INVENTORY_UPDATED",
            "entity_id": "PROD-001",
            "timestamp": "not-a-timestamp",
            "payload": {},
            "source_system": "jde_erp",
            "schema_version": "1.0"
        });

        let err = CanonicalEnvelope::decode(&serde_json::to_vec(&wire).unwrap()).unwrap_err();
        assert!(matches!(err, EnvelopeError::InvalidEnvelope(_)));
    }

    #[test]
    fn test_decode_rejects_empty_event_id() {
        let wire = json!({
            "event_id": "",
            "event_type": "INVENTORY_UPDATED",
            "entity_id": "PROD-001",
            "timestamp": "2024-01-15T10:35:00Z",
            "payload": {},
            "source_system": "jde_erp",
            "schema_version": "1.0"
        });

        assert!(CanonicalEnvelope::decode(&serde_json::to_vec(&wire).unwrap()).is_err());
    }

    #[test]
    fn test_prediction_id_is_deterministic() {
        let source = normalize(&inventory_event(), "jde_erp").unwrap();
        let first = PredictionEnvelope::for_source(&source, "product", "demand_forecast", 13.2, 0.85, "1.0");
        let second = PredictionEnvelope::for_source(&source, "product", "demand_forecast", 14.0, 0.85, "1.0");

        assert_eq!(first.prediction_id(), "pred_PROD-001_2024-01-15T10:35:00Z");
        assert_eq!(first.prediction_id(), second.prediction_id());
        assert_eq!(first.timestamp(), source.timestamp());
        assert!(first.validate().is_ok());
    }

    #[test]
    fn test_prediction_confidence_out_of_range() {
        let source = normalize(&inventory_event(), "jde_erp").unwrap();
        let prediction = PredictionEnvelope::for_source(&source, "product", "demand_forecast", 1.0, 1.5, "1.0");

        assert!(matches!(
            prediction.validate(),
            Err(EnvelopeError::InvalidEnvelope(_))
        ));
    }

    #[test]
    fn test_prediction_value_must_be_finite() {
        let source = normalize(&inventory_event(), "jde_erp").unwrap();
        let prediction =
            PredictionEnvelope::for_source(&source, "product", "demand_forecast", f64::NAN, 0.5, "1.0");

        assert!(prediction.validate().is_err());
    }

    mod properties {
        use super::*;
        use chrono::TimeZone;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn normalized_events_always_validate(
                id in "[A-Za-z0-9_-]{1,24}",
                event_type in "[A-Z_]{1,32}",
                entity_id in "[A-Z0-9-]{1,16}",
                secs in 0i64..4_102_444_800,
                qty in any::<i32>(),
            ) {
                let timestamp = Utc.timestamp_opt(secs, 0).unwrap().to_rfc3339();
                let event = SourceEvent::new(id, event_type, entity_id.clone(), timestamp, json!({"qty": qty}));

                let envelope = normalize(&event, "jde_erp").unwrap();
                prop_assert!(envelope.validate().is_ok());
                prop_assert_eq!(envelope.entity_id(), entity_id.as_str());
                prop_assert_eq!(envelope.timestamp().timestamp(), secs);

                let again = normalize(&event, "jde_erp").unwrap();
                prop_assert_eq!(envelope.event_id(), again.event_id());
            }

            #[test]
            fn blank_entity_reference_is_malformed(padding in " {0,8}") {
                let mut event = inventory_event();
                event.entity_id = Some(padding);

                prop_assert!(matches!(
                    normalize(&event, "jde_erp"),
                    Err(EnvelopeError::MalformedSourceEvent(_))
                ));
            }
        }
    }
}
