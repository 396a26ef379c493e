//! Event types: drafts emitted by deciders, validated events awaiting
//! append, and immutable stored events read back from the journal.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::command::ActorType;

/// Whether projections and replay must handle an event.
///
/// An unhandled `MustApply` event is a fatal apply error; `AuditOnly`
/// events are recorded in the journal but never projected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    #[default]
    MustApply,
    AuditOnly,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::MustApply => "must_apply",
            Intent::AuditOnly => "audit_only",
        }
    }
}

/// An event proposed by a decider, before validation.
///
/// Envelope fields (campaign, actor, correlation) are copied from the
/// command by the event validator; the decider only chooses the type,
/// the addressing, and the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDraft {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl EventDraft {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            entity_type: None,
            entity_id: None,
            payload,
        }
    }

    /// Address the event at a concrete entity.
    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Build a draft from any serializable payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if `payload` cannot be serialized.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }
}

/// An event that passed validation and is ready for the journal.
///
/// Produced only by [`Registry::validate_event`](crate::Registry::validate_event);
/// the journal assigns `seq` and the integrity fields on append.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub(crate) event_id: Uuid,
    pub(crate) event_type: String,
    pub(crate) occurred_at: DateTime<Utc>,
    pub(crate) intent: Intent,
    pub(crate) actor_type: ActorType,
    pub(crate) actor_id: Option<String>,
    pub(crate) session_id: Option<String>,
    pub(crate) request_id: Option<String>,
    pub(crate) invocation_id: Option<String>,
    pub(crate) entity_type: Option<String>,
    pub(crate) entity_id: Option<String>,
    pub(crate) owner_namespace_id: Option<String>,
    pub(crate) owner_namespace_version: Option<String>,
    pub(crate) correlation_id: Option<String>,
    pub(crate) causation_id: Option<String>,
    pub(crate) payload: Value,
}

impl PendingEvent {
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Stamp storage position; integrity fields are filled in by the journal.
    pub(crate) fn into_stored(self, campaign_id: &str, seq: u64) -> StoredEvent {
        StoredEvent {
            campaign_id: campaign_id.to_owned(),
            seq,
            event_id: self.event_id,
            event_type: self.event_type,
            occurred_at: self.occurred_at,
            intent: self.intent,
            actor_type: self.actor_type,
            actor_id: self.actor_id,
            session_id: self.session_id,
            request_id: self.request_id,
            invocation_id: self.invocation_id,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            owner_namespace_id: self.owner_namespace_id,
            owner_namespace_version: self.owner_namespace_version,
            correlation_id: self.correlation_id,
            causation_id: self.causation_id,
            payload: self.payload,
            hash: String::new(),
            prev_hash: String::new(),
            chain_hash: String::new(),
            signature: String::new(),
            signature_key_id: String::new(),
        }
    }
}

/// An immutable, accepted fact as persisted in a campaign journal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub campaign_id: String,
    /// Per-campaign position, contiguous from 1.
    pub seq: u64,
    pub event_id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub occurred_at: DateTime<Utc>,
    pub intent: Intent,
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_namespace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_namespace_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    pub payload: Value,
    /// SHA-256 over the canonical metadata and payload.
    pub hash: String,
    /// Chain hash of the preceding event, or the genesis value for seq 1.
    pub prev_hash: String,
    pub chain_hash: String,
    /// HMAC over `chain_hash` with the campaign key.
    pub signature: String,
    pub signature_key_id: String,
}

impl StoredEvent {
    /// Whether the event belongs to a plugin namespace rather than the core.
    pub fn is_plugin_owned(&self) -> bool {
        self.owner_namespace_id.is_some()
    }

    /// Deserialize the payload into a typed structure.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> serde_json::Result<P> {
        P::deserialize(&self.payload)
    }

    /// The hashed content of the event: every field except the integrity
    /// fields themselves.
    ///
    /// Timestamps are rendered with nanosecond precision so the value
    /// survives a serialize/deserialize cycle unchanged.
    pub(crate) fn content_value(&self) -> Value {
        json!({
            "campaign_id": self.campaign_id,
            "seq": self.seq,
            "event_id": self.event_id.to_string(),
            "type": self.event_type,
            "occurred_at": self.occurred_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
            "intent": self.intent.as_str(),
            "actor_type": self.actor_type.as_str(),
            "actor_id": self.actor_id,
            "session_id": self.session_id,
            "request_id": self.request_id,
            "invocation_id": self.invocation_id,
            "entity_type": self.entity_type,
            "entity_id": self.entity_id,
            "owner_namespace_id": self.owner_namespace_id,
            "owner_namespace_version": self.owner_namespace_version,
            "correlation_id": self.correlation_id,
            "causation_id": self.causation_id,
            "payload": self.payload,
        })
    }
}

#[cfg(test)]
pub(crate) fn stored_fixture(campaign_id: &str, seq: u64, event_type: &str, payload: Value) -> StoredEvent {
    PendingEvent {
        event_id: Uuid::new_v4(),
        event_type: event_type.to_owned(),
        occurred_at: Utc::now(),
        intent: Intent::MustApply,
        actor_type: ActorType::System,
        actor_id: None,
        session_id: None,
        request_id: None,
        invocation_id: None,
        entity_type: None,
        entity_id: None,
        owner_namespace_id: None,
        owner_namespace_version: None,
        correlation_id: None,
        causation_id: None,
        payload,
    }
    .into_stored(campaign_id, seq)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn draft_builder_sets_addressing() {
        let draft = EventDraft::new("character.damaged", json!({"hp_after": 7}))
            .with_entity("character", "ch-1");
        assert_eq!(draft.entity_type.as_deref(), Some("character"));
        assert_eq!(draft.entity_id.as_deref(), Some("ch-1"));
    }

    #[test]
    fn draft_from_typed_payload() {
        #[derive(Serialize)]
        struct Note {
            text: &'static str,
        }
        let draft = EventDraft::from_payload("note.added", &Note { text: "hello" }).unwrap();
        assert_eq!(draft.payload, json!({"text": "hello"}));
    }

    #[test]
    fn intent_serializes_snake_case() {
        assert_eq!(serde_json::to_value(Intent::AuditOnly).unwrap(), json!("audit_only"));
        assert_eq!(serde_json::to_value(Intent::MustApply).unwrap(), json!("must_apply"));
    }

    #[test]
    fn content_value_excludes_integrity_fields() {
        let mut event = stored_fixture("c-1", 1, "note.added", json!({"text": "x"}));
        event.hash = "abc".into();
        event.signature = "sig".into();
        let content = event.content_value();
        assert!(content.get("hash").is_none());
        assert!(content.get("signature").is_none());
        assert_eq!(content["seq"], 1);
        assert_eq!(content["type"], "note.added");
    }

    #[test]
    fn content_value_survives_serde_roundtrip() {
        let event = stored_fixture("c-1", 3, "note.added", json!({"text": "x"}));
        let json = serde_json::to_string(&event).unwrap();
        let back: StoredEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.content_value(), event.content_value());
    }

    #[test]
    fn plugin_ownership_follows_namespace() {
        let mut event = stored_fixture("c-1", 1, "sys.dh.fear_gained", json!({}));
        assert!(!event.is_plugin_owned());
        event.owner_namespace_id = Some("daggerheart".into());
        assert!(event.is_plugin_owned());
    }
}
