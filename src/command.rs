//! Command envelope: an intent to change one campaign's state.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who issued a command.
///
/// `Participant` and `Gm` are identified principals and must carry an
/// `actor_id`; `System` commands may omit it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorType {
    #[default]
    System,
    Participant,
    Gm,
}

impl ActorType {
    /// Whether this actor type names a concrete principal.
    pub fn requires_id(self) -> bool {
        matches!(self, ActorType::Participant | ActorType::Gm)
    }

    /// Stable lowercase name, matching the serialized form.
    pub fn as_str(self) -> &'static str {
        match self {
            ActorType::System => "system",
            ActorType::Participant => "participant",
            ActorType::Gm => "gm",
        }
    }
}

/// An intent envelope submitted to [`CampaignStore::execute`](crate::CampaignStore::execute).
///
/// Commands are transient: they are normalized, decided, and discarded.
/// Only the events a decider emits are persisted. `request_id` and
/// `invocation_id` are carried for traceability and never used as identity.
///
/// # Examples
///
/// ```
/// use campaign_es::{ActorType, Command};
/// use serde_json::json;
///
/// let cmd = Command::new("c-1", "character.damage", json!({"character_id": "ch-1", "amount": 3}))
///     .with_actor(ActorType::Gm, "gm-7")
///     .with_request_id("req-abc")
///     .with_entity("character", "ch-1");
///
/// assert_eq!(cmd.actor_id.as_deref(), Some("gm-7"));
/// assert_eq!(cmd.entity_id.as_deref(), Some("ch-1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Campaign the command is scoped to.
    pub campaign_id: String,
    /// Registered command type, e.g. `"character.damage"`.
    #[serde(rename = "type")]
    pub command_type: String,
    #[serde(default)]
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    /// Routing hint: the kind of entity the command targets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Owning plugin namespace. Present together with the version or not at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_namespace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_namespace_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

impl Command {
    /// Build a system command with no optional metadata set.
    pub fn new(
        campaign_id: impl Into<String>,
        command_type: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            command_type: command_type.into(),
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
    }

    /// Set the issuing actor.
    pub fn with_actor(mut self, actor_type: ActorType, actor_id: impl Into<String>) -> Self {
        self.actor_type = actor_type;
        self.actor_id = Some(actor_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_invocation_id(mut self, id: impl Into<String>) -> Self {
        self.invocation_id = Some(id.into());
        self
    }

    /// Set the routing hint for the targeted entity.
    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    /// Mark the command as owned by a plugin namespace.
    pub fn with_namespace(mut self, id: impl Into<String>, version: impl Into<String>) -> Self {
        self.owner_namespace_id = Some(id.into());
        self.owner_namespace_version = Some(version.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }

    /// Deserialize the payload into a typed structure.
    ///
    /// Deciders call this after validation has already checked the shape,
    /// so a failure here indicates a decider/validator mismatch.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `P`.
    pub fn payload_as<P: DeserializeOwned>(&self) -> serde_json::Result<P> {
        P::deserialize(&self.payload)
    }
}
