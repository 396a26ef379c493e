//! Immutable command/event registry and the validators built on it.
//!
//! The registry is the typed dispatch table for the write path. Each
//! command type maps to exactly one decider, and each event type maps to
//! its owner, intent, payload validator and optional aggregate fold. It is
//! assembled once at startup with [`RegistryBuilder`] and shared read-only
//! by the store.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use uuid::Uuid;

use crate::canonical::canonicalize;
use crate::command::Command;
use crate::decision::Decision;
use crate::error::{HandlerError, LoadError, RegistryError, ValidationError};
use crate::event::{EventDraft, Intent, PendingEvent, StoredEvent};
use crate::storage::check_campaign_id;

/// Checks the shape of a canonicalized payload.
pub type PayloadValidator = fn(&Value) -> Result<(), String>;

/// Pure decision function: `(state, command, now) -> Decision`.
pub type DecideFn<S> = fn(&S, &Command, DateTime<Utc>) -> Decision;

/// Folds one stored event into decision-time state.
pub type FoldFn<S> = fn(&mut S, &StoredEvent) -> Result<(), HandlerError>;

/// Payload validator that accepts any payload deserializable as `P`.
///
/// # Examples
///
/// ```
/// use campaign_es::validate_as;
/// use serde::Deserialize;
/// use serde_json::json;
///
/// #[derive(Deserialize)]
/// struct Damage { amount: u32 }
///
/// assert!(validate_as::<Damage>(&json!({"amount": 3})).is_ok());
/// assert!(validate_as::<Damage>(&json!({"amount": "three"})).is_err());
/// ```
pub fn validate_as<P: DeserializeOwned>(payload: &Value) -> Result<(), String> {
    P::deserialize(payload).map(|_| ()).map_err(|e| e.to_string())
}

/// A plugin namespace: id plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub id: String,
    pub version: String,
}

impl Namespace {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Who owns a command or event type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    Core,
    Plugin(Namespace),
}

impl Owner {
    pub fn namespace(&self) -> Option<&Namespace> {
        match self {
            Owner::Core => None,
            Owner::Plugin(ns) => Some(ns),
        }
    }
}

/// Whether a core event must name the entity it targets.
///
/// Plugin events always require addressing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Addressing {
    #[default]
    Optional,
    Required,
}

/// Registration entry for one command type.
pub struct CommandDefinition<S> {
    command_type: String,
    owner: Owner,
    decide: DecideFn<S>,
    validate: Option<PayloadValidator>,
}

impl<S> CommandDefinition<S> {
    /// A core-owned command.
    pub fn core(command_type: impl Into<String>, decide: DecideFn<S>) -> Self {
        Self {
            command_type: command_type.into(),
            owner: Owner::Core,
            decide,
            validate: None,
        }
    }

    /// A command owned by a plugin namespace.
    pub fn plugin(namespace: Namespace, command_type: impl Into<String>, decide: DecideFn<S>) -> Self {
        Self {
            command_type: command_type.into(),
            owner: Owner::Plugin(namespace),
            decide,
            validate: None,
        }
    }

    /// Validate payloads by deserializing them as `P`.
    pub fn payload<P: DeserializeOwned>(self) -> Self {
        self.validate_with(validate_as::<P>)
    }

    pub fn validate_with(mut self, validator: PayloadValidator) -> Self {
        self.validate = Some(validator);
        self
    }

    pub fn command_type(&self) -> &str {
        &self.command_type
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }
}

/// Registration entry for one event type.
pub struct EventDefinition<S> {
    event_type: String,
    owner: Owner,
    intent: Intent,
    addressing: Addressing,
    validate: Option<PayloadValidator>,
    fold: Option<FoldFn<S>>,
}

impl<S> EventDefinition<S> {
    /// A core-owned, must-apply event.
    pub fn core(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            owner: Owner::Core,
            intent: Intent::MustApply,
            addressing: Addressing::Optional,
            validate: None,
            fold: None,
        }
    }

    /// A plugin-owned, must-apply event. Always requires entity addressing.
    pub fn plugin(namespace: Namespace, event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            owner: Owner::Plugin(namespace),
            intent: Intent::MustApply,
            addressing: Addressing::Required,
            validate: None,
            fold: None,
        }
    }

    /// Mark the event as journal-only: never projected.
    pub fn audit_only(mut self) -> Self {
        self.intent = Intent::AuditOnly;
        self
    }

    /// Require `entity_type` and `entity_id` on every instance.
    pub fn require_entity(mut self) -> Self {
        self.addressing = Addressing::Required;
        self
    }

    pub fn payload<P: DeserializeOwned>(self) -> Self {
        self.validate_with(validate_as::<P>)
    }

    pub fn validate_with(mut self, validator: PayloadValidator) -> Self {
        self.validate = Some(validator);
        self
    }

    /// Fold function applied when rebuilding decision-time state.
    ///
    /// Events without a fold leave aggregate state unchanged.
    pub fn fold(mut self, fold: FoldFn<S>) -> Self {
        self.fold = Some(fold);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn owner(&self) -> &Owner {
        &self.owner
    }

    pub fn intent(&self) -> Intent {
        self.intent
    }
}

/// Collects definitions and builds an immutable [`Registry`].
pub struct RegistryBuilder<S> {
    commands: Vec<CommandDefinition<S>>,
    events: Vec<EventDefinition<S>>,
}

impl<S> Default for RegistryBuilder<S> {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            events: Vec::new(),
        }
    }
}

impl<S> RegistryBuilder<S> {
    pub fn command(mut self, definition: CommandDefinition<S>) -> Self {
        self.commands.push(definition);
        self
    }

    pub fn event(mut self, definition: EventDefinition<S>) -> Self {
        self.events.push(definition);
        self
    }

    /// Freeze the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] for empty or duplicate type names, a
    /// plugin namespace with an empty id or version, or one namespace id
    /// registered at two versions.
    pub fn build(self) -> Result<Registry<S>, RegistryError> {
        let mut versions: HashMap<String, String> = HashMap::new();
        let mut commands = HashMap::with_capacity(self.commands.len());
        for def in self.commands {
            check_definition(&def.command_type, &def.owner)?;
            check_version(&mut versions, &def.owner)?;
            if commands.contains_key(&def.command_type) {
                return Err(RegistryError::DuplicateCommand(def.command_type));
            }
            commands.insert(def.command_type.clone(), def);
        }

        let mut events = HashMap::with_capacity(self.events.len());
        for def in self.events {
            check_definition(&def.event_type, &def.owner)?;
            check_version(&mut versions, &def.owner)?;
            if events.contains_key(&def.event_type) {
                return Err(RegistryError::DuplicateEvent(def.event_type));
            }
            events.insert(def.event_type.clone(), def);
        }

        Ok(Registry { commands, events })
    }
}

/// One namespace id maps to one version across the whole registry.
fn check_version(versions: &mut HashMap<String, String>, owner: &Owner) -> Result<(), RegistryError> {
    let Owner::Plugin(ns) = owner else {
        return Ok(());
    };
    match versions.get(&ns.id) {
        Some(seen) if *seen != ns.version => Err(RegistryError::NamespaceVersionConflict {
            namespace: ns.id.clone(),
            first: seen.clone(),
            second: ns.version.clone(),
        }),
        Some(_) => Ok(()),
        None => {
            versions.insert(ns.id.clone(), ns.version.clone());
            Ok(())
        }
    }
}

fn check_definition(type_name: &str, owner: &Owner) -> Result<(), RegistryError> {
    if type_name.trim().is_empty() || type_name.trim() != type_name {
        return Err(RegistryError::EmptyType);
    }
    if let Owner::Plugin(ns) = owner
        && (ns.id.trim().is_empty() || ns.version.trim().is_empty())
    {
        return Err(RegistryError::EmptyType);
    }
    Ok(())
}

/// Immutable dispatch table for commands and events.
///
/// Generic over `S`, the decision-time aggregate state every decider and
/// fold operates on.
pub struct Registry<S> {
    commands: HashMap<String, CommandDefinition<S>>,
    events: HashMap<String, EventDefinition<S>>,
}

impl<S> std::fmt::Debug for Registry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut commands: Vec<_> = self.commands.keys().collect();
        commands.sort();
        let mut events: Vec<_> = self.events.keys().collect();
        events.sort();
        f.debug_struct("Registry")
            .field("commands", &commands)
            .field("events", &events)
            .finish()
    }
}

impl<S> Registry<S> {
    pub fn builder() -> RegistryBuilder<S> {
        RegistryBuilder::default()
    }

    pub fn command(&self, command_type: &str) -> Option<&CommandDefinition<S>> {
        self.commands.get(command_type)
    }

    pub fn event(&self, event_type: &str) -> Option<&EventDefinition<S>> {
        self.events.get(event_type)
    }

    /// All registered event definitions, in no particular order.
    pub fn events(&self) -> impl Iterator<Item = &EventDefinition<S>> {
        self.events.values()
    }

    /// Normalize and validate an incoming command envelope.
    ///
    /// Trims metadata, drops empty optional fields, enforces the actor and
    /// namespace rules, canonicalizes the payload, and runs the type's
    /// payload validator.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidCommand`] naming the first violation.
    pub fn validate_command(&self, mut cmd: Command) -> Result<Command, ValidationError> {
        cmd.command_type = cmd.command_type.trim().to_owned();
        let ty = cmd.command_type.clone();
        if ty.is_empty() {
            return Err(ValidationError::command(&ty, "type is required"));
        }

        cmd.campaign_id = cmd.campaign_id.trim().to_owned();
        check_campaign_id(&cmd.campaign_id).map_err(|reason| ValidationError::command(&ty, reason))?;

        let def = self
            .commands
            .get(&ty)
            .ok_or_else(|| ValidationError::command(&ty, "type is not registered"))?;

        normalize_opt(&mut cmd.actor_id);
        normalize_opt(&mut cmd.session_id);
        normalize_opt(&mut cmd.request_id);
        normalize_opt(&mut cmd.invocation_id);
        normalize_opt(&mut cmd.entity_type);
        normalize_opt(&mut cmd.entity_id);
        normalize_opt(&mut cmd.owner_namespace_id);
        normalize_opt(&mut cmd.owner_namespace_version);
        normalize_opt(&mut cmd.correlation_id);
        normalize_opt(&mut cmd.causation_id);

        if cmd.actor_type.requires_id() && cmd.actor_id.is_none() {
            return Err(ValidationError::command(
                &ty,
                format!("actor_id is required for actor type {}", cmd.actor_type.as_str()),
            ));
        }

        if cmd.entity_id.is_some() && cmd.entity_type.is_none() {
            return Err(ValidationError::command(&ty, "entity_id requires entity_type"));
        }

        match (&cmd.owner_namespace_id, &cmd.owner_namespace_version) {
            (Some(_), None) | (None, Some(_)) => {
                return Err(ValidationError::command(
                    &ty,
                    "owner_namespace_id and owner_namespace_version must be set together",
                ));
            }
            _ => {}
        }

        match &def.owner {
            Owner::Core => {
                if cmd.owner_namespace_id.is_some() {
                    return Err(ValidationError::command(
                        &ty,
                        "core command must not carry a plugin namespace",
                    ));
                }
            }
            Owner::Plugin(ns) => {
                let matches = cmd.owner_namespace_id.as_deref() == Some(ns.id.as_str())
                    && cmd.owner_namespace_version.as_deref() == Some(ns.version.as_str());
                if !matches {
                    return Err(ValidationError::command(
                        &ty,
                        format!("plugin command requires namespace {}@{}", ns.id, ns.version),
                    ));
                }
            }
        }

        cmd.payload =
            normalize_payload(std::mem::take(&mut cmd.payload)).map_err(|r| ValidationError::command(&ty, r))?;
        if let Some(validate) = def.validate {
            validate(&cmd.payload).map_err(|r| ValidationError::command(&ty, r))?;
        }

        Ok(cmd)
    }

    /// Route a validated command to its decider.
    pub fn decide(&self, state: &S, cmd: &Command, now: DateTime<Utc>) -> Decision {
        match self.commands.get(&cmd.command_type) {
            Some(def) => (def.decide)(state, cmd, now),
            None => Decision::reject(
                "COMMAND_NOT_REGISTERED",
                format!("no decider for {}", cmd.command_type),
            ),
        }
    }

    /// Validate one event a decider emitted for `cmd`.
    ///
    /// Copies the envelope from the command, stamps the registered owner
    /// and intent, and enforces that core commands only emit core events
    /// and plugin commands only emit events of their own namespace.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidEvent`] or
    /// [`ValidationError::OwnershipMismatch`].
    pub fn validate_event(
        &self,
        cmd: &Command,
        mut draft: EventDraft,
        now: DateTime<Utc>,
    ) -> Result<PendingEvent, ValidationError> {
        draft.event_type = draft.event_type.trim().to_owned();
        let ty = draft.event_type.clone();
        let def = self
            .events
            .get(&ty)
            .ok_or_else(|| ValidationError::event(&ty, "type is not registered"))?;

        let command_owner = self
            .commands
            .get(&cmd.command_type)
            .map(|c| &c.owner)
            .ok_or_else(|| ValidationError::event(&ty, "emitting command is not registered"))?;
        match (command_owner, &def.owner) {
            (Owner::Core, Owner::Core) => {}
            (Owner::Plugin(a), Owner::Plugin(b)) if a == b => {}
            (Owner::Core, Owner::Plugin(ns)) => {
                return Err(ValidationError::OwnershipMismatch {
                    event_type: ty,
                    reason: format!("core command emitted event owned by plugin {}", ns.id),
                });
            }
            (Owner::Plugin(ns), Owner::Core) => {
                return Err(ValidationError::OwnershipMismatch {
                    event_type: ty,
                    reason: format!("plugin {} emitted a core event", ns.id),
                });
            }
            (Owner::Plugin(a), Owner::Plugin(b)) => {
                return Err(ValidationError::OwnershipMismatch {
                    event_type: ty,
                    reason: format!("plugin {a} emitted event owned by plugin {b}"),
                });
            }
        }

        normalize_opt(&mut draft.entity_type);
        normalize_opt(&mut draft.entity_id);
        if draft.entity_type.is_some() != draft.entity_id.is_some() {
            return Err(ValidationError::event(
                &ty,
                "entity_type and entity_id must be set together",
            ));
        }
        let requires_entity = def.addressing == Addressing::Required || def.owner != Owner::Core;
        if requires_entity && draft.entity_id.is_none() {
            return Err(ValidationError::event(&ty, "entity_type and entity_id are required"));
        }

        let payload = normalize_payload(draft.payload).map_err(|r| ValidationError::event(&ty, r))?;
        if let Some(validate) = def.validate {
            validate(&payload).map_err(|r| ValidationError::event(&ty, r))?;
        }

        let namespace = def.owner.namespace();
        Ok(PendingEvent {
            event_id: Uuid::new_v4(),
            event_type: ty,
            occurred_at: now,
            intent: def.intent,
            actor_type: cmd.actor_type,
            actor_id: cmd.actor_id.clone(),
            session_id: cmd.session_id.clone(),
            request_id: cmd.request_id.clone(),
            invocation_id: cmd.invocation_id.clone(),
            entity_type: draft.entity_type,
            entity_id: draft.entity_id,
            owner_namespace_id: namespace.map(|ns| ns.id.clone()),
            owner_namespace_version: namespace.map(|ns| ns.version.clone()),
            correlation_id: cmd.correlation_id.clone(),
            causation_id: cmd.causation_id.clone(),
            payload,
        })
    }

    /// Fold a stored event into decision-time state.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::UnknownEvent`] for an unregistered type and
    /// [`LoadError::Fold`] when the fold function fails.
    pub fn fold(&self, state: &mut S, event: &StoredEvent) -> Result<(), LoadError> {
        let def = self.events.get(&event.event_type).ok_or_else(|| LoadError::UnknownEvent {
            seq: event.seq,
            event_type: event.event_type.clone(),
        })?;
        if let Some(fold) = def.fold {
            fold(state, event).map_err(|source| LoadError::Fold {
                seq: event.seq,
                event_type: event.event_type.clone(),
                source,
            })?;
        }
        Ok(())
    }

    /// Re-check a journaled event against the current definitions.
    ///
    /// Used by maintenance scans to find events that would no longer pass
    /// validation: unknown types, a stored intent or owner that disagrees
    /// with the registration, missing addressing, or a payload the
    /// registered validator rejects.
    pub fn check_stored(&self, event: &StoredEvent) -> Result<(), ValidationError> {
        let ty = event.event_type.as_str();
        let def = self
            .events
            .get(ty)
            .ok_or_else(|| ValidationError::event(ty, "type is not registered"))?;
        if def.intent != event.intent {
            return Err(ValidationError::event(
                ty,
                format!("stored intent {} differs from registered {}", event.intent.as_str(), def.intent.as_str()),
            ));
        }
        // The stored version is provenance only: events written by an older
        // release of the same plugin still belong to it.
        let registered_ns = def.owner.namespace().map(|ns| ns.id.as_str());
        if registered_ns != event.owner_namespace_id.as_deref() {
            return Err(ValidationError::OwnershipMismatch {
                event_type: ty.to_owned(),
                reason: format!(
                    "stored owner {:?} differs from registered {:?}",
                    event.owner_namespace_id, registered_ns
                ),
            });
        }
        let requires_entity = def.addressing == Addressing::Required || def.owner != Owner::Core;
        if requires_entity && (event.entity_type.is_none() || event.entity_id.is_none()) {
            return Err(ValidationError::event(ty, "entity_type and entity_id are required"));
        }
        if let Some(validate) = def.validate {
            validate(&event.payload).map_err(|r| ValidationError::event(ty, r))?;
        }
        Ok(())
    }
}

fn normalize_opt(field: &mut Option<String>) {
    *field = field
        .take()
        .map(|s| s.trim().to_owned())
        .filter(|s| !s.is_empty());
}

fn normalize_payload(payload: Value) -> Result<Value, String> {
    match payload {
        Value::Null => Ok(Value::Object(serde_json::Map::new())),
        Value::Object(_) => Ok(canonicalize(payload)),
        _ => Err("payload must be a JSON object".to_owned()),
    }
}
