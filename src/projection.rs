//! Projections (read models): the handler dispatch table and the store
//! that persists each campaign's projection document.
//!
//! A [`ProjectionApplier`] is built once at startup from a core handler
//! table plus one table per plugin namespace. Building checks coverage:
//! every must-apply event type in the [`Registry`] needs a handler, so a
//! missing handler is a startup error rather than a runtime surprise.
//!
//! [`ProjectionStore`] is the only writer of projection storage. It keeps
//! a `last_seq` watermark next to the state, which makes re-delivery of an
//! already applied event a no-op and refuses to apply past a gap.

use std::collections::{HashMap, HashSet};
use std::io;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ApplyError, HandlerError, RegistryError};
use crate::event::{Intent, StoredEvent};
use crate::registry::{Owner, Registry};
use crate::storage::{StoreLayout, read_json, remove_if_exists, write_json_atomic};

/// A per-campaign read model built from must-apply events.
///
/// # Contract
///
/// Handlers must be deterministic. Handlers that write absolute values
/// (e.g. `hp = hp_after`) rather than deltas stay correct under
/// at-least-once delivery.
pub trait Projection:
    Default + Clone + Serialize + DeserializeOwned + PartialEq + Send + Sync + 'static
{
    /// Used as a directory name for the projection's documents.
    const NAME: &'static str;

    /// Bump when the serialized shape changes; older snapshots are ignored.
    const VERSION: u32 = 1;
}

/// Projection handler for one event type.
pub type ApplyFn<P> = fn(&mut P, &StoredEvent) -> Result<(), HandlerError>;

/// What happened to an event offered to a projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Audit-only event: recorded in the journal, never projected.
    Skipped,
    /// The stored projection already reflects this seq.
    AlreadyApplied,
}

/// Builder for [`ProjectionApplier`].
pub struct ProjectionApplierBuilder<P> {
    core: Vec<(String, ApplyFn<P>)>,
    plugins: Vec<(String, String, ApplyFn<P>)>,
}

impl<P> Default for ProjectionApplierBuilder<P> {
    fn default() -> Self {
        Self {
            core: Vec::new(),
            plugins: Vec::new(),
        }
    }
}

impl<P: Projection> ProjectionApplierBuilder<P> {
    /// Handle a core event type.
    pub fn core(mut self, event_type: impl Into<String>, handler: ApplyFn<P>) -> Self {
        self.core.push((event_type.into(), handler));
        self
    }

    /// Handle an event type owned by plugin namespace `namespace_id`.
    ///
    /// Routing keys on the namespace id alone, so events journaled under an
    /// earlier plugin version reach the same handler.
    pub fn plugin(mut self, namespace_id: impl Into<String>, event_type: impl Into<String>, handler: ApplyFn<P>) -> Self {
        self.plugins.push((namespace_id.into(), event_type.into(), handler));
        self
    }

    /// Freeze the dispatch table, checking it against `registry`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::DuplicateHandler`] for a type handled twice.
    /// - [`RegistryError::UnknownEventHandler`] for a handler of an
    ///   unregistered type.
    /// - [`RegistryError::HandlerOwnerMismatch`] when a handler sits in the
    ///   wrong table (core vs. namespace).
    /// - [`RegistryError::UncoveredEvents`] listing every must-apply type
    ///   without a handler.
    pub fn build<S>(self, registry: &Registry<S>) -> Result<ProjectionApplier<P>, RegistryError> {
        let mut core = HashMap::new();
        for (event_type, handler) in self.core {
            let def = registry
                .event(&event_type)
                .ok_or_else(|| RegistryError::UnknownEventHandler(event_type.clone()))?;
            if def.owner() != &Owner::Core {
                return Err(RegistryError::HandlerOwnerMismatch { event_type });
            }
            if core.insert(event_type.clone(), handler).is_some() {
                return Err(RegistryError::DuplicateHandler(event_type));
            }
        }

        let mut plugins: HashMap<String, HashMap<String, ApplyFn<P>>> = HashMap::new();
        for (namespace_id, event_type, handler) in self.plugins {
            let def = registry
                .event(&event_type)
                .ok_or_else(|| RegistryError::UnknownEventHandler(event_type.clone()))?;
            match def.owner() {
                Owner::Plugin(ns) if ns.id == namespace_id => {}
                _ => return Err(RegistryError::HandlerOwnerMismatch { event_type }),
            }
            let table = plugins.entry(namespace_id).or_default();
            if table.insert(event_type.clone(), handler).is_some() {
                return Err(RegistryError::DuplicateHandler(event_type));
            }
        }

        let mut uncovered: Vec<String> = registry
            .events()
            .filter(|def| def.intent() == Intent::MustApply)
            .filter(|def| match def.owner() {
                Owner::Core => !core.contains_key(def.event_type()),
                Owner::Plugin(ns) => !plugins
                    .get(&ns.id)
                    .is_some_and(|table| table.contains_key(def.event_type())),
            })
            .map(|def| def.event_type().to_owned())
            .collect();
        if !uncovered.is_empty() {
            uncovered.sort();
            return Err(RegistryError::UncoveredEvents(uncovered));
        }

        Ok(ProjectionApplier { core, plugins })
    }
}

/// Immutable projection dispatch table.
pub struct ProjectionApplier<P> {
    core: HashMap<String, ApplyFn<P>>,
    plugins: HashMap<String, HashMap<String, ApplyFn<P>>>,
}

impl<P> std::fmt::Debug for ProjectionApplier<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let namespaces: HashSet<_> = self.plugins.keys().collect();
        f.debug_struct("ProjectionApplier")
            .field("core_handlers", &self.core.len())
            .field("namespaces", &namespaces)
            .finish()
    }
}

impl<P: Projection> ProjectionApplier<P> {
    pub fn builder() -> ProjectionApplierBuilder<P> {
        ProjectionApplierBuilder::default()
    }

    fn route(&self, event: &StoredEvent) -> Result<ApplyFn<P>, ApplyError> {
        let table = match event.owner_namespace_id.as_deref() {
            None => &self.core,
            Some(ns) => self.plugins.get(ns).ok_or_else(|| ApplyError::Unroutable {
                seq: event.seq,
                event_type: event.event_type.clone(),
                namespace: ns.to_owned(),
            })?,
        };
        table.get(&event.event_type).copied().ok_or_else(|| ApplyError::Unhandled {
            seq: event.seq,
            event_type: event.event_type.clone(),
        })
    }

    /// Check that an event would be dispatched, without applying it.
    pub fn check_route(&self, event: &StoredEvent) -> Result<(), ApplyError> {
        if event.intent == Intent::AuditOnly {
            return Ok(());
        }
        self.route(event).map(|_| ())
    }

    /// Apply one event to in-memory projection state.
    ///
    /// # Errors
    ///
    /// Fatal [`ApplyError::Unroutable`] / [`ApplyError::Unhandled`] when no
    /// handler exists; [`ApplyError::Handler`] when the handler fails.
    pub fn apply(&self, state: &mut P, event: &StoredEvent) -> Result<ApplyOutcome, ApplyError> {
        if event.intent == Intent::AuditOnly {
            return Ok(ApplyOutcome::Skipped);
        }
        let handler = self.route(event)?;
        handler(state, event).map_err(|source| ApplyError::Handler {
            seq: event.seq,
            event_type: event.event_type.clone(),
            source,
        })?;
        Ok(ApplyOutcome::Applied)
    }
}

/// Persisted projection document for one campaign.
///
/// Serialized as `{ "state": <P>, "last_seq": <N> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: DeserializeOwned"))]
pub struct ProjectionDocument<P> {
    pub state: P,
    /// Highest seq reflected in `state`; 0 when nothing is applied.
    pub last_seq: u64,
}

impl<P: Default> Default for ProjectionDocument<P> {
    fn default() -> Self {
        Self {
            state: P::default(),
            last_seq: 0,
        }
    }
}

/// File-backed store of projection documents, one per campaign.
pub struct ProjectionStore<P> {
    layout: StoreLayout,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    _projection: PhantomData<fn() -> P>,
}

impl<P: Projection> ProjectionStore<P> {
    pub fn new(layout: StoreLayout) -> Self {
        Self {
            layout,
            locks: Mutex::new(HashMap::new()),
            _projection: PhantomData,
        }
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    fn campaign_lock(&self, campaign_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(campaign_id.to_owned()).or_default().clone()
    }

    /// Read the stored document, or an empty one if nothing is stored.
    ///
    /// # Errors
    ///
    /// A corrupt document is an `InvalidData` error; projections are only
    /// reset through an explicit rebuild.
    pub fn load(&self, campaign_id: &str) -> io::Result<ProjectionDocument<P>> {
        Ok(read_json(&self.layout.projection_state_path(P::NAME, campaign_id))?.unwrap_or_default())
    }

    /// Apply one event to the stored projection.
    ///
    /// Reloads the document on every call, so concurrent workers never
    /// apply on top of a stale in-memory copy. Events at or below the
    /// stored `last_seq` are skipped; an event past `last_seq + 1` is
    /// refused with [`ApplyError::OutOfOrder`].
    pub fn apply_event(&self, applier: &ProjectionApplier<P>, event: &StoredEvent) -> Result<ApplyOutcome, ApplyError> {
        let lock = self.campaign_lock(&event.campaign_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let mut doc = self.load(&event.campaign_id)?;
        if event.seq <= doc.last_seq {
            tracing::debug!(
                campaign_id = %event.campaign_id,
                seq = event.seq,
                last_seq = doc.last_seq,
                "event already applied"
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if event.seq != doc.last_seq + 1 {
            return Err(ApplyError::OutOfOrder {
                campaign_id: event.campaign_id.clone(),
                expected: doc.last_seq + 1,
                found: event.seq,
            });
        }

        let outcome = applier.apply(&mut doc.state, event)?;
        doc.last_seq = event.seq;
        write_json_atomic(&self.layout.projection_state_path(P::NAME, &event.campaign_id), &doc)?;
        Ok(outcome)
    }

    /// Replace the stored document. Used by rebuilds.
    pub(crate) fn save(&self, campaign_id: &str, doc: &ProjectionDocument<P>) -> io::Result<()> {
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        write_json_atomic(&self.layout.projection_state_path(P::NAME, campaign_id), doc)
    }

    /// Discard the stored document.
    pub(crate) fn reset(&self, campaign_id: &str) -> io::Result<()> {
        let lock = self.campaign_lock(campaign_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        remove_if_exists(&self.layout.projection_state_path(P::NAME, campaign_id))
    }
}
