//! A small tabletop domain built on the public API, shared by the
//! integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use campaign_es::{
    AggregateState, CampaignStore, Command, CommandDefinition, Decision, EventDefinition, EventDraft, HandlerError,
    KeyRing, Namespace, OutboxConfig, Projection, ProjectionApplier, ProjectionApplierBuilder, Registry,
    StoreConfig, StoredEvent,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub type TestResult<T = ()> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

pub type Store = CampaignStore<Table, TableView>;

pub const DAGGERHEART: &str = "daggerheart";
pub const DAGGERHEART_VERSION: &str = "1.2.0";

fn daggerheart() -> Namespace {
    Namespace::new(DAGGERHEART, DAGGERHEART_VERSION)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    pub hp: u32,
}

/// Decision-time state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub characters: BTreeMap<String, Character>,
    pub notes: u64,
    pub fear: u32,
}

impl AggregateState for Table {}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CharacterView {
    pub name: String,
    pub hp: u32,
    pub downed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableView {
    pub characters: BTreeMap<String, CharacterView>,
    pub notes: BTreeMap<u64, String>,
    pub fear: u32,
}

impl Projection for TableView {
    const NAME: &'static str = "table_view";
}

#[derive(Serialize, Deserialize)]
struct CreateCharacter {
    character_id: String,
    name: String,
    hp: u32,
}

#[derive(Serialize, Deserialize)]
struct Damage {
    character_id: String,
    amount: u32,
}

#[derive(Serialize, Deserialize)]
struct Damaged {
    character_id: String,
    amount: u32,
    hp_after: u32,
}

#[derive(Serialize, Deserialize)]
struct AddNote {
    text: String,
}

#[derive(Serialize, Deserialize)]
struct GainFear {
    amount: u32,
}

#[derive(Serialize, Deserialize)]
struct FearChanged {
    fear_after: u32,
}

fn decide_create(state: &Table, cmd: &Command, _now: DateTime<Utc>) -> Decision {
    let Ok(p) = cmd.payload_as::<CreateCharacter>() else {
        return Decision::reject("INVALID_PAYLOAD", "character.create payload");
    };
    if state.characters.contains_key(&p.character_id) {
        return Decision::reject("CHARACTER_EXISTS", format!("{} already exists", p.character_id));
    }
    let id = p.character_id.clone();
    Decision::emit(EventDraft::new("character.created", json!(p)).with_entity("character", id))
}

fn decide_damage(state: &Table, cmd: &Command, _now: DateTime<Utc>) -> Decision {
    let Ok(p) = cmd.payload_as::<Damage>() else {
        return Decision::reject("INVALID_PAYLOAD", "character.damage payload");
    };
    let Some(character) = state.characters.get(&p.character_id) else {
        return Decision::reject("CHARACTER_NOT_FOUND", format!("{} does not exist", p.character_id));
    };
    let hp_after = character.hp.saturating_sub(p.amount);
    let mut events = vec![
        EventDraft::new(
            "character.damaged",
            json!(Damaged {
                character_id: p.character_id.clone(),
                amount: p.amount,
                hp_after,
            }),
        )
        .with_entity("character", p.character_id.clone()),
    ];
    if hp_after == 0 && character.hp > 0 {
        events.push(
            EventDraft::new("character.downed", json!({"character_id": p.character_id}))
                .with_entity("character", p.character_id),
        );
    }
    Decision::accept(events)
}

fn decide_note(_: &Table, cmd: &Command, _now: DateTime<Utc>) -> Decision {
    match cmd.payload_as::<AddNote>() {
        Ok(p) => Decision::emit(EventDraft::new("note.added", json!(p))),
        Err(e) => Decision::reject("INVALID_PAYLOAD", e.to_string()),
    }
}

fn decide_audit(_: &Table, _: &Command, _now: DateTime<Utc>) -> Decision {
    Decision::emit(EventDraft::new("session.audited", json!({"reason": "gm review"})))
}

/// Core command that illegally emits a plugin-owned event.
fn decide_bless(state: &Table, cmd: &Command, _now: DateTime<Utc>) -> Decision {
    Decision::emit(
        EventDraft::new("sys.daggerheart.fear_changed", json!({"fear_after": state.fear + 1}))
            .with_entity("campaign", cmd.campaign_id.clone()),
    )
}

fn decide_fear(state: &Table, cmd: &Command, _now: DateTime<Utc>) -> Decision {
    match cmd.payload_as::<GainFear>() {
        Ok(p) => Decision::emit(
            EventDraft::new("sys.daggerheart.fear_changed", json!({"fear_after": state.fear + p.amount}))
                .with_entity("campaign", cmd.campaign_id.clone()),
        ),
        Err(e) => Decision::reject("INVALID_PAYLOAD", e.to_string()),
    }
}

fn fold_created(state: &mut Table, event: &StoredEvent) -> Result<(), HandlerError> {
    let p: CreateCharacter = event.payload_as()?;
    state.characters.insert(p.character_id, Character { name: p.name, hp: p.hp });
    Ok(())
}

fn fold_damaged(state: &mut Table, event: &StoredEvent) -> Result<(), HandlerError> {
    let p: Damaged = event.payload_as()?;
    if let Some(character) = state.characters.get_mut(&p.character_id) {
        character.hp = p.hp_after;
    }
    Ok(())
}

fn fold_note(state: &mut Table, _: &StoredEvent) -> Result<(), HandlerError> {
    state.notes += 1;
    Ok(())
}

fn fold_fear(state: &mut Table, event: &StoredEvent) -> Result<(), HandlerError> {
    state.fear = event.payload_as::<FearChanged>()?.fear_after;
    Ok(())
}

pub fn registry() -> Registry<Table> {
    Registry::builder()
        .command(CommandDefinition::core("character.create", decide_create).payload::<CreateCharacter>())
        .command(CommandDefinition::core("character.damage", decide_damage).payload::<Damage>())
        .command(CommandDefinition::core("note.add", decide_note).payload::<AddNote>())
        .command(CommandDefinition::core("session.audit", decide_audit))
        .command(CommandDefinition::core("campaign.bless", decide_bless))
        .command(CommandDefinition::plugin(daggerheart(), "sys.daggerheart.fear.gain", decide_fear).payload::<GainFear>())
        .event(
            EventDefinition::core("character.created")
                .require_entity()
                .payload::<CreateCharacter>()
                .fold(fold_created),
        )
        .event(
            EventDefinition::core("character.damaged")
                .require_entity()
                .payload::<Damaged>()
                .fold(fold_damaged),
        )
        .event(EventDefinition::core("character.downed").require_entity())
        .event(EventDefinition::core("note.added").payload::<AddNote>().fold(fold_note))
        .event(EventDefinition::core("session.audited").audit_only())
        .event(
            EventDefinition::plugin(daggerheart(), "sys.daggerheart.fear_changed")
                .payload::<FearChanged>()
                .fold(fold_fear),
        )
        .build()
        .expect("test registry is valid")
}

/// Campaigns whose note handler currently fails.
static FAILING: Mutex<BTreeSet<String>> = Mutex::new(BTreeSet::new());

pub fn set_projection_failing(campaign_id: &str, failing: bool) {
    let mut failing_set = FAILING.lock().unwrap_or_else(PoisonError::into_inner);
    if failing {
        failing_set.insert(campaign_id.to_owned());
    } else {
        failing_set.remove(campaign_id);
    }
}

fn view_created(view: &mut TableView, event: &StoredEvent) -> Result<(), HandlerError> {
    let p: CreateCharacter = event.payload_as()?;
    view.characters.insert(
        p.character_id,
        CharacterView {
            name: p.name,
            hp: p.hp,
            downed: false,
        },
    );
    Ok(())
}

fn view_damaged(view: &mut TableView, event: &StoredEvent) -> Result<(), HandlerError> {
    let p: Damaged = event.payload_as()?;
    view.characters.entry(p.character_id).or_default().hp = p.hp_after;
    Ok(())
}

fn view_downed(view: &mut TableView, event: &StoredEvent) -> Result<(), HandlerError> {
    if let Some(id) = event.entity_id.as_deref() {
        view.characters.entry(id.to_owned()).or_default().downed = true;
    }
    Ok(())
}

fn view_note(view: &mut TableView, event: &StoredEvent) -> Result<(), HandlerError> {
    let failing = FAILING.lock().unwrap_or_else(PoisonError::into_inner).contains(&event.campaign_id);
    if failing {
        return Err(HandlerError::new("notes backend unavailable"));
    }
    let p: AddNote = event.payload_as()?;
    view.notes.insert(event.seq, p.text);
    Ok(())
}

fn view_fear(view: &mut TableView, event: &StoredEvent) -> Result<(), HandlerError> {
    view.fear = event.payload_as::<FearChanged>()?.fear_after;
    Ok(())
}

pub fn handlers() -> ProjectionApplierBuilder<TableView> {
    ProjectionApplier::builder()
        .core("character.created", view_created)
        .core("character.damaged", view_damaged)
        .core("character.downed", view_downed)
        .core("note.added", view_note)
        .plugin(DAGGERHEART, "sys.daggerheart.fear_changed", view_fear)
}

pub fn key_ring() -> KeyRing {
    KeyRing::new("2026-01", b"integration root secret")
}

/// No fsync, millisecond backoff, fast polling.
pub fn fast_config() -> StoreConfig {
    StoreConfig {
        fsync: false,
        outbox: OutboxConfig {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter: 0.0,
            poll_interval: Duration::from_millis(10),
            ..OutboxConfig::default()
        },
        ..StoreConfig::default()
    }
}

pub async fn open(dir: &Path, config: StoreConfig) -> TestResult<Store> {
    Ok(CampaignStore::builder(dir)
        .registry(registry())
        .projections(handlers())
        .key_ring(key_ring())
        .config(config)
        .open()
        .await?)
}

pub fn create(campaign_id: &str, character_id: &str, hp: u32) -> Command {
    Command::new(
        campaign_id,
        "character.create",
        json!({"character_id": character_id, "name": character_id.to_uppercase(), "hp": hp}),
    )
}

pub fn damage(campaign_id: &str, character_id: &str, amount: u32) -> Command {
    Command::new(campaign_id, "character.damage", json!({"character_id": character_id, "amount": amount}))
}

pub fn note(campaign_id: &str, text: &str) -> Command {
    Command::new(campaign_id, "note.add", json!({"text": text}))
}

pub fn gain_fear(campaign_id: &str, amount: u32) -> Command {
    Command::new(campaign_id, "sys.daggerheart.fear.gain", json!({"amount": amount}))
        .with_namespace(DAGGERHEART, DAGGERHEART_VERSION)
}
