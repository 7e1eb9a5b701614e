//! Entity synchronization.
//!
//! Turns parsed page models into the set of entities the bridge publishes,
//! according to the configured [`SyncPolicy`], and translates values between
//! device enumeration indices and option labels.
//!
//! ## Per-page pipeline
//!
//! 1. Keep entries that appear in the page's telemetry stream or carry a
//!    recognized input kind.
//! 2. Under [`SyncPolicy::ReadOnly`], keep only allow-listed points and apply
//!    their label/unit overrides.
//! 3. Under [`SyncPolicy::ReadOnly`], add any of the [`CRITICAL_FALLBACK`]
//!    points still missing from the critical page.
//! 4. If nothing survived but the stream lists ids, create one state-only
//!    entity per id.
//!
//! The resulting list replaces the page's entry in the [`EntityRegistry`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use hmibridge_core::config::defaults;
use hmibridge_core::{BridgeConfig, Error, Result, WhitelistRule};
use parking_lot::RwLock;
use serde::Serialize;

use crate::hmi::language::LocalizationTable;
use crate::hmi::page::{split_options, EntryDefinition, InputKind, PageModel};

/// Allow-list of (page, object id) pairs with optional overrides.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    rules: HashMap<(String, String), WhitelistRule>,
}

impl Whitelist {
    /// Later rules for the same point replace earlier ones.
    pub fn from_rules(rules: impl IntoIterator<Item = WhitelistRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| ((rule.page.clone(), rule.object_id.clone()), rule))
            .collect();
        Self { rules }
    }

    pub fn get(&self, page: &str, object_id: &str) -> Option<&WhitelistRule> {
        self.rules.get(&(page.to_string(), object_id.to_string()))
    }

    pub fn contains(&self, page: &str, object_id: &str) -> bool {
        self.get(page, object_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Which points are published and whether commands are accepted.
#[derive(Debug, Clone)]
pub enum SyncPolicy {
    /// Monitor profile: allow-listed points only, no writes.
    ReadOnly(Whitelist),
    /// Every recognized point; writable points accept commands.
    Unrestricted,
}

impl SyncPolicy {
    pub fn from_config(config: &BridgeConfig) -> Self {
        if config.is_read_only() {
            Self::ReadOnly(Whitelist::from_rules(config.whitelist.iter().cloned()))
        } else {
            Self::Unrestricted
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Self::ReadOnly(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadOnly(_) => "read-only",
            Self::Unrestricted => "unrestricted",
        }
    }
}

/// Identity of a synchronized point.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityKey {
    pub page: String,
    pub object_id: String,
}

impl EntityKey {
    pub fn new(page: impl Into<String>, object_id: impl Into<String>) -> Self {
        Self {
            page: page.into(),
            object_id: object_id.into(),
        }
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}", self.page, self.object_id)
    }
}

/// A published point.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SynchronizedEntity {
    pub key: EntityKey,
    pub read_endpoint: String,
    pub label: String,
    pub unit: Option<String>,
    pub kind: InputKind,
    /// `None` means state-only, whatever the policy.
    pub write_id: Option<String>,
    pub options: Option<Vec<String>>,
}

impl SynchronizedEntity {
    fn from_entry(model: &PageModel, entry: &EntryDefinition) -> Self {
        Self {
            key: EntityKey::new(&model.page, &entry.object_id),
            read_endpoint: model.read_endpoint.clone(),
            label: entry.label.clone(),
            unit: entry.unit.clone(),
            kind: entry.kind,
            write_id: entry.write_id.clone(),
            options: entry.options.clone(),
        }
    }

    fn state_only(model: &PageModel, object_id: &str, label: String, unit: Option<String>) -> Self {
        Self {
            key: EntityKey::new(&model.page, object_id),
            read_endpoint: model.read_endpoint.clone(),
            label,
            unit,
            kind: InputKind::Numeric,
            write_id: None,
            options: None,
        }
    }

    pub fn page(&self) -> &str {
        &self.key.page
    }

    pub fn object_id(&self) -> &str {
        &self.key.object_id
    }

    /// Label, or the object id when the label is empty.
    pub fn display_name(&self) -> &str {
        if self.label.is_empty() {
            &self.key.object_id
        } else {
            &self.label
        }
    }

    /// Non-empty option list.
    pub fn enum_options(&self) -> Option<&[String]> {
        self.options.as_deref().filter(|opts| !opts.is_empty())
    }

    /// Whether commands may target this entity under `policy`.
    pub fn is_writable(&self, policy: &SyncPolicy) -> bool {
        self.write_id.is_some() && !policy.is_read_only()
    }
}

/// A required point of the critical page, used when parsing missed it.
#[derive(Debug, Clone, Copy)]
pub struct FallbackEntry {
    pub object_id: &'static str,
    pub label: &'static str,
    pub unit: Option<&'static str>,
    pub kind: InputKind,
    /// Localization key holding the `*`-separated options.
    pub options_key: Option<&'static str>,
}

/// Points always published for [`defaults::CRITICAL_PAGE`] in read-only mode.
pub const CRITICAL_FALLBACK: [FallbackEntry; 6] = [
    FallbackEntry {
        object_id: "o044",
        label: "Aktuální výkon",
        unit: Some("%"),
        kind: InputKind::Numeric,
        options_key: None,
    },
    FallbackEntry {
        object_id: "o075",
        label: "B2 Teplota kotle",
        unit: Some("°C"),
        kind: InputKind::Numeric,
        options_key: None,
    },
    FallbackEntry {
        object_id: "o082",
        label: "B7 Teplota zpátečky",
        unit: Some("°C"),
        kind: InputKind::Numeric,
        options_key: None,
    },
    FallbackEntry {
        object_id: "o089",
        label: "B8 Teplota spalin",
        unit: Some("°C"),
        kind: InputKind::Numeric,
        options_key: None,
    },
    FallbackEntry {
        object_id: "o038",
        label: "Stav kotle",
        unit: None,
        kind: InputKind::Enumeration,
        options_key: Some("2. 512"),
    },
    FallbackEntry {
        object_id: "o148",
        label: "Palivo",
        unit: None,
        kind: InputKind::Enumeration,
        options_key: None,
    },
];

/// Applies a [`SyncPolicy`] to page models.
#[derive(Debug, Clone)]
pub struct Synchronizer {
    policy: SyncPolicy,
    lang_index: usize,
}

impl Synchronizer {
    pub fn new(policy: SyncPolicy, lang_index: usize) -> Self {
        Self {
            policy,
            lang_index,
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Entities for one page.
    ///
    /// `present` is the id set of the page's telemetry stream; it may be
    /// empty when the stream could not be read.
    pub fn synchronize_page(
        &self,
        model: &PageModel,
        present: &BTreeSet<String>,
        table: &LocalizationTable,
    ) -> Vec<SynchronizedEntity> {
        let mut entities: Vec<SynchronizedEntity> = Vec::new();

        for entry in &model.entries {
            if !present.contains(&entry.object_id) && !entry.kind.is_recognized() {
                continue;
            }
            let mut entity = SynchronizedEntity::from_entry(model, entry);
            if let SyncPolicy::ReadOnly(whitelist) = &self.policy {
                let Some(rule) = whitelist.get(&model.page, &entry.object_id) else {
                    continue;
                };
                apply_overrides(&mut entity, rule);
            }
            entities.push(entity);
        }

        if self.policy.is_read_only() && model.page == defaults::CRITICAL_PAGE {
            for fallback in &CRITICAL_FALLBACK {
                if entities.iter().any(|e| e.object_id() == fallback.object_id) {
                    continue;
                }
                tracing::debug!(category = "sync", page = %model.page, object_id = fallback.object_id, "Adding fallback entity");
                entities.push(self.fallback_entity(model, fallback, table));
            }
        }

        if entities.is_empty() && !present.is_empty() {
            entities = self.generic_entities(model, present);
            tracing::info!(
                category = "sync",
                page = %model.page,
                count = entities.len(),
                read_endpoint = %model.read_endpoint,
                "Generated generic entities from telemetry ids"
            );
        }

        entities
    }

    fn fallback_entity(
        &self,
        model: &PageModel,
        fallback: &FallbackEntry,
        table: &LocalizationTable,
    ) -> SynchronizedEntity {
        let options = fallback
            .options_key
            .and_then(|key| table.resolve(key, self.lang_index))
            .map(split_options)
            .filter(|opts| !opts.is_empty());

        SynchronizedEntity {
            key: EntityKey::new(&model.page, fallback.object_id),
            read_endpoint: model.read_endpoint.clone(),
            label: fallback.label.to_string(),
            unit: fallback.unit.map(str::to_string),
            kind: fallback.kind,
            write_id: None,
            options,
        }
    }

    fn generic_entities(
        &self,
        model: &PageModel,
        present: &BTreeSet<String>,
    ) -> Vec<SynchronizedEntity> {
        present
            .iter()
            .filter_map(|object_id| match &self.policy {
                SyncPolicy::ReadOnly(whitelist) => {
                    let rule = whitelist.get(&model.page, object_id)?;
                    let label = rule.label.clone().unwrap_or_else(|| object_id.clone());
                    Some(SynchronizedEntity::state_only(model, object_id, label, rule.unit.clone()))
                }
                SyncPolicy::Unrestricted => Some(SynchronizedEntity::state_only(
                    model,
                    object_id,
                    object_id.clone(),
                    None,
                )),
            })
            .collect()
    }
}

fn apply_overrides(entity: &mut SynchronizedEntity, rule: &WhitelistRule) {
    if let Some(label) = rule.label.as_deref().filter(|l| !l.is_empty()) {
        entity.label = label.to_string();
    }
    if let Some(unit) = rule.unit.as_deref().filter(|u| !u.is_empty()) {
        entity.unit = Some(unit.to_string());
    }
}

/// State payload for a raw device value.
///
/// Enumerations with options map an in-range index to its label; every other
/// value passes through unchanged.
pub fn translate_state(entity: &SynchronizedEntity, raw: &str) -> String {
    if entity.kind != InputKind::Enumeration {
        return raw.to_string();
    }
    let Some(options) = entity.enum_options() else {
        return raw.to_string();
    };
    raw.trim()
        .parse::<usize>()
        .ok()
        .and_then(|index| options.get(index))
        .cloned()
        .unwrap_or_else(|| raw.to_string())
}

/// Device value for a command payload.
///
/// Enumerations with options accept an exact option label or a decimal
/// index; enumerations without options pass the payload through; numeric
/// points accept anything that parses as a number. Everything else is a
/// translation error and must not reach the device.
pub fn translate_command(entity: &SynchronizedEntity, payload: &str) -> Result<String> {
    let payload = payload.trim();
    let reject = |reason: &str| Error::translation(entity.object_id(), payload, reason);

    if entity.write_id.is_none() {
        return Err(reject("point is state-only"));
    }
    if payload.is_empty() {
        return Err(reject("empty payload"));
    }

    match entity.kind {
        InputKind::Numeric => match payload.parse::<f64>() {
            Ok(number) if number.is_finite() => Ok(payload.to_string()),
            _ => Err(reject("not a number")),
        },
        InputKind::Enumeration => {
            let Some(options) = entity.enum_options() else {
                return Ok(payload.to_string());
            };
            if payload.bytes().all(|b| b.is_ascii_digit()) {
                return payload
                    .parse::<u64>()
                    .map(|index| index.to_string())
                    .map_err(|_| reject("index out of range"));
            }
            options
                .iter()
                .position(|option| option == payload)
                .map(|index| index.to_string())
                .ok_or_else(|| reject("unknown option"))
        }
        InputKind::Unknown => Err(reject("unknown input kind")),
    }
}

/// Per-page entity snapshots.
///
/// Pages are replaced wholesale; readers hold `Arc` snapshots that are never
/// edited in place.
#[derive(Debug, Default)]
pub struct EntityRegistry {
    pages: RwLock<BTreeMap<String, Arc<Vec<SynchronizedEntity>>>>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the entity set of `page`.
    pub fn replace_page(&self, page: impl Into<String>, entities: Vec<SynchronizedEntity>) {
        self.pages.write().insert(page.into(), Arc::new(entities));
    }

    pub fn page(&self, page: &str) -> Option<Arc<Vec<SynchronizedEntity>>> {
        self.pages.read().get(page).cloned()
    }

    /// All page snapshots in page order.
    pub fn snapshot(&self) -> Vec<Arc<Vec<SynchronizedEntity>>> {
        self.pages.read().values().cloned().collect()
    }

    pub fn find(&self, key: &EntityKey) -> Option<SynchronizedEntity> {
        self.page(&key.page)?
            .iter()
            .find(|entity| entity.key == *key)
            .cloned()
    }

    /// Entities grouped by read endpoint.
    pub fn by_read_endpoint(&self) -> BTreeMap<String, Vec<SynchronizedEntity>> {
        let mut groups: BTreeMap<String, Vec<SynchronizedEntity>> = BTreeMap::new();
        for page in self.snapshot() {
            for entity in page.iter() {
                groups
                    .entry(entity.read_endpoint.clone())
                    .or_default()
                    .push(entity.clone());
            }
        }
        groups
    }

    /// Total entity count.
    pub fn len(&self) -> usize {
        self.pages.read().values().map(|page| page.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
