//! MQTT topic layout and Home Assistant discovery payloads.
//!
//! Every entity lives under
//! `<base>/<slug(host)>/<page without .cgi>/<object id>/{state,set,attributes}`.
//! Discovery descriptors are published retained to
//! `<prefix>/<component>/benekov_<slug(host)>/<slug(page_object)>/config`,
//! keyed by page and object id so equal labels never share a descriptor.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sha2::{Digest, Sha256};

use hmibridge_core::{BridgeConfig, Result};

use crate::hmi::page::InputKind;
use crate::sync::{SyncPolicy, SynchronizedEntity};

static NON_SLUG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9_]+").expect("valid regex"));
static REPEATED_UNDERSCORE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"_+").expect("valid regex"));

pub const STATUS_ONLINE: &str = "online";
pub const STATUS_OFFLINE: &str = "offline";

const MANUFACTURER: &str = "Benekov/Siemens";
const MODEL: &str = "Climatix HMI";

/// Lowercase, runs of anything but `[a-z0-9_]` become `_`, no leading or
/// trailing `_`. Never empty.
pub fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let replaced = NON_SLUG_RE.replace_all(&lower, "_");
    let collapsed = REPEATED_UNDERSCORE_RE.replace_all(&replaced, "_");
    let slug = collapsed.trim_matches('_');
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug.to_string()
    }
}

/// Stable id of one point on one console.
pub fn unique_id(host: &str, page: &str, object_id: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}", host, page, object_id).as_bytes());
    hex::encode(digest)
}

/// `host[:port]` of a console URL.
pub fn host_of(base_url: &str) -> String {
    let without_scheme = base_url
        .split_once("://")
        .map_or(base_url, |(_, rest)| rest);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host)| host);
    if host.is_empty() {
        base_url.to_string()
    } else {
        host.to_string()
    }
}

fn page_stem(page: &str) -> String {
    page.replace(".cgi", "")
}

/// Availability topic of a console.
pub fn status_topic(base_topic: &str, host: &str) -> String {
    format!("{}/{}/status", base_topic, slugify(host))
}

/// Per-entity topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    pub state: String,
    pub command: String,
    pub attributes: String,
}

impl Topics {
    pub fn new(base_topic: &str, host: &str, page: &str, object_id: &str) -> Self {
        let root = format!(
            "{}/{}/{}/{}",
            base_topic,
            slugify(host),
            page_stem(page),
            object_id
        );
        Self {
            state: format!("{}/state", root),
            command: format!("{}/set", root),
            attributes: format!("{}/attributes", root),
        }
    }
}

/// Naming inputs shared by all topics of one bridge.
#[derive(Debug, Clone)]
pub struct DiscoveryContext {
    pub discovery_prefix: String,
    pub base_topic: String,
    /// Console `host[:port]`.
    pub host: String,
}

impl DiscoveryContext {
    pub fn new(
        discovery_prefix: impl Into<String>,
        base_topic: impl Into<String>,
        host: impl Into<String>,
    ) -> Self {
        Self {
            discovery_prefix: discovery_prefix.into(),
            base_topic: base_topic.into(),
            host: host.into(),
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.discovery_prefix.clone(),
            config.base_topic.clone(),
            host_of(&config.base_url()),
        )
    }

    pub fn status_topic(&self) -> String {
        status_topic(&self.base_topic, &self.host)
    }

    pub fn topics(&self, entity: &SynchronizedEntity) -> Topics {
        Topics::new(&self.base_topic, &self.host, entity.page(), entity.object_id())
    }

    fn device(&self) -> DeviceInfo {
        DeviceInfo {
            identifiers: vec![format!("benekov-{}", self.host)],
            name: format!("Benekov @ {}", self.host),
            manufacturer: MANUFACTURER,
            model: MODEL,
        }
    }
}

/// Discovery component kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Component {
    Sensor,
    Number,
    Select,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sensor => "sensor",
            Self::Number => "number",
            Self::Select => "select",
        }
    }

    fn icon(&self) -> &'static str {
        match self {
            Self::Sensor => "mdi:thermometer",
            Self::Number => "mdi:tune",
            Self::Select => "mdi:menu",
        }
    }

    fn unique_id_suffix(&self) -> &'static str {
        match self {
            Self::Sensor => "",
            Self::Number => "-num",
            Self::Select => "-sel",
        }
    }
}

/// Device block of a discovery payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub identifiers: Vec<String>,
    pub name: String,
    pub manufacturer: &'static str,
    pub model: &'static str,
}

/// Body of a discovery `config` message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveryPayload {
    pub name: String,
    pub unique_id: String,
    pub state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    pub json_attributes_topic: String,
    #[serde(rename = "unit_of_measurement", skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub device: DeviceInfo,
    pub icon: &'static str,
}

/// One retained discovery message.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryMessage {
    pub component: Component,
    pub topic: String,
    pub payload: DiscoveryPayload,
}

impl DiscoveryMessage {
    pub fn payload_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.payload)?)
    }
}

/// Discovery messages for `entity`: always a sensor; a number for writable
/// numeric points; a select for writable enumerations with options.
pub fn discovery_messages(
    entity: &SynchronizedEntity,
    ctx: &DiscoveryContext,
    policy: &SyncPolicy,
) -> Vec<DiscoveryMessage> {
    let writable = entity.is_writable(policy);
    let mut components = vec![Component::Sensor];
    match entity.kind {
        InputKind::Numeric if writable => components.push(Component::Number),
        InputKind::Enumeration if writable && entity.enum_options().is_some() => {
            components.push(Component::Select)
        }
        _ => {}
    }

    components
        .into_iter()
        .map(|component| build_message(entity, ctx, component))
        .collect()
}

fn build_message(
    entity: &SynchronizedEntity,
    ctx: &DiscoveryContext,
    component: Component,
) -> DiscoveryMessage {
    let topics = ctx.topics(entity);
    let name = entity.display_name().to_string();
    let object = format!("{}_{}", page_stem(entity.page()), entity.object_id());
    let topic = format!(
        "{}/{}/benekov_{}/{}/config",
        ctx.discovery_prefix,
        component.as_str(),
        slugify(&ctx.host),
        slugify(&object)
    );

    let (command_topic, options, unit) = match component {
        Component::Sensor => (None, None, entity.unit.clone()),
        Component::Number => (Some(topics.command), None, entity.unit.clone()),
        Component::Select => (
            Some(topics.command),
            entity.enum_options().map(<[String]>::to_vec),
            None,
        ),
    };

    DiscoveryMessage {
        component,
        topic,
        payload: DiscoveryPayload {
            name,
            unique_id: format!(
                "{}{}",
                unique_id(&ctx.host, entity.page(), entity.object_id()),
                component.unique_id_suffix()
            ),
            state_topic: topics.state,
            command_topic,
            options,
            json_attributes_topic: topics.attributes,
            unit: unit.filter(|u| !u.is_empty()),
            device: ctx.device(),
            icon: component.icon(),
        },
    }
}

/// Body of the retained `attributes` message published with each state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityAttributes {
    pub page: String,
    pub label: String,
    pub unit: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    /// Raw value as an integer, for entities with options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<i64>,
}

impl EntityAttributes {
    pub fn new(entity: &SynchronizedEntity, raw: &str) -> Self {
        let options = entity.enum_options().map(<[String]>::to_vec);
        let index = options
            .as_ref()
            .and_then(|_| raw.trim().parse::<i64>().ok());
        Self {
            page: entity.page().to_string(),
            label: entity.display_name().to_string(),
            unit: entity.unit.clone(),
            kind: entity.kind.marker(),
            options,
            index,
        }
    }
}
