//! Poll/command engine.
//!
//! A [`Bridge`] owns the synchronized entity set and moves data both ways:
//! periodic telemetry reads become retained state messages, and command
//! messages become device writes followed by a refresh.
//!
//! ```text
//! announce_online ─► configure ─► run ─┬─► poll task (interval)
//!                                      └─► command loop (inbound channel)
//! ```
//!
//! Device I/O is serialized behind one async mutex. Both loops check the
//! [`Lifecycle`] before starting work and stop once draining.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use hmibridge_core::config::defaults;
use hmibridge_core::{BridgeConfig, Error, Lifecycle, LifecycleState, Result};
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::adapters::{InboundMessage, MessageBus};
use crate::discovery::{
    discovery_messages, DiscoveryContext, EntityAttributes, STATUS_OFFLINE, STATUS_ONLINE,
};
use crate::hmi::client::{build_languages, DeviceSession};
use crate::hmi::page::PageParser;
use crate::hmi::stream::{decode_body, decode_ids, decode_values};
use crate::sync::{
    translate_command, translate_state, EntityKey, EntityRegistry, SyncPolicy, Synchronizer,
};

/// Bridge tuning derived from [`BridgeConfig`].
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub pages: Vec<String>,
    pub poll_interval: Duration,
    /// Pause between a successful write and the refresh poll.
    pub settle_delay: Duration,
    pub lang_index: usize,
    pub policy: SyncPolicy,
    pub discovery: DiscoveryContext,
}

impl BridgeSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            pages: config.pages(),
            poll_interval: config.poll_interval(),
            settle_delay: Duration::from_millis(defaults::WRITE_SETTLE_MILLIS),
            lang_index: config.language_index,
            policy: SyncPolicy::from_config(config),
            discovery: DiscoveryContext::from_config(config),
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }
}

/// Outcome of one poll cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Read endpoints fetched successfully.
    pub endpoints: usize,
    pub failed_endpoints: usize,
    /// Entities whose state was published.
    pub published: usize,
    /// Entities absent from their stream.
    pub missing: usize,
    /// The cycle did not run because the bridge is draining.
    pub skipped: bool,
}

/// Outcome of one inbound command.
#[derive(Debug)]
pub enum CommandOutcome {
    /// Not a command for a writable entity, or commands are disabled.
    Ignored,
    /// Payload could not be translated; the device was not contacted.
    Rejected(Error),
    Written { key: EntityKey, value: String },
    WriteFailed(Error),
}

/// The running bridge between one console and one bus.
pub struct Bridge {
    session: Arc<dyn DeviceSession>,
    bus: Arc<dyn MessageBus>,
    lifecycle: Lifecycle,
    settings: BridgeSettings,
    parser: PageParser,
    synchronizer: Synchronizer,
    registry: EntityRegistry,
    /// Command topic → entity.
    routes: RwLock<HashMap<String, EntityKey>>,
    device_lock: Mutex<()>,
}

impl Bridge {
    /// The poll interval is raised to the device floor of
    /// [`defaults::MIN_POLL_INTERVAL_SECS`] whatever the settings say.
    pub fn new(
        session: Arc<dyn DeviceSession>,
        bus: Arc<dyn MessageBus>,
        lifecycle: Lifecycle,
        mut settings: BridgeSettings,
    ) -> Self {
        let floor = Duration::from_secs(defaults::MIN_POLL_INTERVAL_SECS);
        if settings.poll_interval < floor {
            warn!(
                category = "config",
                requested_millis = settings.poll_interval.as_millis() as u64,
                floor_secs = defaults::MIN_POLL_INTERVAL_SECS,
                "Poll interval below device floor, clamping"
            );
            settings.poll_interval = floor;
        }

        Self {
            parser: PageParser::new(settings.lang_index),
            synchronizer: Synchronizer::new(settings.policy.clone(), settings.lang_index),
            session,
            bus,
            lifecycle,
            settings,
            registry: EntityRegistry::new(),
            routes: RwLock::new(HashMap::new()),
            device_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.registry
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Effective period of the background poll.
    pub fn poll_interval(&self) -> Duration {
        self.settings.poll_interval
    }

    /// Publish the retained `online` marker.
    pub async fn announce_online(&self) -> Result<()> {
        let topic = self.settings.discovery.status_topic();
        self.bus.publish(&topic, STATUS_ONLINE.as_bytes(), true).await?;
        self.lifecycle.transition(LifecycleState::Connected)?;
        info!(category = "lifecycle", topic = %topic, "Bridge online");
        Ok(())
    }

    /// Load localization, parse every configured page and rebuild the entity
    /// registry. Pages that fail to load are skipped. Returns the entity count.
    pub async fn configure(&self) -> Result<usize> {
        let _device = self.device_lock.lock().await;
        let table = build_languages(self.session.as_ref()).await;

        for page in &self.settings.pages {
            let html = match self.session.fetch(page).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(category = "config", page = %page, error = %e, "Page fetch failed, skipping");
                    continue;
                }
            };

            let model = self.parser.parse(page, &html, &table);
            let present = match self.session.fetch_bytes(&model.read_endpoint).await {
                Ok(bytes) => decode_ids(&decode_body(&bytes)),
                Err(e) => {
                    debug!(category = "config", read_endpoint = %model.read_endpoint, error = %e, "Presence scan failed");
                    BTreeSet::new()
                }
            };

            let entities = self.synchronizer.synchronize_page(&model, &present, &table);
            info!(
                category = "config",
                page = %page,
                title = %model.title,
                strategy = model.strategy.unwrap_or("none"),
                entries = model.entries.len(),
                read_ids = present.len(),
                entities = entities.len(),
                read_endpoint = %model.read_endpoint,
                "Page synchronized"
            );
            self.registry.replace_page(page.clone(), entities);
        }

        Ok(self.registry.len())
    }

    /// Publish retained discovery for every entity and subscribe to the
    /// command topics of writable ones. Returns the number of descriptors
    /// published.
    pub async fn publish_discovery(&self) -> usize {
        let policy = self.synchronizer.policy();
        let ctx = &self.settings.discovery;
        let mut published = 0;

        for page in self.registry.snapshot() {
            for entity in page.iter() {
                for message in discovery_messages(entity, ctx, policy) {
                    let payload = match message.payload_json() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(category = "discovery", key = %entity.key, error = %e, "Discovery payload failed");
                            continue;
                        }
                    };
                    match self.bus.publish(&message.topic, payload.as_bytes(), true).await {
                        Ok(()) => published += 1,
                        Err(e) => {
                            warn!(category = "discovery", topic = %message.topic, error = %e, "Discovery publish failed");
                        }
                    }
                }

                if entity.is_writable(policy) {
                    let command = ctx.topics(entity).command;
                    if let Err(e) = self.bus.subscribe(&command).await {
                        warn!(category = "discovery", topic = %command, error = %e, "Command subscribe failed");
                        continue;
                    }
                    self.routes.write().insert(command, entity.key.clone());
                }
            }
        }

        info!(category = "discovery", published, policy = policy.name(), "Discovery published");
        published
    }

    /// Read every endpoint once and publish state and attributes.
    ///
    /// A failed fetch publishes nothing for that endpoint; previously
    /// retained state stays in place.
    pub async fn poll_cycle(&self) -> PollReport {
        let mut report = PollReport::default();
        if self.lifecycle.is_draining() {
            report.skipped = true;
            return report;
        }

        let _device = self.device_lock.lock().await;
        let ctx = &self.settings.discovery;

        for (endpoint, entities) in self.registry.by_read_endpoint() {
            let samples = match self.session.fetch_bytes(&endpoint).await {
                Ok(bytes) => decode_values(&decode_body(&bytes)),
                Err(e) => {
                    warn!(category = "poll", read_endpoint = %endpoint, error = %e, "Read failed");
                    report.failed_endpoints += 1;
                    continue;
                }
            };
            report.endpoints += 1;

            for entity in &entities {
                let Some(sample) = samples.get(entity.object_id()) else {
                    debug!(category = "poll", key = %entity.key, read_endpoint = %endpoint, "No value in stream");
                    report.missing += 1;
                    continue;
                };

                let topics = ctx.topics(entity);
                let state = translate_state(entity, &sample.raw);
                if let Err(e) = self.bus.publish(&topics.state, state.as_bytes(), true).await {
                    warn!(category = "poll", topic = %topics.state, error = %e, "State publish failed");
                    continue;
                }

                let attributes = EntityAttributes::new(entity, &sample.raw);
                match serde_json::to_string(&attributes) {
                    Ok(json) => {
                        let published = self
                            .bus
                            .publish(&topics.attributes, json.as_bytes(), true)
                            .await;
                        if let Err(e) = published {
                            warn!(category = "poll", topic = %topics.attributes, error = %e, "Attributes publish failed");
                        }
                    }
                    Err(e) => {
                        warn!(category = "poll", key = %entity.key, error = %e, "Attributes encoding failed");
                    }
                }
                report.published += 1;
            }
        }

        debug!(
            category = "poll",
            endpoints = report.endpoints,
            failed = report.failed_endpoints,
            published = report.published,
            missing = report.missing,
            "Poll cycle finished"
        );
        report
    }

    /// Dispatch one command message.
    pub async fn handle_command(&self, topic: &str, payload: &[u8]) -> CommandOutcome {
        if self.lifecycle.is_draining() || self.synchronizer.policy().is_read_only() {
            return CommandOutcome::Ignored;
        }

        let route = self.routes.read().get(topic).cloned();
        let Some(key) = route else {
            debug!(category = "command", topic, "No entity for topic");
            return CommandOutcome::Ignored;
        };
        let Some(entity) = self.registry.find(&key) else {
            debug!(category = "command", key = %key, "Entity no longer synchronized");
            return CommandOutcome::Ignored;
        };
        let Some(write_id) = entity.write_id.as_deref() else {
            return CommandOutcome::Ignored;
        };

        let payload = String::from_utf8_lossy(payload);
        let value = match translate_command(&entity, &payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(category = "command", key = %key, error = %e, "Command rejected");
                return CommandOutcome::Rejected(e);
            }
        };

        let written = {
            let _device = self.device_lock.lock().await;
            self.session.write(write_id, &value).await
        };
        if let Err(e) = written {
            warn!(category = "command", key = %key, value = %value, error = %e, "Write failed");
            return CommandOutcome::WriteFailed(e);
        }

        info!(category = "command", key = %key, value = %value, "Write accepted");
        tokio::time::sleep(self.settings.settle_delay).await;
        self.poll_cycle().await;

        CommandOutcome::Written { key, value }
    }

    /// Publish discovery, poll immediately, then poll on the interval and
    /// dispatch commands until the lifecycle drains. Finishes by publishing
    /// `offline` and disconnecting the bus.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) -> Result<()> {
        if let Err(e) = self.lifecycle.transition(LifecycleState::Running) {
            debug!(category = "lifecycle", error = %e, "Not entering running state");
        }

        if !self.lifecycle.is_draining() {
            self.publish_discovery().await;
            let report = self.poll_cycle().await;
            info!(category = "poll", published = report.published, "Initial state published");
        }

        let poller = {
            let bridge = Arc::clone(&self);
            tokio::spawn(async move { bridge.poll_loop().await })
        };

        let mut inbound_open = true;
        loop {
            tokio::select! {
                _ = self.lifecycle.cancelled() => break,
                message = inbound.recv(), if inbound_open => match message {
                    Some(message) => {
                        self.handle_command(&message.topic, &message.payload).await;
                    }
                    None => {
                        warn!(category = "bus", "Inbound channel closed");
                        inbound_open = false;
                    }
                },
            }
        }

        self.drain(poller).await
    }

    async fn poll_loop(&self) {
        let period = self.settings.poll_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.lifecycle.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_cycle().await;
                }
            }
        }
        debug!(category = "poll", "Poll loop stopped");
    }

    async fn drain(&self, poller: tokio::task::JoinHandle<()>) -> Result<()> {
        info!(category = "lifecycle", "Draining");
        let topic = self.settings.discovery.status_topic();
        if let Err(e) = self.bus.publish(&topic, STATUS_OFFLINE.as_bytes(), true).await {
            warn!(category = "lifecycle", error = %e, "Offline publish failed");
        }

        if let Err(e) = poller.await {
            warn!(category = "lifecycle", error = %e, "Poll task ended abnormally");
        }

        if let Err(e) = self.bus.disconnect().await {
            warn!(category = "lifecycle", error = %e, "Bus disconnect failed");
        }

        self.lifecycle.transition(LifecycleState::Stopped)?;
        info!(category = "lifecycle", "Bridge stopped");
        Ok(())
    }
}
