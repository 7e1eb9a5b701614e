//! MQTT adapter over `rumqttc`.
//!
//! The client registers a retained `offline` last will on the status topic
//! before connecting. The event loop runs in its own task and re-subscribes
//! tracked topics after every connection acknowledgement, so commands keep
//! flowing across reconnects.
//!
//! Incoming publishes are forwarded without waiting. Only the event loop
//! drains the client's request queue, so it must never block on a full
//! inbound queue; commands arriving while the consumer is behind are dropped
//! with a warning.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hmibridge_core::{Error, MqttSettings, Result};
use parking_lot::{Mutex, RwLock};
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{InboundMessage, MessageBus};
use crate::discovery::STATUS_OFFLINE;

/// Capacity of the client request channel.
const REQUEST_CAPACITY: usize = 64;

/// Capacity of the inbound message channel.
const INBOUND_CAPACITY: usize = 64;

/// Delay before polling again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// [`MessageBus`] backed by an MQTT broker.
pub struct MqttBus {
    client: AsyncClient,
    subscribed: Arc<RwLock<HashSet<String>>>,
    stopping: Arc<AtomicBool>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Create the client and start its event loop.
    ///
    /// The connection is established in the background; requests made before
    /// the broker acknowledges are queued.
    pub fn connect(
        settings: &MqttSettings,
        client_id: &str,
        status_topic: &str,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let mut options = MqttOptions::new(client_id, &settings.host, settings.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive.max(5)));
        options.set_last_will(LastWill::new(
            status_topic,
            STATUS_OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));
        if !settings.username.is_empty() {
            options.set_credentials(&settings.username, &settings.password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, rx) = mpsc::channel(INBOUND_CAPACITY);

        let subscribed = Arc::new(RwLock::new(HashSet::new()));
        let stopping = Arc::new(AtomicBool::new(false));

        let task = tokio::spawn(drive_event_loop(
            eventloop,
            client.clone(),
            subscribed.clone(),
            stopping.clone(),
            tx,
        ));

        info!(
            category = "bus",
            host = %settings.host,
            port = settings.port,
            client_id,
            "MQTT client started"
        );

        let bus = Self {
            client,
            subscribed,
            stopping,
            event_task: Mutex::new(Some(task)),
        };
        (bus, rx)
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload.to_vec())
            .await
            .map_err(|e| Error::Bus(format!("publish {}: {}", topic, e)))
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        if !self.subscribed.write().insert(topic.to_string()) {
            return Ok(());
        }
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Bus(format!("subscribe {}: {}", topic, e)))?;
        debug!(category = "bus", topic, "Subscribed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        let result = self
            .client
            .disconnect()
            .await
            .map_err(|e| Error::Bus(format!("disconnect: {}", e)));

        let task = self.event_task.lock().take();
        if let Some(mut task) = task {
            // The loop ends on the error that follows the disconnect. An
            // unreachable broker never produces one.
            if tokio::time::timeout(RECONNECT_DELAY * 2, &mut task).await.is_err() {
                debug!(category = "bus", "Event loop did not stop in time, aborting");
                task.abort();
            }
        }
        info!(category = "bus", "MQTT client disconnected");
        result
    }
}

async fn drive_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscribed: Arc<RwLock<HashSet<String>>>,
    stopping: Arc<AtomicBool>,
    inbound: mpsc::Sender<InboundMessage>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage::new(publish.topic.clone(), publish.payload.to_vec());
                forward_inbound(&inbound, message);
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(category = "bus", "MQTT connection acknowledged");
                let topics: Vec<String> = subscribed.read().iter().cloned().collect();
                for topic in topics {
                    if let Err(e) = client.try_subscribe(topic.as_str(), QoS::AtLeastOnce) {
                        warn!(category = "bus", topic = %topic, error = %e, "Re-subscribe failed");
                    }
                }
            }
            Ok(_) => {}
            Err(e) => {
                if stopping.load(Ordering::SeqCst) {
                    break;
                }
                warn!(category = "bus", error = %e, "MQTT connection error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
    debug!(category = "bus", "MQTT event loop stopped");
}

/// Hand `message` to the consumer without waiting. Returns whether it was
/// queued.
fn forward_inbound(inbound: &mpsc::Sender<InboundMessage>, message: InboundMessage) -> bool {
    match inbound.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(message)) => {
            warn!(category = "bus", topic = %message.topic, "Inbound queue full, dropping message");
            false
        }
        Err(TrySendError::Closed(_)) => {
            debug!(category = "bus", "Inbound receiver dropped");
            false
        }
    }
}
