//! Bridge behaviour against an in-memory console and bus.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hmibridge_core::{Error, ErrorCategory, Lifecycle, LifecycleState, Result, WhitelistRule};
use hmibridge_devices::hmi::page::InputKind;
use hmibridge_devices::{
    Bridge, BridgeSettings, CommandOutcome, DeviceSession, DiscoveryContext, InboundMessage,
    MessageBus, SyncPolicy, Whitelist,
};
use tokio::sync::mpsc;

const HOME_PAGE: &str = include_str!("fixtures/HMI00001.cgi");
const FEED_PAGE: &str = include_str!("fixtures/HMI00033.cgi");
const LANGUAGES: &str = include_str!("fixtures/HMILang1.js");
const HOME_STREAM: &str = "o044,v,55|o075,v,71.5|\no038,e,\n2|o148,e,0|o082,v,40|";

const STATE_COMMAND_TOPIC: &str = "benekov/192_168_1_10/HMI00001/o038/set";

#[derive(Default)]
struct FakeConsole {
    resources: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    reject_writes: AtomicBool,
    writes: Mutex<Vec<(String, String)>>,
    stream_reads: AtomicUsize,
}

impl FakeConsole {
    fn with_home_page() -> Self {
        let console = Self::default();
        console.serve("HMILang1.js", LANGUAGES);
        console.serve("HMI00001.cgi", HOME_PAGE);
        console.serve("HMI00001Read.cgi", HOME_STREAM);
        console
    }

    fn serve(&self, path: &str, body: &str) {
        self.resources
            .lock()
            .unwrap()
            .insert(path.to_string(), body.to_string());
    }

    fn fail(&self, path: &str) {
        self.failing.lock().unwrap().insert(path.to_string());
    }

    fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceSession for FakeConsole {
    async fn fetch(&self, path: &str) -> Result<String> {
        if self.failing.lock().unwrap().contains(path) {
            return Err(Error::fetch(path, "connection refused"));
        }
        self.resources
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::fetch(path, "HTTP 404 Not Found"))
    }

    async fn fetch_bytes(&self, path: &str) -> Result<Vec<u8>> {
        self.stream_reads.fetch_add(1, Ordering::SeqCst);
        self.fetch(path).await.map(String::into_bytes)
    }

    async fn write(&self, write_id: &str, value: &str) -> Result<()> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(Error::write(write_id, "HTTP 500 Internal Server Error"));
        }
        self.writes
            .lock()
            .unwrap()
            .push((write_id.to_string(), value.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct RecordingBus {
    published: Mutex<Vec<(String, String, bool)>>,
    subscribed: Mutex<Vec<String>>,
    disconnected: AtomicBool,
}

impl RecordingBus {
    fn published(&self) -> Vec<(String, String, bool)> {
        self.published.lock().unwrap().clone()
    }

    fn payload(&self, topic: &str) -> Option<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(t, _, _)| t == topic)
            .map(|(_, payload, _)| payload.clone())
    }

    fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

#[async_trait]
impl MessageBus for RecordingBus {
    async fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
        self.published.lock().unwrap().push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
            retain,
        ));
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.subscribed.lock().unwrap().push(topic.to_string());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn settings(policy: SyncPolicy, pages: &[&str]) -> BridgeSettings {
    BridgeSettings {
        pages: pages.iter().map(|p| p.to_string()).collect(),
        poll_interval: Duration::from_secs(30),
        settle_delay: Duration::ZERO,
        lang_index: 1,
        policy,
        discovery: DiscoveryContext::new("homeassistant", "benekov", "192.168.1.10"),
    }
}

fn bridge(
    console: Arc<FakeConsole>,
    bus: Arc<RecordingBus>,
    settings: BridgeSettings,
) -> Arc<Bridge> {
    Arc::new(Bridge::new(console, bus, Lifecycle::new(), settings))
}

async fn configured(
    policy: SyncPolicy,
    pages: &[&str],
) -> (Arc<FakeConsole>, Arc<RecordingBus>, Arc<Bridge>) {
    let console = Arc::new(FakeConsole::with_home_page());
    let bus = Arc::new(RecordingBus::default());
    let bridge = bridge(console.clone(), bus.clone(), settings(policy, pages));
    bridge.configure().await.unwrap();
    bridge.publish_discovery().await;
    (console, bus, bridge)
}

#[tokio::test]
async fn test_configure_structured_page() {
    let (_, _, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;

    let entities = bridge.registry().page("HMI00001.cgi").unwrap();
    let ids: Vec<&str> = entities.iter().map(|e| e.object_id()).collect();
    assert_eq!(ids, vec!["o044", "o075", "o038", "o148"]);

    let output = &entities[0];
    assert_eq!(output.label, "Current output");
    assert_eq!(output.unit.as_deref(), Some("%"));
    assert_eq!(output.read_endpoint, "HMI00001Read.cgi");

    let state = &entities[2];
    assert_eq!(state.label, "Stav kotle");
    assert_eq!(state.kind, InputKind::Enumeration);
    assert_eq!(state.enum_options().unwrap(), &["Off", "Ignition", "Running"]);

    let fuel = &entities[3];
    assert_eq!(fuel.enum_options().unwrap(), &["Pelety", "Dřevo"]);
}

#[tokio::test]
async fn test_discovery_for_unrestricted_policy() {
    let (_, bus, _) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;

    let published = bus.published();
    let configs: Vec<&str> = published
        .iter()
        .filter(|(topic, _, _)| topic.ends_with("/config"))
        .map(|(topic, _, _)| topic.as_str())
        .collect();
    // four sensors, one number (o075), two selects (o038, o148)
    assert_eq!(configs.len(), 7);
    assert!(published.iter().all(|(_, _, retain)| *retain));
    assert!(configs.contains(&"homeassistant/number/benekov_192_168_1_10/hmi00001_o075/config"));
    assert!(configs.contains(&"homeassistant/select/benekov_192_168_1_10/hmi00001_o038/config"));

    let select: serde_json::Value = serde_json::from_str(
        &bus.payload("homeassistant/select/benekov_192_168_1_10/hmi00001_o038/config")
            .unwrap(),
    )
    .unwrap();
    assert_eq!(select["name"], "Stav kotle");
    assert_eq!(select["command_topic"], STATE_COMMAND_TOPIC);
    assert_eq!(select["options"][2], "Running");

    let mut subscribed = bus.subscribed.lock().unwrap().clone();
    subscribed.sort();
    assert_eq!(
        subscribed,
        vec![
            "benekov/192_168_1_10/HMI00001/o038/set",
            "benekov/192_168_1_10/HMI00001/o075/set",
            "benekov/192_168_1_10/HMI00001/o148/set",
        ]
    );
}

#[tokio::test]
async fn test_poll_publishes_state_and_attributes() {
    let (_, bus, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    bus.clear();

    let report = bridge.poll_cycle().await;
    assert_eq!(report.endpoints, 1);
    assert_eq!(report.published, 4);
    assert_eq!(report.missing, 0);

    assert_eq!(bus.payload("benekov/192_168_1_10/HMI00001/o044/state").as_deref(), Some("55"));
    assert_eq!(bus.payload("benekov/192_168_1_10/HMI00001/o038/state").as_deref(), Some("Running"));
    assert_eq!(bus.payload("benekov/192_168_1_10/HMI00001/o148/state").as_deref(), Some("Pelety"));

    let attributes: serde_json::Value = serde_json::from_str(
        &bus.payload("benekov/192_168_1_10/HMI00001/o038/attributes").unwrap(),
    )
    .unwrap();
    assert_eq!(attributes["page"], "HMI00001.cgi");
    assert_eq!(attributes["type"], "e");
    assert_eq!(attributes["index"], 2);
    assert_eq!(attributes["unit"], serde_json::Value::Null);
}

#[tokio::test]
async fn test_failed_read_publishes_nothing() {
    let (console, bus, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    bus.clear();
    console.fail("HMI00001Read.cgi");

    let report = bridge.poll_cycle().await;
    assert_eq!(report.failed_endpoints, 1);
    assert_eq!(report.published, 0);
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_missing_ids_are_skipped() {
    let (console, bus, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    bus.clear();
    console.serve("HMI00001Read.cgi", "o044,v,60|o075,v,7");

    let report = bridge.poll_cycle().await;
    assert_eq!(report.published, 1);
    assert_eq!(report.missing, 3);
    assert!(bus.payload("benekov/192_168_1_10/HMI00001/o075/state").is_none());
}

#[tokio::test]
async fn test_whitelist_drops_point_present_in_stream() {
    let console = Arc::new(FakeConsole::with_home_page());
    console.serve("PAGE.cgi", HOME_PAGE);
    let bus = Arc::new(RecordingBus::default());
    let whitelist = Whitelist::from_rules([WhitelistRule {
        page: "PAGE.cgi".into(),
        object_id: "o044".into(),
        label: None,
        unit: None,
    }]);
    let bridge = bridge(
        console.clone(),
        bus.clone(),
        settings(SyncPolicy::ReadOnly(whitelist), &["PAGE.cgi"]),
    );

    assert_eq!(bridge.configure().await.unwrap(), 1);
    bridge.publish_discovery().await;
    assert!(bus.subscribed.lock().unwrap().is_empty());

    bus.clear();
    let report = bridge.poll_cycle().await;
    assert_eq!(report.published, 1);
    assert!(bus.payload("benekov/192_168_1_10/PAGE/o044/state").is_some());
    assert!(bus.payload("benekov/192_168_1_10/PAGE/o075/state").is_none());
}

#[tokio::test]
async fn test_read_only_ignores_commands() {
    let whitelist = Whitelist::from_rules(hmibridge_core::config::default_whitelist());
    let (console, bus, bridge) =
        configured(SyncPolicy::ReadOnly(whitelist), &["HMI00001.cgi"]).await;
    bus.clear();

    let outcome = bridge.handle_command(STATE_COMMAND_TOPIC, b"Ignition").await;
    assert!(matches!(outcome, CommandOutcome::Ignored));
    assert!(console.writes().is_empty());
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_read_only_adds_critical_fallbacks() {
    let console = Arc::new(FakeConsole::with_home_page());
    console.serve("HMI00001.cgi", "<html><body>Session expired</body></html>");
    let bus = Arc::new(RecordingBus::default());
    let whitelist = Whitelist::from_rules(hmibridge_core::config::default_whitelist());
    let bridge = bridge(
        console,
        bus.clone(),
        settings(SyncPolicy::ReadOnly(whitelist), &["HMI00001.cgi"]),
    );

    assert_eq!(bridge.configure().await.unwrap(), 6);
    let entities = bridge.registry().page("HMI00001.cgi").unwrap();
    let state = entities.iter().find(|e| e.object_id() == "o038").unwrap();
    assert_eq!(state.enum_options().unwrap(), &["Off", "Ignition", "Running"]);

    let report = bridge.poll_cycle().await;
    assert_eq!(report.published, 5);
    assert_eq!(report.missing, 1);
    assert_eq!(bus.payload("benekov/192_168_1_10/HMI00001/o038/state").as_deref(), Some("Running"));
}

#[tokio::test]
async fn test_command_writes_and_refreshes() {
    let (console, bus, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    bus.clear();

    let outcome = bridge.handle_command(STATE_COMMAND_TOPIC, b"Ignition").await;
    match outcome {
        CommandOutcome::Written { key, value } => {
            assert_eq!(key.object_id, "o038");
            assert_eq!(value, "1");
        }
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert_eq!(console.writes(), vec![("val:0x1111".to_string(), "1".to_string())]);
    assert!(bus.payload("benekov/192_168_1_10/HMI00001/o038/state").is_some());
}

#[tokio::test]
async fn test_numeric_command_passes_value() {
    let (console, _, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;

    let outcome = bridge
        .handle_command("benekov/192_168_1_10/HMI00001/o075/set", b" 72.5 ")
        .await;
    assert!(matches!(outcome, CommandOutcome::Written { .. }));
    assert_eq!(
        console.writes(),
        vec![("val:0x2302 0x4E25516C 0x100".to_string(), "72.5".to_string())]
    );
}

#[tokio::test]
async fn test_untranslatable_payload_neither_writes_nor_publishes() {
    let (console, bus, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    bus.clear();

    let outcome = bridge.handle_command(STATE_COMMAND_TOPIC, b"running").await;
    match outcome {
        CommandOutcome::Rejected(e) => assert_eq!(e.category(), ErrorCategory::Translation),
        other => panic!("unexpected outcome: {:?}", other),
    }
    assert!(console.writes().is_empty());
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_failed_write_skips_refresh() {
    let (console, bus, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    bus.clear();
    console.reject_writes.store(true, Ordering::SeqCst);

    let outcome = bridge.handle_command(STATE_COMMAND_TOPIC, b"0").await;
    assert!(matches!(outcome, CommandOutcome::WriteFailed(_)));
    assert!(bus.published().is_empty());
}

#[tokio::test]
async fn test_unknown_topic_is_ignored() {
    let (console, _, bridge) = configured(SyncPolicy::Unrestricted, &["HMI00001.cgi"]).await;
    let outcome = bridge
        .handle_command("benekov/192_168_1_10/HMI00001/o044/set", b"1")
        .await;
    assert!(matches!(outcome, CommandOutcome::Ignored));
    assert!(console.writes().is_empty());
}

#[tokio::test]
async fn test_unreachable_page_is_skipped() {
    let console = Arc::new(FakeConsole::with_home_page());
    console.fail("HMI65000.cgi");
    console.serve("HMI00033.cgi", FEED_PAGE);
    console.serve("HMI00033Read.cgi", "o010,v,12|o020,v,55|");
    let bus = Arc::new(RecordingBus::default());
    let bridge = bridge(
        console,
        bus,
        settings(
            SyncPolicy::Unrestricted,
            &["HMI00001.cgi", "HMI65000.cgi", "HMI00033.cgi"],
        ),
    );

    assert_eq!(bridge.configure().await.unwrap(), 6);
    assert!(bridge.registry().page("HMI65000.cgi").is_none());

    let feed = bridge.registry().page("HMI00033.cgi").unwrap();
    assert_eq!(feed[0].unit.as_deref(), Some("s"));
    assert_eq!(feed[0].display_name(), "o010");
    assert_eq!(feed[1].unit.as_deref(), Some("%"));
}

#[tokio::test]
async fn test_generic_entities_from_stream() {
    let console = Arc::new(FakeConsole::with_home_page());
    console.serve("HMI65000.cgi", "<html><body>no markup here</body></html>");
    console.serve("HMI65000Read.cgi", "o025,v,0|o011,v,1|o018,v,3|");
    let bus = Arc::new(RecordingBus::default());
    let bridge = bridge(
        console,
        bus,
        settings(SyncPolicy::Unrestricted, &["HMI65000.cgi"]),
    );

    assert_eq!(bridge.configure().await.unwrap(), 3);
    let alarms = bridge.registry().page("HMI65000.cgi").unwrap();
    let ids: Vec<&str> = alarms.iter().map(|e| e.object_id()).collect();
    assert_eq!(ids, vec!["o011", "o018", "o025"]);
    assert!(alarms.iter().all(|e| e.write_id.is_none()));
}

#[tokio::test]
async fn test_run_dispatches_commands_and_drains() {
    let console = Arc::new(FakeConsole::with_home_page());
    let bus = Arc::new(RecordingBus::default());
    let bridge = bridge(
        console.clone(),
        bus.clone(),
        settings(SyncPolicy::Unrestricted, &["HMI00001.cgi"]),
    );
    bridge.announce_online().await.unwrap();
    bridge.configure().await.unwrap();
    assert_eq!(bus.payload("benekov/192_168_1_10/status").as_deref(), Some("online"));

    let (tx, rx) = mpsc::channel(8);
    let runner = tokio::spawn(bridge.clone().run(rx));

    tx.send(InboundMessage::new(STATE_COMMAND_TOPIC, "Off"))
        .await
        .unwrap();
    for _ in 0..100 {
        if !console.writes().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(console.writes(), vec![("val:0x1111".to_string(), "0".to_string())]);
    assert_eq!(bridge.lifecycle().state(), LifecycleState::Running);

    assert!(bridge.lifecycle().begin_drain());
    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("bridge should stop")
        .unwrap()
        .unwrap();

    assert_eq!(bridge.lifecycle().state(), LifecycleState::Stopped);
    assert_eq!(bus.payload("benekov/192_168_1_10/status").as_deref(), Some("offline"));
    assert!(bus.disconnected.load(Ordering::SeqCst));

    let report = bridge.poll_cycle().await;
    assert!(report.skipped);
}

#[tokio::test]
async fn test_poll_interval_never_below_floor() {
    for requested in [Duration::ZERO, Duration::from_millis(10), Duration::from_secs(29)] {
        let console = Arc::new(FakeConsole::with_home_page());
        let bus = Arc::new(RecordingBus::default());
        let mut fast = settings(SyncPolicy::Unrestricted, &["HMI00001.cgi"]);
        fast.poll_interval = requested;
        let bridge = bridge(console.clone(), bus, fast);
        assert_eq!(bridge.poll_interval(), Duration::from_secs(30));

        bridge.configure().await.unwrap();
        let (_tx, rx) = mpsc::channel(8);
        let runner = tokio::spawn(bridge.clone().run(rx));
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(bridge.lifecycle().begin_drain());
        tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .expect("bridge should stop")
            .unwrap()
            .unwrap();

        // presence scan plus the initial poll
        assert_eq!(console.stream_reads.load(Ordering::SeqCst), 2);
    }
}
