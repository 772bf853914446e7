//! Display-mode consumer
//!
//! Turns printer state into one of a handful of LED display modes plus a
//! value in `[0, 1]`. The LED engine itself lives outside this crate and is
//! reached through `ModeSink`.

use crate::config::DisplayConfig;
use crate::protocol::OutboundFrame;
use crate::state::{Mapping, Path, StateHubHandle, StateTree};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Assumed nozzle temperature before the first report
const AMBIENT_TEMPERATURE: f64 = 25.0;
/// Scale for the cooling-down ratio when no target is set
const MAX_TEMPERATURE: f64 = 250.0;
/// A heater this far below target is still warming up
const WARMING_MARGIN: f64 = 2.0;
/// Above this with the heater off the nozzle is cooling down
const COOLING_THRESHOLD: f64 = 50.0;
const PROGRESS_EPSILON: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    Temperature,
    Progress,
    Paused,
    Ready,
    Idle,
    Rainbow,
}

impl DisplayMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayMode::Temperature => "temperature",
            DisplayMode::Progress => "progress",
            DisplayMode::Paused => "paused",
            DisplayMode::Ready => "ready",
            DisplayMode::Idle => "idle",
            DisplayMode::Rainbow => "rainbow",
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receiver of display decisions (the LED engine)
#[async_trait]
pub trait ModeSink: Send + Sync {
    async fn on_mode_determined(&self, mode: DisplayMode, value: f64);
}

/// Default sink: logs mode changes
#[derive(Default)]
pub struct LoggingModeSink {
    last: Mutex<Option<DisplayMode>>,
}

#[async_trait]
impl ModeSink for LoggingModeSink {
    async fn on_mode_determined(&self, mode: DisplayMode, value: f64) {
        let previous = self.last.lock().replace(mode);
        if previous != Some(mode) {
            info!("💡 Display mode: {} ({:.2})", mode, value);
        } else {
            debug!("Display value: {} ({:.2})", mode, value);
        }
    }
}

/// The printer fields mode selection looks at
#[derive(Debug, Clone, PartialEq)]
pub struct PrinterStatus {
    pub temperature: f64,
    pub target: f64,
    pub progress: f64,
    /// `idle_timeout.state`: "Idle", "Ready" or "Printing"
    pub idle_state: Option<String>,
    pub paused: bool,
}

impl Default for PrinterStatus {
    fn default() -> Self {
        Self {
            temperature: AMBIENT_TEMPERATURE,
            target: 0.0,
            progress: 0.0,
            idle_state: None,
            paused: false,
        }
    }
}

impl PrinterStatus {
    /// Read the fields under `source`, falling back to defaults
    pub fn from_tree(tree: &StateTree, source: &str) -> Self {
        let field = |dotted: &str| {
            Path::root(source)
                .join(dotted)
                .and_then(|path| tree.get(&path).cloned())
        };
        let defaults = Self::default();

        Self {
            temperature: field("extruder.temperature")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.temperature),
            target: field("extruder.target")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.target),
            progress: field("display_status.progress")
                .and_then(|v| v.as_f64())
                .unwrap_or(defaults.progress),
            idle_state: field("idle_timeout.state").and_then(|v| v.as_str().map(str::to_string)),
            paused: field("pause_resume.is_paused")
                .and_then(|v| v.as_bool())
                .unwrap_or(defaults.paused),
        }
    }

    pub fn mode(&self) -> (DisplayMode, f64) {
        let heater_on = self.target > 0.0;
        let warming_up = heater_on && self.target - self.temperature > WARMING_MARGIN;
        let cooling_down = !heater_on && self.temperature > COOLING_THRESHOLD;
        let ratio = if heater_on {
            self.temperature / self.target
        } else {
            self.temperature / MAX_TEMPERATURE
        };
        let ratio = ratio.clamp(0.0, 1.0);

        if self.paused {
            return (DisplayMode::Paused, 0.0);
        }
        if !warming_up && self.progress > 0.0 {
            return (DisplayMode::Progress, self.progress.clamp(0.0, 1.0));
        }
        if heater_on || cooling_down {
            return (DisplayMode::Temperature, ratio);
        }
        match self.idle_state.as_deref() {
            Some("Ready") if self.progress < PROGRESS_EPSILON => (DisplayMode::Ready, 0.0),
            Some("Idle") => (DisplayMode::Idle, 0.0),
            _ => (DisplayMode::Rainbow, 0.0),
        }
    }
}

/// Mode and value for the printer state found under `source`
pub fn determine_mode(tree: &StateTree, source: &str) -> (DisplayMode, f64) {
    PrinterStatus::from_tree(tree, source).mode()
}

/// Object spec covering every field `determine_mode` reads
pub fn watched_objects(source: &str) -> Value {
    json!({
        source: {
            "extruder": ["temperature", "target"],
            "display_status": ["progress"],
            "idle_timeout": ["state"],
            "pause_resume": ["is_paused"]
        }
    })
}

/// Internal subscriber that re-evaluates the display mode at most once per
/// update interval and records the result as local state.
pub struct DisplayWatcher {
    config: DisplayConfig,
    hub: StateHubHandle,
    sink: Arc<dyn ModeSink>,
    cancel: CancellationToken,
}

impl DisplayWatcher {
    pub fn new(
        config: DisplayConfig,
        hub: StateHubHandle,
        sink: Arc<dyn ModeSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            hub,
            sink,
            cancel,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    pub async fn run(self) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = self.hub.next_connection_id();
        self.hub.attach(connection_id, tx);

        let objects = watched_objects(&self.config.source);
        if let Err(e) = self
            .hub
            .subscribe(connection_id, json!("display"), objects)
            .await
        {
            warn!("Display watcher could not subscribe: {}", e);
            return;
        }
        info!(
            "Display watcher following '{}' every {:?}",
            self.config.source,
            self.config.update_interval()
        );

        let mut view = StateTree::new();
        let mut dirty = false;
        let mut ticker = tokio::time::interval(self.config.update_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = rx.recv() => match frame {
                    Some(OutboundFrame::Notification(notification)) => {
                        view = view_from_values(notification.values());
                        dirty = true;
                    }
                    Some(OutboundFrame::Response(_)) => {}
                    None => break,
                },
                _ = ticker.tick() => {
                    if dirty {
                        dirty = false;
                        self.evaluate(&view).await;
                    }
                }
            }
        }

        self.hub.detach(connection_id);
        debug!("Display watcher stopped");
    }

    async fn evaluate(&self, view: &StateTree) {
        let (mode, value) = determine_mode(view, &self.config.source);
        self.sink.on_mode_determined(mode, value).await;

        let root = Path::root(&self.config.root);
        self.hub
            .set_local(root.child("display_mode"), json!(mode.as_str()));
        self.hub.set_local(root.child("display_value"), json!(value));
    }
}

/// Rebuild the watched view from one notification.
///
/// Every notification carries the full requested set, so a path missing from
/// it is no longer present upstream.
fn view_from_values(values: &Mapping) -> StateTree {
    let mut view = StateTree::new();
    for (key, value) in values {
        if let Some(path) = Path::parse(key) {
            view.set(&path, value.clone());
        }
    }
    view
}

/// Tree seeded with the local root's initial fields
pub fn local_tree(config: &DisplayConfig) -> StateTree {
    let mut tree = StateTree::new();
    let seed = json!({
        "status": if config.enabled { "on" } else { "off" },
        "chain_count": config.led_count,
        "display_mode": null,
        "display_value": 0.0,
        "brightness": 255
    });
    if let Value::Object(seed) = seed {
        tree.merge_deep(&config.root, &seed);
    }
    tree
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn status(temperature: f64, target: f64, progress: f64, state: &str, paused: bool) -> PrinterStatus {
        PrinterStatus {
            temperature,
            target,
            progress,
            idle_state: Some(state.to_string()),
            paused,
        }
    }

    #[test]
    fn test_mode_priorities() {
        // Paused wins over everything
        assert_eq!(status(200.0, 200.0, 0.5, "Printing", true).mode().0, DisplayMode::Paused);
        // Printing at temperature shows progress
        assert_eq!(
            status(200.0, 200.0, 0.5, "Printing", false).mode(),
            (DisplayMode::Progress, 0.5)
        );
        // Warming up mid-print shows temperature
        assert_eq!(
            status(100.0, 200.0, 0.5, "Printing", false).mode(),
            (DisplayMode::Temperature, 0.5)
        );
        // Cooling down with heater off, scaled against 250
        let (mode, value) = status(125.0, 0.0, 0.0, "Ready", false).mode();
        assert_eq!(mode, DisplayMode::Temperature);
        assert!((value - 0.5).abs() < 1e-9);

        assert_eq!(status(30.0, 0.0, 0.0, "Ready", false).mode(), (DisplayMode::Ready, 0.0));
        assert_eq!(status(30.0, 0.0, 0.0, "Idle", false).mode(), (DisplayMode::Idle, 0.0));
        assert_eq!(
            status(30.0, 0.0, 0.0, "Printing", false).mode(),
            (DisplayMode::Rainbow, 0.0)
        );
    }

    #[test]
    fn test_ratio_is_clamped() {
        let (mode, value) = status(215.0, 200.0, 0.0, "Printing", false).mode();
        assert_eq!(mode, DisplayMode::Temperature);
        assert_eq!(value, 1.0);
    }

    #[test]
    fn test_from_tree_defaults() {
        let tree = StateTree::new();
        assert_eq!(PrinterStatus::from_tree(&tree, "moonraker"), PrinterStatus::default());
        assert_eq!(determine_mode(&tree, "moonraker"), (DisplayMode::Rainbow, 0.0));
    }

    #[test]
    fn test_local_tree_seed() {
        let tree = local_tree(&DisplayConfig::default());
        let get = |p: &str| tree.get(&Path::parse(p).unwrap()).cloned();
        assert_eq!(get("skylight.status"), Some(json!("on")));
        assert_eq!(get("skylight.chain_count"), Some(json!(30)));
        assert_eq!(get("skylight.display_mode"), Some(Value::Null));
    }

    #[test]
    fn test_view_drops_paths_missing_from_later_notification() {
        let Value::Object(paused) = json!({
            "moonraker.pause_resume.is_paused": true,
            "moonraker.extruder.temperature": 30.0
        }) else {
            unreachable!()
        };
        let view = view_from_values(&paused);
        assert_eq!(determine_mode(&view, "moonraker").0, DisplayMode::Paused);

        // is_paused dropped out of the requested set
        let Value::Object(later) = json!({"moonraker.extruder.temperature": 30.0}) else {
            unreachable!()
        };
        let view = view_from_values(&later);
        assert!(view
            .get(&Path::parse("moonraker.pause_resume.is_paused").unwrap())
            .is_none());
        assert_eq!(determine_mode(&view, "moonraker"), (DisplayMode::Rainbow, 0.0));
    }

    #[test]
    fn test_mode_serializes_lowercase() {
        assert_eq!(serde_json::to_value(DisplayMode::Paused).unwrap(), json!("paused"));
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<(DisplayMode, f64)>>,
    }

    #[async_trait]
    impl ModeSink for RecordingSink {
        async fn on_mode_determined(&self, mode: DisplayMode, value: f64) {
            self.calls.lock().push((mode, value));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_records_local_mode() {
        let hub = StateHubHandle::spawn(StateTree::new());
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let config = DisplayConfig::default();
        let watcher = DisplayWatcher::new(config.clone(), hub.clone(), sink.clone(), cancel.clone());
        let task = watcher.spawn();

        let Value::Object(update) = json!({
            "extruder": {"temperature": 210.0, "target": 210.0},
            "display_status": {"progress": 0.25},
            "idle_timeout": {"state": "Printing"},
            "pause_resume": {"is_paused": false}
        }) else {
            unreachable!()
        };
        hub.merge(config.source.clone(), update);

        tokio::time::sleep(config.update_interval() * 2).await;

        let calls = sink.calls.lock().clone();
        assert_eq!(calls.last(), Some(&(DisplayMode::Progress, 0.25)));
        let mode = hub
            .get(Path::parse("skylight.display_mode").unwrap())
            .await
            .unwrap();
        assert_eq!(mode, Some(json!("progress")));

        cancel.cancel();
        task.await.unwrap();
    }
}
