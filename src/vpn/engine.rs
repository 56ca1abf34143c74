//! VPN engine adapter
//!
//! Owns at most one live sing-box instance, run as a managed child process,
//! and polls the engine's Clash-compatible control plane once per second for
//! proxy-only traffic accounting.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{Child, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use super::config::{build_engine_config, Config, CLASH_API_ADDR};
use super::state::{State, StateMachine};
use super::{VpnError, VpnResult};
use crate::utils::{data_dir, hidden_command};

/// Startup grace before treating an early child exit as a connect failure.
const STARTUP_PROBE: Duration = Duration::from_millis(500);

/// Delay before the first control-plane poll, letting the API bind.
const POLL_STARTUP_DELAY: Duration = Duration::from_secs(1);

/// Interval between control-plane polls.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout for a single control-plane request.
const POLL_HTTP_TIMEOUT: Duration = Duration::from_secs(2);

/// Outbound tag identifying tunneled traffic in a connection's chain.
const PROXY_TAG: &str = "proxy";

struct Inner {
    child: Option<Child>,
    cancel: Option<CancellationToken>,
    config: Option<Config>,
}

/// Read-only view of the live connection, safe to query from sync contexts.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub connected_at: Option<i64>,
    pub server_name: Option<String>,
    pub protocol: Option<String>,
}

/// Manages the sing-box instance lifecycle.
pub struct Engine {
    state_machine: Arc<StateMachine>,
    /// Serializes connect/disconnect and guards the live child handle.
    inner: tokio::sync::Mutex<Inner>,
    snapshot: Mutex<Snapshot>,
    traffic: Arc<Mutex<TrafficTracker>>,
}

impl Engine {
    /// Create a new engine adapter around the given state machine.
    pub fn new(state_machine: Arc<StateMachine>) -> Self {
        Self {
            state_machine,
            inner: tokio::sync::Mutex::new(Inner {
                child: None,
                cancel: None,
                config: None,
            }),
            snapshot: Mutex::new(Snapshot::default()),
            traffic: Arc::new(Mutex::new(TrafficTracker::default())),
        }
    }

    /// Start the VPN connection with the given config.
    ///
    /// Refuses while an instance is already live. On any step's failure all
    /// partially-held resources are released and the state machine moves to
    /// `Error` before the cause is returned.
    pub async fn connect(&self, cfg: Config) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;

        if inner.child.is_some() {
            return Err(VpnError::AlreadyConnected);
        }

        self.state_machine.set_state(State::Connecting, None);

        let (child, cancel) = match self.start_engine(&cfg).await {
            Ok(started) => started,
            Err(err) => {
                self.state_machine.set_state(State::Error, Some(err.to_string()));
                return Err(err);
            }
        };

        inner.child = Some(child);
        inner.cancel = Some(cancel.clone());
        inner.config = Some(cfg.clone());

        *self.snapshot.lock() = Snapshot {
            connected_at: Some(chrono::Utc::now().timestamp()),
            server_name: cfg.server.as_ref().map(|s| s.name.clone()),
            protocol: cfg.server.as_ref().map(|s| s.protocol.to_string()),
        };
        *self.traffic.lock() = TrafficTracker::default();

        self.state_machine.set_state(State::Connected, None);

        let traffic = Arc::clone(&self.traffic);
        let state_machine = Arc::clone(&self.state_machine);
        tokio::spawn(poll_stats(cancel, traffic, state_machine));

        Ok(())
    }

    /// Build the config document, write it to disk and spawn sing-box.
    async fn start_engine(&self, cfg: &Config) -> VpnResult<(Child, CancellationToken)> {
        let doc = build_engine_config(cfg)?;
        let config_json = serde_json::to_string_pretty(&doc)?;
        log::debug!("sing-box config: {config_json}");

        let dir = data_dir();
        std::fs::create_dir_all(&dir)?;
        let config_path = dir.join("config.json");
        std::fs::write(&config_path, config_json)?;

        let binary = find_engine_binary().ok_or(VpnError::EngineNotFound)?;
        log::info!("starting sing-box from {}", binary.display());

        let mut child = hidden_command(&binary)
            .arg("run")
            .arg("-c")
            .arg(&config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| VpnError::EngineStart(e.to_string()))?;

        // Catch configs the engine rejects immediately.
        tokio::time::sleep(STARTUP_PROBE).await;
        match child.try_wait() {
            Ok(Some(status)) => {
                return Err(VpnError::EngineStart(format!(
                    "engine exited during startup: {status}"
                )));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(VpnError::EngineStart(e.to_string()));
            }
            Ok(None) => {}
        }

        Ok((child, CancellationToken::new()))
    }

    /// Stop the VPN connection. Succeeds quickly when nothing is live.
    pub async fn disconnect(&self) -> VpnResult<()> {
        let mut inner = self.inner.lock().await;

        let Some(mut child) = inner.child.take() else {
            return Ok(());
        };

        self.state_machine.set_state(State::Disconnecting, None);

        if let Some(cancel) = inner.cancel.take() {
            cancel.cancel();
        }

        if let Err(e) = child.kill() {
            log::warn!("error stopping sing-box: {e}");
        }
        let _ = child.wait();

        inner.config = None;
        *self.snapshot.lock() = Snapshot::default();

        self.state_machine.set_state(State::Disconnected, None);
        Ok(())
    }

    /// Read-only snapshot of the live connection.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().clone()
    }

    /// Current config, if connected.
    pub async fn config(&self) -> Option<Config> {
        self.inner.lock().await.config.clone()
    }
}

/// Locate the sing-box binary: beside our executable, under the data
/// directory, then on PATH.
fn find_engine_binary() -> Option<PathBuf> {
    let name = if cfg!(windows) { "sing-box.exe" } else { "sing-box" };

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join(name);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    let candidate = data_dir().join(name);
    if candidate.is_file() {
        return Some(candidate);
    }

    // Fall back to PATH resolution at spawn time.
    Some(PathBuf::from(name))
}

// --- Control-plane DTOs ---

/// Response from the Clash API `/connections` endpoint; only the fields the
/// accounting needs are decoded.
#[derive(Debug, Deserialize)]
struct ClashConnections {
    #[serde(default)]
    connections: Vec<ClashConnection>,
}

/// A single active connection reported by the control plane.
#[derive(Debug, Deserialize)]
pub(crate) struct ClashConnection {
    pub id: String,
    pub upload: u64,
    pub download: u64,
    #[serde(default)]
    pub chains: Vec<String>,
}

/// A connection is tunneled iff its chain traversed the proxy outbound.
fn is_proxy_chain(chains: &[String]) -> bool {
    chains.iter().any(|c| c == PROXY_TAG)
}

/// Proxy-only traffic accounting across engine-connection churn.
///
/// Cumulative per-connection counters vanish when a connection closes; their
/// last-seen values are folded into the closed accumulators so published
/// totals stay monotonic.
#[derive(Debug, Default)]
pub(crate) struct TrafficTracker {
    proxy_conns: HashMap<String, (u64, u64)>,
    closed_upload: u64,
    closed_download: u64,
    last_upload: u64,
    last_download: u64,
}

impl TrafficTracker {
    /// Fold one control-plane snapshot into the tracker.
    ///
    /// Returns `(upload, download, up_speed, down_speed)` where the totals
    /// cover closed and active proxy connections and the speeds are
    /// first-differences clamped at zero.
    pub(crate) fn apply_snapshot(&mut self, conns: &[ClashConnection]) -> (u64, u64, u64, u64) {
        let mut active_ids = HashSet::new();
        let mut active_upload: u64 = 0;
        let mut active_download: u64 = 0;

        for conn in conns.iter().filter(|c| is_proxy_chain(&c.chains)) {
            active_ids.insert(conn.id.as_str());
            active_upload += conn.upload;
            active_download += conn.download;
        }

        // Fold closed proxy connections into the accumulators.
        let Self {
            proxy_conns,
            closed_upload,
            closed_download,
            ..
        } = self;
        proxy_conns.retain(|id, (upload, download)| {
            if active_ids.contains(id.as_str()) {
                true
            } else {
                *closed_upload += *upload;
                *closed_download += *download;
                false
            }
        });

        // Track current counters of active proxy connections.
        for conn in conns.iter().filter(|c| is_proxy_chain(&c.chains)) {
            self.proxy_conns
                .insert(conn.id.clone(), (conn.upload, conn.download));
        }

        let upload = self.closed_upload + active_upload;
        let download = self.closed_download + active_download;

        let up_speed = upload.saturating_sub(self.last_upload);
        let down_speed = download.saturating_sub(self.last_download);
        self.last_upload = upload;
        self.last_download = download;

        (upload, download, up_speed, down_speed)
    }
}

/// Long-running traffic poller.
///
/// Swallows any single iteration's failure and keeps going; terminates when
/// the connect context is cancelled. HTTP I/O happens outside the tracker
/// lock, and listeners are notified outside it as well.
async fn poll_stats(
    cancel: CancellationToken,
    traffic: Arc<Mutex<TrafficTracker>>,
    state_machine: Arc<StateMachine>,
) {
    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = tokio::time::sleep(POLL_STARTUP_DELAY) => {}
    }

    let client = match reqwest::Client::builder().timeout(POLL_HTTP_TIMEOUT).build() {
        Ok(client) => client,
        Err(e) => {
            log::error!("failed to create stats HTTP client: {e}");
            return;
        }
    };
    let url = format!("http://{CLASH_API_ADDR}/connections");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let response = match client.get(&url).send().await {
            Ok(response) => response,
            Err(_) => continue,
        };
        let conns: ClashConnections = match response.json().await {
            Ok(conns) => conns,
            Err(_) => continue,
        };

        let (upload, download, up_speed, down_speed) =
            traffic.lock().apply_snapshot(&conns.connections);

        state_machine.notify_stats(upload, download, up_speed, down_speed);
    }
}
