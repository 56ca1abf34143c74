//! RPC method dispatch
//!
//! Routes requests to the parser, engine, state machine and split-tunnel
//! modules. Raw error causes are logged here at the internal boundary; only
//! sanitized messages go back over the pipe.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use super::protocol::{
    ConnectParams, PingParams, PingResult, Request, Response, StatusResult, ERR_INTERNAL,
    ERR_INVALID_PARAMS, ERR_METHOD_NOT_FOUND,
};
use crate::parser::parse_link;
use crate::splittunnel::{self, SplitTunnelSettings};
use crate::vpn::{Config, Engine, State, StateMachine};

/// Maximum accepted proxy-link length.
pub const MAX_LINK_LEN: usize = 2048;

/// TCP connect timeout for `servers.ping`.
const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Delay before `service.shutdown` actually stops the core, letting the
/// response flush to the client.
const SHUTDOWN_DELAY: Duration = Duration::from_millis(100);

/// Dispatches RPC method calls.
pub struct Handler {
    engine: Arc<Engine>,
    state_machine: Arc<StateMachine>,
    split_config: RwLock<SplitTunnelSettings>,
    shutdown: CancellationToken,
}

impl Handler {
    /// Create a new handler. Cancelling `shutdown` stops the whole core.
    pub fn new(
        engine: Arc<Engine>,
        state_machine: Arc<StateMachine>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            engine,
            state_machine,
            split_config: RwLock::new(SplitTunnelSettings::default()),
            shutdown,
        }
    }

    /// Process a single request and produce its response.
    pub async fn handle(&self, req: Request) -> Response {
        match req.method.as_str() {
            "vpn.connect" => self.handle_connect(req).await,
            "vpn.disconnect" => self.handle_disconnect(req).await,
            "vpn.status" => self.handle_status(req),
            "apps.list" => self.handle_apps_list(req).await,
            "split.setConfig" => self.handle_split_set_config(req),
            "split.getConfig" => self.handle_split_get_config(req),
            "servers.ping" => self.handle_ping(req).await,
            "service.shutdown" => self.handle_shutdown(req),
            _ => Response::error(
                req.id,
                ERR_METHOD_NOT_FOUND,
                format!("method not found: {}", req.method),
            ),
        }
    }

    fn params<T: serde::de::DeserializeOwned>(req: &Request) -> Result<T, String> {
        let params = req.params.clone().unwrap_or(serde_json::Value::Null);
        serde_json::from_value(params).map_err(|e| e.to_string())
    }

    async fn handle_connect(&self, req: Request) -> Response {
        let params: ConnectParams = match Self::params(&req) {
            Ok(p) => p,
            Err(e) => return Response::error(req.id, ERR_INVALID_PARAMS, format!("invalid params: {e}")),
        };

        if params.link.len() > MAX_LINK_LEN {
            return Response::error(req.id, ERR_INVALID_PARAMS, "link too long");
        }

        let server = match parse_link(&params.link) {
            Ok(server) => server,
            Err(e) => {
                return Response::error(req.id, ERR_INVALID_PARAMS, format!("failed to parse link: {e}"))
            }
        };

        let mut cfg = Config::default();
        cfg.server = Some(server);
        // Fall back to the stored split-tunnel config when the request
        // carries no mode.
        cfg.split_tunnel = match params.split_tunnel_mode {
            Some(mode) => SplitTunnelSettings {
                mode,
                apps: params.split_tunnel_apps,
                domains: params.split_tunnel_domains,
                invert: params.split_tunnel_invert,
            },
            None => self.split_config.read().clone(),
        };

        match self.engine.connect(cfg).await {
            Ok(()) => Response::ok(req.id, json!({ "ok": true })),
            Err(e) => {
                log::error!("vpn.connect failed: {e}");
                Response::error(req.id, ERR_INTERNAL, sanitize_error(&e.to_string()))
            }
        }
    }

    async fn handle_disconnect(&self, req: Request) -> Response {
        match self.engine.disconnect().await {
            Ok(()) => Response::ok(req.id, json!({ "ok": true })),
            Err(e) => {
                log::error!("vpn.disconnect failed: {e}");
                Response::error(req.id, ERR_INTERNAL, sanitize_error(&e.to_string()))
            }
        }
    }

    fn handle_status(&self, req: Request) -> Response {
        let state = self.state_machine.state();
        let mut result = StatusResult {
            state: state.as_str().to_string(),
            ..StatusResult::default()
        };

        if state == State::Connected {
            let snapshot = self.engine.snapshot();
            result.connected_at = snapshot.connected_at;
            result.server_name = snapshot.server_name;
            result.protocol = snapshot.protocol;
        }

        Response::ok(req.id, result)
    }

    async fn handle_apps_list(&self, req: Request) -> Response {
        // Registry walking and icon extraction are blocking work.
        match tokio::task::spawn_blocking(splittunnel::list_installed_apps).await {
            Ok(apps) => Response::ok(req.id, apps),
            Err(e) => {
                log::error!("apps.list failed: {e}");
                Response::error(req.id, ERR_INTERNAL, "failed to list applications")
            }
        }
    }

    fn handle_split_set_config(&self, req: Request) -> Response {
        let config: SplitTunnelSettings = match Self::params(&req) {
            Ok(c) => c,
            Err(e) => return Response::error(req.id, ERR_INVALID_PARAMS, format!("invalid params: {e}")),
        };
        *self.split_config.write() = config;
        Response::ok(req.id, json!({ "ok": true }))
    }

    fn handle_split_get_config(&self, req: Request) -> Response {
        Response::ok(req.id, self.split_config.read().clone())
    }

    async fn handle_ping(&self, req: Request) -> Response {
        let params: PingParams = match Self::params(&req) {
            Ok(p) => p,
            Err(e) => return Response::error(req.id, ERR_INVALID_PARAMS, format!("invalid params: {e}")),
        };

        if params.link.len() > MAX_LINK_LEN {
            return Response::error(req.id, ERR_INVALID_PARAMS, "link too long");
        }

        let server = match parse_link(&params.link) {
            Ok(server) => server,
            Err(e) => return Response::ok(req.id, PingResult::error(format!("failed to parse link: {e}"))),
        };

        // Resolve before dialing so the private-address guard applies to
        // hostnames as well as literals.
        let addrs: Vec<SocketAddr> =
            match tokio::net::lookup_host((server.address.as_str(), server.port)).await {
                Ok(addrs) => addrs.collect(),
                Err(e) => {
                    log::debug!("servers.ping resolution failed for {}: {e}", server.address);
                    return Response::ok(req.id, PingResult::error("failed to resolve host"));
                }
            };

        if addrs.is_empty() {
            return Response::ok(req.id, PingResult::error("failed to resolve host"));
        }
        if addrs.iter().any(|addr| is_disallowed_address(addr.ip())) {
            return Response::ok(req.id, PingResult::error("cannot ping private addresses"));
        }

        let start = Instant::now();
        let result =
            tokio::time::timeout(PING_TIMEOUT, tokio::net::TcpStream::connect(addrs[0])).await;
        match result {
            Ok(Ok(_stream)) => {
                let latency = start.elapsed().as_millis() as u64;
                Response::ok(req.id, PingResult::latency(latency))
            }
            Ok(Err(e)) => {
                log::debug!("servers.ping connect failed for {}: {e}", addrs[0]);
                Response::ok(req.id, PingResult::error("connection failed"))
            }
            Err(_) => Response::ok(req.id, PingResult::error("connection timed out")),
        }
    }

    fn handle_shutdown(&self, req: Request) -> Response {
        log::info!("shutdown requested via IPC");

        let engine = Arc::clone(&self.engine);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            // Let the response flush before the core unwinds.
            tokio::time::sleep(SHUTDOWN_DELAY).await;
            if let Err(e) = engine.disconnect().await {
                log::warn!("disconnect during shutdown failed: {e}");
            }
            shutdown.cancel();
        });

        Response::ok(req.id, json!({ "ok": true }))
    }
}

/// Map an internal error message onto its user-facing form. Raw strings are
/// never forwarded over the pipe.
pub fn sanitize_error(raw: &str) -> &'static str {
    let lower = raw.to_lowercase();
    if lower.contains("not connected") {
        "backend service is not connected"
    } else if lower.contains("timeout") || lower.contains("timed out") {
        "request timed out"
    } else if lower.contains("connection refused") {
        "unable to reach server"
    } else if lower.contains("parse") {
        "invalid configuration"
    } else {
        "internal error, see service log for details"
    }
}

/// SSRF guard: reject loopback, RFC-1918, link-local and unspecified
/// targets.
fn is_disallowed_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unspecified()
                || is_unique_local_v6(&v6)
                || is_link_local_v6(&v6)
                || v6.to_ipv4_mapped().is_some_and(|v4| is_disallowed_address(IpAddr::V4(v4)))
        }
    }
}

/// fc00::/7
fn is_unique_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_link_local_v6(addr: &Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}
