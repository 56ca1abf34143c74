//! IPC wire types
//!
//! Newline-delimited UTF-8 JSON over the named pipe. Requests carry an `id`
//! echoed in the matching response; server-initiated notifications carry no
//! `id` at all.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// Standard error codes.
pub const ERR_PARSE: i32 = -32700;
pub const ERR_INVALID_REQUEST: i32 = -32600;
pub const ERR_METHOD_NOT_FOUND: i32 = -32601;
pub const ERR_INVALID_PARAMS: i32 = -32602;
pub const ERR_INTERNAL: i32 = -32603;

/// A JSON-RPC request from the UI.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

/// A JSON-RPC response sent back to the UI.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Successful response carrying a result value.
    pub fn ok(id: String, result: impl Serialize) -> Self {
        Self {
            id,
            result: serde_json::to_value(result).ok(),
            error: None,
        }
    }

    /// Error response. The underlying cause is logged by the caller; only
    /// sanitized messages belong here.
    pub fn error(id: String, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }
}

/// A server-initiated push message (no id).
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Notification {
    pub fn new(method: &str, params: impl Serialize) -> Self {
        Self {
            method: method.to_string(),
            params: serde_json::to_value(params).ok(),
        }
    }
}

/// An error in a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

/// Parameters for the `vpn.connect` method.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub link: String,
    /// When absent, the stored split-tunnel configuration applies.
    #[serde(default)]
    pub split_tunnel_mode: Option<crate::splittunnel::SplitTunnelMode>,
    #[serde(default)]
    pub split_tunnel_apps: Vec<String>,
    #[serde(default)]
    pub split_tunnel_domains: Vec<String>,
    #[serde(default)]
    pub split_tunnel_invert: bool,
}

/// Result of `vpn.status`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<i64>,
}

/// Params pushed via the `vpn.stateChanged` notification.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateChangedParams {
    pub state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Params pushed via the `vpn.statsUpdate` notification (bytes; speeds in
/// bytes/s).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsUpdateParams {
    pub upload: u64,
    pub download: u64,
    pub up_speed: u64,
    pub down_speed: u64,
}

/// Parameters for the `servers.ping` method.
#[derive(Debug, Clone, Deserialize)]
pub struct PingParams {
    pub link: String,
}

/// Result of `servers.ping`.
#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    /// Milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PingResult {
    pub fn latency(ms: u64) -> Self {
        Self {
            latency: Some(ms),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            latency: None,
            error: Some(message.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_parses_without_params() {
        let req: Request = serde_json::from_str(r#"{"id":"1","method":"vpn.status"}"#).unwrap();
        assert_eq!(req.id, "1");
        assert_eq!(req.method, "vpn.status");
        assert!(req.params.is_none());
    }

    #[test]
    fn test_request_missing_id_defaults_to_empty() {
        let req: Request = serde_json::from_str(r#"{"method":"vpn.status"}"#).unwrap();
        assert_eq!(req.id, "");
    }

    #[test]
    fn test_response_ok_shape() {
        let json =
            serde_json::to_value(Response::ok("7".to_string(), serde_json::json!({"ok": true})))
                .unwrap();
        assert_eq!(json["id"], "7");
        assert_eq!(json["result"]["ok"], true);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_response_error_shape() {
        let json = serde_json::to_value(Response::error(
            "9".to_string(),
            ERR_METHOD_NOT_FOUND,
            "method not found: x",
        ))
        .unwrap();
        assert_eq!(json["id"], "9");
        assert!(json.get("result").is_none());
        assert_eq!(json["error"]["code"], -32601);
    }

    #[test]
    fn test_notification_has_no_id() {
        let json = serde_json::to_value(Notification::new(
            "vpn.statsUpdate",
            StatsUpdateParams {
                upload: 1,
                download: 2,
                up_speed: 3,
                down_speed: 4,
            },
        ))
        .unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["method"], "vpn.statsUpdate");
        assert_eq!(json["params"]["upSpeed"], 3);
        assert_eq!(json["params"]["downSpeed"], 4);
    }

    #[test]
    fn test_connect_params_mode_is_optional() {
        let params: ConnectParams =
            serde_json::from_str(r#"{"link":"vless://u@h:443"}"#).unwrap();
        assert!(params.split_tunnel_mode.is_none());

        let params: ConnectParams = serde_json::from_str(
            r#"{"link":"vless://u@h:443","splitTunnelMode":"app","splitTunnelApps":["chrome.exe"]}"#,
        )
        .unwrap();
        assert_eq!(
            params.split_tunnel_mode,
            Some(crate::splittunnel::SplitTunnelMode::App)
        );
        assert_eq!(params.split_tunnel_apps, vec!["chrome.exe"]);
    }

    #[test]
    fn test_status_result_omits_absent_fields() {
        let json = serde_json::to_value(StatusResult {
            state: "disconnected".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["state"], "disconnected");
        assert!(json.get("serverName").is_none());
        assert!(json.get("connectedAt").is_none());
    }

    #[test]
    fn test_ping_result_variants() {
        let json = serde_json::to_value(PingResult::latency(42)).unwrap();
        assert_eq!(json["latency"], 42);
        assert!(json.get("error").is_none());

        let json = serde_json::to_value(PingResult::error("cannot ping private addresses")).unwrap();
        assert!(json.get("latency").is_none());
        assert_eq!(json["error"], "cannot ping private addresses");
    }
}
