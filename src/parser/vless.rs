//! VLESS link parsing and outbound synthesis
//!
//! Format: `vless://uuid@host:port?params#name`

use serde_json::{json, Value};

use super::{parse_link_parts, LinkError, Protocol, ServerConfig};

/// Parse a VLESS URI into a [`ServerConfig`].
pub fn parse_vless(link: &str) -> Result<ServerConfig, LinkError> {
    let rest = link
        .trim()
        .strip_prefix("vless://")
        .ok_or(LinkError::InvalidScheme)?;

    let mut parts = parse_link_parts(rest)?;
    parts
        .params
        .insert("uuid".to_string(), parts.credential.clone());

    // Defaults for common params
    parts
        .params
        .entry("type".to_string())
        .or_insert_with(|| "tcp".to_string());
    parts
        .params
        .entry("security".to_string())
        .or_insert_with(|| "none".to_string());

    Ok(ServerConfig {
        protocol: Protocol::Vless,
        name: parts.name,
        address: parts.host,
        port: parts.port,
        params: parts.params,
    })
}

/// Build the sing-box `proxy` outbound for a VLESS server.
pub fn build_vless_outbound(cfg: &ServerConfig) -> Value {
    let param = |key: &str| cfg.params.get(key).map(String::as_str);

    let mut outbound = json!({
        "type": "vless",
        "tag": "proxy",
        "server": cfg.address,
        "server_port": cfg.port,
        "uuid": param("uuid").unwrap_or_default(),
    });

    // Flow (for XTLS)
    if let Some(flow) = param("flow").filter(|f| !f.is_empty()) {
        outbound["flow"] = json!(flow);
    }

    match param("type") {
        Some("ws") => {
            let mut transport = json!({ "type": "ws" });
            if let Some(path) = param("path") {
                transport["path"] = json!(path);
            }
            if let Some(host) = param("host") {
                transport["headers"] = json!({ "Host": host });
            }
            outbound["transport"] = transport;
        }
        Some("grpc") => {
            let mut transport = json!({ "type": "grpc" });
            if let Some(service_name) = param("serviceName") {
                transport["service_name"] = json!(service_name);
            }
            outbound["transport"] = transport;
        }
        Some("h2") | Some("http") => {
            let mut transport = json!({ "type": "http" });
            if let Some(path) = param("path") {
                transport["path"] = json!(path);
            }
            if let Some(host) = param("host") {
                transport["host"] = json!([host]);
            }
            outbound["transport"] = transport;
        }
        Some("httpupgrade") => {
            let mut transport = json!({ "type": "httpupgrade" });
            if let Some(path) = param("path") {
                transport["path"] = json!(path);
            }
            if let Some(host) = param("host") {
                transport["host"] = json!(host);
            }
            outbound["transport"] = transport;
        }
        _ => {}
    }

    match param("security") {
        Some("tls") => {
            let mut tls = json!({ "enabled": true });
            if let Some(sni) = param("sni") {
                tls["server_name"] = json!(sni);
            }
            if let Some(alpn) = param("alpn").filter(|a| !a.is_empty()) {
                tls["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
            }
            if let Some(fp) = param("fp").filter(|f| !f.is_empty()) {
                tls["utls"] = json!({ "enabled": true, "fingerprint": fp });
            }
            outbound["tls"] = tls;
        }
        Some("reality") => {
            let mut tls = json!({ "enabled": true });
            if let Some(sni) = param("sni") {
                tls["server_name"] = json!(sni);
            }
            let mut reality = json!({ "enabled": true });
            if let Some(pbk) = param("pbk") {
                reality["public_key"] = json!(pbk);
            }
            if let Some(sid) = param("sid") {
                reality["short_id"] = json!(sid);
            }
            tls["reality"] = reality;
            if let Some(fp) = param("fp").filter(|f| !f.is_empty()) {
                tls["utls"] = json!({ "enabled": true, "fingerprint": fp });
            }
            outbound["tls"] = tls;
        }
        _ => {}
    }

    outbound
}
