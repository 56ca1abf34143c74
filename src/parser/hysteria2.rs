//! Hysteria2 link parsing and outbound synthesis
//!
//! Format: `hysteria2://password@host:port?params#name`
//! Also supports the `hy2://` alias.

use serde_json::{json, Value};

use super::{parse_link_parts, LinkError, Protocol, ServerConfig};

/// Parse a Hysteria2 URI into a [`ServerConfig`].
pub fn parse_hysteria2(link: &str) -> Result<ServerConfig, LinkError> {
    let link = link.trim();
    let rest = link
        .strip_prefix("hysteria2://")
        .or_else(|| link.strip_prefix("hy2://"))
        .ok_or(LinkError::InvalidScheme)?;

    let mut parts = parse_link_parts(rest)?;
    parts
        .params
        .insert("password".to_string(), parts.credential.clone());

    Ok(ServerConfig {
        protocol: Protocol::Hysteria2,
        name: parts.name,
        address: parts.host,
        port: parts.port,
        params: parts.params,
    })
}

/// Build the sing-box `proxy` outbound for a Hysteria2 server.
pub fn build_hysteria2_outbound(cfg: &ServerConfig) -> Value {
    let param = |key: &str| cfg.params.get(key).map(String::as_str);

    let mut outbound = json!({
        "type": "hysteria2",
        "tag": "proxy",
        "server": cfg.address,
        "server_port": cfg.port,
        "password": param("password").unwrap_or_default(),
    });

    // TLS is always enabled for Hysteria2.
    let mut tls = json!({ "enabled": true });
    if let Some(sni) = param("sni").filter(|s| !s.is_empty()) {
        tls["server_name"] = json!(sni);
    }
    if let Some(alpn) = param("alpn").filter(|a| !a.is_empty()) {
        tls["alpn"] = json!(alpn.split(',').collect::<Vec<_>>());
    }
    if param("insecure") == Some("1") {
        log::warn!(
            "TLS certificate verification DISABLED for {}:{} — connection is vulnerable to MITM",
            cfg.address,
            cfg.port
        );
        tls["insecure"] = json!(true);
    }
    outbound["tls"] = tls;

    // Obfuscation
    if let Some(obfs) = param("obfs").filter(|o| !o.is_empty()) {
        let mut obfs_cfg = json!({ "type": obfs });
        if let Some(obfs_password) = param("obfs-password") {
            obfs_cfg["password"] = json!(obfs_password);
        }
        outbound["obfs"] = obfs_cfg;
    }

    // Bandwidth hints
    if let Some(up) = param("up") {
        outbound["up_mbps"] = json!(up.parse::<u32>().unwrap_or(0));
    }
    if let Some(down) = param("down") {
        outbound["down_mbps"] = json!(down.parse::<u32>().unwrap_or(0));
    }

    outbound
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hy2_alias_with_obfs() {
        let cfg = parse_hysteria2("hy2://pw@1.2.3.4?obfs=salamander&obfs-password=x&insecure=1#hy2")
            .unwrap();

        assert_eq!(cfg.protocol, Protocol::Hysteria2);
        assert_eq!(cfg.address, "1.2.3.4");
        assert_eq!(cfg.port, 443);
        assert_eq!(cfg.name, "hy2");
        assert_eq!(cfg.params.get("password").map(String::as_str), Some("pw"));
        assert_eq!(
            cfg.params.get("obfs").map(String::as_str),
            Some("salamander")
        );
    }

    #[test]
    fn test_parse_hy2_percent_encoded_password() {
        let cfg = parse_hysteria2("hysteria2://p%40ss%3Aword@server:443#T").unwrap();
        assert_eq!(
            cfg.params.get("password").map(String::as_str),
            Some("p@ss:word")
        );
    }

    #[test]
    fn test_parse_hy2_missing_password() {
        assert!(matches!(
            parse_hysteria2("hysteria2://@server:443"),
            Err(LinkError::MissingCredential)
        ));
    }

    #[test]
    fn test_outbound_basic() {
        let cfg = parse_hysteria2("hysteria2://secret@hy2.example.com:4443?sni=sni.example#H")
            .unwrap();
        let out = build_hysteria2_outbound(&cfg);

        assert_eq!(out["type"], "hysteria2");
        assert_eq!(out["tag"], "proxy");
        assert_eq!(out["server"], "hy2.example.com");
        assert_eq!(out["server_port"], 4443);
        assert_eq!(out["password"], "secret");
        assert_eq!(out["tls"]["enabled"], true);
        assert_eq!(out["tls"]["server_name"], "sni.example");
        assert!(out["tls"].get("insecure").is_none());
    }

    #[test]
    fn test_outbound_insecure_flag() {
        let cfg = parse_hysteria2("hysteria2://pw@1.2.3.4?insecure=1#I").unwrap();
        let out = build_hysteria2_outbound(&cfg);
        assert_eq!(out["tls"]["insecure"], true);
    }

    #[test]
    fn test_outbound_obfs_and_bandwidth() {
        let cfg = parse_hysteria2(
            "hysteria2://pw@server:443?obfs=salamander&obfs-password=ob&up=100&down=200#B",
        )
        .unwrap();
        let out = build_hysteria2_outbound(&cfg);

        assert_eq!(out["obfs"]["type"], "salamander");
        assert_eq!(out["obfs"]["password"], "ob");
        assert_eq!(out["up_mbps"], 100);
        assert_eq!(out["down_mbps"], 200);
    }

    #[test]
    fn test_outbound_invalid_bandwidth_defaults_to_zero() {
        let cfg = parse_hysteria2("hysteria2://pw@server:443?up=fast#B").unwrap();
        let out = build_hysteria2_outbound(&cfg);
        assert_eq!(out["up_mbps"], 0);
    }
}
