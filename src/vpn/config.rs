//! Runtime VPN configuration and sing-box document synthesis
//!
//! Assembles the complete JSON configuration handed to the embedded proxy
//! engine: log, DNS, the TUN inbound, the four outbounds, route rules
//! (including split-tunnel fragments) and the Clash control-plane listener.

use serde_json::{json, Value};

use super::{VpnError, VpnResult};
use crate::parser::{Protocol, ServerConfig};
use crate::splittunnel::{build_app_rules, build_domain_rules, SplitTunnelMode, SplitTunnelSettings};

/// Address of the engine's Clash-compatible control-plane API.
pub const CLASH_API_ADDR: &str = "127.0.0.1:9090";

/// Name of the TUN interface created by the engine.
const TUN_INTERFACE_NAME: &str = "MRVPN";

/// Default MTU for the TUN inbound.
const DEFAULT_MTU: u32 = 9000;

/// DNS provider selection.
///
/// `System` carries no upstream of its own and resolves like the default
/// provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DnsMode {
    #[default]
    Cloudflare,
    Google,
    Custom,
    System,
}

/// Runtime VPN configuration options.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: Option<ServerConfig>,
    pub dns: DnsMode,
    /// Used when `dns` is [`DnsMode::Custom`].
    pub custom_dns: String,
    pub mtu: u32,
    pub kill_switch: bool,
    pub split_tunnel: SplitTunnelSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: None,
            dns: DnsMode::Cloudflare,
            custom_dns: String::new(),
            mtu: DEFAULT_MTU,
            kill_switch: false,
            split_tunnel: SplitTunnelSettings::default(),
        }
    }
}

/// Build the complete sing-box JSON configuration for the given config.
pub fn build_engine_config(cfg: &Config) -> VpnResult<Value> {
    let server = cfg.server.as_ref().ok_or(VpnError::MissingServer)?;

    let proxy_outbound = match server.protocol {
        Protocol::Vless => crate::parser::build_vless_outbound(server),
        Protocol::Hysteria2 => crate::parser::build_hysteria2_outbound(server),
    };

    let (route_rules, final_outbound) = build_route_rules(&cfg.split_tunnel);

    Ok(json!({
        "log": {
            "level": "info",
            "timestamp": true,
        },
        "dns": build_dns_config(cfg),
        "inbounds": [
            {
                "type": "tun",
                "tag": "tun-in",
                "interface_name": TUN_INTERFACE_NAME,
                "inet4_address": "172.19.0.1/30",
                "inet6_address": "fdfe:dcba:9876::1/126",
                "mtu": cfg.mtu,
                "auto_route": true,
                "strict_route": cfg.kill_switch,
                "stack": "mixed",
                "sniff": true,
                "sniff_override_destination": true,
            }
        ],
        "outbounds": [
            proxy_outbound,
            { "type": "direct", "tag": "direct" },
            { "type": "block", "tag": "block" },
            { "type": "dns", "tag": "dns-out" },
        ],
        "route": {
            "rules": route_rules,
            "final": final_outbound,
            "auto_detect_interface": true,
            "find_process": cfg.split_tunnel.mode == SplitTunnelMode::App,
        },
        "experimental": {
            "clash_api": {
                "external_controller": CLASH_API_ADDR,
            }
        },
    }))
}

/// Two DNS servers: a remote one routed via the proxy outbound and a local
/// one routed direct, with `outbound=any` forced to the local server.
fn build_dns_config(cfg: &Config) -> Value {
    let (remote_dns, local_dns) = match cfg.dns {
        DnsMode::Google => ("https://dns.google/dns-query".to_string(), "8.8.8.8".to_string()),
        DnsMode::Custom => (cfg.custom_dns.clone(), cfg.custom_dns.clone()),
        DnsMode::Cloudflare | DnsMode::System => (
            "https://cloudflare-dns.com/dns-query".to_string(),
            "1.1.1.1".to_string(),
        ),
    };

    json!({
        "servers": [
            { "tag": "remote-dns", "address": remote_dns, "detour": "proxy" },
            { "tag": "local-dns", "address": local_dns, "detour": "direct" },
        ],
        "rules": [
            { "outbound": ["any"], "server": "local-dns" },
        ],
        "final": "remote-dns",
    })
}

/// Route rules: the DNS-hijack rule first, then split-tunnel fragments.
///
/// Returns the rules plus the derived `final` outbound: `proxy` by default,
/// `direct` in non-inverted app/domain modes (selected traffic goes through
/// the proxy, everything else direct).
fn build_route_rules(split: &SplitTunnelSettings) -> (Vec<Value>, &'static str) {
    let mut rules = vec![json!({
        "protocol": "dns",
        "outbound": "dns-out",
    })];

    let mut final_outbound = "proxy";

    match split.mode {
        SplitTunnelMode::App => {
            rules.extend(build_app_rules(&split.apps, split.invert));
            final_outbound = if split.invert { "proxy" } else { "direct" };
        }
        SplitTunnelMode::Domain => {
            rules.extend(build_domain_rules(&split.domains, split.invert));
            final_outbound = if split.invert { "proxy" } else { "direct" };
        }
        SplitTunnelMode::Off => {}
    }

    (rules, final_outbound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_link;

    fn test_config() -> Config {
        Config {
            server: Some(parse_link("vless://uuid@example.com:443?type=tcp#Test").unwrap()),
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.dns, DnsMode::Cloudflare);
        assert_eq!(cfg.mtu, 9000);
        assert!(!cfg.kill_switch);
        assert_eq!(cfg.split_tunnel.mode, SplitTunnelMode::Off);
    }

    #[test]
    fn test_missing_server_fails() {
        assert!(matches!(
            build_engine_config(&Config::default()),
            Err(VpnError::MissingServer)
        ));
    }

    #[test]
    fn test_document_shape() {
        let doc = build_engine_config(&test_config()).unwrap();

        // Exactly one TUN inbound tagged tun-in.
        let inbounds = doc["inbounds"].as_array().unwrap();
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0]["type"], "tun");
        assert_eq!(inbounds[0]["tag"], "tun-in");
        assert_eq!(inbounds[0]["interface_name"], "MRVPN");
        assert_eq!(inbounds[0]["inet4_address"], "172.19.0.1/30");
        assert_eq!(inbounds[0]["mtu"], 9000);
        assert_eq!(inbounds[0]["auto_route"], true);
        assert_eq!(inbounds[0]["strict_route"], false);

        // Four outbounds tagged proxy/direct/block/dns-out.
        let tags: Vec<&str> = doc["outbounds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["proxy", "direct", "block", "dns-out"]);

        // DNS-hijack rule precedes all others.
        let rules = doc["route"]["rules"].as_array().unwrap();
        assert_eq!(rules[0]["protocol"], "dns");
        assert_eq!(rules[0]["outbound"], "dns-out");

        assert_eq!(doc["route"]["final"], "proxy");
        assert_eq!(doc["route"]["find_process"], false);
        assert_eq!(
            doc["experimental"]["clash_api"]["external_controller"],
            "127.0.0.1:9090"
        );
    }

    #[test]
    fn test_kill_switch_enables_strict_route() {
        let mut cfg = test_config();
        cfg.kill_switch = true;
        let doc = build_engine_config(&cfg).unwrap();
        assert_eq!(doc["inbounds"][0]["strict_route"], true);
    }

    #[test]
    fn test_dns_cloudflare_default() {
        let doc = build_engine_config(&test_config()).unwrap();
        let servers = doc["dns"]["servers"].as_array().unwrap();
        assert_eq!(servers[0]["address"], "https://cloudflare-dns.com/dns-query");
        assert_eq!(servers[0]["detour"], "proxy");
        assert_eq!(servers[1]["address"], "1.1.1.1");
        assert_eq!(servers[1]["detour"], "direct");
        assert_eq!(doc["dns"]["final"], "remote-dns");
        assert_eq!(doc["dns"]["rules"][0]["server"], "local-dns");
    }

    #[test]
    fn test_dns_google() {
        let mut cfg = test_config();
        cfg.dns = DnsMode::Google;
        let doc = build_engine_config(&cfg).unwrap();
        assert_eq!(
            doc["dns"]["servers"][0]["address"],
            "https://dns.google/dns-query"
        );
        assert_eq!(doc["dns"]["servers"][1]["address"], "8.8.8.8");
    }

    #[test]
    fn test_dns_custom() {
        let mut cfg = test_config();
        cfg.dns = DnsMode::Custom;
        cfg.custom_dns = "9.9.9.9".to_string();
        let doc = build_engine_config(&cfg).unwrap();
        assert_eq!(doc["dns"]["servers"][0]["address"], "9.9.9.9");
        assert_eq!(doc["dns"]["servers"][1]["address"], "9.9.9.9");
    }

    #[test]
    fn test_app_mode_enables_find_process_and_direct_final() {
        let mut cfg = test_config();
        cfg.split_tunnel = SplitTunnelSettings {
            mode: SplitTunnelMode::App,
            apps: vec!["chrome.exe".to_string()],
            domains: vec![],
            invert: false,
        };
        let doc = build_engine_config(&cfg).unwrap();

        assert_eq!(doc["route"]["find_process"], true);
        assert_eq!(doc["route"]["final"], "direct");

        let rules = doc["route"]["rules"].as_array().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1]["process_name"], json!(["chrome.exe"]));
        assert_eq!(rules[1]["outbound"], "proxy");
    }

    #[test]
    fn test_app_mode_inverted_keeps_proxy_final() {
        let mut cfg = test_config();
        cfg.split_tunnel = SplitTunnelSettings {
            mode: SplitTunnelMode::App,
            apps: vec!["chrome.exe".to_string()],
            domains: vec![],
            invert: true,
        };
        let doc = build_engine_config(&cfg).unwrap();

        assert_eq!(doc["route"]["final"], "proxy");
        assert_eq!(doc["route"]["rules"][1]["outbound"], "direct");
    }

    #[test]
    fn test_domain_mode_does_not_enable_find_process() {
        let mut cfg = test_config();
        cfg.split_tunnel = SplitTunnelSettings {
            mode: SplitTunnelMode::Domain,
            apps: vec![],
            domains: vec![".ads.net".to_string(), "example.com".to_string()],
            invert: false,
        };
        let doc = build_engine_config(&cfg).unwrap();

        assert_eq!(doc["route"]["find_process"], false);
        assert_eq!(doc["route"]["final"], "direct");

        let rule = &doc["route"]["rules"][1];
        assert_eq!(rule["outbound"], "proxy");
        assert_eq!(rule["domain"], json!(["example.com"]));
        assert_eq!(rule["domain_suffix"], json!(["ads.net", "example.com"]));
    }

    #[test]
    fn test_empty_app_list_emits_no_split_rule() {
        let mut cfg = test_config();
        cfg.split_tunnel.mode = SplitTunnelMode::App;
        let doc = build_engine_config(&cfg).unwrap();
        assert_eq!(doc["route"]["rules"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_hysteria2_server_builds() {
        let mut cfg = test_config();
        cfg.server = Some(parse_link("hy2://pw@1.2.3.4?insecure=1#hy2").unwrap());
        let doc = build_engine_config(&cfg).unwrap();
        assert_eq!(doc["outbounds"][0]["type"], "hysteria2");
        assert_eq!(doc["outbounds"][0]["tls"]["insecure"], true);
    }
}
