//! Split tunneling
//!
//! Compiles sing-box route-rule fragments for per-app and per-domain split
//! tunneling, and enumerates installed Windows applications (with icons) so
//! the UI can offer a picker.

pub mod apps;
pub mod rules;

#[cfg(windows)]
pub mod icons;

use serde::{Deserialize, Serialize};

pub use apps::list_installed_apps;
pub use rules::{build_app_rules, build_domain_rules};

/// Split-tunnel routing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SplitTunnelMode {
    #[default]
    Off,
    App,
    Domain,
}

impl SplitTunnelMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SplitTunnelMode::Off => "off",
            SplitTunnelMode::App => "app",
            SplitTunnelMode::Domain => "domain",
        }
    }
}

impl std::fmt::Display for SplitTunnelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Split-tunnel configuration as stored by the RPC handler and carried in
/// the runtime VPN config.
///
/// `invert` flips the selection: false routes only the selected apps/domains
/// through the VPN, true routes everything except them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SplitTunnelSettings {
    pub mode: SplitTunnelMode,
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub invert: bool,
}

/// An installed Windows application.
///
/// Within a single enumeration result, `exe_name` is unique
/// case-insensitively.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfo {
    pub name: String,
    pub exe_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub install_path: String,
    pub is_uwp: bool,
    /// Base64-encoded PNG, empty when extraction failed.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub icon: String,
}
