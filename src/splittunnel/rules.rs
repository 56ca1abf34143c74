//! Route-rule compilation for split tunneling
//!
//! Produces sing-box route-rule fragments. The invert flag flips the target
//! outbound: selected items go to `proxy` normally and to `direct` when the
//! selection means "all except these".

use serde_json::{json, Value};

/// Strip protocol, path and port from a domain string.
///
/// Handles the case where a user pastes a URL instead of a bare domain.
pub fn sanitize_domain(domain: &str) -> String {
    let mut d = domain.trim();
    for prefix in ["https://", "http://"] {
        d = d.strip_prefix(prefix).unwrap_or(d);
    }
    if let Some(idx) = d.find('/') {
        d = &d[..idx];
    }
    if let Some(idx) = d.find(':') {
        d = &d[..idx];
    }
    d.trim().to_string()
}

/// Generate route rules for per-app split tunneling.
///
/// Empty app list compiles to no rule at all.
pub fn build_app_rules(apps: &[String], invert: bool) -> Vec<Value> {
    if apps.is_empty() {
        return Vec::new();
    }

    let outbound = if invert { "direct" } else { "proxy" };

    vec![json!({
        "process_name": apps,
        "outbound": outbound,
    })]
}

/// Generate route rules for per-domain split tunneling.
///
/// Entries starting with a dot match as suffixes only; bare names match both
/// exactly and as a suffix. Empty domain list compiles to no rule at all.
pub fn build_domain_rules(domains: &[String], invert: bool) -> Vec<Value> {
    if domains.is_empty() {
        return Vec::new();
    }

    let outbound = if invert { "direct" } else { "proxy" };

    let mut full_domains = Vec::new();
    let mut domain_suffixes = Vec::new();

    for raw in domains {
        let d = sanitize_domain(raw);
        if d.is_empty() {
            continue;
        }
        if let Some(suffix) = d.strip_prefix('.') {
            domain_suffixes.push(suffix.to_string());
        } else {
            full_domains.push(d.clone());
            domain_suffixes.push(d);
        }
    }

    let mut rule = json!({ "outbound": outbound });
    if !full_domains.is_empty() {
        rule["domain"] = json!(full_domains);
    }
    if !domain_suffixes.is_empty() {
        rule["domain_suffix"] = json!(domain_suffixes);
    }

    vec![rule]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    // --- sanitize_domain ---

    #[test]
    fn test_sanitize_strips_protocol_path_port() {
        assert_eq!(sanitize_domain("https://example.com/path"), "example.com");
        assert_eq!(sanitize_domain("http://example.com:8080"), "example.com");
        assert_eq!(sanitize_domain("example.com:443/x"), "example.com");
        assert_eq!(sanitize_domain("  example.com  "), "example.com");
        assert_eq!(sanitize_domain(".ads.net"), ".ads.net");
    }

    // --- app rules ---

    #[test]
    fn test_app_rules_normal() {
        let rules = build_app_rules(&strings(&["chrome.exe", "firefox.exe"]), false);
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0]["outbound"], "proxy");
        assert_eq!(rules[0]["process_name"], json!(["chrome.exe", "firefox.exe"]));
    }

    #[test]
    fn test_app_rules_inverted() {
        let rules = build_app_rules(&strings(&["chrome.exe"]), true);
        assert_eq!(rules[0]["outbound"], "direct");
    }

    #[test]
    fn test_app_rules_empty_list() {
        assert!(build_app_rules(&[], false).is_empty());
    }

    // --- domain rules ---

    #[test]
    fn test_domain_rules_mix_of_suffix_and_exact() {
        let rules = build_domain_rules(&strings(&[".ads.net", "example.com"]), false);
        assert_eq!(rules.len(), 1);
        let rule = &rules[0];
        assert_eq!(rule["outbound"], "proxy");
        assert_eq!(rule["domain"], json!(["example.com"]));
        assert_eq!(rule["domain_suffix"], json!(["ads.net", "example.com"]));
    }

    #[test]
    fn test_domain_rules_bare_name_appears_in_both_arrays() {
        let rules = build_domain_rules(&strings(&["example.com"]), false);
        let rule = &rules[0];
        assert_eq!(rule["domain"], json!(["example.com"]));
        assert_eq!(rule["domain_suffix"], json!(["example.com"]));
    }

    #[test]
    fn test_domain_rules_dot_prefix_has_no_exact_entry() {
        let rules = build_domain_rules(&strings(&[".tracker.io"]), false);
        let rule = &rules[0];
        assert!(rule.get("domain").is_none());
        assert_eq!(rule["domain_suffix"], json!(["tracker.io"]));
    }

    #[test]
    fn test_domain_rules_inverted() {
        let rules = build_domain_rules(&strings(&["example.com"]), true);
        assert_eq!(rules[0]["outbound"], "direct");
    }

    #[test]
    fn test_domain_rules_empty_list() {
        assert!(build_domain_rules(&[], false).is_empty());
    }

    #[test]
    fn test_domain_rules_skips_entries_that_sanitize_to_empty() {
        let rules = build_domain_rules(&strings(&["   ", "https://"]), false);
        let rule = &rules[0];
        assert!(rule.get("domain").is_none());
        assert!(rule.get("domain_suffix").is_none());
    }
}
