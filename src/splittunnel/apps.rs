//! Installed-application enumeration
//!
//! Win32 applications come from the Uninstall registry trees (HKLM and HKCU,
//! native and WOW6432 views); UWP applications come from PowerShell's
//! Get-AppxPackage. Entries are deduplicated case-insensitively by exe name,
//! given an icon where extraction succeeds, and sorted by display name.

use std::path::{Path, PathBuf};

use super::AppInfo;

/// Return all installed Windows applications.
pub fn list_installed_apps() -> Vec<AppInfo> {
    let mut apps = list_win32_apps();
    apps.extend(list_uwp_apps());

    let mut unique = dedupe_apps(apps);

    for app in &mut unique {
        if let Some(exe_path) = resolve_exe_path(app) {
            #[cfg(windows)]
            {
                app.icon = super::icons::extract_icon_base64(&exe_path);
            }
            #[cfg(not(windows))]
            {
                let _ = exe_path;
            }
        }
    }

    // Sort alphabetically by display name.
    unique.sort_by(|a, b| a.name.to_lowercase().cmp(&b.name.to_lowercase()));
    unique
}

/// Drop entries with an empty exe name and deduplicate case-insensitively on
/// the exe name, keeping the first occurrence.
fn dedupe_apps(apps: Vec<AppInfo>) -> Vec<AppInfo> {
    let mut seen = std::collections::HashSet::new();
    let mut unique = Vec::new();

    for app in apps {
        let key = app.exe_name.to_lowercase();
        if key.is_empty() || !seen.insert(key) {
            continue;
        }
        unique.push(app);
    }

    unique
}

/// Full path to an application executable, when it exists on disk.
fn resolve_exe_path(app: &AppInfo) -> Option<PathBuf> {
    if app.install_path.is_empty() || app.exe_name.is_empty() {
        return None;
    }
    let full = Path::new(&app.install_path).join(&app.exe_name);
    full.is_file().then_some(full)
}

/// Known updater/helper executables that should be skipped in favor of the
/// real application exe.
fn is_updater_exe(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower == "update.exe"
        || lower == "unins000.exe"
        || lower == "uninstall.exe"
        || lower.contains("updater")
        || lower.contains("uninstall")
        || lower.contains("helper")
}

/// Determine the exe name and its directory from registry values.
///
/// Handles normal installs, DisplayIcon paths, and Squirrel/Electron apps
/// (Discord, Telegram, Slack, VS Code, etc.) where the real exe lives in an
/// `app-<version>` subdirectory.
fn resolve_app_exe(
    display_name: &str,
    install_location: &str,
    display_icon: &str,
    uninstall_string: &str,
) -> Option<(String, String)> {
    // Strategy 1: DisplayIcon points directly to an exe.
    if !display_icon.is_empty() {
        let icon = display_icon.split(',').next().unwrap_or_default().trim_matches('"');
        if icon.to_lowercase().ends_with(".exe") {
            let path = Path::new(icon);
            if let Some(base) = path.file_name().and_then(|n| n.to_str()) {
                if !is_updater_exe(base) && path.is_file() {
                    let dir = path.parent()?.to_string_lossy().into_owned();
                    return Some((base.to_string(), dir));
                }
            }
        }
    }

    // Strategy 2: Squirrel/Electron pattern — look in app-* subdirectories.
    if !install_location.is_empty() {
        if let Some(exe) = find_exe_in_squirrel_app(Path::new(install_location), display_name) {
            let base = exe.file_name()?.to_string_lossy().into_owned();
            let dir = exe.parent()?.to_string_lossy().into_owned();
            return Some((base, dir));
        }
    }

    // Strategy 3: Direct exe in InstallLocation (skip updaters).
    if !install_location.is_empty() {
        if let Some(exe) = find_main_exe_in_dir(Path::new(install_location)) {
            return Some((exe, install_location.to_string()));
        }
    }

    // Strategy 4: Derive from UninstallString path.
    if !uninstall_string.is_empty() {
        let path = uninstall_string.split(' ').next().unwrap_or_default().trim_matches('"');
        if path.to_lowercase().ends_with(".exe") {
            let path = Path::new(path);
            if let Some(base) = path.file_name().and_then(|n| n.to_str()) {
                if !is_updater_exe(base) && path.is_file() {
                    let dir = path.parent()?.to_string_lossy().into_owned();
                    return Some((base.to_string(), dir));
                }
            }
        }
    }

    None
}

/// Find the main exe inside the latest `app-<version>` subdirectory
/// (Squirrel pattern), preferring one whose name matches the display name.
fn find_exe_in_squirrel_app(dir: &Path, display_name: &str) -> Option<PathBuf> {
    let entries = std::fs::read_dir(dir).ok()?;

    let mut app_dirs: Vec<PathBuf> = entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with("app-"))
        .map(|e| e.path())
        .collect();
    app_dirs.sort();
    let latest = app_dirs.pop()?;

    let name_key = display_name.to_lowercase().replace(' ', "");
    let mut fallback = None;

    for entry in std::fs::read_dir(&latest).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !file_name.to_lowercase().ends_with(".exe") || is_updater_exe(file_name) {
            continue;
        }

        // Prefer an exe whose stem matches the display name.
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase().replace(' ', ""))
            .unwrap_or_default();
        if stem == name_key || name_key.contains(&stem) {
            return Some(path);
        }
        if fallback.is_none() {
            fallback = Some(path);
        }
    }

    fallback
}

/// First non-updater exe directly inside a directory.
fn find_main_exe_in_dir(dir: &Path) -> Option<String> {
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.to_lowercase().ends_with(".exe") && !is_updater_exe(name) {
            return Some(name.to_string());
        }
    }
    None
}

/// Walk the Uninstall registry trees for Win32 applications.
#[cfg(windows)]
fn list_win32_apps() -> Vec<AppInfo> {
    use winreg::enums::{HKEY_CURRENT_USER, HKEY_LOCAL_MACHINE, KEY_READ};
    use winreg::RegKey;

    const SUB_PATHS: [&str; 2] = [
        r"SOFTWARE\Microsoft\Windows\CurrentVersion\Uninstall",
        r"SOFTWARE\WOW6432Node\Microsoft\Windows\CurrentVersion\Uninstall",
    ];

    let mut apps = Vec::new();

    for hive in [HKEY_LOCAL_MACHINE, HKEY_CURRENT_USER] {
        for sub_path in SUB_PATHS {
            let Ok(key) = RegKey::predef(hive).open_subkey_with_flags(sub_path, KEY_READ) else {
                continue;
            };

            for sub_key_name in key.enum_keys().flatten() {
                let Ok(sub_key) = key.open_subkey_with_flags(&sub_key_name, KEY_READ) else {
                    continue;
                };

                let display_name: String = sub_key.get_value("DisplayName").unwrap_or_default();
                if display_name.is_empty() {
                    continue;
                }
                let install_location: String =
                    sub_key.get_value("InstallLocation").unwrap_or_default();
                let display_icon: String = sub_key.get_value("DisplayIcon").unwrap_or_default();
                let uninstall_string: String =
                    sub_key.get_value("UninstallString").unwrap_or_default();

                let Some((exe_name, exe_dir)) = resolve_app_exe(
                    &display_name,
                    &install_location,
                    &display_icon,
                    &uninstall_string,
                ) else {
                    continue;
                };

                apps.push(AppInfo {
                    name: display_name,
                    exe_name,
                    install_path: if exe_dir.is_empty() {
                        install_location
                    } else {
                        exe_dir
                    },
                    is_uwp: false,
                    icon: String::new(),
                });
            }
        }
    }

    apps
}

#[cfg(not(windows))]
fn list_win32_apps() -> Vec<AppInfo> {
    Vec::new()
}

/// Enumerate UWP packages via PowerShell, filtered to store-signed,
/// non-framework packages with an executable entry point.
#[cfg(windows)]
fn list_uwp_apps() -> Vec<AppInfo> {
    use crate::utils::hidden_command;

    const SCRIPT: &str = "Get-AppxPackage | Where-Object {$_.IsFramework -eq $false -and \
        $_.SignatureKind -eq 'Store'} | ForEach-Object { $manifest = Get-AppxPackageManifest $_; \
        $app = $manifest.Package.Applications.Application; if ($app) { $name = $_.Name; \
        $exe = if ($app.Executable) { $app.Executable } else { 'N/A' }; \"$name|$exe\" } }";

    let output = match hidden_command("powershell")
        .args(["-NoProfile", "-Command", SCRIPT])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            log::warn!("failed to list UWP apps: {e}");
            return Vec::new();
        }
    };

    if !output.status.success() {
        log::warn!("Get-AppxPackage failed with status {}", output.status);
        return Vec::new();
    }

    parse_uwp_output(&String::from_utf8_lossy(&output.stdout))
}

#[cfg(not(windows))]
fn list_uwp_apps() -> Vec<AppInfo> {
    Vec::new()
}

/// Parse `name|executable` lines produced by the UWP enumeration script.
fn parse_uwp_output(output: &str) -> Vec<AppInfo> {
    let mut apps = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((name, exe)) = line.split_once('|') else {
            continue;
        };
        let exe_name = exe
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or_default()
            .to_string();
        if exe_name.is_empty() || exe_name == "N/A" {
            continue;
        }

        apps.push(AppInfo {
            name: name.to_string(),
            exe_name,
            install_path: String::new(),
            is_uwp: true,
            icon: String::new(),
        });
    }

    apps
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(name: &str, exe: &str) -> AppInfo {
        AppInfo {
            name: name.to_string(),
            exe_name: exe.to_string(),
            install_path: String::new(),
            is_uwp: false,
            icon: String::new(),
        }
    }

    // --- updater predicate ---

    #[test]
    fn test_is_updater_exe() {
        assert!(is_updater_exe("Update.exe"));
        assert!(is_updater_exe("unins000.exe"));
        assert!(is_updater_exe("Uninstall.exe"));
        assert!(is_updater_exe("GoogleUpdater.exe"));
        assert!(is_updater_exe("uninstall-helper.exe"));
        assert!(is_updater_exe("crashhelper.exe"));

        assert!(!is_updater_exe("Discord.exe"));
        assert!(!is_updater_exe("chrome.exe"));
    }

    // --- dedup ---

    #[test]
    fn test_dedupe_is_case_insensitive_and_keeps_first() {
        let apps = vec![
            app("Discord", "Discord.exe"),
            app("Discord (user)", "discord.exe"),
            app("Chrome", "chrome.exe"),
        ];
        let unique = dedupe_apps(apps);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].name, "Discord");
        assert_eq!(unique[1].name, "Chrome");
    }

    #[test]
    fn test_dedupe_rejects_empty_exe_names() {
        let unique = dedupe_apps(vec![app("Broken", ""), app("Chrome", "chrome.exe")]);
        assert_eq!(unique.len(), 1);
        assert_eq!(unique[0].exe_name, "chrome.exe");
    }

    #[test]
    fn test_no_two_entries_share_lowercased_exe_name() {
        let apps = vec![
            app("A", "App.exe"),
            app("B", "APP.EXE"),
            app("C", "app.exe"),
            app("D", "other.exe"),
        ];
        let unique = dedupe_apps(apps);
        let mut keys: Vec<String> = unique.iter().map(|a| a.exe_name.to_lowercase()).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), unique.len());
    }

    // --- UWP output parsing ---

    #[test]
    fn test_parse_uwp_output() {
        let output = "Microsoft.WindowsCalculator|CalculatorApp.exe\r\n\
                      Broken.NoExe|N/A\r\n\
                      NoSeparatorLine\r\n\
                      Microsoft.Terminal|bin\\WindowsTerminal.exe\r\n";
        let apps = parse_uwp_output(output);
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "Microsoft.WindowsCalculator");
        assert_eq!(apps[0].exe_name, "CalculatorApp.exe");
        assert!(apps[0].is_uwp);
        assert_eq!(apps[1].exe_name, "WindowsTerminal.exe");
    }

    // --- Squirrel layout ---

    fn unique_temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("mrvpn-{}-{}", tag, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_squirrel_prefers_latest_app_dir_and_name_match() {
        let root = unique_temp_dir("squirrel");
        for version in ["app-1.0.2", "app-1.0.10"] {
            std::fs::create_dir_all(root.join(version)).unwrap();
        }
        // Note: lexicographic sort puts app-1.0.2 last; that is the original
        // "highest-sorted" contract.
        std::fs::write(root.join("app-1.0.2").join("Update.exe"), b"u").unwrap();
        std::fs::write(root.join("app-1.0.2").join("Discord.exe"), b"d").unwrap();

        let exe = find_exe_in_squirrel_app(&root, "Discord").unwrap();
        assert!(exe.ends_with(Path::new("app-1.0.2").join("Discord.exe")));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_squirrel_falls_back_to_first_non_updater_exe() {
        let root = unique_temp_dir("squirrel-fallback");
        std::fs::create_dir_all(root.join("app-2.0.0")).unwrap();
        std::fs::write(root.join("app-2.0.0").join("Update.exe"), b"u").unwrap();
        std::fs::write(root.join("app-2.0.0").join("Main.exe"), b"m").unwrap();

        let exe = find_exe_in_squirrel_app(&root, "Totally Different Name").unwrap();
        assert!(exe.ends_with(Path::new("app-2.0.0").join("Main.exe")));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_squirrel_no_app_dirs() {
        let root = unique_temp_dir("squirrel-none");
        assert!(find_exe_in_squirrel_app(&root, "Anything").is_none());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_find_main_exe_skips_updaters() {
        let root = unique_temp_dir("main-exe");
        std::fs::write(root.join("uninstall.exe"), b"u").unwrap();
        std::fs::write(root.join("readme.txt"), b"r").unwrap();

        assert!(find_main_exe_in_dir(&root).is_none());

        std::fs::write(root.join("tool.exe"), b"t").unwrap();
        assert_eq!(find_main_exe_in_dir(&root).as_deref(), Some("tool.exe"));

        let _ = std::fs::remove_dir_all(&root);
    }

    // --- resolve_app_exe ---

    #[test]
    fn test_resolve_app_exe_from_display_icon() {
        let root = unique_temp_dir("display-icon");
        let exe = root.join("App.exe");
        std::fs::write(&exe, b"x").unwrap();

        let display_icon = format!("\"{}\",0", exe.display());
        let (name, dir) = resolve_app_exe("App", "", &display_icon, "").unwrap();
        assert_eq!(name, "App.exe");
        assert_eq!(dir, root.to_string_lossy());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_resolve_app_exe_ignores_updater_display_icon() {
        let root = unique_temp_dir("display-icon-updater");
        let exe = root.join("Update.exe");
        std::fs::write(&exe, b"x").unwrap();

        let display_icon = exe.display().to_string();
        assert!(resolve_app_exe("App", "", &display_icon, "").is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_resolve_app_exe_from_uninstall_string() {
        let root = unique_temp_dir("uninstall-string");
        let exe = root.join("App.exe");
        std::fs::write(&exe, b"x").unwrap();

        let uninstall = exe.display().to_string();
        if uninstall.contains(' ') {
            // The first-token split only covers unquoted paths; skip when the
            // temp dir itself contains spaces.
            let _ = std::fs::remove_dir_all(&root);
            return;
        }

        let (name, dir) = resolve_app_exe("App", "", "", &uninstall).unwrap();
        assert_eq!(name, "App.exe");
        assert_eq!(dir, root.to_string_lossy());

        let _ = std::fs::remove_dir_all(&root);
    }
}
