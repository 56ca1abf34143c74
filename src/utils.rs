//! Utility functions for the MRVPN service

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Command;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// Windows CREATE_NO_WINDOW flag to prevent console windows from appearing
#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

/// Maximum log file size before rotation (1MB)
const MAX_LOG_SIZE: u64 = 1024 * 1024;

/// Create a Command that won't show a console window on Windows
///
/// The service runs without a console; child processes (sing-box, PowerShell)
/// must not flash command prompts on the user's desktop.
pub fn hidden_command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    cmd
}

/// Per-machine data directory used for logs and the generated engine config.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("MRVPN")
}

/// Check if the current process has administrator privileges
///
/// Returns true if running with elevated privileges, false otherwise.
#[cfg(windows)]
pub fn is_administrator() -> bool {
    unsafe {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::Security::{
            GetTokenInformation, TokenElevation, TOKEN_ELEVATION, TOKEN_QUERY,
        };
        use windows::Win32::System::Threading::{GetCurrentProcess, OpenProcessToken};

        let mut token_handle = windows::Win32::Foundation::HANDLE::default();

        if OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token_handle).is_err() {
            return false;
        }

        let mut elevation = TOKEN_ELEVATION::default();
        let mut return_length: u32 = 0;

        let result = GetTokenInformation(
            token_handle,
            TokenElevation,
            Some(&mut elevation as *mut _ as *mut std::ffi::c_void),
            std::mem::size_of::<TOKEN_ELEVATION>() as u32,
            &mut return_length,
        );

        let _ = CloseHandle(token_handle);

        if result.is_ok() {
            elevation.TokenIsElevated != 0
        } else {
            false
        }
    }
}

#[cfg(not(windows))]
pub fn is_administrator() -> bool {
    true
}

/// Rotate log file if it exceeds the maximum size
///
/// Renames the current log to .old (deleting previous .old) if it's too large.
/// Returns Ok(true) if rotation occurred, Ok(false) if not needed.
pub fn rotate_log_if_needed(log_path: &Path) -> std::io::Result<bool> {
    if !log_path.exists() {
        return Ok(false);
    }

    let metadata = std::fs::metadata(log_path)?;
    if metadata.len() <= MAX_LOG_SIZE {
        return Ok(false);
    }

    // Create .old path
    let old_path = log_path.with_extension("log.old");

    // Delete previous .old file if it exists
    if old_path.exists() {
        let _ = std::fs::remove_file(&old_path);
    }

    // Rename current log to .old
    std::fs::rename(log_path, &old_path)?;

    log::info!(
        "Rotated log file: {} -> {}",
        log_path.display(),
        old_path.display()
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hidden_command() {
        let cmd = hidden_command("echo");
        assert!(format!("{:?}", cmd).contains("echo"));
    }

    #[test]
    fn test_is_administrator_does_not_panic() {
        let _ = is_administrator();
    }

    #[test]
    fn test_data_dir_ends_with_product_name() {
        assert!(data_dir().ends_with("MRVPN"));
    }

    #[test]
    fn test_rotate_missing_file_is_noop() {
        let path = std::env::temp_dir().join("mrvpn-rotate-test-does-not-exist.log");
        assert!(!rotate_log_if_needed(&path).unwrap());
    }

    #[test]
    fn test_rotate_small_file_is_noop() {
        let path = std::env::temp_dir().join(format!("mrvpn-rotate-{}.log", std::process::id()));
        std::fs::write(&path, b"small").unwrap();
        assert!(!rotate_log_if_needed(&path).unwrap());
        let _ = std::fs::remove_file(&path);
    }
}
