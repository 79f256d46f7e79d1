//! Start the agent at login.
//!
//! Linux gets an XDG autostart entry; other platforms only log that the
//! setting has no effect.

use crate::error::{Result, UploaderError};
use crate::logging::{log_info, log_warn};
use std::fs;
use std::path::{Path, PathBuf};

const COMPONENT: &str = "autostart";
const DESKTOP_FILE_NAME: &str = "abc-uploader.desktop";

/// `~/.config/autostart/abc-uploader.desktop` on XDG systems.
pub fn desktop_entry_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("autostart").join(DESKTOP_FILE_NAME))
}

pub fn desktop_entry(exe: &Path) -> String {
    format!(
        "[Desktop Entry]\nName=AstroBin Uploader\nType=Application\nExec={}\n",
        exe.display()
    )
}

/// Create or remove the entry at `entry_path`. An existing entry is left as is.
pub fn apply_desktop_entry(entry_path: &Path, exe: &Path, enabled: bool) -> Result<()> {
    if enabled {
        if entry_path.exists() {
            return Ok(());
        }
        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(entry_path, desktop_entry(exe))?;
    } else if entry_path.exists() {
        fs::remove_file(entry_path)?;
    }
    Ok(())
}

/// Register or unregister the running binary. Failures are logged.
pub fn set_auto_start(enabled: bool) {
    match register(enabled) {
        Ok(()) => log_info(
            COMPONENT,
            &format!("Auto start {}", if enabled { "enabled" } else { "disabled" }),
        )
        .unwrap_or_default(),
        Err(e) => {
            log_warn(COMPONENT, &format!("Cannot update auto start: {}", e)).unwrap_or_default()
        }
    }
}

#[cfg(target_os = "linux")]
fn register(enabled: bool) -> Result<()> {
    let entry_path = desktop_entry_path()
        .ok_or_else(|| UploaderError::Config("Could not find config directory".to_string()))?;
    let exe = std::env::current_exe()?;
    apply_desktop_entry(&entry_path, &exe, enabled)
}

#[cfg(not(target_os = "linux"))]
fn register(_enabled: bool) -> Result<()> {
    Err(UploaderError::Config(
        "Auto start is not implemented on this platform".to_string(),
    ))
}
