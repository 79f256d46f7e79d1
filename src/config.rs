use crate::upload_queue::QueueSettings;
use serde::{Deserialize, Serialize};
use shellexpand::tilde;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SERVER_URL: &str = "https://www.astrobin.com/api/v2";

const CONFIG_DIR_NAME: &str = ".abc-uploader";
const DB_FILE_NAME: &str = "abc-uploader.db";

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UploaderConfig {
    #[serde(rename = "userName")]
    pub user_name: Option<String>,
    pub password: Option<String>,
    #[serde(rename = "uploadPath")]
    pub upload_path: Option<String>,
    #[serde(rename = "logDbPath")]
    pub log_db_path: Option<String>,
    #[serde(rename = "serverUrl")]
    pub server_url: Option<String>,
    #[serde(rename = "maxConcurrentUploads")]
    pub max_concurrent_uploads: Option<usize>,
    #[serde(rename = "safeUploadDelaySecs")]
    pub safe_upload_delay_secs: Option<u64>,
    #[serde(rename = "initialRetrySecs")]
    pub initial_retry_secs: Option<u64>,
    #[serde(rename = "maxRetrySecs")]
    pub max_retry_secs: Option<u64>,
    #[serde(rename = "minSignalIntervalSecs")]
    pub min_signal_interval_secs: Option<u64>,
    #[serde(rename = "autoStart")]
    pub auto_start: Option<bool>,
}

impl UploaderConfig {
    /// Root of the monitored tree, with `~` expanded. `None` when unset or blank.
    pub fn upload_path(&self) -> Option<PathBuf> {
        self.upload_path
            .as_deref()
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(|path| PathBuf::from(tilde(path).as_ref()))
    }

    pub fn log_db_path(&self) -> Result<PathBuf, Box<dyn std::error::Error>> {
        if let Some(path) = self.log_db_path.as_deref().filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(tilde(path).as_ref()));
        }

        let data_dir = dirs::data_local_dir().ok_or("Could not find local data directory")?;
        Ok(data_dir.join("abc-uploader").join(DB_FILE_NAME))
    }

    pub fn server_url(&self) -> String {
        self.server_url
            .clone()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVER_URL.to_string())
    }

    pub fn has_credentials(&self) -> bool {
        self.user_name.as_deref().is_some_and(|u| !u.is_empty()) && self.password.is_some()
    }

    pub fn queue_settings(&self) -> QueueSettings {
        let defaults = QueueSettings::default();
        QueueSettings {
            max_concurrent_uploads: self
                .max_concurrent_uploads
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_concurrent_uploads),
            safe_upload_delay: self
                .safe_upload_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.safe_upload_delay),
            initial_retry_interval: self
                .initial_retry_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.initial_retry_interval),
            max_retry_interval: self
                .max_retry_secs
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_retry_interval),
        }
    }

    pub fn min_signal_interval(&self) -> Option<Duration> {
        self.min_signal_interval_secs.map(Duration::from_secs)
    }

    /// Start at login unless switched off.
    pub fn auto_start(&self) -> bool {
        self.auto_start.unwrap_or(true)
    }
}

pub fn get_config_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    if let Some(home_dir) = dirs::home_dir() {
        Ok(home_dir.join(CONFIG_DIR_NAME))
    } else {
        Err("Could not find home directory".into())
    }
}

pub fn get_config_file_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Ok(get_config_dir()?.join("config.json"))
}

pub fn get_logs_dir() -> Result<PathBuf, Box<dyn std::error::Error>> {
    Ok(get_config_dir()?.join("logs"))
}

fn ensure_private_dir(dir: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    if !dir.exists() {
        fs::create_dir_all(dir)?;

        // Set permissions to 700 (read/write/execute for owner only) on Unix systems
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let metadata = fs::metadata(dir)?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(0o700);
            fs::set_permissions(dir, permissions)?;
        }
    }
    Ok(())
}

pub fn ensure_config_dir() -> Result<(), Box<dyn std::error::Error>> {
    ensure_private_dir(&get_config_dir()?)
}

pub fn ensure_logs_dir() -> Result<(), Box<dyn std::error::Error>> {
    ensure_private_dir(&get_logs_dir()?)
}

pub fn load_config() -> Result<UploaderConfig, Box<dyn std::error::Error>> {
    ensure_config_dir()?;
    load_config_from(&get_config_file_path()?)
}

pub fn load_config_from(config_file: &PathBuf) -> Result<UploaderConfig, Box<dyn std::error::Error>> {
    if config_file.exists() {
        let content = fs::read_to_string(config_file)?;
        let config: UploaderConfig = serde_json::from_str(&content)?;
        Ok(config)
    } else {
        Ok(UploaderConfig::default())
    }
}

pub fn save_config(config: &UploaderConfig) -> Result<(), Box<dyn std::error::Error>> {
    ensure_config_dir()?;
    save_config_to(config, &get_config_file_path()?)
}

pub fn save_config_to(
    config: &UploaderConfig,
    config_file: &PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let content = serde_json::to_string_pretty(config)?;

    fs::write(config_file, content)?;

    // The file holds the account password: 600 on Unix systems
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = fs::metadata(config_file)?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(config_file, permissions)?;
    }

    Ok(())
}
