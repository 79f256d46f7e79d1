use crate::config::get_config_file_path;
use crate::logging::{log_debug, log_warn};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

/// Sends `()` on `on_change` whenever the configuration file is edited.
pub struct ConfigFileWatcher {
    _watcher: RecommendedWatcher,
    _thread_handle: std::thread::JoinHandle<()>,
}

impl ConfigFileWatcher {
    pub fn new(
        config_file_path: PathBuf,
        on_change: UnboundedSender<()>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        // Create a channel to receive file system events
        let (tx, rx) = mpsc::channel();

        let mut watcher = RecommendedWatcher::new(
            tx,
            Config::default().with_poll_interval(Duration::from_secs(1)),
        )?;

        // Watch the parent directory: editors often replace the file instead of writing it
        let watch_path = config_file_path
            .parent()
            .ok_or("Could not determine config directory")?
            .to_path_buf();

        watcher.watch(&watch_path, RecursiveMode::NonRecursive)?;

        // Ends when the watcher (and with it the sender) is dropped
        let thread_handle = std::thread::spawn(move || {
            let mut last_event: Option<std::time::Instant> = None;

            for result in rx {
                match result {
                    Ok(event) => {
                        if !Self::is_config_file_event(&event, &config_file_path) {
                            continue;
                        }

                        // Debounce rapid file changes
                        let now = std::time::Instant::now();
                        if let Some(last) = last_event {
                            if now.duration_since(last) < DEBOUNCE_DURATION {
                                last_event = Some(now);
                                continue;
                            }
                        }
                        last_event = Some(now);

                        log_debug("config", "Configuration file changed").unwrap_or_default();
                        if on_change.send(()).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        log_warn("config", &format!("Config watcher error: {:?}", error))
                            .unwrap_or_default();
                    }
                }
            }
        });

        Ok(ConfigFileWatcher {
            _watcher: watcher,
            _thread_handle: thread_handle,
        })
    }

    fn is_config_file_event(event: &Event, config_file_path: &Path) -> bool {
        match &event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) => {
                event.paths.iter().any(|path| path == config_file_path)
            }
            _ => false,
        }
    }
}

pub fn start_config_file_watcher(
    on_change: UnboundedSender<()>,
) -> Result<ConfigFileWatcher, Box<dyn std::error::Error + Send + Sync>> {
    let config_file_path =
        get_config_file_path().map_err(|e| format!("Failed to get config file path: {}", e))?;
    ConfigFileWatcher::new(config_file_path, on_change)
}
