use abc_uploader::agent::Agent;
use abc_uploader::autostart::set_auto_start;
use abc_uploader::config::{
    ensure_logs_dir, get_config_file_path, get_logs_dir, load_config, save_config,
};
use abc_uploader::events::EventBus;
use abc_uploader::file_log::FileLog;
use abc_uploader::file_watcher::start_config_file_watcher;
use abc_uploader::logging::{init_logging, log_error, log_info, log_warn};
use abc_uploader::site::HttpSite;
use abc_uploader::upload_queue::UploadQueue;
use anyhow::{anyhow, Context};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const EVENT_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = get_config_file_path().map_err(|e| anyhow!("{}", e))?;
    let config = load_config().map_err(|e| anyhow!("Failed to load config: {}", e))?;
    if !config_path.exists() {
        // Leave a template behind for the user to fill in.
        save_config(&config).map_err(|e| anyhow!("Failed to write default config: {}", e))?;
    }

    ensure_logs_dir().map_err(|e| anyhow!("{}", e))?;
    let logs_dir = get_logs_dir().map_err(|e| anyhow!("{}", e))?;
    if let Err(e) = init_logging(&logs_dir) {
        eprintln!("Failed to initialize logging: {}", e);
    }

    log_info("main", &format!("Configuration: {}", config_path.display())).unwrap_or_default();
    if !config.has_credentials() {
        log_warn("main", "No login data configured; uploads will not authenticate")
            .unwrap_or_default();
    }

    set_auto_start(config.auto_start());

    let db_path = config.log_db_path().map_err(|e| anyhow!("{}", e))?;
    let file_log = FileLog::open(&db_path)
        .with_context(|| format!("Failed to open upload log at {}", db_path.display()))?;

    let site = Arc::new(HttpSite::new(&config.server_url())?);
    let queue = UploadQueue::start(site.clone(), config.queue_settings(), EventBus::new(EVENT_CAPACITY));

    let (reload_tx, reload_rx) = tokio::sync::mpsc::unbounded_channel();
    // Keep the watcher alive for as long as the agent runs
    let _config_watcher = match start_config_file_watcher(reload_tx) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            log_warn("main", &format!("Config changes won't be picked up: {}", e))
                .unwrap_or_default();
            None
        }
    };

    let mut agent =
        Agent::new(config, file_log, site, queue).with_config_reload(config_path, reload_rx);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => log_info("main", "Shutting down").unwrap_or_default(),
            Err(e) => {
                log_error("main", &format!("Cannot listen for Ctrl-C: {}", e)).unwrap_or_default()
            }
        }
        on_signal.cancel();
    });

    agent.run(cancel).await;
    Ok(())
}
