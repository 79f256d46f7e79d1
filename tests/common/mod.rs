#![allow(dead_code)]

use abc_uploader::events::EventBus;
use abc_uploader::site::{ErrorCode, MetadataPart, Site, SiteError, TransferHandle};
use abc_uploader::upload_queue::{QueueSettings, UploadQueue};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;

/// How one transfer of a file ends, and after how long.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Succeed(Duration),
    Fail(Duration, ErrorCode),
}

pub fn succeed_after(ms: u64) -> Outcome {
    Outcome::Succeed(Duration::from_millis(ms))
}

pub fn fail_after(ms: u64, code: ErrorCode) -> Outcome {
    Outcome::Fail(Duration::from_millis(ms), code)
}

#[derive(Default)]
struct MockState {
    // Per file name; the last outcome repeats once the script runs out.
    scripts: HashMap<String, VecDeque<Outcome>>,
    calls: Vec<(String, Instant)>,
    parts: HashMap<String, Vec<MetadataPart>>,
    in_flight: usize,
    max_in_flight: usize,
    authenticated: bool,
    auth_fails: bool,
    auth_attempts: usize,
    login: Option<(String, String)>,
    last_error: Option<SiteError>,
}

/// Scriptable stand-in for the upload endpoint.
#[derive(Clone, Default)]
pub struct MockSite {
    state: Arc<Mutex<MockState>>,
}

impl MockSite {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, file_name: &str, outcomes: Vec<Outcome>) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(file_name.to_string(), outcomes.into());
    }

    pub fn set_auth_fails(&self, fails: bool) {
        self.state.lock().unwrap().auth_fails = fails;
    }

    pub fn auth_attempts(&self) -> usize {
        self.state.lock().unwrap().auth_attempts
    }

    pub fn login(&self) -> Option<(String, String)> {
        self.state.lock().unwrap().login.clone()
    }

    /// Times at which `file_name` was handed to the site.
    pub fn calls_for(&self, file_name: &str) -> Vec<Instant> {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(name, _)| name == file_name)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.state.lock().unwrap().calls.len()
    }

    pub fn parts_for(&self, file_name: &str) -> Vec<MetadataPart> {
        self.state
            .lock()
            .unwrap()
            .parts
            .get(file_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    fn next_outcome(state: &mut MockState, file_name: &str) -> Outcome {
        match state.scripts.get_mut(file_name) {
            Some(script) if script.len() > 1 => script.pop_front().unwrap(),
            Some(script) => script.front().copied().unwrap_or(Outcome::Succeed(Duration::ZERO)),
            None => Outcome::Succeed(Duration::ZERO),
        }
    }
}

#[async_trait]
impl Site for MockSite {
    async fn authenticate(&self) -> Result<(), SiteError> {
        let mut state = self.state.lock().unwrap();
        state.auth_attempts += 1;
        if state.auth_fails {
            let error = SiteError::new(ErrorCode::Authentication, "bad credentials");
            state.authenticated = false;
            state.last_error = Some(error.clone());
            Err(error)
        } else {
            state.authenticated = true;
            state.last_error = None;
            Ok(())
        }
    }

    fn is_authenticated(&self) -> bool {
        self.state.lock().unwrap().authenticated
    }

    fn set_login_data(&self, user_name: &str, password: &str) {
        let mut state = self.state.lock().unwrap();
        state.login = Some((user_name.to_string(), password.to_string()));
        state.authenticated = false;
    }

    fn upload_file(
        &self,
        file_path: &Path,
        parts: Vec<MetadataPart>,
    ) -> Result<TransferHandle, SiteError> {
        let file_name = file_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let outcome = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((file_name.clone(), Instant::now()));
            state.parts.insert(file_name.clone(), parts);
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
            Self::next_outcome(&mut state, &file_name)
        };

        let (reporter, handle) = TransferHandle::channel();
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let (delay, result) = match outcome {
                Outcome::Succeed(delay) => (delay, Ok(201)),
                Outcome::Fail(delay, code) => (delay, Err(SiteError::new(code, "scripted"))),
            };

            reporter.progress(50, 100);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            state.lock().unwrap().in_flight -= 1;
            reporter.finish(result);
        });

        Ok(handle)
    }

    fn last_error(&self) -> Option<SiteError> {
        self.state.lock().unwrap().last_error.clone()
    }
}

/// Settings with a short backoff cap; files in tests are old enough to skip the safety delay.
pub fn test_settings() -> QueueSettings {
    QueueSettings {
        max_concurrent_uploads: 2,
        safe_upload_delay: Duration::from_secs(10),
        initial_retry_interval: Duration::from_secs(2),
        max_retry_interval: Duration::from_secs(10),
    }
}

pub fn start_queue(site: &MockSite, settings: QueueSettings) -> UploadQueue {
    UploadQueue::start(Arc::new(site.clone()), settings, EventBus::new(256))
}

/// Write `name` under `dir` with an mtime `age` in the past.
pub fn write_file_aged(dir: &Path, name: &str, contents: &[u8], age: Duration) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    set_mtime(&path, SystemTime::now() - age);
    path
}

/// Write `name` with an mtime an hour in the past.
pub fn write_old_file(dir: &Path, name: &str) -> PathBuf {
    write_file_aged(dir, name, name.as_bytes(), Duration::from_secs(3600))
}

pub fn set_mtime(path: &Path, modified: SystemTime) {
    fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(modified)
        .unwrap();
}
