//! Token-authenticated multipart uploads over HTTP.

use super::{ErrorCode, MetadataPart, Site, SiteError, TransferHandle, TransferReporter};
use crate::error::UploaderError;
use crate::logging::{log_debug, log_info, log_warn};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::Body;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::io::ReaderStream;

const COMPONENT: &str = "site";
const AUTH_ENDPOINT: &str = "/api-auth-token/";
const UPLOAD_ENDPOINT: &str = "/rawdata/rawimages/";

#[derive(Debug, Default)]
struct SiteState {
    user_name: String,
    password: String,
    token: Option<String>,
    last_error: Option<SiteError>,
}

#[derive(Debug, Clone)]
pub struct HttpSite {
    client: reqwest::Client,
    server_url: String,
    state: Arc<Mutex<SiteState>>,
}

impl HttpSite {
    pub fn new(server_url: &str) -> Result<Self, UploaderError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            server_url: server_url.trim_end_matches('/').to_string(),
            state: Arc::new(Mutex::new(SiteState::default())),
        })
    }

    fn record_error(&self, error: SiteError) -> SiteError {
        lock_state(&self.state).last_error = Some(error.clone());
        error
    }
}

fn lock_state(state: &Mutex<SiteState>) -> MutexGuard<'_, SiteState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Site for HttpSite {
    async fn authenticate(&self) -> Result<(), SiteError> {
        let (user_name, password) = {
            let mut state = lock_state(&self.state);
            state.token = None;
            (state.user_name.clone(), state.password.clone())
        };

        if user_name.is_empty() {
            return Err(self.record_error(SiteError::new(
                ErrorCode::Authentication,
                "No login data configured",
            )));
        }

        let url = format!("{}{}", self.server_url, AUTH_ENDPOINT);
        let response = self
            .client
            .post(&url)
            .form(&[("username", user_name.as_str()), ("password", password.as_str())])
            .send()
            .await
            .map_err(|e| self.record_error(map_reqwest_error(&e)))?;

        let status = response.status();
        if !status.is_success() {
            let code = match status.as_u16() {
                400 | 401 | 403 => ErrorCode::Authentication,
                _ => ErrorCode::Network,
            };
            return Err(self.record_error(SiteError::new(
                code,
                format!("Got HTTP code {}", status.as_u16()),
            )));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            token: Option<String>,
        }

        let body: TokenResponse = response.json().await.map_err(|e| {
            self.record_error(SiteError::new(
                ErrorCode::Unknown,
                format!("Failed to parse token response: {}", e),
            ))
        })?;

        let token = body.token.filter(|t| !t.is_empty()).ok_or_else(|| {
            self.record_error(SiteError::new(
                ErrorCode::Authentication,
                "No token in authentication reply",
            ))
        })?;

        lock_state(&self.state).token = Some(token);
        log_info(COMPONENT, &format!("✓ Authenticated as {}", user_name)).unwrap_or_default();

        Ok(())
    }

    fn is_authenticated(&self) -> bool {
        lock_state(&self.state).token.is_some()
    }

    /// Any existing session is dropped.
    fn set_login_data(&self, user_name: &str, password: &str) {
        let mut state = lock_state(&self.state);
        state.user_name = user_name.to_string();
        state.password = password.to_string();
        state.token = None;
    }

    fn upload_file(
        &self,
        file_path: &Path,
        parts: Vec<MetadataPart>,
    ) -> Result<TransferHandle, SiteError> {
        // The guard must be gone before record_error locks again.
        let token = lock_state(&self.state).token.clone();
        let token = token.ok_or_else(|| {
            self.record_error(SiteError::new(ErrorCode::Authentication, "Not authenticated"))
        })?;

        let (reporter, handle) = TransferHandle::channel();
        let client = self.client.clone();
        let url = format!("{}{}", self.server_url, UPLOAD_ENDPOINT);
        let state = Arc::clone(&self.state);
        let path = file_path.to_path_buf();

        tokio::spawn(async move {
            let result = send_multipart(&client, &url, &token, &path, parts, &reporter).await;

            match &result {
                Ok(status) => {
                    log_debug(
                        COMPONENT,
                        &format!("Upload reply for {}: HTTP {}", path.display(), status),
                    )
                    .unwrap_or_default();
                    if *status == 401 {
                        // Token expired or revoked; force a fresh login.
                        lock_state(&state).token = None;
                    }
                }
                Err(e) => {
                    log_warn(
                        COMPONENT,
                        &format!("Upload of {} failed: {}", path.display(), e),
                    )
                    .unwrap_or_default();
                    lock_state(&state).last_error = Some(e.clone());
                }
            }

            reporter.finish(result);
        });

        Ok(handle)
    }

    fn last_error(&self) -> Option<SiteError> {
        lock_state(&self.state).last_error.clone()
    }
}

async fn send_multipart(
    client: &reqwest::Client,
    url: &str,
    token: &str,
    path: &Path,
    parts: Vec<MetadataPart>,
    reporter: &TransferReporter,
) -> Result<u16, SiteError> {
    let local_error =
        |e: std::io::Error| SiteError::new(ErrorCode::LocalFile, format!("{}: {}", path.display(), e));

    let file = tokio::fs::File::open(path).await.map_err(local_error)?;
    let total = file.metadata().await.map_err(local_error)?.len();

    let progress = reporter.clone();
    let mut sent = 0u64;
    let stream = ReaderStream::new(file).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            sent += bytes.len() as u64;
            progress.progress(sent, total);
        }
    });

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().replace('"', "_"))
        .unwrap_or_else(|| "upload".to_string());

    let mut form = Form::new().part(
        "file",
        Part::stream_with_length(Body::wrap_stream(stream), total).file_name(file_name),
    );
    for part in parts {
        form = form.text(part.name, part.value);
    }

    let response = client
        .post(url)
        .header("Authorization", format!("Token {}", token))
        .multipart(form)
        .send()
        .await
        .map_err(|e| map_reqwest_error(&e))?;

    Ok(response.status().as_u16())
}

fn map_reqwest_error(err: &reqwest::Error) -> SiteError {
    let mut chain = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }

    let lowered = chain.to_lowercase();
    let code = if ["certificate", "tls", "ssl"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        ErrorCode::Ssl
    } else if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        ErrorCode::Network
    } else {
        ErrorCode::Unknown
    };

    SiteError::new(code, chain)
}
