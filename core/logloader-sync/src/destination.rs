//! Upload destinations.
//!
//! A destination is a log-archival web service that accepts multipart
//! uploads at `POST /upload` and answers a successful upload with a
//! redirect to the uploaded log's page.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use logloader_types::DestinationId;
use reqwest::multipart::{Form, Part};
use reqwest::{redirect, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Descriptor of one upload target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub id: DestinationId,
    /// Base URL with scheme and without a trailing slash.
    pub base_url: String,
    /// Uploader email sent with every log. May be empty.
    pub email: String,
    /// Whether uploaded logs are publicly listed.
    pub public: bool,
}

/// Descriptive fields sent alongside the log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadForm {
    pub log_type: String,
    pub description: String,
    pub feedback: String,
    pub email: String,
    pub source: String,
    pub video_url: String,
    pub rating: String,
    pub wind_speed: String,
    pub public: bool,
}

impl UploadForm {
    /// Builds the fixed form used for automatic uploads to `destination`.
    pub fn for_destination(destination: &DestinationConfig) -> Self {
        Self {
            // The server files public logs as flight reports and private
            // ones as personal logs.
            log_type: (if destination.public { "flightreport" } else { "personal" }).to_string(),
            description: "Uploaded by logloader".to_string(),
            feedback: String::new(),
            email: destination.email.clone(),
            source: "auto".to_string(),
            video_url: String::new(),
            rating: String::new(),
            wind_speed: String::new(),
            public: destination.public,
        }
    }

    /// Returns the text fields in wire order.
    pub fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("type", self.log_type.clone()),
            ("description", self.description.clone()),
            ("feedback", self.feedback.clone()),
            ("email", self.email.clone()),
            ("source", self.source.clone()),
            ("videoUrl", self.video_url.clone()),
            ("rating", self.rating.clone()),
            ("windSpeed", self.wind_speed.clone()),
            ("public", self.public.to_string()),
        ]
    }
}

/// Classified result of one upload attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// The server accepted the log.
    Uploaded { url: String },
    /// The server refused the log permanently.
    Rejected { reason: String },
    /// Anything else. The attempt may be repeated later.
    Transient {
        status: Option<u16>,
        message: String,
    },
}

/// A target that downloaded logs are pushed to.
#[async_trait]
pub trait UploadDestination: Send + Sync {
    /// Returns the descriptor this destination was built from.
    fn descriptor(&self) -> &DestinationConfig;

    /// Returns the destination's stable name.
    fn id(&self) -> &DestinationId {
        &self.descriptor().id
    }

    /// Checks that the destination is reachable. An error means it is not.
    async fn probe(&self) -> SyncResult<()>;

    /// Uploads the file at `path` with the given form fields.
    ///
    /// Errors are local failures (the file could not be read); server-side
    /// failures are reported through [`UploadOutcome`].
    async fn submit(&self, path: &Path, form: &UploadForm) -> SyncResult<UploadOutcome>;
}

/// HTTP(S) log server.
pub struct HttpDestination {
    config: DestinationConfig,
    client: Client,
}

impl HttpDestination {
    /// Creates a destination client. Redirects are not followed, since the
    /// redirect itself is the success signal.
    pub fn new(config: DestinationConfig, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| SyncError::Network(format!("failed to create HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url)
    }

    fn resolve_location(&self, location: &str) -> String {
        if location.starts_with("http://") || location.starts_with("https://") {
            location.to_string()
        } else {
            self.url(location)
        }
    }
}

#[async_trait]
impl UploadDestination for HttpDestination {
    fn descriptor(&self) -> &DestinationConfig {
        &self.config
    }

    async fn probe(&self) -> SyncResult<()> {
        let response = self
            .client
            .get(self.url("/"))
            .send()
            .await
            .map_err(|e| SyncError::Network(format!("connection to {} failed: {e}", self.config.base_url)))?;

        if response.status() != StatusCode::OK {
            return Err(SyncError::Network(format!(
                "connection to {} failed: HTTP {}",
                self.config.base_url,
                response.status().as_u16()
            )));
        }
        Ok(())
    }

    async fn submit(&self, path: &Path, form: &UploadForm) -> SyncResult<UploadOutcome> {
        let content = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        debug!(
            "Uploading {} to {} ({:.2} MB)",
            file_name,
            self.config.base_url,
            content.len() as f64 / 1e6
        );

        let part = Part::bytes(content)
            .file_name(file_name)
            .mime_str("application/octet-stream")
            .map_err(|e| SyncError::Network(format!("invalid file part: {e}")))?;
        let mut multipart = Form::new();
        for (name, value) in form.fields() {
            multipart = multipart.text(name, value);
        }
        let multipart = multipart.part("filearg", part);

        let response = match self
            .client
            .post(self.url("/upload"))
            .multipart(multipart)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return Ok(UploadOutcome::Transient {
                    status: None,
                    message: e.to_string(),
                });
            }
        };

        let status = response.status();
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            let url = self.resolve_location(location);
            debug!("{} redirected upload to {}", self.config.id, url);
            return Ok(UploadOutcome::Uploaded { url });
        }

        if status == StatusCode::BAD_REQUEST {
            return Ok(UploadOutcome::Rejected {
                reason: "HTTP 400: Bad Request".to_string(),
            });
        }

        Ok(UploadOutcome::Transient {
            status: Some(status.as_u16()),
            message: format!("HTTP {}", status.as_u16()),
        })
    }
}
