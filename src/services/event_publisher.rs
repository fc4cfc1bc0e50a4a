//! Event publishing to a Google Cloud Pub/Sub topic over its REST API.
//!
//! Publication is at-most-once: one HTTP call per event, no retries, and
//! the returned message id is only logged. Against Google Cloud, tokens
//! come from Application Default Credentials through `gcp_auth`, which
//! refreshes them before they expire.

use crate::config::PubSubConfig;
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use bytes::Bytes;
use gcp_auth::TokenProvider;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, warn};

const DEFAULT_ENDPOINT: &str = "https://pubsub.googleapis.com";
const PUBSUB_SCOPES: &[&str] = &["https://www.googleapis.com/auth/pubsub"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("topic `{0}` needs a project id (set PUBSUB_PROJECT_ID or use projects/<p>/topics/<t>)")]
    MissingProject(String),
    #[error("publish to `{topic}` rejected with {status}: {body}")]
    Rejected {
        topic: String,
        status: StatusCode,
        body: String,
    },
    #[error("could not encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("could not obtain Pub/Sub credentials: {0}")]
    Auth(#[from] gcp_auth::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type PublishResult<T> = Result<T, PublishError>;

/// Sink for serialized events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish one message to `topic` with the given string attributes.
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        attributes: BTreeMap<String, String>,
    ) -> PublishResult<()>;
}

#[derive(Serialize)]
struct PublishBody {
    messages: Vec<PubsubMessage>,
}

#[derive(Serialize)]
struct PubsubMessage {
    data: String,
    attributes: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Where the bearer token of each publish call comes from.
pub enum PubSubAuth {
    /// A fixed token, or none at all. Only the emulator accepts these.
    Static(Option<String>),
    /// Application Default Credentials, refreshed as needed.
    Provider(Arc<dyn TokenProvider>),
}

pub struct PubSubPublisher {
    http: Client,
    endpoint: String,
    project_id: Option<String>,
    auth: PubSubAuth,
}

impl PubSubPublisher {
    /// Build a publisher with the credentials `config` calls for.
    ///
    /// With an emulator host, `access_token` (usually unset) is sent as is.
    /// Otherwise tokens are fetched from Application Default Credentials.
    pub async fn connect(config: &PubSubConfig) -> PublishResult<Self> {
        let auth = if config.emulator_host.is_some() {
            PubSubAuth::Static(config.access_token.clone())
        } else {
            if config.access_token.is_some() {
                warn!("PUBSUB_ACCESS_TOKEN is only used with PUBSUB_EMULATOR_HOST; ignoring it");
            }
            PubSubAuth::Provider(gcp_auth::provider().await?)
        };
        Self::new(config, auth)
    }

    pub fn new(config: &PubSubConfig, auth: PubSubAuth) -> PublishResult<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("upload-store/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let endpoint = match &config.emulator_host {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                host.trim_end_matches('/').to_string()
            }
            Some(host) => format!("http://{}", host.trim_end_matches('/')),
            None => DEFAULT_ENDPOINT.to_string(),
        };

        Ok(Self {
            http,
            endpoint,
            project_id: config.project_id.clone(),
            auth,
        })
    }

    /// Fully qualified topic path (`projects/<p>/topics/<t>`).
    fn topic_path(&self, topic: &str) -> PublishResult<String> {
        if topic.starts_with("projects/") {
            return Ok(topic.to_string());
        }
        match &self.project_id {
            Some(project) => Ok(format!("projects/{}/topics/{}", project, topic)),
            None => Err(PublishError::MissingProject(topic.to_string())),
        }
    }
}

#[async_trait]
impl EventPublisher for PubSubPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Bytes,
        attributes: BTreeMap<String, String>,
    ) -> PublishResult<()> {
        let topic_path = self.topic_path(topic)?;
        let url = format!("{}/v1/{}:publish", self.endpoint, topic_path);
        let body = PublishBody {
            messages: vec![PubsubMessage {
                data: general_purpose::STANDARD.encode(&payload),
                attributes,
            }],
        };

        let mut request = self.http.post(&url).json(&body);
        match &self.auth {
            PubSubAuth::Static(Some(token)) => request = request.bearer_auth(token),
            PubSubAuth::Static(None) => {}
            PubSubAuth::Provider(provider) => {
                let token = provider.token(PUBSUB_SCOPES).await?;
                request = request.bearer_auth(token.as_str());
            }
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::Rejected {
                topic: topic_path,
                status,
                body,
            });
        }

        let parsed: PublishResponse = response.json().await?;
        debug!(topic = %topic_path, message_ids = ?parsed.message_ids, "event published");
        Ok(())
    }
}
