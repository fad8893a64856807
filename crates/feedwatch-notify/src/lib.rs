//! Best-effort fanout of newly harvested posts to a chat bot.

use std::time::Duration;

use async_trait::async_trait;
use feedwatch_core::Record;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, info_span, Instrument};

pub const CRATE_NAME: &str = "feedwatch-notify";

const POST_LOCALE: &str = "zh_cn";
const REPLY_EXCERPT_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "tag", rename_all = "lowercase")]
pub enum Segment {
    Text { text: String },
    A { text: String, href: String },
}

/// A rich-text post: a title plus lines of text/link segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationMessage {
    pub title: String,
    pub lines: Vec<Vec<Segment>>,
}

impl NotificationMessage {
    /// `None` when the record has no description worth announcing.
    pub fn for_record(record: &Record) -> Option<Self> {
        let description = record.description.trim();
        if description.is_empty() {
            return None;
        }
        let author = record.author.trim();
        let title = record.title.as_deref().unwrap_or_default().trim();
        let published_at = record.published_at.trim();

        let mut lines = vec![
            vec![Segment::Text {
                text: format!("Title: {title}\n"),
            }],
            vec![Segment::Text {
                text: format!("Author: {author} | Published: {published_at}\n"),
            }],
            vec![Segment::Text {
                text: format!("Content: {description}\n"),
            }],
        ];
        if !record.images.is_empty() {
            lines.push(
                record
                    .images
                    .iter()
                    .enumerate()
                    .map(|(idx, url)| Segment::A {
                        text: format!("Image {}\n", idx + 1),
                        href: url.clone(),
                    })
                    .collect(),
            );
        }

        Some(Self {
            title: format!("New post - {author}"),
            lines,
        })
    }

    pub fn post_content(&self) -> JsonValue {
        json!({
            POST_LOCALE: {
                "title": self.title,
                "content": self.lines,
            }
        })
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("rejected by chat api (code {code}): {message}")]
    Rejected { code: i64, message: String },
    #[error("chat api answered http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unreadable chat api reply: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("encoding message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, message: &NotificationMessage) -> Result<(), TransportError>;
}

/// Reply envelope shared by the webhook and the open API. Webhooks answer
/// with either `code` or the legacy `StatusCode` field.
#[derive(Debug, Default, Deserialize)]
struct ApiReply {
    code: Option<i64>,
    msg: Option<String>,
    #[serde(rename = "StatusCode")]
    status_code: Option<i64>,
    #[serde(rename = "StatusMessage")]
    status_message: Option<String>,
    tenant_access_token: Option<String>,
}

impl ApiReply {
    fn check(self) -> Result<Self, TransportError> {
        let code = self.code.or(self.status_code).unwrap_or(-1);
        if code == 0 {
            return Ok(self);
        }
        Err(TransportError::Rejected {
            code,
            message: self
                .msg
                .clone()
                .or_else(|| self.status_message.clone())
                .unwrap_or_else(|| "no message".to_string()),
        })
    }
}

/// Prefer the envelope's own code over the HTTP status: the chat API reports
/// token and permission errors as 4xx with a JSON body.
fn interpret_reply(status: reqwest::StatusCode, body: &str) -> Result<ApiReply, TransportError> {
    match serde_json::from_str::<ApiReply>(body) {
        Ok(reply) if reply.code.is_some() || reply.status_code.is_some() => reply.check(),
        _ if !status.is_success() => Err(TransportError::Status {
            status: status.as_u16(),
            body: body.chars().take(REPLY_EXCERPT_CHARS).collect(),
        }),
        Ok(reply) => reply.check(),
        Err(err) => Err(TransportError::Malformed(err)),
    }
}

async fn read_reply(response: reqwest::Response) -> Result<ApiReply, TransportError> {
    let status = response.status();
    let body = response.text().await?;
    interpret_reply(status, &body)
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(timeout).build()
}

pub fn webhook_payload(message: &NotificationMessage) -> JsonValue {
    json!({
        "msg_type": "post",
        "content": { "post": message.post_content() },
    })
}

/// Posts straight to a group-bot webhook URL.
#[derive(Debug)]
pub struct WebhookTransport {
    client: reqwest::Client,
    url: String,
}

impl WebhookTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Transport for WebhookTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.url)
            .json(&webhook_payload(message))
            .send()
            .await?;
        read_reply(response).await?;
        Ok(())
    }
}

/// App-credential transport: exchanges `app_id`/`app_secret` for a tenant
/// token, then sends through the messages endpoint.
#[derive(Debug)]
pub struct ApiTransport {
    client: reqwest::Client,
    base_url: String,
    app_id: String,
    app_secret: String,
    receive_id: String,
    receive_id_type: String,
    token: Mutex<Option<String>>,
}

impl ApiTransport {
    pub fn new(
        base_url: impl Into<String>,
        credentials: ApiCredentials,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            client: build_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            app_id: credentials.app_id,
            app_secret: credentials.app_secret,
            receive_id: credentials.receive_id,
            receive_id_type: credentials.receive_id_type,
            token: Mutex::new(None),
        })
    }

    async fn access_token(&self) -> Result<String, TransportError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(token.clone());
        }

        let url = format!("{}/auth/v3/tenant_access_token/internal", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&json!({ "app_id": self.app_id, "app_secret": self.app_secret }))
            .send()
            .await?;
        let reply = read_reply(response).await?;
        let token = reply.tenant_access_token.ok_or(TransportError::Rejected {
            code: -1,
            message: "token reply without tenant_access_token".to_string(),
        })?;
        info!("chat api access token obtained");
        *cached = Some(token.clone());
        Ok(token)
    }

    pub fn message_body(&self, message: &NotificationMessage) -> Result<JsonValue, TransportError> {
        let content = serde_json::to_string(&json!({ "post": message.post_content() }))?;
        Ok(json!({
            "receive_id": self.receive_id,
            "msg_type": "post",
            "content": content,
        }))
    }
}

#[async_trait]
impl Transport for ApiTransport {
    fn name(&self) -> &'static str {
        "api"
    }

    async fn send(&self, message: &NotificationMessage) -> Result<(), TransportError> {
        let token = self.access_token().await?;
        let body = self.message_body(message)?;
        let url = format!("{}/im/v1/messages", self.base_url);

        let result = async {
            let response = self
                .client
                .post(url)
                .bearer_auth(&token)
                .query(&[("receive_id_type", self.receive_id_type.as_str())])
                .json(&body)
                .send()
                .await?;
            read_reply(response).await.map(|_| ())
        }
        .await;

        if result.is_err() {
            // Next send fetches a fresh token.
            self.token.lock().await.take();
        }
        result
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    pub app_id: String,
    pub app_secret: String,
    pub receive_id: String,
    pub receive_id_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub enabled: bool,
    pub webhook_url: Option<String>,
    pub app_id: Option<String>,
    pub app_secret: Option<String>,
    pub receive_id: Option<String>,
    pub receive_id_type: String,
    pub api_base_url: String,
    pub timeout_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_url: None,
            app_id: None,
            app_secret: None,
            receive_id: None,
            receive_id_type: "chat_id".to_string(),
            api_base_url: "https://open.feishu.cn/open-apis".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyConfigError {
    #[error("notifications enabled but neither webhook_url nor app_id + app_secret is set")]
    NoDeliveryMode,
    #[error("app credentials set but receive_id is missing")]
    MissingReceiveId,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Wraps a [`Transport`]; never lets a delivery failure escape.
pub struct Notifier {
    transport: Box<dyn Transport>,
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("transport", &self.transport.name())
            .finish()
    }
}

impl Notifier {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Webhook wins over app credentials when both are configured.
    /// Returns `Ok(None)` when notifications are disabled.
    pub fn from_config(config: &NotifyConfig) -> Result<Option<Self>, NotifyConfigError> {
        if !config.enabled {
            info!("notifications disabled");
            return Ok(None);
        }
        let timeout = Duration::from_secs(config.timeout_secs.max(1));

        if let Some(url) = non_empty(&config.webhook_url) {
            let transport = WebhookTransport::new(url, timeout)?;
            return Ok(Some(Self::new(Box::new(transport))));
        }

        match (non_empty(&config.app_id), non_empty(&config.app_secret)) {
            (Some(app_id), Some(app_secret)) => {
                let receive_id =
                    non_empty(&config.receive_id).ok_or(NotifyConfigError::MissingReceiveId)?;
                let transport = ApiTransport::new(
                    config.api_base_url.clone(),
                    ApiCredentials {
                        app_id: app_id.to_string(),
                        app_secret: app_secret.to_string(),
                        receive_id: receive_id.to_string(),
                        receive_id_type: config.receive_id_type.clone(),
                    },
                    timeout,
                )?;
                Ok(Some(Self::new(Box::new(transport))))
            }
            _ => Err(NotifyConfigError::NoDeliveryMode),
        }
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Returns whether a message was delivered. Records without a description
    /// are skipped without touching the transport.
    pub async fn notify(&self, record: &Record) -> bool {
        let Some(message) = NotificationMessage::for_record(record) else {
            debug!(author = %record.author, "record has no description, notification skipped");
            return false;
        };

        let span = info_span!("notify", transport = self.transport.name());
        match self.transport.send(&message).instrument(span).await {
            Ok(()) => {
                info!(title = record.display_title(), "notification sent");
                true
            }
            Err(err) => {
                error!(error = %err, title = record.display_title(), "notification failed");
                false
            }
        }
    }
}
