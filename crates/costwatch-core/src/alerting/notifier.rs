//! Notification delivery for alerts

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Delivers a rendered alert message
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<()>;
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    text: &'a str,
}

/// Posts `{"text": ...}` to a chat-style incoming webhook
///
/// Without a URL every send succeeds without doing anything.
pub struct WebhookNotifier {
    client: Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        let url = url.filter(|u| !u.trim().is_empty());
        Ok(Self { client, url })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let Some(url) = &self.url else {
            debug!("No webhook configured, dropping alert");
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(&WebhookPayload { text })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::notification(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }

        info!("Webhook notification sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(body_json(serde_json::json!({"text": "hello"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(Some(format!("{}/hook", server.uri())), Duration::from_secs(5))
                .unwrap();
        notifier.send("hello").await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let notifier =
            WebhookNotifier::new(Some(server.uri()), Duration::from_secs(5)).unwrap();
        let err = notifier.send("hello").await.unwrap_err();
        assert!(matches!(err, Error::Notification(ref msg) if msg.contains("500")));
    }

    #[tokio::test]
    async fn missing_url_is_a_no_op() {
        let notifier = WebhookNotifier::new(Some("  ".into()), Duration::from_secs(5)).unwrap();
        assert!(!notifier.is_configured());
        notifier.send("hello").await.unwrap();
    }
}
