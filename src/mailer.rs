use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;

use crate::config::EmailConfig;

/// key: mailer -> provider adapter (resend | mock)
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

pub fn from_config(cfg: &EmailConfig) -> Arc<dyn Mailer> {
    match cfg.provider.as_str() {
        "resend" => Arc::new(ResendMailer::new(cfg)),
        _ => Arc::new(MockMailer),
    }
}

pub struct ResendMailer {
    client: Client,
    api_key: String,
    base: String,
    from: String,
}

impl ResendMailer {
    pub fn new(cfg: &EmailConfig) -> Self {
        Self::with_base(cfg, "https://api.resend.com")
    }

    pub fn with_base(cfg: &EmailConfig, base: impl Into<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client build"),
            api_key: cfg.api_key.clone(),
            base: base.into().trim_end_matches('/').to_string(),
            from: format!("{} <{}>", cfg.from_name, cfg.from_email),
        }
    }
}

#[async_trait]
impl Mailer for ResendMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let url = format!("{}/emails", self.base);
        self.client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [to],
                "subject": subject,
                "text": body,
            }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Logs instead of sending; the default outside production.
pub struct MockMailer;

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, to: &str, subject: &str, _body: &str) -> Result<()> {
        tracing::info!(%to, %subject, "mock mailer: message suppressed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[tokio::test]
    async fn resend_mailer_posts_message() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/emails")
                .header("authorization", "Bearer key-123");
            then.status(200).json_body(serde_json::json!({"id": "m1"}));
        });

        let cfg = EmailConfig {
            provider: "resend".into(),
            api_key: "key-123".into(),
            ..Default::default()
        };
        let mailer = ResendMailer::with_base(&cfg, server.base_url());
        mailer
            .send("merchant@example.com", "Your code", "123456")
            .await
            .unwrap();
        mock.assert();
    }

    #[tokio::test]
    async fn mock_mailer_always_succeeds() {
        MockMailer
            .send("someone@example.com", "subject", "body")
            .await
            .unwrap();
    }
}
