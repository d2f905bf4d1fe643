//! Notification transport: the `Notifier` seam plus the Twilio SMS
//! implementation used in production.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "adwatch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport rejected message (status {status}): {body}")]
    Api { status: u16, body: String },
}

/// Fire-and-forget message transport. Implementations accept bodies up to
/// the fragment limit; delivery is not guaranteed and never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, body: &str) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct TwilioConfig {
    pub account_sid: String,
    pub auth_token: String,
    pub from_number: String,
    pub to_number: String,
}

/// Partial Twilio Messages API response, enough to log the accepted
/// message id.
#[derive(Debug, Deserialize)]
struct MessageResponse {
    sid: Option<String>,
    status: Option<String>,
}

/// SMS notifier backed by the Twilio Messages REST API (form-encoded POST
/// with basic auth).
#[derive(Debug, Clone)]
pub struct TwilioNotifier {
    config: TwilioConfig,
    client: reqwest::Client,
}

impl TwilioNotifier {
    pub fn new(config: TwilioConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn messages_url(&self) -> String {
        format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.config.account_sid
        )
    }
}

#[async_trait]
impl Notifier for TwilioNotifier {
    async fn send(&self, body: &str) -> Result<(), NotifyError> {
        let mut form: HashMap<&str, &str> = HashMap::new();
        form.insert("Body", body);
        form.insert("From", &self.config.from_number);
        form.insert("To", &self.config.to_number);

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth(&self.config.account_sid, Some(&self.config.auth_token))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Api {
                status: status.as_u16(),
                body,
            });
        }

        match response.json::<MessageResponse>().await {
            Ok(message) => info!(
                sid = message.sid.as_deref().unwrap_or("unknown"),
                status = message.status.as_deref().unwrap_or("unknown"),
                "sms accepted by transport"
            ),
            // Delivery already succeeded at the HTTP level; a response we
            // cannot parse is only worth a warning.
            Err(err) => warn!(error = %err, "could not parse transport response"),
        }
        Ok(())
    }
}

/// Test double that records every body passed to `send`, in order.
#[derive(Debug, Default)]
pub struct CapturingNotifier {
    sent: Mutex<Vec<String>>,
}

impl CapturingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().expect("notifier mutex poisoned").clone()
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    async fn send(&self, body: &str) -> Result<(), NotifyError> {
        self.sent
            .lock()
            .expect("notifier mutex poisoned")
            .push(body.to_string());
        Ok(())
    }
}

/// Test double that rejects every send, for exercising transport-failure
/// handling.
#[derive(Debug, Default)]
pub struct FailingNotifier;

#[async_trait]
impl Notifier for FailingNotifier {
    async fn send(&self, _body: &str) -> Result<(), NotifyError> {
        Err(NotifyError::Api {
            status: 503,
            body: "injected transport failure".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capturing_notifier_records_bodies_in_order() {
        let notifier = CapturingNotifier::new();
        notifier.send("first").await.expect("send");
        notifier.send("second").await.expect("send");
        assert_eq!(notifier.sent(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn failing_notifier_surfaces_an_api_error() {
        let err = FailingNotifier.send("body").await.unwrap_err();
        assert!(matches!(err, NotifyError::Api { status: 503, .. }));
    }

    #[test]
    fn messages_url_targets_the_account() {
        let notifier = TwilioNotifier::new(TwilioConfig {
            account_sid: "AC123".to_string(),
            auth_token: "token".to_string(),
            from_number: "+15550001111".to_string(),
            to_number: "+15552223333".to_string(),
        });
        assert_eq!(
            notifier.messages_url(),
            "https://api.twilio.com/2010-04-01/Accounts/AC123/Messages.json"
        );
    }
}
