//! User notifications
//!
//! Delivery is best-effort: a failed send is logged and never rolls back or
//! fails the ledger operation that triggered it.

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::storage::LedgerStore;
use crate::types::UserId;

/// Notification sink
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> LedgerResult<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> LedgerResult<()> {
        info!(to, subject, body, "Notification");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    to: &'a str,
    subject: &'a str,
    body: &'a str,
}

/// POSTs notifications as JSON to a mail relay
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> LedgerResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LedgerError::Notification(e.to_string()))?;
        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> LedgerResult<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&WebhookPayload { to, subject, body })
            .send()
            .await
            .map_err(|e| LedgerError::Notification(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LedgerError::Notification(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        debug!(to, subject, "Notification delivered");
        Ok(())
    }
}

/// Captured notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Keeps notifications in memory, for tests
#[derive(Debug, Default, Clone)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<SentNotification>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn send(&self, to: &str, subject: &str, body: &str) -> LedgerResult<()> {
        self.sent.lock().await.push(SentNotification {
            to: to.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

/// Look up the user's address and send; failures are logged and swallowed
pub async fn notify_user<S: LedgerStore + ?Sized>(
    store: &S,
    notifier: &dyn Notifier,
    user_id: &UserId,
    subject: &str,
    body: &str,
) {
    let user = match store.get_user(user_id).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            debug!(%user_id, subject, "No user row, notification dropped");
            return;
        }
        Err(e) => {
            warn!(%user_id, subject, error = %e, "User lookup for notification failed");
            return;
        }
    };
    if let Err(e) = notifier.send(&user.email, subject, body).await {
        warn!(%user_id, subject, error = %e, "Notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLedgerStore;
    use crate::types::User;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_notify_user_resolves_email() {
        let store = MemoryLedgerStore::new();
        let user = User {
            id: Uuid::new_v4(),
            email: "investor@example.com".to_string(),
            referrer_id: None,
        };
        store.save_user(&user).await.unwrap();

        let notifier = MemoryNotifier::new();
        notify_user(&store, &notifier, &user.id, "ROI credited", "30 USDT").await;
        notify_user(&store, &notifier, &Uuid::new_v4(), "ignored", "").await;

        let sent = notifier.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "investor@example.com");
    }
}
