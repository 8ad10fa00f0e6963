use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use super::{DeliveryError, TelegramApi};
use crate::model::Recipient;
use crate::pipeline::Sender;

/// Bot API allows about 30 messages per second.
const MESSAGE_INTERVAL: Duration = Duration::from_millis(1000 / 30);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(10);
/// Upper bound on a server-requested flood-control wait.
const RETRY_AFTER_CAP: Duration = Duration::from_secs(60);

pub struct TelegramSender {
    api: Arc<dyn TelegramApi>,
    cancel: CancellationToken,
    interval: Duration,
    retry_base: Duration,
}

impl TelegramSender {
    pub fn new(api: Arc<dyn TelegramApi>, cancel: CancellationToken) -> Self {
        Self {
            api,
            cancel,
            interval: MESSAGE_INTERVAL,
            retry_base: RETRY_BASE,
        }
    }

    /// Override pacing and retry base (tests use zero).
    pub fn with_timing(mut self, interval: Duration, retry_base: Duration) -> Self {
        self.interval = interval;
        self.retry_base = retry_base;
        self
    }

    async fn sleep(&self, wait: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(anyhow!("delivery cancelled")),
            _ = tokio::time::sleep(wait) => Ok(()),
        }
    }

    async fn send_with_retry(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.api.send_message(chat_id, text).await {
                Ok(()) => return Ok(()),
                Err(err) if !err.is_retryable() || attempt >= MAX_ATTEMPTS => return Err(err),
                Err(err) => {
                    let delay = match &err {
                        DeliveryError::RetryAfter(wait) => (*wait).min(RETRY_AFTER_CAP),
                        _ => self.retry_base.saturating_mul(attempt).min(RETRY_CAP),
                    };
                    warn!(chat_id, attempt, error = %err, "send failed; retrying");
                    if self.sleep(delay).await.is_err() {
                        return Err(err);
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Sender for TelegramSender {
    /// Every message goes to every recipient. A failed recipient is logged
    /// and skipped; the call only fails when nothing at all was delivered.
    #[instrument(skip_all, fields(recipients = recipients.len(), messages = messages.len()))]
    async fn send(&self, recipients: &[Recipient], messages: &[String]) -> Result<()> {
        if recipients.is_empty() {
            bail!("no recipients provided");
        }
        if messages.is_empty() {
            bail!("no messages to send");
        }

        let total = recipients.len() * messages.len();
        let mut delivered = 0usize;
        let mut last_sent: Option<Instant> = None;

        'recipients: for recipient in recipients {
            for (i, message) in messages.iter().enumerate() {
                if let Some(last) = last_sent {
                    let elapsed = last.elapsed();
                    if elapsed < self.interval {
                        self.sleep(self.interval - elapsed).await?;
                    }
                }
                if self.cancel.is_cancelled() {
                    bail!("delivery cancelled");
                }
                let result = self.send_with_retry(&recipient.chat_id, message).await;
                last_sent = Some(Instant::now());
                match result {
                    Ok(()) => delivered += 1,
                    Err(err) => {
                        warn!(
                            recipient = %recipient.name,
                            chat_id = %recipient.chat_id,
                            message = i + 1,
                            error = %err,
                            "delivery failed; skipping recipient"
                        );
                        continue 'recipients;
                    }
                }
            }
        }

        info!(delivered, total, "delivery finished");
        if delivered == 0 {
            bail!("no message could be delivered to any of {} recipients", recipients.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telegram::IncomingUpdate;
    use chrono::Utc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingApi {
        sent: Mutex<Vec<(String, String)>>,
        failures: Mutex<HashMap<String, VecDeque<DeliveryError>>>,
    }

    impl RecordingApi {
        fn fail(&self, chat_id: &str, errors: Vec<DeliveryError>) {
            self.failures
                .lock()
                .unwrap()
                .insert(chat_id.to_string(), errors.into());
        }

        fn calls_to(&self, chat_id: &str) -> usize {
            self.sent.lock().unwrap().iter().filter(|(c, _)| c == chat_id).count()
        }
    }

    #[async_trait]
    impl TelegramApi for RecordingApi {
        async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), DeliveryError> {
            self.sent
                .lock()
                .unwrap()
                .push((chat_id.to_string(), text.to_string()));
            let next = self
                .failures
                .lock()
                .unwrap()
                .get_mut(chat_id)
                .and_then(|q| q.pop_front());
            match next {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        async fn get_updates(&self, _offset: i64) -> Result<Vec<IncomingUpdate>> {
            Ok(Vec::new())
        }
    }

    fn recipient(name: &str, chat_id: &str) -> Recipient {
        Recipient {
            name: name.into(),
            chat_id: chat_id.into(),
            updated_at: Utc::now(),
        }
    }

    fn sender(api: Arc<RecordingApi>) -> TelegramSender {
        TelegramSender::new(api, CancellationToken::new()).with_timing(Duration::ZERO, Duration::ZERO)
    }

    fn messages() -> Vec<String> {
        vec!["one".into(), "two".into()]
    }

    #[tokio::test]
    async fn sends_every_message_to_every_recipient_in_order() {
        let api = Arc::new(RecordingApi::default());
        sender(api.clone())
            .send(&[recipient("a", "1"), recipient("b", "2")], &messages())
            .await
            .unwrap();
        let sent = api.sent.lock().unwrap().clone();
        assert_eq!(
            sent,
            vec![
                ("1".to_string(), "one".to_string()),
                ("1".to_string(), "two".to_string()),
                ("2".to_string(), "one".to_string()),
                ("2".to_string(), "two".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn retryable_errors_are_retried() {
        let api = Arc::new(RecordingApi::default());
        api.fail("1", vec![DeliveryError::Retryable("timeout".into()), DeliveryError::Retryable("timeout".into())]);
        sender(api.clone()).send(&[recipient("a", "1")], &messages()).await.unwrap();
        // Two failures, then both messages delivered.
        assert_eq!(api.calls_to("1"), 4);
    }

    #[tokio::test]
    async fn failing_recipient_does_not_abort_the_batch() {
        let api = Arc::new(RecordingApi::default());
        api.fail("1", vec![DeliveryError::Permanent("chat not found".into())]);
        sender(api.clone())
            .send(&[recipient("a", "1"), recipient("b", "2")], &messages())
            .await
            .unwrap();
        assert_eq!(api.calls_to("1"), 1);
        assert_eq!(api.calls_to("2"), 2);
    }

    #[tokio::test]
    async fn retries_stop_after_three_attempts() {
        let api = Arc::new(RecordingApi::default());
        api.fail("1", (0..5).map(|_| DeliveryError::Retryable("502".into())).collect());
        let err = sender(api.clone()).send(&[recipient("a", "1")], &messages()).await;
        assert!(err.is_err());
        assert_eq!(api.calls_to("1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_control_wait_is_honoured() {
        let api = Arc::new(RecordingApi::default());
        api.fail("1", vec![DeliveryError::RetryAfter(Duration::from_secs(8))]);
        let started = Instant::now();
        sender(api.clone()).send(&[recipient("a", "1")], &messages()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(8));
        assert_eq!(api.calls_to("1"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn flood_control_wait_is_capped() {
        let api = Arc::new(RecordingApi::default());
        api.fail("1", vec![DeliveryError::RetryAfter(Duration::from_secs(3600))]);
        let started = Instant::now();
        sender(api.clone()).send(&[recipient("a", "1")], &messages()).await.unwrap();
        let elapsed = started.elapsed();
        assert!(elapsed >= RETRY_AFTER_CAP);
        assert!(elapsed < Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn empty_inputs_are_errors() {
        let api = Arc::new(RecordingApi::default());
        let s = sender(api.clone());
        assert!(s.send(&[], &messages()).await.is_err());
        assert!(s.send(&[recipient("a", "1")], &[]).await.is_err());
        assert!(api.sent.lock().unwrap().is_empty());
    }
}
