/// Test doubles shared by the unit tests.
use crate::bot::BotSession;
use crate::config::{Config, Environment};
use crate::messenger::{DeliveryError, Messenger, OutgoingMessage, WebhookSettings};
use crate::store::Store;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

/// Records everything the bot would have sent and can fail sends on demand.
#[derive(Default)]
pub struct FakeMessenger {
    sent: Mutex<Vec<OutgoingMessage>>,
    calls: Mutex<Vec<&'static str>>,
    webhook: Mutex<Option<WebhookSettings>>,
    failures: Mutex<VecDeque<DeliveryError>>,
    next_message_id: AtomicI32,
}

impl FakeMessenger {
    pub fn new() -> Self {
        Self {
            next_message_id: AtomicI32::new(100),
            ..Default::default()
        }
    }

    /// Make the next send fail with `err`. Queued failures are consumed in order.
    pub fn fail_next_send(&self, err: DeliveryError) {
        self.failures.lock().unwrap().push_back(err);
    }

    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat_id: i64) -> Vec<OutgoingMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.chat_id == chat_id)
            .collect()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn webhook(&self) -> Option<WebhookSettings> {
        self.webhook.lock().unwrap().clone()
    }
}

#[async_trait]
impl Messenger for FakeMessenger {
    async fn send(&self, message: OutgoingMessage) -> Result<i32, DeliveryError> {
        self.calls.lock().unwrap().push("send");
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.sent.lock().unwrap().push(message);
        Ok(self.next_message_id.fetch_add(1, Ordering::SeqCst))
    }

    async fn answer_callback(&self, _callback_id: &str) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push("answer_callback");
        Ok(())
    }

    async fn register_webhook(&self, settings: &WebhookSettings) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push("register_webhook");
        *self.webhook.lock().unwrap() = Some(settings.clone());
        Ok(())
    }

    async fn remove_webhook(&self) -> Result<(), DeliveryError> {
        self.calls.lock().unwrap().push("remove_webhook");
        *self.webhook.lock().unwrap() = None;
        Ok(())
    }
}

/// Configuration with fast timers and a fixed public host.
pub fn test_config(environment: Environment) -> Config {
    let env = match environment {
        Environment::Production => "production",
        Environment::Development => "development",
    };
    Config::from_lookup(|key| {
        let value = match key {
            "TELEGRAM_BOT_TOKEN" => "123456:TEST",
            "APP_ENV" => env,
            "APP_BASE_URL" => "https://market.example.com",
            "WEBHOOK_SECRET" => "hook-secret",
            "WELCOME_FOLLOWUP_DELAY_MS" => "0",
            "TASK_RETRY_BASE_MS" => "1",
            "INTERNAL_API_KEY" if environment == Environment::Production => "internal-key",
            _ => return None,
        };
        Some(value.to_string())
    })
    .unwrap()
}

/// A started session over an in-memory store and a fake messenger.
pub async fn test_session(
    environment: Environment,
) -> (Arc<BotSession>, Arc<FakeMessenger>, Arc<Store>) {
    let messenger = Arc::new(FakeMessenger::new());
    let store = Arc::new(Store::open_in_memory().unwrap());
    let session = BotSession::start(
        Arc::new(test_config(environment)),
        messenger.clone(),
        store.clone(),
        "market_bot".to_string(),
    )
    .await
    .unwrap();
    (Arc::new(session), messenger, store)
}
