/// Bot session: update delivery, verification code issuance and login notifications.
use crate::code::looks_like_code;
use crate::commands::{self, Command};
use crate::config::{Config, Environment};
use crate::error::{BotError, Result};
use crate::messenger::{
    Button, FailureReason, Messenger, OutgoingMessage, TelegramMessenger, WebhookSettings,
};
use crate::store::{IncomingUser, MessageLogEntry, Store, TelegramUser};
use crate::tasks::{Job, RetryPolicy, TaskQueue};
use chrono::Utc;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use teloxide::dispatching::ShutdownToken;
use tokio::task::JoinHandle;
use teloxide::prelude::*;
use teloxide::types::{AllowedUpdate, CallbackQuery, Update, UpdateKind, User};
use teloxide::update_listeners::Polling;
use teloxide::utils::command::BotCommands;
use teloxide::utils::html;
use tracing::{debug, error, info, warn};
use url::Url;

/// How updates reach the bot. Exactly one is active per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// The platform pushes updates to our HTTPS endpoint.
    Webhook,
    /// We pull updates with long polling.
    Polling,
}

impl DeliveryMode {
    pub fn for_environment(environment: Environment) -> Self {
        match environment {
            Environment::Production => DeliveryMode::Webhook,
            Environment::Development => DeliveryMode::Polling,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Webhook => "webhook",
            DeliveryMode::Polling => "polling",
        }
    }
}

/// Result of a verification code delivery, reported back to the web application.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    Delivered { message_id: i32, verification_id: i64 },
    Failed { reason: FailureReason },
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Delivered { .. })
    }
}

/// A spawned polling dispatcher and the handle that stops it.
struct PollingTask {
    token: ShutdownToken,
    task: JoinHandle<()>,
}

/// The process-wide bot session, built once at startup and shared behind an `Arc`.
pub struct BotSession {
    config: Arc<Config>,
    messenger: Arc<dyn Messenger>,
    store: Arc<Store>,
    tasks: TaskQueue,
    mode: DeliveryMode,
    bot_username: String,
    polling: Mutex<Option<PollingTask>>,
}

impl BotSession {
    /// Connect to Telegram with the configured token and start the session.
    ///
    /// Fails with `BotError::Config` when no token is configured.
    pub async fn initialize(config: Arc<Config>, store: Arc<Store>) -> Result<(Self, Bot)> {
        let token = config.bot_token.clone().ok_or_else(|| {
            BotError::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required. \
                 Get your token from @BotFather on Telegram."
                    .to_string(),
            )
        })?;

        let bot = Bot::new(token);
        let me = bot.get_me().await?;
        let bot_username = me.username().to_string();

        if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
            warn!("Failed to set bot commands menu: {}", e);
        } else {
            info!("Bot commands menu set successfully");
        }

        let messenger: Arc<dyn Messenger> = Arc::new(TelegramMessenger::new(bot.clone()));
        let session = Self::start(config, messenger, store, bot_username).await?;
        Ok((session, bot))
    }

    /// Select the delivery mode and prepare the platform side for it.
    pub async fn start(
        config: Arc<Config>,
        messenger: Arc<dyn Messenger>,
        store: Arc<Store>,
        bot_username: String,
    ) -> Result<Self> {
        let mode = DeliveryMode::for_environment(config.environment);
        match mode {
            DeliveryMode::Webhook => {
                let settings = WebhookSettings {
                    url: config.webhook_url()?,
                    max_connections: config.webhook_max_connections,
                    secret_token: config.webhook_secret.clone(),
                };
                messenger.register_webhook(&settings).await?;
            }
            DeliveryMode::Polling => {
                // A leftover webhook makes getUpdates fail.
                messenger.remove_webhook().await?;
            }
        }

        let tasks = TaskQueue::spawn(
            store.clone(),
            messenger.clone(),
            RetryPolicy {
                max_attempts: config.task_max_attempts,
                base_delay: config.task_retry_base,
            },
        );

        info!(mode = mode.as_str(), "Bot session ready as @{}", bot_username);

        Ok(Self {
            config,
            messenger,
            store,
            tasks,
            mode,
            bot_username,
            polling: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn tasks(&self) -> &TaskQueue {
        &self.tasks
    }

    pub fn bot_username(&self) -> &str {
        &self.bot_username
    }

    /// Send a reply right away, surfacing delivery errors to the handler.
    pub async fn reply(&self, message: OutgoingMessage) -> Result<i32> {
        Ok(self.messenger.send(message).await?)
    }

    /// Absolute link into the web application, or None if it does not form a valid URL.
    pub fn app_url(&self, path_and_query: &str) -> Option<Url> {
        let raw = self.config.app_link(path_and_query);
        match Url::parse(&raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Invalid app link {}: {}", raw, e);
                None
            }
        }
    }

    /// Button that opens a web application page; a Web App button when served over HTTPS.
    pub fn app_button(&self, text: &str, path_and_query: &str) -> Option<Button> {
        let url = self.app_url(path_and_query)?;
        if url.scheme() == "https" {
            Some(Button::web_app(text, url))
        } else {
            Some(Button::url(text, url))
        }
    }

    /// Upsert the sender. Runs before every handler.
    pub fn register_user(&self, user: &IncomingUser) -> Result<TelegramUser> {
        self.store.upsert_user(user, Utc::now())
    }

    /// Persist a code for `phone` and deliver it to `telegram_id`.
    ///
    /// The record is written as `pending` first and only becomes `sent` once the
    /// platform accepted the message; a failed send leaves it `failed`.
    pub async fn send_verification_code(
        &self,
        phone: &str,
        code: &str,
        telegram_id: i64,
    ) -> SendOutcome {
        let phone = phone.trim();
        let code = code.trim();
        if phone.is_empty() || !looks_like_code(code) {
            warn!(telegram_id, "Rejected verification request with malformed phone or code");
            return SendOutcome::Failed {
                reason: FailureReason::InvalidRequest,
            };
        }

        let record = match self.store.create_pending(
            phone,
            code,
            telegram_id,
            Utc::now(),
            self.config.code_ttl,
        ) {
            Ok(record) => record,
            Err(e) => {
                error!(telegram_id, "Failed to store verification code: {}", e);
                return SendOutcome::Failed {
                    reason: FailureReason::StorageUnavailable,
                };
            }
        };

        let verify_path = format!(
            "/login/telegram/verify?phone={}",
            urlencoding::encode(phone)
        );
        let mut text = format!(
            "🔐 <b>Your login code</b>\n\n\
             <code>{}</code>\n\n\
             Enter it on the website to finish signing in. \
             The code expires in {} minutes.\n\n\
             ⚠️ Never share this code with anyone, including support staff.",
            code,
            self.config.code_ttl.as_secs().div_ceil(60)
        );
        let mut message = OutgoingMessage::new(telegram_id, String::new());
        if let Some(url) = self.app_url(&verify_path) {
            text.push_str(&format!(
                "\n\n<a href=\"{}\">Open the verification page</a>",
                html::escape(url.as_str())
            ));
            message = message.with_keyboard(vec![vec![Button::url("✅ Enter the code", url)]]);
        }
        message.html = text;

        match self.messenger.send(message).await {
            Ok(message_id) => {
                let now = Utc::now();
                if let Err(e) = self.store.mark_sent(record.id, now) {
                    error!(
                        verification_id = record.id,
                        "Code delivered but could not be marked sent: {}", e
                    );
                    return SendOutcome::Failed {
                        reason: FailureReason::StorageUnavailable,
                    };
                }
                let entry = MessageLogEntry {
                    telegram_id,
                    message_type: "verification_code".to_string(),
                    message_id,
                    verification_id: Some(record.id),
                };
                if let Err(e) = self.store.log_message(&entry, now) {
                    warn!(verification_id = record.id, "Failed to log delivery: {}", e);
                }
                info!(
                    verification_id = record.id,
                    telegram_id, message_id, "Verification code delivered"
                );
                SendOutcome::Delivered {
                    message_id,
                    verification_id: record.id,
                }
            }
            Err(err) => {
                let reason = err.reason();
                warn!(
                    verification_id = record.id,
                    telegram_id,
                    ?reason,
                    "Verification code not delivered: {}",
                    err
                );
                if let Err(e) = self.store.mark_failed(record.id, Utc::now()) {
                    error!(verification_id = record.id, "Failed to mark code failed: {}", e);
                }
                SendOutcome::Failed { reason }
            }
        }
    }

    /// Queue the post-login courtesy message. Returns whether the job was accepted.
    pub fn send_auth_success_notification(&self, telegram_id: i64, display_name: &str) -> bool {
        let text = format!(
            "✅ <b>Login successful</b>\n\n\
             Welcome back, {}! You are now signed in to the marketplace.\n\n\
             If this wasn't you, change your password and contact support.",
            html::escape(display_name)
        );
        let mut message = OutgoingMessage::new(telegram_id, text);
        if let Some(button) = self.app_button("📊 Open dashboard", "/dashboard") {
            message = message.with_keyboard(vec![vec![button]]);
        }
        self.tasks.enqueue(Job::Notify {
            message,
            log_type: "auth_success",
        })
    }

    /// Entry point for every inbound update, from the webhook or from polling.
    pub async fn process_update(&self, update: Update) {
        match update.kind {
            UpdateKind::Message(msg) => self.handle_message(msg).await,
            UpdateKind::CallbackQuery(query) => self.handle_callback(query).await,
            _ => debug!(update_id = update.id, "Ignoring unsupported update"),
        }
    }

    async fn handle_message(&self, msg: Message) {
        let (Some(from), Some(text)) = (msg.from(), msg.text()) else {
            return;
        };
        let user = incoming_user(from);
        if let Err(e) = commands::handle_text(self, &user, msg.chat.id.0, text).await {
            error!(chat_id = msg.chat.id.0, "Error handling message: {}", e);
        }
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        if let Err(e) = self.messenger.answer_callback(&query.id).await {
            warn!("Failed to answer callback query: {}", e);
        }
        let Some(data) = query.data.as_deref() else {
            return;
        };
        let user = incoming_user(&query.from);
        let chat_id = query
            .message
            .as_ref()
            .map(|m| m.chat.id.0)
            .unwrap_or(user.telegram_id);
        if let Err(e) = commands::handle_callback_data(self, &user, chat_id, data).await {
            error!(telegram_id = user.telegram_id, chat_id, "Error handling callback: {}", e);
        }
    }

    /// Release the delivery mode and drain background jobs.
    pub async fn stop(&self) {
        match self.mode {
            DeliveryMode::Webhook => {
                if let Err(e) = self.messenger.remove_webhook().await {
                    warn!("Failed to delete webhook on shutdown: {}", e);
                }
            }
            DeliveryMode::Polling => {
                let polling = self.polling.lock().ok().and_then(|mut slot| slot.take());
                if let Some(PollingTask { token, task }) = polling {
                    match token.shutdown() {
                        Ok(done) => done.await,
                        Err(_) => {
                            debug!("Polling dispatcher not running, aborting it");
                            task.abort();
                        }
                    }
                    if let Err(e) = task.await {
                        if !e.is_cancelled() {
                            warn!("Polling task ended abnormally: {}", e);
                        }
                    }
                }
            }
        }
        self.tasks.flush().await;
        info!(mode = self.mode.as_str(), "Bot session stopped");
    }
}

fn incoming_user(user: &User) -> IncomingUser {
    IncomingUser {
        telegram_id: user.id.0 as i64,
        username: user.username.clone(),
        first_name: Some(user.first_name.clone()),
        last_name: user.last_name.clone(),
        language_code: user.language_code.clone(),
    }
}

/// Whatever the rest of the application talks to: a live session, or a disabled
/// stand-in that logs and reports failure when the bot could not start.
#[derive(Clone)]
pub enum Gateway {
    Ready(Arc<BotSession>),
    Disabled { reason: String },
}

impl Gateway {
    pub fn session(&self) -> Option<&Arc<BotSession>> {
        match self {
            Gateway::Ready(session) => Some(session),
            Gateway::Disabled { .. } => None,
        }
    }

    pub fn mode(&self) -> Option<DeliveryMode> {
        self.session().map(|s| s.mode())
    }

    pub async fn send_verification_code(
        &self,
        phone: &str,
        code: &str,
        telegram_id: i64,
    ) -> SendOutcome {
        match self {
            Gateway::Ready(session) => session.send_verification_code(phone, code, telegram_id).await,
            Gateway::Disabled { reason } => {
                warn!(telegram_id, "Bot disabled ({}), verification code not sent", reason);
                SendOutcome::Failed {
                    reason: FailureReason::NotInitialized,
                }
            }
        }
    }

    pub fn send_auth_success_notification(&self, telegram_id: i64, display_name: &str) -> bool {
        match self {
            Gateway::Ready(session) => session.send_auth_success_notification(telegram_id, display_name),
            Gateway::Disabled { reason } => {
                warn!(telegram_id, "Bot disabled ({}), login notification skipped", reason);
                false
            }
        }
    }

    /// Parse a raw webhook body and process it.
    pub async fn process_raw_update(&self, body: &[u8]) -> Result<()> {
        let Gateway::Ready(session) = self else {
            warn!("Bot disabled, dropping webhook update");
            return Ok(());
        };
        let update: Update = serde_json::from_slice(body)?;
        session.process_update(update).await;
        Ok(())
    }
}

/// Start long polling in the background.
///
/// The dispatcher's shutdown handle is stored on the session before the task is
/// spawned, so `stop()` can always end it.
pub fn spawn_polling(session: Arc<BotSession>, bot: Bot) {
    let listener = Polling::builder(bot.clone())
        .timeout(session.config().poll_timeout)
        .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery])
        .build();

    let handler = dptree::entry().endpoint(|update: Update, session: Arc<BotSession>| async move {
        session.process_update(update).await;
        respond(())
    });

    let mut dispatcher = Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![session.clone()])
        .build();
    let token = dispatcher.shutdown_token();

    let task = tokio::spawn(async move {
        info!("Polling for updates...");
        dispatcher
            .dispatch_with_listener(
                listener,
                LoggingErrorHandler::with_custom_text("An error from the update listener"),
            )
            .await;
        info!("Polling stopped");
    });

    if let Ok(mut slot) = session.polling.lock() {
        *slot = Some(PollingTask { token, task });
    }
}
