/// Outbound side of the Telegram Bot API, behind a trait so handlers can be tested offline.
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::types::{
    AllowedUpdate, InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, WebAppInfo,
};
use teloxide::{ApiError, RequestError};
use thiserror::Error;
use tracing::{info, warn};
use url::Url;

/// Why a message could not be delivered, in the terms the web application understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    UserBlockedBot,
    UserNeverStartedChat,
    RateLimited,
    Unknown,
    /// The code could not be persisted, so nothing was sent.
    StorageUnavailable,
    /// The bot never came up (missing token or failed registration).
    NotInitialized,
    InvalidRequest,
}

impl FailureReason {
    /// Transient reasons may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::RateLimited | FailureReason::Unknown | FailureReason::StorageUnavailable
        )
    }

    /// Classify a Bot API error from its numeric code and description.
    pub fn from_api_error(code: u16, description: &str) -> Self {
        let description = description.to_ascii_lowercase();
        match code {
            429 => FailureReason::RateLimited,
            403 if description.contains("blocked") => FailureReason::UserBlockedBot,
            400 | 403
                if description.contains("chat not found")
                    || description.contains("can't initiate conversation") =>
            {
                FailureReason::UserNeverStartedChat
            }
            _ => FailureReason::Unknown,
        }
    }
}

/// A failed send, as reported by the messaging platform.
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("user blocked the bot")]
    Blocked,
    #[error("chat not found, the user never started the bot")]
    ChatNotFound,
    #[error("rate limited by the platform")]
    RateLimited { retry_after: Option<Duration> },
    #[error("platform error {code}: {description}")]
    Api { code: u16, description: String },
    #[error("transport error: {0}")]
    Transport(String),
}

impl DeliveryError {
    pub fn reason(&self) -> FailureReason {
        match self {
            DeliveryError::Blocked => FailureReason::UserBlockedBot,
            DeliveryError::ChatNotFound => FailureReason::UserNeverStartedChat,
            DeliveryError::RateLimited { .. } => FailureReason::RateLimited,
            DeliveryError::Api { code, description } => FailureReason::from_api_error(*code, description),
            DeliveryError::Transport(_) => FailureReason::Unknown,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            DeliveryError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<RequestError> for DeliveryError {
    fn from(err: RequestError) -> Self {
        match err {
            RequestError::Api(ApiError::BotBlocked) => DeliveryError::Blocked,
            RequestError::Api(ApiError::ChatNotFound) => DeliveryError::ChatNotFound,
            RequestError::RetryAfter(wait) => DeliveryError::RateLimited {
                retry_after: Some(wait),
            },
            RequestError::Api(other) => {
                // Typed variants carry no numeric code; recover it from the description.
                let description = other.to_string();
                let code = if description.to_ascii_lowercase().contains("forbidden") {
                    403
                } else {
                    400
                };
                DeliveryError::Api { code, description }
            }
            other => DeliveryError::Transport(other.to_string()),
        }
    }
}

/// What an inline button does when pressed.
#[derive(Debug, Clone, PartialEq)]
pub enum ButtonAction {
    Url(Url),
    /// Opens the URL as a Telegram Web App inside the client.
    WebApp(Url),
    Callback(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Button {
    pub text: String,
    pub action: ButtonAction,
}

impl Button {
    pub fn url(text: impl Into<String>, url: Url) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Url(url),
        }
    }

    pub fn web_app(text: impl Into<String>, url: Url) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::WebApp(url),
        }
    }

    pub fn callback(text: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            action: ButtonAction::Callback(data.into()),
        }
    }
}

/// An HTML-formatted message with an optional inline keyboard.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub chat_id: i64,
    pub html: String,
    pub keyboard: Vec<Vec<Button>>,
}

impl OutgoingMessage {
    pub fn new(chat_id: i64, html: impl Into<String>) -> Self {
        Self {
            chat_id,
            html: html.into(),
            keyboard: Vec::new(),
        }
    }

    pub fn with_keyboard(mut self, keyboard: Vec<Vec<Button>>) -> Self {
        self.keyboard = keyboard;
        self
    }
}

/// Parameters for webhook registration.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookSettings {
    pub url: Url,
    pub max_connections: u8,
    pub secret_token: Option<String>,
}

/// The subset of the Bot API the bot relies on.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Send a message, returning the platform's message id.
    async fn send(&self, message: OutgoingMessage) -> Result<i32, DeliveryError>;

    async fn answer_callback(&self, callback_id: &str) -> Result<(), DeliveryError>;

    /// Point the platform at our webhook. Only message and callback updates are requested.
    async fn register_webhook(&self, settings: &WebhookSettings) -> Result<(), DeliveryError>;

    async fn remove_webhook(&self) -> Result<(), DeliveryError>;
}

/// `Messenger` over a live teloxide `Bot`.
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

fn inline_keyboard(rows: &[Vec<Button>]) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::new(rows.iter().map(|row| {
        row.iter()
            .map(|button| match &button.action {
                ButtonAction::Url(url) => InlineKeyboardButton::url(button.text.clone(), url.clone()),
                ButtonAction::WebApp(url) => InlineKeyboardButton::web_app(
                    button.text.clone(),
                    WebAppInfo { url: url.clone() },
                ),
                ButtonAction::Callback(data) => {
                    InlineKeyboardButton::callback(button.text.clone(), data.clone())
                }
            })
            .collect::<Vec<_>>()
    }))
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, message: OutgoingMessage) -> Result<i32, DeliveryError> {
        let mut request = self
            .bot
            .send_message(ChatId(message.chat_id), message.html)
            .parse_mode(ParseMode::Html);
        if !message.keyboard.is_empty() {
            request = request.reply_markup(inline_keyboard(&message.keyboard));
        }

        request.await.map(|msg| msg.id.0).map_err(|e| {
            let err = DeliveryError::from(e);
            warn!(chat_id = message.chat_id, reason = ?err.reason(), "Failed to send: {}", err);
            err
        })
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<(), DeliveryError> {
        self.bot.answer_callback_query(callback_id).await?;
        Ok(())
    }

    async fn register_webhook(&self, settings: &WebhookSettings) -> Result<(), DeliveryError> {
        let mut request = self
            .bot
            .set_webhook(settings.url.clone())
            .max_connections(settings.max_connections)
            .allowed_updates(vec![AllowedUpdate::Message, AllowedUpdate::CallbackQuery]);
        if let Some(secret) = &settings.secret_token {
            request = request.secret_token(secret.clone());
        }
        request.await?;
        info!("Webhook registered at {}", settings.url);
        Ok(())
    }

    async fn remove_webhook(&self) -> Result<(), DeliveryError> {
        self.bot.delete_webhook().await?;
        info!("Webhook removed");
        Ok(())
    }
}
