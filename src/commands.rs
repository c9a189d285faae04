/// Telegram command routing and handlers.
use crate::bot::BotSession;
use crate::code::looks_like_code;
use crate::error::Result;
use crate::messenger::{Button, OutgoingMessage};
use crate::store::{IncomingUser, TelegramUser};
use crate::tasks::Job;
use chrono::Utc;
use teloxide::utils::command::{BotCommands, ParseError};
use teloxide::utils::html;
use tracing::{debug, info, warn};

/// Telegram bot commands.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Marketplace bot commands:")]
pub enum Command {
    #[command(description = "Start the bot and see the welcome message")]
    Start(String),
    #[command(description = "Log in to the marketplace with Telegram")]
    Login,
    #[command(description = "Show your marketplace profile")]
    Profile,
    #[command(description = "Show help and usage information")]
    Help,
}

/// Inline button callback identifiers.
pub const CALLBACK_LOGIN: &str = "login";
pub const CALLBACK_PROFILE: &str = "profile";
pub const CALLBACK_HELP: &str = "help";

/// Where a piece of inbound text should go.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Command(Command),
    /// The text is exactly a 6-digit code.
    CodeSighting(String),
    UnknownCommand,
    Ignore,
}

pub fn route_text(text: &str, bot_username: &str) -> Route {
    let text = text.trim();
    if text.starts_with('/') {
        return match Command::parse(text, bot_username) {
            Ok(cmd) => Route::Command(cmd),
            // Addressed to another bot in a group.
            Err(ParseError::WrongBotName(_)) => Route::Ignore,
            Err(_) => Route::UnknownCommand,
        };
    }
    if looks_like_code(text) {
        Route::CodeSighting(text.to_string())
    } else {
        Route::Ignore
    }
}

/// Handle a text message: register the sender, then route it.
pub async fn handle_text(
    session: &BotSession,
    user: &IncomingUser,
    chat_id: i64,
    text: &str,
) -> Result<()> {
    let known = session.register_user(user)?;

    match route_text(text, session.bot_username()) {
        Route::Command(cmd) => handle_command(session, user, &known, chat_id, cmd).await,
        Route::CodeSighting(code) => check_code_sighting(session, user.telegram_id, chat_id, &code).await,
        Route::UnknownCommand => {
            session
                .reply(OutgoingMessage::new(
                    chat_id,
                    "🤔 Unknown command. Type /help to see what I can do.",
                ))
                .await?;
            Ok(())
        }
        Route::Ignore => Ok(()),
    }
}

/// Handle an inline button press: register the sender, then run the matching command.
pub async fn handle_callback_data(
    session: &BotSession,
    user: &IncomingUser,
    chat_id: i64,
    data: &str,
) -> Result<()> {
    let known = session.register_user(user)?;

    match data {
        CALLBACK_LOGIN => handle_login(session, &known, chat_id).await,
        CALLBACK_PROFILE => handle_profile(session, user, chat_id).await,
        CALLBACK_HELP => handle_help(session, chat_id).await,
        other => {
            debug!(telegram_id = user.telegram_id, "Unknown callback data: {}", other);
            Ok(())
        }
    }
}

async fn handle_command(
    session: &BotSession,
    user: &IncomingUser,
    known: &TelegramUser,
    chat_id: i64,
    cmd: Command,
) -> Result<()> {
    match cmd {
        Command::Start(referral) => handle_start(session, user, chat_id, &referral).await,
        Command::Login => handle_login(session, known, chat_id).await,
        Command::Profile => handle_profile(session, user, chat_id).await,
        Command::Help => handle_help(session, chat_id).await,
    }
}

/// Handler for the /start command.
pub async fn handle_start(
    session: &BotSession,
    user: &IncomingUser,
    chat_id: i64,
    referral: &str,
) -> Result<()> {
    let referral = referral.trim();
    if !referral.is_empty() {
        session.tasks().enqueue(Job::RecordReferral {
            telegram_id: user.telegram_id,
            referral_code: referral.to_string(),
        });
    }

    let welcome_text = format!(
        "👋 <b>Welcome to the marketplace, {}!</b>\n\n\
         I sign you in to the website with your Telegram account and deliver \
         your one-time login codes.\n\n\
         📝 Quick Start:\n\
         • /login - sign in to the website\n\
         • /profile - your marketplace profile\n\
         • /help - all commands",
        html::escape(&user.display_name())
    );

    let mut keyboard = Vec::new();
    if let Some(open) = session.app_button("🚀 Open marketplace", "/") {
        keyboard.push(vec![open]);
    }
    keyboard.push(vec![
        Button::callback("🔑 Log in", CALLBACK_LOGIN),
        Button::callback("📖 Help", CALLBACK_HELP),
    ]);

    session
        .reply(OutgoingMessage::new(chat_id, welcome_text).with_keyboard(keyboard))
        .await?;

    session.tasks().enqueue(Job::DelayedMessage {
        message: OutgoingMessage::new(
            chat_id,
            "💡 Login codes from this bot are only ever entered on the website. \
             Never send them to anyone, not even back to this chat.",
        ),
        delay: session.config().welcome_followup_delay,
    });

    info!(telegram_id = user.telegram_id, referral = !referral.is_empty(), "User started the bot");
    Ok(())
}

/// Handler for the /login command.
pub async fn handle_login(session: &BotSession, known: &TelegramUser, chat_id: i64) -> Result<()> {
    let message = if known.account_id.is_some() {
        let text = "🔑 <b>Quick login</b>\n\n\
                    Your Telegram account is linked to the marketplace. \
                    Tap the button below to sign in instantly.";
        let path = format!("/login/telegram/quick?telegram_id={}", known.telegram_id);
        with_link(session, OutgoingMessage::new(chat_id, text), "⚡ Quick login", &path)
    } else {
        let text = "🔑 <b>Log in with Telegram</b>\n\n\
                    1. Open the login page and choose \"Log in with Telegram\".\n\
                    2. Enter your phone number.\n\
                    3. I will send you a 6-digit code here. Enter it on the website.\n\n\
                    After the first login your accounts are linked and /login offers a quick login.";
        with_link(session, OutgoingMessage::new(chat_id, text), "🌐 Login page", "/login/telegram")
    };

    session.reply(message).await?;
    Ok(())
}

/// Handler for the /profile command.
pub async fn handle_profile(session: &BotSession, user: &IncomingUser, chat_id: i64) -> Result<()> {
    let message = match session.store().linked_account(user.telegram_id)? {
        Some(account) => {
            let rating = match account.rating {
                Some(r) => format!("{:.1} / 5", r),
                None => "no reviews yet".to_string(),
            };
            let text = format!(
                "👤 <b>{}</b>\n\n\
                 Role: {}\n\
                 Rating: {}\n\
                 Completed orders: {}",
                html::escape(&account.display_name),
                html::escape(&account.role),
                rating,
                account.completed_orders
            );
            with_link(session, OutgoingMessage::new(chat_id, text), "👤 Open profile", "/profile")
        }
        None => {
            let text = "🙈 <b>You are not registered yet</b>\n\n\
                        This Telegram account is not linked to a marketplace profile. \
                        Sign up on the website, or log in once with /login to link it.";
            with_link(session, OutgoingMessage::new(chat_id, text), "📝 Sign up", "/register")
        }
    };

    session.reply(message).await?;
    Ok(())
}

/// Handler for the /help command.
pub async fn handle_help(session: &BotSession, chat_id: i64) -> Result<()> {
    let help_text = format!(
        "📖 <b>Help</b>\n\n{}\n\n\
         Security Recommendations:\n\
         ✅ Enter login codes only on the website\n\
         ⚠️ Nobody from the marketplace will ever ask you for a code",
        html::escape(&Command::descriptions().to_string())
    );
    let keyboard = vec![vec![
        Button::callback("🔑 Log in", CALLBACK_LOGIN),
        Button::callback("👤 Profile", CALLBACK_PROFILE),
    ]];

    session
        .reply(OutgoingMessage::new(chat_id, help_text).with_keyboard(keyboard))
        .await?;
    Ok(())
}

/// Warn a user who pasted one of their live codes into the chat.
///
/// Never changes the code's state; this chat is not a way to verify.
pub async fn check_code_sighting(
    session: &BotSession,
    telegram_id: i64,
    chat_id: i64,
    code: &str,
) -> Result<()> {
    let Some(record) = session.store().find_live_code(telegram_id, code, Utc::now())? else {
        return Ok(());
    };

    warn!(
        verification_id = record.id,
        telegram_id, "Live verification code pasted into the chat"
    );
    session
        .reply(OutgoingMessage::new(
            chat_id,
            "⚠️ <b>Don't share this code</b>\n\n\
             It only works on the website's login page. Never send it to anyone, \
             including this chat or people claiming to be support.",
        ))
        .await?;
    Ok(())
}

fn with_link(session: &BotSession, message: OutgoingMessage, text: &str, path: &str) -> OutgoingMessage {
    match session.app_url(path) {
        Some(url) => message.with_keyboard(vec![vec![Button::url(text, url)]]),
        None => message,
    }
}
