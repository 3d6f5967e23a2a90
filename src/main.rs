use std::sync::Arc;

use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use gemibot::chatbot::telegram::{Command, classify_text};
use gemibot::chatbot::{
    EventKind, GeminiClient, InMemoryStore, InboundEvent, MessageHandler, TelegramClient,
};
use gemibot::config::Config;
use gemibot::telegram_log::TelegramLogLayer;

struct BotState {
    handler: Arc<MessageHandler>,
    telegram: Arc<TelegramClient>,
    bot_username: String,
}

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing_subscriber::fmt()
                .with_writer(std::io::stderr)
                .init();
            error!("Failed to start the bot: {e}");
            std::process::exit(1);
        }
    };

    let bot = Bot::new(&config.telegram_bot_token);
    let _guard = init_logging(&config, &bot);

    info!("🚀 Starting gemibot...");
    info!("Config: {:?}", config);

    let gemini = match GeminiClient::new(
        config.gemini_api_key.clone(),
        config.gemini_api_url.clone(),
        config.gemini_model.clone(),
        config.ai_timeout,
    ) {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    let bot_username = match bot.get_me().await {
        Ok(me) => {
            info!("Bot user ID: {}, username: @{}", me.id, me.username());
            me.username().to_string()
        }
        Err(e) => {
            warn!("Failed to get bot info: {e}");
            String::new()
        }
    };

    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register commands: {e}");
    }

    let telegram = Arc::new(TelegramClient::new(bot.clone()));
    let store = Arc::new(InMemoryStore::new(config.max_history_turns));
    let handler = Arc::new(MessageHandler::new(store, Arc::new(gemini), telegram.clone()));

    let state = Arc::new(BotState {
        handler,
        telegram,
        bot_username,
    });

    let schema = dptree::entry()
        .branch(Update::filter_message().endpoint(handle_message))
        .branch(Update::filter_callback_query().endpoint(handle_callback));

    info!("Bot is running...");

    Dispatcher::builder(bot, schema)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

/// Stdout + file logging, plus the Telegram log chat when configured.
fn init_logging(config: &Config, bot: &Bot) -> Option<WorkerGuard> {
    let log_file = std::fs::create_dir_all(&config.log_dir).and_then(|_| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(config.log_dir.join("gemibot.log"))
    });

    let (file_layer, guard) = match log_file {
        Ok(file) => {
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_filter(env_filter());
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("Failed to open log file in {}: {e}", config.log_dir.display());
            (None, None)
        }
    };

    let tg_layer = config
        .log_chat_id
        .map(|chat_id| TelegramLogLayer::new(bot.clone(), chat_id));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .with_filter(env_filter()),
        )
        .with(file_layer)
        .with(tg_layer)
        .init();

    guard
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

async fn handle_message(msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(user) = msg.from.as_ref() else {
        return Ok(());
    };

    let Some(text) = msg.text() else {
        debug!("Ignoring non-text message in chat {}", msg.chat.id);
        return Ok(());
    };

    let Some(kind) = classify_text(text, &state.bot_username) else {
        debug!("Ignoring unknown command from user {}", user.id);
        return Ok(());
    };

    if matches!(kind, EventKind::Text(_)) {
        state.telegram.send_typing(msg.chat.id.0).await;
    }

    let event = InboundEvent::new(user.id.0 as i64, msg.chat.id.0, kind);
    state.handler.handle(event).await;
    Ok(())
}

async fn handle_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    if let Err(e) = bot.answer_callback_query(q.id.clone()).await {
        warn!("Failed to answer callback query: {e}");
    }

    let Some(data) = q.data.clone() else {
        return Ok(());
    };

    let user_id = q.from.id.0 as i64;
    let chat_id = q
        .message
        .as_ref()
        .map(|m| m.chat().id.0)
        .unwrap_or(user_id);

    let event = InboundEvent::new(user_id, chat_id, EventKind::Callback(data));
    state.handler.handle(event).await;
    Ok(())
}
