use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use secrecy::SecretString;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use batch_moderator::config::{JudgeConfig, ModerationConfig};
use batch_moderator::llm::create_provider;
use batch_moderator::pipeline::{
    BatchProcessor, Dispatcher, JudgeClient, ModerationService, RetryGate,
};
use batch_moderator::platform::{BotRegistry, TelegramBot};

/// Install the global subscriber. The returned guard flushes the log file on drop.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_target(false);

    match std::env::var("MODERATOR_LOG_DIR") {
        Ok(dir) if !dir.trim().is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "moderator.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        _ => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let moderation = ModerationConfig::from_env().context("invalid moderation config")?;
    let judge_config = JudgeConfig::from_env().context("invalid judge config")?;
    let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN")
        .context("TELEGRAM_BOT_TOKEN is not set")?;

    eprintln!("🛡️  Batch moderator v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Judge: {} @ {}", judge_config.model, judge_config.endpoint);
    eprintln!(
        "   Batching: {} msgs / {}s idle / {}s max",
        moderation.max_batch_size,
        moderation.inactivity_timeout.as_secs(),
        moderation.max_batch_wait.as_secs()
    );
    if moderation.forward_targets.is_empty() {
        eprintln!("   Audit forward: disabled (no targets)");
    } else {
        eprintln!("   Audit forward: {}", moderation.forward_targets.join(", "));
    }

    // ── Judge ───────────────────────────────────────────────────────────
    let llm = create_provider(&judge_config)?;
    let gate = Arc::new(RetryGate::new(judge_config.retry_base, judge_config.retry_step));
    let judge = JudgeClient::new(
        llm,
        judge_config.rules.clone(),
        gate,
        judge_config.request_timeout,
    );

    // ── Platforms ───────────────────────────────────────────────────────
    let telegram = Arc::new(TelegramBot::new(SecretString::from(telegram_token)));
    let mut bots = BotRegistry::new();
    bots.register(telegram.clone());
    for bot in bots.all() {
        match bot.health_check().await {
            Ok(()) => tracing::info!(platform = bot.platform(), "Bot healthy"),
            Err(e) => tracing::warn!(platform = bot.platform(), error = %e, "Bot health check failed"),
        }
    }

    // ── Pipeline ────────────────────────────────────────────────────────
    let dispatcher = Dispatcher::new(bots, &moderation);
    let processor = Arc::new(BatchProcessor::new(judge, dispatcher));
    let service = ModerationService::new(moderation, processor);

    let mut events = telegram.start();
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(event) => {
                    service.on_event(event);
                }
                None => {
                    tracing::warn!("Event stream ended");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupt received");
                break;
            }
        }
    }

    service.shutdown().await;
    tracing::info!("Moderator stopped");
    Ok(())
}
