//! `tingly-box` binary: loads configuration, wires the Gateway, the IM Bot
//! Framework, WebChat Relay, OAuth refresher and Remote-Coder session
//! manager together, and serves them behind one HTTP listener until a
//! termination signal arrives.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use warp::Filter;

use tingly_box::agent::cli::CliAgent;
use tingly_box::agent::{PermissionGate, PermissionMode, Registry as AgentRegistry};
use tingly_box::config::Config;
use tingly_box::gateway::{self, GatewayState};
use tingly_box::messengers::{Manager as MessengerManager, ManagerOptions};
use tingly_box::oauth::{OAuthManager, OAuthStore};
use tingly_box::observability::{CompositeObserver, LogObserver, Observer, PrometheusObserver};
use tingly_box::remote_coder::{self, RemoteCoderManager};
use tingly_box::rules::{RuleEngine, RuleStateStore};
use tingly_box::template::TemplateManager;
use tingly_box::usage::UsageRecorder;
use tingly_box::webchat::{self, Store as WebChatStore};

#[derive(Debug, Parser)]
#[command(
    name = "tingly-box",
    version,
    about = "Self-hosted LLM gateway and control plane"
)]
struct Cli {
    /// Path to config.toml (defaults to the platform config dir)
    #[arg(long, env = "TINGLY_CONFIG_PATH")]
    config: Option<std::path::PathBuf>,
    /// Override the gateway's bind address (host:port)
    #[arg(long, env = "TINGLY_LISTEN")]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::load_default()?,
    };
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    let data_dir = Config::config_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;

    let prometheus = Arc::new(PrometheusObserver::new());
    let observer: Arc<dyn Observer> =
        Arc::new(CompositeObserver::new(vec![Arc::new(LogObserver::new()), prometheus.clone()]));

    let usage = Arc::new(UsageRecorder::open(&data_dir.join("usage.db"))?);
    let rule_store = RuleStateStore::open(&data_dir.join("rule_state.db"))?;
    let rules = Arc::new(RuleEngine::new(
        config.rules.clone(),
        config.providers.clone(),
        rule_store,
        usage.clone(),
        observer.clone(),
    ));

    let oauth_store = Arc::new(OAuthStore::open(&data_dir.join("oauth.db"))?);
    let oauth = Arc::new(OAuthManager::new(config.oauth.clone(), oauth_store, observer.clone()));
    oauth.start_refresher().await;

    let templates = Arc::new(TemplateManager::new(data_dir.join("templates_cache.json"), None));
    templates.validate_embedded().context("embedded template catalog is invalid")?;

    let gateway_state = Arc::new(GatewayState::new(
        rules,
        usage,
        templates,
        oauth,
        observer.clone(),
        prometheus,
    ));

    let remote_coder = Arc::new(RemoteCoderManager::open(
        &data_dir.join("remote_coder.db"),
        config.remote_coder.session_timeout_secs,
    )?);
    tokio::spawn(remote_coder::run_retention_loop(
        remote_coder.clone(),
        std::time::Duration::from_secs(300),
        chrono::Duration::seconds(config.remote_coder.retention_secs),
    ));

    let webchat_store = Arc::new(WebChatStore::open(&data_dir.join("webchat.db"))?);
    let webchat_hub = webchat::Hub::new(webchat_store, config.webchat.cache_size);
    tokio::spawn(webchat::run_cache_prune_loop(
        webchat_hub.clone(),
        std::time::Duration::from_secs(600),
        chrono::Duration::hours(24),
    ));

    let agent_registry = Arc::new(AgentRegistry::new());
    if !config.agent.binary_path.is_empty() {
        agent_registry
            .register(Arc::new(CliAgent::new("default", config.agent.binary_path.clone())))
            .await;
    }
    let _permission_gate = Arc::new(PermissionGate::new(
        parse_permission_mode(&config.agent.permission_mode),
        None,
        chrono::Duration::seconds(config.agent.permission_remember_secs),
        std::time::Duration::from_secs(config.agent.permission_request_timeout_secs),
    ));

    let messenger_manager = Arc::new(MessengerManager::new(ManagerOptions::default()));
    register_messengers(&messenger_manager, &config).await;
    messenger_manager.start().await;

    let routes = gateway::routes(gateway_state).or(webchat::routes(webchat_hub));

    let listen: std::net::SocketAddr = config
        .server
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", config.server.listen))?;

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        cancel_for_signal.cancel();
    });
    #[cfg(unix)]
    {
        let cancel_for_term = cancel.clone();
        tokio::spawn(async move {
            use tokio::signal::unix::{SignalKind, signal};
            if let Ok(mut sig) = signal(SignalKind::terminate()) {
                sig.recv().await;
                cancel_for_term.cancel();
            }
        });
    }

    println!("tingly-box listening on {listen}");
    let (_, server) = warp::serve(routes).bind_with_graceful_shutdown(listen, async move {
        cancel.cancelled().await;
    });
    server.await;

    Ok(())
}

fn parse_permission_mode(mode: &str) -> PermissionMode {
    match mode {
        "auto" => PermissionMode::Auto,
        "skip" => PermissionMode::Skip,
        _ => PermissionMode::Manual,
    }
}

/// Instantiates one bot adapter per configured, enabled entry whose
/// `platform` matches a compiled-in messenger feature. Required settings
/// keys per platform: slack (`bot_token`, `signing_secret`), discord
/// (`bot_token`), telegram (`bot_token`), feishu (`webhook_url`, `secret`),
/// whatsapp (`phone_number_id`, `access_token`), dingtalk (`webhook_url`,
/// `secret`). Entries missing a required key are skipped with a log line.
async fn register_messengers(manager: &Arc<MessengerManager>, config: &Config) {
    for entry in &config.messengers {
        if !entry.enabled {
            continue;
        }
        let settings = &entry.settings;
        match entry.platform.as_str() {
            #[cfg(feature = "messenger-slack")]
            "slack" => {
                let (Some(bot_token), Some(signing_secret)) =
                    (settings.get("bot_token"), settings.get("signing_secret"))
                else {
                    eprintln!("skipping slack messenger '{}': missing bot_token/signing_secret", entry.name);
                    continue;
                };
                let bot = tingly_box::messengers::slack::SlackBot::new(
                    entry.name.clone(),
                    bot_token.clone(),
                    signing_secret.clone(),
                );
                manager.register("slack", Box::new(bot)).await;
            }
            #[cfg(feature = "messenger-discord")]
            "discord" => {
                let Some(bot_token) = settings.get("bot_token") else {
                    eprintln!("skipping discord messenger '{}': missing bot_token", entry.name);
                    continue;
                };
                let bot = tingly_box::messengers::discord::DiscordBot::new(entry.name.clone(), bot_token.clone());
                manager.register("discord", Box::new(bot)).await;
            }
            #[cfg(feature = "messenger-telegram")]
            "telegram" => {
                let Some(bot_token) = settings.get("bot_token") else {
                    eprintln!("skipping telegram messenger '{}': missing bot_token", entry.name);
                    continue;
                };
                let bot = tingly_box::messengers::telegram::TelegramBot::new(entry.name.clone(), bot_token.clone());
                manager.register("telegram", Box::new(bot)).await;
            }
            #[cfg(feature = "messenger-feishu")]
            "feishu" => {
                let (Some(webhook_url), Some(secret)) = (settings.get("webhook_url"), settings.get("secret")) else {
                    eprintln!("skipping feishu messenger '{}': missing webhook_url/secret", entry.name);
                    continue;
                };
                let bot = tingly_box::messengers::feishu::FeishuBot::new(
                    entry.name.clone(),
                    webhook_url.clone(),
                    secret.clone(),
                );
                manager.register("feishu", Box::new(bot)).await;
            }
            #[cfg(feature = "messenger-whatsapp")]
            "whatsapp" => {
                let (Some(phone_number_id), Some(access_token)) =
                    (settings.get("phone_number_id"), settings.get("access_token"))
                else {
                    eprintln!("skipping whatsapp messenger '{}': missing phone_number_id/access_token", entry.name);
                    continue;
                };
                let bot = tingly_box::messengers::whatsapp::WhatsAppBot::new(
                    entry.name.clone(),
                    phone_number_id.clone(),
                    access_token.clone(),
                );
                manager.register("whatsapp", Box::new(bot)).await;
            }
            #[cfg(feature = "messenger-dingtalk")]
            "dingtalk" => {
                let (Some(webhook_url), Some(secret)) = (settings.get("webhook_url"), settings.get("secret")) else {
                    eprintln!("skipping dingtalk messenger '{}': missing webhook_url/secret", entry.name);
                    continue;
                };
                let bot = tingly_box::messengers::dingtalk::DingTalkBot::new(
                    entry.name.clone(),
                    webhook_url.clone(),
                    secret.clone(),
                );
                manager.register("dingtalk", Box::new(bot)).await;
            }
            other => {
                eprintln!("skipping messenger '{}': unsupported or not compiled in platform '{other}'", entry.name);
            }
        }
    }
}
