use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;

use yambus::backend::bus::Publisher;
use yambus::backend::config::{self, AppConfig};
use yambus::backend::prompt::TerminalPrompt;
use yambus::backend::store::FileTokenStore;
use yambus::backend::twitch::{
    normalize_channel, AppTokenManager, ChatClient, HelixFeed, IrcProtocol, OAuthApi,
    PubSubClient, PubSubProtocol, Result, TokenProvider, TwitchAuth, TwitchError,
    UserTokenManager, UserTokenProvider,
};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<()> {
    let twitch = &config.twitch;
    info!("Starting yambus for {}", twitch.username);

    let publisher = Arc::new(Publisher::new(&config.bus.address));
    publisher.connect().await?;

    let auth = Arc::new(TwitchAuth::new(twitch.credentials()));
    let app_tokens = Arc::new(AppTokenManager::new(auth.clone(), twitch.app_token_refresh())?);
    app_tokens.start().await?;
    let app_token = app_tokens.get_or_wait().await?;

    let channel = normalize_channel(twitch.channel());
    let login = channel.trim_start_matches('#');
    let channel_id = auth.user_id(login, &app_token).await?;
    info!("Broadcaster {} has id {}", login, channel_id);

    let users = Arc::new(UserTokenManager::new(
        auth.clone(),
        Arc::new(FileTokenStore::new(&config.storage.token_file)),
        Arc::new(TerminalPrompt::stdio()),
    ));
    let bot_tokens: Arc<dyn TokenProvider> =
        Arc::new(UserTokenProvider::new(users.clone(), twitch.username.as_str()));
    // Authorize before any handshake needs the token
    bot_tokens.access_token().await?;

    let chat = ChatClient::new(
        &twitch.irc_url,
        IrcProtocol::new(&twitch.username, login, bot_tokens.clone()),
        publisher.clone(),
        twitch.handshake_timeout(),
    )?;
    chat.start().await?;

    let pubsub = if twitch.pubsub_topics.is_empty() {
        None
    } else {
        // Channel topics need the broadcaster's own authorization
        let broadcaster_tokens: Arc<dyn TokenProvider> =
            Arc::new(UserTokenProvider::new(users.clone(), login));
        let client = PubSubClient::new(
            &twitch.pubsub_url,
            PubSubProtocol::new(twitch.pubsub_topics_for(&channel_id), broadcaster_tokens),
            publisher.clone(),
            twitch.handshake_timeout(),
        )?;
        client.start().await?;
        Some(client)
    };

    let mut feeds = Vec::with_capacity(config.feeds.len());
    for feed in &config.feeds {
        let feed = HelixFeed::new(
            feed,
            &twitch.client_id,
            &channel_id,
            app_tokens.clone(),
            publisher.clone(),
        )
        .await?;
        feed.start().await?;
        feeds.push(feed);
    }

    info!("All connections ready, press Ctrl+C to stop");
    let signal = tokio::signal::ctrl_c().await;
    if let Err(e) = &signal {
        warn!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    for feed in &feeds {
        feed.stop().await;
    }
    if let Some(pubsub) = &pubsub {
        pubsub.stop().await;
    }
    chat.stop().await;
    app_tokens.stop().await;
    publisher.disconnect().await;

    signal.map_err(|e| TwitchError::ChannelError(format!("shutdown signal: {}", e)))
}
