//! Watch a channel's comments and hide the ones containing banned phrases.
use std::future::ready;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use guardian_common::checkpoint::FileCheckpointStore;
use guardian_common::health::HealthRegistry;
use guardian_common::matcher::{load_phrases, AhoCorasickMatcher};
use guardian_common::metrics::{serve, setup_metrics_routes};
use guardian_worker::config::Config;
use guardian_worker::credentials::{CachedTokenProvider, StaticToken, TokenProvider};
use guardian_worker::pipeline::Pipeline;
use guardian_worker::source::youtube::YouTubeClient;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

fn setup_tracing(json: bool) {
    let log_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_filter(EnvFilter::from_default_env())
            .boxed()
    };
    tracing_subscriber::registry().with(log_layer).init();
}

pub async fn index() -> &'static str {
    "comment guardian"
}

fn app(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())))
}

async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("received SIGINT");
        }
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env().context("invalid configuration")?;
    setup_tracing(config.log_json);
    info!("starting up");

    let phrases = load_phrases(&config.banned_phrases_file)
        .with_context(|| format!("failed to load {}", config.banned_phrases_file))?;
    let matcher = AhoCorasickMatcher::build(&phrases).context("failed to build phrase matcher")?;
    if matcher.is_empty() {
        warn!(
            path = %config.banned_phrases_file,
            "banned phrase file is empty, no comment will ever match"
        );
    }
    info!(phrases = matcher.len(), "phrase matcher ready");

    let client = reqwest::Client::builder()
        .user_agent("comment-guardian")
        .timeout(config.request_timeout.0)
        .build()
        .context("failed to build HTTP client")?;

    let tokens: Arc<dyn TokenProvider> = match &config.access_token {
        Some(token) => Arc::new(StaticToken(token.as_str().to_owned())),
        None => Arc::new(
            CachedTokenProvider::load(
                client.clone(),
                &config.client_secrets_file,
                &config.token_file,
            )
            .await
            .context("failed to load credentials")?,
        ),
    };

    let youtube = Arc::new(YouTubeClient::new(
        client,
        &config.api_base_url,
        config.channel_id.as_str(),
        tokens,
    ));
    let store = Arc::new(FileCheckpointStore::new(&config.checkpoint_path));

    let liveness = HealthRegistry::new("liveness");
    let pipeline = Pipeline::new(
        &config.pipeline_settings(),
        youtube.clone(),
        youtube,
        Arc::new(matcher),
        store,
        &liveness,
    )
    .await;

    let router = setup_metrics_routes(app(liveness)).context("failed to install metrics recorder")?;
    let bind = config.bind();
    tokio::spawn(async move {
        if let Err(e) = serve(router, &bind).await {
            error!("http server failed: {}", e);
        }
    });

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match wait_for_shutdown_signal().await {
            Ok(()) => shutdown.cancel(),
            Err(e) => error!("failed to listen for shutdown signals: {}", e),
        }
    });

    pipeline.run(cancel).await.context("pipeline task failed")?;

    info!("exiting");
    Ok(())
}
