use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use claude_bridge::config::{self, Settings};
use claude_bridge::docker::{DockerManager, Engine};
use claude_bridge::error::AppError;
use claude_bridge::executor::Executor;
use claude_bridge::frontend::stdin::StdinFrontend;
use claude_bridge::frontend::telegram::TelegramFrontend;
use claude_bridge::frontend::{BotFrontend, InboundMessage};
use claude_bridge::router::{Contact, Router};
use claude_bridge::store::Store;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);
const IMAGE_BUILD_TIMEOUT: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("fatal: {e}");
        std::process::exit(exit_code(&e));
    }
}

fn exit_code(e: &AppError) -> i32 {
    match e {
        AppError::ConfigMissing(_) | AppError::ConfigInvalid(_) => 2,
        AppError::EngineUnavailable(_) => 3,
        AppError::ImageBuildFailed(_) => 4,
        _ => 1,
    }
}

async fn run() -> Result<(), AppError> {
    let settings = config::load()?;
    init_logging(settings);

    tracing::info!("starting claude-bridge");

    let engine = Engine::connect()?;
    engine.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "container engine unavailable");
        e
    })?;

    let docker = DockerManager::new(engine);

    if !docker.image_exists(settings).await? {
        tracing::info!(image = %settings.docker.image, "sandbox image missing, building");
        tokio::time::timeout(IMAGE_BUILD_TIMEOUT, docker.build_image(settings, "sandbox-image"))
            .await
            .map_err(|_| AppError::ImageBuildFailed("build exceeded time budget".into()))??;
    }

    docker.init_networks(settings).await?;

    let store = Store::open(&config::expand_home(&settings.database_path)).await?;

    spawn_cleanup_task(store.clone(), settings);

    let executor = Executor::new(store.clone(), docker.clone());
    let router = Arc::new(Router::new(settings, store, docker, executor));

    let frontends = build_frontends(settings);
    let (tx, mut rx) = mpsc::channel::<(Arc<dyn BotFrontend>, InboundMessage)>(256);

    for frontend in &frontends {
        let frontend = frontend.clone();
        let tx = tx.clone();
        let inbound = frontend.start().await?;
        tokio::spawn(pump_frontend(frontend, inbound, tx));
    }
    drop(tx);

    tracing::info!(frontends = frontends.len(), "ready");

    let mut inflight: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            Some((frontend, message)) = rx.recv() => {
                let router = router.clone();
                inflight.spawn(async move {
                    handle_inbound(router, frontend, message).await;
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received");
                break;
            }
        }
    }

    // Stop accepting new work immediately, but let messages already
    // dispatched to Claude finish on their own executor timeout rather than
    // abandoning them outright.
    let drain_budget = Duration::from_secs(settings.claude.timeout) + Duration::from_secs(10);
    tracing::info!(inflight = inflight.len(), budget_secs = drain_budget.as_secs(), "draining in-flight messages");
    match tokio::time::timeout(drain_budget, async { while inflight.join_next().await.is_some() {} }).await {
        Ok(()) => {}
        Err(_) => {
            tracing::warn!("drain budget exceeded, abandoning remaining in-flight tasks");
            inflight.shutdown().await;
        }
    }

    for frontend in &frontends {
        let _ = frontend.stop().await;
    }

    tracing::info!("shutdown complete");
    Ok(())
}

async fn pump_frontend(
    frontend: Arc<dyn BotFrontend>,
    mut inbound: mpsc::Receiver<InboundMessage>,
    tx: mpsc::Sender<(Arc<dyn BotFrontend>, InboundMessage)>,
) {
    while let Some(message) = inbound.recv().await {
        if tx.send((frontend.clone(), message)).await.is_err() {
            break;
        }
    }
}

async fn handle_inbound(router: Arc<Router>, frontend: Arc<dyn BotFrontend>, message: InboundMessage) {
    let settings = config::settings();
    let contact = Contact {
        wxid: message.wxid.clone(),
        nickname: message.nickname,
        remark_name: message.remark_name,
    };

    match router.handle(settings, &contact, &message.text).await {
        Ok(chunks) => {
            for chunk in chunks {
                if let Err(e) = frontend.send(&contact.wxid, &chunk).await {
                    tracing::warn!(wxid = %contact.wxid, error = %e, "failed to send reply");
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        Err(e) => {
            tracing::error!(wxid = %contact.wxid, error = %e, "router failed");
        }
    }
}

fn build_frontends(settings: &Settings) -> Vec<Arc<dyn BotFrontend>> {
    let mut frontends: Vec<Arc<dyn BotFrontend>> = Vec::new();
    if let Some(token) = &settings.frontend.telegram_token {
        frontends.push(Arc::new(TelegramFrontend::new(token.clone())));
    }
    if settings.frontend.use_stdin {
        frontends.push(Arc::new(StdinFrontend::new()));
    }
    frontends
}

fn spawn_cleanup_task(store: Store, settings: &'static Settings) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            interval.tick().await;
            match store.session_clean_expired(settings.session.expire_minutes).await {
                Ok(n) if n > 0 => tracing::info!(count = n, "swept expired sessions"),
                Err(e) => tracing::warn!(error = %e, "session cleanup failed"),
                _ => {}
            }
            match store.rate_cleanup().await {
                Ok(n) if n > 0 => tracing::info!(count = n, "swept stale rate counters"),
                Err(e) => tracing::warn!(error = %e, "rate counter cleanup failed"),
                _ => {}
            }
        }
    });
}

fn init_logging(settings: &Settings) {
    let filter = EnvFilter::try_new(&settings.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(path) = &settings.logging.file {
        let file_appender = tracing_appender::rolling::never(".", path);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        std::mem::forget(guard);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(non_blocking)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
