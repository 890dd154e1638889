use anyhow::Context;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use iam_todo::auth::SessionManager;
use iam_todo::config::{AppConfig, Environment, TrustBundle};
use iam_todo::database::{
    ensure_schema, ConnectionPool, Connector, CredentialProvider, HealthProbe, PgConnector, TodoRepository,
};
use iam_todo::iam::{AwsCredentialsProvider, RdsIamSigner};
use iam_todo::server::{self, AppState};
use iam_todo::shutdown::{self, Trigger};

const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env if present so local runs pick up RDS_* and AWS_* settings
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match run().await {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    info!(
        environment = ?config.environment,
        host = %config.endpoint.host,
        port = config.endpoint.port,
        user = %config.endpoint.user,
        database = %config.endpoint.database,
        region = %config.endpoint.region,
        "starting todo service"
    );
    if config.environment == Environment::Production && config.security.uses_default_secret() {
        warn!("SESSION_SECRET is not set; sessions are signed with the built-in default");
    }

    // Fatal before any network I/O: no bundle, no connections.
    let trust = TrustBundle::resolve(config.database.ca_bundle_path.as_deref())
        .context("cannot load CA bundle")?;
    info!(
        path = %trust.path().display(),
        certificates = trust.certificate_count(),
        "loaded RDS CA bundle"
    );

    let aws = AwsCredentialsProvider::from_env().context("no AWS credentials available")?;
    info!(source = aws.source_name(), "resolved AWS credential source");
    let signer = Arc::new(RdsIamSigner::new(&config.endpoint, aws));
    let credentials = CredentialProvider::new(signer);

    let pool = ConnectionPool::new(
        PgConnector::new(&config.endpoint, &trust),
        credentials,
        config.database.pool_config(),
    );
    let triggers = shutdown::spawn_trigger_watch(pool.take_faults());
    let maintenance = pool.spawn_maintenance();

    // Schema setup can hang on an unresponsive database; a signal still wins.
    tokio::select! {
        result = ensure_schema(&pool) => {
            if let Err(e) = result {
                close_pool(&pool).await;
                maintenance.abort();
                return Err(e).context("database initialization failed");
            }
        }
        trigger = shutdown::triggered(triggers.clone()) => {
            info!("shutdown requested during startup, closing database pool");
            close_pool(&pool).await;
            maintenance.abort();
            return outcome(trigger);
        }
    }

    let sessions = SessionManager::new(&config.security).context("invalid session settings")?;
    let state = AppState {
        todos: Arc::new(TodoRepository::new(pool.clone())),
        health: Arc::new(HealthProbe::new(pool.clone(), HEALTH_CHECK_TIMEOUT)),
        sessions: Arc::new(sessions),
        static_dir: config.server.static_dir.clone(),
    };

    let bind_addr = format!("0.0.0.0:{}", config.server.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    info!(address = %bind_addr, "todo service listening");

    let stop = {
        let triggers = triggers.clone();
        async move {
            shutdown::triggered(triggers).await;
        }
    };

    let served = axum::serve(listener, server::app(state))
        .with_graceful_shutdown(stop)
        .await
        .context("HTTP server failed");

    info!("HTTP server stopped, closing database pool");
    let closed = pool.shutdown().await;
    maintenance.abort();

    served?;
    closed.context("database pool did not close cleanly")?;

    let trigger = triggers.borrow().clone();
    match trigger {
        Some(trigger) => outcome(trigger),
        None => Ok(()),
    }
}

/// A signal is a clean exit; a pool fault fails the process.
fn outcome(trigger: Trigger) -> anyhow::Result<()> {
    match trigger {
        Trigger::Signal(_) => Ok(()),
        Trigger::Fault(fault) => Err(anyhow::anyhow!(fault).context("stopped after database pool fault")),
    }
}

async fn close_pool<C: Connector>(pool: &ConnectionPool<C>) {
    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "failed to close database pool");
    }
}
