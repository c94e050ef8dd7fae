//! Order Engine Binary
//!
//! Wires the lifecycle, dependency, risk and routing components from a YAML
//! config and runs until SIGINT or SIGTERM.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin order-engine
//! ```
//!
//! # Environment Variables
//!
//! - `ORDER_ENGINE_CONFIG`: Config file path (default: config.yaml)
//! - `RUST_LOG`: Log filter (default: `order_engine=<logging.level>`)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use order_engine::broker::{
    BrokerConnector, BrokerKind, BrokerRouter, Credentials, RegistryConnectorFactory,
    SimulatedConnector,
};
use order_engine::config::{Config, load_config};
use order_engine::observability::{MetricsConfig, init_metrics};
use order_engine::resilience::ErrorClassifier;
use order_engine::telemetry::init_telemetry;
use order_engine::{DependencyManager, ExecutionEngine, LifecycleManager, RiskManager};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Time allowed for background workers to stop.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv_from_ancestors();

    let config_path = std::env::var("ORDER_ENGINE_CONFIG").ok();
    let config = load_config(config_path.as_deref()).context("failed to load configuration")?;

    let _telemetry = init_telemetry(&config.observability.logging);
    log_config(&config);

    if config.engine.metrics_enabled {
        let addr: SocketAddr = config
            .engine
            .metrics_addr
            .parse()
            .context("invalid metrics address")?;
        init_metrics(&MetricsConfig::with_addr(addr))?;
    }

    let shutdown = CancellationToken::new();

    let classifier = Arc::new(ErrorClassifier::new(
        config.error_handling.to_retry_policy(),
    ));
    let breakers = Arc::new(config.circuit_breaker.to_registry());
    let risk = Arc::new(RiskManager::new(config.risk.to_settings()));
    let lifecycle = Arc::new(LifecycleManager::new(Arc::clone(&classifier)));

    let router = Arc::new(BrokerRouter::new(
        Arc::new(create_factory()),
        breakers,
        Arc::clone(&classifier),
        shutdown.clone(),
    ));
    start_brokers(&config, &router).await?;

    let (dependencies, dependency_worker) = DependencyManager::start(
        Arc::clone(&lifecycle),
        Arc::clone(&classifier),
        shutdown.clone(),
    );
    let (engine, engine_worker) = ExecutionEngine::start(
        Arc::clone(&lifecycle),
        dependencies,
        risk,
        Arc::clone(&router),
        classifier,
        shutdown.clone(),
    );
    let expiry_checker = lifecycle
        .start_expiry_checker(config.lifecycle.expiry_check_interval(), shutdown.clone());

    tracing::info!(
        brokers = config.brokers.len(),
        sessions = router.active_sessions(),
        "Order engine ready"
    );

    shutdown_signal().await?;

    shutdown.cancel();
    router.disconnect_all().await;
    await_workers(vec![
        ("dependency worker", dependency_worker),
        ("engine worker", engine_worker),
        ("expiry checker", expiry_checker),
    ])
    .await;

    tracing::info!(
        dead_letters = engine.dead_letters().len(),
        live_orders = lifecycle.active_lifecycles().len(),
        "Order engine stopped"
    );
    Ok(())
}

/// Connector constructors for every venue this build can reach.
fn create_factory() -> RegistryConnectorFactory {
    RegistryConnectorFactory::new().register(BrokerKind::Simulated, |config| {
        let connector: Arc<dyn BrokerConnector> =
            Arc::new(SimulatedConnector::new(config.client_id.clone()));
        Ok(connector)
    })
}

/// Register, connect and log in every configured broker client.
///
/// A client that fails to connect is logged and left to the circuit breaker.
async fn start_brokers(config: &Config, router: &BrokerRouter) -> anyhow::Result<()> {
    for broker in &config.brokers {
        router
            .register_broker(&broker.client_id, Some(broker.clone()))
            .with_context(|| format!("failed to register broker {}", broker.client_id))?;
    }

    let failed = router.connect_all().await;
    for (client_id, error) in &failed {
        tracing::warn!(client_id = %client_id, error = %error, "Broker unavailable at startup");
    }

    for broker in &config.brokers {
        let Some(user_id) = broker.user_id.as_deref() else {
            continue;
        };
        if failed.iter().any(|(id, _)| id == &broker.client_id) {
            continue;
        }
        let credentials = Credentials::new(user_id, broker.api_secret.clone());
        if let Err(failure) = router.login(&broker.client_id, &credentials).await {
            tracing::warn!(
                client_id = %broker.client_id,
                user_id,
                error = %failure.error,
                "Default login failed"
            );
        }
    }
    Ok(())
}

/// Log the loaded configuration.
fn log_config(config: &Config) {
    tracing::info!(
        environment = %config.engine.environment,
        brokers = config.brokers.len(),
        max_retries = config.error_handling.max_retries,
        metrics_enabled = config.engine.metrics_enabled,
        "Configuration loaded"
    );
}

/// Wait for each worker, giving up after [`SHUTDOWN_TIMEOUT`].
async fn await_workers(workers: Vec<(&'static str, JoinHandle<()>)>) {
    let all = async {
        for (name, handle) in workers {
            if let Err(e) = handle.await {
                tracing::warn!(worker = name, error = %e, "Worker ended abnormally");
            }
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, all).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "Workers did not stop in time"
        );
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, initiating shutdown");
            }
            _ = terminate.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("failed to listen for Ctrl+C")?;
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    Ok(())
}

/// Load .env from the current directory or the nearest ancestor that has one.
fn load_dotenv_from_ancestors() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}
