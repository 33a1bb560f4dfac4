use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use swap_portal::admission::IntentAdmit;
use swap_portal::chain::{CosClient, EvmClient};
use swap_portal::config::{Config, MATCH_QUEUE_DEPTH};
use swap_portal::dispatch::{CosDispatcher, Dispatcher, EvmDispatcher};
use swap_portal::listeners::{CosListener, DeferredMatcher, EvmListener};
use swap_portal::store::{PgStore, Store};
use swap_portal::{api, logging, metrics};

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    let log_path = PathBuf::from(logging::LOG_FILE);
    logging::init(Path::new(&log_path))?;

    tracing::info!("Starting swap portal");

    let config = Config::load()?;
    tracing::info!(
        app = %config.app.name,
        env = %config.app.env,
        evm_chain_id = config.evm.chain_id,
        cos_chain_id = %config.cos.chain_id,
        "Configuration loaded"
    );

    let store: Arc<dyn Store> = Arc::new(PgStore::connect(&config.store.uri).await?);
    tracing::info!("Store connected, migrations applied");

    let evm_client = Arc::new(EvmClient::new(&config.evm)?);
    let cos_client = Arc::new(CosClient::new(&config.cos)?);

    // Each listener only sees the opposite chain through this capability
    let evm_dispatcher: Arc<dyn Dispatcher> =
        Arc::new(EvmDispatcher::new(evm_client.clone(), store.clone()));
    let cos_dispatcher: Arc<dyn Dispatcher> = Arc::new(CosDispatcher::new(
        cos_client.clone(),
        store.clone(),
        config.cos.deduct_fee,
    ));

    let (matcher_tx, matcher_rx) = mpsc::channel(MATCH_QUEUE_DEPTH);
    let admit = Arc::new(IntentAdmit::new(
        store.clone(),
        matcher_tx.clone(),
        &config.cos.bech32_prefix,
    )?);

    let (evm_log_tx, evm_log_rx) = mpsc::channel(256);
    let (cos_event_tx, cos_event_rx) = mpsc::channel(256);

    let mut tasks = tokio::task::JoinSet::new();
    tasks.spawn(evm_client.clone().watch_deposits(evm_log_tx));
    tasks.spawn(EvmListener::new(store.clone(), &config.evm.corporate_addr).run(evm_log_rx));
    tasks.spawn(
        DeferredMatcher::new(
            store.clone(),
            cos_dispatcher,
            &config.evm.corporate_addr,
            matcher_rx,
            matcher_tx,
        )
        .run(),
    );
    tasks.spawn(cos_client.clone().watch_deposits(cos_event_tx));
    tasks
        .spawn(CosListener::new(store.clone(), evm_dispatcher, &config.cos.denom).run(cos_event_rx));

    let api_state = api::AppState {
        admit,
        store,
        app_name: config.app.name.clone(),
        log_path,
    };
    tasks.spawn(api::serve(api_state, config.app.clone()));

    metrics::UP.set(1.0);
    tracing::info!("Swap portal started");

    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("Shutdown signal received, stopping tasks");
            tasks.abort_all();
        }
        maybe_done = tasks.join_next() => {
            match maybe_done {
                Some(Ok(Ok(()))) => {
                    tracing::error!("A portal task exited unexpectedly without error");
                    return Err(eyre::eyre!("task exited unexpectedly"));
                }
                Some(Ok(Err(e))) => {
                    tracing::error!("A portal task stopped with error: {:?}", e);
                    return Err(e);
                }
                Some(Err(e)) => {
                    // A panic never escapes a task silently; it surfaces here
                    tracing::error!("A portal task panicked: {:?}", e);
                    return Err(eyre::eyre!("task panicked: {}", e));
                }
                None => {
                    tracing::error!("All portal tasks exited unexpectedly");
                    return Err(eyre::eyre!("all tasks exited unexpectedly"));
                }
            }
        }
    }

    tracing::info!("Swap portal stopped");
    Ok(())
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
