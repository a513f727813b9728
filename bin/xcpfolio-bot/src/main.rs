//! CLI entry point: config loading, client/controller wiring, and the
//! scheduler loop (spec.md §2, §5, §6.6; SPEC_FULL.md §4).

mod ops;

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use xcpfolio_chain::HttpChainClient;
use xcpfolio_fulfillment::FulfillmentController;
use xcpfolio_history::{OrderHistorySink, StateStoreHistorySink};
use xcpfolio_ledger::HttpLedgerClient;
use xcpfolio_maintenance::MaintenanceController;
use xcpfolio_notify::{Notifier, NullNotifier, WebhookNotifier};
use xcpfolio_signer::{Signer, WifSigner};
use xcpfolio_state::{cache::CachingStateStore, RedisStateStore};
use xcpfolio_types::{Config, PriceTable};

/// An automated fulfillment agent for XCPFOLIO.* DEX orders: delivers the
/// underlying asset on a fill and re-lists expired listings.
#[derive(Parser)]
#[clap(name = "xcpfolio-bot", about = "XCPFOLIO fulfillment and maintenance agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the long-running scheduler loop (default).
    Run,
    /// Zero `lastBlock`/`lastOrderHash` in the fulfillment envelope.
    ResetLastBlock,
    /// Empty the fulfillment envelope's `processedOrders` set.
    ClearProcessed,
    /// Replay durable active-order state into the order-history side channel.
    BackfillHistory,
    /// Collapse duplicate entries in the order-history index.
    FixDuplicates,
}

type Store = CachingStateStore<RedisStateStore>;

#[tokio::main]
async fn main() -> ExitCode {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter).finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("tracing subscriber already installed");
    }

    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(error) => {
            error!(%error, "fatal startup error loading configuration");
            return ExitCode::FAILURE;
        }
    };

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ResetLastBlock => one_shot(config, ops::reset_last_block).await,
        Command::ClearProcessed => one_shot(config, ops::clear_processed).await,
        Command::BackfillHistory => one_shot(config, ops::backfill_history).await,
        Command::FixDuplicates => one_shot(config, ops::fix_duplicates).await,
    }
}

async fn connect_store(config: &Config) -> eyre::Result<Arc<Store>> {
    let redis = RedisStateStore::connect(&config.state_store_url).await?;
    Ok(Arc::new(CachingStateStore::new(redis)))
}

async fn one_shot<F, Fut>(config: Config, op: F) -> ExitCode
where
    F: FnOnce(Arc<Store>) -> Fut,
    Fut: std::future::Future<Output = eyre::Result<()>>,
{
    let store = match connect_store(&config).await {
        Ok(store) => store,
        Err(error) => {
            error!(%error, "fatal startup error connecting to the state store");
            return ExitCode::FAILURE;
        }
    };
    match op(store).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!(%error, "operational command failed");
            ExitCode::FAILURE
        }
    }
}

/// Loads the static asset -> XCP-price table consumed by
/// `MaintenanceController::set_prices`. Price table *loading* is an external
/// collaborator per spec §1/§9 — no file or service client lives in this
/// workspace — but the binary needs some injection point to be runnable, so
/// it accepts a flat JSON object via `PRICE_TABLE_JSON` (documented as an
/// Open Question resolution in DESIGN.md). An empty table is valid: the
/// maintenance controller simply has nothing priced to re-list yet.
fn load_price_table() -> PriceTable {
    match std::env::var("PRICE_TABLE_JSON") {
        Ok(raw) => match serde_json::from_str::<std::collections::HashMap<String, u64>>(&raw) {
            Ok(map) => map.into_iter().map(|(k, v)| (xcpfolio_types::AssetName(k), v)).collect(),
            Err(error) => {
                warn!(%error, "PRICE_TABLE_JSON set but not valid JSON, starting with an empty price table");
                PriceTable::new()
            }
        },
        Err(_) => PriceTable::new(),
    }
}

async fn run(config: Config) -> ExitCode {
    info!(network = ?config.network, dry_run = config.dry_run, "starting xcpfolio-bot");

    let http = match reqwest::Client::builder().timeout(Duration::from_secs(30)).build() {
        Ok(http) => http,
        Err(error) => {
            error!(%error, "fatal startup error building the http client");
            return ExitCode::FAILURE;
        }
    };

    let store = match connect_store(&config).await {
        Ok(store) => store,
        Err(error) => {
            error!(%error, "fatal startup error connecting to the state store");
            return ExitCode::FAILURE;
        }
    };

    let signer: Arc<dyn Signer> = match WifSigner::from_wif(&config.private_key_wif) {
        Ok(signer) => Arc::new(signer),
        Err(error) => {
            error!(%error, "fatal startup error parsing XCPFOLIO_PRIVATE_KEY");
            return ExitCode::FAILURE;
        }
    };

    let ledger: Arc<dyn xcpfolio_ledger::LedgerClient> =
        Arc::new(HttpLedgerClient::new(http.clone(), config.counterparty_api.clone()));
    let chain: Arc<dyn xcpfolio_chain::ChainClient> = Arc::new(HttpChainClient::new(
        http.clone(),
        config.mempool_api.clone(),
        vec![config.mempool_api.clone(), config.blockstream_api.clone()],
    ));
    let notifier: Arc<dyn Notifier> = match &config.notifier_webhook {
        Some(url) => Arc::new(WebhookNotifier::new(http.clone(), url.clone())),
        None => Arc::new(NullNotifier),
    };
    let history: Arc<dyn OrderHistorySink> = Arc::new(StateStoreHistorySink::new(store.clone()));

    let fulfillment = Arc::new(FulfillmentController::new(
        config.clone(),
        ledger.clone(),
        chain.clone(),
        signer.clone(),
        notifier.clone(),
        history.clone(),
        store.clone(),
    ));
    let maintenance = Arc::new(MaintenanceController::new(
        config.clone(),
        ledger.clone(),
        chain.clone(),
        signer.clone(),
        notifier.clone(),
        history.clone(),
        store.clone(),
    ));
    maintenance.set_prices(load_price_table());

    let keep_running = Arc::new(AtomicBool::new(true));

    let fulfillment_task = {
        let controller = fulfillment.clone();
        let keep_running = keep_running.clone();
        let interval_duration = config.check_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_duration);
            while keep_running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !keep_running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(error) = controller.process().await {
                    error!(%error, "fulfillment run returned a fatal error, will retry next tick");
                }
            }
        })
    };

    let maintenance_task = {
        let controller = maintenance.clone();
        let keep_running = keep_running.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60 * 60));
            while keep_running.load(Ordering::SeqCst) {
                interval.tick().await;
                if !keep_running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(error) = controller.run().await {
                    error!(%error, "maintenance run returned a fatal error, will retry next tick");
                }
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, requesting a graceful stop");
    keep_running.store(false, Ordering::SeqCst);
    fulfillment.request_stop();
    maintenance.request_stop();

    let drain = async {
        loop {
            if !fulfillment.get_state().is_running && !maintenance.get_status().is_running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        warn!("graceful shutdown timed out after 30s, exiting anyway");
    }

    fulfillment_task.abort();
    maintenance_task.abort();
    info!("xcpfolio-bot stopped");
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
