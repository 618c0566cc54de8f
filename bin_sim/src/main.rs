// Runs one of the two consensus simulations. The binary picks a protocol
// from its first argument, loads the matching config (JSON, every field
// optional), wires the shared state, spawns one worker thread per node and
// one for the dashboard, and then turns the main thread into the
// transaction generator. The process runs until killed or until `q` in
// the dashboard.

mod app;

use std::fs;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::info;
use tracing_subscriber::EnvFilter;

use lib_bookkeeper::bookkeeper::{Bookkeeper, DbftConfig};
use lib_miner::miner::{Miner, PowConfig};
use lib_network::bus::MessageBus;
use lib_network::shared::{BlockStore, ConsensusSlots};
use lib_tx_pool::pool::TxPool;
use lib_tx_pool::telemetry::CsvSink;

/// The dashboard owns the terminal, so the log goes to a file. Filtered by
/// RUST_LOG, `info` by default.
const LOG_FILE: &str = "simulation.log";
/// Confirmation latency rows, `creation_ms,confirmation_ms`.
const CSV_FILE: &str = "example.csv";

fn main() {
    let mode = std::env::args().nth(1).unwrap_or_default();
    let config_path = std::env::args().nth(2);
    init_tracing();

    match mode.as_str() {
        "pow" => run_pow(load_config(config_path)),
        "dbft" => run_dbft(load_config(config_path)),
        _ => {
            eprintln!("usage: bin_sim <pow|dbft> [config.json]");
            std::process::exit(2);
        }
    }
}

fn init_tracing() {
    let Ok(file) = fs::File::create(LOG_FILE) else {
        return;
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .init();
}

/// Read a config from a JSON file, or fall back to the defaults when no
/// path is given. Missing fields take their default values too.
fn load_config<T: DeserializeOwned + Default>(path: Option<String>) -> T {
    match path {
        Some(path) => {
            let contents = fs::read_to_string(&path)
                .unwrap_or_else(|err| panic!("cannot read {}: {}", path, err));
            serde_json::from_str(&contents)
                .unwrap_or_else(|err| panic!("cannot parse {}: {}", path, err))
        }
        None => T::default(),
    }
}

fn spawn_worker<F>(name: String, work: F)
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name)
        .spawn(work)
        .expect("failed to spawn worker thread");
}

fn run_pow(config: PowConfig) -> ! {
    info!(?config, "starting proof-of-work simulation");
    let pool = Arc::new(TxPool::new(
        config.nodes as u32,
        config.transactions_to_show,
        Duration::from_secs_f64(config.transaction_frequency),
        CsvSink::open(CSV_FILE),
    ));
    let bus = Arc::new(MessageBus::new(config.nodes));
    let store = Arc::new(BlockStore::new());

    let mut statuses = Vec::with_capacity(config.nodes);
    for id in 0..config.nodes {
        let miner = Miner::new(
            id,
            config.clone(),
            Arc::clone(&pool),
            Arc::clone(&bus),
            Arc::clone(&store),
        );
        statuses.push(miner.status());
        spawn_worker(format!("miner-{}", id), move || {
            miner.run();
        });
    }

    let dashboard = app::Dashboard::pow(config, statuses, Arc::clone(&bus), Arc::clone(&pool));
    spawn_worker("dashboard".to_string(), move || dashboard.run());

    pool.run_generator()
}

fn run_dbft(config: DbftConfig) -> ! {
    info!(?config, "starting dbft simulation");
    let pool = Arc::new(TxPool::new(
        1,
        config.transactions_to_show,
        Duration::from_secs_f64(config.transaction_frequency),
        CsvSink::open(CSV_FILE),
    ));
    let bus = Arc::new(MessageBus::new(config.nodes));
    let slots = Arc::new(ConsensusSlots::new());

    let mut statuses = Vec::with_capacity(config.nodes);
    for id in 0..config.nodes {
        // the first ids sit out the protocol, the last ids actively lie
        let responsive = id >= config.unresponsive_nodes;
        let honest = id < config.nodes.saturating_sub(config.malicious_nodes);
        let bookkeeper = Bookkeeper::new(
            id,
            config.clone(),
            Arc::clone(&pool),
            Arc::clone(&bus),
            Arc::clone(&slots),
            responsive,
            honest,
        );
        statuses.push(bookkeeper.status());
        spawn_worker(format!("bookkeeper-{}", id), move || bookkeeper.run());
    }

    let dashboard = app::Dashboard::dbft(config, statuses, Arc::clone(&bus), Arc::clone(&pool));
    spawn_worker("dashboard".to_string(), move || dashboard.run());

    pool.run_generator()
}
