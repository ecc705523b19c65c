#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

use std::{fs, path::PathBuf, time::Instant};

use clap::Parser;
use dhat::Profiler;
use eyre::ensure;
use openvm_commitment::InMemoryState;
use openvm_commitment_tools::{Workload, commit_batch, commit_chunked, engine};
use revm_primitives::B256;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{
    filter::EnvFilter, fmt, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

/// Profiles commitment passes over a synthetic workload.
///
/// The workload is committed once in a single pass and once in chunks; both must produce the same
/// root. Heap usage is written to `dhat-heap.json`.
#[derive(Debug, Parser)]
struct ProfilerArgs {
    /// Number of accounts to generate.
    #[clap(long, env = "ACCOUNTS", default_value_t = 10_000)]
    accounts: u64,
    /// Storage slots written for every account.
    #[clap(long, env = "SLOTS", default_value_t = 4)]
    slots_per_account: u64,
    /// Number of passes for the chunked commit.
    #[clap(long, env = "CHUNKS", default_value_t = 16)]
    chunks: usize,
    #[clap(long, env = "SEED", default_value_t = 1)]
    seed: u64,
    /// Where to write the JSON report.
    #[clap(long, env = "REPORT")]
    report: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct Report {
    accounts: u64,
    slots_per_account: u64,
    keys: usize,
    chunks: usize,
    root: B256,
    branches: usize,
    snapshot_bytes: usize,
    batch_ms: u128,
    chunked_ms: u128,
}

fn main() -> eyre::Result<()> {
    // Initialize the environment variables.
    dotenv::dotenv().ok();

    // Initialize the logger.
    let _ = tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .try_init();

    let args = ProfilerArgs::parse();
    let workload = Workload::generate(args.accounts, args.slots_per_account, args.seed)?;
    info!(keys = workload.len(), accounts = args.accounts, "generated workload");

    let _profiler = Profiler::new_heap();

    let batch_state = InMemoryState::new(openvm_commitment_tools::ACCOUNT_KEY_LEN);
    let mut batch = engine(&batch_state)?;
    let start = Instant::now();
    let (root, branch_updates) = commit_batch(&mut batch, &batch_state, &workload)?;
    let batch_ms = start.elapsed().as_millis();
    info!(%root, branch_updates = branch_updates.len(), batch_ms, "batch commit");

    let chunked_state = InMemoryState::new(openvm_commitment_tools::ACCOUNT_KEY_LEN);
    let mut chunked = engine(&chunked_state)?;
    let start = Instant::now();
    let chunked_root = commit_chunked(&mut chunked, &chunked_state, &workload, args.chunks)?;
    let chunked_ms = start.elapsed().as_millis();
    info!(root = %chunked_root, chunks = args.chunks, chunked_ms, "chunked commit");

    ensure!(root == chunked_root, "batch root {root} differs from chunked root {chunked_root}");

    let report = Report {
        accounts: args.accounts,
        slots_per_account: args.slots_per_account,
        keys: workload.len(),
        chunks: args.chunks,
        root,
        branches: batch_state.branch_count(),
        snapshot_bytes: batch.encode_current_state(Vec::new())?.len(),
        batch_ms,
        chunked_ms,
    };
    let json = serde_json::to_string_pretty(&report)?;
    match &args.report {
        Some(path) => {
            fs::write(path, &json)?;
            info!(path = %path.display(), "wrote report");
        }
        None => println!("{json}"),
    }
    Ok(())
}
