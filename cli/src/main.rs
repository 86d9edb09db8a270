//! chainledger CLI — inspect and recover node state.
//!
//! # Commands
//! ```text
//! chainledger status         --data <dir> --chain <id> [--head <n>]
//! chainledger set-checkpoint --data <dir> --chain <id> --block <n> [--secret <s>]
//! chainledger contracts      --data <dir> --chain <id>
//! chainledger register       --data <dir> --chain <id> --address <addr> --block <n>
//! chainledger positions      --data <dir> --account <acct>
//! chainledger estimate       --dest <id> [--payload-bytes <n>]
//! chainledger info
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use chainledger_bridge::{BridgeRouter, CcipAdapter, HyperlaneAdapter, LayerZeroAdapter, MemoryTransport};
use chainledger_core::{AdminService, ContractRegistry, ForceCheckpointRequest};
use chainledger_ledger::LedgerApplier;
use chainledger_storage::FileStorage;

mod config;

use config::{init_tracing, NodeConfig, ADMIN_SECRET_ENV};

#[derive(Parser)]
#[command(
    name = "chainledger",
    about = "ChainLedger operator CLI — checkpoints, contracts, ledger positions",
    long_about = "
ChainLedger CLI: inspect and recover the state of a ChainLedger node.
State is read from the node's data directory (JSON snapshots).

ENVIRONMENT VARIABLES:
  CHAINLEDGER_ADMIN_SECRET   Shared secret for set-checkpoint (overrides config)
  RUST_LOG                   Log filter directives (overrides config)
",
    version
)]
struct Cli {
    /// Node config file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show checkpoint, head and lag for a chain
    Status {
        #[arg(long)]
        data: PathBuf,
        /// Chain id (default: scanner.chain_id from config)
        #[arg(long)]
        chain: Option<u64>,
        /// Current head as reported by the operator's node
        #[arg(long)]
        head: Option<u64>,
    },

    /// Force the checkpoint of a chain (backfill or skip)
    #[command(name = "set-checkpoint")]
    SetCheckpoint {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        chain: Option<u64>,
        #[arg(long)]
        block: u64,
        /// Admin shared secret
        #[arg(long)]
        secret: Option<String>,
        #[arg(long)]
        head: Option<u64>,
    },

    /// List registered contract instances
    Contracts {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        chain: Option<u64>,
    },

    /// Register a contract instance manually
    Register {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        chain: Option<u64>,
        #[arg(long)]
        address: String,
        /// Block at which the instance was deployed
        #[arg(long, default_value_t = 0)]
        block: u64,
    },

    /// Show per-chain ledger entries and the global credit line of an account
    Positions {
        #[arg(long)]
        data: PathBuf,
        #[arg(long)]
        account: String,
    },

    /// Estimate the bridge fee to a destination chain
    Estimate {
        #[arg(long)]
        dest: u64,
        #[arg(long, default_value_t = 256)]
        payload_bytes: usize,
        /// Preferred protocol for the destination
        #[arg(long)]
        protocol: Option<String>,
    },

    /// Show configuration defaults and supported bridges
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.log);

    match cli.command {
        Commands::Status { data, chain, head } => {
            let chain = chain.unwrap_or(config.scanner.chain_id);
            let admin = admin_service(&data, &config).await?;
            let status = admin.status(chain, head).await?;
            print_json(&status)
        }

        Commands::SetCheckpoint {
            data,
            chain,
            block,
            secret,
            head,
        } => {
            let chain = chain.unwrap_or(config.scanner.chain_id);
            let admin = admin_service(&data, &config).await?;
            let resp = admin
                .force_checkpoint(ForceCheckpointRequest {
                    chain_id: chain,
                    block,
                    secret,
                    observed_head: head,
                })
                .await
                .with_context(|| {
                    format!("set-checkpoint rejected (pass --secret or set {ADMIN_SECRET_ENV})")
                })?;
            info!(chain_id = chain, before = ?resp.before, after = resp.after, "Checkpoint force-set");
            print_json(&resp)
        }

        Commands::Contracts { data, chain } => {
            let chain = chain.unwrap_or(config.scanner.chain_id);
            let registry = ContractRegistry::load(open_storage(&data).await?).await?;
            let instances = registry.instances(chain).await;
            if instances.is_empty() {
                println!("No contracts registered on chain {chain}");
            }
            for i in instances {
                println!("{}  (discovered at block {})", i.address, i.discovered_at_block);
            }
            Ok(())
        }

        Commands::Register {
            data,
            chain,
            address,
            block,
        } => {
            let chain = chain.unwrap_or(config.scanner.chain_id);
            let registry = ContractRegistry::load(open_storage(&data).await?).await?;
            let reg = registry.register(&address, chain, block).await?;
            if reg.newly_added {
                println!("Registered {address} on chain {chain}");
            } else {
                println!("{address} already registered on chain {chain}");
            }
            Ok(())
        }

        Commands::Positions { data, account } => {
            let store = open_storage(&data).await?;
            let applier = LedgerApplier::new(config.applier.clone(), store.clone(), store);
            let positions = applier.positions(&account).await?;
            for p in &positions {
                println!(
                    "chain {:>8}  collateral {:>24}  borrowed {:>24}",
                    p.chain_id, p.collateral, p.borrowed
                );
            }
            println!("credit line: {}", applier.credit_line(&account).await?);
            Ok(())
        }

        Commands::Estimate {
            dest,
            payload_bytes,
            protocol,
        } => {
            let router = default_router(config.scanner.chain_id)?;
            if let Some(p) = protocol {
                router.set_preferred(dest, &p)?;
            }
            let (cost, protocol) = router
                .estimate_cost(dest, &vec![0u8; payload_bytes])
                .with_context(|| format!("no bridge supports chain {dest}"))?;
            println!("{protocol}: {cost} wei for {payload_bytes} bytes to chain {dest}");
            Ok(())
        }

        Commands::Info => cmd_info(&config),
    }
}

async fn open_storage(data: &Path) -> Result<Arc<FileStorage>> {
    let storage = FileStorage::open(data)
        .await
        .with_context(|| format!("cannot open data directory {}", data.display()))?;
    Ok(Arc::new(storage))
}

async fn admin_service(data: &Path, config: &NodeConfig) -> Result<AdminService> {
    let storage = open_storage(data).await?;
    let registry = Arc::new(ContractRegistry::load(storage.clone()).await?);
    Ok(AdminService::new(storage, config.admin.shared_secret.clone()).with_registry(registry))
}

/// Router over in-process transports: enough for fee estimation.
fn default_router(source_chain: u64) -> Result<BridgeRouter> {
    let transport = Arc::new(MemoryTransport::new());
    let router = BridgeRouter::new(source_chain);
    router.register_adapter(Arc::new(LayerZeroAdapter::new(transport.clone())))?;
    match HyperlaneAdapter::new(transport.clone(), source_chain, "0x0000000000000000000000000000000000000000") {
        Ok(adapter) => router.register_adapter(Arc::new(adapter))?,
        Err(e) => warn!(source_chain, error = %e, "Hyperlane unavailable from this origin"),
    }
    router.register_adapter(Arc::new(CcipAdapter::new(transport)))?;
    Ok(router)
}

fn cmd_info(config: &NodeConfig) -> Result<()> {
    let s = &config.scanner;
    println!("ChainLedger v{}", env!("CARGO_PKG_VERSION"));
    println!("  Chain: {}", s.chain_id);
    println!("  Batch size: {} blocks/cycle", s.batch_size);
    println!("  Poll interval: {}ms", s.poll_interval_ms);
    println!("  Query concurrency: {}", s.concurrency);
    println!("  Query timeout: {}ms, cycle deadline: {}ms", s.query_timeout_ms, s.cycle_deadline_ms);
    println!("  Reorg overlap: {} blocks", s.reorg_overlap);
    println!(
        "  Retry: {} attempts, backoff {}ms..{}ms",
        config.retry.max_attempts, config.retry.base_delay_ms, config.retry.max_delay_ms
    );
    println!(
        "  Legacy INCREMENT updates: {}",
        if config.applier.accept_legacy_increment { "accepted" } else { "rejected" }
    );
    println!("  Bridges: {}", default_router(s.chain_id)?.protocols()?.join(", "));
    println!("  Storage backends: memory, file (JSON snapshots), SQLite (feature: sqlite)");
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
