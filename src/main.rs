//! Transfer Ledger - demo runner
//!
//! Builds the engine from `config/<env>.yaml`, funds a demo account and runs
//! a small batch of transfers through the state machine:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │  Config  │───▶│  Gates   │───▶│   Lock   │───▶│  Commit  │
//! │  (YAML)  │    │(validate)│    │ + Sign   │    │(chain+bal│
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```

use std::sync::Arc;

use anyhow::Context;
use futures::future::join_all;
use rust_decimal::Decimal;
use tracing::{info, warn};

use transfer_ledger::config::{AppConfig, StoreBackend};
use transfer_ledger::lock::{LockSweeper, SweeperConfig};
use transfer_ledger::logging::init_logging;
use transfer_ledger::transfer::{
    AmountRiskGate, FixedBiometric, FixedConfirmation, FixedDeviceTrust, Gates,
};
use transfer_ledger::{
    Currency, HashChain, LedgerCommitCoordinator, LocalKeyStore, LockManager, MemoryStore,
    Persistence, SignatureService, TransferRequest, TransferStateMachine, WalStore,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env)?;
    let _guard = init_logging(&config);
    info!(env = %env, backend = ?config.persistence.backend, "Starting transfer ledger");

    // ============================================================
    // STORAGE
    // ============================================================
    let store: Arc<dyn Persistence> = match config.persistence.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Wal => Arc::new(
            WalStore::open_with(
                &config.persistence.data_dir,
                config.persistence.compact_after_frames,
            )
            .with_context(|| format!("Failed to open {:?}", config.persistence.data_dir))?,
        ),
    };

    let chain = Arc::new(HashChain::open(store.clone())?);
    let locks = Arc::new(LockManager::new(config.engine.lock_ceiling()));
    let coordinator = Arc::new(LedgerCommitCoordinator::open(
        chain.clone(),
        locks.clone(),
        store,
    )?);

    // ============================================================
    // SERVICES
    // ============================================================
    let keys = Arc::new(LocalKeyStore::new());
    for account in ["alice", "bob"] {
        keys.generate(account);
    }
    let signer = Arc::new(SignatureService::new(keys));

    let gates = Gates {
        risk: Arc::new(AmountRiskGate {
            medium_above: Decimal::from(1_000),
            high_above: Decimal::from(10_000),
            critical_above: Decimal::from(50_000),
        }),
        device: Arc::new(FixedDeviceTrust::trusted()),
        biometric: Arc::new(FixedBiometric::new(true)),
        confirmation: Arc::new(FixedConfirmation::new(true)),
    };

    let sweeper = LockSweeper::new(
        locks.clone(),
        SweeperConfig {
            interval: config.engine.sweep_interval(),
        },
    );
    tokio::spawn(async move {
        sweeper.run().await;
    });

    let machine = TransferStateMachine::new(
        config.engine.clone(),
        chain.clone(),
        signer,
        locks,
        coordinator.clone(),
        gates,
    );

    // ============================================================
    // DEMO TRANSFERS
    // ============================================================
    let sar = Currency::parse("SAR")?;
    coordinator.deposit("alice", &sar, Decimal::from(100_000))?;

    let requests = vec![
        TransferRequest::new("alice", "bob", Decimal::from(100), "SAR").with_note("rent"),
        TransferRequest::new("alice", "bob", Decimal::new(2550, 2), "SAR"),
        TransferRequest::new("alice", "bob", Decimal::from(75_000), "SAR"),
        TransferRequest::new("alice", "", Decimal::from(5), "SAR"),
    ];
    let outcomes = join_all(requests.into_iter().map(|r| machine.execute_transfer(r))).await;

    for outcome in &outcomes {
        match &outcome.error {
            None => info!(
                tx_id = %outcome.transaction_id,
                index = ?outcome.chain_index,
                attempts = outcome.attempts,
                "Transfer committed"
            ),
            Some(e) => warn!(
                tx_id = %outcome.transaction_id,
                state = %outcome.final_state,
                kind = %e.kind(),
                message = e.user_message(),
                "Transfer not committed"
            ),
        }
    }

    let report = chain.verify_integrity();
    info!(
        valid = report.valid,
        entries = report.entries_checked,
        head = %chain.head_hash(),
        alice = %coordinator.balance("alice", &sar),
        bob = %coordinator.balance("bob", &sar),
        "Ledger state"
    );

    Ok(())
}
