//! Office kernel demonstration binary.
//!
//! Opens a small bookkeeping office, invokes the withdrawal process one or
//! more times and prints each completion with its event trace as JSON:
//! - `ledger`: process-scoped ledger governed as a transaction
//! - `transfer`: parallel audit flow plus an asynchronous settlement
//! - `overdraft`: escalation handled by a function-level handler

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use thiserror::Error;

use office_kernel::kernel::{
    Extension, FlowStrategy, Governance, ManagedObjectScope, OfficeBuilder, RecordingObserver,
};
use office_kernel::types::{BoxError, KernelConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Scenario {
    Ledger,
    Transfer,
    Overdraft,
}

#[derive(Debug, Parser)]
#[command(name = "office-kernel", about = "Run a managed-function office scenario")]
struct Cli {
    /// Scenario to run.
    #[arg(value_enum, default_value = "ledger")]
    scenario: Scenario,

    /// JSON configuration file.
    #[arg(long, env = "OFFICE_KERNEL_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// Amount moved by the process.
    #[arg(long, default_value_t = 40)]
    amount: i64,

    /// Number of processes to run.
    #[arg(long, default_value_t = 1)]
    processes: usize,

    /// Print every kernel event after each completion.
    #[arg(long)]
    events: bool,

    /// How long to wait for the process.
    #[arg(long, default_value = "5s", value_parser = humantime_duration)]
    timeout: Duration,
}

fn humantime_duration(s: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(s).map_err(|err| err.to_string())
}

#[derive(Debug, Error)]
#[error("insufficient funds: balance {balance}, requested {requested}")]
struct InsufficientFunds {
    balance: i64,
    requested: i64,
}

/// Account balance with pending (uncommitted) movements.
#[derive(Debug)]
struct Ledger {
    balance: AtomicI64,
    pending: Mutex<Vec<i64>>,
}

/// Transaction view of a ledger.
#[derive(Debug, Clone)]
struct LedgerTransaction(Arc<Ledger>);

#[derive(Debug)]
struct LedgerGovernance;

impl Governance for LedgerGovernance {
    fn enforce(&self, extensions: &[Extension]) -> Result<(), BoxError> {
        for extension in extensions {
            if let Some(tx) = extension.downcast_ref::<LedgerTransaction>() {
                let pending: Vec<i64> = std::mem::take(
                    &mut *tx.0.pending.lock().unwrap_or_else(PoisonError::into_inner),
                );
                for amount in pending {
                    tx.0.balance.fetch_add(amount, Ordering::SeqCst);
                }
            }
        }
        Ok(())
    }

    fn disregard(&self, extensions: &[Extension]) -> Result<(), BoxError> {
        for extension in extensions {
            if let Some(tx) = extension.downcast_ref::<LedgerTransaction>() {
                tx.0.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
            }
        }
        Ok(())
    }
}

fn build(builder: &mut OfficeBuilder, scenario: Scenario) {
    builder
        .managed_object("ledger", ManagedObjectScope::Process, |_deps| {
            Ok(Ledger {
                balance: AtomicI64::new(100),
                pending: Mutex::new(Vec::new()),
            })
        })
        .extension::<LedgerTransaction, _>(|ledger| Ok(LedgerTransaction(Arc::clone(ledger))))
        .governance("transaction")
        .recycle(|ledger| {
            tracing::info!(
                "ledger_closed: balance={}",
                ledger.balance.load(Ordering::SeqCst)
            );
            Ok(())
        });
    builder.governance::<LedgerTransaction, _>("transaction", LedgerGovernance);

    builder.function("audit", |ctx| {
        tracing::info!("audit: movement={}", ctx.parameter());
        Ok(Value::Null)
    });
    builder.function("overdraftHandler", |ctx| {
        let reason = ctx
            .escalation()
            .map(|escalation| escalation.to_string())
            .unwrap_or_default();
        Ok(json!({ "rejected": reason }))
    });

    let mut withdraw = builder.function("withdraw", move |ctx| {
        let amount: i64 = ctx.parameter_as()?;
        let ledger = ctx.object::<Ledger>(0)?;
        let balance = ledger.balance.load(Ordering::SeqCst);
        if amount > balance {
            return Err(InsufficientFunds {
                balance,
                requested: amount,
            }
            .into());
        }
        ledger
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(-amount);
        if matches!(scenario, Scenario::Transfer) {
            ctx.invoke_flow(0, json!(amount))?;
            let settlement = ctx.create_asynchronous_flow();
            ctx.executor().execute(move || {
                settlement.complete(Some(json!({ "settled": amount })));
            });
        }
        Ok(json!({ "withdrawn": amount }))
    });
    withdraw
        .object("ledger")
        .flow("audit", FlowStrategy::Parallel)
        .escalation::<InsufficientFunds>("overdraftHandler");
    withdraw
        .pre_duty("beginTransaction", |_extensions, ctx| {
            ctx.governance(0)?.activate()
        })
        .object("ledger")
        .extension::<LedgerTransaction>()
        .governance("transaction");
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => KernelConfig::from_file(path)?,
        None => KernelConfig::default(),
    };
    office_kernel::observability::init_tracing_with(&config.observability);

    let observer = Arc::new(RecordingObserver::new());
    let mut builder = OfficeBuilder::from_config("bookkeeping", &config);
    builder.observer(observer.clone());
    build(&mut builder, cli.scenario);
    let office = builder.open()?;

    let amount = match cli.scenario {
        Scenario::Overdraft => cli.amount.max(1000),
        _ => cli.amount,
    };
    let manager = office.function_manager("withdraw")?;
    for _ in 0..cli.processes {
        observer.clear();
        let completion = manager.invoke_process_and_wait(json!(amount), cli.timeout)?;
        let report = json!({
            "process": completion.process_id,
            "success": completion.is_success(),
            "value": completion.value(),
            "escalation": completion.escalation().map(|e| e.to_string()),
            "cleanup_escalations": completion.cleanup_escalations.len(),
            "duration_ms": completion.duration().num_milliseconds(),
            "trace": observer.trace(),
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        if cli.events {
            for event in observer.events() {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
    }
    office.close();
    Ok(())
}
