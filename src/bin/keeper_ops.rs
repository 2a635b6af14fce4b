//! Operator CLI for the keeper.
//!
//! Usage:
//!   keeper-ops status
//!   keeper-ops audit-cycle <cycle_id>
//!   keeper-ops fix-slip <slip_id>
//!   keeper-ops reevaluate-cycle <cycle_id>
//!   keeper-ops sync-bets [lookback_blocks]
//!   keeper-ops set-result <fixture_id> <1x2> <ou> [btts]
//!   keeper-ops force-release <job_name>
//!   keeper-ops cleanup-locks
//!
//! Mutating commands take the same coordination lock as the scheduled job
//! they overlap, so they never race the daemon.

use anyhow::{bail, Context, Result};
use bitredict_keeper::config::Config;
use bitredict_keeper::coordinator::JobOptions;
use bitredict_keeper::scheduler::Job;
use bitredict_keeper::services::Services;
use std::path::Path;
use std::sync::Arc;

const USAGE: &str = "usage: keeper-ops <status | audit-cycle <id> | fix-slip <id> | reevaluate-cycle <id> | sync-bets [lookback] | set-result <fixture> <1x2> <ou> [btts] | force-release <job> | cleanup-locks>";

fn parse_id(args: &[String], what: &str) -> Result<i64> {
    let raw = args.get(2).with_context(|| format!("missing {}\n{}", what, USAGE))?;
    let id: i64 = raw.parse().with_context(|| format!("invalid {}: {}", what, raw))?;
    if id < 0 {
        bail!("{} must be non-negative", what);
    }
    Ok(id)
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        bail!(USAGE);
    };

    let config = match Config::load(Path::new("keeper.toml")) {
        Ok(c) => c,
        Err(_) => Config::from_env(),
    };

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    config.validate()?;
    let svc = Arc::new(Services::connect(config).await?);

    match command {
        "status" => {
            let status = svc.coordinator.status(20).await?;
            println!("runner: {}", svc.coordinator.runner_id());
            println!();
            println!("── Locks ({}) ──", status.locks.len());
            for lock in &status.locks {
                println!(
                    "  {:<28} held by {:<24} since {}  expires {}",
                    lock.job_name,
                    lock.locked_by,
                    lock.locked_at.format("%Y-%m-%d %H:%M:%S"),
                    lock.expires_at.format("%H:%M:%S"),
                );
            }
            println!();
            println!("── Recent executions ──");
            for entry in &status.recent {
                println!(
                    "  {:<28} {:<15} {}  {:>8}  {}",
                    entry.job_name,
                    entry.status.as_str(),
                    entry.started_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.duration_ms.map(|d| format!("{}ms", d)).unwrap_or_else(|| "-".to_string()),
                    entry.error_message.as_deref().unwrap_or(""),
                );
            }
        }

        "audit-cycle" => {
            let cycle_id = parse_id(&args, "cycle id")?;
            let audit = svc.oddyssey.audit_cycle(cycle_id).await?;
            println!("{}", serde_json::to_string_pretty(&audit)?);
            if !audit.is_healthy() {
                std::process::exit(2);
            }
        }

        "fix-slip" => {
            let slip_id = parse_id(&args, "slip id")?;
            let job = Job::UnifiedEvaluation;
            let pipeline = svc.oddyssey.clone();
            let fix = svc
                .coordinator
                .execute_with_coordination(job.name(), JobOptions::default(), |_ctx| {
                    let pipeline = pipeline.clone();
                    async move { pipeline.fix_slip(slip_id).await }
                })
                .await?;
            println!("slip {}: {:?}", slip_id, fix);
        }

        "reevaluate-cycle" => {
            let cycle_id = parse_id(&args, "cycle id")?;
            let job = Job::UnifiedEvaluation;
            let pipeline = svc.oddyssey.clone();
            let (sync, eval) = svc
                .coordinator
                .execute_with_coordination(job.name(), JobOptions::default(), |ctx| {
                    let pipeline = pipeline.clone();
                    async move { pipeline.reevaluate_cycle(&ctx, cycle_id).await }
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "sync": sync, "evaluation": eval }))?);
        }

        "sync-bets" => {
            let lookback = match args.get(2) {
                Some(raw) => raw.parse::<u64>().with_context(|| format!("invalid lookback: {}", raw))?,
                None => svc.config.indexer.fallback_lookback_blocks,
            };
            let indexer = svc.indexer.clone();
            let summary = svc
                .coordinator
                .execute_with_coordination(Job::IndexerFallback.name(), JobOptions::default(), |_ctx| {
                    let indexer = indexer.clone();
                    async move { indexer.reconcile(lookback).await }
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        "set-result" => {
            let fixture_id = parse_id(&args, "fixture id")?;
            let (Some(moneyline), Some(over_under)) = (args.get(3).cloned(), args.get(4).cloned()) else {
                bail!("missing outcomes\n{}", USAGE);
            };
            let btts = args.get(5).cloned();
            let ingestor = svc.ingestor.clone();
            let record = svc
                .coordinator
                .execute_with_coordination(Job::UnifiedResults.name(), JobOptions::default(), |_ctx| {
                    let ingestor = ingestor.clone();
                    let (moneyline, over_under, btts) = (moneyline.clone(), over_under.clone(), btts.clone());
                    async move {
                        ingestor
                            .record_manual_result(fixture_id, &moneyline, &over_under, btts.as_deref())
                            .await
                    }
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        "force-release" => {
            let Some(job_name) = args.get(2) else {
                bail!("missing job name\n{}", USAGE);
            };
            if Job::from_name(job_name).is_none() {
                eprintln!("warning: {} is not a scheduled job name", job_name);
            }
            if svc.coordinator.force_release_lock(job_name).await? {
                println!("released lock for {}", job_name);
            } else {
                println!("no lock held for {}", job_name);
            }
        }

        "cleanup-locks" => {
            let coordinator = svc.coordinator.clone();
            let expired = svc
                .coordinator
                .execute_with_coordination(Job::LockCleanup.name(), JobOptions::default(), |_ctx| {
                    let coordinator = coordinator.clone();
                    async move { coordinator.cleanup_expired_locks().await }
                })
                .await?;
            println!("removed {} expired lock(s)", expired);
        }

        other => bail!("unknown command: {}\n{}", other, USAGE),
    }

    Ok(())
}
