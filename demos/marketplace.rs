//! Example wiring for a task-marketplace application.
//!
//! Run with: cargo run --example marketplace

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use jobmill::{JobQueue, MaintenanceConfig, NewJob, VolatileConfig};

#[derive(Debug, Serialize, Deserialize)]
struct SendEmail {
    to: String,
    subject: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SendNotification {
    user_id: i64,
    message: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct GenerateReport {
    month: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct AutoPayout {
    tasker_id: i64,
    amount_cents: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct UpdateKpi {
    metric: String,
    value: f64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // 1. Open the queue and build the cache client on the same store.
    let mut queue = JobQueue::new("sqlite://marketplace.db?mode=rwc").await?;
    let cache = queue.cache(Some(VolatileConfig::default()));

    // 2. Register handlers for the application's job types.
    let send_email = queue.register(
        "send_email",
        |args: SendEmail| async move {
            println!("emailing {}: {}", args.to, args.subject);
            Ok(())
        },
        3,
    );

    queue.register(
        "send_notification",
        |args: SendNotification| async move {
            println!("push to user {}: {}", args.user_id, args.message);
            Ok(())
        },
        3,
    );

    queue.register(
        "generate_report",
        {
            let cache = cache.clone();
            move |args: GenerateReport| {
                let cache = cache.clone();
                async move {
                    // Monthly KPI reports are memoized for an hour.
                    let report = cache
                        .remember_or_compute(
                            &format!("report:{}", args.month),
                            Some(Duration::from_secs(3600)),
                            || async move { json!({"month": args.month, "tasks": 128}) },
                        )
                        .await
                        .map_err(|e| e.to_string())?;
                    println!("report ready: {report}");
                    Ok(())
                }
            }
        },
        3,
    );

    // Payouts jump the queue.
    let auto_payout = queue
        .register(
            "auto_payout",
            |args: AutoPayout| async move {
                println!(
                    "paying tasker {} {} cents",
                    args.tasker_id, args.amount_cents
                );
                Ok(())
            },
            5,
        )
        .with_priority(9);

    queue.register(
        "update_kpi",
        |args: UpdateKpi| async move {
            println!("kpi {} = {}", args.metric, args.value);
            Ok(())
        },
        1,
    );

    // 3. The cache-sweep job type links the queue to the cache.
    queue.register_cache_sweep(cache.clone());

    // 4. Start workers and the maintenance loop.
    queue.start(2);
    queue.start_maintenance(MaintenanceConfig::default());

    // 5. Enqueue through typed handles...
    send_email
        .enqueue(SendEmail {
            to: "user@example.com".to_string(),
            subject: "Welcome!".to_string(),
        })
        .await?;

    auto_payout
        .enqueue(AutoPayout {
            tasker_id: 42,
            amount_cents: 12_500,
        })
        .await?;

    // 6. ...with a delay...
    send_email
        .schedule(
            SendEmail {
                to: "user@example.com".to_string(),
                subject: "Reminder".to_string(),
            },
            Duration::from_secs(30),
        )
        .await?;

    // 7. ...or raw, validated against the registered schema.
    queue
        .enqueue(NewJob::new("generate_report", json!({"month": "2026-07"})).with_priority(9))
        .await?;

    queue.wait_for_shutdown().await;
    Ok(())
}
