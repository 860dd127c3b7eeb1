//! `conductor migrate`: create the database if needed, apply schema
//! migrations, provision event-log partitions, and verify the status
//! registry seed against the canonical matrix.

use anyhow::Result;
use chrono::{Datelike, Utc};
use sqlx::PgPool;

use conductor_core::registry::StatusRegistry;
use conductor_db::config::DbConfig;
use conductor_db::pool;

/// Exit code when the seeded registry has drifted from the canonical matrix.
pub const EXIT_DRIFT: i32 = 2;

/// Run the migrate command. Returns the process exit code.
pub async fn run_migrate(db_config: &DbConfig) -> Result<i32> {
    println!("Initializing conductor database...");

    pool::ensure_database_exists(db_config).await?;
    let db_pool = pool::create_pool(db_config).await?;

    pool::run_migrations(&db_pool, pool::default_migrations_path()).await?;
    ensure_log_partitions(&db_pool).await?;

    // Drift check: the reference tables must match the canonical matrix the
    // code was built against.
    let drift = StatusRegistry::verify_seed(&db_pool).await?;
    if !drift.is_empty() {
        eprintln!("Status registry drift detected:");
        for line in &drift {
            eprintln!("  {line}");
        }
        db_pool.close().await;
        return Ok(EXIT_DRIFT);
    }

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("conductor migrate complete.");
    Ok(0)
}

/// Provision the webhook-event-log partitions for the current and next
/// month.
async fn ensure_log_partitions(pool: &PgPool) -> Result<()> {
    let today = Utc::now().date_naive();
    let next_month = if today.month() == 12 {
        chrono::NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
    } else {
        chrono::NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
    }
    .expect("valid first-of-month date");

    for month in [today, next_month] {
        let name: (String,) = sqlx::query_as("SELECT logs.ensure_month_partition($1)")
            .bind(month)
            .fetch_one(pool)
            .await?;
        println!("  partition ready: logs.{}", name.0);
    }
    Ok(())
}
