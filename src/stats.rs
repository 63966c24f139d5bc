//! Database statistics: entity counts per kind and queue backlog.
//!
//! Used by `autotown stats` to show whether the pipeline is keeping up.

use anyhow::Result;

use crate::app::App;
use crate::config::Config;

pub async fn run_stats(config: &Config) -> Result<()> {
    let app = App::open(config).await?;

    let kinds = app.store.counts_by_kind().await?;
    let depths = app.queue.depths().await?;
    let oldest_task: Option<i64> = sqlx::query_scalar("SELECT MIN(enqueued_at) FROM tasks")
        .fetch_one(&app.pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Autotown — Database Stats");
    println!("=========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();

    if kinds.is_empty() {
        println!("  No entities stored.");
    } else {
        println!("  {:<24} {:>10}", "KIND", "ENTITIES");
        println!("  {}", "-".repeat(35));
        for (kind, n) in &kinds {
            println!("  {:<24} {:>10}", kind, n);
        }
    }

    println!();
    let pending: i64 = depths.iter().map(|(_, n)| n).sum();
    println!("  Pending tasks: {}", pending);
    for (queue, n) in &depths {
        println!("    {:<22} {:>10}", queue, n);
    }
    if let Some(ts) = oldest_task {
        println!("  Oldest task:   queued {}", format_ts_relative(ts));
    }
    println!();

    app.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
