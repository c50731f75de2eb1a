//! Store overview for `bulk stats`.
//!
//! Prints entity counts per table and job counts per status, so an operator
//! can confirm an import landed without opening the database.

use anyhow::Result;

use crate::config::Config;
use crate::context::Context;
use crate::jobs::JobTable;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let ctx = Context::connect(config).await?;

    let mut entity_counts = Vec::new();
    for table in ["users", "articles", "comments"] {
        let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&ctx.pool)
            .await?;
        entity_counts.push((table, n));
    }

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Bulkport Database Stats");
    println!("=======================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    for (table, n) in &entity_counts {
        println!("  {:<12} {}", format!("{}:", capitalize(table)), n);
    }

    for (label, table) in [("Import jobs", JobTable::Imports), ("Export jobs", JobTable::Exports)] {
        let counts = ctx.jobs.count_by_status(table).await?;
        let last: Option<i64> =
            sqlx::query_scalar(&format!("SELECT MAX(created_at) FROM {}", table.as_str()))
                .fetch_one(&ctx.pool)
                .await?;

        println!();
        println!(
            "  {} (last: {}):",
            label,
            last.map(format_ts_relative)
                .unwrap_or_else(|| "never".to_string())
        );
        if counts.is_empty() {
            println!("    none");
        }
        for (status, n) in counts {
            println!("    {:<12} {:>8}", status, n);
        }
    }

    println!();

    ctx.pool.close().await;
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
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

/// Format a Unix timestamp relative to now (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    let plural = |n: i64| if n == 1 { "" } else { "s" };
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, plural(mins))
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, plural(hours))
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, plural(days))
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn relative_times() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 120), "2 mins ago");
        assert_eq!(format_ts_relative(now - 3600), "1 hour ago");
        assert!(format_ts_relative(now - 86400 * 60).contains('-'));
    }

    #[test]
    fn capitalize_table_names() {
        assert_eq!(capitalize("users"), "Users");
    }
}
