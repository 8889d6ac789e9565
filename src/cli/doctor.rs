//! CLI `doctor` command: run database diagnostics and print a health report.

use anyhow::{Context, Result};

use tessera::config::TesseraConfig;
use tessera::db;
use tessera::embedding::configured_model_id;

/// Run database diagnostics and print a health report.
pub fn doctor(config: &TesseraConfig) -> Result<()> {
    let db_path = config.resolved_db_path();

    if !db_path.exists() {
        println!("Database: not found at {}", db_path.display());
        println!("Run `tessera serve` to initialize.");
        return Ok(());
    }

    let file_size = std::fs::metadata(&db_path).map(|m| m.len()).unwrap_or(0);

    let conn = db::open_database(&db_path).context("failed to open database (may be corrupt)")?;
    let report = db::check_database_health(&conn).context("failed to run health check")?;
    let stored_model = db::migrations::get_embedding_model(&conn)?;

    println!("Tessera Health Report");
    println!("=====================");
    println!();
    println!("Database:          {}", db_path.display());
    println!("File size:         {}", format_bytes(file_size));
    println!("Schema version:    {}", report.schema_version);
    println!("sqlite-vec:        {}", report.sqlite_vec_version);
    println!();
    println!("Embedding provider:");
    println!("  Recorded:        {}", stored_model.as_deref().unwrap_or("(not set)"));
    println!("  Configured:      {} ({})", config.embedding.provider, config.embedding.model);
    let configured = configured_model_id(&config.embedding);
    if let Some(warning) = model_mismatch(stored_model.as_deref(), configured.as_deref()) {
        println!("  WARNING:         {warning}");
    }
    println!();
    println!("Row counts:");
    println!("  Blocks:          {}", report.block_count);
    println!("  Embeddings:      {}", report.embedding_count);
    println!("  Tasks:           {}", report.task_count);
    println!("  Sessions:        {}", report.session_count);
    println!();
    if report.integrity_ok {
        println!("Integrity check:   PASSED");
    } else {
        println!("Integrity check:   FAILED");
        println!();
        println!("Restore from a backup copy of {} before continuing.", db_path.display());
    }

    Ok(())
}

/// Warning text when stored vectors came from a different model than the
/// configured one. Nothing to compare when either side is unset.
fn model_mismatch(recorded: Option<&str>, configured: Option<&str>) -> Option<String> {
    match (recorded, configured) {
        (Some(recorded), Some(configured)) if recorded != configured => Some(format!(
            "stored vectors use '{recorded}' but '{configured}' is configured; \
             semantic search skips them until the store is re-embedded"
        )),
        _ => None,
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_byte_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.0 MB");
    }

    #[test]
    fn warns_on_model_mismatch() {
        let warning = model_mismatch(Some("hash-384"), Some("all-MiniLM-L6-v2")).unwrap();
        assert!(warning.contains("hash-384"));
        assert!(warning.contains("all-MiniLM-L6-v2"));

        assert!(model_mismatch(Some("hash-384"), Some("hash-384")).is_none());
        assert!(model_mismatch(None, Some("hash-384")).is_none());
        assert!(model_mismatch(Some("hash-384"), None).is_none());
    }
}
