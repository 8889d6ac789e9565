//! MCP server initialization for stdio and streamable HTTP transports.
//!
//! Provides [`serve_stdio`] and [`serve_http`] entry points that open the
//! memory service and hand it to the MCP tool handler.

use crate::config::TesseraConfig;
use crate::service::MemoryService;
use crate::tools::TesseraTools;
use anyhow::Result;
use rmcp::ServiceExt;
use std::sync::Arc;

/// Open the service and log a health snapshot.
async fn setup_service(config: &TesseraConfig) -> Result<Arc<MemoryService>> {
    let service = MemoryService::from_config(config)?;
    tracing::info!(db = %config.resolved_db_path().display(), "database ready");

    match service.health().await {
        Ok(report) if report.integrity_ok => tracing::info!(
            schema_version = report.schema_version,
            sqlite_vec = %report.sqlite_vec_version,
            blocks = report.block_count,
            embeddings = report.embedding_count,
            tasks = report.task_count,
            sessions = report.session_count,
            "database health ok"
        ),
        Ok(report) => tracing::warn!(?report, "database integrity check failed"),
        Err(e) => tracing::warn!(error = %e, "database health check failed"),
    }

    Ok(Arc::new(service))
}

/// Start the configured transport (`server.transport`).
pub async fn serve(config: TesseraConfig) -> Result<()> {
    match config.server.transport.as_str() {
        "stdio" => serve_stdio(config).await,
        "http" => serve_http(config).await,
        other => anyhow::bail!("unknown transport: {other}. Supported: stdio, http"),
    }
}

/// Start the MCP server over stdio transport.
pub async fn serve_stdio(config: TesseraConfig) -> Result<()> {
    tracing::info!("starting Tessera MCP server on stdio");

    let service = setup_service(&config).await?;
    let tools = TesseraTools::new(service);
    let transport = rmcp::transport::stdio();

    let server = tools.serve(transport).await?;
    tracing::info!("MCP server running, waiting for client");

    server.waiting().await?;
    tracing::info!("MCP server shut down");

    Ok(())
}

/// Start the MCP server over streamable HTTP, mounted at `/mcp`.
pub async fn serve_http(config: TesseraConfig) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!(addr = %bind_addr, "starting Tessera MCP server on HTTP");

    let service = setup_service(&config).await?;

    let http_service = rmcp::transport::streamable_http_server::StreamableHttpService::new(
        move || Ok(TesseraTools::new(Arc::clone(&service))),
        rmcp::transport::streamable_http_server::session::local::LocalSessionManager::default()
            .into(),
        Default::default(),
    );

    let router = axum::Router::new().nest_service("/mcp", http_service);

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "MCP server listening at http://{bind_addr}/mcp");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for ctrl-c");
            }
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    Ok(())
}
