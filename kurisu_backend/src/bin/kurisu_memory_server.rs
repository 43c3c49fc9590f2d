use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use kurisu_backend::config::KurisuConfig;
use kurisu_backend::memory::server::serve_memory;
use kurisu_backend::memory::{MemoryStore, SqliteMemoryStore};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kurisu_backend=debug")),
        )
        .init();

    let config = KurisuConfig::load();
    let bind = std::env::var("KURISU_MEMORY_BIND").unwrap_or_else(|_| config.memory.bind.clone());
    let bind_addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid memory server bind address '{}'", bind))?;

    let store: Arc<dyn MemoryStore> = Arc::new(
        SqliteMemoryStore::open(
            &config.memory.database_path,
            config.assistant_name.clone(),
            config.memory.context_limit,
            config.memory.max_distance,
        )
        .with_context(|| format!("Failed to open {}", config.memory.database_path))?,
    );

    tracing::info!(
        "Starting memory server on {} (database: {})",
        bind_addr,
        config.memory.database_path
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_memory(store, bind_addr))
}
