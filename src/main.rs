mod console;

use std::time::Duration;

use anyhow::{Context, Result};
use kurisu_backend::adapters::TelegramAdapter;
use kurisu_backend::config::KurisuConfig;
use kurisu_backend::runtime::AssistantRuntime;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,kurisu=debug,kurisu_backend=debug")),
        )
        .init();

    tracing::info!("Kurisu starting...");

    let config = KurisuConfig::load();
    let rt = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    let result = rt.block_on(run(config));
    // The stdin reader sits on a blocking thread that never returns on its own.
    rt.shutdown_timeout(Duration::from_millis(500));
    result
}

async fn run(config: KurisuConfig) -> Result<()> {
    let runtime =
        AssistantRuntime::bootstrap(config).context("failed to bootstrap assistant runtime")?;
    runtime.start().await?;

    let telegram = TelegramAdapter::from_env(runtime.bus.clone(), &runtime.config)?;
    let telegram_task = telegram.as_ref().map(|adapter| adapter.spawn());

    let printer = console::attach_printer(&runtime.bus, &runtime.config);

    tokio::select! {
        result = console::read_loop(&runtime.bus, &runtime.config) => {
            if let Err(e) = result {
                tracing::error!("Console error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted, shutting down");
        }
    }

    runtime
        .bus
        .unsubscribe(&runtime.config.outbound_topic, &printer);
    if let Some(adapter) = telegram {
        adapter.detach();
    }
    if let Some(task) = telegram_task {
        task.abort();
    }
    runtime.shutdown().await;
    Ok(())
}
