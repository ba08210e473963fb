use anyhow::Context;
use rtc_core::config::{Config, WarnLevel};
use rtc_server::AppState;
use std::path::Path;

pub fn run(root: &Path, port: Option<u16>, ephemeral: bool, simulator: bool) -> anyhow::Result<()> {
    let mut config = Config::load(root).context("failed to load config")?;
    if let Some(port) = port {
        config.server.port = port;
    }
    for w in config.validate() {
        if w.level == WarnLevel::Warning {
            tracing::warn!("config: {}", w.message);
        }
    }

    let port = config.server.port;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let state = AppState::open(root, config, ephemeral)
            .context("failed to open orchestration engine")?
            .with_simulator(simulator);
        if ephemeral {
            tracing::info!("state is in memory only; nothing survives a restart");
        }
        rtc_server::serve(state, port).await
    })
}
