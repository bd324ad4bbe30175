use std::{fs, path::Path, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use schemars::schema_for;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::mpsc,
};
use tracing::{info, warn};

use crate::{
    config::{CONFIG_PREFIX, ConfigManager, OrchestratorConfig},
    dispatch::{TracingAgentBridge, TracingDispatcher},
    message::InboundMessage,
    orchestrator::FlowOrchestrator,
    scenario::{InMemoryBackends, ReplayReport, Scenario, replay},
    store::{TenantBundle, load_bundle},
    watcher::DirectoryWatcher,
};

/// Check that a bundle parses and its graph builds. Returns the non-fatal findings.
pub fn validate_bundle_file(file: &Path) -> Result<Vec<String>> {
    if !file.exists() {
        bail!("File does not exist: {}", file.display());
    }
    let bundle = load_bundle(file)?;
    let warnings = bundle.graph.validate();
    for warning in &warnings {
        warn!(file = %file.display(), "{warning}");
    }
    info!(
        "✅ Valid bundle for tenant `{}` ({} nodes): {}",
        bundle.tenant.id,
        bundle.graph.nodes().count(),
        file.display()
    );
    Ok(warnings)
}

/// Emit JSON Schema for bundle, scenario and inbound message files.
pub fn write_schema(out_dir: &Path) -> Result<()> {
    fs::create_dir_all(out_dir)?;

    let bundle = serde_json::to_string_pretty(&schema_for!(TenantBundle))?;
    fs::write(out_dir.join("bundle.schema.json"), bundle)?;

    let scenario = serde_json::to_string_pretty(&schema_for!(Scenario))?;
    fs::write(out_dir.join("scenario.schema.json"), scenario)?;

    let inbound = serde_json::to_string_pretty(&schema_for!(InboundMessage))?;
    fs::write(out_dir.join("inbound.schema.json"), inbound)?;

    Ok(())
}

/// Settings this crate reads, as currently visible through `config`.
pub async fn config_entries(config: &ConfigManager) -> Vec<(String, String)> {
    let mut entries: Vec<(String, String)> = config
        .0
        .as_vec()
        .await
        .into_iter()
        .filter(|(key, _)| key.starts_with(CONFIG_PREFIX))
        .collect();
    entries.sort();
    entries
}

pub async fn set_config(config: &ConfigManager, key: &str, value: &str) -> Result<()> {
    if !key.starts_with(CONFIG_PREFIX) {
        bail!("Unknown setting `{key}`: settings start with {CONFIG_PREFIX}");
    }
    config
        .0
        .set(key, value)
        .await
        .map_err(|e| anyhow::anyhow!("Could not store {key}: {e}"))?;
    info!(%key, "setting stored");
    Ok(())
}

pub async fn delete_config(config: &ConfigManager, key: &str) -> Result<()> {
    if config.get(key).await.is_none() {
        bail!("Setting `{key}` is not set");
    }
    config.0.del(key).await;
    info!(%key, "setting removed");
    Ok(())
}

pub async fn replay_file(scenario: &Path, config: OrchestratorConfig) -> Result<ReplayReport> {
    let scenario = Scenario::load(scenario)
        .with_context(|| format!("Failed to load scenario: {}", scenario.display()))?;
    replay(&scenario, config).await
}

/// Serve tenants from a bundle directory (hot-reloaded), reading inbound
/// messages as JSON lines on stdin until EOF or Ctrl-C. Replies are logged.
pub async fn run(bundles: PathBuf, config: OrchestratorConfig, poll_interval: Duration) -> Result<()> {
    let backends = InMemoryBackends::new(&config);
    let loader = Arc::new(backends.loader());
    let watcher = DirectoryWatcher::new(bundles.clone(), loader.clone(), poll_interval, true, true)
        .await
        .with_context(|| format!("Failed to watch bundles in {}", bundles.display()))?;
    info!(tenants = ?loader.loaded_tenants(), "bundles loaded from {}", bundles.display());

    let collaborators = backends.collaborators(Arc::new(TracingDispatcher), Arc::new(TracingAgentBridge));
    let orchestrator = Arc::new(FlowOrchestrator::new(collaborators, config));
    let (tx, rx) = mpsc::channel::<InboundMessage>(256);
    let intake = orchestrator.spawn_intake(rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => match serde_json::from_str::<InboundMessage>(&line) {
                    Ok(message) => {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("ignoring malformed inbound line: {e}"),
                },
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, draining in-flight messages");
                break;
            }
        }
    }

    drop(tx);
    intake.await?;
    watcher.shutdown();
    Ok(())
}
