//! vmsync demo driver.
//!
//! Reconciles a declared VM against the simulated control plane and prints
//! the resulting live state as JSON on stdout. Logs go to stderr.
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `VMSYNC_DESIRED` | Path to the declared VM (JSON), required |
//! | `VMSYNC_LIVE` | Path to a JSON VM seeded as the existing VM; when unset the VM is created |
//!
//! Engine timing comes from the usual `VMSYNC_*` variables, see
//! [`ReconcileConfig::from_env`].

use anyhow::Context;
use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vmsync_core::{ReconcileConfig, Reconciler, VmConfig};
use vmsync_sim::SimulatedControlPlane;

fn read_vm(path: &Path) -> anyhow::Result<VmConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid VM declaration in {}", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr (stdout carries the result)
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("vmsync_core=info".parse()?)
                .add_directive("vmsync_sim=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = ReconcileConfig::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    let desired_path =
        std::env::var("VMSYNC_DESIRED").context("VMSYNC_DESIRED must name a JSON VM declaration")?;
    let desired = read_vm(Path::new(&desired_path))?;

    let plane = Arc::new(SimulatedControlPlane::new());
    let reconciler = Reconciler::new(plane.clone(), plane.clone(), config);

    let live = match std::env::var("VMSYNC_LIVE") {
        Ok(live_path) => {
            let seed = read_vm(Path::new(&live_path))?;
            let id = plane.seed_vm(seed).await;
            tracing::info!(vm_id = %id, "Reconciling existing VM");
            reconciler.reconcile(&desired, &id).await?
        }
        Err(_) => {
            tracing::info!(name = %desired.name, "No live VM given, creating one");
            reconciler.create(&desired).await?
        }
    };

    tracing::info!(
        vm_id = %live.ext_id(),
        mutations = plane.mutations().await.len(),
        "Done"
    );
    println!("{}", serde_json::to_string_pretty(&live)?);

    Ok(())
}
