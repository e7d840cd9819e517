use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use trellis::config::{self, BackendStanza, FileConfig};
use trellis::{Node, ReloadFn, CONTROL_SERVICE};

/// Window after startup in which "every backend already stopped" is
/// treated as a startup failure rather than a normal shutdown.
const STARTUP_GRACE: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
#[command(name = "trellis")]
#[command(author, version, about = "Overlay mesh router", long_about = None)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: PathBuf,

    /// Log filter, overriding the config file (e.g. "debug",
    /// "trellis=trace").
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let cfg = config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    cfg.prepare().context("validating configuration")?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(
            args.log_level
                .clone()
                .or_else(|| cfg.log_level.clone())
                .unwrap_or_else(|| "info".to_string()),
        )
    });
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let settings = cfg.node_settings().context("resolving node settings")?;
    let node = Node::new(settings);

    // Explicit stanza registry: prepare ran above, now attach in file
    // order.
    let mut attached: HashMap<String, usize> = HashMap::new();
    for stanza in &cfg.backends {
        let backend = stanza.build().with_context(|| stanza.key())?;
        let id = node
            .attach_backend(backend, stanza.cost(), stanza.node_costs()?)
            .await
            .with_context(|| format!("starting {}", stanza.key()))?;
        attached.insert(stanza.key(), id);
    }
    for service in &cfg.services {
        service
            .run(&node)
            .with_context(|| format!("starting {}", service.key()))?;
    }

    let control_name = cfg
        .control_service
        .as_ref()
        .map(|c| c.service.clone())
        .unwrap_or_else(|| CONTROL_SERVICE.to_string());
    let reload = make_reload(node.clone(), args.config.clone(), attached);
    node.start_control(&control_name, Some(reload));

    // Grace window: a config with no backends, or backends that all
    // die instantly, is a startup failure.
    let configured = node.backend_count();
    tokio::select! {
        _ = node.wait_backends() => {
            if configured > 0 {
                bail!("all backends have failed");
            }
            warn!("nothing to do - no backends were specified");
            bail!("no backends configured; run with --help for usage");
        }
        _ = tokio::time::sleep(STARTUP_GRACE) => {}
    }
    info!("initialization complete");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, exiting gracefully");
            node.shutdown();
            Ok(())
        }
        _ = node.wait_backends() => {
            bail!("all backends have failed");
        }
        _ = node.wait_shutdown() => Ok(()),
    }
}

/// Build the control-service reload hook.
///
/// Reload re-parses the config file and applies what can change in
/// place: cost updates on stanzas that are still present (re-flooded
/// under a fresh generation) and newly added dialers. Listeners cannot
/// rebind in place and removed stanzas cannot be torn down in place;
/// both are reported and skipped.
fn make_reload(node: Node, path: PathBuf, attached: HashMap<String, usize>) -> ReloadFn {
    let state = Arc::new(tokio::sync::Mutex::new(attached));
    Arc::new(move || {
        let node = node.clone();
        let path = path.clone();
        let state = state.clone();
        let fut: futures::future::BoxFuture<'static, Result<String, String>> =
            Box::pin(async move {
                let cfg: FileConfig = config::load(&path).map_err(|e| e.to_string())?;
                cfg.prepare().map_err(|e| e.to_string())?;

                let mut registry = state.lock().await;
                let mut applied: Vec<String> = Vec::new();
                let mut skipped: Vec<String> = Vec::new();

                for stanza in &cfg.backends {
                    let key = stanza.key();
                    match registry.get(&key).copied() {
                        Some(backend_id) => {
                            let node_costs = stanza.node_costs().map_err(|e| e.to_string())?;
                            match node
                                .set_backend_cost(backend_id, stanza.cost(), node_costs)
                                .await
                            {
                                Ok(0) => {}
                                Ok(n) => applied.push(format!("{key}: {n} link cost(s) updated")),
                                Err(e) => skipped.push(format!("{key}: {e}")),
                            }
                        }
                        None => {
                            if stanza.is_listener() {
                                skipped
                                    .push(format!("{key}: listeners cannot be added on reload"));
                            } else {
                                match attach_stanza(&node, stanza).await {
                                    Ok(id) => {
                                        registry.insert(key.clone(), id);
                                        applied.push(format!("{key}: started"));
                                    }
                                    Err(e) => skipped.push(format!("{key}: {e}")),
                                }
                            }
                        }
                    }
                }

                let live: Vec<String> = cfg.backends.iter().map(|s| s.key()).collect();
                for key in registry.keys() {
                    if !live.contains(key) {
                        skipped.push(format!("{key}: removal requires a restart"));
                    }
                }

                let mut summary = format!("{} change(s)", applied.len());
                if !applied.is_empty() {
                    summary.push_str(&format!("; applied: {}", applied.join(", ")));
                }
                if !skipped.is_empty() {
                    summary.push_str(&format!("; skipped: {}", skipped.join(", ")));
                }
                Ok(summary)
            });
        fut
    })
}

async fn attach_stanza(node: &Node, stanza: &BackendStanza) -> Result<usize, String> {
    let backend = stanza.build().map_err(|e| e.to_string())?;
    let node_costs = stanza.node_costs().map_err(|e| e.to_string())?;
    node.attach_backend(backend, stanza.cost(), node_costs)
        .await
        .map_err(|e| e.to_string())
}
