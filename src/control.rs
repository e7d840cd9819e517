//! The control service: a text line protocol over mesh streams.
//!
//! Bound at node startup under a well-known service name (default
//! `control`), reachable from any node in the mesh. One command per
//! line:
//!
//! ```text
//! status          routing table, links and known services
//! ping <node>     round-trip probe to another node
//! reload          re-read the configuration file and apply what can
//!                 be applied in place
//! quit            close the control connection
//! ```
//!
//! Reload is wired through a hook installed by the binary, because only
//! it knows the config path and which stanzas are live; nodes embedded
//! as a library simply get "reload not available".

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::error::{NetError, NetResult};
use crate::identity::NodeId;
use crate::node::Node;

/// Default control service name.
pub const CONTROL_SERVICE: &str = "control";

/// Deadline for a control `ping`.
const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// Hook invoked by the `reload` command. Returns a human-readable
/// summary of what was applied, or an error description.
pub type ReloadFn = Arc<dyn Fn() -> BoxFuture<'static, Result<String, String>> + Send + Sync>;

/// Serve the control protocol until the node shuts down.
pub(crate) async fn run_control(
    node: Node,
    service: String,
    reload: Option<ReloadFn>,
) -> NetResult<()> {
    let listener = node
        .listen_stream(&service, [("type".to_string(), "control".to_string())])
        .await?;
    info!(service = %service, "control service listening");
    loop {
        let stream = match listener.accept().await {
            Ok(stream) => stream,
            Err(NetError::Closed) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "control accept failed");
                continue;
            }
        };
        let node = node.clone();
        let reload = reload.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_connection(node, stream, reload).await {
                if !e.is_benign() {
                    debug!(error = %e, "control connection ended");
                }
            }
        });
    }
}

async fn serve_connection(
    node: Node,
    stream: crate::circuit::Stream,
    reload: Option<ReloadFn>,
) -> NetResult<()> {
    stream
        .send(format!("trellis control on node {}\n", node.node_id()).as_bytes())
        .await?;
    let mut buffer: Vec<u8> = Vec::new();
    loop {
        let bytes = match stream.recv(Duration::from_secs(3600)).await {
            Ok(bytes) => bytes,
            Err(NetError::Timeout) => continue,
            Err(e) => return Err(e),
        };
        buffer.extend_from_slice(&bytes);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line).trim().to_string();
            if line.is_empty() {
                continue;
            }
            if line.eq_ignore_ascii_case("quit") || line.eq_ignore_ascii_case("exit") {
                stream.close().await;
                return Ok(());
            }
            let response = dispatch(&node, &line, &reload).await;
            stream.send(response.as_bytes()).await?;
        }
    }
}

async fn dispatch(node: &Node, line: &str, reload: &Option<ReloadFn>) -> String {
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or("").to_ascii_lowercase();
    match command.as_str() {
        "status" => match node.status().await {
            Ok(status) => {
                let mut out = String::new();
                out.push_str(&format!(
                    "node {} generation {}\n",
                    status.node_id, status.generation
                ));
                out.push_str("links:\n");
                for (peer, cost) in &status.up_links {
                    out.push_str(&format!("  {peer} cost {cost}\n"));
                }
                out.push_str("routes:\n");
                for (dst, route) in &status.routes {
                    out.push_str(&format!(
                        "  {dst} via {} cost {}\n",
                        route.next_hop, route.cost
                    ));
                }
                out.push_str("services:\n");
                for (origin, service) in &status.services {
                    out.push_str(&format!("  {service} @ {origin}\n"));
                }
                out
            }
            Err(e) => format!("error: {e}\n"),
        },
        "ping" => {
            let Some(target) = parts.next() else {
                return "usage: ping <node>\n".into();
            };
            let target = match NodeId::parse(target) {
                Ok(id) => id,
                Err(e) => return format!("error: {e}\n"),
            };
            match node.ping(&target, PING_TIMEOUT).await {
                Ok(rtt) => format!("reply from {target} in {:.1} ms\n", rtt.as_secs_f64() * 1e3),
                Err(e) => format!("error: {e}\n"),
            }
        }
        "reload" => match reload {
            Some(hook) => match hook().await {
                Ok(summary) => format!("reload ok: {summary}\n"),
                Err(e) => format!("reload failed: {e}\n"),
            },
            None => "reload not available\n".into(),
        },
        other => format!("unknown command {other:?}\n"),
    }
}
