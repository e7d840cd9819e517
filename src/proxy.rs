//! Proxy services: bridge local sockets to mesh streams.
//!
//! Two shapes, each available for Unix sockets and TCP:
//!
//! - **inbound**: listen locally; each accepted local connection dials
//!   a (node, service) pair across the mesh and bytes flow both ways.
//! - **outbound**: advertise a mesh service; each accepted mesh stream
//!   connects to a local socket and bytes flow both ways.
//!
//! Either side finishing its read direction half-closes the bridge;
//! the other direction keeps flowing until it finishes too.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::circuit::Stream;
use crate::error::{NetError, NetResult};
use crate::identity::NodeId;
use crate::node::Node;

/// Copy buffer for the bridge loops.
const BRIDGE_CHUNK: usize = 16 * 1024;

/// Listen on a Unix socket; forward each connection to a mesh service.
#[cfg(unix)]
pub async fn unix_proxy_inbound(
    node: Node,
    socket_path: PathBuf,
    remote_node: NodeId,
    remote_service: String,
) -> NetResult<()> {
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    let listener = UnixListener::bind(&socket_path)?;
    info!(
        path = %socket_path.display(),
        remote = %remote_node,
        service = %remote_service,
        "unix inbound proxy listening"
    );
    loop {
        let (local, _) = listener.accept().await?;
        let node = node.clone();
        let remote_node = remote_node.clone();
        let remote_service = remote_service.clone();
        tokio::spawn(async move {
            match node.dial(&remote_node, &remote_service).await {
                Ok(stream) => bridge(local, stream).await,
                Err(e) => warn!(
                    remote = %remote_node,
                    service = %remote_service,
                    error = %e,
                    "proxy dial failed"
                ),
            }
        });
    }
}

/// Advertise a mesh service; forward each stream to a local Unix socket.
#[cfg(unix)]
pub async fn unix_proxy_outbound(
    node: Node,
    service: String,
    socket_path: PathBuf,
) -> NetResult<()> {
    let listener = node
        .listen_stream(
            &service,
            [
                ("type".to_string(), "unix-proxy".to_string()),
                (
                    "filename".to_string(),
                    socket_path.display().to_string(),
                ),
            ],
        )
        .await?;
    info!(service = %service, path = %socket_path.display(), "unix outbound proxy listening");
    loop {
        let stream = listener.accept().await?;
        let socket_path = socket_path.clone();
        tokio::spawn(async move {
            match UnixStream::connect(&socket_path).await {
                Ok(local) => bridge(local, stream).await,
                Err(e) => {
                    warn!(path = %socket_path.display(), error = %e, "local socket connect failed");
                    stream.abort().await;
                }
            }
        });
    }
}

/// Listen on local TCP; forward each connection to a mesh service.
pub async fn tcp_proxy_inbound(
    node: Node,
    address: String,
    remote_node: NodeId,
    remote_service: String,
) -> NetResult<()> {
    let listener = TcpListener::bind(&address).await?;
    info!(
        addr = %address,
        remote = %remote_node,
        service = %remote_service,
        "tcp inbound proxy listening"
    );
    loop {
        let (local, _) = listener.accept().await?;
        let node = node.clone();
        let remote_node = remote_node.clone();
        let remote_service = remote_service.clone();
        tokio::spawn(async move {
            match node.dial(&remote_node, &remote_service).await {
                Ok(stream) => bridge(local, stream).await,
                Err(e) => warn!(
                    remote = %remote_node,
                    service = %remote_service,
                    error = %e,
                    "proxy dial failed"
                ),
            }
        });
    }
}

/// Advertise a mesh service; forward each stream to a local TCP address.
pub async fn tcp_proxy_outbound(node: Node, service: String, address: String) -> NetResult<()> {
    let listener = node
        .listen_stream(
            &service,
            [
                ("type".to_string(), "tcp-proxy".to_string()),
                ("address".to_string(), address.clone()),
            ],
        )
        .await?;
    info!(service = %service, addr = %address, "tcp outbound proxy listening");
    loop {
        let stream = listener.accept().await?;
        let address = address.clone();
        tokio::spawn(async move {
            match tokio::net::TcpStream::connect(&address).await {
                Ok(local) => bridge(local, stream).await,
                Err(e) => {
                    warn!(addr = %address, error = %e, "local tcp connect failed");
                    stream.abort().await;
                }
            }
        });
    }
}

/// Pump bytes both ways between a local socket and a mesh stream until
/// both directions finish.
pub(crate) async fn bridge<S>(local: S, stream: Stream)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (mut local_read, mut local_write) = tokio::io::split(local);

    let outbound = stream.clone();
    let to_mesh = tokio::spawn(async move {
        let mut buf = vec![0u8; BRIDGE_CHUNK];
        loop {
            match local_read.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if outbound.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "local read ended");
                    break;
                }
            }
        }
        outbound.close().await;
    });

    let from_mesh = tokio::spawn(async move {
        loop {
            match stream.recv(Duration::from_secs(3600)).await {
                Ok(bytes) => {
                    if local_write.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Err(NetError::Timeout) => continue,
                Err(_) => break,
            }
        }
        let _ = local_write.shutdown().await;
    });

    let _ = to_mesh.await;
    let _ = from_mesh.await;
}
