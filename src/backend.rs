//! The backend contract: how transports hand sessions to the mesh.
//!
//! A *backend* is anything that can produce point-to-point sessions:
//! a listener yields one session per accepted connection, a dialer
//! yields one session per successful connect (and redials after loss
//! when configured to). A *session* is an ordered, bidirectional pipe
//! of whole frame envelopes; the mesh never sees transport details,
//! only byte frames.
//!
//! Sessions are used full-duplex: the link layer reads in one task and
//! writes from another, so both operations take `&self` and concrete
//! transports serialize internally per direction.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{NetError, NetResult};

/// First retry delay after a failed dial.
pub const REDIAL_INITIAL_DELAY: Duration = Duration::from_secs(5);

/// Ceiling for the exponential dial backoff.
pub const REDIAL_MAX_DELAY: Duration = Duration::from_secs(60);

/// Capacity of the channel a backend emits sessions on.
const SESSION_CHANNEL_CAPACITY: usize = 8;

/// Ordered frame pipe to one directly connected peer.
#[async_trait]
pub trait BackendSession: Send + Sync {
    /// Queue one frame envelope for delivery. Bounded-blocking: waits
    /// for transport backpressure rather than dropping silently.
    async fn send(&self, frame: &[u8]) -> NetResult<()>;

    /// Receive the next frame envelope.
    ///
    /// Returns `Timeout` if nothing arrives within `timeout`; a timed
    /// out call never discards a partially received frame. Returns
    /// `Closed` once the peer has shut down cleanly.
    async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>>;

    /// Close the session. Idempotent; afterwards both `send` and `recv`
    /// return `Closed`.
    async fn close(&self);
}

pub type SessionRef = Arc<dyn BackendSession>;

/// A source of sessions: one concrete transport listener or dialer.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Short human-readable description for logs ("tcp-listener :7323").
    fn label(&self) -> String;

    /// Begin accepting or dialing. The returned channel yields sessions
    /// until the token is cancelled, after which it closes; sessions
    /// already handed out are not forcibly closed.
    async fn start(&self, shutdown: Shutdown) -> NetResult<mpsc::Receiver<SessionRef>>;
}

/// Clone-able cancellation token.
///
/// Cancelling is level-triggered: every clone observes it, and
/// `cancelled()` resolves immediately once tripped.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Shutdown { tx: Arc::new(tx), rx }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the token is tripped.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives in self, so the channel cannot close early.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn session_channel() -> (mpsc::Sender<SessionRef>, mpsc::Receiver<SessionRef>) {
    mpsc::channel(SESSION_CHANNEL_CAPACITY)
}

/// Session wrapper that reports when the session ends, so a dialer
/// knows to reconnect. Fires on explicit close and on drop.
struct WatchedSession {
    inner: SessionRef,
    ended: std::sync::Mutex<Option<oneshot::Sender<()>>>,
}

impl WatchedSession {
    fn signal(&self) {
        if let Some(tx) = self.ended.lock().expect("ended lock").take() {
            let _ = tx.send(());
        }
    }
}

#[async_trait]
impl BackendSession for WatchedSession {
    async fn send(&self, frame: &[u8]) -> NetResult<()> {
        self.inner.send(frame).await
    }

    async fn recv(&self, timeout: Duration) -> NetResult<Vec<u8>> {
        self.inner.recv(timeout).await
    }

    async fn close(&self) {
        self.inner.close().await;
        self.signal();
    }
}

impl Drop for WatchedSession {
    fn drop(&mut self) {
        self.signal();
    }
}

/// Drive a dialer: connect, emit the session, wait for it to end, and
/// reconnect (when `redial`) with exponential, jittered backoff that
/// resets after each successful connect.
pub(crate) async fn run_dialer<C, F>(
    label: String,
    redial: bool,
    shutdown: Shutdown,
    emit: mpsc::Sender<SessionRef>,
    connect: C,
) where
    C: Fn() -> F + Send,
    F: Future<Output = NetResult<SessionRef>> + Send,
{
    let mut delay = REDIAL_INITIAL_DELAY;
    loop {
        let session = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = connect() => res,
        };
        match session {
            Ok(session) => {
                delay = REDIAL_INITIAL_DELAY;
                let (ended_tx, ended_rx) = oneshot::channel();
                let watched: SessionRef = Arc::new(WatchedSession {
                    inner: session,
                    ended: std::sync::Mutex::new(Some(ended_tx)),
                });
                info!(backend = %label, "outbound connection established");
                if emit.send(watched).await.is_err() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ended_rx => {
                        if !redial {
                            break;
                        }
                        debug!(backend = %label, "connection ended, redialing");
                    }
                }
            }
            Err(e) => {
                if !redial {
                    warn!(backend = %label, error = %e, "dial failed");
                    break;
                }
                let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                debug!(
                    backend = %label,
                    error = %e,
                    retry_in = ?delay,
                    "dial failed, backing off"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay + jitter) => {}
                }
                delay = (delay * 2).min(REDIAL_MAX_DELAY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullSession;

    #[async_trait]
    impl BackendSession for NullSession {
        async fn send(&self, _frame: &[u8]) -> NetResult<()> {
            Ok(())
        }
        async fn recv(&self, _timeout: Duration) -> NetResult<Vec<u8>> {
            Err(NetError::Closed)
        }
        async fn close(&self) {}
    }

    #[tokio::test]
    async fn shutdown_is_level_triggered() {
        let token = Shutdown::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
        // Resolves immediately even for waiters that start late.
        tokio::time::timeout(Duration::from_secs(1), clone.cancelled())
            .await
            .expect("cancelled() should resolve");
    }

    #[tokio::test]
    async fn dialer_emits_and_stops_without_redial() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = session_channel();
        let shutdown = Shutdown::new();
        let counter = attempts.clone();
        let task = tokio::spawn(run_dialer(
            "test".into(),
            false,
            shutdown.clone(),
            tx,
            move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Arc::new(NullSession) as SessionRef)
                }
            },
        ));
        let session = rx.recv().await.expect("one session");
        session.close().await;
        drop(session);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("dialer should stop after session end")
            .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dialer_redials_after_session_end() {
        let (tx, mut rx) = session_channel();
        let shutdown = Shutdown::new();
        tokio::spawn(run_dialer(
            "test".into(),
            true,
            shutdown.clone(),
            tx,
            move || async move { Ok(Arc::new(NullSession) as SessionRef) },
        ));
        let first = rx.recv().await.expect("first session");
        first.close().await;
        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("redial should produce a second session");
        assert!(second.is_some());
        shutdown.cancel();
    }
}
