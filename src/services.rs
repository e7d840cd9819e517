//! Per-node service registry.
//!
//! A *service* is a named sink for data frames addressed to this node.
//! The registry owns the name → sink map; the routing engine calls
//! [`ServiceRegistry::dispatch`] for every frame whose destination is
//! the local node. Dispatch is synchronous and never blocks: frames are
//! pushed with `try_send` into the sink's bounded queue, and a full
//! queue sheds the frame rather than stalling the engine.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{NetError, NetResult};
use crate::frame::DataFrame;
use crate::identity::{is_internal_service, validate_public_service, NodeId};

/// Queue depth of one service sink.
const SINK_CAPACITY: usize = 256;

/// What a bound service receives.
#[derive(Debug)]
pub enum Delivery {
    /// A data frame addressed to this service.
    Data(DataFrame),
    /// A delivery failure for traffic this service originated.
    Unreachable(UnreachableNotice),
}

/// Asynchronous delivery-failure report.
#[derive(Clone, Debug)]
pub struct UnreachableNotice {
    /// Node that could not be reached (or that lacked the service).
    pub problem_node: NodeId,
    /// Service the failed traffic was addressed to.
    pub problem_service: String,
    pub reason: String,
}

/// Outcome of a synchronous dispatch attempt.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum DispatchOutcome {
    Delivered,
    /// No binding for the destination service.
    NoSuchService,
    /// Binding exists but its queue is full; the frame was shed.
    Shed,
}

/// Name → sink map for one node.
#[derive(Default)]
pub struct ServiceRegistry {
    sinks: Mutex<HashMap<String, mpsc::Sender<Delivery>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a service name offered through the public API.
    pub fn bind(&self, name: &str) -> NetResult<mpsc::Receiver<Delivery>> {
        validate_public_service(name)?;
        self.bind_any(name)
    }

    /// Bind an internal (control-prefixed) endpoint.
    pub(crate) fn bind_internal(&self, name: &str) -> NetResult<mpsc::Receiver<Delivery>> {
        debug_assert!(is_internal_service(name));
        self.bind_any(name)
    }

    fn bind_any(&self, name: &str) -> NetResult<mpsc::Receiver<Delivery>> {
        let mut sinks = self.sinks.lock().expect("service map");
        if sinks.contains_key(name) {
            return Err(NetError::NameInUse(name.to_string()));
        }
        let (tx, rx) = mpsc::channel(SINK_CAPACITY);
        sinks.insert(name.to_string(), tx);
        Ok(rx)
    }

    /// Release a binding. Idempotent.
    pub fn unbind(&self, name: &str) {
        self.sinks.lock().expect("service map").remove(name);
    }

    pub fn is_bound(&self, name: &str) -> bool {
        self.sinks.lock().expect("service map").contains_key(name)
    }

    /// Publicly visible bindings, for status reporting.
    pub fn bound_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .sinks
            .lock()
            .expect("service map")
            .keys()
            .filter(|n| !is_internal_service(n))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Route a local-destination frame to its service sink.
    /// Synchronous; called from the routing engine's event loop.
    pub(crate) fn dispatch(&self, frame: DataFrame) -> DispatchOutcome {
        let sinks = self.sinks.lock().expect("service map");
        let Some(sink) = sinks.get(&frame.dst_service) else {
            return DispatchOutcome::NoSuchService;
        };
        match sink.try_send(Delivery::Data(frame)) {
            Ok(()) => DispatchOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(Delivery::Data(f))) => {
                warn!(
                    service = %f.dst_service,
                    from = %f.src_node,
                    "service sink full, shedding frame"
                );
                DispatchOutcome::Shed
            }
            Err(_) => DispatchOutcome::NoSuchService,
        }
    }

    /// Deliver a failure notice to the local service that originated
    /// the failed traffic. Best effort.
    pub(crate) fn notify_unreachable(&self, service: &str, notice: UnreachableNotice) {
        let sinks = self.sinks.lock().expect("service map");
        if let Some(sink) = sinks.get(service) {
            let _ = sink.try_send(Delivery::Unreachable(notice));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(dst_service: &str) -> DataFrame {
        DataFrame {
            src_node: NodeId::parse("src").unwrap(),
            dst_node: NodeId::parse("dst").unwrap(),
            src_service: "client".into(),
            dst_service: dst_service.into(),
            ttl: 10,
            payload: b"hi".to_vec(),
        }
    }

    #[test]
    fn double_bind_fails() {
        let reg = ServiceRegistry::new();
        let _rx = reg.bind("echo").unwrap();
        assert!(matches!(reg.bind("echo"), Err(NetError::NameInUse(_))));
    }

    #[test]
    fn bind_unbind_bind_succeeds() {
        let reg = ServiceRegistry::new();
        let rx = reg.bind("echo").unwrap();
        drop(rx);
        reg.unbind("echo");
        reg.unbind("echo"); // idempotent
        assert!(reg.bind("echo").is_ok());
    }

    #[tokio::test]
    async fn dispatch_reaches_sink() {
        let reg = ServiceRegistry::new();
        let mut rx = reg.bind("echo").unwrap();
        assert_eq!(reg.dispatch(frame("echo")), DispatchOutcome::Delivered);
        match rx.recv().await {
            Some(Delivery::Data(f)) => assert_eq!(f.payload, b"hi"),
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[test]
    fn dispatch_unbound_reports_no_such_service() {
        let reg = ServiceRegistry::new();
        assert_eq!(reg.dispatch(frame("ghost")), DispatchOutcome::NoSuchService);
    }

    #[test]
    fn internal_names_hidden_from_status() {
        let reg = ServiceRegistry::new();
        let _a = reg.bind("echo").unwrap();
        let _b = reg.bind_internal("\u{1}ping").unwrap();
        assert_eq!(reg.bound_services(), vec!["echo".to_string()]);
    }

    #[test]
    fn public_bind_rejects_reserved_names() {
        let reg = ServiceRegistry::new();
        assert!(reg.bind("").is_err());
        assert!(reg.bind("\u{1}sneaky").is_err());
    }
}
