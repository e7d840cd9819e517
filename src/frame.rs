//! Wire frames exchanged between directly connected peers.
//!
//! Every frame travels as a length-prefixed envelope:
//!
//! ```text
//! ┌───────────────┬─────────┬──────────────────────────┐
//! │ length (4, BE)│ tag (1) │ body (bincode, fixint)   │
//! └───────────────┴─────────┴──────────────────────────┘
//! ```
//!
//! The length covers the tag and body. Stream transports use it to
//! delimit frames; datagram and message transports carry one whole
//! envelope per datagram/message and the length is validated on decode.
//! Bodies are serialized with bincode under a hard size limit so a
//! malformed or hostile length can never cause an unbounded allocation.
//!
//! | Tag | Frame | Purpose |
//! |-----|-------|---------|
//! | 1 | `InitialHello` | Handshake: node ID + suggested link cost |
//! | 2 | `RoutingUpdate` | Flooded neighbor list, generation-stamped |
//! | 3 | `ServiceAdvert` | Flooded service directory entry |
//! | 4 | `Data` | User payload routed hop by hop |
//! | 5 | `Keepalive` | Liveness probe, no body |
//! | 6 | `Unreachable` | Delivery failure routed back to the source |

use std::collections::BTreeMap;

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{NetError, NetResult};
use crate::identity::NodeId;

/// Hard cap on a whole frame envelope.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Bytes of envelope overhead: length word plus tag byte.
pub const ENVELOPE_OVERHEAD: usize = 5;

/// Hop limit stamped on locally originated data frames.
pub const DEFAULT_TTL: u8 = 30;

const TAG_HELLO: u8 = 1;
const TAG_ROUTING_UPDATE: u8 = 2;
const TAG_SERVICE_ADVERT: u8 = 3;
const TAG_DATA: u8 = 4;
const TAG_KEEPALIVE: u8 = 5;
const TAG_UNREACHABLE: u8 = 6;

/// Bincode options with the size limit enforced.
/// Always used for both directions so the codec stays symmetric.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
        .with_big_endian()
}

fn decode_body<T: DeserializeOwned>(body: &[u8]) -> NetResult<T> {
    Ok(wire_options().deserialize(body)?)
}

/// A user payload in flight: source and destination addressing plus the
/// remaining hop budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataFrame {
    pub src_node: NodeId,
    pub dst_node: NodeId,
    pub src_service: String,
    pub dst_service: String,
    pub ttl: u8,
    pub payload: Vec<u8>,
}

/// Delivery-failure notice routed back toward a dropped frame's source.
///
/// Carries the same per-hop budget as a data frame; a notice that runs
/// out of hops is dropped silently, never answered with another notice.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnreachableInfo {
    /// Node the notice is addressed to (the dropped frame's source).
    pub dst_node: NodeId,
    /// Local service on that node (the dropped frame's source service).
    pub dst_service: String,
    /// Node the dropped frame could not reach.
    pub problem_node: NodeId,
    /// Service the dropped frame was addressed to.
    pub problem_service: String,
    pub ttl: u8,
    pub reason: String,
}

/// One routing-table flood entry: the advertising origin's direct
/// neighbors and negotiated costs, stamped with a per-origin generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoutingUpdate {
    pub origin: NodeId,
    pub generation: u64,
    pub edges: Vec<(NodeId, f64)>,
}

/// One service-directory flood entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceAdvert {
    pub origin: NodeId,
    pub generation: u64,
    pub service: String,
    pub tags: BTreeMap<String, String>,
    /// Absolute expiry, milliseconds since the Unix epoch. Zero or past
    /// withdraws the entry.
    pub expires_ms: u64,
}

/// Tagged envelope: everything that can cross a backend session.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    InitialHello { node_id: NodeId, cost: f64 },
    RoutingUpdate(RoutingUpdate),
    ServiceAdvert(ServiceAdvert),
    Data(DataFrame),
    Keepalive,
    Unreachable(UnreachableInfo),
}

impl Frame {
    pub fn tag(&self) -> u8 {
        match self {
            Frame::InitialHello { .. } => TAG_HELLO,
            Frame::RoutingUpdate(_) => TAG_ROUTING_UPDATE,
            Frame::ServiceAdvert(_) => TAG_SERVICE_ADVERT,
            Frame::Data(_) => TAG_DATA,
            Frame::Keepalive => TAG_KEEPALIVE,
            Frame::Unreachable(_) => TAG_UNREACHABLE,
        }
    }

    /// Serialize to a full envelope (length word included).
    pub fn encode(&self) -> NetResult<Vec<u8>> {
        let body = match self {
            Frame::InitialHello { node_id, cost } => {
                wire_options().serialize(&(node_id, cost))?
            }
            Frame::RoutingUpdate(u) => wire_options().serialize(u)?,
            Frame::ServiceAdvert(a) => wire_options().serialize(a)?,
            Frame::Data(d) => wire_options().serialize(d)?,
            Frame::Keepalive => Vec::new(),
            Frame::Unreachable(u) => wire_options().serialize(u)?,
        };
        let inner_len = body.len() + 1;
        if ENVELOPE_OVERHEAD + body.len() > MAX_FRAME_SIZE {
            return Err(NetError::Codec(format!(
                "frame of {} bytes exceeds the {} byte limit",
                ENVELOPE_OVERHEAD + body.len(),
                MAX_FRAME_SIZE
            )));
        }
        let mut buf = Vec::with_capacity(ENVELOPE_OVERHEAD + body.len());
        buf.extend_from_slice(&(inner_len as u32).to_be_bytes());
        buf.push(self.tag());
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Parse a full envelope produced by [`encode`](Self::encode).
    pub fn decode(data: &[u8]) -> NetResult<Frame> {
        if data.len() < ENVELOPE_OVERHEAD {
            return Err(NetError::Codec(format!(
                "truncated frame: {} bytes",
                data.len()
            )));
        }
        let declared = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if declared != data.len() - 4 {
            return Err(NetError::Codec(format!(
                "frame length mismatch: header says {declared}, envelope has {}",
                data.len() - 4
            )));
        }
        if data.len() > MAX_FRAME_SIZE {
            return Err(NetError::Codec(format!(
                "frame of {} bytes exceeds the {} byte limit",
                data.len(),
                MAX_FRAME_SIZE
            )));
        }
        let tag = data[4];
        let body = &data[5..];
        match tag {
            TAG_HELLO => {
                let (node_id, cost): (NodeId, f64) = decode_body(body)?;
                Ok(Frame::InitialHello { node_id, cost })
            }
            TAG_ROUTING_UPDATE => Ok(Frame::RoutingUpdate(decode_body(body)?)),
            TAG_SERVICE_ADVERT => Ok(Frame::ServiceAdvert(decode_body(body)?)),
            TAG_DATA => Ok(Frame::Data(decode_body(body)?)),
            TAG_KEEPALIVE => {
                if !body.is_empty() {
                    return Err(NetError::Codec("keepalive with a body".into()));
                }
                Ok(Frame::Keepalive)
            }
            TAG_UNREACHABLE => Ok(Frame::Unreachable(decode_body(body)?)),
            other => Err(NetError::Codec(format!("unknown frame tag {other:#04x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(s: &str) -> NodeId {
        NodeId::parse(s).unwrap()
    }

    fn roundtrip(frame: Frame) {
        let bytes = frame.encode().unwrap();
        let again = Frame::decode(&bytes).unwrap();
        assert_eq!(frame, again);
        // Re-encoding is byte-identical.
        assert_eq!(bytes, again.encode().unwrap());
    }

    #[test]
    fn roundtrip_all_tags() {
        roundtrip(Frame::InitialHello {
            node_id: node("alpha"),
            cost: 1.5,
        });
        roundtrip(Frame::RoutingUpdate(RoutingUpdate {
            origin: node("alpha"),
            generation: 42,
            edges: vec![(node("beta"), 1.0), (node("gamma"), 2.5)],
        }));
        roundtrip(Frame::ServiceAdvert(ServiceAdvert {
            origin: node("alpha"),
            generation: 7,
            service: "echo".into(),
            tags: [("type".to_string(), "demo".to_string())].into(),
            expires_ms: 1_900_000_000_000,
        }));
        roundtrip(Frame::Data(DataFrame {
            src_node: node("alpha"),
            dst_node: node("beta"),
            src_service: "\u{1}s0001".into(),
            dst_service: "echo".into(),
            ttl: 30,
            payload: b"ping".to_vec(),
        }));
        roundtrip(Frame::Keepalive);
        roundtrip(Frame::Unreachable(UnreachableInfo {
            dst_node: node("alpha"),
            dst_service: "\u{1}s0001".into(),
            problem_node: node("gone"),
            problem_service: "echo".into(),
            ttl: 29,
            reason: "no route".into(),
        }));
    }

    #[test]
    fn invalid_node_ids_rejected_on_decode() {
        // Node IDs serialize as plain strings, so a hostile update can
        // be forged byte-for-byte with a raw string in the ID slot.
        for bad in ["LOCALHOST", "", "white space", "ctl\u{1}char"] {
            let body = wire_options()
                .serialize(&(
                    bad.to_string(),
                    7u64,
                    vec![("beta".to_string(), 1.0f64)],
                ))
                .unwrap();
            let mut envelope = Vec::new();
            envelope.extend_from_slice(&((body.len() + 1) as u32).to_be_bytes());
            envelope.push(2); // routing update
            envelope.extend_from_slice(&body);
            assert!(
                matches!(Frame::decode(&envelope), Err(NetError::Codec(_))),
                "origin {bad:?} must not decode"
            );
        }
        // Mixed case is legal on the wire but normalized on decode.
        let frame = Frame::InitialHello {
            node_id: node("gamma"),
            cost: 1.0,
        };
        let mut bytes = frame.encode().unwrap();
        let pos = bytes
            .windows(5)
            .position(|w| w == b"gamma")
            .expect("id appears in the envelope");
        bytes[pos..pos + 5].copy_from_slice(b"GaMmA");
        match Frame::decode(&bytes).unwrap() {
            Frame::InitialHello { node_id, .. } => assert_eq!(node_id, node("gamma")),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn unknown_tag_rejected() {
        let mut bytes = Frame::Keepalive.encode().unwrap();
        bytes[4] = 0xEE;
        assert!(matches!(Frame::decode(&bytes), Err(NetError::Codec(_))));
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut bytes = Frame::Keepalive.encode().unwrap();
        bytes[3] = bytes[3].wrapping_add(1);
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn truncated_rejected() {
        assert!(Frame::decode(&[]).is_err());
        assert!(Frame::decode(&[0, 0, 0]).is_err());
        let bytes = Frame::Data(DataFrame {
            src_node: node("a"),
            dst_node: node("b"),
            src_service: "x".into(),
            dst_service: "y".into(),
            ttl: 1,
            payload: vec![0; 64],
        })
        .encode()
        .unwrap();
        assert!(Frame::decode(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn keepalive_is_minimal() {
        let bytes = Frame::Keepalive.encode().unwrap();
        assert_eq!(bytes.len(), ENVELOPE_OVERHEAD);
    }

    #[test]
    fn oversized_payload_rejected() {
        let frame = Frame::Data(DataFrame {
            src_node: node("a"),
            dst_node: node("b"),
            src_service: "s".into(),
            dst_service: "d".into(),
            ttl: 1,
            payload: vec![0u8; MAX_FRAME_SIZE],
        });
        assert!(frame.encode().is_err());
    }
}
