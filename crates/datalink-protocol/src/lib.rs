//! # datalink-protocol
//!
//! Wire format shared by every datalink node.
//!
//! This crate defines the envelope exchanged between transport gateways,
//! the length-prefixed codec used to frame envelopes on a link, and the
//! fixed-layout payloads carried on the bus and over the local process
//! channels.
//!
//! ## Envelope
//!
//! - `topic_id` - the bus topic the payload belongs to (`0` is a topic report)
//! - `hops_remaining` - relays still allowed before the envelope is dropped
//! - `payload` - the encoded topic value
//!
//! ## Example
//!
//! ```rust
//! use datalink_protocol::{codec, Envelope};
//!
//! let envelope = Envelope::new(1401, vec![1, 0, 0, 0, 0, 0, 0, 0]);
//!
//! let encoded = codec::encode(&envelope).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;
pub mod payload;

pub use codec::{decode, encode, ProtocolError};
pub use envelope::{Envelope, TopicId, DEFAULT_HOPS, TOPIC_REPORT_ID};
pub use payload::{
    CommandKind, EstimationCommand, EstimationState, EstimationTelemetry, Heartbeat, Payload,
    StateMode, TopicReport,
};
