//! # datalink-transport
//!
//! Link abstraction and transport gateways for the datalink bridge.
//!
//! This crate provides:
//!
//! - **Link** - Send and receive envelopes over one physical transport
//! - **UdpLink** - One envelope per datagram, for the wireless peer link
//! - **StreamLink** - Length-prefixed envelopes over a byte stream (serial)
//! - **MemoryLink** - In-process link pair
//! - **Gateway** - Pumps bus topics onto a link and back, and hands inbound
//!   envelopes to the exclusion router
//!
//! ```rust,ignore
//! use datalink_transport::{Gateway, GatewayConfig, MemoryLink};
//!
//! let (link, _peer) = MemoryLink::pair("wireless", "peer");
//! let mut gateway = Gateway::new(GatewayConfig::new(LinkId(2)), link, bus);
//! gateway.attach(router)?;
//! tokio::spawn(gateway.run(shutdown_rx));
//! ```

pub mod gateway;
pub mod memory;
pub mod traits;

#[cfg(feature = "udp")]
pub mod udp;

#[cfg(feature = "serial")]
pub mod stream;

pub use gateway::{Gateway, GatewayConfig, GatewayCounters, GatewayRelay};
pub use memory::MemoryLink;
pub use traits::{Link, TransportError};

#[cfg(feature = "udp")]
pub use udp::{UdpConfig, UdpLink};

#[cfg(feature = "serial")]
pub use stream::StreamLink;
