//! # datalink-core
//!
//! Topic bus and cross-transport routing for the datalink bridge.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Topic** - Numeric, typed publish/subscribe channel descriptor
//! - **Bus** - Latest-value-wins topic registry shared by every component
//! - **ExclusionSet** - Bounded list of topic ids that must not cross links
//! - **ExclusionRouter** - Per-envelope relay decision between gateways
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Bridge    │────▶│     Bus     │◀───▶│   Gateway   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                                                │
//!                                                ▼
//!                                         ┌─────────────┐
//!                                         │   Router    │──▶ other gateways
//!                                         └─────────────┘
//! ```

pub mod bus;
pub mod exclusion;
pub mod router;
pub mod topic;

pub use bus::{Bus, BusError, BusStats, Subscriber, Subscription, SubscriptionScope, SuppressGuard};
pub use exclusion::{ExclusionSet, DEFAULT_EXCLUSION_CAPACITY};
pub use router::{ExclusionRouter, LinkId, Relay, RouterConfig, RouterError, RouterStats};
pub use topic::{Topic, TopicId};
