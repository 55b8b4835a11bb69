//! Spine: brokerless RPC and pub/sub for processes on one local network.
//!
//! Processes find each other through service advertisement instead of
//! static configuration: a service or topic is announced under a name, and
//! any peer in the same namespace can look it up and call or subscribe.
//!
//! ## Architecture
//!
//! - **Namespace**: name, payload security, registry and cancellation scope
//! - **Registry**: expiring cache of discovered endpoints, fed by a
//!   [`DiscoveryTransport`]
//! - **Listener / Service**: bounded-concurrency TCP server running one
//!   handler call per connection
//! - **call / ServiceCaller**: one authenticated request/response round trip
//! - **Publisher / Subscriber**: framed fan-out over long-lived connections
//!
//! Every message on the wire is a 5-byte header (status byte, big-endian
//! payload length) followed by a sealed payload.

pub mod auth;
pub mod caller;
pub mod codec;
pub mod discovery;
pub mod frame;
pub mod header;
pub mod listener;
#[cfg(feature = "mdns")]
pub mod mdns;
pub mod namespace;
pub mod outbox;
pub mod publisher;
pub mod registry;
pub mod service;
pub mod subscriber;

pub use auth::Security;
pub use caller::{call, call_with_codec, ServiceCaller};
pub use codec::{Codec, JsonCodec, Layout, MsgPackCodec};
pub use discovery::{Advertisement, DiscoveryEvent, DiscoveryTransport, LocalDiscovery};
pub use frame::{read_frame, write_frame, Frame};
pub use header::{decode_header, encode_header, Header, Status, HEADER_LENGTH};
pub use listener::{Listener, ListenerOptions, ServiceHandler, WorkerSlot};
#[cfg(feature = "mdns")]
pub use mdns::MdnsDiscovery;
pub use namespace::Namespace;
pub use publisher::Publisher;
pub use registry::{Registry, ServiceRecord};
pub use service::Service;
pub use spine_types::{SpineConfig, SpineError, SpineResult, Stage};
pub use subscriber::{Subscriber, SubscriberOptions};
