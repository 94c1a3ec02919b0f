/// `protocol/` - contract with the OSC discovery/transport layer
///
/// Discovery and the network transport live outside this crate. This module
/// only defines what they hand us (inbound messages, endpoint types) and what
/// we hand them (typed outbound sends).
pub mod client;
pub mod types;

pub use client::{ChannelOutbound, Outbound};
pub use types::{
    EndpointRegistry, EndpointType, InboundFrame, InboundMessage, OscArg, OutboundMessage,
};
