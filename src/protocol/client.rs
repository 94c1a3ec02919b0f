/// `protocol/client.rs` - outbound side of the OSC collaborator
///
/// The script host only sees the `Outbound` trait. `ChannelOutbound` is the
/// production adaptor: it resolves numeric wire types against the endpoint
/// registry and hands finished messages to the transport task over a channel.
use tokio::sync::mpsc;

use super::types::{resolve_number, EndpointRegistry, OscArg, OutboundMessage};

/// Typed sends accepted by the protocol layer. Errors are human-readable and
/// are returned to the calling script unchanged.
pub trait Outbound: Send + Sync {
    fn send_boolean(&self, address: &str, value: bool) -> Result<(), String>;
    fn send_number(&self, address: &str, value: f64) -> Result<(), String>;
    fn send_string(&self, address: &str, value: &str) -> Result<(), String>;
    fn send_nil(&self, address: &str) -> Result<(), String>;
}

#[derive(Clone)]
pub struct ChannelOutbound {
    endpoints: EndpointRegistry,
    tx: mpsc::UnboundedSender<OutboundMessage>,
}

impl ChannelOutbound {
    pub fn new(endpoints: EndpointRegistry, tx: mpsc::UnboundedSender<OutboundMessage>) -> Self {
        Self { endpoints, tx }
    }

    fn push(&self, address: &str, arg: OscArg) -> Result<(), String> {
        self.tx
            .send(OutboundMessage {
                address: address.to_string(),
                arg,
            })
            .map_err(|_| "not connected".to_string())
    }
}

impl Outbound for ChannelOutbound {
    fn send_boolean(&self, address: &str, value: bool) -> Result<(), String> {
        self.push(address, OscArg::Bool(value))
    }

    fn send_number(&self, address: &str, value: f64) -> Result<(), String> {
        let arg = resolve_number(address, value, self.endpoints.get(address))?;
        self.push(address, arg)
    }

    fn send_string(&self, address: &str, value: &str) -> Result<(), String> {
        self.push(address, OscArg::String(value.to_string()))
    }

    fn send_nil(&self, address: &str) -> Result<(), String> {
        self.push(address, OscArg::Nil)
    }
}
