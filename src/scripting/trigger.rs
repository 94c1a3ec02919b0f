/// `scripting/trigger.rs` - events the host hands to the script worker
///
/// Protocol callbacks, the refresh timer and the tray UI all run on other
/// threads. They never touch the Lua VM; they enqueue a `HostEvent` and the
/// worker applies it on its next tick.
use crate::protocol::InboundMessage;
use crate::scripting::bridge::BoundaryValue;

#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    /// Spawn a thread running the global function `name`.
    Call { name: String, args: Vec<BoundaryValue> },
    /// Inbound protocol message, delivered to `receive(address, ...)`.
    Message(InboundMessage),
    /// The protocol layer published endpoint definitions; fires `ready()` once.
    EndpointsDiscovered,
    UpdateMenu { trigger: String },
    /// Names from the menu root down to the clicked item.
    MenuClicked { path: Vec<String> },
    Shutdown,
}

impl HostEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            HostEvent::Call { .. } => "call",
            HostEvent::Message(_) => "message",
            HostEvent::EndpointsDiscovered => "endpoints_discovered",
            HostEvent::UpdateMenu { .. } => "update_menu",
            HostEvent::MenuClicked { .. } => "menu_clicked",
            HostEvent::Shutdown => "shutdown",
        }
    }
}
