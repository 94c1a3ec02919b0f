/// `scripting/` - sandboxed Lua host
///
/// One shared Lua 5.4 VM (mlua) runs every user script. Capability-sensitive
/// library entry points are jailed or gated, logical threads are scheduled
/// cooperatively, and all of it lives on a single worker thread. Script
/// errors are logged and never take the host down.
pub mod api;
pub mod bridge;
pub mod engine;
pub mod jail;
pub mod menu;
pub mod sandbox;
pub mod scheduler;
pub mod trigger;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;

pub use engine::ScriptEngine;
pub use menu::{LogPresenter, MenuItem, MenuPresenter};
pub use trigger::HostEvent;
pub use worker::{spawn_worker, HostHandle};
