/// `scripting/engine.rs` - the shared Lua VM and everything that drives it
///
/// `ScriptEngine` owns the sandboxed VM, the thread scheduler and the host
/// bridge state. Exactly one worker holds it (see `worker.rs`); other threads
/// talk to it through `HostEvent`s.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use mlua::{Function, Lua, MultiValue, Value};

use super::api::{register_all, HostBridge};
use super::bridge::{push_args, BoundaryValue};
use super::jail::{Jail, JailSet};
use super::menu::{MenuItem, MenuPresenter};
use super::sandbox::{create_sandboxed_vm, install_gateway, load_jailed};
use super::scheduler::{Entry, Scheduler, ThreadId};
use super::trigger::HostEvent;
use crate::config::{HostConfig, ENTRY_SCRIPT};
use crate::error::{ScriptError, ScriptResult};
use crate::protocol::{InboundMessage, Outbound};

/// Global the protocol layer delivers inbound messages to.
const RECEIVE_HANDLER: &str = "receive";
/// Global called once when endpoints are first known.
const READY_HANDLER: &str = "ready";

pub struct ScriptEngine {
    pub(super) lua: Lua,
    pub(super) scheduler: Scheduler,
    pub(super) config: HostConfig,
    pub(super) bridge: HostBridge,
    pub(super) presenter: Arc<dyn MenuPresenter>,
    /// Last menu handed to the presenter.
    pub(super) menu: Option<Vec<MenuItem>>,
    script_jail: Jail,
    ready_fired: bool,
    inbox: VecDeque<HostEvent>,
}

impl ScriptEngine {
    /// Builds the environment. Any failure here is `HostFatal`.
    pub fn new(
        config: HostConfig,
        outbound: Arc<dyn Outbound>,
        presenter: Arc<dyn MenuPresenter>,
    ) -> ScriptResult<Self> {
        std::fs::create_dir_all(&config.io_root).map_err(|e| {
            ScriptError::HostFatal(format!("cannot create {}: {e}", config.io_root.display()))
        })?;

        let lua = create_sandboxed_vm(&config.policy)?;
        install_gateway(&lua, &config).map_err(ScriptError::host_fatal)?;

        let bridge = HostBridge {
            outbound,
            menu_requested: Arc::new(AtomicBool::new(false)),
            json_roots: Arc::new(RwLock::new(JailSet::new(vec![Jail::new(&config.io_root)]))),
        };
        register_all(&lua, bridge.clone()).map_err(ScriptError::host_fatal)?;

        log::info!(
            "script host ready: root={} policy={:?}",
            config.script_root.display(),
            config.policy
        );

        Ok(Self {
            scheduler: Scheduler::new(lua.clone()),
            script_jail: Jail::new(&config.script_root),
            lua,
            config,
            bridge,
            presenter,
            menu: None,
            ready_fired: false,
            inbox: VecDeque::new(),
        })
    }

    /// Runs `main.lua`, then the config script, then builds the first menu.
    /// Script failures are logged; none of them stop the host.
    pub fn start(&mut self) {
        if self.config.entry_script().is_file() {
            match self.load_script(ENTRY_SCRIPT) {
                Ok(function) => {
                    let entry = Entry::Function {
                        label: ENTRY_SCRIPT.into(),
                        function,
                    };
                    if let Err(e) = self.scheduler.spawn(entry, MultiValue::new()) {
                        log::error!("{ENTRY_SCRIPT}: {e}");
                    }
                }
                Err(e) => log::error!("{ENTRY_SCRIPT}: {e}"),
            }
        } else {
            log::warn!("no {} in {}", ENTRY_SCRIPT, self.config.script_root.display());
        }

        if let Err(e) = self.load_config() {
            log::warn!("{e}");
        }
        self.update_menu("startup");
    }

    /// Spawns a thread running the global function `name`.
    ///
    /// Returns `None` when `name` is not a function or the spawn failed.
    pub fn call(&mut self, name: &str, args: Vec<BoundaryValue>) -> Option<ThreadId> {
        let function = match self.lua.globals().get::<Value>(name) {
            Ok(Value::Function(f)) => f,
            Ok(Value::Nil) => {
                log::debug!("no global '{name}'; skipping call");
                return None;
            }
            Ok(other) => {
                log::warn!("global '{name}' is a {}, not a function", other.type_name());
                return None;
            }
            Err(e) => {
                log::error!("looking up '{name}': {e}");
                return None;
            }
        };
        self.spawn_function(name, function, args)
    }

    /// Delivers an inbound message as `receive(address, v1, v2, ...)`.
    pub fn on_message(&mut self, message: InboundMessage) -> Option<ThreadId> {
        let mut args = Vec::with_capacity(message.values.len() + 1);
        args.push(BoundaryValue::String(message.address));
        args.extend(message.values);
        self.call(RECEIVE_HANDLER, args)
    }

    /// Calls `ready()` the first time endpoints are discovered.
    pub fn on_endpoints_discovered(&mut self) -> Option<ThreadId> {
        if self.ready_fired {
            return None;
        }
        self.ready_fired = true;
        log::info!("endpoints discovered; calling {READY_HANDLER}()");
        self.call(READY_HANDLER, Vec::new())
    }

    pub fn enqueue(&mut self, event: HostEvent) {
        self.inbox.push_back(event);
    }

    /// Applies one event. Returns false for `Shutdown`.
    pub fn handle(&mut self, event: HostEvent) -> bool {
        log::trace!("host event: {}", event.kind());
        match event {
            HostEvent::Call { name, args } => {
                self.call(&name, args);
            }
            HostEvent::Message(message) => {
                self.on_message(message);
            }
            HostEvent::EndpointsDiscovered => {
                self.on_endpoints_discovered();
            }
            HostEvent::UpdateMenu { trigger } => {
                self.update_menu(&trigger);
            }
            HostEvent::MenuClicked { path } => {
                self.on_menu_clicked(&path);
            }
            HostEvent::Shutdown => return false,
        }
        true
    }

    pub fn tick(&mut self) -> bool {
        self.tick_at(Instant::now())
    }

    /// Drains queued events, resumes due threads, then rebuilds the menu if a
    /// script asked for it. Returns false once `Shutdown` was seen.
    pub fn tick_at(&mut self, now: Instant) -> bool {
        while let Some(event) = self.inbox.pop_front() {
            if !self.handle(event) {
                self.inbox.clear();
                return false;
            }
        }
        self.scheduler.tick_at(now);
        if self.bridge.menu_requested.swap(false, Ordering::AcqRel) {
            self.update_menu("script");
        }
        true
    }

    pub fn live_threads(&self) -> usize {
        self.scheduler.len()
    }

    pub(super) fn load_script(&self, rel: &str) -> ScriptResult<Function> {
        load_jailed(&self.lua, &self.script_jail, Some(rel), None)
    }

    fn spawn_function(
        &mut self,
        label: &str,
        function: Function,
        args: Vec<BoundaryValue>,
    ) -> Option<ThreadId> {
        let args = match push_args(&self.lua, args) {
            Ok(args) => args,
            Err(e) => {
                log::error!("{label}: cannot pass arguments: {e}");
                return None;
            }
        };
        let entry = Entry::Function {
            label: label.to_string(),
            function,
        };
        match self.scheduler.spawn(entry, args) {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("{label}: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::menu::MenuItem;
    use crate::scripting::test_support::{
        host_config, write_scripts, RecordingOutbound, RecordingPresenter, Sent,
    };
    use std::time::Duration;

    fn setup(
        files: &[(&str, &str)],
    ) -> (tempfile::TempDir, ScriptEngine, RecordingOutbound, RecordingPresenter) {
        let (dir, config) = host_config();
        write_scripts(&config.script_root, files);
        let outbound = RecordingOutbound::default();
        let presenter = RecordingPresenter::default();
        let engine = ScriptEngine::new(
            config,
            Arc::new(outbound.clone()),
            Arc::new(presenter.clone()),
        )
        .unwrap();
        (dir, engine, outbound, presenter)
    }

    const MAIN: &str = r#"
        function ready()
            ready_count = (ready_count or 0) + 1
            osc.send("/avatar/parameters/Ready", true)
        end

        function receive(address, value)
            last = address .. "=" .. tostring(value)
        end

        function toggle(name)
            osc.send("/avatar/parameters/" .. name, true)
            sleep(2)
            osc.send("/avatar/parameters/" .. name, false)
        end

        started = true
    "#;

    #[test]
    fn start_runs_main_and_builds_menu() {
        let (_dir, mut engine, _, presenter) = setup(&[
            ("main.lua", MAIN),
            ("config/context_menu.lua", "return { 'Toggle' }"),
        ]);
        engine.start();
        assert!(engine.lua.globals().get::<bool>("started").unwrap());
        assert_eq!(presenter.menus(), vec![vec![MenuItem::entry("Toggle")]]);
    }

    #[test]
    fn start_survives_broken_main() {
        let (_dir, mut engine, _, _) = setup(&[("main.lua", "this is not lua")]);
        engine.start();
        assert_eq!(engine.live_threads(), 0);
        assert!(engine.tick());
    }

    #[test]
    fn ready_fires_once() {
        let (_dir, mut engine, outbound, _) = setup(&[("main.lua", MAIN)]);
        engine.start();
        assert!(engine.on_endpoints_discovered().is_some());
        assert!(engine.on_endpoints_discovered().is_none());
        assert_eq!(engine.lua.globals().get::<i64>("ready_count").unwrap(), 1);
        assert_eq!(
            outbound.sent(),
            vec![Sent::Boolean("/avatar/parameters/Ready".into(), true)]
        );
    }

    #[test]
    fn messages_reach_receive() {
        let (_dir, mut engine, _, _) = setup(&[("main.lua", MAIN)]);
        engine.start();
        engine.on_message(InboundMessage {
            address: "/avatar/change".into(),
            values: vec![BoundaryValue::String("avtr_123".into())],
        });
        assert_eq!(
            engine.lua.globals().get::<String>("last").unwrap(),
            "/avatar/change=avtr_123"
        );
    }

    #[test]
    fn call_missing_global_is_skipped() {
        let (_dir, mut engine, _, _) = setup(&[]);
        engine.start();
        assert!(engine.call("nothing_here", vec![]).is_none());
        assert_eq!(engine.live_threads(), 0);
    }

    #[test]
    fn sleeping_call_completes_after_wake() {
        let (_dir, mut engine, outbound, _) = setup(&[("main.lua", MAIN)]);
        engine.start();
        engine.enqueue(HostEvent::Call {
            name: "toggle".into(),
            args: vec!["Hat".into()],
        });
        assert!(engine.tick());
        assert_eq!(engine.live_threads(), 1);
        assert_eq!(
            outbound.sent(),
            vec![Sent::Boolean("/avatar/parameters/Hat".into(), true)]
        );

        assert!(engine.tick_at(Instant::now() + Duration::from_secs(3)));
        assert_eq!(engine.live_threads(), 0);
        assert_eq!(outbound.sent().len(), 2);
    }

    #[test]
    fn menu_update_request_rebuilds_on_tick() {
        let (_dir, mut engine, _, presenter) = setup(&[
            ("main.lua", "function refresh() menu.update() end"),
            (
                "config/context_menu.lua",
                "local trigger = ... return { trigger }",
            ),
        ]);
        engine.start();
        engine.call("refresh", vec![]);
        assert!(engine.tick());
        let menus = presenter.menus();
        assert_eq!(menus.len(), 2);
        assert_eq!(menus[1], vec![MenuItem::entry("script")]);
    }

    #[test]
    fn shutdown_stops_ticking() {
        let (_dir, mut engine, _, _) = setup(&[]);
        engine.enqueue(HostEvent::Shutdown);
        engine.enqueue(HostEvent::UpdateMenu {
            trigger: "late".into(),
        });
        assert!(!engine.tick());
        assert!(engine.tick());
    }

    #[test]
    fn script_errors_leave_engine_running() {
        let (_dir, mut engine, outbound, _) = setup(&[(
            "main.lua",
            "function explode() error('kaboom') end function fine() osc.send('/ok') end",
        )]);
        engine.start();
        engine.call("explode", vec![]);
        engine.call("fine", vec![]);
        assert!(engine.tick());
        assert_eq!(engine.live_threads(), 0);
        assert_eq!(outbound.sent(), vec![Sent::Nil("/ok".into())]);
    }
}
