/// `config.rs` - startup configuration
///
/// Everything here is fixed before the script host starts; scripts can only
/// extend the JSON-IO roots (see `scripting::menu`).
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;

use crate::error::{ScriptError, ScriptResult};
use crate::scripting::sandbox::SandboxPolicy;

pub const ENTRY_SCRIPT: &str = "main.lua";
pub const CONFIG_SCRIPT: &str = "config/init.lua";
pub const CONTEXT_MENU_SCRIPT: &str = "config/context_menu.lua";
pub const IO_DIR: &str = "io_dir";

const DEFAULT_TICK_MS: u64 = 100;
const DEFAULT_REFRESH_SECS: u64 = 5;

/// OSC Wardrobe - runs user Lua scripts against OSC endpoints
#[derive(Debug, Parser)]
#[command(name = "osc-wardrobe", version, about, long_about = None)]
pub struct Cli {
    /// Directory holding main.lua and config/
    #[arg(long, default_value = "lua")]
    pub script_root: PathBuf,

    /// Scheduler tick interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_TICK_MS)]
    pub tick_interval_ms: u64,

    /// Interval between periodic menu refreshes, in seconds
    #[arg(long, default_value_t = DEFAULT_REFRESH_SECS)]
    pub refresh_interval_secs: u64,

    /// Allow package.loadlib
    #[arg(long)]
    pub allow_native_library_loading: bool,

    /// Allow require() to load C modules
    #[arg(long)]
    pub allow_foreign_native_modules: bool,

    /// Disable the io_dir jail for io.* and os.remove/rename
    #[arg(long)]
    pub allow_unrestricted_io: bool,

    /// Allow io.popen and os.execute
    #[arg(long)]
    pub allow_process_execution: bool,

    /// Load the debug library
    #[arg(long)]
    pub allow_debug_introspection: bool,
}

impl Cli {
    pub fn policy(&self) -> SandboxPolicy {
        SandboxPolicy {
            allow_native_library_loading: self.allow_native_library_loading,
            allow_foreign_native_modules: self.allow_foreign_native_modules,
            allow_unrestricted_io: self.allow_unrestricted_io,
            allow_process_execution: self.allow_process_execution,
            allow_debug_introspection: self.allow_debug_introspection,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    pub script_root: PathBuf,
    pub io_root: PathBuf,
    pub policy: SandboxPolicy,
    pub tick_interval: Duration,
    pub refresh_interval: Duration,
}

impl HostConfig {
    /// Defaults around `script_root`: deny-all policy, 100 ms ticks.
    pub fn new(script_root: impl AsRef<Path>) -> Self {
        let script_root = script_root.as_ref().to_path_buf();
        Self {
            io_root: script_root.join(IO_DIR),
            script_root,
            policy: SandboxPolicy::default(),
            tick_interval: Duration::from_millis(DEFAULT_TICK_MS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECS),
        }
    }

    /// Resolves the CLI into absolute roots and creates them if missing.
    pub fn from_cli(cli: &Cli) -> ScriptResult<Self> {
        let script_root = if cli.script_root.is_absolute() {
            cli.script_root.clone()
        } else {
            std::env::current_dir()?.join(&cli.script_root)
        };
        let mut config = Self::new(&script_root);
        config.policy = cli.policy();
        config.tick_interval = Duration::from_millis(cli.tick_interval_ms.max(1));
        config.refresh_interval = Duration::from_secs(cli.refresh_interval_secs.max(1));

        std::fs::create_dir_all(&config.io_root).map_err(|e| {
            ScriptError::HostFatal(format!("cannot create {}: {e}", config.io_root.display()))
        })?;
        Ok(config)
    }

    pub fn entry_script(&self) -> PathBuf {
        self.script_root.join(ENTRY_SCRIPT)
    }
}
