/// `scripting/menu.rs` - config and context-menu scripts
///
/// `config/init.lua` returns a table of settings; `config/context_menu.lua`
/// returns the tray menu tree. Both run as logical threads on the shared VM
/// and their results cross the boundary as JSON trees.
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::PoisonError;

use mlua::{MultiValue, Value};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value as Tree;

use super::bridge::{tree_to_lua, value_to_tree};
use super::engine::ScriptEngine;
use super::jail::{anchor_at, Jail};
use super::scheduler::{Entry, ThreadId};
use crate::config::{CONFIG_SCRIPT, CONTEXT_MENU_SCRIPT};
use crate::error::{ScriptError, ScriptResult};

/// Label that renders as a separator line.
pub const SEPARATOR: &str = "-";

#[derive(Debug, Clone, PartialEq)]
pub enum MenuItem {
    Separator,
    Entry {
        name: String,
        disabled: bool,
        children: Vec<MenuItem>,
    },
}

/// Same shape the scripts return: separators as `"-"`, entries as objects.
impl Serialize for MenuItem {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            MenuItem::Separator => serializer.serialize_str(SEPARATOR),
            MenuItem::Entry {
                name,
                disabled,
                children,
            } => {
                let mut map = serializer.serialize_map(None)?;
                map.serialize_entry("name", name)?;
                if *disabled {
                    map.serialize_entry("disabled", disabled)?;
                }
                if !children.is_empty() {
                    map.serialize_entry("children", children)?;
                }
                map.end()
            }
        }
    }
}

impl MenuItem {
    pub fn entry(name: impl Into<String>) -> Self {
        MenuItem::Entry {
            name: name.into(),
            disabled: false,
            children: Vec::new(),
        }
    }
}

/// Tray UI side of the menu. Implementations must not call back into the engine.
pub trait MenuPresenter: Send + Sync {
    fn present(&self, items: &[MenuItem]);
}

/// Presenter for headless runs: logs the menu as JSON.
pub struct LogPresenter;

impl MenuPresenter for LogPresenter {
    fn present(&self, items: &[MenuItem]) {
        match serde_json::to_string(items) {
            Ok(json) => log::info!("menu updated: {json}"),
            Err(e) => log::warn!("menu updated but could not be rendered: {e}"),
        }
    }
}

// ── Script return shapes ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawMenuItem {
    Label(String),
    Node {
        name: String,
        #[serde(default)]
        disabled: bool,
        #[serde(default)]
        children: Vec<RawMenuItem>,
    },
}

impl From<RawMenuItem> for MenuItem {
    fn from(raw: RawMenuItem) -> Self {
        match raw {
            RawMenuItem::Label(s) if s == SEPARATOR => MenuItem::Separator,
            RawMenuItem::Label(name) => MenuItem::entry(name),
            RawMenuItem::Node {
                name,
                disabled,
                children,
            } => MenuItem::Entry {
                name,
                disabled,
                children: children.into_iter().map(MenuItem::from).collect(),
            },
        }
    }
}

/// Parses a context-menu return value. `{}` converts to `[]`, an empty menu.
pub fn parse_menu(tree: Tree) -> ScriptResult<Vec<MenuItem>> {
    match tree {
        Tree::Array(_) => {
            let raw: Vec<RawMenuItem> = serde_json::from_value(tree)
                .map_err(|e| ScriptError::ConfigLoad(format!("malformed menu: {e}")))?;
            Ok(raw.into_iter().map(MenuItem::from).collect())
        }
        Tree::Null => Err(ScriptError::ConfigLoad("menu script returned nothing".into())),
        other => Err(ScriptError::ConfigLoad(format!(
            "menu script must return a list, got {}",
            json_kind(&other)
        ))),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IoDirs {
    One(String),
    Many(Vec<String>),
}

impl Default for IoDirs {
    fn default() -> Self {
        IoDirs::Many(Vec::new())
    }
}

impl IoDirs {
    fn into_vec(self) -> Vec<String> {
        match self {
            IoDirs::One(dir) => vec![dir],
            IoDirs::Many(dirs) => dirs,
        }
    }
}

/// Settings returned by `config/init.lua`.
#[derive(Debug, Default, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    io_dirs: IoDirs,
    #[serde(flatten)]
    unknown: BTreeMap<String, Tree>,
}

impl ScriptConfig {
    pub fn from_tree(tree: Tree) -> ScriptResult<Self> {
        match tree {
            Tree::Null => Ok(Self::default()),
            Tree::Array(items) if items.is_empty() => Ok(Self::default()),
            Tree::Object(_) => serde_json::from_value(tree)
                .map_err(|e| ScriptError::ConfigLoad(format!("{CONFIG_SCRIPT}: {e}"))),
            other => Err(ScriptError::ConfigLoad(format!(
                "{CONFIG_SCRIPT} must return a table, got {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(tree: &Tree) -> &'static str {
    match tree {
        Tree::Null => "nil",
        Tree::Bool(_) => "boolean",
        Tree::Number(_) => "number",
        Tree::String(_) => "string",
        Tree::Array(_) => "list",
        Tree::Object(_) => "table",
    }
}

// ── Loader ────────────────────────────────────────────────────────────────────

impl ScriptEngine {
    /// Runs `config/init.lua` and adds its `io_dirs` to the JSON-IO roots.
    ///
    /// A missing file is not an error. Returns the number of roots added.
    pub fn load_config(&mut self) -> ScriptResult<usize> {
        let Some(values) = self.run_config_script(CONFIG_SCRIPT, MultiValue::new())? else {
            log::debug!("{CONFIG_SCRIPT} not found; using defaults");
            return Ok(0);
        };
        let tree = match values.front() {
            Some(v) => value_to_tree(v)?,
            None => Tree::Null,
        };
        let config = ScriptConfig::from_tree(tree)?;
        for key in config.unknown.keys() {
            log::debug!("{CONFIG_SCRIPT}: ignoring unknown key '{key}'");
        }

        let mut added = 0;
        let mut roots = self
            .bridge
            .json_roots
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        for dir in config.io_dirs.into_vec() {
            let path: PathBuf = anchor_at(&self.config.script_root, &dir)?;
            let before = roots.len();
            roots.insert(Jail::new(&path));
            if roots.len() > before {
                log::info!("json io root added: {}", path.display());
                added += 1;
            }
        }
        Ok(added)
    }

    /// Runs `config/context_menu.lua` with `trigger` and presents the result.
    ///
    /// Returns false, keeping the previous menu, when the script is missing,
    /// fails, or returns something that is not a menu.
    pub fn update_menu(&mut self, trigger: &str) -> bool {
        match self.build_menu(trigger) {
            Ok(Some(items)) => {
                self.presenter.present(&items);
                self.menu = Some(items);
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::warn!("menu update ({trigger}) failed, keeping previous menu: {e}");
                false
            }
        }
    }

    fn build_menu(&mut self, trigger: &str) -> ScriptResult<Option<Vec<MenuItem>>> {
        let args = MultiValue::from_vec(vec![Value::String(self.lua.create_string(trigger)?)]);
        let Some(values) = self.run_config_script(CONTEXT_MENU_SCRIPT, args)? else {
            log::debug!("{CONTEXT_MENU_SCRIPT} not found; no menu");
            return Ok(None);
        };
        let tree = match values.front() {
            Some(v) => value_to_tree(v)?,
            None => Tree::Null,
        };
        parse_menu(tree).map(Some)
    }

    /// Passes the clicked item's path to `menu.onclick` on a new thread.
    pub fn on_menu_clicked(&mut self, path: &[String]) -> Option<ThreadId> {
        let handler = self
            .lua
            .globals()
            .get::<mlua::Table>("menu")
            .and_then(|menu| menu.get::<Value>("onclick"));
        let function = match handler {
            Ok(Value::Function(f)) => f,
            _ => {
                log::info!("menu item {} clicked; no handler", path.join(" > "));
                return None;
            }
        };
        let arg = match tree_to_lua(&self.lua, &Tree::from(path.to_vec())) {
            Ok(arg) => arg,
            Err(e) => {
                log::error!("menu.onclick: cannot pass click path: {e}");
                return None;
            }
        };
        let entry = Entry::Function {
            label: "menu.onclick".into(),
            function,
        };
        match self.scheduler.spawn(entry, MultiValue::from_vec(vec![arg])) {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("menu.onclick: {e}");
                None
            }
        }
    }

    pub fn current_menu(&self) -> Option<&[MenuItem]> {
        self.menu.as_deref()
    }

    /// Loads `rel` from the script root and runs it to completion. `Ok(None)` when absent.
    fn run_config_script(&mut self, rel: &str, args: MultiValue) -> ScriptResult<Option<MultiValue>> {
        if !self.config.script_root.join(rel).is_file() {
            return Ok(None);
        }
        let function = self.load_script(rel)?;
        let values = self
            .scheduler
            .run(
                Entry::Function {
                    label: rel.to_string(),
                    function,
                },
                args,
            )
            .map_err(|e| ScriptError::ConfigLoad(format!("{rel}: {e}")))?;
        Ok(Some(values))
    }
}
