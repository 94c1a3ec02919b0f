/// `scripting/api.rs` - registers the host bridge globals
///
/// Provides the script-facing API on top of the sandboxed VM:
///   osc.send, menu.update, menu.onclick, sleep, json
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use mlua::{Function, Lua, MultiValue, Result as LuaResult, Value};

use super::bridge::{dispatch_send, tree_to_lua, value_to_tree, BoundaryValue};
use super::jail::JailSet;
use super::scheduler::sleep_marker;
use crate::error::{ScriptError, ScriptResult};
use crate::protocol::Outbound;

/// Host-side state the API closures share with the engine.
#[derive(Clone)]
pub struct HostBridge {
    pub outbound: Arc<dyn Outbound>,
    /// Set by `menu.update()`; the engine rebuilds the menu on its next tick.
    pub menu_requested: Arc<AtomicBool>,
    /// Roots for `json.read` / `json.write`, extended by `config/init.lua`.
    pub json_roots: Arc<RwLock<JailSet>>,
}

pub fn register_all(lua: &Lua, bridge: HostBridge) -> LuaResult<()> {
    register_osc(lua, Arc::clone(&bridge.outbound))?;
    register_menu(lua, Arc::clone(&bridge.menu_requested))?;
    register_sleep(lua)?;
    register_json(lua, Arc::clone(&bridge.json_roots))?;
    Ok(())
}

// ── osc ───────────────────────────────────────────────────────────────────────

fn register_osc(lua: &Lua, outbound: Arc<dyn Outbound>) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    // osc.send(address, value?) -> true | false, message
    let send = lua.create_function(move |_, args: MultiValue| {
        let mut args = args.into_iter();
        let address = match args.next() {
            Some(Value::String(s)) => s.to_string_lossy(),
            Some(other) => {
                return Ok((false, Some(format!("address must be a string, got {}", other.type_name()))))
            }
            None => return Ok((false, Some("no address".to_string()))),
        };
        let values: Vec<BoundaryValue> = args.map(|v| BoundaryValue::from_lua_lossy(&v)).collect();
        match dispatch_send(outbound.as_ref(), &address, &values) {
            Ok(()) => Ok((true, None)),
            Err(message) => {
                log::debug!("[script] osc.send({address}) failed: {message}");
                Ok((false, Some(message)))
            }
        }
    })?;

    tbl.set("send", send)?;
    lua.globals().set("osc", tbl)?;
    Ok(())
}

// ── menu ──────────────────────────────────────────────────────────────────────

fn register_menu(lua: &Lua, requested: Arc<AtomicBool>) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    tbl.set(
        "update",
        lua.create_function(move |_, _: MultiValue| {
            requested.store(true, Ordering::Release);
            Ok(())
        })?,
    )?;
    // Default handler; scripts replace it by assigning menu.onclick.
    tbl.set(
        "onclick",
        lua.create_function(|_, path: Value| {
            log::info!("[script] menu item {} clicked; no handler", describe_path(&path));
            Ok(())
        })?,
    )?;

    lua.globals().set("menu", tbl)?;
    Ok(())
}

fn describe_path(path: &Value) -> String {
    match value_to_tree(path) {
        Ok(serde_json::Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
            .collect::<Vec<_>>()
            .join(" > "),
        Ok(other) => other.to_string(),
        Err(_) => path.type_name().to_string(),
    }
}

// ── sleep ─────────────────────────────────────────────────────────────────────

const SLEEP_SRC: &str = r#"
local yield, marker = coroutine.yield, ...
local type = type
return function(seconds)
    if type(seconds) ~= "number" then
        error("sleep expects a number of seconds", 2)
    end
    yield(marker, seconds)
end
"#;

fn register_sleep(lua: &Lua) -> LuaResult<()> {
    let sleep: Function = lua.load(SLEEP_SRC).set_name("=sleep").call(sleep_marker())?;
    lua.globals().set("sleep", sleep)
}

// ── json ──────────────────────────────────────────────────────────────────────

fn register_json(lua: &Lua, roots: Arc<RwLock<JailSet>>) -> LuaResult<()> {
    let tbl = lua.create_table()?;

    let read = {
        let roots = Arc::clone(&roots);
        lua.create_function(move |lua, path: String| {
            match json_read(lua, &roots, &path) {
                Ok(v) => Ok((v, None)),
                Err(e) => Ok((Value::Nil, Some(e.to_string()))),
            }
        })?
    };

    let write = lua.create_function(move |_, (path, value): (String, Value)| {
        match json_write(&roots, &path, &value) {
            Ok(()) => Ok((true, None)),
            Err(e) => Ok((false, Some(e.to_string()))),
        }
    })?;

    let encode = lua.create_function(|_, value: Value| {
        let text = value_to_tree(&value).map_err(ScriptError::from).and_then(|tree| {
            serde_json::to_string(&tree).map_err(|e| ScriptError::Marshal(e.to_string()))
        });
        match text {
            Ok(text) => Ok((Some(text), None)),
            Err(e) => Ok((None, Some(e.to_string()))),
        }
    })?;

    let decode = lua.create_function(|lua, text: String| {
        match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(tree) => Ok((tree_to_lua(lua, &tree)?, None)),
            Err(e) => Ok((Value::Nil, Some(format!("invalid json: {e}")))),
        }
    })?;

    tbl.set("read", read)?;
    tbl.set("write", write)?;
    tbl.set("encode", encode)?;
    tbl.set("decode", decode)?;
    lua.globals().set("json", tbl)?;
    Ok(())
}

fn json_read(lua: &Lua, roots: &RwLock<JailSet>, path: &str) -> ScriptResult<Value> {
    let resolved = roots.read().unwrap_or_else(PoisonError::into_inner).resolve(path)?;
    let text = std::fs::read_to_string(resolved)?;
    let tree: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| ScriptError::Marshal(format!("{path}: {e}")))?;
    Ok(tree_to_lua(lua, &tree)?)
}

fn json_write(roots: &RwLock<JailSet>, path: &str, value: &Value) -> ScriptResult<()> {
    let resolved = roots.read().unwrap_or_else(PoisonError::into_inner).resolve(path)?;
    let tree = value_to_tree(value)?;
    let text = serde_json::to_string_pretty(&tree).map_err(|e| ScriptError::Marshal(e.to_string()))?;
    std::fs::write(resolved, text)?;
    Ok(())
}
