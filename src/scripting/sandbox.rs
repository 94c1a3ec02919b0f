/// `scripting/sandbox.rs` - capability gateway for the shared Lua environment
///
/// The VM is created with a curated set of standard libraries. Entry points
/// that touch the host are then replaced: code loading is jailed to the
/// script root, file IO to `io_dir`, and the `package` table is exposed
/// read-only. Native code, process spawning and the debug library stay
/// unavailable unless their startup flag is set.
use std::path::Path;

use mlua::{ChunkMode, Function, Lua, LuaOptions, MultiValue, Result as LuaResult, StdLib, Table, Value};

use super::jail::Jail;
use crate::config::HostConfig;
use crate::error::{ScriptError, ScriptResult};

/// Standard `package.searchers` entries kept when C modules are denied
/// (preload and the Lua file searcher).
const LUA_SEARCHERS: usize = 2;

/// `package.path` templates, relative to the script root.
const MODULE_TEMPLATES: [&str; 2] = ["?.lua", "?/init.lua"];

/// Startup capability flags. All default to deny.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxPolicy {
    pub allow_native_library_loading: bool,
    pub allow_foreign_native_modules: bool,
    pub allow_unrestricted_io: bool,
    pub allow_process_execution: bool,
    pub allow_debug_introspection: bool,
}

impl SandboxPolicy {
    /// mlua refuses C modules and the debug library in safe mode.
    fn needs_unsafe_vm(&self) -> bool {
        self.allow_native_library_loading
            || self.allow_foreign_native_modules
            || self.allow_debug_introspection
    }
}

/// Creates the Lua VM with the library surface allowed by `policy`.
pub fn create_sandboxed_vm(policy: &SandboxPolicy) -> ScriptResult<Lua> {
    let mut libs = StdLib::COROUTINE
        | StdLib::TABLE
        | StdLib::STRING
        | StdLib::UTF8
        | StdLib::MATH
        | StdLib::IO
        | StdLib::OS
        | StdLib::PACKAGE;
    if policy.allow_debug_introspection {
        libs = libs | StdLib::DEBUG;
    }

    if policy.needs_unsafe_vm() {
        // SAFETY: only reachable when the operator enabled native code or
        // debug access on the command line.
        Ok(unsafe { Lua::unsafe_new_with(libs, LuaOptions::default()) })
    } else {
        Lua::new_with(libs, LuaOptions::default()).map_err(ScriptError::host_fatal)
    }
}

/// Replaces every capability-sensitive entry point in `lua`.
pub fn install_gateway(lua: &Lua, config: &HostConfig) -> LuaResult<()> {
    let policy = config.policy;
    install_print(lua)?;
    install_text_only_load(lua)?;
    install_jailed_loaders(lua, Jail::new(&config.script_root))?;
    install_io_guards(lua, &config.io_root, policy)?;
    install_process_gates(lua, policy)?;
    install_package_facade(lua, &config.script_root, policy)?;
    Ok(())
}

/// A stand-in that returns `nil, "capability denied: ..."` and does nothing else.
pub fn capability_denied(lua: &Lua, capability: &'static str) -> LuaResult<Function> {
    lua.create_function(move |_, _: MultiValue| {
        log::warn!("script attempted {capability}; denied by policy");
        let err = ScriptError::CapabilityDenied(capability.to_string());
        Ok((Value::Nil, err.to_string()))
    })
}

/// Loads a Lua source file from inside `jail` as a text chunk.
pub(crate) fn load_jailed(
    lua: &Lua,
    jail: &Jail,
    path: Option<&str>,
    env: Option<Table>,
) -> ScriptResult<Function> {
    let path = path.ok_or_else(|| {
        ScriptError::PolicyViolation("loading chunks from stdin is not permitted".into())
    })?;
    let resolved = jail.resolve(path)?;
    let mut source = std::fs::read_to_string(&resolved)?;
    if source.starts_with('#') {
        // Keep line numbers: blank out the shebang line only.
        let end = source.find('\n').unwrap_or(source.len());
        source.replace_range(..end, "");
    }
    let name = resolved
        .strip_prefix(jail.root())
        .unwrap_or(&resolved)
        .display()
        .to_string();
    let mut chunk = lua
        .load(source)
        .set_name(format!("@{name}"))
        .set_mode(ChunkMode::Text);
    if let Some(env) = env {
        chunk = chunk.set_environment(env);
    }
    Ok(chunk.into_function()?)
}

// ── print ─────────────────────────────────────────────────────────────────────

const PRINT_SRC: &str = r##"
local emit = ...
local tostring, select, concat = tostring, select, table.concat
return function(...)
    local parts = {}
    for i = 1, select("#", ...) do
        parts[i] = tostring((select(i, ...)))
    end
    emit(concat(parts, "\t"))
end
"##;

fn install_print(lua: &Lua) -> LuaResult<()> {
    let emit = lua.create_function(|_, line: String| {
        log::info!(target: "script", "{line}");
        Ok(())
    })?;
    let print: Function = lua.load(PRINT_SRC).set_name("=print").call(emit)?;
    lua.globals().set("print", print)
}

// ── code loading ──────────────────────────────────────────────────────────────

const TEXT_LOAD_SRC: &str = r##"
local load, select = load, select
return function(chunk, name, _, ...)
    if select("#", ...) > 0 then
        return load(chunk, name, "t", (...))
    end
    return load(chunk, name, "t")
end
"##;

const DOFILE_SRC: &str = r#"
local loadfile = ...
return function(path)
    local chunk, err = loadfile(path)
    if not chunk then
        return nil, err
    end
    return chunk()
end
"#;

/// `load` keeps working for source strings; precompiled bytecode is refused.
fn install_text_only_load(lua: &Lua) -> LuaResult<()> {
    let load: Function = lua.load(TEXT_LOAD_SRC).set_name("=load").eval()?;
    lua.globals().set("load", load)
}

fn install_jailed_loaders(lua: &Lua, jail: Jail) -> LuaResult<()> {
    let loadfile = lua.create_function(
        move |lua, (path, _mode, env): (Option<String>, Option<String>, Option<Table>)| {
            match load_jailed(lua, &jail, path.as_deref(), env) {
                Ok(f) => Ok((Value::Function(f), None)),
                Err(e) => {
                    log::warn!("loadfile refused: {e}");
                    Ok((Value::Nil, Some(e.to_string())))
                }
            }
        },
    )?;
    let dofile: Function = lua.load(DOFILE_SRC).set_name("=dofile").call(loadfile.clone())?;

    let globals = lua.globals();
    globals.set("loadfile", loadfile)?;
    globals.set("dofile", dofile)?;
    Ok(())
}

// ── io / os ───────────────────────────────────────────────────────────────────

const IO_GUARD_SRC: &str = r#"
local io, os, resolve, list = ...
local type, tostring = type, tostring

local function jailed(path)
    if type(path) == "number" then
        path = tostring(path)
    end
    if type(path) ~= "string" then
        return nil, "policy violation: path must be a string, got " .. type(path)
    end
    return resolve(path)
end

local function guard(f)
    return function(path, ...)
        local resolved, err = jailed(path)
        if not resolved then
            return nil, err
        end
        return f(resolved, ...)
    end
end

-- No argument, or an open file handle, selects the current default file.
local function guard_handle(f)
    local by_path = guard(f)
    return function(file, ...)
        if file == nil or type(file) == "userdata" then
            return f(file, ...)
        end
        return by_path(file, ...)
    end
end

io.open = guard(io.open)
io.lines = guard_handle(io.lines)
io.input = guard_handle(io.input)
io.output = guard_handle(io.output)
os.remove = guard(os.remove)

local rename = os.rename
os.rename = function(from, to)
    local src, err = jailed(from)
    if not src then
        return nil, err
    end
    local dst, err2 = jailed(to)
    if not dst then
        return nil, err2
    end
    return rename(src, dst)
end

io.list = list
"#;

fn resolve_io(jail: Option<&Jail>, path: &str) -> ScriptResult<String> {
    match jail {
        Some(jail) => Ok(jail.resolve(path)?.to_string_lossy().into_owned()),
        None => Ok(path.to_string()),
    }
}

fn list_dir(path: &str) -> ScriptResult<Vec<String>> {
    let mut names = std::fs::read_dir(path)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    names.sort();
    Ok(names)
}

fn install_io_guards(lua: &Lua, io_root: &Path, policy: SandboxPolicy) -> LuaResult<()> {
    let jail = (!policy.allow_unrestricted_io).then(|| Jail::new(io_root));

    let resolve = {
        let jail = jail.clone();
        lua.create_function(move |_, path: String| match resolve_io(jail.as_ref(), &path) {
            Ok(resolved) => Ok((Some(resolved), None)),
            Err(e) => {
                log::warn!("io access refused: {e}");
                Ok((None, Some(e.to_string())))
            }
        })?
    };

    let list = lua.create_function(move |lua, path: Option<String>| {
        let path = path.unwrap_or_else(|| ".".to_string());
        match resolve_io(jail.as_ref(), &path).and_then(|p| list_dir(&p)) {
            Ok(names) => Ok((Value::Table(lua.create_sequence_from(names)?), None)),
            Err(e) => Ok((Value::Nil, Some(e.to_string()))),
        }
    })?;

    let globals = lua.globals();
    let io: Table = globals.get("io")?;
    let os: Table = globals.get("os")?;
    lua.load(IO_GUARD_SRC)
        .set_name("=io_guard")
        .call::<()>((io, os, resolve, list))
}

fn install_process_gates(lua: &Lua, policy: SandboxPolicy) -> LuaResult<()> {
    let globals = lua.globals();
    let io: Table = globals.get("io")?;
    let os: Table = globals.get("os")?;
    if !policy.allow_process_execution {
        io.set("popen", capability_denied(lua, "process execution")?)?;
        os.set("execute", capability_denied(lua, "process execution")?)?;
    }
    if !policy.allow_unrestricted_io {
        os.set("tmpname", capability_denied(lua, "temporary files outside io_dir")?)?;
    }
    // Never allowed: scripts must not take the host down with them.
    os.set("exit", capability_denied(lua, "host termination")?)?;
    Ok(())
}

// ── package ───────────────────────────────────────────────────────────────────

const PACKAGE_FACADE_SRC: &str = r#"
local real = ...
local setmetatable, type, tostring, next, error = setmetatable, type, tostring, next, error
local proxies = setmetatable({}, { __mode = "k" })

local function readonly(t, name)
    local proxy = proxies[t]
    if proxy then
        return proxy
    end
    local function wrap(key, value)
        if type(value) == "table" then
            return readonly(value, name .. "." .. tostring(key))
        end
        return value
    end
    proxy = setmetatable({}, {
        __index = function(_, key)
            return wrap(key, t[key])
        end,
        __newindex = function(_, key)
            error("policy violation: " .. name .. "." .. tostring(key) .. " is read-only", 2)
        end,
        __pairs = function()
            return function(_, key)
                local k, v = next(t, key)
                return k, wrap(k, v)
            end, proxy, nil
        end,
        __len = function()
            return #t
        end,
        __metatable = false,
    })
    proxies[t] = proxy
    return proxy
end

return readonly(real, "package")
"#;

/// The Lua file searcher, minus bytecode: modules load through the same
/// jailed text-only path as `loadfile`.
fn jailed_searcher(lua: &Lua, jail: Jail) -> LuaResult<Function> {
    lua.create_function(move |lua, name: String| {
        let stem = name.replace('.', "/");
        let mut tried = String::new();
        for template in MODULE_TEMPLATES {
            let candidate = template.replace('?', &stem);
            if !jail.resolve(&candidate).is_ok_and(|p| p.is_file()) {
                tried.push_str(&format!("\n\tno file '{candidate}'"));
                continue;
            }
            return match load_jailed(lua, &jail, Some(&candidate), None) {
                Ok(loader) => {
                    let origin = lua.create_string(&candidate)?;
                    Ok((Value::Function(loader), Value::String(origin)))
                }
                Err(e) => {
                    log::warn!("require('{name}') refused: {e}");
                    let reason = format!("\n\tcannot load '{candidate}': {e}");
                    Ok((Value::String(lua.create_string(&reason)?), Value::Nil))
                }
            };
        }
        Ok((Value::String(lua.create_string(&tried)?), Value::Nil))
    })
}

fn install_package_facade(lua: &Lua, script_root: &Path, policy: SandboxPolicy) -> LuaResult<()> {
    let globals = lua.globals();
    let package: Table = globals.get("package")?;
    let jail = Jail::new(script_root);
    let root = jail.root().display().to_string();
    let path = MODULE_TEMPLATES
        .iter()
        .map(|template| format!("{root}/{template}"))
        .collect::<Vec<_>>()
        .join(";");
    package.set("path", path)?;
    // Slot 2 holds the stock Lua file searcher, which accepts bytecode.
    let searchers: Table = package.get("searchers")?;
    searchers.raw_set(2, jailed_searcher(lua, jail)?)?;

    if !policy.allow_native_library_loading {
        package.set("loadlib", capability_denied(lua, "native library loading")?)?;
    }
    if !policy.allow_foreign_native_modules {
        package.set("cpath", "")?;
        let mut len = searchers.raw_len();
        while len > LUA_SEARCHERS {
            searchers.raw_set(len, Value::Nil)?;
            len -= 1;
        }
    }

    let facade: Table = lua.load(PACKAGE_FACADE_SRC).set_name("=package").call(package)?;
    globals.set("package", facade)
}
