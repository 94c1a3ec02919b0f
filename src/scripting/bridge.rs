/// `scripting/bridge.rs` - value marshaling between Rust and Lua
///
/// Primitive values cross the boundary as `BoundaryValue`. Tables cross as
/// JSON-like trees (`serde_json::Value`) for config and menu output. Values
/// with no counterpart degrade to nil with a warning instead of failing.
use std::collections::HashSet;

use mlua::{Lua, MultiValue, Result as LuaResult, Table, Value};
use serde_json::Value as Tree;

use crate::protocol::Outbound;

/// Nesting limit for table conversion. Deeper subtrees become null.
pub const MAX_TREE_DEPTH: usize = 64;

/// Subtables converted per call before the rest become null.
pub const MAX_TREE_NODES: usize = 100_000;

const SEND_ARITY_ERROR: &str = "not implemented: send() takes 1 or 2 arguments";

// ── Primitive values ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BoundaryValue {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// A value that has no boundary representation; carries its type name.
    Unsupported(String),
}

impl BoundaryValue {
    pub fn kind(&self) -> &str {
        match self {
            BoundaryValue::Nil => "nil",
            BoundaryValue::Boolean(_) => "boolean",
            BoundaryValue::Integer(_) => "integer",
            BoundaryValue::Float(_) => "float",
            BoundaryValue::String(_) => "string",
            BoundaryValue::Unsupported(name) => name,
        }
    }

    /// Reads a script value. Anything but nil/boolean/number/string comes
    /// back as `Unsupported` so the caller decides how to degrade.
    pub fn from_lua(value: &Value) -> Self {
        match value {
            Value::Nil => BoundaryValue::Nil,
            Value::Boolean(b) => BoundaryValue::Boolean(*b),
            Value::Integer(i) => BoundaryValue::Integer(*i),
            Value::Number(n) => BoundaryValue::Float(*n),
            Value::String(s) => BoundaryValue::String(s.to_string_lossy()),
            other => BoundaryValue::Unsupported(other.type_name().to_string()),
        }
    }

    /// Script-to-host conversion with the degrade-to-nil rule applied.
    pub fn from_lua_lossy(value: &Value) -> Self {
        match Self::from_lua(value) {
            BoundaryValue::Unsupported(kind) => {
                log::warn!("cannot pass a Lua {kind} to the host; using nil");
                BoundaryValue::Nil
            }
            v => v,
        }
    }

    pub fn into_lua(self, lua: &Lua) -> LuaResult<Value> {
        Ok(match self {
            BoundaryValue::Nil => Value::Nil,
            BoundaryValue::Boolean(b) => Value::Boolean(b),
            BoundaryValue::Integer(i) => Value::Integer(i),
            BoundaryValue::Float(n) => Value::Number(n),
            BoundaryValue::String(s) => Value::String(lua.create_string(&s)?),
            BoundaryValue::Unsupported(kind) => {
                log::warn!("cannot pass a host {kind} to Lua; using nil");
                Value::Nil
            }
        })
    }
}

impl From<&str> for BoundaryValue {
    fn from(s: &str) -> Self {
        BoundaryValue::String(s.to_string())
    }
}

impl From<String> for BoundaryValue {
    fn from(s: String) -> Self {
        BoundaryValue::String(s)
    }
}

impl From<bool> for BoundaryValue {
    fn from(b: bool) -> Self {
        BoundaryValue::Boolean(b)
    }
}

impl From<serde_json::Value> for BoundaryValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            Tree::Null => BoundaryValue::Nil,
            Tree::Bool(b) => BoundaryValue::Boolean(b),
            Tree::Number(n) => match n.as_i64() {
                Some(i) => BoundaryValue::Integer(i),
                None => BoundaryValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Tree::String(s) => BoundaryValue::String(s),
            Tree::Array(_) => BoundaryValue::Unsupported("array".into()),
            Tree::Object(_) => BoundaryValue::Unsupported("object".into()),
        }
    }
}

/// Pushes host values as call arguments, in order.
pub fn push_args(lua: &Lua, values: Vec<BoundaryValue>) -> LuaResult<MultiValue> {
    let values = values
        .into_iter()
        .map(|v| v.into_lua(lua))
        .collect::<LuaResult<Vec<_>>>()?;
    Ok(MultiValue::from_vec(values))
}

// ── send ──────────────────────────────────────────────────────────────────────

/// Routes `send(address, value?)` to the matching typed send.
///
/// `values` excludes the address. An explicit `nil` is treated as absent, and
/// a value with no wire form degrades to a nil send.
pub fn dispatch_send(
    outbound: &dyn Outbound,
    address: &str,
    values: &[BoundaryValue],
) -> Result<(), String> {
    match values {
        [] | [BoundaryValue::Nil] => outbound.send_nil(address),
        [BoundaryValue::Boolean(b)] => outbound.send_boolean(address, *b),
        [BoundaryValue::Integer(i)] => outbound.send_number(address, *i as f64),
        [BoundaryValue::Float(n)] => outbound.send_number(address, *n),
        [BoundaryValue::String(s)] => outbound.send_string(address, s),
        [BoundaryValue::Unsupported(kind)] => {
            log::warn!("cannot send a {kind} to {address}; sending nil");
            outbound.send_nil(address)
        }
        _ => Err(SEND_ARITY_ERROR.to_string()),
    }
}

// ── Structural conversion ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableShape {
    /// Keys are exactly `1..=n`.
    Array(usize),
    Map,
}

/// Array iff every key is a positive integer, the keys run contiguously from
/// 1, and the border length equals the entry count.
pub fn classify_table(table: &Table) -> LuaResult<TableShape> {
    let mut count = 0usize;
    let mut max = 0i64;
    for pair in table.clone().pairs::<Value, Value>() {
        let (key, _) = pair?;
        count += 1;
        match key {
            Value::Integer(n) if n >= 1 => max = max.max(n),
            _ => return Ok(TableShape::Map),
        }
    }
    if max as usize == count && table.raw_len() == count {
        Ok(TableShape::Array(count))
    } else {
        Ok(TableShape::Map)
    }
}

pub fn table_to_tree(table: &Table) -> LuaResult<Tree> {
    TreeBuilder::default().table(table, 0)
}

/// Converts any script value; functions, threads and userdata become null.
pub fn value_to_tree(value: &Value) -> LuaResult<Tree> {
    TreeBuilder::default().value(value, 0)
}

/// Walk state for one conversion. `path` holds the tables currently being
/// converted, so a table that contains itself is cut rather than re-entered.
/// `nodes` bounds the total work when one table is shared many times.
#[derive(Default)]
struct TreeBuilder {
    path: HashSet<usize>,
    nodes: usize,
    exhausted: bool,
}

impl TreeBuilder {
    fn value(&mut self, value: &Value, depth: usize) -> LuaResult<Tree> {
        Ok(match value {
            Value::Nil => Tree::Null,
            Value::Boolean(b) => Tree::Bool(*b),
            Value::Integer(i) => Tree::from(*i),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(Tree::Number)
                .unwrap_or(Tree::Null),
            Value::String(s) => Tree::String(s.to_string_lossy()),
            Value::Table(t) => self.table(t, depth + 1)?,
            _ => Tree::Null,
        })
    }

    fn table(&mut self, table: &Table, depth: usize) -> LuaResult<Tree> {
        if depth >= MAX_TREE_DEPTH {
            log::warn!("table nesting exceeds {MAX_TREE_DEPTH} levels; truncated to null");
            return Ok(Tree::Null);
        }
        self.nodes += 1;
        if self.nodes > MAX_TREE_NODES {
            if !self.exhausted {
                log::warn!(
                    "table holds more than {MAX_TREE_NODES} subtables; rest truncated to null"
                );
                self.exhausted = true;
            }
            return Ok(Tree::Null);
        }
        let id = table.to_pointer() as usize;
        if !self.path.insert(id) {
            log::warn!("table refers to itself; cycle truncated to null");
            return Ok(Tree::Null);
        }
        let tree = self.entries(table, depth);
        self.path.remove(&id);
        tree
    }

    fn entries(&mut self, table: &Table, depth: usize) -> LuaResult<Tree> {
        match classify_table(table)? {
            TableShape::Array(len) => {
                let mut items = Vec::with_capacity(len);
                for i in 1..=len {
                    let v: Value = table.raw_get(i)?;
                    items.push(self.value(&v, depth)?);
                }
                Ok(Tree::Array(items))
            }
            TableShape::Map => {
                let mut map = serde_json::Map::new();
                for pair in table.clone().pairs::<Value, Value>() {
                    let (k, v) = pair?;
                    let Some(key) = key_to_string(&k) else {
                        log::warn!("skipping table key of type {}", k.type_name());
                        continue;
                    };
                    map.insert(key, self.value(&v, depth)?);
                }
                Ok(Tree::Object(map))
            }
        }
    }
}

fn key_to_string(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.to_string_lossy()),
        Value::Integer(i) => Some(i.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Boolean(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Builds script values from a tree. Arrays become 1-based sequences.
pub fn tree_to_lua(lua: &Lua, tree: &Tree) -> LuaResult<Value> {
    tree_to_lua_at(lua, tree, 0)
}

fn tree_to_lua_at(lua: &Lua, tree: &Tree, depth: usize) -> LuaResult<Value> {
    if depth >= MAX_TREE_DEPTH {
        return Err(mlua::Error::runtime(format!(
            "tree nesting exceeds {MAX_TREE_DEPTH} levels"
        )));
    }
    match tree {
        Tree::Null => Ok(Value::Nil),
        Tree::Bool(b) => Ok(Value::Boolean(*b)),
        Tree::Number(n) => match n.as_i64() {
            Some(i) => Ok(Value::Integer(i)),
            None => Ok(Value::Number(n.as_f64().unwrap_or(0.0))),
        },
        Tree::String(s) => Ok(Value::String(lua.create_string(s)?)),
        Tree::Array(items) => {
            let t = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, v) in items.iter().enumerate() {
                t.raw_set(i + 1, tree_to_lua_at(lua, v, depth + 1)?)?;
            }
            Ok(Value::Table(t))
        }
        Tree::Object(obj) => {
            let t = lua.create_table_with_capacity(0, obj.len())?;
            for (k, v) in obj {
                t.raw_set(k.as_str(), tree_to_lua_at(lua, v, depth + 1)?)?;
            }
            Ok(Value::Table(t))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::test_support::{RecordingOutbound, Sent};
    use serde_json::json;

    fn tree_of(src: &str) -> Tree {
        let lua = Lua::new();
        let t: Table = lua.load(src).eval().unwrap();
        table_to_tree(&t).unwrap()
    }

    #[test]
    fn sequence_becomes_array() {
        assert_eq!(tree_of("return {1, 2, 3}"), json!([1, 2, 3]));
    }

    #[test]
    fn string_keys_become_object() {
        assert_eq!(tree_of("return {a = 1, b = 2}"), json!({"a": 1, "b": 2}));
    }

    #[test]
    fn gap_forces_object() {
        assert_eq!(
            tree_of("return {1, 2, nil, 4}"),
            json!({"1": 1, "2": 2, "4": 4})
        );
    }

    #[test]
    fn sequence_not_starting_at_one_is_object() {
        assert_eq!(tree_of("return {[2] = 'b', [3] = 'c'}"), json!({"2": "b", "3": "c"}));
    }

    #[test]
    fn mixed_keys_are_stringified() {
        assert_eq!(
            tree_of("return {'x', flag = true, [true] = 'yes', [1.5] = 'half'}"),
            json!({"1": "x", "flag": true, "true": "yes", "1.5": "half"})
        );
    }

    #[test]
    fn empty_table_is_empty_array() {
        assert_eq!(tree_of("return {}"), json!([]));
    }

    #[test]
    fn nested_tables_convert_recursively() {
        assert_eq!(
            tree_of("return {name = 'Hats', children = {'Cap', {name = 'Beanie', disabled = true}}}"),
            json!({"name": "Hats", "children": ["Cap", {"name": "Beanie", "disabled": true}]})
        );
    }

    #[test]
    fn functions_and_threads_become_null() {
        assert_eq!(
            tree_of("return {f = print, co = coroutine.create(function() end), n = 1}"),
            json!({"f": null, "co": null, "n": 1})
        );
    }

    #[test]
    fn self_references_become_null() {
        assert_eq!(
            tree_of("local t = {} t.a = t t.b = t return t"),
            json!({"a": null, "b": null})
        );
        assert_eq!(
            tree_of("local t = {n = 1} t.kids = {t, {up = t}} return t"),
            json!({"n": 1, "kids": [null, {"up": null}]})
        );
    }

    #[test]
    fn shared_subtables_are_converted_each_time() {
        assert_eq!(
            tree_of("local s = {1} return {a = s, b = s}"),
            json!({"a": [1], "b": [1]})
        );
    }

    #[test]
    fn widely_shared_tables_stop_at_node_budget() {
        // Each level holds the previous one twice: 2^40 paths without a budget.
        let tree = tree_of("local t = {} for _ = 1, 40 do t = {a = t, b = t} end return t");
        assert!(tree.to_string().contains("null"));
    }

    #[test]
    fn deep_nesting_is_cut_by_depth_guard() {
        let tree = tree_of("local t = {} for _ = 1, 100 do t = {me = t} end return t");
        let mut depth = 0;
        let mut node = &tree;
        while let Some(next) = node.get("me") {
            depth += 1;
            node = next;
        }
        assert!(node.is_null());
        assert_eq!(depth, MAX_TREE_DEPTH);
    }

    #[test]
    fn non_finite_numbers_become_null() {
        assert_eq!(tree_of("return {0/0}"), json!([null]));
    }

    #[test]
    fn tree_to_lua_round_trips_through_table() {
        let lua = Lua::new();
        let tree = json!({"path": ["Outfits", "Casual"], "count": 2, "ratio": 0.5, "on": false});
        let value = tree_to_lua(&lua, &tree).unwrap();
        let Value::Table(t) = value else { panic!("expected table") };
        assert_eq!(table_to_tree(&t).unwrap(), tree);
    }

    #[test]
    fn unsupported_values_degrade_to_nil() {
        let lua = Lua::new();
        let f: Value = lua.load("return print").eval().unwrap();
        assert_eq!(BoundaryValue::from_lua(&f), BoundaryValue::Unsupported("function".into()));
        assert_eq!(BoundaryValue::from_lua_lossy(&f), BoundaryValue::Nil);
        let v = BoundaryValue::Unsupported("blob".into()).into_lua(&lua).unwrap();
        assert!(v.is_nil());
    }

    #[test]
    fn primitives_cross_both_ways() {
        let lua = Lua::new();
        let args = push_args(
            &lua,
            vec![
                BoundaryValue::Integer(3),
                BoundaryValue::Float(0.5),
                "hi".into(),
                true.into(),
                BoundaryValue::Nil,
            ],
        )
        .unwrap();
        let back: Vec<BoundaryValue> = args.into_iter().map(|v| BoundaryValue::from_lua(&v)).collect();
        assert_eq!(
            back,
            vec![
                BoundaryValue::Integer(3),
                BoundaryValue::Float(0.5),
                BoundaryValue::String("hi".into()),
                BoundaryValue::Boolean(true),
                BoundaryValue::Nil,
            ]
        );
    }

    #[test]
    fn send_dispatches_by_kind() {
        let out = RecordingOutbound::default();
        dispatch_send(&out, "/a", &[]).unwrap();
        dispatch_send(&out, "/b", &[true.into()]).unwrap();
        dispatch_send(&out, "/c", &[BoundaryValue::Float(1.5)]).unwrap();
        dispatch_send(&out, "/d", &["avtr".into()]).unwrap();
        dispatch_send(&out, "/e", &[BoundaryValue::Integer(2)]).unwrap();
        assert_eq!(
            out.sent(),
            vec![
                Sent::Nil("/a".into()),
                Sent::Boolean("/b".into(), true),
                Sent::Number("/c".into(), 1.5),
                Sent::String("/d".into(), "avtr".into()),
                Sent::Number("/e".into(), 2.0),
            ]
        );
    }

    #[test]
    fn send_rejects_two_values() {
        let out = RecordingOutbound::default();
        assert_eq!(
            dispatch_send(&out, "/a", &[true.into(), false.into()]),
            Err(SEND_ARITY_ERROR.to_string())
        );
        assert!(out.sent().is_empty());
    }

    #[test]
    fn unsupported_send_value_degrades_to_nil_send() {
        let out = RecordingOutbound::default();
        dispatch_send(&out, "/a", &[BoundaryValue::Unsupported("table".into())]).unwrap();
        assert_eq!(out.sent(), vec![Sent::Nil("/a".into())]);
    }

    #[test]
    fn numeric_send_error_is_passed_through() {
        let out = RecordingOutbound::rejecting_numbers();
        let err = dispatch_send(&out, "/avatar/x", &[BoundaryValue::Float(1.5)]).unwrap_err();
        assert!(err.contains("unknown endpoint type"), "{err}");
    }
}
