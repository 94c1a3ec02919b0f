/// `protocol/types.rs` - wire-level shapes exchanged with the OSC layer
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::scripting::bridge::BoundaryValue;

/// Type an endpoint declares in its discovery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    Int,
    Float,
    Double,
    Bool,
    String,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointType::Int => "int",
            EndpointType::Float => "float",
            EndpointType::Double => "double",
            EndpointType::Bool => "bool",
            EndpointType::String => "string",
        };
        f.write_str(s)
    }
}

/// One OSC argument as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OscArg {
    Nil,
    Bool(bool),
    Int(i32),
    Float(f32),
    Double(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundMessage {
    pub address: String,
    pub arg: OscArg,
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.arg {
            OscArg::Nil => write!(f, "{} (nil)", self.address),
            OscArg::Bool(b) => write!(f, "{} bool {b}", self.address),
            OscArg::Int(i) => write!(f, "{} int {i}", self.address),
            OscArg::Float(x) => write!(f, "{} float {x}", self.address),
            OscArg::Double(x) => write!(f, "{} double {x}", self.address),
            OscArg::String(s) => write!(f, "{} string {s:?}", self.address),
        }
    }
}

/// Encodes a script number for an endpoint of type `ty`.
///
/// Integers are rounded to nearest and saturate at the `i32` range.
pub fn resolve_number(address: &str, value: f64, ty: Option<EndpointType>) -> Result<OscArg, String> {
    match ty {
        Some(EndpointType::Int) => Ok(OscArg::Int(value.round() as i32)),
        Some(EndpointType::Float) => Ok(OscArg::Float(value as f32)),
        Some(EndpointType::Double) => Ok(OscArg::Double(value)),
        Some(other) => Err(format!("endpoint {address} expects {other}, not a number")),
        None => Err(format!("unknown endpoint type for {address}")),
    }
}

/// Declared endpoint types, shared between discovery and outbound sends.
#[derive(Debug, Clone, Default)]
pub struct EndpointRegistry {
    types: Arc<RwLock<HashMap<String, EndpointType>>>,
}

impl EndpointRegistry {
    pub fn get(&self, address: &str) -> Option<EndpointType> {
        self.types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .copied()
    }

    pub fn extend(&self, defs: impl IntoIterator<Item = (String, EndpointType)>) {
        self.types
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(defs);
    }

    pub fn len(&self) -> usize {
        self.types.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A message received from the protocol layer.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub address: String,
    pub values: Vec<BoundaryValue>,
}

/// One line of the demo stdin transport.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundFrame {
    Message {
        address: String,
        #[serde(default)]
        values: Vec<serde_json::Value>,
    },
    Endpoints {
        endpoints: HashMap<String, EndpointType>,
    },
    Click {
        click: Vec<String>,
    },
}

impl InboundFrame {
    pub fn into_message(address: String, values: Vec<serde_json::Value>) -> InboundMessage {
        InboundMessage {
            address,
            values: values.into_iter().map(BoundaryValue::from).collect(),
        }
    }
}
