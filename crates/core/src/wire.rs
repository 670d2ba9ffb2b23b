use jsonrpc_core::Error;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LeashError, LeashResult};

pub const JSONRPC_VERSION: &str = "2.0";

/// Outbound JSON-RPC request (subscribe or unsubscribe).
#[derive(Debug, Clone, Serialize)]
pub struct WireRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl WireRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }

    pub fn unsubscribe(id: u64, method: impl Into<String>, wire_id: u64) -> Self {
        Self::new(id, method, Value::Array(vec![wire_id.into()]))
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).expect("wire request serialization is infallible")
    }
}

/// A frame received from the server, classified.
#[derive(Debug)]
pub enum InboundFrame {
    /// Response to a request we issued: the subscribe/unsubscribe ack path.
    Response {
        id: u64,
        result: Result<Value, Error>,
    },
    /// Server push: `<x>Notification` with `params.{subscription, result}`.
    Notification {
        method: String,
        subscription: u64,
        payload: Value,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Error>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

pub fn parse_frame(raw: &str) -> LeashResult<InboundFrame> {
    let frame: RawFrame = serde_json::from_str(raw).map_err(LeashError::protocol)?;

    if let (Some(method), Some(params)) = (frame.method, frame.params) {
        let subscription = params
            .get("subscription")
            .and_then(Value::as_u64)
            .ok_or_else(|| LeashError::protocol(format!("{method} without subscription id")))?;
        let payload = params
            .get("result")
            .cloned()
            .ok_or_else(|| LeashError::protocol(format!("{method} without result")))?;
        return Ok(InboundFrame::Notification {
            method,
            subscription,
            payload,
        });
    }

    if let Some(id) = frame.id {
        let result = match (frame.result, frame.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => {
                return Err(LeashError::protocol(format!(
                    "response {id} carries neither result nor error"
                )));
            }
        };
        return Ok(InboundFrame::Response { id, result });
    }

    Err(LeashError::protocol("frame is neither response nor notification"))
}
