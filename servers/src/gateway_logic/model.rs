use serde::{Deserialize, Serialize};
use serde_json::Value;

/// `{"id": 3, "command": "getState", "args": ["hm-rpc.0.temp"]}`
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<u64>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerFrame {
    /// `args` is `[error, ...results]`.
    Reply { id: Option<u64>, args: Vec<Value> },
    Event { event: String, args: Vec<Value> },
}
