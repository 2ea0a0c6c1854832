//! The normalized shapes exchanged with the runtime loop.

use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// One HTTP request, already normalized from whichever event schema the
/// platform delivered (API Gateway v1/v2 or ALB).
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpRequestEvent {
    pub method: String,
    /// The full request target, as logged and handed to the worker.
    pub uri: String,
    pub path: String,
    pub query_string: String,
    pub protocol: String,
    pub server_name: String,
    pub server_port: u16,
    pub remote_port: u16,
    /// Lowercase header names to their values, in arrival order.
    pub headers: HashMap<String, Vec<String>>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// Whether the event format can carry repeated response headers.
    pub has_multi_header: bool,
    /// The event's opaque request context, passed to the worker verbatim.
    pub request_context: Value,
}

/// Invocation metadata from the platform, serialized wholesale into the
/// worker environment.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Context {
    pub aws_request_id: String,
    /// Absolute epoch-millis after which the platform may kill the sandbox.
    pub deadline_ms: u64,
    /// Whatever else the platform supplied; carried verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Context {
    /// Milliseconds left until the platform deadline.
    pub fn remaining_millis(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        self.deadline_ms.saturating_sub(now)
    }
}

/// A response header: one value, or the ordered list when the event format
/// supports repeats.
#[derive(Clone, Debug, Deserialize, Eq, From, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

/// What goes back to the platform.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, HeaderValue>,
    pub body: Vec<u8>,
}
