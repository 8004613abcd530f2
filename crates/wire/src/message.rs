//! The wire envelope shared by every channel encoding.
//!
//! Administrative traffic (stop/query/status) and application data travel
//! over the same channel. The envelope is a tagged union decoded exactly once
//! at the channel boundary; everything past the channel works with [`Message`]
//! values and never re-sniffs wire shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Generic-map key recognized as a stop request.
pub(crate) const STOP_KEY: &str = "_stop_";
/// Generic-map key recognized as a query request.
pub(crate) const QUERY_KEY: &str = "_query_";
/// Generic-map key recognized as a status reply.
pub(crate) const STATUS_KEY: &str = "_status_";

/// One message on a worker channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    /// Request to stop listening, authorized by `cookie`.
    Stop {
        #[serde(default)]
        cookie: Option<String>,
    },
    /// Request for a status reply, authorized by `cookie`.
    Query {
        #[serde(default)]
        cookie: Option<String>,
    },
    /// Status reply payload (see the status value types in the main crate).
    Status { status: Value },
    /// Application payload; opaque to the runtime.
    Data { payload: Value },
}

impl Message {
    pub fn stop(cookie: Option<String>) -> Self {
        Message::Stop { cookie }
    }

    pub fn query(cookie: Option<String>) -> Self {
        Message::Query { cookie }
    }

    pub fn status(status: Value) -> Self {
        Message::Status { status }
    }

    pub fn data(payload: impl Into<Value>) -> Self {
        Message::Data {
            payload: payload.into(),
        }
    }

    /// The application payload, if this is a data message.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Message::Data { payload } => Some(payload),
            _ => None,
        }
    }

    /// Render into the generic structured form used by the lines encoding:
    /// admin messages become single-key maps, data passes through verbatim.
    pub(crate) fn into_generic(self) -> Value {
        fn single_key(key: &str, value: Value) -> Value {
            let mut map = serde_json::Map::with_capacity(1);
            map.insert(key.to_owned(), value);
            Value::Object(map)
        }

        match self {
            Message::Stop { cookie } => {
                single_key(STOP_KEY, cookie.map(Value::String).unwrap_or(Value::Null))
            }
            Message::Query { cookie } => {
                single_key(QUERY_KEY, cookie.map(Value::String).unwrap_or(Value::Null))
            }
            Message::Status { status } => single_key(STATUS_KEY, status),
            Message::Data { payload } => payload,
        }
    }

    /// Classify a raw structured value received over the lines encoding.
    ///
    /// An object carrying one of the recognized admin keys is decoded as that
    /// admin kind; anything else is application data. A non-string cookie
    /// value is carried as absent (it can never match a configured cookie).
    pub(crate) fn from_generic(value: Value) -> Self {
        if let Some(map) = value.as_object() {
            if let Some(cookie) = map.get(STOP_KEY) {
                return Message::Stop {
                    cookie: cookie.as_str().map(str::to_owned),
                };
            }
            if let Some(cookie) = map.get(QUERY_KEY) {
                return Message::Query {
                    cookie: cookie.as_str().map(str::to_owned),
                };
            }
            if let Some(status) = map.get(STATUS_KEY) {
                return Message::Status {
                    status: status.clone(),
                };
            }
        }
        Message::Data { payload: value }
    }
}
