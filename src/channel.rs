/*!
Retrieval channel: message types and dispatch.

Messages are JSON objects with an `action` discriminator. Each handler answers
the actions it owns and passes everything else through; a message no handler
answers gets no reply at all, which keeps the channel open to sibling
features without either side erroring.
*/

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::errors::ChannelError;
use crate::store::ContextStore;

pub const ACTION_GET_LATEST_CONTEXT: &str = "getLatestContext";
pub const ACTION_GET_VERSION: &str = "getVersion";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetLatestContext,
    GetVersion,
    /// Owned by some other feature, or nobody.
    Unrecognized(String),
}

impl Request {
    pub fn from_value(value: &Value) -> Result<Request, ChannelError> {
        let action = value
            .as_object()
            .ok_or_else(|| ChannelError::Protocol("message is not a json object".to_string()))?
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| ChannelError::Protocol("message has no string 'action'".to_string()))?;
        Ok(match action {
            ACTION_GET_LATEST_CONTEXT => Request::GetLatestContext,
            ACTION_GET_VERSION => Request::GetVersion,
            other => Request::Unrecognized(other.to_string()),
        })
    }

    pub fn action(&self) -> &str {
        match self {
            Request::GetLatestContext => ACTION_GET_LATEST_CONTEXT,
            Request::GetVersion => ACTION_GET_VERSION,
            Request::Unrecognized(a) => a,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({ "action": self.action() })
    }
}

/// Reply to `getLatestContext`. `fragment` is null when nothing was captured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextResponse {
    #[serde(default)]
    pub fragment: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
}

type Deferred = Box<dyn FnOnce(Duration) -> Result<Value, ChannelError> + Send>;

/// A handler's answer. `Deferred` replies are resolved by the transport, which
/// owns the timeout.
pub enum Reply {
    Ready(Value),
    Deferred(Deferred),
}

impl Reply {
    pub fn resolve(self, timeout: Duration) -> Result<Value, ChannelError> {
        match self {
            Reply::Ready(v) => Ok(v),
            Reply::Deferred(f) => f(timeout),
        }
    }
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reply::Ready(v) => f.debug_tuple("Ready").field(v).finish(),
            Reply::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

pub trait MessageHandler: Send + Sync {
    /// `None` passes the message on to the next handler.
    fn handle(&self, request: &Request) -> Option<Reply>;
}

/// Answers `getLatestContext` from the context store.
pub struct ContextHandler {
    store: ContextStore,
}

impl ContextHandler {
    pub fn new(store: ContextStore) -> Self {
        ContextHandler { store }
    }
}

impl MessageHandler for ContextHandler {
    fn handle(&self, request: &Request) -> Option<Reply> {
        if *request != Request::GetLatestContext {
            return None;
        }
        let pending = self.store.get_latest();
        Some(Reply::Deferred(Box::new(move |timeout| {
            match pending.wait_timeout(timeout) {
                Ok(fragment) => {
                    let resp = ContextResponse {
                        fragment: fragment.map(|f| f.into_value()),
                    };
                    serde_json::to_value(resp).map_err(|e| ChannelError::Protocol(e.to_string()))
                }
                Err(crate::errors::StoreError::Timeout(d)) => Err(ChannelError::Timeout(d)),
                Err(e) => Err(ChannelError::NoResponse(e.to_string())),
            }
        })))
    }
}

/// Answers `getVersion` with the crate version; a sibling of the context action.
pub struct VersionHandler;

impl MessageHandler for VersionHandler {
    fn handle(&self, request: &Request) -> Option<Reply> {
        match request {
            Request::GetVersion => Some(Reply::Ready(json!({
                "version": env!("CARGO_PKG_VERSION"),
            }))),
            _ => None,
        }
    }
}

/// Ordered handler chain; first handler to answer wins.
#[derive(Clone, Default)]
pub struct MessageRouter {
    handlers: Vec<Arc<dyn MessageHandler>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Router with the context and version handlers installed.
    pub fn with_defaults(store: ContextStore) -> Self {
        let mut r = MessageRouter::new();
        r.register(ContextHandler::new(store));
        r.register(VersionHandler);
        r
    }

    pub fn register<H: MessageHandler + 'static>(&mut self, handler: H) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn dispatch(&self, request: &Request) -> Option<Reply> {
        let reply = self.handlers.iter().find_map(|h| h.handle(request));
        if reply.is_none() {
            tracing::debug!(action = request.action(), "no handler for action; passing through");
        }
        reply
    }
}
