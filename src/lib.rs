/*!
ctxtap: capture the context fragment carried by session-prepare requests and
serve the most recent one on demand.

Pipeline: a traffic mirror feeds the tap, the observer filters by method and
URL pattern, the body is decoded and the `context` field extracted, and the
fragment lands in the single-slot context store. Clients fetch it back over
the retrieval channel (`/_ctxtap/message`).

Module map:
- decoder / extractor / fragment: payload to fragment
- store: single-slot persistence behind a worker thread
- observer: URL/method filter and the capture pipeline
- tap / http / auth: listener, HTTP plumbing, control endpoint guard
- channel / client: retrieval messages, handlers and the client side
- render: display formats for the retrieved fragment
- config / logging / lock / errors: ambient plumbing
*/

mod auth;
mod http;

pub mod channel;
pub mod client;
pub mod config;
pub mod decoder;
pub mod errors;
pub mod extractor;
pub mod fragment;
pub mod lock;
pub mod logging;
pub mod observer;
pub mod render;
pub mod store;
pub mod tap;

pub use auth::authorization_value_matches;
pub use channel::{
    ContextHandler, ContextResponse, MessageHandler, MessageRouter, Reply, Request,
    VersionHandler, ACTION_GET_LATEST_CONTEXT, ACTION_GET_VERSION,
};
pub use client::RetrievalClient;
pub use config::Config;
pub use decoder::decode_payload;
pub use errors::{
    exit_code_for_channel_error, exit_code_for_io_error, CaptureError, ChannelError, StoreError,
};
pub use extractor::{extract_context, CONTEXT_KEY};
pub use fragment::ContextFragment;
pub use lock::{acquire_state_lock, StateLock};
pub use observer::{
    BlockingResponse, CaptureOutcome, CapturedRequest, RequestFilter, TrafficObserver, UrlPattern,
};
pub use render::{render, RenderFormat, EMPTY_STATE};
pub use store::{ContextStore, FileBackend, MemoryBackend, SlotBackend, DEFAULT_SLOT_KEY};
pub use tap::{start_tap, TapConfig, TapHandle};
