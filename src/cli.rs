use clap::{Parser, Subcommand};
use std::path::PathBuf;

use ctxtap::RenderFormat;

#[derive(Parser, Debug)]
#[command(
    name = "ctxtap",
    version,
    about = "Capture the session context from mirrored session-prepare requests and serve the latest one"
)]
pub(crate) struct Cli {
    /// Verbose logging (debug level unless CTXTAP_LOG/RUST_LOG is set)
    #[arg(long, short = 'v', global = true)]
    pub(crate) verbose: bool,

    /// Service URL for client commands (http://host:port or unix:///path); overrides CTXTAP_URL
    #[arg(long, global = true)]
    pub(crate) url: Option<String>,

    /// Bearer token for the control endpoints; overrides CTXTAP_TOKEN
    #[arg(long, global = true)]
    pub(crate) token: Option<String>,

    /// Reply/connect timeout, e.g. 5s or 250ms; overrides CTXTAP_TIMEOUT
    #[arg(long, global = true, value_parser = humantime::parse_duration)]
    pub(crate) timeout: Option<std::time::Duration>,

    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub(crate) enum Command {
    /// Run the tap: accept mirrored traffic, capture context, answer retrieval requests
    Serve {
        /// Listen address (host:port); overrides CTXTAP_LISTEN
        #[arg(long)]
        listen: Option<String>,
        /// Listen on a unix socket instead of TCP; overrides CTXTAP_UNIX_SOCKET
        #[arg(long = "unix-socket")]
        unix_socket: Option<PathBuf>,
        /// State directory holding the slot file and lock; overrides CTXTAP_STATE_DIR
        #[arg(long = "state-dir")]
        state_dir: Option<PathBuf>,
        /// Extra URL match pattern (repeatable); replaces CTXTAP_URL_PATTERNS when given
        #[arg(long = "pattern")]
        patterns: Vec<String>,
        /// Extra HTTP method (repeatable); replaces CTXTAP_METHODS when given
        #[arg(long = "method")]
        methods: Vec<String>,
    },
    /// Fetch and print the most recently captured context
    Latest {
        /// Output format
        #[arg(long, value_enum, default_value_t = RenderFormat::Pretty)]
        format: RenderFormat,
        /// Exit non-zero when the service cannot be reached instead of printing the empty state
        #[arg(long)]
        strict: bool,
    },
    /// Ask the running service for its version
    VersionQuery,
    /// Print build, configuration and service reachability diagnostics
    Doctor,
}
