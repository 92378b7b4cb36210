use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;

static INIT: OnceCell<()> = OnceCell::new();

/// Filter directive: `CTXTAP_LOG`, then `RUST_LOG`, then `debug` when verbose
/// or `info` otherwise.
fn filter_directive(verbose: bool) -> String {
    ["CTXTAP_LOG", "RUST_LOG"]
        .iter()
        .filter_map(|k| std::env::var(k).ok())
        .map(|s| s.trim().to_string())
        .find(|s| !s.is_empty())
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string())
}

/// Install the stderr fmt subscriber once per process. Later calls are no-ops;
/// a failure to install (another subscriber already set) is reported, never fatal.
pub fn init(verbose: bool) {
    INIT.get_or_init(|| {
        let directive = filter_directive(verbose);
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|e| {
            eprintln!("ctxtap: ignoring invalid log filter '{directive}': {e}");
            EnvFilter::new("info")
        });
        let res = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .try_init();
        if let Err(e) = res {
            eprintln!("ctxtap: logging not initialized: {e}");
        }
    });
}
