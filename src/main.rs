use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;

use ctxtap::{
    acquire_state_lock, exit_code_for_channel_error, exit_code_for_io_error, render, start_tap,
    Config, ContextStore, FileBackend, MessageRouter, RetrievalClient, TrafficObserver,
};

mod cli;

use cli::{Cli, Command};

#[cfg(unix)]
mod signals {
    use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
    use std::sync::atomic::{AtomicBool, Ordering};

    static STOP: AtomicBool = AtomicBool::new(false);

    extern "C" fn on_signal(_: nix::libc::c_int) {
        STOP.store(true, Ordering::SeqCst);
    }

    pub fn install() {
        let action = SigAction::new(
            SigHandler::Handler(on_signal),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only stores to an atomic.
            if let Err(e) = unsafe { signal::sigaction(sig, &action) } {
                tracing::warn!(signal = ?sig, error = %e, "failed to install signal handler");
            }
        }
    }

    pub fn stop_requested() -> bool {
        STOP.load(Ordering::SeqCst)
    }
}

#[cfg(not(unix))]
mod signals {
    pub fn install() {}

    pub fn stop_requested() -> bool {
        false
    }
}

/// Environment first, then global CLI flags on top.
fn load_config(cli: &Cli) -> Result<Config, String> {
    let mut cfg = Config::from_env()?;
    if let Some(u) = &cli.url {
        cfg.service_url = Some(u.clone());
    }
    if let Some(t) = &cli.token {
        cfg.token = Some(t.clone()).filter(|t| !t.trim().is_empty());
    }
    if let Some(d) = cli.timeout {
        cfg.timeout = d;
    }
    Ok(cfg)
}

fn run_serve(cfg: &Config) -> anyhow::Result<()> {
    let _lock = acquire_state_lock(&cfg.state_dir)
        .with_context(|| format!("locking state dir {}", cfg.state_dir.display()))?;
    let filter = cfg
        .request_filter()
        .context("invalid URL match pattern")?;
    let store = ContextStore::open(FileBackend::new(cfg.state_file()), &cfg.store_key)
        .context("starting context store")?;
    let observer = TrafficObserver::new(filter, store.clone());
    let router = MessageRouter::with_defaults(store);
    let tap = start_tap(&cfg.tap_config(), observer, router).context("starting tap")?;

    tracing::info!(
        url = tap.url(),
        state = %cfg.state_file().display(),
        key = %cfg.store_key,
        patterns = ?cfg.url_patterns,
        methods = ?cfg.methods,
        version = env!("CARGO_PKG_VERSION"),
        build_date = env!("CTXTAP_BUILD_DATE"),
        build_target = env!("CTXTAP_BUILD_TARGET"),
        "ctxtap serving"
    );
    println!("ctxtap listening on {}", tap.url());

    signals::install();
    let running = tap.running();
    while running.load(Ordering::SeqCst) && !signals::stop_requested() {
        std::thread::sleep(Duration::from_millis(200));
    }
    tracing::info!("shutting down");
    tap.stop();
    Ok(())
}

fn serve_exit_code(e: &anyhow::Error) -> u8 {
    e.downcast_ref::<std::io::Error>()
        .map(exit_code_for_io_error)
        .unwrap_or(1)
}

fn run_doctor(cfg: &Config) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!("ctxtap doctor");
    eprintln!("  version: v{}", version);
    eprintln!(
        "  build: {} ({}, {}, {})",
        env!("CTXTAP_BUILD_DATE"),
        env!("CTXTAP_BUILD_TARGET"),
        env!("CTXTAP_BUILD_PROFILE"),
        env!("CTXTAP_BUILD_RUSTC")
    );
    eprintln!("  host: {} / {}", std::env::consts::OS, std::env::consts::ARCH);

    let state_dir = &cfg.state_dir;
    let state_note = if state_dir.is_dir() {
        "exists"
    } else {
        "missing (created on serve)"
    };
    eprintln!("  state dir: {} ({})", state_dir.display(), state_note);
    eprintln!("  slot key: {}", cfg.store_key);
    match &cfg.unix_socket {
        Some(p) => eprintln!("  listen: unix {}", p.display()),
        None => eprintln!("  listen: {}", cfg.listen),
    }
    eprintln!("  url patterns: {}", cfg.url_patterns.join(", "));
    eprintln!("  methods: {}", cfg.methods.join(", "));
    eprintln!("  timeout: {}", humantime::format_duration(cfg.timeout));
    eprintln!(
        "  token: {}",
        if cfg.token.is_some() { "set" } else { "(none)" }
    );

    let url = cfg.effective_service_url();
    match RetrievalClient::from_config(cfg).and_then(|c| c.health().and_then(|_| c.get_version()))
    {
        Ok(v) => eprintln!("  service: {} (reachable, v{})", url, v),
        Err(e) => eprintln!("  service: {} (unreachable: {})", url, e),
    }
    eprintln!("doctor: completed diagnostics.");
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    ctxtap::logging::init(cli.verbose);

    let mut cfg = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ctxtap: {e}");
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Command::Serve {
            listen,
            unix_socket,
            state_dir,
            patterns,
            methods,
        } => {
            cfg.override_listener(listen, unix_socket);
            if let Some(d) = state_dir {
                cfg.state_dir = d;
            }
            if !patterns.is_empty() {
                cfg.url_patterns = patterns;
            }
            if !methods.is_empty() {
                cfg.methods = methods;
            }
            match run_serve(&cfg) {
                Ok(()) => ExitCode::from(0),
                Err(e) => {
                    eprintln!("ctxtap: {e:#}");
                    ExitCode::from(serve_exit_code(&e))
                }
            }
        }
        Command::Latest { format, strict } => {
            let client = match RetrievalClient::from_config(&cfg) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("ctxtap: {e}");
                    return ExitCode::from(exit_code_for_channel_error(&e));
                }
            };
            let fragment = if strict {
                match client.get_latest_context() {
                    Ok(f) => f,
                    Err(e) => {
                        eprintln!("ctxtap: {e}");
                        return ExitCode::from(exit_code_for_channel_error(&e));
                    }
                }
            } else {
                client.fetch_for_display()
            };
            println!("{}", render(format, fragment.as_ref()));
            ExitCode::from(0)
        }
        Command::VersionQuery => {
            match RetrievalClient::from_config(&cfg).and_then(|c| c.get_version()) {
                Ok(v) => {
                    println!("{v}");
                    ExitCode::from(0)
                }
                Err(e) => {
                    eprintln!("ctxtap: {e}");
                    ExitCode::from(exit_code_for_channel_error(&e))
                }
            }
        }
        Command::Doctor => {
            run_doctor(&cfg);
            ExitCode::from(0)
        }
    }
}
