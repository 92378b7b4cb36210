/*!
Environment-driven configuration.

All settings come from `CTXTAP_*` variables (an optional `.env` in the working
directory is loaded first); CLI flags override them. `from_lookup` takes any
key lookup so tests do not have to mutate the process environment.
*/

use std::path::PathBuf;
use std::time::Duration;

use crate::observer::{
    PatternError, RequestFilter, UrlPattern, SESSION_PREPARE_METHOD, SESSION_PREPARE_PATTERN,
};
use crate::store::DEFAULT_SLOT_KEY;
use crate::tap::TapConfig;

pub const DEFAULT_LISTEN: &str = "127.0.0.1:7878";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const STATE_FILE: &str = "state.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub listen: String,
    /// Unix only: listen on this unix socket instead of TCP.
    pub unix_socket: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub store_key: String,
    pub url_patterns: Vec<String>,
    pub methods: Vec<String>,
    pub timeout: Duration,
    pub token: Option<String>,
    /// Client side: explicit service URL (`http://host:port` or `unix:///path`).
    pub service_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: DEFAULT_LISTEN.to_string(),
            unix_socket: None,
            state_dir: default_state_dir(),
            store_key: DEFAULT_SLOT_KEY.to_string(),
            url_patterns: vec![SESSION_PREPARE_PATTERN.to_string()],
            methods: vec![SESSION_PREPARE_METHOD.to_string()],
            timeout: DEFAULT_TIMEOUT,
            token: None,
            service_url: None,
        }
    }
}

/// `$HOME/.ctxtap`, or `./.ctxtap` when no home directory is known.
pub fn default_state_dir() -> PathBuf {
    home::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".ctxtap")
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

impl Config {
    /// Load `.env` (if present), then read the process environment.
    pub fn from_env() -> Result<Config, String> {
        let _ = dotenvy::dotenv();
        Config::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |k: &str| {
            lookup(k)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut cfg = Config::default();
        if let Some(v) = get("CTXTAP_LISTEN") {
            cfg.listen = v;
        }
        if let Some(v) = get("CTXTAP_UNIX_SOCKET") {
            cfg.unix_socket = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CTXTAP_STATE_DIR") {
            cfg.state_dir = PathBuf::from(v);
        }
        if let Some(v) = get("CTXTAP_STORE_KEY") {
            cfg.store_key = v;
        }
        if let Some(v) = get("CTXTAP_URL_PATTERNS") {
            let patterns = split_list(&v);
            if !patterns.is_empty() {
                cfg.url_patterns = patterns;
            }
        }
        if let Some(v) = get("CTXTAP_METHODS") {
            let methods = split_list(&v);
            if !methods.is_empty() {
                cfg.methods = methods;
            }
        }
        if let Some(v) = get("CTXTAP_TIMEOUT") {
            cfg.timeout = humantime::parse_duration(&v)
                .map_err(|e| format!("CTXTAP_TIMEOUT: invalid duration '{v}': {e}"))?;
        }
        cfg.token = get("CTXTAP_TOKEN");
        cfg.service_url = get("CTXTAP_URL");
        cfg.request_filter().map_err(|e| format!("CTXTAP_URL_PATTERNS: {e}"))?;
        Ok(cfg)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir.join(STATE_FILE)
    }

    pub fn request_filter(&self) -> Result<RequestFilter, PatternError> {
        let patterns = self
            .url_patterns
            .iter()
            .map(|p| UrlPattern::parse(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RequestFilter::new(patterns, self.methods.clone()))
    }

    /// Apply command-line listener flags. Flags beat the environment: an
    /// explicit `--listen` alone switches back to TCP even when
    /// `CTXTAP_UNIX_SOCKET` is set; `--unix-socket` still wins over both.
    pub fn override_listener(&mut self, listen: Option<String>, unix_socket: Option<PathBuf>) {
        if let Some(l) = listen {
            self.listen = l;
            self.unix_socket = None;
        }
        if unix_socket.is_some() {
            self.unix_socket = unix_socket;
        }
    }

    pub fn tap_config(&self) -> TapConfig {
        TapConfig {
            listen: self.listen.clone(),
            unix_socket: self.unix_socket.clone(),
            token: self.token.clone(),
            reply_timeout: self.timeout,
        }
    }

    /// Where clients reach the service: explicit URL, else derived from the
    /// listen settings.
    pub fn effective_service_url(&self) -> String {
        if let Some(u) = &self.service_url {
            return u.clone();
        }
        match &self.unix_socket {
            Some(p) if cfg!(unix) => format!("unix://{}", p.display()),
            _ => format!("http://{}", self.listen),
        }
    }
}
