//! Server configuration, loaded from environment variables at startup.

/// Runtime configuration for kiln-server.
///
/// Every field has a sensible default so the server works out-of-the-box
/// without any environment variables set.
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP address to bind (default: `"127.0.0.1:12434"`).
    pub bind_address: String,

    /// `tracing` filter string, e.g. `"info"` or `"debug,tower_http=warn"`.
    pub log_level: String,

    /// When `true`, emit log records as newline-delimited JSON.
    pub log_json: bool,

    /// Directory holding the per-slot runner sockets.
    ///
    /// **Security note:** runner sockets carry unauthenticated inference
    /// traffic; keep this directory readable only by the service user.
    pub socket_dir: String,

    /// Directory holding model artifacts and the optional `tags.json`
    /// tag → digest index.
    pub models_dir: String,

    /// Idle TTL in seconds before an unused runner is evicted.
    pub idle_timeout_secs: u64,

    /// Name of the backend used when the request path carries no backend
    /// segment.
    pub default_backend: String,

    /// Launch command template for the exec backend, whitespace-separated.
    /// `{socket}`, `{model}`, `{mode}` and `{ctx}` are substituted, e.g.
    /// `KILN_BACKEND_CMD="llama-server --host {socket} -m {model} -c {ctx}"`.
    pub backend_command: Option<String>,

    /// Comma-separated list of allowed CORS origins.  When `None` (default),
    /// all origins are allowed (`*`).
    pub cors_allowed_origins: Option<String>,
}

impl Config {
    /// Build [`Config`] from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("KILN_BIND", "127.0.0.1:12434"),
            log_level: env_or("KILN_LOG", "info"),
            log_json: std::env::var("KILN_LOG_JSON")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            socket_dir: env_or("KILN_SOCKET_DIR", "/tmp/kiln-runners"),
            models_dir: env_or("KILN_MODELS_DIR", "./models"),
            idle_timeout_secs: parse_env("KILN_IDLE_TIMEOUT_SECS", 300),
            default_backend: env_or("KILN_DEFAULT_BACKEND", "llamacpp"),
            backend_command: std::env::var("KILN_BACKEND_CMD").ok(),
            cors_allowed_origins: std::env::var("KILN_CORS_ORIGINS").ok(),
        }
    }
}

// ── private helpers ──────────────────────────────────────────────────────────

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
