//! Gateway configuration: a plain settings record populated by a small
//! resolver (default ← environment ← CLI flags), with no observer pattern.
//! Settings that would affect already-running components are either
//! immutable after startup or explicitly re-applied, never observed.

use std::env;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Which personality (route surface) the gateway exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Personality {
    /// The raw kernel/session REST + WebSocket surface.
    JupyterWebsocket,
    /// The notebook-as-API surface.
    NotebookHttp,
}

/// Resolved gateway settings. Immutable after [`GatewayApp::new`](crate::app::GatewayApp::new).
#[derive(Debug, Clone, Parser)]
#[command(name = "kernel-gateway", about = "Jupyter kernel gateway")]
pub struct Settings {
    /// Port on which to listen.
    #[arg(long, env = "KG_PORT", default_value_t = 8888)]
    pub port: u16,

    /// Number of additional ports to try if `port` is in use.
    #[arg(long, env = "KG_PORT_RETRIES", default_value_t = 50)]
    pub port_retries: u16,

    /// IP address on which to listen.
    #[arg(long, env = "KG_IP", default_value = "127.0.0.1")]
    pub ip: String,

    /// The base path on which all API resources are mounted.
    #[arg(long, env = "KG_BASE_URL", default_value = "/")]
    pub base_url: String,

    /// Authorization token required for all requests. Empty disables auth.
    #[arg(long, env = "KG_AUTH_TOKEN", default_value = "")]
    pub auth_token: String,

    /// `Access-Control-Allow-Credentials` header value.
    #[arg(long, env = "KG_ALLOW_CREDENTIALS", default_value = "")]
    pub allow_credentials: String,

    /// `Access-Control-Allow-Headers` header value.
    #[arg(long, env = "KG_ALLOW_HEADERS", default_value = "")]
    pub allow_headers: String,

    /// `Access-Control-Allow-Methods` header value.
    #[arg(long, env = "KG_ALLOW_METHODS", default_value = "")]
    pub allow_methods: String,

    /// `Access-Control-Allow-Origin` header value.
    #[arg(long, env = "KG_ALLOW_ORIGIN", default_value = "")]
    pub allow_origin: String,

    /// `Access-Control-Expose-Headers` header value.
    #[arg(long, env = "KG_EXPOSE_HEADERS", default_value = "")]
    pub expose_headers: String,

    /// `Access-Control-Max-Age` header value.
    #[arg(long, env = "KG_MAX_AGE", default_value = "")]
    pub max_age: String,

    /// Maximum number of concurrently running kernels. `None` is unlimited.
    #[arg(long, env = "KG_MAX_KERNELS")]
    pub max_kernels: Option<usize>,

    /// Runs the notebook (.ipynb) at this URI/path on every kernel launched.
    #[arg(long, env = "KG_SEED_URI")]
    pub seed_uri: Option<String>,

    /// Number of kernels to prespawn using the default (or forced) spec.
    #[arg(long, env = "KG_PRESPAWN_COUNT")]
    pub prespawn_count: Option<usize>,

    /// Default kernel spec name used when a create request doesn't specify one.
    #[arg(long, env = "KG_DEFAULT_KERNEL_NAME", default_value = "")]
    pub default_kernel_name: String,

    /// When set, overrides any requested kernel spec name unconditionally.
    #[arg(long, env = "KG_FORCE_KERNEL_NAME", default_value = "")]
    pub force_kernel_name: String,

    /// Controls whether `/api/kernels` and `/api/sessions` report running
    /// kernels and their IDs.
    #[arg(long, env = "KG_LIST_KERNELS", default_value_t = false)]
    pub list_kernels: bool,

    /// Environment variable names (beyond `KERNEL_*`-prefixed ones) that may
    /// be forwarded into a kernel's process environment from a create request.
    #[arg(long, env = "KG_ENV_PROCESS_WHITELIST", value_delimiter = ',')]
    pub env_whitelist: Vec<String>,

    /// Which personality to serve.
    #[arg(long, env = "KG_API", value_enum, default_value_t = Personality::JupyterWebsocket)]
    pub api: Personality,

    /// Allow the seed notebook's raw source to be downloaded at `/_api/source`.
    #[arg(long, env = "KG_ALLOW_NOTEBOOK_DOWNLOAD", default_value_t = false)]
    pub allow_notebook_download: bool,

    /// WebSocket ping interval, in seconds. Also the cadence of each
    /// kernel's heartbeat liveness loop. `0` disables both.
    #[arg(long, env = "KG_WS_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ws_ping_interval_secs: u64,

    /// Per-request execution timeout for notebook-HTTP probe reads, in seconds.
    #[arg(long, env = "KG_EXECUTION_TIMEOUT_SECS", default_value_t = 5)]
    pub execution_timeout_secs: u64,

    /// Directory to search for `kernel.json` kernel specs, in addition to the
    /// standard Jupyter data directories.
    #[arg(long, env = "KG_KERNEL_SPECS_DIR")]
    pub kernel_specs_dir: Option<PathBuf>,

    /// Directory used for connection files and other gateway runtime state.
    #[arg(long, env = "KG_RUNTIME_DIR")]
    pub runtime_dir: Option<PathBuf>,
}

impl Settings {
    /// Resolve settings from defaults, environment variables, and CLI flags
    /// (`clap`'s `env` attribute already implements the default ← env
    /// precedence; parsing `std::env::args()` applies the final CLI-over-env
    /// override).
    pub fn resolve() -> Self {
        Settings::parse()
    }

    /// Returns the directory used for connection files and other runtime
    /// state, falling back to a process-unique temp directory.
    pub fn runtime_dir(&self) -> PathBuf {
        if let Some(dir) = &self.runtime_dir {
            return dir.clone();
        }
        env::temp_dir().join("kernel-gateway")
    }

    /// True if an auth token is configured and must be checked on requests.
    pub fn auth_required(&self) -> bool {
        !self.auth_token.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_with_no_args() {
        let settings = Settings::parse_from(["kernel-gateway"]);
        assert_eq!(settings.port, 8888);
        assert_eq!(settings.ip, "127.0.0.1");
        assert!(!settings.list_kernels);
        assert!(!settings.auth_required());
        assert_eq!(settings.api, Personality::JupyterWebsocket);
    }

    #[test]
    fn auth_required_reflects_token() {
        let mut settings = Settings::parse_from(["kernel-gateway"]);
        assert!(!settings.auth_required());
        settings.auth_token = "secret".into();
        assert!(settings.auth_required());
    }
}
