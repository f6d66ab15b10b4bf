use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration, shared by both binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TetherConfig {
    /// Log level used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_controller_port")]
    pub port: u16,
    /// API key callers must present as a bearer token
    pub api_key: Option<String>,
    /// Path to a file holding the API key (takes precedence over api_key)
    pub api_key_file: Option<String>,
    /// Externally reachable gateway base URL, used to template terminal URLs
    #[serde(default = "default_gateway_url")]
    pub public_gateway_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// HTTP port
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Path to terminal UI static files
    #[serde(default = "default_web_root")]
    pub web_root: String,
    /// Where to fetch the controller's verification key set
    #[serde(default = "default_jwks_url")]
    pub jwks_url: String,
    /// JWKS cache refresh interval in seconds
    #[serde(default = "default_jwks_refresh")]
    pub jwks_refresh_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SigningConfig {
    /// Path to the RSA private key PEM. When unset, a key is generated and
    /// persisted under /var/lib/tether so tokens survive restarts.
    pub key_file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Postgres connection URL. Empty selects the in-memory store
    /// (single replica, development only).
    #[serde(default)]
    pub url: String,
    /// Maximum pool size per replica
    #[serde(default = "default_pool_max")]
    pub pool_max: usize,
    /// Per-operation timeout in seconds
    #[serde(default = "default_store_op_timeout")]
    pub op_timeout_secs: u64,
    /// Connection attempts at startup before giving up
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Namespace worker objects are created in
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Worker container image
    #[serde(default = "default_worker_image")]
    pub image: String,
    /// Port the worker's terminal server listens on
    #[serde(default = "default_ttyd_port")]
    pub ttyd_port: u16,
    /// Synchronous endpoint-resolution budget in seconds
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_secs: u64,
    /// Poll interval during endpoint resolution, in milliseconds
    #[serde(default = "default_resolve_interval")]
    pub resolve_interval_ms: u64,
    /// Worker collection TTL after the job finishes, in seconds
    #[serde(default = "default_collection_ttl")]
    pub collection_ttl_secs: u64,
    /// Orchestrator API call timeout in seconds
    #[serde(default = "default_orchestrator_op_timeout")]
    pub op_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session lifetime in seconds
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// Capability token lifetime in seconds (clamped to the session TTL)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    /// Admitted creates per caller per window
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: usize,
    /// Rate limit window in seconds
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    /// Expired-row pruner wake interval in seconds
    #[serde(default = "default_prune_interval")]
    pub prune_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Keepalive ping interval in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
    /// Missing-pong deadline in seconds
    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_secs: u64,
    /// Idle timeout in seconds (no payload either direction)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Backpressure stall budget in seconds
    #[serde(default = "default_stall_timeout")]
    pub stall_timeout_secs: u64,
    /// Gateway-side endpoint re-resolution budget on attach, in seconds
    #[serde(default = "default_attach_resolve")]
    pub attach_resolve_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_controller_port() -> u16 {
    8080
}
fn default_gateway_port() -> u16 {
    8081
}
fn default_gateway_url() -> String {
    "http://127.0.0.1:8081".to_string()
}
fn default_web_root() -> String {
    "web/dist".to_string()
}
fn default_jwks_url() -> String {
    "http://127.0.0.1:8080/.well-known/jwks.json".to_string()
}
fn default_jwks_refresh() -> u64 {
    300
}
fn default_pool_max() -> usize {
    20
}
fn default_store_op_timeout() -> u64 {
    5
}
fn default_connect_retries() -> u32 {
    5
}
fn default_namespace() -> String {
    "tether-workers".to_string()
}
fn default_worker_image() -> String {
    "tether-worker:latest".to_string()
}
fn default_ttyd_port() -> u16 {
    7681
}
fn default_resolve_timeout() -> u64 {
    30
}
fn default_resolve_interval() -> u64 {
    500
}
fn default_collection_ttl() -> u64 {
    300
}
fn default_orchestrator_op_timeout() -> u64 {
    15
}
fn default_session_ttl() -> u64 {
    600
}
fn default_token_ttl() -> u64 {
    300
}
fn default_rate_limit_max() -> usize {
    5
}
fn default_rate_limit_window() -> u64 {
    60
}
fn default_prune_interval() -> u64 {
    60
}
fn default_ping_interval() -> u64 {
    30
}
fn default_pong_timeout() -> u64 {
    60
}
fn default_idle_timeout() -> u64 {
    3600
}
fn default_stall_timeout() -> u64 {
    10
}
fn default_attach_resolve() -> u64 {
    5
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_controller_port(),
            api_key: None,
            api_key_file: None,
            public_gateway_url: default_gateway_url(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_gateway_port(),
            web_root: default_web_root(),
            jwks_url: default_jwks_url(),
            jwks_refresh_secs: default_jwks_refresh(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            pool_max: default_pool_max(),
            op_timeout_secs: default_store_op_timeout(),
            connect_retries: default_connect_retries(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            image: default_worker_image(),
            ttyd_port: default_ttyd_port(),
            resolve_timeout_secs: default_resolve_timeout(),
            resolve_interval_ms: default_resolve_interval(),
            collection_ttl_secs: default_collection_ttl(),
            op_timeout_secs: default_orchestrator_op_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            token_ttl_secs: default_token_ttl(),
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_secs: default_rate_limit_window(),
            prune_interval_secs: default_prune_interval(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            pong_timeout_secs: default_pong_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            stall_timeout_secs: default_stall_timeout(),
            attach_resolve_secs: default_attach_resolve(),
        }
    }
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            controller: ControllerConfig::default(),
            gateway: GatewayConfig::default(),
            signing: SigningConfig::default(),
            store: StoreConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            session: SessionConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

impl TetherConfig {
    /// Effective token TTL: never longer than the session TTL.
    pub fn token_ttl_secs(&self) -> u64 {
        self.session.token_ttl_secs.min(self.session.session_ttl_secs)
    }

    /// Validate the configuration, returning a list of issues found.
    ///
    /// Issues are prefixed with "ERROR:" (fatal, the process should not
    /// start) or "WARNING:" (advisory).
    ///
    /// Returns `Ok(())` if no issues, or `Err(issues)` with all found problems.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.controller.port == 0 {
            issues.push("ERROR: controller.port must be between 1 and 65535, got 0.".to_string());
        }
        if self.gateway.port == 0 {
            issues.push("ERROR: gateway.port must be between 1 and 65535, got 0.".to_string());
        }

        if self.controller.api_key.is_none() && self.controller.api_key_file.is_none() {
            issues.push(
                "ERROR: no API key configured. Set controller.api_key or \
                 controller.api_key_file."
                    .to_string(),
            );
        }
        if let Some(ref path) = self.controller.api_key_file
            && !Path::new(path).exists()
        {
            issues.push(format!(
                "ERROR: controller.api_key_file '{path}' does not exist."
            ));
        }
        if let Some(ref path) = self.signing.key_file
            && !Path::new(path).exists()
        {
            issues.push(format!("ERROR: signing.key_file '{path}' does not exist."));
        }

        if self.store.url.is_empty() {
            issues.push(
                "WARNING: store.url is empty — using the in-memory store. \
                 Sessions will not be visible to other replicas."
                    .to_string(),
            );
        }

        if self.session.session_ttl_secs == 0 {
            issues.push("ERROR: session.session_ttl_secs must be greater than 0.".to_string());
        }
        if self.session.token_ttl_secs == 0 {
            issues.push("ERROR: session.token_ttl_secs must be greater than 0.".to_string());
        }
        if self.session.token_ttl_secs > self.session.session_ttl_secs {
            issues.push(format!(
                "WARNING: session.token_ttl_secs ({}) exceeds session.session_ttl_secs ({}) \
                 and will be clamped to it.",
                self.session.token_ttl_secs, self.session.session_ttl_secs
            ));
        }
        if self.session.rate_limit_max == 0 {
            issues.push(
                "ERROR: session.rate_limit_max must be greater than 0 — \
                 a zero budget rejects every request."
                    .to_string(),
            );
        }

        if self.orchestrator.resolve_interval_ms == 0 {
            issues
                .push("ERROR: orchestrator.resolve_interval_ms must be greater than 0.".to_string());
        }
        if self.proxy.pong_timeout_secs < self.proxy.ping_interval_secs {
            issues.push(format!(
                "WARNING: proxy.pong_timeout_secs ({}) is shorter than \
                 proxy.ping_interval_secs ({}) — connections may be closed \
                 before the first ping is answered.",
                self.proxy.pong_timeout_secs, self.proxy.ping_interval_secs
            ));
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }

    /// Resolve the admission API key from the file or inline setting.
    pub fn api_key(&self) -> Result<String> {
        if let Some(ref path) = self.controller.api_key_file {
            let key = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read API key file: {path}"))?;
            let key = key.trim().to_string();
            if key.is_empty() {
                anyhow::bail!("API key file {path} is empty");
            }
            return Ok(key);
        }
        self.controller
            .api_key
            .clone()
            .context("No API key configured")
    }
}

/// Load configuration from a TOML file at the given path.
/// If the file doesn't exist, returns default configuration.
pub fn load_config(path: &Path) -> Result<TetherConfig> {
    if !path.exists() {
        tracing::warn!(
            "Config file not found at {}, using defaults",
            path.display()
        );
        return Ok(TetherConfig::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: TetherConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}
