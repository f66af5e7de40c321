use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `DRIPLINE__` and an optional TOML config file.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub pacing: PacingConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_http_port() -> u16 {
    8080
}
fn default_metrics_port() -> u16 {
    9091
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            port: default_metrics_port(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            api: ApiConfig::default(),
            metrics: MetricsConfig::default(),
            scheduler: SchedulerConfig::default(),
            store: StoreConfig::default(),
            approval: ApprovalConfig::default(),
            pacing: PacingConfig::default(),
            email: EmailConfig::default(),
            catalog: CatalogConfig::default(),
        }
    }
}

// ─── Scheduler Config ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_concurrent_resumes")]
    pub max_concurrent_resumes: usize,
    /// How long a worker may hold a process before another may take it over.
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
}

fn default_poll_interval_ms() -> u64 { 1000 }
fn default_batch_size() -> usize { 500 }
fn default_max_concurrent_resumes() -> usize { 64 }
fn default_lease_secs() -> u64 { 300 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            batch_size: default_batch_size(),
            max_concurrent_resumes: default_max_concurrent_resumes(),
            lease_secs: default_lease_secs(),
        }
    }
}

// ─── Store Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_max_write_retries")]
    pub max_write_retries: u32,
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// Interaction log, suppressions and tags. Defaults to a file beside
    /// `snapshot_path`.
    #[serde(default)]
    pub channels_snapshot_path: Option<String>,
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,
}

fn default_max_write_retries() -> u32 { 5 }
fn default_snapshot_interval_secs() -> u64 { 30 }

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_write_retries: default_max_write_retries(),
            snapshot_path: None,
            channels_snapshot_path: None,
            snapshot_interval_secs: default_snapshot_interval_secs(),
        }
    }
}

impl StoreConfig {
    pub fn channels_snapshot_path(&self) -> Option<String> {
        self.channels_snapshot_path.clone().or_else(|| {
            self.snapshot_path.as_ref().map(|path| {
                std::path::Path::new(path)
                    .with_extension("channels.json")
                    .to_string_lossy()
                    .into_owned()
            })
        })
    }
}

// ─── Approval Config ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    /// Used when an approval step does not set its own timeout.
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_approval_timeout_secs() -> u64 { 86_400 }

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout_secs(),
        }
    }
}

// ─── Pacing Config ──────────────────────────────────────────────────────────

/// P0/P1 pacing used by the seeded drip chains.
#[derive(Debug, Clone, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_initial_wait_secs")]
    pub initial_wait_secs: u64,
    #[serde(default = "default_escalated_wait_secs")]
    pub escalated_wait_secs: u64,
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

fn default_initial_wait_secs() -> u64 { 3 * 86_400 }
fn default_escalated_wait_secs() -> u64 { 7 * 86_400 }
fn default_miss_threshold() -> u32 { 3 }

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            initial_wait_secs: default_initial_wait_secs(),
            escalated_wait_secs: default_escalated_wait_secs(),
            miss_threshold: default_miss_threshold(),
        }
    }
}

// ─── Email Config ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_tracking")]
    pub open_tracking: bool,
    #[serde(default = "default_tracking")]
    pub click_tracking: bool,
}

fn default_from_email() -> String { "hello@dripline.io".to_string() }
fn default_from_name() -> String { "Dripline".to_string() }
fn default_tracking() -> bool { true }

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            from_email: default_from_email(),
            from_name: default_from_name(),
            open_tracking: default_tracking(),
            click_tracking: default_tracking(),
        }
    }
}

// ─── Catalog Config ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogConfig {
    /// JSON file holding an array of chain definitions.
    #[serde(default)]
    pub definitions_path: Option<String>,
    #[serde(default = "default_seed_demo")]
    pub seed_demo: bool,
}

fn default_seed_demo() -> bool { true }

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            definitions_path: None,
            seed_demo: default_seed_demo(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional TOML file, overridden by
    /// environment variables.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("DRIPLINE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
