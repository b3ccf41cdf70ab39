use crate::utils::error::{CoreError, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// One configured CIDR pool that `/24` subnets are carved out of (C2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetPool {
    pub name: String,
    pub base: String,
    pub cidr: u8,
}

impl SubnetPool {
    /// Number of distinct `/24`s this pool can hand out.
    pub fn capacity(&self) -> Result<u32> {
        if self.cidr > 24 {
            return Ok(0);
        }
        Ok(1u32 << (24 - self.cidr))
    }

    pub fn parse_base(&self) -> Result<Ipv4Net> {
        let net: Ipv4Net = format!("{}/{}", self.base, self.cidr)
            .parse()
            .map_err(|e| {
                CoreError::ConfigInvalid(format!(
                    "subnet pool '{}' has malformed CIDR {}/{}: {}",
                    self.name, self.base, self.cidr, e
                ))
            })?;
        Ok(net)
    }
}

/// Image + entry-point convention for a single language tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSpec {
    pub image: String,
    pub entry_convention: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default = "default_docker_memory")]
    pub docker_memory: u64,
    #[serde(default = "default_docker_cpus")]
    pub docker_cpus: f64,
    #[serde(default = "default_docker_memory_swap")]
    pub docker_memory_swap: i64,
    #[serde(default = "default_docker_command_timeout_ms")]
    pub docker_command_timeout_ms: u64,

    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default = "default_interactive_execution_timeout_ms")]
    pub interactive_execution_timeout_ms: u64,

    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_max_per_session")]
    pub max_per_session: usize,
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    #[serde(default)]
    pub subnet_pools: Vec<SubnetPool>,
    #[serde(default = "default_session_network_prefix")]
    pub session_network_prefix: String,

    #[serde(default)]
    pub runtimes: HashMap<String, RuntimeSpec>,

    #[serde(default = "default_files_max_bytes")]
    pub files_max_bytes: u64,
    #[serde(default = "default_files_max_count")]
    pub files_max_count: usize,
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    8080
}
fn default_docker_memory() -> u64 {
    256 * 1024 * 1024
}
fn default_docker_cpus() -> f64 {
    1.0
}
fn default_docker_memory_swap() -> i64 {
    0
}
fn default_docker_command_timeout_ms() -> u64 {
    5_000
}
fn default_execution_timeout_ms() -> u64 {
    5_000
}
fn default_interactive_execution_timeout_ms() -> u64 {
    30_000
}
fn default_session_ttl_ms() -> u64 {
    60_000
}
fn default_cleanup_interval_ms() -> u64 {
    10_000
}
fn default_max_per_session() -> usize {
    5
}
fn default_max_concurrent_sessions() -> usize {
    50
}
fn default_max_queue_size() -> usize {
    200
}
fn default_queue_timeout_ms() -> u64 {
    60_000
}
fn default_session_network_prefix() -> String {
    "coderunner".to_string()
}
fn default_files_max_bytes() -> u64 {
    2 * 1024 * 1024
}
fn default_files_max_count() -> usize {
    64
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_host: default_listen_host(),
            listen_port: default_listen_port(),
            docker_memory: default_docker_memory(),
            docker_cpus: default_docker_cpus(),
            docker_memory_swap: default_docker_memory_swap(),
            docker_command_timeout_ms: default_docker_command_timeout_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            interactive_execution_timeout_ms: default_interactive_execution_timeout_ms(),
            session_ttl_ms: default_session_ttl_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            max_per_session: default_max_per_session(),
            max_concurrent_sessions: default_max_concurrent_sessions(),
            max_queue_size: default_max_queue_size(),
            queue_timeout_ms: default_queue_timeout_ms(),
            subnet_pools: Vec::new(),
            session_network_prefix: default_session_network_prefix(),
            runtimes: HashMap::new(),
            files_max_bytes: default_files_max_bytes(),
            files_max_count: default_files_max_count(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, for local development and tests.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| CoreError::ConfigInvalid(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset. Structured fields
    /// (`subnet_pools`, `runtimes`) are read as a single JSON-encoded value.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(v) = std::env::var("CODERUNNER_LISTEN_HOST") {
            config.listen_host = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_LISTEN_PORT")? {
            config.listen_port = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_DOCKER_MEMORY")? {
            config.docker_memory = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_DOCKER_CPUS")? {
            config.docker_cpus = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_DOCKER_MEMORY_SWAP")? {
            config.docker_memory_swap = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_DOCKER_COMMAND_TIMEOUT_MS")? {
            config.docker_command_timeout_ms = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_EXECUTION_TIMEOUT_MS")? {
            config.execution_timeout_ms = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_INTERACTIVE_EXECUTION_TIMEOUT_MS")? {
            config.interactive_execution_timeout_ms = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_SESSION_TTL_MS")? {
            config.session_ttl_ms = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_CLEANUP_INTERVAL_MS")? {
            config.cleanup_interval_ms = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_MAX_PER_SESSION")? {
            config.max_per_session = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_MAX_CONCURRENT_SESSIONS")? {
            config.max_concurrent_sessions = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_MAX_QUEUE_SIZE")? {
            config.max_queue_size = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_QUEUE_TIMEOUT_MS")? {
            config.queue_timeout_ms = v;
        }
        if let Ok(v) = std::env::var("CODERUNNER_SESSION_NETWORK_PREFIX") {
            config.session_network_prefix = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_FILES_MAX_BYTES")? {
            config.files_max_bytes = v;
        }
        if let Ok(v) = env_parsed("CODERUNNER_FILES_MAX_COUNT")? {
            config.files_max_count = v;
        }

        if let Ok(raw) = std::env::var("CODERUNNER_SUBNET_POOLS") {
            config.subnet_pools = serde_json::from_str(&raw).map_err(|e| {
                CoreError::ConfigInvalid(format!("CODERUNNER_SUBNET_POOLS is not valid JSON: {e}"))
            })?;
        }
        if let Ok(raw) = std::env::var("CODERUNNER_RUNTIMES") {
            config.runtimes = serde_json::from_str(&raw).map_err(|e| {
                CoreError::ConfigInvalid(format!("CODERUNNER_RUNTIMES is not valid JSON: {e}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration; fails with `CoreError::ConfigInvalid`.
    pub fn validate(&self) -> Result<()> {
        if self.listen_port == 0 {
            return Err(CoreError::ConfigInvalid(format!(
                "listen_port out of range: {}",
                self.listen_port
            )));
        }

        let mut total_capacity: u64 = 0;
        for pool in &self.subnet_pools {
            pool.parse_base()?;
            total_capacity += pool.capacity()? as u64;
        }
        if total_capacity < self.max_concurrent_sessions as u64 {
            return Err(CoreError::ConfigInvalid(format!(
                "total subnet capacity {total_capacity} is below max_concurrent_sessions {}",
                self.max_concurrent_sessions
            )));
        }

        if self.runtimes.is_empty() {
            return Err(CoreError::ConfigInvalid(
                "no runtimes configured".to_string(),
            ));
        }
        for (lang, spec) in &self.runtimes {
            if spec.image.trim().is_empty() {
                return Err(CoreError::ConfigInvalid(format!(
                    "runtime '{lang}' has an empty image"
                )));
            }
        }

        let positive_limits: &[(&str, i64)] = &[
            ("docker_command_timeout_ms", self.docker_command_timeout_ms as i64),
            ("execution_timeout_ms", self.execution_timeout_ms as i64),
            (
                "interactive_execution_timeout_ms",
                self.interactive_execution_timeout_ms as i64,
            ),
            ("session_ttl_ms", self.session_ttl_ms as i64),
            ("cleanup_interval_ms", self.cleanup_interval_ms as i64),
            ("max_per_session", self.max_per_session as i64),
            ("max_concurrent_sessions", self.max_concurrent_sessions as i64),
            ("max_queue_size", self.max_queue_size as i64),
            ("queue_timeout_ms", self.queue_timeout_ms as i64),
            ("files_max_bytes", self.files_max_bytes as i64),
            ("files_max_count", self.files_max_count as i64),
        ];
        for (name, value) in positive_limits {
            if *value <= 0 {
                return Err(CoreError::ConfigInvalid(format!(
                    "{name} must be > 0, got {value}"
                )));
            }
        }
        if self.docker_cpus <= 0.0 {
            return Err(CoreError::ConfigInvalid(format!(
                "docker_cpus must be > 0, got {}",
                self.docker_cpus
            )));
        }

        Ok(())
    }

    /// Write an example TOML configuration file (`--generate-config`).
    pub fn create_example<P: AsRef<Path>>(path: P) -> Result<()> {
        let example = r#"listen_host = "0.0.0.0"
listen_port = 8080

docker_memory = 268435456
docker_cpus = 1.0
docker_memory_swap = 0
docker_command_timeout_ms = 5000

execution_timeout_ms = 5000
interactive_execution_timeout_ms = 30000

session_ttl_ms = 60000
cleanup_interval_ms = 10000

max_per_session = 5
max_concurrent_sessions = 50
max_queue_size = 200
queue_timeout_ms = 60000

session_network_prefix = "coderunner"

files_max_bytes = 2097152
files_max_count = 64

[[subnet_pools]]
name = "primary"
base = "10.200.0.0"
cidr = 16

[runtimes.python]
image = "coderunner-runtime-python:latest"
entry_convention = "main.py"

[runtimes.node]
image = "coderunner-runtime-node:latest"
entry_convention = "index.js"
"#;
        std::fs::write(path.as_ref(), example)?;
        Ok(())
    }
}

fn env_parsed<T>(key: &str) -> Result<std::result::Result<T, std::env::VarError>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Ok)
            .map_err(|e| CoreError::ConfigInvalid(format!("{key} is invalid: {e}"))),
        Err(e) => Ok(Err(e)),
    }
}
