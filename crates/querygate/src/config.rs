use querygate_core::GatewayError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_port() -> u16 {
    8080
}

fn default_max_workers() -> usize {
    3
}

fn default_queue_capacity() -> usize {
    100
}

fn default_max_frame_size() -> usize {
    querygate_protocol::DEFAULT_MAX_FRAME_SIZE
}

fn default_read_deadline_secs() -> u64 {
    60
}

fn default_write_deadline_secs() -> u64 {
    10
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

/// Gateway configuration, loaded from a JSON file. Every field has a
/// default so a partial (or absent) file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub supabase_url: String,
    #[serde(default)]
    pub supabase_key: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Workers per connection.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Pending-task queue capacity per connection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Maximum inbound frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_read_deadline_secs")]
    pub read_deadline_secs: u64,
    #[serde(default = "default_write_deadline_secs")]
    pub write_deadline_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_key: String::new(),
            port: default_port(),
            max_workers: default_max_workers(),
            queue_capacity: default_queue_capacity(),
            max_frame_size: default_max_frame_size(),
            read_deadline_secs: default_read_deadline_secs(),
            write_deadline_secs: default_write_deadline_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl GatewayConfig {
    /// Load from `path`. A missing file yields the defaults, matching a
    /// fresh deployment with no config written yet.
    pub fn load(path: &Path) -> Result<Self, GatewayError> {
        if !path.exists() {
            log::info!(
                "[CONFIG] {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| GatewayError::InvalidRequest(format!("config file: {e}")))?;
        Ok(config)
    }

    pub fn read_deadline(&self) -> Duration {
        Duration::from_secs(self.read_deadline_secs)
    }

    pub fn write_deadline(&self) -> Duration {
        Duration::from_secs(self.write_deadline_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    /// Ping cadence: a fraction of the read deadline so a live peer always
    /// has a pong in flight before the deadline lapses.
    pub fn ping_interval(&self) -> Duration {
        self.read_deadline().mul_f64(0.9)
    }
}
