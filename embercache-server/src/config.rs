use serde::{Deserialize, Serialize};

use crate::error::{Result, ServerError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Byte budget for resident keys plus values.
    #[serde(default = "default_max_memory_bytes")]
    pub max_memory_bytes: u64,
    /// Pre-sizing hint for the expected number of entries.
    #[serde(default)]
    pub initial_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: default_max_memory_bytes(),
            initial_capacity: 0,
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_memory_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(::config::Environment::with_prefix("EMBERCACHE"))
            .build()
            .map_err(|error| ServerError::Config(error.to_string()))?;

        settings
            .try_deserialize()
            .map_err(|error| ServerError::Config(error.to_string()))
    }
}
