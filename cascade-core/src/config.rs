//! Plain-value descriptors of a topology and of the processor running it. A descriptor is JSON,
//! read from a file or from the base64 encoded [ENV_TOPOLOGY_OBJECT] environment variable.
//!
//! ```json
//! {
//!   "partitions": 4,
//!   "policy": { "max_retries": 2, "continue_on_failure": false },
//!   "streams": { "shipped": { "partitions": 1, "partitioning": "round_robin" } },
//!   "computations": [
//!     { "name": "ship", "type": "forward", "bindings": ["i1:orders", "o1:shipped"] }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::log::DEFAULT_POLL_TIMEOUT;
use crate::log::partitioner::Partitioning;
use crate::policy::{ComputationPolicy, RetryPolicy};
use crate::registry::ComputationRegistry;
use crate::topology::Topology;

pub const ENV_TOPOLOGY_OBJECT: &str = "CASCADE_TOPOLOGY_OBJECT";

const DEFAULT_PARTITIONS: u32 = 1;

/// Policy values; missing fields take the defaults of [ComputationPolicy::default].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub max_delay_ms: u64,
    pub factor: f64,
    /// ratio in `[0, 1]` spreading every retry delay
    pub jitter: f64,
    pub batch_capacity: usize,
    pub batch_threshold_ms: u64,
    pub continue_on_failure: bool,
    pub skip_first_failures: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            delay_ms: 500,
            max_delay_ms: 10_000,
            factor: 2.0,
            jitter: 0.0,
            batch_capacity: 10,
            batch_threshold_ms: 1_000,
            continue_on_failure: false,
            skip_first_failures: 0,
        }
    }
}

impl From<&PolicyConfig> for ComputationPolicy {
    fn from(config: &PolicyConfig) -> Self {
        let retry = RetryPolicy::new(config.max_retries)
            .with_delay(Duration::from_millis(config.delay_ms))
            .with_max_delay(Duration::from_millis(
                config.max_delay_ms.max(config.delay_ms),
            ))
            .with_factor(config.factor)
            .with_jitter(config.jitter);
        ComputationPolicy::builder()
            .retry_policy(retry)
            .batch_policy(
                config.batch_capacity,
                Duration::from_millis(config.batch_threshold_ms),
            )
            .continue_on_failure(config.continue_on_failure)
            .skip_first_failures(config.skip_first_failures)
            .build()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputationConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub bindings: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<PolicyConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partitions: Option<u32>,
    #[serde(default)]
    pub partitioning: Partitioning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub computations: Vec<ComputationConfig>,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default)]
    pub streams: BTreeMap<String, StreamConfig>,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_timeout_ms: Option<u64>,
}

fn default_partitions() -> u32 {
    DEFAULT_PARTITIONS
}

impl TopologyConfig {
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let config: TopologyConfig = serde_json::from_slice(data)
            .map_err(|e| Error::Config(format!("parsing topology descriptor: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)
            .map_err(|e| Error::Config(format!("reading {}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    /// Loads the descriptor from the base64 encoded [ENV_TOPOLOGY_OBJECT] variable.
    pub fn from_env(
        env_vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Result<Self> {
        let env_vars: HashMap<String, String> = env_vars
            .into_iter()
            .map(|(key, val)| (key.into(), val.into()))
            .filter(|(key, _)| key == ENV_TOPOLOGY_OBJECT)
            .collect();
        let encoded = env_vars.get(ENV_TOPOLOGY_OBJECT).ok_or_else(|| {
            Error::Config(format!("Environment variable {ENV_TOPOLOGY_OBJECT} is not set"))
        })?;
        let decoded = BASE64_STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Config(format!("decoding {ENV_TOPOLOGY_OBJECT}: {e}")))?;
        Self::from_json(&decoded)
    }

    fn validate(&self) -> Result<()> {
        if self.partitions == 0 {
            return Err(Error::Config("partitions must be at least 1".to_string()));
        }
        if let Some((name, _)) = self
            .streams
            .iter()
            .find(|(_, s)| s.partitions == Some(0))
        {
            return Err(Error::Config(format!(
                "stream {name} must have at least 1 partition"
            )));
        }
        Ok(())
    }

    /// Builds the topology, resolving computation types through the registry.
    pub fn topology(&self, registry: &ComputationRegistry) -> Result<Topology> {
        let mut builder = Topology::builder();
        for computation in &self.computations {
            let factory = registry.factory(&computation.type_name, &computation.name)?;
            builder = builder.add_computation(factory, &computation.bindings)?;
        }
        builder.build()
    }

    pub fn settings(&self) -> ProcessorSettings {
        let mut settings = ProcessorSettings::new(self.partitions)
            .with_default_policy(ComputationPolicy::from(&self.policy));
        for (stream, config) in &self.streams {
            if let Some(partitions) = config.partitions {
                settings = settings.with_partitions(stream, partitions);
            }
            settings = settings.with_partitioning(stream, config.partitioning);
        }
        for computation in &self.computations {
            if let Some(policy) = &computation.policy {
                settings = settings.with_policy(&computation.name, ComputationPolicy::from(policy));
            }
        }
        if let Some(ms) = self.poll_timeout_ms {
            settings = settings.with_poll_timeout(Duration::from_millis(ms));
        }
        settings
    }
}

/// Everything a [StreamProcessor](crate::processor::StreamProcessor) needs besides the topology.
#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    default_partitions: u32,
    partitions: BTreeMap<String, u32>,
    partitioning: BTreeMap<String, Partitioning>,
    default_policy: ComputationPolicy,
    policies: BTreeMap<String, ComputationPolicy>,
    poll_timeout: Duration,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl ProcessorSettings {
    pub fn new(default_partitions: u32) -> Self {
        Self {
            default_partitions: default_partitions.max(1),
            partitions: BTreeMap::new(),
            partitioning: BTreeMap::new(),
            default_policy: ComputationPolicy::default(),
            policies: BTreeMap::new(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    pub fn with_partitions(mut self, stream: &str, partitions: u32) -> Self {
        self.partitions.insert(stream.to_string(), partitions.max(1));
        self
    }

    pub fn with_partitioning(mut self, stream: &str, partitioning: Partitioning) -> Self {
        self.partitioning.insert(stream.to_string(), partitioning);
        self
    }

    pub fn with_default_policy(mut self, policy: ComputationPolicy) -> Self {
        self.default_policy = policy;
        self
    }

    pub fn with_policy(mut self, computation: &str, policy: ComputationPolicy) -> Self {
        self.policies.insert(computation.to_string(), policy);
        self
    }

    /// How long a runner waits on an empty input before checking timers and shutdown again.
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn partitions(&self, stream: &str) -> u32 {
        self.partitions
            .get(stream)
            .copied()
            .unwrap_or(self.default_partitions)
    }

    pub fn partitioning(&self, stream: &str) -> Partitioning {
        self.partitioning.get(stream).copied().unwrap_or_default()
    }

    pub fn policy(&self, computation: &str) -> &ComputationPolicy {
        self.policies
            .get(computation)
            .unwrap_or(&self.default_policy)
    }

    pub fn poll_timeout(&self) -> Duration {
        self.poll_timeout
    }
}
