// Copyright 2026 larder Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::time::Duration;

use larder_common::error::{Error, Result};
use larder_io::Serializer;
use larder_runtime::Shard;
use serde::{Deserialize, Serialize};

use crate::{bag::DEFAULT_EVICTION_SAMPLES, cache::PageCache};

/// Configurations of a [`PageCache`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PageCacheConfig {
    /// Bytes of resident pages the cache evicts down to.
    pub memory_limit: u64,
    /// Members sampled per victim selection.
    pub eviction_samples: usize,
    /// Period of the background writeback pass.
    pub writeback_interval: Duration,
    /// Maximum pages written per background pass.
    pub writeback_batch: usize,
    /// Seed of the eviction sampling, for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for PageCacheConfig {
    fn default() -> Self {
        Self {
            memory_limit: 64 * 1024 * 1024,
            eviction_samples: DEFAULT_EVICTION_SAMPLES,
            writeback_interval: Duration::from_secs(1),
            writeback_batch: 64,
            seed: None,
        }
    }
}

impl PageCacheConfig {
    pub(crate) fn verify(&self, block_size: usize) -> Result<()> {
        if self.memory_limit < block_size as u64 {
            return Err(Error::config(format!(
                "memory limit ({}) must hold at least one block ({block_size})",
                self.memory_limit
            )));
        }
        if self.eviction_samples == 0 {
            return Err(Error::config("eviction samples must be greater than 0"));
        }
        if self.writeback_interval.is_zero() {
            return Err(Error::config("writeback interval must be greater than 0"));
        }
        if self.writeback_batch == 0 {
            return Err(Error::config("writeback batch must be greater than 0"));
        }
        Ok(())
    }
}

/// Builder of a [`PageCache`].
#[derive(Debug, Default)]
pub struct PageCacheBuilder {
    config: PageCacheConfig,
}

impl PageCacheBuilder {
    /// Create a builder with default configurations.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all configurations.
    pub fn with_config(mut self, config: PageCacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the memory limit in bytes.
    ///
    /// Default: 64 MiB.
    pub fn with_memory_limit(mut self, memory_limit: u64) -> Self {
        self.config.memory_limit = memory_limit;
        self
    }

    /// Set how many pages are sampled per victim selection.
    ///
    /// Default: `5`.
    pub fn with_eviction_samples(mut self, eviction_samples: usize) -> Self {
        self.config.eviction_samples = eviction_samples;
        self
    }

    /// Set the period of the background writeback pass.
    ///
    /// Default: 1s.
    pub fn with_writeback_interval(mut self, writeback_interval: Duration) -> Self {
        self.config.writeback_interval = writeback_interval;
        self
    }

    /// Set the maximum pages written per background pass.
    ///
    /// Default: `64`.
    pub fn with_writeback_batch(mut self, writeback_batch: usize) -> Self {
        self.config.writeback_batch = writeback_batch;
        self
    }

    /// Seed the eviction sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.config.seed = Some(seed);
        self
    }

    /// Build the cache on `shard`, reading and writing blocks through `serializer`.
    ///
    /// Spawns the background writer on the shard's scheduler.
    pub fn build(self, shard: &Shard, serializer: Serializer) -> Result<PageCache> {
        self.config.verify(serializer.block_size())?;
        Ok(PageCache::open(shard, serializer, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn test_config_serde_defaults() {
        let config: PageCacheConfig = serde_json::from_str(r#"{ "memory_limit": 8192, "seed": 3 }"#).unwrap();
        assert_eq!(config.memory_limit, 8192);
        assert_eq!(config.eviction_samples, 5);
        assert_eq!(config.writeback_batch, 64);
        assert_eq!(config.seed, Some(3));

        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(serde_json::from_str::<PageCacheConfig>(&json).unwrap(), config);
    }

    #[test_log::test]
    fn test_verify() {
        assert!(PageCacheConfig::default().verify(4096).is_ok());
        let config = PageCacheConfig {
            memory_limit: 100,
            ..Default::default()
        };
        let err = config.verify(4096).unwrap_err();
        assert_eq!(err.kind(), larder_common::error::ErrorKind::Config);
        let config = PageCacheConfig {
            eviction_samples: 0,
            ..Default::default()
        };
        assert!(config.verify(4096).is_err());
    }
}
