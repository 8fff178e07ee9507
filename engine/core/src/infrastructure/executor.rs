// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Executor service manager backed by the tokio runtime
//
// Shared pools are registered by name and never shut down by the units that
// borrow them. Pools created through `new_pool` belong to the caller.

use dashmap::DashMap;
use tracing::{debug, info};

use crate::domain::config::EngineConfig;
use crate::domain::executor::{ExecutorHandle, ExecutorServiceManager, ThreadPoolProfile};

pub struct DefaultExecutorServiceManager {
    default_profile: ThreadPoolProfile,
    profiles: DashMap<String, ThreadPoolProfile>,
    pools: DashMap<String, ExecutorHandle>,
}

impl DefaultExecutorServiceManager {
    pub fn new(config: &EngineConfig) -> Self {
        let profiles = DashMap::new();
        for profile in &config.thread_pool_profiles {
            profiles.insert(profile.id.clone(), profile.clone());
        }
        Self {
            default_profile: config.default_thread_pool.clone(),
            profiles,
            pools: DashMap::new(),
        }
    }

    pub fn add_profile(&self, profile: ThreadPoolProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    /// Shut down every registered shared pool.
    pub fn shutdown_all(&self) {
        for entry in self.pools.iter() {
            entry.value().shutdown();
        }
    }
}

impl Default for DefaultExecutorServiceManager {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl ExecutorServiceManager for DefaultExecutorServiceManager {
    fn new_pool(&self, name: &str, profile: &ThreadPoolProfile) -> ExecutorHandle {
        info!(
            pool = %name,
            profile = %profile.id,
            pool_size = profile.pool_size,
            max_pool_size = profile.max_pool_size,
            keep_alive = ?profile.keep_alive,
            "Creating thread pool"
        );
        ExecutorHandle::new(name, profile.clone())
    }

    fn lookup_pool(&self, name: &str) -> Option<ExecutorHandle> {
        self.pools.get(name).map(|entry| entry.value().clone())
    }

    fn register_pool(&self, name: &str, pool: ExecutorHandle) {
        debug!(pool = %name, "Registering shared thread pool");
        self.pools.insert(name.to_string(), pool);
    }

    fn profile(&self, name: &str) -> Option<ThreadPoolProfile> {
        if name == self.default_profile.id {
            return Some(self.default_profile.clone());
        }
        self.profiles.get(name).map(|entry| entry.value().clone())
    }

    fn default_profile(&self) -> ThreadPoolProfile {
        self.default_profile.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_from_config() {
        let mut config = EngineConfig::default();
        config.thread_pool_profiles.push(ThreadPoolProfile {
            pool_size: 2,
            max_pool_size: 2,
            ..ThreadPoolProfile::new("small")
        });
        let manager = DefaultExecutorServiceManager::new(&config);

        assert_eq!(manager.profile("small").unwrap().max_pool_size, 2);
        assert!(manager.profile("default").is_some());
        assert!(manager.profile("missing").is_none());
    }

    #[tokio::test]
    async fn test_registered_pool_lookup() {
        let manager = DefaultExecutorServiceManager::default();
        let pool = manager.new_default_pool("shared");
        manager.register_pool("shared", pool.clone());

        let found = manager.lookup_pool("shared").unwrap();
        assert!(found.ptr_eq(&pool));
        assert!(manager.lookup_pool("other").is_none());

        manager.shutdown_all();
        assert!(pool.is_shutdown());
    }
}
