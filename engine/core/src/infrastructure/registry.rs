// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use dashmap::DashMap;

use crate::domain::registry::{Bean, Registry};

/// Concurrent in-memory registry.
#[derive(Default)]
pub struct InMemoryRegistry {
    beans: DashMap<String, Bean>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }
}

impl Registry for InMemoryRegistry {
    fn bind_any(&self, name: &str, bean: Bean) {
        self.beans.insert(name.to_string(), bean);
    }

    fn lookup_any(&self, name: &str) -> Option<Bean> {
        self.beans.get(name).map(|entry| entry.value().clone())
    }

    fn unbind(&self, name: &str) -> Option<Bean> {
        self.beans.remove(name).map(|(_, bean)| bean)
    }

    fn entries(&self) -> Vec<(String, Bean)> {
        self.beans
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}
