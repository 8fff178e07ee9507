// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Registry - opaque name to object store for named collaborators
//
// Aggregation strategies, repositories, policies, comparators and executors
// may be referenced by name from a step. The registry is object-safe; typed
// lookups are provided on `dyn Registry`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use super::errors::AssemblyError;

pub type Bean = Arc<dyn Any + Send + Sync>;

pub trait Registry: Send + Sync {
    fn bind_any(&self, name: &str, bean: Bean);

    fn lookup_any(&self, name: &str) -> Option<Bean>;

    fn unbind(&self, name: &str) -> Option<Bean>;

    /// Snapshot of every binding.
    fn entries(&self) -> Vec<(String, Bean)>;
}

impl<'a> dyn Registry + 'a {
    /// Bind a shared collaborator; `T` may be a trait object.
    pub fn bind<T: ?Sized + Send + Sync + 'static>(&self, name: &str, bean: Arc<T>) {
        self.bind_any(name, Arc::new(bean));
    }

    pub fn lookup<T: ?Sized + Send + Sync + 'static>(&self, name: &str) -> Option<Arc<T>> {
        self.lookup_any(name)?.downcast_ref::<Arc<T>>().cloned()
    }

    pub fn mandatory_lookup<T: ?Sized + Send + Sync + 'static>(
        &self,
        name: &str,
    ) -> Result<Arc<T>, AssemblyError> {
        self.lookup::<T>(name).ok_or_else(|| AssemblyError::NoSuchBean {
            name: name.to_string(),
            type_name: std::any::type_name::<T>(),
        })
    }

    /// Every binding whose type is `T`, sorted by name.
    pub fn find_by_type<T: ?Sized + Send + Sync + 'static>(&self) -> Vec<(String, Arc<T>)> {
        let mut found: Vec<(String, Arc<T>)> = self
            .entries()
            .into_iter()
            .filter_map(|(name, bean)| {
                bean.downcast_ref::<Arc<T>>()
                    .cloned()
                    .map(|typed| (name, typed))
            })
            .collect();
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }
}

/// A collaborator given either inline or by registry name.
pub enum BeanRef<T: ?Sized> {
    Instance(Arc<T>),
    Named(String),
}

impl<T: ?Sized> BeanRef<T> {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn instance(bean: Arc<T>) -> Self {
        Self::Instance(bean)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Named(name) => Some(name),
            Self::Instance(_) => None,
        }
    }
}

impl<T: ?Sized + Send + Sync + 'static> BeanRef<T> {
    pub fn resolve(&self, registry: &dyn Registry) -> Result<Arc<T>, AssemblyError> {
        match self {
            Self::Instance(bean) => Ok(bean.clone()),
            Self::Named(name) => registry.mandatory_lookup::<T>(name),
        }
    }
}

impl<T: ?Sized> Clone for BeanRef<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Instance(bean) => Self::Instance(bean.clone()),
            Self::Named(name) => Self::Named(name.clone()),
        }
    }
}

impl<T: ?Sized> fmt::Debug for BeanRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instance(_) => write!(f, "Instance(..)"),
            Self::Named(name) => write!(f, "Named({name})"),
        }
    }
}
