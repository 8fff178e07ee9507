// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Thread pool resolution
//
// A pool is either borrowed (given inline, bound in the registry, or
// registered as a shared pool with the executor manager) or created for the
// step from a profile reference or the default profile. Created pools are
// owned by the route and shut down with it; borrowed pools never are. A named
// pool reference never creates a pool.

use tracing::debug;

use super::ReifyContext;
use crate::domain::errors::AssemblyError;
use crate::domain::executor::{ExecutorHandle, ExecutorServiceManager, ThreadPoolProfile};
use crate::domain::registry::BeanRef;
use crate::domain::step::ExecutorRef;

/// Decided at reification time, before any pool exists.
pub fn will_create_new_thread_pool(
    ctx: &ReifyContext<'_>,
    executor: Option<&ExecutorRef>,
    use_default: bool,
) -> Result<bool, AssemblyError> {
    match executor {
        None => Ok(use_default),
        Some(ExecutorRef::Pool(_)) => Ok(false),
        Some(ExecutorRef::Profile(id)) => match ctx.engine.executors.profile(id) {
            Some(_) => Ok(true),
            None => Err(unknown_profile(id)),
        },
    }
}

fn unknown_executor(name: &str) -> AssemblyError {
    AssemblyError::NoSuchBean {
        name: name.to_string(),
        type_name: "ExecutorHandle",
    }
}

fn unknown_profile(id: &str) -> AssemblyError {
    AssemblyError::NoSuchBean {
        name: id.to_string(),
        type_name: "ThreadPoolProfile",
    }
}

/// A borrowed pool: bound in the registry or shared through the executor
/// manager.
fn lookup_pool(ctx: &ReifyContext<'_>, pool: &BeanRef<ExecutorHandle>) -> Result<ExecutorHandle, AssemblyError> {
    match pool {
        BeanRef::Instance(handle) => Ok(handle.as_ref().clone()),
        BeanRef::Named(name) => ctx
            .registry()
            .lookup::<ExecutorHandle>(name)
            .map(|handle| handle.as_ref().clone())
            .or_else(|| ctx.engine.executors.lookup_pool(name))
            .ok_or_else(|| unknown_executor(name)),
    }
}

/// Resolve the pool a step runs on. `None` only when nothing is configured
/// and `use_default` is false.
pub fn resolve_executor(
    ctx: &ReifyContext<'_>,
    pool_name: &str,
    executor: Option<&ExecutorRef>,
    use_default: bool,
) -> Result<Option<ExecutorHandle>, AssemblyError> {
    let handle = match executor {
        None if !use_default => return Ok(None),
        None => {
            let pool = ctx.engine.executors.new_default_pool(pool_name);
            ctx.route.own_executor(pool.clone());
            pool
        }
        Some(ExecutorRef::Pool(pool)) => lookup_pool(ctx, pool)?,
        Some(ExecutorRef::Profile(id)) => {
            let profile = ctx.engine.executors.profile(id).ok_or_else(|| unknown_profile(id))?;
            owned_pool(ctx, pool_name, &profile)
        }
    };
    Ok(Some(handle))
}

/// A pool built from `profile` and owned by the route.
pub fn owned_pool(ctx: &ReifyContext<'_>, pool_name: &str, profile: &ThreadPoolProfile) -> ExecutorHandle {
    debug!(route_id = %ctx.route.route_id, pool = %pool_name, profile = %profile.id, "Route owns new thread pool");
    let pool = ctx.engine.executors.new_pool(pool_name, profile);
    ctx.route.own_executor(pool.clone());
    pool
}

/// Owned single-thread pool.
pub fn owned_single_thread_pool(ctx: &ReifyContext<'_>, pool_name: &str) -> ExecutorHandle {
    let pool = ctx.engine.executors.new_single_thread_pool(pool_name);
    ctx.route.own_executor(pool.clone());
    pool
}

/// Pool name derived from the route and step.
pub fn pool_name(ctx: &ReifyContext<'_>, label: &str) -> String {
    format!("{}-{}", ctx.route.route_id, label)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::engine;
    use super::*;
    use crate::application::route_context::RouteContext;
    use crate::domain::route::RouteDefinition;
    use std::sync::Arc;

    #[test]
    fn test_will_create_new_thread_pool() {
        let (engine, _) = engine();
        let definition = RouteDefinition::new("r1", "direct:in");
        let route = RouteContext::new(&definition, false);
        let ctx = ReifyContext::new(&engine, &route, &definition.model).unwrap();

        let shared = ExecutorHandle::new("shared", ThreadPoolProfile::new("shared"));
        engine.registry.bind("bound", Arc::new(shared.clone()));
        engine.executors.register_pool("pooled", shared.clone());

        assert!(will_create_new_thread_pool(&ctx, None, true).unwrap());
        assert!(!will_create_new_thread_pool(&ctx, None, false).unwrap());
        assert!(!will_create_new_thread_pool(&ctx, Some(&ExecutorRef::instance(Arc::new(shared))), true).unwrap());
        for name in ["bound", "pooled", "default", "missing"] {
            for use_default in [true, false] {
                let named = ExecutorRef::named(name);
                assert!(!will_create_new_thread_pool(&ctx, Some(&named), use_default).unwrap());
            }
        }
    }

    #[test]
    fn test_profile_reference_creates_pool() {
        let (engine, _) = engine();
        let definition = RouteDefinition::new("r1", "direct:in");
        let route = RouteContext::new(&definition, false);
        let ctx = ReifyContext::new(&engine, &route, &definition.model).unwrap();

        let profile = ExecutorRef::profile("default");
        assert!(will_create_new_thread_pool(&ctx, Some(&profile), false).unwrap());
        assert!(resolve_executor(&ctx, "r1-threads1", Some(&profile), false).unwrap().is_some());
        assert_eq!(route.owned_executors().len(), 1);

        assert!(matches!(
            will_create_new_thread_pool(&ctx, Some(&ExecutorRef::profile("missing")), true),
            Err(AssemblyError::NoSuchBean { .. })
        ));
    }

    #[test]
    fn test_named_pool_never_falls_back_to_profile() {
        let (engine, _) = engine();
        let definition = RouteDefinition::new("r1", "direct:in");
        let route = RouteContext::new(&definition, false);
        let ctx = ReifyContext::new(&engine, &route, &definition.model).unwrap();

        let err = resolve_executor(&ctx, "r1-threads1", Some(&ExecutorRef::named("default")), true).unwrap_err();
        assert!(matches!(err, AssemblyError::NoSuchBean { .. }));
        assert!(route.owned_executors().is_empty());
    }

    #[test]
    fn test_only_created_pools_are_owned() {
        let (engine, _) = engine();
        let definition = RouteDefinition::new("r1", "direct:in");
        let route = RouteContext::new(&definition, false);
        let ctx = ReifyContext::new(&engine, &route, &definition.model).unwrap();
        engine
            .executors
            .register_pool("pooled", ExecutorHandle::new("pooled", ThreadPoolProfile::new("pooled")));

        let borrowed = resolve_executor(&ctx, "r1-wireTap1", Some(&ExecutorRef::named("pooled")), true).unwrap();
        assert!(borrowed.is_some());
        assert!(route.owned_executors().is_empty());

        resolve_executor(&ctx, "r1-wireTap2", None, true).unwrap();
        assert_eq!(route.owned_executors().len(), 1);
        assert!(resolve_executor(&ctx, "r1-wireTap3", None, false).unwrap().is_none());
    }
}
