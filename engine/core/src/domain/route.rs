// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Route Model
//!
//! A route is one input uri plus an ordered list of top-level steps. Steps
//! form a tree stored in an arena ([`RouteModel`]); each [`StepNode`] refers
//! to its parent and children by [`NodeIndex`], never by pointer, so
//! structural edits (AdviceWith) cannot create ownership cycles.
//!
//! Detached nodes stay in the arena but are no longer reachable from the
//! output list. Indices are never reused.
//!
//! ## Lifecycle
//!
//! ```text
//!   authored (StepDefinition) ──push──▶ editable ──freeze──▶ frozen
//!                                          ▲                    │
//!                                          └──── thawed copy ◀──┘
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::errors::AssemblyError;
use super::policy::RoutePolicy;
use super::step::{InterceptStrategy, StepKind};

// ============================================================================
// Value Objects: Error Handling
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedeliveryPolicy {
    #[serde(default)]
    pub maximum_redeliveries: u32,

    #[serde(default = "default_redelivery_delay", with = "humantime_serde")]
    pub redelivery_delay: Duration,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default)]
    pub use_exponential_backoff: bool,

    #[serde(default = "default_maximum_redelivery_delay", with = "humantime_serde")]
    pub maximum_redelivery_delay: Duration,
}

fn default_redelivery_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_maximum_redelivery_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for RedeliveryPolicy {
    fn default() -> Self {
        Self {
            maximum_redeliveries: 0,
            redelivery_delay: default_redelivery_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            use_exponential_backoff: false,
            maximum_redelivery_delay: default_maximum_redelivery_delay(),
        }
    }
}

impl RedeliveryPolicy {
    pub fn retries(maximum_redeliveries: u32, delay: Duration) -> Self {
        Self {
            maximum_redeliveries,
            redelivery_delay: delay,
            ..Self::default()
        }
    }

    /// Delay before redelivery number `attempt` (1 based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = if self.use_exponential_backoff && attempt > 1 {
            let factor = self.backoff_multiplier.max(1.0).powi(attempt as i32 - 1);
            self.redelivery_delay.mul_f64(factor.min(1e6))
        } else {
            self.redelivery_delay
        };
        delay.min(self.maximum_redelivery_delay)
    }
}

/// Route-scoped error handler factory.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ErrorHandlerDefinition {
    /// Retry, then propagate the failure to the caller.
    #[default]
    Default,
    DefaultWith { redelivery: RedeliveryPolicy },
    /// Retry, then move the failed exchange to `uri` and mark it handled.
    DeadLetter {
        uri: String,
        redelivery: RedeliveryPolicy,
        use_original_message: bool,
    },
    /// No error handling; failures propagate unchanged.
    None,
}

impl ErrorHandlerDefinition {
    pub fn redelivery(&self) -> RedeliveryPolicy {
        match self {
            Self::DefaultWith { redelivery } | Self::DeadLetter { redelivery, .. } => {
                redelivery.clone()
            }
            Self::Default | Self::None => RedeliveryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownMode {
    /// Wait for in-flight exchanges up to the engine's shutdown timeout.
    #[default]
    Default,
    /// Stop without waiting.
    Immediate,
}

/// Declared input/output data types checked by registered validators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Contract {
    pub input_type: Option<String>,
    pub output_type: Option<String>,
    pub validate: bool,
}

// ============================================================================
// Step Definitions and the Arena
// ============================================================================

/// Owned tree literal used to author a route.
#[derive(Clone)]
pub struct StepDefinition {
    pub kind: StepKind,
    pub id: Option<String>,
    pub children: Vec<StepDefinition>,
    /// `Some(false)` opts out of the route error handler.
    pub inherit_error_handler: Option<bool>,
    pub disabled: bool,
    pub interceptors: Vec<Arc<dyn InterceptStrategy>>,
}

impl StepDefinition {
    pub fn new(kind: StepKind) -> Self {
        Self {
            kind,
            id: None,
            children: Vec::new(),
            inherit_error_handler: None,
            disabled: false,
            interceptors: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn child(mut self, child: StepDefinition) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_children(mut self, children: Vec<StepDefinition>) -> Self {
        self.children.extend(children);
        self
    }

    pub fn inherit_error_handler(mut self, inherit: bool) -> Self {
        self.inherit_error_handler = Some(inherit);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn intercepted_by(mut self, strategy: Arc<dyn InterceptStrategy>) -> Self {
        self.interceptors.push(strategy);
        self
    }
}

impl From<StepKind> for StepDefinition {
    fn from(kind: StepKind) -> Self {
        Self::new(kind)
    }
}

impl fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDefinition")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("children", &self.children)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIndex(usize);

impl NodeIndex {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Clone)]
pub struct StepNode {
    pub kind: StepKind,
    id: Option<String>,
    custom_id: bool,
    parent: Option<NodeIndex>,
    children: Vec<NodeIndex>,
    pub inherit_error_handler: Option<bool>,
    pub disabled: bool,
    pub interceptors: Vec<Arc<dyn InterceptStrategy>>,
}

impl StepNode {
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn has_custom_id(&self) -> bool {
        self.custom_id
    }

    /// Id when assigned, otherwise the kind label.
    pub fn label(&self) -> String {
        match &self.id {
            Some(id) => id.clone(),
            None => self.kind.to_string(),
        }
    }

    pub fn parent(&self) -> Option<NodeIndex> {
        self.parent
    }

    pub fn children(&self) -> &[NodeIndex] {
        &self.children
    }
}

impl fmt::Debug for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepNode")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("children", &self.children)
            .finish()
    }
}

/// Where a node is linked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Output,
    CrossCutting,
    Child(NodeIndex),
}

#[derive(Clone, Debug)]
pub struct RouteModel {
    from_uri: String,
    nodes: Vec<StepNode>,
    outputs: Vec<NodeIndex>,
    cross_cutting: Vec<NodeIndex>,
    frozen: bool,
}

impl RouteModel {
    pub fn new(from_uri: impl Into<String>) -> Self {
        Self {
            from_uri: from_uri.into(),
            nodes: Vec::new(),
            outputs: Vec::new(),
            cross_cutting: Vec::new(),
            frozen: false,
        }
    }

    pub fn from_uri(&self) -> &str {
        &self.from_uri
    }

    pub fn set_from_uri(&mut self, uri: impl Into<String>) -> Result<(), AssemblyError> {
        self.ensure_editable()?;
        self.from_uri = uri.into();
        Ok(())
    }

    pub fn node(&self, index: NodeIndex) -> &StepNode {
        &self.nodes[index.0]
    }

    pub fn outputs(&self) -> &[NodeIndex] {
        &self.outputs
    }

    /// Abstract nodes moved out of the linear chain.
    pub fn cross_cutting(&self) -> &[NodeIndex] {
        &self.cross_cutting
    }

    pub fn children(&self, index: NodeIndex) -> &[NodeIndex] {
        &self.nodes[index.0].children
    }

    pub fn parent(&self, index: NodeIndex) -> Option<NodeIndex> {
        self.nodes[index.0].parent
    }

    /// Top-level nodes have depth 1.
    pub fn depth(&self, index: NodeIndex) -> usize {
        self.ancestors(index).count() + 1
    }

    pub fn ancestors(&self, index: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        std::iter::successors(self.parent(index), move |current| self.parent(*current))
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Editable copy of a frozen model.
    pub fn thawed(&self) -> RouteModel {
        let mut copy = self.clone();
        copy.frozen = false;
        copy
    }

    fn ensure_editable(&self) -> Result<(), AssemblyError> {
        if self.frozen {
            return Err(AssemblyError::InvalidConfiguration(
                "route model is frozen once reified".to_string(),
            ));
        }
        Ok(())
    }

    fn alloc(&mut self, definition: StepDefinition, parent: Option<NodeIndex>) -> NodeIndex {
        let index = NodeIndex(self.nodes.len());
        let custom_id = definition.id.is_some();
        self.nodes.push(StepNode {
            kind: definition.kind,
            id: definition.id,
            custom_id,
            parent,
            children: Vec::new(),
            inherit_error_handler: definition.inherit_error_handler,
            disabled: definition.disabled,
            interceptors: definition.interceptors,
        });
        for child in definition.children {
            let child_index = self.alloc(child, Some(index));
            self.nodes[index.0].children.push(child_index);
        }
        index
    }

    /// Append a top-level step.
    pub fn push(&mut self, definition: StepDefinition) -> Result<NodeIndex, AssemblyError> {
        self.ensure_editable()?;
        let index = self.alloc(definition, None);
        self.outputs.push(index);
        Ok(index)
    }

    pub fn push_child(
        &mut self,
        parent: NodeIndex,
        definition: StepDefinition,
    ) -> Result<NodeIndex, AssemblyError> {
        self.ensure_editable()?;
        let index = self.alloc(definition, Some(parent));
        self.nodes[parent.0].children.push(index);
        Ok(index)
    }

    fn slot_of(&self, index: NodeIndex) -> Option<(Slot, usize)> {
        if let Some(parent) = self.parent(index) {
            let pos = self.nodes[parent.0].children.iter().position(|c| *c == index)?;
            return Some((Slot::Child(parent), pos));
        }
        if let Some(pos) = self.outputs.iter().position(|c| *c == index) {
            return Some((Slot::Output, pos));
        }
        self.cross_cutting
            .iter()
            .position(|c| *c == index)
            .map(|pos| (Slot::CrossCutting, pos))
    }

    fn slot_mut(&mut self, slot: Slot) -> &mut Vec<NodeIndex> {
        match slot {
            Slot::Output => &mut self.outputs,
            Slot::CrossCutting => &mut self.cross_cutting,
            Slot::Child(parent) => &mut self.nodes[parent.0].children,
        }
    }

    fn locate(&self, index: NodeIndex) -> Result<(Slot, usize), AssemblyError> {
        self.slot_of(index).ok_or_else(|| {
            AssemblyError::InvalidConfiguration(format!(
                "step '{}' is not attached to the route",
                self.node(index).label()
            ))
        })
    }

    /// Unlink a node from its output list. The subtree stays in the arena.
    pub fn detach(&mut self, index: NodeIndex) -> Result<(), AssemblyError> {
        self.ensure_editable()?;
        let (slot, pos) = self.locate(index)?;
        self.slot_mut(slot).remove(pos);
        Ok(())
    }

    fn insert_at(
        &mut self,
        slot: Slot,
        pos: usize,
        definitions: Vec<StepDefinition>,
    ) -> Vec<NodeIndex> {
        let parent = match slot {
            Slot::Child(parent) => Some(parent),
            _ => None,
        };
        let created: Vec<NodeIndex> = definitions
            .into_iter()
            .map(|definition| self.alloc(definition, parent))
            .collect();
        let list = self.slot_mut(slot);
        for (offset, index) in created.iter().enumerate() {
            list.insert(pos + offset, *index);
        }
        created
    }

    pub fn insert_before(
        &mut self,
        anchor: NodeIndex,
        definitions: Vec<StepDefinition>,
    ) -> Result<Vec<NodeIndex>, AssemblyError> {
        self.ensure_editable()?;
        let (slot, pos) = self.locate(anchor)?;
        Ok(self.insert_at(slot, pos, definitions))
    }

    pub fn insert_after(
        &mut self,
        anchor: NodeIndex,
        definitions: Vec<StepDefinition>,
    ) -> Result<Vec<NodeIndex>, AssemblyError> {
        self.ensure_editable()?;
        let (slot, pos) = self.locate(anchor)?;
        Ok(self.insert_at(slot, pos + 1, definitions))
    }

    pub fn replace(
        &mut self,
        target: NodeIndex,
        definitions: Vec<StepDefinition>,
    ) -> Result<Vec<NodeIndex>, AssemblyError> {
        self.ensure_editable()?;
        let (slot, pos) = self.locate(target)?;
        self.slot_mut(slot).remove(pos);
        Ok(self.insert_at(slot, pos, definitions))
    }

    /// Move top-level abstract nodes out of the linear output list.
    pub fn separate_cross_cutting(&mut self) -> Result<Vec<NodeIndex>, AssemblyError> {
        self.ensure_editable()?;
        let (abstract_nodes, linear): (Vec<NodeIndex>, Vec<NodeIndex>) = self
            .outputs
            .iter()
            .copied()
            .partition(|index| self.nodes[index.0].kind.is_abstract());
        self.outputs = linear;
        self.cross_cutting.extend(abstract_nodes.iter().copied());
        Ok(abstract_nodes)
    }

    /// Depth-first walk over attached nodes with their depth.
    pub fn walk(&self) -> Vec<(NodeIndex, usize)> {
        let mut visited = Vec::new();
        let roots: Vec<NodeIndex> = self
            .outputs
            .iter()
            .chain(self.cross_cutting.iter())
            .copied()
            .collect();
        for root in roots {
            self.walk_from(root, 1, &mut visited);
        }
        visited
    }

    fn walk_from(&self, index: NodeIndex, depth: usize, visited: &mut Vec<(NodeIndex, usize)>) {
        visited.push((index, depth));
        for child in &self.nodes[index.0].children {
            self.walk_from(*child, depth + 1, visited);
        }
    }

    /// Kind names of the linear chain, depth first.
    pub fn kind_sequence(&self) -> Vec<String> {
        let mut visited = Vec::new();
        for root in &self.outputs {
            self.walk_from(*root, 1, &mut visited);
        }
        visited
            .into_iter()
            .map(|(index, _)| self.node(index).kind.kind_name().to_string())
            .collect()
    }

    pub fn find_by_id(&self, id: &str) -> Option<NodeIndex> {
        self.walk()
            .into_iter()
            .map(|(index, _)| index)
            .find(|index| self.node(*index).id() == Some(id))
    }

    /// Assign `<kind><n>` ids to nodes without one and reject duplicates.
    pub fn assign_ids(&mut self) -> Result<(), AssemblyError> {
        let attached = self.walk();
        let mut seen: HashSet<String> = HashSet::new();
        for (index, _) in &attached {
            if let Some(id) = &self.nodes[index.0].id {
                if !seen.insert(id.clone()) {
                    return Err(AssemblyError::InvalidConfiguration(format!(
                        "duplicate step id '{id}'"
                    )));
                }
            }
        }

        let mut counters: HashMap<String, usize> = HashMap::new();
        for (index, _) in attached {
            if self.nodes[index.0].id.is_some() {
                continue;
            }
            let kind = self.nodes[index.0].kind.kind_name().to_string();
            let id = loop {
                let counter = counters.entry(kind.clone()).or_insert(0);
                *counter += 1;
                let candidate = format!("{kind}{counter}");
                if seen.insert(candidate.clone()) {
                    break candidate;
                }
            };
            self.nodes[index.0].id = Some(id);
        }
        Ok(())
    }
}

// ============================================================================
// Route Definition
// ============================================================================

#[derive(Clone)]
pub struct RouteDefinition {
    pub id: String,
    pub model: RouteModel,
    pub error_handler: ErrorHandlerDefinition,
    pub interceptors: Vec<Arc<dyn InterceptStrategy>>,
    pub route_policies: Vec<Arc<dyn RoutePolicy>>,
    /// Overrides the engine-wide tracing switch.
    pub tracing: Option<bool>,
    /// Bodies are in-memory values; recorded for hosts that stream payloads.
    pub stream_caching: bool,
    /// Fixed delay applied before every step.
    pub delayer: Option<Duration>,
    pub startup_order: Option<u32>,
    pub shutdown_mode: ShutdownMode,
    pub auto_startup: bool,
    pub contract: Option<Contract>,
    pub description: Option<String>,
}

impl RouteDefinition {
    pub fn new(id: impl Into<String>, from_uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: RouteModel::new(from_uri),
            error_handler: ErrorHandlerDefinition::default(),
            interceptors: Vec::new(),
            route_policies: Vec::new(),
            tracing: None,
            stream_caching: false,
            delayer: None,
            startup_order: None,
            shutdown_mode: ShutdownMode::default(),
            auto_startup: true,
            contract: None,
            description: None,
        }
    }

    /// Append a top-level step while authoring.
    pub fn step(mut self, definition: impl Into<StepDefinition>) -> Result<Self, AssemblyError> {
        self.model.push(definition.into())?;
        Ok(self)
    }

    pub fn steps(mut self, definitions: Vec<StepDefinition>) -> Result<Self, AssemblyError> {
        for definition in definitions {
            self.model.push(definition)?;
        }
        Ok(self)
    }

    pub fn with_error_handler(mut self, error_handler: ErrorHandlerDefinition) -> Self {
        self.error_handler = error_handler;
        self
    }

    pub fn with_interceptor(mut self, strategy: Arc<dyn InterceptStrategy>) -> Self {
        self.interceptors.push(strategy);
        self
    }

    pub fn with_route_policy(mut self, policy: Arc<dyn RoutePolicy>) -> Self {
        self.route_policies.push(policy);
        self
    }

    pub fn with_contract(mut self, contract: Contract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn from_uri(&self) -> &str {
        self.model.from_uri()
    }
}

impl fmt::Debug for RouteDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteDefinition")
            .field("id", &self.id)
            .field("from", &self.model.from_uri())
            .field("steps", &self.model.kind_sequence())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route() -> RouteModel {
        let mut model = RouteModel::new("direct:start");
        model.push(StepKind::to("mock:a").into()).unwrap();
        model
            .push(StepDefinition::new(StepKind::Pipeline).with_children(vec![
                StepKind::to("mock:b").into(),
                StepKind::Stop.into(),
            ]))
            .unwrap();
        model.push(StepKind::to("mock:c").into()).unwrap();
        model
    }

    #[test]
    fn test_assign_ids_per_kind() {
        let mut model = route();
        model.assign_ids().unwrap();
        let ids: Vec<String> = model
            .walk()
            .into_iter()
            .map(|(i, _)| model.node(i).id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["to1", "pipeline1", "to2", "stop1", "to3"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut model = RouteModel::new("direct:dup");
        model.push(StepDefinition::new(StepKind::Stop).with_id("x")).unwrap();
        model.push(StepDefinition::new(StepKind::Stop).with_id("x")).unwrap();
        assert!(model.assign_ids().is_err());
    }

    #[test]
    fn test_parent_and_depth() {
        let model = route();
        let pipeline = model.outputs()[1];
        let nested = model.children(pipeline)[0];
        assert_eq!(model.parent(nested), Some(pipeline));
        assert_eq!(model.depth(nested), 2);
        assert_eq!(model.depth(pipeline), 1);
    }

    #[test]
    fn test_structural_edits() {
        let mut model = route();
        let pipeline = model.outputs()[1];
        let nested = model.children(pipeline)[0];

        model.insert_before(nested, vec![StepKind::Pipeline.into()]).unwrap();
        model.replace(model.outputs()[0], vec![StepKind::Stop.into()]).unwrap();
        model.detach(model.outputs()[2]).unwrap();

        assert_eq!(model.kind_sequence(), vec!["stop", "pipeline", "pipeline", "to", "stop"]);
    }

    #[test]
    fn test_frozen_model_rejects_edits() {
        let mut model = route();
        model.freeze();
        assert!(model.push(StepKind::Stop.into()).is_err());
        let mut copy = model.thawed();
        assert!(copy.push(StepKind::Stop.into()).is_ok());
    }

    #[test]
    fn test_redelivery_backoff() {
        let policy = RedeliveryPolicy {
            maximum_redeliveries: 5,
            redelivery_delay: Duration::from_millis(100),
            use_exponential_backoff: true,
            maximum_redelivery_delay: Duration::from_millis(350),
            ..Default::default()
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    }
}
