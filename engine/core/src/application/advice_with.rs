// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// AdviceWith
//
// Structural edits on an already assembled route. Edits apply to a thawed
// copy of the route model; the engine context reassembles the edited
// definition from scratch and swaps it in for the running route.
//
// A weave selects steps by id, by string form, by destination uri or by kind,
// narrows the matches (first, last, index, range or all) within a maximum
// depth, then replaces, removes or inserts around them.

use regex::Regex;
use tracing::debug;

use crate::domain::errors::AssemblyError;
use crate::domain::route::{ErrorHandlerDefinition, NodeIndex, RouteDefinition, RouteModel, StepDefinition};

#[derive(Debug, Clone)]
pub enum Matcher {
    Id(String),
    ToString(String),
    Uri(String),
    /// Kind name such as `to` or `split`, compared case-insensitively.
    Type(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Selection {
    First,
    Last,
    Index(usize),
    /// Inclusive on both ends.
    Range(usize, usize),
    #[default]
    All,
}

/// Exact match, then trailing `*` prefix match, then an anchored regex.
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if pattern == value {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if value.starts_with(prefix) {
            return true;
        }
    }
    Regex::new(&format!("^(?:{pattern})$"))
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

impl Matcher {
    fn matches(&self, model: &RouteModel, index: NodeIndex) -> bool {
        let node = model.node(index);
        match self {
            Self::Id(pattern) => node.id().is_some_and(|id| matches_pattern(pattern, id)),
            Self::ToString(pattern) => matches_pattern(pattern, &node.kind.to_string()),
            Self::Uri(pattern) => node.kind.uri().is_some_and(|uri| matches_pattern(pattern, uri)),
            Self::Type(kind) => node.kind.kind_name().eq_ignore_ascii_case(kind),
        }
    }
}

/// Editable view of one route handed to the advice closure.
pub struct AdviceWith {
    definition: RouteDefinition,
    edits: usize,
    rejected: Option<String>,
}

impl AdviceWith {
    /// Start advising `definition`; a frozen model is thawed first.
    pub fn new(mut definition: RouteDefinition) -> Self {
        if definition.model.is_frozen() {
            definition.model = definition.model.thawed();
        }
        Self {
            definition,
            edits: 0,
            rejected: None,
        }
    }

    pub fn route_id(&self) -> &str {
        &self.definition.id
    }

    pub fn model(&self) -> &RouteModel {
        &self.definition.model
    }

    pub fn weave_by_id(&mut self, pattern: impl Into<String>) -> Weave<'_> {
        self.weave(Matcher::Id(pattern.into()))
    }

    pub fn weave_by_to_string(&mut self, pattern: impl Into<String>) -> Weave<'_> {
        self.weave(Matcher::ToString(pattern.into()))
    }

    pub fn weave_by_uri(&mut self, pattern: impl Into<String>) -> Weave<'_> {
        self.weave(Matcher::Uri(pattern.into()))
    }

    pub fn weave_by_type(&mut self, kind: impl Into<String>) -> Weave<'_> {
        self.weave(Matcher::Type(kind.into()))
    }

    pub fn weave(&mut self, matcher: Matcher) -> Weave<'_> {
        Weave {
            advice: self,
            matcher,
            selection: Selection::All,
            max_depth: None,
        }
    }

    /// Append steps to the end of the route.
    pub fn weave_add_last(&mut self, definitions: Vec<StepDefinition>) -> Result<(), AssemblyError> {
        for definition in definitions {
            self.definition.model.push(definition)?;
        }
        self.edits += 1;
        Ok(())
    }

    pub fn replace_from_with(&mut self, uri: impl Into<String>) -> Result<(), AssemblyError> {
        self.definition.model.set_from_uri(uri)?;
        self.edits += 1;
        Ok(())
    }

    /// Error handlers cannot be redefined through advice; the attempt is
    /// recorded and the whole advice is rejected.
    pub fn error_handler(&mut self, _error_handler: ErrorHandlerDefinition) {
        self.rejected = Some(format!(
            "route '{}': the error handler cannot be redefined by advice",
            self.definition.id
        ));
    }

    pub fn edit_count(&self) -> usize {
        self.edits
    }

    /// The edited definition, or the reason the advice was rejected.
    pub fn finish(self) -> Result<RouteDefinition, AssemblyError> {
        match self.rejected {
            Some(reason) => Err(AssemblyError::AdviceRejected(reason)),
            None => Ok(self.definition),
        }
    }
}

/// One pending selection over the route model.
pub struct Weave<'a> {
    advice: &'a mut AdviceWith,
    matcher: Matcher,
    selection: Selection,
    max_depth: Option<usize>,
}

impl Weave<'_> {
    pub fn select_first(mut self) -> Self {
        self.selection = Selection::First;
        self
    }

    pub fn select_last(mut self) -> Self {
        self.selection = Selection::Last;
        self
    }

    pub fn select_index(mut self, index: usize) -> Self {
        self.selection = Selection::Index(index);
        self
    }

    pub fn select_range(mut self, from: usize, to: usize) -> Self {
        self.selection = Selection::Range(from, to);
        self
    }

    /// Only consider steps at most `depth` levels deep; top-level steps have
    /// depth 1.
    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }

    /// Matching steps in depth-first order after selection.
    pub fn targets(&self) -> Result<Vec<NodeIndex>, AssemblyError> {
        let model = &self.advice.definition.model;
        let matches: Vec<NodeIndex> = model
            .walk()
            .into_iter()
            .filter(|(_, depth)| self.max_depth.map_or(true, |max| *depth <= max))
            .filter(|(index, _)| self.matcher.matches(model, *index))
            .map(|(index, _)| index)
            .collect();

        let selected: Vec<NodeIndex> = match self.selection {
            Selection::All => matches,
            Selection::First => matches.first().copied().into_iter().collect(),
            Selection::Last => matches.last().copied().into_iter().collect(),
            Selection::Index(i) => matches.get(i).copied().into_iter().collect(),
            Selection::Range(from, to) if from <= to => {
                matches.into_iter().skip(from).take(to - from + 1).collect()
            }
            Selection::Range(from, to) => {
                return Err(AssemblyError::AdviceRejected(format!(
                    "invalid selection range [{from}, {to}]"
                )))
            }
        };
        if selected.is_empty() {
            return Err(AssemblyError::AdviceRejected(format!(
                "route '{}': no step matches {:?} with selection {:?}",
                self.advice.definition.id, self.matcher, self.selection
            )));
        }
        Ok(selected)
    }

    fn apply<F>(self, operation: &str, mut edit: F) -> Result<usize, AssemblyError>
    where
        F: FnMut(&mut RouteModel, NodeIndex) -> Result<(), AssemblyError>,
    {
        let targets = self.targets()?;
        let model = &mut self.advice.definition.model;
        for target in &targets {
            debug!(route_id = %self.advice.definition.id, step = %model.node(*target).label(), operation, "Weaving step");
            edit(model, *target)?;
        }
        self.advice.edits += targets.len();
        Ok(targets.len())
    }

    fn reject_linear_next_to_cross_cutting(
        model: &RouteModel,
        anchor: NodeIndex,
        definitions: &[StepDefinition],
    ) -> Result<(), AssemblyError> {
        if model.cross_cutting().contains(&anchor) && definitions.iter().any(|d| !d.kind.is_abstract()) {
            return Err(AssemblyError::AdviceRejected(format!(
                "cannot place regular steps next to cross-cutting step '{}'",
                model.node(anchor).label()
            )));
        }
        Ok(())
    }

    pub fn replace(self, definitions: Vec<StepDefinition>) -> Result<usize, AssemblyError> {
        self.apply("replace", |model, target| {
            Self::reject_linear_next_to_cross_cutting(model, target, &definitions)?;
            model.replace(target, definitions.clone()).map(|_| ())
        })
    }

    pub fn remove(self) -> Result<usize, AssemblyError> {
        self.apply("remove", |model, target| model.detach(target))
    }

    pub fn before(self, definitions: Vec<StepDefinition>) -> Result<usize, AssemblyError> {
        self.apply("before", |model, target| {
            Self::reject_linear_next_to_cross_cutting(model, target, &definitions)?;
            model.insert_before(target, definitions.clone()).map(|_| ())
        })
    }

    pub fn after(self, definitions: Vec<StepDefinition>) -> Result<usize, AssemblyError> {
        self.apply("after", |model, target| {
            Self::reject_linear_next_to_cross_cutting(model, target, &definitions)?;
            model.insert_after(target, definitions.clone()).map(|_| ())
        })
    }
}
