//! Deterministic execution order and tag selection.

use std::{
    cmp::Reverse,
    collections::{BTreeSet, BinaryHeap},
};

use crate::{error::ValidationError, graph::ValidatedGraph, unit::UnitHandle};

/// Computes execution orders over a [`ValidatedGraph`]. Pure.
pub struct Resolver;

impl Resolver {
    /// Topological order of the whole graph.
    ///
    /// Among units whose dependencies are all placed, the earliest registered
    /// one goes first, so the same plan always yields the same order.
    pub fn order(graph: &ValidatedGraph) -> Vec<UnitHandle> {
        let mut remaining: Vec<usize> = graph
            .handles()
            .map(|handle| graph.dependencies(handle).len())
            .collect();

        let mut dependents = vec![Vec::new(); graph.len()];
        for handle in graph.handles() {
            for dependency in graph.dependencies(handle) {
                dependents[dependency.index()].push(handle);
            }
        }

        let mut ready: BinaryHeap<Reverse<UnitHandle>> = graph
            .handles()
            .filter(|handle| remaining[handle.index()] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::with_capacity(graph.len());
        while let Some(Reverse(handle)) = ready.pop() {
            order.push(handle);
            for &dependent in &dependents[handle.index()] {
                remaining[dependent.index()] -= 1;
                if remaining[dependent.index()] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }

        order
    }

    /// Units tagged with any of `tags`, plus everything they depend on, in
    /// execution order. An empty tag list selects the whole graph.
    pub fn select(
        graph: &ValidatedGraph,
        tags: &[String],
    ) -> Result<Vec<UnitHandle>, ValidationError> {
        if tags.is_empty() {
            return Ok(Self::order(graph));
        }

        let mut selected = BTreeSet::new();
        for tag in tags {
            let tagged: Vec<_> = graph
                .handles()
                .filter(|&handle| graph.unit(handle).tags().contains(tag))
                .collect();

            if tagged.is_empty() {
                return Err(ValidationError::UnknownTag(tag.clone()));
            }

            for handle in tagged {
                collect_closure(graph, handle, &mut selected);
            }
        }

        Ok(Self::order(graph)
            .into_iter()
            .filter(|handle| selected.contains(handle))
            .collect())
    }
}

fn collect_closure(
    graph: &ValidatedGraph,
    handle: UnitHandle,
    selected: &mut BTreeSet<UnitHandle>,
) {
    if selected.insert(handle) {
        for &dependency in graph.dependencies(handle) {
            collect_closure(graph, dependency, selected);
        }
    }
}
