//! The deployment graph and its validation.

use std::collections::BTreeMap;

use crate::{
    error::ValidationError,
    unit::{DeploymentUnit, UnitHandle, UnitId},
};

/// Units registered so far. Must be validated before it can be executed.
#[derive(Debug, Default)]
pub struct DeploymentGraph {
    units: Vec<DeploymentUnit>,
    index: BTreeMap<UnitId, UnitHandle>,
}

impl DeploymentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a unit. Handles are issued in registration order.
    pub fn register(&mut self, unit: DeploymentUnit) -> Result<UnitHandle, ValidationError> {
        if self.index.contains_key(unit.id()) {
            return Err(ValidationError::DuplicateId(unit.id().clone()));
        }

        let handle = UnitHandle(self.units.len());
        self.index.insert(unit.id().clone(), handle);
        self.units.push(unit);
        Ok(handle)
    }

    pub fn handle(&self, id: &str) -> Option<UnitHandle> {
        self.index.get(id).copied()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Check that every dependency is registered and that there is no cycle.
    pub fn validate(self) -> Result<ValidatedGraph, ValidationError> {
        let mut dependencies = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            let handles = unit
                .dependencies()
                .iter()
                .map(|dependency| {
                    self.index.get(dependency).copied().ok_or_else(|| {
                        ValidationError::MissingDependency {
                            unit: unit.id().clone(),
                            dependency: dependency.clone(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            dependencies.push(handles);
        }

        let mut marks = vec![Mark::Unvisited; self.units.len()];
        let mut stack = Vec::new();
        for start in 0..self.units.len() {
            if let Some(cycle) = find_cycle(start, &dependencies, &mut marks, &mut stack) {
                let path = cycle
                    .into_iter()
                    .map(|index| self.units[index].id().clone())
                    .collect();
                return Err(ValidationError::Cycle { path });
            }
        }

        tracing::debug!(units = self.units.len(), "Deployment graph validated");

        Ok(ValidatedGraph {
            units: self.units,
            index: self.index,
            dependencies,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Visited,
}

/// Depth-first search from `node`. Returns the cycle as a list of indices
/// closing with its first element, e.g. `[a, b, a]`.
fn find_cycle(
    node: usize,
    dependencies: &[Vec<UnitHandle>],
    marks: &mut [Mark],
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    match marks[node] {
        Mark::Visited => return None,
        Mark::Visiting => {
            let start = stack.iter().position(|&index| index == node)?;
            let mut cycle = stack[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        Mark::Unvisited => {}
    }

    marks[node] = Mark::Visiting;
    stack.push(node);

    for dependency in &dependencies[node] {
        if let Some(cycle) = find_cycle(dependency.index(), dependencies, marks, stack) {
            return Some(cycle);
        }
    }

    stack.pop();
    marks[node] = Mark::Visited;
    None
}

/// A graph whose dependencies all resolve and which has no cycle.
#[derive(Debug)]
pub struct ValidatedGraph {
    units: Vec<DeploymentUnit>,
    index: BTreeMap<UnitId, UnitHandle>,
    dependencies: Vec<Vec<UnitHandle>>,
}

impl ValidatedGraph {
    /// The unit behind `handle`.
    ///
    /// Panics if `handle` was issued by another graph.
    pub fn unit(&self, handle: UnitHandle) -> &DeploymentUnit {
        &self.units[handle.index()]
    }

    pub fn handle(&self, id: &str) -> Option<UnitHandle> {
        self.index.get(id).copied()
    }

    /// Resolved direct dependencies of `handle`, in declared order.
    pub fn dependencies(&self, handle: UnitHandle) -> &[UnitHandle] {
        &self.dependencies[handle.index()]
    }

    /// All handles in registration order.
    pub fn handles(&self) -> impl Iterator<Item = UnitHandle> + '_ {
        (0..self.units.len()).map(UnitHandle)
    }

    /// All units in registration order.
    pub fn units(&self) -> impl Iterator<Item = &DeploymentUnit> {
        self.units.iter()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::{test_support::unit, *};

    fn graph(units: Vec<DeploymentUnit>) -> DeploymentGraph {
        let mut graph = DeploymentGraph::new();
        for unit in units {
            graph.register(unit).unwrap();
        }
        graph
    }

    #[test]
    fn test_register_issues_sequential_handles() {
        let mut graph = DeploymentGraph::new();
        let a = graph.register(unit("Oracle", &[])).unwrap();
        let b = graph.register(unit("Lending", &["Oracle"])).unwrap();

        assert_eq!((a.index(), b.index()), (0, 1));
        assert_eq!(graph.handle("Lending"), Some(b));
        assert_eq!(graph.handle("Vault"), None);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mut graph = DeploymentGraph::new();
        graph.register(unit("Oracle", &[])).unwrap();

        let err = graph.register(unit("Oracle", &[])).unwrap_err();
        assert_eq!(err, ValidationError::DuplicateId("Oracle".into()));
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_missing_dependency() {
        let err = graph(vec![unit("Lending", &["Oracle"])]).validate().unwrap_err();

        assert_eq!(
            err,
            ValidationError::MissingDependency {
                unit: "Lending".into(),
                dependency: "Oracle".into(),
            }
        );
    }

    #[test]
    fn test_cycle_reports_path() {
        let err = graph(vec![
            unit("Token", &[]),
            unit("A", &["Token", "B"]),
            unit("B", &["C"]),
            unit("C", &["A"]),
        ])
        .validate()
        .unwrap_err();

        assert_eq!(err.to_string(), "dependency cycle: A -> B -> C -> A");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = graph(vec![unit("A", &["A"])]).validate().unwrap_err();

        assert_eq!(
            err,
            ValidationError::Cycle {
                path: vec!["A".into(), "A".into()],
            }
        );
    }

    #[test]
    fn test_validated_graph_resolves_dependencies() {
        let validated = graph(vec![
            unit("DemoToken", &[]),
            unit("USDCToken", &[]),
            unit("SimplePriceOracle", &["DemoToken", "USDCToken"]),
        ])
        .validate()
        .unwrap();

        let oracle = validated.handle("SimplePriceOracle").unwrap();
        let deps: Vec<_> = validated
            .dependencies(oracle)
            .iter()
            .map(|&handle| validated.unit(handle).id().to_string())
            .collect();

        assert_eq!(deps, vec!["DemoToken", "USDCToken"]);
        assert_eq!(validated.handles().count(), 3);
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let result = graph(vec![
            unit("Token", &[]),
            unit("Oracle", &["Token"]),
            unit("RateModel", &["Token"]),
            unit("Market", &["Oracle", "RateModel"]),
        ])
        .validate();

        assert!(result.is_ok());
    }
}
