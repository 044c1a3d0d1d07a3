//! Factor registry and dependency resolution.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use tracing::{debug, warn};

use super::{factor_id, FactorDescriptor, FactorError};
use crate::frame::TableFrame;
use crate::time::TimeRange;

/// Topologically order `seeds` and their transitive dependencies (Kahn).
///
/// Every dependency precedes its dependents in the output. Ties are broken
/// by name so the order is deterministic. A cycle anywhere in the closure
/// fails with [`FactorError::CyclicDependency`] naming the nodes left over.
pub fn topo_sort<F>(seeds: &[String], deps_of: F) -> Result<Vec<String>, FactorError>
where
    F: Fn(&str) -> Vec<String>,
{
    let mut edges: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut queue: VecDeque<String> = seeds.iter().cloned().collect();
    while let Some(node) = queue.pop_front() {
        if edges.contains_key(&node) {
            continue;
        }
        let deps = deps_of(&node);
        queue.extend(deps.iter().cloned());
        edges.insert(node, deps);
    }

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for (node, deps) in &edges {
        let unique: BTreeSet<&str> = deps.iter().map(String::as_str).collect();
        in_degree.insert(node.as_str(), unique.len());
        for dep in unique {
            dependents.entry(dep).or_default().push(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut order = Vec::with_capacity(edges.len());

    while let Some(node) = ready.pop_first() {
        order.push(node.to_string());
        for &dependent in dependents.get(node).map(Vec::as_slice).unwrap_or_default() {
            if let Some(n) = in_degree.get_mut(dependent) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < edges.len() {
        let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
        let nodes = edges
            .keys()
            .filter(|k| !placed.contains(k.as_str()))
            .cloned()
            .collect();
        return Err(FactorError::CyclicDependency { nodes });
    }
    Ok(order)
}

#[derive(Debug, Clone)]
pub struct RegisteredFactor {
    pub id: String,
    pub plugin: String,
    pub descriptor: FactorDescriptor,
}

/// Output of [`FactorGraph::resolve`], both halves in dependency order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPlan {
    /// Names with no registered provider; must come from storage.
    pub raw_fields: Vec<String>,
    /// Names computed by a registered factor.
    pub factors: Vec<String>,
}

impl ResolvedPlan {
    pub fn all(&self) -> impl Iterator<Item = &String> {
        self.raw_fields.iter().chain(self.factors.iter())
    }
}

#[derive(Debug, Default)]
pub struct FactorGraph {
    registered: Vec<RegisteredFactor>,
    provider_index: HashMap<String, usize>,
    depends: HashMap<String, Vec<String>>,
}

impl FactorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every descriptor of one plugin. A provided name that is already
    /// indexed is re-pointed to the newer descriptor, with a warning.
    pub fn register_all(&mut self, plugin_id: &str, descriptors: Vec<FactorDescriptor>) {
        for descriptor in descriptors {
            let idx = self.registered.len();
            let id = factor_id(plugin_id, &descriptor.provides);
            for name in &descriptor.provides {
                if let Some(prev) = self.provider_index.insert(name.clone(), idx) {
                    warn!(
                        factor = %name,
                        previous = %self.registered[prev].plugin,
                        current = plugin_id,
                        "factor provided twice, last registered wins"
                    );
                }
                self.depends.insert(name.clone(), descriptor.depends.clone());
            }
            debug!(
                plugin = plugin_id,
                id = %id,
                provides = ?descriptor.provides,
                "registered factor"
            );
            self.registered.push(RegisteredFactor {
                id,
                plugin: plugin_id.to_string(),
                descriptor,
            });
        }
    }

    /// Drop everything; used before a wholesale plugin reload.
    pub fn clear(&mut self) {
        self.registered.clear();
        self.provider_index.clear();
        self.depends.clear();
    }

    pub fn len(&self) -> usize {
        self.registered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registered.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.provider_index.contains_key(name)
    }

    /// Id of the descriptor currently indexed for `name`.
    pub fn factor_id(&self, name: &str) -> Option<&str> {
        self.provider(name).map(|f| f.id.as_str())
    }

    pub fn provider(&self, name: &str) -> Option<&RegisteredFactor> {
        self.provider_index.get(name).map(|&i| &self.registered[i])
    }

    pub fn factors(&self) -> &[RegisteredFactor] {
        &self.registered
    }

    /// Every provided name, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.provider_index.keys().cloned().collect();
        names.sort();
        names
    }

    /// Order the requested names and their transitive dependencies.
    pub fn resolve(&self, names: &[String]) -> Result<ResolvedPlan, FactorError> {
        let order = topo_sort(names, |n| self.depends.get(n).cloned().unwrap_or_default())?;
        let (factors, raw_fields) = order.into_iter().partition(|n| self.contains(n));
        Ok(ResolvedPlan {
            raw_fields,
            factors,
        })
    }

    /// Run the first registered descriptor that provides `name`.
    pub fn calculate(
        &self,
        name: &str,
        entity: Option<&str>,
        range: &TimeRange,
        inputs: &TableFrame,
    ) -> Result<TableFrame, FactorError> {
        let factor = self
            .registered
            .iter()
            .find(|f| f.descriptor.provides.iter().any(|p| p == name))
            .ok_or_else(|| FactorError::UnknownFactor(name.to_string()))?;
        factor.descriptor.compute(entity, range, inputs)
    }
}
