//! The task graph.
//!
//! Nodes are named build steps, edges point from a dependency to the task
//! that waits for it. A graph is assembled with [`TaskGraph::add_task`],
//! checked once with [`TaskGraph::validate`] and then consumed batch by batch
//! through [`TaskGraph::batches`].

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use glob::{MatchOptions, Pattern};
use petgraph::Direction;
use petgraph::graph::{Graph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::core::TaskContext;
use crate::error::ConfigError;

/// Result of a single task action.
pub type TaskResult = anyhow::Result<()>;

/// The executable part of a task.
pub type Action = Arc<dyn Fn(&TaskContext) -> TaskResult + Send + Sync>;

/// Lifecycle of a task within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
        };

        f.write_str(name)
    }
}

/// Something a task writes. Literal paths are compared exactly (or as
/// directory prefixes), patterns by matching.
#[derive(Debug, Clone)]
pub enum OutputClaim {
    Path(Utf8PathBuf),
    Glob(Pattern),
}

const MATCH: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl OutputClaim {
    fn as_str(&self) -> &str {
        match self {
            OutputClaim::Path(path) => path.as_str(),
            OutputClaim::Glob(pattern) => pattern.as_str(),
        }
    }

    /// Whether two claims may name the same file.
    ///
    /// Two patterns are considered overlapping when either one matches the
    /// other read as a literal path, which covers the nested and identical
    /// cases the pipeline can produce.
    pub fn overlaps(&self, other: &OutputClaim) -> bool {
        match (self, other) {
            (OutputClaim::Path(a), OutputClaim::Path(b)) => a.starts_with(b) || b.starts_with(a),
            (OutputClaim::Path(path), OutputClaim::Glob(pattern))
            | (OutputClaim::Glob(pattern), OutputClaim::Path(path)) => {
                pattern.matches_with(path.as_str(), MATCH)
            }
            (OutputClaim::Glob(a), OutputClaim::Glob(b)) => {
                a.matches_with(b.as_str(), MATCH) || b.matches_with(a.as_str(), MATCH)
            }
        }
    }
}

/// A named build step with its dependencies, its action and the files it
/// reads and writes.
pub struct BuildTask {
    name: String,
    depends_on: Vec<String>,
    action: Action,
    inputs: Vec<Pattern>,
    excludes: Vec<Pattern>,
    outputs: Vec<OutputClaim>,
}

impl BuildTask {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }

    pub(crate) fn action(&self) -> Action {
        self.action.clone()
    }

    /// Patterns declared with [`BuildTask::watch`].
    pub fn inputs(&self) -> &[Pattern] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputClaim] {
        &self.outputs
    }

    /// Declares source files this task reads. A change to a matching path
    /// makes the task dirty.
    pub fn watch(&mut self, pattern: &str) -> Result<&mut Self, ConfigError> {
        self.inputs.push(Pattern::new(pattern)?);
        Ok(self)
    }

    /// Removes paths from the set declared with [`BuildTask::watch`].
    pub fn exclude(&mut self, pattern: &str) -> Result<&mut Self, ConfigError> {
        self.excludes.push(Pattern::new(pattern)?);
        Ok(self)
    }

    pub fn claim(&mut self, path: impl Into<Utf8PathBuf>) -> &mut Self {
        self.outputs.push(OutputClaim::Path(path.into()));
        self
    }

    pub fn claim_glob(&mut self, pattern: &str) -> Result<&mut Self, ConfigError> {
        self.outputs.push(OutputClaim::Glob(Pattern::new(pattern)?));
        Ok(self)
    }

    /// `*` stops at `/`, `**` crosses directories.
    pub fn is_dirty(&self, path: &Utf8Path) -> bool {
        self.inputs.iter().any(|p| p.matches_with(path.as_str(), MATCH))
            && !self.excludes.iter().any(|p| p.matches_with(path.as_str(), MATCH))
    }
}

impl fmt::Debug for BuildTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuildTask")
            .field("name", &self.name)
            .field("depends_on", &self.depends_on)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Named build steps and their "must complete before" relation.
#[derive(Default)]
pub struct TaskGraph {
    graph: Graph<BuildTask, ()>,
    index: HashMap<String, NodeIndex>,
    duplicates: Vec<String>,
}

impl TaskGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. Dependencies may name tasks that are added later;
    /// they are resolved by [`TaskGraph::validate`].
    pub fn add_task<F>(&mut self, name: impl Into<String>, depends_on: &[&str], action: F) -> &mut BuildTask
    where
        F: Fn(&TaskContext) -> TaskResult + Send + Sync + 'static,
    {
        let name = name.into();
        let node = self.graph.add_node(BuildTask {
            name: name.clone(),
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            action: Arc::new(action),
            inputs: Vec::new(),
            excludes: Vec::new(),
            outputs: Vec::new(),
        });

        if self.index.insert(name.clone(), node).is_some() {
            self.duplicates.push(name);
        }

        &mut self.graph[node]
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn task(&self, name: &str) -> Option<&BuildTask> {
        self.index.get(name).map(|&node| &self.graph[node])
    }

    pub fn tasks(&self) -> impl Iterator<Item = &BuildTask> {
        self.graph.node_weights()
    }

    /// Resolves dependencies into edges and checks the graph: every
    /// dependency must exist, names must be unique, the relation must be
    /// acyclic and no two tasks of the same batch may claim overlapping
    /// outputs.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if let Some(name) = self.duplicates.first() {
            return Err(ConfigError::DuplicateTask(name.clone()));
        }

        self.graph.clear_edges();

        let mut edges = Vec::new();
        for node in self.graph.node_indices() {
            let task = &self.graph[node];
            for dependency in &task.depends_on {
                let Some(&source) = self.index.get(dependency) else {
                    return Err(ConfigError::UnknownDependency {
                        task: task.name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                edges.push((source, node));
            }
        }

        for (source, target) in edges {
            self.graph.update_edge(source, target, ());
        }

        if let Err(cycle) = petgraph::algo::toposort(&self.graph, None) {
            return Err(ConfigError::Cycle {
                task: self.graph[cycle.node_id()].name.clone(),
            });
        }

        for batch in self.batches() {
            check_overlap(self, &batch)?;
        }

        Ok(())
    }

    /// Lazily yields batches of task names in dependency order. Every task
    /// appears in a later batch than all of its dependencies; names within a
    /// batch carry no ordering requirement and are sorted only for stable
    /// output.
    ///
    /// Edges are resolved by [`TaskGraph::validate`], which must be called
    /// first.
    pub fn batches(&self) -> Batches<'_> {
        Batches::new(self, self.graph.node_indices().collect())
    }

    /// Like [`TaskGraph::batches`], restricted to `names`. Dependencies
    /// outside of the subset are treated as already satisfied.
    pub fn batches_of(&self, names: &BTreeSet<String>) -> Batches<'_> {
        let subset = names
            .iter()
            .filter_map(|name| self.index.get(name).copied())
            .collect();

        Batches::new(self, subset)
    }

    /// Tasks whose declared inputs match any of `paths`.
    pub fn dirty_tasks<'a>(&self, paths: impl IntoIterator<Item = &'a Utf8Path>) -> BTreeSet<String> {
        let mut dirty = BTreeSet::new();

        for path in paths {
            for task in self.graph.node_weights() {
                if task.is_dirty(path) {
                    dirty.insert(task.name.clone());
                }
            }
        }

        dirty
    }

    /// `names` together with every task transitively depending on them.
    pub fn descendants(&self, names: &BTreeSet<String>) -> BTreeSet<String> {
        let mut found = BTreeSet::new();

        for name in names {
            let Some(&start) = self.index.get(name) else {
                continue;
            };

            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(node) = dfs.next(&self.graph) {
                found.insert(self.graph[node].name.clone());
            }
        }

        found
    }

    /// Every task `names` transitively depends on, excluding `names`.
    pub fn ancestors(&self, names: &BTreeSet<String>) -> BTreeSet<String> {
        let reversed = Reversed(&self.graph);
        let mut found = BTreeSet::new();

        for name in names {
            let Some(&start) = self.index.get(name) else {
                continue;
            };

            let mut dfs = Dfs::new(reversed, start);
            while let Some(node) = dfs.next(reversed) {
                found.insert(self.graph[node].name.clone());
            }
        }

        found.retain(|name| !names.contains(name));
        found
    }

    fn node(&self, name: &str) -> Option<NodeIndex> {
        self.index.get(name).copied()
    }
}

fn check_overlap(graph: &TaskGraph, batch: &[&str]) -> Result<(), ConfigError> {
    let tasks: Vec<&BuildTask> = batch.iter().filter_map(|name| graph.task(name)).collect();

    for (i, first) in tasks.iter().enumerate() {
        for second in &tasks[i + 1..] {
            for a in &first.outputs {
                if let Some(b) = second.outputs.iter().find(|b| a.overlaps(b)) {
                    return Err(ConfigError::OutputOverlap {
                        first: first.name.clone(),
                        second: second.name.clone(),
                        path: format!("{} / {}", a.as_str(), b.as_str()),
                    });
                }
            }
        }
    }

    Ok(())
}

/// Kahn's algorithm, one layer per call to `next`.
pub struct Batches<'g> {
    graph: &'g TaskGraph,
    subset: HashSet<NodeIndex>,
    pending: HashMap<NodeIndex, usize>,
    ready: Vec<NodeIndex>,
}

impl<'g> Batches<'g> {
    fn new(graph: &'g TaskGraph, subset: HashSet<NodeIndex>) -> Self {
        let mut pending = HashMap::new();
        let mut ready = Vec::new();

        for &node in &subset {
            let count = graph
                .graph
                .neighbors_directed(node, Direction::Incoming)
                .filter(|dep| subset.contains(dep))
                .count();

            if count == 0 {
                ready.push(node);
            } else {
                pending.insert(node, count);
            }
        }

        Self {
            graph,
            subset,
            pending,
            ready,
        }
    }

    /// Tasks that never became ready because they sit on a cycle.
    pub fn stuck(&self) -> usize {
        self.pending.len()
    }
}

impl<'g> Iterator for Batches<'g> {
    type Item = Vec<&'g str>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.ready.is_empty() {
            return None;
        }

        let batch = std::mem::take(&mut self.ready);

        for &node in &batch {
            for dependent in self.graph.graph.neighbors_directed(node, Direction::Outgoing) {
                if !self.subset.contains(&dependent) {
                    continue;
                }

                if let Some(count) = self.pending.get_mut(&dependent) {
                    *count -= 1;
                    if *count == 0 {
                        self.pending.remove(&dependent);
                        self.ready.push(dependent);
                    }
                }
            }
        }

        let mut names: Vec<&'g str> = batch
            .into_iter()
            .map(|node| self.graph.graph[node].name.as_str())
            .collect();
        names.sort_unstable();

        Some(names)
    }
}

/// Renders the graph as a Mermaid flowchart.
impl fmt::Display for TaskGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {:?}[\"{}\"]", index.index(), name)?;
        }

        for task in self.graph.node_weights() {
            let Some(target) = self.node(&task.name) else {
                continue;
            };
            for dependency in &task.depends_on {
                if let Some(source) = self.node(dependency) {
                    writeln!(f, "    {:?} --> {:?}", source.index(), target.index())?;
                }
            }
        }

        Ok(())
    }
}
