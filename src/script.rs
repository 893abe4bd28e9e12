//! The script graph data model: references, configurations, and the arena
//! that owns them.
//!
//! `ScriptConfig.dependencies` and `.reverseDependencies` form a cycle
//! (`spec.md` §9), so nodes are never linked with owning pointers in both
//! directions. Instead every node lives in a [`ScriptGraph`] arena and edges
//! are stored as [`ScriptNodeId`] indices into it.

use std::collections::{HashMap, HashSet};

use derive_more::Display;

use crate::diagnostics::Location;
use crate::path::AbsDirPath;

/// Identity of a script: a package directory plus the script name declared
/// in that package's manifest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScriptReference {
    pub package_dir: AbsDirPath,
    pub name: String,
}

impl ScriptReference {
    pub fn new(package_dir: AbsDirPath, name: impl Into<String>) -> Self {
        Self {
            package_dir,
            name: name.into(),
        }
    }

    /// Canonical string form used as a map key: `packageDir\0name`.
    pub fn map_key(&self) -> String {
        format!("{}\0{}", self.package_dir, self.name)
    }

    /// Human-facing label: the bare script name if `self` is in
    /// `root_package_dir`, otherwise `relative/path:name`.
    pub fn label(&self, root_package_dir: &AbsDirPath) -> String {
        let rel = root_package_dir.relativize_dir(&self.package_dir);
        if rel.as_std_path().as_os_str().is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", rel, self.name)
        }
    }
}

impl std::fmt::Display for ScriptReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.map_key())
    }
}

/// `clean` policy on a one-shot script's declared outputs.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum CleanPolicy {
    #[default]
    False,
    True,
    IfFileDeleted,
}

/// One dependency declaration: the resolved target plus where it was
/// declared, for diagnostic purposes.
#[derive(Clone, Debug)]
pub struct DependencyEdge {
    pub target: ScriptNodeId,
    pub location: Location,
}

/// A no-command script: dependencies only, no executable.
#[derive(Clone, Debug, Default)]
pub struct NoCommandConfig;

/// A one-shot script: has a command, may declare inputs/outputs/cleaning.
#[derive(Clone, Debug)]
pub struct OneShotConfig {
    pub command: String,
    pub files: Option<Vec<String>>,
    pub output: Vec<String>,
    pub clean: CleanPolicy,
}

/// A service script: has a command, runs indefinitely.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub command: String,
}

/// The three execution variants a script can declare (`spec.md` §3).
#[derive(Clone, Debug)]
pub enum ScriptConfig {
    NoCommand(NoCommandConfig),
    OneShot(OneShotConfig),
    Service(ServiceConfig),
}

impl ScriptConfig {
    pub fn command(&self) -> Option<&str> {
        match self {
            ScriptConfig::NoCommand(_) => None,
            ScriptConfig::OneShot(c) => Some(&c.command),
            ScriptConfig::Service(c) => Some(&c.command),
        }
    }

    pub fn is_service(&self) -> bool {
        matches!(self, ScriptConfig::Service(_))
    }

    pub fn is_no_command(&self) -> bool {
        matches!(self, ScriptConfig::NoCommand(_))
    }
}

/// Index of a [`ScriptNode`] within a [`ScriptGraph`] arena.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Display)]
#[display("{}", self.0)]
pub struct ScriptNodeId(usize);

/// One script's fully resolved configuration, plus its edges within the
/// graph it belongs to.
#[derive(Clone, Debug)]
pub struct ScriptNode {
    pub reference: ScriptReference,
    pub config: ScriptConfig,
    pub dependencies: Vec<DependencyEdge>,
    pub reverse_dependencies: Vec<ScriptNodeId>,
    pub package_locks: Vec<String>,
}

/// The arena of every script reachable from a single analysis's entry point.
///
/// Nodes are addressed by [`ScriptNodeId`]; lookups by [`ScriptReference`]
/// go through the `by_reference` index.
#[derive(Clone, Debug, Default)]
pub struct ScriptGraph {
    nodes: Vec<ScriptNode>,
    by_reference: HashMap<String, ScriptNodeId>,
}

impl ScriptGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new node, returning its id. Callers must not insert the same
    /// `ScriptReference` twice; use [`ScriptGraph::lookup`] to check first.
    pub fn insert(&mut self, node: ScriptNode) -> ScriptNodeId {
        let key = node.reference.map_key();
        let id = ScriptNodeId(self.nodes.len());
        self.nodes.push(node);
        self.by_reference.insert(key, id);
        id
    }

    pub fn lookup(&self, reference: &ScriptReference) -> Option<ScriptNodeId> {
        self.by_reference.get(&reference.map_key()).copied()
    }

    pub fn get(&self, id: ScriptNodeId) -> &ScriptNode {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: ScriptNodeId) -> &mut ScriptNode {
        &mut self.nodes[id.0]
    }

    pub fn add_reverse_dependency(&mut self, target: ScriptNodeId, from: ScriptNodeId) {
        let node = self.get_mut(target);
        if !node.reverse_dependencies.contains(&from) {
            node.reverse_dependencies.push(from);
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every node in the arena, for callers (the watcher's watch-set build)
    /// that need to visit all of them without caring about id order.
    pub fn nodes(&self) -> impl Iterator<Item = &ScriptNode> {
        self.nodes.iter()
    }

    /// Every command-bearing (one-shot or service) node that depends on
    /// `id`, directly or through a chain of no-command intermediaries
    /// (`spec.md` §4.5: "the service walks its reverse-dependency graph
    /// through no-command nodes to enumerate the set of command-bearing
    /// consumers"). A no-command node forwards nothing of its own, so the
    /// walk continues through it rather than stopping there.
    pub fn command_bearing_consumers(&self, id: ScriptNodeId) -> Vec<ScriptNodeId> {
        let mut result = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = self.get(id).reverse_dependencies.clone();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let node = self.get(current);
            if node.config.is_no_command() {
                stack.extend(node.reverse_dependencies.iter().copied());
            } else {
                result.push(current);
            }
        }
        result
    }

    /// Whether `id` is forwarded all the way up to `root` through only
    /// no-command intermediaries (or is `root` itself). When true,
    /// `executeTopLevel` holds an extra "entrypoint" consumer handle on it
    /// beyond its command-bearing consumers (`spec.md` §4.5).
    pub fn is_top_level_service(&self, id: ScriptNodeId, root: ScriptNodeId) -> bool {
        if id == root {
            return true;
        }
        let mut seen = HashSet::new();
        let mut stack = self.get(id).reverse_dependencies.clone();
        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            let node = self.get(current);
            if !node.config.is_no_command() {
                continue;
            }
            if current == root {
                return true;
            }
            stack.extend(node.reverse_dependencies.iter().copied());
        }
        false
    }

    /// How many consumer handles a service at `id` should expect to have
    /// acquired-then-released over this analysis's lifetime: one per
    /// command-bearing consumer, plus one more if it is itself forwarded to
    /// the top level (`spec.md` §4.5's "entrypoint" consumer).
    pub fn service_expected_consumers(&self, id: ScriptNodeId, root: ScriptNodeId) -> usize {
        self.command_bearing_consumers(id).len() + usize::from(self.is_top_level_service(id, root))
    }

    /// Inverse of [`ScriptGraph::command_bearing_consumers`]: for every
    /// service node in the graph, which of its command-bearing consumers
    /// hold a reservation on it. Used to release a not-yet-acquired
    /// reservation when the consumer's own execution fails before it ever
    /// reaches the service (`spec.md` §4.5).
    pub fn service_reservations_by_consumer(&self) -> HashMap<ScriptNodeId, Vec<ScriptNodeId>> {
        let mut by_consumer: HashMap<ScriptNodeId, Vec<ScriptNodeId>> = HashMap::new();
        for index in 0..self.nodes.len() {
            let service_id = ScriptNodeId(index);
            if !self.get(service_id).config.is_service() {
                continue;
            }
            for consumer in self.command_bearing_consumers(service_id) {
                by_consumer.entry(consumer).or_default().push(service_id);
            }
        }
        by_consumer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dir(p: &str) -> AbsDirPath {
        AbsDirPath::assume(p).unwrap()
    }

    #[test]
    fn label_uses_bare_name_in_root_package() {
        let root = dir("/work/foo");
        let reference = ScriptReference::new(dir("/work/foo"), "build");
        assert_eq!(reference.label(&root), "build");
    }

    #[test]
    fn label_uses_relative_path_outside_root() {
        let root = dir("/work/foo");
        let reference = ScriptReference::new(dir("/work/bar"), "build");
        assert_eq!(reference.label(&root), "../bar:build");
    }

    #[test]
    fn nodes_visits_every_inserted_script() {
        let mut graph = ScriptGraph::new();
        graph.insert(ScriptNode {
            reference: ScriptReference::new(dir("/work/foo"), "server"),
            config: ScriptConfig::Service(ServiceConfig {
                command: "serve".into(),
            }),
            dependencies: vec![],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });
        graph.insert(ScriptNode {
            reference: ScriptReference::new(dir("/work/foo"), "relay"),
            config: ScriptConfig::NoCommand(NoCommandConfig),
            dependencies: vec![],
            reverse_dependencies: vec![],
            package_locks: vec![],
        });

        let names: Vec<&str> = graph.nodes().map(|n| n.reference.name.as_str()).collect();
        assert_eq!(names, vec!["server", "relay"]);
    }

    fn one_shot(dir: AbsDirPath, name: &str, deps: Vec<ScriptNodeId>) -> ScriptNode {
        let location = crate::diagnostics::Location::whole_file(
            crate::path::AbsFilePath::assume(dir.as_std_path().join("package.json")).unwrap(),
        );
        ScriptNode {
            reference: ScriptReference::new(dir, name),
            config: ScriptConfig::OneShot(OneShotConfig {
                command: "true".into(),
                files: None,
                output: vec![],
                clean: CleanPolicy::False,
            }),
            dependencies: deps
                .into_iter()
                .map(|target| DependencyEdge {
                    target,
                    location: location.clone(),
                })
                .collect(),
            reverse_dependencies: vec![],
            package_locks: vec![],
        }
    }

    fn no_command(dir: AbsDirPath, name: &str, deps: Vec<ScriptNodeId>) -> ScriptNode {
        let location = crate::diagnostics::Location::whole_file(
            crate::path::AbsFilePath::assume(dir.as_std_path().join("package.json")).unwrap(),
        );
        ScriptNode {
            reference: ScriptReference::new(dir, name),
            config: ScriptConfig::NoCommand(NoCommandConfig),
            dependencies: deps
                .into_iter()
                .map(|target| DependencyEdge {
                    target,
                    location: location.clone(),
                })
                .collect(),
            reverse_dependencies: vec![],
            package_locks: vec![],
        }
    }

    /// `main -> a -> server`, `main -> b -> relay -> server`: two
    /// command-bearing consumers of `server`, reached directly (`a`) and
    /// through a no-command intermediary (`relay`); `main` is itself
    /// command-bearing, so `server` never reaches the top level.
    #[test]
    fn command_bearing_consumers_walks_through_no_command_nodes() {
        let package = dir("/work/foo");
        let mut graph = ScriptGraph::new();
        let server = graph.insert(one_shot(package.clone(), "server", vec![]));
        graph.get_mut(server).config = ScriptConfig::Service(ServiceConfig { command: "serve".into() });
        let a = graph.insert(one_shot(package.clone(), "a", vec![server]));
        graph.add_reverse_dependency(server, a);
        let relay = graph.insert(no_command(package.clone(), "relay", vec![server]));
        graph.add_reverse_dependency(server, relay);
        let b = graph.insert(one_shot(package.clone(), "b", vec![relay]));
        graph.add_reverse_dependency(relay, b);
        let main = graph.insert(one_shot(package, "main", vec![a, b]));
        graph.add_reverse_dependency(a, main);
        graph.add_reverse_dependency(b, main);

        let mut consumers = graph.command_bearing_consumers(server);
        consumers.sort();
        assert_eq!(consumers, vec![a, b]);
        assert!(!graph.is_top_level_service(server, main));
        assert_eq!(graph.service_expected_consumers(server, main), 2);
    }

    /// `root -> relay -> server`, where `root` itself is a no-command
    /// script: `server` is forwarded all the way to the top level, so it
    /// gets an extra entrypoint reservation on top of its (zero)
    /// command-bearing consumers.
    #[test]
    fn top_level_service_gets_an_entrypoint_reservation() {
        let package = dir("/work/foo");
        let mut graph = ScriptGraph::new();
        let server = graph.insert(one_shot(package.clone(), "server", vec![]));
        graph.get_mut(server).config = ScriptConfig::Service(ServiceConfig { command: "serve".into() });
        let relay = graph.insert(no_command(package.clone(), "relay", vec![server]));
        graph.add_reverse_dependency(server, relay);
        let root = graph.insert(no_command(package, "root", vec![relay]));
        graph.add_reverse_dependency(relay, root);

        assert!(graph.command_bearing_consumers(server).is_empty());
        assert!(graph.is_top_level_service(server, root));
        assert_eq!(graph.service_expected_consumers(server, root), 1);
    }

    #[test]
    fn service_reservations_by_consumer_inverts_command_bearing_consumers() {
        let package = dir("/work/foo");
        let mut graph = ScriptGraph::new();
        let server = graph.insert(one_shot(package.clone(), "server", vec![]));
        graph.get_mut(server).config = ScriptConfig::Service(ServiceConfig { command: "serve".into() });
        let a = graph.insert(one_shot(package, "a", vec![server]));
        graph.add_reverse_dependency(server, a);

        let reservations = graph.service_reservations_by_consumer();
        assert_eq!(reservations.get(&a), Some(&vec![server]));
    }
}
