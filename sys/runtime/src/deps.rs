// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Name-keyed dependency DAG with cycle detection and topological init
//! order (spec.md §4.J).

use std::collections::HashMap;
use std::sync::Mutex;

use rt_abi::Error;

struct Node {
    depends_on: Vec<String>,
    initialized: bool,
}

pub struct DependencyGraph {
    nodes: Mutex<HashMap<String, Node>>,
}

#[derive(Eq, PartialEq, Clone, Copy)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    fn ensure(nodes: &mut HashMap<String, Node>, name: &str) {
        nodes.entry(name.to_string()).or_insert_with(|| Node {
            depends_on: Vec::new(),
            initialized: false,
        });
    }

    /// Adds an edge `service -> depends_on`. Rolled back with
    /// `CircularDependency` if it would introduce a cycle.
    pub fn add(&self, service: &str, depends_on: &str) -> Result<(), Error> {
        let mut nodes = self.nodes.lock().unwrap();
        Self::ensure(&mut nodes, service);
        Self::ensure(&mut nodes, depends_on);
        nodes
            .get_mut(service)
            .unwrap()
            .depends_on
            .push(depends_on.to_string());

        if Self::has_cycle(&nodes) {
            nodes
                .get_mut(service)
                .unwrap()
                .depends_on
                .retain(|d| d != depends_on);
            return Err(Error::CircularDependency);
        }
        Ok(())
    }

    fn has_cycle(nodes: &HashMap<String, Node>) -> bool {
        let mut marks: HashMap<&str, Mark> =
            nodes.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();

        fn visit<'a>(
            name: &'a str,
            nodes: &'a HashMap<String, Node>,
            marks: &mut HashMap<&'a str, Mark>,
        ) -> bool {
            match marks.get(name).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return false,
                Mark::InProgress => return true,
                Mark::Unvisited => {}
            }
            marks.insert(name, Mark::InProgress);
            if let Some(node) = nodes.get(name) {
                for dep in &node.depends_on {
                    if visit(dep, nodes, marks) {
                        return true;
                    }
                }
            }
            marks.insert(name, Mark::Done);
            false
        }

        let names: Vec<&str> = nodes.keys().map(|k| k.as_str()).collect();
        for name in names {
            if visit(name, nodes, &mut marks) {
                return true;
            }
        }
        false
    }

    /// DFS-based topological sort, leaves first.
    pub fn init_order(&self) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap();
        let mut marks: HashMap<&str, Mark> =
            nodes.keys().map(|k| (k.as_str(), Mark::Unvisited)).collect();
        let mut order = Vec::with_capacity(nodes.len());

        fn visit<'a>(
            name: &'a str,
            nodes: &'a HashMap<String, Node>,
            marks: &mut HashMap<&'a str, Mark>,
            order: &mut Vec<String>,
        ) {
            if marks.get(name).copied() == Some(Mark::Done) {
                return;
            }
            marks.insert(name, Mark::InProgress);
            if let Some(node) = nodes.get(name) {
                for dep in &node.depends_on {
                    visit(dep, nodes, marks, order);
                }
            }
            marks.insert(name, Mark::Done);
            order.push(name.to_string());
        }

        let mut names: Vec<&str> = nodes.keys().map(|k| k.as_str()).collect();
        names.sort_unstable();
        for name in names {
            visit(name, &nodes, &mut marks, &mut order);
        }
        order
    }

    pub fn check_ready(&self, name: &str) -> Result<(), Error> {
        let nodes = self.nodes.lock().unwrap();
        let Some(node) = nodes.get(name) else {
            return Ok(());
        };
        let ready = node.depends_on.iter().all(|dep| {
            nodes.get(dep).map(|n| n.initialized).unwrap_or(false)
        });
        if ready {
            Ok(())
        } else {
            Err(Error::DependencyNotReady)
        }
    }

    pub fn mark_initialized(&self, name: &str) {
        let mut nodes = self.nodes.lock().unwrap();
        Self::ensure(&mut nodes, name);
        nodes.get_mut(name).unwrap().initialized = true;
    }

    pub fn is_initialized(&self, name: &str) -> bool {
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .map(|n| n.initialized)
            .unwrap_or(false)
    }

    /// Names of every node with a direct edge onto `name` -- the reverse of
    /// `depends_on`, for reporting "what's waiting on this service" during
    /// startup.
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let nodes = self.nodes.lock().unwrap();
        let mut dependents: Vec<String> = nodes
            .iter()
            .filter(|(_, node)| node.depends_on.iter().any(|dep| dep == name))
            .map(|(n, _)| n.clone())
            .collect();
        dependents.sort_unstable();
        dependents
    }
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}
