use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::debug;

use refinery_core::error::RefineryError;
use refinery_core::types::{Agent, Connection};

/// An agent as seen by the graph, with its position in the dependency order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub is_active: bool,
    pub order: i64,
    /// 0 for roots, else 1 + the highest level among inputs.
    pub level: usize,
    /// Ids of agents this agent consumes from.
    pub inputs: Vec<String>,
    /// Ids of agents consuming this agent's output.
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphEdge {
    pub id: String,
    pub source: String,
    pub target: String,
    pub is_active: bool,
}

/// Read-only graph view. Recomputed on every read, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Graph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    #[serde(skip)]
    index: HashMap<String, usize>,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&GraphNode> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Nodes with no inputs.
    pub fn roots(&self) -> Vec<&GraphNode> {
        self.nodes.iter().filter(|n| n.inputs.is_empty()).collect()
    }

    /// Nodes with no outputs.
    pub fn leaves(&self) -> Vec<&GraphNode> {
        self.nodes.iter().filter(|n| n.outputs.is_empty()).collect()
    }

    pub fn inputs(&self, id: &str) -> &[String] {
        self.node(id).map(|n| n.inputs.as_slice()).unwrap_or(&[])
    }

    pub fn outputs(&self, id: &str) -> &[String] {
        self.node(id).map(|n| n.outputs.as_slice()).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }
}

/// Builds `Graph` views from stored records.
#[derive(Debug, Clone)]
pub struct GraphValidator {
    active_only: bool,
    excluded: Vec<String>,
}

impl Default for GraphValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

impl GraphValidator {
    /// Validator over active agents with no exclusions.
    pub fn new() -> Self {
        Self {
            active_only: true,
            excluded: vec![],
        }
    }

    /// Include inactive agents as nodes.
    pub fn include_inactive(mut self) -> Self {
        self.active_only = false;
        self
    }

    /// Agent names left out of the graph entirely.
    pub fn excluding(mut self, names: Vec<String>) -> Self {
        self.excluded = names;
        self
    }

    pub fn build(&self, agents: &[Agent], connections: &[Connection]) -> Graph {
        let mut selected: Vec<&Agent> = agents
            .iter()
            .filter(|a| !self.active_only || a.is_active)
            .filter(|a| !self.excluded.iter().any(|name| name == &a.name))
            .collect();
        selected.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));

        let index: HashMap<String, usize> = selected
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id.clone(), i))
            .collect();

        let mut nodes: Vec<GraphNode> = selected
            .iter()
            .map(|a| GraphNode {
                id: a.id.clone(),
                name: a.name.clone(),
                display_name: a.display_name.clone(),
                is_active: a.is_active,
                order: a.order,
                level: 0,
                inputs: vec![],
                outputs: vec![],
            })
            .collect();

        // Edges touching agents outside the node set are dropped from the view
        let mut edges = Vec::new();
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
        let mut self_edge = false;
        for conn in connections.iter().filter(|c| c.is_active) {
            let (Some(&src), Some(&dst)) = (
                index.get(&conn.source_agent_id),
                index.get(&conn.target_agent_id),
            ) else {
                continue;
            };
            edges.push(GraphEdge {
                id: conn.id.clone(),
                source: conn.source_agent_id.clone(),
                target: conn.target_agent_id.clone(),
                is_active: conn.is_active,
            });
            if src == dst {
                self_edge = true;
            }
            if adjacency[src].contains(&dst) {
                continue;
            }
            adjacency[src].push(dst);
            nodes[src].outputs.push(conn.target_agent_id.clone());
            nodes[dst].inputs.push(conn.source_agent_id.clone());
        }

        let has_cycle = self_edge || has_cycle(&adjacency);
        let mut validation_errors = Vec::new();
        if has_cycle {
            debug!(nodes = nodes.len(), edges = edges.len(), "Agent graph has a cycle");
            validation_errors.push(RefineryError::GraphCycle.to_string());
        } else {
            for (i, level) in compute_levels(&adjacency).into_iter().enumerate() {
                nodes[i].level = level;
            }
        }

        Graph {
            nodes,
            edges,
            is_valid: !has_cycle,
            validation_errors,
            index,
        }
    }
}

/// Three-color DFS. Reaching a gray node means a back edge.
fn has_cycle(adjacency: &[Vec<usize>]) -> bool {
    let mut color = vec![Color::White; adjacency.len()];

    for start in 0..adjacency.len() {
        if color[start] != Color::White {
            continue;
        }
        color[start] = Color::Gray;
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];

        while let Some(top) = stack.last_mut() {
            let node = top.0;
            if top.1 < adjacency[node].len() {
                let child = adjacency[node][top.1];
                top.1 += 1;
                match color[child] {
                    Color::Gray => return true,
                    Color::White => {
                        color[child] = Color::Gray;
                        stack.push((child, 0));
                    }
                    Color::Black => {}
                }
            } else {
                color[node] = Color::Black;
                stack.pop();
            }
        }
    }
    false
}

/// Kahn's algorithm. Only called on an acyclic adjacency list.
fn compute_levels(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let mut in_degree = vec![0usize; adjacency.len()];
    for targets in adjacency {
        for &t in targets {
            in_degree[t] += 1;
        }
    }

    let mut levels = vec![0usize; adjacency.len()];
    let mut ready: VecDeque<usize> = (0..adjacency.len()).filter(|&i| in_degree[i] == 0).collect();

    while let Some(node) = ready.pop_front() {
        for &t in &adjacency[node] {
            levels[t] = levels[t].max(levels[node] + 1);
            in_degree[t] -= 1;
            if in_degree[t] == 0 {
                ready.push_back(t);
            }
        }
    }
    levels
}
