//! Workflow graph structure and execution order.
//!
//! Nodes run once each, only after all of their predecessors. Among nodes
//! that become ready together, the one whose edge appears first in the
//! document runs first, and a newly ready child runs before older ready
//! siblings (depth-first where the graph allows it).

use crate::error::{AppResult, EchemError};
use crate::workflow::document::{Edge, Node};
use std::collections::HashMap;

/// Validated adjacency of a workflow.
#[derive(Clone, Debug)]
pub struct WorkflowGraph {
    ids: Vec<String>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
    order: Vec<usize>,
}

impl WorkflowGraph {
    /// Validates the graph and computes its execution order.
    ///
    /// Rejects duplicate node ids, edges naming unknown nodes, graphs without
    /// a root and graphs containing a cycle.
    pub fn build(nodes: &[Node], edges: &[Edge]) -> AppResult<Self> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.id.as_str(), i).is_some() {
                return Err(EchemError::InvalidWorkflow(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut children = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for edge in edges {
            let lookup = |id: &str| {
                index.get(id).copied().ok_or_else(|| {
                    EchemError::InvalidWorkflow(format!(
                        "edge {} -> {} references unknown node '{id}'",
                        edge.source, edge.target
                    ))
                })
            };
            let source = lookup(&edge.source)?;
            let target = lookup(&edge.target)?;
            children[source].push(target);
            in_degree[target] += 1;
        }

        let roots: Vec<usize> = (0..nodes.len()).filter(|&i| in_degree[i] == 0).collect();
        if roots.is_empty() {
            return Err(EchemError::NoRootNode);
        }

        // Kahn's algorithm over a stack
        let mut remaining = in_degree;
        let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
        let mut order = Vec::with_capacity(nodes.len());
        while let Some(current) = stack.pop() {
            order.push(current);
            for &child in children[current].iter().rev() {
                remaining[child] -= 1;
                if remaining[child] == 0 {
                    stack.push(child);
                }
            }
        }

        if order.len() != nodes.len() {
            let mut stuck: Vec<String> = (0..nodes.len())
                .filter(|&i| remaining[i] > 0)
                .map(|i| nodes[i].id.clone())
                .collect();
            stuck.sort();
            return Err(EchemError::CyclicWorkflow(stuck));
        }

        Ok(Self {
            ids: nodes.iter().map(|node| node.id.clone()).collect(),
            children,
            roots,
            order,
        })
    }

    /// Node ids in execution order.
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Ids of nodes without predecessors, in document order.
    pub fn roots(&self) -> Vec<&str> {
        self.roots.iter().map(|&i| self.ids[i].as_str()).collect()
    }

    /// Direct successors of `id`, in edge order.
    pub fn children(&self, id: &str) -> Vec<&str> {
        self.ids
            .iter()
            .position(|candidate| candidate == id)
            .map(|i| {
                self.children[i]
                    .iter()
                    .map(|&child| self.ids[child].as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[allow(missing_docs)]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<Node> {
        ids.iter().map(|id| Node::new(*id, *id)).collect()
    }

    fn edges(pairs: &[(&str, &str)]) -> Vec<Edge> {
        pairs.iter().map(|(s, t)| Edge::new(*s, *t)).collect()
    }

    #[test]
    fn test_diamond_runs_join_once() {
        let graph = WorkflowGraph::build(
            &nodes(&["A", "B", "C", "D"]),
            &edges(&[("A", "B"), ("A", "C"), ("B", "D"), ("C", "D")]),
        )
        .unwrap();
        assert_eq!(graph.order(), vec!["A", "B", "C", "D"]);
        assert_eq!(graph.roots(), vec!["A"]);
        assert_eq!(graph.children("A"), vec!["B", "C"]);
    }

    #[test]
    fn test_depth_first_branches() {
        let graph = WorkflowGraph::build(
            &nodes(&["A", "B", "C", "E"]),
            &edges(&[("A", "B"), ("A", "C"), ("B", "E")]),
        )
        .unwrap();
        assert_eq!(graph.order(), vec!["A", "B", "E", "C"]);
    }

    #[test]
    fn test_multiple_roots_in_document_order() {
        let graph =
            WorkflowGraph::build(&nodes(&["x", "y", "z"]), &edges(&[("y", "z")])).unwrap();
        assert_eq!(graph.roots(), vec!["x", "y"]);
        assert_eq!(graph.order(), vec!["x", "y", "z"]);
    }

    #[test]
    fn test_cycle_rejected() {
        let err = WorkflowGraph::build(
            &nodes(&["0", "1", "2"]),
            &edges(&[("0", "1"), ("1", "2"), ("2", "1")]),
        )
        .unwrap_err();
        match err {
            EchemError::CyclicWorkflow(ids) => assert_eq!(ids, vec!["1", "2"]),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_no_root() {
        let err =
            WorkflowGraph::build(&nodes(&["a", "b"]), &edges(&[("a", "b"), ("b", "a")]))
                .unwrap_err();
        assert!(matches!(err, EchemError::NoRootNode));
        assert!(matches!(
            WorkflowGraph::build(&[], &[]),
            Err(EchemError::NoRootNode)
        ));
    }

    #[test]
    fn test_dangling_edge_and_duplicate_id() {
        let err = WorkflowGraph::build(&nodes(&["a"]), &edges(&[("a", "ghost")])).unwrap_err();
        assert!(err.to_string().contains("ghost"));

        let err = WorkflowGraph::build(&nodes(&["a", "a"]), &[]).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }
}
