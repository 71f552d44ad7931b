//! Validated workflow graph
//!
//! Wraps a [`WorkflowDefinition`] with the lookups the runner needs: node map,
//! adjacency in author order, the unique start node. Loading rejects
//! structural problems (missing/multiple starts, dangling edges, duplicate
//! ids) and cycles. The only permitted cycles are loop-accumulator feedback
//! edges; cycle detection therefore ignores edges targeting an accumulator
//! node, which the loop driver never follows either.

use std::collections::HashMap;

use crate::definition::{kinds, EdgeDefinition, NodeDefinition, WorkflowDefinition};
use crate::error::ValidationError;

/// A validated workflow graph
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: HashMap<String, NodeDefinition>,
    outgoing: HashMap<String, Vec<EdgeDefinition>>,
    incoming: HashMap<String, Vec<EdgeDefinition>>,
    start_id: String,
    node_order: Vec<String>,
}

impl Graph {
    /// Validate and index a definition.
    pub fn load(definition: &WorkflowDefinition) -> Result<Self, ValidationError> {
        let mut nodes = HashMap::new();
        let mut node_order = Vec::with_capacity(definition.nodes.len());
        for node in &definition.nodes {
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(ValidationError::DuplicateNode(node.id.clone()));
            }
            node_order.push(node.id.clone());
        }

        let starts: Vec<&NodeDefinition> = definition
            .nodes
            .iter()
            .filter(|n| n.kind == kinds::START)
            .collect();
        let start_id = match starts.as_slice() {
            [only] => only.id.clone(),
            [] => return Err(ValidationError::MissingStart),
            many => return Err(ValidationError::MultipleStarts(many.len())),
        };

        let mut outgoing: HashMap<String, Vec<EdgeDefinition>> = HashMap::new();
        let mut incoming: HashMap<String, Vec<EdgeDefinition>> = HashMap::new();
        for edge in &definition.edges {
            for node_id in [&edge.source, &edge.target] {
                if !nodes.contains_key(node_id) {
                    return Err(ValidationError::UnknownEdgeTarget {
                        edge_id: edge.id.clone(),
                        node_id: node_id.clone(),
                    });
                }
            }
            outgoing
                .entry(edge.source.clone())
                .or_default()
                .push(edge.clone());
            incoming
                .entry(edge.target.clone())
                .or_default()
                .push(edge.clone());
        }

        let graph = Self {
            nodes,
            outgoing,
            incoming,
            start_id,
            node_order,
        };
        graph.reject_cycles()?;
        Ok(graph)
    }

    /// Check every node kind against the registry's known set.
    pub fn validate_kinds(&self, is_known: impl Fn(&str) -> bool) -> Result<(), ValidationError> {
        for id in &self.node_order {
            let kind = &self.nodes[id].kind;
            if !is_known(kind) {
                return Err(ValidationError::UnknownNodeKind(kind.clone()));
            }
        }
        Ok(())
    }

    pub fn start(&self) -> &NodeDefinition {
        &self.nodes[&self.start_id]
    }

    pub fn node(&self, id: &str) -> Option<&NodeDefinition> {
        self.nodes.get(id)
    }

    /// Outgoing edges in author order (empty slice when none)
    pub fn successors(&self, id: &str) -> &[EdgeDefinition] {
        self.outgoing.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Incoming edges in author order
    pub fn predecessors(&self, id: &str) -> &[EdgeDefinition] {
        self.incoming.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Node ids in definition order
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.node_order.iter().map(String::as_str)
    }

    /// DFS three-color cycle check, skipping accumulator feedback edges.
    fn reject_cycles(&self) -> Result<(), ValidationError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&str, Color> =
            self.node_order.iter().map(|id| (id.as_str(), Color::White)).collect();

        // Iterative DFS; the stack holds (node, next edge index).
        for root in &self.node_order {
            if colors[root.as_str()] != Color::White {
                continue;
            }
            let mut stack: Vec<(&str, usize)> = vec![(root.as_str(), 0)];
            colors.insert(root.as_str(), Color::Gray);

            while let Some((node, edge_idx)) = stack.pop() {
                let edges = self.successors(node);
                let mut advanced = false;
                for (i, edge) in edges.iter().enumerate().skip(edge_idx) {
                    let target = edge.target.as_str();
                    // Feedback edges into an accumulator are the one legal cycle.
                    if self
                        .nodes
                        .get(target)
                        .is_some_and(|n| n.kind == kinds::LOOP_ACCUMULATOR)
                    {
                        continue;
                    }
                    match colors[target] {
                        Color::Gray => {
                            return Err(ValidationError::Cycle(target.to_string()));
                        }
                        Color::White => {
                            stack.push((node, i + 1));
                            stack.push((target, 0));
                            colors.insert(target, Color::Gray);
                            advanced = true;
                            break;
                        }
                        Color::Black => {}
                    }
                }
                if !advanced {
                    colors.insert(node, Color::Black);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{EdgeDefinition as Edge, NodeDefinition as Node};

    fn linear() -> WorkflowDefinition {
        WorkflowDefinition::new(
            vec![
                Node::new("s", "start"),
                Node::new("a", "json"),
                Node::new("b", "transform"),
                Node::new("e", "end"),
            ],
            vec![
                Edge::new("e1", "s", "a"),
                Edge::new("e2", "a", "b"),
                Edge::new("e3", "b", "e"),
            ],
        )
    }

    #[test]
    fn test_load_linear() {
        let graph = Graph::load(&linear()).unwrap();
        assert_eq!(graph.start().id, "s");
        assert_eq!(graph.successors("a").len(), 1);
        assert_eq!(graph.successors("e").len(), 0);
        assert_eq!(graph.predecessors("b")[0].source, "a");
        assert_eq!(graph.node_count(), 4);
    }

    #[test]
    fn test_missing_start() {
        let def = WorkflowDefinition::new(vec![Node::new("a", "json")], vec![]);
        assert!(matches!(
            Graph::load(&def),
            Err(ValidationError::MissingStart)
        ));
    }

    #[test]
    fn test_multiple_starts() {
        let def = WorkflowDefinition::new(
            vec![Node::new("s1", "start"), Node::new("s2", "start")],
            vec![],
        );
        assert!(matches!(
            Graph::load(&def),
            Err(ValidationError::MultipleStarts(2))
        ));
    }

    #[test]
    fn test_duplicate_node_id() {
        let def = WorkflowDefinition::new(
            vec![Node::new("s", "start"), Node::new("s", "json")],
            vec![],
        );
        assert!(matches!(
            Graph::load(&def),
            Err(ValidationError::DuplicateNode(_))
        ));
    }

    #[test]
    fn test_dangling_edge() {
        let def = WorkflowDefinition::new(
            vec![Node::new("s", "start")],
            vec![Edge::new("e1", "s", "ghost")],
        );
        assert!(matches!(
            Graph::load(&def),
            Err(ValidationError::UnknownEdgeTarget { .. })
        ));
    }

    #[test]
    fn test_plain_cycle_rejected() {
        let def = WorkflowDefinition::new(
            vec![
                Node::new("s", "start"),
                Node::new("a", "json"),
                Node::new("b", "json"),
            ],
            vec![
                Edge::new("e1", "s", "a"),
                Edge::new("e2", "a", "b"),
                Edge::new("e3", "b", "a"),
            ],
        );
        assert!(matches!(Graph::load(&def), Err(ValidationError::Cycle(_))));
    }

    #[test]
    fn test_accumulator_feedback_allowed() {
        // acc --loop-output--> body --> acc (feedback), acc --output--> after
        let def = WorkflowDefinition::new(
            vec![
                Node::new("s", "start"),
                Node::new("acc", "loop-accumulator"),
                Node::new("body", "transform"),
                Node::new("after", "json"),
            ],
            vec![
                Edge::new("e1", "s", "acc"),
                Edge::new("e2", "acc", "body").with_source_handle("loop-output"),
                Edge::new("e3", "body", "acc"),
                Edge::new("e4", "acc", "after").with_source_handle("output"),
            ],
        );
        let graph = Graph::load(&def).unwrap();
        assert_eq!(graph.successors("acc").len(), 2);
    }

    #[test]
    fn test_validate_kinds() {
        let graph = Graph::load(&linear()).unwrap();
        assert!(graph.validate_kinds(|_| true).is_ok());
        let err = graph.validate_kinds(|k| k != "transform").unwrap_err();
        assert!(matches!(err, ValidationError::UnknownNodeKind(k) if k == "transform"));
    }
}
