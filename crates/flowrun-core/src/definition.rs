//! Workflow definition format
//!
//! The definition is the immutable JSON stored per workflow version:
//!
//! ```json
//! {
//!   "nodes": [{"id": "n1", "type": "json", "data": {"config": {...}}}],
//!   "edges": [{"id": "e1", "source": "n1", "target": "n2"}]
//! }
//! ```
//!
//! `sourceHandle` is only meaningful for multi-output kinds; the
//! loop-accumulator uses `loop-output` for the iteration body and `output`
//! for the accumulated result.

use serde::{Deserialize, Serialize};

/// Handle name for the loop-accumulator's iteration body edge
pub const HANDLE_LOOP_OUTPUT: &str = "loop-output";

/// Handle name for the loop-accumulator's final result edge
pub const HANDLE_OUTPUT: &str = "output";

/// Node kind identifiers
pub mod kinds {
    pub const START: &str = "start";
    pub const END: &str = "end";
    pub const JSON: &str = "json";
    pub const JSON_ARRAY: &str = "json-array";
    pub const TRANSFORM: &str = "transform";
    pub const CONDITIONAL: &str = "conditional";
    pub const DELAY: &str = "delay";
    pub const SLEEP: &str = "sleep";
    pub const HTTP: &str = "http";
    pub const EMAIL: &str = "email";
    pub const SLACK: &str = "slack";
    pub const JSON_TO_CSV: &str = "json_to_csv";
    pub const LOOP: &str = "loop";
    pub const LOOP_ACCUMULATOR: &str = "loop-accumulator";
}

/// Graph markers execute no work and produce no node execution rows.
pub fn is_marker(kind: &str) -> bool {
    kind == kinds::START || kind == kinds::END
}

/// Loop kinds are driven by the loop driver instead of the plain executor path.
pub fn is_loop_kind(kind: &str) -> bool {
    kind == kinds::LOOP || kind == kinds::LOOP_ACCUMULATOR
}

/// A complete workflow definition (nodes and edges) at one version
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl WorkflowDefinition {
    pub fn new(nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> Self {
        Self { nodes, edges }
    }
}

/// One node in the definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub id: String,

    /// Behavioral kind, e.g. `transform`, `http`, `sleep`
    #[serde(rename = "type")]
    pub kind: String,

    /// Editor coordinates; ignored by the engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<Position>,

    #[serde(default)]
    pub data: NodeData,
}

impl NodeDefinition {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            position: None,
            data: NodeData::default(),
        }
    }

    /// Set the kind-specific config map
    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.data.config = config;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.data.label = Some(label.into());
        self
    }
}

/// Node payload: display label plus the kind-specific config map
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(default)]
    pub config: serde_json::Value,
}

/// Editor position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// One directed edge in the definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    pub id: String,
    pub source: String,
    pub target: String,

    #[serde(
        default,
        rename = "sourceHandle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,

    #[serde(
        default,
        rename = "targetHandle",
        skip_serializing_if = "Option::is_none"
    )]
    pub target_handle: Option<String>,
}

impl EdgeDefinition {
    pub fn new(
        id: impl Into<String>,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
        }
    }

    pub fn with_source_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_definition_round_trip() {
        let json = serde_json::json!({
            "nodes": [
                {"id": "start-1", "type": "start", "data": {"config": {}}},
                {"id": "t-1", "type": "transform", "position": {"x": 100.0, "y": 50.0},
                 "data": {"label": "Rename", "config": {"operations": []}}}
            ],
            "edges": [
                {"id": "e-1", "source": "start-1", "target": "t-1", "sourceHandle": "output"}
            ]
        });

        let def: WorkflowDefinition = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(def.nodes.len(), 2);
        assert_eq!(def.nodes[1].kind, "transform");
        assert_eq!(def.edges[0].source_handle.as_deref(), Some("output"));

        let back = serde_json::to_value(&def).unwrap();
        assert_eq!(back["edges"][0]["sourceHandle"], "output");
    }

    #[test]
    fn test_marker_and_loop_classification() {
        assert!(is_marker("start"));
        assert!(is_marker("end"));
        assert!(!is_marker("json"));
        assert!(is_loop_kind("loop"));
        assert!(is_loop_kind("loop-accumulator"));
        assert!(!is_loop_kind("transform"));
    }

    #[test]
    fn test_missing_optional_fields() {
        let def: WorkflowDefinition = serde_json::from_value(serde_json::json!({
            "nodes": [{"id": "a", "type": "json"}],
            "edges": []
        }))
        .unwrap();
        assert!(def.nodes[0].position.is_none());
        assert!(def.nodes[0].data.label.is_none());
        assert!(def.nodes[0].data.config.is_null());
    }
}
