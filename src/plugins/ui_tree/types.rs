use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UiBounds {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

/// Raw accessibility node as reported by the OS.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiTreeNode {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Numeric values (sliders, steppers) arrive as numbers.
    #[serde(default, deserialize_with = "string_or_number")]
    pub value: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub focused: Option<bool>,
    #[serde(default)]
    pub bounds: Option<UiBounds>,
    #[serde(default)]
    pub children: Vec<UiTreeNode>,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    })
}

impl UiTreeNode {
    pub fn new(role: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = Some(title.to_string());
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    pub fn with_children(mut self, children: Vec<UiTreeNode>) -> Self {
        self.children = children;
        self
    }

    /// Copy limited to `max_depth` levels (the root is level 1).
    pub fn pruned(&self, max_depth: usize) -> Self {
        let mut node = self.clone();
        if max_depth <= 1 {
            node.children.clear();
        } else {
            node.children = self
                .children
                .iter()
                .map(|child| child.pruned(max_depth - 1))
                .collect();
        }
        node
    }
}

/// One top-level window and its tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowTree {
    #[serde(default)]
    pub application_name: Option<String>,
    #[serde(default)]
    pub bundle_identifier: Option<String>,
    #[serde(default)]
    pub process_id: Option<u32>,
    #[serde(default)]
    pub window_title: Option<String>,
    #[serde(default)]
    pub ui_tree: Option<UiTreeNode>,
}

/// A node that survived compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactNode {
    /// Normalised role (`AX` prefix dropped, lowercase).
    pub role: String,
    pub title: Option<String>,
    pub value: Option<String>,
    pub description: Option<String>,
    pub enabled: bool,
    pub focused: bool,
    /// Text absorbed from a single text child or aggregated from many.
    pub text: Option<String>,
    pub children: Vec<CompactChild>,
    /// Children dropped by the per-node cap.
    pub omitted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompactChild {
    Node(CompactNode),
    Group(ControlGroup),
}

/// A run of sibling controls sharing one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlGroup {
    pub role: String,
    /// Length of the run.
    pub count: usize,
    /// Labels of the first controls in the run.
    pub labels: Vec<String>,
}
