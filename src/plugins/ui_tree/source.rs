use super::types::WindowTree;

pub const DEFAULT_MAX_DEPTH: usize = 6;
pub const MIN_DEPTH: usize = 1;
pub const MAX_DEPTH: usize = 10;

pub fn clamp_depth(max_depth: usize) -> usize {
    max_depth.clamp(MIN_DEPTH, MAX_DEPTH)
}

/// OS accessibility capability: query the UI tree of the active windows.
pub trait UiTreeSource: Send + Sync {
    fn is_supported(&self) -> bool;

    fn check_permission(&self) -> bool;

    /// May prompt the user. Defaults to a plain permission check.
    fn request_permission(&self) -> bool {
        self.check_permission()
    }

    /// `max_depth` is already clamped to `1..=10`.
    fn active_windows(&self, max_depth: usize) -> Result<Vec<WindowTree>, String>;
}

/// Platforms without accessibility bindings.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedSource;

impl UiTreeSource for UnsupportedSource {
    fn is_supported(&self) -> bool {
        false
    }

    fn check_permission(&self) -> bool {
        false
    }

    fn active_windows(&self, _max_depth: usize) -> Result<Vec<WindowTree>, String> {
        Ok(Vec::new())
    }
}

/// Windows captured earlier and stored as JSON (the native bridge's output shape).
#[derive(Debug, Default, Clone)]
pub struct SnapshotSource {
    windows: Vec<WindowTree>,
}

impl SnapshotSource {
    pub fn new(windows: Vec<WindowTree>) -> Self {
        Self { windows }
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        serde_json::from_str(json)
            .map(Self::new)
            .map_err(|e| format!("Invalid UI tree snapshot: {e}"))
    }
}

impl UiTreeSource for SnapshotSource {
    fn is_supported(&self) -> bool {
        true
    }

    fn check_permission(&self) -> bool {
        true
    }

    fn active_windows(&self, max_depth: usize) -> Result<Vec<WindowTree>, String> {
        Ok(self
            .windows
            .iter()
            .map(|window| WindowTree {
                ui_tree: window.ui_tree.as_ref().map(|tree| tree.pruned(max_depth)),
                ..window.clone()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_is_clamped() {
        assert_eq!(clamp_depth(0), 1);
        assert_eq!(clamp_depth(6), 6);
        assert_eq!(clamp_depth(42), 10);
    }

    #[test]
    fn snapshot_source_prunes_to_depth() {
        let source = SnapshotSource::from_json(
            r#"[{
                "applicationName": "Notes",
                "windowTitle": "Today",
                "uiTree": { "role": "AXWindow", "children": [
                    { "role": "AXGroup", "children": [ { "role": "AXButton", "title": "New" } ] }
                ] }
            }]"#,
        )
        .unwrap();
        let windows = source.active_windows(2).unwrap();
        let tree = windows[0].ui_tree.as_ref().unwrap();
        assert_eq!(tree.children.len(), 1);
        assert!(tree.children[0].children.is_empty());
        assert!(SnapshotSource::from_json("{").is_err());
    }
}
