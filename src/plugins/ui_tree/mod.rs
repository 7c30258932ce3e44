//! UI tree "plugin" (crate-local module).
//!
//! - Models the OS accessibility tree as an opaque capability ([`UiTreeSource`]).
//! - Compacts raw trees into a small XML-like text for multimodal prompts.

mod compact;
mod source;
mod types;
mod xml;

pub use compact::{
    aggregate_text_dense, collapse_single_text_child, compact, elide_transparent_containers,
    filter_important, group_repeated_controls, normalize_role, MAX_COMPACT_CHILDREN,
};
pub use source::{
    clamp_depth, SnapshotSource, UiTreeSource, UnsupportedSource, DEFAULT_MAX_DEPTH,
};
pub use types::{CompactChild, CompactNode, ControlGroup, UiBounds, UiTreeNode, WindowTree};
pub use xml::{encode_xml, escape_xml, windows_to_xml, DEFAULT_MAX_CHARS, TRUNCATION_MARKER};

/// Compacted XML of every active window, or `None` when unsupported,
/// not permitted, or nothing is visible.
pub fn windows_for_ai(
    source: &dyn UiTreeSource,
    max_depth: Option<usize>,
    max_chars: usize,
) -> Option<String> {
    app_windows_for_ai(source, None, max_depth, max_chars)
}

/// Like [`windows_for_ai`], narrowed to windows whose application name
/// matches `target_app` (case-insensitive). Falls back to every window when
/// none match.
pub fn app_windows_for_ai(
    source: &dyn UiTreeSource,
    target_app: Option<&str>,
    max_depth: Option<usize>,
    max_chars: usize,
) -> Option<String> {
    if !source.is_supported() {
        log::debug!("UI tree capture is not supported on this platform");
        return None;
    }
    if !source.check_permission() {
        log::warn!("UI tree capture needs accessibility permission");
        return None;
    }

    let depth = clamp_depth(max_depth.unwrap_or(DEFAULT_MAX_DEPTH));
    let windows = match source.active_windows(depth) {
        Ok(windows) => windows,
        Err(err) => {
            log::warn!("Failed to read UI trees: {}", err);
            return None;
        }
    };
    let windows = match target_app {
        Some(app) => narrow_to_app(windows, app),
        None => windows,
    };
    log::debug!("Compacting UI trees of {} windows (depth {})", windows.len(), depth);
    windows_to_xml(&windows, max_chars)
}

fn narrow_to_app(windows: Vec<WindowTree>, app: &str) -> Vec<WindowTree> {
    let wanted = app.trim().to_lowercase();
    let matches = |window: &WindowTree| {
        window
            .application_name
            .as_deref()
            .is_some_and(|name| name.to_lowercase() == wanted)
    };
    if wanted.is_empty() || !windows.iter().any(matches) {
        log::debug!("No window belongs to {:?}; keeping all windows", app);
        return windows;
    }
    windows.into_iter().filter(|window| matches(window)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_platform_yields_nothing() {
        assert_eq!(windows_for_ai(&UnsupportedSource, None, DEFAULT_MAX_CHARS), None);
    }

    #[test]
    fn snapshot_is_compacted_into_a_document() {
        let source = SnapshotSource::new(vec![WindowTree {
            application_name: Some("Calc".to_string()),
            window_title: Some("Calculator".to_string()),
            ui_tree: Some(UiTreeNode::new("AXWindow").with_children(vec![
                UiTreeNode::new("AXButton")
                    .with_children(vec![UiTreeNode::new("AXStaticText").with_value("OK")]),
            ])),
            ..Default::default()
        }]);
        let xml = windows_for_ai(&source, Some(99), DEFAULT_MAX_CHARS).unwrap();
        assert!(xml.contains("<w app=\"Calc\" title=\"Calculator\">"));
        assert!(xml.contains("<e role=\"button\" text=\"OK\"/>"));
    }

    fn window(app: &str, title: &str) -> WindowTree {
        WindowTree {
            application_name: Some(app.to_string()),
            window_title: Some(title.to_string()),
            ui_tree: Some(UiTreeNode::new("AXWindow").with_children(vec![
                UiTreeNode::new("AXButton")
                    .with_children(vec![UiTreeNode::new("AXStaticText").with_value(title)]),
            ])),
            ..Default::default()
        }
    }

    #[test]
    fn target_app_narrows_the_document() {
        let source = SnapshotSource::new(vec![
            window("Clash Verge", "Proxies"),
            window("Finder", "Downloads"),
        ]);
        let xml = app_windows_for_ai(&source, Some("clash verge"), Some(8), DEFAULT_MAX_CHARS).unwrap();
        assert!(xml.contains("Clash Verge"));
        assert!(!xml.contains("Finder"));

        let all = app_windows_for_ai(&source, Some("Safari"), Some(8), DEFAULT_MAX_CHARS).unwrap();
        assert!(all.contains("Clash Verge"));
        assert!(all.contains("Finder"));
    }
}
