//! Lossy compaction of raw accessibility trees.
//!
//! [`compact`] walks the tree bottom-up. Each node's children are compacted
//! first, then the node goes through five passes:
//!
//! 1. [`filter_important`] drops nodes with nothing worth showing.
//! 2. [`collapse_single_text_child`] folds a lone text child into the parent.
//! 3. [`elide_transparent_containers`] splices unlabeled layout containers away.
//! 4. [`aggregate_text_dense`] joins text-heavy child lists into one attribute.
//! 5. [`group_repeated_controls`] summarizes runs of identical controls.
//!
//! The output is deterministic for a given input.

use super::types::{CompactChild, CompactNode, ControlGroup, UiTreeNode};

/// Children kept per node; the rest are counted in `omitted`.
pub const MAX_COMPACT_CHILDREN: usize = 50;

const TEXT_DENSE_MIN_CHILDREN: usize = 5;
/// Share of text leaves (in tenths) above which children are aggregated.
const TEXT_DENSE_TENTHS: usize = 7;
const MIN_GROUP_RUN: usize = 3;
const MAX_GROUP_LABELS: usize = 10;

pub const TEXT_SEPARATOR: &str = " | ";

const IMPORTANT_ROLES: &[&str] = &[
    "button",
    "textfield",
    "textarea",
    "statictext",
    "text",
    "link",
    "image",
    "menubutton",
    "popupbutton",
    "checkbox",
    "radiobutton",
    "slider",
    "table",
    "list",
    "menu",
    "menuitem",
    "toolbar",
    "tab",
    "tabgroup",
    "window",
    "dialog",
    "sheet",
];

const TEXT_ROLES: &[&str] = &["statictext", "text"];

const TRANSPARENT_ROLES: &[&str] = &[
    "",
    "group",
    "scrollarea",
    "splitgroup",
    "layoutarea",
    "layoutitem",
    "pane",
    "generic",
    "unknown",
];

const GROUPABLE_ROLES: &[&str] = &["button", "menuitem", "tab", "link"];

/// `AXStaticText` -> `statictext`.
pub fn normalize_role(role: &str) -> String {
    role.strip_prefix("AX").unwrap_or(role).to_ascii_lowercase()
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn has_role(node: &CompactNode, roles: &[&str]) -> bool {
    roles.contains(&node.role.as_str())
}

/// Title, then value, then absorbed text.
fn label(node: &CompactNode) -> Option<&str> {
    node.title
        .as_deref()
        .or(node.value.as_deref())
        .or(node.text.as_deref())
}

/// Label of a childless text node.
fn text_leaf_label(child: &CompactChild) -> Option<&str> {
    let CompactChild::Node(node) = child else {
        return None;
    };
    if !has_role(node, TEXT_ROLES) || !node.children.is_empty() || node.omitted > 0 {
        return None;
    }
    node.value
        .as_deref()
        .or(node.title.as_deref())
        .or(node.text.as_deref())
}

/// Compacts `root`. `None` when nothing in the tree is worth keeping.
pub fn compact(root: &UiTreeNode) -> Option<CompactNode> {
    let children: Vec<CompactChild> = root
        .children
        .iter()
        .filter_map(compact)
        .map(CompactChild::Node)
        .collect();

    let mut node = CompactNode {
        role: root.role.as_deref().map(normalize_role).unwrap_or_default(),
        title: non_empty(&root.title),
        value: non_empty(&root.value),
        description: non_empty(&root.description),
        enabled: root.enabled.unwrap_or(true),
        focused: root.focused.unwrap_or(false),
        text: None,
        children: elide_transparent_containers(children),
        omitted: 0,
    };

    if !filter_important(&node) {
        return None;
    }
    collapse_single_text_child(&mut node);
    aggregate_text_dense(&mut node);
    group_repeated_controls(&mut node);

    if node.children.len() > MAX_COMPACT_CHILDREN {
        node.omitted = node.children.len() - MAX_COMPACT_CHILDREN;
        node.children.truncate(MAX_COMPACT_CHILDREN);
    }
    Some(node)
}

/// Whether the node carries a label, an interesting role, focus or kept children.
pub fn filter_important(node: &CompactNode) -> bool {
    node.title.is_some()
        || node.value.is_some()
        || node.focused
        || has_role(node, IMPORTANT_ROLES)
        || !node.children.is_empty()
}

/// A node whose only child is a text leaf takes that text and drops the child.
pub fn collapse_single_text_child(node: &mut CompactNode) {
    if node.children.len() != 1 {
        return;
    }
    let Some(text) = text_leaf_label(&node.children[0]).map(str::to_string) else {
        return;
    };
    node.text = Some(text);
    node.children.clear();
}

fn is_transparent(node: &CompactNode) -> bool {
    has_role(node, TRANSPARENT_ROLES)
        && node.title.is_none()
        && node.value.is_none()
        && node.description.is_none()
        && node.text.is_none()
        && !node.focused
        && node.omitted == 0
}

/// Replaces unlabeled layout containers with their own children.
pub fn elide_transparent_containers(children: Vec<CompactChild>) -> Vec<CompactChild> {
    let mut out = Vec::with_capacity(children.len());
    for child in children {
        match child {
            CompactChild::Node(node) if is_transparent(&node) => out.extend(node.children),
            other => out.push(other),
        }
    }
    out
}

/// With five or more children of which over 70% are text leaves, the leaves
/// become one `text` attribute and only the other children stay.
pub fn aggregate_text_dense(node: &mut CompactNode) {
    let total = node.children.len();
    if total < TEXT_DENSE_MIN_CHILDREN {
        return;
    }
    let text_count = node
        .children
        .iter()
        .filter(|child| text_leaf_label(child).is_some())
        .count();
    if text_count * 10 <= total * TEXT_DENSE_TENTHS {
        return;
    }

    let mut texts = Vec::with_capacity(text_count);
    let mut rest = Vec::with_capacity(total - text_count);
    for child in std::mem::take(&mut node.children) {
        match text_leaf_label(&child) {
            Some(text) => texts.push(text.to_string()),
            None => rest.push(child),
        }
    }

    let joined = texts.join(TEXT_SEPARATOR);
    node.text = Some(match node.text.take() {
        Some(existing) => format!("{existing}{TEXT_SEPARATOR}{joined}"),
        None => joined,
    });
    node.children = rest;
}

fn groupable(child: &CompactChild) -> Option<(&str, &str)> {
    let CompactChild::Node(node) = child else {
        return None;
    };
    if !has_role(node, GROUPABLE_ROLES) || !node.children.is_empty() {
        return None;
    }
    label(node).map(|label| (node.role.as_str(), label))
}

fn flush_run(run: &mut Vec<CompactChild>, out: &mut Vec<CompactChild>) {
    if run.len() < MIN_GROUP_RUN {
        out.append(run);
        return;
    }
    let mut role = String::new();
    let mut labels = Vec::new();
    for child in run.iter() {
        if let Some((r, l)) = groupable(child) {
            if role.is_empty() {
                role = r.to_string();
            }
            if labels.len() < MAX_GROUP_LABELS {
                labels.push(l.to_string());
            }
        }
    }
    out.push(CompactChild::Group(ControlGroup {
        role,
        count: run.len(),
        labels,
    }));
    run.clear();
}

/// Runs of three or more labeled, childless siblings sharing a button, menu
/// item, tab or link role become one [`ControlGroup`].
pub fn group_repeated_controls(node: &mut CompactNode) {
    let mut out = Vec::with_capacity(node.children.len());
    let mut run: Vec<CompactChild> = Vec::new();
    let mut run_role = String::new();

    for child in std::mem::take(&mut node.children) {
        match groupable(&child).map(|(role, _)| role.to_string()) {
            Some(role) if role == run_role => run.push(child),
            Some(role) => {
                flush_run(&mut run, &mut out);
                run_role = role;
                run.push(child);
            }
            None => {
                flush_run(&mut run, &mut out);
                run_role.clear();
                out.push(child);
            }
        }
    }
    flush_run(&mut run, &mut out);
    node.children = out;
}
