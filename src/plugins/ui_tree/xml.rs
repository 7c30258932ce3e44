use super::compact::{compact, TEXT_SEPARATOR};
use super::types::{CompactChild, CompactNode, ControlGroup, WindowTree};

/// Default ceiling on the characters of a window document.
pub const DEFAULT_MAX_CHARS: usize = 30_000;
pub const TRUNCATION_MARKER: &str = "<!-- truncated -->";

const INDENT: &str = "  ";

pub fn escape_xml(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

fn push_attr(out: &mut String, name: &str, value: &str) {
    out.push(' ');
    out.push_str(name);
    out.push_str("=\"");
    out.push_str(&escape_xml(value));
    out.push('"');
}

fn write_group(out: &mut String, group: &ControlGroup, depth: usize) {
    out.push_str(&INDENT.repeat(depth));
    out.push_str("<group");
    push_attr(out, "role", &group.role);
    push_attr(out, "count", &group.count.to_string());
    push_attr(out, "items", &group.labels.join(TEXT_SEPARATOR));
    out.push_str("/>\n");
}

fn write_node(out: &mut String, node: &CompactNode, depth: usize) {
    let indent = INDENT.repeat(depth);
    out.push_str(&indent);
    out.push_str("<e");
    if !node.role.is_empty() {
        push_attr(out, "role", &node.role);
    }
    if let Some(title) = &node.title {
        push_attr(out, "title", title);
    }
    if let Some(value) = &node.value {
        push_attr(out, "value", value);
    }
    if let Some(description) = &node.description {
        push_attr(out, "desc", description);
    }
    if !node.enabled {
        push_attr(out, "enabled", "false");
    }
    if node.focused {
        push_attr(out, "focused", "true");
    }
    if let Some(text) = &node.text {
        push_attr(out, "text", text);
    }
    if node.omitted > 0 {
        push_attr(out, "more", &node.omitted.to_string());
    }

    if node.children.is_empty() {
        out.push_str("/>\n");
        return;
    }
    out.push_str(">\n");
    for child in &node.children {
        match child {
            CompactChild::Node(child) => write_node(out, child, depth + 1),
            CompactChild::Group(group) => write_group(out, group, depth + 1),
        }
    }
    out.push_str(&indent);
    out.push_str("</e>\n");
}

/// One tag per node, two-space indentation, self-closing leaves.
pub fn encode_xml(node: &CompactNode) -> String {
    let mut out = String::new();
    write_node(&mut out, node, 0);
    out
}

/// Cuts `xml` at the last line break that fits in `max_chars` and appends a marker.
pub fn truncate_output(xml: &str, max_chars: usize) -> String {
    if xml.chars().count() <= max_chars {
        return xml.to_string();
    }
    let cut = xml
        .char_indices()
        .nth(max_chars)
        .map(|(idx, _)| idx)
        .unwrap_or(xml.len());
    let head = &xml[..cut];
    let head = match head.rfind('\n') {
        Some(line_end) => &head[..=line_end],
        None => head,
    };
    format!("{head}{TRUNCATION_MARKER}")
}

/// Compacts every window and wraps them in a `<windows>` document.
///
/// Windows without a tree, or whose tree compacts to nothing, are skipped;
/// `None` when no window is left.
pub fn windows_to_xml(windows: &[WindowTree], max_chars: usize) -> Option<String> {
    let mut body = String::new();
    for window in windows {
        let Some(node) = window.ui_tree.as_ref().and_then(compact) else {
            continue;
        };
        body.push_str(INDENT);
        body.push_str("<w");
        push_attr(&mut body, "app", window.application_name.as_deref().unwrap_or_default());
        push_attr(&mut body, "title", window.window_title.as_deref().unwrap_or_default());
        body.push_str(">\n");
        write_node(&mut body, &node, 2);
        body.push_str(INDENT);
        body.push_str("</w>\n");
    }
    if body.is_empty() {
        return None;
    }

    let xml = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<windows>\n{body}</windows>");
    Some(truncate_output(&xml, max_chars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::ui_tree::UiTreeNode;
    use pretty_assertions::assert_eq;

    #[test]
    fn escapes_reserved_characters() {
        assert_eq!(
            escape_xml(r#"a<b & "c" 'd'>"#),
            "a&lt;b &amp; &quot;c&quot; &apos;d&apos;&gt;"
        );
    }

    #[test]
    fn encodes_nested_tree_with_groups() {
        let mut field = UiTreeNode::new("AXTextField").with_title("To");
        field.focused = Some(true);
        let mut send = UiTreeNode::new("AXButton").with_children(vec![
            UiTreeNode::new("AXStaticText").with_value("Send"),
        ]);
        send.enabled = Some(false);
        let tree = UiTreeNode::new("AXWindow").with_title("Mail & Co").with_children(vec![
            field,
            UiTreeNode::new("AXTab").with_title("Inbox"),
            UiTreeNode::new("AXTab").with_title("Sent"),
            UiTreeNode::new("AXTab").with_title("Drafts"),
            send,
        ]);

        let xml = encode_xml(&compact(&tree).unwrap());
        assert_eq!(
            xml,
            concat!(
                "<e role=\"window\" title=\"Mail &amp; Co\">\n",
                "  <e role=\"textfield\" title=\"To\" focused=\"true\"/>\n",
                "  <group role=\"tab\" count=\"3\" items=\"Inbox | Sent | Drafts\"/>\n",
                "  <e role=\"button\" enabled=\"false\" text=\"Send\"/>\n",
                "</e>\n",
            )
        );
    }

    #[test]
    fn windows_document_skips_empty_windows() {
        let windows = vec![
            WindowTree {
                application_name: Some("Finder".to_string()),
                window_title: Some("Downloads".to_string()),
                ui_tree: Some(UiTreeNode::new("AXButton").with_title("Back")),
                ..Default::default()
            },
            WindowTree {
                application_name: Some("Empty".to_string()),
                ui_tree: Some(UiTreeNode::new("AXGroup")),
                ..Default::default()
            },
            WindowTree::default(),
        ];
        let xml = windows_to_xml(&windows, DEFAULT_MAX_CHARS).unwrap();
        assert_eq!(
            xml,
            concat!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n",
                "<windows>\n",
                "  <w app=\"Finder\" title=\"Downloads\">\n",
                "    <e role=\"button\" title=\"Back\"/>\n",
                "  </w>\n",
                "</windows>",
            )
        );
        assert_eq!(windows_to_xml(&windows[1..], DEFAULT_MAX_CHARS), None);
    }

    #[test]
    fn long_output_is_cut_on_a_line_boundary() {
        let xml = "line one\nline two\nline three";
        assert_eq!(truncate_output(xml, 12), format!("line one\n{TRUNCATION_MARKER}"));
        assert_eq!(truncate_output(xml, 100), xml);
    }
}
