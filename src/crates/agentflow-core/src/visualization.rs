//! Graph rendering
//!
//! Renders the declared graph structure in three formats:
//! - **DOT/Graphviz** for rendered diagrams (`dot -Tpng graph.dot`)
//! - **Mermaid** for markdown documentation
//! - **ASCII** for quick console inspection
//!
//! Rendering reads only the IR, so it works before any factory is
//! registered; the same output describes what the compiled graph will do,
//! because the builder never rewrites edges.
//!
//! # Example
//!
//! ```rust,ignore
//! use agentflow_core::visualization::{render, RenderOptions};
//!
//! let ir = agentflow_core::normalize(&doc)?;
//! println!("{}", render(&ir, &RenderOptions::mermaid().with_title("pipeline")));
//! ```

use std::fmt::Write as _;

use crate::ir::{EdgeDescriptor, NodeKind, WorkflowIr};

/// Output format for [`render`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderFormat {
    Dot,
    Mermaid,
    Ascii,
}

/// Rendering options.
#[derive(Debug, Clone)]
pub struct RenderOptions {
    pub format: RenderFormat,
    /// Optional graph label; defaults to the document's `meta.name`.
    pub title: Option<String>,
    /// Annotate nodes with their kind.
    pub show_kinds: bool,
}

impl RenderOptions {
    pub fn dot() -> Self {
        Self {
            format: RenderFormat::Dot,
            title: None,
            show_kinds: true,
        }
    }

    pub fn mermaid() -> Self {
        Self {
            format: RenderFormat::Mermaid,
            title: None,
            show_kinds: true,
        }
    }

    pub fn ascii() -> Self {
        Self {
            format: RenderFormat::Ascii,
            title: None,
            show_kinds: false,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn without_kinds(mut self) -> Self {
        self.show_kinds = false;
        self
    }
}

/// Render the graph structure of a normalized document.
pub fn render(ir: &WorkflowIr, options: &RenderOptions) -> String {
    match options.format {
        RenderFormat::Dot => render_dot(ir, options),
        RenderFormat::Mermaid => render_mermaid(ir, options),
        RenderFormat::Ascii => render_ascii(ir),
    }
}

fn title<'a>(ir: &'a WorkflowIr, options: &'a RenderOptions) -> &'a str {
    options.title.as_deref().unwrap_or_else(|| ir.graph_name())
}

fn node_label(id: &str, kind: NodeKind, show_kinds: bool) -> String {
    if show_kinds {
        format!("{id}\\n[{kind}]")
    } else {
        id.to_string()
    }
}

fn render_dot(ir: &WorkflowIr, options: &RenderOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "digraph \"{}\" {{", title(ir, options));
    let _ = writeln!(out, "    rankdir=TB;");
    let _ = writeln!(out, "    node [shape=box, style=rounded];");

    for node in ir.graph.nodes.values() {
        let shape = match node.kind {
            NodeKind::Router => ", shape=diamond",
            NodeKind::Parallel => ", shape=parallelogram",
            NodeKind::Map => ", shape=box3d",
            _ => "",
        };
        let _ = writeln!(
            out,
            "    \"{}\" [label=\"{}\"{shape}];",
            node.id,
            node_label(&node.id, node.kind, options.show_kinds)
        );
    }
    let _ = writeln!(out, "    \"__start__\" [shape=circle, label=\"start\"];");
    let _ = writeln!(out, "    \"__start__\" -> \"{}\";", ir.graph.entry);

    for node in ir.graph.nodes.values() {
        match &node.next {
            EdgeDescriptor::None => {}
            EdgeDescriptor::Single(target) => {
                let _ = writeln!(out, "    \"{}\" -> \"{}\";", node.id, target);
            }
            EdgeDescriptor::Fanout(targets) => {
                for target in targets {
                    let _ = writeln!(out, "    \"{}\" -> \"{}\" [style=bold];", node.id, target);
                }
            }
            EdgeDescriptor::Routes(routes) => {
                for (route, target) in routes {
                    let _ = writeln!(
                        out,
                        "    \"{}\" -> \"{}\" [style=dashed, label=\"{}\"];",
                        node.id, target, route
                    );
                }
            }
        }
        if let Some(map) = &node.map {
            let _ = writeln!(
                out,
                "    \"{}\" -> \"{}\" [style=dotted, label=\"per item\"];",
                node.id, map.body
            );
        }
    }

    out.push_str("}\n");
    out
}

fn render_mermaid(ir: &WorkflowIr, options: &RenderOptions) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "---\ntitle: {}\n---", title(ir, options));
    let _ = writeln!(out, "graph TD");
    let _ = writeln!(out, "    __start__((start)) --> {}", ir.graph.entry);

    for node in ir.graph.nodes.values() {
        if options.show_kinds {
            let _ = writeln!(out, "    {}[\"{} ({})\"]", node.id, node.id, node.kind);
        }
        match &node.next {
            EdgeDescriptor::None => {}
            EdgeDescriptor::Single(target) => {
                let _ = writeln!(out, "    {} --> {}", node.id, target);
            }
            EdgeDescriptor::Fanout(targets) => {
                for target in targets {
                    let _ = writeln!(out, "    {} ==> {}", node.id, target);
                }
            }
            EdgeDescriptor::Routes(routes) => {
                for (route, target) in routes {
                    let _ = writeln!(out, "    {} -->|{}| {}", node.id, route, target);
                }
            }
        }
        if let Some(map) = &node.map {
            let _ = writeln!(out, "    {} -.->|per item| {}", node.id, map.body);
        }
    }

    out
}

fn render_ascii(ir: &WorkflowIr) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "entry: {}", ir.graph.entry);
    for node in ir.graph.nodes.values() {
        let successors = match &node.next {
            EdgeDescriptor::None => "(terminal)".to_string(),
            EdgeDescriptor::Single(target) => format!("-> {target}"),
            EdgeDescriptor::Fanout(targets) => format!("=> [{}]", targets.join(", ")),
            EdgeDescriptor::Routes(routes) => {
                let routes: Vec<String> =
                    routes.iter().map(|(route, target)| format!("{route}->{target}")).collect();
                format!("?> {{{}}}", routes.join(", "))
            }
        };
        let _ = writeln!(out, "  [{}] {} {}", node.kind, node.id, successors);
        if let Some(map) = &node.map {
            let _ = writeln!(out, "      per item: {}", map.body);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use serde_json::json;

    fn sample_ir() -> WorkflowIr {
        normalize(&json!({
            "meta": {"version": 2, "name": "render-me"},
            "components": [{"id": "c", "type": "t"}],
            "graph": {
                "entry": "s",
                "nodes": [
                    {"id": "s", "kind": "parallel", "next": ["a", "r"]},
                    {"id": "a", "kind": "component", "component": "c", "next": "m"},
                    {"id": "r", "kind": "router", "next": {"x": "m", "default": "a"}},
                    {"id": "m", "kind": "map",
                     "config": {"body": "b", "over": "graph.inputs.items"}},
                    {"id": "b", "kind": "component", "component": "c"}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn dot_contains_every_node_and_edge() {
        let dot = render(&sample_ir(), &RenderOptions::dot());
        assert!(dot.starts_with("digraph \"render-me\" {"));
        for id in ["s", "a", "r", "m", "b"] {
            assert!(dot.contains(&format!("\"{id}\" [label=")), "missing node {id}");
        }
        assert!(dot.contains("\"__start__\" -> \"s\";"));
        assert!(dot.contains("\"s\" -> \"a\" [style=bold];"));
        assert!(dot.contains("label=\"x\""));
        assert!(dot.contains("\"m\" -> \"b\" [style=dotted, label=\"per item\"];"));
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn mermaid_renders_routes_with_labels() {
        let mermaid = render(
            &sample_ir(),
            &RenderOptions::mermaid().with_title("custom"),
        );
        assert!(mermaid.contains("title: custom"));
        assert!(mermaid.contains("graph TD"));
        assert!(mermaid.contains("__start__((start)) --> s"));
        assert!(mermaid.contains("r -->|x| m"));
        assert!(mermaid.contains("r -->|default| a"));
        assert!(mermaid.contains("s ==> a"));
        assert!(mermaid.contains("m -.->|per item| b"));
    }

    #[test]
    fn ascii_lists_every_node_once() {
        let ascii = render(&sample_ir(), &RenderOptions::ascii());
        assert!(ascii.starts_with("entry: s"));
        assert_eq!(ascii.matches("[router] r").count(), 1);
        assert!(ascii.contains("=> [a, r]"));
        assert!(ascii.contains("(terminal)"));
        assert!(ascii.contains("per item: b"));
    }
}
