//! Graph export of a database for tooling.
//!
//! [`GraphView`] copies the element tree and the forward references of one
//! database into a petgraph `StableGraph`, so the usual petgraph algorithms
//! and DOT rendering work on it. It is a snapshot; later edits to the
//! database are not reflected.

use std::collections::HashMap;
use std::fmt;

use petgraph::dot::{Config, Dot};
use petgraph::graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::Directed;

use crate::database::Database;
use crate::element::Element;
use crate::error::StoreError;
use crate::id::{ElementId, KindId, ReferenceFieldId};
use crate::schema::ReferenceKey;

/// One element in the exported graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViewNode {
    pub element: ElementId,
    pub class: String,
}

impl fmt::Display for ViewNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} #{}", self.class, self.element.index)
    }
}

/// Edge kinds of the exported graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEdge {
    /// Parent to child, labelled with the child slot name.
    Child { slot: String },
    /// Referrer to target, labelled with the reference field name.
    Reference { field: String },
}

impl fmt::Display for ViewEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViewEdge::Child { slot } => write!(f, "{}", slot),
            ViewEdge::Reference { field } => write!(f, "{} (ref)", field),
        }
    }
}

/// A petgraph snapshot of a database.
#[derive(Debug, Clone)]
pub struct GraphView {
    graph: StableGraph<ViewNode, ViewEdge, Directed, u32>,
    nodes: HashMap<ElementId, NodeIndex<u32>>,
}

impl GraphView {
    /// Snapshots every element of `db`, attached or not.
    ///
    /// References to elements of external databases are left out.
    pub fn build(db: &Database) -> Result<Self, StoreError> {
        let mut graph = StableGraph::default();
        let mut nodes = HashMap::new();
        let schema = db.schema();

        let ids: Vec<ElementId> = (0..db.len()).map(|index| ElementId::new(db.id(), index)).collect();
        for id in &ids {
            let element = db.element(*id)?;
            let node = graph.add_node(ViewNode {
                element: *id,
                class: class_name(db, element.kind()),
            });
            nodes.insert(*id, node);
        }

        for id in &ids {
            let element = db.element(*id)?;
            let class = schema.require_class(element.kind())?;
            for slot in class.child_slots() {
                for child in db.children(*id, slot.id)? {
                    graph.add_edge(
                        nodes[id],
                        nodes[child],
                        ViewEdge::Child {
                            slot: slot.name.clone(),
                        },
                    );
                }
            }
            for (position, field) in class.reference_fields().iter().enumerate() {
                let key = ReferenceKey {
                    kind: element.kind(),
                    field: ReferenceFieldId(position as u8),
                };
                if let Some(target) = db.reference(*id, key).and_then(|t| nodes.get(&t)) {
                    graph.add_edge(nodes[id], *target, ViewEdge::Reference { field: field.clone() });
                }
            }
        }

        Ok(GraphView { graph, nodes })
    }

    pub fn graph(&self) -> &StableGraph<ViewNode, ViewEdge, Directed, u32> {
        &self.graph
    }

    pub fn node(&self, element: ElementId) -> Option<NodeIndex<u32>> {
        self.nodes.get(&element).copied()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Graphviz rendering with node and edge labels.
    pub fn to_dot(&self) -> String {
        let body = format!("{}", Dot::with_config(&self.graph, &[Config::GraphContentOnly]));
        let mut out = String::from("digraph {\n");
        for line in body.lines().map(str::trim).filter(|line| !line.is_empty()) {
            out.push_str("    ");
            out.push_str(line);
            out.push('\n');
        }
        out.push_str("}\n");
        out
    }
}

impl Database {
    /// Exports the tree and reference edges into a petgraph snapshot.
    pub fn graph_view(&self) -> Result<GraphView, StoreError> {
        GraphView::build(self)
    }

    /// Indented outline of every top-level tree, for debugging and tests.
    ///
    /// ```text
    /// module #0
    ///   files:
    ///     function #1
    /// ```
    pub fn render_tree(&self) -> Result<String, StoreError> {
        let mut lines = Vec::new();
        for root in self.roots() {
            self.render_subtree(*root, 0, &mut lines)?;
        }
        Ok(lines.join("\n"))
    }

    fn render_subtree(&self, id: ElementId, depth: usize, lines: &mut Vec<String>) -> Result<(), StoreError> {
        let element: &Element = self.element(id)?;
        lines.push(format!("{}{} #{}", "  ".repeat(depth), class_name(self, element.kind()), id.index));
        let class = self.schema().require_class(element.kind())?;
        for slot in class.child_slots() {
            let children = self.children(id, slot.id)?;
            if children.is_empty() {
                continue;
            }
            lines.push(format!("{}{}:", "  ".repeat(depth + 1), slot.name));
            for child in children {
                self.render_subtree(*child, depth + 2, lines)?;
            }
        }
        Ok(())
    }
}

fn class_name(db: &Database, kind: KindId) -> String {
    db.schema()
        .class(kind)
        .map_or_else(|| format!("kind{}", kind), |class| class.name().to_string())
}
