//! Adapter around the graphviz-rust DOT parser.
//!
//! The parser hands back a statement-level AST; this module flattens it into
//! plain node and edge lists. Edges keep their statement order (parallel
//! edges between the same pair stay distinct) and endpoints mentioned only
//! in edge statements still produce nodes.

use std::collections::BTreeMap;

use graphviz_rust::dot_structures as ast;

use super::ParseError;

#[derive(Debug)]
pub(crate) struct DotNode {
    pub name: String,
    pub attrs: BTreeMap<String, String>,
}

#[derive(Debug)]
pub(crate) struct DotEdge {
    pub from: String,
    pub from_port: String,
    pub to: String,
    pub to_port: String,
    pub attrs: BTreeMap<String, String>,
}

pub(crate) fn unmarshal(input: &str) -> Result<(Vec<DotNode>, Vec<DotEdge>), ParseError> {
    let graph = graphviz_rust::parse(input).map_err(ParseError::Dot)?;
    let stmts = match graph {
        ast::Graph::Graph { stmts, .. } | ast::Graph::DiGraph { stmts, .. } => stmts,
    };

    let mut nodes: Vec<DotNode> = Vec::new();
    let mut index: BTreeMap<String, usize> = BTreeMap::new();
    let mut edges: Vec<DotEdge> = Vec::new();

    let mut upsert = |nodes: &mut Vec<DotNode>, name: String| -> usize {
        *index.entry(name.clone()).or_insert_with(|| {
            nodes.push(DotNode {
                name,
                attrs: BTreeMap::new(),
            });
            nodes.len() - 1
        })
    };

    for stmt in stmts {
        match stmt {
            ast::Stmt::Node(n) => {
                let (name, _) = node_id_parts(&n.id);
                let i = upsert(&mut nodes, name);
                nodes[i].attrs.extend(attr_map(&n.attributes));
            }
            ast::Stmt::Edge(e) => {
                let attrs = attr_map(&e.attributes);
                let endpoints: Vec<(String, String)> = match &e.ty {
                    ast::EdgeTy::Pair(a, b) => {
                        vec![vertex_parts(a)?, vertex_parts(b)?]
                    }
                    ast::EdgeTy::Chain(vs) => vs
                        .iter()
                        .map(vertex_parts)
                        .collect::<Result<Vec<_>, _>>()?,
                };
                for pair in endpoints.windows(2) {
                    let (from, from_port) = pair[0].clone();
                    let (to, to_port) = pair[1].clone();
                    upsert(&mut nodes, from.clone());
                    upsert(&mut nodes, to.clone());
                    edges.push(DotEdge {
                        from,
                        from_port,
                        to,
                        to_port,
                        attrs: attrs.clone(),
                    });
                }
            }
            // Graph-level attributes and subgraph groupings carry no
            // topology content.
            _ => {}
        }
    }

    Ok((nodes, edges))
}

fn vertex_parts(v: &ast::Vertex) -> Result<(String, String), ParseError> {
    match v {
        ast::Vertex::N(id) => Ok(node_id_parts(id)),
        ast::Vertex::S(_) => Err(ParseError::Dot(
            "subgraph edge endpoints are not supported".into(),
        )),
    }
}

fn node_id_parts(id: &ast::NodeId) -> (String, String) {
    let ast::NodeId(name, port) = id;
    let port = match port {
        Some(ast::Port(Some(p), _)) => id_text(p),
        _ => String::new(),
    };
    (id_text(name), port)
}

fn attr_map(attrs: &[ast::Attribute]) -> BTreeMap<String, String> {
    attrs
        .iter()
        .map(|ast::Attribute(k, v)| (id_text(k), id_text(v)))
        .collect()
}

// Escaped identifiers keep their surrounding quotes in the AST.
fn id_text(id: &ast::Id) -> String {
    match id {
        ast::Id::Plain(s) | ast::Id::Html(s) | ast::Id::Anonymous(s) => s.clone(),
        ast::Id::Escaped(s) => unquote(s),
    }
}

fn unquote(s: &str) -> String {
    let inner = s
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s);
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('"') => out.push('"'),
                Some('\\') => out.push('\\'),
                Some('\n') => {} // line continuation
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_and_attrs() {
        let (nodes, edges) = unmarshal(
            r#"graph "t" {
                "a" [function="leaf" os="none"]
                "a":"swp1" -- "b":"swp2" [left_mac="00:11:22:33:44:55"]
            }"#,
        )
        .unwrap();

        assert_eq!(nodes.len(), 2, "b is created from the edge endpoint");
        assert_eq!(nodes[0].name, "a");
        assert_eq!(nodes[0].attrs["function"], "leaf");
        assert_eq!(nodes[0].attrs["os"], "none");
        assert_eq!(nodes[1].name, "b");

        assert_eq!(edges.len(), 1);
        let e = &edges[0];
        assert_eq!((e.from.as_str(), e.from_port.as_str()), ("a", "swp1"));
        assert_eq!((e.to.as_str(), e.to_port.as_str()), ("b", "swp2"));
        assert_eq!(e.attrs["left_mac"], "00:11:22:33:44:55");
    }

    #[test]
    fn parallel_edges_stay_distinct() {
        let (_, edges) = unmarshal(
            r#"graph {
                "a":"swp1" -- "b":"swp1"
                "a":"swp2" -- "b":"swp2"
            }"#,
        )
        .unwrap();
        assert_eq!(edges.len(), 2);
    }

    #[test]
    fn unquote_unescapes() {
        assert_eq!(unquote(r#""plain""#), "plain");
        assert_eq!(unquote(r#""with \"quotes\"""#), r#"with "quotes""#);
        assert_eq!(unquote(r#""back\\slash""#), r"back\slash");
    }
}
