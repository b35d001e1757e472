//! Source parsing capability.
//!
//! The pipeline treats parsing as a trait so hosts can bring their own
//! grammar stack; the tree-sitter implementation here covers Rust, Go,
//! Python, JavaScript and TypeScript behind the `treesitter` feature.
//! `analyze` yields def/ref tags; `parse_tree` yields an opaque handle whose
//! drop releases the underlying tree on every path.

use std::any::Any;

use crate::ctx::Ctx;
use crate::error::MapError;
use crate::tags::{Tag, TagKind};

/// Result of analyzing one file.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub language: String,
    pub tags: Vec<Tag>,
}

/// Opaque parsed tree. Dropping the handle releases the tree; callers keep
/// it alive only for the scope that needs it.
pub struct SyntaxTree {
    _inner: Box<dyn Any + Send>,
}

impl SyntaxTree {
    pub fn new(inner: Box<dyn Any + Send>) -> Self {
        SyntaxTree { _inner: inner }
    }
}

/// Parsing capability consumed by the extractor and the renderer. Must be
/// safe for concurrent `analyze` / `parse_tree` calls.
pub trait SourceParser: Send + Sync {
    fn analyze(&self, ctx: &Ctx, rel_path: &str, content: &str) -> Result<Analysis, MapError>;
    fn parse_tree(&self, ctx: &Ctx, rel_path: &str, content: &str)
        -> Result<SyntaxTree, MapError>;
    fn supports_language(&self, rel_path: &str) -> bool;
    fn languages(&self) -> Vec<&'static str>;
    fn close(&self);
}

// ---------------------------------------------------------------------------
// tree-sitter implementation
// ---------------------------------------------------------------------------

#[cfg(feature = "treesitter")]
mod treesitter {
    use super::*;
    use tree_sitter::{Language, Node, Parser};

    /// Tree-sitter backed [`SourceParser`]. Stateless: a `Parser` is created
    /// per call, so concurrent use needs no locking.
    pub struct TreeSitterParser;

    impl TreeSitterParser {
        pub fn new() -> Self {
            TreeSitterParser
        }
    }

    impl Default for TreeSitterParser {
        fn default() -> Self {
            Self::new()
        }
    }

    fn ext_of(rel_path: &str) -> &str {
        rel_path.rsplit_once('.').map(|(_, e)| e).unwrap_or("")
    }

    fn language_for_ext(ext: &str) -> Option<(Language, &'static str)> {
        match ext {
            "rs" => Some((tree_sitter_rust::LANGUAGE.into(), "rust")),
            "go" => Some((tree_sitter_go::LANGUAGE.into(), "go")),
            "py" | "pyi" => Some((tree_sitter_python::LANGUAGE.into(), "python")),
            "js" | "jsx" | "mjs" | "cjs" => {
                Some((tree_sitter_javascript::LANGUAGE.into(), "javascript"))
            }
            "ts" | "tsx" => {
                Some((tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(), "typescript"))
            }
            _ => None,
        }
    }

    /// Is this node a definition we want a `def` tag for?
    fn is_def_node(kind: &str) -> bool {
        matches!(
            kind,
            // Rust
            "function_item"
                | "struct_item"
                | "enum_item"
                | "trait_item"
                | "type_item"
                | "const_item"
                | "static_item"
                // Go
                | "function_declaration"
                | "method_declaration"
                | "type_spec"
                // Python
                | "function_definition"
                | "class_definition"
                // JS / TS
                | "class_declaration"
                | "method_definition"
                | "interface_declaration"
                | "type_alias_declaration"
                | "enum_declaration"
        )
    }

    /// Identifier-shaped leaves counted as references.
    fn is_ref_node(kind: &str) -> bool {
        matches!(
            kind,
            "identifier"
                | "type_identifier"
                | "field_identifier"
                | "property_identifier"
                | "shorthand_property_identifier"
        )
    }

    /// Extract the name node of a definition, if any.
    fn def_name_node<'t>(node: &Node<'t>) -> Option<Node<'t>> {
        if let Some(name) = node.child_by_field_name("name") {
            return Some(name);
        }
        // Go type_spec: the name is the first named child.
        if node.kind() == "type_spec" {
            return node.named_child(0);
        }
        None
    }

    fn walk<'t>(
        node: Node<'t>,
        source: &[u8],
        language: &str,
        rel_path: &str,
        def_name_ids: &mut std::collections::HashSet<usize>,
        tags: &mut Vec<Tag>,
    ) {
        if is_def_node(node.kind()) {
            if let Some(name_node) = def_name_node(&node) {
                if let Ok(name) = name_node.utf8_text(source) {
                    let name = name.trim();
                    if !name.is_empty() {
                        def_name_ids.insert(name_node.id());
                        tags.push(Tag {
                            rel_path: rel_path.to_string(),
                            name: name.to_string(),
                            kind: TagKind::Def,
                            line: node.start_position().row as u32 + 1,
                            language: language.to_string(),
                            node_type: node.kind().to_string(),
                        });
                    }
                }
            }
        } else if is_ref_node(node.kind()) && !def_name_ids.contains(&node.id()) {
            if let Ok(name) = node.utf8_text(source) {
                let name = name.trim();
                if !name.is_empty() {
                    tags.push(Tag {
                        rel_path: rel_path.to_string(),
                        name: name.to_string(),
                        kind: TagKind::Ref,
                        line: node.start_position().row as u32 + 1,
                        language: language.to_string(),
                        node_type: node.kind().to_string(),
                    });
                }
            }
        }

        let mut cursor = node.walk();
        for child in node.children(&mut cursor) {
            walk(child, source, language, rel_path, def_name_ids, tags);
        }
    }

    impl SourceParser for TreeSitterParser {
        fn analyze(
            &self,
            ctx: &Ctx,
            rel_path: &str,
            content: &str,
        ) -> Result<Analysis, MapError> {
            ctx.check()?;
            let (lang, language) = language_for_ext(ext_of(rel_path))
                .ok_or_else(|| MapError::Config(format!("unsupported language: {rel_path}")))?;

            let mut parser = Parser::new();
            parser
                .set_language(&lang)
                .map_err(|e| MapError::backend("configure parser", e))?;
            let tree = parser
                .parse(content, None)
                .ok_or_else(|| MapError::backend("parse source", rel_path))?;

            let mut tags = Vec::new();
            let mut def_name_ids = std::collections::HashSet::new();
            // Two passes: definitions claim their name nodes first, so the
            // reference pass does not double-count them.
            let root = tree.root_node();
            let mut cursor = root.walk();
            for child in root.children(&mut cursor) {
                walk(child, content.as_bytes(), language, rel_path, &mut def_name_ids, &mut tags);
            }
            tags.sort();

            Ok(Analysis { language: language.to_string(), tags })
        }

        fn parse_tree(
            &self,
            ctx: &Ctx,
            rel_path: &str,
            content: &str,
        ) -> Result<SyntaxTree, MapError> {
            ctx.check()?;
            let (lang, _) = language_for_ext(ext_of(rel_path))
                .ok_or_else(|| MapError::Config(format!("unsupported language: {rel_path}")))?;
            let mut parser = Parser::new();
            parser
                .set_language(&lang)
                .map_err(|e| MapError::backend("configure parser", e))?;
            let tree = parser
                .parse(content, None)
                .ok_or_else(|| MapError::backend("parse source", rel_path))?;
            Ok(SyntaxTree::new(Box::new(tree)))
        }

        fn supports_language(&self, rel_path: &str) -> bool {
            language_for_ext(ext_of(rel_path)).is_some()
        }

        fn languages(&self) -> Vec<&'static str> {
            vec!["go", "javascript", "python", "rust", "typescript"]
        }

        fn close(&self) {}
    }
}

#[cfg(feature = "treesitter")]
pub use treesitter::TreeSitterParser;
