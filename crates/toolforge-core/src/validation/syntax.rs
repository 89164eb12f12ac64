//! Tree-sitter parse of artifact source into a flat index.
//!
//! The gates never walk the syntax tree themselves; they read the
//! [`SourceIndex`] built here in a single pass.

use std::collections::HashMap;

use toolforge_store::ArtifactContract;
use tree_sitter::{Node, Parser};

use crate::domain::SourceLocation;

/// Parse failure with the position of the first error node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxError {
    pub location: SourceLocation,
    pub message: String,
}

/// One imported module, as written (`os.path`, `.utils`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    pub module: String,
    pub location: SourceLocation,
}

/// One call expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Dotted callee with import aliases resolved (`sp.run` after
    /// `import subprocess as sp` becomes `subprocess.run`).
    pub callee: String,
    /// Value of the first positional argument when it is a plain string literal.
    pub first_literal: Option<String>,
    pub location: SourceLocation,
}

/// A bare name or attribute member occurring in an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameRef {
    pub name: String,
    pub location: SourceLocation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub annotation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: String,
    pub params: Vec<Param>,
    pub return_annotation: Option<String>,
    pub top_level: bool,
    pub location: SourceLocation,
}

/// Everything the gates need to know about a parsed artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceIndex {
    pub imports: Vec<ImportRef>,
    pub calls: Vec<CallSite>,
    /// Bare identifiers used in expressions.
    pub names: Vec<NameRef>,
    /// Attribute members (`x.__globals__` records `__globals__`).
    pub attributes: Vec<NameRef>,
    /// Plain string literal values (`globals()['__builtins__']` records
    /// `__builtins__`).
    pub strings: Vec<NameRef>,
    pub functions: Vec<FunctionDef>,
}

impl SourceIndex {
    pub fn parse(source: &str) -> Result<Self, SyntaxError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| SyntaxError {
                location: SourceLocation { line: 1, column: 1 },
                message: format!("parser init failed: {e}"),
            })?;
        let tree = parser.parse(source, None).ok_or_else(|| SyntaxError {
            location: SourceLocation { line: 1, column: 1 },
            message: "parse aborted".to_string(),
        })?;

        let root = tree.root_node();
        if root.has_error() {
            return Err(first_error(root, source).unwrap_or(SyntaxError {
                location: location(root),
                message: "malformed source".to_string(),
            }));
        }

        let mut builder = IndexBuilder {
            src: source.as_bytes(),
            aliases: HashMap::new(),
            index: SourceIndex::default(),
        };
        // Aliases first so calls that precede nothing still resolve.
        builder.collect_aliases(root);
        builder.visit(root, 0);
        Ok(builder.index)
    }

    /// First public top-level function.
    pub fn entry_point(&self) -> Option<&FunctionDef> {
        self.functions
            .iter()
            .find(|f| f.top_level && !f.name.starts_with('_'))
    }

    pub fn contract(&self) -> Option<ArtifactContract> {
        let entry = self.entry_point()?;
        Some(ArtifactContract {
            entry_point: entry.name.clone(),
            input_type: entry.params.first().and_then(|p| p.annotation.clone()),
            output_type: entry.return_annotation.clone(),
        })
    }
}

fn location(node: Node<'_>) -> SourceLocation {
    let p = node.start_position();
    SourceLocation {
        line: p.row + 1,
        column: p.column + 1,
    }
}

fn text<'a>(node: Node<'_>, src: &'a [u8]) -> &'a str {
    node.utf8_text(src).unwrap_or("")
}

fn first_error(node: Node<'_>, source: &str) -> Option<SyntaxError> {
    if node.is_missing() {
        return Some(SyntaxError {
            location: location(node),
            message: format!("missing `{}`", node.kind()),
        });
    }
    if node.is_error() {
        let snippet: String = text(node, source.as_bytes()).chars().take(24).collect();
        return Some(SyntaxError {
            location: location(node),
            message: format!("unexpected `{}`", snippet.trim()),
        });
    }
    if !node.has_error() {
        return None;
    }
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
    children.into_iter().find_map(|child| first_error(child, source))
}

/// Python string literal value, `None` for f-strings and concatenations.
fn string_literal(node: Node<'_>, src: &[u8]) -> Option<String> {
    if node.kind() != "string" {
        return None;
    }
    let mut cursor = node.walk();
    let mut value = String::new();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "interpolation" => return None,
            "string_content" => value.push_str(text(child, src)),
            _ => {}
        }
    }
    Some(value)
}

struct IndexBuilder<'a> {
    src: &'a [u8],
    /// Local name -> dotted module path it stands for.
    aliases: HashMap<String, String>,
    index: SourceIndex,
}

impl<'a> IndexBuilder<'a> {
    fn collect_aliases(&mut self, node: Node<'_>) {
        match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                for name in node.children_by_field_name("name", &mut cursor) {
                    if name.kind() == "aliased_import" {
                        let module = name.child_by_field_name("name").map(|n| text(n, self.src));
                        let alias = name.child_by_field_name("alias").map(|n| text(n, self.src));
                        if let (Some(module), Some(alias)) = (module, alias) {
                            self.aliases.insert(alias.to_string(), module.to_string());
                        }
                    }
                }
            }
            "import_from_statement" => {
                let Some(module) = node.child_by_field_name("module_name") else {
                    return;
                };
                let module = text(module, self.src).to_string();
                let mut cursor = node.walk();
                for name in node.children_by_field_name("name", &mut cursor) {
                    let (imported, local) = if name.kind() == "aliased_import" {
                        (
                            name.child_by_field_name("name").map(|n| text(n, self.src)),
                            name.child_by_field_name("alias").map(|n| text(n, self.src)),
                        )
                    } else {
                        let t = text(name, self.src);
                        (Some(t), Some(t))
                    };
                    if let (Some(imported), Some(local)) = (imported, local) {
                        self.aliases
                            .insert(local.to_string(), format!("{module}.{imported}"));
                    }
                }
            }
            _ => {
                let mut cursor = node.walk();
                let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
                for child in children {
                    self.collect_aliases(child);
                }
            }
        }
    }

    fn resolve(&self, dotted: &str) -> String {
        let (head, rest) = match dotted.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (dotted, None),
        };
        match (self.aliases.get(head), rest) {
            (Some(target), Some(rest)) => format!("{target}.{rest}"),
            (Some(target), None) => target.clone(),
            (None, _) => dotted.to_string(),
        }
    }

    fn visit(&mut self, node: Node<'_>, depth: usize) {
        match node.kind() {
            "import_statement" => {
                let mut cursor = node.walk();
                for name in node.children_by_field_name("name", &mut cursor) {
                    let module = if name.kind() == "aliased_import" {
                        name.child_by_field_name("name")
                    } else {
                        Some(name)
                    };
                    if let Some(module) = module {
                        self.index.imports.push(ImportRef {
                            module: text(module, self.src).to_string(),
                            location: location(node),
                        });
                    }
                }
                return;
            }
            "import_from_statement" | "future_import_statement" => {
                let module = node
                    .child_by_field_name("module_name")
                    .map(|m| text(m, self.src).to_string())
                    .unwrap_or_else(|| "__future__".to_string());
                self.index.imports.push(ImportRef {
                    module,
                    location: location(node),
                });
                return;
            }
            "function_definition" => {
                self.record_function(node, depth == 0);
            }
            "decorated_definition" => {
                let mut cursor = node.walk();
                let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
                for child in children {
                    // Decorated functions keep the depth of the decorator.
                    self.visit(child, depth);
                }
                return;
            }
            "call" => {
                if let Some(function) = node.child_by_field_name("function") {
                    let raw: String = text(function, self.src)
                        .chars()
                        .filter(|c| !c.is_whitespace())
                        .collect();
                    let first_literal = node.child_by_field_name("arguments").and_then(|args| {
                        let mut cursor = args.walk();
                        let first = args.named_children(&mut cursor).next();
                        first.and_then(|a| string_literal(a, self.src))
                    });
                    self.index.calls.push(CallSite {
                        callee: self.resolve(&raw),
                        first_literal,
                        location: location(node),
                    });
                }
            }
            "attribute" => {
                if let Some(member) = node.child_by_field_name("attribute") {
                    self.index.attributes.push(NameRef {
                        name: text(member, self.src).to_string(),
                        location: location(member),
                    });
                }
                if let Some(object) = node.child_by_field_name("object") {
                    self.visit(object, depth + 1);
                }
                return;
            }
            "string" => {
                if let Some(value) = string_literal(node, self.src) {
                    self.index.strings.push(NameRef {
                        name: value,
                        location: location(node),
                    });
                }
            }
            "identifier" => {
                self.index.names.push(NameRef {
                    name: text(node, self.src).to_string(),
                    location: location(node),
                });
                return;
            }
            _ => {}
        }

        let nested = if node.kind() == "module" { 0 } else { depth + 1 };
        let mut cursor = node.walk();
        let children: Vec<Node<'_>> = node.children(&mut cursor).collect();
        for child in children {
            self.visit(child, nested);
        }
    }

    fn record_function(&mut self, node: Node<'_>, top_level: bool) {
        let Some(name) = node.child_by_field_name("name") else {
            return;
        };
        let mut params = Vec::new();
        if let Some(parameters) = node.child_by_field_name("parameters") {
            let mut cursor = parameters.walk();
            for p in parameters.named_children(&mut cursor) {
                if let Some(param) = self.param(p) {
                    params.push(param);
                }
            }
        }
        self.index.functions.push(FunctionDef {
            name: text(name, self.src).to_string(),
            params,
            return_annotation: node
                .child_by_field_name("return_type")
                .map(|t| text(t, self.src).to_string()),
            top_level,
            location: location(node),
        });
    }

    fn param(&self, node: Node<'_>) -> Option<Param> {
        let annotation = node
            .child_by_field_name("type")
            .map(|t| text(t, self.src).to_string());
        let name = match node.kind() {
            "identifier" => text(node, self.src).to_string(),
            "default_parameter" | "typed_default_parameter" => {
                text(node.child_by_field_name("name")?, self.src).to_string()
            }
            "typed_parameter" => {
                let mut cursor = node.walk();
                let first = node.named_children(&mut cursor).next()?;
                text(first, self.src).to_string()
            }
            "list_splat_pattern" | "dictionary_splat_pattern" => {
                text(node, self.src).to_string()
            }
            _ => return None,
        };
        Some(Param { name, annotation })
    }
}
