//! Client-side TypeScript declarations derived from the schema SDL.

use crate::error::{Error, Result};
use async_graphql::parser::parse_schema;
use async_graphql::parser::types::{
    BaseType, FieldDefinition, InputValueDefinition, ServiceDocument, Type, TypeKind,
    TypeSystemDefinition,
};
use async_graphql::Positioned;
use std::collections::HashSet;
use std::fmt::{self, Write};
use std::sync::{Arc, RwLock};

const INDENT: &str = "  ";

/// Cached declarations blob served by the `/types` route.
///
/// Written once after schema construction, read by every request afterwards.
#[derive(Debug, Clone, Default)]
pub struct TypeDefinitions {
    inner: Arc<RwLock<String>>,
}

impl TypeDefinitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, definitions: String) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *guard = definitions;
    }

    /// Current blob, empty until generated.
    pub fn get(&self) -> String {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Generate from `sdl` and store; failures are logged and leave the blob untouched.
    pub fn refresh(&self, namespace: &str, sdl: &str) {
        match generate(namespace, sdl) {
            Ok(definitions) => {
                tracing::debug!(bytes = definitions.len(), "client type definitions generated");
                self.set(definitions);
            }
            Err(e) => tracing::warn!(error = %e, "client type definitions generation failed"),
        }
    }
}

/// Convert SDL into TypeScript declarations wrapped in `declare namespace`.
pub fn generate(namespace: &str, sdl: &str) -> Result<String> {
    let document =
        parse_schema(sdl).map_err(|e| Error::Schema(format!("cannot parse SDL: {e}")))?;

    // enums, unions and scalars are emitted under their own name, the rest as `I{Name}`
    let bare: HashSet<&str> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            TypeSystemDefinition::Type(ty) => match ty.node.kind {
                TypeKind::Scalar | TypeKind::Enum(_) | TypeKind::Union(_) => {
                    Some(ty.node.name.node.as_str())
                }
                _ => None,
            },
            _ => None,
        })
        .collect();

    let mut out = String::new();
    write_document(&mut out, namespace, &bare, &document)
        .map_err(|e| Error::Internal(format!("cannot write type definitions: {e}")))?;
    Ok(out)
}

fn write_document(
    out: &mut impl Write,
    namespace: &str,
    bare: &HashSet<&str>,
    document: &ServiceDocument,
) -> fmt::Result {
    writeln!(out, "// tslint:disable")?;
    writeln!(out, "// graphql typescript definitions")?;
    writeln!(out)?;
    writeln!(out, "declare namespace {} {{", namespace_ident(namespace))?;

    for definition in &document.definitions {
        let TypeSystemDefinition::Type(ty) = definition else {
            continue;
        };
        let ty = &ty.node;
        let name = ty.name.node.as_str();
        if name.starts_with("__") {
            continue;
        }

        writeln!(out)?;
        if let Some(description) = &ty.description {
            write_doc(out, INDENT, &description.node)?;
        }

        match &ty.kind {
            TypeKind::Scalar => {
                if !is_builtin_scalar(name) {
                    writeln!(out, "{INDENT}type {name} = any;")?;
                }
            }
            TypeKind::Object(object) => {
                write_object(out, bare, name, &object.fields)?;
                write_arguments(out, bare, name, &object.fields)?;
            }
            TypeKind::Interface(interface) => {
                write_object(out, bare, name, &interface.fields)?;
                write_arguments(out, bare, name, &interface.fields)?;
            }
            TypeKind::Union(union) => {
                let members: Vec<String> = union
                    .members
                    .iter()
                    .map(|m| format!("I{}", m.node))
                    .collect();
                writeln!(out, "{INDENT}type {name} = {};", members.join(" | "))?;
            }
            TypeKind::Enum(enumeration) => {
                writeln!(out, "{INDENT}const enum {name} {{")?;
                for value in &enumeration.values {
                    let value = value.node.value.node.as_str();
                    writeln!(out, "{INDENT}{INDENT}{value} = '{value}',")?;
                }
                writeln!(out, "{INDENT}}}")?;
            }
            TypeKind::InputObject(input) => {
                writeln!(out, "{INDENT}interface I{name} {{")?;
                write_inputs(out, bare, &input.fields)?;
                writeln!(out, "{INDENT}}}")?;
            }
        }
    }

    writeln!(out, "}}")
}

fn write_object(
    out: &mut impl Write,
    bare: &HashSet<&str>,
    name: &str,
    fields: &[Positioned<FieldDefinition>],
) -> fmt::Result {
    writeln!(out, "{INDENT}interface I{name} {{")?;
    writeln!(out, "{INDENT}{INDENT}__typename?: \"{name}\";")?;
    for field in fields {
        let field = &field.node;
        if let Some(description) = &field.description {
            write_doc(out, &INDENT.repeat(2), &description.node)?;
        }
        write_member(out, bare, field.name.node.as_str(), &field.ty.node)?;
    }
    writeln!(out, "{INDENT}}}")
}

fn write_arguments(
    out: &mut impl Write,
    bare: &HashSet<&str>,
    owner: &str,
    fields: &[Positioned<FieldDefinition>],
) -> fmt::Result {
    for field in fields {
        let field = &field.node;
        if field.arguments.is_empty() {
            continue;
        }
        writeln!(out)?;
        writeln!(
            out,
            "{INDENT}interface I{owner}On{}Arguments {{",
            pascal_case(field.name.node.as_str())
        )?;
        write_inputs(out, bare, &field.arguments)?;
        writeln!(out, "{INDENT}}}")?;
    }
    Ok(())
}

fn write_inputs(
    out: &mut impl Write,
    bare: &HashSet<&str>,
    inputs: &[Positioned<InputValueDefinition>],
) -> fmt::Result {
    for input in inputs {
        let input = &input.node;
        write_member(out, bare, input.name.node.as_str(), &input.ty.node)?;
    }
    Ok(())
}

fn write_member(
    out: &mut impl Write,
    bare: &HashSet<&str>,
    name: &str,
    ty: &Type,
) -> fmt::Result {
    let optional = if ty.nullable { "?" } else { "" };
    writeln!(out, "{INDENT}{INDENT}{name}{optional}: {};", ts_type(bare, ty))
}

fn write_doc(out: &mut impl Write, indent: &str, text: &str) -> fmt::Result {
    writeln!(out, "{indent}/**")?;
    for line in text.lines() {
        writeln!(out, "{indent} * {line}")?;
    }
    writeln!(out, "{indent} */")
}

fn ts_type(bare: &HashSet<&str>, ty: &Type) -> String {
    let base = match &ty.base {
        BaseType::Named(name) => named_type(bare, name.as_str()),
        BaseType::List(inner) => format!("Array<{}>", ts_type(bare, inner)),
    };
    if ty.nullable {
        format!("{base} | null")
    } else {
        base
    }
}

fn named_type(bare: &HashSet<&str>, name: &str) -> String {
    match name {
        "Int" | "Float" => "number".to_string(),
        "String" | "ID" => "string".to_string(),
        "Boolean" => "boolean".to_string(),
        other if bare.contains(other) => other.to_string(),
        other => format!("I{other}"),
    }
}

fn is_builtin_scalar(name: &str) -> bool {
    matches!(name, "Int" | "Float" | "String" | "ID" | "Boolean")
}

fn pascal_case(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A valid TypeScript identifier derived from the application name.
fn namespace_ident(name: &str) -> String {
    let ident: String = name
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(pascal_case)
        .collect();
    match ident.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => ident,
        _ => format!("GQL{ident}"),
    }
}
