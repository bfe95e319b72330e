//! Static model index built from addon sources on the host.
//!
//! Every directory holding a `__manifest__.py` is an addon. Its Python files
//! are scanned line by line for ORM model classes and the class attributes
//! that identify them (`_name`, `_inherit`, `_description`) plus simple
//! `name = fields.Type(` declarations. The result is an approximation of the
//! live registry that needs no running process.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::registry::{Entity, FieldSummary, InMemoryRegistry};

/// How deep below a root addons are looked for.
const MAX_ADDON_DEPTH: usize = 3;

const SKIPPED_DIRS: &[&str] = &["__pycache__", "tests", "migrations", "static", "node_modules"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelKind {
    Regular,
    Transient,
    Abstract,
}

/// One `class X(models.Model)` block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ModelDecl {
    kind: ModelKind,
    name: Option<String>,
    inherits: Vec<String>,
    description: Option<String>,
    fields: Vec<FieldSummary>,
}

impl ModelDecl {
    /// Registry key: `_name`, or the first `_inherit` for in-place extensions.
    fn key(&self) -> Option<&str> {
        self.name.as_deref().or_else(|| self.inherits.first().map(String::as_str))
    }
}

/// Scan every root and build the static registry.
///
/// Unreadable roots and files are skipped with a warning.
pub fn build_index(roots: &[PathBuf]) -> InMemoryRegistry {
    let mut entities: Vec<Entity> = Vec::new();
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut addon_count = 0usize;

    for root in roots {
        if !root.is_dir() {
            warn!(root = %root.display(), "Addons root is not a directory, skipping");
            continue;
        }
        for addon in find_addons(root) {
            addon_count += 1;
            let module = addon
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            for file in python_files(&addon) {
                let source = match fs::read_to_string(&file) {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "Cannot read source file");
                        continue;
                    }
                };
                for decl in parse_models(&source) {
                    merge(&mut entities, &mut positions, decl, &module);
                }
            }
        }
    }

    info!(addons = addon_count, models = entities.len(), "Built static model index");
    InMemoryRegistry::from_entities(entities)
}

fn merge(
    entities: &mut Vec<Entity>,
    positions: &mut HashMap<String, usize>,
    decl: ModelDecl,
    module: &str,
) {
    let Some(key) = decl.key().map(str::to_string) else {
        return;
    };
    let parents: Vec<String> = decl.inherits.iter().filter(|i| **i != key).cloned().collect();

    if let Some(&pos) = positions.get(&key) {
        let entity = &mut entities[pos];
        if entity.description.is_none() {
            entity.description = decl.description;
        }
        for parent in parents {
            if !entity.inherits.contains(&parent) {
                entity.inherits.push(parent);
            }
        }
        for field in decl.fields {
            if !entity.fields.iter().any(|f| f.name == field.name) {
                entity.fields.push(field);
            }
        }
        return;
    }

    positions.insert(key.clone(), entities.len());
    entities.push(Entity {
        name: key,
        description: decl.description,
        module: Some(module.to_string()),
        transient: decl.kind == ModelKind::Transient,
        is_abstract: decl.kind == ModelKind::Abstract,
        inherits: parents,
        fields: decl.fields,
    });
}

/// Addon directories under `root`, in path order.
fn find_addons(root: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    collect_addons(root, 0, &mut found);
    found
}

fn collect_addons(dir: &Path, depth: usize, found: &mut Vec<PathBuf>) {
    if dir.join("__manifest__.py").is_file() {
        found.push(dir.to_path_buf());
        return;
    }
    if depth >= MAX_ADDON_DEPTH {
        return;
    }
    for child in sorted_subdirs(dir) {
        collect_addons(&child, depth + 1, found);
    }
}

fn sorted_subdirs(dir: &Path) -> Vec<PathBuf> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "Cannot list directory");
            return Vec::new();
        }
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir() && !is_skipped(path))
        .collect();
    dirs.sort();
    dirs
}

fn is_skipped(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map_or(true, |name| name.starts_with('.') || SKIPPED_DIRS.contains(&name))
}

/// Python sources of one addon, in path order.
fn python_files(addon: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![addon.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(Result::ok) {
            let path = entry.path();
            if path.is_dir() {
                if !is_skipped(&path) {
                    pending.push(path);
                }
            } else if path.extension().is_some_and(|ext| ext == "py") {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

/// Model declarations in one Python source file.
fn parse_models(source: &str) -> Vec<ModelDecl> {
    let lines: Vec<&str> = source.lines().collect();
    let mut decls = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let Some(kind) = model_class_kind(lines[i]) else {
            i += 1;
            continue;
        };
        let class_indent = indent_of(lines[i]);
        let mut decl = ModelDecl {
            kind,
            name: None,
            inherits: Vec::new(),
            description: None,
            fields: Vec::new(),
        };
        let mut body_indent = None;
        i += 1;

        while i < lines.len() {
            let line = lines[i];
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                i += 1;
                continue;
            }
            let indent = indent_of(line);
            if indent <= class_indent {
                break;
            }
            let level = *body_indent.get_or_insert(indent);
            if indent == level {
                // Attribute values may continue over several lines
                let mut statement = trimmed.to_string();
                while open_brackets(&statement) > 0 && i + 1 < lines.len() {
                    i += 1;
                    statement.push(' ');
                    statement.push_str(lines[i].trim());
                }
                apply_statement(&mut decl, &statement);
            }
            i += 1;
        }

        decls.push(decl);
    }
    decls
}

fn model_class_kind(line: &str) -> Option<ModelKind> {
    let rest = line.trim_start().strip_prefix("class ")?;
    let open = rest.find('(')?;
    let close = rest[open..].find(')')? + open;
    let bases = &rest[open + 1..close];
    bases.split(',').map(str::trim).find_map(|base| {
        match base.rsplit('.').next().unwrap_or(base) {
            "Model" => Some(ModelKind::Regular),
            "TransientModel" => Some(ModelKind::Transient),
            "AbstractModel" => Some(ModelKind::Abstract),
            _ => None,
        }
    })
}

fn apply_statement(decl: &mut ModelDecl, statement: &str) {
    let Some((target, value)) = statement.split_once('=') else {
        return;
    };
    let target = target.trim();
    let value = value.trim();
    if target.is_empty() || value.starts_with('=') {
        return;
    }
    match target {
        "_name" => decl.name = first_literal(value),
        "_description" => decl.description = first_literal(value),
        "_inherit" => {
            decl.inherits = if value.starts_with('[') || value.starts_with('(') {
                string_literals(value)
            } else {
                first_literal(value).into_iter().collect()
            };
        }
        name if is_identifier(name) && !name.starts_with('_') => {
            if let Some(field_type) = field_constructor(value) {
                decl.fields.push(FieldSummary {
                    name: name.to_string(),
                    field_type,
                });
            }
        }
        _ => {}
    }
}

/// `fields.Char(...)` → `Char`.
fn field_constructor(value: &str) -> Option<String> {
    let rest = value.strip_prefix("fields.")?;
    let end = rest.find('(')?;
    let name = &rest[..end];
    (is_identifier(name) && name.starts_with(|c: char| c.is_ascii_uppercase()))
        .then(|| name.to_string())
}

fn first_literal(value: &str) -> Option<String> {
    string_literals(value).into_iter().next()
}

/// Every quoted string in `value`, in order.
fn string_literals(value: &str) -> Vec<String> {
    let mut found = Vec::new();
    let mut chars = value.char_indices();
    while let Some((start, c)) = chars.next() {
        if c != '\'' && c != '"' {
            continue;
        }
        let mut escaped = false;
        for (pos, inner) in chars.by_ref() {
            if escaped {
                escaped = false;
            } else if inner == '\\' {
                escaped = true;
            } else if inner == c {
                found.push(value[start + 1..pos].to_string());
                break;
            }
        }
    }
    found
}

fn open_brackets(statement: &str) -> i32 {
    statement.chars().fold(0, |depth, c| match c {
        '[' | '(' | '{' => depth + 1,
        ']' | ')' | '}' => depth - 1,
        _ => depth,
    })
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(|c: char| c.is_ascii_digit())
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
