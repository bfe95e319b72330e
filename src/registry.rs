//! Uniform iteration over every known model, whatever answers the question.
//!
//! [`Registry::InMemory`] holds a snapshot built ahead of time (the static
//! index, or fixtures in tests). [`Registry::Remote`] asks the live runtime
//! through the execution manager: one call lists the model names, then
//! details are fetched in batches as the cursor advances.
//!
//! A cursor only ever yields fully decoded [`Entity`] values. An empty
//! iteration from the live runtime is not trusted on its own; use
//! [`Registry::collect_verified`], which checks the count before accepting
//! an empty answer.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::exec::{ExecutionFailure, ExecutionManager};

/// A model known to the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inherits: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldSummary>,
}

impl Entity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            module: None,
            transient: false,
            is_abstract: false,
            inherits: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Case-insensitive match of `pattern` against name and description.
    ///
    /// `*` matches any run of characters; without one the pattern is a
    /// substring match.
    pub fn matches(&self, pattern: &str) -> bool {
        let pattern = pattern.trim().to_lowercase();
        if pattern.is_empty() || pattern == "*" {
            return true;
        }
        let name = self.name.to_lowercase();
        if pattern.contains('*') {
            return glob_match(&pattern, &name);
        }
        name.contains(&pattern)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&pattern))
    }

    /// Text the pagination filter runs against.
    pub fn search_text(&self) -> String {
        match &self.description {
            Some(description) => format!("{} {description}", self.name),
            None => self.name.clone(),
        }
    }
}

/// A field declaration seen by the static index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
}

/// One field in a model description, with whatever attributes the source
/// could report beyond its type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDetail {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl From<&FieldSummary> for FieldDetail {
    fn from(field: &FieldSummary) -> Self {
        Self {
            name: field.name.clone(),
            field_type: field.field_type.clone(),
            attributes: Map::new(),
        }
    }
}

/// Full description of one model. Both registry variants answer with this
/// shape; `fields` is always a list in declaration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescription {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default)]
    pub transient: bool,
    #[serde(default)]
    pub is_abstract: bool,
    #[serde(default)]
    pub inherits: Vec<String>,
    pub field_count: usize,
    #[serde(default)]
    pub fields: Vec<FieldDetail>,
}

impl From<&Entity> for ModelDescription {
    fn from(entity: &Entity) -> Self {
        Self {
            name: entity.name.clone(),
            description: entity.description.clone(),
            module: entity.module.clone(),
            table: None,
            transient: entity.transient,
            is_abstract: entity.is_abstract,
            inherits: entity.inherits.clone(),
            field_count: entity.fields.len(),
            fields: entity.fields.iter().map(FieldDetail::from).collect(),
        }
    }
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    let (first, rest) = match parts.split_first() {
        Some(split) => split,
        None => return true,
    };
    let Some(mut remaining) = text.strip_prefix(first) else {
        return false;
    };
    let Some((last, middle)) = rest.split_last() else {
        return remaining.is_empty();
    };
    for part in middle {
        match remaining.find(part) {
            Some(pos) => remaining = &remaining[pos + part.len()..],
            None => return false,
        }
    }
    remaining.len() >= last.len() && remaining.ends_with(last)
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("live registry call failed: {0}")]
    Execution(#[from] ExecutionFailure),

    #[error("unexpected registry payload: {0}")]
    Decode(String),

    #[error("registry iteration returned nothing although {expected} models exist")]
    EmptyIteration { expected: usize },
}

/// Snapshot of entities in insertion order.
#[derive(Debug, Default)]
pub struct InMemoryRegistry {
    entities: Vec<Entity>,
    index: HashMap<String, usize>,
}

impl InMemoryRegistry {
    /// Build from `entities`; the first entity with a given name wins.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut registry = Self::default();
        for entity in entities {
            if registry.index.contains_key(&entity.name) {
                continue;
            }
            registry
                .index
                .insert(entity.name.clone(), registry.entities.len());
            registry.entities.push(entity);
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.index.get(name).map(|&i| &self.entities[i])
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }
}

const LIST_CODE: &str = "result = sorted(env.registry.keys())";

const COUNT_CODE: &str = "result = len(env.registry)";

const DETAILS_CODE: &str = r#"_mcp_names = __NAMES__
result = []
for _name in _mcp_names:
    if _name not in env.registry:
        continue
    _model = env[_name]
    _inherit = _model._inherit or []
    if isinstance(_inherit, str):
        _inherit = [_inherit]
    result.append({
        "name": _name,
        "description": _model._description or None,
        "module": _model._module or None,
        "transient": bool(_model._transient),
        "is_abstract": bool(_model._abstract),
        "inherits": [i for i in _inherit if i != _name],
    })
"#;

const DESCRIBE_CODE: &str = r#"_name = __NAME__
if _name not in env.registry:
    result = None
else:
    _model = env[_name]
    _inherit = _model._inherit or []
    if isinstance(_inherit, str):
        _inherit = [_inherit]
    _fields = []
    for _fname, _field in _model._fields.items():
        _info = {
            "name": _fname,
            "type": _field.type,
            "string": _field.string,
            "required": bool(_field.required),
            "readonly": bool(_field.readonly),
            "store": bool(_field.store),
        }
        if getattr(_field, "comodel_name", None):
            _info["relation"] = _field.comodel_name
        if _field.help:
            _info["help"] = _field.help
        _fields.append(_info)
    result = {
        "name": _name,
        "description": _model._description or None,
        "module": _model._module or None,
        "table": _model._table or None,
        "transient": bool(_model._transient),
        "is_abstract": bool(_model._abstract),
        "inherits": [i for i in _inherit if i != _name],
        "field_count": len(_fields),
        "fields": _fields,
    }
"#;

/// Registry answered by the live runtime.
#[derive(Clone)]
pub struct RemoteRegistry {
    manager: Arc<ExecutionManager>,
    batch_size: usize,
}

impl RemoteRegistry {
    pub fn new(manager: Arc<ExecutionManager>, batch_size: usize) -> Self {
        Self {
            manager,
            batch_size: batch_size.max(1),
        }
    }

    async fn run<T: DeserializeOwned>(&self, code: &str) -> Result<T, RegistryError> {
        let value = self.manager.execute_idempotent(code, None).await.into_result()?;
        serde_json::from_value(value).map_err(|e| RegistryError::Decode(e.to_string()))
    }

    async fn list_names(&self) -> Result<Vec<String>, RegistryError> {
        let names: Vec<String> = self.run(LIST_CODE).await?;
        debug!(count = names.len(), "Listed live models");
        Ok(names)
    }

    async fn count(&self) -> Result<usize, RegistryError> {
        self.run(COUNT_CODE).await
    }

    async fn fetch_details(&self, names: &[String]) -> Result<Vec<Entity>, RegistryError> {
        let literal = serde_json::to_string(names).map_err(|e| RegistryError::Decode(e.to_string()))?;
        let entities: Vec<Entity> = self.run(&DETAILS_CODE.replace("__NAMES__", &literal)).await?;
        if entities.len() < names.len() {
            debug!(
                requested = names.len(),
                resolved = entities.len(),
                "Some models disappeared between listing and detail fetch"
            );
        }
        Ok(entities)
    }

    async fn describe(&self, name: &str) -> Result<Option<ModelDescription>, RegistryError> {
        let literal = serde_json::to_string(name).map_err(|e| RegistryError::Decode(e.to_string()))?;
        self.run(&DESCRIBE_CODE.replace("__NAME__", &literal)).await
    }
}

/// Registry handle shared by every call in a session.
#[derive(Clone)]
pub enum Registry {
    InMemory(Arc<InMemoryRegistry>),
    Remote(RemoteRegistry),
}

impl Registry {
    pub const fn is_live(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Start a fresh pass over every entity.
    pub fn iterate(&self) -> EntityCursor<'_> {
        let state = match self {
            Self::InMemory(registry) => CursorState::Memory(registry.entities.iter()),
            Self::Remote(registry) => CursorState::Remote {
                registry,
                names: None,
                buffer: VecDeque::new(),
                done: false,
            },
        };
        EntityCursor { state }
    }

    /// Number of entities, without iterating.
    pub async fn count(&self) -> Result<usize, RegistryError> {
        match self {
            Self::InMemory(registry) => Ok(registry.len()),
            Self::Remote(registry) => registry.count().await,
        }
    }

    /// Drain the cursor, refusing to trust an empty result until the count
    /// confirms there is genuinely nothing.
    pub async fn collect_verified(&self) -> Result<Vec<Entity>, RegistryError> {
        let mut cursor = self.iterate();
        let mut entities = Vec::new();
        while let Some(entity) = cursor.next().await {
            entities.push(entity?);
        }
        if entities.is_empty() {
            let expected = self.count().await?;
            if expected > 0 {
                warn!(expected, "Registry iteration came back empty");
                return Err(RegistryError::EmptyIteration { expected });
            }
        }
        Ok(entities)
    }

    /// Full description of one model, or `None` if it is unknown.
    pub async fn describe(&self, name: &str) -> Result<Option<ModelDescription>, RegistryError> {
        match self {
            Self::InMemory(registry) => Ok(registry.get(name).map(ModelDescription::from)),
            Self::Remote(registry) => registry.describe(name).await,
        }
    }
}

/// Lazy pass over a registry; restart by calling [`Registry::iterate`] again.
pub struct EntityCursor<'a> {
    state: CursorState<'a>,
}

enum CursorState<'a> {
    Memory(std::slice::Iter<'a, Entity>),
    Remote {
        registry: &'a RemoteRegistry,
        names: Option<std::vec::IntoIter<String>>,
        buffer: VecDeque<Entity>,
        done: bool,
    },
}

impl EntityCursor<'_> {
    /// Next entity, or `None` once the pass is over.
    ///
    /// After an error the cursor is exhausted.
    pub async fn next(&mut self) -> Option<Result<Entity, RegistryError>> {
        match &mut self.state {
            CursorState::Memory(iter) => iter.next().cloned().map(Ok),
            CursorState::Remote {
                registry,
                names,
                buffer,
                done,
            } => loop {
                if let Some(entity) = buffer.pop_front() {
                    return Some(Ok(entity));
                }
                if *done {
                    return None;
                }
                if names.is_none() {
                    match registry.list_names().await {
                        Ok(list) => *names = Some(list.into_iter()),
                        Err(e) => {
                            *done = true;
                            return Some(Err(e));
                        }
                    }
                }
                let batch: Vec<String> = names
                    .as_mut()
                    .map(|iter| iter.by_ref().take(registry.batch_size).collect())
                    .unwrap_or_default();
                if batch.is_empty() {
                    *done = true;
                    return None;
                }
                match registry.fetch_details(&batch).await {
                    Ok(entities) => buffer.extend(entities),
                    Err(e) => {
                        *done = true;
                        return Some(Err(e));
                    }
                }
            },
        }
    }
}
