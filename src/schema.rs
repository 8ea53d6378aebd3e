//! Structural schemas.
//!
//! A schema file is a subset of JSON Schema: `type` (a primitive tag,
//! `object`, `array`, or a two-element union with `null`), `properties`,
//! `required`, `additionalProperties: false`, `items`, and local `$ref`s
//! into `$defs` / `definitions`. It is parsed into a [`Shape`] tree once,
//! at registration. The same tree later checks completion output with
//! [`Shape::validate`], which walks shape and value in lockstep.
//!
//! Named sub-schemas may not refer to themselves, directly or through
//! others: a shape is always a finite tree.

use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::PipelineResult;
use crate::tables::{ensure_schema_registry, table_exists, validate_table_name};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("cannot read schema {path}: {message}")]
    Unreadable { path: String, message: String },

    #[error("malformed schema: {0}")]
    Malformed(String),

    #[error("{path}: unknown type '{tag}'")]
    UnknownType { path: String, tag: String },

    #[error("{path}: no type given")]
    MissingType { path: String },

    #[error("{path}: only unions of one type with null are supported")]
    UnsupportedUnion { path: String },

    #[error("{path}: array schema has no 'items'")]
    MissingItems { path: String },

    #[error("{path}: required field '{field}' is not among the properties")]
    UnknownRequired { path: String, field: String },

    #[error("{path}: cannot resolve reference '{reference}'")]
    UnresolvedRef { path: String, reference: String },

    #[error("cyclic reference through '{0}'")]
    CyclicRef(String),

    #[error("top-level schema must be an object or an array")]
    RootNotComposite,

    #[error("schema has no name and none can be derived from its origin")]
    MissingName,

    #[error("schema '{name}' is already used by records in {table}; register the new definition under a new name")]
    InUse { name: String, table: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Primitive {
    String,
    Integer,
    Number,
    Boolean,
    Null,
}

impl Primitive {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" => Some(Primitive::String),
            "integer" => Some(Primitive::Integer),
            "number" => Some(Primitive::Number),
            "boolean" => Some(Primitive::Boolean),
            "null" => Some(Primitive::Null),
            _ => None,
        }
    }

    fn accepts(self, value: &Value) -> bool {
        match self {
            Primitive::String => value.is_string(),
            Primitive::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            Primitive::Number => value.is_number(),
            Primitive::Boolean => value.is_boolean(),
            Primitive::Null => value.is_null(),
        }
    }

    fn name(self) -> &'static str {
        match self {
            Primitive::String => "string",
            Primitive::Integer => "integer",
            Primitive::Number => "number",
            Primitive::Boolean => "boolean",
            Primitive::Null => "null",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub shape: Shape,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectShape {
    pub fields: BTreeMap<String, Field>,
    /// Whether keys outside `fields` are accepted.
    pub additional: bool,
}

/// Expected shape of a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Shape {
    Primitive(Primitive),
    Object(ObjectShape),
    Array(Box<Shape>),
    Nullable(Box<Shape>),
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Primitive(p) => f.write_str(p.name()),
            Shape::Object(_) => f.write_str("object"),
            Shape::Array(_) => f.write_str("array"),
            Shape::Nullable(inner) => write!(f, "{} or null", inner),
        }
    }
}

/// A value that does not conform to a [`Shape`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{path}: expected {expected}, found {found}")]
pub struct ShapeMismatch {
    pub path: String,
    pub expected: String,
    pub found: String,
}

impl Shape {
    /// Parse a schema document.
    pub fn parse(definition: &Value) -> Result<Shape, SchemaError> {
        let mut resolver = Resolver {
            root: definition,
            stack: Vec::new(),
        };
        let shape = resolver.shape(definition, "$")?;
        match shape {
            Shape::Object(_) | Shape::Array(_) => Ok(shape),
            _ => Err(SchemaError::RootNotComposite),
        }
    }

    /// Check `value` against this shape.
    ///
    /// A non-required field may be absent or `null`; a required one must be
    /// present and, unless its shape is nullable, non-null.
    pub fn validate(&self, value: &Value) -> Result<(), ShapeMismatch> {
        check(self, value, "$")
    }
}

fn check(shape: &Shape, value: &Value, path: &str) -> Result<(), ShapeMismatch> {
    match (shape, value) {
        (Shape::Nullable(_), Value::Null) => Ok(()),
        (Shape::Nullable(inner), v) => check(inner, v, path),
        (Shape::Primitive(p), v) if p.accepts(v) => Ok(()),
        (Shape::Object(object), Value::Object(map)) => {
            for (name, field) in &object.fields {
                let field_path = format!("{}.{}", path, name);
                match map.get(name) {
                    Some(Value::Null) if !field.required => {}
                    Some(v) => check(&field.shape, v, &field_path)?,
                    None if field.required => {
                        return Err(ShapeMismatch {
                            path: field_path,
                            expected: format!("required {}", field.shape),
                            found: "nothing".to_string(),
                        })
                    }
                    None => {}
                }
            }
            if !object.additional {
                if let Some(extra) = map.keys().find(|k| !object.fields.contains_key(*k)) {
                    return Err(ShapeMismatch {
                        path: format!("{}.{}", path, extra),
                        expected: "no such field".to_string(),
                        found: kind_of(&map[extra]).to_string(),
                    });
                }
            }
            Ok(())
        }
        (Shape::Array(element), Value::Array(items)) => {
            for (i, item) in items.iter().enumerate() {
                check(element, item, &format!("{}[{}]", path, i))?;
            }
            Ok(())
        }
        (shape, v) => Err(ShapeMismatch {
            path: path.to_string(),
            expected: shape.to_string(),
            found: kind_of(v).to_string(),
        }),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

struct Resolver<'a> {
    root: &'a Value,
    /// References currently being expanded, for cycle detection.
    stack: Vec<String>,
}

impl<'a> Resolver<'a> {
    fn shape(&mut self, node: &'a Value, path: &str) -> Result<Shape, SchemaError> {
        let obj = node
            .as_object()
            .ok_or_else(|| SchemaError::Malformed(format!("{}: expected a schema object", path)))?;

        if let Some(reference) = obj.get("$ref") {
            return self.reference(reference, path);
        }

        let (tag, nullable) = match obj.get("type") {
            Some(Value::String(tag)) => (tag.as_str(), false),
            Some(Value::Array(tags)) => union_tag(tags, path)?,
            Some(_) => {
                return Err(SchemaError::Malformed(format!(
                    "{}: 'type' must be a string or an array of strings",
                    path
                )))
            }
            None if obj.contains_key("properties") => ("object", false),
            None if obj.contains_key("items") => ("array", false),
            None => {
                return Err(SchemaError::MissingType {
                    path: path.to_string(),
                })
            }
        };

        let shape = match tag {
            "object" => Shape::Object(self.object(obj, path)?),
            "array" => {
                let items = obj.get("items").ok_or_else(|| SchemaError::MissingItems {
                    path: path.to_string(),
                })?;
                Shape::Array(Box::new(self.shape(items, &format!("{}[]", path))?))
            }
            other => match Primitive::from_tag(other) {
                Some(p) => Shape::Primitive(p),
                None => {
                    return Err(SchemaError::UnknownType {
                        path: path.to_string(),
                        tag: other.to_string(),
                    })
                }
            },
        };

        Ok(if nullable {
            Shape::Nullable(Box::new(shape))
        } else {
            shape
        })
    }

    fn object(
        &mut self,
        obj: &'a serde_json::Map<String, Value>,
        path: &str,
    ) -> Result<ObjectShape, SchemaError> {
        let mut fields = BTreeMap::new();

        match obj.get("properties") {
            None => {}
            Some(Value::Object(properties)) => {
                for (name, node) in properties {
                    let shape = self.shape(node, &format!("{}.{}", path, name))?;
                    fields.insert(
                        name.clone(),
                        Field {
                            shape,
                            required: false,
                        },
                    );
                }
            }
            Some(_) => {
                return Err(SchemaError::Malformed(format!(
                    "{}: 'properties' must be an object",
                    path
                )))
            }
        }

        match obj.get("required") {
            None => {}
            Some(Value::Array(names)) => {
                for name in names {
                    let name = name.as_str().ok_or_else(|| {
                        SchemaError::Malformed(format!("{}: 'required' must list strings", path))
                    })?;
                    let field = fields.get_mut(name).ok_or_else(|| SchemaError::UnknownRequired {
                        path: path.to_string(),
                        field: name.to_string(),
                    })?;
                    field.required = true;
                }
            }
            Some(_) => {
                return Err(SchemaError::Malformed(format!(
                    "{}: 'required' must be an array",
                    path
                )))
            }
        }

        let additional = !matches!(obj.get("additionalProperties"), Some(Value::Bool(false)));

        Ok(ObjectShape { fields, additional })
    }

    fn reference(&mut self, reference: &Value, path: &str) -> Result<Shape, SchemaError> {
        let unresolved = || SchemaError::UnresolvedRef {
            path: path.to_string(),
            reference: reference.to_string(),
        };

        let pointer = reference
            .as_str()
            .and_then(|r| r.strip_prefix('#'))
            .filter(|p| p.starts_with("/$defs/") || p.starts_with("/definitions/"))
            .ok_or_else(unresolved)?;

        if self.stack.iter().any(|seen| seen == pointer) {
            return Err(SchemaError::CyclicRef(format!("#{}", pointer)));
        }

        let root = self.root;
        let target = root.pointer(pointer).ok_or_else(unresolved)?;

        self.stack.push(pointer.to_string());
        let shape = self.shape(target, path);
        self.stack.pop();
        shape
    }
}

fn union_tag<'v>(tags: &'v [Value], path: &str) -> Result<(&'v str, bool), SchemaError> {
    let mut nullable = false;
    let mut others = Vec::new();
    for tag in tags {
        match tag.as_str() {
            Some("null") => nullable = true,
            Some(t) => others.push(t),
            None => {
                return Err(SchemaError::Malformed(format!(
                    "{}: 'type' array must list strings",
                    path
                )))
            }
        }
    }
    match (others.as_slice(), nullable) {
        ([single], _) => Ok((*single, nullable)),
        ([], true) => Ok(("null", false)),
        _ => Err(SchemaError::UnsupportedUnion {
            path: path.to_string(),
        }),
    }
}

/// A validated, named schema.
#[derive(Debug, Clone)]
pub struct SchemaHandle {
    pub name: String,
    pub shape: Arc<Shape>,
    pub definition: Arc<Value>,
    /// Hex SHA-256 of the canonical JSON of `definition`.
    pub checksum: String,
}

impl SchemaHandle {
    /// `"object"` or `"array"`: what the completion must return.
    pub fn root_kind(&self) -> &'static str {
        match *self.shape {
            Shape::Array(_) => "array",
            _ => "object",
        }
    }

    /// The part of the definition shown to the model: the root's (or the
    /// array element's) properties when present, otherwise everything.
    pub fn prompt_fields(&self) -> &Value {
        let definition = self.definition.as_ref();
        definition
            .get("items")
            .and_then(|items| items.get("properties"))
            .or_else(|| definition.get("properties"))
            .unwrap_or(definition)
    }

    pub fn validate(&self, value: &Value) -> Result<(), ShapeMismatch> {
        self.shape.validate(value)
    }
}

/// Named schemas in effect for this process.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, SchemaHandle>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `definition` and register it.
    ///
    /// `name` defaults to the file name of `origin`. Registering an existing
    /// name with a different definition replaces it (last write wins) and
    /// is logged. On error nothing is registered.
    pub fn register(
        &mut self,
        definition: Value,
        name: Option<&str>,
        origin: &str,
    ) -> Result<SchemaHandle, SchemaError> {
        let name = match name {
            Some(n) if !n.trim().is_empty() => n.trim().to_string(),
            Some(_) => return Err(SchemaError::MissingName),
            None => name_from_origin(origin).ok_or(SchemaError::MissingName)?,
        };

        let shape = Shape::parse(&definition)?;
        let checksum = definition_checksum(&definition);

        if let Some(existing) = self.schemas.get(&name) {
            if existing.checksum != checksum {
                warn!(schema = %name, "schema name reused with a different definition, replacing");
            }
        }

        let handle = SchemaHandle {
            name: name.clone(),
            shape: Arc::new(shape),
            definition: Arc::new(definition),
            checksum,
        };
        debug!(schema = %name, root = handle.root_kind(), "registered schema");
        self.schemas.insert(name, handle.clone());
        Ok(handle)
    }

    /// Read a JSON schema file and register it.
    pub fn load_file(&mut self, path: &Path, name: Option<&str>) -> Result<SchemaHandle, SchemaError> {
        let content = std::fs::read_to_string(path).map_err(|e| SchemaError::Unreadable {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        let definition: Value = serde_json::from_str(&content)
            .map_err(|e| SchemaError::Malformed(format!("{}: {}", path.display(), e)))?;
        self.register(definition, name, &path.to_string_lossy())
    }

    pub fn get(&self, name: &str) -> Option<&SchemaHandle> {
        self.schemas.get(name)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

fn name_from_origin(origin: &str) -> Option<String> {
    Path::new(origin)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty())
}

fn definition_checksum(definition: &Value) -> String {
    // serde_json maps are key-ordered, so this serialization is canonical.
    let canonical = definition.to_string();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Record `handle` in the `schema_registry` table.
///
/// A schema is immutable once any parsed record references it, in
/// `destination` or in any other table the name was parsed into: a
/// different definition under such a name fails with [`SchemaError::InUse`].
/// An unreferenced name is overwritten.
pub async fn persist_schema(
    pool: &SqlitePool,
    handle: &SchemaHandle,
    destination: &str,
) -> PipelineResult<()> {
    validate_table_name(destination)?;
    ensure_schema_registry(pool).await?;

    let stored: Option<String> =
        sqlx::query_scalar("SELECT checksum FROM schema_registry WHERE name = ?")
            .bind(&handle.name)
            .fetch_optional(pool)
            .await?;

    if stored.as_deref() != Some(handle.checksum.as_str()) {
        if stored.is_some() {
            if let Some(table) = referencing_table(pool, &handle.name, destination).await? {
                return Err(SchemaError::InUse {
                    name: handle.name.clone(),
                    table,
                }
                .into());
            }
            warn!(schema = %handle.name, "replacing unreferenced schema definition");
        }

        sqlx::query(
            r#"
            INSERT INTO schema_registry (name, checksum, definition, registered_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                checksum = excluded.checksum,
                definition = excluded.definition,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(&handle.name)
        .bind(&handle.checksum)
        .bind(handle.definition.to_string())
        .bind(chrono::Utc::now().timestamp())
        .execute(pool)
        .await?;
    }

    sqlx::query("INSERT OR IGNORE INTO schema_usage (name, destination) VALUES (?, ?)")
        .bind(&handle.name)
        .bind(destination)
        .execute(pool)
        .await?;

    Ok(())
}

/// First table holding records under schema `name`, if any.
async fn referencing_table(
    pool: &SqlitePool,
    name: &str,
    destination: &str,
) -> PipelineResult<Option<String>> {
    let mut tables: Vec<String> = sqlx::query_scalar(
        "SELECT destination FROM schema_usage WHERE name = ? ORDER BY destination",
    )
    .bind(name)
    .fetch_all(pool)
    .await?;
    if !tables.iter().any(|t| t == destination) {
        tables.push(destination.to_string());
    }

    for table in tables {
        // Tables dropped since their last parse run hold no references.
        if validate_table_name(&table).is_err() || !table_exists(pool, &table).await? {
            continue;
        }
        let references: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE schema_name = ?",
            table
        ))
        .bind(name)
        .fetch_one(pool)
        .await?;
        if references > 0 {
            return Ok(Some(table));
        }
    }
    Ok(None)
}
