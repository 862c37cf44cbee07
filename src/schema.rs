//! Capsule input/output schemas.
//!
//! A capsule's `schema.json` declares the shape of the JSON document it reads
//! from its input region and the one it writes to its output region. Each side
//! is compiled into a [`Schema`] once, at registry load, and used for two
//! things: validation and discovering which fields carry file references.

use jsonschema::JSONSchema;
use jsonschema::error::{ValidationError, ValidationErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type JsonObject = Map<String, Value>;

/// Raw `schema.json` document as stored on disk (or inline in the config).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaDocument {
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
}

/// JSON value kinds, used to pick the `anyOf`/`oneOf` branch a value
/// belongs to when looking for file references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Null,
    Boolean,
    Integer,
    Number,
    String,
    Array,
    Object,
}

impl Kind {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "null" => Self::Null,
            "boolean" => Self::Boolean,
            "integer" => Self::Integer,
            "number" => Self::Number,
            "string" | "file" => Self::String,
            "array" => Self::Array,
            "object" => Self::Object,
            _ => return None,
        })
    }

    fn admits(self, value: &Value) -> bool {
        match (self, value) {
            (Self::Null, Value::Null) => true,
            (Self::Boolean, Value::Bool(_)) => true,
            (Self::Integer, Value::Number(n)) => {
                n.is_i64() || n.is_u64() || n.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            (Self::Number, Value::Number(_)) => true,
            (Self::String, Value::String(_)) => true,
            (Self::Array, Value::Array(_)) => true,
            (Self::Object, Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// A single schema violation: where and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub path: String,
    pub reason: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.reason)
    }
}

impl Violation {
    fn from_error(error: &ValidationError<'_>) -> Self {
        let path = pointer_to_path(&error.instance_path.to_string());
        match &error.kind {
            ValidationErrorKind::Required { property } => Self {
                path: child_path(&path, property.as_str().unwrap_or_default()),
                reason: "missing required field".to_string(),
            },
            ValidationErrorKind::AdditionalProperties { unexpected } => Self {
                path: match unexpected.first() {
                    Some(name) => child_path(&path, name),
                    None => path,
                },
                reason: "unexpected field".to_string(),
            },
            _ => Self {
                path,
                reason: error.to_string(),
            },
        }
    }
}

/// A file-valued field found in a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    /// JSON pointer to the field (usable with `Value::pointer_mut`).
    pub pointer: String,
    /// Human-readable path (`$.files[0]`).
    pub path: String,
    /// The string value of the field.
    pub value: String,
}

/// A capsule schema: the compiled validator plus the shape needed to find
/// file-valued fields.
#[derive(Clone)]
pub struct Schema {
    validator: Option<Arc<JSONSchema>>,
    shape: FileShape,
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("compiled", &self.validator.is_some())
            .field("shape", &self.shape)
            .finish()
    }
}

impl Default for Schema {
    fn default() -> Self {
        Self::any()
    }
}

impl Schema {
    /// A schema that accepts every value. Used when a capsule declares no
    /// schema for one side.
    pub fn any() -> Self {
        Self {
            validator: None,
            shape: FileShape::default(),
        }
    }

    /// Compile a JSON Schema document. `"type": "file"` is accepted as a
    /// string that names a file.
    pub fn from_json(value: &Value) -> Result<Self, String> {
        let normalized = normalize_file_types(value.clone());
        let compiled = JSONSchema::compile(&normalized).map_err(|e| format!("invalid schema: {}", e))?;
        Ok(Self {
            validator: Some(Arc::new(compiled)),
            shape: FileShape::parse(value),
        })
    }

    pub fn is_file(&self) -> bool {
        self.shape.file
    }

    /// Validate a value, reporting the first violation found.
    pub fn validate(&self, value: &Value) -> Result<(), Violation> {
        let Some(validator) = &self.validator else {
            return Ok(());
        };
        match validator.validate(value) {
            Ok(()) => Ok(()),
            Err(mut errors) => Err(errors
                .next()
                .map(|e| Violation::from_error(&e))
                .unwrap_or_else(|| Violation {
                    path: "$".to_string(),
                    reason: "invalid value".to_string(),
                })),
        }
    }

    /// Collect every file-valued field of `value` declared by this schema.
    pub fn file_refs(&self, value: &Value) -> Vec<FileRef> {
        let mut out = Vec::new();
        self.shape
            .collect(value, String::new(), "$".to_string(), &mut out);
        out
    }
}

/// The parts of a schema that say where file names live.
#[derive(Debug, Clone, Default)]
struct FileShape {
    kinds: Vec<Kind>,
    file: bool,
    properties: BTreeMap<String, FileShape>,
    items: Option<Box<FileShape>>,
    variants: Vec<FileShape>,
}

impl FileShape {
    fn parse(value: &Value) -> Self {
        let mut shape = Self::default();
        let Value::Object(map) = value else {
            return shape;
        };

        let names: Vec<&str> = match map.get("type") {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
            _ => Vec::new(),
        };
        for name in names {
            shape.file |= name == "file";
            if let Some(kind) = Kind::parse(name) {
                shape.kinds.push(kind);
            }
        }
        if let Some(format) = map.get("format").and_then(Value::as_str) {
            shape.file |= format == "file" || format == "file-path";
        }

        if let Some(Value::Object(props)) = map.get("properties") {
            shape.properties = props
                .iter()
                .map(|(name, sub)| (name.clone(), Self::parse(sub)))
                .collect();
        }
        if let Some(items) = map.get("items") {
            shape.items = Some(Box::new(Self::parse(items)));
        }
        for key in ["anyOf", "oneOf"] {
            if let Some(Value::Array(variants)) = map.get(key) {
                shape.variants.extend(variants.iter().map(Self::parse));
            }
        }
        shape
    }

    fn admits(&self, value: &Value) -> bool {
        self.kinds.is_empty() || self.kinds.iter().any(|k| k.admits(value))
    }

    fn collect(&self, value: &Value, pointer: String, path: String, out: &mut Vec<FileRef>) {
        if self.file {
            if let Value::String(s) = value {
                out.push(FileRef {
                    pointer,
                    path,
                    value: s.clone(),
                });
            }
            return;
        }

        if let Some(variant) = self.variants.iter().find(|s| s.admits(value)) {
            variant.collect(value, pointer.clone(), path.clone(), out);
        }

        match value {
            Value::Object(map) => {
                for (name, sub) in &self.properties {
                    if let Some(field) = map.get(name) {
                        sub.collect(
                            field,
                            format!("{}/{}", pointer, escape_pointer(name)),
                            child_path(&path, name),
                            out,
                        );
                    }
                }
            }
            Value::Array(items) => {
                if let Some(item_shape) = &self.items {
                    for (i, item) in items.iter().enumerate() {
                        item_shape.collect(
                            item,
                            format!("{pointer}/{i}"),
                            format!("{path}[{i}]"),
                            out,
                        );
                    }
                }
            }
            _ => {}
        }
    }
}

/// Rewrite the `file` pseudo-type to `string` and drop `any` so the document
/// passes meta-schema validation.
fn normalize_file_types(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, val) in map {
                let val = match (key.as_str(), val) {
                    ("type", Value::String(name)) if name == "any" => continue,
                    ("type", Value::String(name)) if name == "file" => Value::String("string".into()),
                    ("type", Value::Array(names)) => {
                        let mut kinds: Vec<Value> = Vec::with_capacity(names.len());
                        for name in names {
                            let name = match name {
                                Value::String(n) if n == "file" => Value::String("string".into()),
                                other => other,
                            };
                            if !kinds.contains(&name) {
                                kinds.push(name);
                            }
                        }
                        Value::Array(kinds)
                    }
                    (_, val) => normalize_file_types(val),
                };
                out.insert(key, val);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_file_types).collect()),
        other => other,
    }
}

/// `/items/2/name` becomes `$.items[2].name`.
fn pointer_to_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').filter(|s| !s.is_empty()) {
        if segment.bytes().all(|b| b.is_ascii_digit()) {
            path.push_str(&format!("[{segment}]"));
        } else {
            path = child_path(&path, segment);
        }
    }
    path
}

fn child_path(parent: &str, name: &str) -> String {
    format!("{parent}.{name}")
}

fn escape_pointer(segment: &str) -> String {
    segment.replace('~', "~0").replace('/', "~1")
}
