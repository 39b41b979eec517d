use serde_json::Value;

use crate::db::SqlValue;
use crate::error::EntityStoreError;

/// A small filter expression used to select entities without exposing a full
/// query language. Closed sum: there is no silent "unknown predicate
/// compiles to no filter" fallback; unrecognized wire shapes are rejected at
/// parse time.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Shorthand for equality on the primary identifier.
    Uid(String),
    Eq { key: String, value: Value },
    Like { key: String, value: String },
    StartsWith { key: String, value: String },
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

/// Logical-to-physical column mapping for one entity kind. Unknown keys pass
/// through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct ColumnMap {
    entries: &'static [(&'static str, &'static str)],
}

impl ColumnMap {
    pub const fn new(entries: &'static [(&'static str, &'static str)]) -> Self {
        Self { entries }
    }

    pub fn resolve<'k>(&self, key: &'k str) -> &'k str {
        for (logical, physical) in self.entries {
            if *logical == key {
                return physical;
            }
        }
        key
    }
}

/// A compiled filter clause: SQL text with `?` placeholders and the matching
/// positional parameters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompiledWhere {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl CompiledWhere {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.sql.is_empty()
    }
}

/// Compiles a predicate into a parameterized filter clause. `None` means "no
/// filter". `And`/`Or` children compile independently; empty children are
/// dropped, the rest parenthesized and joined, parameters concatenated in
/// child order (parameters are positional).
pub fn compile(
    predicate: Option<&Predicate>,
    columns: &ColumnMap,
    uid_column: &str,
) -> CompiledWhere {
    match predicate {
        None => CompiledWhere::empty(),
        Some(predicate) => compile_predicate(predicate, columns, uid_column),
    }
}

fn compile_predicate(predicate: &Predicate, columns: &ColumnMap, uid_column: &str) -> CompiledWhere {
    match predicate {
        Predicate::Uid(uid) => CompiledWhere {
            sql: format!("{uid_column} = ?"),
            params: vec![SqlValue::Text(uid.clone())],
        },
        Predicate::Eq { key, value } => {
            let column = columns.resolve(key);
            if value.is_null() {
                CompiledWhere {
                    sql: format!("{column} IS NULL"),
                    params: Vec::new(),
                }
            } else {
                CompiledWhere {
                    sql: format!("{column} = ?"),
                    params: vec![SqlValue::from_json(value)],
                }
            }
        }
        Predicate::Like { key, value } => CompiledWhere {
            sql: format!("{} LIKE ?", columns.resolve(key)),
            params: vec![SqlValue::Text(value.clone())],
        },
        Predicate::StartsWith { key, value } => CompiledWhere {
            sql: format!("{} LIKE ?", columns.resolve(key)),
            params: vec![SqlValue::Text(format!("{value}%"))],
        },
        Predicate::And(conditions) => join_children(conditions, " AND ", columns, uid_column),
        Predicate::Or(conditions) => join_children(conditions, " OR ", columns, uid_column),
    }
}

fn join_children(
    conditions: &[Predicate],
    separator: &str,
    columns: &ColumnMap,
    uid_column: &str,
) -> CompiledWhere {
    let children: Vec<CompiledWhere> = conditions
        .iter()
        .map(|child| compile_predicate(child, columns, uid_column))
        .filter(|child| !child.is_empty())
        .collect();

    let sql = children
        .iter()
        .map(|child| format!("({})", child.sql))
        .collect::<Vec<_>>()
        .join(separator);
    let params = children.into_iter().flat_map(|child| child.params).collect();

    CompiledWhere { sql, params }
}

impl Predicate {
    /// Parses the wire shape used by the call bus: a bare uid string, an
    /// object carrying `uid`, or a tagged `{op, ...}` object. Anything else
    /// is a typed error rather than a silent no-filter.
    pub fn from_value(value: &Value) -> Result<Self, EntityStoreError> {
        match value {
            Value::String(uid) => Ok(Self::Uid(uid.clone())),
            Value::Object(object) => {
                if let Some(uid) = object.get("uid").and_then(Value::as_str) {
                    return Ok(Self::Uid(uid.to_string()));
                }

                let op = object
                    .get("op")
                    .or_else(|| object.get("type"))
                    .and_then(Value::as_str);
                let key = object.get("key").and_then(Value::as_str);

                match (op, key) {
                    (Some("eq"), Some(key)) => Ok(Self::Eq {
                        key: key.to_string(),
                        value: object.get("value").cloned().unwrap_or(Value::Null),
                    }),
                    (Some("like"), Some(key)) => Ok(Self::Like {
                        key: key.to_string(),
                        value: require_string(object.get("value"))?,
                    }),
                    (Some("starts-with"), Some(key)) => Ok(Self::StartsWith {
                        key: key.to_string(),
                        value: require_string(object.get("value"))?,
                    }),
                    (Some("and"), _) => Ok(Self::And(parse_conditions(object.get("conditions"))?)),
                    (Some("or"), _) => Ok(Self::Or(parse_conditions(object.get("conditions"))?)),
                    _ => {
                        tracing::warn!(shape = %value, "unrecognized predicate shape");
                        Err(EntityStoreError::field_invalid("predicate"))
                    }
                }
            }
            _ => {
                tracing::warn!(shape = %value, "unrecognized predicate shape");
                Err(EntityStoreError::field_invalid("predicate"))
            }
        }
    }
}

fn require_string(value: Option<&Value>) -> Result<String, EntityStoreError> {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EntityStoreError::field_invalid("predicate"))
}

fn parse_conditions(value: Option<&Value>) -> Result<Vec<Predicate>, EntityStoreError> {
    let Some(Value::Array(items)) = value else {
        return Err(EntityStoreError::field_invalid("predicate"));
    };
    items.iter().map(Predicate::from_value).collect()
}
