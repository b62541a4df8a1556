//! The normalized operation and schema model the planner consumes.
//!
//! Parsing, validation and normalization of GraphQL text happen upstream of
//! this crate; the planner receives an already-validated operation with
//! fragments inlined and only the selected operation retained. The types
//! here are the contract with that collaborator, and deserialize from the
//! structured form the normalizer emits.

mod field_type;
mod schema;

pub use field_type::FieldType;
pub use schema::{
    EnumType, FieldDefinition, FieldDirectives, ObjectType, Schema, TypeDefinition, UnionType,
};

use serde::{Deserialize, Serialize};
use std::fmt;

/// The GraphQL operation kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl Default for OperationKind {
    fn default() -> Self {
        OperationKind::Query
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Query => write!(f, "query"),
            OperationKind::Mutation => write!(f, "mutation"),
            OperationKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// One normalized executable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    #[serde(default)]
    pub kind: OperationKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub variable_definitions: Vec<VariableDefinition>,

    pub selection_set: Vec<Selection>,
}

impl Operation {
    /// The definition for an operation variable, if the operation declares it.
    pub fn variable_definition(&self, name: &str) -> Option<&VariableDefinition> {
        self.variable_definitions.iter().find(|def| def.name == name)
    }
}

/// A variable declared by the operation, e.g. `$code: String!`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableDefinition {
    pub name: String,

    #[serde(rename = "type")]
    pub ty: FieldType,
}

/// A selection within a selection set.
///
/// Fragments are already inlined by the normalizer, so named fragment
/// spreads never appear here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", tag = "kind")]
pub enum Selection {
    /// A field selection.
    Field(Field),

    /// An inline fragment selection.
    InlineFragment(InlineFragment),
}

/// A field selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Field {
    /// An optional alias for the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,

    /// The name of the field.
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<FieldArgument>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selection_set: Vec<Selection>,
}

impl Field {
    /// The key this field appears under in the response.
    pub fn response_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A single `name: value` argument on a field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldArgument {
    pub name: String,
    pub value: LiteralValue,
}

/// An inline fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineFragment {
    /// The concrete type the enclosed selections apply to.
    pub type_condition: String,

    pub selection_set: Vec<Selection>,
}

/// An input value as written in the operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum LiteralValue {
    Variable(String),
    String(String),
    Int(i64),
    Float(f64),
    Boolean(bool),
    Null,
    List(Vec<LiteralValue>),
    Object(Vec<(String, LiteralValue)>),
}

impl LiteralValue {
    /// The referenced variable name, when this value is a variable.
    pub fn as_variable(&self) -> Option<&str> {
        match self {
            LiteralValue::Variable(name) => Some(name),
            _ => None,
        }
    }

    /// Converts a literal into raw JSON. Returns `None` for variables and
    /// for composites containing variables; those resolve at call time.
    pub fn to_json(&self) -> Option<serde_json_bytes::Value> {
        use serde_json_bytes::Value;
        match self {
            LiteralValue::Variable(_) => None,
            LiteralValue::String(s) => Some(Value::String(s.as_str().into())),
            LiteralValue::Int(i) => Some(Value::Number((*i).into())),
            LiteralValue::Float(f) => Some(
                serde_json::Number::from_f64(*f).map_or(Value::Null, Value::Number),
            ),
            LiteralValue::Boolean(b) => Some(Value::Bool(*b)),
            LiteralValue::Null => Some(Value::Null),
            LiteralValue::List(items) => items
                .iter()
                .map(LiteralValue::to_json)
                .collect::<Option<Vec<_>>>()
                .map(Value::Array),
            LiteralValue::Object(entries) => {
                let mut members = serde_json_bytes::Map::new();
                for (key, value) in entries {
                    members.insert(
                        serde_json_bytes::ByteString::from(key.as_str()),
                        value.to_json()?,
                    );
                }
                Some(Value::Object(members))
            }
        }
    }
}
