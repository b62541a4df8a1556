use crate::ast::{FieldType, OperationKind};
use crate::plan::ScalarTransform;
use std::collections::HashMap;
use std::sync::Arc;

/// The composed schema the planner resolves types and fields against.
///
/// Built programmatically by the composition collaborator; the engine only
/// reads it.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    query_type: String,
    mutation_type: Option<String>,
    subscription_type: Option<String>,
    types: HashMap<String, TypeDefinition>,
}

impl Schema {
    pub fn new(query_type: impl Into<String>) -> Self {
        Self {
            query_type: query_type.into(),
            ..Default::default()
        }
    }

    pub fn with_mutation_type(mut self, name: impl Into<String>) -> Self {
        self.mutation_type = Some(name.into());
        self
    }

    pub fn with_subscription_type(mut self, name: impl Into<String>) -> Self {
        self.subscription_type = Some(name.into());
        self
    }

    pub fn with_type(mut self, name: impl Into<String>, definition: TypeDefinition) -> Self {
        self.types.insert(name.into(), definition);
        self
    }

    /// The root type name serving the given operation kind, if any.
    pub fn root_type(&self, kind: OperationKind) -> Option<&str> {
        match kind {
            OperationKind::Query => Some(self.query_type.as_str()),
            OperationKind::Mutation => self.mutation_type.as_deref(),
            OperationKind::Subscription => self.subscription_type.as_deref(),
        }
    }

    pub fn type_definition(&self, name: &str) -> Option<&TypeDefinition> {
        self.types.get(name)
    }

    /// The definition of `field_name` on `type_name`, for objects and
    /// interfaces.
    pub fn field(&self, type_name: &str, field_name: &str) -> Option<&FieldDefinition> {
        match self.types.get(type_name)? {
            TypeDefinition::Object(object) | TypeDefinition::Interface(object) => {
                object.field(field_name)
            }
            _ => None,
        }
    }

    /// Whether selections can descend into the named type.
    pub fn is_composite(&self, name: &str) -> bool {
        matches!(
            self.types.get(name),
            Some(
                TypeDefinition::Object(_)
                    | TypeDefinition::Interface(_)
                    | TypeDefinition::Union(_)
            )
        )
    }
}

#[derive(Debug, Clone)]
pub enum TypeDefinition {
    Object(ObjectType),
    Interface(ObjectType),
    Union(UnionType),
    Scalar,
    Enum(EnumType),
}

/// Field container shared by object and interface types.
#[derive(Debug, Clone, Default)]
pub struct ObjectType {
    fields: HashMap<String, FieldDefinition>,
}

impl ObjectType {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        self.fields.insert(name.into(), definition);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.get(name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnionType {
    members: Vec<String>,
}

impl UnionType {
    pub fn new(members: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnumType {
    values: Vec<String>,
}

impl EnumType {
    pub fn new(values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }
}

/// One field of an object or interface type.
#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub field_type: FieldType,
    arguments: Vec<(String, FieldType)>,
    pub directives: FieldDirectives,
}

impl FieldDefinition {
    pub fn new(field_type: FieldType) -> Self {
        Self {
            field_type,
            arguments: Vec::new(),
            directives: FieldDirectives::default(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, ty: FieldType) -> Self {
        self.arguments.push((name.into(), ty));
        self
    }

    pub fn with_directives(mut self, directives: FieldDirectives) -> Self {
        self.directives = directives;
        self
    }

    pub fn argument_type(&self, name: &str) -> Option<&FieldType> {
        self.arguments
            .iter()
            .find(|(argument, _)| argument == name)
            .map(|(_, ty)| ty)
    }
}

/// Directive metadata the composition step attaches to a field.
///
/// These drive plan-time decisions the operation text alone cannot express:
/// list truncation and scalar post-processing.
#[derive(Debug, Clone, Default)]
pub struct FieldDirectives {
    /// Keep only the first N elements of a list-valued field.
    pub first: Option<usize>,

    /// Post-processing applied to the raw scalar before emission.
    pub transformation: Option<Arc<dyn ScalarTransform>>,
}

impl FieldDirectives {
    pub fn first(n: usize) -> Self {
        Self {
            first: Some(n),
            ..Default::default()
        }
    }

    pub fn transformation(transformation: Arc<dyn ScalarTransform>) -> Self {
        Self {
            transformation: Some(transformation),
            ..Default::default()
        }
    }
}
