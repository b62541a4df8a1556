//! Turns a normalized operation into an executable [`QueryPlan`].
//!
//! The planner walks the operation's selection sets against the composed
//! schema. At every field it consults the registry: a registered backend
//! contributes a fetch attached to the enclosing object, an unregistered
//! field renders pass-through from data the parent already resolved. The
//! walk is a single pass; sibling fetches collected on one object are
//! grouped into a parallel fetch.

pub(crate) mod subquery;

use crate::ast::{Field, FieldDirectives, FieldType, Operation, Schema, Selection};
use crate::datasource::{DataSourceRegistry, PlanningContext};
use crate::error::PlanError;
use crate::json_ext::Path;
use crate::plan::{
    Fetch, FieldNode, ListFilter, ListNode, ObjectNode, ParallelFetch, PlanNode, QueryPlan,
    SingleFetch, Skip, ValueNode, ValueType,
};
use serde_json_bytes::Value;
use tracing::debug;

/// Builds the plan for one operation.
///
/// Fails closed: any unknown type, field or argument aborts planning and no
/// partial plan is returned.
pub fn plan(
    schema: &Schema,
    operation: &Operation,
    registry: &DataSourceRegistry,
) -> Result<QueryPlan, PlanError> {
    let root_type =
        schema
            .root_type(operation.kind)
            .ok_or_else(|| PlanError::UnsupportedOperation {
                kind: operation.kind.to_string(),
            })?;
    debug!(
        kind = %operation.kind,
        root_type = root_type,
        "planning operation"
    );

    let walker = Walker {
        schema,
        operation,
        registry,
    };
    let mut root = walker.plan_selection_set(&operation.selection_set, root_type, None)?;
    root.operation_kind = Some(operation.kind);
    Ok(QueryPlan::new(root))
}

struct Walker<'a> {
    schema: &'a Schema,
    operation: &'a Operation,
    registry: &'a DataSourceRegistry,
}

impl Walker<'_> {
    /// Plans one selection set into an object node, collecting the fetches
    /// of every directly selected field onto that object.
    fn plan_selection_set(
        &self,
        selection_set: &[Selection],
        enclosing_type: &str,
        path: Option<Path>,
    ) -> Result<ObjectNode, PlanError> {
        let mut fields = Vec::new();
        let mut fetches = Vec::new();
        self.plan_selections(selection_set, enclosing_type, None, &mut fields, &mut fetches)?;

        let fetch = match fetches.len() {
            0 => None,
            1 => Some(Fetch::Single(fetches.remove(0))),
            _ => Some(Fetch::Parallel(ParallelFetch { fetches })),
        };
        Ok(ObjectNode {
            fields,
            fetch,
            path,
            operation_kind: None,
        })
    }

    /// Flattens fields and inline fragments into the field list of the
    /// object under construction. Fragment branches carry a discriminator
    /// check so only the matching branch renders.
    fn plan_selections(
        &self,
        selection_set: &[Selection],
        enclosing_type: &str,
        skip: Option<&Skip>,
        fields: &mut Vec<FieldNode>,
        fetches: &mut Vec<SingleFetch>,
    ) -> Result<(), PlanError> {
        for selection in selection_set {
            match selection {
                Selection::Field(field) => {
                    fields.push(self.plan_field(field, enclosing_type, skip, fetches)?);
                }
                Selection::InlineFragment(fragment) => {
                    if self.schema.type_definition(&fragment.type_condition).is_none() {
                        return Err(PlanError::UnknownType {
                            name: fragment.type_condition.clone(),
                        });
                    }
                    let branch_skip = Skip::IfNotEqual {
                        path: Path::key("__typename"),
                        value: Value::String(fragment.type_condition.as_str().into()),
                    };
                    self.plan_selections(
                        &fragment.selection_set,
                        &fragment.type_condition,
                        Some(&branch_skip),
                        fields,
                        fetches,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn plan_field(
        &self,
        field: &Field,
        enclosing_type: &str,
        skip: Option<&Skip>,
        fetches: &mut Vec<SingleFetch>,
    ) -> Result<FieldNode, PlanError> {
        // meta field resolved from the discriminator the backend injected
        if field.name == "__typename" {
            return Ok(FieldNode {
                name: field.response_name().into(),
                node: PlanNode::Value(ValueNode {
                    path: Some(Path::key("__typename")),
                    value_type: ValueType::String,
                    transformation: None,
                }),
                skip: skip.cloned(),
                has_resolved_data: false,
            });
        }

        let definition =
            self.schema
                .field(enclosing_type, &field.name)
                .ok_or_else(|| PlanError::UnknownField {
                    type_name: enclosing_type.to_string(),
                    field: field.name.clone(),
                })?;
        let definition = definition.clone();

        match self.registry.lookup(enclosing_type, &field.name) {
            Some(factory) => {
                debug!(
                    type_name = enclosing_type,
                    field = field.name.as_str(),
                    "field resolves through a registered data source"
                );
                let context = PlanningContext {
                    schema: self.schema,
                    operation: self.operation,
                    enclosing_type,
                };
                let mut arguments = crate::plan::ArgumentAccumulator::new();
                let planned =
                    factory
                        .create_planner()
                        .plan_field(&context, field, &mut arguments)?;

                fetches.push(SingleFetch {
                    invocation: crate::plan::DataSourceInvocation {
                        source: planned.source,
                        arguments: arguments.into_arguments(),
                    },
                    buffer: field.response_name().into(),
                });

                let node = self.plan_shape(
                    field,
                    &definition.field_type,
                    &definition.directives,
                    planned.root_path,
                )?;
                Ok(FieldNode {
                    name: field.response_name().into(),
                    node,
                    skip: skip.cloned(),
                    has_resolved_data: true,
                })
            }
            None => {
                let node = self.plan_shape(
                    field,
                    &definition.field_type,
                    &definition.directives,
                    Some(Path::key(&field.name)),
                )?;
                Ok(FieldNode {
                    name: field.response_name().into(),
                    node,
                    skip: skip.cloned(),
                    has_resolved_data: false,
                })
            }
        }
    }

    /// Chooses the node shape for a field from its declared type: list
    /// wrappers become list nodes, composite types descend into objects and
    /// everything else is a scalar leaf.
    fn plan_shape(
        &self,
        field: &Field,
        field_type: &FieldType,
        directives: &FieldDirectives,
        path: Option<Path>,
    ) -> Result<PlanNode, PlanError> {
        if field_type.is_list() {
            let item_type = field_type
                .list_item_type()
                .ok_or_else(|| PlanError::UnknownType {
                    name: field_type.to_string(),
                })?;
            let item = self.plan_shape(field, item_type, &FieldDirectives::default(), None)?;
            return Ok(PlanNode::List(ListNode {
                item: Box::new(item),
                path,
                filter: directives.first.map(ListFilter::First),
            }));
        }

        match field_type.inner_type_name() {
            Some(name) if self.schema.is_composite(name) => {
                let object = self.plan_selection_set(&field.selection_set, name, path)?;
                Ok(PlanNode::Object(object))
            }
            Some(name) if self.schema.type_definition(name).is_none() => {
                Err(PlanError::UnknownType {
                    name: name.to_string(),
                })
            }
            _ => Ok(PlanNode::Value(ValueNode {
                path,
                value_type: scalar_value_type(field_type),
                transformation: directives.transformation.clone(),
            })),
        }
    }
}

fn scalar_value_type(field_type: &FieldType) -> ValueType {
    match field_type {
        FieldType::NonNull(inner) => scalar_value_type(inner),
        FieldType::Int => ValueType::Int,
        FieldType::Float => ValueType::Float,
        FieldType::Boolean => ValueType::Boolean,
        // custom scalars and enums serialize as strings
        _ => ValueType::String,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{
        FieldArgument, FieldDefinition, LiteralValue, ObjectType, OperationKind, TypeDefinition,
    };
    use crate::context::Context;
    use crate::datasource::{
        DataSource, DataSourcePlannerFactory, DataSourcePlanning, Instruction, PlannedDataSource,
    };
    use crate::error::FetchError;
    use crate::plan::ResolvedArgument;
    use async_trait::async_trait;
    use std::sync::Arc;

    #[derive(Debug)]
    struct NullSource;

    #[async_trait]
    impl DataSource for NullSource {
        async fn resolve(
            &self,
            _context: &Context,
            _arguments: &[ResolvedArgument],
            sink: &mut Vec<u8>,
        ) -> Result<Instruction, FetchError> {
            sink.extend_from_slice(b"null");
            Ok(Instruction::CloseAfterOneShot)
        }
    }

    struct NullPlanner;

    impl DataSourcePlanning for NullPlanner {
        fn plan_field(
            self: Box<Self>,
            _context: &PlanningContext<'_>,
            _field: &Field,
            _arguments: &mut crate::plan::ArgumentAccumulator,
        ) -> Result<PlannedDataSource, PlanError> {
            Ok(PlannedDataSource {
                source: Arc::new(NullSource),
                root_path: None,
            })
        }
    }

    struct NullFactory;

    impl DataSourcePlannerFactory for NullFactory {
        fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
            Box::new(NullPlanner)
        }
    }

    fn schema() -> Schema {
        Schema::new("Query")
            .with_type(
                "Query",
                TypeDefinition::Object(
                    ObjectType::new()
                        .with_field(
                            "country",
                            FieldDefinition::new(FieldType::Named("Country".to_string()))
                                .with_argument(
                                    "code",
                                    FieldType::NonNull(Box::new(FieldType::String)),
                                ),
                        )
                        .with_field(
                            "countries",
                            FieldDefinition::new(FieldType::List(Box::new(FieldType::Named(
                                "Country".to_string(),
                            )))),
                        ),
                ),
            )
            .with_type(
                "Country",
                TypeDefinition::Object(
                    ObjectType::new()
                        .with_field("code", FieldDefinition::new(FieldType::String))
                        .with_field("name", FieldDefinition::new(FieldType::String))
                        .with_field("population", FieldDefinition::new(FieldType::Int)),
                ),
            )
    }

    fn country_operation() -> Operation {
        Operation {
            kind: OperationKind::Query,
            name: None,
            variable_definitions: vec![],
            selection_set: vec![Selection::Field(Field {
                alias: None,
                name: "country".to_string(),
                arguments: vec![FieldArgument {
                    name: "code".to_string(),
                    value: LiteralValue::String("DE".to_string()),
                }],
                selection_set: vec![
                    Selection::Field(Field {
                        alias: None,
                        name: "name".to_string(),
                        arguments: vec![],
                        selection_set: vec![],
                    }),
                    Selection::Field(Field {
                        alias: None,
                        name: "population".to_string(),
                        arguments: vec![],
                        selection_set: vec![],
                    }),
                ],
            })],
        }
    }

    #[test]
    fn registered_field_gets_a_fetch_and_a_buffer() {
        let mut registry = DataSourceRegistry::new();
        registry.register("Query", "country", Arc::new(NullFactory));

        let plan = plan(&schema(), &country_operation(), &registry).unwrap();
        let root = match &plan.root {
            PlanNode::Object(object) => object,
            other => panic!("expected an object root, got {:?}", other),
        };
        assert_eq!(root.operation_kind, Some(OperationKind::Query));
        match &root.fetch {
            Some(Fetch::Single(single)) => assert_eq!(single.buffer.as_str(), "country"),
            other => panic!("expected a single fetch, got {:?}", other),
        }
        assert_eq!(root.fields.len(), 1);
        assert!(root.fields[0].has_resolved_data);
        match &root.fields[0].node {
            PlanNode::Object(country) => {
                assert!(country.fetch.is_none());
                assert_eq!(country.fields.len(), 2);
                assert_eq!(country.fields[0].name.as_str(), "name");
                assert_eq!(country.fields[1].name.as_str(), "population");
            }
            other => panic!("expected an object node, got {:?}", other),
        }
    }

    #[test]
    fn unregistered_field_renders_pass_through() {
        let plan = plan(&schema(), &country_operation(), &DataSourceRegistry::new()).unwrap();
        let root = match &plan.root {
            PlanNode::Object(object) => object,
            other => panic!("expected an object root, got {:?}", other),
        };
        assert!(root.fetch.is_none());
        assert!(!root.fields[0].has_resolved_data);
        match &root.fields[0].node {
            PlanNode::Object(country) => {
                assert_eq!(country.path, Some(Path::key("country")));
            }
            other => panic!("expected an object node, got {:?}", other),
        }
    }

    #[test]
    fn sibling_fetches_group_into_a_parallel_fetch() {
        let mut registry = DataSourceRegistry::new();
        registry.register("Query", "country", Arc::new(NullFactory));
        registry.register("Query", "countries", Arc::new(NullFactory));

        let operation = Operation {
            selection_set: vec![
                Selection::Field(Field {
                    alias: None,
                    name: "country".to_string(),
                    arguments: vec![FieldArgument {
                        name: "code".to_string(),
                        value: LiteralValue::String("DE".to_string()),
                    }],
                    selection_set: vec![Selection::Field(Field {
                        alias: None,
                        name: "name".to_string(),
                        arguments: vec![],
                        selection_set: vec![],
                    })],
                }),
                Selection::Field(Field {
                    alias: None,
                    name: "countries".to_string(),
                    arguments: vec![],
                    selection_set: vec![Selection::Field(Field {
                        alias: None,
                        name: "code".to_string(),
                        arguments: vec![],
                        selection_set: vec![],
                    })],
                }),
            ],
            ..country_operation()
        };

        let plan = plan(&schema(), &operation, &registry).unwrap();
        let root = match &plan.root {
            PlanNode::Object(object) => object,
            other => panic!("expected an object root, got {:?}", other),
        };
        match &root.fetch {
            Some(Fetch::Parallel(parallel)) => {
                assert_eq!(parallel.fetches.len(), 2);
                assert_eq!(parallel.fetches[0].buffer.as_str(), "country");
                assert_eq!(parallel.fetches[1].buffer.as_str(), "countries");
            }
            other => panic!("expected a parallel fetch, got {:?}", other),
        }
    }

    #[test]
    fn list_fields_plan_as_list_nodes() {
        let plan = plan(
            &schema(),
            &Operation {
                selection_set: vec![Selection::Field(Field {
                    alias: None,
                    name: "countries".to_string(),
                    arguments: vec![],
                    selection_set: vec![Selection::Field(Field {
                        alias: None,
                        name: "code".to_string(),
                        arguments: vec![],
                        selection_set: vec![],
                    })],
                })],
                ..country_operation()
            },
            &DataSourceRegistry::new(),
        )
        .unwrap();

        let root = match &plan.root {
            PlanNode::Object(object) => object,
            other => panic!("expected an object root, got {:?}", other),
        };
        match &root.fields[0].node {
            PlanNode::List(list) => {
                assert_eq!(list.path, Some(Path::key("countries")));
                assert!(matches!(list.item.as_ref(), PlanNode::Object(_)));
            }
            other => panic!("expected a list node, got {:?}", other),
        }
    }

    #[test]
    fn inline_fragments_attach_discriminator_skips() {
        let schema = schema().with_type(
            "SearchResult",
            TypeDefinition::Union(crate::ast::UnionType::new(["Country"])),
        );
        let schema = {
            let query = TypeDefinition::Object(ObjectType::new().with_field(
                "search",
                FieldDefinition::new(FieldType::Named("SearchResult".to_string())),
            ));
            schema.with_type("Query", query)
        };

        let operation = Operation {
            selection_set: vec![Selection::Field(Field {
                alias: None,
                name: "search".to_string(),
                arguments: vec![],
                selection_set: vec![Selection::InlineFragment(crate::ast::InlineFragment {
                    type_condition: "Country".to_string(),
                    selection_set: vec![Selection::Field(Field {
                        alias: None,
                        name: "name".to_string(),
                        arguments: vec![],
                        selection_set: vec![],
                    })],
                })],
            })],
            ..country_operation()
        };

        let plan = plan(&schema, &operation, &DataSourceRegistry::new()).unwrap();
        let root = match &plan.root {
            PlanNode::Object(object) => object,
            other => panic!("expected an object root, got {:?}", other),
        };
        let search = match &root.fields[0].node {
            PlanNode::Object(object) => object,
            other => panic!("expected an object node, got {:?}", other),
        };
        let skip = search.fields[0].skip.as_ref().expect("a branch skip");
        let Skip::IfNotEqual { path, value } = skip;
        assert_eq!(path.to_string(), "__typename");
        assert_eq!(value, &Value::String("Country".into()));
    }

    #[test]
    fn unknown_field_aborts_planning() {
        let operation = Operation {
            selection_set: vec![Selection::Field(Field {
                alias: None,
                name: "nope".to_string(),
                arguments: vec![],
                selection_set: vec![],
            })],
            ..country_operation()
        };
        let err = plan(&schema(), &operation, &DataSourceRegistry::new()).unwrap_err();
        assert!(matches!(err, PlanError::UnknownField { field, .. } if field == "nope"));
    }

    #[test]
    fn mutation_without_root_type_is_unsupported() {
        let operation = Operation {
            kind: OperationKind::Mutation,
            ..country_operation()
        };
        let err = plan(&schema(), &operation, &DataSourceRegistry::new()).unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedOperation { kind } if kind == "mutation"));
    }
}
