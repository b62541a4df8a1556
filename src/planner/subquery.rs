//! Re-synthesis of a minimal upstream operation from one field subtree.
//!
//! A federated call to an upstream GraphQL service is constructed once at
//! plan time: the planner prints a fresh operation scoped to just the
//! forwarded field and its descendants, so nothing is re-parsed at request
//! time. Every argument, literals included, is lifted to a variable, and
//! the corresponding values travel as the fetch's argument list in the
//! same order the definitions are printed.

use crate::ast::{Field, FieldType, Operation, Schema, Selection};
use crate::error::PlanError;

/// The operation name used for every re-synthesized upstream operation.
pub(crate) const OPERATION_NAME: &str = "o";

/// Prints the minimal upstream operation for `field` and its descendants.
pub(crate) fn print_subquery(
    field: &Field,
    operation: &Operation,
    schema: &Schema,
    enclosing_type: &str,
) -> Result<String, PlanError> {
    let mut definitions = Vec::new();
    collect_variable_definitions(field, operation, schema, enclosing_type, &mut definitions)?;

    let mut out = String::from("query ");
    out.push_str(OPERATION_NAME);
    if !definitions.is_empty() {
        out.push('(');
        for (i, (name, ty)) in definitions.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push('$');
            out.push_str(name);
            out.push_str(": ");
            out.push_str(&ty.to_string());
        }
        out.push(')');
    }
    out.push('{');
    print_field(field, &mut out);
    out.push('}');
    Ok(out)
}

/// The upstream variable name one argument is rewritten to: the referenced
/// variable's name when the value is a variable, the argument's own name
/// otherwise.
fn variable_name<'a>(argument_name: &'a str, value: &'a crate::ast::LiteralValue) -> &'a str {
    value.as_variable().unwrap_or(argument_name)
}

fn collect_variable_definitions(
    field: &Field,
    operation: &Operation,
    schema: &Schema,
    enclosing_type: &str,
    definitions: &mut Vec<(String, FieldType)>,
) -> Result<(), PlanError> {
    let field_definition =
        schema
            .field(enclosing_type, &field.name)
            .ok_or_else(|| PlanError::UnknownField {
                type_name: enclosing_type.to_string(),
                field: field.name.clone(),
            })?;

    for argument in &field.arguments {
        let name = variable_name(&argument.name, &argument.value);
        if definitions.iter().any(|(existing, _)| existing == name) {
            continue;
        }
        // an operation-declared variable keeps its declared type; everything
        // else takes the argument's type from the schema
        let ty = match argument
            .value
            .as_variable()
            .and_then(|variable| operation.variable_definition(variable))
        {
            Some(definition) => definition.ty.clone(),
            None => field_definition
                .argument_type(&argument.name)
                .cloned()
                .ok_or_else(|| PlanError::UnknownArgument {
                    field: field.name.clone(),
                    argument: argument.name.clone(),
                })?,
        };
        definitions.push((name.to_string(), ty));
    }

    let inner_type = field_definition.field_type.inner_type_name();
    for selection in &field.selection_set {
        match selection {
            Selection::Field(child) => {
                if child.arguments.is_empty() && child.selection_set.is_empty() {
                    continue;
                }
                let type_name = inner_type.ok_or_else(|| PlanError::OperationSynthesis {
                    reason: format!(
                        "field '{}' selects into scalar type {}",
                        child.name, field_definition.field_type
                    ),
                })?;
                collect_variable_definitions(child, operation, schema, type_name, definitions)?;
            }
            Selection::InlineFragment(fragment) => {
                for selection in &fragment.selection_set {
                    if let Selection::Field(child) = selection {
                        if child.arguments.is_empty() && child.selection_set.is_empty() {
                            continue;
                        }
                        collect_variable_definitions(
                            child,
                            operation,
                            schema,
                            &fragment.type_condition,
                            definitions,
                        )?;
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_field(field: &Field, out: &mut String) {
    out.push_str(&field.name);
    if !field.arguments.is_empty() {
        out.push('(');
        for (i, argument) in field.arguments.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&argument.name);
            out.push_str(": $");
            out.push_str(variable_name(&argument.name, &argument.value));
        }
        out.push(')');
    }
    if !field.selection_set.is_empty() {
        out.push('{');
        print_selection_set(&field.selection_set, out);
        out.push('}');
    }
}

fn print_selection_set(selection_set: &[Selection], out: &mut String) {
    for (i, selection) in selection_set.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        match selection {
            Selection::Field(field) => print_field(field, out),
            Selection::InlineFragment(fragment) => {
                out.push_str("... on ");
                out.push_str(&fragment.type_condition);
                out.push('{');
                print_selection_set(&fragment.selection_set, out);
                out.push('}');
            }
        }
    }
}
