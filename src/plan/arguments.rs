//! Typed argument bindings and their call-time resolution.

use crate::context::Context;
use crate::error::FetchError;
use crate::json_ext::{Object, Path, ValueExt};
use serde_json_bytes::{ByteString, Value};

/// A single argument binding collected at plan time.
///
/// `Static` is fixed when the plan is built; the other kinds resolve
/// immediately before each backend call.
#[derive(Debug, Clone)]
pub enum Argument {
    /// A name/value pair fixed at plan-build time, e.g. a configured
    /// upstream URL or a pre-synthesized operation text.
    Static { name: ByteString, value: Value },

    /// Resolves from the request's variable map.
    ContextVariable {
        name: ByteString,
        variable: ByteString,
    },

    /// Resolves by selecting into the already-resolved parent data at the
    /// current tree position; how a child fetch consumes a parent's result.
    ObjectVariable { name: ByteString, path: Path },

    /// An ordered group of arguments, e.g. a header list.
    List {
        name: ByteString,
        arguments: Vec<Argument>,
    },
}

impl Argument {
    pub fn name(&self) -> &ByteString {
        match self {
            Argument::Static { name, .. }
            | Argument::ContextVariable { name, .. }
            | Argument::ObjectVariable { name, .. }
            | Argument::List { name, .. } => name,
        }
    }
}

/// An argument with every binding substituted down to a concrete value.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedArgument {
    pub name: ByteString,
    pub value: Value,
}

/// Resolves `arguments` against the request context and the current parent
/// data.
///
/// Output order matches input order exactly; backends depending on
/// positional variable substitution rely on this. Resolution is
/// deterministic: the same inputs always produce the same list.
pub fn resolve_arguments(
    arguments: &[Argument],
    context: &Context,
    data: &Value,
) -> Result<Vec<ResolvedArgument>, FetchError> {
    arguments
        .iter()
        .map(|argument| resolve_argument(argument, context, data))
        .collect()
}

fn resolve_argument(
    argument: &Argument,
    context: &Context,
    data: &Value,
) -> Result<ResolvedArgument, FetchError> {
    match argument {
        Argument::Static { name, value } => Ok(ResolvedArgument {
            name: name.clone(),
            value: value.clone(),
        }),
        Argument::ContextVariable { name, variable } => {
            let value = context
                .variable(variable.as_str())
                .cloned()
                .ok_or_else(|| FetchError::MissingVariable {
                    name: variable.as_str().to_string(),
                })?;
            Ok(ResolvedArgument {
                name: name.clone(),
                value,
            })
        }
        Argument::ObjectVariable { name, path } => {
            let value = data
                .get_path(path)
                .cloned()
                .ok_or_else(|| FetchError::PathNotFound {
                    path: path.to_string(),
                })?;
            Ok(ResolvedArgument {
                name: name.clone(),
                value,
            })
        }
        Argument::List { name, arguments } => {
            let mut members = Object::default();
            for member in arguments {
                let resolved = resolve_argument(member, context, data)?;
                members.insert(resolved.name, resolved.value);
            }
            Ok(ResolvedArgument {
                name: name.clone(),
                value: Value::Object(members),
            })
        }
    }
}

/// Finds a resolved argument by name.
pub fn argument_value<'a>(arguments: &'a [ResolvedArgument], name: &str) -> Option<&'a Value> {
    arguments
        .iter()
        .find(|argument| argument.name.as_str() == name)
        .map(|argument| &argument.value)
}

/// Collects the arguments one backend planner produces while observing the
/// walk of a single field occurrence.
///
/// Planner instances are created per occurrence and discarded afterwards;
/// the accumulator makes the produced argument order explicit instead of
/// hiding it in planner state.
#[derive(Debug, Default)]
pub struct ArgumentAccumulator {
    arguments: Vec<Argument>,
}

impl ArgumentAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, argument: Argument) {
        self.arguments.push(argument);
    }

    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    pub fn into_arguments(self) -> Vec<Argument> {
        self.arguments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json_bytes::json;

    fn context() -> Context {
        Context::new(json!({"code": "DE"}).as_object().cloned().unwrap())
    }

    #[test]
    fn resolves_all_kinds_in_order() {
        let arguments = vec![
            Argument::Static {
                name: "url".into(),
                value: json!("http://upstream.local"),
            },
            Argument::ContextVariable {
                name: "code".into(),
                variable: "code".into(),
            },
            Argument::ObjectVariable {
                name: "id".into(),
                path: Path::from("user.id"),
            },
            Argument::List {
                name: "headers".into(),
                arguments: vec![Argument::Static {
                    name: "X-Api-Key".into(),
                    value: json!("secret"),
                }],
            },
        ];
        let data = json!({"user": {"id": 7}});

        let resolved = resolve_arguments(&arguments, &context(), &data).unwrap();

        assert_eq!(
            resolved
                .iter()
                .map(|argument| argument.name.as_str())
                .collect::<Vec<_>>(),
            vec!["url", "code", "id", "headers"]
        );
        assert_eq!(argument_value(&resolved, "code"), Some(&json!("DE")));
        assert_eq!(argument_value(&resolved, "id"), Some(&json!(7)));
        assert_eq!(
            argument_value(&resolved, "headers"),
            Some(&json!({"X-Api-Key": "secret"}))
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let arguments = vec![
            Argument::ContextVariable {
                name: "code".into(),
                variable: "code".into(),
            },
            Argument::ObjectVariable {
                name: "id".into(),
                path: Path::from("id"),
            },
        ];
        let data = json!({"id": "abc"});

        let first = resolve_arguments(&arguments, &context(), &data).unwrap();
        let second = resolve_arguments(&arguments, &context(), &data).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn missing_variable_is_fatal() {
        let arguments = vec![Argument::ContextVariable {
            name: "missing".into(),
            variable: "missing".into(),
        }];
        let err = resolve_arguments(&arguments, &context(), &Value::Null).unwrap_err();
        assert!(matches!(err, FetchError::MissingVariable { name } if name == "missing"));
    }

    #[test]
    fn dead_object_path_is_fatal() {
        let arguments = vec![Argument::ObjectVariable {
            name: "id".into(),
            path: Path::from("user.id"),
        }];
        let err = resolve_arguments(&arguments, &context(), &json!({})).unwrap_err();
        assert!(matches!(err, FetchError::PathNotFound { path } if path == "user.id"));
    }
}
