//! Drives a [`QueryPlan`] against live backends, streaming JSON output.
//!
//! Execution never buffers the whole response: object and list punctuation
//! is written as the tree is walked, and scalar leaves are written the
//! moment their value is known. Raw fetch results are parked in named
//! buffers on the object that requested them, so sibling fetches can
//! complete in any order while fields still render in declaration order.

use crate::context::Context;
use crate::error::FetchError;
use crate::json_ext::Path;
use crate::plan::{
    resolve_arguments, Fetch, ListFilter, ListNode, ObjectNode, PlanNode, QueryPlan, SingleFetch,
    ValueNode, ValueType,
};
use crate::datasource::Instruction;
use crate::json_ext::ValueExt;
use futures::future::{try_join_all, BoxFuture};
use futures::FutureExt;
use serde_json_bytes::{ByteString, Value};
use std::collections::HashMap;
use std::io::Write;
use tracing::{Instrument, debug};

impl QueryPlan {
    /// Executes the plan once, writing one complete JSON response to the
    /// sink.
    ///
    /// The returned instruction is the merge of every fetched source's
    /// instruction; callers driving streaming plans act on it through
    /// [`resolve_stream`]. Bytes already written are not retracted on
    /// error.
    pub async fn execute<W: Write + Send>(
        &self,
        context: &Context,
        sink: &mut W,
    ) -> Result<Instruction, FetchError> {
        sink.write_all(b"{\"data\":")?;
        let instruction = resolve_node(&self.root, context, &Value::Null, sink).await?;
        sink.write_all(b"}")?;
        Ok(instruction)
    }
}

/// Re-executes a streaming plan until a source ends the stream, sending
/// each complete response downstream.
///
/// One-shot completion emits the final response and returns; a closed
/// connection ends the stream without emitting. An execution error ends
/// the stream and is surfaced to the caller.
pub async fn resolve_stream(
    plan: &QueryPlan,
    context: &Context,
    sender: tokio::sync::mpsc::Sender<Vec<u8>>,
) -> Result<(), FetchError> {
    loop {
        let mut output = Vec::new();
        let instruction = plan.execute(context, &mut output).await?;
        match instruction {
            Instruction::KeepStreamAlive => {
                sender
                    .send(output)
                    .await
                    .map_err(|_| FetchError::SinkError {
                        reason: "stream consumer dropped".to_string(),
                    })?;
            }
            Instruction::CloseAfterOneShot => {
                let _ = sender.send(output).await;
                return Ok(());
            }
            Instruction::CloseConnection => {
                debug!("stream closed by source");
                return Ok(());
            }
        }
    }
}

fn select<'v>(data: &'v Value, path: &Option<Path>) -> Option<&'v Value> {
    match path {
        Some(path) => data.get_path(path),
        None => Some(data),
    }
}

fn resolve_node<'a, W: Write + Send>(
    node: &'a PlanNode,
    context: &'a Context,
    data: &'a Value,
    sink: &'a mut W,
) -> BoxFuture<'a, Result<Instruction, FetchError>> {
    async move {
        match node {
            PlanNode::Object(object) => resolve_object(object, context, data, sink).await,
            PlanNode::List(list) => resolve_list(list, context, data, sink).await,
            PlanNode::Value(value) => resolve_value(value, data, sink),
        }
    }
    .boxed()
}

async fn resolve_object<W: Write + Send>(
    object: &ObjectNode,
    context: &Context,
    data: &Value,
    sink: &mut W,
) -> Result<Instruction, FetchError> {
    // a path selects into inherited data; without one the object renders
    // from whatever it was given, fetches included, even at the null root
    let data = match &object.path {
        Some(path) => match data.get_path(path) {
            Some(Value::Null) | None => {
                sink.write_all(b"null")?;
                return Ok(Instruction::CloseAfterOneShot);
            }
            Some(data) => data,
        },
        None => data,
    };

    // skips are decided on the enclosing object's data, before any buffer
    // switch; a non-matching branch's fetch is never issued
    let skipped: Vec<&ByteString> = object
        .fields
        .iter()
        .filter(|field| {
            field.has_resolved_data
                && field
                    .skip
                    .as_ref()
                    .map(|skip| skip.evaluate(data))
                    .unwrap_or(false)
        })
        .map(|field| &field.name)
        .collect();

    let mut buffers: HashMap<ByteString, Value> = HashMap::new();
    let mut instruction = Instruction::CloseAfterOneShot;
    if let Some(fetch) = &object.fetch {
        instruction = execute_fetch(fetch, context, data, &skipped, &mut buffers).await?;
    }

    sink.write_all(b"{")?;
    let mut first = true;
    for field in &object.fields {
        if let Some(skip) = &field.skip {
            if skip.evaluate(data) {
                continue;
            }
        }
        let field_data = if field.has_resolved_data {
            buffers.get(&field.name).unwrap_or(&Value::Null)
        } else {
            data
        };

        if !first {
            sink.write_all(b",")?;
        }
        first = false;
        serde_json::to_writer(&mut *sink, &field.name).map_err(|err| FetchError::SinkError {
            reason: err.to_string(),
        })?;
        sink.write_all(b":")?;

        let child = resolve_node(&field.node, context, field_data, sink).await?;
        instruction = instruction.merge(child);
    }
    sink.write_all(b"}")?;
    Ok(instruction)
}

async fn resolve_list<W: Write + Send>(
    list: &ListNode,
    context: &Context,
    data: &Value,
    sink: &mut W,
) -> Result<Instruction, FetchError> {
    let items = match select(data, &list.path) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => {
            sink.write_all(b"null")?;
            return Ok(Instruction::CloseAfterOneShot);
        }
        Some(_) => {
            return Err(FetchError::ValueTypeMismatch {
                path: list
                    .path
                    .as_ref()
                    .map(Path::to_string)
                    .unwrap_or_default(),
                expected: "List".to_string(),
            })
        }
    };
    let limit = match list.filter {
        Some(ListFilter::First(n)) => n.min(items.len()),
        None => items.len(),
    };

    sink.write_all(b"[")?;
    let mut instruction = Instruction::CloseAfterOneShot;
    for (i, item) in items.iter().take(limit).enumerate() {
        if i > 0 {
            sink.write_all(b",")?;
        }
        let child = resolve_node(&list.item, context, item, sink).await?;
        instruction = instruction.merge(child);
    }
    sink.write_all(b"]")?;
    Ok(instruction)
}

fn resolve_value<W: Write>(
    node: &ValueNode,
    data: &Value,
    sink: &mut W,
) -> Result<Instruction, FetchError> {
    let selected = match select(data, &node.path) {
        Some(value) => value.clone(),
        None => Value::Null,
    };
    let value = match &node.transformation {
        Some(transformation) => transformation.apply(selected)?,
        None => selected,
    };

    let coercible = match &value {
        Value::Null => true,
        Value::String(_) => node.value_type == ValueType::String,
        Value::Number(number) => match node.value_type {
            ValueType::Int => number.is_i64() || number.is_u64(),
            ValueType::Float => true,
            _ => false,
        },
        Value::Bool(_) => node.value_type == ValueType::Boolean,
        _ => false,
    };
    if !coercible {
        return Err(FetchError::ValueTypeMismatch {
            path: node
                .path
                .as_ref()
                .map(Path::to_string)
                .unwrap_or_default(),
            expected: node.value_type.to_string(),
        });
    }

    serde_json::to_writer(&mut *sink, &value).map_err(|err| FetchError::SinkError {
        reason: err.to_string(),
    })?;
    Ok(Instruction::CloseAfterOneShot)
}

async fn execute_fetch(
    fetch: &Fetch,
    context: &Context,
    data: &Value,
    skipped: &[&ByteString],
    buffers: &mut HashMap<ByteString, Value>,
) -> Result<Instruction, FetchError> {
    match fetch {
        Fetch::Single(single) => {
            if skipped.contains(&&single.buffer) {
                return Ok(Instruction::CloseAfterOneShot);
            }
            let (buffer, value, instruction) = execute_single(single, context, data).await?;
            buffers.insert(buffer, value);
            Ok(instruction)
        }
        Fetch::Parallel(parallel) => {
            // all siblings must land before any field renders; the first
            // error aborts the remaining fetches
            let results = try_join_all(
                parallel
                    .fetches
                    .iter()
                    .filter(|single| !skipped.contains(&&single.buffer))
                    .map(|single| execute_single(single, context, data)),
            )
            .await?;
            let mut instruction = Instruction::CloseAfterOneShot;
            for (buffer, value, fetched) in results {
                buffers.insert(buffer, value);
                instruction = instruction.merge(fetched);
            }
            Ok(instruction)
        }
    }
}

async fn execute_single(
    fetch: &SingleFetch,
    context: &Context,
    data: &Value,
) -> Result<(ByteString, Value, Instruction), FetchError> {
    let arguments = resolve_arguments(&fetch.invocation.arguments, context, data)?;
    let mut raw = Vec::new();
    let instruction = fetch
        .invocation
        .source
        .resolve(context, &arguments, &mut raw)
        .instrument(tracing::info_span!(
            "fetch",
            buffer = fetch.buffer.as_str()
        ))
        .await?;

    let value = if raw.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&raw).map_err(|err| FetchError::MalformedResponse {
            reason: err.to_string(),
        })?
    };
    Ok((fetch.buffer.clone(), value, instruction))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasource::DataSource;
    use crate::plan::{
        Argument, DataSourceInvocation, FieldNode, ParallelFetch, ResolvedArgument, Skip,
    };
    use async_trait::async_trait;
    use serde_json_bytes::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct FixedSource {
        data: Value,
        instruction: Instruction,
        calls: AtomicUsize,
    }

    impl FixedSource {
        fn new(data: Value) -> Self {
            Self {
                data,
                instruction: Instruction::CloseAfterOneShot,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DataSource for FixedSource {
        async fn resolve(
            &self,
            _context: &Context,
            _arguments: &[ResolvedArgument],
            sink: &mut Vec<u8>,
        ) -> Result<Instruction, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            serde_json::to_writer(&mut *sink, &self.data).map_err(|err| {
                FetchError::SinkError {
                    reason: err.to_string(),
                }
            })?;
            Ok(self.instruction)
        }
    }

    fn fetched_field(name: &str, node: PlanNode) -> FieldNode {
        FieldNode {
            name: name.into(),
            node,
            skip: None,
            has_resolved_data: true,
        }
    }

    fn value_field(name: &str, path: &str, value_type: ValueType) -> FieldNode {
        FieldNode {
            name: name.into(),
            node: PlanNode::Value(ValueNode {
                path: Some(Path::from(path)),
                value_type,
                transformation: None,
            }),
            skip: None,
            has_resolved_data: false,
        }
    }

    fn single_fetch(name: &str, source: Arc<dyn DataSource>) -> SingleFetch {
        SingleFetch {
            invocation: DataSourceInvocation {
                source,
                arguments: vec![],
            },
            buffer: name.into(),
        }
    }

    async fn run(plan: &QueryPlan) -> (String, Instruction) {
        let context = Context::new(Default::default());
        let mut sink = Vec::new();
        let instruction = plan.execute(&context, &mut sink).await.unwrap();
        (String::from_utf8(sink).unwrap(), instruction)
    }

    #[tokio::test]
    async fn renders_fetched_object_fields_in_declaration_order() {
        let source = Arc::new(FixedSource::new(json!({
            "country": {"name": "Germany", "code": "DE"}
        })));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "country",
                PlanNode::Object(ObjectNode {
                    fields: vec![
                        value_field("code", "code", ValueType::String),
                        value_field("name", "name", ValueType::String),
                    ],
                    fetch: None,
                    path: Some(Path::key("country")),
                    operation_kind: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("country", source))),
            path: None,
            operation_kind: None,
        });

        let (output, instruction) = run(&plan).await;
        assert_eq!(
            output,
            r#"{"data":{"country":{"code":"DE","name":"Germany"}}}"#
        );
        assert_eq!(instruction, Instruction::CloseAfterOneShot);
    }

    #[tokio::test]
    async fn root_fetch_resolves_from_empty_initial_data() {
        let source = Arc::new(FixedSource::new(json!({"x": 1})));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "x",
                PlanNode::Value(ValueNode {
                    path: Some(Path::key("x")),
                    value_type: ValueType::Int,
                    transformation: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("x", source))),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(output, r#"{"data":{"x":1}}"#);
    }

    #[tokio::test]
    async fn branch_skips_read_the_enclosing_object_data() {
        let outer = Arc::new(FixedSource::new(json!({"__typename": "A"})));
        let matching = Arc::new(FixedSource::new(json!({"detail": "x"})));
        let unmatched = Arc::new(FixedSource::new(json!({"other": "y"})));

        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "result",
                PlanNode::Object(ObjectNode {
                    fields: vec![
                        FieldNode {
                            skip: Some(Skip::IfNotEqual {
                                path: Path::key("__typename"),
                                value: json!("A"),
                            }),
                            ..fetched_field(
                                "detail",
                                PlanNode::Value(ValueNode {
                                    path: Some(Path::key("detail")),
                                    value_type: ValueType::String,
                                    transformation: None,
                                }),
                            )
                        },
                        FieldNode {
                            skip: Some(Skip::IfNotEqual {
                                path: Path::key("__typename"),
                                value: json!("B"),
                            }),
                            ..fetched_field(
                                "other",
                                PlanNode::Value(ValueNode {
                                    path: Some(Path::key("other")),
                                    value_type: ValueType::String,
                                    transformation: None,
                                }),
                            )
                        },
                    ],
                    fetch: Some(Fetch::Parallel(ParallelFetch {
                        fetches: vec![
                            single_fetch("detail", matching.clone()),
                            single_fetch("other", unmatched.clone()),
                        ],
                    })),
                    path: None,
                    operation_kind: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("result", outer))),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(output, r#"{"data":{"result":{"detail":"x"}}}"#);
        assert_eq!(matching.calls.load(Ordering::SeqCst), 1);
        // the non-matching branch never reaches its backend
        assert_eq!(unmatched.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn parallel_fetches_fill_independent_buffers() {
        let first = Arc::new(FixedSource::new(json!({"a": 1})));
        let second = Arc::new(FixedSource::new(json!({"b": 2})));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![
                fetched_field(
                    "left",
                    PlanNode::Value(ValueNode {
                        path: Some(Path::key("a")),
                        value_type: ValueType::Int,
                        transformation: None,
                    }),
                ),
                fetched_field(
                    "right",
                    PlanNode::Value(ValueNode {
                        path: Some(Path::key("b")),
                        value_type: ValueType::Int,
                        transformation: None,
                    }),
                ),
            ],
            fetch: Some(Fetch::Parallel(ParallelFetch {
                fetches: vec![single_fetch("left", first), single_fetch("right", second)],
            })),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(output, r#"{"data":{"left":1,"right":2}}"#);
    }

    #[tokio::test]
    async fn parallel_fetch_failure_aborts_the_execution() {
        #[derive(Debug)]
        struct FailingSource;

        #[async_trait]
        impl DataSource for FailingSource {
            async fn resolve(
                &self,
                _context: &Context,
                _arguments: &[ResolvedArgument],
                _sink: &mut Vec<u8>,
            ) -> Result<Instruction, FetchError> {
                Err(FetchError::MalformedResponse {
                    reason: "boom".to_string(),
                })
            }
        }

        let plan = QueryPlan::new(ObjectNode {
            fields: vec![],
            fetch: Some(Fetch::Parallel(ParallelFetch {
                fetches: vec![
                    single_fetch("ok", Arc::new(FixedSource::new(json!({})))),
                    single_fetch("bad", Arc::new(FailingSource)),
                ],
            })),
            path: None,
            operation_kind: None,
        });

        let context = Context::new(Default::default());
        let mut sink = Vec::new();
        let err = plan.execute(&context, &mut sink).await.unwrap_err();
        assert!(matches!(err, FetchError::MalformedResponse { .. }));
    }

    #[tokio::test]
    async fn skipped_branches_leave_no_comma_behind() {
        let source = Arc::new(FixedSource::new(json!({
            "__typename": "NotFoundError",
            "message": "no such task",
            "id": "ignored"
        })));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "task",
                PlanNode::Object(ObjectNode {
                    fields: vec![
                        FieldNode {
                            skip: Some(Skip::IfNotEqual {
                                path: Path::key("__typename"),
                                value: json!("Task"),
                            }),
                            ..value_field("id", "id", ValueType::String)
                        },
                        FieldNode {
                            skip: Some(Skip::IfNotEqual {
                                path: Path::key("__typename"),
                                value: json!("NotFoundError"),
                            }),
                            ..value_field("message", "message", ValueType::String)
                        },
                    ],
                    fetch: None,
                    path: None,
                    operation_kind: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("task", source))),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(output, r#"{"data":{"task":{"message":"no such task"}}}"#);
    }

    #[tokio::test]
    async fn list_filter_keeps_the_first_elements() {
        let source = Arc::new(FixedSource::new(json!({
            "friends": [{"name": "ada"}, {"name": "grace"}, {"name": "linus"}]
        })));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "friends",
                PlanNode::List(ListNode {
                    item: Box::new(PlanNode::Object(ObjectNode {
                        fields: vec![value_field("name", "name", ValueType::String)],
                        fetch: None,
                        path: None,
                        operation_kind: None,
                    })),
                    path: Some(Path::key("friends")),
                    filter: Some(ListFilter::First(2)),
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("friends", source))),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(
            output,
            r#"{"data":{"friends":[{"name":"ada"},{"name":"grace"}]}}"#
        );
    }

    #[tokio::test]
    async fn dead_render_path_renders_null() {
        let source = Arc::new(FixedSource::new(json!({})));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "country",
                PlanNode::Object(ObjectNode {
                    fields: vec![value_field("name", "name", ValueType::String)],
                    fetch: None,
                    path: Some(Path::key("country")),
                    operation_kind: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("country", source))),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(output, r#"{"data":{"country":null}}"#);
    }

    #[tokio::test]
    async fn scalar_type_mismatch_is_fatal() {
        let source = Arc::new(FixedSource::new(json!({"population": "not a number"})));
        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "population",
                PlanNode::Value(ValueNode {
                    path: Some(Path::key("population")),
                    value_type: ValueType::Int,
                    transformation: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("population", source))),
            path: None,
            operation_kind: None,
        });

        let context = Context::new(Default::default());
        let mut sink = Vec::new();
        let err = plan.execute(&context, &mut sink).await.unwrap_err();
        assert!(
            matches!(err, FetchError::ValueTypeMismatch { expected, .. } if expected == "Int")
        );
    }

    #[tokio::test]
    async fn object_variable_arguments_read_the_parent_buffer() {
        let outer = Arc::new(FixedSource::new(json!({"id": "u-1"})));

        #[derive(Debug)]
        struct EchoArgument;

        #[async_trait]
        impl DataSource for EchoArgument {
            async fn resolve(
                &self,
                _context: &Context,
                arguments: &[ResolvedArgument],
                sink: &mut Vec<u8>,
            ) -> Result<Instruction, FetchError> {
                let id = crate::plan::argument_value(arguments, "id")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                sink.extend_from_slice(format!(r#"{{"posts": "for {}"}}"#, id).as_bytes());
                Ok(Instruction::CloseAfterOneShot)
            }
        }

        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "user",
                PlanNode::Object(ObjectNode {
                    fields: vec![
                        value_field("id", "id", ValueType::String),
                        fetched_field(
                            "posts",
                            PlanNode::Value(ValueNode {
                                path: Some(Path::key("posts")),
                                value_type: ValueType::String,
                                transformation: None,
                            }),
                        ),
                    ],
                    fetch: Some(Fetch::Single(SingleFetch {
                        invocation: DataSourceInvocation {
                            source: Arc::new(EchoArgument),
                            arguments: vec![Argument::ObjectVariable {
                                name: "id".into(),
                                path: Path::key("id"),
                            }],
                        },
                        buffer: "posts".into(),
                    })),
                    path: None,
                    operation_kind: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch("user", outer))),
            path: None,
            operation_kind: None,
        });

        let (output, _) = run(&plan).await;
        assert_eq!(
            output,
            r#"{"data":{"user":{"id":"u-1","posts":"for u-1"}}}"#
        );
    }

    #[tokio::test]
    async fn stream_emits_until_the_source_closes() {
        #[derive(Debug)]
        struct CountingStream {
            remaining: AtomicUsize,
        }

        #[async_trait]
        impl DataSource for CountingStream {
            async fn resolve(
                &self,
                _context: &Context,
                _arguments: &[ResolvedArgument],
                sink: &mut Vec<u8>,
            ) -> Result<Instruction, FetchError> {
                let before = self.remaining.fetch_sub(1, Ordering::SeqCst);
                if before == 0 {
                    return Ok(Instruction::CloseConnection);
                }
                sink.extend_from_slice(format!(r#"{{"tick": {}}}"#, before).as_bytes());
                Ok(Instruction::KeepStreamAlive)
            }

            fn is_streaming(&self) -> bool {
                true
            }
        }

        let plan = QueryPlan::new(ObjectNode {
            fields: vec![fetched_field(
                "tick",
                PlanNode::Value(ValueNode {
                    path: Some(Path::key("tick")),
                    value_type: ValueType::Int,
                    transformation: None,
                }),
            )],
            fetch: Some(Fetch::Single(single_fetch(
                "tick",
                Arc::new(CountingStream {
                    remaining: AtomicUsize::new(2),
                }),
            ))),
            path: None,
            operation_kind: None,
        });
        assert!(plan.contains_streaming());

        let (sender, mut receiver) = tokio::sync::mpsc::channel(8);
        let context = Context::new(Default::default());
        resolve_stream(&plan, &context, sender).await.unwrap();

        let mut emitted = Vec::new();
        while let Some(output) = receiver.recv().await {
            emitted.push(String::from_utf8(output).unwrap());
        }
        assert_eq!(
            emitted,
            vec![
                r#"{"data":{"tick":2}}"#.to_string(),
                r#"{"data":{"tick":1}}"#.to_string(),
            ]
        );
    }
}
