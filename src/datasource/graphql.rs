//! Forwards a field subtree to an upstream GraphQL service over HTTP.
//!
//! The upstream operation is synthesized once at plan time; at call time
//! only the variables object is assembled from the resolved arguments. The
//! upstream's `data` envelope is unwrapped before the raw result is handed
//! to the engine, so the field's subtree selects into it directly.

use crate::context::Context;
use crate::datasource::{
    field_argument, DataSource, DataSourcePlannerFactory, DataSourcePlanning, Instruction,
    PlannedDataSource, PlanningContext,
};
use crate::error::{FetchError, PlanError};
use crate::json_ext::{Object, Path};
use crate::planner::subquery::{print_subquery, OPERATION_NAME};
use crate::plan::{Argument, ArgumentAccumulator, ResolvedArgument};
use async_trait::async_trait;
use serde::Serialize;
use crate::ast::{Field, LiteralValue, Operation, Selection};
use serde_json_bytes::Value;
use std::sync::Arc;
use tracing::debug;

/// Configuration for one upstream GraphQL service.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GraphQlDataSourceConfig {
    /// The upstream endpoint receiving synthesized operations via POST.
    pub url: String,
}

/// Registers fields resolved by forwarding to an upstream GraphQL service.
#[derive(Debug)]
pub struct GraphQlDataSourceFactory {
    config: GraphQlDataSourceConfig,
    client: reqwest::Client,
}

impl GraphQlDataSourceFactory {
    pub fn new(config: GraphQlDataSourceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

impl DataSourcePlannerFactory for GraphQlDataSourceFactory {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
        Box::new(GraphQlDataSourcePlanner {
            config: self.config.clone(),
            client: self.client.clone(),
        })
    }
}

struct GraphQlDataSourcePlanner {
    config: GraphQlDataSourceConfig,
    client: reqwest::Client,
}

impl DataSourcePlanning for GraphQlDataSourcePlanner {
    fn plan_field(
        self: Box<Self>,
        context: &PlanningContext<'_>,
        field: &Field,
        arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError> {
        let query = print_subquery(field, context.operation, context.schema, context.enclosing_type)?;
        debug!(url = self.config.url.as_str(), query = query.as_str(), "synthesized upstream operation");

        arguments.push(Argument::Static {
            name: "url".into(),
            value: Value::String(self.config.url.as_str().into()),
        });
        arguments.push(Argument::Static {
            name: "query".into(),
            value: Value::String(query.into()),
        });
        let mut seen = Vec::new();
        collect_variable_arguments(field, context.operation, &mut seen, arguments);

        Ok(PlannedDataSource {
            source: Arc::new(GraphQlDataSource {
                url: self.config.url,
                client: self.client,
            }),
            root_path: Some(Path::key(&field.name)),
        })
    }
}

/// Collects one binding per distinct upstream variable, in the order the
/// synthesized operation declares them.
fn collect_variable_arguments(
    field: &Field,
    operation: &Operation,
    seen: &mut Vec<String>,
    arguments: &mut ArgumentAccumulator,
) {
    for argument in &field.arguments {
        let name = match &argument.value {
            LiteralValue::Variable(variable) => variable.as_str(),
            _ => argument.name.as_str(),
        };
        if seen.iter().any(|existing| existing == name) {
            continue;
        }
        seen.push(name.to_string());
        arguments.push(field_argument(name, &argument.value, operation));
    }
    for selection in &field.selection_set {
        match selection {
            Selection::Field(child) => {
                collect_variable_arguments(child, operation, seen, arguments)
            }
            Selection::InlineFragment(fragment) => {
                for selection in &fragment.selection_set {
                    if let Selection::Field(child) = selection {
                        collect_variable_arguments(child, operation, seen, arguments);
                    }
                }
            }
        }
    }
}

/// Calls one upstream GraphQL service with a pre-synthesized operation.
#[derive(Debug)]
pub struct GraphQlDataSource {
    url: String,
    client: reqwest::Client,
}

#[derive(Debug, Serialize, PartialEq)]
struct RequestBody<'a> {
    operation_name: &'static str,
    variables: Object,
    query: &'a str,
}

/// Splits the resolved arguments into the operation text and the upstream
/// variables object. Routing arguments never leak into variables.
fn request_body(arguments: &[ResolvedArgument]) -> Result<RequestBody<'_>, FetchError> {
    let mut query = None;
    let mut variables = Object::default();
    for argument in arguments {
        match argument.name.as_str() {
            "url" => {}
            "query" => {
                query = argument.value.as_str();
            }
            _ => {
                variables.insert(argument.name.clone(), argument.value.clone());
            }
        }
    }
    Ok(RequestBody {
        operation_name: OPERATION_NAME,
        variables,
        query: query.ok_or_else(|| FetchError::ExecutionInvalidContent {
            reason: "fetch arguments carry no operation text".to_string(),
        })?,
    })
}

/// Unwraps the `data` envelope of an upstream response.
fn unwrap_envelope(response: Value) -> Result<Value, FetchError> {
    match response {
        Value::Object(mut object) => {
            object
                .remove("data")
                .ok_or_else(|| FetchError::MalformedResponse {
                    reason: "upstream response carries no 'data' member".to_string(),
                })
        }
        _ => Err(FetchError::MalformedResponse {
            reason: "upstream response is not an object".to_string(),
        }),
    }
}

#[async_trait]
impl DataSource for GraphQlDataSource {
    async fn resolve(
        &self,
        context: &Context,
        arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError> {
        let body = request_body(arguments)?;
        debug!(url = self.url.as_str(), "forwarding operation upstream");

        let request = self.client.post(&self.url).json(&body).send();
        let response = tokio::select! {
            _ = context.cancelled() => return Err(FetchError::Cancelled),
            response = request => response.map_err(|err| FetchError::SubrequestHttpError {
                upstream: self.url.clone(),
                reason: err.to_string(),
            })?,
        };
        let payload = response
            .bytes()
            .await
            .map_err(|err| FetchError::SubrequestHttpError {
                upstream: self.url.clone(),
                reason: err.to_string(),
            })?;
        let parsed: Value =
            serde_json::from_slice(&payload).map_err(|err| FetchError::MalformedResponse {
                reason: err.to_string(),
            })?;
        let data = unwrap_envelope(parsed)?;

        serde_json::to_writer(&mut *sink, &data).map_err(|err| FetchError::SinkError {
            reason: err.to_string(),
        })?;
        Ok(Instruction::CloseAfterOneShot)
    }
}
