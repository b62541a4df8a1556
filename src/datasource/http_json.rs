//! Resolves a field from a JSON-over-HTTP (REST) upstream.
//!
//! Request templates carry `{{ .arguments.x }}` and `{{ .object.path }}`
//! placeholders. The planner turns each distinct placeholder into an
//! argument binding; at call time the resolved values are substituted into
//! the URL, body and header templates. Upstreams signal outcome variants
//! through HTTP status codes, mapped onto a `__typename` discriminator so
//! fragment branches select on them downstream.

use crate::ast::Field;
use crate::context::Context;
use crate::datasource::{
    field_argument, DataSource, DataSourcePlannerFactory, DataSourcePlanning, Instruction,
    PlannedDataSource, PlanningContext,
};
use crate::error::{FetchError, PlanError};
use crate::json_ext::Path;
use crate::plan::{argument_value, Argument, ArgumentAccumulator, ResolvedArgument};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json_bytes::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Configuration for one REST upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpJsonDataSourceConfig {
    /// URL template, placeholders allowed.
    pub url: String,

    #[serde(default)]
    pub method: HttpMethod,

    /// Request body template, placeholders allowed. Sent as JSON.
    #[serde(default)]
    pub body: Option<String>,

    /// Header templates by header name, placeholders allowed in values.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Discriminator injected when no status mapping matches a 2xx reply.
    #[serde(default)]
    pub default_type_name: Option<String>,

    /// Status-code-specific discriminators; also legitimize non-2xx replies.
    #[serde(default)]
    pub status_code_type_mappings: Vec<StatusCodeTypeMapping>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StatusCodeTypeMapping {
    pub status_code: u16,
    pub type_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl From<HttpMethod> for reqwest::Method {
    fn from(method: HttpMethod) -> Self {
        match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
        }
    }
}

/// Registers fields resolved against a REST upstream.
#[derive(Debug)]
pub struct HttpJsonDataSourceFactory {
    config: HttpJsonDataSourceConfig,
    client: reqwest::Client,
}

impl HttpJsonDataSourceFactory {
    pub fn new(config: HttpJsonDataSourceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

impl DataSourcePlannerFactory for HttpJsonDataSourceFactory {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
        Box::new(HttpJsonDataSourcePlanner {
            config: self.config.clone(),
            client: self.client.clone(),
        })
    }
}

struct HttpJsonDataSourcePlanner {
    config: HttpJsonDataSourceConfig,
    client: reqwest::Client,
}

impl DataSourcePlanning for HttpJsonDataSourcePlanner {
    fn plan_field(
        self: Box<Self>,
        context: &PlanningContext<'_>,
        field: &Field,
        arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError> {
        let mut placeholders = Vec::new();
        scan_placeholders(&self.config.url, &mut placeholders);
        if let Some(body) = &self.config.body {
            scan_placeholders(body, &mut placeholders);
        }
        for value in self.config.headers.values() {
            scan_placeholders(value, &mut placeholders);
        }
        debug!(
            url = self.config.url.as_str(),
            placeholders = placeholders.len(),
            "planning REST invocation"
        );
        bind_placeholders(placeholders, field, context.operation, arguments)?;

        Ok(PlannedDataSource {
            source: Arc::new(HttpJsonDataSource {
                config: self.config,
                client: self.client,
            }),
            root_path: None,
        })
    }
}

/// Turns each placeholder expression into an argument binding.
///
/// `arguments.x` binds through the field's argument of the same name;
/// `object.path` selects into the enclosing object's resolved data. Any
/// other scope is a configuration error.
pub(crate) fn bind_placeholders(
    placeholders: Vec<String>,
    field: &Field,
    operation: &crate::ast::Operation,
    arguments: &mut ArgumentAccumulator,
) -> Result<(), PlanError> {
    for placeholder in placeholders {
        match placeholder.strip_prefix("arguments.") {
            Some(argument_name) => {
                let field_arg = field
                    .arguments
                    .iter()
                    .find(|argument| argument.name == argument_name)
                    .ok_or_else(|| PlanError::UnknownArgument {
                        field: field.name.clone(),
                        argument: argument_name.to_string(),
                    })?;
                arguments.push(field_argument(&placeholder, &field_arg.value, operation));
            }
            None => match placeholder.strip_prefix("object.") {
                Some(path) => arguments.push(Argument::ObjectVariable {
                    name: placeholder.as_str().into(),
                    path: Path::from(path),
                }),
                None => {
                    return Err(PlanError::MalformedConfig {
                        reason: format!("unsupported placeholder '{{{{ .{} }}}}'", placeholder),
                    })
                }
            },
        }
    }
    Ok(())
}

/// Collects the dotted expression of every distinct `{{ .expr }}`
/// placeholder, in first-occurrence order.
pub(crate) fn scan_placeholders(template: &str, placeholders: &mut Vec<String>) {
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        rest = &rest[start + 2..];
        let end = match rest.find("}}") {
            Some(end) => end,
            None => return,
        };
        let expression = rest[..end].trim();
        if let Some(expression) = expression.strip_prefix('.') {
            if !placeholders.iter().any(|existing| existing == expression) {
                placeholders.push(expression.to_string());
            }
        }
        rest = &rest[end + 2..];
    }
}

/// Replaces every placeholder in `template` with its resolved value.
/// Strings substitute raw; other values substitute as JSON text.
pub(crate) fn substitute(
    template: &str,
    arguments: &[ResolvedArgument],
) -> Result<String, FetchError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        rest = &rest[start + 2..];
        let end = rest
            .find("}}")
            .ok_or_else(|| FetchError::ExecutionInvalidContent {
                reason: "unterminated placeholder in request template".to_string(),
            })?;
        let expression = rest[..end].trim().trim_start_matches('.');
        let value =
            argument_value(arguments, expression).ok_or_else(|| FetchError::MissingVariable {
                name: expression.to_string(),
            })?;
        match value {
            Value::String(s) => out.push_str(s.as_str()),
            other => out.push_str(&serde_json::to_string(other).map_err(|err| {
                FetchError::ExecutionInvalidContent {
                    reason: err.to_string(),
                }
            })?),
        }
        rest = &rest[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Adds the discriminator for a union-shaped result. Non-objects pass
/// through untouched.
fn inject_type_name(value: &mut Value, type_name: &str) {
    if let Value::Object(object) = value {
        object.insert(
            serde_json_bytes::ByteString::from("__typename"),
            Value::String(type_name.into()),
        );
    }
}

/// Calls one REST upstream with substituted templates.
#[derive(Debug)]
pub struct HttpJsonDataSource {
    config: HttpJsonDataSourceConfig,
    client: reqwest::Client,
}

impl HttpJsonDataSource {
    fn type_name_for_status(&self, status: u16) -> Option<&str> {
        self.config
            .status_code_type_mappings
            .iter()
            .find(|mapping| mapping.status_code == status)
            .map(|mapping| mapping.type_name.as_str())
    }
}

#[async_trait]
impl DataSource for HttpJsonDataSource {
    async fn resolve(
        &self,
        context: &Context,
        arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError> {
        let url = substitute(&self.config.url, arguments)?;
        debug!(url = url.as_str(), "calling REST upstream");

        let mut request = self
            .client
            .request(self.config.method.into(), &url);
        for (name, template) in &self.config.headers {
            request = request.header(name.as_str(), substitute(template, arguments)?);
        }
        if let Some(body) = &self.config.body {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(substitute(body, arguments)?);
        }

        let response = tokio::select! {
            _ = context.cancelled() => return Err(FetchError::Cancelled),
            response = request.send() => response.map_err(|err| FetchError::SubrequestHttpError {
                upstream: url.clone(),
                reason: err.to_string(),
            })?,
        };
        let status = response.status();
        let payload = response
            .bytes()
            .await
            .map_err(|err| FetchError::SubrequestHttpError {
                upstream: url.clone(),
                reason: err.to_string(),
            })?;

        let mut value: Value = if payload.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&payload).map_err(|err| FetchError::MalformedResponse {
                reason: err.to_string(),
            })?
        };

        match self.type_name_for_status(status.as_u16()) {
            Some(type_name) => inject_type_name(&mut value, type_name),
            None if !status.is_success() => {
                return Err(FetchError::SubrequestHttpError {
                    upstream: url,
                    reason: format!("unexpected status {}", status.as_u16()),
                })
            }
            None => {
                if let Some(type_name) = &self.config.default_type_name {
                    inject_type_name(&mut value, type_name);
                }
            }
        }

        serde_json::to_writer(&mut *sink, &value).map_err(|err| FetchError::SinkError {
            reason: err.to_string(),
        })?;
        Ok(Instruction::CloseAfterOneShot)
    }
}
