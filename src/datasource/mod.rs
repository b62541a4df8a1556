//! The backend abstraction: the `Resolve` contract every data source
//! satisfies, the planner hooks that collect call-time arguments, and the
//! (type, field) registry the planner consults.
//!
//! Backends vary widely (remote GraphQL, REST, message bus, sandboxed
//! module); the registry holds factories, not concrete types, so new
//! backend kinds are added without touching the planner or the executor.

pub mod graphql;
pub mod http_json;
pub mod http_polling;
pub mod nats;
pub mod static_source;
pub mod wasm;

use crate::ast::{Field, LiteralValue, Operation, Schema};
use crate::context::Context;
use crate::error::{FetchError, PlanError};
use crate::json_ext::Path;
use crate::plan::{Argument, ArgumentAccumulator, ResolvedArgument};
use async_trait::async_trait;
use std::fmt::Debug;
use std::sync::Arc;

/// What a data source asks the caller to do after one resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    /// One-shot call; the execution is complete for this source.
    CloseAfterOneShot,

    /// Streaming source with more data expected; re-execute the plan for
    /// the next event.
    KeepStreamAlive,

    /// The stream ended (or was cancelled); stop re-executing.
    CloseConnection,
}

impl Instruction {
    /// Combines instructions from sibling fetches; termination wins over
    /// keep-alive, keep-alive over one-shot.
    pub(crate) fn merge(self, other: Instruction) -> Instruction {
        use Instruction::*;
        match (self, other) {
            (CloseConnection, _) | (_, CloseConnection) => CloseConnection,
            (KeepStreamAlive, _) | (_, KeepStreamAlive) => KeepStreamAlive,
            _ => CloseAfterOneShot,
        }
    }
}

/// The uniform contract every backend implementation satisfies.
///
/// `arguments` arrive fully substituted, in the order the planner appended
/// them. The raw result is written to `sink`; the engine parses it back
/// into JSON for path extraction.
#[async_trait]
pub trait DataSource: Send + Sync + Debug {
    async fn resolve(
        &self,
        context: &Context,
        arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError>;

    /// Whether this source turns one execution into a keep-alive loop.
    fn is_streaming(&self) -> bool {
        false
    }
}

/// What a backend planner hands back for one field occurrence.
#[derive(Debug)]
pub struct PlannedDataSource {
    pub source: Arc<dyn DataSource>,

    /// Selects the relevant sub-document of the raw result before the
    /// field's subtree descends, e.g. the root field key of a forwarded
    /// GraphQL response.
    pub root_path: Option<Path>,
}

/// Shared plan-build state a backend planner can consult.
pub struct PlanningContext<'a> {
    pub schema: &'a Schema,
    pub operation: &'a Operation,
    pub enclosing_type: &'a str,
}

/// A backend's participation in the planner's walk of one field occurrence.
///
/// Instances are created fresh per occurrence (they accumulate
/// per-occurrence argument state) and consumed by `plan_field`.
pub trait DataSourcePlanning {
    fn plan_field(
        self: Box<Self>,
        context: &PlanningContext<'_>,
        field: &Field,
        arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError>;
}

/// Yields a fresh planner per field occurrence. Held by the registry.
pub trait DataSourcePlannerFactory: Send + Sync {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning>;
}

/// An ordered (type, field) → backend-planner-factory registry.
///
/// Lookup is by exact match, first registration wins; fields without a
/// match render pass-through from the parent's already-resolved data.
#[derive(Default)]
pub struct DataSourceRegistry {
    entries: Vec<RegistryEntry>,
}

struct RegistryEntry {
    type_name: String,
    field_name: String,
    factory: Arc<dyn DataSourcePlannerFactory>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        type_name: impl Into<String>,
        field_name: impl Into<String>,
        factory: Arc<dyn DataSourcePlannerFactory>,
    ) {
        self.entries.push(RegistryEntry {
            type_name: type_name.into(),
            field_name: field_name.into(),
            factory,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn lookup(
        &self,
        type_name: &str,
        field_name: &str,
    ) -> Option<&Arc<dyn DataSourcePlannerFactory>> {
        self.entries
            .iter()
            .find(|entry| entry.type_name == type_name && entry.field_name == field_name)
            .map(|entry| &entry.factory)
    }
}

impl Debug for DataSourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut debug = f.debug_tuple("DataSourceRegistry");
        for entry in &self.entries {
            debug.field(&format_args!("{}.{}", entry.type_name, entry.field_name));
        }
        debug.finish()
    }
}

/// Converts one field argument into its plan-time binding.
///
/// Operation variables become context variables; a variable the operation
/// does not define is read from the parent's resolved data under the same
/// name; literals are fixed at plan time.
pub(crate) fn field_argument(
    name: &str,
    value: &LiteralValue,
    operation: &Operation,
) -> Argument {
    match value.as_variable() {
        Some(variable) if operation.variable_definition(variable).is_some() => {
            Argument::ContextVariable {
                name: name.into(),
                variable: variable.into(),
            }
        }
        Some(variable) => Argument::ObjectVariable {
            name: name.into(),
            path: Path::key(variable),
        },
        None => Argument::Static {
            name: name.into(),
            value: value.to_json().unwrap_or(serde_json_bytes::Value::Null),
        },
    }
}
