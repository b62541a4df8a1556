//! The response-shaped, backend-call-annotated plan tree.
//!
//! A plan is built once per distinct query shape and is immutable
//! thereafter: it is safe to park in an `Arc` and reuse across requests
//! carrying different variables. Backend instances are owned by the plan
//! nodes referencing them and are dropped with the plan.

mod arguments;

pub use arguments::{
    argument_value, resolve_arguments, Argument, ArgumentAccumulator, ResolvedArgument,
};

use crate::ast::OperationKind;
use crate::datasource::DataSource;
use crate::error::FetchError;
use crate::json_ext::{Path, ValueExt};
use serde_json_bytes::{ByteString, Value};
use std::fmt;
use std::sync::Arc;

/// A query plan, rooted at the operation's top-level object.
#[derive(Debug)]
pub struct QueryPlan {
    pub(crate) root: PlanNode,
}

impl QueryPlan {
    pub(crate) fn new(root: ObjectNode) -> Self {
        Self {
            root: PlanNode::Object(root),
        }
    }

    pub fn operation_kind(&self) -> OperationKind {
        match &self.root {
            PlanNode::Object(object) => object.operation_kind.unwrap_or_default(),
            _ => OperationKind::Query,
        }
    }

    /// Whether any fetch in the plan is backed by a streaming source, in
    /// which case the caller should drive it with
    /// [`crate::execution::resolve_stream`].
    pub fn contains_streaming(&self) -> bool {
        self.root.contains_streaming()
    }
}

/// Plan trees are composed of a set of nodes mirroring the response shape.
#[derive(Debug)]
pub enum PlanNode {
    /// Renders an object with a fixed field order.
    Object(ObjectNode),

    /// Renders an array by applying a template to every element.
    List(ListNode),

    /// Renders a scalar leaf.
    Value(ValueNode),
}

impl PlanNode {
    fn contains_streaming(&self) -> bool {
        match self {
            PlanNode::Object(object) => {
                object
                    .fetch
                    .as_ref()
                    .map(Fetch::contains_streaming)
                    .unwrap_or(false)
                    || object
                        .fields
                        .iter()
                        .any(|field| field.node.contains_streaming())
            }
            PlanNode::List(list) => list.item.contains_streaming(),
            PlanNode::Value(_) => false,
        }
    }
}

/// An object in the response.
#[derive(Debug)]
pub struct ObjectNode {
    /// Fields in declaration order; output order matches regardless of how
    /// fetch completions interleave.
    pub fields: Vec<FieldNode>,

    /// Calls that must complete before any field below renders.
    pub fetch: Option<Fetch>,

    /// Selects the relevant sub-document of this object's input data before
    /// descending.
    pub path: Option<Path>,

    /// Set on the root object only.
    pub operation_kind: Option<OperationKind>,
}

/// One field of an [`ObjectNode`].
#[derive(Debug)]
pub struct FieldNode {
    /// The response key.
    pub name: ByteString,

    pub node: PlanNode,

    /// When present and evaluating to true against the enclosing object's
    /// data, the field is omitted from output entirely.
    pub skip: Option<Skip>,

    /// When set, the subtree resolves against the fetch buffer registered
    /// under this field's name instead of the inherited data. Set exactly
    /// when a fetch was planned for this field.
    pub has_resolved_data: bool,
}

/// A list in the response.
#[derive(Debug)]
pub struct ListNode {
    /// Template applied to every element.
    pub item: Box<PlanNode>,

    pub path: Option<Path>,

    pub filter: Option<ListFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListFilter {
    /// Keep only the first N elements, preserving order.
    First(usize),
}

/// A scalar leaf in the response.
#[derive(Debug)]
pub struct ValueNode {
    pub path: Option<Path>,

    /// Controls quoting on output and coercion checks.
    pub value_type: ValueType,

    /// Post-processing applied to the raw scalar before emission.
    pub transformation: Option<Arc<dyn ScalarTransform>>,
}

/// The declared type of a scalar leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    String,
    Int,
    Float,
    Boolean,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::String => write!(f, "String"),
            ValueType::Int => write!(f, "Int"),
            ValueType::Float => write!(f, "Float"),
            ValueType::Boolean => write!(f, "Boolean"),
        }
    }
}

/// A predicate deciding whether a field is omitted from output.
///
/// Implements union/interface branch selection: the planner attaches one
/// per inline-fragment branch, comparing the `__typename` discriminator in
/// the resolved data against the branch's declared type.
#[derive(Debug, Clone)]
pub enum Skip {
    IfNotEqual {
        /// Selector into the enclosing object's resolved data.
        path: Path,

        /// The value the selected data must equal for the field to render.
        value: Value,
    },
}

impl Skip {
    /// Returns true when the field should be skipped. A dead path counts as
    /// "not equal" so unmatched branches vanish silently.
    pub fn evaluate(&self, data: &Value) -> bool {
        match self {
            Skip::IfNotEqual { path, value } => data.get_path(path) != Some(value),
        }
    }
}

/// The calls attached to an object.
#[derive(Debug)]
pub enum Fetch {
    /// One backend invocation.
    Single(SingleFetch),

    /// Invocations dispatched concurrently; all must complete before the
    /// owning object's fields are rendered.
    Parallel(ParallelFetch),
}

impl Fetch {
    fn contains_streaming(&self) -> bool {
        match self {
            Fetch::Single(single) => single.invocation.source.is_streaming(),
            Fetch::Parallel(parallel) => parallel
                .fetches
                .iter()
                .any(|fetch| fetch.invocation.source.is_streaming()),
        }
    }
}

/// One backend invocation plus the buffer its result is registered under.
#[derive(Debug)]
pub struct SingleFetch {
    pub invocation: DataSourceInvocation,

    /// Correlates the raw result with the field consuming it; derived from
    /// the response field's alias.
    pub buffer: ByteString,
}

#[derive(Debug)]
pub struct ParallelFetch {
    pub fetches: Vec<SingleFetch>,
}

/// A backend instance bound to the arguments collected for one field
/// occurrence.
#[derive(Debug)]
pub struct DataSourceInvocation {
    pub source: Arc<dyn DataSource>,

    /// Resolution order is stable and matches planner append order; remote
    /// query forwarding depends on it for variable substitution.
    pub arguments: Vec<Argument>,
}

/// Scalar post-processing attached to a leaf via directive metadata.
pub trait ScalarTransform: Send + Sync + fmt::Debug {
    fn apply(&self, input: Value) -> Result<Value, FetchError>;
}

/// Chains transforms left to right.
#[derive(Debug, Default)]
pub struct Pipeline {
    steps: Vec<Arc<dyn ScalarTransform>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn step(mut self, step: Arc<dyn ScalarTransform>) -> Self {
        self.steps.push(step);
        self
    }
}

impl ScalarTransform for Pipeline {
    fn apply(&self, input: Value) -> Result<Value, FetchError> {
        self.steps
            .iter()
            .try_fold(input, |value, step| step.apply(value))
    }
}
