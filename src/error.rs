use displaydoc::Display;
use thiserror::Error;

/// Error types for plan construction.
///
/// Planning is all-or-nothing: any of these aborts the walk and no partial
/// plan is handed back to the caller.
#[derive(Error, Display, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// Operation references unknown type '{name}'.
    UnknownType {
        /// The type that was unknown.
        name: String,
    },

    /// Operation selects unknown field '{field}' on type '{type_name}'.
    UnknownField {
        /// The enclosing type.
        type_name: String,

        /// The field that was unknown.
        field: String,
    },

    /// Field '{field}' has no argument named '{argument}'.
    UnknownArgument {
        /// The field carrying the argument.
        field: String,

        /// The argument that was unknown.
        argument: String,
    },

    /// Operation kind '{kind}' has no root type in this schema.
    UnsupportedOperation {
        /// The operation kind that has no root type.
        kind: String,
    },

    /// Data source configuration was malformed: {reason}
    MalformedConfig {
        /// The reason deserialization failed.
        reason: String,
    },

    /// Could not synthesize upstream operation: {reason}
    OperationSynthesis {
        /// The failure reason.
        reason: String,
    },
}

/// Error types for execution.
///
/// The executor records at most one of these per execution (first error
/// wins); bytes already streamed to the sink are not retracted.
#[derive(Error, Display, Debug)]
#[ignore_extra_doc_attributes]
pub enum FetchError {
    /// Execution requires variable '{name}', but it was not provided.
    MissingVariable {
        /// Name of the variable.
        name: String,
    },

    /// Could not find path '{path}' in the resolved data.
    PathNotFound {
        /// The dead path.
        path: String,
    },

    /// HTTP fetch failed from '{upstream}': {reason}
    ///
    /// Note that this relates to a transport error and not a GraphQL error.
    SubrequestHttpError {
        /// The upstream that failed.
        upstream: String,

        /// The reason the fetch failed.
        reason: String,
    },

    /// Upstream response was malformed: {reason}
    MalformedResponse {
        /// The reason the payload could not be used.
        reason: String,
    },

    /// Invalid content: {reason}
    ExecutionInvalidContent { reason: String },

    /// Value at '{path}' cannot be coerced to declared type '{expected}'.
    ValueTypeMismatch {
        /// Where in the raw data the value was read from.
        path: String,

        /// The declared value type.
        expected: String,
    },

    /// Message bus subscription failed: {reason}
    SubscriptionError {
        /// The reason the bus operation failed.
        reason: String,
    },

    /// Sandboxed module invocation failed: {reason}
    ModuleError {
        /// The reason the module could not run.
        reason: String,
    },

    /// Could not write to the output sink: {reason}
    SinkError {
        /// The underlying write failure.
        reason: String,
    },

    /// Execution was cancelled.
    Cancelled,
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::SinkError {
            reason: err.to_string(),
        }
    }
}
