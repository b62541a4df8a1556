//! A query federation engine: plans a normalized operation against a
//! composed schema and a registry of heterogeneous backends, then executes
//! the plan by streaming a JSON response while backend calls resolve.
//!
//! The three phases are deliberately separate. [`planner::plan`] walks the
//! operation once and produces an immutable [`plan::QueryPlan`] that can be
//! cached and shared across requests; [`plan::QueryPlan::execute`] drives
//! it for one request's variables; streaming plans are re-driven by
//! [`execution::resolve_stream`] until their source closes.

pub mod ast;
pub mod context;
pub mod datasource;
pub mod error;
pub mod execution;
pub mod json_ext;
pub mod plan;
pub mod planner;

pub use context::Context;
pub use datasource::{DataSource, DataSourceRegistry, Instruction};
pub use error::{FetchError, PlanError};
pub use execution::resolve_stream;
pub use plan::QueryPlan;
pub use planner::plan;

/// The types most integrations need.
pub mod prelude {
    pub use crate::ast::{Operation, Schema};
    pub use crate::context::Context;
    pub use crate::datasource::{DataSource, DataSourceRegistry, Instruction};
    pub use crate::error::{FetchError, PlanError};
    pub use crate::execution::resolve_stream;
    pub use crate::plan::QueryPlan;
    pub use crate::planner::plan;
}
