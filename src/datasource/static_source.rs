//! Serves a field from a fixed JSON document.
//!
//! Useful for feature flags, canned lookups and wiring tests; also the
//! simplest complete backend, exercising the planner and executor contracts
//! without any I/O.

use crate::ast::Field;
use crate::context::Context;
use crate::datasource::{
    DataSource, DataSourcePlannerFactory, DataSourcePlanning, Instruction, PlannedDataSource,
    PlanningContext,
};
use crate::error::{FetchError, PlanError};
use crate::plan::{ArgumentAccumulator, ResolvedArgument};
use async_trait::async_trait;
use std::sync::Arc;

/// Registers fields answered by a fixed document.
#[derive(Debug)]
pub struct StaticDataSourceFactory {
    data: serde_json_bytes::Value,
}

impl StaticDataSourceFactory {
    pub fn new(data: serde_json_bytes::Value) -> Self {
        Self { data }
    }
}

impl DataSourcePlannerFactory for StaticDataSourceFactory {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
        Box::new(StaticDataSourcePlanner {
            data: self.data.clone(),
        })
    }
}

struct StaticDataSourcePlanner {
    data: serde_json_bytes::Value,
}

impl DataSourcePlanning for StaticDataSourcePlanner {
    fn plan_field(
        self: Box<Self>,
        _context: &PlanningContext<'_>,
        _field: &Field,
        _arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError> {
        Ok(PlannedDataSource {
            source: Arc::new(StaticDataSource { data: self.data }),
            root_path: None,
        })
    }
}

/// Writes its document verbatim on every resolution.
#[derive(Debug)]
pub struct StaticDataSource {
    data: serde_json_bytes::Value,
}

#[async_trait]
impl DataSource for StaticDataSource {
    async fn resolve(
        &self,
        _context: &Context,
        _arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError> {
        serde_json::to_writer(&mut *sink, &self.data).map_err(|err| FetchError::SinkError {
            reason: err.to_string(),
        })?;
        Ok(Instruction::CloseAfterOneShot)
    }
}
