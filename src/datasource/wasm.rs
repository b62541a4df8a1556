//! Resolves a field by invoking a sandboxed WebAssembly command module.
//!
//! The module is compiled once, on first use, and re-instantiated per
//! invocation with fresh WASI pipes: the input document arrives on stdin
//! and whatever the module writes to stdout becomes the raw field data.
//! Invocation runs on the blocking pool so module execution never stalls
//! the async runtime.

use crate::ast::Field;
use crate::context::Context;
use crate::datasource::http_json::{bind_placeholders, scan_placeholders, substitute};
use crate::datasource::{
    DataSource, DataSourcePlannerFactory, DataSourcePlanning, Instruction, PlannedDataSource,
    PlanningContext,
};
use crate::error::{FetchError, PlanError};
use crate::json_ext::Object;
use crate::plan::{ArgumentAccumulator, ResolvedArgument};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json_bytes::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasmtime::{Engine, Linker, Module, Store};
use wasmtime_wasi::WasiCtxBuilder;

/// Configuration for one WebAssembly-backed field.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WasmDataSourceConfig {
    /// Path to the `.wasm` command module on disk.
    pub module_path: String,

    /// Input template written to the module's stdin, placeholders allowed.
    /// When absent, the resolved arguments are passed as a JSON object.
    #[serde(default)]
    pub input: Option<String>,
}

/// Registers fields resolved by a sandboxed module.
#[derive(Debug)]
pub struct WasmDataSourceFactory {
    config: WasmDataSourceConfig,
}

impl WasmDataSourceFactory {
    pub fn new(config: WasmDataSourceConfig) -> Self {
        Self { config }
    }
}

impl DataSourcePlannerFactory for WasmDataSourceFactory {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
        Box::new(WasmDataSourcePlanner {
            config: self.config.clone(),
        })
    }
}

struct WasmDataSourcePlanner {
    config: WasmDataSourceConfig,
}

impl DataSourcePlanning for WasmDataSourcePlanner {
    fn plan_field(
        self: Box<Self>,
        context: &PlanningContext<'_>,
        field: &Field,
        arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError> {
        let mut placeholders = Vec::new();
        if let Some(input) = &self.config.input {
            scan_placeholders(input, &mut placeholders);
            bind_placeholders(placeholders, field, context.operation, arguments)?;
        } else {
            for argument in &field.arguments {
                arguments.push(crate::datasource::field_argument(
                    &argument.name,
                    &argument.value,
                    context.operation,
                ));
            }
        }

        Ok(PlannedDataSource {
            source: Arc::new(WasmDataSource {
                config: self.config,
                module: once_cell::sync::OnceCell::new(),
            }),
            root_path: None,
        })
    }
}

/// Invokes one compiled module per resolution.
pub struct WasmDataSource {
    config: WasmDataSourceConfig,
    module: once_cell::sync::OnceCell<Module>,
}

impl fmt::Debug for WasmDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmDataSource")
            .field("module_path", &self.config.module_path)
            .field("compiled", &self.module.get().is_some())
            .finish()
    }
}

impl WasmDataSource {
    /// The stdin document for one invocation.
    fn input(&self, arguments: &[ResolvedArgument]) -> Result<String, FetchError> {
        match &self.config.input {
            Some(template) => substitute(template, arguments),
            None => {
                let mut object = Object::default();
                for argument in arguments {
                    object.insert(argument.name.clone(), argument.value.clone());
                }
                serde_json::to_string(&Value::Object(object)).map_err(|err| {
                    FetchError::ExecutionInvalidContent {
                        reason: err.to_string(),
                    }
                })
            }
        }
    }

    fn compiled_module(&self) -> Result<&Module, FetchError> {
        self.module.get_or_try_init(|| {
            debug!(
                module_path = self.config.module_path.as_str(),
                "compiling module"
            );
            let engine = Engine::default();
            Module::from_file(&engine, &self.config.module_path).map_err(|err| {
                FetchError::ModuleError {
                    reason: err.to_string(),
                }
            })
        })
    }
}

/// Runs the module's default export with `input` on stdin, returning the
/// bytes it wrote to stdout.
fn invoke(module: &Module, input: String) -> Result<Vec<u8>, FetchError> {
    fn module_error(err: impl fmt::Display) -> FetchError {
        FetchError::ModuleError {
            reason: err.to_string(),
        }
    }

    let mut linker = Linker::new(module.engine());
    wasmtime_wasi::add_to_linker(&mut linker, |s| s).map_err(module_error)?;

    let stdout = WritePipe::new_in_memory();
    let wasi = WasiCtxBuilder::new()
        .stdin(Box::new(ReadPipe::from(input)))
        .stdout(Box::new(stdout.clone()))
        .build();
    let mut store = Store::new(module.engine(), wasi);

    linker.module(&mut store, "", module).map_err(module_error)?;
    let start = linker.get_default(&mut store, "").map_err(module_error)?;
    start.call(&mut store, &[], &mut []).map_err(module_error)?;

    // releases the module's handle on the pipe so the buffer can be taken
    drop(store);
    stdout
        .try_into_inner()
        .map(|cursor| cursor.into_inner())
        .map_err(|_| FetchError::ModuleError {
            reason: "module stdout still shared after invocation".to_string(),
        })
}

#[async_trait]
impl DataSource for WasmDataSource {
    async fn resolve(
        &self,
        context: &Context,
        arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError> {
        let input = self.input(arguments)?;
        let module = self.compiled_module()?.clone();

        let invocation = tokio::task::spawn_blocking(move || invoke(&module, input));
        let output = tokio::select! {
            _ = context.cancelled() => return Err(FetchError::Cancelled),
            output = invocation => output.map_err(|err| FetchError::ModuleError {
                reason: err.to_string(),
            })??,
        };

        sink.extend_from_slice(&output);
        Ok(Instruction::CloseAfterOneShot)
    }
}
