//! Streams field data from a NATS subject.
//!
//! Connection and subscription are established lazily on the first
//! resolution and reused for the life of the plan. Every delivered message
//! body becomes one execution of the plan; the stream closes when the
//! subject subscription ends or the request is cancelled.

use crate::ast::Field;
use crate::context::Context;
use crate::datasource::http_json::{bind_placeholders, scan_placeholders, substitute};
use crate::datasource::{
    DataSource, DataSourcePlannerFactory, DataSourcePlanning, Instruction, PlannedDataSource,
    PlanningContext,
};
use crate::error::{FetchError, PlanError};
use crate::plan::{ArgumentAccumulator, ResolvedArgument};
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// Configuration for one NATS-backed subscription field.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct NatsDataSourceConfig {
    /// Server address, e.g. `nats://localhost:4222`.
    pub servers: String,

    /// Subject template, placeholders allowed.
    pub subject: String,
}

/// Registers fields streamed from a NATS subject.
#[derive(Debug)]
pub struct NatsDataSourceFactory {
    config: NatsDataSourceConfig,
}

impl NatsDataSourceFactory {
    pub fn new(config: NatsDataSourceConfig) -> Self {
        Self { config }
    }
}

impl DataSourcePlannerFactory for NatsDataSourceFactory {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
        Box::new(NatsDataSourcePlanner {
            config: self.config.clone(),
        })
    }
}

struct NatsDataSourcePlanner {
    config: NatsDataSourceConfig,
}

impl DataSourcePlanning for NatsDataSourcePlanner {
    fn plan_field(
        self: Box<Self>,
        context: &PlanningContext<'_>,
        field: &Field,
        arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError> {
        let mut placeholders = Vec::new();
        scan_placeholders(&self.config.subject, &mut placeholders);
        bind_placeholders(placeholders, field, context.operation, arguments)?;

        Ok(PlannedDataSource {
            source: Arc::new(NatsDataSource {
                config: self.config,
                connection: OnceCell::new(),
            }),
            root_path: None,
        })
    }
}

struct NatsConnection {
    // keeps the connection alive for the life of the subscription
    _client: async_nats::Client,
    subscriber: Mutex<async_nats::Subscriber>,
}

/// Streams messages from one NATS subject.
pub struct NatsDataSource {
    config: NatsDataSourceConfig,
    connection: OnceCell<NatsConnection>,
}

impl fmt::Debug for NatsDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NatsDataSource")
            .field("servers", &self.config.servers)
            .field("subject", &self.config.subject)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

impl NatsDataSource {
    async fn connect(&self, arguments: &[ResolvedArgument]) -> Result<NatsConnection, FetchError> {
        let subject = substitute(&self.config.subject, arguments)?;
        debug!(
            servers = self.config.servers.as_str(),
            subject = subject.as_str(),
            "subscribing"
        );
        let client = async_nats::connect(self.config.servers.as_str()).await.map_err(|err| {
            FetchError::SubscriptionError {
                reason: err.to_string(),
            }
        })?;
        let subscriber =
            client
                .subscribe(subject)
                .await
                .map_err(|err| FetchError::SubscriptionError {
                    reason: err.to_string(),
                })?;
        Ok(NatsConnection {
            _client: client,
            subscriber: Mutex::new(subscriber),
        })
    }
}

#[async_trait]
impl DataSource for NatsDataSource {
    async fn resolve(
        &self,
        context: &Context,
        arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError> {
        let connection = self
            .connection
            .get_or_try_init(|| self.connect(arguments))
            .await?;

        let mut subscriber = connection.subscriber.lock().await;
        let message = tokio::select! {
            _ = context.cancelled() => return Ok(Instruction::CloseConnection),
            message = subscriber.next() => message,
        };
        match message {
            Some(message) => {
                sink.extend_from_slice(&message.payload);
                Ok(Instruction::KeepStreamAlive)
            }
            None => Ok(Instruction::CloseConnection),
        }
    }

    fn is_streaming(&self) -> bool {
        true
    }
}
