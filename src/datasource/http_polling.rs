//! Turns a JSON-over-HTTP upstream into a stream by polling it.
//!
//! The first resolution fetches immediately; every subsequent one sleeps
//! the configured interval first. Each poll asks the caller to keep the
//! stream alive, so the driver re-executes the plan once per interval until
//! the request is cancelled.

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
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Configuration for one polled upstream.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HttpPollingDataSourceConfig {
    /// URL template, placeholders allowed.
    pub url: String,

    /// Delay between consecutive polls.
    pub interval_ms: u64,
}

/// Registers fields resolved by polling a REST upstream.
#[derive(Debug)]
pub struct HttpPollingDataSourceFactory {
    config: HttpPollingDataSourceConfig,
    client: reqwest::Client,
}

impl HttpPollingDataSourceFactory {
    pub fn new(config: HttpPollingDataSourceConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }
}

impl DataSourcePlannerFactory for HttpPollingDataSourceFactory {
    fn create_planner(&self) -> Box<dyn DataSourcePlanning> {
        Box::new(HttpPollingDataSourcePlanner {
            config: self.config.clone(),
            client: self.client.clone(),
        })
    }
}

struct HttpPollingDataSourcePlanner {
    config: HttpPollingDataSourceConfig,
    client: reqwest::Client,
}

impl DataSourcePlanning for HttpPollingDataSourcePlanner {
    fn plan_field(
        self: Box<Self>,
        context: &PlanningContext<'_>,
        field: &Field,
        arguments: &mut ArgumentAccumulator,
    ) -> Result<PlannedDataSource, PlanError> {
        let mut placeholders = Vec::new();
        scan_placeholders(&self.config.url, &mut placeholders);
        bind_placeholders(placeholders, field, context.operation, arguments)?;

        Ok(PlannedDataSource {
            source: Arc::new(HttpPollingDataSource {
                config: self.config,
                client: self.client,
                polled_once: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            root_path: None,
        })
    }
}

/// Polls one REST upstream at a fixed interval.
#[derive(Debug)]
pub struct HttpPollingDataSource {
    config: HttpPollingDataSourceConfig,
    client: reqwest::Client,
    polled_once: AtomicBool,

    /// Set once the stream has been closed; further resolutions are refused
    /// without touching the upstream.
    closed: AtomicBool,
}

impl HttpPollingDataSource {
    fn close(&self) -> Instruction {
        self.closed.store(true, Ordering::SeqCst);
        Instruction::CloseConnection
    }
}

#[async_trait]
impl DataSource for HttpPollingDataSource {
    async fn resolve(
        &self,
        context: &Context,
        arguments: &[ResolvedArgument],
        sink: &mut Vec<u8>,
    ) -> Result<Instruction, FetchError> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(Instruction::CloseConnection);
        }
        if self.polled_once.swap(true, Ordering::SeqCst) {
            tokio::select! {
                _ = context.cancelled() => return Ok(self.close()),
                _ = tokio::time::sleep(Duration::from_millis(self.config.interval_ms)) => {}
            }
        }

        let url = substitute(&self.config.url, arguments)?;
        debug!(url = url.as_str(), "polling upstream");

        let response = tokio::select! {
            _ = context.cancelled() => return Ok(self.close()),
            response = self.client.get(&url).send() => {
                response.map_err(|err| FetchError::SubrequestHttpError {
                    upstream: url.clone(),
                    reason: err.to_string(),
                })?
            }
        };
        if !response.status().is_success() {
            return Err(FetchError::SubrequestHttpError {
                upstream: url,
                reason: format!("unexpected status {}", response.status().as_u16()),
            });
        }
        let payload = response
            .bytes()
            .await
            .map_err(|err| FetchError::SubrequestHttpError {
                upstream: url,
                reason: err.to_string(),
            })?;

        sink.extend_from_slice(&payload);
        Ok(Instruction::KeepStreamAlive)
    }

    fn is_streaming(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn source(interval_ms: u64) -> HttpPollingDataSource {
        HttpPollingDataSource {
            config: HttpPollingDataSourceConfig {
                url: "http://feed.local/ticker".to_string(),
                interval_ms,
            },
            client: reqwest::Client::new(),
            polled_once: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[tokio::test]
    async fn cancellation_during_the_interval_closes_the_stream() {
        let source = source(60_000);
        source.polled_once.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        token.cancel();
        let context = Context::new(Default::default()).with_cancellation(token);

        let mut sink = Vec::new();
        let instruction = source.resolve(&context, &[], &mut sink).await.unwrap();
        assert_eq!(instruction, Instruction::CloseConnection);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn a_closed_stream_stays_closed() {
        let source = source(60_000);
        source.polled_once.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        token.cancel();
        let context = Context::new(Default::default()).with_cancellation(token);

        let mut sink = Vec::new();
        let instruction = source.resolve(&context, &[], &mut sink).await.unwrap();
        assert_eq!(instruction, Instruction::CloseConnection);

        // a fresh, non-cancelled context cannot revive the stream
        let context = Context::new(Default::default());
        let instruction = source.resolve(&context, &[], &mut sink).await.unwrap();
        assert_eq!(instruction, Instruction::CloseConnection);
        assert!(sink.is_empty());
    }

    #[test]
    fn reports_itself_as_streaming() {
        assert!(source(1).is_streaming());
    }
}
