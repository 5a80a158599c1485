/// Call tracing plugin: one log line per call with outcome and timing
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{CloseNext, ConnectNext, ConnectionPlugin, ExecuteNext};
use crate::core::conn::{ExecuteOutcome, Operation};
use crate::core::HostInfo;
use crate::error::RelevoResult;

#[derive(Default)]
pub struct CallTracePlugin;

impl CallTracePlugin {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ConnectionPlugin for CallTracePlugin {
    fn name(&self) -> &str {
        "call-trace"
    }

    async fn execute(&self, op: Operation, next: ExecuteNext<'_>) -> RelevoResult<ExecuteOutcome> {
        let ctx = next.ctx();
        let summary = op.describe();
        let started = Instant::now();

        let result = next.run(op).await;
        match &result {
            Ok(outcome) => debug!(
                "[{}] {} finished in {:?} ({} rows)",
                ctx.connection_id,
                summary,
                started.elapsed(),
                outcome.rows_affected
            ),
            Err(e) => warn!(
                "[{}] {} failed after {:?}: {}",
                ctx.connection_id,
                summary,
                started.elapsed(),
                e
            ),
        }
        result
    }

    async fn connect(&self, next: ConnectNext<'_>) -> RelevoResult<HostInfo> {
        let ctx = next.ctx();
        let started = Instant::now();

        let result = next.run().await;
        match &result {
            Ok(host) => info!(
                "[{}] connected to {} in {:?}",
                ctx.connection_id,
                host,
                started.elapsed()
            ),
            Err(e) => warn!(
                "[{}] connect failed after {:?}: {}",
                ctx.connection_id,
                started.elapsed(),
                e
            ),
        }
        result
    }

    async fn close(&self, next: CloseNext<'_>) -> RelevoResult<()> {
        let ctx = next.ctx();
        let result = next.run().await;
        debug!("[{}] closed", ctx.connection_id);
        result
    }
}
