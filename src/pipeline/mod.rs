/// Ordered plugin pipeline around connection calls
///
/// A logical connection resolves its plugin chain once, when it opens.
/// Every execute, connect and close call then flows outermost-first
/// through the chain and ends at the terminal, the connection core that
/// talks to the bound host. Plugins see the call on the way in and the
/// result on the way out, and may short-circuit either.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::core::conn::{ExecuteOutcome, Operation};
use crate::core::{ClusterId, HostInfo};
use crate::error::RelevoResult;

pub mod failover;
pub mod routing;
pub mod trace;

/// Facts about the logical connection, shared with every plugin
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub connection_id: String,
    pub cluster: ClusterId,
}

/// Innermost pipeline stage: the connection core bound to a host
#[async_trait]
pub trait PipelineTerminal: Send + Sync {
    async fn execute(&self, ctx: &OperationContext, op: &Operation) -> RelevoResult<ExecuteOutcome>;
    async fn connect(&self, ctx: &OperationContext) -> RelevoResult<HostInfo>;
    async fn close(&self, ctx: &OperationContext) -> RelevoResult<()>;
}

/// One stage in the connection pipeline.
///
/// Every hook defaults to passing the call through, so a plugin
/// implements only the calls it cares about.
#[async_trait]
pub trait ConnectionPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, op: Operation, next: ExecuteNext<'_>) -> RelevoResult<ExecuteOutcome> {
        next.run(op).await
    }

    async fn connect(&self, next: ConnectNext<'_>) -> RelevoResult<HostInfo> {
        next.run().await
    }

    async fn close(&self, next: CloseNext<'_>) -> RelevoResult<()> {
        next.run().await
    }
}

/// Remainder of the pipeline for one execute call
pub struct ExecuteNext<'a> {
    ctx: &'a OperationContext,
    rest: &'a [Arc<dyn ConnectionPlugin>],
    terminal: &'a dyn PipelineTerminal,
}

impl<'a> ExecuteNext<'a> {
    pub fn ctx(&self) -> &'a OperationContext {
        self.ctx
    }

    /// Hand the operation to the next stage
    pub fn run(self, op: Operation) -> BoxFuture<'a, RelevoResult<ExecuteOutcome>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, tail)) => {
                    let next = ExecuteNext {
                        ctx: self.ctx,
                        rest: tail,
                        terminal: self.terminal,
                    };
                    head.execute(op, next).await
                }
                None => self.terminal.execute(self.ctx, &op).await,
            }
        })
    }
}

/// Remainder of the pipeline for one connect call
pub struct ConnectNext<'a> {
    ctx: &'a OperationContext,
    rest: &'a [Arc<dyn ConnectionPlugin>],
    terminal: &'a dyn PipelineTerminal,
}

impl<'a> ConnectNext<'a> {
    pub fn ctx(&self) -> &'a OperationContext {
        self.ctx
    }

    pub fn run(self) -> BoxFuture<'a, RelevoResult<HostInfo>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, tail)) => {
                    let next = ConnectNext {
                        ctx: self.ctx,
                        rest: tail,
                        terminal: self.terminal,
                    };
                    head.connect(next).await
                }
                None => self.terminal.connect(self.ctx).await,
            }
        })
    }
}

/// Remainder of the pipeline for one close call
pub struct CloseNext<'a> {
    ctx: &'a OperationContext,
    rest: &'a [Arc<dyn ConnectionPlugin>],
    terminal: &'a dyn PipelineTerminal,
}

impl<'a> CloseNext<'a> {
    pub fn ctx(&self) -> &'a OperationContext {
        self.ctx
    }

    pub fn run(self) -> BoxFuture<'a, RelevoResult<()>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, tail)) => {
                    let next = CloseNext {
                        ctx: self.ctx,
                        rest: tail,
                        terminal: self.terminal,
                    };
                    head.close(next).await
                }
                None => self.terminal.close(self.ctx).await,
            }
        })
    }
}

/// Plugin chain resolved for one logical connection at open time.
/// The chain never changes afterwards; a different selection means
/// opening a new connection.
pub struct Pipeline {
    plugins: Vec<Arc<dyn ConnectionPlugin>>,
}

impl Pipeline {
    pub fn new(plugins: Vec<Arc<dyn ConnectionPlugin>>) -> Self {
        Self { plugins }
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub async fn execute(
        &self,
        ctx: &OperationContext,
        terminal: &dyn PipelineTerminal,
        op: Operation,
    ) -> RelevoResult<ExecuteOutcome> {
        let next = ExecuteNext {
            ctx,
            rest: &self.plugins,
            terminal,
        };
        next.run(op).await
    }

    pub async fn connect(
        &self,
        ctx: &OperationContext,
        terminal: &dyn PipelineTerminal,
    ) -> RelevoResult<HostInfo> {
        let next = ConnectNext {
            ctx,
            rest: &self.plugins,
            terminal,
        };
        next.run().await
    }

    pub async fn close(
        &self,
        ctx: &OperationContext,
        terminal: &dyn PipelineTerminal,
    ) -> RelevoResult<()> {
        let next = CloseNext {
            ctx,
            rest: &self.plugins,
            terminal,
        };
        next.run().await
    }
}

/// Plugin selection for a logical connection
#[derive(Clone)]
pub enum PluginDef {
    /// Log every call with its outcome and timing
    CallTrace,
    /// Stamp operations with the connection's target role
    RoleRouting,
    /// Caller-provided plugin instance
    Custom(Arc<dyn ConnectionPlugin>),
}

impl fmt::Debug for PluginDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginDef::CallTrace => write!(f, "CallTrace"),
            PluginDef::RoleRouting => write!(f, "RoleRouting"),
            PluginDef::Custom(plugin) => write!(f, "Custom({})", plugin.name()),
        }
    }
}
