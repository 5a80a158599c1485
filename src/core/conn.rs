/// Engine-facing capability traits and the values that cross them
///
/// The failover core never speaks a database wire protocol itself. It
/// drives an engine adapter through `PhysicalConnection` (execute, ping,
/// apply a session setting, close), obtains new physical connections from
/// a `ConnectionFactory` (which captures engine parameters and credentials
/// at construction), and reads raw cluster membership rows through a
/// `TopologySource`.
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::core::{Availability, Endpoint, HostInfo, HostRole, DEFAULT_WEIGHT};
use crate::error::EngineError;

/// Whether an operation was declared read-only by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Read,
    Write,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Read => write!(f, "read"),
            OperationKind::Write => write!(f, "write"),
        }
    }
}

/// One caller operation, opaque to the failover core.
///
/// The payload is whatever the engine adapter understands (SQL text, a
/// prepared-statement handle, a protocol frame). The kind is a caller
/// assertion, not something this layer infers: only operations built with
/// [`Operation::read`] are ever eligible for post-failover retry.
#[derive(Debug, Clone)]
pub struct Operation {
    kind: OperationKind,
    payload: Bytes,
    target: Option<HostRole>,
}

impl Operation {
    /// A read-only operation
    pub fn read<B: Into<Bytes>>(payload: B) -> Self {
        Self {
            kind: OperationKind::Read,
            payload: payload.into(),
            target: None,
        }
    }

    /// An operation that may have side effects
    pub fn write<B: Into<Bytes>>(payload: B) -> Self {
        Self {
            kind: OperationKind::Write,
            payload: payload.into(),
            target: None,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn is_read(&self) -> bool {
        matches!(self.kind, OperationKind::Read)
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Role this operation should run against, when a routing stage set one
    pub fn target(&self) -> Option<HostRole> {
        self.target
    }

    pub fn set_target(&mut self, role: HostRole) {
        self.target = Some(role);
    }

    /// Short description for log lines
    pub fn describe(&self) -> String {
        format!("{} op ({} bytes)", self.kind, self.payload.len())
    }
}

/// Result of a successfully executed operation
#[derive(Debug, Clone, PartialEq)]
pub struct ExecuteOutcome {
    pub rows_affected: u64,
    pub payload: Bytes,
}

impl ExecuteOutcome {
    pub fn new<B: Into<Bytes>>(rows_affected: u64, payload: B) -> Self {
        Self {
            rows_affected,
            payload: payload.into(),
        }
    }

    pub fn empty() -> Self {
        Self {
            rows_affected: 0,
            payload: Bytes::new(),
        }
    }
}

/// Transaction isolation levels a session can request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// One session-level setting, applied to a live connection and recorded
/// for replay after a reconnect
#[derive(Debug, Clone, PartialEq)]
pub enum SessionSetting {
    Autocommit(bool),
    Isolation(IsolationLevel),
    ReadOnly(bool),
    Variable { name: String, value: String },
}

impl fmt::Display for SessionSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionSetting::Autocommit(on) => write!(f, "autocommit={}", on),
            SessionSetting::Isolation(level) => write!(f, "isolation={}", level),
            SessionSetting::ReadOnly(on) => write!(f, "read_only={}", on),
            SessionSetting::Variable { name, value } => write!(f, "{}={}", name, value),
        }
    }
}

/// Raw membership row returned by a topology source, before the
/// single-writer rule is applied
#[derive(Debug, Clone, PartialEq)]
pub struct MemberRecord {
    pub endpoint: Endpoint,
    pub role: HostRole,
    pub weight: u32,
    pub availability: Availability,
    pub latency: Option<Duration>,
}

impl MemberRecord {
    pub fn new(endpoint: Endpoint, role: HostRole) -> Self {
        Self {
            endpoint,
            role,
            weight: DEFAULT_WEIGHT,
            availability: Availability::Up,
            latency: None,
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_availability(mut self, availability: Availability) -> Self {
        self.availability = availability;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

impl From<MemberRecord> for HostInfo {
    fn from(record: MemberRecord) -> Self {
        let mut host = HostInfo::new(record.endpoint, record.role)
            .with_weight(record.weight)
            .with_availability(record.availability);
        host.latency = record.latency;
        host
    }
}

/// One live physical connection to a specific host.
///
/// Implementations are exclusively owned wherever they are held; the
/// core never shares one across logical connections. Dropping a value
/// must release its resources; `close` additionally allows a graceful
/// engine-level goodbye and is best-effort.
#[async_trait]
pub trait PhysicalConnection: Send {
    /// Run one operation to completion
    async fn execute(&mut self, op: &Operation) -> Result<ExecuteOutcome, EngineError>;

    /// Trivial liveness round trip, cheaper than any real operation
    async fn ping(&mut self) -> Result<(), EngineError>;

    /// Apply a session-level setting
    async fn apply(&mut self, setting: &SessionSetting) -> Result<(), EngineError>;

    /// Graceful shutdown of this connection
    async fn close(&mut self) -> Result<(), EngineError>;
}

/// Opens physical connections. Engine parameters and credentials are
/// captured by the implementation at construction time, so the core only
/// ever names the host it wants.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, host: &HostInfo) -> Result<Box<dyn PhysicalConnection>, EngineError>;
}

/// Answers the cluster membership query over any reachable physical
/// connection. Engine-specific row parsing lives behind this trait.
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn fetch_members(
        &self,
        conn: &mut dyn PhysicalConnection,
    ) -> Result<Vec<MemberRecord>, EngineError>;
}
