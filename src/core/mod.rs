/// Core data model: cluster members, roles, and topology snapshots
pub mod conn;
pub mod session;

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime};

use crate::core::conn::MemberRecord;

/// Default selection weight for hosts whose metadata carries none
pub const DEFAULT_WEIGHT: u32 = 1;

/// Network endpoint of a cluster member
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse error for `host:port` endpoint strings
#[derive(Debug, thiserror::Error)]
#[error("invalid endpoint '{0}', expected host:port")]
pub struct EndpointParseError(String);

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let colon = s
            .rfind(':')
            .ok_or_else(|| EndpointParseError(s.to_string()))?;
        let host = &s[..colon];
        let port = &s[colon + 1..];

        if host.is_empty() {
            return Err(EndpointParseError(s.to_string()));
        }

        let port: u16 = port
            .parse()
            .map_err(|_| EndpointParseError(s.to_string()))?;

        Ok(Endpoint::new(host, port))
    }
}

/// Role a member currently plays in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostRole {
    /// Accepts writes; at most one per committed topology
    Writer,
    /// Read-only replica
    Reader,
    /// Role not yet known (e.g. a seed before the first refresh,
    /// or a demoted duplicate writer row)
    Unknown,
}

impl HostRole {
    pub fn is_writer(&self) -> bool {
        matches!(self, HostRole::Writer)
    }

    pub fn is_reader(&self) -> bool {
        matches!(self, HostRole::Reader)
    }
}

impl fmt::Display for HostRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRole::Writer => write!(f, "WRITER"),
            HostRole::Reader => write!(f, "READER"),
            HostRole::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Last-known availability as reported by cluster metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Up,
    Down,
    Unknown,
}

impl fmt::Display for Availability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Availability::Up => write!(f, "UP"),
            Availability::Down => write!(f, "DOWN"),
            Availability::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// One cluster member as seen by a single topology snapshot.
///
/// HostInfo values are immutable; a new refresh produces new values
/// rather than mutating the ones already handed out.
#[derive(Debug, Clone, PartialEq)]
pub struct HostInfo {
    pub endpoint: Endpoint,
    pub role: HostRole,
    /// Selection weight; higher wins when picking among readers
    pub weight: u32,
    pub availability: Availability,
    /// Latency observed by the metadata query, when the engine reports one
    pub latency: Option<Duration>,
}

impl HostInfo {
    pub fn new(endpoint: Endpoint, role: HostRole) -> Self {
        Self {
            endpoint,
            role,
            weight: DEFAULT_WEIGHT,
            availability: Availability::Unknown,
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

    /// Whether the metadata marked this host as reachable
    pub fn is_up(&self) -> bool {
        !matches!(self.availability, Availability::Down)
    }
}

impl fmt::Display for HostInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.endpoint, self.role)
    }
}

/// Identity of one logical cluster, shared by all its logical connections
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClusterId {
    fn from(s: &str) -> Self {
        ClusterId::new(s)
    }
}

impl From<String> for ClusterId {
    fn from(s: String) -> Self {
        ClusterId::new(s)
    }
}

/// Immutable snapshot of one cluster's membership.
///
/// Versions increase monotonically per cluster; the topology cache only
/// accepts a snapshot whose version is newer than the committed one.
/// A committed snapshot never contains more than one WRITER: surplus
/// writer rows are demoted to UNKNOWN when the snapshot is built.
#[derive(Debug, Clone)]
pub struct Topology {
    cluster: ClusterId,
    version: u64,
    hosts: Vec<HostInfo>,
    created_at: SystemTime,
}

impl Topology {
    /// Build a snapshot from already-constructed hosts, enforcing the
    /// single-writer rule
    pub fn new(cluster: ClusterId, version: u64, hosts: Vec<HostInfo>) -> Self {
        let hosts = Self::demote_surplus_writers(&cluster, hosts);
        Self {
            cluster,
            version,
            hosts,
            created_at: SystemTime::now(),
        }
    }

    /// Build a snapshot from the raw rows a topology source returned
    pub fn from_members(cluster: ClusterId, version: u64, members: Vec<MemberRecord>) -> Self {
        let hosts = members.into_iter().map(HostInfo::from).collect();
        Self::new(cluster, version, hosts)
    }

    /// Keep the first writer row and demote the rest to UNKNOWN. Metadata
    /// can transiently report several writers mid-election; the cache must
    /// never hand out more than one as authoritative.
    fn demote_surplus_writers(cluster: &ClusterId, mut hosts: Vec<HostInfo>) -> Vec<HostInfo> {
        let mut seen_writer = false;
        for host in hosts.iter_mut() {
            if host.role.is_writer() {
                if seen_writer {
                    tracing::warn!(
                        "cluster '{}' reported multiple writers; demoting {} to UNKNOWN",
                        cluster,
                        host.endpoint
                    );
                    host.role = HostRole::Unknown;
                } else {
                    seen_writer = true;
                }
            }
        }
        hosts
    }

    pub fn cluster(&self) -> &ClusterId {
        &self.cluster
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn hosts(&self) -> &[HostInfo] {
        &self.hosts
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    /// The current writer, if the snapshot has one
    pub fn writer(&self) -> Option<&HostInfo> {
        self.hosts.iter().find(|h| h.role.is_writer())
    }

    pub fn has_writer(&self) -> bool {
        self.writer().is_some()
    }

    /// Readers in snapshot order
    pub fn readers(&self) -> impl Iterator<Item = &HostInfo> {
        self.hosts.iter().filter(|h| h.role.is_reader())
    }

    pub fn find(&self, endpoint: &Endpoint) -> Option<&HostInfo> {
        self.hosts.iter().find(|h| &h.endpoint == endpoint)
    }

    pub fn role_of(&self, endpoint: &Endpoint) -> Option<HostRole> {
        self.find(endpoint).map(|h| h.role)
    }
}
