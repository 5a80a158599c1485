/// Failover coordination for one logical connection
///
/// The coordinator owns the connection's failover phase and serializes
/// recovery: however many callers observe the same connectivity loss,
/// exactly one drives the search for a replacement host while the rest
/// wait for the outcome. Writer connections wait for the cluster to
/// elect a new writer; reader connections re-route to another reader
/// from the already cached topology.
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionCore;
use crate::core::conn::{ExecuteOutcome, Operation};
use crate::core::{Endpoint, HostInfo, HostRole};
use crate::error::{RelevoError, RelevoResult};
use crate::monitor::HostHealth;
use crate::utils::{backoff_delay, format_duration};

/// Where a connection stands in its failover lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailoverPhase {
    /// Bound to a host and serving calls
    Connected,
    /// A connectivity loss was observed and recovery is starting
    FailureDetected,
    /// Looking for a replacement host
    SeekingHost,
    /// A candidate was chosen and is being adopted
    Reconnecting,
    /// A replacement host is bound and session state is back in place
    Resumed,
    /// Recovery failed; the connection only answers with errors
    FailedPermanently,
}

impl fmt::Display for FailoverPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailoverPhase::Connected => "CONNECTED",
            FailoverPhase::FailureDetected => "FAILURE_DETECTED",
            FailoverPhase::SeekingHost => "SEEKING_HOST",
            FailoverPhase::Reconnecting => "RECONNECTING",
            FailoverPhase::Resumed => "RESUMED",
            FailoverPhase::FailedPermanently => "FAILED_PERMANENTLY",
        };
        write!(f, "{}", name)
    }
}

/// Drives recovery for one logical connection
pub struct FailoverCoordinator {
    core: Arc<ConnectionCore>,
    phase_tx: watch::Sender<FailoverPhase>,
    // held by whichever task is currently driving recovery
    failover_gate: Mutex<()>,
}

impl FailoverCoordinator {
    pub(crate) fn new(core: Arc<ConnectionCore>) -> Arc<Self> {
        let (phase_tx, _) = watch::channel(FailoverPhase::Connected);
        Arc::new(Self {
            core,
            phase_tx,
            failover_gate: Mutex::new(()),
        })
    }

    pub(crate) fn core(&self) -> &Arc<ConnectionCore> {
        &self.core
    }

    pub fn phase(&self) -> FailoverPhase {
        *self.phase_tx.borrow()
    }

    /// Phase transitions as they happen
    pub fn phase_watch(&self) -> watch::Receiver<FailoverPhase> {
        self.phase_tx.subscribe()
    }

    /// Admission check run before every call on the connection.
    ///
    /// While a failover runs, new calls are either rejected or held
    /// until the connection settles, per configuration.
    pub(crate) async fn gate_call(&self) -> RelevoResult<()> {
        if self.core.is_closed() {
            return Err(RelevoError::ConnectionClosed);
        }
        match self.phase() {
            FailoverPhase::Connected => Ok(()),
            FailoverPhase::FailedPermanently => Err(RelevoError::FailedPermanently),
            _ => {
                if self.core.config().failover.reject_calls_during_failover {
                    return Err(RelevoError::FailoverInProgress);
                }
                match self.wait_settled().await? {
                    FailoverPhase::FailedPermanently => Err(RelevoError::FailedPermanently),
                    _ => Ok(()),
                }
            }
        }
    }

    /// Wait until the connection is either serving again or permanently
    /// failed. Resolves early when the connection is closed.
    pub(crate) async fn wait_settled(&self) -> RelevoResult<FailoverPhase> {
        let mut rx = self.phase_tx.subscribe();
        loop {
            if self.core.is_closed() {
                return Err(RelevoError::ConnectionClosed);
            }
            let phase = *rx.borrow_and_update();
            if matches!(
                phase,
                FailoverPhase::Connected | FailoverPhase::FailedPermanently
            ) {
                return Ok(phase);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(RelevoError::ConnectionClosed);
                    }
                }
                _ = self.core.wait_closed() => {
                    return Err(RelevoError::ConnectionClosed);
                }
            }
        }
    }

    /// React to a connectivity loss on `failed`.
    ///
    /// The first caller in drives recovery; concurrent callers wait for
    /// its outcome. On success returns `Ok(Some(outcome))` when the
    /// operation was a read and read retries are enabled, otherwise
    /// `Ok(None)` so the caller can surface the original error.
    pub(crate) async fn handle_failure(
        &self,
        failed: Endpoint,
        op: &Operation,
    ) -> RelevoResult<Option<ExecuteOutcome>> {
        let guard = match self.failover_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                // another caller is already recovering this connection
                return match self.wait_settled().await? {
                    FailoverPhase::FailedPermanently => Err(RelevoError::FailedPermanently),
                    _ => Ok(None),
                };
            }
        };

        if self.core.is_closed() {
            return Err(RelevoError::ConnectionClosed);
        }
        if self.phase() == FailoverPhase::FailedPermanently {
            return Err(RelevoError::FailedPermanently);
        }

        let started = Instant::now();
        self.set_phase(FailoverPhase::FailureDetected);
        let failure_version = self
            .core
            .topology()
            .committed_version(self.core.cluster())
            .await;
        warn!(
            "[{}] connectivity lost to {}, starting failover (topology v{})",
            self.core.id(),
            failed,
            failure_version
        );
        // writer recovery refreshes synchronously while it waits; reader
        // re-routing reads the cache, so the refresh runs in the background
        if self.core.target_role() != HostRole::Writer {
            self.core
                .topology()
                .refresh_soon(self.core.cluster())
                .await;
        }

        match self.run_failover(&failed, failure_version).await {
            Ok(host) => {
                info!(
                    "[{}] failover complete: {} -> {} in {}",
                    self.core.id(),
                    failed,
                    host.endpoint,
                    format_duration(started.elapsed())
                );
                let retried = if op.is_read()
                    && self.core.config().failover.retry_reads_after_failover
                {
                    debug!(
                        "[{}] retrying read on {} after failover",
                        self.core.id(),
                        host.endpoint
                    );
                    Some(self.core.execute_direct(op).await)
                } else {
                    None
                };
                self.set_phase(FailoverPhase::Connected);
                drop(guard);
                match retried {
                    Some(result) => result.map(Some),
                    None => Ok(None),
                }
            }
            Err(e) => {
                self.set_phase(FailoverPhase::FailedPermanently);
                if matches!(e, RelevoError::ConnectionClosed) {
                    debug!("[{}] failover abandoned, connection closed", self.core.id());
                } else {
                    error!(
                        "[{}] failover failed permanently after {}: {}",
                        self.core.id(),
                        format_duration(started.elapsed()),
                        e
                    );
                }
                Err(e)
            }
        }
    }

    async fn run_failover(
        &self,
        failed: &Endpoint,
        failure_version: u64,
    ) -> RelevoResult<HostInfo> {
        let started = Instant::now();
        let max_attempts = self.core.config().failover.reconnect_max_attempts;
        let backoff_base = self.core.config().failover.reconnect_backoff_base();
        let backoff_cap = self.core.config().failover.reconnect_backoff_cap();
        let mut attempt: u32 = 0;

        loop {
            if self.core.is_closed() {
                return Err(RelevoError::ConnectionClosed);
            }
            if attempt >= max_attempts {
                return Err(RelevoError::no_available_host(
                    self.core.cluster().clone(),
                    self.core.target_role(),
                ));
            }

            self.set_phase(FailoverPhase::SeekingHost);
            let candidate = match self.core.target_role() {
                HostRole::Writer => self.await_new_writer(failure_version, started).await?,
                _ => self.pick_reader(failed).await?,
            };

            self.set_phase(FailoverPhase::Reconnecting);
            match self.core.adopt(&candidate).await {
                Ok(replay) => {
                    self.set_phase(FailoverPhase::Resumed);
                    if replay.skipped > 0 {
                        warn!(
                            "[{}] {} session settings could not be replayed on {}",
                            self.core.id(),
                            replay.skipped,
                            candidate.endpoint
                        );
                    }
                    return Ok(candidate);
                }
                Err(e) => {
                    attempt += 1;
                    debug!(
                        "[{}] reconnect attempt {} to {} failed: {}",
                        self.core.id(),
                        attempt,
                        candidate.endpoint,
                        e
                    );
                    let delay =
                        backoff_delay(backoff_base, attempt.saturating_sub(1), backoff_cap);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.core.wait_closed() => {
                            return Err(RelevoError::ConnectionClosed);
                        }
                    }
                }
            }
        }
    }

    /// Poll the topology until it commits a view newer than the one the
    /// failure was observed under and that view names a live writer.
    async fn await_new_writer(
        &self,
        failure_version: u64,
        started: Instant,
    ) -> RelevoResult<HostInfo> {
        let budget = self.core.config().failover.writer_failover_timeout();
        let poll = self.core.config().failover.writer_poll_interval();

        loop {
            match self.core.topology().refresh(self.core.cluster()).await {
                Ok(topo) if topo.version() > failure_version => {
                    if let Some(writer) = topo.writer() {
                        if self.core.monitors().health_of(&writer.endpoint)
                            != Some(HostHealth::Dead)
                        {
                            return Ok(writer.clone());
                        }
                        debug!(
                            "[{}] topology v{} still names {} as writer but its monitor says dead",
                            self.core.id(),
                            topo.version(),
                            writer.endpoint
                        );
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(
                        "[{}] topology refresh during failover failed: {}",
                        self.core.id(),
                        e
                    );
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                return Err(RelevoError::failover_timeout("writer election wait", elapsed));
            }
            tokio::select! {
                _ = tokio::time::sleep(poll) => {}
                _ = self.core.wait_closed() => {
                    return Err(RelevoError::ConnectionClosed);
                }
            }
        }
    }

    /// Choose a replacement reader from the topology already in cache.
    /// Monitored-alive hosts are preferred over unknown ones, which in
    /// turn beat suspects; dead hosts and the failed host are skipped.
    async fn pick_reader(&self, failed: &Endpoint) -> RelevoResult<HostInfo> {
        let topo = match self.core.topology().cached(self.core.cluster()).await {
            Some(topo) => topo,
            None => self.core.topology().refresh(self.core.cluster()).await?,
        };

        let mut ranked: Vec<(u8, &HostInfo)> = Vec::new();
        for host in topo.readers() {
            if &host.endpoint == failed {
                continue;
            }
            let rank = match self.core.monitors().health_of(&host.endpoint) {
                Some(HostHealth::Alive) => 0,
                None => 1,
                Some(HostHealth::Suspect) => 2,
                Some(HostHealth::Dead) => continue,
            };
            ranked.push((rank, host));
        }
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then_with(|| b.1.weight.cmp(&a.1.weight))
                .then_with(|| a.1.endpoint.cmp(&b.1.endpoint))
        });

        if let Some((_, host)) = ranked.first() {
            return Ok((*host).clone());
        }

        // no reader left; the writer can absorb reader traffic
        if let Some(writer) = topo.writer() {
            if &writer.endpoint != failed
                && self.core.monitors().health_of(&writer.endpoint) != Some(HostHealth::Dead)
            {
                return Ok(writer.clone());
            }
        }

        Err(RelevoError::no_available_host(
            self.core.cluster().clone(),
            HostRole::Reader,
        ))
    }

    /// Voluntary move to `host` outside of failure handling. Declines
    /// (returns false) rather than waits when recovery is running.
    pub(crate) async fn try_rebind(&self, host: &HostInfo) -> RelevoResult<bool> {
        let _guard = match self.failover_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(false),
        };
        if self.core.is_closed() {
            return Err(RelevoError::ConnectionClosed);
        }
        if self.phase() != FailoverPhase::Connected {
            return Ok(false);
        }

        match self.core.adopt(host).await {
            Ok(_) => {
                info!("[{}] rebound to {}", self.core.id(), host.endpoint);
                Ok(true)
            }
            Err(e) => {
                debug!(
                    "[{}] rebind to {} declined: {}",
                    self.core.id(),
                    host.endpoint,
                    e
                );
                Ok(false)
            }
        }
    }

    fn set_phase(&self, phase: FailoverPhase) {
        let previous = self.phase_tx.send_replace(phase);
        if previous != phase {
            debug!("[{}] failover phase {} -> {}", self.core.id(), previous, phase);
        }
    }
}
