//! Formation Coordinator
//!
//! One-shot background task that drives the cluster from "configured" to
//! "balanced": it probes every unreachable member through the join
//! protocol until all of them are reachable, then runs the balancer
//! exactly once and ends.
//!
//! ```text
//! Init --grace--> Converging --all reachable--> Converged --balance--> Balanced
//! ```

use std::sync::Arc;
use std::time::Duration;
use futures::future::join_all;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::balancer::PartitionTable;
use super::state::ClusterState;
use crate::error::{Error, Result};
use crate::network::Joiner;

/// Coordinator phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormationPhase {
    /// Waiting for local listeners before the first probe
    Init,
    /// Probing unreachable members
    Converging,
    /// Every member reachable, balancing
    Converged,
    /// Partition table computed; terminal
    Balanced,
}

impl std::fmt::Display for FormationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FormationPhase::Init => write!(f, "INIT"),
            FormationPhase::Converging => write!(f, "CONVERGING"),
            FormationPhase::Converged => write!(f, "CONVERGED"),
            FormationPhase::Balanced => write!(f, "BALANCED"),
        }
    }
}

/// Formation tuning
#[derive(Debug, Clone)]
pub struct FormationConfig {
    /// Delay before the first probe pass
    pub grace_period: Duration,
    /// Sleep after a pass; also the value backoff resets to
    pub probe_interval: Duration,
    /// Cap for the backed-off sleep
    pub max_probe_interval: Duration,
    /// Stop with an error after this many passes (None = never)
    pub max_probe_passes: Option<u32>,
    /// Hash space handed to the balancer
    pub hash_span: u64,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(2),
            probe_interval: Duration::from_secs(3),
            max_probe_interval: Duration::from_secs(30),
            max_probe_passes: None,
            hash_span: 16384,
        }
    }
}

/// Outcome of a completed formation
#[derive(Debug, Clone)]
pub struct FormationReport {
    /// Probe passes it took to converge
    pub passes: u32,
    /// Table computed by the balancer
    pub partition: PartitionTable,
}

/// Sleep before the next pass. Progress resets the backoff, a pass that
/// joined nobody doubles it up to the cap.
fn next_delay(current: Duration, progressed: bool, config: &FormationConfig) -> Duration {
    if progressed {
        config.probe_interval
    } else {
        current.saturating_mul(2).min(config.max_probe_interval)
    }
}

/// Add up to 10% random jitter
fn jittered(delay: Duration) -> Duration {
    let max_jitter = delay.as_millis() as u64 / 10;
    if max_jitter == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=max_jitter);
    delay + Duration::from_millis(extra)
}

/// Resolve once shutdown is requested; never if the sender goes away
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Drives cluster formation
pub struct FormationCoordinator {
    state: Arc<ClusterState>,
    joiner: Joiner,
    config: FormationConfig,
    phase: watch::Sender<FormationPhase>,
    shutdown: watch::Receiver<bool>,
}

impl FormationCoordinator {
    /// Create a coordinator. Sending `true` on the shutdown channel aborts
    /// formation between probe passes.
    pub fn new(
        state: Arc<ClusterState>,
        joiner: Joiner,
        config: FormationConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (phase, _) = watch::channel(FormationPhase::Init);
        Self {
            state,
            joiner,
            config,
            phase,
            shutdown,
        }
    }

    /// Start formation on the runtime
    pub fn spawn(self) -> FormationHandle {
        let phase = self.phase.subscribe();
        let task = tokio::spawn(self.run());
        FormationHandle { task, phase }
    }

    /// Run formation to completion
    pub async fn run(mut self) -> Result<FormationReport> {
        self.set_phase(FormationPhase::Init);
        tracing::debug!("Formation starts in {:?}", self.config.grace_period);
        self.pause(self.config.grace_period).await?;

        self.set_phase(FormationPhase::Converging);
        let mut passes: u32 = 0;
        let mut delay = self.config.probe_interval;

        loop {
            passes += 1;
            let joined = self.probe_pass(passes).await;

            if let Some(report) = self.try_balance(passes).await? {
                return Ok(report);
            }

            if let Some(max) = self.config.max_probe_passes {
                if passes >= max {
                    let unreachable = self.state.unreachable_count().await;
                    tracing::error!(
                        "Cluster did not form after {} probe passes, {} nodes unreachable",
                        passes,
                        unreachable
                    );
                    return Err(Error::FormationStalled { passes, unreachable });
                }
            }

            if joined > 0 {
                delay = self.config.probe_interval;
            }
            self.pause(jittered(delay)).await?;
            delay = next_delay(delay, joined > 0, &self.config);
        }
    }

    /// Probe every member that is neither us nor reachable. Returns how many joined.
    async fn probe_pass(&self, pass: u32) -> usize {
        let targets = self.state.unreachable_members().await;
        tracing::debug!("Probe pass {}: {} nodes to reach", pass, targets.len());

        let probes = targets.iter().map(|peer| async move {
            tracing::debug!(
                "Trying to connect to cluster node {} at {}:{}",
                peer.name,
                peer.address,
                peer.bus_port
            );
            (peer, self.joiner.join(&peer.address, peer.client_port).await)
        });

        let mut joined = 0;
        for (peer, result) in join_all(probes).await {
            match result {
                Ok(link) => {
                    match self.state.mark_reachable(&peer.address, peer.client_port, link).await {
                        Ok(_) => {
                            joined += 1;
                            tracing::debug!("Cluster node {} reachable", peer.name);
                        }
                        Err(e) => tracing::warn!("Joined {} but could not record it: {}", peer.name, e),
                    }
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!("Cluster node {} unreachable: {}", peer.name, e);
                }
                Err(e) => {
                    tracing::warn!("Join with cluster node {} failed: {}", peer.name, e);
                }
            }
        }

        joined
    }

    /// If every member is reachable, clear the formation flag and balance.
    /// Both happen under one lock so no probe result or inbound join lands
    /// between the check and the balance.
    async fn try_balance(&self, passes: u32) -> Result<Option<FormationReport>> {
        let mut inner = self.state.lock().await;

        let unreachable = inner.membership.unreachable_count();
        if unreachable > 0 {
            tracing::debug!("Formation pending: {} nodes unreachable", unreachable);
            return Ok(None);
        }

        tracing::info!(
            "All {} cluster nodes reachable after {} probe passes",
            inner.membership.len(),
            passes
        );

        // Formation stays pending if the table cannot be built
        let partition = inner.rebalance(self.config.hash_span)?;
        inner.formation_pending = false;
        self.set_phase(FormationPhase::Converged);
        drop(inner);
        self.set_phase(FormationPhase::Balanced);

        tracing::info!(
            "Cluster balanced over {} slots (table fingerprint {:08x})",
            partition.hash_span(),
            partition.fingerprint()
        );
        for entry in partition.entries() {
            tracing::info!(
                "Node {} {}:{} owns {}",
                entry.name,
                entry.address,
                entry.client_port,
                entry.range
            );
        }

        Ok(Some(FormationReport { passes, partition }))
    }

    /// Sleep, returning early with `Cancelled` on shutdown
    async fn pause(&mut self, duration: Duration) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = shutdown_requested(&mut self.shutdown) => {
                tracing::info!("Cluster formation cancelled");
                Err(Error::Cancelled)
            }
        }
    }

    fn set_phase(&self, phase: FormationPhase) {
        tracing::debug!("Formation phase: {}", phase);
        self.phase.send_replace(phase);
    }
}

/// Handle to a running coordinator
pub struct FormationHandle {
    task: JoinHandle<Result<FormationReport>>,
    phase: watch::Receiver<FormationPhase>,
}

impl FormationHandle {
    /// Latest published phase
    pub fn phase(&self) -> FormationPhase {
        *self.phase.borrow()
    }

    /// Watch phase changes
    pub fn subscribe(&self) -> watch::Receiver<FormationPhase> {
        self.phase.clone()
    }

    /// Wait for the coordinator to finish
    pub async fn wait(self) -> Result<FormationReport> {
        self.task
            .await
            .map_err(|e| Error::Internal(format!("formation task failed: {}", e)))?
    }
}
