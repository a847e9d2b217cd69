//! Ingestion service
//!
//! One [`supervisor::PollLoopSupervisor`] per configured source, each on its
//! own task, each publishing canonical envelopes to its topic.

pub mod config;
pub mod metrics;
pub mod sources;
pub mod supervisor;

use event_bus::{EnvelopePublisher, ShutdownSignal};
use metrics::Metrics;
use sources::SourceBinding;
use supervisor::{PollLoopState, PollLoopSupervisor, SupervisorSettings};
use tokio::task::JoinHandle;

/// Spawn one poll loop per binding; every handle yields the loop's final state.
pub fn spawn_supervisors(
    bindings: Vec<SourceBinding>,
    publisher: EnvelopePublisher,
    backoff: std::time::Duration,
    max_pending: usize,
    metrics: Metrics,
    shutdown: ShutdownSignal,
) -> Vec<JoinHandle<PollLoopState>> {
    bindings
        .into_iter()
        .map(|binding| {
            let mut supervisor = PollLoopSupervisor::new(
                binding.adapter,
                publisher.clone(),
                SupervisorSettings {
                    topic: binding.topic,
                    backoff,
                    max_pending,
                },
                metrics.clone(),
            );
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                supervisor.run(shutdown).await;
                supervisor.state().clone()
            })
        })
        .collect()
}
