//! Chunk placement policy: an in-memory usage table seeded from `about`,
//! and the strategy that picks the next remote.

pub mod rebalance;

use crate::error::PoolError;
use crate::transport::{RemoteSpace, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    #[default]
    LeastUsed,
    RoundRobinLeastUsed,
}

#[derive(Debug, Clone, Copy)]
struct Usage {
    space: RemoteSpace,
    /// A remote whose `about` failed stays ineligible until re-seeded.
    reachable: bool,
}

#[derive(Debug, Clone)]
pub struct UsageView {
    pub remote: String,
    pub space: RemoteSpace,
    pub reachable: bool,
}

struct State {
    usage: HashMap<String, Usage>,
    cursor: usize,
}

pub struct Balancer {
    remotes: Vec<String>,
    strategy: Strategy,
    state: Mutex<State>,
}

impl Balancer {
    pub fn new(remotes: Vec<String>, strategy: Strategy) -> Self {
        let usage = remotes
            .iter()
            .map(|r| {
                (
                    r.clone(),
                    Usage {
                        space: RemoteSpace::default(),
                        reachable: false,
                    },
                )
            })
            .collect();
        Self {
            remotes,
            strategy,
            state: Mutex::new(State { usage, cursor: 0 }),
        }
    }

    /// Refresh the table from `about`. Failures leave the remote marked
    /// unreachable rather than aborting.
    pub async fn seed(&self, transport: &dyn Transport) {
        for remote in &self.remotes {
            match transport.about(remote).await {
                Ok(space) => {
                    log::info!(
                        "{remote} {} bytes used, {} bytes free",
                        space.used,
                        space.free
                    );
                    self.set_space(remote, space).await;
                }
                Err(e) => {
                    log::warn!("could not get space info for {remote}: {e}");
                    let mut state = self.state.lock().await;
                    if let Some(usage) = state.usage.get_mut(remote) {
                        usage.reachable = false;
                    }
                }
            }
        }
    }

    pub async fn set_space(&self, remote: &str, space: RemoteSpace) {
        let mut state = self.state.lock().await;
        if let Some(usage) = state.usage.get_mut(remote) {
            *usage = Usage {
                space,
                reachable: true,
            };
        }
    }

    /// Pick a remote with room for `chunk_size` bytes and record the
    /// placement in one atomic step.
    pub async fn reserve(&self, chunk_size: u64) -> Result<String, PoolError> {
        let mut state = self.state.lock().await;
        let picked = match self.strategy {
            Strategy::LeastUsed => self.pick_least_used(&state, chunk_size),
            Strategy::RoundRobinLeastUsed => {
                self.pick_round_robin_least_used(&mut state, chunk_size)
            }
        }
        .ok_or(PoolError::NoEligibleRemote(chunk_size))?;

        let usage = state.usage.get_mut(&picked).unwrap();
        usage.space.used += chunk_size;
        usage.space.free = usage.space.free.saturating_sub(chunk_size);
        log::debug!("placing {chunk_size} bytes on {picked}");
        Ok(picked)
    }

    /// Lowest used bytes wins; ties go to the earlier configured remote.
    fn pick_least_used(&self, state: &State, chunk_size: u64) -> Option<String> {
        let mut best: Option<(&str, u64)> = None;
        for remote in &self.remotes {
            let usage = &state.usage[remote];
            if !usage.reachable || usage.space.free < chunk_size {
                continue;
            }
            if best.is_none_or(|(_, used)| usage.space.used < used) {
                best = Some((remote, usage.space.used));
            }
        }
        best.map(|(remote, _)| remote.to_string())
    }

    /// One full rotation starting at the cursor; among eligible remotes the
    /// least used wins, rotation order breaking ties. The cursor advances
    /// past the selection.
    fn pick_round_robin_least_used(&self, state: &mut State, chunk_size: u64) -> Option<String> {
        let n = self.remotes.len();
        if n == 0 {
            return None;
        }
        let mut best: Option<(usize, u64)> = None;
        for step in 0..n {
            let idx = (state.cursor + step) % n;
            let usage = &state.usage[&self.remotes[idx]];
            if !usage.reachable || usage.space.free < chunk_size {
                continue;
            }
            if best.is_none_or(|(_, used)| usage.space.used < used) {
                best = Some((idx, usage.space.used));
            }
        }
        let (idx, _) = best?;
        state.cursor = (idx + 1) % n;
        Some(self.remotes[idx].clone())
    }

    /// Adjust the table after a placement, rollback, or delete.
    pub async fn record(&self, remote: &str, delta: i64) {
        let mut state = self.state.lock().await;
        if let Some(usage) = state.usage.get_mut(remote) {
            if delta >= 0 {
                usage.space.used += delta as u64;
                usage.space.free = usage.space.free.saturating_sub(delta as u64);
            } else {
                usage.space.used = usage.space.used.saturating_sub(delta.unsigned_abs());
                usage.space.free += delta.unsigned_abs();
            }
        }
    }

    pub async fn report(&self) -> Vec<UsageView> {
        let state = self.state.lock().await;
        self.remotes
            .iter()
            .map(|remote| {
                let usage = state.usage[remote];
                UsageView {
                    remote: remote.clone(),
                    space: usage.space,
                    reachable: usage.reachable,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn balancer_with(used: &[u64], total: u64, strategy: Strategy) -> Balancer {
        let remotes: Vec<String> = (0..used.len()).map(|i| format!("r{i}:")).collect();
        let balancer = Balancer::new(remotes.clone(), strategy);
        for (remote, &used) in remotes.iter().zip(used) {
            balancer
                .set_space(
                    remote,
                    RemoteSpace {
                        used,
                        free: total - used,
                        total,
                    },
                )
                .await;
        }
        balancer
    }

    #[tokio::test]
    async fn least_used_follows_the_post_record_rule() {
        // used = [10, 20, 30], five 100-byte chunks
        let balancer = balancer_with(&[10, 20, 30], 10_000, Strategy::LeastUsed).await;
        let mut picks = Vec::new();
        for _ in 0..5 {
            picks.push(balancer.reserve(100).await.unwrap());
        }
        assert_eq!(picks, ["r0:", "r1:", "r2:", "r0:", "r1:"]);
    }

    #[tokio::test]
    async fn least_used_ties_break_by_configured_order() {
        let balancer = balancer_with(&[50, 50, 50], 10_000, Strategy::LeastUsed).await;
        assert_eq!(balancer.reserve(10).await.unwrap(), "r0:");
    }

    #[tokio::test]
    async fn full_remotes_are_skipped() {
        let balancer = balancer_with(&[0, 990], 1000, Strategy::LeastUsed).await;
        // r0 has room, r1 does not.
        assert_eq!(balancer.reserve(100).await.unwrap(), "r0:");
    }

    #[tokio::test]
    async fn no_eligible_remote_errors() {
        let balancer = balancer_with(&[990, 995], 1000, Strategy::LeastUsed).await;
        assert!(matches!(
            balancer.reserve(100).await,
            Err(PoolError::NoEligibleRemote(100))
        ));
    }

    #[tokio::test]
    async fn unreachable_remotes_are_ineligible() {
        // r0 is never seeded, so r1 wins despite heavier usage.
        let balancer = Balancer::new(vec!["r0:".into(), "r1:".into()], Strategy::LeastUsed);
        balancer
            .set_space("r1:", RemoteSpace { used: 500, free: 500, total: 1000 })
            .await;
        assert_eq!(balancer.reserve(100).await.unwrap(), "r1:");
    }

    #[tokio::test]
    async fn round_robin_rotates_through_equal_remotes() {
        let balancer = balancer_with(&[0, 0, 0], 10_000, Strategy::RoundRobinLeastUsed).await;
        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(balancer.reserve(1).await.unwrap());
        }
        assert_eq!(picks, ["r0:", "r1:", "r2:", "r0:"]);
    }

    #[tokio::test]
    async fn round_robin_prefers_least_used_within_rotation() {
        let balancer = balancer_with(&[500, 0, 500], 10_000, Strategy::RoundRobinLeastUsed).await;
        assert_eq!(balancer.reserve(1).await.unwrap(), "r1:");
    }

    #[tokio::test]
    async fn record_rollback_restores_usage() {
        let balancer = balancer_with(&[10, 20], 10_000, Strategy::LeastUsed).await;
        let picked = balancer.reserve(100).await.unwrap();
        assert_eq!(picked, "r0:");
        balancer.record(&picked, -100).await;
        let report = balancer.report().await;
        assert_eq!(report[0].space.used, 10);
    }
}
