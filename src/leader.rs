//!
//! Tab Leader (C5): elects a single same-origin tab to own the pull/push
//! loop, so N open tabs produce one set of network traffic instead of N.
//! Followers still read and write the local CRDT store directly; only the
//! network loop is exclusive to the leader.

use crate::constants::LeaderConfig;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// A transport-agnostic stand-in for the browser `BroadcastChannel` API:
/// posts and receives small messages among same-origin tabs. A host with no
/// such channel available (a single-tab desktop embedding, a test) can omit
/// wiring one entirely and [`TabLeader`] behaves as an unconditional leader.
pub trait BroadcastChannel: Send + Sync {
    fn post(&self, message: &LeaderMessage);
    /// Drains messages received since the last call. Never blocks.
    fn drain(&self) -> Vec<LeaderMessage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderMessage {
    /// Sent periodically by the leader.
    Heartbeat { tab_id: u128 },
    /// Sent by a follower that has concluded no leader exists.
    Claim { tab_id: u128 },
    /// Sent by the leader when it is shutting down cleanly.
    Relinquish { tab_id: u128 },
    /// Sent by a tab that receives a `Claim` from a higher tab id than its
    /// own: "I outrank that claim, don't yield to it."
    Challenge { tab_id: u128 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderRole {
    Leader,
    Follower,
}

/// Runs the election state machine. The host calls [`Self::on_tick`]
/// periodically (e.g. once per animation frame or timer tick); all timing
/// decisions are driven from the `Instant` the caller passes in, so the
/// state machine itself never sleeps.
pub struct TabLeader<C: BroadcastChannel> {
    tab_id: u128,
    channel: Option<C>,
    config: LeaderConfig,
    role: LeaderRole,
    last_heartbeat_seen: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,
    election_deadline: Option<Instant>,
}

impl<C: BroadcastChannel> TabLeader<C> {
    /// With `channel: None`, this tab is unconditionally the leader — there
    /// is no cross-tab coordination to perform.
    pub fn new(channel: Option<C>, config: LeaderConfig) -> Self {
        let tab_id = Uuid::new_v4().as_u128();
        let role = if channel.is_none() {
            LeaderRole::Leader
        } else {
            LeaderRole::Follower
        };
        Self {
            tab_id,
            channel,
            config,
            role,
            last_heartbeat_seen: None,
            last_heartbeat_sent: None,
            election_deadline: Some(Instant::now() + config.election_delay),
        }
    }

    pub fn role(&self) -> LeaderRole {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == LeaderRole::Leader
    }

    pub fn tab_id(&self) -> u128 {
        self.tab_id
    }

    /// Pumps the election/heartbeat state machine. `now` lets tests drive
    /// time deterministically instead of sleeping.
    pub fn on_tick(&mut self, now: Instant) {
        let Some(channel) = self.channel.as_ref() else {
            return;
        };

        for message in channel.drain() {
            match message {
                LeaderMessage::Heartbeat { tab_id } if tab_id != self.tab_id => {
                    self.last_heartbeat_seen = Some(now);
                    if self.role == LeaderRole::Leader && tab_id < self.tab_id {
                        // Lower tab id wins a simultaneous claim; yield.
                        self.role = LeaderRole::Follower;
                    } else if self.role == LeaderRole::Leader {
                        // A rogue second leader with a higher id: ignore,
                        // we keep leading, but note we saw its heartbeat so
                        // the timeout clock doesn't think the channel is
                        // dead.
                    } else {
                        self.election_deadline = Some(now + self.config.leader_timeout);
                    }
                }
                LeaderMessage::Claim { tab_id } if tab_id != self.tab_id => {
                    if tab_id < self.tab_id {
                        if self.role == LeaderRole::Leader {
                            self.role = LeaderRole::Follower;
                        }
                    } else {
                        // We outrank this claim; assert it instead of
                        // silently yielding ground we haven't lost.
                        channel.post(&LeaderMessage::Challenge { tab_id: self.tab_id });
                    }
                }
                LeaderMessage::Relinquish { tab_id } if tab_id != self.tab_id => {
                    if self.role == LeaderRole::Follower {
                        self.election_deadline = Some(now + self.config.election_delay);
                    }
                }
                LeaderMessage::Challenge { tab_id } if tab_id != self.tab_id => {
                    if self.role == LeaderRole::Leader && tab_id < self.tab_id {
                        self.role = LeaderRole::Follower;
                        self.election_deadline = Some(now + self.config.election_delay);
                    }
                }
                _ => {}
            }
        }

        match self.role {
            LeaderRole::Leader => {
                let due = self
                    .last_heartbeat_sent
                    .map(|sent| now >= sent + self.config.heartbeat_interval)
                    .unwrap_or(true);
                if due {
                    channel.post(&LeaderMessage::Heartbeat { tab_id: self.tab_id });
                    self.last_heartbeat_sent = Some(now);
                }
            }
            LeaderRole::Follower => {
                let expired = self
                    .election_deadline
                    .map(|deadline| now >= deadline)
                    .unwrap_or(false);
                let heartbeat_stale = self
                    .last_heartbeat_seen
                    .map(|seen| now >= seen + self.config.leader_timeout)
                    .unwrap_or(true);
                if expired && heartbeat_stale {
                    channel.post(&LeaderMessage::Claim { tab_id: self.tab_id });
                    self.role = LeaderRole::Leader;
                    self.last_heartbeat_sent = None;
                }
            }
        }
    }

    /// Relinquishes leadership cleanly, e.g. on page unload, so a follower
    /// doesn't have to wait out the full timeout.
    pub fn relinquish(&mut self) {
        if self.role == LeaderRole::Leader {
            if let Some(channel) = self.channel.as_ref() {
                channel.post(&LeaderMessage::Relinquish { tab_id: self.tab_id });
            }
            self.role = LeaderRole::Follower;
        }
    }
}
