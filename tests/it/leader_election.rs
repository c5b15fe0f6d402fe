//! Cross-tab leader election and failover.

use replicate_sync::constants::LeaderConfig;
use replicate_sync::leader::{BroadcastChannel, LeaderMessage, TabLeader};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A shared in-process channel connecting every tab in a test, standing in
/// for the browser `BroadcastChannel` every real tab would post to.
struct SharedChannel {
    queues: Arc<Mutex<Vec<Mutex<Vec<LeaderMessage>>>>>,
    my_index: usize,
}

impl SharedChannel {
    fn new_bus(n: usize) -> Vec<SharedChannel> {
        let queues = Arc::new(Mutex::new((0..n).map(|_| Mutex::new(Vec::new())).collect()));
        (0..n)
            .map(|i| SharedChannel {
                queues: queues.clone(),
                my_index: i,
            })
            .collect()
    }
}

impl BroadcastChannel for SharedChannel {
    fn post(&self, message: &LeaderMessage) {
        let queues = self.queues.lock().unwrap();
        for (i, queue) in queues.iter().enumerate() {
            if i != self.my_index {
                queue.lock().unwrap().push(*message);
            }
        }
    }

    fn drain(&self) -> Vec<LeaderMessage> {
        let queues = self.queues.lock().unwrap();
        std::mem::take(&mut queues[self.my_index].lock().unwrap())
    }
}

fn config() -> LeaderConfig {
    LeaderConfig {
        election_delay: Duration::from_millis(10),
        leader_timeout: Duration::from_millis(40),
        heartbeat_interval: Duration::from_millis(5),
    }
}

#[test]
fn exactly_one_tab_becomes_leader_on_startup() {
    let mut channels = SharedChannel::new_bus(3).into_iter();
    let mut tabs: Vec<_> = (0..3)
        .map(|_| TabLeader::new(Some(channels.next().unwrap()), config()))
        .collect();

    let start = Instant::now();
    // Run several ticks so claims and heartbeats propagate and settle.
    for step in 0..20 {
        let now = start + Duration::from_millis(step * 5);
        for tab in tabs.iter_mut() {
            tab.on_tick(now);
        }
    }

    let leaders = tabs.iter().filter(|t| t.is_leader()).count();
    assert_eq!(leaders, 1, "expected exactly one leader, got {leaders}");
}

#[test]
fn follower_takes_over_after_leader_relinquishes() {
    let mut channels = SharedChannel::new_bus(2).into_iter();
    let mut leader = TabLeader::new(Some(channels.next().unwrap()), config());
    let mut follower = TabLeader::new(Some(channels.next().unwrap()), config());

    let start = Instant::now();
    // Drive enough ticks for exactly one of the two to claim leadership,
    // the same way startup settles in `exactly_one_tab_becomes_leader_on_startup`.
    for step in 0..10 {
        let now = start + Duration::from_millis(step * 5);
        leader.on_tick(now);
        follower.on_tick(now);
    }
    assert_ne!(leader.is_leader(), follower.is_leader(), "exactly one should be leading");

    // Normalize so the local `leader`/`follower` bindings match reality.
    let (leader, follower) = if leader.is_leader() {
        (leader, follower)
    } else {
        (follower, leader)
    };
    let mut leader = leader;
    let mut follower = follower;

    leader.relinquish();
    assert!(!leader.is_leader());

    // First tick after relinquish observes the `Relinquish` message and
    // resets the election timer; a later tick sees it expired and claims.
    follower.on_tick(start + Duration::from_millis(205));
    follower.on_tick(start + Duration::from_millis(260));

    assert!(follower.is_leader());
}

#[test]
fn no_channel_means_unconditional_leadership() {
    let tab: TabLeader<SharedChannel> = TabLeader::new(None, config());
    assert!(tab.is_leader());
}
