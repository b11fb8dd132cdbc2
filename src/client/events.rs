//! World Event Relay - idempotent world mutations and their subscribers

use std::collections::BTreeSet;

use tracing::{debug, info};

use crate::identity::PlayerId;
use crate::ws::protocol::{GameSyncState, Message};

/// A relayed world mutation, as seen by rendering/world collaborators
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldEvent {
    BalloonPop { balloon_ids: Vec<String> },
    GemCollect { gem_id: String },
    LevelChange { level: u32 },
}

impl WorldEvent {
    pub fn kind(&self) -> WorldEventKind {
        match self {
            Self::BalloonPop { .. } => WorldEventKind::BalloonPop,
            Self::GemCollect { .. } => WorldEventKind::GemCollect,
            Self::LevelChange { .. } => WorldEventKind::LevelChange,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldEventKind {
    BalloonPop,
    GemCollect,
    LevelChange,
}

/// Token returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Box<dyn FnMut(&WorldEvent) + Send>;

struct Subscription {
    id: SubscriptionId,
    kind: WorldEventKind,
    callback: Callback,
}

/// Owns the applied-id sets and the typed subscriber list.
///
/// Inbound events are applied and dispatched, never re-sent. Local events are
/// applied first and turned into an outbound message for the caller to send.
pub struct WorldEventRelay {
    popped_balloons: BTreeSet<String>,
    collected_gems: BTreeSet<String>,
    level: u32,
    /// Snapshots requested but not yet applied
    expected_syncs: u32,
    /// How many of those were built before our last level change
    stale_syncs: u32,
    subscribers: Vec<Subscription>,
    next_subscription: u64,
}

impl WorldEventRelay {
    pub fn new() -> Self {
        Self {
            popped_balloons: BTreeSet::new(),
            collected_gems: BTreeSet::new(),
            level: 0,
            expected_syncs: 0,
            stale_syncs: 0,
            subscribers: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn subscribe<F>(&mut self, kind: WorldEventKind, callback: F) -> SubscriptionId
    where
        F: FnMut(&WorldEvent) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push(Subscription {
            id,
            kind,
            callback: Box::new(callback),
        });
        id
    }

    /// Returns false if the subscription was already gone
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|s| s.id != id);
        self.subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Apply a relayed message and notify subscribers.
    /// Returns false if the message is not a world event.
    pub fn apply_inbound(&mut self, msg: &Message) -> bool {
        let event = match msg {
            Message::BalloonPop { balloon_ids, .. } => {
                self.popped_balloons.extend(balloon_ids.iter().cloned());
                WorldEvent::BalloonPop {
                    balloon_ids: balloon_ids.clone(),
                }
            }
            Message::GemCollect { gem_id, .. } => {
                self.collected_gems.insert(gem_id.clone());
                WorldEvent::GemCollect {
                    gem_id: gem_id.clone(),
                }
            }
            Message::LevelChange { level } => {
                self.set_level(*level);
                WorldEvent::LevelChange { level: *level }
            }
            _ => return false,
        };

        self.dispatch(&event);
        true
    }

    /// Record locally popped balloons. Returns the message to send for the
    /// ids this relay had not applied yet.
    pub fn originate_balloon_pop(
        &mut self,
        balloon_ids: impl IntoIterator<Item = String>,
        popped_by: &PlayerId,
    ) -> Option<Message> {
        let fresh: Vec<String> = balloon_ids
            .into_iter()
            .filter(|id| self.popped_balloons.insert(id.clone()))
            .collect();

        if fresh.is_empty() {
            return None;
        }
        Some(Message::BalloonPop {
            balloon_ids: fresh,
            popped_by: popped_by.clone(),
        })
    }

    pub fn originate_gem_collect(&mut self, gem_id: String, collected_by: &PlayerId) -> Option<Message> {
        if !self.collected_gems.insert(gem_id.clone()) {
            return None;
        }
        Some(Message::GemCollect {
            gem_id,
            collected_by: collected_by.clone(),
        })
    }

    pub fn originate_level_change(&mut self, level: u32) -> Option<Message> {
        if level == self.level {
            return None;
        }
        self.set_level(level);
        // Snapshots already on their way still describe the old level
        self.stale_syncs = self.expected_syncs;
        Some(Message::LevelChange { level })
    }

    /// A `sync_state` is on its way (joined, or asked for one)
    pub fn expect_sync(&mut self) {
        self.expected_syncs += 1;
    }

    /// Merge a full snapshot. Ids are only ever added, so a stale snapshot
    /// cannot resurrect something removed locally. A snapshot built before the
    /// relay saw our own level change is ignored entirely.
    pub fn apply_sync(&mut self, state: &GameSyncState) {
        self.expected_syncs = self.expected_syncs.saturating_sub(1);
        if self.stale_syncs > 0 {
            self.stale_syncs -= 1;
            debug!(
                snapshot_level = state.level,
                level = self.level,
                "Snapshot predates local level change, ignoring"
            );
            return;
        }

        if state.level != self.level {
            self.set_level(state.level);
            self.dispatch(&WorldEvent::LevelChange { level: state.level });
        }

        let new_balloons: Vec<String> = state
            .popped_balloons
            .iter()
            .filter(|id| self.popped_balloons.insert((*id).clone()))
            .cloned()
            .collect();
        let new_gems: Vec<String> = state
            .collected_gems
            .iter()
            .filter(|id| self.collected_gems.insert((*id).clone()))
            .cloned()
            .collect();

        debug!(
            balloons = new_balloons.len(),
            gems = new_gems.len(),
            "Applied sync snapshot"
        );

        if !new_balloons.is_empty() {
            self.dispatch(&WorldEvent::BalloonPop {
                balloon_ids: new_balloons,
            });
        }
        for gem_id in new_gems {
            self.dispatch(&WorldEvent::GemCollect { gem_id });
        }
    }

    pub fn is_balloon_popped(&self, balloon_id: &str) -> bool {
        self.popped_balloons.contains(balloon_id)
    }

    pub fn is_gem_collected(&self, gem_id: &str) -> bool {
        self.collected_gems.contains(gem_id)
    }

    pub fn popped_balloons(&self) -> &BTreeSet<String> {
        &self.popped_balloons
    }

    pub fn collected_gems(&self) -> &BTreeSet<String> {
        &self.collected_gems
    }

    pub fn level(&self) -> u32 {
        self.level
    }

    /// Forget all applied ids (room left). Subscriptions stay.
    pub fn clear(&mut self) {
        self.popped_balloons.clear();
        self.collected_gems.clear();
        self.level = 0;
        self.expected_syncs = 0;
        self.stale_syncs = 0;
    }

    // Ids are scoped to a level
    fn set_level(&mut self, level: u32) {
        if level != self.level {
            info!(from = self.level, to = level, "Level changed");
            self.level = level;
            self.popped_balloons.clear();
            self.collected_gems.clear();
        }
    }

    fn dispatch(&mut self, event: &WorldEvent) {
        let kind = event.kind();
        for sub in self.subscribers.iter_mut().filter(|s| s.kind == kind) {
            (sub.callback)(event);
        }
    }
}

impl Default for WorldEventRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WorldEventRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldEventRelay")
            .field("popped_balloons", &self.popped_balloons)
            .field("collected_gems", &self.collected_gems)
            .field("level", &self.level)
            .field("stale_syncs", &self.stale_syncs)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
