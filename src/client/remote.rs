//! Remote State Store - smoothed poses of the other players

use std::collections::{HashMap, HashSet};
use std::f32::consts::{PI, TAU};

use tracing::debug;

use crate::identity::PlayerId;
use crate::ws::protocol::Pose;

/// Smoothing state for one remote player
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpolatedPlayer {
    /// Latest network sample, replaced wholesale
    pub target: Pose,
    /// Render-facing pose, chases `target` each tick
    pub current: Pose,
    has_sample: bool,
}

impl InterpolatedPlayer {
    fn new() -> Self {
        Self {
            target: Pose::default(),
            current: Pose::default(),
            has_sample: false,
        }
    }

    /// True once at least one position sample arrived
    pub fn has_sample(&self) -> bool {
        self.has_sample
    }

    fn set_target(&mut self, pose: Pose) {
        self.target = pose;
        if !self.has_sample {
            // Nothing to smooth from yet
            self.current = pose;
            self.has_sample = true;
        }
    }

    fn advance(&mut self, alpha: f32) {
        if !self.has_sample {
            return;
        }
        self.current.x += (self.target.x - self.current.x) * alpha;
        self.current.y += (self.target.y - self.current.y) * alpha;
        self.current.z += (self.target.z - self.current.z) * alpha;

        let delta = shortest_angle(self.current.rotation, self.target.rotation);
        self.current.rotation = wrap_angle(self.current.rotation + delta * alpha);
    }
}

/// Per-player pose smoothing. Sole writer of interpolated poses.
///
/// Uses a fixed per-tick factor, so smoothing speed varies slightly with
/// frame rate.
#[derive(Debug, Clone)]
pub struct RemoteStateStore {
    alpha: f32,
    players: HashMap<PlayerId, InterpolatedPlayer>,
}

impl RemoteStateStore {
    pub fn new(alpha: f32) -> Self {
        Self {
            alpha: alpha.clamp(f32::EPSILON, 1.0),
            players: HashMap::new(),
        }
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    /// Start tracking a player. Existing state is kept.
    pub fn insert(&mut self, player_id: PlayerId) {
        self.players
            .entry(player_id)
            .or_insert_with(InterpolatedPlayer::new);
    }

    pub fn remove(&mut self, player_id: &PlayerId) -> Option<InterpolatedPlayer> {
        self.players.remove(player_id)
    }

    /// Keep only the given players, start tracking the new ones
    pub fn retain(&mut self, player_ids: &HashSet<PlayerId>) {
        self.players.retain(|id, _| player_ids.contains(id));
        for id in player_ids {
            self.insert(id.clone());
        }
    }

    pub fn clear(&mut self) {
        self.players.clear();
    }

    /// Record a network sample (last write wins). Returns false for untracked players.
    pub fn set_target(&mut self, player_id: &PlayerId, pose: Pose) -> bool {
        match self.players.get_mut(player_id) {
            Some(player) => {
                player.set_target(pose);
                true
            }
            None => {
                debug!(player_id = %player_id, "Position for untracked player, ignoring");
                false
            }
        }
    }

    /// Move every current pose one step toward its target (once per render tick)
    pub fn advance(&mut self) {
        for player in self.players.values_mut() {
            player.advance(self.alpha);
        }
    }

    pub fn get(&self, player_id: &PlayerId) -> Option<&InterpolatedPlayer> {
        self.players.get(player_id)
    }

    /// Render-facing pose, `None` until the first sample arrives
    pub fn current(&self, player_id: &PlayerId) -> Option<Pose> {
        self.players
            .get(player_id)
            .filter(|p| p.has_sample)
            .map(|p| p.current)
    }

    pub fn target(&self, player_id: &PlayerId) -> Option<Pose> {
        self.players
            .get(player_id)
            .filter(|p| p.has_sample)
            .map(|p| p.target)
    }

    pub fn contains(&self, player_id: &PlayerId) -> bool {
        self.players.contains_key(player_id)
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PlayerId, &InterpolatedPlayer)> {
        self.players.iter()
    }
}

/// Signed difference `to - from` normalized into `(-π, π]`
pub fn shortest_angle(from: f32, to: f32) -> f32 {
    let mut delta = (to - from) % TAU;
    if delta > PI {
        delta -= TAU;
    } else if delta <= -PI {
        delta += TAU;
    }
    delta
}

/// Wrap an angle into `(-π, π]`
pub fn wrap_angle(angle: f32) -> f32 {
    shortest_angle(0.0, angle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> PlayerId {
        PlayerId::from(s)
    }

    fn tracked(alpha: f32) -> RemoteStateStore {
        let mut store = RemoteStateStore::new(alpha);
        store.insert(id("c1"));
        store
    }

    #[test]
    fn first_sample_snaps_current() {
        let mut store = tracked(0.15);
        assert!(store.current(&id("c1")).is_none());

        let pose = Pose::new(5.0, 0.0, 3.0, 1.57);
        assert!(store.set_target(&id("c1"), pose));
        assert_eq!(store.target(&id("c1")), Some(pose));
        assert_eq!(store.current(&id("c1")), Some(pose));
    }

    #[test]
    fn target_is_replaced_not_blended() {
        let mut store = tracked(0.15);
        store.set_target(&id("c1"), Pose::new(0.0, 0.0, 0.0, 0.0));
        store.set_target(&id("c1"), Pose::new(1.0, 2.0, 3.0, 0.5));
        store.set_target(&id("c1"), Pose::new(5.0, 0.0, 3.0, 1.57));
        assert_eq!(store.target(&id("c1")), Some(Pose::new(5.0, 0.0, 3.0, 1.57)));
    }

    #[test]
    fn converges_monotonically_without_overshoot() {
        let mut store = tracked(0.15);
        store.set_target(&id("c1"), Pose::default());
        let target = Pose::new(5.0, -2.0, 3.0, 1.57);
        store.set_target(&id("c1"), target);

        let mut last = f32::MAX;
        for _ in 0..200 {
            store.advance();
            let current = store.current(&id("c1")).unwrap();
            let dist = current.distance(&target);
            assert!(dist <= last, "distance grew: {dist} > {last}");
            assert!(current.x <= target.x && current.z <= target.z);
            assert!(current.y >= target.y);
            last = dist;
        }

        let current = store.current(&id("c1")).unwrap();
        assert!(current.distance(&target) < 1e-3);
        assert!((current.rotation - target.rotation).abs() < 1e-3);
    }

    #[test]
    fn single_step_uses_alpha() {
        let mut store = tracked(0.15);
        store.set_target(&id("c1"), Pose::default());
        store.set_target(&id("c1"), Pose::new(10.0, 0.0, 0.0, 0.0));
        store.advance();
        let current = store.current(&id("c1")).unwrap();
        assert!((current.x - 1.5).abs() < 1e-5);
    }

    #[test]
    fn rotation_takes_short_way_across_boundary() {
        let mut store = tracked(0.15);
        store.set_target(&id("c1"), Pose::new(0.0, 0.0, 0.0, 3.0));
        store.set_target(&id("c1"), Pose::new(0.0, 0.0, 0.0, -3.0));
        store.advance();

        let rotation = store.current(&id("c1")).unwrap().rotation;
        // Short path from 3.0 to -3.0 is +(2π - 6.0), so the angle grows past π
        let expected = wrap_angle(3.0 + (TAU - 6.0) * 0.15);
        assert!((rotation - expected).abs() < 1e-5, "{rotation} vs {expected}");
        assert!(rotation > 3.0);
    }

    #[test]
    fn shortest_angle_never_exceeds_pi() {
        let mut angle = -20.0_f32;
        while angle < 20.0 {
            let delta = shortest_angle(0.3, angle);
            assert!(delta > -PI - 1e-5 && delta <= PI + 1e-5, "{angle} -> {delta}");
            angle += 0.37;
        }
        assert!((shortest_angle(3.0, -3.0) - (TAU - 6.0)).abs() < 1e-5);
        assert!((shortest_angle(-3.0, 3.0) + (TAU - 6.0)).abs() < 1e-5);
    }

    #[test]
    fn unknown_players_are_ignored() {
        let mut store = RemoteStateStore::new(0.15);
        assert!(!store.set_target(&id("ghost"), Pose::default()));
        assert!(store.is_empty());
    }

    #[test]
    fn retain_drops_departed_players() {
        let mut store = tracked(0.15);
        store.insert(id("c2"));
        let keep: HashSet<PlayerId> = [id("c2"), id("c3")].into_iter().collect();
        store.retain(&keep);
        assert!(!store.contains(&id("c1")));
        assert!(store.contains(&id("c2")));
        assert!(store.contains(&id("c3")));
    }
}
