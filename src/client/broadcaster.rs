//! Position Broadcaster - throttled outbound samples of the local pose

use std::time::{Duration, Instant};

use crate::client::remote::shortest_angle;
use crate::config::ClientConfig;
use crate::identity::PlayerId;
use crate::ws::protocol::{Message, Pose};

/// When a sampled pose is worth transmitting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// Every time the interval elapses, moving or not
    FixedRate,
    /// When the interval elapsed and the pose left the deadband, or the
    /// keepalive elapsed
    #[default]
    OnChange,
}

#[derive(Debug, Clone)]
pub struct PositionBroadcaster {
    policy: BroadcastPolicy,
    interval: Duration,
    keepalive: Duration,
    position_deadband: f32,
    rotation_deadband: f32,
    last_sent: Option<(Instant, Pose)>,
    attacking: bool,
}

impl PositionBroadcaster {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            policy: config.broadcast_policy,
            interval: config.broadcast_interval,
            keepalive: config.keepalive,
            position_deadband: config.position_deadband,
            rotation_deadband: config.rotation_deadband,
            last_sent: None,
            attacking: false,
        }
    }

    /// Feed one render-tick sample. Returns the messages to transmit, in order.
    pub fn sample(
        &mut self,
        player_id: &PlayerId,
        pose: Pose,
        attacking: bool,
        now: Instant,
    ) -> Vec<Message> {
        let mut out = Vec::new();

        if attacking != self.attacking {
            self.attacking = attacking;
            out.push(if attacking {
                Message::Attack {
                    player_id: player_id.clone(),
                }
            } else {
                Message::AttackEnd {
                    player_id: player_id.clone(),
                }
            });
        }

        if self.should_send(pose, now) {
            self.last_sent = Some((now, pose));
            out.push(Message::position(player_id.clone(), pose));
        }

        out
    }

    /// Forget what was sent (new room, fresh start)
    pub fn reset(&mut self) {
        self.last_sent = None;
        self.attacking = false;
    }

    pub fn is_attacking(&self) -> bool {
        self.attacking
    }

    fn should_send(&self, pose: Pose, now: Instant) -> bool {
        let Some((sent_at, sent_pose)) = self.last_sent else {
            return true;
        };

        let elapsed = now.saturating_duration_since(sent_at);
        if elapsed < self.interval {
            return false;
        }

        match self.policy {
            BroadcastPolicy::FixedRate => true,
            BroadcastPolicy::OnChange => {
                let moved = pose.distance(&sent_pose) > self.position_deadband
                    || shortest_angle(sent_pose.rotation, pose.rotation).abs()
                        > self.rotation_deadband;
                moved || elapsed >= self.keepalive
            }
        }
    }
}
