//! Background motion: idle moves, thinking antennas, talking head bob

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{HeadPose, Robot};
use crate::conversation::LoopState;

/// Antenna swing while thinking, radians
const THINKING_ANGLE: f32 = 0.7;
const THINKING_STEP: Duration = Duration::from_millis(350);

/// Head bob while speaking, degrees
const BOB_PITCH: f32 = 3.0;
const BOB_STEP: Duration = Duration::from_millis(250);

const WAKE_STEP: Duration = Duration::from_millis(200);

/// Idle move amplitude, degrees
const IDLE_AMPLITUDE: f32 = 5.0;
const IDLE_PROBABILITY: f64 = 0.3;
const IDLE_MOVE_SECS: f32 = 2.0;

/// Wiggle the antennas until `stop` fires, then reset them
pub async fn thinking(robot: Arc<dyn Robot>, stop: CancellationToken) {
    let mut left_up = true;
    loop {
        let (left, right) = if left_up {
            (THINKING_ANGLE, -THINKING_ANGLE)
        } else {
            (-THINKING_ANGLE, THINKING_ANGLE)
        };
        left_up = !left_up;

        let step = async {
            if let Err(e) = robot
                .move_antennas(left, right, THINKING_STEP.as_secs_f32())
                .await
            {
                tracing::debug!(error = %e, "thinking animation move failed");
            }
            tokio::time::sleep(THINKING_STEP).await;
        };
        tokio::select! {
            () = stop.cancelled() => break,
            () = step => {}
        }
    }

    if let Err(e) = robot.move_antennas(0.0, 0.0, 0.3).await {
        tracing::debug!(error = %e, "antenna reset failed");
    }
}

/// Bob the head while speech plays, then return to neutral
pub async fn head_bob(robot: Arc<dyn Robot>, stop: CancellationToken) {
    let mut up = true;
    loop {
        let pitch = if up { BOB_PITCH } else { -BOB_PITCH };
        up = !up;

        let step = async {
            if let Err(e) = robot
                .move_head(HeadPose::with_pitch(pitch), BOB_STEP.as_secs_f32())
                .await
            {
                tracing::debug!(error = %e, "head bob move failed");
            }
            tokio::time::sleep(BOB_STEP).await;
        };
        tokio::select! {
            () = stop.cancelled() => break,
            () = step => {}
        }
    }

    if let Err(e) = robot.move_head(HeadPose::NEUTRAL, 0.3).await {
        tracing::debug!(error = %e, "head reset failed");
    }
}

/// Short antenna snap
pub async fn wake_cue(robot: &dyn Robot) {
    let steps = [
        (THINKING_ANGLE, -THINKING_ANGLE),
        (-THINKING_ANGLE, THINKING_ANGLE),
        (0.0, 0.0),
    ];
    for (left, right) in steps {
        if let Err(e) = robot
            .move_antennas(left, right, WAKE_STEP.as_secs_f32())
            .await
        {
            tracing::debug!(error = %e, "wake cue failed");
            return;
        }
        tokio::time::sleep(WAKE_STEP).await;
    }
}

/// Small random head moves while the bridge waits for speech
pub struct IdleMotion {
    robot: Arc<dyn Robot>,
    interval: Duration,
    state: watch::Receiver<LoopState>,
    speech: watch::Receiver<bool>,
}

impl IdleMotion {
    #[must_use]
    pub fn new(
        robot: Arc<dyn Robot>,
        interval: Duration,
        state: watch::Receiver<LoopState>,
        speech: watch::Receiver<bool>,
    ) -> Self {
        Self {
            robot,
            interval,
            state,
            speech,
        }
    }

    /// Run until `cancel` fires
    #[must_use]
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }

    fn allowed(&self) -> bool {
        matches!(*self.state.borrow(), LoopState::Idle | LoopState::Listening)
            && !*self.speech.borrow()
    }

    async fn run(mut self, cancel: CancellationToken) {
        tracing::debug!(interval_secs = self.interval.as_secs(), "idle motion started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(self.interval) => {}
            }

            if !self.allowed() || !rand::thread_rng().gen_bool(IDLE_PROBABILITY) {
                continue;
            }

            let pose = random_pose();
            tracing::trace!(?pose, "idle move");

            // Mark current values seen so only later changes interrupt the move
            self.state.borrow_and_update();
            self.speech.borrow_and_update();

            let robot = Arc::clone(&self.robot);
            let moved = async move { robot.move_head(pose, IDLE_MOVE_SECS).await };
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.state.changed() => tracing::trace!("idle move dropped: state changed"),
                _ = self.speech.changed() => tracing::trace!("idle move dropped: speech"),
                result = moved => {
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "idle move failed");
                    }
                }
            }
        }
        tracing::debug!("idle motion stopped");
    }
}

fn random_pose() -> HeadPose {
    let mut rng = rand::thread_rng();
    let angle = rng.gen_range(-IDLE_AMPLITUDE..=IDLE_AMPLITUDE);
    if rng.gen_bool(0.5) {
        HeadPose::with_roll(angle)
    } else {
        HeadPose::with_pitch(angle)
    }
}
