//! Robot capability surface
//!
//! The bridge drives the robot only through the `Robot` trait. The crate
//! ships a simulated implementation; hardware backends implement the same
//! trait.

pub mod executor;
pub mod motion;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::{Error, Result};

pub use executor::{Action, ActionExecutor, ActionResult, normalize_action_name};
pub use motion::IdleMotion;

/// Head pose: millimetres for `z`, degrees for the angles
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct HeadPose {
    pub z: f32,
    pub roll: f32,
    pub pitch: f32,
    pub yaw: f32,
}

impl HeadPose {
    /// Neutral pose
    pub const NEUTRAL: Self = Self {
        z: 0.0,
        roll: 0.0,
        pitch: 0.0,
        yaw: 0.0,
    };

    #[must_use]
    pub const fn with_pitch(pitch: f32) -> Self {
        Self {
            z: 0.0,
            roll: 0.0,
            pitch,
            yaw: 0.0,
        }
    }

    #[must_use]
    pub const fn with_roll(roll: f32) -> Self {
        Self {
            z: 0.0,
            roll,
            pitch: 0.0,
            yaw: 0.0,
        }
    }
}

/// Snapshot of robot state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RobotStatus {
    pub connected: bool,
    pub simulated: bool,
    pub head: HeadPose,
    /// Left and right antenna angles in radians
    pub antennas: [f32; 2],
    pub last_emotion: Option<String>,
}

/// Motors, camera and speech of the robot
#[async_trait]
pub trait Robot: Send + Sync {
    /// Move the head to `pose` over `duration` seconds
    async fn move_head(&self, pose: HeadPose, duration: f32) -> Result<()>;

    /// Move the antennas (radians) over `duration` seconds
    async fn move_antennas(&self, left: f32, right: f32, duration: f32) -> Result<()>;

    /// Play a recorded emotion
    async fn play_emotion(&self, name: &str) -> Result<()>;

    /// Perform a dance
    async fn dance(&self, name: &str) -> Result<()>;

    /// Capture a camera frame as JPEG bytes
    async fn capture_frame(&self) -> Result<Vec<u8>>;

    /// Speak through the robot's own voice output
    async fn say(&self, text: &str, voice: Option<&str>) -> Result<()>;

    /// Current state
    async fn status(&self) -> Result<RobotStatus>;
}

#[derive(Debug, Default)]
struct SimState {
    head: HeadPose,
    antennas: [f32; 2],
    last_emotion: Option<String>,
    calls: Vec<String>,
}

/// Robot that logs every call and tracks its pose
///
/// Motions complete instantly unless built with `realtime`.
#[derive(Debug, Default)]
pub struct SimulatedRobot {
    state: Mutex<SimState>,
    realtime: bool,
    frame: Option<Vec<u8>>,
}

impl SimulatedRobot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Motions take their requested duration
    #[must_use]
    pub fn realtime() -> Self {
        Self {
            realtime: true,
            ..Self::default()
        }
    }

    /// Serve `jpeg` from `capture_frame` instead of failing
    #[must_use]
    pub fn with_frame(mut self, jpeg: Vec<u8>) -> Self {
        self.frame = Some(jpeg);
        self
    }

    /// Calls received so far, oldest first
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Last head pose set
    #[must_use]
    pub fn head(&self) -> HeadPose {
        self.state.lock().map(|s| s.head).unwrap_or_default()
    }

    fn record(&self, call: String, update: impl FnOnce(&mut SimState)) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| Error::ActionFailure("simulator state poisoned".into()))?;
        tracing::debug!(call = %call, "simulated robot");
        update(&mut state);
        state.calls.push(call);
        Ok(())
    }

    async fn take(&self, seconds: f32) {
        if self.realtime && seconds.is_finite() && seconds > 0.0 {
            tokio::time::sleep(Duration::from_secs_f32(seconds)).await;
        }
    }
}

#[async_trait]
impl Robot for SimulatedRobot {
    async fn move_head(&self, pose: HeadPose, duration: f32) -> Result<()> {
        self.record(
            format!(
                "move_head z={} roll={} pitch={} yaw={}",
                pose.z, pose.roll, pose.pitch, pose.yaw
            ),
            |s| s.head = pose,
        )?;
        self.take(duration).await;
        Ok(())
    }

    async fn move_antennas(&self, left: f32, right: f32, duration: f32) -> Result<()> {
        self.record(format!("move_antennas left={left} right={right}"), |s| {
            s.antennas = [left, right];
        })?;
        self.take(duration).await;
        Ok(())
    }

    async fn play_emotion(&self, name: &str) -> Result<()> {
        self.record(format!("play_emotion {name}"), |s| {
            s.last_emotion = Some(name.to_string());
        })?;
        self.take(1.0).await;
        Ok(())
    }

    async fn dance(&self, name: &str) -> Result<()> {
        self.record(format!("dance {name}"), |_| {})?;
        self.take(2.0).await;
        Ok(())
    }

    async fn capture_frame(&self) -> Result<Vec<u8>> {
        self.record("capture_frame".to_string(), |_| {})?;
        self.frame
            .clone()
            .ok_or_else(|| Error::ActionFailure("camera not available in simulation".into()))
    }

    async fn say(&self, text: &str, voice: Option<&str>) -> Result<()> {
        self.record(format!("say {text}"), |_| {})?;
        tracing::info!(voice = voice.unwrap_or("default"), "robot says: {text}");
        Ok(())
    }

    async fn status(&self) -> Result<RobotStatus> {
        let state = self
            .state
            .lock()
            .map_err(|_| Error::ActionFailure("simulator state poisoned".into()))?;
        Ok(RobotStatus {
            connected: true,
            simulated: true,
            head: state.head,
            antennas: state.antennas,
            last_emotion: state.last_emotion.clone(),
        })
    }
}
