//! Maps gateway tool requests onto robot capabilities

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::{Value, json};
use tokio::sync::watch;

use super::{HeadPose, Robot};
use crate::config::{MotionLimits, RobotConfig};
use crate::gateway::{ConnectionState, ToolRequest};
use crate::voice::Speaker;
use crate::{Error, Result};

/// Outcome of one action, sent back as the `tool.response` payload
pub type ActionResult = std::result::Result<Value, String>;

/// Normalize an action name: drop a `reachy_` prefix, `_` becomes `-`
#[must_use]
pub fn normalize_action_name(name: &str) -> String {
    let name = name.trim().to_lowercase();
    let name = name.strip_prefix("reachy_").unwrap_or(&name);
    name.replace('_', "-")
}

/// A parsed robot action
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    MoveHead { pose: HeadPose, duration: f32 },
    MoveAntennas { left: f32, right: f32, duration: f32 },
    PlayEmotion { name: String },
    Dance { name: String },
    CaptureImage,
    Speak { text: String, voice: Option<String> },
    GetStatus,
}

impl Action {
    /// Parse a tool request into an action
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedAction` for unknown names and
    /// `Error::ActionFailure` for missing or invalid arguments
    pub fn parse(name: &str, args: &Value, config: &RobotConfig) -> Result<Self> {
        match normalize_action_name(name).as_str() {
            "move-head" => {
                let pose_args = args.get("position").unwrap_or(args);
                let pose = HeadPose {
                    z: number(pose_args, "z").unwrap_or(0.0),
                    roll: number(pose_args, "roll").unwrap_or(0.0),
                    pitch: number(pose_args, "pitch").unwrap_or(0.0),
                    yaw: number(pose_args, "yaw").unwrap_or(0.0),
                };
                Ok(Self::MoveHead {
                    pose: clamp_pose(pose, &config.limits),
                    duration: duration(args, config.head_duration),
                })
            }
            "move-antennas" => Ok(Self::MoveAntennas {
                left: number(args, "left").unwrap_or(0.0),
                right: number(args, "right").unwrap_or(0.0),
                duration: duration(args, config.antenna_duration),
            }),
            "play-emotion" => Ok(Self::PlayEmotion {
                name: text(args, &["emotion", "name"])
                    .ok_or_else(|| Error::ActionFailure("play-emotion requires 'emotion'".into()))?,
            }),
            "dance" => Ok(Self::Dance {
                name: text(args, &["dance", "name"])
                    .ok_or_else(|| Error::ActionFailure("dance requires 'dance'".into()))?,
            }),
            "capture-image" => Ok(Self::CaptureImage),
            "speak" => Ok(Self::Speak {
                text: text(args, &["text"])
                    .ok_or_else(|| Error::ActionFailure("speak requires 'text'".into()))?,
                voice: text(args, &["voice"]),
            }),
            "get-status" => Ok(Self::GetStatus),
            "" => Err(Error::UnsupportedAction("(unnamed)".into())),
            _ => Err(Error::UnsupportedAction(name.to_string())),
        }
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number(args: &Value, key: &str) -> Option<f32> {
    args.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

fn duration(args: &Value, default: f32) -> f32 {
    number(args, "duration")
        .filter(|d| d.is_finite() && *d > 0.0)
        .unwrap_or(default)
}

fn text(args: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| args.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Clamp head angles to the safety limits
#[must_use]
pub fn clamp_pose(pose: HeadPose, limits: &MotionLimits) -> HeadPose {
    HeadPose {
        z: pose.z,
        roll: pose.roll.clamp(-limits.max_roll, limits.max_roll),
        pitch: pose.pitch.clamp(-limits.max_pitch, limits.max_pitch),
        yaw: pose.yaw.clamp(-limits.max_yaw, limits.max_yaw),
    }
}

/// Executes actions requested by the gateway
pub struct ActionExecutor {
    robot: Arc<dyn Robot>,
    speaker: Arc<Speaker>,
    config: RobotConfig,
    connection: Option<watch::Receiver<ConnectionState>>,
}

impl ActionExecutor {
    #[must_use]
    pub fn new(robot: Arc<dyn Robot>, speaker: Arc<Speaker>, config: RobotConfig) -> Self {
        Self {
            robot,
            speaker,
            config,
            connection: None,
        }
    }

    /// Report this gateway connection state in `get-status`
    pub fn set_connection(&mut self, state: watch::Receiver<ConnectionState>) {
        self.connection = Some(state);
    }

    /// Execute a tool request; always produces a result
    pub async fn execute(&self, request: &ToolRequest) -> ActionResult {
        tracing::info!(request = %request.id, action = %request.name, "executing action");
        match self.run(&request.name, &request.arguments).await {
            Ok(value) => Ok(value),
            Err(e) => {
                tracing::warn!(request = %request.id, action = %request.name, error = %e, "action failed");
                Err(e.to_string())
            }
        }
    }

    /// Parse and perform one action
    ///
    /// # Errors
    ///
    /// Returns `Error::UnsupportedAction` or `Error::ActionFailure`
    pub async fn run(&self, name: &str, args: &Value) -> Result<Value> {
        let action = Action::parse(name, args, &self.config)?;
        self.perform(action).await
    }

    /// Perform a parsed action
    ///
    /// # Errors
    ///
    /// Returns `Error::ActionFailure` if the robot call fails
    pub async fn perform(&self, action: Action) -> Result<Value> {
        match action {
            Action::MoveHead { pose, duration } => {
                self.robot.move_head(pose, duration).await?;
                Ok(json!({ "status": "moved", "pose": pose }))
            }
            Action::MoveAntennas {
                left,
                right,
                duration,
            } => {
                self.robot.move_antennas(left, right, duration).await?;
                Ok(json!({ "status": "moved", "left": left, "right": right }))
            }
            Action::PlayEmotion { name } => {
                self.robot.play_emotion(&name).await?;
                Ok(json!({ "status": "played", "emotion": name }))
            }
            Action::Dance { name } => {
                self.robot.dance(&name).await?;
                Ok(json!({ "status": "danced", "dance": name }))
            }
            Action::CaptureImage => {
                let path = self.capture_image().await?;
                Ok(Value::String(path.display().to_string()))
            }
            Action::Speak { text, voice } => {
                self.speaker.speak_with_voice(&text, voice.as_deref()).await;
                Ok(json!({ "status": "spoken" }))
            }
            Action::GetStatus => {
                let status = self.robot.status().await?;
                let gateway = self
                    .connection
                    .as_ref()
                    .map_or_else(|| "none".to_string(), |s| format!("{:?}", *s.borrow()));
                Ok(json!({ "robot": status, "gateway": gateway }))
            }
        }
    }

    async fn capture_image(&self) -> Result<PathBuf> {
        let jpeg = self.robot.capture_frame().await?;
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = self
            .config
            .capture_dir
            .join(format!("capture_{timestamp}.jpg"));

        tokio::fs::create_dir_all(&self.config.capture_dir)
            .await
            .map_err(|e| Error::ActionFailure(format!("capture dir: {e}")))?;
        tokio::fs::write(&path, &jpeg)
            .await
            .map_err(|e| Error::ActionFailure(format!("write {}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), bytes = jpeg.len(), "image captured");
        Ok(path)
    }
}
