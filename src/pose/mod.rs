//! Pose data model and estimator backends
//!
//! A [`Pose`] is the 17-keypoint COCO body layout. Coordinates are pixels of
//! the frame the pose was estimated from.

mod estimator;
#[cfg(feature = "onnx")]
pub mod movenet;

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use estimator::{DisabledEstimator, ModelHandle, PoseEstimator, PoseModel};
#[cfg(feature = "onnx")]
pub use movenet::MoveNetEstimator;

/// Body parts in model output order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeypointName {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

impl KeypointName {
    pub const ALL: [KeypointName; 17] = [
        KeypointName::Nose,
        KeypointName::LeftEye,
        KeypointName::RightEye,
        KeypointName::LeftEar,
        KeypointName::RightEar,
        KeypointName::LeftShoulder,
        KeypointName::RightShoulder,
        KeypointName::LeftElbow,
        KeypointName::RightElbow,
        KeypointName::LeftWrist,
        KeypointName::RightWrist,
        KeypointName::LeftHip,
        KeypointName::RightHip,
        KeypointName::LeftKnee,
        KeypointName::RightKnee,
        KeypointName::LeftAnkle,
        KeypointName::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeypointName::Nose => "nose",
            KeypointName::LeftEye => "leftEye",
            KeypointName::RightEye => "rightEye",
            KeypointName::LeftEar => "leftEar",
            KeypointName::RightEar => "rightEar",
            KeypointName::LeftShoulder => "leftShoulder",
            KeypointName::RightShoulder => "rightShoulder",
            KeypointName::LeftElbow => "leftElbow",
            KeypointName::RightElbow => "rightElbow",
            KeypointName::LeftWrist => "leftWrist",
            KeypointName::RightWrist => "rightWrist",
            KeypointName::LeftHip => "leftHip",
            KeypointName::RightHip => "rightHip",
            KeypointName::LeftKnee => "leftKnee",
            KeypointName::RightKnee => "rightKnee",
            KeypointName::LeftAnkle => "leftAnkle",
            KeypointName::RightAnkle => "rightAnkle",
        }
    }
}

impl fmt::Display for KeypointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connected body parts drawn as skeleton edges
pub const SKELETON: [(KeypointName, KeypointName); 12] = {
    use KeypointName::*;
    [
        (LeftHip, LeftShoulder),
        (LeftElbow, LeftShoulder),
        (LeftElbow, LeftWrist),
        (LeftHip, LeftKnee),
        (LeftKnee, LeftAnkle),
        (RightHip, RightShoulder),
        (RightElbow, RightShoulder),
        (RightElbow, RightWrist),
        (RightHip, RightKnee),
        (RightKnee, RightAnkle),
        (LeftShoulder, RightShoulder),
        (LeftHip, RightHip),
    ]
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub name: KeypointName,
    pub x: f32,
    pub y: f32,
    /// Confidence in [0, 1]
    pub score: f32,
}

impl Keypoint {
    pub fn new(name: KeypointName, x: f32, y: f32, score: f32) -> Self {
        Self {
            name,
            x,
            y,
            score: score.clamp(0.0, 1.0),
        }
    }
}

/// Skeleton edge between two detected keypoints
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Edge {
    pub from: Keypoint,
    pub to: Keypoint,
}

impl Edge {
    /// An edge is only as confident as its weakest endpoint
    pub fn score(&self) -> f32 {
        self.from.score.min(self.to.score)
    }
}

/// Single-person pose estimate. Ephemeral: produced and rendered within one
/// sampling cycle.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pose {
    keypoints: Vec<Keypoint>,
}

impl Pose {
    pub fn new(keypoints: Vec<Keypoint>) -> Self {
        Self { keypoints }
    }

    pub fn keypoints(&self) -> &[Keypoint] {
        &self.keypoints
    }

    pub fn keypoint(&self, name: KeypointName) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.name == name)
    }

    /// Skeleton edges whose endpoints are both present
    pub fn edges(&self) -> impl Iterator<Item = Edge> + '_ {
        SKELETON.iter().filter_map(|&(a, b)| {
            Some(Edge {
                from: *self.keypoint(a)?,
                to: *self.keypoint(b)?,
            })
        })
    }
}

/// Pose model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Pretrained model file
    pub path: Option<PathBuf>,
    /// Square input edge the frame is resized to
    pub input_size: u32,
    pub input_name: String,
    pub output_name: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            input_size: 192,
            input_name: "serving_default_input_0".into(),
            output_name: "StatefulPartitionedCall_0".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypoint_order() {
        for (i, name) in KeypointName::ALL.iter().enumerate() {
            assert_eq!(name.index(), i);
        }
        assert_eq!(KeypointName::RightAnkle.to_string(), "rightAnkle");
    }

    #[test]
    fn test_edges_follow_skeleton() {
        let pose = Pose::new(
            KeypointName::ALL
                .iter()
                .map(|&n| Keypoint::new(n, 0.0, 0.0, 0.9))
                .collect(),
        );
        assert_eq!(pose.edges().count(), SKELETON.len());

        let partial = Pose::new(vec![
            Keypoint::new(KeypointName::LeftShoulder, 0.0, 0.0, 0.9),
            Keypoint::new(KeypointName::RightShoulder, 10.0, 0.0, 0.75),
            Keypoint::new(KeypointName::Nose, 5.0, -5.0, 1.0),
        ]);
        let edges: Vec<Edge> = partial.edges().collect();
        assert_eq!(edges.len(), 1);
        assert!((edges[0].score() - 0.75).abs() < f32::EPSILON);
    }

    #[test]
    fn test_scores_are_clamped() {
        let k = Keypoint::new(KeypointName::Nose, 1.0, 1.0, 1.4);
        assert_eq!(k.score, 1.0);
    }
}
