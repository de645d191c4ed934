//! Pipeline state management

use std::time::Instant;

/// Pipeline state machine
///
/// Top-level state published to UI collaborators. Previewing and pose
/// detection share the `Live` variant: the pose flag is orthogonal to it and
/// carries over into `Recording`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// No camera acquired yet
    Idle,

    /// Camera feed is live (Previewing, or PoseActive when the flag is set)
    Live {
        /// Whether pose detection is toggled on
        pose_active: bool,
    },

    /// Live feed is being recorded
    Recording {
        /// Whether pose detection is toggled on
        pose_active: bool,
        /// When the recording started
        started_at: Instant,
    },

    /// A finalized recording is held for playback, export or upload
    Reviewing,
}

impl PipelineState {
    /// Plain preview state
    pub const PREVIEWING: PipelineState = PipelineState::Live { pose_active: false };

    /// Preview with pose detection on
    pub const POSE_ACTIVE: PipelineState = PipelineState::Live { pose_active: true };

    /// Check if this state transition is valid
    pub fn can_transition_to(&self, target: &PipelineState) -> bool {
        use PipelineState::*;

        match (self, target) {
            // From Idle
            (Idle, Live { pose_active: false }) => true,

            // Pose toggling keeps the live/recording variant
            (Live { .. }, Live { .. }) => true,
            (Recording { .. }, Recording { .. }) => true,

            // Recording flips the live state and keeps the pose flag
            (Live { pose_active: a }, Recording { pose_active: b, .. }) => a == b,
            (Recording { pose_active: a, .. }, Live { pose_active: b }) => a == b,

            // Finalized artifact
            (Live { .. }, Reviewing) => true,

            // Retake
            (Reviewing, Live { pose_active: false }) => true,

            // Release of the camera is always allowed
            (_, Idle) => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Get a human-readable description of this state
    pub fn description(&self) -> &'static str {
        match self {
            PipelineState::Idle => "Idle",
            PipelineState::Live { pose_active: false } => "Previewing",
            PipelineState::Live { pose_active: true } => "PoseActive",
            PipelineState::Recording { .. } => "Recording",
            PipelineState::Reviewing => "Reviewing",
        }
    }

    /// Camera feed is being shown (previewing or recording)
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            PipelineState::Live { .. } | PipelineState::Recording { .. }
        )
    }

    /// Check if the pipeline is recording
    pub fn is_recording(&self) -> bool {
        matches!(self, PipelineState::Recording { .. })
    }

    /// Check if the pipeline is reviewing a finished recording
    pub fn is_reviewing(&self) -> bool {
        matches!(self, PipelineState::Reviewing)
    }

    /// Pose detection flag, false outside the live states
    pub fn pose_active(&self) -> bool {
        match self {
            PipelineState::Live { pose_active } | PipelineState::Recording { pose_active, .. } => {
                *pose_active
            }
            _ => false,
        }
    }

    /// Same live variant with the pose flag replaced
    pub fn with_pose(&self, pose_active: bool) -> PipelineState {
        match *self {
            PipelineState::Live { .. } => PipelineState::Live { pose_active },
            PipelineState::Recording { started_at, .. } => PipelineState::Recording {
                pose_active,
                started_at,
            },
            other => other,
        }
    }

    /// Get the duration since the recording started (if recording)
    pub fn recording_duration(&self) -> Option<std::time::Duration> {
        if let PipelineState::Recording { started_at, .. } = self {
            Some(started_at.elapsed())
        } else {
            None
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.description())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(pose_active: bool) -> PipelineState {
        PipelineState::Recording {
            pose_active,
            started_at: Instant::now(),
        }
    }

    #[test]
    fn test_valid_transitions() {
        let idle = PipelineState::Idle;
        let previewing = PipelineState::PREVIEWING;
        let pose = PipelineState::POSE_ACTIVE;
        let reviewing = PipelineState::Reviewing;

        assert!(idle.can_transition_to(&previewing));
        assert!(previewing.can_transition_to(&pose));
        assert!(pose.can_transition_to(&previewing));
        assert!(previewing.can_transition_to(&recording(false)));
        assert!(pose.can_transition_to(&recording(true)));
        assert!(recording(true).can_transition_to(&recording(false)));
        assert!(recording(true).can_transition_to(&pose));
        assert!(pose.can_transition_to(&reviewing));
        assert!(reviewing.can_transition_to(&previewing));
        assert!(reviewing.can_transition_to(&idle));
    }

    #[test]
    fn test_invalid_transitions() {
        let idle = PipelineState::Idle;
        let reviewing = PipelineState::Reviewing;

        assert!(!idle.can_transition_to(&recording(false))); // Must acquire the camera first
        assert!(!idle.can_transition_to(&reviewing));
        assert!(!recording(false).can_transition_to(&reviewing)); // Stop comes first
        assert!(!reviewing.can_transition_to(&recording(false)));
        assert!(!reviewing.can_transition_to(&PipelineState::POSE_ACTIVE));
        // Starting or stopping a recording never flips the pose flag
        assert!(!PipelineState::PREVIEWING.can_transition_to(&recording(true)));
        assert!(!recording(true).can_transition_to(&PipelineState::PREVIEWING));
    }

    #[test]
    fn test_state_checks() {
        let rec = recording(true);
        assert!(rec.is_live());
        assert!(rec.is_recording());
        assert!(rec.pose_active());
        assert!(rec.recording_duration().is_some());
        assert!(!rec.with_pose(false).pose_active());
        assert!(rec.with_pose(false).is_recording());

        let pose = PipelineState::POSE_ACTIVE;
        assert!(pose.is_live());
        assert!(!pose.is_recording());
        assert_eq!(pose.to_string(), "PoseActive");
        assert_eq!(PipelineState::PREVIEWING.to_string(), "Previewing");

        assert!(!PipelineState::Reviewing.is_live());
        assert!(!PipelineState::Reviewing.pose_active());
        assert_eq!(
            PipelineState::Reviewing.with_pose(true),
            PipelineState::Reviewing
        );
    }
}
