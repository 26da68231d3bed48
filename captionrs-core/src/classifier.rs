use std::fmt;

use serde::{Serialize, Serializer};

/// Coarse motion category inferred from a caption.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionLabel {
    Running,
    Jumping,
    Swimming,
    CyclingRiding,
    Climbing,
    GeneralPose,
}

impl ActionLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Jumping => "Jumping",
            Self::Swimming => "Swimming",
            Self::CyclingRiding => "Cycling/Riding",
            Self::Climbing => "Climbing",
            Self::GeneralPose => "General Pose",
        }
    }
}

impl fmt::Display for ActionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ActionLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

// Evaluated top to bottom, first hit wins. Explicit motion words come before
// the environment words. Changing either list changes classifications.
const RULES: &[(&[&str], ActionLabel)] = &[
    (
        &["run", "running", "sprinting", "jogging"],
        ActionLabel::Running,
    ),
    (
        &["jump", "jumping", "leap", "leaping", "fly", "midair"],
        ActionLabel::Jumping,
    ),
    (&["swim", "swimming", "diving"], ActionLabel::Swimming),
    (
        &["ride", "riding", "bike", "bicycle", "motorcycle"],
        ActionLabel::CyclingRiding,
    ),
    (
        &["water", "pool", "ocean", "river", "lake", "beach"],
        ActionLabel::Swimming,
    ),
    (&["grass", "field", "park", "track"], ActionLabel::Running),
    (&["mountain", "rock", "climb"], ActionLabel::Climbing),
];

/// Map a caption to an action label by substring matching on the lower-cased
/// text. Never fails; unmatched captions are [`ActionLabel::GeneralPose`].
pub fn classify(caption: &str) -> ActionLabel {
    let caption = caption.to_lowercase();
    RULES
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|k| caption.contains(k)))
        .map_or(ActionLabel::GeneralPose, |(_, label)| *label)
}
