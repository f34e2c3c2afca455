//! Multi-peer synchronization scenarios.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// SYN-001: master keeps moving entities; peers must follow without
    /// ever republishing
    FeedbackStorm,

    /// SYN-002: snapshot, teardown and restore; peers re-converge
    SnapshotRestore,

    /// SYN-003: a peer joins mid-session and receives the scene
    LateJoiner,

    /// SYN-004: record the master, play it back into an empty session
    RecordingPlayback,

    /// SYN-005: the relay echoes every broadcast back to its sender
    EchoReplay,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::FeedbackStorm,
            ScenarioId::SnapshotRestore,
            ScenarioId::LateJoiner,
            ScenarioId::RecordingPlayback,
            ScenarioId::EchoReplay,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::FeedbackStorm => "feedback_storm",
            ScenarioId::SnapshotRestore => "snapshot_restore",
            ScenarioId::LateJoiner => "late_joiner",
            ScenarioId::RecordingPlayback => "recording_playback",
            ScenarioId::EchoReplay => "echo_replay",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::FeedbackStorm => {
                "Master moves entities every second; only the master may publish"
            }
            ScenarioId::SnapshotRestore => {
                "Snapshot, tear down, restore; restored poses reach every peer"
            }
            ScenarioId::LateJoiner => "Peer joins after content exists and catches up",
            ScenarioId::RecordingPlayback => {
                "Recorded session replayed into a fresh scene ends identical"
            }
            ScenarioId::EchoReplay => "Relay echoes broadcasts to their sender; no cascade",
        }
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "feedback_storm" | "feedbackstorm" | "syn-001" => Ok(ScenarioId::FeedbackStorm),
            "snapshot_restore" | "snapshotrestore" | "syn-002" => Ok(ScenarioId::SnapshotRestore),
            "late_joiner" | "latejoiner" | "syn-003" => Ok(ScenarioId::LateJoiner),
            "recording_playback" | "recordingplayback" | "syn-004" => {
                Ok(ScenarioId::RecordingPlayback)
            }
            "echo_replay" | "echoreplay" | "syn-005" => Ok(ScenarioId::EchoReplay),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
