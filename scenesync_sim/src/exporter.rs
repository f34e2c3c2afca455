//! JSON exporter for offline inspection of a run.
//!
//! Exports per-peer entity poses at regular intervals, so a run's
//! convergence can be plotted or diffed between seeds.

use scenesync_core::Pose;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use thiserror::Error;

/// Failures writing an export.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("export I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("export encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A single frame of simulation data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimFrame {
    /// Simulation time in seconds
    pub time_sec: f64,

    /// What each peer shows
    pub peers: Vec<PeerFrame>,

    /// Notable moments (partitions, restores, joins)
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub events: Vec<SimEvent>,
}

/// One peer's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerFrame {
    pub peer: usize,
    pub entities: Vec<EntityFrame>,
}

/// Pose and visibility of one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityFrame {
    pub address: String,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub visible: bool,
}

impl EntityFrame {
    pub fn new(address: &str, pose: &Pose, visible: bool) -> Self {
        Self {
            address: address.to_string(),
            x: pose.position.x,
            y: pose.position.y,
            z: pose.position.z,
            visible,
        }
    }
}

/// Simulation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimEvent {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Complete simulation export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimExport {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    /// Duration in seconds
    pub duration_sec: f64,

    /// All frames
    pub frames: Vec<SimFrame>,

    /// Final results
    pub passed: bool,

    /// Largest master/peer gap at the end, if measured
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_divergence: Option<f32>,
}

impl SimExport {
    /// Creates a new export container.
    pub fn new(scenario: &str, seed: u64) -> Self {
        Self {
            scenario: scenario.to_string(),
            seed,
            duration_sec: 0.0,
            frames: Vec::new(),
            passed: false,
            final_divergence: None,
        }
    }

    /// Adds a frame.
    pub fn add_frame(&mut self, frame: SimFrame) {
        self.duration_sec = frame.time_sec;
        self.frames.push(frame);
    }

    /// Attaches a note to the latest frame.
    pub fn note(&mut self, message: impl Into<String>) {
        if let Some(frame) = self.frames.last_mut() {
            frame.events.push(SimEvent {
                message: message.into(),
                level: None,
            });
        }
    }

    /// Finalizes the export.
    pub fn finalize(&mut self, passed: bool, divergence: Option<f32>) {
        self.passed = passed;
        self.final_divergence = divergence;
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &str) -> Result<(), ExportError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}
