//! Scenario runner - executes multi-peer synchronization scenarios.

use crate::context::SimContext;
use crate::exporter::SimExport;
use crate::scenarios::ScenarioId;
use crate::world::{SimConfig, SimWorld};

use nalgebra::{UnitQuaternion, Vector3};
use rand::Rng;
use scenesync_core::{
    read_json_lines, Annotation, JsonLinesSink, ModelManifest, Pose, RecordingPlayer,
    RecordingSink, SceneSession, SessionContext, SyncConfig,
};
use scenesync_env::{SceneContext, SessionId};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Results from running a scenario.
#[derive(Debug, Clone)]
pub struct ScenarioResult {
    /// Scenario that was run
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Total ticks executed
    pub total_ticks: u64,

    /// Final simulation time in seconds
    pub final_time_secs: f64,

    /// Number of entities the master holds at the end
    pub final_entity_count: usize,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,

    /// Frame-by-frame export, when requested
    pub export: Option<SimExport>,
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default)]
pub struct ScenarioMetrics {
    /// Frames handed to the network by all peers
    pub frames_sent: u64,

    /// Frames delivered to an inbox
    pub frames_delivered: u64,

    /// Frames lost in the network
    pub frames_dropped: u64,

    /// Frames a peer could not decode or raise
    pub frames_rejected: u64,

    /// Local moves made by the scenario
    pub local_moves: u64,

    /// Pose events published by the master
    pub master_poses: u64,

    /// Pose events published by anyone else
    pub echo_poses: u64,

    /// Largest master/peer position gap at the end
    pub max_divergence: f32,
}

/// A world plus the bookkeeping a scenario needs around it.
struct Run {
    world: SimWorld,
    tracked: Vec<String>,
    export: Option<SimExport>,
    export_every: u64,
    local_moves: u64,
}

impl Run {
    async fn step(&mut self) -> usize {
        let activity = self.world.step().await;
        if let Some(export) = &mut self.export {
            if self.world.tick_count() % self.export_every == 0 {
                export.add_frame(self.world.capture_frame(&self.tracked));
            }
        }
        activity
    }

    async fn run_for(&mut self, duration: Duration) {
        let ticks = (duration.as_secs_f64() * self.world.config.tick_rate_hz as f64).ceil() as u64;
        for _ in 0..ticks {
            self.step().await;
        }
    }

    async fn settle(&mut self) -> bool {
        let max_ticks = self.world.config.tick_rate_hz as u64 * 10;
        for _ in 0..max_ticks {
            if self.step().await == 0 && self.world.in_flight() == 0 {
                return true;
            }
        }
        false
    }

    fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!("{}", message);
        if let Some(export) = &mut self.export {
            export.note(message);
        }
    }

    fn master(&self) -> Result<&SceneSession<SimContext>, String> {
        self.world
            .master()
            .map(|peer| peer.scene())
            .ok_or_else(|| "world has no peers".to_string())
    }

    /// Master loads `count` models and everyone catches up.
    async fn load_models(&mut self, count: usize) -> Result<Vec<String>, String> {
        let mut addresses = Vec::new();
        for i in 0..count {
            let address = format!("Models/Model{i}");
            let manifest = ModelManifest::new(format!("model-{i}.glb"))
                .with_part("Body")
                .with_part("Lid");
            self.master()?
                .load(&address, &manifest)
                .map_err(|e| e.to_string())?;
            self.tracked.push(address.clone());
            addresses.push(address);
        }
        if !self.settle().await {
            return Err("network did not settle after loading".to_string());
        }
        Ok(addresses)
    }

    /// Master drags `address` somewhere random.
    fn random_move(&mut self, address: &str) -> Result<Pose, String> {
        let pose = self.world.context.with_rng(|rng| {
            Pose::new(
                Vector3::new(
                    rng.gen_range(-10.0..10.0),
                    rng.gen_range(0.0..3.0),
                    rng.gen_range(-10.0..10.0),
                ),
                Vector3::new(1.0, 1.0, 1.0),
                UnitQuaternion::from_euler_angles(0.0, rng.gen_range(-3.0..3.0), 0.0),
            )
        });
        self.master()?
            .move_entity(address, pose)
            .map_err(|e| e.to_string())?;
        self.local_moves += 1;
        Ok(pose)
    }

    /// Every tracked address looks the same on every peer.
    fn check_converged(&self) -> Result<(), String> {
        for address in &self.tracked {
            if !self.world.converged(address) {
                return Err(format!(
                    "{address} diverged by {:.3}",
                    self.world.divergence(address)
                ));
            }
        }
        Ok(())
    }

    /// Only the master ever publishes poses.
    fn check_no_echo(&self) -> Result<(), String> {
        for peer in self.world.peers().iter().skip(1) {
            let published = peer.stats().poses_published;
            if published > 0 {
                return Err(format!(
                    "peer {} republished {published} poses",
                    peer.index()
                ));
            }
        }
        Ok(())
    }

    fn metrics(&self) -> ScenarioMetrics {
        let totals = self.world.peer_totals();
        let traffic = self.world.traffic();
        let master_poses = self
            .world
            .master()
            .map(|peer| peer.stats().poses_published)
            .unwrap_or_default();
        ScenarioMetrics {
            frames_sent: totals.frames_sent,
            frames_delivered: traffic.delivered,
            frames_dropped: traffic.dropped,
            frames_rejected: totals.frames_rejected,
            local_moves: self.local_moves,
            master_poses,
            echo_poses: totals.poses_published - master_poses,
            max_divergence: self
                .tracked
                .iter()
                .map(|address| self.world.divergence(address))
                .fold(0.0, f32::max),
        }
    }
}

/// Runs synchronization scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Number of peers
    num_peers: usize,

    /// Tick rate in Hz
    tick_rate_hz: u32,

    /// Maximum duration in seconds
    max_duration_secs: f64,

    /// Whether to keep a frame-by-frame export
    export: bool,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, num_peers: usize) -> Self {
        Self {
            seed,
            num_peers: num_peers.max(2),
            tick_rate_hz: 30,
            max_duration_secs: 10.0,
            export: false,
        }
    }

    /// Sets the tick rate.
    pub fn with_tick_rate(mut self, hz: u32) -> Self {
        self.tick_rate_hz = hz.max(1);
        self
    }

    /// Sets the maximum duration.
    pub fn with_duration(mut self, secs: f64) -> Self {
        self.max_duration_secs = secs.max(1.0);
        self
    }

    /// Keeps a frame-by-frame export in the result.
    pub fn with_export(mut self, export: bool) -> Self {
        self.export = export;
        self
    }

    fn config(&self) -> SimConfig {
        SimConfig {
            seed: self.seed,
            num_peers: self.num_peers,
            tick_rate_hz: self.tick_rate_hz,
            max_duration_secs: self.max_duration_secs,
            ..SimConfig::default()
        }
    }

    fn start(&self, scenario: ScenarioId) -> Run {
        Run {
            world: SimWorld::new(self.config()),
            tracked: Vec::new(),
            export: self
                .export
                .then(|| SimExport::new(scenario.name(), self.seed)),
            export_every: (self.tick_rate_hz as u64 / 10).max(1),
            local_moves: 0,
        }
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let runtime = match tokio::runtime::Builder::new_current_thread().build() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("Failed to build runtime: {}", e);
                return ScenarioResult {
                    scenario,
                    seed: self.seed,
                    passed: false,
                    total_ticks: 0,
                    final_time_secs: 0.0,
                    final_entity_count: 0,
                    failure_reason: Some(format!("runtime: {e}")),
                    metrics: ScenarioMetrics::default(),
                    export: None,
                };
            }
        };

        runtime.block_on(async {
            let mut run = self.start(scenario);
            let outcome = match scenario {
                ScenarioId::FeedbackStorm => self.run_feedback_storm(&mut run).await,
                ScenarioId::SnapshotRestore => self.run_snapshot_restore(&mut run).await,
                ScenarioId::LateJoiner => self.run_late_joiner(&mut run).await,
                ScenarioId::RecordingPlayback => self.run_recording_playback(&mut run).await,
                ScenarioId::EchoReplay => self.run_echo_replay(&mut run).await,
            };
            self.finish(scenario, run, outcome)
        })
    }

    fn finish(&self, scenario: ScenarioId, run: Run, outcome: Result<(), String>) -> ScenarioResult {
        let metrics = run.metrics();
        let passed = outcome.is_ok();
        let mut export = run.export;
        if let Some(export) = &mut export {
            export.finalize(passed, Some(metrics.max_divergence));
        }

        info!(
            "{}: sent={} delivered={} dropped={} moves={} master_poses={} echo_poses={}",
            scenario.name(),
            metrics.frames_sent,
            metrics.frames_delivered,
            metrics.frames_dropped,
            metrics.local_moves,
            metrics.master_poses,
            metrics.echo_poses,
        );

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed,
            total_ticks: run.world.tick_count(),
            final_time_secs: run.world.time(),
            final_entity_count: run
                .world
                .master()
                .map(|peer| peer.scene().entity_count())
                .unwrap_or_default(),
            failure_reason: outcome.err(),
            metrics,
            export,
        }
    }

    /// SYN-001: FeedbackStorm - the master keeps dragging entities around.
    ///
    /// **Assertion**: every peer ends on the master's poses, the master
    /// published exactly one pose per move, nobody else published at all.
    async fn run_feedback_storm(&self, run: &mut Run) -> Result<(), String> {
        info!("SYN-001: FeedbackStorm");
        let models = run.load_models(3).await?;

        let seconds = self.max_duration_secs.floor() as usize;
        for second in 0..seconds {
            let address = &models[second % models.len()];
            run.random_move(address)?;
            run.run_for(Duration::from_secs(1)).await;
        }
        run.run_for(Duration::from_secs(1)).await;
        run.settle().await;

        run.check_converged()?;
        run.check_no_echo()?;
        let metrics = run.metrics();
        if metrics.master_poses != metrics.local_moves {
            return Err(format!(
                "master published {} poses for {} moves",
                metrics.master_poses, metrics.local_moves
            ));
        }
        Ok(())
    }

    /// SYN-002: SnapshotRestore - rewind the master to a saved scene.
    ///
    /// **Assertion**: the master comes back exactly as saved, and the
    /// restored poses reach every peer.
    async fn run_snapshot_restore(&self, run: &mut Run) -> Result<(), String> {
        info!("SYN-002: SnapshotRestore");
        let models = run.load_models(2).await?;

        let mut note = Annotation::new("Note");
        note.color = [1.0, 0.2, 0.2, 1.0];
        note.add_point(Vector3::new(0.0, 1.0, 0.0));
        note.add_point(Vector3::new(0.5, 1.2, 0.0));
        let note_address = run
            .master()?
            .annotate(Some(models[0].as_str()), &note)
            .map_err(|e| e.to_string())?;
        run.tracked.push(note_address.clone());
        run.master()?.set_visibility(&models[1], false);
        let saved_pose = run.random_move(&models[0])?;
        run.run_for(Duration::from_secs(1)).await;
        run.settle().await;

        let saved = run.master()?.snapshot("").map_err(|e| e.to_string())?;
        run.note(format!(
            "snapshot: {} content, {} view events",
            saved.content_events().len(),
            saved.view_event_count()
        ));

        run.random_move(&models[0])?;
        run.master()?.set_visibility(&models[1], true);
        run.run_for(Duration::from_secs(1)).await;
        run.settle().await;

        run.master()?.restore(&saved);
        run.note("restored");
        run.run_for(Duration::from_secs(1)).await;
        run.settle().await;

        let master = run.master()?;
        if master.pose_of(&models[0]) != Some(saved_pose) {
            return Err("master pose not restored".to_string());
        }
        if master.annotation(&note_address) != Some(note) {
            return Err("annotation not restored".to_string());
        }
        if master.entity_count() != models.len() {
            return Err(format!("master holds {} entities", master.entity_count()));
        }
        // Visibility is not republished by monitors; peers keep the last
        // request they saw.
        run.tracked.retain(|address| address != &models[1]);
        run.check_converged()?;
        run.check_no_echo()
    }

    /// SYN-003: LateJoiner - a peer arrives after the scene was built.
    ///
    /// **Assertion**: the newcomer ends with the master's entities, poses,
    /// visibility and annotations.
    async fn run_late_joiner(&self, run: &mut Run) -> Result<(), String> {
        info!("SYN-003: LateJoiner");
        let models = run.load_models(2).await?;

        let note_address = run
            .master()?
            .annotate(Some(models[1].as_str()), &Annotation::new("Pin"))
            .map_err(|e| e.to_string())?;
        run.tracked.push(note_address.clone());
        run.master()?.set_visibility(&models[1], false);
        for address in &models {
            run.random_move(address)?;
        }
        run.run_for(Duration::from_secs(1)).await;
        run.settle().await;

        let index = run.world.join_peer().await;
        run.note(format!("peer {index} joined"));
        run.settle().await;
        run.run_for(Duration::from_secs(1)).await;

        let newcomer = run
            .world
            .peer(index)
            .ok_or_else(|| "newcomer missing".to_string())?
            .scene();
        let master = run.master()?;
        if newcomer.entity_count() != master.entity_count() {
            return Err(format!(
                "newcomer holds {} of {} entities",
                newcomer.entity_count(),
                master.entity_count()
            ));
        }
        if newcomer.annotation(&note_address).is_none() {
            return Err("newcomer is missing the annotation".to_string());
        }
        if newcomer.session().user_count() + 1 != run.world.peer_count() {
            return Err("newcomer roster incomplete".to_string());
        }
        run.check_converged()?;
        run.check_no_echo()
    }

    /// SYN-004: RecordingPlayback - replay the master into an empty scene.
    ///
    /// **Assertion**: the recording survives a JSON-lines round trip and the
    /// played-back scene matches the master.
    async fn run_recording_playback(&self, run: &mut Run) -> Result<(), String> {
        info!("SYN-004: RecordingPlayback");
        run.world
            .peer_mut(0)
            .ok_or_else(|| "world has no peers".to_string())?
            .scene_mut()
            .start_recording();

        let models = run.load_models(2).await?;
        run.master()?
            .annotate(Some(models[0].as_str()), &Annotation::new("Arrow"))
            .map_err(|e| e.to_string())?;
        for address in &models {
            run.random_move(address)?;
            run.run_for(Duration::from_secs(1)).await;
        }
        run.master()?.set_visibility(&models[1], false);
        run.run_for(Duration::from_secs(1)).await;
        run.settle().await;

        let entries = run.master()?.flush_recording();
        let mut sink = JsonLinesSink::new(Vec::new());
        sink.write_batch(&entries).map_err(|e| e.to_string())?;
        let restored =
            read_json_lines(Cursor::new(sink.into_inner())).map_err(|e| e.to_string())?;
        if restored != entries {
            return Err("recording changed on disk".to_string());
        }
        run.note(format!("recorded {} entries", entries.len()));

        let context = SimContext::shared(self.seed ^ 0xfeed);
        let session = SessionContext::shared(SessionId::from_seed(u64::MAX), SyncConfig::default());
        let playback = SceneSession::new(session, context.clone());
        let mut player = RecordingPlayer::new(restored);
        player.start(context.now());
        let dt = run.world.dt();
        while !player.is_finished() {
            context.advance_time(dt);
            player.advance(context.now(), playback.bus());
            playback.tick();
        }

        let master = run.master()?;
        if playback.entity_count() != master.entity_count() {
            return Err("playback entity count differs".to_string());
        }
        for address in &models {
            if playback.pose_of(address) != master.pose_of(address)
                || playback.is_visible(address) != master.is_visible(address)
            {
                return Err(format!("playback differs at {address}"));
            }
        }
        run.check_converged()
    }

    /// SYN-005: EchoReplay - the relay hands every broadcast back to its
    /// sender.
    ///
    /// **Assertion**: echoes are received and dropped; pose traffic stays at
    /// one publish per move.
    async fn run_echo_replay(&self, run: &mut Run) -> Result<(), String> {
        info!("SYN-005: EchoReplay");
        let ids: Vec<SessionId> = run.world.peers().iter().map(|p| p.id()).collect();
        for id in ids {
            run.world.network_controller.set_echo(id, true);
        }

        let models = run.load_models(2).await?;
        let moves = (self.max_duration_secs.floor() as usize).min(6);
        for i in 0..moves {
            run.random_move(&models[i % models.len()])?;
            run.run_for(Duration::from_secs(1)).await;
        }
        run.settle().await;

        let master_received = run
            .world
            .master()
            .map(|peer| peer.stats().frames_received)
            .unwrap_or_default();
        if master_received == 0 {
            return Err("master never saw its own echoes".to_string());
        }
        run.check_converged()?;
        run.check_no_echo()?;
        let metrics = run.metrics();
        if metrics.master_poses != metrics.local_moves || metrics.frames_rejected > 0 {
            return Err(format!(
                "{} poses for {} moves, {} frames rejected",
                metrics.master_poses, metrics.local_moves, metrics.frames_rejected
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> ScenarioRunner {
        ScenarioRunner::new(42, 3).with_duration(4.0)
    }

    #[test]
    fn test_feedback_storm_passes() {
        let result = runner().run(ScenarioId::FeedbackStorm);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert_eq!(result.metrics.echo_poses, 0);
        assert_eq!(result.final_entity_count, 3);
    }

    #[test]
    fn test_snapshot_restore_passes() {
        let result = runner().run(ScenarioId::SnapshotRestore);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_late_joiner_passes() {
        let result = runner().run(ScenarioId::LateJoiner);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_recording_playback_passes() {
        let result = runner().run(ScenarioId::RecordingPlayback);
        assert!(result.passed, "{:?}", result.failure_reason);
    }

    #[test]
    fn test_echo_replay_passes() {
        let result = runner().run(ScenarioId::EchoReplay);
        assert!(result.passed, "{:?}", result.failure_reason);
        assert!(result.metrics.frames_delivered > 0);
    }

    #[test]
    fn test_same_seed_same_traffic() {
        let a = runner().run(ScenarioId::FeedbackStorm);
        let b = runner().run(ScenarioId::FeedbackStorm);
        assert_eq!(a.metrics.frames_sent, b.metrics.frames_sent);
        assert_eq!(a.metrics.frames_delivered, b.metrics.frames_delivered);
        assert_eq!(a.total_ticks, b.total_ticks);
    }

    #[test]
    fn test_export_collects_frames() {
        let result = runner().with_export(true).run(ScenarioId::LateJoiner);
        let export = result.export.unwrap();
        assert!(!export.frames.is_empty());
        assert_eq!(export.passed, result.passed);
    }
}
