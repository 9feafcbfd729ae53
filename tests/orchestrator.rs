// Recording orchestrator behaviour against the fake pipeline backend

mod common;

use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use common::{collaborators, test_config, wait_for, FakeBackend, FakeProber, FixedCpu};
use matchcam::recording::orchestrator::pipeline_name;
use matchcam::recording::{RecordingOrchestrator, RecordingStatus};
use matchcam::session::SessionStore;

const WAIT: Duration = Duration::from_secs(5);

fn orchestrator(
    root: &std::path::Path,
) -> (RecordingOrchestrator, Arc<FakeBackend>, Arc<FakeProber>) {
    let backend = FakeBackend::new();
    let prober = FakeProber::new();
    let orchestrator =
        RecordingOrchestrator::new(test_config(root), collaborators(&backend, &prober));
    (orchestrator, backend, prober)
}

/// Wait until a camera's recovery has finished and its pipeline was started
/// `starts` times in total
fn wait_recovered(
    orchestrator: &RecordingOrchestrator,
    backend: &FakeBackend,
    camera_id: &str,
    starts: usize,
) -> bool {
    wait_for(WAIT, || {
        let status = orchestrator.status();
        backend.start_count(&pipeline_name(camera_id)) == starts
            && status
                .recovery_state
                .get(camera_id)
                .is_some_and(|r| !r.recovering)
    })
}

#[test]
fn scenario_start_and_stop_two_healthy_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());

    let started = orchestrator.start("match_1", false, false);
    assert!(started.success, "{}", started.message);
    assert_eq!(started.cameras_started, vec!["0".to_string(), "1".to_string()]);

    let status = orchestrator.status();
    assert!(status.recording);
    assert_eq!(status.match_id.as_deref(), Some("match_1"));
    assert_eq!(status.cameras["0"].state, "running");
    assert_eq!(status.cameras["1"].state, "running");
    assert!(!status.degraded);

    let stopped = orchestrator.stop(false);
    assert!(stopped.success, "{}", stopped.message);
    assert!(stopped.transport_success);
    assert!(stopped.graceful_stop);
    assert!(stopped.cameras["0"].finalized);
    assert!(stopped.cameras["1"].finalized);
    assert_eq!(stopped.integrity.all_ok, Some(true));

    assert_eq!(backend.len(), 0);
    assert!(!orchestrator.status().recording);
}

#[test]
fn session_state_file_follows_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = SessionStore::new(&config.session_state_path());
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());

    assert!(orchestrator.start("match_1", false, true).success);
    let persisted = store.load().expect("state file written on start");
    assert!(persisted.recording);
    assert_eq!(persisted.match_id.as_deref(), Some("match_1"));
    assert!(persisted.process_after_recording);
    assert!(persisted.start_time.is_some());

    orchestrator.stop(true);
    let persisted = store.load().expect("state file rewritten on stop");
    assert!(!persisted.recording);
    assert_eq!(persisted.match_id, None);
}

#[test]
fn strict_start_rolls_back_every_camera() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    backend.fail_create(&pipeline_name("1"));

    let started = orchestrator.start("match_1", false, false);

    assert!(!started.success);
    assert!(started.cameras_failed.contains_key("1"));
    assert!(started.cameras_started.is_empty());
    assert_eq!(backend.len(), 0, "no pipeline may survive a rolled back start");
    let status = orchestrator.status();
    assert!(!status.recording);
    assert_eq!(status.status, RecordingStatus::Idle);
}

#[test]
fn start_failure_is_rolled_back_too() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    backend.fail_start(&pipeline_name("0"));

    let started = orchestrator.start("match_1", false, false);

    assert!(!started.success);
    assert!(started.cameras_failed["0"].contains("injected start failure"));
    assert_eq!(backend.len(), 0);
}

#[test]
fn lenient_start_records_with_remaining_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.recording.require_all_cameras = false;
    let backend = FakeBackend::new();
    let prober = FakeProber::new();
    backend.fail_create(&pipeline_name("1"));
    let orchestrator = RecordingOrchestrator::new(config, collaborators(&backend, &prober));

    let started = orchestrator.start("match_1", false, false);

    assert!(started.success, "{}", started.message);
    assert_eq!(started.cameras_started, vec!["0".to_string()]);
    assert!(started.cameras_failed.contains_key("1"));

    let status = orchestrator.status();
    assert!(status.recording);
    assert!(status.degraded);
    assert!(status.degraded_cameras.contains_key("1"));
    assert_eq!(status.cameras["0"].state, "running");
    assert_eq!(status.cameras["1"].state, "degraded");

    // The degraded camera is left out of the stop gate
    let stopped = orchestrator.stop(true);
    assert!(stopped.success, "{}", stopped.message);
    assert!(stopped.degraded_cameras.contains_key("1"));
    assert!(!stopped.integrity.cameras.contains_key("1"));
}

#[test]
fn start_while_recording_needs_force() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());

    assert!(orchestrator.start("match_1", false, false).success);
    let again = orchestrator.start("match_2", false, false);
    assert!(!again.success);
    assert!(again.message.contains("already recording"));
    assert_eq!(orchestrator.status().match_id.as_deref(), Some("match_1"));

    let forced = orchestrator.start("match_2", true, false);
    assert!(forced.success, "{}", forced.message);
    assert_eq!(orchestrator.status().match_id.as_deref(), Some("match_2"));
    assert_eq!(backend.start_count(&pipeline_name("0")), 2);
    assert_eq!(backend.len(), 2);
}

#[test]
fn invalid_match_id_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());

    assert!(!orchestrator.start("../escape", false, false).success);
    assert!(!orchestrator.start("", false, false).success);
    assert_eq!(backend.create_count(&pipeline_name("0")), 0);
}

#[test]
fn double_stop_reports_not_recording() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());

    assert!(orchestrator.start("match_1", false, false).success);
    assert!(orchestrator.stop(false).success);

    let second = orchestrator.stop(false);
    assert!(second.success);
    assert_eq!(second.message, "not recording");
    assert!(second.cameras.is_empty());
}

#[test]
fn protection_window_requires_force() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.recording.protection_secs = 3600;
    let backend = FakeBackend::new();
    let prober = FakeProber::new();
    let orchestrator = RecordingOrchestrator::new(config, collaborators(&backend, &prober));

    assert!(orchestrator.start("match_1", false, false).success);

    let rejected = orchestrator.stop(false);
    assert!(!rejected.success);
    assert!(rejected.message.contains("requires force"));
    assert!(orchestrator.status().recording);
    assert_eq!(backend.len(), 2);

    assert!(orchestrator.stop(true).success);
    assert!(!orchestrator.status().recording);
}

#[test]
fn concurrent_stop_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    let orchestrator = Arc::new(orchestrator);

    assert!(orchestrator.start("match_1", false, false).success);
    backend.set_stop_delay(Duration::from_millis(500));

    let first = {
        let orchestrator = orchestrator.clone();
        std::thread::spawn(move || orchestrator.stop(true))
    };
    assert!(wait_for(WAIT, || orchestrator.status().status == RecordingStatus::Stopping));

    let second = orchestrator.stop(true);
    assert!(!second.success);
    assert!(second.message.contains("already in progress"));

    assert!(first.join().unwrap().success);
    assert!(!orchestrator.status().recording);
}

#[test]
fn scenario_transient_fault_is_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_2", false, false).success);

    assert!(backend.fire_error(&pipeline_name("1"), "v4l2src0: device busy"));
    assert!(wait_recovered(&orchestrator, &backend, "1", 2));

    let status = orchestrator.status();
    assert!(!status.degraded);
    assert!(status.degraded_cameras.is_empty());
    assert_eq!(status.cameras["1"].state, "running");
    assert_eq!(status.cameras["1"].run, 2);
    assert_eq!(status.recovery_state["1"].attempts, 1);
    assert_eq!(status.recovery_state["1"].last_error, None);
    assert_eq!(backend.start_count(&pipeline_name("0")), 1);

    // The rebuilt pipeline writes a new run instead of overwriting the first
    let description = backend.description(&pipeline_name("1")).unwrap();
    assert!(description.ends_with("segment_r02_%05d.mkv"), "{}", description);
}

#[test]
fn scenario_exhausted_recovery_degrades_one_camera() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_2", false, false).success);
    let cam1 = pipeline_name("1");

    assert!(backend.fire_error(&cam1, "boom 1"));
    assert!(wait_recovered(&orchestrator, &backend, "1", 2));
    assert!(backend.fire_error(&cam1, "boom 2"));
    assert!(wait_recovered(&orchestrator, &backend, "1", 3));
    assert!(backend.fire_error(&cam1, "boom 3"));

    assert!(wait_for(WAIT, || orchestrator.status().degraded));
    let status = orchestrator.status();
    assert_eq!(status.degraded_cameras.get("1").map(String::as_str), Some("boom 3"));
    assert!(status.recovery_state["1"].failed_permanently);
    assert_eq!(status.recovery_state["1"].attempts, 2);
    assert_eq!(status.cameras["1"].state, "degraded");

    // Exactly two recoveries were attempted; the third error was not retried
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(backend.start_count(&cam1), 3);
    assert!(backend.description(&cam1).is_none());

    assert!(status.recording);
    assert_eq!(status.cameras["0"].state, "running");
    assert_eq!(backend.start_count(&pipeline_name("0")), 1);
}

#[test]
fn failed_rebuild_degrades_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);

    backend.fail_create(&pipeline_name("0"));
    assert!(backend.fire_error(&pipeline_name("0"), "pipeline stalled"));

    assert!(wait_for(WAIT, || orchestrator
        .status()
        .degraded_cameras
        .contains_key("0")));
    let status = orchestrator.status();
    assert!(status.recovery_state["0"].failed_permanently);
    assert_eq!(status.cameras["1"].state, "running");
}

#[test]
fn reported_error_goes_through_recovery() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());

    assert!(!orchestrator.report_camera_error("0", "not recording yet"));
    assert!(orchestrator.start("match_1", false, false).success);
    assert!(!orchestrator.report_camera_error("7", "no such camera"));

    assert!(orchestrator.report_camera_error("0", "frame timeout"));
    assert!(wait_recovered(&orchestrator, &backend, "0", 2));
    assert!(!orchestrator.status().degraded);
}

#[test]
fn faults_after_stop_are_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);
    assert!(orchestrator.stop(true).success);

    assert!(!orchestrator.report_camera_error("0", "late error"));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(backend.start_count(&pipeline_name("0")), 1);
    assert_eq!(backend.len(), 0);
}

#[test]
fn integrity_failure_fails_the_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, prober) = orchestrator(dir.path());
    prober.fail_paths_containing("/cam1/");

    assert!(orchestrator.start("match_1", false, false).success);
    let stopped = orchestrator.stop(false);

    assert!(stopped.transport_success);
    assert!(stopped.graceful_stop);
    assert!(!stopped.success);
    assert!(stopped.message.contains("integrity"), "{}", stopped.message);
    assert_eq!(stopped.integrity.all_ok, Some(false));
    assert_eq!(stopped.integrity.cameras["1"].ok, Some(false));
    assert_eq!(stopped.integrity.cameras["0"].ok, Some(true));

    // State is cleared regardless
    assert!(!orchestrator.status().recording);
}

#[test]
fn eos_timeout_is_not_finalized() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);
    backend.withhold_eos(true);

    let stopped = orchestrator.stop(false);

    assert!(!stopped.success);
    assert!(stopped.transport_success);
    assert!(!stopped.graceful_stop);
    assert!(stopped.cameras["0"].stop.timed_out);
    assert!(stopped.cameras["0"]
        .stop
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Timed out waiting for EOS")));
    assert!(!stopped.cameras["0"].finalized);
    assert!(stopped.message.contains("not finalized"));
    assert_eq!(backend.len(), 0);
}

#[test]
fn missing_segments_leave_integrity_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);

    let cam0 = dir.path().join("recordings/match_1/cam0");
    for entry in std::fs::read_dir(&cam0).unwrap() {
        std::fs::remove_file(entry.unwrap().path()).unwrap();
    }

    let stopped = orchestrator.stop(false);
    assert_eq!(stopped.integrity.all_ok, None);
    assert!(!stopped.integrity.cameras["0"].checked);
    // Unknown does not fail the gate
    assert!(stopped.success, "{}", stopped.message);
    assert!(stopped.message.contains("unverified"));
}

#[test]
fn unavailable_prober_leaves_integrity_unverified() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, prober) = orchestrator(dir.path());
    prober.set_unavailable(true);
    assert!(orchestrator.start("match_1", false, false).success);

    let stopped = orchestrator.stop(false);

    assert!(prober.probe_count() >= 2);
    assert!(stopped.success, "{}", stopped.message);
    assert!(stopped.message.contains("unverified"), "{}", stopped.message);
    assert_eq!(stopped.integrity.all_ok, None);
    for id in ["0", "1"] {
        let camera = &stopped.integrity.cameras[id];
        assert!(!camera.checked);
        assert_eq!(camera.ok, None);
        assert!(camera.error.as_deref().is_some_and(|e| e.contains("not installed")));
    }
}

#[test]
fn health_flags_segment_index_regression() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);

    let cam0 = dir.path().join("recordings/match_1/cam0");
    let later = cam0.join("segment_r01_00005.mkv");
    std::fs::write(&later, b"segment").unwrap();

    let report = orchestrator.check_health();
    assert!(report.healthy, "{:?}", report.issues);
    assert_eq!(report.cameras["0"].latest_segment.as_deref(), Some("segment_r01_00005.mkv"));

    std::fs::remove_file(&later).unwrap();
    let report = orchestrator.check_health();
    assert!(!report.healthy);
    assert!(report.cameras["0"]
        .issues
        .iter()
        .any(|issue| issue.contains("regressed")));
    assert!(report.cameras["1"].healthy);
}

#[test]
fn health_flags_restarted_segment_counter() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);

    let cam0 = dir.path().join("recordings/match_1/cam0");
    for index in 1..=5 {
        std::fs::write(cam0.join(format!("segment_r01_{:05}.mkv", index)), b"segment").unwrap();
    }
    let report = orchestrator.check_health();
    assert!(report.healthy, "{:?}", report.issues);
    assert_eq!(report.cameras["0"].latest_segment.as_deref(), Some("segment_r01_00005.mkv"));

    // The muxer starts over at index 0 and overwrites the first file
    let first = cam0.join("segment_r01_00000.mkv");
    std::fs::write(&first, b"rewritten").unwrap();
    File::options()
        .write(true)
        .open(&first)
        .unwrap()
        .set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();

    let report = orchestrator.check_health();
    assert!(!report.healthy);
    assert_eq!(report.cameras["0"].latest_segment.as_deref(), Some("segment_r01_00000.mkv"));
    assert!(report.cameras["0"]
        .issues
        .iter()
        .any(|issue| issue.contains("regressed")));
    assert!(report.cameras["1"].healthy);
}

#[test]
fn health_reports_missing_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, false).success);

    use matchcam::pipeline::PipelineBackend;
    backend.remove(&pipeline_name("1"));

    let report = orchestrator.check_health();
    assert!(!report.healthy);
    assert!(report.issues.iter().any(|i| i.contains("cam1") && i.contains("missing")));
    // Health checks never repair anything
    assert_eq!(backend.create_count(&pipeline_name("1")), 1);
}

#[test]
fn health_when_idle_is_trivially_healthy() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());
    let report = orchestrator.check_health();
    assert!(report.healthy);
    assert_eq!(report.message, "not recording");
}

#[test]
fn overload_guard_trips_and_clears() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.overload_guard.enabled = true;
    config.overload_guard.unhealthy_samples = 2;
    config.overload_guard.cpu_threshold_percent = 90.0;
    let backend = FakeBackend::new();
    let prober = FakeProber::new();
    let cpu = FixedCpu::new(99.0);
    let orchestrator = RecordingOrchestrator::new(
        config,
        collaborators(&backend, &prober).with_cpu_sampler(cpu.clone()),
    );
    assert!(orchestrator.start("match_1", false, false).success);

    use matchcam::pipeline::PipelineBackend;
    backend.remove(&pipeline_name("0"));

    orchestrator.check_health();
    assert!(!orchestrator.status().overload_guard.active);
    let report = orchestrator.check_health();
    assert!(report
        .issues
        .iter()
        .any(|i| i.contains("overload guard active") && i.contains("CPU 99%")));

    let status = orchestrator.status();
    assert!(status.overload_guard.active);
    assert!(status.degraded);
    assert!(status.degraded_cameras.is_empty());

    cpu.set(20.0);
    orchestrator.check_health();
    assert!(!orchestrator.status().overload_guard.active);
}

#[test]
fn overload_guard_ignores_degraded_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.recording.require_all_cameras = false;
    config.overload_guard.enabled = true;
    config.overload_guard.unhealthy_samples = 2;
    config.overload_guard.cpu_threshold_percent = 90.0;
    let backend = FakeBackend::new();
    let prober = FakeProber::new();
    backend.fail_create(&pipeline_name("1"));
    let orchestrator = RecordingOrchestrator::new(
        config,
        collaborators(&backend, &prober).with_cpu_sampler(FixedCpu::new(99.0)),
    );
    assert!(orchestrator.start("match_1", false, false).success);

    for _ in 0..3 {
        let report = orchestrator.check_health();
        assert!(report.cameras["0"].healthy, "{:?}", report.issues);
        assert!(!report.issues.iter().any(|i| i.contains("overload")));
    }

    let status = orchestrator.status();
    assert!(!status.overload_guard.active);
    assert!(status.degraded_cameras.contains_key("1"));
}

#[test]
fn restart_adopts_live_pipelines() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::new();
    let prober = FakeProber::new();

    let first = RecordingOrchestrator::new(test_config(dir.path()), collaborators(&backend, &prober));
    assert!(first.start("match_1", false, false).success);
    drop(first);
    assert_eq!(backend.len(), 2);

    let second =
        RecordingOrchestrator::new(test_config(dir.path()), collaborators(&backend, &prober));
    let status = second.status();
    assert!(status.recording);
    assert_eq!(status.match_id.as_deref(), Some("match_1"));
    assert_eq!(status.cameras["0"].state, "running");
    assert!(status.stale_session.is_none());

    assert!(second.stop(true).success);
    assert_eq!(backend.len(), 0);
}

#[test]
fn restart_without_pipelines_reports_stale_session() {
    let dir = tempfile::tempdir().unwrap();
    {
        let (first, _backend, _prober) = orchestrator(dir.path());
        assert!(first.start("match_1", false, false).success);
    }

    // A fresh backend stands in for a full process restart
    let (second, backend, _prober) = orchestrator(dir.path());
    let status = second.status();
    assert!(!status.recording);
    let stale = status.stale_session.expect("stale session reported");
    assert_eq!(stale.match_id.as_deref(), Some("match_1"));
    assert_eq!(backend.len(), 0);

    let store = SessionStore::new(&test_config(dir.path()).session_state_path());
    assert!(!store.load().unwrap().recording);

    // The report lasts until the next session
    assert!(second.start("match_2", false, false).success);
    assert!(second.status().stale_session.is_none());
}

#[test]
fn post_processing_writes_manifest_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, _backend, _prober) = orchestrator(dir.path());
    assert!(orchestrator.start("match_1", false, true).success);

    let stopped = orchestrator.stop(false);
    assert!(stopped.post_processing_queued);
    assert!(wait_for(WAIT, || orchestrator.pending_post_processing() == 0));

    let manifest_path = dir.path().join("recordings/match_1/manifest.json");
    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(manifest_path).unwrap()).unwrap();
    assert_eq!(manifest["match_id"], "match_1");
    assert_eq!(manifest["cameras"].as_array().unwrap().len(), 2);
    assert_eq!(
        manifest["cameras"][0]["segments"][0]["filename"],
        "segment_r01_00000.mkv"
    );
}

#[test]
fn new_session_continues_run_numbers() {
    let dir = tempfile::tempdir().unwrap();
    let (orchestrator, backend, _prober) = orchestrator(dir.path());

    assert!(orchestrator.start("match_1", false, false).success);
    assert!(orchestrator.stop(true).success);
    assert!(orchestrator.start("match_1", false, false).success);

    let description = backend.description(&pipeline_name("0")).unwrap();
    assert!(description.ends_with("segment_r02_%05d.mkv"), "{}", description);
}
