// Presentation cycle against the worker-thread GPU

use frame_pacer::backend::HeadlessGpu;
use frame_pacer::config::Config;
use frame_pacer::error::FrameError;
use frame_pacer::frame::{CycleState, Extent, PresenterOptions};
use std::time::Duration;

fn options(frames_in_flight: usize) -> PresenterOptions {
    PresenterOptions {
        frames_in_flight,
        stall_timeout: Some(Duration::from_secs(5)),
        vsync: true,
        tearing_supported: false,
        clear_color: [1.0, 0.0, 0.0, 0.0],
    }
}

#[test]
fn test_runs_frames_in_order() {
    let gpu = HeadlessGpu::new(Duration::ZERO).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(3)).unwrap();

    for expected in 1..=9u64 {
        let report = presenter.tick().unwrap();
        assert_eq!(report.fence_value, expected);
        assert_eq!(report.slot, ((expected - 1) % 3) as usize);
        assert_eq!(report.next_slot, Some((expected % 3) as usize));
    }

    presenter.shutdown().unwrap();
    let stats = gpu.stats();
    assert_eq!(stats.executed, 9);
    assert_eq!(stats.presented, 9);
    assert_eq!(stats.completed, 10);
    assert_eq!(stats.last_clear, Some([1.0, 0.0, 0.0, 0.0]));
    assert_eq!(stats.bad_transitions, 0);
}

#[test]
fn test_cpu_stays_at_most_n_minus_one_ahead() {
    let gpu = HeadlessGpu::new(Duration::from_millis(3)).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(3)).unwrap();

    for _ in 0..20 {
        presenter.tick().unwrap();
        let outstanding = presenter.fence().outstanding().unwrap();
        assert!(outstanding <= 2, "{} frames outstanding", outstanding);
        assert_eq!(presenter.state(), CycleState::Idle);
    }

    presenter.shutdown().unwrap();
}

#[test]
fn test_two_slots_keep_one_frame_in_flight() {
    let gpu = HeadlessGpu::new(Duration::from_millis(2)).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(2)).unwrap();

    for _ in 0..10 {
        presenter.tick().unwrap();
        assert!(presenter.fence().outstanding().unwrap() <= 1);
    }
    presenter.shutdown().unwrap();
}

#[test]
fn test_resize_mid_run_never_touches_old_images() {
    let gpu = HeadlessGpu::new(Duration::from_millis(1)).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(3)).unwrap();

    for _ in 0..4 {
        presenter.tick().unwrap();
    }

    assert!(presenter.on_resize(640, 480).unwrap());
    assert!(!presenter.on_resize(640, 480).unwrap());
    assert_eq!(presenter.extent(), Extent::new(640, 480));
    assert_eq!(presenter.fence().outstanding().unwrap(), 0);
    assert_eq!(presenter.current_slot(), 0);

    for _ in 0..4 {
        presenter.tick().unwrap();
    }

    presenter.shutdown().unwrap();
    let stats = gpu.stats();
    assert_eq!(stats.executed, 8);
    assert_eq!(stats.stale_executions, 0);
}

#[test]
fn test_minimize_and_restore() {
    let gpu = HeadlessGpu::new(Duration::ZERO).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(3)).unwrap();
    presenter.tick().unwrap();

    presenter.on_resize(0, 0).unwrap();
    assert_eq!(presenter.extent(), Extent::new(1, 1));
    presenter.tick().unwrap();

    presenter.on_resize(320, 240).unwrap();
    presenter.tick().unwrap();

    presenter.shutdown().unwrap();
    assert_eq!(gpu.stats().stale_executions, 0);
}

#[test]
fn test_toggles_do_not_break_the_cycle() {
    let gpu = HeadlessGpu::new(Duration::ZERO).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(3)).unwrap();

    presenter.tick().unwrap();
    presenter.on_present_mode_changed(false);
    presenter.tick().unwrap();
    assert!(presenter.on_toggle_fullscreen());
    presenter.tick().unwrap();
    presenter.on_present_mode_changed(true);
    presenter.tick().unwrap();

    assert_eq!(presenter.frames_presented(), 4);
    presenter.shutdown().unwrap();
}

#[test]
fn test_tick_after_shutdown_fails() {
    let gpu = HeadlessGpu::new(Duration::ZERO).unwrap();
    let mut presenter = gpu.presenter(320, 240, options(3)).unwrap();
    presenter.tick().unwrap();
    presenter.shutdown().unwrap();

    assert!(matches!(presenter.tick(), Err(FrameError::Usage(_))));
    // Second shutdown is a no-op
    presenter.shutdown().unwrap();
}

#[test]
fn test_presenter_from_config() {
    let config = Config::from_toml(
        r#"
        [presentation]
        frames_in_flight = 4
        stall_timeout_ms = 1000

        [graphics]
        clear_color = [0.0, 0.0, 1.0, 1.0]
        "#,
    )
    .unwrap();

    let gpu = HeadlessGpu::new(Duration::ZERO).unwrap();
    let mut presenter = gpu
        .presenter(
            config.window.width,
            config.window.height,
            config.presenter_options(false),
        )
        .unwrap();

    let slots: Vec<_> = (0..5).map(|_| presenter.tick().unwrap().slot).collect();
    assert_eq!(slots, vec![0, 1, 2, 3, 0]);

    presenter.shutdown().unwrap();
    assert_eq!(gpu.stats().last_clear, Some([0.0, 0.0, 1.0, 1.0]));
}
