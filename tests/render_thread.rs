// Render-thread lifecycle tests against a mock renderer.
//
// No GPU involved: the mock counts calls and can simulate a zero-area
// swapchain, which is all the scheduler reacts to.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thinvk::render::{Renderer, RenderThread, SwapchainStatus, ThreadState};
use thinvk::EngineResult;

#[derive(Default)]
struct MockState {
    frames: AtomicUsize,
    recreations: AtomicUsize,
    /// How many upcoming recreations report a zero drawable area.
    zero_area_remaining: AtomicUsize,
    /// While set, recreations stall as a slow driver would.
    hold_recreation: AtomicBool,
    in_recreation: AtomicBool,
    closed: AtomicBool,
    idle_waits: AtomicUsize,
    log: Mutex<Vec<&'static str>>,
}

struct MockRenderer {
    state: Arc<MockState>,
}

impl Renderer for MockRenderer {
    fn render(&mut self) -> EngineResult<()> {
        self.state.frames.fetch_add(1, Ordering::SeqCst);
        // Keep the loop from spinning a core flat out during tests.
        std::thread::sleep(Duration::from_millis(1));
        Ok(())
    }

    fn recreate_swapchain(&mut self) -> EngineResult<SwapchainStatus> {
        self.state.in_recreation.store(true, Ordering::SeqCst);
        while self.state.hold_recreation.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.state.in_recreation.store(false, Ordering::SeqCst);
        self.state.recreations.fetch_add(1, Ordering::SeqCst);
        if self.state.zero_area_remaining.load(Ordering::SeqCst) > 0 {
            self.state.zero_area_remaining.fetch_sub(1, Ordering::SeqCst);
            Ok(SwapchainStatus::ZeroArea)
        } else {
            Ok(SwapchainStatus::Ok)
        }
    }

    fn wait_idle(&mut self) -> EngineResult<()> {
        self.state.idle_waits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> EngineResult<()> {
        self.state.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn spawn_mock() -> (Arc<MockState>, RenderThread<MockRenderer>) {
    let state = Arc::new(MockState::default());
    let thread_state = state.clone();
    let thread = RenderThread::spawn(Duration::from_millis(20), move || {
        Ok(MockRenderer {
            state: thread_state,
        })
    })
    .unwrap();
    (state, thread)
}

/// Poll `predicate` until it holds or two seconds pass.
fn eventually(predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn warm_up_tasks_run_before_first_frame() {
    let (state, thread) = spawn_mock();
    thread.created().wait().unwrap();
    assert_eq!(thread.state(), ThreadState::WarmingUp);

    let log = state.log.lock().len();
    assert_eq!(log, 0);

    let task_state = state.clone();
    let setup = thread.queue().queue_for_execution(move |_ctx| {
        task_state.log.lock().push("setup");
        Ok(())
    });

    // Tasks run during warm-up even though nothing renders yet.
    setup.wait().unwrap();
    assert_eq!(state.frames.load(Ordering::SeqCst), 0);
    assert_eq!(*state.log.lock(), vec!["setup"]);

    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > 0));

    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn tasks_submitted_at_warm_up_end_are_not_lost() {
    let (state, thread) = spawn_mock();
    let task_state = state.clone();
    let late = thread.queue().queue_for_execution(move |_ctx| {
        task_state.log.lock().push("late");
        Ok(())
    });
    thread.end_warm_up();

    thread.warmed_up().wait().unwrap();
    assert!(late.is_done());
    assert_eq!(*state.log.lock(), vec!["late"]);

    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn close_stops_the_loop_after_waiting_for_the_device() {
    let (state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();

    thread.on_close().wait().unwrap();
    thread.join().unwrap();

    assert!(state.closed.load(Ordering::SeqCst));
    assert!(state.idle_waits.load(Ordering::SeqCst) >= 1);
}

#[test]
fn death_future_resolves_on_exit() {
    let (_state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.on_close().wait().unwrap();

    assert!(eventually(|| thread.death().is_done()));
    assert_eq!(thread.state(), ThreadState::Stopped);
    thread.join().unwrap();
}

#[test]
fn iconified_window_pauses_rendering_until_restored() {
    let (state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > 0));

    thread.on_iconify(true);
    // Let in-flight frames settle, then confirm the counter stalls.
    assert!(eventually(|| {
        let before = state.frames.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        state.frames.load(Ordering::SeqCst) == before
    }));

    // A restore arrives as a non-zero framebuffer resize.
    let before = state.recreations.load(Ordering::SeqCst);
    thread.on_framebuffer_size(800, 600);
    assert!(eventually(|| state.recreations.load(Ordering::SeqCst) > before));
    let resumed = state.frames.load(Ordering::SeqCst);
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > resumed));

    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn zero_area_recreation_parks_the_loop() {
    let (state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();

    // The next rebuild reports a zero drawable area, as a collapse to
    // 0x0 without an iconify notification would.
    state.zero_area_remaining.store(1, Ordering::SeqCst);
    thread.on_framebuffer_size(800, 600);
    let before = state.recreations.load(Ordering::SeqCst);
    assert!(eventually(|| state.recreations.load(Ordering::SeqCst) > before));

    assert!(eventually(|| {
        let frames = state.frames.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        state.frames.load(Ordering::SeqCst) == frames
    }));

    // Restore with a usable area; rendering resumes.
    thread.on_framebuffer_size(800, 600);
    let paused = state.frames.load(Ordering::SeqCst);
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > paused));

    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn restore_delivered_during_recreation_is_not_lost() {
    let (state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();

    // The pending rebuild collapses to zero area and stalls, as a slow
    // driver would, while the window is restored from the event loop.
    state.zero_area_remaining.store(1, Ordering::SeqCst);
    state.hold_recreation.store(true, Ordering::SeqCst);
    thread.on_framebuffer_size(800, 600);
    assert!(eventually(|| state.in_recreation.load(Ordering::SeqCst)));

    std::thread::scope(|s| {
        // The restore must not be observed mid-recreation; it blocks on
        // the window state until the rebuild settles.
        let restore = s.spawn(|| thread.on_framebuffer_size(800, 600));
        std::thread::sleep(Duration::from_millis(30));
        state.hold_recreation.store(false, Ordering::SeqCst);
        restore.join().unwrap();
    });

    // The zero-area rebuild is followed by a second one for the restore,
    // and frames keep flowing instead of the loop parking on stale flags.
    assert!(eventually(|| state.recreations.load(Ordering::SeqCst) >= 2));
    let resumed = state.frames.load(Ordering::SeqCst);
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > resumed));

    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn zero_area_resize_while_minimized_keeps_the_loop_parked() {
    let (state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > 0));

    thread.on_iconify(true);
    assert!(eventually(|| {
        let before = state.frames.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        state.frames.load(Ordering::SeqCst) == before
    }));

    // A zero-area resize while minimized marks the swapchain dirty but
    // neither rebuilds it nor wakes the loop.
    let recreations = state.recreations.load(Ordering::SeqCst);
    let frames = state.frames.load(Ordering::SeqCst);
    thread.on_framebuffer_size(0, 0);
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(state.recreations.load(Ordering::SeqCst), recreations);
    assert_eq!(state.frames.load(Ordering::SeqCst), frames);

    // Only a usable size rebuilds the swapchain and resumes frames.
    thread.on_framebuffer_size(800, 600);
    assert!(eventually(|| state.frames.load(Ordering::SeqCst) > frames));
    assert!(state.recreations.load(Ordering::SeqCst) > recreations);

    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn close_lands_even_while_parked_minimized() {
    let (state, thread) = spawn_mock();
    thread.end_warm_up();
    thread.warmed_up().wait().unwrap();

    thread.on_iconify(true);
    assert!(eventually(|| {
        let before = state.frames.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        state.frames.load(Ordering::SeqCst) == before
    }));

    // The stop task must run despite the loop being parked.
    thread.on_close().wait().unwrap();
    thread.join().unwrap();
    assert!(state.closed.load(Ordering::SeqCst));
}

#[test]
fn refresh_renders_a_frame_during_warm_up() {
    let (state, thread) = spawn_mock();
    thread.created().wait().unwrap();
    assert_eq!(state.frames.load(Ordering::SeqCst), 0);

    // A damaged window needs a frame now, before warm-up ends.
    thread.on_refresh().wait().unwrap();
    assert_eq!(state.frames.load(Ordering::SeqCst), 1);

    thread.end_warm_up();
    thread.on_close().wait().unwrap();
    thread.join().unwrap();
}

#[test]
fn renderer_construction_failure_reaches_the_futures() {
    let thread: EngineResult<RenderThread<MockRenderer>> =
        RenderThread::spawn(Duration::from_millis(20), || {
            Err(thinvk::EngineError::Renderer("no device".into()))
        });
    let thread = thread.unwrap();

    assert!(thread.created().wait().is_err());
    assert!(thread.warmed_up().wait().is_err());
    assert!(thread.death().wait().is_err());
    assert!(thread.join().is_err());
}
