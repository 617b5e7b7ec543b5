// Render thread - owns the renderer, drives the frame loop
//
// Lifecycle: WarmingUp -> Running -> Stopping -> Stopped. During warm-up
// the thread only executes queued tasks (resource uploads, setup) and
// sleeps between submissions; once warm-up ends it renders continuously.
// Window events arrive from the event-loop thread through the observer
// methods and are folded into the loop at frame boundaries.

use crate::error::{EngineError, EngineResult, TaskError};
use crate::render::renderer::{Renderer, SwapchainStatus};
use crate::task::future::future_channel;
use crate::task::{TaskFuture, TaskId, TaskQueue, Waiter};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    WarmingUp,
    Running,
    Stopping,
    Stopped,
}

/// Owner-thread context handed to every queued task.
pub struct RenderContext<R: Renderer> {
    pub renderer: R,
    stop: bool,
}

impl<R: Renderer> RenderContext<R> {
    /// Ask the loop to exit after the current drain. Only callable from a
    /// task, so the request always lands on the render thread itself.
    pub fn request_stop(&mut self) {
        self.stop = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }
}

/// Window flags mutated by the event loop, read by the render loop.
/// Both live under one lock so a resize landing between the dirty check
/// and the minimized check cannot be lost.
#[derive(Default)]
struct WindowState {
    minimized: bool,
    swapchain_dirty: bool,
}

struct Shared<R: Renderer> {
    queue: TaskQueue<RenderContext<R>>,
    waiter: Arc<Waiter>,
    warming_up: AtomicBool,
    state: Mutex<ThreadState>,
    window: Mutex<WindowState>,
}

/// Handle to the spawned render thread, held by the event-loop thread.
pub struct RenderThread<R: Renderer> {
    shared: Arc<Shared<R>>,
    created: TaskFuture<()>,
    warmed_up: TaskFuture<()>,
    death: TaskFuture<()>,
    stop_task: TaskId,
    refresh_task: TaskId,
    handle: Option<JoinHandle<()>>,
}

impl<R: Renderer> RenderThread<R> {
    /// Spawn the render thread. `make_renderer` runs on the new thread, so
    /// renderers whose resources are thread-affine are built in place.
    pub fn spawn<F>(task_budget: Duration, make_renderer: F) -> EngineResult<Self>
    where
        F: FnOnce() -> EngineResult<R> + Send + 'static,
    {
        let waiter = Arc::new(Waiter::new());
        let shared = Arc::new(Shared {
            queue: TaskQueue::with_wake(task_budget, waiter.clone()),
            waiter,
            warming_up: AtomicBool::new(true),
            state: Mutex::new(ThreadState::WarmingUp),
            window: Mutex::new(WindowState::default()),
        });

        let (created_tx, created) = future_channel();
        let (warmed_up_tx, warmed_up) = future_channel();
        let (death_tx, death) = future_channel();

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("render-thread".into())
            .spawn(move || {
                run(thread_shared, make_renderer, created_tx, warmed_up_tx, death_tx)
            })
            .map_err(|e| EngineError::Renderer(format!("failed to spawn render thread: {e}")))?;

        Ok(Self {
            shared,
            created,
            warmed_up,
            death,
            stop_task: TaskId::unique("render-thread/stop"),
            refresh_task: TaskId::unique("render-thread/refresh"),
            handle: Some(handle),
        })
    }

    /// Queue for work that must run on the render thread.
    pub fn queue(&self) -> &TaskQueue<RenderContext<R>> {
        &self.shared.queue
    }

    /// Resolves once the renderer has been constructed on the new thread.
    pub fn created(&self) -> &TaskFuture<()> {
        &self.created
    }

    /// Resolves once every warm-up task has run and the loop is rendering.
    pub fn warmed_up(&self) -> &TaskFuture<()> {
        &self.warmed_up
    }

    /// Resolves when the thread exits; carries the loop's terminal error.
    pub fn death(&self) -> &TaskFuture<()> {
        &self.death
    }

    pub fn state(&self) -> ThreadState {
        *self.shared.state.lock()
    }

    /// End the warm-up phase. The loop drains any task submitted before
    /// this call, then starts rendering.
    pub fn end_warm_up(&self) {
        self.shared.warming_up.store(false, Ordering::Release);
        self.shared.waiter.signal();
    }

    /// The window was asked to close. Queues the stop task: wait for the
    /// device, release renderer resources, exit the loop. De-duplicated,
    /// so repeated close requests queue it at most once.
    pub fn on_close(&self) -> TaskFuture<()> {
        self.shared
            .queue
            .queue_with_id(self.stop_task, |ctx: &mut RenderContext<R>| {
                ctx.request_stop();
                ctx.renderer.wait_idle()?;
                ctx.renderer.close()
            })
    }

    /// The window contents were damaged and must be redrawn now, without
    /// waiting for the next loop iteration.
    pub fn on_refresh(&self) -> TaskFuture<()> {
        self.shared
            .queue
            .queue_with_id(self.refresh_task, |ctx: &mut RenderContext<R>| {
                ctx.renderer.render()
            })
    }

    /// The framebuffer size changed. Marks the swapchain dirty; a non-zero
    /// size also clears the minimized flag and wakes a parked loop.
    pub fn on_framebuffer_size(&self, width: u32, height: u32) {
        let mut window = self.shared.window.lock();
        window.swapchain_dirty = true;
        if width != 0 && height != 0 {
            window.minimized = false;
            drop(window);
            self.shared.waiter.signal();
        }
    }

    /// The window was iconified or restored. Restores rely on the
    /// accompanying framebuffer-size event to wake the loop.
    pub fn on_iconify(&self, iconified: bool) {
        self.shared.window.lock().minimized = iconified;
    }

    /// Join the OS thread and surface the loop's terminal result.
    pub fn join(mut self) -> Result<(), TaskError> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(TaskError::Failed(EngineError::Renderer(
                    "render thread panicked".into(),
                )));
            }
        }
        self.death.wait()
    }
}

fn run<R, F>(
    shared: Arc<Shared<R>>,
    make_renderer: F,
    created: crate::task::future::FutureCompleter<()>,
    warmed_up: crate::task::future::FutureCompleter<()>,
    death: crate::task::future::FutureCompleter<()>,
) where
    R: Renderer,
    F: FnOnce() -> EngineResult<R>,
{
    let renderer = match make_renderer() {
        Ok(renderer) => renderer,
        Err(err) => {
            log::error!("renderer construction failed: {err}");
            *shared.state.lock() = ThreadState::Stopped;
            created.complete(Err(err.clone()));
            warmed_up.cancel();
            death.complete(Err(err));
            return;
        }
    };
    created.complete(Ok(()));

    let mut ctx = RenderContext {
        renderer,
        stop: false,
    };

    // Warm-up: run tasks as they arrive, sleep in between.
    while shared.warming_up.load(Ordering::Acquire) && !ctx.stop {
        shared.queue.run_all(&mut ctx);
        if shared.warming_up.load(Ordering::Acquire) && !ctx.stop {
            shared.waiter.wait();
        }
    }
    // Tasks that slipped in between the last drain and the end signal.
    shared.queue.run_all(&mut ctx);
    warmed_up.complete(Ok(()));

    let result = if ctx.stop {
        Ok(())
    } else {
        *shared.state.lock() = ThreadState::Running;
        render_loop(&shared, &mut ctx)
    };

    *shared.state.lock() = ThreadState::Stopping;
    // Resolve leftovers; their submitters may be blocked on futures.
    shared.queue.run_all(&mut ctx);
    *shared.state.lock() = ThreadState::Stopped;

    if let Err(err) = &result {
        log::error!("render thread stopping after error: {err}");
    }
    death.complete(result);
}

fn render_loop<R: Renderer>(
    shared: &Shared<R>,
    ctx: &mut RenderContext<R>,
) -> EngineResult<()> {
    loop {
        shared.queue.run_queued_tasks(ctx);
        if ctx.stop {
            return Ok(());
        }

        // The lock is held across the recreation itself, so a resize event
        // arriving meanwhile is ordered strictly after it: the event thread
        // blocks on the lock, then re-marks the swapchain dirty, and the
        // next iteration recreates again instead of parking on stale flags.
        let minimized = {
            let mut window = shared.window.lock();
            if window.swapchain_dirty && !window.minimized {
                window.swapchain_dirty = false;
                ctx.renderer.wait_idle()?;
                match ctx.renderer.recreate_swapchain()? {
                    SwapchainStatus::Ok => false,
                    SwapchainStatus::ZeroArea => {
                        window.minimized = true;
                        true
                    }
                }
            } else {
                window.minimized
            }
        };

        if minimized {
            // Parked until a resize or a submission; every wake re-drains
            // the queue so a stop task can land while the window is hidden.
            shared.waiter.wait();
            continue;
        }

        ctx.renderer.render()?;
    }
}
