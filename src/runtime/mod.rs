//! The serving runtime: one cooperative loop per [`Runtime`].
//!
//! The runtime owns the reactor and the signal pipe that steers it. One
//! thread calls [`Runtime::run`] and becomes the loop thread; every
//! event handler executes there. Other threads interact only through
//! [`Runtime::stop`] and [`Runtime::wakeup`], which travel over the
//! signal pipe instead of touching reactor structures directly.

mod signal;

use crate::error::Result;
use crate::reactor::{EventMask, Reactor};
use crate::runtime::signal::{LoopState, SignalPair, SignalReader, SIGNAL_STOP, SIGNAL_WAKE};

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// The readiness wait bound of one loop tick, in milliseconds. Timeout
/// wheel pressure shortens it; scheduled work zeroes it.
const DEFAULT_TICK_TIMEOUT_MS: i32 = 30_000;

/// Application lifecycle hooks around the serving loop.
///
/// `create` runs before the first tick, `destroy` after the last one.
/// `idle` runs once per tick, between the readiness wait and the next
/// wait; it must not block.
pub trait Application {
    fn create(&mut self, runtime: &Runtime) -> Result<()> {
        let _ = runtime;
        Ok(())
    }

    fn idle(&mut self) {}

    fn destroy(&mut self) {}
}

/// The process's serving loop.
///
/// Constructed explicitly and passed to whoever needs it; there is no
/// process-wide instance. The signal pipe is created before the reactor
/// registers its read end, and both live exactly as long as the runtime.
pub struct Runtime {
    reactor: Reactor,
    signal: SignalPair,
    state: Arc<LoopState>,
    run_lock: Mutex<()>,
}

impl Runtime {
    /// Creates a runtime with the reactor's default idle timeout.
    pub fn new() -> Result<Runtime> {
        Runtime::build(Reactor::new()?)
    }

    /// Creates a runtime whose connections idle out after `timeout`.
    pub fn with_idle_timeout(timeout: Duration) -> Result<Runtime> {
        Runtime::build(Reactor::with_idle_timeout(timeout)?)
    }

    fn build(reactor: Reactor) -> Result<Runtime> {
        let signal = SignalPair::new()?;
        let state = LoopState::new();

        reactor.add(
            signal.read_fd(),
            EventMask::IN,
            Box::new(SignalReader::new(state.clone())),
        )?;

        Ok(Runtime {
            reactor,
            signal,
            state,
            run_lock: Mutex::new(()),
        })
    }

    /// The reactor driven by this runtime.
    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }

    /// Runs the loop until [`Runtime::stop`] is called.
    ///
    /// The calling thread becomes the loop thread: SIGPIPE is blocked on
    /// it for the duration, `app.create` runs before the first tick and
    /// `app.destroy` after the last, and the exit code passed to `stop`
    /// is returned. A reactor error tears the loop down after logging.
    pub fn run(&self, app: &mut dyn Application) -> Result<i32> {
        let _guard = self.run_lock.lock().unwrap();

        crate::reactor::poller::unix::sys_block_sigpipe()?;

        self.state.exit_code.store(0, Ordering::Release);
        self.state.running.store(true, Ordering::Release);

        app.create(self)?;

        while self.state.running.load(Ordering::Acquire) {
            match self.reactor.update(DEFAULT_TICK_TIMEOUT_MS) {
                Ok(_timed_out) => {}
                Err(err) => {
                    tracing::error!(error = %err, "reactor tick failed, shutting down");
                    app.destroy();
                    return Err(err);
                }
            }

            app.idle();
        }

        app.destroy();

        Ok(self.state.exit_code.load(Ordering::Acquire))
    }

    /// Stops the loop, making [`Runtime::run`] return `code`.
    ///
    /// Safe from any thread. The loop finishes its current batch of
    /// handlers first; in-flight transfers are not cancelled.
    pub fn stop(&self, code: i32) {
        self.state.exit_code.store(code, Ordering::Release);
        self.state.running.store(false, Ordering::Release);

        if let Err(err) = self.signal.signal(SIGNAL_STOP) {
            // The flag alone stops the loop at its next tick; the signal
            // only makes that tick happen now.
            tracing::warn!(error = %err, "stop signal not delivered");
            self.reactor.wake();
        }
    }

    /// Wakes the loop so it re-evaluates its predicates.
    ///
    /// Safe from any thread.
    pub fn wakeup(&self) {
        if self.signal.signal(SIGNAL_WAKE).is_err() {
            self.reactor.wake();
        }
    }
}
