// Dedicated thread running the GLib main loop that dispatches bus watches

use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use gstreamer::glib;
use parking_lot::Mutex;

/// The loop shared by every live runtime in the process
static SHARED: Mutex<Weak<BusEventLoop>> = Mutex::new(Weak::new());

/// Owns the process-wide bus dispatch thread.
///
/// Bus watches added from any thread without a thread-default context attach
/// to the global default `MainContext`, which this loop iterates. This thread
/// is therefore the only one that sees EOS/ERROR/WARNING messages, and it must
/// never block.
pub struct BusEventLoop {
    main_loop: glib::MainLoop,
    handle: Option<JoinHandle<()>>,
}

impl BusEventLoop {
    /// Join the running loop, or start one if no runtime holds it.
    ///
    /// Only one thread can iterate the default context, so runtimes share a
    /// single loop that stops when the last of them is dropped.
    pub fn shared() -> Arc<Self> {
        let mut shared = SHARED.lock();
        if let Some(existing) = shared.upgrade() {
            return existing;
        }
        let event_loop = Arc::new(Self::spawn());
        *shared = Arc::downgrade(&event_loop);
        event_loop
    }

    fn spawn() -> Self {
        let main_loop = glib::MainLoop::new(None, false);
        let loop_for_thread = main_loop.clone();

        let handle = std::thread::Builder::new()
            .name("matchcam-bus".into())
            .spawn(move || {
                log::debug!("Bus event loop started");
                loop_for_thread.run();
                log::debug!("Bus event loop exited");
            })
            .expect("Failed to spawn bus event loop thread");

        Self {
            main_loop,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.main_loop.is_running()
    }
}

impl Drop for BusEventLoop {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        // A quit issued before run() has started is lost, so repeat it
        // until the thread is gone (bounded).
        let deadline = Instant::now() + Duration::from_secs(2);
        while !handle.is_finished() {
            self.main_loop.quit();
            if Instant::now() >= deadline {
                log::warn!("Bus event loop did not exit, detaching thread");
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let _ = handle.join();
    }
}
