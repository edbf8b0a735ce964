//! Single dedicated worker thread for queue dispatch
//!
//! Units run one at a time, in submission order. Shutting down stops
//! admission but not execution: units already admitted are drained before
//! the worker exits.

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::io;
use std::thread::{self, JoinHandle, ThreadId};

/// One unit of dispatch work
pub(crate) type DispatchUnit = Box<dyn FnOnce() + Send>;

pub(crate) struct SingleWorkerExecutor {
    /// Admission side; `None` once shut down
    sender: Mutex<Option<Sender<DispatchUnit>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl SingleWorkerExecutor {
    /// Spawn the worker thread
    pub(crate) fn start(name: &str) -> io::Result<Self> {
        let (sender, receiver) = channel::unbounded::<DispatchUnit>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run_loop(receiver))?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Admit `unit`, running `on_admit` first under the admission lock
    ///
    /// Returns false, without running `on_admit`, after shutdown.
    pub(crate) fn execute(&self, unit: DispatchUnit, on_admit: impl FnOnce()) -> bool {
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return false;
        };
        on_admit();
        // The receiver lives as long as the worker, which outlives the sender
        sender.send(unit).is_ok()
    }

    /// Stop admitting units; the worker exits once the admitted ones ran
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
    }

    /// Wait for the worker to exit
    ///
    /// Does nothing when called on the worker itself or a second time.
    pub(crate) fn join(&self) {
        if self.is_worker_thread() {
            return;
        }
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        if handle.join().is_err() {
            tracing::warn!("queue worker exited by panic");
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.sender.lock().is_none()
    }

    pub(crate) fn is_worker_thread(&self) -> bool {
        thread::current().id() == self.worker_id
    }

    fn run_loop(receiver: Receiver<DispatchUnit>) {
        tracing::trace!("queue worker started");
        // recv fails only when the channel is both empty and disconnected
        while let Ok(unit) = receiver.recv() {
            unit();
        }
        tracing::trace!("queue worker stopped");
    }
}

impl Drop for SingleWorkerExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
