// crates/framebot-bus/src/io.rs
//
// The I/O loop: one named thread draining a job queue. The bus client's
// mutating calls all run here; callers on other threads post closures.

use std::thread::{JoinHandle, ThreadId};

use crossbeam_channel::{unbounded, Sender};
use tracing::debug;

type Job = Box<dyn FnOnce() + Send>;

pub struct IoLoop {
    tx: Sender<Job>,
    thread_id: ThreadId,
    handle: Option<JoinHandle<()>>,
}

impl IoLoop {
    pub fn start() -> Self {
        let (tx, rx) = unbounded::<Job>();
        let handle = std::thread::Builder::new()
            .name("bus-io".into())
            .spawn(move || {
                for job in rx {
                    job();
                }
                debug!("i/o loop stopped");
            })
            .expect("spawn i/o loop thread");
        let thread_id = handle.thread().id();
        Self { tx, thread_id, handle: Some(handle) }
    }

    pub fn on_loop_thread(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    /// Queue `job` for the loop thread. Jobs run in post order.
    pub fn post(&self, job: impl FnOnce() + Send + 'static) {
        // A send failure means the loop already shut down; the job is moot.
        let _ = self.tx.send(Box::new(job));
    }

    /// Run `job` inline when already on the loop thread, post it otherwise.
    pub fn run_or_post(&self, job: impl FnOnce() + Send + 'static) {
        if self.on_loop_thread() {
            job();
        } else {
            self.post(job);
        }
    }
}

impl Drop for IoLoop {
    fn drop(&mut self) {
        // Closing the channel ends the loop after queued jobs drain.
        let (closed, _) = unbounded::<Job>();
        self.tx = closed;
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}
