//! Background server thread: a single worker draining a FIFO of
//! boxed closures. Used for work that must not block the thread that
//! produced it — periodic writeback, and releasing replace-protect records
//! once the apply worker reports them applied.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct Inner {
    tasks: VecDeque<Task>,
}

pub struct ServerThread {
    inner: Mutex<Inner>,
    cond: Condvar,
    shutdown: AtomicBool,
}

impl Default for ServerThread {
    fn default() -> Self {
        Self { inner: Mutex::new(Inner::default()), cond: Condvar::new(), shutdown: AtomicBool::new(false) }
    }
}

impl ServerThread {
    pub fn new() -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self::default())
    }

    pub fn push(&self, task: Task) {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.push_back(task);
        self.cond.notify_one();
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cond.notify_all();
    }

    /// Spawns the worker loop on a new OS thread. Tasks already queued at
    /// shutdown are drained before the thread exits; nothing queued after
    /// `request_shutdown` runs.
    pub fn spawn(self: &std::sync::Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        std::thread::spawn(move || {
            loop {
                let task = {
                    let mut inner = this.inner.lock().unwrap();
                    loop {
                        if let Some(t) = inner.tasks.pop_front() {
                            break Some(t);
                        }
                        if this.shutdown.load(Ordering::SeqCst) {
                            break None;
                        }
                        inner = this.cond.wait(inner).unwrap();
                    }
                };
                match task {
                    Some(t) => t(),
                    None => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn queued_tasks_run_and_shutdown_joins() {
        let server = ServerThread::new();
        let handle = server.spawn();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let c = counter.clone();
            server.push(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }));
        }
        // Give the worker a moment to drain; request_shutdown only stops
        // it once the queue is empty, so join is still deterministic.
        while counter.load(Ordering::SeqCst) < 5 {
            std::thread::yield_now();
        }
        server.request_shutdown();
        handle.join().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
