// SPDX-License-Identifier: Apache-2.0

//! A bounded worker pool for device jobs.
//!
//! Jobs are registered once and signalled many times. A job is never run
//! concurrently with itself: a signal arriving while the job runs queues
//! one more pass instead of a second worker. Block, console and entropy
//! devices all drain their rings from here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

struct JobState {
    signalled: u32,
    queued: bool,
    running: bool,
    cancelled: bool,
}

struct Job {
    func: Box<dyn Fn() + Send + Sync>,
    state: Mutex<JobState>,
}

/// Opaque token returned by [`ThreadPool::add_job`].
#[derive(Clone)]
pub struct JobHandle(Arc<Job>);

struct Shared {
    queue: Mutex<VecDeque<Arc<Job>>>,
    ready: Condvar,
    stopping: AtomicBool,
}

pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `threads` workers (at least one).
    pub fn new(threads: usize) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            stopping: AtomicBool::new(false),
        });

        let workers = (0..threads.max(1))
            .map(|i| {
                let shared = shared.clone();
                thread::Builder::new()
                    .name(format!("worker-{}", i))
                    .spawn(move || worker_loop(shared))
                    .expect("failed to spawn pool worker")
            })
            .collect();

        ThreadPool { shared, workers }
    }

    /// Register a job without running it.
    pub fn add_job<F: Fn() + Send + Sync + 'static>(&self, func: F) -> JobHandle {
        JobHandle(Arc::new(Job {
            func: Box::new(func),
            state: Mutex::new(JobState {
                signalled: 0,
                queued: false,
                running: false,
                cancelled: false,
            }),
        }))
    }

    /// Mark `job` runnable and wake a worker. Signals arriving while the
    /// job executes accumulate into further passes.
    pub fn do_job(&self, job: &JobHandle) {
        let mut state = job.0.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.signalled += 1;
        if !state.queued && !state.running {
            state.queued = true;
            drop(state);
            self.shared.queue.lock().unwrap().push_back(job.0.clone());
            self.shared.ready.notify_one();
        }
    }

    /// Drop pending invocations of `job`; an in-flight pass finishes.
    pub fn cancel_job(&self, job: &JobHandle) {
        {
            let mut state = job.0.state.lock().unwrap();
            state.cancelled = true;
            state.signalled = 0;
            state.queued = false;
        }
        self.shared
            .queue
            .lock()
            .unwrap()
            .retain(|queued| !Arc::ptr_eq(queued, &job.0));
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.stopping.store(true, Ordering::SeqCst);
        self.shared.ready.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut queue = shared.queue.lock().unwrap();
            loop {
                if shared.stopping.load(Ordering::SeqCst) {
                    return;
                }
                match queue.pop_front() {
                    Some(job) => break job,
                    None => queue = shared.ready.wait(queue).unwrap(),
                }
            }
        };

        {
            let mut state = job.state.lock().unwrap();
            state.queued = false;
            if state.cancelled {
                continue;
            }
            state.running = true;
        }

        (job.func)();

        let requeue = {
            let mut state = job.state.lock().unwrap();
            state.running = false;
            state.signalled = state.signalled.saturating_sub(1);
            state.signalled > 0 && !state.cancelled && {
                state.queued = true;
                true
            }
        };
        if requeue {
            shared.queue.lock().unwrap().push_back(job.clone());
            shared.ready.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn jobs_run_when_signalled() {
        let pool = ThreadPool::new(2);
        let hits = Arc::new(AtomicUsize::new(0));
        let job = {
            let hits = hits.clone();
            pool.add_job(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        // Not runnable until signalled.
        thread::sleep(Duration::from_millis(20));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        pool.do_job(&job);
        for _ in 0..100 {
            if hits.load(Ordering::SeqCst) == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn a_job_never_overlaps_itself() {
        let pool = ThreadPool::new(4);
        let inside = Arc::new(AtomicBool::new(false));
        let overlapped = Arc::new(AtomicBool::new(false));
        let runs = Arc::new(AtomicUsize::new(0));

        let job = {
            let inside = inside.clone();
            let overlapped = overlapped.clone();
            let runs = runs.clone();
            pool.add_job(move || {
                if inside.swap(true, Ordering::SeqCst) {
                    overlapped.store(true, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(10));
                inside.store(false, Ordering::SeqCst);
                runs.fetch_add(1, Ordering::SeqCst);
            })
        };

        for _ in 0..5 {
            pool.do_job(&job);
        }
        for _ in 0..200 {
            if runs.load(Ordering::SeqCst) >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        assert!(!overlapped.load(Ordering::SeqCst));
        assert!(runs.load(Ordering::SeqCst) >= 2);
    }

    #[test]
    fn cancelled_jobs_stop_running() {
        let pool = ThreadPool::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let job = {
            let hits = hits.clone();
            pool.add_job(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };

        pool.cancel_job(&job);
        pool.do_job(&job);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }
}
