use alloc::{string::String, sync::Arc};
use core::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use spin::Mutex;

use crate::{dma::BufferView, hal::DeferredExecutor};

/// Body of a deferred worker.
pub trait DeferredWork: Send + Sync + 'static {
    fn run(&self);
}

impl<F> DeferredWork for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn run(&self) {
        self()
    }
}

const SCHEDULED: u8 = 1 << 0;
const RUNNING: u8 = 1 << 1;
const KILLED: u8 = 1 << 2;

/// Tasklet-style bottom half, scheduled from interrupt context and run later by
/// the platform's [`DeferredExecutor`]. Scheduling a pending worker is a no-op
/// and the body never runs concurrently with itself.
pub struct DeferredWorker {
    name: &'static str,
    state: AtomicU8,
    runs: AtomicUsize,
    executor: Arc<dyn DeferredExecutor>,
    work: Arc<dyn DeferredWork>,
}

impl DeferredWorker {
    pub fn new(
        name: &'static str,
        executor: Arc<dyn DeferredExecutor>,
        work: Arc<dyn DeferredWork>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: AtomicU8::new(0),
            runs: AtomicUsize::new(0),
            executor,
            work,
        })
    }

    /// Number of times the body has run.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Acquire)
    }

    pub fn is_scheduled(&self) -> bool {
        self.state.load(Ordering::Acquire) & SCHEDULED != 0
    }

    pub fn is_killed(&self) -> bool {
        self.state.load(Ordering::Acquire) & KILLED != 0
    }

    /// Marks the worker pending and hands it to the executor.
    ///
    /// Returns `false` if it was already pending or has been killed. Safe to
    /// call from interrupt context.
    pub fn schedule(self: &Arc<Self>) -> bool {
        let claimed = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s & (SCHEDULED | KILLED) == 0).then_some(s | SCHEDULED)
            })
            .is_ok();
        if claimed {
            self.executor.queue(self.clone());
        }
        claimed
    }

    /// Entry point for the executor.
    pub fn run(self: &Arc<Self>) {
        let prev = self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            if s & KILLED != 0 {
                Some(s & !SCHEDULED)
            } else if s & (SCHEDULED | RUNNING) == SCHEDULED {
                Some((s | RUNNING) & !SCHEDULED)
            } else {
                None
            }
        });

        let prev = match prev {
            Ok(prev) => prev,
            Err(s) => {
                if s & RUNNING != 0 && s & SCHEDULED != 0 {
                    // Another executor thread is in the body; try again later.
                    self.executor.queue(self.clone());
                }
                return;
            }
        };
        if prev & KILLED != 0 {
            log::trace!("{}: dropping run of killed worker", self.name);
            return;
        }

        self.work.run();
        self.runs.fetch_add(1, Ordering::AcqRel);
        self.state.fetch_and(!RUNNING, Ordering::Release);
    }

    /// Prevents further runs and waits for a running body to finish.
    ///
    /// Runs that are still queued at the executor are discarded when they come
    /// up.
    pub fn kill(&self) {
        self.state.fetch_or(KILLED, Ordering::AcqRel);
        while self.state.load(Ordering::Acquire) & RUNNING != 0 {
            core::hint::spin_loop();
        }
        log::trace!("{}: killed after {} runs", self.name, self.runs());
    }
}

impl core::fmt::Debug for DeferredWorker {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeferredWorker")
            .field("name", &self.name)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("runs", &self.runs())
            .finish_non_exhaustive()
    }
}

/// Worker body that reports the string the card left in the DMA buffer.
pub struct CompletionReporter {
    view: BufferView,
    offset: usize,
    max_len: usize,
    last: Mutex<Option<String>>,
    reports: AtomicUsize,
}

impl CompletionReporter {
    /// The worker running this body must be killed before the buffer the view
    /// was taken from is freed.
    pub(crate) fn new(view: BufferView, offset: usize, max_len: usize) -> Self {
        Self {
            view,
            offset,
            max_len,
            last: Mutex::new(None),
            reports: AtomicUsize::new(0),
        }
    }

    pub fn reports(&self) -> usize {
        self.reports.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<String> {
        self.last.lock().clone()
    }
}

impl DeferredWork for CompletionReporter {
    fn run(&self) {
        // SAFETY: see `new`; the owning device kills the worker before freeing.
        match unsafe { self.view.read_cstr(self.offset, self.max_len) } {
            Ok(report) => {
                log::info!("DMA complete: {report}");
                *self.last.lock() = Some(report);
                self.reports.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => log::warn!("DMA complete, report unreadable: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Barrier, Weak, atomic::AtomicBool},
        thread,
        time::Duration,
        vec::Vec,
    };

    use super::*;
    use crate::{
        dma::DmaBuffer,
        emulated::{HostMemory, QueueExecutor},
        units::PAGE_SIZE,
    };

    fn counting_worker() -> (Arc<QueueExecutor>, Arc<DeferredWorker>, Arc<AtomicUsize>) {
        let executor = Arc::new(QueueExecutor::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let body = hits.clone();
        let worker = DeferredWorker::new(
            "count",
            executor.clone(),
            Arc::new(move || {
                body.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (executor, worker, hits)
    }

    #[test]
    fn pending_schedules_coalesce() {
        let (executor, worker, hits) = counting_worker();
        assert!(worker.schedule());
        assert!(!worker.schedule());
        assert!(worker.is_scheduled());
        assert_eq!(executor.pending(), 1);

        executor.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(worker.runs(), 1);
        assert!(!worker.is_scheduled());

        assert!(worker.schedule());
        executor.run_pending();
        assert_eq!(worker.runs(), 2);
    }

    #[test]
    fn schedule_during_a_run_rearms_once() {
        let executor = Arc::new(QueueExecutor::new());
        let me: Arc<spin::Once<Weak<DeferredWorker>>> = Arc::new(spin::Once::new());
        let accepted = Arc::new(AtomicUsize::new(0));
        let worker = {
            let me = me.clone();
            let accepted = accepted.clone();
            DeferredWorker::new(
                "rearm",
                executor.clone(),
                Arc::new(move || {
                    let Some(worker) = me.get().and_then(Weak::upgrade) else {
                        return;
                    };
                    if worker.runs() == 0 {
                        for _ in 0..3 {
                            if worker.schedule() {
                                accepted.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                    }
                }),
            )
        };
        me.call_once(|| Arc::downgrade(&worker));

        assert!(worker.schedule());
        assert_eq!(executor.run_pending(), 2);
        assert_eq!(worker.runs(), 2);
        assert_eq!(accepted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn killed_worker_never_runs_again() {
        let (executor, worker, hits) = counting_worker();
        assert!(worker.schedule());
        worker.kill();
        assert!(worker.is_killed());
        assert!(!worker.schedule());

        executor.run_pending();
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(executor.pending(), 0);
    }

    #[test]
    fn kill_waits_for_a_running_body() {
        let executor = Arc::new(QueueExecutor::new());
        let entered = Arc::new(Barrier::new(2));
        let release = Arc::new(AtomicBool::new(false));
        let finished = Arc::new(AtomicBool::new(false));
        let worker = {
            let entered = entered.clone();
            let release = release.clone();
            let finished = finished.clone();
            DeferredWorker::new(
                "slow",
                executor.clone(),
                Arc::new(move || {
                    entered.wait();
                    while !release.load(Ordering::SeqCst) {
                        thread::yield_now();
                    }
                    finished.store(true, Ordering::SeqCst);
                }),
            )
        };

        assert!(worker.schedule());
        let runner = {
            let executor = executor.clone();
            thread::spawn(move || executor.run_pending())
        };
        entered.wait();

        let releaser = {
            let release = release.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                release.store(true, Ordering::SeqCst);
            })
        };
        worker.kill();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(worker.runs(), 1);
        assert!(!worker.schedule());

        releaser.join().unwrap();
        assert_eq!(runner.join().unwrap(), 1);
    }

    #[test]
    fn body_never_overlaps_itself() {
        let _ = env_logger::builder().is_test(true).try_init();

        let executor = Arc::new(QueueExecutor::new());
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));
        let worker = {
            let inside = inside.clone();
            let overlaps = overlaps.clone();
            DeferredWorker::new(
                "overlap",
                executor.clone(),
                Arc::new(move || {
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(50));
                    inside.store(false, Ordering::SeqCst);
                }),
            )
        };

        let stop = Arc::new(AtomicBool::new(false));
        let runners: Vec<_> = (0..3)
            .map(|_| {
                let executor = executor.clone();
                let stop = stop.clone();
                thread::spawn(move || {
                    while !stop.load(Ordering::SeqCst) {
                        executor.run_pending();
                        thread::yield_now();
                    }
                })
            })
            .collect();

        let mut accepted = 0;
        for _ in 0..500 {
            if worker.schedule() {
                accepted += 1;
            }
            thread::yield_now();
        }
        while worker.is_scheduled() || executor.pending() > 0 {
            thread::yield_now();
        }
        stop.store(true, Ordering::SeqCst);
        for runner in runners {
            runner.join().unwrap();
        }
        executor.run_pending();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert!(worker.runs() >= 1);
        assert_eq!(worker.runs(), accepted);
    }

    #[test]
    fn reporter_reads_the_string_at_its_offset() {
        let host = HostMemory::new();
        let buffer = DmaBuffer::new(host.alloc(PAGE_SIZE).unwrap());
        buffer.write_at(20, b"retezec10b\0").unwrap();

        let executor = Arc::new(QueueExecutor::new());
        let reporter = Arc::new(CompletionReporter::new(buffer.view(), 20, 64));
        let worker = DeferredWorker::new("report", executor.clone(), reporter.clone());

        worker.schedule();
        executor.run_pending();
        assert_eq!(reporter.reports(), 1);
        assert_eq!(reporter.last_report().as_deref(), Some("retezec10b"));

        worker.kill();
        host.free(buffer.into_memory());
    }
}
