use std::{
    io,
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use tracing::{debug, error, trace, warn};

use crate::backend::dpu::state::CrtcIndex;

/// Unit of work executed by a scheduler
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Executes commit tails off the committing thread
///
/// Jobs handed to the same scheduler instance for the same crtc run in submission order.
pub(crate) trait CommitScheduler: Send + Sync {
    /// Queue a job, handing it back if the scheduler is shut down
    fn schedule(&self, job: Job) -> Result<(), Job>;

    /// Run all queued jobs and stop the worker threads
    fn shutdown(&self);
}

/// Move the calling thread into the `SCHED_FIFO` class at `priority`
fn raise_priority(priority: i32) -> io::Result<()> {
    // SAFETY: sched_param is plain old data, the priority is its only field libc reads here
    let mut param: libc::sched_param = unsafe { std::mem::zeroed() };
    param.sched_priority = priority;
    // SAFETY: pthread_self is always a valid handle for the calling thread
    let ret = unsafe { libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) };
    match ret {
        0 => Ok(()),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

fn run_worker(priority: Option<i32>, receiver: impl Iterator<Item = Job>) {
    if let Some(priority) = priority {
        match raise_priority(priority) {
            Ok(()) => debug!(priority, "Commit worker runs with realtime priority"),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                warn!(priority, "Not permitted to raise commit worker priority, keeping default scheduling")
            }
            Err(err) => warn!(priority, "Failed to raise commit worker priority: {}", err),
        }
    }
    for job in receiver {
        job();
    }
    trace!("Commit worker stopped");
}

/// Dedicated worker thread of a single crtc
#[derive(Debug)]
pub(crate) struct CrtcWorker {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CrtcWorker {
    pub(crate) fn spawn(crtc: CrtcIndex, priority: Option<i32>) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let thread = thread::Builder::new()
            .name(format!("dpu-commit-{}", crtc.0))
            .spawn(move || run_worker(priority, receiver.into_iter()))?;
        Ok(CrtcWorker {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
        })
    }
}

impl CommitScheduler for CrtcWorker {
    fn schedule(&self, job: Job) -> Result<(), Job> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(job).map_err(|mpsc::SendError(job)| job),
            None => Err(job),
        }
    }

    fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        if let Some(thread) = self.thread.lock().unwrap().take() {
            if thread.join().is_err() {
                error!("Commit worker panicked");
            }
        }
    }
}

/// Queue shared by several worker threads, running commits that span multiple crtcs
///
/// Jobs are started in submission order but may complete in any order.
#[derive(Debug)]
pub(crate) struct SharedQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SharedQueue {
    pub(crate) fn spawn(workers: usize, priority: Option<i32>) -> io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let threads = (0..workers.max(1))
            .map(|idx| {
                let receiver = receiver.clone();
                thread::Builder::new()
                    .name(format!("dpu-commit-shared-{}", idx))
                    .spawn(move || {
                        // the lock is only held while waiting for the next job
                        let next = || receiver.lock().unwrap().recv().ok();
                        run_worker(priority, std::iter::from_fn(next))
                    })
            })
            .collect::<io::Result<Vec<_>>>()?;
        Ok(SharedQueue {
            sender: Mutex::new(Some(sender)),
            threads: Mutex::new(threads),
        })
    }
}

impl CommitScheduler for SharedQueue {
    fn schedule(&self, job: Job) -> Result<(), Job> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.send(job).map_err(|mpsc::SendError(job)| job),
            None => Err(job),
        }
    }

    fn shutdown(&self) {
        self.sender.lock().unwrap().take();
        for thread in self.threads.lock().unwrap().drain(..) {
            if thread.join().is_err() {
                error!("Shared commit worker panicked");
            }
        }
    }
}

/// All schedulers of a device
#[derive(Debug)]
pub(crate) struct Schedulers {
    crtcs: Vec<CrtcWorker>,
    shared: SharedQueue,
}

impl Schedulers {
    pub(crate) fn spawn(crtc_count: usize, shared_workers: usize, priority: Option<i32>) -> io::Result<Self> {
        Ok(Schedulers {
            crtcs: (0..crtc_count)
                .map(|idx| CrtcWorker::spawn(CrtcIndex(idx as u8), priority))
                .collect::<io::Result<_>>()?,
            shared: SharedQueue::spawn(shared_workers, priority)?,
        })
    }

    /// Scheduler for a commit touching `crtcs`
    ///
    /// Commits without a crtc have nothing to wait for and run inline, `None` is returned.
    pub(crate) fn select(&self, crtcs: &[CrtcIndex]) -> Option<&dyn CommitScheduler> {
        match crtcs {
            [] => None,
            [crtc] => match self.crtcs.get(crtc.0 as usize) {
                Some(worker) => Some(worker),
                None => Some(&self.shared),
            },
            _ => Some(&self.shared),
        }
    }

    pub(crate) fn shutdown(&self) {
        for worker in &self.crtcs {
            worker.shutdown();
        }
        self.shared.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;

    #[test]
    fn crtc_worker_is_fifo() {
        let worker = CrtcWorker::spawn(CrtcIndex(0), None).unwrap();
        let (tx, rx) = channel();
        for i in 0..32 {
            let tx = tx.clone();
            worker
                .schedule(Box::new(move || tx.send(i).unwrap()))
                .map_err(|_| "worker gone")
                .unwrap();
        }
        worker.shutdown();
        drop(tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), (0..32).collect::<Vec<_>>());
    }

    #[test]
    fn shared_queue_runs_everything() {
        let queue = SharedQueue::spawn(3, None).unwrap();
        let (tx, rx) = channel();
        for i in 0..16 {
            let tx = tx.clone();
            queue
                .schedule(Box::new(move || tx.send(i).unwrap()))
                .map_err(|_| "queue gone")
                .unwrap();
        }
        queue.shutdown();
        drop(tx);
        let mut done: Vec<i32> = rx.iter().collect();
        done.sort();
        assert_eq!(done, (0..16).collect::<Vec<_>>());

        assert!(queue.schedule(Box::new(|| {})).is_err());
    }

    #[test]
    fn selection_follows_crtc_count() {
        let schedulers = Schedulers::spawn(2, 1, None).unwrap();
        let single = schedulers.select(&[CrtcIndex(1)]).unwrap() as *const dyn CommitScheduler as *const ();
        let multi =
            schedulers.select(&[CrtcIndex(0), CrtcIndex(1)]).unwrap() as *const dyn CommitScheduler as *const ();
        assert_eq!(single, &schedulers.crtcs[1] as *const CrtcWorker as *const ());
        assert_eq!(multi, &schedulers.shared as *const SharedQueue as *const ());
        assert!(schedulers.select(&[]).is_none());
        schedulers.shutdown();
    }

    #[test]
    fn realtime_priority_is_best_effort() {
        // unprivileged test runs may only see EPERM
        let result = thread::spawn(|| raise_priority(1)).join().unwrap();
        if let Err(err) = result {
            assert_eq!(err.raw_os_error(), Some(libc::EPERM));
        }

        let worker = CrtcWorker::spawn(CrtcIndex(0), Some(50)).unwrap();
        let (tx, rx) = channel();
        worker
            .schedule(Box::new(move || tx.send(()).unwrap()))
            .map_err(|_| "worker gone")
            .unwrap();
        worker.shutdown();
        assert!(rx.recv().is_ok());
    }
}
