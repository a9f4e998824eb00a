//! Launching polling workers on lcores.

use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::errors::{Error, Result};
use crate::lcore::{self, LcoreId};

/// A function running on a worker lcore.
pub struct Worker<R> {
    lcore: LcoreId,
    handle: JoinHandle<R>,
}

impl<R> Worker<R> {
    pub fn lcore(&self) -> LcoreId {
        self.lcore
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the worker to return. A panic in the worker comes back as
    /// [`Error::WorkerPanicked`] when panics unwind; with `panic = "abort"`
    /// the process is already gone.
    pub fn wait(self) -> Result<R> {
        self.handle
            .join()
            .map_err(|_| Error::WorkerPanicked(self.lcore.get()))
    }
}

/// Runs `f` on a new thread bound to `lcore`.
///
/// Pinning is best effort: when the CPU is not in the process affinity
/// mask the worker still runs, unpinned.
pub fn remote_launch<F, R>(lcore: LcoreId, f: F) -> Result<Worker<R>>
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let handle = thread::Builder::new()
        .name(format!("lcore-worker-{}", lcore.get()))
        .spawn(move || {
            if let Err(err) = pin_to_cpu(lcore) {
                warn!(%lcore, %err, "cannot pin worker, running unpinned");
            }
            lcore::set_current(lcore);
            f()
        })?;
    debug!(%lcore, "launched worker");
    Ok(Worker { lcore, handle })
}

/// Launches a copy of `f` on every worker lcore, passing the lcore id.
pub fn launch_all<F, R>(f: F) -> Result<Vec<Worker<R>>>
where
    F: Fn(LcoreId) -> R + Clone + Send + 'static,
    R: Send + 'static,
{
    lcore::workers()
        .map(|lcore| {
            let f = f.clone();
            remote_launch(lcore, move || f(lcore))
        })
        .collect()
}

/// Waits for every worker, returning the first failure.
pub fn wait_all<R>(workers: Vec<Worker<R>>) -> Result<Vec<R>> {
    let mut out = Vec::with_capacity(workers.len());
    let mut first_err = None;
    for worker in workers {
        match worker.wait() {
            Ok(r) => out.push(r),
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    match first_err {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

#[cfg(target_os = "linux")]
fn pin_to_cpu(lcore: LcoreId) -> Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    set.set(lcore.get() as usize).map_err(std::io::Error::from)?;
    sched_setaffinity(Pid::from_raw(0), &set).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn pin_to_cpu(_lcore: LcoreId) -> Result<()> {
    Err(Error::UnsupportedFeature("cpu affinity"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_sees_its_lcore() {
        let target = LcoreId::new(0).unwrap();
        let worker = remote_launch(target, lcore::id).unwrap();
        assert_eq!(worker.lcore(), target);
        assert_eq!(worker.wait().unwrap(), Some(target));
    }

    #[test]
    fn launch_all_covers_workers() {
        let workers = launch_all(|lcore| lcore.get()).unwrap();
        let mut ids = wait_all(workers).unwrap();
        ids.sort_unstable();
        let expected: Vec<u32> = lcore::workers().map(LcoreId::get).collect();
        assert_eq!(ids, expected);
    }

    #[test]
    #[cfg(panic = "unwind")]
    fn panicking_worker_is_reported() {
        let target = LcoreId::new(0).unwrap();
        let worker = remote_launch(target, || -> u32 { panic!("worker failed") }).unwrap();
        let err = worker.wait().unwrap_err();
        assert!(matches!(err, Error::WorkerPanicked(0)));
        assert_eq!(err.errno(), -libc::ECANCELED);
    }
}
