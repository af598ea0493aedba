//! Supervoxels of one stack channel computed in the background.
//!
//! `StackSlic` owns at most one running computation. The computation runs on its own thread
//! (the assignment and update steps use the global rayon pool), persists its result and then
//! publishes it. Queries read the published result, or the persisted one when nothing was
//! computed in this session.
use crate::arrays::Volume;
use crate::codec::{FileNames, SlicResult};
use crate::common::Config;
use crate::edges::SliceRegions;
use crate::error::{Error, Result};
use crate::slic::{run_slic, AbortFlag};
use crate::storage::BlobStorage;
use log::info;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Terminal state of a computation which did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Completed,
    Cancelled,
}

/// Receives the progress (0-100) of running computations.
pub type ProgressObserver = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Debug, Default)]
struct RunShared {
    abort: AbortFlag,
    progress: AtomicU8,
    finished: AtomicBool,
}

/// Result of the stack as far as this session knows it.
#[derive(Debug, Default)]
enum Published {
    /// The storage was not read yet.
    #[default]
    NotLoaded,
    /// Nothing usable is persisted and nothing was computed since.
    Absent,
    Ready(Arc<SlicResult>),
}

impl Published {
    fn get(&self) -> Option<Arc<SlicResult>> {
        match self {
            Published::Ready(result) => Some(result.clone()),
            Published::NotLoaded | Published::Absent => None,
        }
    }
}

/// Marks the run as finished when the computation thread ends, even by a panic.
struct FinishGuard(Arc<RunShared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.finished.store(true, Ordering::Release);
    }
}

/// Handle of one started computation.
#[derive(Debug)]
pub struct ComputationHandle {
    shared: Arc<RunShared>,
    thread: JoinHandle<Result<RunState>>,
}

impl ComputationHandle {
    pub fn progress(&self) -> u8 {
        self.shared.progress.load(Ordering::Relaxed)
    }

    pub fn abort(&self) {
        self.shared.abort.abort()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.finished.load(Ordering::Acquire)
    }

    /// Blocks until the computation ends.
    pub fn wait(self) -> Result<RunState> {
        self.thread.join().map_err(|_| Error::WorkerPanicked)?
    }
}

pub struct StackSlic {
    channel: String,
    volume: Arc<Volume>,
    regions: Arc<dyn SliceRegions>,
    storage: Arc<dyn BlobStorage>,
    names: FileNames,
    result: Arc<RwLock<Published>>,
    /// Held while the result is saved to or loaded from the storage.
    persisting: Arc<Mutex<()>>,
    current_run: Mutex<Option<Arc<RunShared>>>,
    observer: Mutex<Option<ProgressObserver>>,
}

impl StackSlic {
    pub fn new(
        channel: impl Into<String>,
        volume: Arc<Volume>,
        regions: Arc<dyn SliceRegions>,
        storage: Arc<dyn BlobStorage>,
    ) -> Self {
        Self {
            channel: channel.into(),
            volume,
            regions,
            storage,
            names: FileNames::default(),
            result: Arc::new(RwLock::new(Published::NotLoaded)),
            persisting: Arc::new(Mutex::new(())),
            current_run: Mutex::new(None),
            observer: Mutex::new(None),
        }
    }

    pub fn with_file_names(mut self, names: FileNames) -> Self {
        self.names = names;
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Observer of the computations started after this call.
    pub fn set_progress_observer(&self, observer: impl Fn(u8) + Send + Sync + 'static) {
        *self.observer.lock() = Some(Arc::new(observer));
    }

    /// Starts a computation in the background.
    ///
    /// Fails with `Error::AlreadyRunning` while another computation of this stack runs, requests
    /// are never queued. Invalid input volumes are reported by `ComputationHandle::wait()`.
    pub fn start_computation(&self, config: Config) -> Result<ComputationHandle> {
        config.validate()?;
        let mut current_run = self.current_run.lock();
        if current_run
            .as_ref()
            .is_some_and(|run| !run.finished.load(Ordering::Acquire))
        {
            return Err(Error::AlreadyRunning);
        }

        let shared = Arc::new(RunShared::default());
        let computation = Computation {
            channel: self.channel.clone(),
            volume: self.volume.clone(),
            regions: self.regions.clone(),
            storage: self.storage.clone(),
            names: self.names.clone(),
            result: self.result.clone(),
            persisting: self.persisting.clone(),
            shared: shared.clone(),
            observer: self.observer.lock().clone(),
            config,
        };
        let thread = thread::Builder::new()
            .name(format!("stack-slic-{}", self.channel))
            .spawn(move || {
                let _finish = FinishGuard(computation.shared.clone());
                computation.run()
            })
            .map_err(Error::Spawn)?;
        *current_run = Some(shared.clone());
        Ok(ComputationHandle { shared, thread })
    }

    /// Requests the running computation to stop, does nothing when none runs.
    pub fn abort_computation(&self) {
        if let Some(run) = self.current_run.lock().as_ref() {
            run.abort.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.current_run
            .lock()
            .as_ref()
            .is_some_and(|run| !run.finished.load(Ordering::Acquire))
    }

    /// Progress of the last started computation, 0 when none was started.
    pub fn progress(&self) -> u8 {
        self.current_run
            .lock()
            .as_ref()
            .map_or(0, |run| run.progress.load(Ordering::Relaxed))
    }

    /// The published result, loaded from the storage on first use.
    ///
    /// Nothing is loaded while a computation runs, its result replaces the persisted one.
    pub fn result(&self) -> Option<Arc<SlicResult>> {
        match &*self.result.read() {
            Published::NotLoaded => {}
            published => return published.get(),
        }
        if self.is_running() {
            return None;
        }
        let mut published = self.result.write();
        if let Published::NotLoaded = *published {
            let _persisting = self.persisting.lock();
            let loaded = SlicResult::load(self.storage.as_ref(), &self.channel, &self.names);
            *published = match loaded {
                Some(result) => Published::Ready(Arc::new(result)),
                None => Published::Absent,
            };
        }
        published.get()
    }

    pub fn is_computed(&self) -> bool {
        self.result().is_some()
    }

    pub fn supervoxel_at(&self, x: usize, y: usize, z: usize) -> Option<u32> {
        self.result()?.supervoxel_at(x, y, z)
    }

    pub fn color_of(&self, label: u32) -> Option<u8> {
        self.result()?.color_of(label)
    }

    pub fn center_of(&self, label: u32) -> Option<[usize; 3]> {
        self.result()?.center_of(label)
    }

    /// 0 when nothing is computed.
    pub fn supervoxel_count(&self) -> usize {
        self.result().map_or(0, |result| result.supervoxel_count())
    }

    pub fn parameters_used(&self) -> Option<Config> {
        self.result().map(|result| result.parameters_used().clone())
    }

    pub fn slice_labels(&self, z: usize) -> Option<Vec<u32>> {
        self.result()?.slice_labels(z)
    }

    pub fn slice_colors(&self, z: usize) -> Option<Vec<u8>> {
        self.result()?.slice_colors(z)
    }
}

/// Everything the computation thread needs.
struct Computation {
    channel: String,
    volume: Arc<Volume>,
    regions: Arc<dyn SliceRegions>,
    storage: Arc<dyn BlobStorage>,
    names: FileNames,
    result: Arc<RwLock<Published>>,
    persisting: Arc<Mutex<()>>,
    shared: Arc<RunShared>,
    observer: Option<ProgressObserver>,
    config: Config,
}

impl Computation {
    fn run(&self) -> Result<RunState> {
        let report = |progress: u8| {
            let previous = self.shared.progress.fetch_max(progress, Ordering::Relaxed);
            if progress >= previous {
                if let Some(observer) = &self.observer {
                    observer(progress);
                }
            }
        };
        let computed = run_slic(
            &self.volume,
            self.regions.as_ref(),
            &self.config,
            &self.shared.abort,
            &report,
        )?;
        let Some(result) = computed.filter(|_| !self.shared.abort.is_aborted()) else {
            return Ok(RunState::Cancelled);
        };
        {
            let _persisting = self.persisting.lock();
            result.save(self.storage.as_ref(), &self.channel, &self.names)?;
        }
        *self.result.write() = Published::Ready(Arc::new(result));
        info!("Published supervoxels of {}", self.channel);
        report(100);
        Ok(RunState::Completed)
    }
}
