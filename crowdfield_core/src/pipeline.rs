//! The multi-threaded rasterization pipeline.
//!
//! Workers claim frames from a shared source one at a time, rasterize them
//! independently and send the grids over a bounded channel. The calling
//! thread acts as the single writer: it restores frame order through a
//! [`ReorderBuffer`] and streams each grid to the sequence file as soon as
//! its turn comes up.
//!
//! ```text
//!   Mutex<FrameSource> --next_frame()--> worker 0..N --(index, Grid)--> channel
//!                                                                         |
//!                       SequenceWriter <--in order-- ReorderBuffer <------+
//! ```
//!
//! The pipeline ends when every worker has dropped its sender and the
//! reorder buffer has nothing left to write. A worker error raises a shared
//! abort flag so the rest stop claiming frames.
//!
//! A worker holding a frame more than `workers * slots_per_worker` ahead of
//! the next grid to write waits before sending it, so the reorder buffer
//! never holds more than that many grids.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::io::{Seek, Write};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use crowdfield_env::FrameSource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::error::{FieldError, Result};
use crate::grid::{Grid, GridDomain};
use crate::kernel::KernelPool;
use crate::rasterize::Rasterize;
use crate::sequence::SequenceWriter;

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Number of rasterization threads
    pub workers: usize,

    /// Channel slots per worker
    pub slots_per_worker: usize,

    /// How long the writer waits for a result before checking again
    pub poll_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(1, |n| n.get()),
            slots_per_worker: 4,
            poll_interval: Duration::from_millis(50),
        }
    }
}

impl PipelineConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_slots_per_worker(mut self, slots: usize) -> Self {
        self.slots_per_worker = slots;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Most grids the writer ever holds back waiting for an earlier one.
    pub fn max_pending(&self) -> usize {
        self.workers * self.slots_per_worker
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(FieldError::invalid_config("worker count must be at least 1"));
        }
        if self.slots_per_worker == 0 {
            return Err(FieldError::invalid_config("channel slots per worker must be at least 1"));
        }
        Ok(())
    }
}

/// What one worker did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub worker: usize,
    pub frames: usize,
    pub max_value: f32,
}

impl WorkerReport {
    fn new(worker: usize) -> Self {
        Self {
            worker,
            frames: 0,
            max_value: 0.0,
        }
    }

    fn record(&mut self, max_value: f32) {
        self.frames += 1;
        if max_value > self.max_value {
            self.max_value = max_value;
        }
    }
}

/// A rasterized grid waiting for its turn to be written.
#[derive(Debug)]
struct Pending {
    index: usize,
    grid: Grid,
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> Ordering {
        self.index.cmp(&other.index)
    }
}

/// Min-heap of out-of-order results keyed by frame index.
#[derive(Debug, Default)]
pub struct ReorderBuffer {
    heap: BinaryHeap<Reverse<Pending>>,
    next: usize,
    peak: usize,
}

impl ReorderBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize, grid: Grid) {
        self.heap.push(Reverse(Pending { index, grid }));
        self.peak = self.peak.max(self.heap.len());
    }

    /// Removes and returns the grid for the next expected index, if present.
    pub fn pop_ready(&mut self) -> Option<Grid> {
        match self.heap.peek() {
            Some(Reverse(top)) if top.index == self.next => {
                self.next += 1;
                self.heap.pop().map(|Reverse(p)| p.grid)
            }
            _ => None,
        }
    }

    /// Index the next written grid must have.
    pub fn next_index(&self) -> usize {
        self.next
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Largest number of grids held at once.
    pub fn peak_len(&self) -> usize {
        self.peak
    }
}

/// Holds workers back while their frame is too far ahead of the writer.
#[derive(Debug)]
struct WriteGate {
    next: Mutex<usize>,
    advanced: Condvar,
    window: usize,
    aborted: AtomicBool,
}

impl WriteGate {
    fn new(window: usize) -> Self {
        Self {
            next: Mutex::new(0),
            advanced: Condvar::new(),
            window,
            aborted: AtomicBool::new(false),
        }
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(AtomicOrdering::SeqCst)
    }

    /// Blocks until `index` is within the window. Returns false once aborted.
    fn wait_for(&self, index: usize) -> bool {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        while index >= *next + self.window {
            if self.is_aborted() {
                return false;
            }
            next = self.advanced.wait(next).unwrap_or_else(PoisonError::into_inner);
        }
        !self.is_aborted()
    }

    fn advance(&self, next: usize) {
        *self.next.lock().unwrap_or_else(PoisonError::into_inner) = next;
        self.advanced.notify_all();
    }

    fn abort(&self) {
        self.aborted.store(true, AtomicOrdering::SeqCst);
        // Taking the lock orders the flag before any waiter's next check
        drop(self.next.lock().unwrap_or_else(PoisonError::into_inner));
        self.advanced.notify_all();
    }
}

/// Raises the abort flag if the worker unwinds.
struct AbortOnPanic<'a>(&'a WriteGate);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            self.0.abort();
        }
    }
}

/// What the pipeline hands back once every frame is written.
#[derive(Debug)]
pub struct PipelineOutput<W: Write + Seek> {
    /// The writer, not yet finished, so the caller can pick the header range
    pub writer: SequenceWriter<W>,
    pub reports: Vec<WorkerReport>,

    /// Most grids the reorder buffer held at once
    pub peak_pending: usize,
}

/// Runs a [`Rasterize`] implementation over every frame of a source.
#[derive(Debug, Clone)]
pub struct RasterPipeline {
    config: PipelineConfig,
    domain: GridDomain,
    background: f32,
}

impl RasterPipeline {
    pub fn new(config: PipelineConfig, domain: GridDomain) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            domain,
            background: 0.0,
        })
    }

    /// Value every grid starts from before rasterization.
    pub fn with_background(mut self, value: f32) -> Self {
        self.background = value;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Rasterizes every frame of `source` and writes the grids in order.
    ///
    /// The source is rewound to index 0 first. On error the writer is
    /// dropped without patching its header.
    pub fn run<S, R, W>(
        &self,
        source: &Mutex<S>,
        rasterizer: &R,
        mut writer: SequenceWriter<W>,
    ) -> Result<PipelineOutput<W>>
    where
        S: FrameSource + ?Sized,
        R: Rasterize,
        W: Write + Seek,
    {
        source.lock().map_err(|_| FieldError::SourcePoisoned)?.set_next(0)?;

        let workers = self.config.workers;
        let (tx, rx) = channel::bounded::<(usize, Grid)>(self.config.max_pending());
        let gate = WriteGate::new(self.config.max_pending());

        info!(
            "Rasterizing {} with {} workers",
            rasterizer.name(),
            workers
        );

        thread::scope(|scope| {
            let mut handles = Vec::with_capacity(workers);
            for id in 0..workers {
                let tx = tx.clone();
                let gate = &gate;
                let handle = thread::Builder::new()
                    .name(format!("raster-{id}"))
                    .spawn_scoped(scope, move || {
                        let _guard = AbortOnPanic(gate);
                        self.work(id, source, rasterizer, tx, gate)
                    })?;
                handles.push(handle);
            }
            // Workers hold the only senders; the channel disconnects once they all exit
            drop(tx);

            let mut reorder = ReorderBuffer::new();
            let mut first_error: Option<FieldError> = None;
            loop {
                match rx.recv_timeout(self.config.poll_interval) {
                    Ok((index, grid)) => {
                        reorder.push(index, grid);
                        while let Some(grid) = reorder.pop_ready() {
                            if let Err(e) = writer.write_grid(&grid) {
                                first_error = Some(e);
                                break;
                            }
                        }
                        if first_error.is_some() {
                            gate.abort();
                            break;
                        }
                        gate.advance(reorder.next_index());
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        trace!(
                            "Writer waiting for grid {} ({} buffered)",
                            reorder.next_index(),
                            reorder.len()
                        );
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Unblocks any worker still waiting on a full channel or the gate
            drop(rx);
            gate.abort();

            let mut reports = Vec::with_capacity(workers);
            for (id, handle) in handles.into_iter().enumerate() {
                match handle.join() {
                    Ok(Ok(report)) => {
                        debug!(
                            "Worker {} rasterized {} frames (max {})",
                            report.worker, report.frames, report.max_value
                        );
                        reports.push(report);
                    }
                    Ok(Err(e)) => {
                        first_error.get_or_insert(e);
                    }
                    Err(_) => {
                        // The panic outranks the poisoned lock other workers found after it
                        if matches!(first_error, None | Some(FieldError::SourcePoisoned)) {
                            first_error = Some(FieldError::WorkerPanicked(id));
                        }
                    }
                }
            }

            if let Some(e) = first_error {
                warn!("Rasterization aborted: {}", e);
                return Err(e);
            }
            if !reorder.is_empty() {
                warn!(
                    "{} grids left unwritten after grid {}",
                    reorder.len(),
                    reorder.next_index()
                );
            }

            let total: usize = reports.iter().map(|r| r.frames).sum();
            debug!("Workers produced {} grids, writer wrote {}", total, writer.grid_count());
            Ok(PipelineOutput {
                writer,
                reports,
                peak_pending: reorder.peak_len(),
            })
        })
    }

    fn work<S, R>(
        &self,
        id: usize,
        source: &Mutex<S>,
        rasterizer: &R,
        tx: Sender<(usize, Grid)>,
        gate: &WriteGate,
    ) -> Result<WorkerReport>
    where
        S: FrameSource + ?Sized,
        R: Rasterize,
    {
        let mut report = WorkerReport::new(id);
        let mut pool = KernelPool::new();

        while !gate.is_aborted() {
            let claimed = match source.lock() {
                Ok(mut guard) => guard.next_frame(),
                Err(_) => {
                    gate.abort();
                    return Err(FieldError::SourcePoisoned);
                }
            };
            let (index, frame) = match claimed {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(e) => {
                    gate.abort();
                    return Err(e.into());
                }
            };

            let mut grid = Grid::filled(self.domain, self.background);
            if let Err(e) = rasterizer.rasterize(&frame, &mut grid, &mut pool) {
                gate.abort();
                return Err(e);
            }
            report.record(grid.max_value());

            if !gate.wait_for(index) {
                break;
            }

            if tx.send((index, grid)).is_err() {
                // Writer has stopped
                break;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::density::DensityFunction;
    use crate::rasterize::DensityRasterizer;
    use crowdfield_env::{Frame, MemorySource, TrajectoryError};
    use nalgebra::Vector2;
    use std::io::Cursor;

    fn domain() -> GridDomain {
        GridDomain::new(Vector2::zeros(), Vector2::new(8.0, 8.0), (8, 8)).unwrap()
    }

    fn frames(n: usize) -> Vec<Frame> {
        (0..n)
            .map(|i| Frame::from_positions(&[[(i % 8) as f32 + 0.5, 4.0], [2.0, (i % 8) as f32 + 0.5]]))
            .collect()
    }

    #[test]
    fn test_reorder_buffer_releases_in_order() {
        let grid = |v: f32| Grid::filled(domain(), v);
        let mut buffer = ReorderBuffer::new();
        buffer.push(2, grid(2.0));
        buffer.push(1, grid(1.0));
        assert!(buffer.pop_ready().is_none());

        buffer.push(0, grid(0.0));
        let order: Vec<f32> = std::iter::from_fn(|| buffer.pop_ready())
            .map(|g| g.get(0, 0))
            .collect();
        assert_eq!(order, vec![0.0, 1.0, 2.0]);
        assert!(buffer.is_empty());
        assert_eq!(buffer.next_index(), 3);
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = PipelineConfig::default().with_workers(0);
        assert!(RasterPipeline::new(config, domain()).is_err());
    }

    #[test]
    fn test_writes_every_frame_in_order() {
        let source = Mutex::new(MemorySource::new(frames(20)));
        let rasterizer = DensityRasterizer::new(DensityFunction::Biweight, 1.5, &domain()).unwrap();
        let writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();

        let pipeline = RasterPipeline::new(PipelineConfig::default().with_workers(4), domain()).unwrap();
        let output = pipeline.run(&source, &rasterizer, writer).unwrap();

        assert_eq!(output.writer.grid_count(), 20);
        assert_eq!(output.reports.iter().map(|r| r.frames).sum::<usize>(), 20);
        let summary = output.writer.finish().unwrap();
        assert_eq!(summary.grid_count, 20);
    }

    struct FailingSource {
        served: usize,
    }

    impl FrameSource for FailingSource {
        fn next_frame(&mut self) -> crowdfield_env::Result<Option<(usize, Frame)>> {
            if self.served == 3 {
                return Err(TrajectoryError::TruncatedFrame {
                    frame: 3,
                    expected: 24,
                    found: 8,
                });
            }
            self.served += 1;
            Ok(Some((self.served - 1, Frame::from_positions(&[[1.0, 1.0]]))))
        }

        fn set_next(&mut self, index: usize) -> crowdfield_env::Result<()> {
            self.served = index;
            Ok(())
        }

        fn agent_count(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_source_error_aborts_run() {
        let source = Mutex::new(FailingSource { served: 0 });
        let rasterizer = DensityRasterizer::new(DensityFunction::Uniform, 1.0, &domain()).unwrap();
        let writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();

        let pipeline = RasterPipeline::new(PipelineConfig::default().with_workers(3), domain()).unwrap();
        let result = pipeline.run(&source, &rasterizer, writer);
        assert!(matches!(
            result,
            Err(FieldError::Trajectory(TrajectoryError::TruncatedFrame { frame: 3, .. }))
        ));
    }

    struct PanickingRasterizer;

    impl Rasterize for PanickingRasterizer {
        fn rasterize(&self, _frame: &Frame, _grid: &mut Grid, _pool: &mut KernelPool) -> Result<()> {
            panic!("boom");
        }

        fn name(&self) -> &'static str {
            "panicking"
        }
    }

    #[test]
    fn test_worker_panic_reported() {
        let source = Mutex::new(MemorySource::new(frames(2)));
        let writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();
        let pipeline = RasterPipeline::new(PipelineConfig::default().with_workers(1), domain()).unwrap();
        let result = pipeline.run(&source, &PanickingRasterizer, writer);
        assert!(matches!(result, Err(FieldError::WorkerPanicked(0))));
    }

    /// Stalls on the frame whose only agent sits left of x = 1.
    struct SlowFirstFrame;

    impl Rasterize for SlowFirstFrame {
        fn rasterize(&self, frame: &Frame, grid: &mut Grid, _pool: &mut KernelPool) -> Result<()> {
            if frame.position(0).x < 1.0 {
                thread::sleep(Duration::from_millis(200));
            }
            grid.set(0, 0, frame.position(0).y);
            Ok(())
        }

        fn name(&self) -> &'static str {
            "slow-first"
        }
    }

    #[test]
    fn test_pending_grids_stay_within_window() {
        let frames: Vec<Frame> = (0..60)
            .map(|i| Frame::from_positions(&[[if i == 0 { 0.5 } else { 4.5 }, i as f32]]))
            .collect();
        let source = Mutex::new(MemorySource::new(frames));
        let writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();
        let config = PipelineConfig::default().with_workers(4).with_slots_per_worker(1);
        let pipeline = RasterPipeline::new(config.clone(), domain()).unwrap();

        let output = pipeline.run(&source, &SlowFirstFrame, writer).unwrap();
        assert_eq!(output.writer.grid_count(), 60);
        assert!(output.peak_pending >= 1);
        assert!(
            output.peak_pending <= config.max_pending(),
            "{} grids pending, window is {}",
            output.peak_pending,
            config.max_pending()
        );
    }

    #[test]
    fn test_reorder_buffer_tracks_peak() {
        let mut buffer = ReorderBuffer::new();
        buffer.push(1, Grid::filled(domain(), 1.0));
        buffer.push(2, Grid::filled(domain(), 2.0));
        buffer.push(0, Grid::filled(domain(), 0.0));
        while buffer.pop_ready().is_some() {}
        assert!(buffer.is_empty());
        assert_eq!(buffer.peak_len(), 3);
    }

    struct PanickingSource {
        served: usize,
    }

    impl FrameSource for PanickingSource {
        fn next_frame(&mut self) -> crowdfield_env::Result<Option<(usize, Frame)>> {
            if self.served == 1 {
                panic!("source broke");
            }
            self.served += 1;
            Ok(Some((self.served - 1, Frame::from_positions(&[[1.0, 1.0]]))))
        }

        fn set_next(&mut self, index: usize) -> crowdfield_env::Result<()> {
            self.served = index;
            Ok(())
        }

        fn agent_count(&self) -> usize {
            1
        }
    }

    #[test]
    fn test_source_panic_reported_as_panic() {
        let source = Mutex::new(PanickingSource { served: 0 });
        let rasterizer = DensityRasterizer::new(DensityFunction::Uniform, 1.0, &domain()).unwrap();
        let writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();
        let pipeline = RasterPipeline::new(PipelineConfig::default().with_workers(3), domain()).unwrap();

        let result = pipeline.run(&source, &rasterizer, writer);
        assert!(matches!(result, Err(FieldError::WorkerPanicked(_))), "{result:?}");
        assert!(source.is_poisoned());

        // A later run on the poisoned source names the lock, not a worker
        let writer = SequenceWriter::new(Cursor::new(Vec::new()), domain()).unwrap();
        let result = pipeline.run(&source, &rasterizer, writer);
        assert!(matches!(result, Err(FieldError::SourcePoisoned)));
    }
}
