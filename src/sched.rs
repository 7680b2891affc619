//! Fair write scheduler.
//!
//! Owns the write half of the physical connection. Control frames go
//! through their own queue and are always written before stream data.
//! Data frames go to a FIFO per stream; streams with pending frames take
//! turns in a ready ordering, each turn writing at most `quantum` frames
//! as one batch.
//!
//! ```text
//! write_frame ──┬─ control ──────────────────────────┐
//!               └─ per-stream FIFO ── ready ordering ┴─> dispatch loop ─> FrameWriter
//! ```

use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::protocol::{Frame, StreamId, ACK_CLOSE_STREAM, CMD_CLOSE_STREAM, CMD_PUSH_STREAM_DATA};
use crate::sender::FrameSink;
use crate::transport::FrameWriter;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Control frames written in one batch at most
const CONTROL_BATCH: usize = 64;

/// Frames that must stay in order with a stream's data
fn is_stream_ordered(cmd: u8) -> bool {
    matches!(cmd, CMD_PUSH_STREAM_DATA | CMD_CLOSE_STREAM | ACK_CLOSE_STREAM)
}

fn ends_stream(cmd: u8) -> bool {
    matches!(cmd, CMD_CLOSE_STREAM | ACK_CLOSE_STREAM)
}

struct QueueState {
    frames: VecDeque<Frame>,
    /// Set while the stream's ID sits in the ready ordering or is being drained
    active: bool,
    /// The stream detached; drop the queue once it drains
    retired: bool,
}

struct StreamQueue {
    state: parking_lot::Mutex<QueueState>,
    space: Semaphore,
}

impl StreamQueue {
    fn new(capacity: usize) -> Self {
        Self {
            state: parking_lot::Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                active: false,
                retired: false,
            }),
            space: Semaphore::new(capacity),
        }
    }
}

struct Shared {
    queues: parking_lot::Mutex<HashMap<StreamId, Arc<StreamQueue>>>,
    stream_queue: usize,
    quantum: usize,
    cancel: CancellationToken,
    last_write: parking_lot::Mutex<Instant>,
    frames_written: AtomicU64,
}

impl Shared {
    fn queue(&self, id: StreamId) -> Arc<StreamQueue> {
        self.queues
            .lock()
            .entry(id)
            .or_insert_with(|| Arc::new(StreamQueue::new(self.stream_queue)))
            .clone()
    }

    /// Drop a stream's queue once it closed and has nothing pending.
    fn remove_if_idle(&self, id: StreamId, queue: &Arc<StreamQueue>) {
        let mut queues = self.queues.lock();
        if let Some(current) = queues.get(&id) {
            if Arc::ptr_eq(current, queue) {
                let state = queue.state.lock();
                if state.frames.is_empty() && !state.active {
                    drop(state);
                    queues.remove(&id);
                    trace!("Released scheduler queue for {}", id);
                }
            }
        }
    }

    fn record_write(&self, frames: usize) {
        *self.last_write.lock() = Instant::now();
        self.frames_written
            .fetch_add(frames as u64, Ordering::Relaxed);
    }
}

/// Put a stream ID at the tail of the ready ordering without blocking.
/// When the ordering is momentarily full the ID is handed to a task that
/// waits for room, which can let other streams overtake it.
fn push_ready(ready_tx: &mpsc::Sender<StreamId>, id: StreamId) {
    match ready_tx.try_send(id) {
        Ok(()) => {}
        Err(TrySendError::Full(id)) => {
            let ready_tx = ready_tx.clone();
            tokio::spawn(async move {
                let _ = ready_tx.send(id).await;
            });
        }
        Err(TrySendError::Closed(_)) => {}
    }
}

/// Multiplexes many streams' frames onto one [`FrameWriter`]
pub struct FairScheduler {
    shared: Arc<Shared>,
    control_tx: mpsc::Sender<Frame>,
    ready_tx: mpsc::Sender<StreamId>,
}

impl FairScheduler {
    /// Take ownership of `writer` and start the dispatch loop.
    pub fn new(writer: Box<dyn FrameWriter>, config: &SchedulerConfig) -> Self {
        let (control_tx, control_rx) = mpsc::channel(config.control_queue.max(1));
        let (ready_tx, ready_rx) = mpsc::channel(config.ready_queue.max(1));

        let shared = Arc::new(Shared {
            queues: parking_lot::Mutex::new(HashMap::new()),
            stream_queue: config.stream_queue.max(1),
            quantum: config.quantum.max(1),
            cancel: CancellationToken::new(),
            last_write: parking_lot::Mutex::new(Instant::now()),
            frames_written: AtomicU64::new(0),
        });

        tokio::spawn(dispatch_loop(
            shared.clone(),
            writer,
            control_rx,
            ready_rx,
            ready_tx.clone(),
        ));

        Self {
            shared,
            control_tx,
            ready_tx,
        }
    }

    /// Queue a frame for the connection.
    ///
    /// Blocks only while the relevant queue is full. Fails with
    /// [`Error::WriterClosed`] once the scheduler is closed, including for
    /// calls already waiting.
    pub async fn write_frame(&self, frame: Frame) -> Result<()> {
        let cancel = &self.shared.cancel;
        if cancel.is_cancelled() {
            return Err(Error::WriterClosed);
        }

        if !is_stream_ordered(frame.cmd()) {
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::WriterClosed),
                sent = self.control_tx.send(frame) => sent.map_err(|_| Error::WriterClosed),
            };
        }

        let id = frame.header.stream_id();
        loop {
            let queue = self.shared.queue(id);
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::WriterClosed),
                permit = queue.space.acquire() => permit.map_err(|_| Error::WriterClosed)?,
            };

            let activate = {
                let queues = self.shared.queues.lock();
                match queues.get(&id) {
                    Some(current) if Arc::ptr_eq(current, &queue) => {}
                    // The queue was retired while we waited; start over.
                    _ => continue,
                }
                permit.forget();
                let mut state = queue.state.lock();
                state.frames.push_back(frame);
                !std::mem::replace(&mut state.active, true)
            };

            if activate {
                push_ready(&self.ready_tx, id);
            }
            return Ok(());
        }
    }

    /// Stop the dispatch loop and fail every pending and future write.
    /// Safe to call more than once.
    pub fn close(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        debug!("Closing fair scheduler");
        self.shared.cancel.cancel();
        let queues: Vec<_> = self.shared.queues.lock().drain().map(|(_, q)| q).collect();
        for queue in queues {
            queue.space.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves when the scheduler is closed, by `close()` or a write failure
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Time since the last successful write
    pub fn idle_for(&self) -> Duration {
        self.shared.last_write.lock().elapsed()
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.frames_written.load(Ordering::Relaxed)
    }

    /// Forget a detached stream's queue: right away if nothing is pending,
    /// otherwise once its last frame is written.
    pub fn retire_stream(&self, id: StreamId) {
        let mut queues = self.shared.queues.lock();
        let idle = match queues.get(&id) {
            Some(queue) => {
                let mut state = queue.state.lock();
                state.retired = true;
                state.frames.is_empty() && !state.active
            }
            None => return,
        };
        if idle {
            queues.remove(&id);
            trace!("Released scheduler queue for {}", id);
        }
    }

    #[cfg(test)]
    fn queue_count(&self) -> usize {
        self.shared.queues.lock().len()
    }
}

impl Drop for FairScheduler {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

#[async_trait]
impl FrameSink for FairScheduler {
    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.write_frame(frame).await
    }

    fn release_stream(&self, id: StreamId) {
        self.retire_stream(id);
    }
}

async fn dispatch_loop(
    shared: Arc<Shared>,
    mut writer: Box<dyn FrameWriter>,
    mut control_rx: mpsc::Receiver<Frame>,
    mut ready_rx: mpsc::Receiver<StreamId>,
    ready_tx: mpsc::Sender<StreamId>,
) {
    let result: Result<()> = loop {
        let step = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break Ok(()),
            Some(frame) = control_rx.recv() => {
                let mut batch = vec![frame];
                while batch.len() < CONTROL_BATCH {
                    match control_rx.try_recv() {
                        Ok(frame) => batch.push(frame),
                        Err(_) => break,
                    }
                }
                write_batch(&shared, writer.as_mut(), &batch).await
            }
            Some(id) = ready_rx.recv() => {
                drain_stream(&shared, writer.as_mut(), &ready_tx, id).await
            }
            else => break Ok(()),
        };
        if let Err(e) = step {
            break Err(e);
        }
    };

    match result {
        Ok(()) => debug!("Scheduler loop stopped"),
        Err(Error::WriterClosed) => debug!("Scheduler loop stopped by close"),
        Err(e) => warn!("Scheduler write failed, closing: {}", e),
    }
    shared.cancel.cancel();
    let queues: Vec<_> = shared.queues.lock().drain().map(|(_, q)| q).collect();
    for queue in queues {
        queue.space.close();
    }
    if let Err(e) = writer.shutdown().await {
        debug!("Writer shutdown failed: {}", e);
    }
}

async fn write_batch(shared: &Shared, writer: &mut dyn FrameWriter, batch: &[Frame]) -> Result<()> {
    tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(Error::WriterClosed),
        written = writer.write_batch(batch) => {
            written?;
            shared.record_write(batch.len());
            Ok(())
        }
    }
}

/// One turn for a ready stream: write up to `quantum` frames, then either
/// requeue it behind the others or mark it idle.
async fn drain_stream(
    shared: &Shared,
    writer: &mut dyn FrameWriter,
    ready_tx: &mpsc::Sender<StreamId>,
    id: StreamId,
) -> Result<()> {
    let queue = match shared.queues.lock().get(&id).cloned() {
        Some(queue) => queue,
        None => return Ok(()),
    };

    let (batch, more, retired) = {
        let mut state = queue.state.lock();
        let n = state.frames.len().min(shared.quantum);
        let batch: Vec<Frame> = state.frames.drain(..n).collect();
        let more = !state.frames.is_empty();
        if !more {
            state.active = false;
        }
        (batch, more, state.retired)
    };
    queue.space.add_permits(batch.len());

    if !batch.is_empty() {
        trace!("Writing {} frames for {}", batch.len(), id);
        write_batch(shared, writer, &batch).await?;
    }

    if more {
        push_ready(ready_tx, id);
    } else if retired || batch.iter().any(|f| ends_stream(f.cmd())) {
        shared.remove_if_idle(id, &queue);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Addr, Header, ACK_PUSH_STREAM_DATA, CMD_OPEN_STREAM};
    use bytes::Bytes;
    use tokio::sync::Notify;

    #[derive(Clone, Default)]
    struct Recorder {
        frames: Arc<parking_lot::Mutex<Vec<Frame>>>,
        entered: Arc<Notify>,
        gate: CancellationToken,
        fail: bool,
        /// Time each batch takes to write
        delay: Duration,
    }

    impl Recorder {
        fn open() -> Self {
            let recorder = Self::default();
            recorder.gate.cancel();
            recorder
        }

        fn len(&self) -> usize {
            self.frames.lock().len()
        }

        async fn wait_for(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.len() < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("frames not written in time");
        }
    }

    #[async_trait]
    impl FrameWriter for Recorder {
        async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
            self.write_batch(std::slice::from_ref(frame)).await
        }

        async fn write_batch(&mut self, frames: &[Frame]) -> Result<()> {
            self.entered.notify_one();
            self.gate.cancelled().await;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "broken pipe",
                )));
            }
            self.frames.lock().extend_from_slice(frames);
            Ok(())
        }
    }

    fn data(port: u16, seq: u32) -> Frame {
        let header = Header::new(CMD_PUSH_STREAM_DATA, Addr::new(1, port), Addr::new(2, 80));
        Frame::new(header, Bytes::copy_from_slice(&seq.to_be_bytes())).unwrap()
    }

    fn control() -> Frame {
        let header = Header::new(CMD_OPEN_STREAM, Addr::new(1, 9), Addr::new(2, 80));
        Frame::new(header, Bytes::new()).unwrap()
    }

    fn config(quantum: usize, stream_queue: usize) -> SchedulerConfig {
        SchedulerConfig {
            quantum,
            stream_queue,
            ..SchedulerConfig::default()
        }
    }

    fn seq(frame: &Frame) -> u32 {
        u32::from_be_bytes(frame.payload[..4].try_into().unwrap())
    }

    #[tokio::test]
    async fn test_single_stream_in_order() {
        let recorder = Recorder::open();
        let sched = FairScheduler::new(Box::new(recorder.clone()), &config(4, 16));
        for i in 0..50 {
            sched.write_frame(data(1000, i)).await.unwrap();
        }
        recorder.wait_for(50).await;

        let frames = recorder.frames.lock();
        let seqs: Vec<u32> = frames.iter().map(seq).collect();
        assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        assert_eq!(sched.frames_written(), 50);
    }

    #[tokio::test]
    async fn test_control_frames_jump_data() {
        let recorder = Recorder::default();
        let sched = FairScheduler::new(Box::new(recorder.clone()), &config(4, 16));

        sched.write_frame(data(1000, 0)).await.unwrap();
        recorder.entered.notified().await;

        for i in 1..9 {
            sched.write_frame(data(1000, i)).await.unwrap();
        }
        let mut ack = control();
        ack.header.set_cmd(ACK_PUSH_STREAM_DATA);
        sched.write_frame(ack).await.unwrap();
        recorder.gate.cancel();
        recorder.wait_for(10).await;

        let frames = recorder.frames.lock();
        assert_eq!(seq(&frames[0]), 0);
        assert_eq!(frames[1].cmd(), ACK_PUSH_STREAM_DATA);
        let rest: Vec<u32> = frames[2..].iter().map(seq).collect();
        assert_eq!(rest, (1..9).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fairness_two_streams() {
        const QUANTUM: usize = 4;
        const PER_STREAM: u32 = 100;

        let recorder = Recorder::default();
        let sched = Arc::new(FairScheduler::new(
            Box::new(recorder.clone()),
            &config(QUANTUM, 128),
        ));

        let producers: Vec<_> = [1000u16, 2000]
            .into_iter()
            .map(|port| {
                let sched = sched.clone();
                tokio::spawn(async move {
                    for i in 0..PER_STREAM {
                        sched.write_frame(data(port, i)).await.unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }
        recorder.gate.cancel();
        recorder.wait_for(200).await;

        let frames = recorder.frames.lock();
        assert_eq!(frames.len(), 200);
        let ports: Vec<u16> = frames.iter().map(|f| f.src().port).collect();

        // Per-stream order is preserved.
        for port in [1000u16, 2000] {
            let seqs: Vec<u32> = frames
                .iter()
                .filter(|f| f.src().port == port)
                .map(seq)
                .collect();
            assert_eq!(seqs, (0..PER_STREAM).collect::<Vec<_>>());
        }

        assert_interleaved(&ports, QUANTUM);
    }

    /// Checks the window where both streams are active: from the first
    /// frame of the second stream to the last frame of whichever finishes
    /// first. Runs stay within the quantum and the share is even.
    fn assert_interleaved(ports: &[u16], quantum: usize) {
        let start = ports.iter().position(|p| *p != ports[0]).unwrap();
        let end = [1000u16, 2000]
            .iter()
            .map(|port| ports.iter().rposition(|p| p == port).unwrap())
            .min()
            .unwrap();
        let active = &ports[start..=end];

        let mut max_run = 0;
        let mut run = 0;
        let mut prev = None;
        for port in active {
            run = if prev == Some(port) { run + 1 } else { 1 };
            prev = Some(port);
            max_run = max_run.max(run);
        }
        assert!(max_run <= quantum, "run of {} exceeds quantum", max_run);

        // Jain's fairness index over the whole window
        let a = active.iter().filter(|p| **p == ports[0]).count() as f64;
        let b = active.len() as f64 - a;
        let jain = (a + b).powi(2) / (2.0 * (a * a + b * b));
        assert!(jain >= 0.95, "jain index {} too low", jain);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fairness_concurrent_producers() {
        const QUANTUM: usize = 4;
        const PER_STREAM: u32 = 120;

        let recorder = Recorder {
            delay: Duration::from_millis(1),
            ..Recorder::open()
        };
        let sched = Arc::new(FairScheduler::new(
            Box::new(recorder.clone()),
            &config(QUANTUM, 8),
        ));

        let start = Arc::new(tokio::sync::Barrier::new(2));
        let producers: Vec<_> = [1000u16, 2000]
            .into_iter()
            .map(|port| {
                let sched = sched.clone();
                let start = start.clone();
                tokio::spawn(async move {
                    start.wait().await;
                    for i in 0..PER_STREAM {
                        sched.write_frame(data(port, i)).await.unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            tokio::time::timeout(Duration::from_secs(10), p)
                .await
                .expect("producer stalled")
                .unwrap();
        }
        recorder.wait_for(2 * PER_STREAM as usize).await;

        let frames = recorder.frames.lock();
        for port in [1000u16, 2000] {
            let seqs: Vec<u32> = frames
                .iter()
                .filter(|f| f.src().port == port)
                .map(seq)
                .collect();
            assert_eq!(seqs, (0..PER_STREAM).collect::<Vec<_>>());
        }
        let ports: Vec<u16> = frames.iter().map(|f| f.src().port).collect();
        assert_interleaved(&ports, QUANTUM);
    }

    #[tokio::test]
    async fn test_close_fails_pending_writes() {
        let recorder = Recorder::default();
        let sched = Arc::new(FairScheduler::new(
            Box::new(recorder.clone()),
            &config(4, 1),
        ));

        sched.write_frame(data(1000, 0)).await.unwrap();
        recorder.entered.notified().await;
        sched.write_frame(data(1000, 1)).await.unwrap();

        let blocked = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.write_frame(data(1000, 2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        sched.close();
        sched.close();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(Error::WriterClosed)));
        assert!(matches!(
            sched.write_frame(control()).await,
            Err(Error::WriterClosed)
        ));
        assert!(sched.is_closed());
    }

    #[tokio::test]
    async fn test_write_error_closes_scheduler() {
        let recorder = Recorder {
            fail: true,
            ..Recorder::open()
        };
        let sched = FairScheduler::new(Box::new(recorder), &config(4, 16));
        sched.write_frame(control()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), sched.closed())
            .await
            .expect("scheduler not closed after write error");
        assert!(matches!(
            sched.write_frame(data(1000, 0)).await,
            Err(Error::WriterClosed)
        ));
    }

    #[tokio::test]
    async fn test_queue_released_after_close_frame() {
        let recorder = Recorder::open();
        let sched = FairScheduler::new(Box::new(recorder.clone()), &config(4, 16));
        sched.write_frame(data(1000, 0)).await.unwrap();
        let close = Frame::with_ack_info(
            Header::new(CMD_CLOSE_STREAM, Addr::new(1, 1000), Addr::new(2, 80)),
            0,
        );
        sched.write_frame(close).await.unwrap();
        recorder.wait_for(2).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(sched.shared.queues.lock().is_empty());

        // A later frame for the same ID gets a fresh queue.
        sched.write_frame(data(1000, 1)).await.unwrap();
        recorder.wait_for(3).await;
    }

    #[tokio::test]
    async fn test_retired_idle_queue_released() {
        let recorder = Recorder::open();
        let sched = FairScheduler::new(Box::new(recorder.clone()), &config(4, 16));
        let id = data(1000, 0).header.stream_id();
        sched.write_frame(data(1000, 0)).await.unwrap();
        recorder.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Data alone never ends a stream, so the queue is still there.
        assert_eq!(sched.queue_count(), 1);
        sched.retire_stream(id);
        assert_eq!(sched.queue_count(), 0);
        sched.retire_stream(id);
    }

    #[tokio::test]
    async fn test_retired_queue_released_after_drain() {
        let recorder = Recorder::default();
        let sched = FairScheduler::new(Box::new(recorder.clone()), &config(4, 16));
        let id = data(1000, 0).header.stream_id();

        sched.write_frame(data(1000, 0)).await.unwrap();
        recorder.entered.notified().await;
        sched.write_frame(data(1000, 1)).await.unwrap();
        sched.write_frame(data(1000, 2)).await.unwrap();

        sched.retire_stream(id);
        assert_eq!(sched.queue_count(), 1, "queue with pending frames dropped");

        recorder.gate.cancel();
        recorder.wait_for(3).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while sched.queue_count() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("retired queue kept after draining");

        let seqs: Vec<u32> = recorder.frames.lock().iter().map(seq).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
    }
}
