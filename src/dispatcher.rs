//! Inbound frame routing.
//!
//! Frames read off the connection are split into two queues. Stream data
//! and the frames that must stay in order with it go through one queue
//! handled by a single task. Everything else may be handled out of order,
//! each frame in its own task, bounded by a worker limit.

use crate::config::DispatchConfig;
use crate::error::{Error, Result};
use crate::protocol::{
    cmd_name, Frame, ACK_CLOSE_STREAM, ACK_OPEN_STREAM, ACK_PING_DOMAIN, ACK_PUSH_STREAM_DATA,
    CMD_CLOSE_STREAM, CMD_OPEN_STREAM, CMD_PING_DOMAIN, CMD_PUSH_STREAM_DATA,
};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Consumes routed inbound frames
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle_frame(&self, frame: Frame);
}

/// Which queue a command goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Handled concurrently, in no particular order
    Command,
    /// Handled one at a time in arrival order
    Ordered,
    /// Not handled at this layer
    Drop,
}

pub fn route(cmd: u8) -> Route {
    match cmd {
        CMD_OPEN_STREAM | ACK_PUSH_STREAM_DATA | CMD_PING_DOMAIN | ACK_PING_DOMAIN => {
            Route::Command
        }
        CMD_PUSH_STREAM_DATA | ACK_OPEN_STREAM | CMD_CLOSE_STREAM | ACK_CLOSE_STREAM => {
            Route::Ordered
        }
        _ => Route::Drop,
    }
}

pub struct Dispatcher {
    cmd_tx: mpsc::Sender<Frame>,
    data_tx: mpsc::Sender<Frame>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Start both queue tasks. They stop when `cancel` fires.
    pub fn new(
        handler: Arc<dyn FrameHandler>,
        config: &DispatchConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.cmd_queue.max(1));
        let (data_tx, data_rx) = mpsc::channel(config.data_queue.max(1));

        tokio::spawn(command_loop(
            handler.clone(),
            cmd_rx,
            config.cmd_workers.max(1),
            cancel.clone(),
        ));
        tokio::spawn(ordered_loop(handler, data_rx, cancel.clone()));

        Self {
            cmd_tx,
            data_tx,
            cancel,
        }
    }

    /// Queue an inbound frame, waiting while its queue is full
    pub async fn dispatch(&self, frame: Frame) -> Result<()> {
        let tx = match route(frame.cmd()) {
            Route::Command => &self.cmd_tx,
            Route::Ordered => &self.data_tx,
            Route::Drop => {
                trace!("Dropping {} from {}", cmd_name(frame.cmd()), frame.src());
                return Ok(());
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::NodeClosed),
            sent = tx.send(frame) => sent.map_err(|_| Error::NodeClosed),
        }
    }
}

async fn command_loop(
    handler: Arc<dyn FrameHandler>,
    mut rx: mpsc::Receiver<Frame>,
    workers: usize,
    cancel: CancellationToken,
) {
    let limit = Arc::new(Semaphore::new(workers));
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = limit.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let handler = handler.clone();
        tokio::spawn(async move {
            handler.handle_frame(frame).await;
            drop(permit);
        });
    }
    debug!("Command dispatch loop stopped");
}

async fn ordered_loop(
    handler: Arc<dyn FrameHandler>,
    mut rx: mpsc::Receiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = handler.handle_frame(frame) => {}
        }
    }
    debug!("Ordered dispatch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Addr, Header, CMD_ALIVE, CMD_PUSH_MESSAGE};
    use bytes::Bytes;
    use std::time::Duration;

    /// Records frames; open-stream requests block until `release` fires.
    #[derive(Default)]
    struct Recorder {
        frames: parking_lot::Mutex<Vec<Frame>>,
        release: CancellationToken,
    }

    #[async_trait]
    impl FrameHandler for Recorder {
        async fn handle_frame(&self, frame: Frame) {
            if frame.cmd() == CMD_OPEN_STREAM {
                self.release.cancelled().await;
            }
            self.frames.lock().push(frame);
        }
    }

    impl Recorder {
        async fn wait_for(&self, n: usize) {
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.frames.lock().len() < n {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("frames not handled in time");
        }
    }

    fn frame(cmd: u8, seq: u16) -> Frame {
        let header = Header::new(cmd, Addr::new(2, 80), Addr::new(1, 1024));
        Frame::new(header, Bytes::copy_from_slice(&seq.to_be_bytes())).unwrap()
    }

    #[test]
    fn test_routes() {
        assert_eq!(route(CMD_OPEN_STREAM), Route::Command);
        assert_eq!(route(ACK_PUSH_STREAM_DATA), Route::Command);
        assert_eq!(route(ACK_PING_DOMAIN), Route::Command);
        assert_eq!(route(CMD_PUSH_STREAM_DATA), Route::Ordered);
        assert_eq!(route(ACK_OPEN_STREAM), Route::Ordered);
        assert_eq!(route(CMD_CLOSE_STREAM), Route::Ordered);
        assert_eq!(route(ACK_CLOSE_STREAM), Route::Ordered);
        assert_eq!(route(CMD_ALIVE), Route::Drop);
        assert_eq!(route(CMD_PUSH_MESSAGE), Route::Drop);
        assert_eq!(route(0x7E), Route::Drop);
    }

    #[tokio::test]
    async fn test_ordered_frames_keep_order() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(
            recorder.clone(),
            &DispatchConfig::default(),
            CancellationToken::new(),
        );

        for seq in 0..100 {
            dispatcher
                .dispatch(frame(CMD_PUSH_STREAM_DATA, seq))
                .await
                .unwrap();
        }
        dispatcher.dispatch(frame(CMD_CLOSE_STREAM, 100)).await.unwrap();
        recorder.wait_for(101).await;

        let frames = recorder.frames.lock();
        for (i, f) in frames.iter().enumerate() {
            assert_eq!(f.payload, Bytes::copy_from_slice(&(i as u16).to_be_bytes()));
        }
        assert_eq!(frames[100].cmd(), CMD_CLOSE_STREAM);
    }

    #[tokio::test]
    async fn test_blocked_command_does_not_stall_data() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(
            recorder.clone(),
            &DispatchConfig::default(),
            CancellationToken::new(),
        );

        dispatcher.dispatch(frame(CMD_OPEN_STREAM, 0)).await.unwrap();
        dispatcher.dispatch(frame(CMD_PUSH_STREAM_DATA, 1)).await.unwrap();
        dispatcher.dispatch(frame(ACK_PING_DOMAIN, 2)).await.unwrap();
        recorder.wait_for(2).await;
        assert!(recorder
            .frames
            .lock()
            .iter()
            .all(|f| f.cmd() != CMD_OPEN_STREAM));

        recorder.release.cancel();
        recorder.wait_for(3).await;
    }

    #[tokio::test]
    async fn test_dropped_commands() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = Dispatcher::new(
            recorder.clone(),
            &DispatchConfig::default(),
            CancellationToken::new(),
        );

        dispatcher.dispatch(frame(CMD_ALIVE, 0)).await.unwrap();
        dispatcher.dispatch(frame(CMD_PUSH_MESSAGE, 0)).await.unwrap();
        dispatcher.dispatch(frame(CMD_PUSH_STREAM_DATA, 7)).await.unwrap();
        recorder.wait_for(1).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(recorder.frames.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_after_cancel() {
        let recorder = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(recorder, &DispatchConfig::default(), cancel.clone());
        cancel.cancel();
        assert!(matches!(
            dispatcher.dispatch(frame(CMD_PUSH_STREAM_DATA, 0)).await,
            Err(Error::NodeClosed)
        ));
    }
}
