use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, warn};

use crate::common::{LodeError, Result};
use crate::pager::Pager;

use super::{CheckpointMode, CheckpointResult};

/// A checkpoint request for the background worker
pub struct CheckpointRequest {
    pub mode: CheckpointMode,
    /// Receives the outcome when the caller waits for it
    pub reply: Option<Sender<Result<CheckpointResult>>>,
}

/// CheckpointWorker runs checkpoints on a background thread.
///
/// The worker owns its own pager connection, so it coordinates with
/// foreground connections through the same locks and read marks they use
/// and never copies frames a reader still needs.
pub struct CheckpointWorker {
    request_sender: Sender<CheckpointRequest>,
    shutdown: Arc<AtomicBool>,
    worker_handle: Option<JoinHandle<()>>,
}

impl CheckpointWorker {
    /// Spawns the worker thread around `pager`.
    pub fn new(pager: Pager) -> Self {
        let (sender, receiver) = bounded::<CheckpointRequest>(128);
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_clone = Arc::clone(&shutdown);
        let worker_handle = thread::spawn(move || {
            Self::start_worker_thread(pager, receiver, shutdown_clone);
        });

        Self {
            request_sender: sender,
            shutdown,
            worker_handle: Some(worker_handle),
        }
    }

    /// Queues a checkpoint without waiting for it.
    pub fn schedule(&self, mode: CheckpointMode) -> Result<()> {
        self.request_sender
            .send(CheckpointRequest { mode, reply: None })
            .map_err(|_| LodeError::Misuse("checkpoint worker has shut down"))
    }

    /// Queues a checkpoint and waits for its result.
    pub fn checkpoint_sync(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        let (tx, rx) = bounded(1);
        self.request_sender
            .send(CheckpointRequest {
                mode,
                reply: Some(tx),
            })
            .map_err(|_| LodeError::Misuse("checkpoint worker has shut down"))?;

        rx.recv()
            .map_err(|_| LodeError::Misuse("checkpoint worker stopped before replying"))?
    }

    fn start_worker_thread(
        pager: Pager,
        receiver: Receiver<CheckpointRequest>,
        shutdown: Arc<AtomicBool>,
    ) {
        loop {
            if shutdown.load(Ordering::Relaxed) {
                while let Ok(request) = receiver.try_recv() {
                    Self::process_request(&pager, request);
                }
                break;
            }

            match receiver.recv_timeout(Duration::from_millis(100)) {
                Ok(request) => Self::process_request(&pager, request),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("checkpoint worker stopped");
    }

    fn process_request(pager: &Pager, request: CheckpointRequest) {
        let result = pager.checkpoint(request.mode);
        match request.reply {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => {
                if let Err(e) = result {
                    warn!(mode = %request.mode, error = %e, "background checkpoint failed");
                }
            }
        }
    }
}

impl Drop for CheckpointWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
