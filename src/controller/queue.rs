use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::controller::command::{Command, Lane, Reply};
use crate::controller::handler::CommandHandler;
use crate::error::{ColoniesError, Result};

/// Sending half of the two-lane command queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    blocking_tx: mpsc::Sender<Command>,
    background_tx: mpsc::Sender<Command>,
}

/// Receiving half, owned by the single worker.
#[derive(Debug)]
pub struct QueueReceiver {
    blocking_rx: mpsc::Receiver<Command>,
    background_rx: mpsc::Receiver<Command>,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> (Self, QueueReceiver) {
        let capacity = capacity.max(1);
        let (blocking_tx, blocking_rx) = mpsc::channel(capacity);
        let (background_tx, background_rx) = mpsc::channel(capacity);
        (
            Self {
                blocking_tx,
                background_tx,
            },
            QueueReceiver {
                blocking_rx,
                background_rx,
            },
        )
    }

    pub async fn submit(&self, command: Command) -> Result<()> {
        let tx = match command.lane() {
            Lane::Blocking => &self.blocking_tx,
            Lane::Background => &self.background_tx,
        };
        tx.send(command).await.map_err(|_| ColoniesError::QueueClosed)
    }

    /// Enqueue the command built by `make` and wait for its reply.
    pub async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.submit(make(reply)).await?;
        rx.await.map_err(|_| ColoniesError::QueueClosed)?
    }
}

/// Drain both lanes with one worker. Blocking commands always win over
/// background sweeps. On shutdown the queued client commands still run and
/// pending sweeps are answered with `QueueClosed`.
pub async fn run_worker(mut rx: QueueReceiver, handler: CommandHandler, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            Some(command) = rx.blocking_rx.recv() => handler.dispatch(command).await,
            Some(command) = rx.background_rx.recv() => handler.dispatch(command).await,
            else => break,
        }
    }

    rx.blocking_rx.close();
    rx.background_rx.close();
    let mut drained = 0;
    while let Ok(command) = rx.blocking_rx.try_recv() {
        handler.dispatch(command).await;
        drained += 1;
    }
    while let Ok(command) = rx.background_rx.try_recv() {
        command.reject(ColoniesError::QueueClosed);
    }
    tracing::info!(drained, "Command queue worker stopped");
}
