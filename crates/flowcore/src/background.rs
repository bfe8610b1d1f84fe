use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::{EventBus, FlowError, FlowEvent, RunId};

/// Run-scoped context shared by every node of one `Flow::run`: the
/// cancellation token armed with the run deadline, the error sink and the
/// event bus.
#[derive(Debug, Clone)]
pub struct Background {
    run_id: RunId,
    deadline: Duration,
    token: CancellationToken,
    errors: ErrorSink,
    events: EventBus,
}

impl Background {
    /// Create the context for one run and arm its deadline timer.
    ///
    /// Must be called from within a tokio runtime. The returned receiver is
    /// the read side of the error sink.
    pub fn new(
        run_id: RunId,
        deadline: Duration,
        error_buffer: usize,
        events: EventBus,
    ) -> (Self, mpsc::Receiver<FlowError>) {
        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(error_buffer.max(1));

        let timer = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(deadline) => {
                    tracing::debug!(%run_id, ?deadline, "deadline reached, cancelling run");
                    timer.cancel();
                }
                _ = timer.cancelled() => {}
            }
        });

        let background = Self {
            run_id,
            deadline,
            token,
            errors: ErrorSink { tx },
            events,
        };
        (background, rx)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn errors(&self) -> &ErrorSink {
        &self.errors
    }

    pub fn emit(&self, event: FlowEvent) {
        self.events.emit(event);
    }

    /// Resolves once the deadline passes or the run is shut down.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fire the token early, unwinding every port operation still waiting.
    pub fn shutdown(&self) {
        self.token.cancel();
    }
}

/// Write-only side of the run's error channel. Reporting never blocks: when
/// the buffer is full the error is logged and dropped.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<FlowError>,
}

impl ErrorSink {
    pub fn report(&self, error: FlowError) {
        match self.tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!(error = %dropped, "error sink full, dropping");
            }
            Err(TrySendError::Closed(dropped)) => {
                tracing::debug!(error = %dropped, "run already finished, dropping error");
            }
        }
    }
}
