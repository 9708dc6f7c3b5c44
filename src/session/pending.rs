use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::SessionError;

/// Result of a session operation that completes on the coordinator thread.
///
/// Await it from async code, or call [`Pending::wait`] from a plain thread.
/// If the coordinator goes away first, it resolves to
/// [`SessionError::Terminated`].
#[must_use = "a pending result does nothing unless awaited or waited on"]
#[derive(Debug)]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, SessionError>>,
}

/// Coordinator side of a [`Pending`]. Resolving consumes it, so each
/// operation completes at most once.
#[derive(Debug)]
pub(crate) struct Responder<T> {
    tx: oneshot::Sender<Result<T, SessionError>>,
}

pub(crate) fn pending<T>() -> (Responder<T>, Pending<T>) {
    let (tx, rx) = oneshot::channel();
    (Responder { tx }, Pending { rx })
}

impl<T> Responder<T> {
    pub(crate) fn resolve(self, result: Result<T, SessionError>) {
        if self.tx.send(result).is_err() {
            tracing::trace!("Caller dropped pending result before it resolved");
        }
    }
}

impl<T> Pending<T> {
    /// An already-resolved result, used for synchronous rejections.
    pub fn resolved(result: Result<T, SessionError>) -> Self {
        let (responder, pending) = pending();
        responder.resolve(result);
        pending
    }

    /// Block the current thread until the result is available.
    ///
    /// Must not be called from within an async runtime; `.await` instead.
    pub fn wait(self) -> Result<T, SessionError> {
        self.rx
            .blocking_recv()
            .unwrap_or(Err(SessionError::Terminated))
    }

    /// Non-blocking check. `None` while the operation is still running.
    pub fn try_result(&mut self) -> Option<Result<T, SessionError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(SessionError::Terminated)),
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, SessionError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(SessionError::Terminated)))
    }
}
