use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

/// Handle to a spawned task. Awaiting it yields the task's output; a panicked task resumes the
/// panic on the awaiting task.
#[derive(Debug)]
pub(crate) struct AsyncJoinHandle<T>(tokio::task::JoinHandle<T>);

impl<T> AsyncJoinHandle<T> {
    pub(crate) fn new(handle: tokio::task::JoinHandle<T>) -> Self {
        Self(handle)
    }

    /// Abort the task; it stops at its next suspension point.
    #[allow(dead_code)]
    pub(crate) fn abort(&self) {
        self.0.abort()
    }
}

impl<T> Future for AsyncJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx).map(|result| match result {
            Ok(output) => output,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => panic!("joined task failed: {}", e),
        })
    }
}
