//! A channel carrying dynamically typed jobs to a long-lived worker that owns some context.
//!
//! Every node gets one worker thread pinned to its network namespace (see
//! [`crate::namespace`]). That worker owns non-clonable state, an rtnetlink connection opened
//! inside the namespace, and must serve every kind of request the controllers need: installing
//! qdiscs, resolving interface indexes, configuring addresses. Rather than one typed channel per
//! request kind (and thus one thread per kind), jobs are type-erased on submission and the
//! result is downcast back to the type the caller asked for.

use std::{any::Any, future::Future, marker::PhantomData, pin::Pin};

use tokio::sync::{mpsc, oneshot};

/// Trait object alias for a value that is `Any + Send + 'static`.
type AnySendStatic = dyn Any + Send + 'static;

/// A boxed [`Future`] that can be sent across threads.
///
/// Lifetime-parameterized so the future can borrow the worker context.
pub type DynFuture<'a, T = Box<AnySendStatic>> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A boxed job: given `&mut Ctx`, produce a future borrowing it.
pub type DynTask<Ctx, T = Box<AnySendStatic>> =
    Box<dyn for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static>;

/// Errors returned while waiting for a job result.
#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    /// The worker dropped the job without answering, usually because it exited.
    #[error("worker dropped the job before answering")]
    Dropped,
    /// The worker answered with a value of an unexpected type.
    #[error("worker answered with an unexpected type")]
    TypeMismatch,
}

/// A type-erased job together with the channel for its answer.
pub struct DynRequest<Ctx> {
    task: DynTask<Ctx>,
    tx: oneshot::Sender<Box<AnySendStatic>>,
}

impl<Ctx> std::fmt::Debug for DynRequest<Ctx> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynRequest").finish_non_exhaustive()
    }
}

impl<Ctx> DynRequest<Ctx> {
    /// Split the request into the job and its answer channel.
    pub fn into_parts(self) -> (DynTask<Ctx>, oneshot::Sender<Box<AnySendStatic>>) {
        (self.task, self.tx)
    }
}

/// Pending answer of a submitted job. Remembers the concrete type to downcast to.
#[derive(Debug)]
pub struct DynRequestResponse<T: 'static> {
    rx: oneshot::Receiver<Box<AnySendStatic>>,
    _marker: PhantomData<T>,
}

impl<T> DynRequestResponse<T> {
    /// Wait for the worker to finish the job and return its typed result.
    pub async fn receive(self) -> Result<T, ResponseError> {
        let value = self.rx.await.map_err(|_| ResponseError::Dropped)?;
        value.downcast::<T>().map(|v| *v).map_err(|_| ResponseError::TypeMismatch)
    }
}

/// Sending half of a job channel.
#[derive(Debug)]
pub struct DynRequestSender<Ctx> {
    tx: mpsc::Sender<DynRequest<Ctx>>,
}

impl<Ctx> Clone for DynRequestSender<Ctx> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone() }
    }
}

impl<Ctx> DynRequestSender<Ctx> {
    /// Submit a job, given as a function of `&mut Ctx` returning a future.
    ///
    /// Fails only if the worker has gone away.
    ///
    /// # Example
    ///
    /// ```
    /// use netlem::dynch;
    ///
    /// #[derive(Default)]
    /// struct Ctx {
    ///     installed: Vec<u16>,
    /// }
    ///
    /// # tokio_test_block_on(async {
    /// let (tx, mut rx) = dynch::channel::<Ctx>(8);
    ///
    /// tokio::spawn(async move {
    ///     let mut ctx = Ctx::default();
    ///     while let Some(req) = rx.recv().await {
    ///         let (task, tx) = req.into_parts();
    ///         let _ = tx.send(task(&mut ctx).await);
    ///     }
    /// });
    ///
    /// let count = tx
    ///     .submit(|ctx: &mut Ctx| {
    ///         Box::pin(async move {
    ///             ctx.installed.push(2);
    ///             ctx.installed.len()
    ///         })
    ///     })
    ///     .await?
    ///     .receive()
    ///     .await?;
    ///
    /// assert_eq!(count, 1);
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// # });
    /// # fn tokio_test_block_on<F: std::future::Future>(f: F) -> F::Output {
    /// #     let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
    /// #     rt.block_on(f)
    /// # }
    /// ```
    pub async fn submit<T, F>(
        &self,
        f: F,
    ) -> Result<DynRequestResponse<T>, mpsc::error::SendError<()>>
    where
        T: Any + Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        let task: DynTask<Ctx> = Box::new(move |ctx: &mut Ctx| {
            let fut = f(ctx);
            Box::pin(async move { Box::new(fut.await) as Box<AnySendStatic> })
        });

        let (tx, rx) = oneshot::channel();
        self.tx.send(DynRequest { task, tx }).await.map_err(|_| mpsc::error::SendError(()))?;

        Ok(DynRequestResponse { rx, _marker: PhantomData })
    }
}

/// Create a bounded job channel.
pub fn channel<Ctx>(buffer: usize) -> (DynRequestSender<Ctx>, mpsc::Receiver<DynRequest<Ctx>>) {
    let (tx, rx) = mpsc::channel(buffer);
    (DynRequestSender { tx }, rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn jobs_mutate_worker_context_in_order() {
        let (tx, mut rx) = channel::<Vec<&'static str>>(4);

        let worker = tokio::spawn(async move {
            let mut ctx = Vec::new();
            while let Some(req) = rx.recv().await {
                let (task, tx) = req.into_parts();
                let _ = tx.send(task(&mut ctx).await);
            }
            ctx
        });

        let first = tx
            .submit(|ctx: &mut Vec<&'static str>| Box::pin(async move { ctx.push("root") }))
            .await
            .unwrap();
        first.receive().await.unwrap();

        let len = tx
            .submit(|ctx: &mut Vec<&'static str>| {
                Box::pin(async move {
                    ctx.push("class");
                    ctx.len()
                })
            })
            .await
            .unwrap()
            .receive()
            .await
            .unwrap();
        assert_eq!(len, 2);

        drop(tx);
        assert_eq!(worker.await.unwrap(), vec!["root", "class"]);
    }

    #[tokio::test]
    async fn dropped_worker_is_reported() {
        let (tx, rx) = channel::<()>(1);
        drop(rx);

        let res = tx.submit(|_: &mut ()| Box::pin(async move { 1u8 })).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn unanswered_job_is_reported_as_dropped() {
        let (tx, mut rx) = channel::<()>(1);

        tokio::spawn(async move {
            // Take the job and drop it without answering.
            let _ = rx.recv().await;
        });

        let response = tx.submit(|_: &mut ()| Box::pin(async move { 1u8 })).await.unwrap();
        assert!(matches!(response.receive().await, Err(ResponseError::Dropped)));
    }
}
