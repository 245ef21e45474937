//! Network-namespace scoped execution.
//!
//! Entering a namespace with `setns` changes the namespace of the calling OS thread, so code
//! that must run inside a node's namespace cannot simply be awaited on the caller's runtime.
//! A [`NetworkNamespace`] owns a dedicated OS thread that enters the namespace once and then
//! serves jobs for that namespace only, on its own single-threaded runtime. The thread never
//! switches back; dropping the handle closes the job channel and ends the thread.

use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use nix::sched::CloneFlags;
use tokio::sync::oneshot;
use tracing::Instrument as _;

use crate::dynch::{self, DynFuture, DynRequestSender, ResponseError};

/// Capacity of the job channel of a namespace worker.
const JOB_CHANNEL_CAPACITY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("nix error: {0}")]
    Nix(#[from] nix::Error),
    #[error("namespace worker for {} exited", .0.display())]
    WorkerExited(PathBuf),
    #[error(transparent)]
    Response(#[from] ResponseError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Path of a named network namespace, as created by `ip netns add`.
pub fn named_path(name: &str) -> PathBuf {
    Path::new("/run").join("netns").join(name)
}

/// A worker thread living inside a network namespace and owning a context of type `Ctx`.
#[derive(Debug)]
pub struct NetworkNamespace<Ctx> {
    path: PathBuf,
    file: File,
    tx: DynRequestSender<Ctx>,
}

impl<Ctx: Send + 'static> NetworkNamespace<Ctx> {
    /// Enter the namespace at `path` on a new thread and build the worker context there.
    ///
    /// `make_ctx` runs inside the namespace, on the worker's runtime, so anything it opens
    /// (e.g. an rtnetlink socket) is bound to the namespace. Returns once the context is ready,
    /// or with the error that prevented it.
    pub async fn open<F>(path: impl Into<PathBuf>, make_ctx: F) -> Result<Self>
    where
        F: FnOnce() -> io::Result<Ctx> + Send + 'static,
    {
        let path = path.into();
        let file = File::open(&path)?;
        let thread_file = file.try_clone()?;

        let (tx, mut rx) = dynch::channel::<Ctx>(JOB_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let thread_name = format!(
            "netns-{}",
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default()
        );
        let span_path = path.clone();

        std::thread::Builder::new().name(thread_name).spawn(move || {
            let span = tracing::debug_span!("netns", path = %span_path.display());

            let setup = || -> Result<tokio::runtime::Runtime> {
                nix::sched::setns(thread_file.as_fd(), CloneFlags::CLONE_NEWNET)?;
                Ok(tokio::runtime::Builder::new_current_thread().enable_all().build()?)
            };

            let rt = match setup() {
                Ok(rt) => rt,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            rt.block_on(
                async move {
                    let mut ctx = match make_ctx() {
                        Ok(ctx) => ctx,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e.into()));
                            return;
                        }
                    };
                    if ready_tx.send(Ok(())).is_err() {
                        return;
                    }

                    tracing::debug!("namespace worker ready");
                    while let Some(req) = rx.recv().await {
                        let (task, tx) = req.into_parts();
                        let res = task(&mut ctx).await;
                        if tx.send(res).is_err() {
                            tracing::error!("failed to send back job response, rx dropped");
                        }
                    }
                    tracing::debug!("namespace worker exiting");
                }
                .instrument(span),
            );
        })?;

        ready_rx.await.map_err(|_| Error::WorkerExited(path.clone()))??;

        Ok(Self { path, file, tx })
    }

    /// Run `f` inside the namespace with exclusive access to the worker context.
    pub async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'a> FnOnce(&'a mut Ctx) -> DynFuture<'a, T> + Send + 'static,
    {
        let response =
            self.tx.submit(f).await.map_err(|_| Error::WorkerExited(self.path.clone()))?;
        Ok(response.receive().await?)
    }

    /// The namespace file this worker entered.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw file descriptor of the namespace, usable to move links into it.
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
