use anyhow::Context;
use async_trait::async_trait;
use futures::{future::try_join_all, Future};
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Flatten a JoinHandle result.
///
/// Flattens the two types of errors that can occur when awaiting a handle.
/// Useful when using tokio::try_join! to await multiple handles.
pub async fn flatten_handle<T>(handle: JoinHandle<anyhow::Result<T>>) -> anyhow::Result<T> {
    match handle.await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(err)) => Err(err)?,
        Err(err) => Err(err).context("handling failed")?,
    }
}

/// A long-running component of the service. Tasks run until they fail or the
/// shutdown token is cancelled.
#[async_trait]
pub trait Task: Sync + Send + 'static {
    async fn run(self: Box<Self>, shutdown_token: CancellationToken) -> anyhow::Result<()>;
}

/// Spawns the given tasks and runs until either one of them exits or the
/// signal future resolves, then cancels the shutdown token and waits for
/// every task to finish its cleanup.
pub async fn spawn_tasks_with_shutdown<T, R, E>(
    tasks: impl IntoIterator<Item = Box<dyn Task>>,
    signal: T,
) where
    T: Future<Output = Result<R, E>> + Send + 'static,
    E: std::fmt::Debug,
{
    let (shutdown_scope, mut shutdown_wait) = mpsc::channel::<()>(1);
    let shutdown_token = CancellationToken::new();
    let mut shutdown_scope = Some(shutdown_scope);

    let handles = tasks
        .into_iter()
        .map(|task| {
            let st = shutdown_token.clone();
            let ss = shutdown_scope.clone();
            tokio::spawn(async move {
                let ret = task.run(st).await;
                drop(ss);
                ret
            })
        })
        .collect::<Vec<_>>();
    tokio::select! {
        res = try_join_all(handles.into_iter().map(flatten_handle)) => {
            error!("Task exited unexpectedly: {res:?}");
        }
        res = signal => {
            match res {
                Ok(_) => {
                    info!("Received signal, shutting down");
                }
                Err(err) => {
                    error!("Error while waiting for signal: {err:?}");
                }
            }
        }
    }

    shutdown_token.cancel();
    shutdown_scope.take();
    shutdown_wait.recv().await;
}
