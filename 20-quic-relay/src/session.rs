//! Session acceptor: turns the streams of one session into dispatcher tasks.

use std::sync::Arc;

use tokio::select;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dispatcher::{Dispatcher, RelayContext};
use crate::hub::StreamHandle;
use crate::transport::Session;

/// Default number of dispatchers one session may run at once.
pub const DEFAULT_MAX_STREAMS_PER_SESSION: usize = 256;

/// Accepts streams from `session` until it fails or `shutdown` fires, running
/// one dispatcher per stream.
///
/// At most `max_streams` dispatchers run concurrently; further streams wait in
/// the transport until one finishes. On exit the session and its remaining
/// streams are closed and every dispatcher it spawned is joined.
pub async fn serve_session<S>(
    session: S,
    ctx: RelayContext,
    max_streams: usize,
    shutdown: CancellationToken,
) where
    S: Session,
{
    let remote = session.remote_label();
    info!(%remote, "session accepted");

    let permits = Arc::new(Semaphore::new(max_streams.max(1)));
    let mut dispatchers = JoinSet::new();
    let mut open_streams: Vec<StreamHandle> = Vec::new();

    loop {
        let permit = select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        select! {
            _ = shutdown.cancelled() => break,
            accepted = session.accept_stream() => match accepted {
                Ok((send, recv)) => {
                    let stream = StreamHandle::new(send);
                    debug!(%remote, stream = %stream.id(), "stream accepted");
                    open_streams.push(stream.clone());
                    let dispatcher = Dispatcher::new(recv, stream, ctx.clone());
                    dispatchers.spawn(async move {
                        dispatcher.run().await;
                        drop(permit);
                    });
                }
                Err(err) => {
                    info!(%remote, error = %err, "session stopped accepting streams");
                    break;
                }
            },
        }

        // Reap finished dispatchers so the set does not grow with the
        // session's lifetime.
        while let Some(finished) = dispatchers.try_join_next() {
            log_dispatcher_exit(&remote, finished);
        }
        open_streams.retain(|stream| !stream.is_closed());
    }

    session.close("closing session");
    for stream in &open_streams {
        stream.close();
    }
    while let Some(finished) = dispatchers.join_next().await {
        log_dispatcher_exit(&remote, finished);
    }
    info!(%remote, "session closed");
}

fn log_dispatcher_exit(remote: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(err) = result {
        warn!(%remote, error = %err, "dispatcher task failed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::dispatcher::DispatchLimits;
    use crate::hub::Hub;
    use crate::store::MemoryBlobStore;
    use crate::transport::memory::session_pair;

    fn context() -> RelayContext {
        RelayContext::new(
            Arc::new(Hub::new()),
            Arc::new(MemoryBlobStore::new()),
            DispatchLimits::default(),
        )
    }

    #[tokio::test]
    async fn acceptor_exits_when_the_session_closes() {
        let (connector, session) = session_pair("peer");
        let task = tokio::spawn(serve_session(
            session,
            context(),
            4,
            CancellationToken::new(),
        ));

        let _stream = connector.open_stream().await.unwrap();
        connector.close();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("acceptor should exit")
            .unwrap();
    }

    #[tokio::test]
    async fn acceptor_exits_on_shutdown_and_joins_dispatchers() {
        let (connector, session) = session_pair("peer");
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_session(session, context(), 4, shutdown.clone()));

        // Keep a stream open with nothing sent; closing the session ends it.
        let (_send, _recv) = connector.open_stream().await.unwrap();
        tokio::task::yield_now().await;
        shutdown.cancel();

        timeout(Duration::from_secs(1), task)
            .await
            .expect("acceptor should exit")
            .unwrap();
    }
}
