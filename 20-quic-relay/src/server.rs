//! The relay server: a QUIC endpoint, the shared hub, and the eviction sweep.

use std::future::{Future, IntoFuture};
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use quinn::{Endpoint, Incoming, VarInt};
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RelayConfig;
use crate::dispatcher::RelayContext;
use crate::hub::Hub;
use crate::session::serve_session;
use crate::store::BlobStore;
use crate::sweeper::{SweepSettings, spawn_sweeper};
use crate::transport::quic::{QuicSession, TlsIdentity, bind_endpoint};

pub struct RelayServer {
    endpoint: Endpoint,
    ctx: RelayContext,
    sweep: SweepSettings,
    max_streams_per_session: usize,
}

impl RelayServer {
    /// Binds the endpoint described by `config`. Nothing is accepted until
    /// [`RelayServer::run_until`] is polled.
    pub fn bind(
        config: &RelayConfig,
        identity: &TlsIdentity,
        store: Arc<dyn BlobStore>,
    ) -> Result<Self> {
        let endpoint = bind_endpoint(config.listen, identity)?;
        Ok(Self {
            endpoint,
            ctx: RelayContext::new(Arc::new(Hub::new()), store, config.limits),
            sweep: config.sweep,
            max_streams_per_session: config.max_streams_per_session,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn hub(&self) -> Arc<Hub> {
        Arc::clone(&self.ctx.hub)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let RelayServer {
            endpoint,
            ctx,
            sweep,
            max_streams_per_session,
        } = self;
        tokio::pin!(shutdown);

        let stop = CancellationToken::new();
        let sweeper = spawn_sweeper(Arc::clone(&ctx.hub), sweep, stop.clone());
        let mut sessions = JoinSet::new();

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                incoming = endpoint.accept() => match incoming {
                    Some(incoming) => {
                        sessions.spawn(handle_incoming(
                            incoming,
                            ctx.clone(),
                            max_streams_per_session,
                            stop.clone(),
                        ));
                    }
                    None => {
                        info!("endpoint closed");
                        break;
                    }
                },
                Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(err) = finished {
                        warn!(error = %err, "session task failed");
                    }
                }
            }
        }

        stop.cancel();
        endpoint.close(VarInt::from_u32(0), b"server shutting down");
        while let Some(finished) = sessions.join_next().await {
            if let Err(err) = finished {
                warn!(error = %err, "session task failed");
            }
        }
        if let Err(err) = sweeper.await {
            warn!(error = %err, "sweeper task failed");
        }
        endpoint.wait_idle().await;
        info!("relay stopped");
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn handle_incoming(
    incoming: Incoming,
    ctx: RelayContext,
    max_streams: usize,
    shutdown: CancellationToken,
) {
    let remote = incoming.remote_address();
    let connection = select! {
        _ = shutdown.cancelled() => return,
        connecting = incoming.into_future() => match connecting {
            Ok(connection) => connection,
            Err(err) => {
                warn!(%remote, error = %err, "handshake failed");
                return;
            }
        },
    };
    serve_session(QuicSession::new(connection), ctx, max_streams, shutdown).await;
}
