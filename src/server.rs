use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::ae_context::AeContext;
use crate::association::Association;
use crate::dispatcher::ServiceRegistry;
use crate::error::DimseError;
use crate::pdu::RejectReason;

/// Accepts associations on a TCP port and serves each of them in its own task.
pub struct Acceptor {
    listener: TcpListener,
    ae: Arc<AeContext>,
    registry: Arc<ServiceRegistry>,
}

impl Acceptor {
    pub async fn bind(
        address: impl ToSocketAddrs,
        ae: Arc<AeContext>,
        registry: ServiceRegistry,
    ) -> Result<Self, DimseError> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            ae,
            registry: Arc::new(registry),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DimseError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// `finite_connections` is only used for testing. It tells the acceptor to stop after a
    /// finite number of connections and wait for their associations to end.
    pub async fn run(
        self,
        finite_connections: Option<usize>,
        shutdown: CancellationToken,
    ) -> Result<(), DimseError> {
        let address = self.listener.local_addr()?;
        tracing::info!(aet = self.ae.ae_title().as_str(), "listening on: tcp://{}", address);
        let limit = Arc::new(Semaphore::new(self.ae.max_associations()));
        let mut tasks = JoinSet::new();
        let mut accepted = 0usize;
        while finite_connections.is_none_or(|n| accepted < n) {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = self.listener.accept() => match incoming {
                    Ok(incoming) => incoming,
                    Err(e) => {
                        tracing::error!(error = %e, "could not accept connection");
                        continue;
                    }
                },
            };
            accepted += 1;
            let ae = Arc::clone(&self.ae);
            let registry = Arc::clone(&self.registry);
            let permit = Arc::clone(&limit).try_acquire_owned();
            tasks.spawn(async move {
                let ulid = ulid::Ulid::new();
                tracing::debug!(connection = %ulid, %peer, "connection accepted");
                let Ok(_permit) = permit else {
                    let reason = RejectReason::LocalLimitExceeded;
                    let e = Association::reject(stream, &ae, reason).await;
                    tracing::warn!(connection = %ulid, %peer, error = %e, "too many associations");
                    return;
                };
                let association = match Association::accept(stream, &ae).await {
                    Ok(association) => association,
                    Err(e) => {
                        tracing::error!(
                            connection = %ulid,
                            %peer,
                            error = %e,
                            "association not established"
                        );
                        return;
                    }
                };
                let id = association.id();
                if let Err(e) = registry.serve(association, ae).await {
                    tracing::error!(association = %id, %peer, error = %e, "association failed");
                }
            });
            while tasks.try_join_next().is_some() {}
        }
        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}
