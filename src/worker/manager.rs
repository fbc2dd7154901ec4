//! # Connection Manager
//!
//! Owns a fixed pool of [`Worker`]s plus the accept loop on a listening
//! socket. New connections — inbound or locally originated — are always
//! assigned to the least-loaded worker, measured by live-connection count.
//!
//! Accepted sockets are detached from the accept loop's runtime and
//! re-registered on the owning worker's runtime, so all I/O for a connection
//! happens on exactly one worker thread.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};

use crate::config::{CONNECT_TIMEOUT, UNAUTHENTICATED_TIMEOUT};
use crate::connection::inbound::{DemuxRegistry, Demultiplexer};
use crate::connection::outbound::connect_outbound;
use crate::error::Result;
use crate::transport::channel::{ChannelOptions, ChannelState, PacketBundleChannel};
use crate::transport::tls::{RemoteAddress, TlsTransport};
use crate::worker::{ConnectionHandle, Signal, Worker};

/// Fixed pool of connection workers plus the accept loop.
pub struct ConnectionManager {
    workers: Vec<Worker>,
}

impl ConnectionManager {
    /// Spawn `worker_count` workers, each with its own OS thread.
    pub fn new(worker_count: usize) -> Result<Self> {
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            workers.push(Worker::spawn(index)?);
        }
        Ok(Self { workers })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Live-connection count per worker, in worker order.
    pub fn loads(&self) -> Vec<usize> {
        self.workers.iter().map(Worker::load).collect()
    }

    fn least_loaded(&self) -> Option<&Worker> {
        self.workers.iter().min_by_key(|worker| worker.load())
    }

    /// Build a connection task on the least-loaded worker. Returns false if
    /// no worker exists or the pool has shut down.
    pub fn add<F, Fut>(&self, timeout: Option<Duration>, task: F) -> bool
    where
        F: FnOnce(Arc<ConnectionHandle>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        match self.least_loaded() {
            Some(worker) => worker.add_connection(timeout, task),
            None => false,
        }
    }

    /// Register a locally originated connection: resolve and connect to
    /// `remote` on a worker, then drive the state `install` produces.
    pub fn add_outbound<F>(
        &self,
        remote: RemoteAddress,
        transport: Arc<dyn TlsTransport>,
        options: ChannelOptions,
        install: F,
    ) -> bool
    where
        F: FnOnce() -> Box<dyn ChannelState> + Send + 'static,
    {
        self.add(Some(CONNECT_TIMEOUT), move |handle| async move {
            let mut channel = connect_outbound(&remote, &transport, options).await?;
            channel.install(install());
            channel.drive(&handle).await
        })
    }

    /// Accept loop: every inbound socket becomes a channel on the
    /// least-loaded worker, starting life behind the header demultiplexer
    /// with the unauthenticated-connection deadline applied.
    ///
    /// Runs until `signal` is marked for shutdown.
    pub async fn serve(
        &self,
        listener: TcpListener,
        transport: Arc<dyn TlsTransport>,
        options: ChannelOptions,
        registry: Arc<DemuxRegistry>,
        signal: Signal,
    ) -> Result<()> {
        match listener.local_addr() {
            Ok(addr) => info!(address = %addr, "accepting connections"),
            Err(_) => info!("accepting connections"),
        }

        loop {
            tokio::select! {
                _ = signal.notified() => {
                    if signal.is_marked() {
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            self.admit_inbound(stream, peer, &transport, options, &registry);
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }

        info!("accept loop stopped");
        signal.complete_shutdown();
        Ok(())
    }

    fn admit_inbound(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        transport: &Arc<dyn TlsTransport>,
        options: ChannelOptions,
        registry: &Arc<DemuxRegistry>,
    ) {
        // Detach from this runtime; the owning worker re-registers it.
        let std_stream = match stream.into_std() {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%peer, error = %e, "failed to detach accepted socket");
                return;
            }
        };

        let transport = transport.clone();
        let registry = registry.clone();
        let admitted = self.add(Some(UNAUTHENTICATED_TIMEOUT), move |handle| async move {
            let stream = TcpStream::from_std(std_stream)?;
            let mut channel = PacketBundleChannel::accept(stream, peer, &transport, options).await?;
            channel.install(Box::new(Demultiplexer::new(registry)));
            channel.drive(&handle).await
        });

        if !admitted {
            warn!(%peer, "no workers available; dropping connection");
        }
    }

    /// Shut every worker down: close all connections, grant the grace
    /// period, then join the threads.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.begin_shutdown();
        }
        for worker in self.workers {
            worker.join();
        }
    }
}
