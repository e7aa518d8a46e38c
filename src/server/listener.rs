//! Daemon entry: listener, upstream bring-up, and lifecycle tasks.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::Result;
use crate::events::{EventSender, LoggedEvent};
use crate::routing::MessageDirector;
use crate::server::connection::{Connection, ConnectionTuning};
use crate::server::upstream;

/// How often terminated participants are destroyed in threaded mode.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);

/// The routing daemon.
pub struct MdServer {
    config: Config,
    director: MessageDirector,
    next_session_id: AtomicU64,
    bound_addr: OnceLock<SocketAddr>,
}

impl MdServer {
    /// Build the daemon around a validated configuration. Fails if the
    /// event sink target cannot be resolved.
    pub fn new(config: Config) -> Result<Self> {
        let events = EventSender::new(config.eventlogger.as_deref())?;
        let director = MessageDirector::new(config.messagedirector.threaded, events);
        Ok(Self {
            config,
            director,
            next_session_id: AtomicU64::new(1),
            bound_addr: OnceLock::new(),
        })
    }

    pub fn director(&self) -> &MessageDirector {
        &self.director
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Address the listener actually bound, once it has.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.bound_addr.get().copied()
    }

    /// Run until the process is killed.
    pub async fn run(&self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Run until `shutdown` resolves, then stop the worker pool and drain.
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        tracing::info!(
            name = %self.config.daemon.name,
            url = %self.config.daemon.url,
            "Message director starting"
        );

        // Parent link comes up first so the earliest subscription from a
        // downstream peer already replicates.
        if let Some(addr) = self.config.connect_addr()? {
            let link = upstream::connect(addr, self.director.clone(), self.tuning()).await?;
            self.director.set_upstream(link);
        }

        self.director.start_workers();

        let sweep_handle = if self.config.messagedirector.threaded {
            let director = self.director.clone();
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    director.sweep_terminated();
                }
            }))
        } else {
            None
        };

        let listener = match self.config.bind_addr()? {
            Some(addr) => {
                // Bind failure (address in use, address not available) is
                // fatal; the caller exits the process.
                let listener = TcpListener::bind(addr).await.map_err(|e| {
                    tracing::error!(addr = %addr, error = %e, "Failed to bind listener");
                    e
                })?;
                let bound = listener.local_addr()?;
                let _ = self.bound_addr.set(bound);
                tracing::info!(addr = %bound, "Listening for routing peers");
                Some(listener)
            }
            None => None,
        };

        self.emit_startup_event();

        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("Shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(listener.as_ref()) => result,
        };

        if let Some(handle) = sweep_handle {
            handle.abort();
        }
        self.director.shutdown();
        result
    }

    async fn accept_loop(&self, listener: Option<&TcpListener>) -> Result<()> {
        let Some(listener) = listener else {
            // Leaf configuration with no listener: nothing to accept, the
            // upstream pump and any in-process participants carry on.
            std::future::pending::<()>().await;
            unreachable!();
        };

        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session_id, peer = %peer_addr, "New connection");

        if let Err(e) = configure_socket(&socket) {
            tracing::debug!(session_id, error = %e, "Failed to tune socket");
        }

        let connection = Connection::new(
            session_id,
            socket,
            peer_addr,
            self.director.clone(),
            self.tuning(),
            self.config.messagedirector.haproxy,
        );

        tokio::spawn(async move {
            if let Err(e) = connection.run().await {
                tracing::debug!(session_id, error = %e, "Connection error");
            }
        });
    }

    fn tuning(&self) -> ConnectionTuning {
        ConnectionTuning::from_config(&self.config.messagedirector)
    }

    fn emit_startup_event(&self) {
        let mut event = LoggedEvent::new("daemon-start", &self.config.daemon.name);
        if !self.config.daemon.url.is_empty() {
            event.add("url", &self.config.daemon.url);
        }
        self.director.events().send_event(&event);
    }
}

/// Low-latency keepalive tuning applied to every peer socket.
pub(crate) fn configure_socket(socket: &TcpStream) -> std::io::Result<()> {
    socket.set_nodelay(true)?;
    socket2::SockRef::from(socket).set_keepalive(true)?;
    Ok(())
}
