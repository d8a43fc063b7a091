//! The launch service loop.
//!
//! Reads [`LaunchRequest`]s from [`PortId::LAUNCH`] and runs each launch in
//! its own task, so a slow exec retry never holds up other callers.

use std::sync::Arc;

use fleet_host::Host;
use fleet_id::PortId;
use fleet_proto::{reply_message, LaunchRequest, LaunchResult, Protocol, ServiceError};
use fleet_transport::{PortReader, Transport, WireMessage};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use crate::config::LaunchConfig;
use crate::error::LaunchError;
use crate::launcher::Launcher;

/// Serves launch requests.
pub struct LaunchService<T: Transport + Clone + 'static> {
    launcher: Arc<Launcher<T>>,
    transport: T,
    inbox: PortReader,
}

impl<T: Transport + Clone + 'static> LaunchService<T> {
    pub fn bind(host: Arc<dyn Host>, transport: T, config: &LaunchConfig) -> Result<Self, LaunchError> {
        let launcher = Launcher::new(host, transport.clone(), config);
        Self::bind_port(launcher, transport, PortId::LAUNCH)
    }

    pub fn bind_port(launcher: Launcher<T>, transport: T, port: PortId) -> Result<Self, LaunchError> {
        let inbox = transport.open(port)?;
        Ok(Self {
            launcher: Arc::new(launcher),
            transport,
            inbox,
        })
    }

    /// Runs until shutdown. Launches still in flight are aborted; their
    /// new allocations are released by the allocation guard.
    #[instrument(skip_all)]
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), LaunchError> {
        info!(port = %self.inbox.port(), "Starting launch service");
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                frame = self.inbox.read() => {
                    match frame {
                        Some(Ok(message)) => self.dispatch(message, &mut tasks),
                        Some(Err(e)) => warn!(error = %e, "Dropping malformed frame"),
                        None => {
                            info!("Launch port closed");
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Launch task panicked");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(in_flight = tasks.len(), "Launch service shutting down");
        tasks.shutdown().await;
        Ok(())
    }

    fn dispatch(&self, message: WireMessage, tasks: &mut JoinSet<()>) {
        let reply_to = message.response_port;
        let request = match LaunchRequest::from_message(message) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejecting undecodable request");
                if let Some(port) = reply_to {
                    reply(&self.transport, port, &Err(ServiceError::from(e)));
                }
                return;
            }
        };

        if let Some(port) = reply_to {
            if !self.transport.is_open(port) {
                debug!(%port, "Skipping abandoned launch");
                return;
            }
        }

        let launcher = Arc::clone(&self.launcher);
        let transport = self.transport.clone();
        tasks.spawn(async move {
            let LaunchRequest::Launch(args) = request;
            let owns_allocation = args.allocation.is_none();
            let result = launcher.launch(args).await.map_err(ServiceError::from);

            let Some(port) = reply_to else {
                return;
            };
            if !reply(&transport, port, &result) {
                if let Ok(launched) = &result {
                    launcher.abandon(launched, owns_allocation).await;
                }
            }
        });
    }
}

/// Sends a reply. Returns false if the caller is gone.
fn reply<T: Transport>(
    transport: &T,
    port: PortId,
    result: &Result<LaunchResult, ServiceError>,
) -> bool {
    let message = match reply_message(result) {
        Ok(message) => message,
        Err(e) => {
            error!(error = %e, "Failed to encode reply");
            return true;
        }
    };
    match transport.try_send(port, message) {
        Ok(()) => true,
        Err(e) => {
            debug!(%port, error = %e, "Reply not delivered");
            !e.is_closed()
        }
    }
}
