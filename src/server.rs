//! TCP front end and broker lifecycle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::context::ServerContext;
use crate::fanout::{Bus as _, BusRx};
use crate::packet::Publish;
use crate::session;
use crate::transport::Codec;
use crate::types::{ClientId, Id, QoS};
use crate::Result;

/// Accept loop plus ordered shutdown.
///
/// [`MqttServer::close`] is idempotent: the first call stops accepting,
/// closes every live session in parallel (each bounded by the shutdown
/// timeout), stops the retry sweeper and closes the bus; later calls
/// return immediately.
#[derive(Clone)]
pub struct MqttServer {
    inner: Arc<MqttServerInner>,
}

struct MqttServerInner {
    scx: ServerContext,
    codec: Arc<dyn Codec>,
    shutdown: Notify,
    closed: AtomicBool,
}

impl MqttServer {
    pub fn new(scx: ServerContext, codec: Arc<dyn Codec>) -> Self {
        Self { inner: Arc::new(MqttServerInner { scx, codec, shutdown: Notify::new(), closed: AtomicBool::new(false) }) }
    }

    #[inline]
    pub fn context(&self) -> &ServerContext {
        &self.inner.scx
    }

    /// Binds the listener and serves connections until [`close`].
    ///
    /// [`close`]: MqttServer::close
    pub async fn serve(&self) -> Result<()> {
        let scx = self.inner.scx.clone();
        scx.bus.ready().await?;
        let (bus_tx, bus_rx) = futures::channel::mpsc::unbounded();
        scx.bus.subscribe("#", bus_tx).await?;
        self.spawn_bus_ingress(bus_rx);
        scx.retry.start();

        let listener = TcpListener::bind(scx.settings.laddr).await?;
        log::info!("mqtt broker listening on {}", scx.settings.laddr);
        loop {
            if self.inner.closed.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote_addr)) => {
                        log::debug!("accepted connection from {remote_addr}");
                        let stream = self.inner.codec.bind(stream, remote_addr);
                        let scx = scx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session::process(scx, stream, Some(remote_addr)).await {
                                log::info!("session ended, remote: {remote_addr}, {e:?}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("accept failure, {e:?}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
        log::info!("mqtt broker stopped accepting connections");
        Ok(())
    }

    /// Routes messages handed back by the bus to local subscribers.
    fn spawn_bus_ingress(&self, mut bus_rx: BusRx) {
        let scx = self.inner.scx.clone();
        tokio::spawn(async move {
            let from = Id::new(ClientId::from_static("bus"), None, None);
            while let Some((topic, payload)) = bus_rx.next().await {
                let publish = Publish::new(topic, QoS::AtMostOnce, payload);
                if let Err(e) = scx.shared.forwards(&scx, from.clone(), publish).await {
                    log::warn!("bus ingress forward failed, {e:?}");
                }
            }
        });
    }

    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        log::info!("mqtt broker closing");
        // notify_one leaves a permit, so an accept loop that has not
        // reached its select yet still observes the shutdown
        self.inner.shutdown.notify_one();

        let scx = &self.inner.scx;
        let timeout = scx.settings.shutdown_timeout();
        let closes = scx
            .shared
            .client_ids()
            .into_iter()
            .map(|client_id| {
                let scx = scx.clone();
                async move {
                    if !scx.shared.close_session(&client_id, timeout).await {
                        log::warn!("session did not confirm shutdown, client_id: {client_id}");
                    }
                }
            })
            .collect::<Vec<_>>();
        futures::future::join_all(closes).await;

        scx.retry.stop();
        scx.bus.close().await?;
        log::info!("mqtt broker closed");
        Ok(())
    }
}
