use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    credential::ServerCredential,
    handshake::HandshakeEngine,
    message::{frame_reader, frame_writer},
    registry::Registry,
    session::{BoxedReader, BoxedWriter, DeliveryPolicy, Session, SessionHandle, SessionState},
};

/// Accepts connections, runs the handshake and starts one task per session.
pub struct Listener {
    listener: TcpListener,
    engine: HandshakeEngine,
    registry: Registry,
    policy: DeliveryPolicy,
}

impl Listener {
    pub fn new(listener: TcpListener, credential: Arc<ServerCredential>) -> Self {
        Self {
            listener,
            engine: HandshakeEngine::new(credential),
            registry: Registry::new(),
            policy: DeliveryPolicy::default(),
        }
    }

    pub fn with_delivery_policy(mut self, policy: DeliveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    /// Serves until `shutdown` resolves, then closes every registered session.
    ///
    /// The handshake runs on the accept path, so one slow handshake delays the
    /// next accept; shutdown abandons a handshake still in flight.
    ///
    /// A broadcast holds the registry lock while it writes to each peer, and
    /// closing the sessions takes the same lock. A peer that stops reading can
    /// therefore stall a broadcast, and shutdown waits behind it.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Listener {
            listener,
            engine,
            registry,
            policy,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => break,
                session = accept_next(&listener, &engine, &registry, policy) => {
                    if let Some(session) = session {
                        start_session(session, &registry).await;
                    }
                }
            }
        }

        drop(listener);
        handle_shutdown(&registry).await;
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

async fn accept_next(
    listener: &TcpListener,
    engine: &HandshakeEngine,
    registry: &Registry,
    policy: DeliveryPolicy,
) -> Option<Session> {
    match listener.accept().await {
        Ok((stream, peer)) => authenticate(stream, peer, engine, registry, policy).await,
        Err(err) => {
            warn!(error = ?err, "failed to accept connection");
            None
        }
    }
}

async fn authenticate(
    stream: TcpStream,
    peer: SocketAddr,
    engine: &HandshakeEngine,
    registry: &Registry,
    policy: DeliveryPolicy,
) -> Option<Session> {
    let id = registry.next_id();
    debug!(id, %peer, state = ?SessionState::Handshaking, "connection accepted");

    let (reader, writer) = stream.into_split();
    let reader: BoxedReader = Box::new(reader);
    let writer: BoxedWriter = Box::new(writer);
    let mut reader = frame_reader(reader);
    let mut writer = frame_writer(writer);

    match engine.accept(&mut reader, &mut writer).await {
        Ok(established) => {
            info!(id, %peer, username = %established.username, "just connected");
            let handle = Arc::new(SessionHandle::new(
                id,
                established.username,
                Some(peer),
                writer,
                established.sealer,
                policy,
            ));
            Some(Session::new(handle, reader, established.opener, registry.clone()))
        }
        Err(err) => {
            warn!(id, %peer, step = %err.step(), error = %err, "invalid handshake");
            None
        }
    }
}

async fn start_session(session: Session, registry: &Registry) {
    if !registry.add(Arc::clone(session.handle())).await {
        warn!(id = session.handle().id(), "session could not be registered");
        session.handle().close().await;
        return;
    }
    tokio::spawn(session.run());
}

async fn handle_shutdown(registry: &Registry) {
    let sessions = registry.handles().await;
    info!(sessions = sessions.len(), "server shutting down");
    for session in sessions {
        session.close().await;
    }
}
