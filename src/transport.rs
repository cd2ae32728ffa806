//! TCP plumbing: datagram-style outbound sends and the inbound listener.
//!
//! Every message rides its own connection — connect, write one line, close.
//! Sends have a hard 2-second deadline and swallow every failure; the
//! protocol's timeouts own recovery. The socket layer is abstracted behind
//! [`NetStack`] so simulations can substitute their own network.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{info, trace, warn};

use crate::codec::WireCodec;
use crate::config::{MemberId, Membership};
use crate::engine::{Engine, Transport};
use crate::messages::Message;
use crate::profile::Profile;

/// Hard deadline for one outbound connect + write.
const SEND_DEADLINE: Duration = Duration::from_secs(2);

/// Inbound handler concurrency.
const WORKERS: usize = 4;

/// The socket layer. Mirrors the small slice of `tokio::net` the transport
/// uses, so tests can swap in a simulated network.
pub trait NetStack: Clone + Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;
    type Listener: Send + 'static;

    fn bind(&self, port: u16) -> impl Future<Output = io::Result<Self::Listener>> + Send;
    fn accept(
        &self,
        listener: &mut Self::Listener,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
    fn connect(
        &self,
        host: &str,
        port: u16,
    ) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// The real tokio sockets.
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioNet;

impl NetStack for TokioNet {
    type Stream = TcpStream;
    type Listener = TcpListener;

    async fn bind(&self, port: u16) -> io::Result<TcpListener> {
        TcpListener::bind(("0.0.0.0", port)).await
    }

    async fn accept(&self, listener: &mut TcpListener) -> io::Result<TcpStream> {
        listener.accept().await.map(|(stream, _)| stream)
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

/// One connection per message, 2-second deadline, no error propagation.
/// A failed send is indistinguishable from a lost datagram, by design of the
/// protocol above it.
pub struct TcpTransport<N: NetStack> {
    net: N,
    members: Arc<Membership>,
}

impl<N: NetStack> Clone for TcpTransport<N> {
    fn clone(&self) -> Self {
        Self {
            net: self.net.clone(),
            members: Arc::clone(&self.members),
        }
    }
}

impl<N: NetStack> TcpTransport<N> {
    #[must_use]
    pub fn new(net: N, members: Arc<Membership>) -> Self {
        Self { net, members }
    }
}

impl<N: NetStack> Transport for TcpTransport<N> {
    async fn send(&self, to: MemberId, message: Message) {
        let Some(addr) = self.members.addr(to) else {
            trace!(%to, "no address for peer, dropping");
            return;
        };
        let kind = message.kind();
        let attempt = tokio::time::timeout(SEND_DEADLINE, async {
            let stream = self.net.connect(&addr.host, addr.port).await?;
            let mut framed = FramedWrite::new(stream, WireCodec);
            framed.send(message).await?;
            framed.close().await
        })
        .await;
        match attempt {
            Ok(Ok(())) => trace!(%to, kind, "sent"),
            Ok(Err(error)) => trace!(%to, kind, %error, "send failed, dropping"),
            Err(_) => trace!(%to, kind, "send deadline passed, dropping"),
        }
    }
}

/// Accept loop: one connection carries one line. Handlers run concurrently,
/// bounded by a small worker pool; the host profile's delay/drop/crash
/// behavior applies here, before the engine ever sees a message.
///
/// # Errors
///
/// Returns an error only if the listening socket cannot be bound.
pub async fn run_listener<N, T>(
    net: N,
    port: u16,
    engine: Engine<T>,
    profile: Profile,
) -> io::Result<()>
where
    N: NetStack,
    T: Transport,
{
    let mut listener = net.bind(port).await?;
    info!(member = %engine.id(), port, "listening");
    let workers = Arc::new(Semaphore::new(WORKERS));
    loop {
        let stream = match net.accept(&mut listener).await {
            Ok(stream) => stream,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let engine = engine.clone();
        let workers = Arc::clone(&workers);
        tokio::spawn(async move {
            let Ok(_permit) = workers.acquire().await else {
                return;
            };
            handle_connection(stream, &engine, profile).await;
        });
    }
}

async fn handle_connection<S, T>(stream: S, engine: &Engine<T>, profile: Profile)
where
    S: AsyncRead + Unpin + Send,
    T: Transport,
{
    let mut framed = FramedRead::new(stream, WireCodec);
    let message = match framed.next().await {
        Some(Ok(message)) => message,
        Some(Err(error)) => {
            warn!(%error, "dropping undecodable message");
            return;
        }
        None => return,
    };
    let delay = profile.inbound_delay(&mut rand::rng());
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    if profile.should_drop(&mut rand::rng()) {
        trace!(kind = message.kind(), "profile dropped inbound message");
        return;
    }
    let crash = matches!(message, Message::Propose { .. })
        && profile.crash_after_propose(&mut rand::rng());
    engine.deliver(message).await;
    if crash {
        warn!("failure profile terminating after propose");
        tokio::time::sleep(Duration::from_millis(100)).await;
        std::process::exit(1);
    }
}
