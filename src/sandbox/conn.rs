//! Connections into sandboxes
//!
//! `SandboxConn` is the raw TCP or UDP connection to a service inside a
//! sandbox. `ActivityTrackingConn` wraps it so every read and write first
//! makes sure the sandbox is running (unfreezing it if the housekeeper froze
//! it mid-session) and refreshes its idle clock.

use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UdpSocket};

use crate::error::Result;
use crate::sandbox::instance::Sandbox;

/// Transport used to reach a sandbox service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Connection to a service running inside a sandbox
#[derive(Debug)]
pub enum SandboxConn {
    Tcp(TcpStream),
    /// Connected UDP socket, one datagram per read/write
    Udp(UdpSocket),
}

impl SandboxConn {
    pub(crate) async fn connect(transport: Transport, addr: SocketAddr) -> io::Result<Self> {
        match transport {
            Transport::Tcp => Ok(SandboxConn::Tcp(TcpStream::connect(addr).await?)),
            Transport::Udp => {
                let bind: SocketAddr = if addr.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(addr).await?;
                Ok(SandboxConn::Udp(socket))
            }
        }
    }

    pub fn transport(&self) -> Transport {
        match self {
            SandboxConn::Tcp(_) => Transport::Tcp,
            SandboxConn::Udp(_) => Transport::Udp,
        }
    }

    /// Address of the service inside the sandbox
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SandboxConn::Tcp(s) => s.peer_addr(),
            SandboxConn::Udp(s) => s.peer_addr(),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            SandboxConn::Tcp(s) => s.local_addr(),
            SandboxConn::Udp(s) => s.local_addr(),
        }
    }
}

impl AsyncRead for SandboxConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SandboxConn::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            SandboxConn::Udp(s) => s.poll_recv(cx, buf),
        }
    }
}

impl AsyncWrite for SandboxConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            SandboxConn::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            SandboxConn::Udp(s) => s.poll_send(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SandboxConn::Tcp(s) => Pin::new(s).poll_flush(cx),
            SandboxConn::Udp(_) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            SandboxConn::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            SandboxConn::Udp(_) => Poll::Ready(Ok(())),
        }
    }
}

type Activation = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Per-direction progress of the "sandbox ready" check
enum Gate {
    /// No I/O in flight; the next operation activates first
    Idle,
    Activating(Activation),
    /// Sandbox confirmed ready for the operation in flight
    Open,
}

impl Gate {
    fn poll_open(&mut self, sandbox: &Arc<Sandbox>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        loop {
            match self {
                Gate::Open => return Poll::Ready(Ok(())),
                Gate::Idle => {
                    let sandbox = Arc::clone(sandbox);
                    *self = Gate::Activating(Box::pin(async move { sandbox.ensure_ready().await }));
                }
                Gate::Activating(activation) => match ready!(activation.as_mut().poll(cx)) {
                    Ok(()) => *self = Gate::Open,
                    Err(e) => {
                        *self = Gate::Idle;
                        return Poll::Ready(Err(e.into()));
                    }
                },
            }
        }
    }

    /// Close the gate once the guarded operation has completed
    fn settle<T>(&mut self, poll: Poll<T>) -> Poll<T> {
        if poll.is_ready() {
            *self = Gate::Idle;
        }
        poll
    }
}

/// Connection decorator keeping its sandbox awake while traffic flows
pub struct ActivityTrackingConn<S = SandboxConn> {
    inner: S,
    sandbox: Arc<Sandbox>,
    read_gate: Gate,
    write_gate: Gate,
}

impl<S> ActivityTrackingConn<S> {
    pub fn new(inner: S, sandbox: Arc<Sandbox>) -> Self {
        ActivityTrackingConn {
            inner,
            sandbox,
            read_gate: Gate::Idle,
            write_gate: Gate::Idle,
        }
    }

    /// The sandbox this connection is bridged into
    pub fn sandbox(&self) -> &Arc<Sandbox> {
        &self.sandbox
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

impl<S> std::fmt::Debug for ActivityTrackingConn<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActivityTrackingConn")
            .field("sandbox", &self.sandbox.name())
            .finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ActivityTrackingConn<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.read_gate.poll_open(&this.sandbox, cx))?;
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        this.read_gate.settle(poll)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ActivityTrackingConn<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.write_gate.poll_open(&this.sandbox, cx))?;
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        this.write_gate.settle(poll)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
