use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use anyhow::{anyhow, bail, Error};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::server::TlsStream;
use tokio_rustls::{Accept, TlsAcceptor};

use palaver_core::xmpp::stream::Connection;

enum Socket {
    Plain(TcpStream),
    Tls(TlsStream<TcpStream>),
}

/// A client TCP connection, optionally upgraded to TLS via STARTTLS.
pub struct TcpConnection {
    socket: Socket,
    tls_config: Option<Arc<ServerConfig>>,
    remote_addr: Option<SocketAddr>,
}

impl TcpConnection {
    pub fn new(socket: TcpStream, tls_config: Option<Arc<ServerConfig>>) -> Self {
        let remote_addr = socket.peer_addr().ok();

        TcpConnection {
            socket: Socket::Plain(socket),
            tls_config,
            remote_addr,
        }
    }
}

impl Connection for TcpConnection {
    type Upgrade = TcpConnectionUpgrade;

    fn upgrade(self) -> Result<Self::Upgrade, Error> {
        let Some(config) = self.tls_config.clone() else {
            bail!("TLS is not configured");
        };

        match self.socket {
            Socket::Plain(socket) => {
                let accept = TlsAcceptor::from(config).accept(socket);
                Ok(TcpConnectionUpgrade {
                    accept,
                    tls_config: self.tls_config,
                    remote_addr: self.remote_addr,
                })
            }
            Socket::Tls(_) => Err(anyhow!("connection is already secure")),
        }
    }

    fn is_starttls_allowed(&self) -> bool {
        self.tls_config.is_some() && matches!(self.socket, Socket::Plain(_))
    }

    fn is_secure(&self) -> bool {
        matches!(self.socket, Socket::Tls(_))
    }

    fn is_authenticated(&self) -> bool {
        match &self.socket {
            Socket::Plain(_) => false,
            Socket::Tls(socket) => socket.get_ref().1.peer_certificates().is_some(),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl AsyncRead for TcpConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_read(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for TcpConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_write(cx, buf),
            Socket::Tls(socket) => Pin::new(socket).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_flush(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match &mut self.socket {
            Socket::Plain(socket) => Pin::new(socket).poll_shutdown(cx),
            Socket::Tls(socket) => Pin::new(socket).poll_shutdown(cx),
        }
    }
}

pub struct TcpConnectionUpgrade {
    accept: Accept<TcpStream>,
    tls_config: Option<Arc<ServerConfig>>,
    remote_addr: Option<SocketAddr>,
}

impl Future for TcpConnectionUpgrade {
    type Output = Result<TcpConnection, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let tls_stream = ready!(Pin::new(&mut self.accept).poll(cx))?;
        let connection = TcpConnection {
            socket: Socket::Tls(tls_stream),
            tls_config: self.tls_config.take(),
            remote_addr: self.remote_addr,
        };
        Poll::Ready(Ok(connection))
    }
}
