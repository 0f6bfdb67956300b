use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use rustls::client::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::debug;

use crate::proxy::forward_error::OriginConnectFailed;
use crate::proxy::request::ConnectTarget;
use crate::util::timeout_with_context;

/// Connect-side byte stream, plain or wrapped in TLS.
pub enum UpstreamIo {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl Unpin for UpstreamIo {}

impl AsyncRead for UpstreamIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_flush(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamIo::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            UpstreamIo::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

/// Opens new connect-side connections: resolves the dial address, connects, and performs the
/// TLS handshake when the target asks for one.
pub struct OriginConnector {
    tls: Option<Arc<ClientConfig>>,
    connect_timeout: Duration,
}

impl OriginConnector {
    pub fn new(tls: Option<Arc<ClientConfig>>, connect_timeout: Duration) -> Self {
        Self {
            tls,
            connect_timeout,
        }
    }

    pub async fn connect(&self, target: &ConnectTarget) -> Result<(UpstreamIo, SocketAddr)> {
        let origin = target.authority();
        self.connect_inner(target)
            .await
            .context(OriginConnectFailed { origin })
    }

    async fn connect_inner(&self, target: &ConnectTarget) -> Result<(UpstreamIo, SocketAddr)> {
        let (host, port) = target.dial_addr();
        let addrs: Vec<SocketAddr> = timeout_with_context(
            self.connect_timeout,
            lookup_host((host, port)),
            format!("resolving {host}:{port}"),
        )
        .await?
        .collect();
        let (tcp, peer) = connect_to_addrs(&addrs, self.connect_timeout).await?;
        if !target.tls {
            return Ok((UpstreamIo::Plain(tcp), peer));
        }

        let config = self
            .tls
            .clone()
            .ok_or_else(|| anyhow!("no TLS client configuration available"))?;
        let server_name = ServerName::try_from(target.host.to_string())
            .map_err(|_| anyhow!("invalid origin host for TLS '{}'", target.host))?;
        let tls = timeout_with_context(
            self.connect_timeout,
            TlsConnector::from(config).connect(server_name, tcp),
            format!("establishing TLS with {}", target.authority()),
        )
        .await?;
        Ok((UpstreamIo::Tls(Box::new(tls)), peer))
    }
}

/// Attempt to connect to the supplied socket addresses in order.
pub async fn connect_to_addrs(
    addrs: &[SocketAddr],
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr)> {
    let mut last_err = None;
    for addr in addrs {
        match timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(
                        host = %addr.ip(),
                        port = addr.port(),
                        error = %err,
                        "failed to set TCP_NODELAY on origin stream"
                    );
                }
                debug!(host = %addr.ip(), port = addr.port(), "connected to origin");
                return Ok((stream, *addr));
            }
            Ok(Err(err)) => {
                last_err = Some(anyhow::Error::new(err).context(format!("failed to connect to {addr}")));
            }
            Err(_) => {
                last_err = Some(anyhow!("connection to {addr} timed out"));
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow!("no addresses resolved for origin")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Scheme;
    use crate::proxy::forward_error::{FailureClass, classify};
    use tokio::net::TcpListener;

    fn target(port: u16) -> ConnectTarget {
        ConnectTarget {
            scheme: Scheme::Http,
            host: Arc::from("127.0.0.1"),
            port,
            path_and_query: "/".into(),
            transport: None,
            tls: false,
        }
    }

    #[tokio::test]
    async fn connects_to_listening_origin() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let connector = OriginConnector::new(None, Duration::from_secs(1));
        let (io, peer) = connector.connect(&target(port)).await?;
        assert!(matches!(io, UpstreamIo::Plain(_)));
        assert_eq!(peer.port(), port);
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_maps_to_gateway_timeout() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        drop(listener);
        let connector = OriginConnector::new(None, Duration::from_secs(1));
        let err = connector.connect(&target(port)).await.err().expect("refused");
        assert!(err.is::<OriginConnectFailed>());
        assert_eq!(classify(&err), FailureClass::GatewayTimeout);
        Ok(())
    }

    #[tokio::test]
    async fn tls_target_without_config_fails() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let connector = OriginConnector::new(None, Duration::from_secs(1));
        let mut tls_target = target(port);
        tls_target.tls = true;
        let err = connector.connect(&tls_target).await.err().expect("no config");
        assert!(format!("{err:#}").contains("no TLS client configuration"));
        Ok(())
    }

    #[tokio::test]
    async fn dials_transport_override() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let connector = OriginConnector::new(None, Duration::from_secs(1));
        let mut overridden = target(1);
        overridden.host = Arc::from("origin.invalid");
        overridden.transport = Some(crate::config::TransportOverride {
            host: Arc::from("127.0.0.1"),
            port,
        });
        let (_, peer) = connector.connect(&overridden).await?;
        assert_eq!(peer.port(), port);
        Ok(())
    }
}
