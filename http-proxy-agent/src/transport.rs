// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Transport connections to the proxy server.
//!
//! A proxy is reached over plain TCP or over TLS. Both are exposed as a
//! single [`Transport`] so the host client reads and writes the same way
//! regardless of how the proxy is reached.

use crate::connector::Result;
use crate::error::Error;
use log::debug;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Extra transport-level options handed through to the transport opener
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    /// TLS client configuration used when the proxy is secure. When unset
    /// the `webpki-roots` bundle is trusted.
    pub tls_config: Option<Arc<ClientConfig>>,
    /// Name used for SNI and certificate verification. Defaults to the proxy
    /// host.
    pub server_name: Option<String>,
    /// Disable Nagle's algorithm on the proxy socket.
    pub nodelay: bool,
}

/// A connected stream to the proxy server.
pub enum Transport {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = if self.is_secure() { "Tls" } else { "Tcp" };
        f.debug_struct("Transport")
            .field("kind", &kind)
            .field("peer", &self.peer_addr().ok())
            .finish()
    }
}

impl Transport {
    pub fn is_secure(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// The underlying TCP socket.
    pub fn tcp_stream(&self) -> &TcpStream {
        match self {
            Transport::Tcp(stream) => stream,
            Transport::Tls(stream) => stream.get_ref().0,
        }
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.tcp_stream().peer_addr()
    }
}

/// Opens a connection to `host:port`, wrapped in TLS when `secure` is set.
///
/// Errors from the TCP connect and the TLS handshake are returned as they
/// come from the transport layer.
pub(crate) async fn open(
    host: &str,
    port: u16,
    secure: bool,
    options: &TransportOptions,
) -> Result<Transport> {
    if !secure {
        debug!("Creating TCP socket to {}:{}", host, port);
        let stream = connect_tcp(host, port, options).await?;
        return Ok(Transport::Tcp(stream));
    }

    let name = options.server_name.as_deref().unwrap_or(host);
    let server_name =
        ServerName::try_from(name.to_owned()).map_err(|_| Error::InvalidHost(name.to_owned()))?;
    let config = options.tls_config.clone().unwrap_or_else(default_tls_config);

    debug!("Creating TLS socket to {}:{} (server name {})", host, port, name);
    let stream = connect_tcp(host, port, options).await?;
    let stream = TlsConnector::from(config).connect(server_name, stream).await?;
    Ok(Transport::Tls(Box::new(stream)))
}

async fn connect_tcp(host: &str, port: u16, options: &TransportOptions) -> io::Result<TcpStream> {
    let stream = TcpStream::connect((host, port)).await?;
    if options.nodelay {
        stream.set_nodelay(true)?;
    }
    Ok(stream)
}

fn default_tls_config() -> Arc<ClientConfig> {
    static CONFIG: OnceLock<Arc<ClientConfig>> = OnceLock::new();
    CONFIG
        .get_or_init(|| {
            let mut root_store = RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Arc::new(
                ClientConfig::builder().with_root_certificates(root_store).with_no_client_auth(),
            )
        })
        .clone()
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            Transport::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
            Transport::Tls(stream) => Pin::new(stream).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Transport::Tcp(stream) => stream.is_write_vectored(),
            Transport::Tls(stream) => stream.is_write_vectored(),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Transport::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            Transport::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_open_plain() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy_addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
        });

        let options = TransportOptions { nodelay: true, ..Default::default() };
        let mut transport = open("127.0.0.1", proxy_addr.port(), false, &options).await?;
        assert!(!transport.is_secure());
        assert_eq!(transport.peer_addr()?, proxy_addr);
        assert!(transport.tcp_stream().nodelay()?);
        transport.write_all(b"ping").await?;

        handle.await.unwrap();
        Ok(())
    }

    #[tokio::test]
    async fn test_open_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = open("127.0.0.1", port, false, &TransportOptions::default()).await;
        match result {
            Err(Error::IoError(err)) => assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_open_tls_handshake_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // A plain HTTP server answering the ClientHello.
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let result = open("127.0.0.1", port, true, &TransportOptions::default()).await;
        assert!(matches!(result, Err(Error::IoError(_))));

        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_open_invalid_server_name() {
        let options =
            TransportOptions { server_name: Some("not a host!".to_string()), ..Default::default() };
        let result = open("127.0.0.1", 1, true, &options).await;
        match result {
            Err(Error::InvalidHost(name)) => assert_eq!(name, "not a host!"),
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }
}
