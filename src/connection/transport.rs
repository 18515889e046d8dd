//! Transport abstraction (plain TCP vs TLS over TCP)

use super::tls::TlsConfig;
use crate::{Error, Result};
use bytes::BytesMut;
use rustls_pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Byte stream to the server
pub enum Transport {
    /// Plain TCP connection
    Plain(TcpStream),
    /// TLS-encrypted TCP connection
    Tls(Box<TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Plain(_) => f.write_str("Transport::Plain(TcpStream)"),
            Transport::Tls(_) => f.write_str("Transport::Tls(TlsStream)"),
        }
    }
}

impl Transport {
    /// Open a TCP connection to a numeric address.
    ///
    /// No name resolution happens here; the caller decides where bytes go.
    pub async fn connect_tcp(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|source| {
            if source.kind() == io::ErrorKind::ConnectionRefused {
                Error::ConnectRefused { addr, source }
            } else {
                Error::Connect { addr, source }
            }
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("failed to set TCP_NODELAY: {}", e);
        }

        Ok(Transport::Plain(stream))
    }

    /// Upgrade a plain TCP transport to TLS after SSLRequest negotiation.
    ///
    /// `server_name` is sent as SNI and the server certificate is verified
    /// against it, regardless of which address the socket is connected to.
    pub async fn upgrade_to_tls(
        self,
        tls_config: &TlsConfig,
        server_name: ServerName<'static>,
    ) -> Result<Self> {
        match self {
            Transport::Plain(tcp_stream) => {
                let name = server_name.to_str().into_owned();
                let connector = TlsConnector::from(tls_config.client_config());
                let tls_stream = connector
                    .connect(server_name, tcp_stream)
                    .await
                    .map_err(|source| Error::Tls {
                        server_name: name,
                        source,
                    })?;

                Ok(Transport::Tls(Box::new(tls_stream)))
            }
            Transport::Tls(_) => Err(Error::Config(
                "transport is already TLS-encrypted".into(),
            )),
        }
    }

    /// Whether the stream is TLS-encrypted
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Address of the connected peer
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        let addr = match self {
            Transport::Plain(stream) => stream.peer_addr()?,
            Transport::Tls(stream) => stream.get_ref().0.peer_addr()?,
        };
        Ok(addr)
    }

    /// Write all bytes to the stream
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.write_all(buf).await?,
            Transport::Tls(stream) => stream.write_all(buf).await?,
        }
        Ok(())
    }

    /// Flush the stream
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.flush().await?,
            Transport::Tls(stream) => stream.flush().await?,
        }
        Ok(())
    }

    /// Read into buffer
    pub async fn read_buf(&mut self, buf: &mut BytesMut) -> Result<usize> {
        let n = match self {
            Transport::Plain(stream) => stream.read_buf(buf).await?,
            Transport::Tls(stream) => stream.read_buf(buf).await?,
        };
        Ok(n)
    }

    /// Shutdown the stream
    pub async fn shutdown(&mut self) -> Result<()> {
        match self {
            Transport::Plain(stream) => stream.shutdown().await?,
            Transport::Tls(stream) => stream.shutdown().await?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = Transport::connect_tcp(addr).await.unwrap_err();
        assert!(
            matches!(err, Error::ConnectRefused { addr: a, .. } if a == addr),
            "unexpected error: {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_tcp_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let mut transport = Transport::connect_tcp(addr).await.unwrap();
        assert!(!transport.is_tls());
        assert_eq!(transport.peer_addr().unwrap(), addr);

        transport.write_all(b"ping").await.unwrap();
        transport.flush().await.unwrap();

        let mut buf = BytesMut::new();
        while buf.len() < 4 {
            let n = transport.read_buf(&mut buf).await.unwrap();
            assert!(n > 0);
        }
        assert_eq!(&buf[..], b"ping");

        transport.shutdown().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_tls_handshake_failure_names_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // A peer that closes instead of speaking TLS
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            drop(socket);
        });

        let tls = TlsConfig::builder().build().unwrap();
        let name = ServerName::try_from("db.example.com").unwrap();
        let transport = Transport::connect_tcp(addr).await.unwrap();

        let err = transport.upgrade_to_tls(&tls, name).await.unwrap_err();
        match err {
            Error::Tls { server_name, .. } => assert_eq!(server_name, "db.example.com"),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
