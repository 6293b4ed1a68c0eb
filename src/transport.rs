use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::config::Config;
use crate::Error;

/// Any byte stream a connection can run over.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Opens the socket described by `config`, bounded by its connect timeout, and performs the TLS
/// handshake when TLS is enabled.
pub async fn open(config: &Config) -> Result<BoxedTransport, Error> {
    let address = config.address();

    match timeout(config.connect_timeout, open_inner(config)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(Error::Io(source))) => Err(Error::Connect { address, source }),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::Timeout(config.connect_timeout)),
    }
}

async fn open_inner(config: &Config) -> Result<BoxedTransport, Error> {
    if let Some(path) = &config.unix_socket {
        return open_unix(path).await;
    }

    let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
    stream.set_nodelay(true)?;
    debug!("TCP connection established with {}", config.address());

    match &config.tls {
        Some(tls) => wrap_tls(stream, &config.host, tls).await,
        None => Ok(Box::new(stream)),
    }
}

#[cfg(unix)]
async fn open_unix(path: &std::path::Path) -> Result<BoxedTransport, Error> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn open_unix(_path: &std::path::Path) -> Result<BoxedTransport, Error> {
    Err(Error::Config(
        "unix sockets are not supported on this platform".to_string(),
    ))
}

#[cfg(feature = "tls")]
async fn wrap_tls(
    stream: TcpStream,
    host: &str,
    tls: &crate::config::TlsConfig,
) -> Result<BoxedTransport, Error> {
    use tokio_native_tls::native_tls::{Certificate, TlsConnector};

    let mut builder = TlsConnector::builder();
    if let Some(path) = &tls.ca_cert {
        let pem = tokio::fs::read(path).await?;
        builder.add_root_certificate(Certificate::from_pem(&pem)?);
    }
    if tls.danger_accept_invalid_certs {
        builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }

    let connector = tokio_native_tls::TlsConnector::from(builder.build()?);
    let stream = connector.connect(host, stream).await?;
    debug!("TLS handshake with {} completed", host);

    Ok(Box::new(stream))
}

#[cfg(not(feature = "tls"))]
async fn wrap_tls(
    _stream: TcpStream,
    _host: &str,
    _tls: &crate::config::TlsConfig,
) -> Result<BoxedTransport, Error> {
    Err(Error::Config(
        "TLS requested but the crate was built without the `tls` feature".to_string(),
    ))
}
