use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio_rustls::{
    rustls::{self, pki_types::{CertificateDer, PrivateKeyDer}},
    TlsAcceptor,
};

/// A configured listening endpoint.
#[derive(Debug, Clone)]
pub enum Endpoint {
    Tcp { addr: String, implicit_tls: bool },
    Unix { path: PathBuf },
}

/// A bound endpoint accepting connections.
pub enum Binding {
    Tcp { listener: TcpListener, implicit_tls: bool },
    Unix { listener: UnixListener },
}

/// One accepted connection, before any TLS handshake.
pub enum Accepted {
    Tcp { stream: TcpStream, peer: SocketAddr, implicit_tls: bool },
    Unix { stream: UnixStream },
}

impl Binding {
    pub async fn bind(endpoint: &Endpoint) -> Result<Binding> {
        match endpoint {
            Endpoint::Tcp { addr, implicit_tls } => {
                let listener = TcpListener::bind(addr).await?;
                Ok(Binding::Tcp { listener, implicit_tls: *implicit_tls })
            }
            Endpoint::Unix { path } => {
                // A stale socket file from a previous run refuses binds.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                let listener = UnixListener::bind(path)?;
                Ok(Binding::Unix { listener })
            }
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Binding::Tcp { listener, implicit_tls } => {
                let addr = listener
                    .local_addr()
                    .map(|a| a.to_string())
                    .unwrap_or_else(|_| "?".to_string());
                if *implicit_tls {
                    format!("{} (implicit TLS)", addr)
                } else {
                    addr
                }
            }
            Binding::Unix { listener } => listener
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "unix socket".to_string()),
        }
    }

    pub async fn accept(&self) -> Result<Accepted> {
        match self {
            Binding::Tcp { listener, implicit_tls } => {
                let (stream, peer) = listener.accept().await?;
                Ok(Accepted::Tcp { stream, peer, implicit_tls: *implicit_tls })
            }
            Binding::Unix { listener } => {
                let (stream, _) = listener.accept().await?;
                Ok(Accepted::Unix { stream })
            }
        }
    }
}

/// Build a TLS acceptor from PEM files on disk.
pub fn create_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    use std::{fs::File, io::BufReader as StdBufReader};

    // rustls 0.23+ requires an installed crypto provider. Ignore the
    // error if one is already active.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cert_file = File::open(cert_path)?;
    let mut cert_reader = StdBufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("invalid cert: {}", e))?;

    let key_file = File::open(key_path)?;
    let mut key_reader = StdBufReader::new(key_file);

    let mut key: Option<PrivateKeyDer<'static>> = None;
    for item in rustls_pemfile::read_all(&mut key_reader) {
        let item = item.map_err(|e| anyhow!("invalid key: {}", e))?;
        match item {
            rustls_pemfile::Item::Pkcs1Key(k) => {
                key = Some(PrivateKeyDer::Pkcs1(k));
                break;
            }
            rustls_pemfile::Item::Pkcs8Key(k) => {
                key = Some(PrivateKeyDer::Pkcs8(k));
                break;
            }
            rustls_pemfile::Item::Sec1Key(k) => {
                key = Some(PrivateKeyDer::Sec1(k));
                break;
            }
            _ => {}
        }
    }
    let key = key.ok_or_else(|| anyhow!("no private key found"))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("tls config: {}", e))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
