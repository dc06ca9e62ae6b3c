pub mod auth;
pub mod codec;
pub mod command;
pub mod fetch;
pub mod handler;
pub mod response;
pub mod selected;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::net::listener::{create_tls_acceptor, Accepted, Binding, Endpoint};
use crate::net::proxy::read_proxy_header;
use crate::net::stream::ImapStream;
use crate::runtime::Runtime;
use self::handler::{ConnectionContext, ImapHandler, SessionParams};

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Bind the configured IMAP endpoints and serve connections until
/// shutdown, then allow sessions a grace period to say BYE.
pub async fn run_imap(runtime: Arc<Runtime>) -> Result<()> {
    let cfg = &runtime.config;

    let bind = cfg.get_value("imap", "bind").unwrap_or("0.0.0.0").to_string();
    let port = cfg.get_int("imap", "port", 143);
    let ssl_port = cfg.get_int("imap", "ssl_port", 993);
    let unix_socket = cfg.get_value("imap", "unix_socket").map(str::to_string);
    let proxy_protocol = cfg.get_bool("imap", "proxy_protocol", false);
    let max_connections = cfg.get_int("imap", "max_connections", 500).max(1) as usize;
    let grace = Duration::from_secs(cfg.get_int("imap", "shutdown_grace_secs", 5).max(0) as u64);

    let tls = match (cfg.get_value("imap", "tls_cert"), cfg.get_value("imap", "tls_key")) {
        (Some(cert), Some(key)) => Some(create_tls_acceptor(cert, key)?),
        _ => None,
    };

    let params = Arc::new(SessionParams {
        hostname: cfg.get_value("system", "hostname").unwrap_or("localhost").to_string(),
        max_literal: cfg.get_int("imap", "max_literal_size", 40 * 1024 * 1024).max(1024) as usize,
        command_timeout: Duration::from_secs(
            cfg.get_int("imap", "idle_timeout_secs", 30 * 60).max(60) as u64,
        ),
        idle_timeout: Duration::from_secs(
            cfg.get_int("imap", "idle_command_timeout_secs", 29 * 60).max(60) as u64,
        ),
    });

    let mut endpoints = Vec::new();
    if port != 0 {
        endpoints.push(Endpoint::Tcp { addr: format!("{}:{}", bind, port), implicit_tls: false });
    }
    if ssl_port != 0 {
        if tls.is_some() {
            endpoints
                .push(Endpoint::Tcp { addr: format!("{}:{}", bind, ssl_port), implicit_tls: true });
        } else {
            warn!("imap.ssl_port set but no tls_cert/tls_key; TLS listener disabled");
        }
    }
    if let Some(path) = unix_socket {
        endpoints.push(Endpoint::Unix { path: path.into() });
    }

    let semaphore = Arc::new(Semaphore::new(max_connections));
    let mut listeners = Vec::new();

    for endpoint in &endpoints {
        let binding = Binding::bind(endpoint).await?;
        info!("IMAP listening on {}", binding.describe());

        let runtime = runtime.clone();
        let semaphore = semaphore.clone();
        let params = params.clone();
        let tls = tls.clone();
        listeners.push(tokio::spawn(async move {
            accept_loop(binding, runtime, semaphore, params, tls, proxy_protocol).await;
        }));
    }

    for listener in listeners {
        let _ = listener.await;
    }

    // Sessions see the shutdown signal at their next flush point; give
    // them a moment to emit BYE before the process exits.
    tokio::time::sleep(grace).await;
    Ok(())
}

async fn accept_loop(
    binding: Binding,
    runtime: Arc<Runtime>,
    semaphore: Arc<Semaphore>,
    params: Arc<SessionParams>,
    tls: Option<tokio_rustls::TlsAcceptor>,
    proxy_protocol: bool,
) {
    let mut shutdown = runtime.shutdown_receiver();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.changed() => break,
            accepted = binding.accept() => accepted,
        };
        let accepted = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("IMAP accept failed: {}", e);
                continue;
            }
        };
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let runtime = runtime.clone();
        let params = params.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_connection(accepted, runtime, params, tls, proxy_protocol).await
            {
                warn!("IMAP session ended with error: {}", e);
            }
        });
    }
    info!("IMAP listener stopped: {}", binding.describe());
}

async fn handle_connection(
    accepted: Accepted,
    runtime: Arc<Runtime>,
    params: Arc<SessionParams>,
    tls: Option<tokio_rustls::TlsAcceptor>,
    proxy_protocol: bool,
) -> Result<()> {
    let session_id = SESSION_ID_COUNTER.fetch_add(1, Ordering::SeqCst);

    let (stream, peer, localhost) = match accepted {
        Accepted::Tcp { mut stream, peer, implicit_tls } => {
            let mut peer = peer;
            if proxy_protocol {
                // Consumed before the first IMAP (or TLS) byte; parse
                // failure is fatal for the connection.
                match read_proxy_header(&mut stream).await {
                    Ok(info) => {
                        if let Some(source) = info.source {
                            peer = source;
                        }
                    }
                    Err(e) => {
                        warn!("dropping connection with bad PROXY header: {}", e);
                        return Ok(());
                    }
                }
            }
            let stream = if implicit_tls {
                let acceptor = tls
                    .clone()
                    .ok_or_else(|| anyhow::anyhow!("implicit TLS endpoint without acceptor"))?;
                ImapStream::Tls(acceptor.accept(stream).await?)
            } else {
                ImapStream::Plain(stream)
            };
            (stream, peer.to_string(), peer.ip().is_loopback())
        }
        Accepted::Unix { stream } => (ImapStream::Unix(stream), "unix".to_string(), true),
    };

    info!("{} new IMAP connection", peer);
    let ctx = ConnectionContext {
        store: runtime.store.clone(),
        filter: runtime.filter.clone(),
        params,
        tls,
        shutdown: runtime.shutdown_receiver(),
    };
    let handler = ImapHandler::new(ctx, session_id, peer, localhost);
    handler.run(stream).await
}
