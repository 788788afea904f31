use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{error, info};

use crate::config::GatewayConfig;
use crate::proxy::{ProxyHandler, ProxyState};

pub struct GatewayServer {
    config: Arc<GatewayConfig>,
    state: ProxyState,
    handler: Arc<ProxyHandler>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl GatewayServer {
    pub async fn new(config: GatewayConfig) -> Result<Self> {
        let state = ProxyState::new(config).await?;
        let config = state.config.clone();

        let tls_acceptor = if config.tls_enabled() {
            Some(Self::create_tls_acceptor(&config)?)
        } else {
            None
        };

        let handler = Arc::new(ProxyHandler::new(state.clone()));

        Ok(Self {
            config,
            state,
            handler,
            tls_acceptor,
        })
    }

    /// Rebuild the route table from disk and swap it in atomically.
    /// Requests already in flight keep the table they started with.
    pub fn reload_routes(&self) -> Result<usize> {
        self.state.routes.reload_from(&self.config.routes_file)
    }

    fn create_tls_acceptor(config: &GatewayConfig) -> Result<TlsAcceptor> {
        use rustls::pki_types::CertificateDer;
        use std::fs::File;
        use std::io::BufReader;

        let cert_path = config
            .tls_cert_path
            .as_ref()
            .context("TLS_CERT_PATH not set")?;
        let cert_file = File::open(cert_path)
            .with_context(|| format!("Failed to open certificate file: {:?}", cert_path))?;
        let mut cert_reader = BufReader::new(cert_file);
        let certs: Vec<CertificateDer> = rustls_pemfile::certs(&mut cert_reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to parse certificate")?;

        let key_path = config
            .tls_key_path
            .as_ref()
            .context("TLS_KEY_PATH not set")?;
        let key_file = File::open(key_path)
            .with_context(|| format!("Failed to open key file: {:?}", key_path))?;
        let mut key_reader = BufReader::new(key_file);

        let private_key = rustls_pemfile::private_key(&mut key_reader)
            .context("Failed to parse private key")?
            .context("No private key found in file")?;

        let tls_config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, private_key)
            .context("Failed to build TLS config")?;

        Ok(TlsAcceptor::from(Arc::new(tls_config)))
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr()
            .parse()
            .context("Invalid listen address")?;

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind to {}", addr))?;

        info!(
            "gateway listening on {} (tls: {})",
            addr,
            self.tls_acceptor.is_some()
        );

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    continue;
                }
            };

            let server = Arc::clone(&self);

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    error!("Connection error from {}: {}", peer_addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let client_ip = peer_addr.ip();
        let handler = Arc::clone(&self.handler);

        let service = service_fn(move |req| {
            let handler = Arc::clone(&handler);
            async move {
                Ok::<_, std::convert::Infallible>(handler.handle(req, client_ip).await)
            }
        });

        if let Some(ref tls_acceptor) = self.tls_acceptor {
            let tls_stream = tls_acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?;

            http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
                .context("Failed to serve TLS connection")?;
        } else {
            http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
                .context("Failed to serve connection")?;
        }

        Ok(())
    }
}
