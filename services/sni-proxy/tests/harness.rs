//! Test harness for SNI proxy integration tests.
//!
//! Provides helpers to spawn TCP/TLS backends and a proxy listener, and to
//! build ClientHello records by hand.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sni_proxy::{Listener, ListenerConfig, ListenerStats, Route, RouteTable};

/// Spawn an accept loop that hands each stream to `handler` until shut down.
fn spawn_backend<F, Fut>(
    listener: TcpListener,
    connections: Arc<AtomicU64>,
    handler: F,
) -> oneshot::Sender<()>
where
    F: Fn(TcpStream) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            connections.fetch_add(1, Ordering::Relaxed);
                            tokio::spawn(handler(stream));
                        }
                        Err(_) => break,
                    }
                }
                _ = &mut shutdown_rx => break,
            }
        }
    });
    shutdown_tx
}

/// Echoes everything it receives and records a copy.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub received: Arc<Mutex<Vec<u8>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));

        let received_clone = Arc::clone(&received);
        let shutdown_tx = spawn_backend(listener, Arc::clone(&connections), move |mut stream| {
            let received = Arc::clone(&received_clone);
            async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Ok(mut r) = received.lock() {
                                r.extend_from_slice(&buf[..n]);
                            }
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Reads `expect_len` bytes, replies with `reply`, then closes.
#[allow(dead_code)]
pub struct ReplyAndCloseBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl ReplyAndCloseBackend {
    pub async fn spawn(expect_len: usize, reply: &'static [u8]) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let shutdown_tx = spawn_backend(listener, Arc::clone(&connections), move |mut stream| {
            async move {
                let mut buf = vec![0u8; expect_len];
                if stream.read_exact(&mut buf).await.is_ok() {
                    let _ = stream.write_all(reply).await;
                }
                // Dropping the stream closes the backend's side.
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for ReplyAndCloseBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Terminates TLS and answers the first read with `marker`.
#[allow(dead_code)]
pub struct TlsBackend {
    pub addr: SocketAddr,
    pub cert_der: Vec<u8>,
    pub connections: Arc<AtomicU64>,
    pub marker: String,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TlsBackend {
    pub async fn spawn(server_name: &str, marker: &str) -> io::Result<Self> {
        init_crypto_provider();

        let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
            .map_err(io::Error::other)?;

        let cert_der = cert.cert.der().to_vec();
        let key_der = cert.key_pair.serialize_der();

        let certs = vec![CertificateDer::from(cert_der.clone())];
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_der));

        let config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(io::Error::other)?;

        let acceptor = TlsAcceptor::from(Arc::new(config));
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let connections = Arc::new(AtomicU64::new(0));
        let marker_bytes = marker.as_bytes().to_vec();

        let shutdown_tx = spawn_backend(listener, Arc::clone(&connections), move |stream| {
            let acceptor = acceptor.clone();
            let response = marker_bytes.clone();
            async move {
                if let Ok(mut tls_stream) = acceptor.accept(stream).await {
                    let mut buf = vec![0u8; 1024];
                    if tls_stream.read(&mut buf).await.is_ok() {
                        let _ = tls_stream.write_all(&response).await;
                        let _ = tls_stream.flush().await;
                    }
                }
            }
        });

        Ok(Self {
            addr,
            cert_der,
            connections,
            marker: marker.to_string(),
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TlsBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running proxy listener on an ephemeral loopback port.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub route_table: Arc<RouteTable>,
    pub stats: Arc<ListenerStats>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with(ListenerConfig::new("127.0.0.1:0".parse().unwrap())).await
    }

    pub async fn spawn_with(config: ListenerConfig) -> io::Result<Self> {
        let route_table = Arc::new(RouteTable::new());

        let listener = Listener::bind(config, route_table.clone()).await?;
        let listen_addr = listener.local_addr()?;
        let stats = listener.stats();
        let listener = Arc::new(listener);

        tokio::spawn(async move {
            let _ = listener.run().await;
        });

        Ok(Self {
            listen_addr,
            route_table,
            stats,
        })
    }

    pub fn add_route(&self, hostname: &str, backend: SocketAddr) {
        self.route_table
            .upsert(Route::new(hostname, vec![format!("http://{}", backend)]));
    }

    pub fn add_raw_route(&self, hostname: &str, backend: &str) {
        self.route_table
            .upsert(Route::new(hostname, vec![backend.to_string()]));
    }
}

/// Wait until `check` holds, polling briefly.
#[allow(dead_code)]
pub async fn eventually<F: Fn() -> bool>(check: F) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Read until EOF (or error), returning what arrived.
#[allow(dead_code)]
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut out = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return out,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
}

#[allow(dead_code)]
pub fn extension(ext_type: u16, data: &[u8]) -> Vec<u8> {
    let mut out = ext_type.to_be_bytes().to_vec();
    out.extend_from_slice(&(data.len() as u16).to_be_bytes());
    out.extend_from_slice(data);
    out
}

#[allow(dead_code)]
pub fn server_name_extension(hostname: &str) -> Vec<u8> {
    let name = hostname.as_bytes();
    let mut data = ((name.len() + 3) as u16).to_be_bytes().to_vec();
    data.push(0x00);
    data.extend_from_slice(&(name.len() as u16).to_be_bytes());
    data.extend_from_slice(name);
    extension(0x0000, &data)
}

/// Build a ClientHello record carrying the given extensions block.
#[allow(dead_code)]
pub fn client_hello_with_extensions(extensions: &[u8]) -> Vec<u8> {
    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[0x42; 32]);
    hello.push(0x00); // session ID
    hello.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
    hello.extend_from_slice(extensions);

    let mut body = vec![0x01];
    body.extend_from_slice(&(hello.len() as u32).to_be_bytes()[1..]);
    body.extend_from_slice(&hello);

    let mut record = vec![0x16, 0x03, 0x01];
    record.extend_from_slice(&(body.len() as u16).to_be_bytes());
    record.extend_from_slice(&body);
    record
}

#[allow(dead_code)]
pub fn client_hello(hostname: &str) -> Vec<u8> {
    let mut extensions = extension(0x000a, &[0x00, 0x02, 0x00, 0x1d]);
    extensions.extend(server_name_extension(hostname));
    client_hello_with_extensions(&extensions)
}

#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
