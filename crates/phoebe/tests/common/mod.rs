//! Shared harness: a real server on a loopback TLS socket plus a rustls
//! client that trusts the committed localhost fixture certificate.

// Not every suite uses every helper.
#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConnection, RootCertStore, StreamOwned};

use phoebe::config::ConfigBuilder;
use phoebe::ext;
use phoebe::server::{Server, ServerState};
use phoebe::store::Store;

pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("tls")
        .join(name)
}

/// A running server over a scratch wiki directory.
pub struct TestServer {
    pub addr: SocketAddr,
    pub wiki_dir: tempfile::TempDir,
    server: Arc<Server>,
}

impl TestServer {
    /// Start with the default test hosts; `configure` may add spaces,
    /// tokens, or MIME types.
    pub fn start(configure: impl FnOnce(&mut ConfigBuilder)) -> Self {
        let wiki_dir = tempfile::tempdir().expect("create wiki dir");
        let mut builder = ConfigBuilder::new();
        builder
            .wiki_dir(wiki_dir.path())
            .add_host("localhost")
            .add_cert_file(fixture("localhost-cert.pem"))
            .add_key_file(fixture("localhost-key.pem"));
        configure(&mut builder);
        let registry = ext::initialize(&mut builder).expect("initialize extensions");
        let config = builder.build().expect("build config");
        let state = ServerState::build(config, registry).expect("build state");
        let server = Server::new(state);

        let listener = TcpListener::bind("127.0.0.1:0").expect("bind loopback");
        let addr = listener.local_addr().expect("local addr");
        let accept = server.clone();
        thread::spawn(move || accept.serve(listener));
        Self {
            addr,
            wiki_dir,
            server,
        }
    }

    pub fn store(&self) -> Arc<Store> {
        self.server.state().context.store.clone()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.request_shutdown();
        let _ = TcpStream::connect(self.addr);
    }
}

fn client_config() -> Arc<rustls::ClientConfig> {
    let pem = std::fs::read(fixture("localhost-cert.pem")).expect("read fixture cert");
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .expect("parse fixture cert");
    let mut roots = RootCertStore::empty();
    for cert in certs {
        roots.add(cert).expect("trust fixture cert");
    }
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Client configuration that also presents the fixture client certificate.
fn client_config_with_cert() -> Arc<rustls::ClientConfig> {
    let pem = std::fs::read(fixture("localhost-cert.pem")).expect("read fixture cert");
    let roots_certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<_, _>>()
        .expect("parse fixture cert");
    let mut roots = RootCertStore::empty();
    for cert in roots_certs {
        roots.add(cert).expect("trust fixture cert");
    }
    let cert_pem = std::fs::read(fixture("client-cert.pem")).expect("read client cert");
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<_, _>>()
        .expect("parse client cert");
    let key_pem = std::fs::read(fixture("client-key.pem")).expect("read client key");
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .expect("parse client key")
        .expect("client key present");
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(certs, key)
            .expect("client auth config"),
    )
}

/// Fingerprint of the fixture client certificate, as the server computes it.
pub fn client_cert_fingerprint() -> String {
    let pem = std::fs::read(fixture("client-cert.pem")).expect("read client cert");
    let cert = rustls_pemfile::certs(&mut pem.as_slice())
        .next()
        .expect("client cert present")
        .expect("parse client cert");
    phoebe::tls::fingerprint(cert.as_ref())
}

/// Send raw bytes over a fresh TLS connection and collect the response.
pub fn raw_request(addr: SocketAddr, sni: &str, payload: &[u8]) -> Vec<u8> {
    raw_request_with(addr, sni, payload, client_config())
}

/// Like [`raw_request`] but presenting the fixture client certificate.
pub fn raw_request_with_client_cert(addr: SocketAddr, sni: &str, payload: &[u8]) -> Vec<u8> {
    raw_request_with(addr, sni, payload, client_config_with_cert())
}

fn raw_request_with(
    addr: SocketAddr,
    sni: &str,
    payload: &[u8],
    config: Arc<rustls::ClientConfig>,
) -> Vec<u8> {
    let stream = TcpStream::connect(addr).expect("connect");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("read timeout");
    let server_name = ServerName::try_from(sni.to_string()).expect("server name");
    let connection = ClientConnection::new(config, server_name).expect("client tls");
    let mut tls = StreamOwned::new(connection, stream);
    tls.write_all(payload).expect("send request");
    tls.flush().expect("flush request");
    let mut response = Vec::new();
    // The server closes the connection after one response.
    let _ = tls.read_to_end(&mut response);
    response
}

/// One Gemini round trip; returns the status header and the body.
pub fn gemini_query(addr: SocketAddr, url: &str) -> (String, Vec<u8>) {
    let raw = raw_request(addr, "localhost", format!("{url}\r\n").as_bytes());
    split_response(&raw)
}

/// One Titan round trip with a request line and an upload body.
pub fn titan_put(addr: SocketAddr, line: &str, body: &[u8]) -> (String, Vec<u8>) {
    let mut payload = format!("{line}\r\n").into_bytes();
    payload.extend_from_slice(body);
    let raw = raw_request(addr, "localhost", &payload);
    split_response(&raw)
}

/// One HTTP round trip; returns status line + headers and the body.
pub fn http_request(addr: SocketAddr, request: &str) -> (String, Vec<u8>) {
    let raw = raw_request(addr, "localhost", request.as_bytes());
    let at = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    (
        String::from_utf8_lossy(&raw[..at]).into_owned(),
        raw[at + 4..].to_vec(),
    )
}

fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let at = raw
        .windows(2)
        .position(|w| w == b"\r\n")
        .expect("status line terminator");
    (
        String::from_utf8_lossy(&raw[..at]).into_owned(),
        raw[at + 2..].to_vec(),
    )
}
