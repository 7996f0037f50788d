use lbpool::config::Config;
use lbpool::{BackendGroup, BackendState};
use rcgen::{CertificateParams, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

struct TestCert {
    pem: String,
    der: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
}

fn self_signed(name: &str) -> TestCert {
    let key = KeyPair::generate().unwrap();
    let cert = CertificateParams::new(vec![name.to_string()])
        .unwrap()
        .self_signed(&key)
        .unwrap();

    TestCert {
        pem: cert.pem(),
        der: cert.der().clone(),
        key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    }
}

/// TLS echo server; returns its port.
async fn spawn_tls_backend(cert: &TestCert) -> u16 {
    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(vec![cert.der.clone()], cert.key.clone_key())
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(mut tls) = acceptor.accept(stream).await else {
                    return;
                };
                let mut buf = [0u8; 1024];
                loop {
                    match tls.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tls.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                            let _ = tls.flush().await;
                        }
                    }
                }
            });
        }
    });

    port
}

fn secure_config(ca_file: &Path, port: u16) -> Config {
    let toml = format!(
        r#"
[tls]
ca_file = "{}"
server_name = "localhost"

[[backends]]
id = "secure-a"
address = "127.0.0.1"
port = {}
secure = true
"#,
        ca_file.display(),
        port
    );
    Config::from_toml(&toml).unwrap()
}

#[tokio::test]
async fn secure_backend_round_trip() {
    let cert = self_signed("localhost");
    let port = spawn_tls_backend(&cert).await;

    let temp_dir = tempfile::tempdir().unwrap();
    let ca_path = temp_dir.path().join("backend-ca.pem");
    std::fs::write(&ca_path, &cert.pem).unwrap();

    let group = BackendGroup::from_config_unmetered(&secure_config(&ca_path, port)).unwrap();
    let factory = group.get("secure-a").unwrap();
    assert!(factory.target().secure);

    let mut socket = factory.open().await.unwrap().expect("TLS connect");
    assert!(socket.stream_mut().unwrap().is_secure());

    socket.write_all_with_timeout(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    socket.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    let id = socket.id();
    socket.free();
    assert_eq!(factory.idle_count(), 1);

    let socket = factory.open().await.unwrap().unwrap();
    assert_eq!(socket.id(), id);
    assert_eq!(factory.connect_count_total(), 1);
}

#[tokio::test]
async fn untrusted_backend_certificate_fails_connect() {
    let served = self_signed("localhost");
    let other = self_signed("localhost");
    let port = spawn_tls_backend(&served).await;

    let temp_dir = tempfile::tempdir().unwrap();
    let ca_path = temp_dir.path().join("other-ca.pem");
    std::fs::write(&ca_path, &other.pem).unwrap();

    let group = BackendGroup::from_config_unmetered(&secure_config(&ca_path, port)).unwrap();
    let factory = group.get("secure-a").unwrap();

    assert!(factory.open().await.unwrap().is_none());
    assert_eq!(factory.state(), BackendState::Fail);
    assert_eq!(factory.fail_count_total(), 1);
}

#[test]
fn empty_ca_file_is_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let ca_path = temp_dir.path().join("empty.pem");
    std::fs::write(&ca_path, "").unwrap();

    let err = BackendGroup::from_config_unmetered(&secure_config(&ca_path, 6800)).unwrap_err();
    assert!(err.to_string().contains("No certificates"));
}
