//! Certificate authority over the wire, mutual TLS, and CRL-backed
//! rejection of revoked peers.

use chaski::ca::{CaConfig, CertificateAuthority};
use chaski::net::{Node, NodeConfig};
use chaski::net::envelope::{CertificateOutcome, CertificateRequestPayload, SubjectAttributes};
use chaski::tls::TlsContext;
use chaski::types::NodeClass;
use std::path::Path;
use std::time::Duration;
use tokio::time::timeout;

fn subject(cn: &str) -> SubjectAttributes {
    SubjectAttributes {
        country: "CL".into(),
        state: "Nuble".into(),
        locality: "Chillan".into(),
        organization: "Chaski".into(),
        common_name: cn.into(),
    }
}

/// Issue TLS material for a node directly against the CA state (the
/// offline equivalent of `request_ssl_certificate`).
fn provision(ca: &mut CertificateAuthority, ssl_dir: &Path, cn: &str) -> u64 {
    let outcome = ca.handle_request(&CertificateRequestPayload {
        subject: subject(cn),
        ip: "127.0.0.1".into(),
        csr_pem: None,
    });
    let CertificateOutcome::Issued {
        serial,
        cert_pem,
        key_pem,
        root_pem,
    } = outcome
    else {
        panic!("issuance rejected");
    };
    std::fs::create_dir_all(ssl_dir).unwrap();
    std::fs::write(ssl_dir.join("node.crt"), cert_pem).unwrap();
    std::fs::write(ssl_dir.join("node.key"), key_pem.unwrap()).unwrap();
    std::fs::write(ssl_dir.join("ca.crt"), root_pem).unwrap();
    std::fs::write(ssl_dir.join("crl.pem"), ca.crl_pem()).unwrap();
    serial
}

fn tls_config(subs: &[&str], ssl_dir: &Path) -> NodeConfig {
    NodeConfig {
        class: NodeClass::Streamer,
        subscriptions: subs.iter().map(|s| s.to_string()).collect(),
        ssl_location: Some(ssl_dir.to_path_buf()),
        reconnections: Some(0),
        ..Default::default()
    }
}

#[tokio::test]
async fn certificate_issued_over_the_wire() {
    let ca_dir = tempfile::tempdir().unwrap();
    let ssl_dir = tempfile::tempdir().unwrap();

    let ca_state = CertificateAuthority::open(CaConfig::new(ca_dir.path())).unwrap();
    let ca_node = Node::start_with(
        NodeConfig {
            class: NodeClass::Ca,
            ..Default::default()
        },
        Some(ca_state),
        None,
    )
    .await
    .unwrap();

    // X has an ssl_location but no material yet: provisioning mode.
    let x = Node::start(tls_config(&[], ssl_dir.path())).await.unwrap();
    let serial = x
        .request_ssl_certificate(&ca_node.address().to_string())
        .await
        .unwrap();

    for file in ["node.key", "node.crt", "ca.crt", "crl.pem"] {
        assert!(ssl_dir.path().join(file).exists(), "{file} missing");
    }
    assert!(ca_dir
        .path()
        .join("issued")
        .join(format!("{serial}.crt"))
        .exists());

    // The issued material is a working mutual-TLS identity.
    TlsContext::from_dir(ssl_dir.path()).unwrap();

    // Revocation over the wire shows up in a fresh CRL fetch.
    let crl_before = x
        .request_crl(&ca_node.address().to_string())
        .await
        .unwrap();
    x.revoke_certificate(&ca_node.address().to_string(), serial)
        .await
        .unwrap();
    let changed = {
        let mut crl_after = String::new();
        // Revocation is fire-and-forget; poll briefly.
        for _ in 0..20 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            crl_after = x
                .request_crl(&ca_node.address().to_string())
                .await
                .unwrap();
            if crl_after != crl_before {
                break;
            }
        }
        crl_after != crl_before
    };
    assert!(changed, "CRL should change after revocation");

    x.stop();
    ca_node.stop();
}

#[tokio::test]
async fn mutual_tls_streams_and_crl_blocks_revoked_peer() {
    let ca_dir = tempfile::tempdir().unwrap();
    let x_dir = tempfile::tempdir().unwrap();
    let y_dir = tempfile::tempdir().unwrap();

    let mut ca = CertificateAuthority::open(CaConfig::new(ca_dir.path())).unwrap();
    let x_serial = provision(&mut ca, x_dir.path(), "node-x");
    provision(&mut ca, y_dir.path(), "node-y");

    // Phase 1: both certificates valid — TLS edges stream normally.
    {
        let x = Node::start(tls_config(&["t"], x_dir.path())).await.unwrap();
        let y = Node::start(tls_config(&["t"], y_dir.path())).await.unwrap();

        x.connect(&format!("*{}", y.address())).await.unwrap();
        x.push("t", b"over tls").await.unwrap();
        let msg = timeout(Duration::from_secs(2), y.recv())
            .await
            .expect("message should arrive over TLS")
            .unwrap();
        assert_eq!(msg.payload, b"over tls".to_vec());

        x.stop();
        y.stop();
    }

    // Phase 2: revoke X; Y reloads the CRL and must refuse X entirely.
    ca.revoke(x_serial).unwrap();
    std::fs::write(y_dir.path().join("crl.pem"), ca.crl_pem()).unwrap();

    let x = Node::start(tls_config(&["t"], x_dir.path())).await.unwrap();
    let y = Node::start(tls_config(&["t"], y_dir.path())).await.unwrap();

    let connect_result = x.connect(&format!("*{}", y.address())).await;
    assert!(
        connect_result.is_err(),
        "revoked client certificate must fail the handshake"
    );

    // Y never built an edge and never delivered anything from X.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(y.edge_count(), 0);
    assert!(y.try_recv().is_none());

    x.stop();
    y.stop();
}
