use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use quic_relay::{
    config::RelayConfig,
    message::{Envelope, EnvelopeReader, MessageKind, write_envelope},
    server::RelayServer,
    store::MemoryBlobStore,
    transport::quic::{TlsIdentity, client_config},
};
use quinn::{Endpoint, RecvStream, SendStream};
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

async fn connect(
    addr: SocketAddr,
    identity: &TlsIdentity,
) -> Result<(Endpoint, quinn::Connection)> {
    let mut endpoint = Endpoint::client("127.0.0.1:0".parse()?)?;
    endpoint.set_default_client_config(client_config(identity.certificate())?);
    let connection = endpoint.connect(addr, "localhost")?.await?;
    Ok((endpoint, connection))
}

async fn next(reader: &mut EnvelopeReader<RecvStream>) -> Result<Envelope> {
    let envelope = timeout(READ_TIMEOUT, reader.next_envelope())
        .await??
        .expect("server should send an envelope");
    Ok(envelope)
}

#[tokio::test]
async fn peers_chat_and_share_files_over_quic() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let identity =
        TlsIdentity::load_or_generate(&dir.path().join("cert.pem"), &dir.path().join("key.pem"))?;
    let config = RelayConfig {
        listen: "127.0.0.1:0".parse()?,
        ..RelayConfig::default()
    };
    let server = RelayServer::bind(&config, &identity, Arc::new(MemoryBlobStore::new()))?;
    let addr = server.local_addr()?;
    let hub = server.hub();

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let relay = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.await;
        };
        server.run_until(shutdown).await
    });

    let (alice_endpoint, alice) = connect(addr, &identity).await?;
    let (bob_endpoint, bob) = connect(addr, &identity).await?;

    let (mut alice_send, alice_recv): (SendStream, RecvStream) = alice.open_bi().await?;
    let mut alice_recv = EnvelopeReader::new(alice_recv);
    write_envelope(&mut alice_send, &Envelope::new(MessageKind::Join, "lobby", "", "A")).await?;
    assert_eq!(next(&mut alice_recv).await?.payload, r#"["A"]"#);

    let (mut bob_send, bob_recv) = bob.open_bi().await?;
    let mut bob_recv = EnvelopeReader::new(bob_recv);
    write_envelope(&mut bob_send, &Envelope::new(MessageKind::Join, "lobby", "", "B")).await?;
    assert_eq!(next(&mut bob_recv).await?.payload, r#"["A","B"]"#);
    assert_eq!(next(&mut alice_recv).await?.payload, r#"["A","B"]"#);
    assert_eq!(hub.list_peer_ids("lobby").await, vec!["A", "B"]);

    let hello = Envelope::new(MessageKind::Message, "lobby", "hi", "A");
    write_envelope(&mut alice_send, &hello).await?;
    assert_eq!(next(&mut bob_recv).await?, hello);

    let (mut upload, mut upload_done) = alice.open_bi().await?;
    write_envelope(&mut upload, &Envelope::new(MessageKind::Upload, "", "notes.txt", "A")).await?;
    upload.write_all(b"relay over quic").await?;
    upload.finish()?;
    timeout(READ_TIMEOUT, upload_done.read_to_end(1024)).await??;

    let (mut download, mut downloaded) = bob.open_bi().await?;
    write_envelope(&mut download, &Envelope::new(MessageKind::Download, "", "notes.txt", "B")).await?;
    let body = timeout(READ_TIMEOUT, downloaded.read_to_end(1024)).await??;
    assert_eq!(body, b"relay over quic");

    alice.close(0u32.into(), b"done");
    bob.close(0u32.into(), b"done");
    shutdown_tx.send(()).ok();
    timeout(READ_TIMEOUT, relay).await???;
    alice_endpoint.wait_idle().await;
    bob_endpoint.wait_idle().await;
    Ok(())
}
