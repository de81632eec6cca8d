use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use secure_chat_relay::{
    client::ChatClient,
    credential::ServerCredential,
    crypto::MAX_PLAINTEXT_LEN,
    listener::Listener,
    message::{ChatMessage, frame_reader, frame_writer, read_frame, write_frame},
    registry::Registry,
    session::DeliveryPolicy,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(3);
const QUIET_PERIOD: Duration = Duration::from_millis(300);

struct Relay {
    addr: SocketAddr,
    registry: Registry,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

async fn start_relay() -> Result<Relay> {
    start_relay_with(DeliveryPolicy::default()).await
}

async fn start_relay_with(policy: DeliveryPolicy) -> Result<Relay> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let credential = Arc::new(ServerCredential::generate("relay-test"));
    let server = Listener::new(listener, credential).with_delivery_policy(policy);
    let addr = server.local_addr()?;
    let registry = server.registry();
    let (shutdown, signal) = oneshot::channel::<()>();
    let task = tokio::spawn(server.run_until(async {
        let _ = signal.await;
    }));
    Ok(Relay {
        addr,
        registry,
        shutdown,
        task,
    })
}

async fn wait_for_len(registry: &Registry, expected: usize) -> Result<()> {
    timeout(READ_TIMEOUT, async {
        while registry.len().await != expected {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .map_err(|_| anyhow!("registry never reached {expected} sessions"))
}

async fn join(relay: &Relay, username: &str, expected_len: usize) -> Result<ChatClient> {
    let client = ChatClient::connect(relay.addr, username)
        .await
        .with_context(|| format!("{username} handshake"))?;
    wait_for_len(&relay.registry, expected_len).await?;
    Ok(client)
}

async fn next_line(client: &mut ChatClient, description: &str) -> Result<String> {
    match timeout(READ_TIMEOUT, client.recv()).await {
        Ok(Ok(Some(line))) => Ok(line),
        Ok(Ok(None)) => Err(anyhow!("{description}: connection closed")),
        Ok(Err(err)) => Err(anyhow!("{description}: {err}")),
        Err(_) => Err(anyhow!("{description}: timed out")),
    }
}

async fn assert_silent(client: &mut ChatClient, description: &str) -> Result<()> {
    match timeout(QUIET_PERIOD, client.recv()).await {
        Err(_) => Ok(()),
        Ok(received) => Err(anyhow!("{description}: unexpected {received:?}")),
    }
}

#[tokio::test]
async fn text_logout_and_who_is_in() -> Result<()> {
    let relay = start_relay().await?;

    let mut alice = join(&relay, "alice", 1).await?;
    let mut bob = join(&relay, "bob", 2).await?;
    let mut carol = join(&relay, "carol", 3).await?;
    assert_eq!(alice.certificate().subject, "relay-test");

    alice.send(&ChatMessage::text("hi")).await?;
    for client in [&mut alice, &mut bob, &mut carol] {
        let line = next_line(client, "first broadcast").await?;
        assert!(line.ends_with(" - alice: hi\n"), "{line:?}");
    }

    bob.logout().await?;
    wait_for_len(&relay.registry, 2).await?;

    alice.send(&ChatMessage::text("hi all")).await?;
    for client in [&mut alice, &mut carol] {
        let line = next_line(client, "broadcast").await?;
        assert!(line.ends_with(" - alice: hi all\n"), "{line:?}");
        assert_eq!(line.find(" - "), Some(8));
    }

    carol.send(&ChatMessage::who_is_in()).await?;
    let header = next_line(&mut carol, "who is in header").await?;
    assert!(header.starts_with("List of the users connected at "), "{header:?}");
    let first = next_line(&mut carol, "first entry").await?;
    assert!(first.starts_with("1) alice since "), "{first:?}");
    let second = next_line(&mut carol, "second entry").await?;
    assert!(second.starts_with("2) carol since "), "{second:?}");

    // The listing went to carol alone.
    assert_silent(&mut alice, "alice after carol's WHOISIN").await?;

    // Nothing follows the two entries: carol's next frame is the next broadcast.
    alice.send(&ChatMessage::text("bye")).await?;
    let after = next_line(&mut carol, "broadcast after listing").await?;
    assert!(after.ends_with(" - alice: bye\n"), "{after:?}");

    let _ = relay.shutdown.send(());
    relay.task.await??;
    wait_for_len(&relay.registry, 0).await?;
    Ok(())
}

#[tokio::test]
async fn bad_hello_is_dropped_without_registration() -> Result<()> {
    let relay = start_relay().await?;

    let stream = TcpStream::connect(relay.addr).await?;
    let (reader, writer) = stream.into_split();
    let mut reader = frame_reader(reader);
    let mut writer = frame_writer(writer);
    write_frame(&mut writer, &b"HELLA"[..]).await?;

    let reply = timeout(READ_TIMEOUT, read_frame(&mut reader))
        .await
        .context("waiting for the server to hang up")?;
    assert!(matches!(reply, Ok(None) | Err(_)), "{reply:?}");
    assert!(relay.registry.is_empty().await);

    // The relay keeps serving after a failed handshake.
    let mut dave = join(&relay, "dave", 1).await?;
    dave.send(&ChatMessage::text("still up?")).await?;
    let line = next_line(&mut dave, "echo").await?;
    assert!(line.ends_with(" - dave: still up?\n"), "{line:?}");

    let _ = relay.shutdown.send(());
    relay.task.await??;
    Ok(())
}

#[tokio::test]
async fn shutdown_closes_connected_clients() -> Result<()> {
    let relay = start_relay().await?;
    let mut erin = join(&relay, "erin", 1).await?;

    let _ = relay.shutdown.send(());
    relay.task.await??;

    let end = timeout(READ_TIMEOUT, erin.recv())
        .await
        .context("waiting for the server to close")?;
    assert!(matches!(end, Ok(None) | Err(_)));
    assert!(
        TcpStream::connect(relay.addr).await.is_err(),
        "listener still accepting after shutdown"
    );
    Ok(())
}

#[tokio::test]
async fn oversized_message_only_affects_its_sender() -> Result<()> {
    for policy in [DeliveryPolicy::Prune, DeliveryPolicy::LogOnly] {
        let relay = start_relay_with(policy).await?;
        let mut alice = join(&relay, "alice", 1).await?;
        let mut carol = join(&relay, "carol", 2).await?;
        let mut mallory = join(&relay, "mallory-with-a-long-name", 3).await?;

        // Fits in one client frame, but not once the server prefixes the
        // timestamp and the sender's name.
        let overhead = ChatMessage::text("").encode()?.len();
        let flood = "x".repeat(MAX_PLAINTEXT_LEN - overhead);
        mallory.send(&ChatMessage::text(flood)).await?;

        assert_silent(&mut alice, "alice after the flood").await?;
        assert_eq!(relay.registry.len().await, 3, "{policy:?}");

        // The sender's session handles its frames in order, so this line is
        // broadcast only after the flood was refused.
        mallory.send(&ChatMessage::text("sorry")).await?;
        for (client, who) in [
            (&mut alice, "alice"),
            (&mut carol, "carol"),
            (&mut mallory, "mallory"),
        ] {
            let line = next_line(client, who).await?;
            assert!(
                line.ends_with(" - mallory-with-a-long-name: sorry\n"),
                "{policy:?} {who}: {line:?}"
            );
        }
        assert_eq!(relay.registry.len().await, 3, "{policy:?}");

        let _ = relay.shutdown.send(());
        relay.task.await??;
    }
    Ok(())
}
