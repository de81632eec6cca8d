//! Server side of the key-exchange handshake.
//!
//! One pass, in this order, before any application frame is accepted:
//!
//! 1. client → `HELLO`
//! 2. server → `HELLO`, certificate, `HELLODONE`
//! 3. client → IV and session key, each sealed to the certificate's public key
//! 4. client → `DONE` encrypted under the session key
//! 5. server → `DONE` encrypted under the session key
//! 6. client → username encrypted under the session key
//!
//! The first failure ends the attempt. Nothing is retried.

use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use zeroize::Zeroizing;

use crate::{
    credential::ServerCredential,
    crypto::{self, FrameOpener, FrameSealer, Role, SessionKey},
    error::{HandshakeError, HandshakeStep},
    message::{FrameReader, FrameWriter, read_frame, write_frame},
};

pub const HELLO: &[u8] = b"HELLO";
pub const HELLO_DONE: &[u8] = b"HELLODONE";
pub const DONE: &[u8] = b"DONE";

/// Longest accepted username, in bytes.
pub const MAX_USERNAME_LEN: usize = 64;

/// Result of a completed handshake: who the peer is and the ciphers to talk to it.
pub struct Established {
    pub username: String,
    pub sealer: FrameSealer,
    pub opener: FrameOpener,
}

#[derive(Clone)]
pub struct HandshakeEngine {
    credential: Arc<ServerCredential>,
}

impl HandshakeEngine {
    pub fn new(credential: Arc<ServerCredential>) -> Self {
        Self { credential }
    }

    pub fn credential(&self) -> &ServerCredential {
        &self.credential
    }

    pub async fn accept<R, W>(
        &self,
        reader: &mut FrameReader<R>,
        writer: &mut FrameWriter<W>,
    ) -> Result<Established, HandshakeError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        expect_token(reader, HELLO, HandshakeStep::Hello).await?;

        let certificate = self
            .credential
            .certificate()
            .to_bytes()
            .map_err(HandshakeError::Certificate)?;
        send(writer, HELLO.to_vec(), HandshakeStep::Certificate).await?;
        send(writer, certificate, HandshakeStep::Certificate).await?;
        send(writer, HELLO_DONE.to_vec(), HandshakeStep::Certificate).await?;

        let session_key = self.receive_session_key(reader).await?;
        let (mut sealer, mut opener) = session_key
            .split(Role::Server)
            .map_err(|source| HandshakeError::Crypto {
                step: HandshakeStep::KeyTransport,
                source,
            })?;
        drop(session_key);

        let done = receive(reader, HandshakeStep::Confirmation).await?;
        let done = opener
            .open(&done)
            .map_err(|source| HandshakeError::Crypto {
                step: HandshakeStep::Confirmation,
                source,
            })?;
        if done != DONE {
            return Err(unexpected(HandshakeStep::Confirmation, &done));
        }

        let confirmation = sealer
            .seal(DONE)
            .map_err(|source| HandshakeError::Crypto {
                step: HandshakeStep::Confirmation,
                source,
            })?;
        send(writer, confirmation, HandshakeStep::Confirmation).await?;

        let username = receive(reader, HandshakeStep::Username).await?;
        let username = opener
            .open(&username)
            .map_err(|source| HandshakeError::Crypto {
                step: HandshakeStep::Username,
                source,
            })?;
        let username = String::from_utf8(username).map_err(|_| HandshakeError::InvalidUsername)?;
        if username.is_empty() || username.len() > MAX_USERNAME_LEN {
            return Err(HandshakeError::InvalidUsername);
        }

        Ok(Established {
            username,
            sealer,
            opener,
        })
    }

    async fn receive_session_key<R>(
        &self,
        reader: &mut FrameReader<R>,
    ) -> Result<SessionKey, HandshakeError>
    where
        R: AsyncRead + Unpin,
    {
        let step = HandshakeStep::KeyTransport;
        let sealed_iv = receive(reader, step).await?;
        let sealed_key = receive(reader, step).await?;

        let secret = self.credential.secret();
        let crypto_failure = |source| HandshakeError::Crypto { step, source };
        let iv = Zeroizing::new(crypto::open(secret, &sealed_iv).map_err(crypto_failure)?);
        let key = Zeroizing::new(crypto::open(secret, &sealed_key).map_err(crypto_failure)?);
        SessionKey::from_parts(&key, &iv).map_err(crypto_failure)
    }
}

pub(crate) async fn receive<R>(
    reader: &mut FrameReader<R>,
    step: HandshakeStep,
) -> Result<BytesMut, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    match read_frame(reader).await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(HandshakeError::ConnectionClosed { step }),
        Err(source) => Err(HandshakeError::Io { step, source }),
    }
}

pub(crate) async fn send<W>(
    writer: &mut FrameWriter<W>,
    frame: Vec<u8>,
    step: HandshakeStep,
) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, frame)
        .await
        .map_err(|source| HandshakeError::Io { step, source })
}

pub(crate) async fn expect_token<R>(
    reader: &mut FrameReader<R>,
    token: &[u8],
    step: HandshakeStep,
) -> Result<(), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let frame = receive(reader, step).await?;
    if &frame[..] != token {
        return Err(unexpected(step, &frame));
    }
    Ok(())
}

pub(crate) fn unexpected(step: HandshakeStep, actual: &[u8]) -> HandshakeError {
    HandshakeError::UnexpectedToken {
        step,
        actual: String::from_utf8_lossy(actual).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        credential::Certificate,
        message::{frame_reader, frame_writer},
    };
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf};

    type Reader = FrameReader<ReadHalf<DuplexStream>>;
    type Writer = FrameWriter<WriteHalf<DuplexStream>>;

    fn pipe() -> ((Reader, Writer), (Reader, Writer)) {
        let (near, far) = tokio::io::duplex(16 * 1024);
        let (near_rx, near_tx) = tokio::io::split(near);
        let (far_rx, far_tx) = tokio::io::split(far);
        (
            (frame_reader(near_rx), frame_writer(near_tx)),
            (frame_reader(far_rx), frame_writer(far_tx)),
        )
    }

    fn engine() -> HandshakeEngine {
        HandshakeEngine::new(Arc::new(ServerCredential::generate("handshake-test")))
    }

    fn spawn_server(
        engine: HandshakeEngine,
        mut reader: Reader,
        mut writer: Writer,
    ) -> tokio::task::JoinHandle<Result<Established, HandshakeError>> {
        tokio::spawn(async move { engine.accept(&mut reader, &mut writer).await })
    }

    async fn hello(reader: &mut Reader, writer: &mut Writer) -> Certificate {
        write_frame(writer, HELLO).await.expect("hello");
        let frame = read_frame(reader).await.expect("read").expect("hello back");
        assert_eq!(&frame[..], HELLO);
        let certificate = read_frame(reader).await.expect("read").expect("certificate");
        let certificate = Certificate::from_bytes(&certificate).expect("certificate");
        let frame = read_frame(reader).await.expect("read").expect("hellodone");
        assert_eq!(&frame[..], HELLO_DONE);
        certificate
    }

    async fn transport_key(writer: &mut Writer, certificate: &Certificate, key: &SessionKey) {
        let public = certificate.public_key().expect("public key");
        write_frame(writer, crypto::seal(&public, key.iv()).expect("seal iv"))
            .await
            .expect("iv");
        write_frame(writer, crypto::seal(&public, key.key()).expect("seal key"))
            .await
            .expect("key");
    }

    #[tokio::test]
    async fn completes_all_steps_and_yields_username() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        let certificate = hello(&mut reader, &mut writer).await;
        assert_eq!(certificate.subject, "handshake-test");

        let key = SessionKey::generate();
        transport_key(&mut writer, &certificate, &key).await;
        let (mut sealer, mut opener) = key.split(Role::Client).expect("split");

        write_frame(&mut writer, sealer.seal(DONE).expect("seal"))
            .await
            .expect("done");
        let confirmation = read_frame(&mut reader).await.expect("read").expect("done");
        assert_eq!(opener.open(&confirmation).expect("open"), DONE);

        write_frame(&mut writer, sealer.seal(b"alice").expect("seal"))
            .await
            .expect("username");

        let established = task.await.expect("join").expect("handshake");
        assert_eq!(established.username, "alice");
    }

    #[tokio::test]
    async fn wrong_greeting_fails_before_certificate_is_sent() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        write_frame(&mut writer, &b"HELLA"[..]).await.expect("hella");
        let err = task.await.expect("join").err().expect("must fail");
        assert_eq!(err.step(), HandshakeStep::Hello);
        assert!(matches!(err, HandshakeError::UnexpectedToken { ref actual, .. } if actual == "HELLA"));

        // The server half has been dropped without writing anything.
        assert!(read_frame(&mut reader).await.expect("read").is_none());
    }

    #[tokio::test]
    async fn garbage_key_transport_is_a_crypto_failure() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        hello(&mut reader, &mut writer).await;
        write_frame(&mut writer, vec![1u8; 80]).await.expect("iv");
        write_frame(&mut writer, vec![2u8; 80]).await.expect("key");

        let err = task.await.expect("join").err().expect("must fail");
        assert!(matches!(
            err,
            HandshakeError::Crypto {
                step: HandshakeStep::KeyTransport,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn confirmation_under_another_key_is_rejected() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        let certificate = hello(&mut reader, &mut writer).await;
        transport_key(&mut writer, &certificate, &SessionKey::generate()).await;

        let (mut wrong, _) = SessionKey::generate().split(Role::Client).expect("split");
        write_frame(&mut writer, wrong.seal(DONE).expect("seal"))
            .await
            .expect("done");

        let err = task.await.expect("join").err().expect("must fail");
        assert_eq!(err.step(), HandshakeStep::Confirmation);
    }

    #[tokio::test]
    async fn wrong_confirmation_literal_is_rejected() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        let certificate = hello(&mut reader, &mut writer).await;
        let key = SessionKey::generate();
        transport_key(&mut writer, &certificate, &key).await;
        let (mut sealer, _) = key.split(Role::Client).expect("split");
        write_frame(&mut writer, sealer.seal(b"NOPE").expect("seal"))
            .await
            .expect("done");

        let err = task.await.expect("join").err().expect("must fail");
        assert!(matches!(
            err,
            HandshakeError::UnexpectedToken {
                step: HandshakeStep::Confirmation,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn disconnect_before_username_fails_the_attempt() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        let certificate = hello(&mut reader, &mut writer).await;
        let key = SessionKey::generate();
        transport_key(&mut writer, &certificate, &key).await;
        let (mut sealer, _) = key.split(Role::Client).expect("split");
        write_frame(&mut writer, sealer.seal(DONE).expect("seal"))
            .await
            .expect("done");
        read_frame(&mut reader).await.expect("read").expect("confirmation");
        drop(writer);
        drop(reader);

        let err = task.await.expect("join").err().expect("must fail");
        assert!(matches!(
            err,
            HandshakeError::ConnectionClosed {
                step: HandshakeStep::Username
            }
        ));
    }

    #[tokio::test]
    async fn overlong_username_is_rejected() {
        let (server, (mut reader, mut writer)) = pipe();
        let task = spawn_server(engine(), server.0, server.1);

        let certificate = hello(&mut reader, &mut writer).await;
        let key = SessionKey::generate();
        transport_key(&mut writer, &certificate, &key).await;
        let (mut sealer, _) = key.split(Role::Client).expect("split");
        write_frame(&mut writer, sealer.seal(DONE).expect("seal"))
            .await
            .expect("done");
        read_frame(&mut reader).await.expect("read").expect("confirmation");

        let name = "m".repeat(MAX_USERNAME_LEN + 1);
        write_frame(&mut writer, sealer.seal(name.as_bytes()).expect("seal"))
            .await
            .expect("username");

        let err = task.await.expect("join").err().expect("must fail");
        assert!(matches!(err, HandshakeError::InvalidUsername));
        assert_eq!(err.step(), HandshakeStep::Username);
    }
}
