use std::net::SocketAddr;

use tokio::{
    io::AsyncWriteExt,
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use crate::{
    credential::Certificate,
    crypto::{self, FrameOpener, FrameSealer, Role, SessionKey},
    error::{HandshakeError, HandshakeStep, SessionError},
    handshake::{DONE, HELLO, HELLO_DONE, expect_token, receive, send, unexpected},
    message::{
        ChatMessage, FrameReader, FrameWriter, frame_reader, frame_writer, read_frame, write_frame,
    },
};

/// Client end of an encrypted chat connection.
pub struct ChatClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    sealer: FrameSealer,
    opener: FrameOpener,
    certificate: Certificate,
}

impl ChatClient {
    /// Connects and performs the client half of the handshake as `username`.
    pub async fn connect(addr: SocketAddr, username: &str) -> Result<Self, HandshakeError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| HandshakeError::Io {
                step: HandshakeStep::Hello,
                source,
            })?;
        let (reader, writer) = stream.into_split();
        let mut reader = frame_reader(reader);
        let mut writer = frame_writer(writer);

        let (certificate, sealer, opener) = initiate(&mut reader, &mut writer, username).await?;
        Ok(Self {
            reader,
            writer,
            sealer,
            opener,
            certificate,
        })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub async fn send(&mut self, message: &ChatMessage) -> Result<(), SessionError> {
        let frame = self.sealer.seal(&message.encode()?)?;
        write_frame(&mut self.writer, frame).await?;
        Ok(())
    }

    /// Next text line from the server; `None` once the server closed the connection.
    pub async fn recv(&mut self) -> Result<Option<String>, SessionError> {
        let Some(frame) = read_frame(&mut self.reader).await? else {
            return Ok(None);
        };
        let plaintext = self.opener.open(&frame)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| SessionError::InvalidText)
    }

    pub async fn logout(mut self) -> Result<(), SessionError> {
        self.send(&ChatMessage::logout()).await?;
        self.writer.get_mut().shutdown().await?;
        Ok(())
    }
}

/// Client half of the handshake over already-framed halves.
pub async fn initiate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    username: &str,
) -> Result<(Certificate, FrameSealer, FrameOpener), HandshakeError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    send(writer, HELLO.to_vec(), HandshakeStep::Hello).await?;
    expect_token(reader, HELLO, HandshakeStep::Hello).await?;
    let certificate = receive(reader, HandshakeStep::Certificate).await?;
    let certificate = Certificate::from_bytes(&certificate).map_err(HandshakeError::Certificate)?;
    expect_token(reader, HELLO_DONE, HandshakeStep::Certificate).await?;

    let step = HandshakeStep::KeyTransport;
    let crypto_failure = |step| move |source| HandshakeError::Crypto { step, source };
    let server_key = certificate.public_key().map_err(crypto_failure(step))?;
    let session_key = SessionKey::generate();
    let sealed_iv = crypto::seal(&server_key, session_key.iv()).map_err(crypto_failure(step))?;
    let sealed_key = crypto::seal(&server_key, session_key.key()).map_err(crypto_failure(step))?;
    send(writer, sealed_iv, step).await?;
    send(writer, sealed_key, step).await?;
    let (mut sealer, mut opener) = session_key
        .split(Role::Client)
        .map_err(crypto_failure(step))?;

    let step = HandshakeStep::Confirmation;
    let done = sealer.seal(DONE).map_err(crypto_failure(step))?;
    send(writer, done, step).await?;
    let confirmation = receive(reader, step).await?;
    let confirmation = opener.open(&confirmation).map_err(crypto_failure(step))?;
    if confirmation != DONE {
        return Err(unexpected(step, &confirmation));
    }

    let step = HandshakeStep::Username;
    let username = sealer
        .seal(username.as_bytes())
        .map_err(crypto_failure(step))?;
    send(writer, username, step).await?;

    Ok((certificate, sealer, opener))
}
