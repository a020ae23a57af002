//! Secure stream — Noise_XX over a framed byte stream.
//!
//! Frame format (handshake and transport alike):
//!   [u16 length BE] [payload]
//!
//! Handshake: initiator → msg1, responder → msg2 (+ local id), initiator →
//! msg3 (+ local id). After that every frame is one encrypted message, and
//! each direction counts its own nonces, so reader and writer can be split.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::crypto::{
    CryptoError, LocalId, NoiseInitiator, NoiseResponder, Session, SessionIdentity, MAX_NOISE_MSG,
    TAG_LEN,
};
use crate::transport::BoxTransport;

/// Largest plaintext that fits in one frame.
pub const MAX_PLAINTEXT: usize = MAX_NOISE_MSG - TAG_LEN;

/// An authenticated, encrypted connection.
pub struct SecureStream {
    io: BoxTransport,
    session: Arc<Session>,
    send_nonce: u64,
    recv_nonce: u64,
    initiator: bool,
}

impl SecureStream {
    /// Run the handshake as the initiator.
    pub async fn initiate(
        mut io: BoxTransport,
        identity: &SessionIdentity,
    ) -> Result<Self, SecureError> {
        let (noise, msg1) = NoiseInitiator::new(&identity.keypair)?;
        write_frame(&mut io, &msg1).await?;

        let msg2 = read_frame(&mut io).await?.ok_or(SecureError::Closed)?;
        let (session, msg3) = noise.finish(&msg2, &identity.local_id)?;
        write_frame(&mut io, &msg3).await?;

        tracing::trace!(peer = crate::short_hex(&session.peer_id), "handshake complete (initiator)");
        Ok(Self::established(io, session, true))
    }

    /// Run the handshake as the responder.
    pub async fn accept(
        mut io: BoxTransport,
        identity: &SessionIdentity,
    ) -> Result<Self, SecureError> {
        let msg1 = read_frame(&mut io).await?.ok_or(SecureError::Closed)?;
        let (pending, msg2) = NoiseResponder::new(&identity.keypair)?
            .respond(&msg1, &identity.local_id)?;
        write_frame(&mut io, &msg2).await?;

        let msg3 = read_frame(&mut io).await?.ok_or(SecureError::Closed)?;
        let session = pending.finish(&msg3)?;

        tracing::trace!(peer = crate::short_hex(&session.peer_id), "handshake complete (responder)");
        Ok(Self::established(io, session, false))
    }

    /// Run whichever side of the handshake `initiator` selects.
    pub async fn handshake(
        io: BoxTransport,
        identity: &SessionIdentity,
        initiator: bool,
    ) -> Result<Self, SecureError> {
        if initiator {
            Self::initiate(io, identity).await
        } else {
            Self::accept(io, identity).await
        }
    }

    fn established(io: BoxTransport, session: Session, initiator: bool) -> Self {
        Self {
            io,
            session: Arc::new(session),
            send_nonce: 0,
            recv_nonce: 0,
            initiator,
        }
    }

    /// The verified local id the peer presented.
    pub fn peer_id(&self) -> &LocalId {
        &self.session.peer_id
    }

    /// The peer's Noise static key.
    pub fn remote_static(&self) -> &[u8; 32] {
        &self.session.remote_static
    }

    /// Identical on both ends of the same stream.
    pub fn handshake_hash(&self) -> &[u8; 32] {
        &self.session.handshake_hash
    }

    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), SecureError> {
        send_sealed(&mut self.io, &self.session, &mut self.send_nonce, plaintext).await
    }

    /// Next decrypted message, or `None` when the peer closed cleanly.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, SecureError> {
        recv_sealed(&mut self.io, &self.session, &mut self.recv_nonce).await
    }

    /// Split into independently owned halves.
    pub fn into_split(self) -> (SecureReader, SecureWriter) {
        let (read, write) = tokio::io::split(self.io);
        (
            SecureReader {
                io: read,
                session: self.session.clone(),
                nonce: self.recv_nonce,
            },
            SecureWriter {
                io: write,
                session: self.session,
                nonce: self.send_nonce,
            },
        )
    }
}

pub struct SecureReader {
    io: ReadHalf<BoxTransport>,
    session: Arc<Session>,
    nonce: u64,
}

impl SecureReader {
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, SecureError> {
        recv_sealed(&mut self.io, &self.session, &mut self.nonce).await
    }
}

pub struct SecureWriter {
    io: WriteHalf<BoxTransport>,
    session: Arc<Session>,
    nonce: u64,
}

impl SecureWriter {
    pub async fn send(&mut self, plaintext: &[u8]) -> Result<(), SecureError> {
        send_sealed(&mut self.io, &self.session, &mut self.nonce, plaintext).await
    }

    pub async fn shutdown(&mut self) -> Result<(), SecureError> {
        self.io.shutdown().await?;
        Ok(())
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

async fn send_sealed<W: AsyncWrite + Unpin>(
    io: &mut W,
    session: &Session,
    nonce: &mut u64,
    plaintext: &[u8],
) -> Result<(), SecureError> {
    if plaintext.len() > MAX_PLAINTEXT {
        return Err(SecureError::FrameTooLarge(plaintext.len()));
    }
    let mut sealed = Vec::with_capacity(plaintext.len() + TAG_LEN);
    session.encrypt(*nonce, plaintext, &mut sealed)?;
    *nonce += 1;
    write_frame(io, &sealed).await
}

async fn recv_sealed<R: AsyncRead + Unpin>(
    io: &mut R,
    session: &Session,
    nonce: &mut u64,
) -> Result<Option<Vec<u8>>, SecureError> {
    let sealed = match read_frame(io).await? {
        Some(f) => f,
        None => return Ok(None),
    };
    let mut plaintext = Vec::with_capacity(sealed.len());
    session.decrypt(*nonce, &sealed, &mut plaintext)?;
    *nonce += 1;
    Ok(Some(plaintext))
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> Result<(), SecureError> {
    let len = u16::try_from(data.len()).map_err(|_| SecureError::FrameTooLarge(data.len()))?;
    io.write_u16(len).await?;
    io.write_all(data).await?;
    io.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `None` on EOF at a frame boundary.
pub async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> Result<Option<Vec<u8>>, SecureError> {
    let len = match io.read_u16().await {
        Ok(n) => n as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut buf = vec![0u8; len];
    io.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error("frame of {0} bytes exceeds the maximum")]
    FrameTooLarge(usize),

    #[error("peer closed the stream during the handshake")]
    Closed,
}
