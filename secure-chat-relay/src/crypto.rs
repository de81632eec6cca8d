//! Key transport and frame encryption.
//!
//! Session key material travels from client to server sealed to the server's
//! X25519 public key: an ephemeral key agreement, HKDF-SHA256 and AES-256-GCM.
//! Application frames are then encrypted with AES-256-GCM under the session
//! key. Each direction has its own frame counter which is folded into the IV,
//! so no nonce is ever used twice and replayed or reordered frames fail to
//! authenticate.

use std::fmt;

use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use rand::{RngCore, rngs::OsRng};
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::{error::CryptoError, message::MAX_FRAME_LEN};

pub const KEY_LEN: usize = 32;
pub const IV_LEN: usize = 12;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
/// Largest plaintext whose sealed frame still fits in one wire frame.
pub const MAX_PLAINTEXT_LEN: usize = MAX_FRAME_LEN - TAG_LEN;

const SEAL_INFO: &[u8] = b"secure-chat-relay/seal/v1";

const CLIENT_TO_SERVER: u8 = 0x01;
const SERVER_TO_CLIENT: u8 = 0x02;

/// Which end of the connection a cipher pair belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Encrypts `plaintext` so that only the holder of `recipient`'s secret can read it.
///
/// Output layout: `ephemeral_public(32) || aes-gcm ciphertext`.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(CryptoError::WeakSharedSecret);
    }

    let (cipher, nonce) = seal_cipher(shared.as_bytes(), &ephemeral_public, recipient)?;
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::Encrypt)?;

    let mut sealed = Vec::with_capacity(PUBLIC_KEY_LEN + ciphertext.len());
    sealed.extend_from_slice(ephemeral_public.as_bytes());
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Reverses [`seal`] with the recipient's static secret.
pub fn open(secret: &StaticSecret, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() <= PUBLIC_KEY_LEN {
        return Err(CryptoError::SealedTooShort(sealed.len()));
    }
    let (ephemeral_bytes, ciphertext) = sealed.split_at(PUBLIC_KEY_LEN);
    let mut ephemeral = [0u8; PUBLIC_KEY_LEN];
    ephemeral.copy_from_slice(ephemeral_bytes);
    let ephemeral_public = PublicKey::from(ephemeral);

    let shared = secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(CryptoError::WeakSharedSecret);
    }

    let recipient = PublicKey::from(secret);
    let (cipher, nonce) = seal_cipher(shared.as_bytes(), &ephemeral_public, &recipient)?;
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext)
        .map_err(|_| CryptoError::Decrypt)
}

fn seal_cipher(
    shared: &[u8; 32],
    ephemeral: &PublicKey,
    recipient: &PublicKey,
) -> Result<(Aes256Gcm, [u8; IV_LEN]), CryptoError> {
    let mut salt = [0u8; 2 * PUBLIC_KEY_LEN];
    salt[..PUBLIC_KEY_LEN].copy_from_slice(ephemeral.as_bytes());
    salt[PUBLIC_KEY_LEN..].copy_from_slice(recipient.as_bytes());

    let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; KEY_LEN + IV_LEN]);
    hkdf.expand(SEAL_INFO, &mut okm[..])
        .map_err(|_| CryptoError::KeyDerivation)?;

    let cipher =
        Aes256Gcm::new_from_slice(&okm[..KEY_LEN]).map_err(|_| CryptoError::KeyDerivation)?;
    let mut nonce = [0u8; IV_LEN];
    nonce.copy_from_slice(&okm[KEY_LEN..]);
    Ok((cipher, nonce))
}

/// Symmetric secret shared by one client and the server for one connection.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    pub fn from_parts(key: &[u8], iv: &[u8]) -> Result<Self, CryptoError> {
        let key: [u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::KeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        let iv: [u8; IV_LEN] = iv.try_into().map_err(|_| CryptoError::KeyLength {
            expected: IV_LEN,
            actual: iv.len(),
        })?;
        Ok(Self { key, iv })
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    /// Builds the outbound and inbound frame ciphers for `role`.
    pub fn split(&self, role: Role) -> Result<(FrameSealer, FrameOpener), CryptoError> {
        let (outbound, inbound) = match role {
            Role::Client => (CLIENT_TO_SERVER, SERVER_TO_CLIENT),
            Role::Server => (SERVER_TO_CLIENT, CLIENT_TO_SERVER),
        };
        let sealer = FrameSealer {
            state: FrameState::new(&self.key, self.iv, outbound)?,
        };
        let opener = FrameOpener {
            state: FrameState::new(&self.key, self.iv, inbound)?,
        };
        Ok((sealer, opener))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKey").finish_non_exhaustive()
    }
}

struct FrameState {
    cipher: Aes256Gcm,
    iv: Zeroizing<[u8; IV_LEN]>,
    direction: u8,
    counter: u64,
}

impl FrameState {
    fn new(key: &[u8; KEY_LEN], iv: [u8; IV_LEN], direction: u8) -> Result<Self, CryptoError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::KeyLength {
            expected: KEY_LEN,
            actual: key.len(),
        })?;
        Ok(Self {
            cipher,
            iv: Zeroizing::new(iv),
            direction,
            counter: 0,
        })
    }

    fn nonce(&self) -> [u8; IV_LEN] {
        let mut nonce = *self.iv;
        nonce[0] ^= self.direction;
        for (slot, byte) in nonce[4..].iter_mut().zip(self.counter.to_be_bytes()) {
            *slot ^= byte;
        }
        nonce
    }

    fn next_counter(&self) -> Result<u64, CryptoError> {
        self.counter
            .checked_add(1)
            .ok_or(CryptoError::CounterExhausted)
    }
}

/// Encrypts outbound frames.
pub struct FrameSealer {
    state: FrameState,
}

impl FrameSealer {
    /// Encrypts one frame. An oversized plaintext is rejected before the
    /// counter moves, so the peer stays in step.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if plaintext.len() > MAX_PLAINTEXT_LEN {
            return Err(CryptoError::FrameTooLarge {
                len: plaintext.len(),
                max: MAX_PLAINTEXT_LEN,
            });
        }
        let next = self.state.next_counter()?;
        let nonce = self.state.nonce();
        let ciphertext = self
            .state
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::Encrypt)?;
        self.state.counter = next;
        Ok(ciphertext)
    }
}

/// Decrypts inbound frames, in order.
pub struct FrameOpener {
    state: FrameState,
}

impl FrameOpener {
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let next = self.state.next_counter()?;
        let nonce = self.state.nonce();
        let plaintext = self
            .state
            .cipher
            .decrypt(Nonce::from_slice(&nonce), frame)
            .map_err(|_| CryptoError::Decrypt)?;
        self.state.counter = next;
        Ok(plaintext)
    }
}
