//! X25519 + HKDF-SHA256 + ChaCha20-Poly1305 transform.
//!
//! Handshake blobs are `[version][32-byte X25519 public key]`. The requester's
//! ephemeral key and the responder's ephemeral key yield one shared secret per
//! request/response pair, so each direction of a session gets its own key:
//! the responder seals with it, the requester opens with it.
//!
//! Sealed payloads are `[8-byte big-endian counter][ciphertext + 16-byte tag]`.
//! Counters start at zero per direction and must strictly increase.

use crate::error::TransformError;
use crate::transform::BufferTransform;
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::Zeroizing;

/// Blob format version.
const BLOB_VERSION: u8 = 1;

/// Size of a handshake blob (version + public key).
const BLOB_LEN: usize = 1 + 32;

/// Size of the counter prefix on sealed payloads.
const COUNTER_LEN: usize = 8;

/// Poly1305 tag size.
const TAG_LEN: usize = 16;

/// HKDF info string binding derived keys to this transform.
const KDF_INFO: &[u8] = b"tether/chacha20poly1305/v1";

/// Builds the 12-byte AEAD nonce: four zero bytes then the little-endian counter.
fn construct_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..12].copy_from_slice(&counter.to_le_bytes());
    nonce
}

fn encode_blob(public: &PublicKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(BLOB_LEN);
    buf.put_u8(BLOB_VERSION);
    buf.put_slice(public.as_bytes());
    buf.freeze()
}

fn decode_blob(blob: &[u8]) -> Result<PublicKey, TransformError> {
    if blob.len() != BLOB_LEN {
        return Err(TransformError::MalformedBlob("unexpected length"));
    }
    if blob[0] != BLOB_VERSION {
        return Err(TransformError::MalformedBlob("unsupported version"));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&blob[1..]);
    Ok(PublicKey::from(key))
}

/// Derives the direction key from the shared secret, salted with both public keys.
fn derive_key(
    shared: &[u8; 32],
    requester: &PublicKey,
    responder: &PublicKey,
) -> Result<Zeroizing<[u8; 32]>, TransformError> {
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(requester.as_bytes());
    salt[32..].copy_from_slice(responder.as_bytes());

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(KDF_INFO, okm.as_mut())
        .map_err(|_| TransformError::KeyDerivation)?;
    Ok(okm)
}

/// One direction's cipher and nonce counter.
struct DirectionKey {
    cipher: ChaCha20Poly1305,
    counter: u64,
}

impl DirectionKey {
    fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            counter: 0,
        }
    }
}

/// Handshake-negotiated ChaCha20-Poly1305 transform.
#[derive(Default)]
pub struct ChaChaTransform {
    /// Our pending request secret, consumed by `finalize`.
    request_secret: Option<(EphemeralSecret, PublicKey)>,
    /// Key for payloads we send (set by `respond`).
    seal: Option<DirectionKey>,
    /// Key for payloads we receive (set by `finalize`).
    open: Option<DirectionKey>,
}

impl ChaChaTransform {
    /// Creates a template with no key state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether outbound payloads can be sealed.
    pub fn can_seal(&self) -> bool {
        self.seal.is_some()
    }

    /// Returns whether inbound payloads can be opened.
    pub fn can_open(&self) -> bool {
        self.open.is_some()
    }
}

impl fmt::Debug for ChaChaTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaChaTransform")
            .field("request_pending", &self.request_secret.is_some())
            .field("can_seal", &self.can_seal())
            .field("can_open", &self.can_open())
            .finish()
    }
}

impl BufferTransform for ChaChaTransform {
    fn name(&self) -> &'static str {
        "chacha20poly1305"
    }

    fn fresh(&self) -> Box<dyn BufferTransform> {
        Box::new(Self::new())
    }

    fn initial_blob(&mut self) -> Result<Bytes, TransformError> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let blob = encode_blob(&public);
        self.request_secret = Some((secret, public));
        Ok(blob)
    }

    fn respond(&mut self, request: &[u8]) -> Result<Bytes, TransformError> {
        let requester = decode_blob(request)?;

        let secret = EphemeralSecret::random_from_rng(OsRng);
        let responder = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&requester);
        if !shared.was_contributory() {
            return Err(TransformError::WeakKey);
        }

        let key = derive_key(shared.as_bytes(), &requester, &responder)?;
        self.seal = Some(DirectionKey::new(&key));
        Ok(encode_blob(&responder))
    }

    fn finalize(&mut self, response: &[u8]) -> Result<bool, TransformError> {
        let (secret, requester) = self
            .request_secret
            .take()
            .ok_or(TransformError::OutOfOrder("finalize before initial_blob"))?;
        let responder = decode_blob(response)?;

        let shared = secret.diffie_hellman(&responder);
        if !shared.was_contributory() {
            tracing::debug!("Rejecting non-contributory handshake response");
            return Ok(false);
        }

        let key = derive_key(shared.as_bytes(), &requester, &responder)?;
        self.open = Some(DirectionKey::new(&key));
        Ok(true)
    }

    fn forward(&mut self, payload: &[u8]) -> Result<Bytes, TransformError> {
        let key = self.seal.as_mut().ok_or(TransformError::NotReady("forward"))?;
        let counter = key.counter;
        let nonce = construct_nonce(counter);
        let sealed = key
            .cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| TransformError::Seal)?;
        key.counter = counter.checked_add(1).ok_or(TransformError::Seal)?;

        let mut out = BytesMut::with_capacity(COUNTER_LEN + sealed.len());
        out.put_u64(counter);
        out.put_slice(&sealed);
        Ok(out.freeze())
    }

    fn backward(&mut self, payload: &[u8]) -> Result<Bytes, TransformError> {
        let key = self.open.as_mut().ok_or(TransformError::NotReady("backward"))?;
        let min = COUNTER_LEN + TAG_LEN;
        if payload.len() < min {
            return Err(TransformError::Truncated {
                len: payload.len(),
                min,
            });
        }

        let mut counter_bytes = [0u8; COUNTER_LEN];
        counter_bytes.copy_from_slice(&payload[..COUNTER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);
        if counter < key.counter {
            return Err(TransformError::Replay {
                got: counter,
                expected: key.counter,
            });
        }

        let nonce = construct_nonce(counter);
        let plain = key
            .cipher
            .decrypt(Nonce::from_slice(&nonce), &payload[COUNTER_LEN..])
            .map_err(|_| TransformError::Open)?;
        key.counter = counter.saturating_add(1);
        Ok(Bytes::from(plain))
    }
}
