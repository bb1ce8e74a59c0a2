//! SSHSIG verification for signed git commits, and OpenSSH key fingerprints.
//!
//! Only `ssh-ed25519` keys are supported; signatures made with any other key
//! type fail verification with [`SshSigError::UnsupportedKey`].

use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

const MAGIC: &[u8] = b"SSHSIG";
const ARMOR_BEGIN: &str = "-----BEGIN SSH SIGNATURE-----";
const ARMOR_END: &str = "-----END SSH SIGNATURE-----";
const ED25519: &str = "ssh-ed25519";

/// Git signs commits under this namespace.
pub const GIT_NAMESPACE: &str = "git";
pub const HASH_SHA512: &str = "sha512";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SshSigError {
    #[error("failed to parse public key: {0}")]
    InvalidKey(String),

    #[error("unsupported key type: {0}")]
    UnsupportedKey(String),

    #[error("failed to parse signature: {0}")]
    InvalidSignature(String),

    #[error("namespace mismatch: expected {expected}, got {actual}")]
    NamespaceMismatch { expected: String, actual: String },

    #[error("hash algorithm mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("signature was made by a different key")]
    PublicKeyMismatch,

    #[error("signature verification failed")]
    VerificationFailed,
}

/// A parsed SSH public key in wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    pub key_type: String,
    pub wire: Vec<u8>,
}

impl PublicKey {
    /// Parses an authorized_keys line (`[options] <type> <base64> [comment]`).
    pub fn parse_authorized(line: &str) -> Result<Self, SshSigError> {
        let mut fields = line.split_whitespace();
        let encoded = loop {
            let Some(field) = fields.next() else {
                return Err(SshSigError::InvalidKey("no key material found".to_string()));
            };
            if field.starts_with("ssh-") || field.starts_with("ecdsa-") || field.starts_with("sk-") {
                break fields
                    .next()
                    .ok_or_else(|| SshSigError::InvalidKey("missing key data".to_string()))?;
            }
        };

        let wire = STANDARD
            .decode(encoded)
            .map_err(|e| SshSigError::InvalidKey(e.to_string()))?;
        Self::from_wire(wire)
    }

    pub fn from_wire(wire: Vec<u8>) -> Result<Self, SshSigError> {
        let mut reader = WireReader::new(&wire);
        let key_type = reader
            .string()
            .map_err(SshSigError::InvalidKey)
            .map(|t| String::from_utf8_lossy(t).to_string())?;
        Ok(Self { key_type, wire })
    }

    /// `SHA256:<base64>`, unpadded, as `ssh-keygen -l` prints it.
    #[must_use]
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.wire);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    fn ed25519(&self) -> Result<VerifyingKey, SshSigError> {
        if self.key_type != ED25519 {
            return Err(SshSigError::UnsupportedKey(self.key_type.clone()));
        }
        let mut reader = WireReader::new(&self.wire);
        reader.string().map_err(SshSigError::InvalidKey)?;
        let raw = reader.string().map_err(SshSigError::InvalidKey)?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| SshSigError::InvalidKey("ed25519 key must be 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| SshSigError::InvalidKey(e.to_string()))
    }
}

/// Fingerprint of an authorized_keys line.
pub fn ssh_fingerprint(authorized_key: &str) -> Result<String, SshSigError> {
    Ok(PublicKey::parse_authorized(authorized_key)?.fingerprint())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SshSig {
    public_key: Vec<u8>,
    namespace: String,
    reserved: Vec<u8>,
    hash_algorithm: String,
    signature: Vec<u8>,
}

fn unarmor(armored: &str) -> Result<SshSig, SshSigError> {
    let armored = armored.trim();
    let body = armored
        .strip_prefix(ARMOR_BEGIN)
        .and_then(|rest| rest.trim_end().strip_suffix(ARMOR_END))
        .ok_or_else(|| SshSigError::InvalidSignature("missing armor".to_string()))?;

    let compact: String = body.split_whitespace().collect();
    let blob = STANDARD
        .decode(compact)
        .map_err(|e| SshSigError::InvalidSignature(e.to_string()))?;

    let bad = SshSigError::InvalidSignature;
    let mut reader = WireReader::new(&blob);
    if reader.take(MAGIC.len()).map_err(bad)? != MAGIC {
        return Err(SshSigError::InvalidSignature("bad magic".to_string()));
    }
    let version = reader.u32().map_err(bad)?;
    if version != 1 {
        return Err(SshSigError::InvalidSignature(format!("unsupported version {version}")));
    }

    Ok(SshSig {
        public_key: reader.string().map_err(bad)?.to_vec(),
        namespace: String::from_utf8_lossy(reader.string().map_err(bad)?).to_string(),
        reserved: reader.string().map_err(bad)?.to_vec(),
        hash_algorithm: String::from_utf8_lossy(reader.string().map_err(bad)?).to_string(),
        signature: reader.string().map_err(bad)?.to_vec(),
    })
}

fn signed_data(namespace: &str, reserved: &[u8], hash_algorithm: &str, digest: &[u8]) -> Vec<u8> {
    let mut data = MAGIC.to_vec();
    put_string(&mut data, namespace.as_bytes());
    put_string(&mut data, reserved);
    put_string(&mut data, hash_algorithm.as_bytes());
    put_string(&mut data, digest);
    data
}

/// Verifies an armored SSHSIG over `payload` against an authorized_keys line,
/// using the `git` namespace and SHA-512.
pub fn verify_signature(
    authorized_key: &str,
    armored_signature: &str,
    payload: &[u8],
) -> Result<(), SshSigError> {
    let key = PublicKey::parse_authorized(authorized_key)?;
    let sig = unarmor(armored_signature)?;

    if sig.namespace != GIT_NAMESPACE {
        return Err(SshSigError::NamespaceMismatch {
            expected: GIT_NAMESPACE.to_string(),
            actual: sig.namespace,
        });
    }
    if sig.hash_algorithm != HASH_SHA512 {
        return Err(SshSigError::HashMismatch {
            expected: HASH_SHA512.to_string(),
            actual: sig.hash_algorithm,
        });
    }
    if sig.public_key != key.wire {
        return Err(SshSigError::PublicKeyMismatch);
    }

    let verifying_key = key.ed25519()?;

    let mut reader = WireReader::new(&sig.signature);
    let sig_type = reader.string().map_err(SshSigError::InvalidSignature)?;
    if sig_type != ED25519.as_bytes() {
        return Err(SshSigError::UnsupportedKey(
            String::from_utf8_lossy(sig_type).to_string(),
        ));
    }
    let raw: [u8; 64] = reader
        .string()
        .map_err(SshSigError::InvalidSignature)?
        .try_into()
        .map_err(|_| SshSigError::InvalidSignature("ed25519 signature must be 64 bytes".to_string()))?;

    let digest = Sha512::digest(payload);
    let data = signed_data(&sig.namespace, &sig.reserved, &sig.hash_algorithm, &digest);

    verifying_key
        .verify(&data, &Signature::from_bytes(&raw))
        .map_err(|_| SshSigError::VerificationFailed)
}

fn put_string(buf: &mut Vec<u8>, data: &[u8]) {
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
}

struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        if self.buf.len() < n {
            return Err("unexpected end of data".to_string());
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn string(&mut self) -> Result<&'a [u8], String> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}
