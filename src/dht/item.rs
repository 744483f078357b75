//! BEP-44 items: immutable values addressed by their hash and mutable values
//! addressed by an Ed25519 public key plus optional salt.

use super::error::DataError;
use super::id::Id;
use crate::bencode::{decode, encode, BencodeError, Value};
use crate::constants::{MAX_SALT_LEN, MAX_VALUE_LEN, PUBLIC_KEY_LEN, SIGNATURE_LEN};
use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha1::{Digest, Sha1};

/// Target of an immutable item: SHA-1 of the bencoded value.
pub fn immutable_target(encoded_value: &[u8]) -> Id {
    Id::from_be_bytes(&Sha1::digest(encoded_value))
}

/// Target of a mutable item: SHA-1 of the public key followed by the salt.
pub fn mutable_target(key: &[u8; PUBLIC_KEY_LEN], salt: &[u8]) -> Id {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(salt);
    Id::from_be_bytes(&hasher.finalize())
}

/// The byte string a mutable item's signature covers:
/// `4:salt<len>:<salt>3:seqi<seq>e1:v<value>`, with the salt part omitted when empty.
pub fn signable(salt: &[u8], seq: i64, encoded_value: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(salt.len() + encoded_value.len() + 32);
    if !salt.is_empty() {
        buf.extend_from_slice(b"4:salt");
        buf.extend_from_slice(salt.len().to_string().as_bytes());
        buf.push(b':');
        buf.extend_from_slice(salt);
    }
    buf.extend_from_slice(b"3:seqi");
    buf.extend_from_slice(seq.to_string().as_bytes());
    buf.extend_from_slice(b"e1:v");
    buf.extend_from_slice(encoded_value);
    buf
}

/// One stored value, immutable or mutable.
///
/// `value` always holds the canonical bencoding of the item's `v`, since both
/// the target hash and the signature are computed over that encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    value: Bytes,
    key: Option<[u8; PUBLIC_KEY_LEN]>,
    salt: Bytes,
    seq: Option<i64>,
    sig: Option<[u8; SIGNATURE_LEN]>,
}

impl Item {
    pub fn immutable(value: &Value) -> Result<Self, DataError> {
        let encoded = encode(value).map_err(|_| DataError::HashMismatch)?;
        Self::immutable_encoded(Bytes::from(encoded))
    }

    /// Wraps an already bencoded value.
    pub fn immutable_encoded(encoded_value: Bytes) -> Result<Self, DataError> {
        if encoded_value.len() > MAX_VALUE_LEN {
            return Err(DataError::ValueTooLarge);
        }
        Ok(Self {
            value: encoded_value,
            key: None,
            salt: Bytes::new(),
            seq: None,
            sig: None,
        })
    }

    /// Builds and signs a mutable item.
    pub fn signed(
        signer: &SigningKey,
        salt: Bytes,
        seq: i64,
        encoded_value: Bytes,
    ) -> Result<Self, DataError> {
        check_sizes(&salt, &encoded_value)?;
        let sig = signer.sign(&signable(&salt, seq, &encoded_value));
        Ok(Self {
            value: encoded_value,
            key: Some(signer.verifying_key().to_bytes()),
            salt,
            seq: Some(seq),
            sig: Some(sig.to_bytes()),
        })
    }

    /// Assembles a mutable item received from the network. Nothing is verified here.
    pub fn from_parts(
        key: [u8; PUBLIC_KEY_LEN],
        salt: Bytes,
        seq: Option<i64>,
        sig: [u8; SIGNATURE_LEN],
        encoded_value: Bytes,
    ) -> Self {
        Self {
            value: encoded_value,
            key: Some(key),
            salt,
            seq,
            sig: Some(sig),
        }
    }

    pub fn target(&self) -> Id {
        match &self.key {
            Some(key) => mutable_target(key, &self.salt),
            None => immutable_target(&self.value),
        }
    }

    /// Checks size limits and, for mutable items, the signature.
    pub fn verify(&self) -> Result<(), DataError> {
        check_sizes(&self.salt, &self.value)?;

        let Some(key) = &self.key else {
            return Ok(());
        };
        let sig = self.sig.ok_or(DataError::InvalidSignature)?;
        let seq = self.seq.ok_or(DataError::InvalidSignature)?;

        let verifying_key = VerifyingKey::from_bytes(key).map_err(|_| DataError::InvalidKey)?;
        verifying_key
            .verify(
                &signable(&self.salt, seq, &self.value),
                &Signature::from_bytes(&sig),
            )
            .map_err(|_| DataError::InvalidSignature)
    }

    /// Verifies the item and checks that it is stored under `target`.
    pub fn verify_for(&self, target: &Id) -> Result<(), DataError> {
        if self.target() != *target {
            return Err(DataError::HashMismatch);
        }
        self.verify()
    }

    /// Returns a copy carrying `value` and `seq`, signed with `signer`.
    pub fn resigned(
        &self,
        signer: &SigningKey,
        seq: i64,
        encoded_value: Bytes,
    ) -> Result<Self, DataError> {
        if self.key != Some(signer.verifying_key().to_bytes()) {
            return Err(DataError::NotSigner);
        }
        Self::signed(signer, self.salt.clone(), seq, encoded_value)
    }

    pub fn is_mutable(&self) -> bool {
        self.key.is_some()
    }

    /// The bencoded value.
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn decoded_value(&self) -> Result<Value, BencodeError> {
        decode(&self.value)
    }

    pub fn key(&self) -> Option<&[u8; PUBLIC_KEY_LEN]> {
        self.key.as_ref()
    }

    pub fn salt(&self) -> &Bytes {
        &self.salt
    }

    pub fn seq(&self) -> Option<i64> {
        self.seq
    }

    pub fn sig(&self) -> Option<&[u8; SIGNATURE_LEN]> {
        self.sig.as_ref()
    }
}

fn check_sizes(salt: &[u8], encoded_value: &[u8]) -> Result<(), DataError> {
    if salt.len() > MAX_SALT_LEN {
        return Err(DataError::SaltTooLarge);
    }
    if encoded_value.len() > MAX_VALUE_LEN {
        return Err(DataError::ValueTooLarge);
    }
    Ok(())
}
