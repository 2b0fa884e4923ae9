use crate::*;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::Rng;
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;

pub const AES_KEY_LENGTH: usize = 32;
pub const AES_IV_LENGTH: usize = 12;
pub const AES_TAG_LENGTH: usize = 16;
pub const AES_MAX_PLAINTEXT: usize = 511;

pub const RSA_MIN_PLAINTEXT: usize = 2;

// Two SHA-256 digests plus two framing bytes
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

// Imported keys may differ from the configured size by less than one byte
const KEY_SIZE_TOLERANCE_BITS: usize = 8;

/// Longest plaintext RSA-OAEP(SHA-256) accepts under a modulus of `bit_length` bits
pub fn rsa_max_message_length(bit_length: usize) -> usize {
    (bit_length / 8).saturating_sub(OAEP_SHA256_OVERHEAD)
}

/// A voter's 256-bit AES ballot key
#[derive(Clone, PartialEq, Eq)]
pub struct VoteKey([u8; AES_KEY_LENGTH]);

impl VoteKey {
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LENGTH];
        rand::thread_rng().fill(&mut key);
        VoteKey(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ValidationError> {
        let key: [u8; AES_KEY_LENGTH] =
            bytes.try_into().map_err(|_| ValidationError::BadLength {
                expected: AES_KEY_LENGTH * 2,
                actual: bytes.len() * 2,
            })?;
        Ok(VoteKey(key))
    }

    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        VoteKey::from_bytes(&decode_fixed_hex(s, AES_KEY_LENGTH)?)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; AES_KEY_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for VoteKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VoteKey(<redacted>)")
    }
}

impl Serialize for VoteKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for VoteKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        VoteKey::from_hex(&s).map_err(de::Error::custom)
    }
}

#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum EncryptionType {
    AES,
    RSA,
}

impl EncryptionType {
    pub fn name(&self) -> &'static str {
        match self {
            EncryptionType::AES => "AES",
            EncryptionType::RSA => "RSA",
        }
    }
}

/// An encrypted vote string
///
/// AES payloads are `IV || ciphertext || tag`. RSA payloads are a bare OAEP ciphertext
/// exactly as wide as the modulus.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EncryptedVotes {
    pub encryption_type: EncryptionType,
    pub payload: String,
}

impl EncryptedVotes {
    fn new(encryption_type: EncryptionType, payload: &[u8]) -> Self {
        EncryptedVotes {
            encryption_type,
            payload: hex::encode(payload),
        }
    }

    pub fn payload_bytes(&self) -> Result<Vec<u8>, ValidationError> {
        decode_hex(&self.payload)
    }

    /// Structural check of an AES payload: room for an IV, a tag and at least one byte
    pub fn validate_aes(&self) -> Result<(), ValidationError> {
        if self.encryption_type != EncryptionType::AES {
            return Err(ValidationError::WrongEncryptionType(EncryptionType::AES.name()));
        }
        let len = self.payload_bytes()?.len();
        if len <= AES_IV_LENGTH + AES_TAG_LENGTH
            || len > AES_IV_LENGTH + AES_MAX_PLAINTEXT + AES_TAG_LENGTH
        {
            return Err(ValidationError::BadCiphertext);
        }
        Ok(())
    }

    /// Structural check of an RSA payload: exactly one modulus wide
    pub fn validate_rsa(&self, bit_length: usize) -> Result<(), ValidationError> {
        if self.encryption_type != EncryptionType::RSA {
            return Err(ValidationError::WrongEncryptionType(EncryptionType::RSA.name()));
        }
        if self.payload_bytes()?.len() != bit_length.div_ceil(8) {
            return Err(ValidationError::BadCiphertext);
        }
        Ok(())
    }

    /// Structural check of an RSA payload when the key size is not at hand
    pub fn validate_rsa_shape(&self) -> Result<(), ValidationError> {
        if self.encryption_type != EncryptionType::RSA {
            return Err(ValidationError::WrongEncryptionType(EncryptionType::RSA.name()));
        }
        if self.payload_bytes()?.len() * 8 < MIN_MODULUS_BITS {
            return Err(ValidationError::BadCiphertext);
        }
        Ok(())
    }
}

fn check_plaintext(len: usize, min: usize, max: usize) -> Result<(), ValidationError> {
    if len < min || len > max {
        return Err(ValidationError::PlaintextLength { len, min, max });
    }
    Ok(())
}

/// AES-256-GCM under a fresh random IV
pub fn encrypt_aes(plaintext: &[u8], key: &VoteKey) -> Result<EncryptedVotes, Error> {
    check_plaintext(plaintext.len(), 1, AES_MAX_PLAINTEXT)?;

    let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    let mut iv = [0u8; AES_IV_LENGTH];
    rand::thread_rng().fill(&mut iv);
    let nonce = Nonce::from_slice(&iv);

    let ciphertext = aead
        .encrypt(nonce, plaintext)
        .map_err(|_| Error::EncryptionFailed)?;

    let mut output = Vec::with_capacity(AES_IV_LENGTH + ciphertext.len());
    output.extend(iv);
    output.extend(ciphertext);

    Ok(EncryptedVotes::new(EncryptionType::AES, &output))
}

pub fn decrypt_aes(encrypted: &EncryptedVotes, key: &VoteKey) -> Result<Vec<u8>, Error> {
    encrypted.validate_aes()?;
    let payload = encrypted.payload_bytes()?;

    let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let (iv, ciphertext) = payload.split_at(AES_IV_LENGTH);

    aead.decrypt(Nonce::from_slice(iv), ciphertext)
        .map_err(|_| Error::DecryptionError)
}

fn check_key_size(actual: usize, configured_bits: usize) -> Result<(), Error> {
    if actual.abs_diff(configured_bits) >= KEY_SIZE_TOLERANCE_BITS {
        return Err(Error::KeySizeMismatch {
            expected: configured_bits,
            actual,
        });
    }
    Ok(())
}

/// RSA-OAEP(SHA-256) under the election's public key
///
/// `configured_bits` is the modulus size the election was set up with; a key of another size
/// is a configuration fault.
pub fn encrypt_rsa(
    plaintext: &[u8],
    key: &RsaPublicKey,
    configured_bits: usize,
) -> Result<EncryptedVotes, Error> {
    check_key_size(key.n().bits(), configured_bits)?;
    check_plaintext(
        plaintext.len(),
        RSA_MIN_PLAINTEXT,
        rsa_max_message_length(configured_bits),
    )?;

    let mut rng = rand::thread_rng();
    let ciphertext = key.encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)?;

    Ok(EncryptedVotes::new(EncryptionType::RSA, &ciphertext))
}

pub fn decrypt_rsa(
    encrypted: &EncryptedVotes,
    key: &RsaPrivateKey,
    configured_bits: usize,
) -> Result<Vec<u8>, Error> {
    check_key_size(key.n().bits(), configured_bits)?;
    encrypted.validate_rsa(key.n().bits())?;

    key.decrypt(Oaep::new::<Sha256>(), &encrypted.payload_bytes()?)
        .map_err(|_| Error::DecryptionError)
}
