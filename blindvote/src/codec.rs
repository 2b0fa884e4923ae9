//! Fixed-width hex codec and the validators shared by tokens, signatures, RSA parameters
//! and ethereum material.

use crate::*;
use alloy_primitives::Address;
use num_enum::TryFromPrimitive;
use rsa::BigUint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::str::FromStr;

/// Length in bytes of a recoverable ethereum signature (r || s || v)
pub const ETH_SIGNATURE_LENGTH: usize = 65;

/// Strip an optional `0x` / `0X` prefix
pub fn strip_hex_prefix(s: &str) -> &str {
    s.strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s)
}

/// Lowercase, unprefixed form of a hex string, used wherever hex values are compared as keys.
pub fn normalize_hex(s: &str) -> String {
    strip_hex_prefix(s.trim()).to_ascii_lowercase()
}

/// Decode an optionally-prefixed hex string of arbitrary (even) length
pub fn decode_hex(s: &str) -> Result<Vec<u8>, ValidationError> {
    hex::decode(strip_hex_prefix(s)).map_err(|_| ValidationError::BadHex)
}

/// Decode an optionally-prefixed hex string that must encode exactly `byte_len` bytes
pub fn decode_fixed_hex(s: &str, byte_len: usize) -> Result<Vec<u8>, ValidationError> {
    let digits = strip_hex_prefix(s);
    if digits.len() != byte_len * 2 {
        return Err(ValidationError::BadLength {
            expected: byte_len * 2,
            actual: digits.len(),
        });
    }
    hex::decode(digits).map_err(|_| ValidationError::BadHex)
}

/// Big-endian bytes of `value`, left-padded with zeroes to `byte_len`.
///
/// Fails if the value does not fit.
pub fn to_fixed_bytes(value: &BigUint, byte_len: usize) -> Result<Vec<u8>, ValidationError> {
    let bytes = value.to_bytes_be();
    if bytes.len() > byte_len {
        return Err(ValidationError::OutOfRange);
    }
    let mut out = vec![0u8; byte_len - bytes.len()];
    out.extend_from_slice(&bytes);
    Ok(out)
}

/// Lowercase unprefixed hex of `value`, left-padded to `byte_len` bytes
pub fn to_fixed_hex(value: &BigUint, byte_len: usize) -> Result<String, ValidationError> {
    Ok(hex::encode(to_fixed_bytes(value, byte_len)?))
}

/// Require `2 < value < 2^bit_length - 1`
pub fn check_range(value: &BigUint, bit_length: usize) -> Result<(), ValidationError> {
    let one = BigUint::from(1u32);
    let two = BigUint::from(2u32);
    let upper = (BigUint::from(1u32) << bit_length) - &one;
    if *value <= two || *value >= upper {
        return Err(ValidationError::OutOfRange);
    }
    Ok(())
}

/// Require `2 < value < modulus - 1`
pub fn check_below_modulus(value: &BigUint, modulus: &BigUint) -> Result<(), ValidationError> {
    let two = BigUint::from(2u32);
    if *modulus <= BigUint::from(3u32) {
        return Err(ValidationError::OutOfRange);
    }
    let one = BigUint::from(1u32);
    let upper = modulus - &one;
    if *value <= two || *value >= upper {
        return Err(ValidationError::OutOfRange);
    }
    Ok(())
}

/// Leading byte of the text form of every non-master token and every signature.
///
/// Keeps a blinded value from ever being parsed where an unblinded one is expected.
#[derive(TryFromPrimitive, Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DomainTag {
    UnblindedToken = 1,
    BlindedToken = 2,
    UnblindedSignature = 3,
    BlindedSignature = 4,
}

impl DomainTag {
    pub fn name(&self) -> &'static str {
        match self {
            DomainTag::UnblindedToken => "unblinded token",
            DomainTag::BlindedToken => "blinded token",
            DomainTag::UnblindedSignature => "unblinded signature",
            DomainTag::BlindedSignature => "blinded signature",
        }
    }
}

/// `<tag><fixed-width value>` as unprefixed lowercase hex
pub fn encode_tagged(
    tag: DomainTag,
    value: &BigUint,
    byte_len: usize,
) -> Result<String, ValidationError> {
    Ok(format!("{:02x}{}", tag as u8, to_fixed_hex(value, byte_len)?))
}

/// Split an optionally-prefixed tagged hex string into its tag and value bytes
pub fn decode_tagged(s: &str) -> Result<(DomainTag, Vec<u8>), ValidationError> {
    let bytes = decode_hex(s)?;
    let (tag, body) = bytes.split_first().ok_or(ValidationError::BadLength {
        expected: 2,
        actual: 0,
    })?;
    let tag = DomainTag::try_from_primitive(*tag).map_err(|_| ValidationError::UnknownTag(*tag))?;
    Ok((tag, body.to_vec()))
}

/// Parse a `0x`-prefixed, 20-byte ethereum address
pub fn parse_address(s: &str) -> Result<Address, ValidationError> {
    if !s.starts_with("0x") && !s.starts_with("0X") {
        return Err(ValidationError::BadAddress);
    }
    let bytes = decode_fixed_hex(s, 20).map_err(|_| ValidationError::BadAddress)?;
    Ok(Address::from_slice(&bytes))
}

/// A recoverable secp256k1 signature in ethereum's `r || s || v` layout
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EthSignature(pub [u8; ETH_SIGNATURE_LENGTH]);

impl EthSignature {
    /// The recovery id (0 or 1) regardless of whether `v` was encoded as 0/1 or 27/28
    pub fn recovery_byte(&self) -> u8 {
        let v = self.0[64];
        if v >= 27 {
            v - 27
        } else {
            v
        }
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl FromStr for EthSignature {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_fixed_hex(s, ETH_SIGNATURE_LENGTH)
            .map_err(|_| ValidationError::BadEthSignature)?;

        if !matches!(bytes[64], 0 | 1 | 27 | 28) {
            return Err(ValidationError::BadEthSignature);
        }

        let mut sig = [0u8; ETH_SIGNATURE_LENGTH];
        sig.copy_from_slice(&bytes);
        Ok(EthSignature(sig))
    }
}

impl std::fmt::Display for EthSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for EthSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "EthSignature({})", self.to_hex())
    }
}

impl Serialize for EthSignature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for EthSignature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        EthSignature::from_str(&s).map_err(de::Error::custom)
    }
}

// a single-purpose module for use in `#[serde(with)]`
pub mod biguint_hex {
    use super::*;

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_str_radix(16))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        BigUint::parse_bytes(strip_hex_prefix(&s).as_bytes(), 16)
            .ok_or_else(|| de::Error::custom(ValidationError::BadHex))
    }
}

// a single-purpose module for use in `#[serde(with)]`
pub mod option_biguint_hex {
    use super::*;

    pub fn serialize<S>(value: &Option<BigUint>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(v) => serializer.serialize_some(&v.to_str_radix(16)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<BigUint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => BigUint::parse_bytes(strip_hex_prefix(&s).as_bytes(), 16)
                .map(Some)
                .ok_or_else(|| de::Error::custom(ValidationError::BadHex)),
            None => Ok(None),
        }
    }
}
