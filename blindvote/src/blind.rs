//! RSA blind signatures over the election token domain.
//!
//! The voter blinds an election token with a factor `R`, the authority signs the blinded value
//! without learning the token, and the voter strips `R` to obtain an ordinary RSA signature on
//! the token itself.

use crate::*;
use digest::Digest;
use hkdf::Hkdf;
use num_bigint_dig::ModInverse;
use rsa::traits::{PrivateKeyParts, PublicKeyParts};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::str::FromStr;

/// Smallest modulus accepted anywhere
pub const MIN_MODULUS_BITS: usize = 2048;

const FULL_DOMAIN_HASH_INFO: &[u8] = b"blindvote_full_domain_hash";

/// RSA parameters of a signing authority
///
/// The private exponent is only present on the authority's own copy. Use [`RsaParams::public`]
/// before handing parameters to anyone else.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RsaParamsRepr", into = "RsaParamsRepr")]
pub struct RsaParams {
    n: BigUint,
    e: BigUint,
    d: Option<BigUint>,
    n_bit_length: usize,
}

#[derive(Clone, Serialize, Deserialize)]
struct RsaParamsRepr {
    #[serde(with = "biguint_hex")]
    n: BigUint,
    #[serde(with = "biguint_hex")]
    e: BigUint,
    #[serde(default, with = "option_biguint_hex", skip_serializing_if = "Option::is_none")]
    d: Option<BigUint>,
    n_bit_length: usize,
}

impl TryFrom<RsaParamsRepr> for RsaParams {
    type Error = ValidationError;

    fn try_from(repr: RsaParamsRepr) -> Result<Self, Self::Error> {
        RsaParams::new(repr.n, repr.e, repr.d, repr.n_bit_length)
    }
}

impl From<RsaParams> for RsaParamsRepr {
    fn from(params: RsaParams) -> Self {
        RsaParamsRepr {
            n: params.n,
            e: params.e,
            d: params.d,
            n_bit_length: params.n_bit_length,
        }
    }
}

impl RsaParams {
    /// Validate and build RSA parameters
    pub fn new(
        n: BigUint,
        e: BigUint,
        d: Option<BigUint>,
        n_bit_length: usize,
    ) -> Result<Self, ValidationError> {
        if n_bit_length < MIN_MODULUS_BITS {
            return Err(ValidationError::ModulusTooSmall {
                min: MIN_MODULUS_BITS,
                actual: n_bit_length,
            });
        }
        if n.bits() != n_bit_length {
            return Err(ValidationError::ModulusBitLengthMismatch {
                declared: n_bit_length,
                actual: n.bits(),
            });
        }

        let two = BigUint::from(2u32);
        if e <= two || (&e % &two) == BigUint::from(0u32) {
            return Err(ValidationError::BadPublicExponent);
        }

        if let Some(d) = &d {
            let floor = BigUint::from(1u32) << (n_bit_length / 2);
            if *d < floor {
                return Err(ValidationError::PrivateExponentTooSmall);
            }
            if *d >= n {
                return Err(ValidationError::OutOfRange);
            }
        }

        Ok(RsaParams {
            n,
            e,
            d,
            n_bit_length,
        })
    }

    pub fn from_private_key(key: &RsaPrivateKey) -> Result<Self, ValidationError> {
        RsaParams::new(
            key.n().clone(),
            key.e().clone(),
            Some(key.d().clone()),
            key.n().bits(),
        )
    }

    pub fn from_public_key(key: &RsaPublicKey) -> Result<Self, ValidationError> {
        RsaParams::new(key.n().clone(), key.e().clone(), None, key.n().bits())
    }

    pub fn to_public_key(&self) -> Result<RsaPublicKey, Error> {
        Ok(RsaPublicKey::new(self.n.clone(), self.e.clone())?)
    }

    /// The same parameters without the private exponent
    pub fn public(&self) -> RsaParams {
        RsaParams {
            n: self.n.clone(),
            e: self.e.clone(),
            d: None,
            n_bit_length: self.n_bit_length,
        }
    }

    pub fn n(&self) -> &BigUint {
        &self.n
    }

    pub fn e(&self) -> &BigUint {
        &self.e
    }

    pub fn d(&self) -> Option<&BigUint> {
        self.d.as_ref()
    }

    pub fn bit_length(&self) -> usize {
        self.n_bit_length
    }

    pub fn has_private_exponent(&self) -> bool {
        self.d.is_some()
    }

    pub fn modulus_bytes(&self) -> usize {
        self.n_bit_length.div_ceil(8)
    }

    /// True if `value` has an inverse mod N
    pub fn is_invertible(&self, value: &BigUint) -> bool {
        self.inverse(value).is_some()
    }

    fn inverse(&self, value: &BigUint) -> Option<BigUint> {
        value
            .clone()
            .mod_inverse(&self.n)
            .and_then(|inv| inv.to_biguint())
    }

    fn private_exponent(&self) -> Result<&BigUint, ValidationError> {
        self.d.as_ref().ok_or(ValidationError::MissingPrivateExponent)
    }
}

impl std::fmt::Debug for RsaParams {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RsaParams")
            .field("n", &hex::encode(self.n.to_bytes_be()))
            .field("e", &self.e.to_string())
            .field("d", &self.d.as_ref().map(|_| "<redacted>"))
            .field("n_bit_length", &self.n_bit_length)
            .finish()
    }
}

/// An RSA signature, blinded (as returned by the authority) or unblinded (as carried in a vote)
#[derive(Clone, PartialEq, Eq)]
pub struct Signature {
    value: BigUint,
    byte_len: usize,
    is_blinded: bool,
}

impl Signature {
    fn new(value: BigUint, byte_len: usize, is_blinded: bool) -> Result<Self, ValidationError> {
        check_range(&value, byte_len * 8)?;
        Ok(Signature {
            value,
            byte_len,
            is_blinded,
        })
    }

    pub fn blinded(value: BigUint, byte_len: usize) -> Result<Self, ValidationError> {
        Signature::new(value, byte_len, true)
    }

    pub fn unblinded(value: BigUint, byte_len: usize) -> Result<Self, ValidationError> {
        Signature::new(value, byte_len, false)
    }

    pub fn value(&self) -> &BigUint {
        &self.value
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn is_blinded(&self) -> bool {
        self.is_blinded
    }

    pub fn tag(&self) -> DomainTag {
        if self.is_blinded {
            DomainTag::BlindedSignature
        } else {
            DomainTag::UnblindedSignature
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.byte_len.saturating_sub(self.value.bits().div_ceil(8))];
        out.extend_from_slice(&self.value.to_bytes_be());
        out
    }

    pub fn to_hex(&self) -> String {
        format!("{:02x}{}", self.tag() as u8, hex::encode(self.to_bytes()))
    }
}

impl FromStr for Signature {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (tag, body) = decode_tagged(s)?;
        let is_blinded = match tag {
            DomainTag::UnblindedSignature => false,
            DomainTag::BlindedSignature => true,
            other => {
                return Err(ValidationError::WrongForm {
                    expected: "signature",
                    actual: other.name(),
                })
            }
        };
        if body.len() * 8 < MIN_MODULUS_BITS {
            return Err(ValidationError::BadLength {
                expected: MIN_MODULUS_BITS / 4,
                actual: body.len() * 2,
            });
        }
        let byte_len = body.len();
        Signature::new(BigUint::from_bytes_be(&body), byte_len, is_blinded)
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Signature::from_str(&s).map_err(de::Error::custom)
    }
}

// R must be an election factor for this modulus and have an inverse
fn check_blinding_factor(r: &BlindingFactor, pub_key: &RsaParams) -> Result<(), ValidationError> {
    if r.is_master() {
        return Err(ValidationError::WrongForm {
            expected: "election blinding factor",
            actual: "master blinding factor",
        });
    }
    check_below_modulus(r.value(), pub_key.n())?;
    if !pub_key.is_invertible(r.value()) {
        return Err(ValidationError::NotInvertible);
    }
    Ok(())
}

/// Blind an unblinded election token: `token * R^e mod N`
pub fn blind_token(
    token: &Token,
    r: &BlindingFactor,
    pub_key: &RsaParams,
) -> Result<Token, Error> {
    token.require_unblinded()?;
    check_blinding_factor(r, pub_key)?;

    let n = pub_key.n();
    let r_e = r.value().modpow(pub_key.e(), n);
    let blinded = (token.value() * &r_e) % n;

    Ok(Token::blinded(blinded, pub_key.modulus_bytes())?)
}

/// Sign a blinded token with the authority's private exponent: `blinded^D mod N`
///
/// The authority never sees the election token itself.
pub fn sign_token(blinded_token: &Token, params: &RsaParams) -> Result<Signature, Error> {
    blinded_token.require_blinded()?;
    let d = params.private_exponent()?;

    if blinded_token.byte_len() != params.modulus_bytes() {
        return Err(ValidationError::BadLength {
            expected: params.modulus_bytes() * 2,
            actual: blinded_token.byte_len() * 2,
        }
        .into());
    }
    check_below_modulus(blinded_token.value(), params.n())?;

    let signature = blinded_token.value().modpow(d, params.n());
    Ok(Signature::blinded(signature, params.modulus_bytes())?)
}

/// Remove the blinding factor from the authority's signature: `sig' * R^-1 mod N`
pub fn unblind_signature(
    blinded_signature: &Signature,
    r: &BlindingFactor,
    pub_key: &RsaParams,
) -> Result<Signature, Error> {
    if !blinded_signature.is_blinded() {
        return Err(ValidationError::NotBlinded.into());
    }
    check_below_modulus(blinded_signature.value(), pub_key.n())?;
    check_blinding_factor(r, pub_key)?;

    let r_inv = pub_key
        .inverse(r.value())
        .ok_or(ValidationError::NotInvertible)?;
    let n = pub_key.n();
    let signature = (blinded_signature.value() * &r_inv) % n;

    Ok(Signature::unblinded(signature, pub_key.modulus_bytes())?)
}

/// Check `sig^e mod N == token`
///
/// Never errors: wrong forms and out-of-range operands are reported as `false`.
pub fn verify_unblinded_signature(
    signature: &Signature,
    token: &Token,
    pub_key: &RsaParams,
) -> bool {
    match check_unblinded_signature(signature, token, pub_key) {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!(error = %e, "rejected unblinded signature");
            false
        }
    }
}

fn check_unblinded_signature(
    signature: &Signature,
    token: &Token,
    pub_key: &RsaParams,
) -> Result<(), ValidationError> {
    if signature.is_blinded() {
        return Err(ValidationError::Blinded);
    }
    token.require_unblinded()?;
    check_below_modulus(signature.value(), pub_key.n())?;

    if signature.value().modpow(pub_key.e(), pub_key.n()) != *token.value() {
        return Err(ValidationError::SignatureVerificationFailed);
    }
    Ok(())
}

// SHA-256 of the message stretched to the modulus width and reduced mod N
fn full_domain_hash(message: &[u8], pub_key: &RsaParams) -> Result<BigUint, Error> {
    let digest = Sha256::digest(message);
    let h = Hkdf::<Sha256>::new(None, &digest);
    let mut okm = vec![0u8; pub_key.modulus_bytes()];
    h.expand(FULL_DOMAIN_HASH_INFO, &mut okm)
        .map_err(|_| Error::KeyDerivation)?;
    Ok(BigUint::from_bytes_be(&okm) % pub_key.n())
}

/// Plain (unblinded) full-domain-hash RSA signature over `message`
pub fn sign_message(message: &[u8], params: &RsaParams) -> Result<Signature, Error> {
    let d = params.private_exponent()?;
    let m = full_domain_hash(message, params)?;
    let signature = m.modpow(d, params.n());
    Ok(Signature::unblinded(signature, params.modulus_bytes())?)
}

/// Verify a signature made by [`sign_message`]. Never errors.
pub fn verify_message(signature: &Signature, message: &[u8], pub_key: &RsaParams) -> bool {
    if signature.is_blinded() || check_below_modulus(signature.value(), pub_key.n()).is_err() {
        return false;
    }
    match full_domain_hash(message, pub_key) {
        Ok(m) => signature.value().modpow(pub_key.e(), pub_key.n()) == m,
        Err(_) => false,
    }
}
