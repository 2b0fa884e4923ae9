use crate::*;
use hkdf::Hkdf;
use rand::RngCore;
use rsa::BigUint;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use std::str::FromStr;

/// Width in bytes of master tokens, master blinding factors and unblinded election tokens (SHA-256 output)
pub const TOKEN_BYTES: usize = 32;

const ELECTION_TOKEN_INFO: &[u8] = b"blindvote_election_token";
const ELECTION_R_INFO: &[u8] = b"blindvote_election_r";

// Extra output drawn before reducing mod N, so the reduction bias is negligible
const R_REDUCTION_MARGIN: usize = 16;

/// What a [`Token`] currently is in the issuance lifecycle
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TokenForm {
    /// Voter-held secret from which every election token is derived. Never blinded.
    Master,

    /// Per-election token, as it ends up inside a vote
    Unblinded,

    /// Election token multiplied by `R^e mod N`, as sent to the authority for signing
    Blinded,
}

impl TokenForm {
    pub fn name(&self) -> &'static str {
        match self {
            TokenForm::Master => "master token",
            TokenForm::Unblinded => "unblinded token",
            TokenForm::Blinded => "blinded token",
        }
    }
}

/// A voting token
///
/// Master and unblinded tokens are `TOKEN_BYTES` wide. Blinded tokens are as wide as the
/// modulus of the authority that blinded them.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: BigUint,
    form: TokenForm,
    byte_len: usize,
}

impl Token {
    fn new(value: BigUint, form: TokenForm, byte_len: usize) -> Result<Self, ValidationError> {
        check_range(&value, byte_len * 8)?;
        Ok(Token {
            value,
            form,
            byte_len,
        })
    }

    /// Generate a fresh master token. This is the voter's long-lived secret.
    pub fn generate_master() -> Self {
        let mut csprng = rand::rngs::OsRng {};
        loop {
            let mut bytes = [0u8; TOKEN_BYTES];
            csprng.fill_bytes(&mut bytes);
            if let Ok(token) = Token::master(BigUint::from_bytes_be(&bytes)) {
                return token;
            }
        }
    }

    pub fn master(value: BigUint) -> Result<Self, ValidationError> {
        Token::new(value, TokenForm::Master, TOKEN_BYTES)
    }

    pub fn unblinded(value: BigUint) -> Result<Self, ValidationError> {
        Token::new(value, TokenForm::Unblinded, TOKEN_BYTES)
    }

    /// A blinded token, `byte_len` being the byte width of the blinding modulus
    pub fn blinded(value: BigUint, byte_len: usize) -> Result<Self, ValidationError> {
        Token::new(value, TokenForm::Blinded, byte_len)
    }

    pub fn value(&self) -> &BigUint {
        &self.value
    }

    pub fn form(&self) -> TokenForm {
        self.form
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn is_master(&self) -> bool {
        self.form == TokenForm::Master
    }

    pub fn is_blinded(&self) -> bool {
        self.form == TokenForm::Blinded
    }

    /// Fixed-width big-endian bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        // Width was checked on construction
        let mut out = vec![0u8; self.byte_len.saturating_sub(self.value.bits().div_ceil(8))];
        out.extend_from_slice(&self.value.to_bytes_be());
        out
    }

    pub fn to_hex(&self) -> String {
        match self.form {
            TokenForm::Master => hex::encode(self.to_bytes()),
            TokenForm::Unblinded => format!(
                "{:02x}{}",
                DomainTag::UnblindedToken as u8,
                hex::encode(self.to_bytes())
            ),
            TokenForm::Blinded => format!(
                "{:02x}{}",
                DomainTag::BlindedToken as u8,
                hex::encode(self.to_bytes())
            ),
        }
    }

    /// Reject anything but an unblinded election token
    pub fn require_unblinded(&self) -> Result<(), ValidationError> {
        match self.form {
            TokenForm::Unblinded => Ok(()),
            TokenForm::Master => Err(ValidationError::MasterToken),
            TokenForm::Blinded => Err(ValidationError::Blinded),
        }
    }

    /// Reject anything but a blinded election token
    pub fn require_blinded(&self) -> Result<(), ValidationError> {
        match self.form {
            TokenForm::Blinded => Ok(()),
            TokenForm::Master => Err(ValidationError::MasterToken),
            TokenForm::Unblinded => Err(ValidationError::NotBlinded),
        }
    }
}

impl FromStr for Token {
    type Err = ValidationError;

    /// Untagged `TOKEN_BYTES`-wide hex is a master token; everything else must carry a token tag.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if strip_hex_prefix(s).len() == TOKEN_BYTES * 2 {
            let bytes = decode_fixed_hex(s, TOKEN_BYTES)?;
            return Token::master(BigUint::from_bytes_be(&bytes));
        }

        let (tag, body) = decode_tagged(s)?;
        match tag {
            DomainTag::UnblindedToken => {
                if body.len() != TOKEN_BYTES {
                    return Err(ValidationError::BadLength {
                        expected: TOKEN_BYTES * 2,
                        actual: body.len() * 2,
                    });
                }
                Token::unblinded(BigUint::from_bytes_be(&body))
            }
            DomainTag::BlindedToken => {
                if body.len() * 8 < MIN_MODULUS_BITS {
                    return Err(ValidationError::BadLength {
                        expected: MIN_MODULUS_BITS / 4,
                        actual: body.len() * 2,
                    });
                }
                let byte_len = body.len();
                Token::blinded(BigUint::from_bytes_be(&body), byte_len)
            }
            other => Err(ValidationError::WrongForm {
                expected: "token",
                actual: other.name(),
            }),
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Master tokens are secrets
        match self.form {
            TokenForm::Master => write!(f, "Token(master)"),
            _ => write!(f, "Token({})", self.to_hex()),
        }
    }
}

impl Serialize for Token {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Token {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Token::from_str(&s).map_err(de::Error::custom)
    }
}

/// A blinding factor `R`
///
/// The master blinding factor is a `TOKEN_BYTES`-wide voter secret. Election blinding factors
/// are re-derived from it on demand, are as wide as the authority's modulus and are never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct BlindingFactor {
    value: BigUint,
    byte_len: usize,
    is_master: bool,
}

impl BlindingFactor {
    pub fn generate_master() -> Self {
        let mut csprng = rand::rngs::OsRng {};
        loop {
            let mut bytes = [0u8; TOKEN_BYTES];
            csprng.fill_bytes(&mut bytes);
            if let Ok(r) = BlindingFactor::master(BigUint::from_bytes_be(&bytes)) {
                return r;
            }
        }
    }

    pub fn master(value: BigUint) -> Result<Self, ValidationError> {
        check_range(&value, TOKEN_BYTES * 8)?;
        Ok(BlindingFactor {
            value,
            byte_len: TOKEN_BYTES,
            is_master: true,
        })
    }

    /// An election blinding factor for a modulus `byte_len` bytes wide
    pub fn election(value: BigUint, byte_len: usize) -> Result<Self, ValidationError> {
        check_range(&value, byte_len * 8)?;
        Ok(BlindingFactor {
            value,
            byte_len,
            is_master: false,
        })
    }

    pub fn value(&self) -> &BigUint {
        &self.value
    }

    pub fn byte_len(&self) -> usize {
        self.byte_len
    }

    pub fn is_master(&self) -> bool {
        self.is_master
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.byte_len.saturating_sub(self.value.bits().div_ceil(8))];
        out.extend_from_slice(&self.value.to_bytes_be());
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    /// Parse an untagged hex blinding factor; its width decides whether it is a master factor.
    pub fn from_hex(s: &str) -> Result<Self, ValidationError> {
        let bytes = decode_hex(s)?;
        if bytes.len() == TOKEN_BYTES {
            BlindingFactor::master(BigUint::from_bytes_be(&bytes))
        } else {
            BlindingFactor::election(BigUint::from_bytes_be(&bytes), bytes.len())
        }
    }
}

impl std::fmt::Debug for BlindingFactor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.is_master {
            write!(f, "BlindingFactor(master)")
        } else {
            write!(f, "BlindingFactor({} bytes)", self.byte_len)
        }
    }
}

/// Derive the unblinded token a voter uses in one election.
///
/// HKDF-SHA256 keyed by the master token and salted with the election id. Without the master
/// token, tokens of the same voter in different elections cannot be linked.
pub fn derive_election_unblinded_token(
    election_id: u64,
    master_token: &Token,
) -> Result<Token, Error> {
    if !master_token.is_master() {
        return Err(ValidationError::WrongForm {
            expected: TokenForm::Master.name(),
            actual: master_token.form().name(),
        }
        .into());
    }

    let h = Hkdf::<Sha256>::new(Some(&election_id.to_be_bytes()), &master_token.to_bytes());
    let mut okm = [0u8; TOKEN_BYTES];
    h.expand(ELECTION_TOKEN_INFO, &mut okm)
        .map_err(|_| Error::KeyDerivation)?;

    Ok(Token::unblinded(BigUint::from_bytes_be(&okm))?)
}

/// Derive the blinding factor for one election and one authority.
///
/// Binds the master blinding secret to the election id, the election token and the authority's
/// modulus, so nothing per-election needs to be stored and the authority cannot predict `R`.
pub fn derive_election_r(
    election_id: u64,
    master_r: &BlindingFactor,
    unblinded_token: &Token,
    register_pub_key: &RsaParams,
) -> Result<BlindingFactor, Error> {
    if !master_r.is_master() {
        return Err(ValidationError::WrongForm {
            expected: "master blinding factor",
            actual: "election blinding factor",
        }
        .into());
    }
    unblinded_token.require_unblinded()?;

    let modulus_bytes = register_pub_key.modulus_bytes();

    let mut salt = election_id.to_be_bytes().to_vec();
    salt.extend(unblinded_token.to_bytes());

    let mut info = ELECTION_R_INFO.to_vec();
    info.extend(register_pub_key.n().to_bytes_be());

    let h = Hkdf::<Sha256>::new(Some(&salt), &master_r.to_bytes());
    let mut okm = vec![0u8; modulus_bytes + R_REDUCTION_MARGIN];
    h.expand(&info, &mut okm)
        .map_err(|_| Error::KeyDerivation)?;

    let r = BigUint::from_bytes_be(&okm) % register_pub_key.n();
    check_below_modulus(&r, register_pub_key.n())?;
    if !register_pub_key.is_invertible(&r) {
        return Err(ValidationError::NotInvertible.into());
    }

    Ok(BlindingFactor::election(r, modulus_bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::authority_params;

    #[test]
    fn test_token_text_form() {
        let master = Token::generate_master();
        assert!(master.is_master());
        assert_eq!(master.to_hex().len(), TOKEN_BYTES * 2);

        let parsed: Token = format!("0x{}", master.to_hex()).parse().unwrap();
        assert_eq!(parsed, master);

        let token = derive_election_unblinded_token(7, &master).unwrap();
        assert_eq!(token.form(), TokenForm::Unblinded);
        let parsed: Token = token.to_hex().parse().unwrap();
        assert_eq!(parsed, token);
        assert!(token.to_hex().starts_with("01"));

        // A signature tag is never a token
        let mut swapped = token.to_hex();
        swapped.replace_range(0..2, "03");
        assert!(matches!(
            swapped.parse::<Token>(),
            Err(ValidationError::WrongForm { .. })
        ));

        let json = serde_json::to_string(&token).unwrap();
        let back: Token = serde_json::from_str(&json).unwrap();
        assert_eq!(back, token);
    }

    #[test]
    fn test_token_range() {
        assert!(Token::master(BigUint::from(2u32)).is_err());
        assert!(Token::unblinded(BigUint::from(3u32)).is_ok());

        let too_big = BigUint::from(1u32) << (TOKEN_BYTES * 8);
        assert!(Token::unblinded(too_big).is_err());
    }

    #[test]
    fn test_election_token_derivation() {
        let master = Token::generate_master();

        let a1 = derive_election_unblinded_token(1, &master).unwrap();
        let a2 = derive_election_unblinded_token(1, &master).unwrap();
        let b = derive_election_unblinded_token(2, &master).unwrap();
        assert_eq!(a1, a2);
        assert_ne!(a1, b);

        let other = derive_election_unblinded_token(1, &Token::generate_master()).unwrap();
        assert_ne!(a1, other);

        // Only a master token can be the source
        let err = derive_election_unblinded_token(1, &a1).unwrap_err();
        assert!(err.is_invalid());
    }

    #[test]
    fn test_election_r_derivation() {
        let (params, _) = authority_params();
        let public = params.public();
        let master_token = Token::generate_master();
        let master_r = BlindingFactor::generate_master();
        let token = derive_election_unblinded_token(3, &master_token).unwrap();

        let r1 = derive_election_r(3, &master_r, &token, &public).unwrap();
        let r2 = derive_election_r(3, &master_r, &token, &public).unwrap();
        assert_eq!(r1, r2);
        assert!(!r1.is_master());
        assert_eq!(r1.byte_len(), public.modulus_bytes());
        assert!(r1.value() < public.n());

        let r3 = derive_election_r(4, &master_r, &token, &public).unwrap();
        assert_ne!(r1, r3);

        let parsed = BlindingFactor::from_hex(&r1.to_hex()).unwrap();
        assert_eq!(parsed, r1);

        // Election tokens and factors are not valid sources
        assert!(derive_election_r(3, &r1, &token, &public).is_err());
        assert!(derive_election_r(3, &master_r, &master_token, &public).is_err());
    }
}
