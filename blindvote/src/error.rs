use thiserror::Error;

/// Error types
#[derive(Debug, Error)]
pub enum Error {
    #[error("blindvote: validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("blindvote: RSA error: {0}")]
    RSAError(#[from] rsa::errors::Error),

    #[error("blindvote: AES-GCM encryption failed")]
    EncryptionFailed,

    #[error("blindvote: failed to decrypt vote")]
    DecryptionError,

    #[error("blindvote: secp256k1 error: {0}")]
    EcdsaError(#[from] k256::ecdsa::Error),

    #[error("blindvote: key derivation failed")]
    KeyDerivation,

    #[error("blindvote: RSA key is {actual} bits but {expected} bits are configured")]
    KeySizeMismatch { expected: usize, actual: usize },

    #[error("blindvote: forward limit of {limit} reached")]
    ForwardLimitReached { limit: u32 },

    #[error("blindvote: forward counter unavailable: {0}")]
    ForwardCounterUnavailable(String),
}

/// Coarse classification of an [`Error`], so callers can branch without matching on messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A value failed a cryptographic or structural check. Not a system fault.
    CryptographicallyInvalid,

    /// Something outside the caller's inputs went wrong and may succeed on retry.
    TransientFault,

    /// Keys or parameters the process was configured with are unusable.
    Configuration,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::CryptographicallyInvalid,
            Error::DecryptionError => ErrorKind::CryptographicallyInvalid,
            Error::ForwardLimitReached { .. } => ErrorKind::CryptographicallyInvalid,
            Error::KeySizeMismatch { .. } => ErrorKind::Configuration,
            Error::RSAError(_) => ErrorKind::Configuration,
            Error::EcdsaError(_) => ErrorKind::Configuration,
            Error::EncryptionFailed => ErrorKind::TransientFault,
            Error::KeyDerivation => ErrorKind::TransientFault,
            Error::ForwardCounterUnavailable(_) => ErrorKind::TransientFault,
        }
    }

    /// True if this error means "the input is invalid" rather than "something broke".
    pub fn is_invalid(&self) -> bool {
        self.kind() == ErrorKind::CryptographicallyInvalid
    }
}

/// Validation errors
///
/// Every variant here is a rejection of caller-supplied material, never an internal fault.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("blindvote validation: invalid hexadecimal")]
    BadHex,

    #[error("blindvote validation: wrong length, expected {expected} hex characters, got {actual}")]
    BadLength { expected: usize, actual: usize },

    #[error("blindvote validation: value out of range")]
    OutOfRange,

    #[error("blindvote validation: unknown domain tag {0:#04x}")]
    UnknownTag(u8),

    #[error("blindvote validation: expected {expected}, got {actual}")]
    WrongForm {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("blindvote validation: master token where an election token is required")]
    MasterToken,

    #[error("blindvote validation: blinded value where an unblinded value is required")]
    Blinded,

    #[error("blindvote validation: unblinded value where a blinded value is required")]
    NotBlinded,

    #[error("blindvote validation: modulus must be at least {min} bits, got {actual}")]
    ModulusTooSmall { min: usize, actual: usize },

    #[error("blindvote validation: declared modulus bit length {declared} does not match {actual}")]
    ModulusBitLengthMismatch { declared: usize, actual: usize },

    #[error("blindvote validation: public exponent must be odd and greater than 2")]
    BadPublicExponent,

    #[error("blindvote validation: private exponent is dangerously small")]
    PrivateExponentTooSmall,

    #[error("blindvote validation: private exponent missing")]
    MissingPrivateExponent,

    #[error("blindvote validation: blinding factor is not invertible modulo N")]
    NotInvertible,

    #[error("blindvote validation: invalid ethereum address")]
    BadAddress,

    #[error("blindvote validation: voter address does not match voter key")]
    AddressKeyMismatch,

    #[error("blindvote validation: invalid ethereum signature")]
    BadEthSignature,

    #[error("blindvote validation: plaintext of {len} bytes outside allowed {min}..={max}")]
    PlaintextLength { len: usize, min: usize, max: usize },

    #[error("blindvote validation: encrypted vote is malformed")]
    BadCiphertext,

    #[error("blindvote validation: wrong encryption type, expected {0}")]
    WrongEncryptionType(&'static str),

    #[error("blindvote validation: no votes to encrypt")]
    EmptyVotes,

    #[error("blindvote validation: invalid vote option {0:?}")]
    InvalidVoteOption(String),

    #[error("blindvote validation: expected at most {expected} votes, got {actual}")]
    TooManyVotes { expected: usize, actual: usize },

    #[error("blindvote validation: voting transaction already carries a co-signature")]
    AlreadyCoSigned,

    #[error("blindvote validation: voting transaction is not co-signed")]
    NotCoSigned,

    #[error("blindvote validation: election mismatch")]
    ElectionMismatch,

    #[error("blindvote validation: signature verification failed")]
    SignatureVerificationFailed,
}
