use crate::*;
use alloy_primitives::{keccak256, Address, B256};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;

/// A voter's per-election ethereum signing key
#[derive(Clone)]
pub struct VoterKey {
    signing_key: SigningKey,
}

impl VoterKey {
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng {};
        VoterKey {
            signing_key: SigningKey::random(&mut csprng),
        }
    }

    pub fn from_hex(s: &str) -> Result<Self, Error> {
        let bytes = decode_fixed_hex(s, 32)?;
        Ok(VoterKey {
            signing_key: SigningKey::from_slice(&bytes)?,
        })
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    pub fn address(&self) -> Address {
        address_of(self.signing_key.verifying_key())
    }

    /// Sign a 32-byte hash, producing `r || s || v` with `v` in 27/28
    pub fn sign_hash(&self, hash: &B256) -> Result<EthSignature, Error> {
        let (signature, recovery_id) = self.signing_key.sign_prehash_recoverable(hash.as_slice())?;

        let mut out = [0u8; ETH_SIGNATURE_LENGTH];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte() + 27;
        Ok(EthSignature(out))
    }
}

impl std::fmt::Debug for VoterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "VoterKey({})", self.address())
    }
}

fn address_of(key: &VerifyingKey) -> Address {
    let point = k256::PublicKey::from(key).to_encoded_point(false);
    // Skip the 0x04 uncompressed-point marker
    let hash = keccak256(&point.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

/// Recover the address that produced `signature` over `hash`
pub fn recover_address(hash: &B256, signature: &EthSignature) -> Result<Address, ValidationError> {
    let recovery_id =
        RecoveryId::from_byte(signature.recovery_byte()).ok_or(ValidationError::BadEthSignature)?;
    let sig = EcdsaSignature::from_slice(&signature.0[..64])
        .map_err(|_| ValidationError::BadEthSignature)?;
    let key = VerifyingKey::recover_from_prehash(hash.as_slice(), &sig, recovery_id)
        .map_err(|_| ValidationError::BadEthSignature)?;
    Ok(address_of(&key))
}

/// Everything a voter needs to cast a vote in one election
///
/// Only ever holds an unblinded election token and an unblinded signature. Blinded and master
/// material stay on the issuance side.
#[derive(Clone, Debug)]
pub struct ElectionCredentials {
    election_id: u64,
    voter_key: VoterKey,
    voter_address: Address,
    token: Token,
    signature: Signature,
    vote_key: VoteKey,
}

impl ElectionCredentials {
    pub fn new(
        election_id: u64,
        voter_key: VoterKey,
        voter_address: Address,
        token: Token,
        signature: Signature,
        vote_key: VoteKey,
    ) -> Result<Self, ValidationError> {
        token.require_unblinded()?;
        if signature.is_blinded() {
            return Err(ValidationError::Blinded);
        }
        if voter_key.address() != voter_address {
            return Err(ValidationError::AddressKeyMismatch);
        }

        Ok(ElectionCredentials {
            election_id,
            voter_key,
            voter_address,
            token,
            signature,
            vote_key,
        })
    }

    /// Rebuild credentials from their stored text forms
    pub fn from_parts(
        election_id: u64,
        voter_key_hex: &str,
        voter_address: &str,
        token_hex: &str,
        signature_hex: &str,
        vote_key_hex: &str,
    ) -> Result<Self, Error> {
        let token: Token = token_hex.parse()?;
        let signature: Signature = signature_hex.parse()?;
        Ok(ElectionCredentials::new(
            election_id,
            VoterKey::from_hex(voter_key_hex)?,
            parse_address(voter_address)?,
            token,
            signature,
            VoteKey::from_hex(vote_key_hex)?,
        )?)
    }

    pub fn election_id(&self) -> u64 {
        self.election_id
    }

    pub fn voter_key(&self) -> &VoterKey {
        &self.voter_key
    }

    pub fn voter_address(&self) -> Address {
        self.voter_address
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn vote_key(&self) -> &VoteKey {
        &self.vote_key
    }
}

/// The voter's half of an issuance round: the election token, and its blinded form for the authority
#[derive(Clone, Debug)]
pub struct BlindingRequest {
    pub election_id: u64,
    pub token: Token,
    pub blinded_token: Token,
}

/// Derive this election's token and blind it for the registering authority
pub fn prepare_blinding_request(
    election_id: u64,
    master_token: &Token,
    master_r: &BlindingFactor,
    register_pub_key: &RsaParams,
) -> Result<BlindingRequest, Error> {
    let token = derive_election_unblinded_token(election_id, master_token)?;
    let r = derive_election_r(election_id, master_r, &token, register_pub_key)?;
    let blinded_token = blind_token(&token, &r, register_pub_key)?;

    Ok(BlindingRequest {
        election_id,
        token,
        blinded_token,
    })
}

/// Unblind the authority's answer and assemble credentials.
///
/// `R` is derived again from the master secret, it is never kept between the two halves.
pub fn complete_issuance(
    request: &BlindingRequest,
    blind_signature: &Signature,
    master_r: &BlindingFactor,
    register_pub_key: &RsaParams,
    voter_key: VoterKey,
    vote_key: VoteKey,
) -> Result<ElectionCredentials, Error> {
    let r = derive_election_r(request.election_id, master_r, &request.token, register_pub_key)?;
    let signature = unblind_signature(blind_signature, &r, register_pub_key)?;

    if !verify_unblinded_signature(&signature, &request.token, register_pub_key) {
        return Err(ValidationError::SignatureVerificationFailed.into());
    }

    let voter_address = voter_key.address();
    Ok(ElectionCredentials::new(
        request.election_id,
        voter_key,
        voter_address,
        request.token.clone(),
        signature,
        vote_key,
    )?)
}
