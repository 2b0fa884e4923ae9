use crate::*;
use alloy_primitives::Address;

const VOTING_TRANSACTION_DOMAIN: &[u8] = b"blindvote_voting_transaction";

/// A cast vote, ready to be co-signed and relayed
///
/// Carries the vote twice (RSA for the tallying authority, AES for the voter), and the unblinded
/// token and signature proving the voter was registered without revealing who they are.
/// A transaction is never changed in place; co-signing returns a new one.
///
/// ```compile_fail
/// fn retarget(tx: &mut blindvote::VotingTransaction) {
///     tx.election_id = 7;
/// }
/// ```
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct VotingTransaction {
    election_id: u64,
    voter_address: Address,
    encrypted_vote_rsa: EncryptedVotes,
    encrypted_vote_aes: EncryptedVotes,
    token: Token,
    signature: Signature,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    svs_signature: Option<Signature>,
}

impl VotingTransaction {
    pub fn election_id(&self) -> u64 {
        self.election_id
    }

    pub fn voter_address(&self) -> Address {
        self.voter_address
    }

    pub fn encrypted_vote_rsa(&self) -> &EncryptedVotes {
        &self.encrypted_vote_rsa
    }

    pub fn encrypted_vote_aes(&self) -> &EncryptedVotes {
        &self.encrypted_vote_aes
    }

    pub fn token(&self) -> &Token {
        &self.token
    }

    /// The registration signature on [`Self::token`]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn svs_signature(&self) -> Option<&Signature> {
        self.svs_signature.as_ref()
    }

    pub fn is_co_signed(&self) -> bool {
        self.svs_signature.is_some()
    }

    /// Canonical bytes covered by the co-signature. Everything but the co-signature itself.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = VOTING_TRANSACTION_DOMAIN.to_vec();
        out.extend(self.election_id.to_be_bytes());
        out.extend(self.voter_address.as_slice());
        let token = self.token.to_bytes();
        let signature = self.signature.to_bytes();
        for field in [
            self.encrypted_vote_rsa.payload.as_bytes(),
            self.encrypted_vote_aes.payload.as_bytes(),
            token.as_slice(),
            signature.as_slice(),
        ] {
            out.extend((field.len() as u32).to_be_bytes());
            out.extend(field);
        }
        out
    }

    /// Check the structure and the registration signature of a submitted vote.
    ///
    /// When `svs_pub_key` is given, the co-signature must be present and valid too.
    pub fn validate(
        &self,
        election_id: u64,
        register_pub_key: &RsaParams,
        svs_pub_key: Option<&RsaParams>,
    ) -> Result<(), ValidationError> {
        if self.election_id != election_id {
            return Err(ValidationError::ElectionMismatch);
        }
        self.encrypted_vote_rsa.validate_rsa_shape()?;
        self.encrypted_vote_aes.validate_aes()?;
        self.token.require_unblinded()?;

        if !verify_unblinded_signature(&self.signature, &self.token, register_pub_key) {
            return Err(ValidationError::SignatureVerificationFailed);
        }

        if let Some(svs_pub_key) = svs_pub_key {
            if !verify_svs_signature(self, svs_pub_key) {
                return Err(ValidationError::SignatureVerificationFailed);
            }
        }

        Ok(())
    }
}

/// A vote update. Replaces the ballot of an address that already voted, so no token is needed.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RecastTransaction {
    pub election_id: u64,
    pub voter_address: Address,
    pub encrypted_vote_rsa: EncryptedVotes,
    pub encrypted_vote_aes: EncryptedVotes,
}

fn check_encrypted_votes(
    encrypted_vote_rsa: &EncryptedVotes,
    encrypted_vote_aes: &EncryptedVotes,
) -> Result<(), ValidationError> {
    encrypted_vote_rsa.validate_rsa_shape()?;
    encrypted_vote_aes.validate_aes()?;
    Ok(())
}

pub fn create_voting_transaction_without_svs_signature(
    credentials: &ElectionCredentials,
    encrypted_vote_rsa: EncryptedVotes,
    encrypted_vote_aes: EncryptedVotes,
) -> Result<VotingTransaction, ValidationError> {
    check_encrypted_votes(&encrypted_vote_rsa, &encrypted_vote_aes)?;

    // Credentials enforce these already, but a transaction must never be built otherwise
    credentials.token().require_unblinded()?;
    if credentials.signature().is_blinded() {
        return Err(ValidationError::Blinded);
    }
    if credentials.voter_key().address() != credentials.voter_address() {
        return Err(ValidationError::AddressKeyMismatch);
    }

    Ok(VotingTransaction {
        election_id: credentials.election_id(),
        voter_address: credentials.voter_address(),
        encrypted_vote_rsa,
        encrypted_vote_aes,
        token: credentials.token().clone(),
        signature: credentials.signature().clone(),
        svs_signature: None,
    })
}

/// Attach a co-signature, returning a new transaction. An existing co-signature is never replaced.
pub fn add_svs_signature_to_voting_transaction(
    transaction: &VotingTransaction,
    svs_signature: Signature,
) -> Result<VotingTransaction, ValidationError> {
    if transaction.is_co_signed() {
        return Err(ValidationError::AlreadyCoSigned);
    }
    if svs_signature.is_blinded() {
        return Err(ValidationError::Blinded);
    }

    Ok(VotingTransaction {
        svs_signature: Some(svs_signature),
        ..transaction.clone()
    })
}

pub fn create_recast_transaction(
    credentials: &ElectionCredentials,
    encrypted_vote_rsa: EncryptedVotes,
    encrypted_vote_aes: EncryptedVotes,
) -> Result<RecastTransaction, ValidationError> {
    check_encrypted_votes(&encrypted_vote_rsa, &encrypted_vote_aes)?;

    Ok(RecastTransaction {
        election_id: credentials.election_id(),
        voter_address: credentials.voter_address(),
        encrypted_vote_rsa,
        encrypted_vote_aes,
    })
}

/// Produce the co-signature for a vote, as the secondary signing service does once it has
/// accepted it.
pub fn sign_voting_transaction(
    transaction: &VotingTransaction,
    svs_params: &RsaParams,
) -> Result<Signature, Error> {
    sign_message(&transaction.signing_bytes(), svs_params)
}

/// False if the co-signature is missing or does not match
pub fn verify_svs_signature(transaction: &VotingTransaction, svs_pub_key: &RsaParams) -> bool {
    match transaction.svs_signature() {
        Some(signature) => verify_message(signature, &transaction.signing_bytes(), svs_pub_key),
        None => false,
    }
}
