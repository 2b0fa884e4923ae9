//! Ballot contents: an ordered list of vote-option codes, and the two encrypted copies that
//! travel in a voting transaction.

use crate::*;
use rsa::{RsaPrivateKey, RsaPublicKey};

/// A vote-option code
pub type VoteOption = u32;

/// Code used to fill missing positions when decoding legacy ballots
pub const ABSTAIN: VoteOption = 0;

/// Join vote options into their canonical comma-separated form. Order is preserved.
pub fn encode_votes(votes: &[VoteOption]) -> Result<String, ValidationError> {
    if votes.is_empty() {
        return Err(ValidationError::EmptyVotes);
    }
    let codes: Vec<String> = votes.iter().map(|v| v.to_string()).collect();
    Ok(codes.join(","))
}

/// Split a decrypted vote string and check every code against `allowed`
pub fn decode_votes(s: &str, allowed: &[VoteOption]) -> Result<Vec<VoteOption>, ValidationError> {
    if s.trim().is_empty() {
        return Err(ValidationError::EmptyVotes);
    }
    s.split(',')
        .map(|code| {
            let code = code.trim();
            match code.parse::<VoteOption>() {
                Ok(option) if allowed.contains(&option) => Ok(option),
                _ => Err(ValidationError::InvalidVoteOption(code.to_string())),
            }
        })
        .collect()
}

/// Decode a ballot from the older format, which omitted trailing abstentions.
///
/// Missing positions up to `expected_count` are filled with [`ABSTAIN`].
pub fn decode_votes_legacy(
    s: &str,
    allowed: &[VoteOption],
    expected_count: usize,
) -> Result<Vec<VoteOption>, ValidationError> {
    let mut votes = if s.trim().is_empty() {
        Vec::new()
    } else {
        s.split(',')
            .map(|code| {
                let code = code.trim();
                match code.parse::<VoteOption>() {
                    Ok(option) if option == ABSTAIN || allowed.contains(&option) => Ok(option),
                    _ => Err(ValidationError::InvalidVoteOption(code.to_string())),
                }
            })
            .collect::<Result<Vec<_>, _>>()?
    };

    if votes.len() > expected_count {
        return Err(ValidationError::TooManyVotes {
            expected: expected_count,
            actual: votes.len(),
        });
    }
    votes.resize(expected_count, ABSTAIN);
    Ok(votes)
}

/// The same ballot encrypted under the voter's AES key and the election's RSA key
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct EncryptedBallot {
    pub rsa: EncryptedVotes,
    pub aes: EncryptedVotes,
}

/// Encrypt a ballot under both keys
pub fn encrypt_votes(
    votes: &[VoteOption],
    vote_key: &VoteKey,
    election_key: &RsaPublicKey,
    configured_bits: usize,
) -> Result<EncryptedBallot, Error> {
    let encoded = encode_votes(votes)?;
    Ok(EncryptedBallot {
        rsa: encrypt_rsa(encoded.as_bytes(), election_key, configured_bits)?,
        aes: encrypt_aes(encoded.as_bytes(), vote_key)?,
    })
}

/// Recover a ballot from its AES copy, as the voter does when checking their own vote
pub fn decrypt_votes_aes(
    encrypted: &EncryptedVotes,
    vote_key: &VoteKey,
    allowed: &[VoteOption],
) -> Result<Vec<VoteOption>, Error> {
    let plaintext = decrypt_aes(encrypted, vote_key)?;
    let s = String::from_utf8(plaintext).map_err(|_| ValidationError::BadCiphertext)?;
    Ok(decode_votes(&s, allowed)?)
}

/// Recover a ballot from its RSA copy, as the tallying authority does
pub fn decrypt_votes_rsa(
    encrypted: &EncryptedVotes,
    election_key: &RsaPrivateKey,
    configured_bits: usize,
    allowed: &[VoteOption],
) -> Result<Vec<VoteOption>, Error> {
    let plaintext = decrypt_rsa(encrypted, election_key, configured_bits)?;
    let s = String::from_utf8(plaintext).map_err(|_| ValidationError::BadCiphertext)?;
    Ok(decode_votes(&s, allowed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::authority_params;

    #[test]
    fn test_encode_decode() {
        assert_eq!(encode_votes(&[3, 1, 2]).unwrap(), "3,1,2");
        assert_eq!(encode_votes(&[]), Err(ValidationError::EmptyVotes));

        let allowed = [1, 2, 3];
        assert_eq!(decode_votes("3,1,2", &allowed).unwrap(), vec![3, 1, 2]);
        assert_eq!(
            decode_votes("3,9", &allowed),
            Err(ValidationError::InvalidVoteOption("9".to_string()))
        );
        assert!(decode_votes("3,,1", &allowed).is_err());
        assert!(decode_votes("", &allowed).is_err());
    }

    #[test]
    fn test_legacy_decode() {
        let allowed = [1, 2, 3];
        assert_eq!(
            decode_votes_legacy("2", &allowed, 3).unwrap(),
            vec![2, ABSTAIN, ABSTAIN]
        );
        assert_eq!(
            decode_votes_legacy("", &allowed, 2).unwrap(),
            vec![ABSTAIN, ABSTAIN]
        );
        assert!(matches!(
            decode_votes_legacy("1,2,3", &allowed, 2),
            Err(ValidationError::TooManyVotes { .. })
        ));
    }

    #[test]
    fn test_encrypt_votes() {
        let (_, private) = authority_params();
        let vote_key = VoteKey::generate();
        let allowed = [1, 2, 3, 4];
        let votes = vec![4, 2, 2, 1];

        let ballot = encrypt_votes(&votes, &vote_key, &private.to_public_key(), 2048).unwrap();
        assert_eq!(ballot.rsa.encryption_type, EncryptionType::RSA);
        assert_eq!(ballot.aes.encryption_type, EncryptionType::AES);

        assert_eq!(
            decrypt_votes_aes(&ballot.aes, &vote_key, &allowed).unwrap(),
            votes
        );
        assert_eq!(
            decrypt_votes_rsa(&ballot.rsa, private, 2048, &allowed).unwrap(),
            votes
        );

        assert!(encrypt_votes(&[], &vote_key, &private.to_public_key(), 2048).is_err());
    }
}
