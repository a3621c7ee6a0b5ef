//! Token minting and digesting.
//!
//! A token is `cl1.` followed by 32 random bytes from the OS, hex-encoded.
//! Only a digest bound to (match, role) is stored, so a token leaked from
//! one match or one side is useless anywhere else.

use carrylink_types::{DeliveryToken, MatchId, PartyRole, constants};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use subtle::{Choice, ConstantTimeEq};

/// SHA-256 of a token, bound to its match and role.
pub(crate) type TokenDigest = [u8; 32];

/// Mint a fresh, unguessable token.
pub(crate) fn mint() -> DeliveryToken {
    let mut bytes = [0u8; constants::TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    DeliveryToken::new(format!("{}{}", constants::TOKEN_PREFIX, hex::encode(bytes)))
}

pub(crate) fn digest(match_id: MatchId, role: PartyRole, token: &DeliveryToken) -> TokenDigest {
    let mut hasher = Sha256::new();
    hasher.update(b"carrylink:delivery_token:v1:");
    hasher.update(match_id.0.as_bytes());
    hasher.update(match role {
        PartyRole::Carrier => b"c",
        PartyRole::Sender => b"s",
    });
    hasher.update(token.as_str().as_bytes());
    hasher.finalize().into()
}

/// Constant-time equality of two digests. Combine results with `&` and
/// convert to `bool` only once.
pub(crate) fn digests_equal(a: &TokenDigest, b: &TokenDigest) -> Choice {
    a.ct_eq(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minted_tokens_are_prefixed_and_unique() {
        let a = mint();
        let b = mint();
        assert!(a.as_str().starts_with(constants::TOKEN_PREFIX));
        assert_eq!(
            a.as_str().len(),
            constants::TOKEN_PREFIX.len() + constants::TOKEN_BYTES * 2
        );
        assert_ne!(a, b);
    }

    #[test]
    fn digest_is_bound_to_match_and_role() {
        let token = mint();
        let m = MatchId::new();
        let carrier = digest(m, PartyRole::Carrier, &token);
        let same: bool = digests_equal(&carrier, &digest(m, PartyRole::Carrier, &token)).into();
        let other_role: bool = digests_equal(&carrier, &digest(m, PartyRole::Sender, &token)).into();
        let other_match: bool =
            digests_equal(&carrier, &digest(MatchId::new(), PartyRole::Carrier, &token)).into();
        assert!(same);
        assert!(!other_role);
        assert!(!other_match);
    }
}
