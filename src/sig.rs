//! Handles the creation and verification of (Ethereum) Signatures.

use crate::types::{Address, Hash, Signature};
use sha3::{Digest, Keccak256};

mod k256;
pub use self::k256::Signer;


#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("ecdsa: {0}")]
    Ecdsa(::k256::ecdsa::Error),
    #[error("invalid recovery byte {0}")]
    InvalidRecoveryId(u8),
}

impl From<::k256::ecdsa::Error> for Error {
    fn from(e: ::k256::ecdsa::Error) -> Self {
        Self::Ecdsa(e)
    }
}

/// Add the `\x19Ethereum Signed Message\n<length>` prefix to hash.
///
/// This is the format expected by the Solidity contracts.
fn hash_to_eth_signed_msg_hash(hash: Hash) -> Hash {
    // Packed encoding => We can't use the abi encoder
    let mut hasher = Keccak256::new();
    hasher.update(b"\x19Ethereum Signed Message:\n32");
    hasher.update(hash.0);
    Hash(hasher.finalize().into())
}

/// Recover the address that produced `sig` over `msg`.
///
/// `msg` is the hash given to [Signer::sign_eth], without the `Ethereum Signed
/// Message` prefix.
pub fn recover_signer(msg: Hash, sig: Signature) -> Result<Address, Error> {
    self::k256::recover(msg, sig)
}
