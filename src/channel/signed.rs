use std::collections::BTreeMap;

use super::{state::State, PartIdx};
use crate::{
    sig::{self, Signer},
    types::{Address, Hash, Signature},
};

#[derive(Debug, thiserror::Error)]
pub enum SignedStateError {
    #[error("signature recovery failed: {0}")]
    RecoveryFailed(#[from] sig::Error),
    #[error("signer {0} is not a participant")]
    UnknownSigner(Address),
    #[error("participant {0} has already signed")]
    DuplicateSignature(PartIdx),
    #[error("cannot merge signed states with different hashes {0} and {1}")]
    StateMismatch(Hash, Hash),
    #[error("participant {0} has conflicting signatures")]
    ConflictingSignature(PartIdx),
}

/// A state together with the signatures collected for it so far.
///
/// Signatures can only enter through [SignedState::add_signature], which
/// checks them against the participant list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedState {
    state: State,
    sigs: BTreeMap<PartIdx, Signature>,
}

impl SignedState {
    pub fn new(state: State) -> Self {
        Self {
            state,
            sigs: BTreeMap::new(),
        }
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn into_state(self) -> State {
        self.state
    }

    /// Recover the signer and store the signature at their index.
    pub fn add_signature(&mut self, sig: Signature) -> Result<PartIdx, SignedStateError> {
        let signer = self.state.recover_signer(sig)?;
        let idx = self
            .state
            .participant_index(signer)
            .ok_or(SignedStateError::UnknownSigner(signer))?;
        if self.sigs.contains_key(&idx) {
            return Err(SignedStateError::DuplicateSignature(idx));
        }
        self.sigs.insert(idx, sig);
        Ok(idx)
    }

    /// Sign the state ourselves and store the signature.
    pub fn sign(&mut self, signer: &Signer) -> Result<Signature, SignedStateError> {
        let sig = signer.sign_eth(self.state.hash())?;
        self.add_signature(sig)?;
        Ok(sig)
    }

    /// Add all signatures of `other` not yet present.
    ///
    /// Leaves `self` untouched if an error is returned.
    pub fn merge(&mut self, other: &SignedState) -> Result<(), SignedStateError> {
        let (mine, theirs) = (self.state.hash(), other.state.hash());
        if mine != theirs {
            return Err(SignedStateError::StateMismatch(mine, theirs));
        }

        let mut merged = self.clone();
        for (idx, sig) in &other.sigs {
            match merged.sigs.get(idx) {
                Some(existing) if existing == sig => {}
                Some(_) => return Err(SignedStateError::ConflictingSignature(*idx)),
                None => {
                    merged.add_signature(*sig)?;
                }
            }
        }
        *self = merged;
        Ok(())
    }

    pub fn signature(&self, idx: PartIdx) -> Option<Signature> {
        self.sigs.get(&idx).copied()
    }

    pub fn signatures(&self) -> impl Iterator<Item = (PartIdx, Signature)> + '_ {
        self.sigs.iter().map(|(i, s)| (*i, *s))
    }

    pub fn has_signature_for(&self, idx: PartIdx) -> bool {
        self.sigs.contains_key(&idx)
    }

    pub fn has_all_signatures(&self) -> bool {
        self.sigs.len() == self.state.participants.len()
    }

    pub fn signature_count(&self) -> usize {
        self.sigs.len()
    }
}
