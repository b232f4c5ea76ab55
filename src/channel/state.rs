use crate::{
    abi::{self, Token},
    sig::{self, Signer},
    types::{Address, Destination, Hash, Signature, TurnNum},
};

use super::outcome::Exit;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("channel id {0} collides with an external destination")]
    ExternalChannelId(Destination),
    #[error("a channel needs at least two participants, got {0}")]
    TooFewParticipants(usize),
    #[error("duplicate participant {0}")]
    DuplicateParticipant(Address),
    #[error("signing failed: {0}")]
    Signing(#[from] sig::Error),
}

/// The immutable identity of a channel, hashed to obtain its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedPart {
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
}

impl FixedPart {
    pub fn channel_id(&self) -> Destination {
        abi::to_hash(&[
            Token::Array(self.participants.iter().map(|p| (*p).into()).collect()),
            Token::uint(self.channel_nonce),
            self.app_definition.into(),
            Token::uint(self.challenge_duration),
        ])
        .into()
    }

    pub fn validate(&self) -> Result<(), StateError> {
        if self.participants.len() < 2 {
            return Err(StateError::TooFewParticipants(self.participants.len()));
        }
        for (i, p) in self.participants.iter().enumerate() {
            if self.participants[..i].contains(p) {
                return Err(StateError::DuplicateParticipant(*p));
            }
        }
        check_channel_id(self.channel_id())
    }
}

/// Channel ids must not be readable as a padded external address.
fn check_channel_id(id: Destination) -> Result<(), StateError> {
    if id.is_external() {
        return Err(StateError::ExternalChannelId(id));
    }
    Ok(())
}

/// The part of a state that changes from turn to turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariablePart {
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: TurnNum,
    pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub participants: Vec<Address>,
    pub channel_nonce: u64,
    pub app_definition: Address,
    pub challenge_duration: u32,
    pub app_data: Vec<u8>,
    pub outcome: Exit,
    pub turn_num: TurnNum,
    pub is_final: bool,
}

impl State {
    pub fn from_parts(fixed: FixedPart, variable: VariablePart) -> Self {
        Self {
            participants: fixed.participants,
            channel_nonce: fixed.channel_nonce,
            app_definition: fixed.app_definition,
            challenge_duration: fixed.challenge_duration,
            app_data: variable.app_data,
            outcome: variable.outcome,
            turn_num: variable.turn_num,
            is_final: variable.is_final,
        }
    }

    pub fn fixed_part(&self) -> FixedPart {
        FixedPart {
            participants: self.participants.clone(),
            channel_nonce: self.channel_nonce,
            app_definition: self.app_definition,
            challenge_duration: self.challenge_duration,
        }
    }

    pub fn variable_part(&self) -> VariablePart {
        VariablePart {
            app_data: self.app_data.clone(),
            outcome: self.outcome.clone(),
            turn_num: self.turn_num,
            is_final: self.is_final,
        }
    }

    pub fn channel_id(&self) -> Destination {
        self.fixed_part().channel_id()
    }

    pub fn validate(&self) -> Result<(), StateError> {
        self.fixed_part().validate()
    }

    pub fn hash(&self) -> Hash {
        abi::to_hash(&[
            self.channel_id().into(),
            Token::Bytes(self.app_data.clone()),
            self.outcome.to_token(),
            Token::uint(self.turn_num),
            self.is_final.into(),
        ])
    }

    pub fn sign(&self, signer: &Signer) -> Result<Signature, StateError> {
        Ok(signer.sign_eth(self.hash())?)
    }

    pub fn recover_signer(&self, sig: Signature) -> Result<Address, sig::Error> {
        sig::recover_signer(self.hash(), sig)
    }

    /// The same state at another turn (and finality).
    pub fn with_turn(&self, turn_num: TurnNum, is_final: bool) -> Self {
        Self {
            turn_num,
            is_final,
            ..self.clone()
        }
    }

    pub fn participant_index(&self, addr: Address) -> Option<usize> {
        self.participants.iter().position(|p| *p == addr)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::channel::outcome::{Allocation, SingleAssetExit};
    use rand::{rngs::StdRng, SeedableRng};

    pub(crate) fn signers() -> (Signer, Signer) {
        let mut rng = StdRng::seed_from_u64(0);
        (Signer::new(&mut rng), Signer::new(&mut rng))
    }

    pub(crate) fn test_state(alice: Address, bob: Address) -> State {
        State {
            participants: vec![alice, bob],
            channel_nonce: 37140676580,
            app_definition: Address([0x5e; 20]),
            challenge_duration: 60,
            app_data: Vec::new(),
            outcome: Exit(vec![SingleAssetExit::new(
                Address::default(),
                vec![
                    Allocation::normal(alice.into(), 5.into()),
                    Allocation::normal(bob.into(), 5.into()),
                ],
            )]),
            turn_num: 0,
            is_final: false,
        }
    }

    #[test]
    fn channel_id_is_deterministic() {
        let (a, b) = signers();
        let s = test_state(a.address(), b.address());
        assert_eq!(s.channel_id(), s.clone().channel_id());
        assert!(!s.channel_id().is_external());
        assert!(s.validate().is_ok());

        let mut other = s.clone();
        other.channel_nonce += 1;
        assert_ne!(s.channel_id(), other.channel_id());
    }

    #[test]
    fn hash_depends_on_variable_part() {
        let (a, b) = signers();
        let s = test_state(a.address(), b.address());
        assert_ne!(s.hash(), s.with_turn(1, false).hash());
        assert_ne!(s.hash(), s.with_turn(0, true).hash());
        assert_eq!(s.channel_id(), s.with_turn(5, true).channel_id());
    }

    #[test]
    fn sign_and_recover() {
        let (a, b) = signers();
        let s = test_state(a.address(), b.address());
        let sig = s.sign(&a).unwrap();
        assert_eq!(s.recover_signer(sig).unwrap(), a.address());
    }

    #[test]
    fn validate_rejects_malformed_fixed_parts() {
        let (a, _) = signers();
        let mut s = test_state(a.address(), a.address());
        assert!(matches!(
            s.validate(),
            Err(StateError::DuplicateParticipant(_))
        ));
        s.participants.pop();
        assert!(matches!(
            s.validate(),
            Err(StateError::TooFewParticipants(1))
        ));
    }

    #[test]
    fn duplicate_participant_anywhere_is_rejected() {
        let (a, b) = signers();
        let mut s = test_state(a.address(), b.address());
        s.participants.push(a.address());
        match s.validate() {
            Err(StateError::DuplicateParticipant(p)) => assert_eq!(p, a.address()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn external_looking_channel_id_is_rejected() {
        let (a, _) = signers();
        let padded = Destination::from(a.address());
        assert!(matches!(
            check_channel_id(padded),
            Err(StateError::ExternalChannelId(id)) if id == padded
        ));

        let mut inner = [0u8; 32];
        inner[11] = 1;
        assert!(check_channel_id(Destination(inner)).is_ok());
    }
}
