//! Solidity ABI encoding (`abi.encode(...)`) of the few shapes the protocol
//! hashes, plus Keccak-256 over the result.
//!
//! Values are described as a [Token] tree and encoded with the usual
//! head/tail scheme: static values are written in place, dynamic values
//! (`bytes`, `T[]` and tuples containing either) get an offset in the head and
//! their content in the tail.

use crate::types::{Address, Destination, Hash, U256};
use sha3::{Digest, Keccak256};

const SLOT_SIZE: usize = 32; // bytes

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Address(Address),
    Uint(U256),
    Bool(bool),
    /// `bytesN` with `N <= 32`, left aligned in its slot.
    FixedBytes(Vec<u8>),
    /// Dynamic length `bytes`.
    Bytes(Vec<u8>),
    /// Dynamic length `T[]`.
    Array(Vec<Token>),
    Tuple(Vec<Token>),
}

impl Token {
    pub fn uint(v: impl Into<U256>) -> Self {
        Token::Uint(v.into())
    }

    fn is_dynamic(&self) -> bool {
        match self {
            Token::Bytes(_) | Token::Array(_) => true,
            Token::Tuple(tokens) => tokens.iter().any(Token::is_dynamic),
            _ => false,
        }
    }

    /// Number of bytes this token occupies in the head of its parent.
    fn head_size(&self) -> usize {
        match self {
            _ if self.is_dynamic() => SLOT_SIZE,
            Token::Tuple(tokens) => tokens.iter().map(Token::head_size).sum(),
            _ => SLOT_SIZE,
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Token::Address(addr) => {
                // Addresses are right aligned (like uints), unlike bytesN.
                let mut slot = [0u8; SLOT_SIZE];
                slot[SLOT_SIZE - 20..].copy_from_slice(&addr.0);
                out.extend_from_slice(&slot);
            }
            Token::Uint(v) => out.extend_from_slice(&v.to_be_bytes()),
            Token::Bool(b) => write_len(out, *b as usize),
            Token::FixedBytes(bytes) => write_padded(out, bytes),
            Token::Bytes(bytes) => {
                write_len(out, bytes.len());
                write_padded(out, bytes);
            }
            Token::Array(tokens) => {
                write_len(out, tokens.len());
                encode_sequence(tokens, out);
            }
            Token::Tuple(tokens) => encode_sequence(tokens, out),
        }
    }
}

impl From<Address> for Token {
    fn from(addr: Address) -> Self {
        Token::Address(addr)
    }
}

impl From<Destination> for Token {
    fn from(dest: Destination) -> Self {
        Token::FixedBytes(dest.0.to_vec())
    }
}

impl From<Hash> for Token {
    fn from(hash: Hash) -> Self {
        Token::FixedBytes(hash.0.to_vec())
    }
}

impl From<U256> for Token {
    fn from(v: U256) -> Self {
        Token::Uint(v)
    }
}

impl From<bool> for Token {
    fn from(b: bool) -> Self {
        Token::Bool(b)
    }
}

fn write_len(out: &mut Vec<u8>, len: usize) {
    out.extend_from_slice(&U256::from(len).to_be_bytes());
}

fn write_padded(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(bytes);
    let rem = bytes.len() % SLOT_SIZE;
    if rem != 0 {
        out.resize(out.len() + SLOT_SIZE - rem, 0);
    }
}

fn encode_sequence(tokens: &[Token], out: &mut Vec<u8>) {
    let head_size: usize = tokens.iter().map(Token::head_size).sum();
    let mut tail = Vec::new();
    for token in tokens {
        if token.is_dynamic() {
            write_len(out, head_size + tail.len());
            token.encode_into(&mut tail);
        } else {
            token.encode_into(out);
        }
    }
    out.extend_from_slice(&tail);
}

/// Equivalent to `abi.encode(t0, t1, ...)` in Solidity.
pub fn encode(tokens: &[Token]) -> Vec<u8> {
    let mut out = Vec::new();
    encode_sequence(tokens, &mut out);
    out
}

pub fn keccak256(data: &[u8]) -> Hash {
    Hash(Keccak256::digest(data).into())
}

/// `keccak256(abi.encode(t0, t1, ...))`
pub fn to_hash(tokens: &[Token]) -> Hash {
    keccak256(&encode(tokens))
}
