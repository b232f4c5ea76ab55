//! Fixed-size value types shared by every layer: addresses, destinations,
//! hashes, signatures and the 256-bit amount type.

use core::fmt::{self, Debug, Display};

use rand::{distributions::Standard, prelude::Distribution};
use uint::construct_uint;

macro_rules! impl_hex_fmt {
    ($T:ident) => {
        impl Debug for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("0x")?;
                for b in self.0 {
                    f.write_fmt(format_args!("{:02x}", b))?;
                }
                Ok(())
            }
        }

        impl Display for $T {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                Debug::fmt(self, f)
            }
        }
    };
}

macro_rules! bytesN {
    ( $T:ident, $N:literal ) => {
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Copy, Clone)]
        pub struct $T(pub [u8; $N]);

        impl Distribution<$T> for Standard {
            fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> $T {
                let mut bytes = [0u8; $N];
                rng.fill(&mut bytes[..]);
                $T(bytes)
            }
        }

        impl Default for $T {
            fn default() -> Self {
                Self([0; $N])
            }
        }

        impl TryFrom<&[u8]> for $T {
            type Error = core::array::TryFromSliceError;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                Ok(Self(value.try_into()?))
            }
        }

        impl_hex_fmt!($T);
    };
}

bytesN!(Hash, 32);
bytesN!(Address, 20);
bytesN!(Destination, 32);
bytesN!(Signature, 65);

impl Signature {
    pub fn new(rs: &[u8; 64], v: u8) -> Self {
        let mut sig = Signature([0; 65]);
        sig.0[..64].copy_from_slice(rs);
        sig.0[64] = v;
        sig
    }
}

/// An [Address] is padded to a [Destination] by prepending 12 zero bytes.
impl From<Address> for Destination {
    fn from(addr: Address) -> Self {
        let mut bytes = [0u8; 32];
        bytes[32 - 20..].copy_from_slice(&addr.0);
        Destination(bytes)
    }
}

impl From<Hash> for Destination {
    fn from(hash: Hash) -> Self {
        Destination(hash.0)
    }
}

impl Destination {
    /// External destinations are zero-padded addresses, everything else
    /// refers to a channel.
    pub fn is_external(&self) -> bool {
        self.0[..12].iter().all(|b| *b == 0)
    }

    /// Returns the address if this is an external destination.
    pub fn to_address(&self) -> Option<Address> {
        if !self.is_external() {
            return None;
        }
        let mut addr = Address::default();
        addr.0.copy_from_slice(&self.0[12..]);
        Some(addr)
    }
}

// Amounts and other uints are kept in our own type instead of
// primitive_types, whose serde impls write hex strings.
construct_uint! {
    pub struct U256(4);
}

impl U256 {
    pub fn to_be_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        self.to_big_endian(&mut bytes);
        bytes
    }
}

impl Distribution<U256> for Standard {
    fn sample<R: rand::Rng + ?Sized>(&self, rng: &mut R) -> U256 {
        let buf: [u8; 32] = rng.gen();
        U256::from_big_endian(&buf)
    }
}

/// Sequence number of a channel state.
pub type TurnNum = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_pads_to_external_destination() {
        let addr = Address([0xab; 20]);
        let dest = Destination::from(addr);

        assert!(dest.is_external());
        assert_eq!(&dest.0[..12], &[0u8; 12]);
        assert_eq!(dest.to_address(), Some(addr));
    }

    #[test]
    fn hash_destination_is_internal() {
        let mut bytes = [0u8; 32];
        bytes[0] = 1;
        let dest = Destination::from(Hash(bytes));

        assert!(!dest.is_external());
        assert_eq!(dest.to_address(), None);
    }

    #[test]
    fn hex_display() {
        let addr = Address([0x0f; 20]);
        assert_eq!(
            format!("{}", addr),
            "0x0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f0f"
        );
    }
}
