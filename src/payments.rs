//! Vouchers: signed, cumulative payment claims on a virtual channel.

use std::sync::Arc;

use crate::{
    abi::{self, Token},
    sig::{self, Signer},
    store::{Store, StoreError},
    types::{Address, Destination, Hash, Signature, U256},
};

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sig(#[from] sig::Error),
    #[error("only the payer {payer} can pay on channel {channel_id}")]
    NotPayer {
        channel_id: Destination,
        payer: Address,
    },
    #[error("voucher signed by {got}, expected the payer {expected}")]
    WrongSigner { expected: Address, got: Address },
    #[error("voucher for {amount} exceeds the channel balance {balance}")]
    ExceedsBalance { amount: U256, balance: U256 },
}

/// The payer's promise that the payee may claim `amount` in total.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Voucher {
    pub channel_id: Destination,
    pub amount: U256,
    pub signature: Signature,
}

impl Voucher {
    pub fn hash(&self) -> Hash {
        abi::to_hash(&[self.channel_id.into(), Token::Uint(self.amount)])
    }

    pub fn sign(&mut self, signer: &Signer) -> Result<(), sig::Error> {
        self.signature = signer.sign_eth(self.hash())?;
        Ok(())
    }

    pub fn recover_signer(&self) -> Result<Address, sig::Error> {
        sig::recover_signer(self.hash(), self.signature)
    }
}

/// What a payer or payee knows about the payments on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoucherInfo {
    pub channel_id: Destination,
    pub payer: Address,
    pub payee: Address,
    pub starting_balance: U256,
    pub largest_voucher: Voucher,
}

impl VoucherInfo {
    pub fn paid(&self) -> U256 {
        self.largest_voucher.amount
    }

    pub fn remaining(&self) -> U256 {
        self.starting_balance.saturating_sub(self.paid())
    }
}

/// Issues and accepts vouchers, keeping the largest one per channel in the
/// store.
pub struct VoucherManager {
    me: Address,
    store: Arc<dyn Store>,
}

impl VoucherManager {
    pub fn new(me: Address, store: Arc<dyn Store>) -> Self {
        Self { me, store }
    }

    /// Start tracking payments on a channel. Registering twice keeps the
    /// existing record.
    pub fn register(
        &self,
        channel_id: Destination,
        payer: Address,
        payee: Address,
        starting_balance: U256,
    ) -> Result<(), PaymentError> {
        match self.store.get_voucher_info(&channel_id) {
            Ok(_) => Ok(()),
            Err(StoreError::VoucherInfoNotFound(_)) => {
                self.store.set_voucher_info(VoucherInfo {
                    channel_id,
                    payer,
                    payee,
                    starting_balance,
                    largest_voucher: Voucher {
                        channel_id,
                        ..Default::default()
                    },
                })?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Pay `amount` on top of what has already been paid, returning the new
    /// cumulative voucher.
    pub fn pay(
        &self,
        channel_id: Destination,
        amount: U256,
        signer: &Signer,
    ) -> Result<Voucher, PaymentError> {
        let mut info = self.store.get_voucher_info(&channel_id)?;
        if info.payer != self.me {
            return Err(PaymentError::NotPayer {
                channel_id,
                payer: info.payer,
            });
        }
        let total = info.paid().saturating_add(amount);
        if total > info.starting_balance {
            return Err(PaymentError::ExceedsBalance {
                amount: total,
                balance: info.starting_balance,
            });
        }

        let mut voucher = Voucher {
            channel_id,
            amount: total,
            signature: Signature::default(),
        };
        voucher.sign(signer)?;
        info.largest_voucher = voucher.clone();
        self.store.set_voucher_info(info)?;
        tracing::debug!(channel = %channel_id, paid = %total, "issued voucher");
        Ok(voucher)
    }

    /// Accept a voucher from the payer, returning the total received so far.
    /// Vouchers not larger than the current one change nothing.
    pub fn receive(&self, voucher: Voucher) -> Result<U256, PaymentError> {
        let mut info = self.store.get_voucher_info(&voucher.channel_id)?;
        let signer = voucher.recover_signer()?;
        if signer != info.payer {
            return Err(PaymentError::WrongSigner {
                expected: info.payer,
                got: signer,
            });
        }
        if voucher.amount > info.starting_balance {
            return Err(PaymentError::ExceedsBalance {
                amount: voucher.amount,
                balance: info.starting_balance,
            });
        }
        if voucher.amount <= info.paid() {
            return Ok(info.paid());
        }

        let total = voucher.amount;
        info.largest_voucher = voucher;
        self.store.set_voucher_info(info)?;
        Ok(total)
    }

    pub fn paid(&self, channel_id: &Destination) -> Result<U256, PaymentError> {
        Ok(self.store.get_voucher_info(channel_id)?.paid())
    }

    pub fn voucher_info(&self, channel_id: &Destination) -> Result<VoucherInfo, PaymentError> {
        Ok(self.store.get_voucher_info(channel_id)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{channel::state::tests::signers, store::MemStore};

    fn managers() -> (VoucherManager, VoucherManager, Signer, Signer) {
        let (alice, bob) = signers();
        let channel = Destination([7; 32]);
        let a = VoucherManager::new(alice.address(), Arc::new(MemStore::new()));
        let b = VoucherManager::new(bob.address(), Arc::new(MemStore::new()));
        for m in [&a, &b] {
            m.register(channel, alice.address(), bob.address(), 10.into())
                .unwrap();
        }
        (a, b, alice, bob)
    }

    #[test]
    fn vouchers_are_cumulative() {
        let (a, b, alice, _) = managers();
        let channel = Destination([7; 32]);

        let first = a.pay(channel, 3.into(), &alice).unwrap();
        let second = a.pay(channel, 4.into(), &alice).unwrap();
        assert_eq!(second.amount, 7.into());

        assert_eq!(b.receive(second.clone()).unwrap(), 7.into());
        // An older voucher arriving late changes nothing.
        assert_eq!(b.receive(first).unwrap(), 7.into());
        assert_eq!(b.receive(second).unwrap(), 7.into());
        assert_eq!(b.paid(&channel).unwrap(), 7.into());
        assert_eq!(b.voucher_info(&channel).unwrap().remaining(), 3.into());
    }

    #[test]
    fn payments_are_bounded_and_authenticated() {
        let (a, b, alice, bob) = managers();
        let channel = Destination([7; 32]);

        assert!(matches!(
            a.pay(channel, 11.into(), &alice),
            Err(PaymentError::ExceedsBalance { .. })
        ));
        assert!(matches!(
            b.pay(channel, 1.into(), &bob),
            Err(PaymentError::NotPayer { .. })
        ));

        let mut forged = Voucher {
            channel_id: channel,
            amount: 5.into(),
            signature: Signature::default(),
        };
        forged.sign(&bob).unwrap();
        assert!(matches!(
            b.receive(forged),
            Err(PaymentError::WrongSigner { .. })
        ));
    }

    #[test]
    fn unknown_channel() {
        let (a, _, alice, _) = managers();
        assert!(matches!(
            a.pay(Destination([8; 32]), 1.into(), &alice),
            Err(PaymentError::Store(StoreError::VoucherInfoNotFound(_)))
        ));
    }

    #[test]
    fn registering_twice_keeps_payments() {
        let (a, _, alice, bob) = managers();
        let channel = Destination([7; 32]);
        a.pay(channel, 2.into(), &alice).unwrap();
        a.register(channel, alice.address(), bob.address(), 10.into())
            .unwrap();
        assert_eq!(a.paid(&channel).unwrap(), 2.into());
    }
}
