use crate::protocols::Objective;

/// Decides whether to join objectives started by counterparties.
pub trait PolicyMaker: Send + Sync {
    fn should_approve(&self, objective: &Objective) -> bool;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissivePolicy;

impl PolicyMaker for PermissivePolicy {
    fn should_approve(&self, _: &Objective) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllPolicy;

impl PolicyMaker for RejectAllPolicy {
    fn should_approve(&self, objective: &Objective) -> bool {
        tracing::info!(objective = %objective.id(), "policy rejects objective");
        false
    }
}
