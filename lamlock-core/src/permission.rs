use crate::types::RequestStamp;

/// Why a grant was postponed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// We are inside the critical section
    HoldingResource,
    /// Our own outstanding request orders first
    EarlierRequest,
}

/// Outcome of the permission rule for one inbound request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Grant,
    Defer(DeferReason),
}

/// The Ricart–Agrawala permission rule. Pure, no state.
pub struct PermissionRule;

impl PermissionRule {
    /// Decide whether to ACK `incoming` now or queue it.
    ///
    /// * `holding` - the local peer is inside the critical section
    /// * `own` - the local outstanding request, if any
    pub fn decide(holding: bool, own: Option<RequestStamp>, incoming: RequestStamp) -> Verdict {
        if holding {
            return Verdict::Defer(DeferReason::HoldingResource);
        }

        match own {
            Some(own) if own.precedes(&incoming) => Verdict::Defer(DeferReason::EarlierRequest),
            _ => Verdict::Grant,
        }
    }
}
