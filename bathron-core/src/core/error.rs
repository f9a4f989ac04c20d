// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! The structured validation-state carried by every special-TX and block
//! validator (spec §7): a reject is never just a `bool`, it is a
//! `(accepted?, DoS score, reject-code, reject-reason)` tuple the outermost
//! pipeline turns into P2P reject messages and index mutations. Only that
//! outermost layer is allowed to look at `RejectClass` to decide policy
//! (ban peer, mark block invalid, log and continue, ...).

use std::fmt;

/// Abstract error kinds from spec §7. Determines how the pipeline reacts,
/// never how the validator itself behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectClass {
    /// Bad encoding, wrong size: reject with DoS penalty, never propagate.
    Malformed,
    /// Low fee, non-standard: reject, no DoS.
    Policy,
    /// Bad PoW, bad signature, A5/A6 failure, finality conflict: reject with
    /// maximum DoS, mark block invalid in the index.
    Consensus,
    /// Missing parent header, mempool full: reject without DoS, caller may retry.
    Transient,
    /// Disk full, DB I/O: abort the node after logging.
    Resource,
    /// Already seen: silently accept without side effects.
    Duplicate,
}

impl RejectClass {
    /// DoS penalty a pipeline should apply to the submitting peer, 0-100.
    pub fn dos_score(self) -> u32 {
        match self {
            RejectClass::Malformed => 100,
            RejectClass::Policy => 0,
            RejectClass::Consensus => 100,
            RejectClass::Transient => 0,
            RejectClass::Resource => 0,
            RejectClass::Duplicate => 0,
        }
    }

    pub fn is_fatal(self) -> bool {
        matches!(self, RejectClass::Resource)
    }
}

/// Outcome of validating a transaction or block: either accepted, or
/// rejected with a stable machine-readable code plus a human reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationState {
    Accepted,
    Rejected {
        class: RejectClass,
        code: &'static str,
        reason: String,
    },
}

impl ValidationState {
    pub fn reject(class: RejectClass, code: &'static str, reason: impl Into<String>) -> Self {
        ValidationState::Rejected { class, code, reason: reason.into() }
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationState::Accepted)
    }

    pub fn dos_score(&self) -> u32 {
        match self {
            ValidationState::Accepted => 0,
            ValidationState::Rejected { class, .. } => class.dos_score(),
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            ValidationState::Accepted => None,
            ValidationState::Rejected { code, .. } => Some(code),
        }
    }
}

impl fmt::Display for ValidationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationState::Accepted => write!(f, "accepted"),
            ValidationState::Rejected { class, code, reason } => {
                write!(f, "rejected[{:?}] {}: {}", class, code, reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consensus_rejects_carry_max_dos() {
        let v = ValidationState::reject(RejectClass::Consensus, "bad-pow", "target exceeded");
        assert_eq!(v.dos_score(), 100);
        assert!(!v.is_accepted());
    }

    #[test]
    fn duplicates_carry_no_dos() {
        let v = ValidationState::reject(RejectClass::Duplicate, "burn-claim-duplicate", "seen");
        assert_eq!(v.dos_score(), 0);
    }
}
