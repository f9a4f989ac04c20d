// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Component K — the kill switch (spec §4, §6). A single process-wide
//! atomic flag, initialized from config, consulted inside `CheckSpecialTx`
//! for `TX_BURN_CLAIM` and mutated only by the authorized
//! `setbtcburnsenabled` RPC.

use std::sync::atomic::{AtomicBool, Ordering};

/// Atomic consensus flag pausing burn-claim acceptance. Cheap to clone
/// (an `Arc` around this is how the node context shares it across threads)
/// since it's a single word.
#[derive(Debug)]
pub struct KillSwitch {
    enabled: AtomicBool,
}

impl KillSwitch {
    pub fn new(initial: bool) -> Self {
        KillSwitch { enabled: AtomicBool::new(initial) }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `setbtcburnsenabled(bool)` RPC handler. Takes effect on the very
    /// next block since `CheckSpecialTx` reads the flag fresh each call.
    pub fn set_enabled(&self, value: bool) {
        self.enabled.store(value, Ordering::SeqCst);
    }
}

impl Default for KillSwitch {
    fn default() -> Self {
        KillSwitch::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_enabled() {
        let ks = KillSwitch::default();
        assert!(ks.is_enabled());
    }

    #[test]
    fn set_enabled_takes_effect_immediately() {
        let ks = KillSwitch::new(true);
        ks.set_enabled(false);
        assert!(!ks.is_enabled());
        ks.set_enabled(true);
        assert!(ks.is_enabled());
    }
}
