// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Network parameters and the shared validation-state vocabulary.

pub mod error;
pub mod params;

pub use error::{RejectClass, ValidationState};
pub use params::{ConsensusParams, Network};

/// One satoshi == one M0. No decimal scaling (spec §6).
pub type Sats = u64;
