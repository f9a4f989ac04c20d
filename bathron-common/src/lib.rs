// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Common hash, codec and logging primitives shared by every `bathron-core`
//! module — the role `stacks-common` plays for `blockstack_lib` in the
//! teacher codebase.

pub mod codec;
pub mod hash;
pub mod log;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HexError {
    #[error("hex string has the wrong length")]
    BadHexLen,
    #[error("invalid hex character")]
    BadHexChar,
}
