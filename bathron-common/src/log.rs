// Copyright (C) 2025 BATHRON Core Contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

//! Process-wide structured logging, built on `slog` the way `stacks-common`
//! wires up `slog-term`/`slog-json` behind a `slog_json` feature flag.

use slog::{o, Drain};

#[cfg(feature = "slog_json")]
fn build_drain() -> slog::Fuse<slog_json::Json<std::io::Stdout>> {
    slog_json::Json::default(std::io::stdout()).fuse()
}

#[cfg(not(feature = "slog_json"))]
fn build_drain() -> impl Drain<Ok = (), Err = slog::Never> {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    slog_async_free(drain)
}

#[cfg(not(feature = "slog_json"))]
fn slog_async_free<D: Drain<Ok = (), Err = slog::Never>>(drain: D) -> D {
    drain
}

/// Builds the root logger for the node. Every component clones this via
/// `logger.new(o!(...))` to tag its own messages, mirroring how the teacher
/// threads a `slog::Logger` through its subsystems instead of a bare global.
pub fn root_logger(component: &'static str) -> slog::Logger {
    let drain = build_drain();
    slog::Logger::root(std::sync::Mutex::new(drain).fuse(), o!("component" => component))
}

#[cfg(test)]
mod tests {
    use super::*;
    use slog::info;

    #[test]
    fn root_logger_logs_without_panicking() {
        let log = root_logger("test");
        info!(log, "hello"; "n" => 1);
    }
}
