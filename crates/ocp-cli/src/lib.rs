// SPDX-License-Identifier: MIT OR Apache-2.0
//! Library surface of the `ocp` operator CLI, split out of `main.rs` so the
//! subcommand logic can be unit- and integration-tested without spawning
//! the binary.

pub mod commands;
pub mod format;
