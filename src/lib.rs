// Copyright (c) 2025 Whatsmeow-rs Contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # wa-relay-core
//!
//! Message-relay core for a WhatsApp-compatible multidevice client: device
//! addressing ([`jid`]), PN/LID identity mapping ([`lid`]), the Signal
//! Protocol session layer ([`signal`]), device discovery ([`usync`],
//! [`devices`]), per-recipient session assertion and encryption fan-out
//! ([`session_assert`], [`fanout`]), and the outbound relay pipeline
//! ([`relay`]) that ties them together into the dispatch rules for direct,
//! group, broadcast, newsletter, retry-resend, and peer-data-operation sends.

pub mod binary;
pub mod cache;
pub mod config;
pub mod devices;
pub mod error;
pub mod fanout;
pub mod jid;
pub mod keystore;
pub mod lid;
pub mod relay;
pub mod retry;
pub mod session_assert;
pub mod signal;
pub mod socket_registry;
pub mod usync;
pub mod util;

pub use error::{Error, Result};
pub use jid::Jid;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");