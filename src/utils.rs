// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Write,
    sync::atomic::{AtomicU32, Ordering},
};

use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use rand::RngExt;

static TOKEN_COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::rng().random::<u32>()));

/// Next correlation token. Unique per operation in flight within this
/// process; the counter starts at a random point so tokens differ between
/// runs.
pub fn next_token() -> u32 {
    TOKEN_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Lowercase MD5 hex digest, as the login and password-proof fields expect.
pub fn md5_hex(input: &str) -> String {
    let mut h = Md5::new();
    h.update(input.as_bytes());
    let d = h.finalize();

    let mut hex = String::with_capacity(d.len() * 2);
    for byte in d {
        write!(&mut hex, "{byte:02x}").expect("Writing to String cannot fail");
    }
    hex
}
