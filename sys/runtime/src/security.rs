// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Secure-key guard (spec.md §4.A): gates lifecycle calls behind a
//! process-bound opaque token, combining a random source with the
//! monotonic timebase so the token can't be guessed from boot time alone.

use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hasher};
use std::sync::Mutex;

use rt_abi::Error;
use rt_hal::Timebase;

const FALLBACK_SENTINEL: u32 = 0xA5A5_5A5A;

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct SecurityToken(pub(crate) u32);

pub struct SecureKeyGuard {
    token: Mutex<u32>,
}

impl SecureKeyGuard {
    /// Derives a fresh token and returns the guard paired with the token
    /// value the caller must hold on to and present to every gated call.
    pub fn new(timebase: &dyn Timebase) -> (Self, SecurityToken) {
        let random = (RandomState::new().build_hasher().finish() as u32)
            ^ (RandomState::new().build_hasher().finish() >> 32) as u32;
        let mut token = random ^ (timebase.now_ms() as u32);
        if token == 0 {
            token = FALLBACK_SENTINEL;
        }
        (
            SecureKeyGuard {
                token: Mutex::new(token),
            },
            SecurityToken(token),
        )
    }

    /// Constant-time equality against the held token.
    pub fn verify(&self, presented: SecurityToken) -> Result<(), Error> {
        let held = *self.token.lock().unwrap();
        if constant_time_eq(held, presented.0) {
            Ok(())
        } else {
            Err(Error::SecurityInvalidKey)
        }
    }

    /// Zeroes the held token; every subsequent `verify` fails.
    pub fn deinit(&self) {
        *self.token.lock().unwrap() = 0;
    }
}

fn constant_time_eq(a: u32, b: u32) -> bool {
    let diff = a ^ b;
    (diff | diff.wrapping_neg()) >> 31 == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(u64);
    impl Timebase for FixedClock {
        fn now_ms(&self) -> u64 {
            self.0
        }
    }

    #[test]
    fn verify_succeeds_with_the_issued_token() {
        let (guard, token) = SecureKeyGuard::new(&FixedClock(123));
        assert!(guard.verify(token).is_ok());
    }

    #[test]
    fn verify_fails_with_a_mismatched_token() {
        let (guard, token) = SecureKeyGuard::new(&FixedClock(123));
        let wrong = SecurityToken(token.0.wrapping_add(1));
        assert_eq!(guard.verify(wrong).unwrap_err(), Error::SecurityInvalidKey);
    }

    #[test]
    fn deinit_invalidates_the_token() {
        let (guard, token) = SecureKeyGuard::new(&FixedClock(123));
        guard.deinit();
        assert_eq!(guard.verify(token).unwrap_err(), Error::SecurityInvalidKey);
    }
}
