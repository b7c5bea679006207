// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Functions for handling thin ids.

use std::fmt;

use crate::{
    engine::consts::THIN_ID_LIMIT,
    errors::{PackerError, PackerResult},
};

/// The id of a thin device within its pool, a 24 bit number.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ThinId(u32);

impl ThinId {
    /// The id given to the base image.
    pub const BASE: ThinId = ThinId(0);

    pub fn new(value: u32) -> PackerResult<ThinId> {
        if value < THIN_ID_LIMIT {
            Ok(ThinId(value))
        } else {
            Err(PackerError::Msg(format!(
                "thin id {value} does not fit in 24 bits"
            )))
        }
    }

    /// The following id, wrapping to 0 after the largest 24 bit value.
    pub fn wrapping_next(self) -> ThinId {
        ThinId((self.0 + 1) % THIN_ID_LIMIT)
    }
}

impl fmt::Display for ThinId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<ThinId> for u32 {
    fn from(id: ThinId) -> u32 {
        id.0
    }
}

#[derive(Debug)]
/// The source of candidate ids for new thin devices. The counter only ever
/// moves forward; ids of removed devices are not handed out again until
/// the counter wraps.
pub struct ThinIdCounter {
    next_id: ThinId,
}

impl Default for ThinIdCounter {
    fn default() -> ThinIdCounter {
        ThinIdCounter {
            next_id: ThinId::BASE,
        }
    }
}

impl ThinIdCounter {
    /// The id to try first for the next thin device.
    pub fn candidate(&self) -> ThinId {
        self.next_id
    }

    /// Record that the pool accepted assigned, so the next candidate is the
    /// one after it.
    pub fn advance_past(&mut self, assigned: ThinId) {
        self.next_id = assigned.wrapping_next();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wraps_at_24_bits() {
        let last = ThinId::new(THIN_ID_LIMIT - 1).unwrap();
        assert_eq!(last.wrapping_next(), ThinId::BASE);
        assert!(ThinId::new(THIN_ID_LIMIT).is_err());
    }

    #[test]
    fn test_counter_advances_past_assigned() {
        let mut counter = ThinIdCounter::default();
        assert_eq!(counter.candidate(), ThinId::BASE);

        counter.advance_past(ThinId::new(9).unwrap());
        assert_eq!(u32::from(counter.candidate()), 10);
    }
}
