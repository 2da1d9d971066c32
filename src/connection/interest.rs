//! Readiness interest of a connection.

use std::fmt;
use std::ops::BitOr;

/// The set of readiness events a connection wants to be woken for.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct InterestMask(u8);

impl InterestMask {
    pub const NONE: InterestMask = InterestMask(0);
    pub const READABLE: InterestMask = InterestMask(0b0001);
    pub const WRITABLE: InterestMask = InterestMask(0b0010);
    pub const ERROR: InterestMask = InterestMask(0b0100);
    pub const HANGUP: InterestMask = InterestMask(0b1000);

    pub fn contains(self, other: InterestMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: InterestMask) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: InterestMask) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// The poller registration for this mask. Errors and hang-ups are always
    /// reported by the poller, so only the read and write bits matter; a
    /// mask with neither has no registration.
    pub fn to_mio(self) -> Option<mio::Interest> {
        match (
            self.contains(Self::READABLE),
            self.contains(Self::WRITABLE),
        ) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for InterestMask {
    type Output = InterestMask;

    fn bitor(self, rhs: InterestMask) -> InterestMask {
        InterestMask(self.0 | rhs.0)
    }
}

impl fmt::Debug for InterestMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::READABLE, "READABLE"),
            (Self::WRITABLE, "WRITABLE"),
            (Self::ERROR, "ERROR"),
            (Self::HANGUP, "HANGUP"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();

        if set.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", set.join(" | "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_remove() {
        let mut mask = InterestMask::READABLE | InterestMask::ERROR;
        assert!(mask.contains(InterestMask::READABLE));
        assert!(!mask.contains(InterestMask::WRITABLE));

        mask.insert(InterestMask::WRITABLE);
        assert!(mask.contains(InterestMask::READABLE | InterestMask::WRITABLE));

        mask.remove(InterestMask::WRITABLE);
        assert!(!mask.contains(InterestMask::WRITABLE));
        assert_eq!(format!("{:?}", mask), "READABLE | ERROR");
    }

    #[test]
    fn test_to_mio() {
        assert_eq!(InterestMask::NONE.to_mio(), None);
        assert_eq!(InterestMask::ERROR.to_mio(), None);
        assert_eq!(
            (InterestMask::READABLE | InterestMask::HANGUP).to_mio(),
            Some(mio::Interest::READABLE)
        );

        let both = (InterestMask::READABLE | InterestMask::WRITABLE)
            .to_mio()
            .unwrap();
        assert!(both.is_readable() && both.is_writable());
    }
}
