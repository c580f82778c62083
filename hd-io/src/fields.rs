/// A contiguous bit range `[hi:lo]` inside a 32-bit register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Field {
    shift: u32,
    width: u32,
}

impl Field {
    /// Panics at compile time when used in a `const` with `hi < lo` or
    /// `hi > 31`.
    pub const fn new(hi: u32, lo: u32) -> Self {
        assert!(hi < 32, "field reaches past bit 31");
        assert!(lo <= hi, "field range is reversed");
        Self {
            shift: lo,
            width: hi - lo + 1,
        }
    }

    pub const fn bit(n: u32) -> Self {
        Self::new(n, n)
    }

    pub const fn shift(self) -> u32 {
        self.shift
    }

    /// Largest value the field can hold.
    pub const fn max(self) -> u32 {
        u32::MAX >> (32 - self.width)
    }

    pub const fn mask(self) -> u32 {
        self.max() << self.shift
    }

    pub const fn fits(self, value: u32) -> bool {
        value <= self.max()
    }

    pub const fn get(self, word: u32) -> u32 {
        (word & self.mask()) >> self.shift
    }

    pub const fn is_set(self, word: u32) -> bool {
        word & self.mask() != 0
    }

    /// Replace the field inside `word`. Bits of `value` above the field width
    /// are dropped.
    pub const fn set(self, word: u32, value: u32) -> u32 {
        (word & !self.mask()) | ((value << self.shift) & self.mask())
    }

    /// `value` placed in an otherwise zero word.
    pub const fn with(self, value: u32) -> u32 {
        self.set(0, value)
    }

    pub const fn flag(self, word: u32, on: bool) -> u32 {
        if on {
            word | self.mask()
        } else {
            word & !self.mask()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLOT: Field = Field::new(26, 22);
    const TOP: Field = Field::bit(31);

    #[test]
    fn test_masks() {
        assert_eq!(SLOT.mask(), 0x07C0_0000);
        assert_eq!(SLOT.max(), 0x1F);
        assert_eq!(TOP.mask(), 0x8000_0000);
        assert_eq!(Field::new(31, 0).mask(), u32::MAX);
    }

    #[test]
    fn test_get_set() {
        let word = SLOT.set(0xFFFF_FFFF, 3);
        assert_eq!(SLOT.get(word), 3);
        assert_eq!(word | SLOT.mask(), 0xFFFF_FFFF);
        // oversized values are truncated to the field width
        assert_eq!(SLOT.with(0x25), SLOT.with(0x05));
        assert!(!SLOT.fits(0x20));
        assert!(TOP.is_set(TOP.flag(0, true)));
        assert_eq!(TOP.flag(0xFFFF_FFFF, false), 0x7FFF_FFFF);
    }
}
