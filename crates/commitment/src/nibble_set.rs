/// One bit per child nibble of a 16-ary branch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NibbleSet(u16);

impl NibbleSet {
    pub const EMPTY: Self = Self(0);

    #[inline]
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn bits(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn contains(self, nibble: u8) -> bool {
        self.0 & (1 << nibble) != 0
    }

    #[inline]
    pub fn insert(&mut self, nibble: u8) {
        self.0 |= 1 << nibble;
    }

    #[inline]
    pub fn remove(&mut self, nibble: u8) {
        self.0 &= !(1 << nibble);
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Lowest nibble in the set.
    #[inline]
    pub fn first(self) -> Option<u8> {
        (!self.is_empty()).then(|| self.0.trailing_zeros() as u8)
    }

    /// Iterates the set nibbles in ascending order.
    #[inline]
    pub fn iter(self) -> NibbleSetIter {
        NibbleSetIter(self.0)
    }
}

impl core::ops::BitOr for NibbleSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl core::ops::BitOrAssign for NibbleSet {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl core::ops::BitAnd for NibbleSet {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl core::fmt::Binary for NibbleSet {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Binary::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone)]
pub struct NibbleSetIter(u16);

impl Iterator for NibbleSetIter {
    type Item = u8;

    fn next(&mut self) -> Option<u8> {
        if self.0 == 0 {
            return None;
        }
        let nibble = self.0.trailing_zeros() as u8;
        // clear lowest set bit
        self.0 &= self.0 - 1;
        Some(nibble)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.0.count_ones() as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for NibbleSetIter {}

impl IntoIterator for NibbleSet {
    type Item = u8;
    type IntoIter = NibbleSetIter;

    fn into_iter(self) -> NibbleSetIter {
        self.iter()
    }
}
