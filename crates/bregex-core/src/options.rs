//! Compile- and search-time option flags and matching limits.

use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

/// オプションフラグの集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OptionFlags(u32);

impl OptionFlags {
    pub const NONE: OptionFlags = OptionFlags(0);
    /// 大文字と小文字を区別しない
    pub const IGNORECASE: OptionFlags = OptionFlags(1 << 0);
    /// 空白とコメントを読み飛ばす
    pub const EXTEND: OptionFlags = OptionFlags(1 << 1);
    /// `.` が改行にマッチし、`^` `$` が行単位になる
    pub const MULTILINE: OptionFlags = OptionFlags(1 << 2);
    /// `^` `$` をバッファの先頭・末尾に限定する
    pub const SINGLELINE: OptionFlags = OptionFlags(1 << 3);
    /// 最長のマッチを探す
    pub const FIND_LONGEST: OptionFlags = OptionFlags(1 << 4);
    /// 空文字列へのマッチを無視する
    pub const FIND_NOT_EMPTY: OptionFlags = OptionFlags(1 << 5);
    /// バッファの先頭を行頭とみなさない
    pub const NOTBOL: OptionFlags = OptionFlags(1 << 6);
    /// バッファの末尾を行末とみなさない
    pub const NOTEOL: OptionFlags = OptionFlags(1 << 7);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        OptionFlags(bits)
    }

    pub const fn contains(self, other: OptionFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub const fn intersects(self, other: OptionFlags) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn insert(&mut self, other: OptionFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: OptionFlags) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: OptionFlags, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// `^` と `$` が行単位で判定されるかどうか
    pub const fn is_per_line(self) -> bool {
        self.contains(Self::MULTILINE) && !self.contains(Self::SINGLELINE)
    }
}

impl BitOr for OptionFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        OptionFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for OptionFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for OptionFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        OptionFlags(self.0 & rhs.0)
    }
}

impl Not for OptionFlags {
    type Output = Self;

    fn not(self) -> Self {
        OptionFlags(!self.0)
    }
}

/// Caps applied to a single match attempt. `None` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MatchLimits {
    /// Number of backtracks allowed per `match_at` call.
    pub retry_limit: Option<usize>,
    /// Maximum depth of the backtrack stack.
    pub stack_limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use crate::options::OptionFlags;

    #[test]
    fn test_option_flags() {
        let mut opts = OptionFlags::IGNORECASE | OptionFlags::MULTILINE;
        assert!(opts.contains(OptionFlags::IGNORECASE));
        assert!(!opts.contains(OptionFlags::EXTEND));
        assert!(opts.is_per_line());

        opts.insert(OptionFlags::SINGLELINE);
        assert!(!opts.is_per_line());

        opts.remove(OptionFlags::IGNORECASE);
        assert!(!opts.intersects(OptionFlags::IGNORECASE));
        opts.set(OptionFlags::EXTEND, true);
        assert!(opts.contains(OptionFlags::EXTEND));
        assert!(OptionFlags::NONE.is_empty());
    }
}
