//! Character classes: a 256-bit set for single-byte characters plus a sorted
//! list of code point ranges for multi-byte characters.

use std::fmt::{self, Display};

use crate::engine::encoding::{CType, CaseFoldTable, Encoding};

/// 256 ビットのバイト集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BitSet([u64; 4]);

impl BitSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set(&mut self, byte: u8) {
        self.0[(byte / 64) as usize] |= 1u64 << (byte % 64);
    }

    #[inline]
    pub fn contains(&self, byte: u8) -> bool {
        (self.0[(byte / 64) as usize] & (1u64 << (byte % 64))) != 0
    }

    pub fn set_range(&mut self, from: u8, to: u8) {
        for b in from..=to {
            self.set(b);
        }
    }

    pub fn count(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    pub fn union_with(&mut self, other: &BitSet) {
        for (w, o) in self.0.iter_mut().zip(other.0.iter()) {
            *w |= *o;
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=255u8).filter(move |b| self.contains(*b))
    }
}

/// 文字クラス
///
/// `ranges` は昇順かつ重なりのないコードポイント範囲の列で、
/// マルチバイト文字だけを保持する。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CharClass {
    pub bs: BitSet,
    pub ranges: Vec<(u32, u32)>,
    pub negated: bool,
}

impl CharClass {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `code` is stored in the bitset rather than the range list.
    pub fn is_single_byte_code(enc: Encoding, code: u32) -> bool {
        match enc {
            Encoding::Utf8 => code < 0x80,
            _ => code < 0x100 && enc.mbc_len(code as u8) == 1,
        }
    }

    pub fn add_code(&mut self, enc: Encoding, code: u32) {
        self.add_code_range(enc, code, code);
    }

    /// Adds `from..=to`, splitting the single-byte part into the bitset.
    pub fn add_code_range(&mut self, enc: Encoding, from: u32, to: u32) {
        let mut code = from;
        while code <= to && code < 0x100 {
            if Self::is_single_byte_code(enc, code) {
                self.bs.set(code as u8);
            }
            code += 1;
        }
        if enc.is_single_byte() {
            return;
        }
        let low = from.max(0x80);
        if low <= to {
            self.add_wc_range(low, to);
        }
    }

    /// Inserts a multi-byte range, merging with overlapping or adjacent ones.
    pub fn add_wc_range(&mut self, from: u32, to: u32) {
        let (from, to) = if from <= to { (from, to) } else { (to, from) };

        let first = self
            .ranges
            .partition_point(|&(_, hi)| hi < from && hi.saturating_add(1) < from);
        let mut last = first;
        let mut lo = from;
        let mut hi = to;
        while let Some(&(r_lo, r_hi)) = self.ranges.get(last) {
            if r_lo > hi.saturating_add(1) {
                break;
            }
            lo = lo.min(r_lo);
            hi = hi.max(r_hi);
            last += 1;
        }
        self.ranges.splice(first..last, [(lo, hi)]);
    }

    /// Adds every character of `ctype` (or every character outside it).
    pub fn add_ctype(&mut self, enc: Encoding, ctype: CType, not: bool) {
        for b in 0..=255u8 {
            if Self::is_single_byte_code(enc, b as u32) && enc.is_code_ctype(b as u32, ctype) != not {
                self.bs.set(b);
            }
        }
        let mb_member = matches!(ctype, CType::Word | CType::Graph | CType::Print);
        if !enc.is_single_byte() && mb_member != not {
            self.add_wc_range(0x80, u32::MAX);
        }
    }

    /// Closes the single-byte set under case folding.
    pub fn apply_case_fold(&mut self, table: &CaseFoldTable) {
        let mut added = BitSet::new();
        for b in self.bs.iter() {
            for partner in table.partners(b) {
                added.set(partner);
            }
        }
        self.bs.union_with(&added);
    }

    pub fn has_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn contains_wc(&self, code: u32) -> bool {
        contains_code_range(&self.ranges, code)
    }

    /// Membership test with negation applied.
    pub fn is_code_in(&self, enc: Encoding, code: u32) -> bool {
        let found = if Self::is_single_byte_code(enc, code) {
            self.bs.contains(code as u8)
        } else {
            self.contains_wc(code)
        };
        found != self.negated
    }

    /// Bytes that may start a character accepted by this class.
    pub fn lead_bytes(&self, enc: Encoding) -> BitSet {
        let mut leads = BitSet::new();
        for b in 0..=255u8 {
            let single = Self::is_single_byte_code(enc, b as u32);
            let hit = if single {
                self.bs.contains(b) != self.negated
            } else {
                self.negated || self.has_ranges()
            };
            if hit {
                leads.set(b);
            }
        }
        leads
    }
}

/// Binary search over sorted, non-overlapping ranges.
pub fn contains_code_range(ranges: &[(u32, u32)], code: u32) -> bool {
    let idx = ranges.partition_point(|&(_, hi)| hi < code);
    matches!(ranges.get(idx), Some(&(lo, _)) if lo <= code)
}

impl Display for BitSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut bytes = self.iter().peekable();
        let mut first = true;
        while let Some(start) = bytes.next() {
            let mut end = start;
            while bytes.peek() == Some(&end.wrapping_add(1)) && end != 255 {
                end = bytes.next().unwrap_or(end);
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start:02x}")?;
            } else {
                write!(f, "{start:02x}-{end:02x}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        charclass::{contains_code_range, BitSet, CharClass},
        encoding::{CType, CaseFoldTable, Encoding},
    };

    #[test]
    fn test_bitset() {
        let mut bs = BitSet::new();
        bs.set_range(b'a', b'c');
        bs.set(0xff);
        assert!(bs.contains(b'b'));
        assert!(!bs.contains(b'd'));
        assert_eq!(bs.count(), 4);
        assert_eq!(format!("{bs}"), "61-63,ff");
    }

    #[test]
    fn test_add_wc_range_merges() {
        let mut cc = CharClass::new();
        cc.add_wc_range(0x3050, 0x3060);
        cc.add_wc_range(0x3000, 0x3010);
        cc.add_wc_range(0x3011, 0x3020);
        assert_eq!(cc.ranges, vec![(0x3000, 0x3020), (0x3050, 0x3060)]);

        cc.add_wc_range(0x3015, 0x3055);
        assert_eq!(cc.ranges, vec![(0x3000, 0x3060)]);

        cc.add_wc_range(0x4000, 0x3f00);
        assert_eq!(cc.ranges, vec![(0x3000, 0x3060), (0x3f00, 0x4000)]);
    }

    #[test]
    fn test_add_wc_range_membership() {
        let spans = [(0x100u32, 0x120u32), (0x90, 0x95), (0x118, 0x130), (0x200, 0x200)];
        let mut cc = CharClass::new();
        for &(lo, hi) in &spans {
            cc.add_wc_range(lo, hi);
        }
        for w in cc.ranges.windows(2) {
            assert!(w[0].1 + 1 < w[1].0);
        }
        for code in 0x80..0x220 {
            let expected = spans.iter().any(|&(lo, hi)| lo <= code && code <= hi);
            assert_eq!(cc.contains_wc(code), expected, "code {code:#x}");
        }
    }

    #[test]
    fn test_negated_class_multibyte() {
        // [^a-z] を UTF-8 で構築する
        let mut cc = CharClass::new();
        cc.add_code_range(Encoding::Utf8, b'a' as u32, b'z' as u32);
        cc.negated = true;
        for b in b'a'..=b'z' {
            assert!(!cc.is_code_in(Encoding::Utf8, b as u32));
        }
        assert!(cc.is_code_in(Encoding::Utf8, b'A' as u32));
        assert!(cc.is_code_in(Encoding::Utf8, 0x3042));
    }

    #[test]
    fn test_add_code_range_split() {
        let mut cc = CharClass::new();
        cc.add_code_range(Encoding::Utf8, 0x70, 0x3042);
        assert!(cc.bs.contains(0x70));
        assert!(cc.bs.contains(0x7f));
        assert!(!cc.bs.contains(0x80));
        assert_eq!(cc.ranges, vec![(0x80, 0x3042)]);
    }

    #[test]
    fn test_add_ctype() {
        let mut cc = CharClass::new();
        cc.add_ctype(Encoding::Utf8, CType::Word, false);
        assert!(cc.is_code_in(Encoding::Utf8, b'_' as u32));
        assert!(cc.is_code_in(Encoding::Utf8, 0x3042));
        assert!(!cc.is_code_in(Encoding::Utf8, b' ' as u32));

        let mut not_digit = CharClass::new();
        not_digit.add_ctype(Encoding::Utf8, CType::Digit, true);
        assert!(!not_digit.is_code_in(Encoding::Utf8, b'5' as u32));
        assert!(not_digit.is_code_in(Encoding::Utf8, 0x3042));
    }

    #[test]
    fn test_apply_case_fold() {
        let mut cc = CharClass::new();
        cc.add_code_range(Encoding::Ascii, b'a' as u32, b'c' as u32);
        cc.apply_case_fold(&CaseFoldTable::ascii());
        assert!(cc.bs.contains(b'B'));
        assert!(cc.bs.contains(b'b'));
        assert!(!cc.bs.contains(b'D'));
    }

    #[test]
    fn test_lead_bytes() {
        let mut cc = CharClass::new();
        cc.add_code(Encoding::Utf8, b'x' as u32);
        let leads = cc.lead_bytes(Encoding::Utf8);
        assert_eq!(leads.iter().collect::<Vec<_>>(), vec![b'x']);

        cc.negated = true;
        let leads = cc.lead_bytes(Encoding::Utf8);
        assert!(!leads.contains(b'x'));
        assert!(leads.contains(0xe3));
    }

    #[test]
    fn test_contains_code_range_empty() {
        assert!(!contains_code_range(&[], 10));
    }
}
