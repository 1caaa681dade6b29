//! Per-encoding byte length tables, code point conversion and character
//! type predicates.
//!
//! Lengths are decided by the lead byte only. Input is assumed to be well
//! formed; a truncated trailing character is read as far as the buffer goes.

use crate::engine::parser::ParseError;

/// 文字エンコーディング
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Encoding {
    /// 1 バイト 1 文字
    #[default]
    Ascii,
    EucJp,
    Sjis,
    Utf8,
}

/// 文字種。POSIX ブラケットの 12 種と単語構成文字。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CType {
    Alnum,
    Alpha,
    Blank,
    Cntrl,
    Digit,
    Graph,
    Lower,
    Print,
    Punct,
    Space,
    Upper,
    XDigit,
    Word,
}

const EUC_JP_LEN: [u8; 256] = build_len_table(Encoding::EucJp);
const SJIS_LEN: [u8; 256] = build_len_table(Encoding::Sjis);
const UTF8_LEN: [u8; 256] = build_len_table(Encoding::Utf8);

const fn build_len_table(enc: Encoding) -> [u8; 256] {
    let mut table = [1u8; 256];
    let mut b = 0usize;
    while b < 256 {
        table[b] = match enc {
            Encoding::Ascii => 1,
            Encoding::EucJp => match b {
                0x8e => 2,
                0x8f => 3,
                0xa1..=0xfe => 2,
                _ => 1,
            },
            Encoding::Sjis => match b {
                0x81..=0x9f | 0xe0..=0xfc => 2,
                _ => 1,
            },
            Encoding::Utf8 => match b {
                0xc0..=0xdf => 2,
                0xe0..=0xef => 3,
                0xf0..=0xf7 => 4,
                0xf8..=0xfb => 5,
                0xfc..=0xfd => 6,
                _ => 1,
            },
        };
        b += 1;
    }
    table
}

impl Encoding {
    /// Length in bytes of the character whose lead byte is `byte`.
    pub fn mbc_len(self, byte: u8) -> usize {
        let len = match self {
            Encoding::Ascii => 1,
            Encoding::EucJp => EUC_JP_LEN[byte as usize],
            Encoding::Sjis => SJIS_LEN[byte as usize],
            Encoding::Utf8 => UTF8_LEN[byte as usize],
        };
        len as usize
    }

    /// Longest character this encoding can produce.
    pub fn max_len(self) -> usize {
        match self {
            Encoding::Ascii => 1,
            Encoding::EucJp => 3,
            Encoding::Sjis => 2,
            Encoding::Utf8 => 6,
        }
    }

    pub fn is_single_byte(self) -> bool {
        self == Encoding::Ascii
    }

    /// Whether a trailing byte can never be mistaken for a lead byte, which
    /// lets a short literal be searched without re-synchronising on every
    /// candidate.
    pub fn is_lead_distinguishable(self) -> bool {
        matches!(self, Encoding::Ascii | Encoding::Utf8)
    }

    /// Length of the character starting at `pos`, clipped to the buffer end.
    pub fn char_len_at(self, text: &[u8], pos: usize) -> usize {
        match text.get(pos) {
            Some(&b) => self.mbc_len(b).min(text.len() - pos),
            None => 0,
        }
    }

    /// 先頭バイト列から 1 文字分のコードポイントを得る
    pub fn mbc_to_code(self, bytes: &[u8]) -> u32 {
        let Some(&lead) = bytes.first() else {
            return 0;
        };
        let len = self.mbc_len(lead).min(bytes.len());
        match self {
            Encoding::Ascii => lead as u32,
            Encoding::EucJp | Encoding::Sjis => bytes[..len]
                .iter()
                .fold(0u32, |code, &b| (code << 8) | b as u32),
            Encoding::Utf8 => {
                if len == 1 {
                    return lead as u32;
                }
                let mask = 0x7fu32 >> len;
                bytes[1..len]
                    .iter()
                    .fold(lead as u32 & mask, |code, &b| (code << 6) | (b as u32 & 0x3f))
            }
        }
    }

    /// Number of bytes needed to encode `code`.
    pub fn code_len(self, code: u32) -> usize {
        match self {
            Encoding::Ascii => 1,
            Encoding::EucJp => {
                if code > 0xffff {
                    3
                } else if code > 0xff {
                    2
                } else {
                    1
                }
            }
            Encoding::Sjis => {
                if code > 0xff {
                    2
                } else {
                    1
                }
            }
            Encoding::Utf8 => match code {
                0..=0x7f => 1,
                0x80..=0x7ff => 2,
                0x800..=0xffff => 3,
                0x1_0000..=0x1f_ffff => 4,
                0x20_0000..=0x3ff_ffff => 5,
                _ => 6,
            },
        }
    }

    /// コードポイントをバイト列に変換して `buf` の末尾に追加する
    pub fn code_to_mbc(self, code: u32, buf: &mut Vec<u8>) -> Result<(), ParseError> {
        match self {
            Encoding::Ascii => {
                let b = u8::try_from(code).map_err(|_| ParseError::TooBigWideCharValue)?;
                buf.push(b);
            }
            Encoding::EucJp | Encoding::Sjis => {
                let max = if self == Encoding::EucJp { 0xff_ffff } else { 0xffff };
                if code > max {
                    return Err(ParseError::TooBigWideCharValue);
                }
                let len = self.code_len(code);
                for i in (0..len).rev() {
                    buf.push((code >> (8 * i)) as u8);
                }
            }
            Encoding::Utf8 => {
                if code > 0x7fff_ffff {
                    return Err(ParseError::TooBigWideCharValue);
                }
                let len = self.code_len(code);
                if len == 1 {
                    buf.push(code as u8);
                    return Ok(());
                }
                let lead_mark: u8 = !(0xffu8 >> len);
                buf.push(lead_mark | (code >> (6 * (len - 1))) as u8);
                for i in (0..len - 1).rev() {
                    buf.push(0x80 | ((code >> (6 * i)) & 0x3f) as u8);
                }
            }
        }
        Ok(())
    }

    /// First byte of the encoded form of `code`.
    pub fn code_first_byte(self, code: u32) -> Result<u8, ParseError> {
        let mut buf = Vec::with_capacity(self.max_len());
        self.code_to_mbc(code, &mut buf)?;
        buf.first().copied().ok_or(ParseError::TooBigWideCharValue)
    }

    /// Moves `pos` back to the head of the character containing it.
    pub fn left_adjust_char_head(self, text: &[u8], start: usize, pos: usize) -> usize {
        if pos <= start || pos >= text.len() {
            return pos;
        }
        match self {
            Encoding::Ascii => pos,
            Encoding::Utf8 => {
                let mut p = pos;
                while p > start && (text[p] & 0xc0) == 0x80 {
                    p -= 1;
                }
                p
            }
            Encoding::EucJp => {
                let is_lead = |b: u8| !(0xa1..=0xfe).contains(&b);
                let mut p = pos;
                while !is_lead(text[p]) && p > start {
                    p -= 1;
                }
                self.resync_pair(text, p, pos)
            }
            Encoding::Sjis => {
                let is_first = |b: u8| matches!(b, 0x81..=0x9f | 0xe0..=0xfc);
                let is_trail = |b: u8| matches!(b, 0x40..=0x7e | 0x80..=0xfc);
                let mut p = pos;
                if is_trail(text[p]) {
                    while p > start {
                        p -= 1;
                        if !is_first(text[p]) {
                            p += 1;
                            break;
                        }
                    }
                }
                self.resync_pair(text, p, pos)
            }
        }
    }

    // From a known boundary `p` at or before `pos`, double-byte runs pair up.
    fn resync_pair(self, text: &[u8], p: usize, pos: usize) -> usize {
        let len = self.mbc_len(text[p]);
        if p + len > pos {
            return p;
        }
        let p = p + len;
        p + ((pos - p) & !1)
    }

    /// Head of the character before `pos`, or `None` at `start`.
    pub fn prev_char_head(self, text: &[u8], start: usize, pos: usize) -> Option<usize> {
        if pos <= start {
            return None;
        }
        Some(self.left_adjust_char_head(text, start, pos - 1))
    }

    /// Steps back `n` characters from `pos`.
    pub fn step_back(self, text: &[u8], start: usize, pos: usize, n: usize) -> Option<usize> {
        let mut p = pos;
        for _ in 0..n {
            p = self.prev_char_head(text, start, p)?;
        }
        Some(p)
    }

    /// Whether `code` belongs to `ctype`.
    ///
    /// Non-ASCII characters of a multi-byte encoding are word, graph and print
    /// characters. Bytes above 0x7f in the single-byte encoding belong to no
    /// class.
    pub fn is_code_ctype(self, code: u32, ctype: CType) -> bool {
        if code < 0x80 {
            return is_ascii_ctype(code as u8, ctype);
        }
        if self.is_single_byte() {
            return false;
        }
        matches!(ctype, CType::Word | CType::Graph | CType::Print)
    }

    /// Word-character test for the character starting at `pos`.
    pub fn is_word_at(self, text: &[u8], pos: usize) -> bool {
        match text.get(pos) {
            Some(&b) if self.mbc_len(b) > 1 => true,
            Some(&b) => self.is_code_ctype(b as u32, CType::Word),
            None => false,
        }
    }
}

fn is_ascii_ctype(b: u8, ctype: CType) -> bool {
    match ctype {
        CType::Alnum => b.is_ascii_alphanumeric(),
        CType::Alpha => b.is_ascii_alphabetic(),
        CType::Blank => b == b' ' || b == b'\t',
        CType::Cntrl => b.is_ascii_control(),
        CType::Digit => b.is_ascii_digit(),
        CType::Graph => b.is_ascii_graphic(),
        CType::Lower => b.is_ascii_lowercase(),
        CType::Print => b.is_ascii_graphic() || b == b' ',
        CType::Punct => b.is_ascii_punctuation(),
        CType::Space => matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c),
        CType::Upper => b.is_ascii_uppercase(),
        CType::XDigit => b.is_ascii_hexdigit(),
        CType::Word => b.is_ascii_alphanumeric() || b == b'_',
    }
}

/// 大小文字の変換表（バイト単位）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseFoldTable {
    table: [u8; 256],
}

impl CaseFoldTable {
    /// ASCII の大文字を小文字に写す変換表
    pub fn ascii() -> Self {
        let mut table = [0u8; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            *slot = (i as u8).to_ascii_lowercase();
        }
        Self { table }
    }

    pub fn from_table(table: [u8; 256]) -> Self {
        Self { table }
    }

    #[inline]
    pub fn fold(&self, b: u8) -> u8 {
        self.table[b as usize]
    }

    /// Bytes that fold to the same byte as `b`, `b` itself excluded.
    pub fn partners(&self, b: u8) -> impl Iterator<Item = u8> + '_ {
        let folded = self.fold(b);
        (0..=255u8).filter(move |&c| c != b && self.fold(c) == folded)
    }
}

impl Default for CaseFoldTable {
    fn default() -> Self {
        Self::ascii()
    }
}
