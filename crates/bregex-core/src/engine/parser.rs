//! Recursive-descent parser turning pattern bytes into a [`Node`] tree.

use std::collections::BTreeSet;

use log::warn;
use thiserror::Error;

use crate::{
    engine::{
        ast::{AnchorKind, CTypeKind, EffectKind, Node, Qualifier},
        charclass::CharClass,
        encoding::{CType, Encoding},
    },
    options::OptionFlags,
};

/// Largest bound accepted in `{n,m}`.
const MAX_REPEAT_NUM: u64 = 100_000;
/// Largest group number a backreference may name.
const MAX_BACKREF_NUM: u64 = 1000;
/// Upper bound on multi-byte ranges held by one character class.
const MAX_CODE_RANGES: usize = 10_000;
const POSIX_BRACKET_NAME_MIN_LEN: usize = 4;
const POSIX_BRACKET_CHECK_LIMIT_LENGTH: usize = 20;

const POSIX_BRACKETS: [(&[u8], CType); 12] = [
    (b"alnum", CType::Alnum),
    (b"alpha", CType::Alpha),
    (b"blank", CType::Blank),
    (b"cntrl", CType::Cntrl),
    (b"digit", CType::Digit),
    (b"graph", CType::Graph),
    (b"lower", CType::Lower),
    (b"print", CType::Print),
    (b"punct", CType::Punct),
    (b"space", CType::Space),
    (b"upper", CType::Upper),
    (b"xdigit", CType::XDigit),
];

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[error("end pattern at escape")]
    EndPatternAtBackslash,
    #[error("end pattern at meta")]
    EndPatternAtMeta,
    #[error("end pattern at control")]
    EndPatternAtControl,
    #[error("invalid meta-code syntax")]
    MetaCodeSyntax,
    #[error("invalid control-code syntax")]
    ControlCodeSyntax,
    #[error("empty char-class")]
    EmptyCharClass,
    #[error("premature end of char-class")]
    PrematureEndOfCharClass,
    #[error("char-class value at start of range")]
    CharClassValueAtStartOfRange,
    #[error("char-class value at end of range")]
    CharClassValueAtEndOfRange,
    #[error("mismatch multibyte code length in char-class range")]
    MismatchCodeLengthInRange,
    #[error("right side is smaller than left side in char-class range")]
    RightSmallerThanLeftInRange,
    #[error("invalid POSIX bracket type")]
    InvalidPosixBracketType,
    #[error("too many multibyte code ranges are specified")]
    TooManyMultiByteRanges,
    #[error("target of repeat operator is not specified")]
    TargetOfRepeatOperatorNotSpecified,
    #[error("target of repeat operator is invalid")]
    TargetOfRepeatOperatorInvalid,
    #[error("nested repeat operator")]
    NestedRepeatOperator,
    #[error("too big number for repeat range")]
    TooBigNumberForRepeatRange,
    #[error("upper is smaller than lower in repeat range")]
    UpperSmallerThanLowerInRepeatRange,
    #[error("unmatched close parenthesis")]
    UnmatchedCloseParenthesis,
    #[error("end pattern with unmatched parenthesis")]
    EndPatternWithUnmatchedParenthesis,
    #[error("end pattern in group")]
    EndPatternInGroup,
    #[error("undefined group option")]
    UndefinedGroupOption,
    #[error("too big number")]
    TooBigNumber,
    #[error("too big backref number")]
    TooBigBackrefNumber,
    #[error("invalid backref number: {0}")]
    InvalidBackref(usize),
    #[error("too big wide-char value")]
    TooBigWideCharValue,
    #[error("too long wide-char value")]
    TooLongWideCharValue,
    #[error("invalid wide-char value")]
    InvalidWideCharValue,
}

/// 構文解析の結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub root: Node,
    /// Number of capture groups.
    pub num_mem: usize,
    /// Group numbers named by backreferences.
    pub backrefs: BTreeSet<usize>,
}

/// パターンを構文木に変換する
///
/// # 引数
///
/// * pattern -> 正規表現のパターン（バイト列）
/// * options -> パターン全体に適用するオプション
/// * enc -> パターンと対象文字列のエンコーディング
pub fn parse(pattern: &[u8], options: OptionFlags, enc: Encoding) -> Result<Parsed, ParseError> {
    let mut parser = Parser::new(pattern, options, enc);
    let root = parser.parse_alternatives()?;
    if parser.peek().is_some() {
        return Err(ParseError::UnmatchedCloseParenthesis);
    }
    if let Some(&n) = parser.backrefs.iter().next_back() {
        if n > parser.num_mem {
            return Err(ParseError::InvalidBackref(n));
        }
    }
    Ok(Parsed {
        root,
        num_mem: parser.num_mem,
        backrefs: parser.backrefs,
    })
}

/// One parsed element. `Rest` is an inline option such as `(?i)` which
/// swallowed everything up to the end of the enclosing group.
enum Exp {
    Node(Node),
    Rest(Node),
}

/// Result of a backslash escape that denotes a single value.
enum Escaped {
    /// ASCII code from a plain or control-letter escape.
    Code(u32),
    /// Byte from a meta or control escape.
    Raw(u8),
    /// An escaped multi-byte character taken literally.
    Bytes(Vec<u8>),
}

impl Escaped {
    fn first_byte(&self) -> u8 {
        match self {
            Escaped::Code(c) => *c as u8,
            Escaped::Raw(b) => *b,
            Escaped::Bytes(bytes) => bytes.first().copied().unwrap_or(0),
        }
    }
}

/// Operand kinds inside a bracket expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassValue {
    /// Single-byte character or raw byte.
    Sb(u32),
    /// Multi-byte literal character.
    Mb(u32),
    /// `\x{...}` code point.
    Wide(u32),
}

impl ClassValue {
    fn code(self) -> u32 {
        match self {
            ClassValue::Sb(c) | ClassValue::Mb(c) | ClassValue::Wide(c) => c,
        }
    }
}

enum ClassItem {
    Value(ClassValue),
    /// A named set such as `\d` or `[:alpha:]` was added.
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClassState {
    Start,
    Value,
    Range(ClassValue),
    Complete,
}

#[derive(Debug)]
struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
    enc: Encoding,
    options: OptionFlags,
    num_mem: usize,
    backrefs: BTreeSet<usize>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a [u8], options: OptionFlags, enc: Encoding) -> Self {
        Self {
            input,
            pos: 0,
            enc,
            options,
            num_mem: 0,
            backrefs: BTreeSet::new(),
        }
    }

    fn parse_alternatives(&mut self) -> Result<Node, ParseError> {
        let mut branches = vec![self.parse_branch()?];
        while self.consume_if(b'|') {
            branches.push(self.parse_branch()?);
        }
        Ok(Node::alt(branches))
    }

    fn parse_branch(&mut self) -> Result<Node, ParseError> {
        let mut nodes = Vec::new();
        loop {
            self.skip_trivia()?;
            match self.peek() {
                None | Some(b'|') | Some(b')') => break,
                _ => {}
            }
            match self.parse_exp()? {
                Exp::Node(node) => nodes.push(node),
                Exp::Rest(node) => {
                    nodes.push(node);
                    break;
                }
            }
        }
        Ok(Node::list(merge_strings(nodes)))
    }

    fn parse_exp(&mut self) -> Result<Exp, ParseError> {
        if self.peek_qualifier()?.is_some() {
            return Err(ParseError::TargetOfRepeatOperatorNotSpecified);
        }
        let target = match self.parse_atom()? {
            Exp::Node(node) => node,
            rest => return Ok(rest),
        };

        self.skip_trivia()?;
        let Some((lower, upper)) = self.fetch_qualifier()? else {
            return Ok(Exp::Node(target));
        };
        let greedy = !self.consume_if(b'?');
        if !target.is_valid_qualifier_target() {
            return Err(ParseError::TargetOfRepeatOperatorInvalid);
        }
        self.skip_trivia()?;
        if self.peek_qualifier()?.is_some() {
            return Err(ParseError::NestedRepeatOperator);
        }
        Ok(Exp::Node(set_qualifier(target, lower, upper, greedy)))
    }

    fn parse_atom(&mut self) -> Result<Exp, ParseError> {
        let Some(c) = self.peek() else {
            return Ok(Exp::Node(Node::Empty));
        };
        let node = match c {
            b'(' => {
                self.pos += 1;
                return self.parse_group();
            }
            b'[' => {
                self.pos += 1;
                self.parse_char_class()?
            }
            b'.' => {
                self.pos += 1;
                Node::AnyChar
            }
            b'^' => {
                self.pos += 1;
                Node::Anchor(AnchorKind::BeginLine)
            }
            b'$' => {
                self.pos += 1;
                Node::Anchor(AnchorKind::EndLine)
            }
            b'\\' => {
                self.pos += 1;
                self.parse_escape()?
            }
            _ => Node::String(self.fetch_char_bytes()),
        };
        Ok(Exp::Node(node))
    }

    /// Parses after `(`.
    fn parse_group(&mut self) -> Result<Exp, ParseError> {
        if !self.consume_if(b'?') {
            self.num_mem += 1;
            let regnum = self.num_mem;
            let target = self.parse_group_body()?;
            return Ok(Exp::Node(Node::effect(EffectKind::Memory, regnum, target)));
        }

        let kind = match self.next() {
            None => return Err(ParseError::EndPatternInGroup),
            Some(b':') => return Ok(Exp::Node(self.parse_group_body()?)),
            Some(b'=') => EffectKind::PrecRead,
            Some(b'!') => EffectKind::PrecReadNot,
            Some(b'>') => EffectKind::StopBacktrack,
            Some(b'<') => match self.next() {
                Some(b'=') => EffectKind::LookBehind,
                Some(b'!') => EffectKind::LookBehindNot,
                None => return Err(ParseError::EndPatternInGroup),
                Some(_) => return Err(ParseError::UndefinedGroupOption),
            },
            Some(b'i' | b'm' | b'x' | b'-') => {
                self.pos -= 1;
                return self.parse_option_group();
            }
            Some(_) => return Err(ParseError::UndefinedGroupOption),
        };
        let target = self.parse_group_body()?;
        Ok(Exp::Node(Node::effect(kind, 0, target)))
    }

    fn parse_group_body(&mut self) -> Result<Node, ParseError> {
        let node = self.parse_alternatives()?;
        if !self.consume_if(b')') {
            return Err(ParseError::EndPatternWithUnmatchedParenthesis);
        }
        Ok(node)
    }

    /// `(?imx-imx)` or `(?imx-imx:...)`
    fn parse_option_group(&mut self) -> Result<Exp, ParseError> {
        let mut options = self.options;
        let mut negative = false;
        loop {
            match self.next() {
                None => return Err(ParseError::EndPatternInGroup),
                Some(b'-') => negative = true,
                Some(b'i') => options.set(OptionFlags::IGNORECASE, !negative),
                Some(b'm') => options.set(OptionFlags::MULTILINE, !negative),
                Some(b'x') => options.set(OptionFlags::EXTEND, !negative),
                Some(b')') => {
                    let prev = std::mem::replace(&mut self.options, options);
                    let target = self.parse_alternatives();
                    self.options = prev;
                    return Ok(Exp::Rest(Node::Option {
                        options,
                        target: Box::new(target?),
                    }));
                }
                Some(b':') => {
                    let prev = std::mem::replace(&mut self.options, options);
                    let target = self.parse_group_body();
                    self.options = prev;
                    return Ok(Exp::Node(Node::Option {
                        options,
                        target: Box::new(target?),
                    }));
                }
                Some(_) => return Err(ParseError::UndefinedGroupOption),
            }
        }
    }

    /// Parses after `\` outside a bracket expression.
    fn parse_escape(&mut self) -> Result<Node, ParseError> {
        let Some(c) = self.peek() else {
            return Err(ParseError::EndPatternAtBackslash);
        };
        self.pos += 1;
        let node = match c {
            b'w' => Node::CType(CTypeKind::Word),
            b'W' => Node::CType(CTypeKind::NotWord),
            b's' => self.ctype_class(CType::Space, false),
            b'S' => self.ctype_class(CType::Space, true),
            b'd' => self.ctype_class(CType::Digit, false),
            b'D' => self.ctype_class(CType::Digit, true),
            b'b' => Node::Anchor(AnchorKind::WordBound),
            b'B' => Node::Anchor(AnchorKind::NotWordBound),
            b'A' => Node::Anchor(AnchorKind::BeginBuf),
            b'Z' => Node::Anchor(AnchorKind::SemiEndBuf),
            b'z' => Node::Anchor(AnchorKind::EndBuf),
            b'G' => Node::Anchor(AnchorKind::BeginPosition),
            b'<' => Node::Anchor(AnchorKind::WordBegin),
            b'>' => Node::Anchor(AnchorKind::WordEnd),
            b'x' => {
                if self.consume_if(b'{') {
                    let code = self.scan_wide_hex()?;
                    let mut bytes = Vec::new();
                    self.enc.code_to_mbc(code, &mut bytes)?;
                    Node::String(bytes)
                } else {
                    Node::StringRaw(vec![self.scan_radix(16, 2) as u8])
                }
            }
            b'0' => Node::StringRaw(vec![self.scan_radix(8, 2) as u8]),
            b'1'..=b'9' => self.parse_backref_or_octal(c)?,
            _ => {
                self.pos -= 1;
                match self.fetch_escaped_value()? {
                    Escaped::Code(code) => {
                        let mut bytes = Vec::new();
                        self.enc.code_to_mbc(code, &mut bytes)?;
                        Node::String(bytes)
                    }
                    Escaped::Raw(b) => Node::StringRaw(vec![b]),
                    Escaped::Bytes(bytes) => Node::String(bytes),
                }
            }
        };
        Ok(node)
    }

    /// `\N`: a backreference, a literal digit or an octal byte.
    fn parse_backref_or_octal(&mut self, lead: u8) -> Result<Node, ParseError> {
        let start = self.pos - 1;
        let mut p = start;
        let n = scan_decimal(self.input, &mut p).unwrap_or(0);
        if n > u32::MAX as u64 {
            return Err(ParseError::TooBigNumber);
        }
        if n > MAX_BACKREF_NUM {
            return Err(ParseError::TooBigBackrefNumber);
        }
        let single_digit = p - start == 1;
        if n as usize <= self.num_mem || (single_digit && lead <= b'7') {
            self.pos = p;
            self.backrefs.insert(n as usize);
            return Ok(Node::Backref(n as usize));
        }
        if lead == b'8' || lead == b'9' {
            return Ok(Node::String(vec![lead]));
        }
        self.pos = start;
        let value = self.scan_radix(8, 3);
        if value > 0xff {
            return Err(ParseError::TooBigNumber);
        }
        Ok(Node::StringRaw(vec![value as u8]))
    }

    /// Single-value escapes: `\n`, `\M-x`, `\C-x`, `\cx` and escaped literals.
    fn fetch_escaped_value(&mut self) -> Result<Escaped, ParseError> {
        let Some(c) = self.peek() else {
            return Err(ParseError::EndPatternAtBackslash);
        };
        match c {
            b'M' => {
                self.pos += 1;
                match self.next() {
                    None => return Err(ParseError::EndPatternAtMeta),
                    Some(b'-') => {}
                    Some(_) => return Err(ParseError::MetaCodeSyntax),
                }
                let v = match self.next() {
                    None => return Err(ParseError::EndPatternAtMeta),
                    Some(b'\\') => self.fetch_escaped_value()?.first_byte(),
                    Some(v) => v,
                };
                Ok(Escaped::Raw(v | 0x80))
            }
            b'C' => {
                self.pos += 1;
                match self.next() {
                    None => return Err(ParseError::EndPatternAtControl),
                    Some(b'-') => {}
                    Some(_) => return Err(ParseError::ControlCodeSyntax),
                }
                self.fetch_control_value()
            }
            b'c' => {
                self.pos += 1;
                self.fetch_control_value()
            }
            _ if self.enc.mbc_len(c) > 1 => Ok(Escaped::Bytes(self.fetch_char_bytes())),
            _ => {
                self.pos += 1;
                Ok(Escaped::Code(conv_backslash_value(c) as u32))
            }
        }
    }

    fn fetch_control_value(&mut self) -> Result<Escaped, ParseError> {
        let v = match self.next() {
            None => return Err(ParseError::EndPatternAtControl),
            Some(b'?') => return Ok(Escaped::Raw(0x7f)),
            Some(b'\\') => self.fetch_escaped_value()?.first_byte(),
            Some(v) => v,
        };
        Ok(Escaped::Raw(v & 0x9f))
    }

    /// Parses the digits of `\x{...}` after the brace.
    fn scan_wide_hex(&mut self) -> Result<u32, ParseError> {
        let start = self.pos;
        let mut p = start;
        let mut code: u32 = 0;
        while p - start < 8 {
            match self.input.get(p).and_then(|b| (*b as char).to_digit(16)) {
                Some(d) => code = (code << 4) | d,
                None => break,
            }
            p += 1;
        }
        if self.input.get(p).is_some_and(|b| b.is_ascii_hexdigit()) {
            return Err(ParseError::TooLongWideCharValue);
        }
        if p == start || self.input.get(p) != Some(&b'}') {
            return Err(ParseError::InvalidWideCharValue);
        }
        self.pos = p + 1;
        Ok(code)
    }

    /// Reads up to `max_digits` digits in `radix`; zero when none are present.
    fn scan_radix(&mut self, radix: u32, max_digits: usize) -> u32 {
        let mut value = 0u32;
        for _ in 0..max_digits {
            match self.peek().and_then(|b| (b as char).to_digit(radix)) {
                Some(d) => {
                    value = value * radix + d;
                    self.pos += 1;
                }
                None => break,
            }
        }
        value
    }

    fn ctype_class(&self, ctype: CType, not: bool) -> Node {
        let mut cc = CharClass::new();
        cc.add_ctype(self.enc, ctype, not);
        Node::char_class(cc)
    }

    /// Parses a bracket expression after `[`.
    fn parse_char_class(&mut self) -> Result<Node, ParseError> {
        let mut cc = CharClass::new();
        cc.negated = self.consume_if(b'^');
        let mut state = ClassState::Start;
        let mut last: Option<ClassValue> = None;

        if self.peek() == Some(b']') {
            if !self.input[self.pos + 1..].contains(&b']') {
                return Err(ParseError::EmptyCharClass);
            }
            warn!("character class has ']' without escape");
            self.pos += 1;
            cc.bs.set(b']');
            state = ClassState::Value;
            last = Some(ClassValue::Sb(b']' as u32));
        }

        loop {
            let Some(c) = self.peek() else {
                return Err(ParseError::PrematureEndOfCharClass);
            };
            if c == b']' {
                self.pos += 1;
                break;
            }
            if c == b'-' && !matches!(state, ClassState::Range(_)) {
                self.pos += 1;
                if state == ClassState::Value && self.peek() != Some(b']') {
                    match last {
                        Some(from) => state = ClassState::Range(from),
                        None => return Err(ParseError::CharClassValueAtStartOfRange),
                    }
                } else {
                    cc.bs.set(b'-');
                    state = ClassState::Value;
                    last = Some(ClassValue::Sb(b'-' as u32));
                }
                continue;
            }

            let item = match c {
                b'[' if self.input.get(self.pos + 1) == Some(&b':') => {
                    let open = self.pos;
                    self.pos += 2;
                    if self.parse_posix_bracket(&mut cc)? {
                        ClassItem::Set
                    } else {
                        warn!("character class has '[' without escape");
                        self.pos = open + 1;
                        ClassItem::Value(ClassValue::Sb(b'[' as u32))
                    }
                }
                b'\\' => {
                    self.pos += 1;
                    self.parse_class_escape(&mut cc)?
                }
                _ => ClassItem::Value(self.fetch_class_char()),
            };

            match (state, item) {
                (ClassState::Range(from), ClassItem::Value(to)) => {
                    self.add_class_range(&mut cc, from, to)?;
                    state = ClassState::Complete;
                    last = None;
                }
                (ClassState::Range(_), ClassItem::Set) => {
                    return Err(ParseError::CharClassValueAtEndOfRange);
                }
                (_, ClassItem::Value(v)) => {
                    self.add_class_value(&mut cc, v)?;
                    state = ClassState::Value;
                    last = Some(v);
                }
                (_, ClassItem::Set) => {
                    state = ClassState::Value;
                    last = None;
                }
            }
        }

        if cc.ranges.len() > MAX_CODE_RANGES {
            return Err(ParseError::TooManyMultiByteRanges);
        }
        Ok(Node::char_class(cc))
    }

    fn fetch_class_char(&mut self) -> ClassValue {
        let bytes = self.fetch_char_bytes();
        if bytes.len() > 1 {
            ClassValue::Mb(self.enc.mbc_to_code(&bytes))
        } else {
            ClassValue::Sb(bytes.first().copied().unwrap_or(0) as u32)
        }
    }

    fn add_class_value(&self, cc: &mut CharClass, v: ClassValue) -> Result<(), ParseError> {
        match v {
            ClassValue::Sb(b) => cc.bs.set(b as u8),
            ClassValue::Mb(code) | ClassValue::Wide(code) => {
                self.enc.code_first_byte(code)?;
                cc.add_code(self.enc, code);
            }
        }
        Ok(())
    }

    fn add_class_range(
        &self,
        cc: &mut CharClass,
        from: ClassValue,
        to: ClassValue,
    ) -> Result<(), ParseError> {
        if let (ClassValue::Mb(lo) | ClassValue::Wide(lo), ClassValue::Sb(_)) = (from, to) {
            if !CharClass::is_single_byte_code(self.enc, lo) {
                return Err(ParseError::MismatchCodeLengthInRange);
            }
        }
        let (lo, hi) = (from.code(), to.code());
        if lo > hi {
            return Err(ParseError::RightSmallerThanLeftInRange);
        }
        match (from, to) {
            (ClassValue::Sb(_), ClassValue::Sb(_)) => cc.bs.set_range(lo as u8, hi as u8),
            _ => {
                self.enc.code_first_byte(hi)?;
                cc.add_code_range(self.enc, lo, hi);
            }
        }
        Ok(())
    }

    /// Parses after `\` inside a bracket expression.
    fn parse_class_escape(&mut self, cc: &mut CharClass) -> Result<ClassItem, ParseError> {
        let Some(c) = self.peek() else {
            return Err(ParseError::PrematureEndOfCharClass);
        };
        let set = match c {
            b'w' => Some((CType::Word, false)),
            b'W' => Some((CType::Word, true)),
            b's' => Some((CType::Space, false)),
            b'S' => Some((CType::Space, true)),
            b'd' => Some((CType::Digit, false)),
            b'D' => Some((CType::Digit, true)),
            _ => None,
        };
        if let Some((ctype, not)) = set {
            self.pos += 1;
            cc.add_ctype(self.enc, ctype, not);
            return Ok(ClassItem::Set);
        }

        let value = match c {
            b'x' => {
                self.pos += 1;
                if self.consume_if(b'{') {
                    ClassValue::Wide(self.scan_wide_hex()?)
                } else {
                    ClassValue::Sb(self.scan_radix(16, 2))
                }
            }
            b'0'..=b'7' => {
                let v = self.scan_radix(8, 3);
                if v > 0xff {
                    return Err(ParseError::TooBigNumber);
                }
                ClassValue::Sb(v)
            }
            b'b' => {
                self.pos += 1;
                ClassValue::Sb(0x08)
            }
            _ => {
                if c.is_ascii_alphabetic() && !b"ntrfaevMCc".contains(&c) {
                    warn!("character class has unknown escape '\\{}'", c as char);
                }
                match self.fetch_escaped_value()? {
                    Escaped::Code(code) => ClassValue::Sb(code),
                    Escaped::Raw(b) => ClassValue::Sb(b as u32),
                    Escaped::Bytes(bytes) => ClassValue::Mb(self.enc.mbc_to_code(&bytes)),
                }
            }
        };
        Ok(ClassItem::Value(value))
    }

    /// Parses after `[:`. Returns `false` when the text is not a POSIX
    /// bracket and should be read as ordinary class content.
    fn parse_posix_bracket(&mut self, cc: &mut CharClass) -> Result<bool, ParseError> {
        let not = self.consume_if(b'^');
        let rest = &self.input[self.pos..];
        if rest.len() >= POSIX_BRACKET_NAME_MIN_LEN + 3 {
            for (name, ctype) in POSIX_BRACKETS {
                if rest.starts_with(name) {
                    if !rest[name.len()..].starts_with(b":]") {
                        return Err(ParseError::InvalidPosixBracketType);
                    }
                    cc.add_ctype(self.enc, ctype, not);
                    self.pos += name.len() + 2;
                    return Ok(true);
                }
            }
        }

        let mut p = self.pos;
        let mut scanned = 0;
        while let Some(&c) = self.input.get(p) {
            if c == b':' || c == b']' {
                break;
            }
            p += 1;
            scanned += 1;
            if scanned > POSIX_BRACKET_CHECK_LIMIT_LENGTH {
                break;
            }
        }
        if self.input.get(p) == Some(&b':') && self.input.get(p + 1) == Some(&b']') {
            return Err(ParseError::InvalidPosixBracketType);
        }
        Ok(false)
    }

    /// Skips `(?#...)` comments, plus whitespace and `#` comments in
    /// extended mode.
    fn skip_trivia(&mut self) -> Result<(), ParseError> {
        loop {
            if self.options.contains(OptionFlags::EXTEND) {
                match self.peek() {
                    Some(b' ' | b'\t' | b'\n' | b'\r' | 0x0b | 0x0c) => {
                        self.pos += 1;
                        continue;
                    }
                    Some(b'#') => {
                        while let Some(c) = self.next() {
                            if c == b'\n' {
                                break;
                            }
                        }
                        continue;
                    }
                    _ => {}
                }
            }
            if self.input[self.pos..].starts_with(b"(?#") {
                self.pos += 3;
                loop {
                    match self.next() {
                        None => return Err(ParseError::EndPatternInGroup),
                        Some(b')') => break,
                        Some(b'\\') => {
                            self.next();
                        }
                        Some(_) => {}
                    }
                }
                continue;
            }
            return Ok(());
        }
    }

    /// Looks at a repeat operator without consuming it: bounds plus token length.
    fn peek_qualifier(&self) -> Result<Option<(u32, Option<u32>, usize)>, ParseError> {
        match self.peek() {
            Some(b'*') => Ok(Some((0, None, 1))),
            Some(b'+') => Ok(Some((1, None, 1))),
            Some(b'?') => Ok(Some((0, Some(1), 1))),
            Some(b'{') => self.scan_interval(),
            _ => Ok(None),
        }
    }

    fn fetch_qualifier(&mut self) -> Result<Option<(u32, Option<u32>)>, ParseError> {
        let Some((lower, upper, len)) = self.peek_qualifier()? else {
            return Ok(None);
        };
        self.pos += len;
        Ok(Some((lower, upper)))
    }

    /// `{n}`, `{n,}`, `{n,m}`, `{,m}`. Anything else leaves `{` literal.
    fn scan_interval(&self) -> Result<Option<(u32, Option<u32>, usize)>, ParseError> {
        let input = self.input;
        let mut p = self.pos + 1;
        let lower = scan_decimal(input, &mut p);
        let (lower, upper) = match input.get(p) {
            Some(b'}') => match lower {
                Some(n) => (n, Some(n)),
                None => return Ok(None),
            },
            Some(b',') => {
                p += 1;
                let upper = scan_decimal(input, &mut p);
                if lower.is_none() && upper.is_none() {
                    return Ok(None);
                }
                (lower.unwrap_or(0), upper)
            }
            _ => return Ok(None),
        };
        if input.get(p) != Some(&b'}') {
            return Ok(None);
        }
        p += 1;

        if lower > MAX_REPEAT_NUM || upper.is_some_and(|u| u > MAX_REPEAT_NUM) {
            return Err(ParseError::TooBigNumberForRepeatRange);
        }
        if let Some(u) = upper {
            if lower > u {
                return Err(ParseError::UpperSmallerThanLowerInRepeatRange);
            }
        }
        Ok(Some((lower as u32, upper.map(|u| u as u32), p - self.pos)))
    }

    fn fetch_char_bytes(&mut self) -> Vec<u8> {
        let len = self.enc.char_len_at(self.input, self.pos);
        let bytes = self.input[self.pos..self.pos + len].to_vec();
        self.pos += len;
        bytes
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn consume_if(&mut self, c: u8) -> bool {
        if self.peek() == Some(c) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

fn scan_decimal(input: &[u8], p: &mut usize) -> Option<u64> {
    let start = *p;
    let mut value: u64 = 0;
    while let Some(d) = input.get(*p).filter(|b| b.is_ascii_digit()) {
        value = value.saturating_mul(10).saturating_add((*d - b'0') as u64);
        *p += 1;
    }
    (*p > start).then_some(value)
}

fn conv_backslash_value(c: u8) -> u8 {
    match c {
        b'n' => b'\n',
        b't' => b'\t',
        b'r' => b'\r',
        b'f' => 0x0c,
        b'v' => 0x0b,
        b'a' => 0x07,
        b'e' => 0x1b,
        _ => c,
    }
}

/// Joins adjacent literals of the same kind and splices nested sequences.
fn merge_strings(nodes: Vec<Node>) -> Vec<Node> {
    let mut out: Vec<Node> = Vec::with_capacity(nodes.len());
    for node in nodes {
        match node {
            Node::List(inner) => {
                for n in inner {
                    push_merged(&mut out, n);
                }
            }
            node => push_merged(&mut out, node),
        }
    }
    out
}

fn push_merged(out: &mut Vec<Node>, node: Node) {
    if let Some(last) = out.last_mut() {
        match (last, &node) {
            (Node::String(prev), Node::String(bytes))
            | (Node::StringRaw(prev), Node::StringRaw(bytes)) => {
                prev.extend_from_slice(bytes);
                return;
            }
            _ => {}
        }
    }
    out.push(node);
}

/// The six "popular" qualifier shapes, in reduction-table order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Popular {
    /// `?`
    Question,
    /// `*`
    Star,
    /// `+`
    Plus,
    /// `??`
    LazyQuestion,
    /// `*?`
    LazyStar,
    /// `+?`
    LazyPlus,
}

fn popular_kind(q: &Qualifier) -> Option<Popular> {
    match (q.lower, q.upper, q.greedy) {
        (0, Some(1), true) => Some(Popular::Question),
        (0, None, true) => Some(Popular::Star),
        (1, None, true) => Some(Popular::Plus),
        (0, Some(1), false) => Some(Popular::LazyQuestion),
        (0, None, false) => Some(Popular::LazyStar),
        (1, None, false) => Some(Popular::LazyPlus),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reduce {
    /// Keep only the inner qualifier.
    Del,
    /// `*` over the inner target.
    A,
    /// `*?` over the inner target.
    Aq,
    /// `??` over the inner target.
    Qq,
    /// `(?:X+)??`
    PQq,
    /// `(?:X+?)?`
    PqQ,
    /// Leave the nesting alone.
    Asis,
}

/// Indexed by `[inner][outer]`.
const REDUCE_TABLE: [[Reduce; 6]; 6] = {
    use Reduce::*;
    [
        [Del, A, A, Qq, Aq, Asis],
        [Del, Del, Del, PQq, PQq, Del],
        [A, A, Del, Asis, PQq, Del],
        [Del, Aq, Aq, Del, Aq, Aq],
        [Del, Del, Del, Del, Del, Del],
        [Asis, PqQ, Del, Aq, Aq, Del],
    ]
};

/// Applies `{lower,upper}` to `target`, simplifying a directly nested
/// qualifier where the combination has a single-node equivalent.
fn set_qualifier(target: Node, lower: u32, upper: Option<u32>, greedy: bool) -> Node {
    let mut outer = Qualifier::new(Node::Empty, lower, upper, greedy);
    let Node::Qualifier(inner) = target else {
        outer.target = target;
        return Node::Qualifier(Box::new(outer));
    };
    let inner = *inner;
    match (popular_kind(&outer), popular_kind(&inner)) {
        (Some(p), Some(c)) => return reduce_nested(p, inner, c),
        (None, Some(Popular::Star | Popular::Plus)) => {
            if let Some(up) = outer.upper {
                if up > 1 && outer.greedy {
                    outer.upper = Some(if outer.lower == 0 { 1 } else { outer.lower });
                }
            }
        }
        _ => {}
    }
    outer.target = Node::Qualifier(Box::new(inner));
    Node::Qualifier(Box::new(outer))
}

fn reduce_nested(outer: Popular, inner: Qualifier, inner_kind: Popular) -> Node {
    match REDUCE_TABLE[inner_kind as usize][outer as usize] {
        Reduce::Del => Node::Qualifier(Box::new(inner)),
        Reduce::A => Node::qualifier(inner.target, 0, None, true),
        Reduce::Aq => Node::qualifier(inner.target, 0, None, false),
        Reduce::Qq => Node::qualifier(inner.target, 0, Some(1), false),
        Reduce::PQq => {
            let plus = Node::qualifier(inner.target, 1, None, true);
            Node::qualifier(plus, 0, Some(1), false)
        }
        Reduce::PqQ => {
            let lazy_plus = Node::qualifier(inner.target, 1, None, false);
            Node::qualifier(lazy_plus, 0, Some(1), true)
        }
        Reduce::Asis => {
            let (lower, upper, greedy) = match outer {
                Popular::Question => (0, Some(1), true),
                Popular::Star => (0, None, true),
                Popular::Plus => (1, None, true),
                Popular::LazyQuestion => (0, Some(1), false),
                Popular::LazyStar => (0, None, false),
                Popular::LazyPlus => (1, None, false),
            };
            Node::qualifier(Node::Qualifier(Box::new(inner)), lower, upper, greedy)
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        engine::{
            ast::{AnchorKind, EffectKind, Node},
            encoding::Encoding,
            parser::{parse, ParseError},
        },
        options::OptionFlags,
    };

    fn parse_root(pattern: &str) -> Node {
        parse(pattern.as_bytes(), OptionFlags::NONE, Encoding::Utf8)
            .unwrap()
            .root
    }

    fn parse_err(pattern: &str) -> ParseError {
        parse(pattern.as_bytes(), OptionFlags::NONE, Encoding::Utf8).unwrap_err()
    }

    #[test]
    fn test_parse_wide_hex_out_of_range() {
        // 符号化できないコードは切り詰めずにエラーにする
        for enc in [Encoding::EucJp, Encoding::Sjis] {
            assert_eq!(
                parse(br"\x{12345678}", OptionFlags::NONE, enc).unwrap_err(),
                ParseError::TooBigWideCharValue
            );
            assert_eq!(
                parse(br"[\x{12345678}]", OptionFlags::NONE, enc).unwrap_err(),
                ParseError::TooBigWideCharValue
            );
        }
        assert_eq!(
            parse(br"\x{10000}", OptionFlags::NONE, Encoding::Sjis).unwrap_err(),
            ParseError::TooBigWideCharValue
        );
        let parsed = parse(br"\x{8fb0a1}", OptionFlags::NONE, Encoding::EucJp).unwrap();
        assert_eq!(parsed.root, Node::String(vec![0x8f, 0xb0, 0xa1]));
    }

    fn lit(s: &str) -> Node {
        Node::String(s.as_bytes().to_vec())
    }

    #[test]
    fn test_parse_literal_merge() {
        assert_eq!(parse_root("abc"), lit("abc"));
        assert_eq!(parse_root("(?:ab)c"), lit("abc"));
        assert_eq!(parse_root(""), Node::Empty);
    }

    #[test]
    fn test_parse_qualifier_binds_last_char() {
        let expected = Node::List(vec![lit("a"), Node::qualifier(lit("b"), 0, None, true)]);
        assert_eq!(parse_root("ab*"), expected);

        // マルチバイト文字は 1 文字として扱う
        let expected = Node::List(vec![lit("a"), Node::qualifier(lit("あ"), 1, None, false)]);
        assert_eq!(parse_root("aあ+?"), expected);
    }

    #[test]
    fn test_parse_group_and_alt() {
        let parsed = parse(b"(a|b)(c)", OptionFlags::NONE, Encoding::Ascii).unwrap();
        assert_eq!(parsed.num_mem, 2);
        let expected = Node::List(vec![
            Node::effect(EffectKind::Memory, 1, Node::Alt(vec![lit("a"), lit("b")])),
            Node::effect(EffectKind::Memory, 2, lit("c")),
        ]);
        assert_eq!(parsed.root, expected);
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(
            parse_root("a{2,3}"),
            Node::qualifier(lit("a"), 2, Some(3), true)
        );
        assert_eq!(
            parse_root("a{,3}"),
            Node::qualifier(lit("a"), 0, Some(3), true)
        );
        assert_eq!(parse_root("a{2,}?"), Node::qualifier(lit("a"), 2, None, false));
        // 不正な形式の `{` はリテラルとして扱う
        assert_eq!(parse_root("a{"), lit("a{"));
        assert_eq!(parse_root("a{x}"), lit("a{x}"));
        assert_eq!(parse_err("a{3,2}"), ParseError::UpperSmallerThanLowerInRepeatRange);
        assert_eq!(parse_err("a{100001}"), ParseError::TooBigNumberForRepeatRange);
    }

    #[test]
    fn test_parse_nested_qualifier_reduction() {
        assert_eq!(parse_root("(?:a*)*"), Node::qualifier(lit("a"), 0, None, true));
        assert_eq!(parse_root("(?:a?)+"), Node::qualifier(lit("a"), 0, None, true));
        assert_eq!(parse_root("(?:a+)+"), Node::qualifier(lit("a"), 1, None, true));
        assert_eq!(parse_root("(?:a*?)+"), Node::qualifier(lit("a"), 0, None, false));
        assert_eq!(
            parse_root("(?:a*)??"),
            Node::qualifier(Node::qualifier(lit("a"), 1, None, true), 0, Some(1), false)
        );
        assert_eq!(
            parse_root("(?:a+?)*"),
            Node::qualifier(Node::qualifier(lit("a"), 1, None, false), 0, Some(1), true)
        );
        assert_eq!(
            parse_root("(?:a?)+?"),
            Node::qualifier(Node::qualifier(lit("a"), 0, Some(1), true), 1, None, false)
        );
        // 数値指定の外側は下限まで縮める
        assert_eq!(
            parse_root("(?:a*){2,5}"),
            Node::qualifier(Node::qualifier(lit("a"), 0, None, true), 2, Some(2), true)
        );
        // 捕獲グループは簡約しない
        assert!(matches!(parse_root("(a*)*"), Node::Qualifier(q) if matches!(q.target, Node::Effect(_))));
    }

    #[test]
    fn test_parse_repeat_errors() {
        assert_eq!(parse_err("*"), ParseError::TargetOfRepeatOperatorNotSpecified);
        assert_eq!(parse_err("a|+"), ParseError::TargetOfRepeatOperatorNotSpecified);
        assert_eq!(parse_err("a**"), ParseError::NestedRepeatOperator);
        assert_eq!(parse_err("a+?*"), ParseError::NestedRepeatOperator);
        assert_eq!(parse_err("^*"), ParseError::TargetOfRepeatOperatorInvalid);
        assert_eq!(parse_err("(?=a)+"), ParseError::TargetOfRepeatOperatorInvalid);
    }

    #[test]
    fn test_parse_group_errors() {
        assert_eq!(parse_err("(a"), ParseError::EndPatternWithUnmatchedParenthesis);
        assert_eq!(parse_err("a)"), ParseError::UnmatchedCloseParenthesis);
        assert_eq!(parse_err("(?"), ParseError::EndPatternInGroup);
        assert_eq!(parse_err("(?q)"), ParseError::UndefinedGroupOption);
        assert_eq!(parse_err("(?<x)"), ParseError::UndefinedGroupOption);
        assert_eq!(parse_err("a\\"), ParseError::EndPatternAtBackslash);
    }

    #[test]
    fn test_parse_anchors_and_lookaround() {
        assert_eq!(
            parse_root("^a$"),
            Node::List(vec![
                Node::Anchor(AnchorKind::BeginLine),
                lit("a"),
                Node::Anchor(AnchorKind::EndLine),
            ])
        );
        assert_eq!(
            parse_root("(?<=a)\\b"),
            Node::List(vec![
                Node::effect(EffectKind::LookBehind, 0, lit("a")),
                Node::Anchor(AnchorKind::WordBound),
            ])
        );
        assert_eq!(
            parse_root("(?>a)"),
            Node::effect(EffectKind::StopBacktrack, 0, lit("a"))
        );
    }

    #[test]
    fn test_parse_inline_option_takes_rest() {
        let expected = Node::List(vec![
            lit("a"),
            Node::Option {
                options: OptionFlags::IGNORECASE,
                target: Box::new(Node::Alt(vec![lit("b"), lit("c")])),
            },
        ]);
        assert_eq!(parse_root("a(?i)b|c"), expected);

        let expected = Node::Option {
            options: OptionFlags::MULTILINE,
            target: Box::new(lit("x")),
        };
        assert_eq!(
            parse(b"(?m-i:x)", OptionFlags::IGNORECASE, Encoding::Ascii)
                .unwrap()
                .root,
            expected
        );
    }

    #[test]
    fn test_parse_extended_and_comment() {
        let parsed = parse(b"a b # c\n c", OptionFlags::EXTEND, Encoding::Ascii).unwrap();
        assert_eq!(parsed.root, lit("abc"));
        assert_eq!(parse_root("a(?#comment)b"), lit("ab"));
        assert_eq!(parse_root("a b"), lit("a b"));
    }

    #[test]
    fn test_parse_backref_rules() {
        let parsed = parse(b"(a)\\1", OptionFlags::NONE, Encoding::Ascii).unwrap();
        assert_eq!(parsed.root, Node::List(vec![
            Node::effect(EffectKind::Memory, 1, lit("a")),
            Node::Backref(1),
        ]));
        assert!(parsed.backrefs.contains(&1));

        // 前方参照
        assert!(parse(b"\\1(a)", OptionFlags::NONE, Encoding::Ascii).is_ok());
        assert_eq!(parse_err("(a)\\2"), ParseError::InvalidBackref(2));
        // \8 \9 はグループがなければ数字そのもの
        assert_eq!(parse_root("\\8"), lit("8"));
        // 2 桁以上は 8 進数
        assert_eq!(parse_root("\\101"), Node::StringRaw(vec![b'A']));
        assert_eq!(parse_err("\\1001"), ParseError::TooBigBackrefNumber);
    }

    #[test]
    fn test_parse_escapes() {
        assert_eq!(parse_root("\\x41"), Node::StringRaw(vec![0x41]));
        assert_eq!(parse_root("\\x{3042}"), lit("あ"));
        assert_eq!(
            parse_root("\\0101"),
            Node::List(vec![Node::StringRaw(vec![0o10]), lit("1")])
        );
        assert_eq!(parse_root("\\n\\t"), lit("\n\t"));
        assert_eq!(parse_root("\\cA"), Node::StringRaw(vec![0x01]));
        assert_eq!(parse_root("\\C-a"), Node::StringRaw(vec![0x01]));
        assert_eq!(parse_root("\\M-a"), Node::StringRaw(vec![0xe1]));
        assert_eq!(parse_root("\\."), lit("."));
        assert_eq!(parse_err("\\x{123456789}"), ParseError::TooLongWideCharValue);
        assert_eq!(parse_err("\\x{12"), ParseError::InvalidWideCharValue);
        assert_eq!(parse_err("\\M"), ParseError::EndPatternAtMeta);
        assert_eq!(parse_err("\\Mx"), ParseError::MetaCodeSyntax);
        assert_eq!(parse_err("\\C"), ParseError::EndPatternAtControl);
    }

    fn parse_class(pattern: &str, enc: Encoding) -> crate::engine::charclass::CharClass {
        match parse(pattern.as_bytes(), OptionFlags::NONE, enc).unwrap().root {
            Node::CharClass(cc) => *cc,
            other => panic!("not a class: {other:?}"),
        }
    }

    #[test]
    fn test_parse_char_class() {
        let cc = parse_class("[a-c\\d_]", Encoding::Ascii);
        for b in [b'a', b'b', b'c', b'0', b'9', b'_'] {
            assert!(cc.bs.contains(b));
        }
        assert!(!cc.bs.contains(b'd'));
        assert!(!cc.negated);

        let cc = parse_class("[^a-]", Encoding::Ascii);
        assert!(cc.negated);
        assert!(cc.bs.contains(b'-'));

        let cc = parse_class("[]a]", Encoding::Ascii);
        assert!(cc.bs.contains(b']'));
        assert!(cc.bs.contains(b'a'));

        let cc = parse_class("[a-b-c]", Encoding::Ascii);
        assert!(cc.bs.contains(b'-'));
        assert!(cc.bs.contains(b'c'));
    }

    #[test]
    fn test_parse_char_class_multibyte() {
        let cc = parse_class("[あ-ん]", Encoding::Utf8);
        assert_eq!(cc.ranges, vec![(0x3042, 0x3093)]);
        let cc = parse_class("[a-あ]", Encoding::Utf8);
        assert!(cc.bs.contains(b'z'));
        assert_eq!(cc.ranges, vec![(0x80, 0x3042)]);
        assert_eq!(
            parse("[あ-z]".as_bytes(), OptionFlags::NONE, Encoding::Utf8).unwrap_err(),
            ParseError::MismatchCodeLengthInRange
        );
    }

    #[test]
    fn test_parse_char_class_errors() {
        assert_eq!(parse_err("[]"), ParseError::EmptyCharClass);
        assert_eq!(parse_err("[a"), ParseError::PrematureEndOfCharClass);
        assert_eq!(parse_err("[z-a]"), ParseError::RightSmallerThanLeftInRange);
        assert_eq!(parse_err("[\\w-a]"), ParseError::CharClassValueAtStartOfRange);
        assert_eq!(parse_err("[a-\\w]"), ParseError::CharClassValueAtEndOfRange);
    }

    #[test]
    fn test_parse_posix_bracket() {
        let cc = parse_class("[[:upper:][:digit:]]", Encoding::Ascii);
        assert!(cc.bs.contains(b'Q'));
        assert!(cc.bs.contains(b'7'));
        assert!(!cc.bs.contains(b'q'));

        let cc = parse_class("[[:^alpha:]]", Encoding::Ascii);
        assert!(!cc.bs.contains(b'a'));
        assert!(cc.bs.contains(b'1'));

        // 既知の名前で `:]` が続かない場合はエラー
        assert_eq!(parse_err("[[:alpha]]"), ParseError::InvalidPosixBracketType);
        // `[:...:]` の形をした未知の名前はエラー
        assert_eq!(parse_err("[[:foo:]]"), ParseError::InvalidPosixBracketType);
        // それ以外は通常の文字として読む
        let cc = parse_class("[[:a]", Encoding::Ascii);
        assert!(cc.bs.contains(b'['));
        assert!(cc.bs.contains(b':'));
        assert!(cc.bs.contains(b'a'));
    }
}
