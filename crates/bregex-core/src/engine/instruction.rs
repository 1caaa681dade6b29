//! コード生成時に使用する型。
//! compiler モジュールで生成し、evaluator モジュールで実行する。
//!
//! 分岐先アドレスは次の命令からの相対位置で表す。

use std::fmt::{self, Display};

use crate::engine::charclass::BitSet;

/// 仮想マシンの命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// マッチング成功
    End,

    Exact1(u8),
    Exact2([u8; 2]),
    Exact3([u8; 3]),
    Exact4([u8; 4]),
    Exact5([u8; 5]),
    ExactN(Vec<u8>),
    /// One two-byte character.
    ExactMb2N1([u8; 2]),
    ExactMb2N2([u8; 4]),
    ExactMb2N3([u8; 6]),
    ExactMb2N(Vec<u8>),
    ExactMb3N(Vec<u8>),
    ExactMbN {
        len: usize,
        bytes: Vec<u8>,
    },
    /// Already folded through the case table.
    Exact1Ic(u8),
    ExactNIc(Vec<u8>),

    CClass(BitSet),
    CClassNot(BitSet),
    CClassMb(Vec<(u32, u32)>),
    CClassMbNot(Vec<(u32, u32)>),
    CClassMix(BitSet, Vec<(u32, u32)>),
    CClassMixNot(BitSet, Vec<(u32, u32)>),

    AnyChar,
    AnyCharMl,
    AnyCharStar,
    AnyCharMlStar,
    AnyCharStarPeekNext(u8),
    AnyCharMlStarPeekNext(u8),

    Word,
    NotWord,
    WordBound,
    NotWordBound,
    WordBegin,
    WordEnd,

    BeginBuf,
    EndBuf,
    SemiEndBuf,
    BeginPosition,
    /// `multiline` が真なら行頭、偽ならバッファ先頭
    BeginLine {
        multiline: bool,
    },
    EndLine {
        multiline: bool,
    },

    BackrefN(usize),
    BackrefNIc(usize),

    MemoryStart(usize),
    MemoryStartPush(usize),
    MemoryEnd(usize),
    MemoryEndPush(usize),

    Fail,
    Jump(i32),
    Push(i32),
    PushOrJumpExact1(i32, u8),
    PushIfPeekNext(i32, u8),
    Repeat {
        id: usize,
        addr: i32,
    },
    RepeatNg {
        id: usize,
        addr: i32,
    },
    RepeatInc(usize),
    RepeatIncNg(usize),
    NullCheckStart {
        id: usize,
        memst: bool,
    },
    NullCheckEnd(usize),
    NullCheckEndMemst(usize),

    PushPos,
    PopPos,
    PushPosNot(i32),
    FailPos,
    PushStopBt,
    PopStopBt,
    LookBehind(usize),
    PushLookBehindNot {
        addr: i32,
        len: usize,
    },
    FailLookBehindNot,
}

impl Instruction {
    /// Exact-match operand bytes, if this is one of the literal opcodes.
    pub fn exact_bytes(&self) -> Option<&[u8]> {
        match self {
            Instruction::Exact1(b) => Some(std::slice::from_ref(b)),
            Instruction::Exact2(b) => Some(b),
            Instruction::Exact3(b) => Some(b),
            Instruction::Exact4(b) => Some(b),
            Instruction::Exact5(b) => Some(b),
            Instruction::ExactMb2N1(b) => Some(b),
            Instruction::ExactMb2N2(b) => Some(b),
            Instruction::ExactMb2N3(b) => Some(b),
            Instruction::ExactN(b)
            | Instruction::ExactMb2N(b)
            | Instruction::ExactMb3N(b)
            | Instruction::ExactMbN { bytes: b, .. } => Some(b),
            _ => None,
        }
    }
}

fn write_bytes(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for b in bytes {
        if b.is_ascii_graphic() {
            write!(f, "{}", *b as char)?;
        } else {
            write!(f, "\\x{b:02x}")?;
        }
    }
    Ok(())
}

fn write_ranges(f: &mut fmt::Formatter<'_>, ranges: &[(u32, u32)]) -> fmt::Result {
    for (i, (lo, hi)) in ranges.iter().enumerate() {
        if i > 0 {
            write!(f, ",")?;
        }
        write!(f, "{lo:x}-{hi:x}")?;
    }
    Ok(())
}

impl Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(bytes) = self.exact_bytes() {
            let name = match self {
                Instruction::Exact1(_) => "exact1",
                Instruction::Exact2(_) => "exact2",
                Instruction::Exact3(_) => "exact3",
                Instruction::Exact4(_) => "exact4",
                Instruction::Exact5(_) => "exact5",
                Instruction::ExactN(_) => "exactn",
                Instruction::ExactMb2N1(_) => "exactmb2-n1",
                Instruction::ExactMb2N2(_) => "exactmb2-n2",
                Instruction::ExactMb2N3(_) => "exactmb2-n3",
                Instruction::ExactMb2N(_) => "exactmb2-n",
                Instruction::ExactMb3N(_) => "exactmb3n",
                _ => "exactmbn",
            };
            write!(f, "{name} ")?;
            return write_bytes(f, bytes);
        }
        match self {
            Instruction::End => write!(f, "end"),
            Instruction::Exact1Ic(b) => {
                write!(f, "exact1-ic ")?;
                write_bytes(f, std::slice::from_ref(b))
            }
            Instruction::ExactNIc(bytes) => {
                write!(f, "exactn-ic ")?;
                write_bytes(f, bytes)
            }
            Instruction::CClass(bs) => write!(f, "cclass [{bs}]"),
            Instruction::CClassNot(bs) => write!(f, "cclass-not [{bs}]"),
            Instruction::CClassMb(ranges) => {
                write!(f, "cclass-mb [")?;
                write_ranges(f, ranges)?;
                write!(f, "]")
            }
            Instruction::CClassMbNot(ranges) => {
                write!(f, "cclass-mb-not [")?;
                write_ranges(f, ranges)?;
                write!(f, "]")
            }
            Instruction::CClassMix(bs, ranges) => {
                write!(f, "cclass-mix [{bs}] [")?;
                write_ranges(f, ranges)?;
                write!(f, "]")
            }
            Instruction::CClassMixNot(bs, ranges) => {
                write!(f, "cclass-mix-not [{bs}] [")?;
                write_ranges(f, ranges)?;
                write!(f, "]")
            }
            Instruction::AnyChar => write!(f, "anychar"),
            Instruction::AnyCharMl => write!(f, "anychar-ml"),
            Instruction::AnyCharStar => write!(f, "anychar*"),
            Instruction::AnyCharMlStar => write!(f, "anychar-ml*"),
            Instruction::AnyCharStarPeekNext(b) => write!(f, "anychar*-peek-next {}", *b as char),
            Instruction::AnyCharMlStarPeekNext(b) => {
                write!(f, "anychar-ml*-peek-next {}", *b as char)
            }
            Instruction::Word => write!(f, "word"),
            Instruction::NotWord => write!(f, "not-word"),
            Instruction::WordBound => write!(f, "word-bound"),
            Instruction::NotWordBound => write!(f, "not-word-bound"),
            Instruction::WordBegin => write!(f, "word-begin"),
            Instruction::WordEnd => write!(f, "word-end"),
            Instruction::BeginBuf => write!(f, "begin-buf"),
            Instruction::EndBuf => write!(f, "end-buf"),
            Instruction::SemiEndBuf => write!(f, "semi-end-buf"),
            Instruction::BeginPosition => write!(f, "begin-position"),
            Instruction::BeginLine { multiline: true } => write!(f, "begin-line"),
            Instruction::BeginLine { multiline: false } => write!(f, "begin-line-sl"),
            Instruction::EndLine { multiline: true } => write!(f, "end-line"),
            Instruction::EndLine { multiline: false } => write!(f, "end-line-sl"),
            Instruction::BackrefN(n) => write!(f, "backrefn {n}"),
            Instruction::BackrefNIc(n) => write!(f, "backrefn-ic {n}"),
            Instruction::MemoryStart(n) => write!(f, "mem-start {n}"),
            Instruction::MemoryStartPush(n) => write!(f, "mem-start-push {n}"),
            Instruction::MemoryEnd(n) => write!(f, "mem-end {n}"),
            Instruction::MemoryEndPush(n) => write!(f, "mem-end-push {n}"),
            Instruction::Fail => write!(f, "fail"),
            Instruction::Jump(addr) => write!(f, "jump {addr:>04}"),
            Instruction::Push(addr) => write!(f, "push {addr:>04}"),
            Instruction::PushOrJumpExact1(addr, b) => {
                write!(f, "push-or-jump-e1 {addr:>04} {}", *b as char)
            }
            Instruction::PushIfPeekNext(addr, b) => {
                write!(f, "push-if-peek-next {addr:>04} {}", *b as char)
            }
            Instruction::Repeat { id, addr } => write!(f, "repeat {id} {addr:>04}"),
            Instruction::RepeatNg { id, addr } => write!(f, "repeat-ng {id} {addr:>04}"),
            Instruction::RepeatInc(id) => write!(f, "repeat-inc {id}"),
            Instruction::RepeatIncNg(id) => write!(f, "repeat-inc-ng {id}"),
            Instruction::NullCheckStart { id, memst: false } => {
                write!(f, "null-check-start {id}")
            }
            Instruction::NullCheckStart { id, memst: true } => {
                write!(f, "null-check-start-memst {id}")
            }
            Instruction::NullCheckEnd(id) => write!(f, "null-check-end {id}"),
            Instruction::NullCheckEndMemst(id) => write!(f, "null-check-end-memst {id}"),
            Instruction::PushPos => write!(f, "push-pos"),
            Instruction::PopPos => write!(f, "pop-pos"),
            Instruction::PushPosNot(addr) => write!(f, "push-pos-not {addr:>04}"),
            Instruction::FailPos => write!(f, "fail-pos"),
            Instruction::PushStopBt => write!(f, "push-stop-bt"),
            Instruction::PopStopBt => write!(f, "pop-stop-bt"),
            Instruction::LookBehind(len) => write!(f, "look-behind {len}"),
            Instruction::PushLookBehindNot { addr, len } => {
                write!(f, "push-look-behind-not {addr:>04} {len}")
            }
            Instruction::FailLookBehindNot => write!(f, "fail-look-behind-not"),
            _ => Ok(()),
        }
    }
}

// ----- テストコード -----

#[cfg(test)]
mod tests {
    use crate::engine::{charclass::BitSet, instruction::Instruction};

    #[test]
    fn test_instruction_fmt() {
        let mut bs = BitSet::new();
        bs.set_range(b'a', b'c');

        assert_eq!(format!("{}", Instruction::Exact1(b'a')), "exact1 a");
        assert_eq!(format!("{}", Instruction::Exact3(*b"abc")), "exact3 abc");
        assert_eq!(format!("{}", Instruction::ExactN(b"ab\n".to_vec())), "exactn ab\\x0a");
        assert_eq!(format!("{}", Instruction::CClass(bs)), "cclass [61-63]");
        assert_eq!(
            format!("{}", Instruction::CClassMb(vec![(0x3041, 0x3096)])),
            "cclass-mb [3041-3096]"
        );
        assert_eq!(format!("{}", Instruction::Jump(10)), "jump 0010");
        assert_eq!(format!("{}", Instruction::Push(-3)), "push -003");
        assert_eq!(
            format!("{}", Instruction::PushOrJumpExact1(4, b'a')),
            "push-or-jump-e1 0004 a"
        );
        assert_eq!(
            format!("{}", Instruction::Repeat { id: 0, addr: 5 }),
            "repeat 0 0005"
        );
        assert_eq!(
            format!("{}", Instruction::BeginLine { multiline: false }),
            "begin-line-sl"
        );
        assert_eq!(format!("{}", Instruction::End), "end");
    }

    #[test]
    fn test_exact_bytes() {
        assert_eq!(Instruction::Exact2(*b"ab").exact_bytes(), Some(&b"ab"[..]));
        assert_eq!(
            Instruction::ExactMbN {
                len: 4,
                bytes: vec![0xf0, 0x9f, 0x98, 0x80]
            }
            .exact_bytes()
            .map(|b| b.len()),
            Some(4)
        );
        assert_eq!(Instruction::AnyChar.exact_bytes(), None);
    }
}
