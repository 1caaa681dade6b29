//! 構文木(Node)を命令列(Instruction)へコンパイルする。
//!
//! 各ノードの命令長を先に計算し、その値から相対アドレスを決めて出力する。

use thiserror::Error;

use crate::{
    engine::{
        ast::{AnchorKind, CTypeKind, EffectKind, Node, Qualifier, TargetEmpty},
        charclass::CharClass,
        encoding::{CaseFoldTable, Encoding},
        instruction::Instruction,
        safe_add,
        setup::char_length,
    },
    options::OptionFlags,
};

/// Unrolled repeats are used while they stay within this many instructions.
const QUALIFIER_EXPAND_LIMIT: usize = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("CompileError: PCOverFlow")]
    PCOverFlow,
    #[error("CompileError: invalid pattern in look-behind")]
    InvalidLookBehindPattern,
    #[error("CompileError: ignore-case requested without a case table")]
    TableForIgnoreCaseNotSet,
    #[error("CompileError: generated code length differs from the computed length")]
    UnexpectedCodeLength,
}

/// コンパイル済みのプログラム
#[derive(Debug, Clone)]
pub struct Program {
    pub code: Vec<Instruction>,
    pub enc: Encoding,
    pub options: OptionFlags,
    pub case_table: CaseFoldTable,
    /// Highest capture group number.
    pub num_mem: usize,
    /// `(lower, upper)` for each counted repeat id.
    pub repeat_range: Vec<(u32, Option<u32>)>,
    pub num_null_check: usize,
}

struct Compiler<'a> {
    p_counter: usize,
    instructions: Vec<Instruction>,
    enc: Encoding,
    case_table: Option<&'a CaseFoldTable>,
    repeat_range: Vec<(u32, Option<u32>)>,
    num_null_check: usize,
}

fn to_rel(n: usize) -> Result<i32, CompileError> {
    i32::try_from(n).map_err(|_| CompileError::PCOverFlow)
}

impl<'a> Compiler<'a> {
    fn new(enc: Encoding, case_table: Option<&'a CaseFoldTable>) -> Self {
        Compiler {
            p_counter: 0,
            instructions: Vec::new(),
            enc,
            case_table,
            repeat_range: Vec::new(),
            num_null_check: 0,
        }
    }

    fn increment_p_counter(&mut self) -> Result<(), CompileError> {
        safe_add(&mut self.p_counter, &1, || CompileError::PCOverFlow)
    }

    fn push_instruction(&mut self, instruction: Instruction) -> Result<usize, CompileError> {
        let index = self.p_counter;
        self.increment_p_counter()?;
        self.instructions.push(instruction);
        Ok(index)
    }

    fn fold_table(&self, options: OptionFlags) -> Result<Option<&'a CaseFoldTable>, CompileError> {
        if !options.contains(OptionFlags::IGNORECASE) {
            return Ok(None);
        }
        self.case_table
            .map(Some)
            .ok_or(CompileError::TableForIgnoreCaseNotSet)
    }

    /// ノードが生成する命令数
    fn compiled_length(&self, node: &Node, options: OptionFlags) -> Result<usize, CompileError> {
        let len = match node {
            Node::Empty => 0,
            Node::List(nodes) => {
                let mut len = 0;
                for n in nodes {
                    safe_add(&mut len, &self.compiled_length(n, options)?, || {
                        CompileError::PCOverFlow
                    })?;
                }
                len
            }
            Node::Alt(nodes) => {
                let mut len = 2 * (nodes.len().saturating_sub(1));
                for n in nodes {
                    safe_add(&mut len, &self.compiled_length(n, options)?, || {
                        CompileError::PCOverFlow
                    })?;
                }
                len
            }
            Node::String(bytes) => {
                string_instructions(bytes, self.enc, self.fold_table(options)?).len()
            }
            Node::StringRaw(bytes) => string_instructions(bytes, self.enc, None).len(),
            Node::CharClass(_)
            | Node::CType(_)
            | Node::AnyChar
            | Node::Anchor(_)
            | Node::Backref(_) => 1,
            Node::Option {
                options: inner,
                target,
            } => self.compiled_length(target, *inner)?,
            Node::Qualifier(q) => self.qualifier_length(q, options)?,
            Node::Effect(effect) => {
                let tlen = self.compiled_length(&effect.target, options)?;
                let extra = match effect.kind {
                    EffectKind::LookBehind => 1,
                    _ => 2,
                };
                tlen.checked_add(extra).ok_or(CompileError::PCOverFlow)?
            }
        };
        Ok(len)
    }

    fn qualifier_length(&self, q: &Qualifier, options: OptionFlags) -> Result<usize, CompileError> {
        let tlen = self.compiled_length(&q.target, options)?;
        if tlen == 0 || q.upper == Some(0) {
            return Ok(0);
        }
        let lower = q.lower as usize;
        if is_anychar_star(q) {
            return Ok(lower + 1);
        }
        let mod_tlen = tlen + empty_check_length(q.target_empty);

        let len = match q.upper {
            None if lower <= 1 || tlen.saturating_mul(lower) <= QUALIFIER_EXPAND_LIMIT => {
                let head = if lower == 1 && tlen > QUALIFIER_EXPAND_LIMIT {
                    1
                } else {
                    tlen * lower
                };
                head + mod_tlen + 2
            }
            Some(upper)
                if q.greedy
                    && (upper == 1
                        || (tlen + 1).saturating_mul(upper as usize) <= QUALIFIER_EXPAND_LIMIT) =>
            {
                let n = upper.saturating_sub(q.lower) as usize;
                tlen * lower + n * (tlen + 1)
            }
            Some(1) if !q.greedy && q.lower == 0 => tlen + 2,
            _ => mod_tlen + 2,
        };
        Ok(len)
    }

    fn gen_expr(&mut self, node: &Node, options: OptionFlags) -> Result<(), CompileError> {
        match node {
            Node::Empty => Ok(()),
            Node::List(nodes) => {
                for n in nodes {
                    self.gen_expr(n, options)?;
                }
                Ok(())
            }
            Node::Alt(nodes) => self.gen_alternate(nodes, options),
            Node::String(bytes) => {
                let table = self.fold_table(options)?;
                for inst in string_instructions(bytes, self.enc, table) {
                    self.push_instruction(inst)?;
                }
                Ok(())
            }
            Node::StringRaw(bytes) => {
                for inst in string_instructions(bytes, self.enc, None) {
                    self.push_instruction(inst)?;
                }
                Ok(())
            }
            Node::CharClass(cc) => {
                self.push_instruction(class_instruction(cc, self.enc))?;
                Ok(())
            }
            Node::CType(kind) => {
                let inst = match kind {
                    CTypeKind::Word => Instruction::Word,
                    CTypeKind::NotWord => Instruction::NotWord,
                };
                self.push_instruction(inst)?;
                Ok(())
            }
            Node::AnyChar => {
                let inst = if options.contains(OptionFlags::MULTILINE) {
                    Instruction::AnyCharMl
                } else {
                    Instruction::AnyChar
                };
                self.push_instruction(inst)?;
                Ok(())
            }
            Node::Anchor(kind) => {
                self.push_instruction(anchor_instruction(*kind, options))?;
                Ok(())
            }
            Node::Backref(n) => {
                let inst = if options.contains(OptionFlags::IGNORECASE) {
                    Instruction::BackrefNIc(*n)
                } else {
                    Instruction::BackrefN(*n)
                };
                self.push_instruction(inst)?;
                Ok(())
            }
            Node::Option {
                options: inner,
                target,
            } => self.gen_expr(target, *inner),
            Node::Qualifier(q) => self.gen_qualifier(q, options),
            Node::Effect(effect) => self.gen_effect(
                effect.kind,
                effect.regnum,
                effect.backtrack_mem,
                &effect.target,
                options,
            ),
        }
    }

    fn gen_alternate(&mut self, nodes: &[Node], options: OptionFlags) -> Result<(), CompileError> {
        let mut lens = Vec::with_capacity(nodes.len());
        for n in nodes {
            lens.push(self.compiled_length(n, options)?);
        }
        let total = lens.iter().sum::<usize>() + 2 * (nodes.len().saturating_sub(1));
        let start = self.p_counter;
        for (i, (n, len)) in nodes.iter().zip(&lens).enumerate() {
            let last = i + 1 == nodes.len();
            if !last {
                self.push_instruction(Instruction::Push(to_rel(len + 1)?))?;
            }
            self.gen_expr(n, options)?;
            if !last {
                let after_jump = self.p_counter + 1 - start;
                self.push_instruction(Instruction::Jump(to_rel(total - after_jump)?))?;
            }
        }
        Ok(())
    }

    fn gen_effect(
        &mut self,
        kind: EffectKind,
        regnum: usize,
        backtrack_mem: bool,
        target: &Node,
        options: OptionFlags,
    ) -> Result<(), CompileError> {
        match kind {
            EffectKind::Memory => {
                self.push_instruction(if backtrack_mem {
                    Instruction::MemoryStartPush(regnum)
                } else {
                    Instruction::MemoryStart(regnum)
                })?;
                self.gen_expr(target, options)?;
                self.push_instruction(if backtrack_mem {
                    Instruction::MemoryEndPush(regnum)
                } else {
                    Instruction::MemoryEnd(regnum)
                })?;
            }
            EffectKind::StopBacktrack => {
                self.push_instruction(Instruction::PushStopBt)?;
                self.gen_expr(target, options)?;
                self.push_instruction(Instruction::PopStopBt)?;
            }
            EffectKind::PrecRead => {
                self.push_instruction(Instruction::PushPos)?;
                self.gen_expr(target, options)?;
                self.push_instruction(Instruction::PopPos)?;
            }
            EffectKind::PrecReadNot => {
                let tlen = self.compiled_length(target, options)?;
                self.push_instruction(Instruction::PushPosNot(to_rel(tlen + 1)?))?;
                self.gen_expr(target, options)?;
                self.push_instruction(Instruction::FailPos)?;
            }
            EffectKind::LookBehind => {
                let len = char_length(target, self.enc)
                    .map_err(|_| CompileError::InvalidLookBehindPattern)?;
                self.push_instruction(Instruction::LookBehind(len))?;
                self.gen_expr(target, options)?;
            }
            EffectKind::LookBehindNot => {
                let len = char_length(target, self.enc)
                    .map_err(|_| CompileError::InvalidLookBehindPattern)?;
                let tlen = self.compiled_length(target, options)?;
                self.push_instruction(Instruction::PushLookBehindNot {
                    addr: to_rel(tlen + 1)?,
                    len,
                })?;
                self.gen_expr(target, options)?;
                self.push_instruction(Instruction::FailLookBehindNot)?;
            }
        }
        Ok(())
    }

    fn gen_times(&mut self, target: &Node, n: usize, options: OptionFlags) -> Result<(), CompileError> {
        for _ in 0..n {
            self.gen_expr(target, options)?;
        }
        Ok(())
    }

    /// Emits the target wrapped in null-check instructions when it may
    /// match the empty string.
    fn gen_with_empty_check(
        &mut self,
        target: &Node,
        empty: TargetEmpty,
        options: OptionFlags,
    ) -> Result<(), CompileError> {
        if empty == TargetEmpty::NotEmpty {
            return self.gen_expr(target, options);
        }
        let id = self.num_null_check;
        self.num_null_check += 1;
        let memst = empty == TargetEmpty::MayBeEmptyMem;
        self.push_instruction(Instruction::NullCheckStart { id, memst })?;
        self.gen_expr(target, options)?;
        self.push_instruction(if memst {
            Instruction::NullCheckEndMemst(id)
        } else {
            Instruction::NullCheckEnd(id)
        })?;
        Ok(())
    }

    fn gen_qualifier(&mut self, q: &Qualifier, options: OptionFlags) -> Result<(), CompileError> {
        let tlen = self.compiled_length(&q.target, options)?;
        if tlen == 0 || q.upper == Some(0) {
            return Ok(());
        }
        let lower = q.lower as usize;

        if is_anychar_star(q) {
            self.gen_times(&q.target, lower, options)?;
            let ml = options.contains(OptionFlags::MULTILINE);
            let inst = match (q.next_head_exact, ml) {
                (Some(b), true) => Instruction::AnyCharMlStarPeekNext(b),
                (Some(b), false) => Instruction::AnyCharStarPeekNext(b),
                (None, true) => Instruction::AnyCharMlStar,
                (None, false) => Instruction::AnyCharStar,
            };
            self.push_instruction(inst)?;
            return Ok(());
        }

        let mod_tlen = tlen + empty_check_length(q.target_empty);
        match q.upper {
            None if lower <= 1 || tlen.saturating_mul(lower) <= QUALIFIER_EXPAND_LIMIT => {
                if lower == 1 && tlen > QUALIFIER_EXPAND_LIMIT {
                    // 1 回目は分岐命令を飛ばして本体へ入る
                    self.push_instruction(Instruction::Jump(1))?;
                } else {
                    self.gen_times(&q.target, lower, options)?;
                }

                if q.greedy {
                    let skip = to_rel(mod_tlen + 1)?;
                    let push = match (q.head_exact, q.next_head_exact) {
                        (Some(b), _) => Instruction::PushOrJumpExact1(skip, b),
                        (None, Some(b)) => Instruction::PushIfPeekNext(skip, b),
                        (None, None) => Instruction::Push(skip),
                    };
                    self.push_instruction(push)?;
                    self.gen_with_empty_check(&q.target, q.target_empty, options)?;
                    self.push_instruction(Instruction::Jump(-to_rel(mod_tlen + 2)?))?;
                } else {
                    self.push_instruction(Instruction::Jump(to_rel(mod_tlen)?))?;
                    self.gen_with_empty_check(&q.target, q.target_empty, options)?;
                    self.push_instruction(Instruction::Push(-to_rel(mod_tlen + 1)?))?;
                }
            }
            Some(upper)
                if q.greedy
                    && (upper == 1
                        || (tlen + 1).saturating_mul(upper as usize) <= QUALIFIER_EXPAND_LIMIT) =>
            {
                self.gen_times(&q.target, lower, options)?;
                let n = upper.saturating_sub(q.lower) as usize;
                for i in 0..n {
                    let rest = n - i;
                    let skip = rest * tlen + (rest - 1);
                    self.push_instruction(Instruction::Push(to_rel(skip)?))?;
                    self.gen_expr(&q.target, options)?;
                }
            }
            Some(1) if !q.greedy && q.lower == 0 => {
                self.push_instruction(Instruction::Push(1))?;
                self.push_instruction(Instruction::Jump(to_rel(tlen)?))?;
                self.gen_expr(&q.target, options)?;
            }
            _ => {
                let id = self.repeat_range.len();
                self.repeat_range.push((q.lower, q.upper));
                let addr = to_rel(mod_tlen + 1)?;
                self.push_instruction(if q.greedy {
                    Instruction::Repeat { id, addr }
                } else {
                    Instruction::RepeatNg { id, addr }
                })?;
                self.gen_with_empty_check(&q.target, q.target_empty, options)?;
                self.push_instruction(if q.greedy {
                    Instruction::RepeatInc(id)
                } else {
                    Instruction::RepeatIncNg(id)
                })?;
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<(Vec<Instruction>, Vec<(u32, Option<u32>)>, usize), CompileError> {
        self.push_instruction(Instruction::End)?;
        Ok((self.instructions, self.repeat_range, self.num_null_check))
    }
}

fn empty_check_length(empty: TargetEmpty) -> usize {
    match empty {
        TargetEmpty::NotEmpty => 0,
        TargetEmpty::MayBeEmpty | TargetEmpty::MayBeEmptyMem => 2,
    }
}

fn is_anychar_star(q: &Qualifier) -> bool {
    q.greedy && q.upper.is_none() && matches!(q.target, Node::AnyChar)
}

fn anchor_instruction(kind: AnchorKind, options: OptionFlags) -> Instruction {
    match kind {
        AnchorKind::BeginBuf => Instruction::BeginBuf,
        AnchorKind::EndBuf => Instruction::EndBuf,
        AnchorKind::SemiEndBuf => Instruction::SemiEndBuf,
        AnchorKind::BeginPosition => Instruction::BeginPosition,
        AnchorKind::BeginLine => Instruction::BeginLine {
            multiline: options.is_per_line(),
        },
        AnchorKind::EndLine => Instruction::EndLine {
            multiline: options.is_per_line(),
        },
        AnchorKind::WordBound => Instruction::WordBound,
        AnchorKind::NotWordBound => Instruction::NotWordBound,
        AnchorKind::WordBegin => Instruction::WordBegin,
        AnchorKind::WordEnd => Instruction::WordEnd,
    }
}

fn class_instruction(cc: &CharClass, enc: Encoding) -> Instruction {
    let ranges = if enc.is_single_byte() {
        Vec::new()
    } else {
        cc.ranges.clone()
    };
    match (cc.bs.is_empty() && !ranges.is_empty(), ranges.is_empty(), cc.negated) {
        (true, _, false) => Instruction::CClassMb(ranges),
        (true, _, true) => Instruction::CClassMbNot(ranges),
        (false, true, false) => Instruction::CClass(cc.bs),
        (false, true, true) => Instruction::CClassNot(cc.bs),
        (false, false, false) => Instruction::CClassMix(cc.bs, ranges),
        (false, false, true) => Instruction::CClassMixNot(cc.bs, ranges),
    }
}

/// Splits a literal into runs of equal character width and picks the
/// specialised exact-match instruction for each run.
pub fn string_instructions(
    bytes: &[u8],
    enc: Encoding,
    fold: Option<&CaseFoldTable>,
) -> Vec<Instruction> {
    let mut out = Vec::new();
    let mut p = 0;
    while p < bytes.len() {
        let width = enc.char_len_at(bytes, p).max(1);
        let start = p;
        while p < bytes.len() && enc.char_len_at(bytes, p).max(1) == width {
            p += width;
        }
        let run = &bytes[start..p.min(bytes.len())];
        out.push(exact_instruction(run, width, fold));
    }
    out
}

fn exact_instruction(run: &[u8], width: usize, fold: Option<&CaseFoldTable>) -> Instruction {
    if width == 1 {
        if let Some(table) = fold {
            return match run {
                [b] => Instruction::Exact1Ic(table.fold(*b)),
                _ => Instruction::ExactNIc(run.iter().map(|b| table.fold(*b)).collect()),
            };
        }
        return match *run {
            [a] => Instruction::Exact1(a),
            [a, b] => Instruction::Exact2([a, b]),
            [a, b, c] => Instruction::Exact3([a, b, c]),
            [a, b, c, d] => Instruction::Exact4([a, b, c, d]),
            [a, b, c, d, e] => Instruction::Exact5([a, b, c, d, e]),
            _ => Instruction::ExactN(run.to_vec()),
        };
    }
    match (width, run) {
        (2, &[a, b]) => Instruction::ExactMb2N1([a, b]),
        (2, &[a, b, c, d]) => Instruction::ExactMb2N2([a, b, c, d]),
        (2, &[a, b, c, d, e, f]) => Instruction::ExactMb2N3([a, b, c, d, e, f]),
        (2, _) => Instruction::ExactMb2N(run.to_vec()),
        (3, _) => Instruction::ExactMb3N(run.to_vec()),
        _ => Instruction::ExactMbN {
            len: width,
            bytes: run.to_vec(),
        },
    }
}

/// 構文木をコンパイルする
///
/// # 引数
///
/// * node - setup 済みの構文木
/// * num_mem - 捕獲グループの数
/// * options - パターン全体のオプション
/// * enc - 文字エンコーディング
/// * case_table - 大小文字の変換表
pub fn compile(
    node: &Node,
    num_mem: usize,
    options: OptionFlags,
    enc: Encoding,
    case_table: Option<&CaseFoldTable>,
) -> Result<Program, CompileError> {
    let mut compiler = Compiler::new(enc, case_table);
    let expected = compiler.compiled_length(node, options)?;
    compiler.gen_expr(node, options)?;
    if compiler.p_counter != expected {
        return Err(CompileError::UnexpectedCodeLength);
    }
    let (code, repeat_range, num_null_check) = compiler.finish()?;
    Ok(Program {
        code,
        enc,
        options,
        case_table: case_table.cloned().unwrap_or_default(),
        num_mem,
        repeat_range,
        num_null_check,
    })
}
