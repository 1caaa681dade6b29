//! 命令列を実行するバックトラック型の仮想マシン

use thiserror::Error;

use crate::{
    engine::{
        charclass::{contains_code_range, BitSet, CharClass},
        compiler::Program,
        encoding::Encoding,
        instruction::Instruction,
        safe_add,
        stack::{Captures, Frame, Marker, Stack},
    },
    options::{MatchLimits, OptionFlags},
};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EvalError {
    #[error("EvalError: StackBug")]
    StackBug,
    #[error("EvalError: UndefinedBytecode")]
    UndefinedBytecode,
    #[error("EvalError: UnexpectedBytecode")]
    UnexpectedBytecode,
    #[error("EvalError: StackLimitExceeded")]
    StackLimitExceeded,
    #[error("EvalError: RetryLimitExceeded")]
    RetryLimitExceeded,
    #[error("EvalError: InvalidPC")]
    InvalidPC,
    #[error("EvalError: InvalidArgument")]
    InvalidArgument,
}

/// 一回の検索で使う仮想マシンの状態
///
/// スタックとキャプチャは検索呼び出しごとに所有し、共有しない。
pub struct Matcher<'a> {
    prog: &'a Program,
    text: &'a [u8],
    search_start: usize,
    options: OptionFlags,
    limits: MatchLimits,
    stack: Stack,
    best: Option<(usize, Captures)>,
}

enum Step {
    Next,
    Fail,
}

fn jump_target(next: usize, addr: i32) -> Result<usize, EvalError> {
    next.checked_add_signed(addr as isize)
        .ok_or(EvalError::InvalidPC)
}

fn starts_with_at(text: &[u8], s: usize, bytes: &[u8]) -> bool {
    text.get(s..).is_some_and(|rest| rest.starts_with(bytes))
}

/// Length of the character at `s` when it is in the class.
fn class_match(
    enc: Encoding,
    bs: Option<&BitSet>,
    ranges: &[(u32, u32)],
    negated: bool,
    text: &[u8],
    s: usize,
) -> Option<usize> {
    let len = enc.char_len_at(text, s);
    if len == 0 {
        return None;
    }
    let code = enc.mbc_to_code(&text[s..s + len]);
    let member = if CharClass::is_single_byte_code(enc, code) {
        bs.is_some_and(|bs| bs.contains(code as u8))
    } else {
        contains_code_range(ranges, code)
    };
    (member != negated).then_some(len)
}

impl<'a> Matcher<'a> {
    pub fn new(
        prog: &'a Program,
        text: &'a [u8],
        search_start: usize,
        options: OptionFlags,
        limits: MatchLimits,
    ) -> Self {
        Matcher {
            prog,
            text,
            search_start,
            options: prog.options | options,
            limits,
            stack: Stack::new(limits.stack_limit),
            best: None,
        }
    }

    fn is_word_before(&self, s: usize) -> bool {
        match self.prog.enc.prev_char_head(self.text, 0, s) {
            Some(p) => self.prog.enc.is_word_at(self.text, p),
            None => false,
        }
    }

    fn is_word_at(&self, s: usize) -> bool {
        self.prog.enc.is_word_at(self.text, s)
    }

    fn backref_matches(&self, caps: &Captures, n: usize, s: usize, ic: bool) -> Option<usize> {
        let (beg, end) = match (caps.beg.get(n), caps.end.get(n)) {
            (Some(Some(b)), Some(Some(e))) if b <= e => (*b, *e),
            _ => return None,
        };
        let sub = &self.text[beg..end];
        let len = sub.len();
        let target = self.text.get(s..s.checked_add(len)?)?;
        if !ic {
            return (sub == target).then_some(len);
        }
        let table = &self.prog.case_table;
        let mut i = 0;
        while i < len {
            let w = self.prog.enc.char_len_at(sub, i).max(1);
            if w == 1 {
                if table.fold(sub[i]) != table.fold(target[i]) {
                    return None;
                }
            } else if sub[i..i + w] != target[i..i + w] {
                return None;
            }
            i += w;
        }
        Some(len)
    }

    fn retry(&self, count: &mut usize) -> Result<(), EvalError> {
        safe_add(count, &1, || EvalError::RetryLimitExceeded)?;
        match self.limits.retry_limit {
            Some(limit) if *count > limit => Err(EvalError::RetryLimitExceeded),
            _ => Ok(()),
        }
    }

    /// `at` から始まるマッチを試す
    ///
    /// # 引数
    ///
    /// * at -> マッチの開始位置
    /// * caps -> キャプチャの格納先。成功時はグループ 0 にマッチ全体が入る。
    ///
    /// # 返り値
    ///
    /// * マッチした場合はマッチの長さを返す。
    /// * マッチしなかった場合は None を返す。
    pub fn match_at(&mut self, at: usize, caps: &mut Captures) -> Result<Option<usize>, EvalError> {
        if at > self.text.len() {
            return Err(EvalError::InvalidArgument);
        }
        self.stack.clear();
        self.best = None;
        caps.clear();

        let prog = self.prog;
        let code = &prog.code;
        let enc = prog.enc;
        let end = self.text.len();
        let text = self.text;
        let mut retries = 0usize;
        let mut pc = 0usize;
        let mut s = at;

        loop {
            let inst = code.get(pc).ok_or(EvalError::InvalidPC)?;
            let next = pc + 1;
            let mut step = Step::Next;

            match inst {
                Instruction::End => {
                    let len = s - at;
                    if self.options.contains(OptionFlags::FIND_NOT_EMPTY) && len == 0 {
                        step = Step::Fail;
                    } else if self.options.contains(OptionFlags::FIND_LONGEST) {
                        if self.best.as_ref().map_or(true, |(best, _)| len > *best) {
                            let mut snapshot = caps.clone();
                            snapshot.beg[0] = Some(at);
                            snapshot.end[0] = Some(s);
                            self.best = Some((len, snapshot));
                        }
                        step = Step::Fail;
                    } else {
                        caps.beg[0] = Some(at);
                        caps.end[0] = Some(s);
                        return Ok(Some(len));
                    }
                }

                Instruction::Exact1(_)
                | Instruction::Exact2(_)
                | Instruction::Exact3(_)
                | Instruction::Exact4(_)
                | Instruction::Exact5(_)
                | Instruction::ExactN(_)
                | Instruction::ExactMb2N1(_)
                | Instruction::ExactMb2N2(_)
                | Instruction::ExactMb2N3(_)
                | Instruction::ExactMb2N(_)
                | Instruction::ExactMb3N(_)
                | Instruction::ExactMbN { .. } => {
                    let bytes = inst.exact_bytes().ok_or(EvalError::UndefinedBytecode)?;
                    if starts_with_at(text, s, bytes) {
                        s += bytes.len();
                    } else {
                        step = Step::Fail;
                    }
                }
                Instruction::Exact1Ic(b) => match text.get(s) {
                    Some(c) if prog.case_table.fold(*c) == *b => s += 1,
                    _ => step = Step::Fail,
                },
                Instruction::ExactNIc(bytes) => {
                    let table = &prog.case_table;
                    let folded_eq = |window: &[u8]| {
                        window.iter().zip(bytes).all(|(c, b)| table.fold(*c) == *b)
                    };
                    match text.get(s..s + bytes.len()) {
                        Some(window) if folded_eq(window) => s += bytes.len(),
                        _ => step = Step::Fail,
                    }
                }

                Instruction::CClass(bs) | Instruction::CClassNot(bs) => {
                    let negated = matches!(inst, Instruction::CClassNot(_));
                    match class_match(enc, Some(bs), &[], negated, text, s) {
                        Some(len) => s += len,
                        None => step = Step::Fail,
                    }
                }
                Instruction::CClassMb(ranges) | Instruction::CClassMbNot(ranges) => {
                    let negated = matches!(inst, Instruction::CClassMbNot(_));
                    match class_match(enc, None, ranges, negated, text, s) {
                        Some(len) => s += len,
                        None => step = Step::Fail,
                    }
                }
                Instruction::CClassMix(bs, ranges) | Instruction::CClassMixNot(bs, ranges) => {
                    let negated = matches!(inst, Instruction::CClassMixNot(..));
                    match class_match(enc, Some(bs), ranges, negated, text, s) {
                        Some(len) => s += len,
                        None => step = Step::Fail,
                    }
                }

                Instruction::AnyChar | Instruction::AnyCharMl => {
                    let len = enc.char_len_at(text, s);
                    if len == 0 || (text[s] == b'\n' && matches!(inst, Instruction::AnyChar)) {
                        step = Step::Fail;
                    } else {
                        s += len;
                    }
                }
                Instruction::AnyCharStar
                | Instruction::AnyCharMlStar
                | Instruction::AnyCharStarPeekNext(_)
                | Instruction::AnyCharMlStarPeekNext(_) => {
                    let ml = matches!(
                        inst,
                        Instruction::AnyCharMlStar | Instruction::AnyCharMlStarPeekNext(_)
                    );
                    let peek = match inst {
                        Instruction::AnyCharStarPeekNext(b)
                        | Instruction::AnyCharMlStarPeekNext(b) => Some(*b),
                        _ => None,
                    };
                    while s < end {
                        if peek.map_or(true, |b| text[s] == b) {
                            self.stack.push_alt(next, s)?;
                        }
                        if !ml && text[s] == b'\n' {
                            step = Step::Fail;
                            break;
                        }
                        s += enc.char_len_at(text, s).max(1);
                    }
                }

                Instruction::Word | Instruction::NotWord => {
                    let want = matches!(inst, Instruction::Word);
                    if s < end && self.is_word_at(s) == want {
                        s += enc.char_len_at(text, s);
                    } else {
                        step = Step::Fail;
                    }
                }
                Instruction::WordBound => {
                    if self.is_word_before(s) == self.is_word_at(s) {
                        step = Step::Fail;
                    }
                }
                Instruction::NotWordBound => {
                    if self.is_word_before(s) != self.is_word_at(s) {
                        step = Step::Fail;
                    }
                }
                Instruction::WordBegin => {
                    if !(self.is_word_at(s) && !self.is_word_before(s)) {
                        step = Step::Fail;
                    }
                }
                Instruction::WordEnd => {
                    if !(self.is_word_before(s) && !self.is_word_at(s)) {
                        step = Step::Fail;
                    }
                }

                Instruction::BeginBuf => {
                    if s != 0 {
                        step = Step::Fail;
                    }
                }
                Instruction::EndBuf => {
                    if s != end {
                        step = Step::Fail;
                    }
                }
                Instruction::SemiEndBuf => {
                    let ok = if s == end {
                        !self.options.contains(OptionFlags::NOTEOL)
                    } else {
                        s + 1 == end && text[s] == b'\n'
                    };
                    if !ok {
                        step = Step::Fail;
                    }
                }
                Instruction::BeginPosition => {
                    if s != self.search_start {
                        step = Step::Fail;
                    }
                }
                Instruction::BeginLine { multiline } => {
                    let ok = if s == 0 {
                        !self.options.contains(OptionFlags::NOTBOL)
                    } else {
                        *multiline && text[s - 1] == b'\n' && s != end
                    };
                    if !ok {
                        step = Step::Fail;
                    }
                }
                Instruction::EndLine { multiline } => {
                    let ok = if s == end {
                        !self.options.contains(OptionFlags::NOTEOL)
                    } else {
                        *multiline && text[s] == b'\n'
                    };
                    if !ok {
                        step = Step::Fail;
                    }
                }

                Instruction::BackrefN(n) | Instruction::BackrefNIc(n) => {
                    let ic = matches!(inst, Instruction::BackrefNIc(_));
                    match self.backref_matches(caps, *n, s, ic) {
                        Some(len) => s += len,
                        None => step = Step::Fail,
                    }
                }

                Instruction::MemoryStart(n) => {
                    *caps.beg.get_mut(*n).ok_or(EvalError::UndefinedBytecode)? = Some(s);
                }
                Instruction::MemoryStartPush(n) => {
                    let n = *n;
                    let prior_beg = *caps.beg.get(n).ok_or(EvalError::UndefinedBytecode)?;
                    let prior_end = caps.end[n];
                    self.stack.push(Frame::MemStart {
                        mem: n,
                        prior_beg,
                        prior_end,
                    })?;
                    caps.beg[n] = Some(s);
                    caps.end[n] = None;
                }
                Instruction::MemoryEnd(n) => {
                    *caps.end.get_mut(*n).ok_or(EvalError::UndefinedBytecode)? = Some(s);
                }
                Instruction::MemoryEndPush(n) => {
                    let n = *n;
                    let prior_end = *caps.end.get(n).ok_or(EvalError::UndefinedBytecode)?;
                    self.stack.push(Frame::MemEnd { mem: n, prior_end })?;
                    caps.end[n] = Some(s);
                }

                Instruction::Fail => step = Step::Fail,
                Instruction::Jump(addr) => {
                    pc = jump_target(next, *addr)?;
                    continue;
                }
                Instruction::Push(addr) => {
                    self.stack.push_alt(jump_target(next, *addr)?, s)?;
                }
                Instruction::PushOrJumpExact1(addr, b) => {
                    let target = jump_target(next, *addr)?;
                    if text.get(s) == Some(b) {
                        self.stack.push_alt(target, s)?;
                    } else {
                        pc = target;
                        continue;
                    }
                }
                Instruction::PushIfPeekNext(addr, b) => {
                    if text.get(s) == Some(b) {
                        self.stack.push_alt(jump_target(next, *addr)?, s)?;
                    }
                }

                Instruction::Repeat { id, addr } | Instruction::RepeatNg { id, addr } => {
                    let (lower, _) = *self
                        .prog
                        .repeat_range
                        .get(*id)
                        .ok_or(EvalError::UndefinedBytecode)?;
                    let exit = jump_target(next, *addr)?;
                    self.stack.push(Frame::Repeat {
                        id: *id,
                        pc: next,
                        count: 0,
                    })?;
                    if lower == 0 {
                        if matches!(inst, Instruction::Repeat { .. }) {
                            self.stack.push_alt(exit, s)?;
                        } else {
                            self.stack.push_alt(next, s)?;
                            pc = exit;
                            continue;
                        }
                    }
                }
                Instruction::RepeatInc(id) => {
                    let (lower, upper) = *self
                        .prog
                        .repeat_range
                        .get(*id)
                        .ok_or(EvalError::UndefinedBytecode)?;
                    let index = self.stack.find_repeat(*id).ok_or(EvalError::StackBug)?;
                    let count = self.stack.repeat_count_mut(index)?;
                    *count += 1;
                    let count = *count;
                    let body = self.stack.repeat_pc(index)?;
                    let mut target = next;
                    if upper.map_or(true, |u| count < u) {
                        if count >= lower {
                            self.stack.push_alt(next, s)?;
                        }
                        target = body;
                    }
                    self.stack.push(Frame::RepeatInc { repeat: index })?;
                    pc = target;
                    continue;
                }
                Instruction::RepeatIncNg(id) => {
                    let (lower, upper) = *self
                        .prog
                        .repeat_range
                        .get(*id)
                        .ok_or(EvalError::UndefinedBytecode)?;
                    let index = self.stack.find_repeat(*id).ok_or(EvalError::StackBug)?;
                    let count = self.stack.repeat_count_mut(index)?;
                    *count += 1;
                    let count = *count;
                    let body = self.stack.repeat_pc(index)?;
                    if upper.map_or(true, |u| count < u) {
                        self.stack.push(Frame::RepeatInc { repeat: index })?;
                        if count >= lower {
                            self.stack.push_alt(body, s)?;
                        } else {
                            pc = body;
                            continue;
                        }
                    } else if upper == Some(count) {
                        self.stack.push(Frame::RepeatInc { repeat: index })?;
                    }
                }

                Instruction::NullCheckStart { id, memst } => {
                    let snapshot = memst.then(|| Box::new(caps.clone()));
                    self.stack.push(Frame::NullCheckStart {
                        id: *id,
                        s,
                        snapshot,
                    })?;
                }
                Instruction::NullCheckEnd(id) | Instruction::NullCheckEndMemst(id) => {
                    let (start, snapshot) =
                        self.stack.find_null_check(*id).ok_or(EvalError::StackBug)?;
                    let empty = start == s
                        && match (inst, snapshot) {
                            (Instruction::NullCheckEndMemst(_), Some(snap)) => snap == &*caps,
                            _ => true,
                        };
                    if empty {
                        match code.get(next) {
                            Some(
                                Instruction::Jump(_)
                                | Instruction::Push(_)
                                | Instruction::RepeatInc(_)
                                | Instruction::RepeatIncNg(_),
                            ) => {
                                pc = next + 1;
                                continue;
                            }
                            _ => return Err(EvalError::UnexpectedBytecode),
                        }
                    }
                }

                Instruction::PushPos => self.stack.push(Frame::Pos { s })?,
                Instruction::PopPos => s = self.stack.void_to_pos()?,
                Instruction::PushPosNot(addr) => {
                    self.stack.push(Frame::PosNot {
                        pc: jump_target(next, *addr)?,
                        s,
                    })?;
                }
                Instruction::FailPos => {
                    self.stack.pop_until(Marker::PosNot, caps)?;
                    step = Step::Fail;
                }
                Instruction::PushStopBt => self.stack.push(Frame::StopBt)?,
                Instruction::PopStopBt => self.stack.void_to_stop_bt()?,
                Instruction::LookBehind(n) => match enc.step_back(text, 0, s, *n) {
                    Some(p) => s = p,
                    None => step = Step::Fail,
                },
                Instruction::PushLookBehindNot { addr, len } => {
                    let target = jump_target(next, *addr)?;
                    match enc.step_back(text, 0, s, *len) {
                        Some(p) => {
                            self.stack.push(Frame::LookBehindNot { pc: target, s })?;
                            s = p;
                        }
                        None => {
                            pc = target;
                            continue;
                        }
                    }
                }
                Instruction::FailLookBehindNot => {
                    self.stack.pop_until(Marker::LookBehindNot, caps)?;
                    step = Step::Fail;
                }
            }

            match step {
                Step::Next => pc = next,
                Step::Fail => match self.stack.pop_one(caps)? {
                    Some((resume_pc, resume_s)) => {
                        self.retry(&mut retries)?;
                        pc = resume_pc;
                        s = resume_s;
                    }
                    None => {
                        return Ok(self.best.take().map(|(len, best)| {
                            *caps = best;
                            len
                        }));
                    }
                },
            }
        }
    }
}
