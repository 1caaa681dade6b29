//! 検索範囲を走査してマッチの開始位置を探す
//!
//! アンカーの情報で候補の範囲を狭め、最適化情報 (リテラルまたは先頭バイトの集合)
//! があれば、それが現れる位置の周辺だけで仮想マシンを実行する。

use log::trace;

use crate::{
    engine::{
        compiler::Program,
        encoding::Encoding,
        evaluator::{EvalError, Matcher},
        optimize::Anchors,
        search_plan::{OptimizeMode, SearchPlan},
        stack::Captures,
    },
    options::{MatchLimits, OptionFlags},
};

fn right_adjust_char_head(enc: Encoding, text: &[u8], pos: usize) -> usize {
    let head = enc.left_adjust_char_head(text, 0, pos);
    if head < pos {
        head + enc.char_len_at(text, head).max(1)
    } else {
        pos
    }
}

fn next_char_head(enc: Encoding, text: &[u8], pos: usize) -> usize {
    pos + enc.char_len_at(text, pos).max(1)
}

/// Inclusive bounds on the match start after applying the anchors.
fn narrow_by_anchors(
    plan: &SearchPlan,
    text: &[u8],
    start: usize,
    mut lo: usize,
    mut hi: usize,
) -> Option<(usize, usize)> {
    let len = text.len();
    let anchor = plan.anchor;

    if anchor.contains(Anchors::BEGIN_POSITION) || anchor.contains(Anchors::ANYCHAR_STAR_ML) {
        lo = start;
        hi = start;
    }
    if anchor.contains(Anchors::BEGIN_BUF) {
        if lo > 0 {
            return None;
        }
        hi = 0;
    }
    if anchor.contains(Anchors::END_BUF) || anchor.contains(Anchors::SEMI_END_BUF) {
        let max_semi_end = len;
        let min_semi_end = if anchor.contains(Anchors::SEMI_END_BUF) && text.last() == Some(&b'\n')
        {
            len - 1
        } else {
            len
        };
        hi = hi.min(max_semi_end.checked_sub(plan.anchor_dmin)?);
        if let Some(dmax) = plan.anchor_dmax {
            lo = lo.max(min_semi_end.saturating_sub(dmax));
        }
    }
    hi = hi.min(len.checked_sub(plan.threshold_len)?);
    (lo <= hi).then_some((lo, hi))
}

struct Scan<'a> {
    matcher: Matcher<'a>,
    caps: Captures,
    enc: Encoding,
    text: &'a [u8],
    start: usize,
    longest: bool,
    line_heads_only: bool,
    found: Option<(usize, usize, Captures)>,
}

impl Scan<'_> {
    /// Tries one candidate; returns true when the scan can stop.
    fn try_at(&mut self, s: usize) -> Result<bool, EvalError> {
        if self.line_heads_only && s != self.start && self.text[s - 1] != b'\n' {
            return Ok(false);
        }
        let Some(len) = self.matcher.match_at(s, &mut self.caps)? else {
            return Ok(false);
        };
        if !self.longest {
            self.found = Some((s, len, self.caps.clone()));
            return Ok(true);
        }
        if self.found.as_ref().map_or(true, |(_, best, _)| len > *best) {
            self.found = Some((s, len, self.caps.clone()));
        }
        Ok(false)
    }

    fn forward_plain(&mut self, lo: usize, hi: usize) -> Result<(), EvalError> {
        let mut s = lo;
        while s <= hi {
            if self.try_at(s)? {
                return Ok(());
            }
            s = next_char_head(self.enc, self.text, s);
        }
        Ok(())
    }

    fn backward_plain(&mut self, lo: usize, hi: usize) -> Result<(), EvalError> {
        let mut s = self.enc.left_adjust_char_head(self.text, 0, hi);
        while s >= lo {
            if self.try_at(s)? {
                return Ok(());
            }
            match self.enc.prev_char_head(self.text, 0, s) {
                Some(p) => s = p,
                None => break,
            }
        }
        Ok(())
    }

    fn forward_optimized(
        &mut self,
        plan: &SearchPlan,
        prog: &Program,
        lo: usize,
        hi: usize,
    ) -> Result<(), EvalError> {
        let len = self.text.len();
        let mut s = lo;
        while s <= hi {
            let from = s + plan.dmin;
            let limit = plan.dmax.map_or(len, |d| hi.saturating_add(d).min(len));
            let Some(p) = plan.forward_find(self.text, from, limit, self.enc, &prog.case_table)
            else {
                break;
            };
            let low = match plan.dmax {
                Some(d) => p.saturating_sub(d).max(s),
                None => s,
            };
            let high = (p - plan.dmin).min(hi);
            trace!("key at {p}, trying starts {low}..={high}");

            let mut c = right_adjust_char_head(self.enc, self.text, low);
            while c <= high {
                if self.try_at(c)? {
                    return Ok(());
                }
                c = next_char_head(self.enc, self.text, c);
            }
            s = right_adjust_char_head(self.enc, self.text, high + 1).max(c);
        }
        Ok(())
    }

    fn backward_optimized(
        &mut self,
        plan: &SearchPlan,
        prog: &Program,
        lo: usize,
        hi: usize,
    ) -> Result<(), EvalError> {
        let len = self.text.len();
        let mut s = self.enc.left_adjust_char_head(self.text, 0, hi);
        while s >= lo {
            let from = plan.dmax.map_or(len, |d| s.saturating_add(d).min(len));
            let limit = lo + plan.dmin;
            let Some(p) = plan.backward_find(self.text, from, limit, self.enc, &prog.case_table)
            else {
                break;
            };
            let high = (p - plan.dmin).min(s);
            let low = match plan.dmax {
                Some(d) => p.saturating_sub(d).max(lo),
                None => lo,
            };
            trace!("key at {p}, trying starts {high}..={low} backward");

            let mut c = self.enc.left_adjust_char_head(self.text, 0, high);
            loop {
                if c < low {
                    break;
                }
                if self.try_at(c)? {
                    return Ok(());
                }
                match self.enc.prev_char_head(self.text, 0, c) {
                    Some(prev) => c = prev,
                    None => return Ok(()),
                }
            }
            s = c;
        }
        Ok(())
    }
}

/// 検索範囲からマッチを探す
///
/// # 引数
///
/// * prog -> コンパイル済みのプログラム
/// * plan -> 候補位置の絞り込み情報
/// * text -> 検索対象のバイト列
/// * start -> 検索開始位置
/// * range -> 検索の終端。`start` より小さい場合は後方に向かって探す。
/// * options -> 検索時のオプション
/// * limits -> 仮想マシンの制限値
///
/// # 返り値
///
/// * マッチした場合は開始位置とキャプチャを返す。
/// * マッチしなかった場合は None を返す。
pub fn search(
    prog: &Program,
    plan: &SearchPlan,
    text: &[u8],
    start: usize,
    range: usize,
    options: OptionFlags,
    limits: MatchLimits,
) -> Result<Option<(usize, Captures)>, EvalError> {
    let len = text.len();
    if start > len || range > len {
        return Err(EvalError::InvalidArgument);
    }
    let backward = range < start;
    let (lo, hi) = if backward { (range, start) } else { (start, range) };

    let Some((lo, hi)) = narrow_by_anchors(plan, text, start, lo, hi) else {
        trace!("no candidate start in {lo}..={hi} after anchors {:?}", plan.anchor);
        return Ok(None);
    };
    trace!(
        "searching {lo}..={hi} {} with {:?}",
        if backward { "backward" } else { "forward" },
        plan.mode
    );

    let all_options = prog.options | options;
    let mut scan = Scan {
        matcher: Matcher::new(prog, text, start, options, limits),
        caps: Captures::new(prog.num_mem),
        enc: prog.enc,
        text,
        start,
        longest: all_options.contains(OptionFlags::FIND_LONGEST),
        line_heads_only: !backward && plan.anchor.contains(Anchors::ANYCHAR_STAR),
        found: None,
    };

    let single = lo == hi;
    match (plan.mode, backward) {
        (OptimizeMode::None, false) => scan.forward_plain(lo, hi)?,
        (OptimizeMode::None, true) => scan.backward_plain(lo, hi)?,
        _ if single => scan.forward_plain(lo, hi)?,
        (_, false) => scan.forward_optimized(plan, prog, lo, hi)?,
        (_, true) => scan.backward_optimized(plan, prog, lo, hi)?,
    }

    Ok(scan.found.map(|(s, _, caps)| (s, caps)))
}
