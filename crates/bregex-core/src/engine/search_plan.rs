//! マッチ候補の開始位置を絞り込むための計画データ

use std::sync::OnceLock;

use crate::engine::{
    charclass::BitSet,
    encoding::{CaseFoldTable, Encoding},
    optimize::{Anchors, OptInfo},
};

/// Literals at least this long use Boyer-Moore.
const BM_MIN_LEN: usize = 3;
/// Shorter minimum when trail bytes cannot be mistaken for lead bytes.
const BM_MIN_LEN_DISTINGUISHABLE: usize = 2;

/// 候補位置の探し方
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeMode {
    None,
    Exact,
    ExactBm,
    ExactIc,
    Map,
}

#[derive(Debug, Clone)]
pub struct SearchPlan {
    pub mode: OptimizeMode,
    pub anchor: Anchors,
    pub anchor_dmin: usize,
    pub anchor_dmax: Option<usize>,
    pub threshold_len: usize,
    /// Literal key for the exact modes.
    pub exact: Vec<u8>,
    /// First-byte set for `Map` mode.
    pub map: BitSet,
    /// Distance from the match start to the key.
    pub dmin: usize,
    pub dmax: Option<usize>,
    bm_skip: Option<Box<[usize; 256]>>,
    bm_back_skip: OnceLock<Box<[usize; 256]>>,
}

impl SearchPlan {
    pub fn build(info: OptInfo, enc: Encoding) -> Self {
        let mut plan = SearchPlan {
            mode: OptimizeMode::None,
            anchor: info.anchor,
            anchor_dmin: info.anchor_dmin,
            anchor_dmax: info.anchor_dmax,
            threshold_len: info.threshold_len,
            exact: Vec::new(),
            map: BitSet::new(),
            dmin: 0,
            dmax: Some(0),
            bm_skip: None,
            bm_back_skip: OnceLock::new(),
        };

        if let Some(exact) = info.exact {
            plan.dmin = exact.mmd.min;
            plan.dmax = exact.mmd.max;
            let bm_min = if enc.is_lead_distinguishable() {
                BM_MIN_LEN_DISTINGUISHABLE
            } else {
                BM_MIN_LEN
            };
            plan.mode = if exact.ignore_case {
                OptimizeMode::ExactIc
            } else if exact.bytes.len() >= bm_min {
                plan.bm_skip = Some(forward_skip_table(&exact.bytes));
                OptimizeMode::ExactBm
            } else {
                OptimizeMode::Exact
            };
            plan.exact = exact.bytes;
        } else if let Some(map) = info.map {
            plan.mode = OptimizeMode::Map;
            plan.map = map.map;
        }
        plan
    }

    pub fn is_exact(&self) -> bool {
        matches!(
            self.mode,
            OptimizeMode::Exact | OptimizeMode::ExactBm | OptimizeMode::ExactIc
        )
    }

    /// First key position `p` with `from <= p <= limit`.
    ///
    /// Exact keys must fit in `text`. Map hits are only looked for on
    /// character heads, starting from `from`.
    pub fn forward_find(
        &self,
        text: &[u8],
        from: usize,
        limit: usize,
        enc: Encoding,
        table: &CaseFoldTable,
    ) -> Option<usize> {
        match self.mode {
            OptimizeMode::None => None,
            OptimizeMode::Exact => slow_search(&self.exact, text, from, limit),
            OptimizeMode::ExactIc => slow_search_ic(&self.exact, text, from, limit, table),
            OptimizeMode::ExactBm => match &self.bm_skip {
                Some(skip) => bm_search(&self.exact, skip, text, from, limit),
                None => slow_search(&self.exact, text, from, limit),
            },
            OptimizeMode::Map => map_search(&self.map, text, from, limit, enc),
        }
    }

    /// Last key position `p` with `limit <= p <= from`.
    pub fn backward_find(
        &self,
        text: &[u8],
        from: usize,
        limit: usize,
        enc: Encoding,
        table: &CaseFoldTable,
    ) -> Option<usize> {
        match self.mode {
            OptimizeMode::None => None,
            OptimizeMode::Exact => slow_search_backward(&self.exact, text, from, limit),
            OptimizeMode::ExactIc => {
                slow_search_backward_ic(&self.exact, text, from, limit, table)
            }
            OptimizeMode::ExactBm => {
                let skip = self
                    .bm_back_skip
                    .get_or_init(|| backward_skip_table(&self.exact));
                bm_search_backward(&self.exact, skip, text, from, limit, enc)
            }
            OptimizeMode::Map => map_search_backward(&self.map, text, from, limit, enc),
        }
    }
}

fn forward_skip_table(target: &[u8]) -> Box<[usize; 256]> {
    let len = target.len();
    let mut skip = Box::new([len; 256]);
    for (i, b) in target.iter().enumerate().take(len - 1) {
        skip[*b as usize] = len - 1 - i;
    }
    skip
}

fn backward_skip_table(target: &[u8]) -> Box<[usize; 256]> {
    let len = target.len();
    let mut skip = Box::new([len; 256]);
    for i in (1..len).rev() {
        skip[target[i] as usize] = i;
    }
    skip
}

fn matches_at(target: &[u8], text: &[u8], p: usize) -> bool {
    text.get(p..p + target.len()) == Some(target)
}

fn matches_at_ic(target: &[u8], text: &[u8], p: usize, table: &CaseFoldTable) -> bool {
    match text.get(p..p + target.len()) {
        Some(window) => window
            .iter()
            .zip(target)
            .all(|(t, k)| table.fold(*t) == *k),
        None => false,
    }
}

/// 素朴な前方探索
pub fn slow_search(target: &[u8], text: &[u8], from: usize, limit: usize) -> Option<usize> {
    let last = text.len().checked_sub(target.len())?.min(limit);
    (from..=last).find(|&p| matches_at(target, text, p))
}

fn slow_search_ic(
    target: &[u8],
    text: &[u8],
    from: usize,
    limit: usize,
    table: &CaseFoldTable,
) -> Option<usize> {
    let last = text.len().checked_sub(target.len())?.min(limit);
    (from..=last).find(|&p| matches_at_ic(target, text, p, table))
}

/// Boyer-Moore (Horspool) 前方探索
pub fn bm_search(
    target: &[u8],
    skip: &[usize; 256],
    text: &[u8],
    from: usize,
    limit: usize,
) -> Option<usize> {
    let tail = target.len().checked_sub(1)?;
    let last = text.len().checked_sub(target.len())?.min(limit);
    let mut s = from.checked_add(tail)?;
    let end = last + tail;
    while s <= end {
        let mut p = tail;
        let mut t = s;
        while text[t] == target[p] {
            if p == 0 {
                return Some(t);
            }
            p -= 1;
            t -= 1;
        }
        s += skip[text[s] as usize];
    }
    None
}

fn slow_search_backward(target: &[u8], text: &[u8], from: usize, limit: usize) -> Option<usize> {
    let first = text.len().checked_sub(target.len())?.min(from);
    if first < limit {
        return None;
    }
    (limit..=first).rev().find(|&p| matches_at(target, text, p))
}

fn slow_search_backward_ic(
    target: &[u8],
    text: &[u8],
    from: usize,
    limit: usize,
    table: &CaseFoldTable,
) -> Option<usize> {
    let first = text.len().checked_sub(target.len())?.min(from);
    if first < limit {
        return None;
    }
    (limit..=first)
        .rev()
        .find(|&p| matches_at_ic(target, text, p, table))
}

fn bm_search_backward(
    target: &[u8],
    skip: &[usize; 256],
    text: &[u8],
    from: usize,
    limit: usize,
    enc: Encoding,
) -> Option<usize> {
    let mut s = text.len().checked_sub(target.len())?.min(from);
    while s >= limit {
        if matches_at(target, text, s) {
            return Some(s);
        }
        let step = skip[text[s] as usize];
        if step > s {
            return None;
        }
        s = enc.left_adjust_char_head(text, 0, s - step);
    }
    None
}

fn map_search(map: &BitSet, text: &[u8], from: usize, limit: usize, enc: Encoding) -> Option<usize> {
    let mut p = from;
    while p <= limit && p < text.len() {
        if map.contains(text[p]) {
            return Some(p);
        }
        p += enc.char_len_at(text, p).max(1);
    }
    None
}

fn map_search_backward(
    map: &BitSet,
    text: &[u8],
    from: usize,
    limit: usize,
    enc: Encoding,
) -> Option<usize> {
    let mut p = if from >= text.len() {
        enc.prev_char_head(text, 0, text.len())?
    } else {
        from
    };
    while p >= limit {
        if map.contains(text[p]) {
            return Some(p);
        }
        p = enc.prev_char_head(text, 0, p)?;
    }
    None
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        charclass::BitSet,
        encoding::{CaseFoldTable, Encoding},
        optimize::{ExactInfo, MapInfo, MinMax, OptInfo},
        search_plan::{
            bm_search, forward_skip_table, slow_search, OptimizeMode, SearchPlan,
        },
    };

    fn exact_plan(key: &[u8], ignore_case: bool, enc: Encoding) -> SearchPlan {
        SearchPlan::build(
            OptInfo {
                exact: Some(ExactInfo {
                    mmd: MinMax::ZERO,
                    bytes: key.to_vec(),
                    ignore_case,
                    reach_end: true,
                }),
                ..OptInfo::default()
            },
            enc,
        )
    }

    #[test]
    fn test_build_modes() {
        assert_eq!(
            exact_plan(b"abc", false, Encoding::Ascii).mode,
            OptimizeMode::ExactBm
        );
        assert_eq!(
            exact_plan(b"ab", false, Encoding::Utf8).mode,
            OptimizeMode::ExactBm
        );
        assert_eq!(
            exact_plan(b"ab", false, Encoding::Sjis).mode,
            OptimizeMode::Exact
        );
        assert_eq!(
            exact_plan(b"abc", true, Encoding::Ascii).mode,
            OptimizeMode::ExactIc
        );

        let mut map = BitSet::new();
        map.set(b'x');
        let plan = SearchPlan::build(
            OptInfo {
                map: Some(MapInfo { map, value: 2 }),
                ..OptInfo::default()
            },
            Encoding::Ascii,
        );
        assert_eq!(plan.mode, OptimizeMode::Map);
        assert_eq!(
            plan.forward_find(b"abcx", 0, 4, Encoding::Ascii, &CaseFoldTable::ascii()),
            Some(3)
        );
        assert_eq!(
            plan.backward_find(b"xbcx", 2, 0, Encoding::Ascii, &CaseFoldTable::ascii()),
            Some(0)
        );
    }

    #[test]
    fn test_bm_agrees_with_slow_search() {
        let texts: [&[u8]; 6] = [
            b"",
            b"ab",
            b"abcabcabd",
            b"xxabdabcabdyy",
            b"abdabdabdabd",
            b"aaaaaaaaaaaaaaabd",
        ];
        for key in [&b"abd"[..], b"aab", b"bda", b"dddd"] {
            let skip = forward_skip_table(key);
            for text in texts {
                for from in 0..=text.len() {
                    assert_eq!(
                        bm_search(key, &skip, text, from, text.len()),
                        slow_search(key, text, from, text.len()),
                        "key {key:?} text {text:?} from {from}"
                    );
                }
            }
        }
    }

    #[test]
    fn test_limit_is_inclusive() {
        let plan = exact_plan(b"abc", false, Encoding::Ascii);
        let table = CaseFoldTable::ascii();
        assert_eq!(plan.forward_find(b"xxabc", 0, 2, Encoding::Ascii, &table), Some(2));
        assert_eq!(plan.forward_find(b"xxabc", 0, 1, Encoding::Ascii, &table), None);
    }

    #[test]
    fn test_backward_find() {
        let plan = exact_plan(b"abc", false, Encoding::Ascii);
        let table = CaseFoldTable::ascii();
        let text = b"abc__abc__";
        assert_eq!(plan.backward_find(text, 10, 0, Encoding::Ascii, &table), Some(5));
        assert_eq!(plan.backward_find(text, 4, 0, Encoding::Ascii, &table), Some(0));
        assert_eq!(plan.backward_find(text, 4, 1, Encoding::Ascii, &table), None);
        // 二度目の呼び出しは構築済みの表を使う
        assert_eq!(plan.backward_find(text, 10, 0, Encoding::Ascii, &table), Some(5));
    }

    #[test]
    fn test_ignore_case_find() {
        let plan = exact_plan(b"abc", true, Encoding::Ascii);
        let table = CaseFoldTable::ascii();
        assert_eq!(plan.forward_find(b"xAbC", 0, 4, Encoding::Ascii, &table), Some(1));
        assert_eq!(plan.backward_find(b"ABCabc", 6, 0, Encoding::Ascii, &table), Some(3));
    }
}
