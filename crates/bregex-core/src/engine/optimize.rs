//! Static analysis of the tree used to speed up `search`.
//!
//! Two facts are gathered for every node, each tagged with the distance
//! interval from the start of the match: the best literal that every match
//! contains, and the set of bytes a match can start with. Anchors that pin
//! the match to the buffer edges are collected alongside.

use std::ops::{BitAnd, BitOr, BitOrAssign};

use crate::{
    engine::{
        ast::{AnchorKind, CTypeKind, EffectKind, Node},
        charclass::BitSet,
        encoding::{CaseFoldTable, Encoding},
    },
    options::OptionFlags,
};

/// Longest literal kept as a search key.
const OPT_EXACT_MAXLEN: usize = 24;
/// Literals shorter than this are compared against the byte map.
const LEN_FOR_MAP_EVAL: usize = 2;
/// Literals whose distance range is wider than this are compared against
/// the byte map.
const DMAX_FOR_MAP_EVAL: usize = 4;
/// Map value accepted in place of a dispersed literal.
const MAP_VALUE_GOOD: usize = 4;
/// Map value accepted in place of a short literal.
const MAP_VALUE_FAIR: usize = 9;

/// 探索位置を限定するアンカーの集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Anchors(u8);

impl Anchors {
    pub const NONE: Anchors = Anchors(0);
    pub const BEGIN_BUF: Anchors = Anchors(1 << 0);
    pub const BEGIN_POSITION: Anchors = Anchors(1 << 1);
    pub const END_BUF: Anchors = Anchors(1 << 2);
    pub const SEMI_END_BUF: Anchors = Anchors(1 << 3);
    pub const ANYCHAR_STAR: Anchors = Anchors(1 << 4);
    pub const ANYCHAR_STAR_ML: Anchors = Anchors(1 << 5);

    const LEFT: Anchors = Anchors(0b11_0011);
    const RIGHT: Anchors = Anchors(0b00_1100);

    pub fn contains(self, other: Anchors) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Anchors {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Anchors(self.0 | rhs.0)
    }
}

impl BitOrAssign for Anchors {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Anchors {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Anchors(self.0 & rhs.0)
    }
}

/// Distance interval in bytes. `max == None` is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MinMax {
    pub min: usize,
    pub max: Option<usize>,
}

impl Default for MinMax {
    fn default() -> Self {
        MinMax::ZERO
    }
}

impl MinMax {
    pub const ZERO: MinMax = MinMax {
        min: 0,
        max: Some(0),
    };

    pub fn fixed(n: usize) -> Self {
        MinMax {
            min: n,
            max: Some(n),
        }
    }

    pub fn add(self, other: MinMax) -> MinMax {
        MinMax {
            min: self.min.saturating_add(other.min),
            max: match (self.max, other.max) {
                (Some(a), Some(b)) => a.checked_add(b),
                _ => None,
            },
        }
    }

    /// Interval covering either operand.
    pub fn alt(self, other: MinMax) -> MinMax {
        MinMax {
            min: self.min.min(other.min),
            max: match (self.max, other.max) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            },
        }
    }

    pub fn times(self, lower: u32, upper: Option<u32>) -> MinMax {
        MinMax {
            min: self.min.saturating_mul(lower as usize),
            max: match (self.max, upper) {
                (Some(0), _) | (_, Some(0)) => Some(0),
                (Some(m), Some(u)) => m.checked_mul(u as usize),
                _ => None,
            },
        }
    }

    pub fn is_zero_width(&self) -> bool {
        self.max == Some(0)
    }

    pub fn width(&self) -> Option<usize> {
        self.max.map(|m| m - self.min)
    }
}

/// A literal every match contains, `mmd` bytes after the match start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExactInfo {
    pub mmd: MinMax,
    /// Folded through the case table when `ignore_case` is set.
    pub bytes: Vec<u8>,
    pub ignore_case: bool,
    /// The literal spans its whole node.
    pub reach_end: bool,
}

impl ExactInfo {
    fn shifted(mut self, by: MinMax) -> Self {
        self.mmd = by.add(self.mmd);
        self
    }

    fn concat(mut self, next: &ExactInfo, enc: Encoding) -> Self {
        self.bytes.extend_from_slice(&next.bytes);
        self.reach_end = next.reach_end;
        self.clip(OPT_EXACT_MAXLEN, enc)
    }

    /// Cuts the literal to at most `limit` bytes on a character boundary.
    fn clip(mut self, limit: usize, enc: Encoding) -> Self {
        let mut cut = 0;
        while cut < self.bytes.len() {
            let step = enc.mbc_len(self.bytes[cut]);
            if cut + step > limit.min(self.bytes.len()) {
                break;
            }
            cut += step;
        }
        if cut < self.bytes.len() {
            self.bytes.truncate(cut);
            self.reach_end = false;
        }
        self
    }

    fn value(&self) -> usize {
        let weight = if self.ignore_case { 1 } else { 2 };
        self.bytes.len() * weight * distance_value(&self.mmd)
    }
}

/// Bytes a match can start with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapInfo {
    pub map: BitSet,
    /// Lower is more selective.
    pub value: usize,
}

impl MapInfo {
    fn new(map: BitSet) -> Self {
        let value = map.iter().map(map_position_value).sum();
        MapInfo { map, value }
    }
}

fn map_position_value(b: u8) -> usize {
    match b {
        b' ' | b'\t' => 1,
        _ => 2,
    }
}

/// Closeness of the interval ends; unbounded intervals score zero.
fn distance_value(mmd: &MinMax) -> usize {
    match mmd.width() {
        None => 0,
        Some(d) if d < 100 => 1000 / (d + 1),
        Some(_) => 1,
    }
}

fn select_exact(current: Option<ExactInfo>, candidate: Option<ExactInfo>) -> Option<ExactInfo> {
    match (current, candidate) {
        (None, c) => c.filter(|e| !e.bytes.is_empty()),
        (Some(cur), None) => Some(cur),
        (Some(cur), Some(cand)) => {
            if cand.bytes.is_empty() {
                return Some(cur);
            }
            let (v1, v2) = (cur.value(), cand.value());
            if v2 > v1 || (v2 == v1 && cand.mmd.min < cur.mmd.min) {
                Some(cand)
            } else {
                Some(cur)
            }
        }
    }
}

/// 探索の最適化情報
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OptInfo {
    pub anchor: Anchors,
    /// Match length range, used with the end anchors.
    pub anchor_dmin: usize,
    pub anchor_dmax: Option<usize>,
    /// Shortest possible match.
    pub threshold_len: usize,
    pub exact: Option<ExactInfo>,
    pub map: Option<MapInfo>,
}

#[derive(Debug, Clone, Default)]
struct NodeInfo {
    len: MinMax,
    anc_left: Anchors,
    anc_right: Anchors,
    /// Literal starting at the node start.
    exb: Option<ExactInfo>,
    /// Best literal anywhere in the node.
    exm: Option<ExactInfo>,
    /// Literal ending at the node end.
    exe: Option<ExactInfo>,
    /// First-byte map at the node start.
    map: Option<MapInfo>,
}

struct OptEnv<'a> {
    enc: Encoding,
    case_table: Option<&'a CaseFoldTable>,
}

impl OptEnv<'_> {
    fn char_len(&self) -> MinMax {
        MinMax {
            min: 1,
            max: Some(self.enc.max_len()),
        }
    }
}

fn opt_string(bytes: &[u8], ignore_case: bool, env: &OptEnv) -> NodeInfo {
    let mut info = NodeInfo {
        len: MinMax::fixed(bytes.len()),
        ..NodeInfo::default()
    };
    let Some(&first) = bytes.first() else {
        return info;
    };
    let table = match (ignore_case, env.case_table) {
        (true, Some(table)) => Some(table),
        (true, None) => return info,
        (false, _) => None,
    };
    if table.is_some() && bytes.iter().any(|b| env.enc.mbc_len(*b) > 1) {
        return info;
    }

    let lit = match table {
        Some(table) => bytes.iter().map(|b| table.fold(*b)).collect(),
        None => bytes.to_vec(),
    };
    let ex = ExactInfo {
        mmd: MinMax::ZERO,
        bytes: lit,
        ignore_case: table.is_some(),
        reach_end: true,
    }
    .clip(OPT_EXACT_MAXLEN, env.enc);
    info.exb = Some(ex.clone());
    info.exm = Some(ex.clone());
    info.exe = Some(ex);

    let mut map = BitSet::new();
    map.set(first);
    if let Some(table) = table {
        for partner in table.partners(first) {
            map.set(partner);
        }
    }
    info.map = Some(MapInfo::new(map));
    info
}

/// A literal that stops growing: it may become the node's leading literal
/// and competes for the best one.
fn finish(lit: ExactInfo, info: &mut NodeInfo, best: &mut Option<ExactInfo>) {
    let lit = ExactInfo {
        reach_end: false,
        ..lit
    };
    if lit.mmd == MinMax::ZERO && info.exb.is_none() {
        info.exb = Some(lit.clone());
    }
    *best = select_exact(best.take(), Some(lit));
}

fn opt_list(nodes: &[Node], options: OptionFlags, env: &OptEnv) -> NodeInfo {
    let mut info = NodeInfo::default();
    let mut running: Option<ExactInfo> = None;
    let mut best: Option<ExactInfo> = None;
    let mut prefix_open = true;

    for node in nodes {
        let child = opt_node(node, options, env);
        let pos = info.len;

        if prefix_open {
            info.anc_left |= child.anc_left;
            if info.map.is_none() && pos.is_zero_width() {
                info.map = child.map.clone();
            }
        }
        if child.len.is_zero_width() {
            info.anc_right |= child.anc_right;
        } else {
            info.anc_right = child.anc_right;
            prefix_open = false;
        }

        best = select_exact(best, child.exm.clone().map(|e| e.shifted(pos)));
        if child.len.is_zero_width() && child.exb.is_none() {
            continue;
        }

        let child_exb = child.exb.map(|e| e.shifted(pos));
        let child_exe = child.exe.map(|e| e.shifted(pos));
        match (running.take(), child_exb) {
            (Some(r), Some(cb)) if r.ignore_case == cb.ignore_case => {
                let merged = r.concat(&cb, env.enc);
                if merged.reach_end {
                    running = Some(merged);
                } else {
                    finish(merged, &mut info, &mut best);
                    running = child_exe;
                }
            }
            (r, cb) => {
                if let Some(r) = r {
                    finish(r, &mut info, &mut best);
                }
                match cb {
                    Some(cb) if cb.reach_end => running = Some(cb),
                    Some(cb) => {
                        finish(cb, &mut info, &mut best);
                        running = child_exe;
                    }
                    None => running = child_exe,
                }
            }
        }
        info.len = info.len.add(child.len);
    }

    if let Some(r) = running {
        if r.mmd == MinMax::ZERO && info.exb.is_none() {
            info.exb = Some(r.clone());
        }
        best = select_exact(best, Some(r.clone()));
        info.exe = Some(r);
    }
    info.exm = best;
    info
}

fn opt_alt(nodes: &[Node], options: OptionFlags, env: &OptEnv) -> NodeInfo {
    let children: Vec<NodeInfo> = nodes.iter().map(|n| opt_node(n, options, env)).collect();
    let Some((first, rest)) = children.split_first() else {
        return NodeInfo::default();
    };

    let mut info = NodeInfo {
        len: first.len,
        anc_left: first.anc_left,
        anc_right: first.anc_right,
        exb: first.exb.clone(),
        exm: None,
        exe: None,
        map: first.map.clone(),
    };
    for child in rest {
        info.len = info.len.alt(child.len);
        info.anc_left = info.anc_left & child.anc_left;
        info.anc_right = info.anc_right & child.anc_right;
        info.exb = match (info.exb.take(), &child.exb) {
            (Some(a), Some(b)) if a.ignore_case == b.ignore_case => {
                let common = a
                    .bytes
                    .iter()
                    .zip(&b.bytes)
                    .take_while(|(x, y)| x == y)
                    .count();
                let same = a.bytes == b.bytes && a.reach_end && b.reach_end;
                let mut bytes = a.bytes;
                bytes.truncate(common);
                (!bytes.is_empty()).then_some(ExactInfo {
                    mmd: MinMax::ZERO,
                    bytes,
                    ignore_case: a.ignore_case,
                    reach_end: same,
                })
            }
            _ => None,
        };
        info.map = match (info.map.take(), &child.map) {
            (Some(a), Some(b)) => {
                let mut map = a.map;
                map.union_with(&b.map);
                Some(MapInfo::new(map))
            }
            _ => None,
        };
    }
    // 共通接頭辞は多バイト文字の途中で切れうる
    info.exb = info
        .exb
        .take()
        .map(|e| {
            let len = e.bytes.len();
            e.clip(len, env.enc)
        })
        .filter(|e| !e.bytes.is_empty());
    info.exm = info.exb.clone();
    if info.exb.as_ref().is_some_and(|e| e.reach_end) {
        info.exe = info.exb.clone();
    }
    info
}

fn opt_node(node: &Node, options: OptionFlags, env: &OptEnv) -> NodeInfo {
    match node {
        Node::Empty => NodeInfo::default(),
        Node::List(nodes) => opt_list(nodes, options, env),
        Node::Alt(nodes) => opt_alt(nodes, options, env),
        Node::String(bytes) => {
            opt_string(bytes, options.contains(OptionFlags::IGNORECASE), env)
        }
        Node::StringRaw(bytes) => opt_string(bytes, false, env),
        Node::CharClass(cc) => NodeInfo {
            len: env.char_len(),
            map: Some(MapInfo::new(cc.lead_bytes(env.enc))),
            ..NodeInfo::default()
        },
        Node::CType(kind) => {
            let want = *kind == CTypeKind::Word;
            let mut map = BitSet::new();
            for b in 0..=255u8 {
                if env.enc.is_word_at(&[b], 0) == want {
                    map.set(b);
                }
            }
            NodeInfo {
                len: env.char_len(),
                map: Some(MapInfo::new(map)),
                ..NodeInfo::default()
            }
        }
        Node::AnyChar => {
            let mut map = BitSet::new();
            map.set_range(0, 255);
            let mut info = NodeInfo {
                len: env.char_len(),
                ..NodeInfo::default()
            };
            if options.contains(OptionFlags::MULTILINE) {
                info.map = Some(MapInfo::new(map));
            } else {
                let mut without_nl = BitSet::new();
                for b in map.iter().filter(|b| *b != b'\n') {
                    without_nl.set(b);
                }
                info.map = Some(MapInfo::new(without_nl));
            }
            info
        }
        Node::Anchor(kind) => {
            let per_line = options.is_per_line();
            let (left, right) = match kind {
                AnchorKind::BeginBuf => (Anchors::BEGIN_BUF, Anchors::NONE),
                AnchorKind::BeginPosition => (Anchors::BEGIN_POSITION, Anchors::NONE),
                AnchorKind::BeginLine if !per_line => (Anchors::BEGIN_BUF, Anchors::NONE),
                AnchorKind::EndBuf => (Anchors::NONE, Anchors::END_BUF),
                AnchorKind::EndLine if !per_line => (Anchors::NONE, Anchors::END_BUF),
                AnchorKind::SemiEndBuf => (Anchors::NONE, Anchors::SEMI_END_BUF),
                _ => (Anchors::NONE, Anchors::NONE),
            };
            NodeInfo {
                anc_left: left,
                anc_right: right,
                ..NodeInfo::default()
            }
        }
        Node::Backref(_) => NodeInfo {
            len: MinMax { min: 0, max: None },
            ..NodeInfo::default()
        },
        Node::Option {
            options: inner,
            target,
        } => opt_node(target, *inner, env),
        Node::Effect(effect) => match effect.kind {
            EffectKind::Memory | EffectKind::StopBacktrack => {
                opt_node(&effect.target, options, env)
            }
            _ => NodeInfo::default(),
        },
        Node::Qualifier(q) => {
            let target = opt_node(&q.target, options, env);
            let mut info = NodeInfo {
                len: target.len.times(q.lower, q.upper),
                ..NodeInfo::default()
            };
            if q.greedy && q.upper.is_none() && matches!(q.target, Node::AnyChar) {
                info.anc_left |= if options.contains(OptionFlags::MULTILINE) {
                    Anchors::ANYCHAR_STAR_ML
                } else {
                    Anchors::ANYCHAR_STAR
                };
            }
            if q.lower == 1 && q.upper == Some(1) {
                return NodeInfo {
                    anc_left: info.anc_left | target.anc_left,
                    ..target
                };
            }
            if q.lower >= 1 && q.upper != Some(0) {
                info.anc_left |= target.anc_left;
                info.anc_right |= target.anc_right;
                info.map = target.map;
                info.exb = target.exb.map(|e| ExactInfo {
                    reach_end: false,
                    ..e
                });
                info.exm = target.exm;
            }
            info
        }
    }
}

/// 構文木から探索の最適化情報を求める
pub fn optimize(
    root: &Node,
    options: OptionFlags,
    enc: Encoding,
    case_table: Option<&CaseFoldTable>,
) -> OptInfo {
    let env = OptEnv { enc, case_table };
    let info = opt_node(root, options, &env);

    let anchor = (info.anc_left & Anchors::LEFT) | (info.anc_right & Anchors::RIGHT);

    let map = info.map.filter(|m| m.map.count() < 256);
    let (exact, map) = match (info.exm, map) {
        (Some(exact), Some(map)) => {
            let short = exact.bytes.len() < LEN_FOR_MAP_EVAL && exact.mmd != MinMax::ZERO;
            let dispersed = exact.mmd.width().map_or(true, |w| w > DMAX_FOR_MAP_EVAL);
            if (short && map.value <= MAP_VALUE_FAIR) || (dispersed && map.value <= MAP_VALUE_GOOD) {
                (None, Some(map))
            } else {
                (Some(exact), None)
            }
        }
        (exact, map) => (exact, map),
    };

    OptInfo {
        anchor,
        anchor_dmin: info.len.min,
        anchor_dmax: info.len.max,
        threshold_len: info.len.min,
        exact,
        map,
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        engine::{
            encoding::{CaseFoldTable, Encoding},
            optimize::{optimize, Anchors, MinMax, OptInfo},
            parser::parse,
            setup::{setup, SetupEnv},
        },
        options::OptionFlags,
    };

    fn info(pattern: &str, options: OptionFlags) -> OptInfo {
        let parsed = parse(pattern.as_bytes(), options, Encoding::Ascii).unwrap();
        let table = CaseFoldTable::ascii();
        let env = SetupEnv {
            enc: Encoding::Ascii,
            case_table: Some(&table),
            backrefs: &parsed.backrefs,
        };
        let mut root = parsed.root;
        setup(&mut root, options, &env).unwrap();
        optimize(&root, options, Encoding::Ascii, Some(&table))
    }

    #[test]
    fn test_exact_literal() {
        let opt = info("abc", OptionFlags::NONE);
        let exact = opt.exact.unwrap();
        assert_eq!(exact.bytes, b"abc".to_vec());
        assert_eq!(exact.mmd, MinMax::ZERO);
        assert_eq!(opt.threshold_len, 3);
    }

    #[test]
    fn test_exact_after_variable_prefix() {
        let opt = info("[a-z]{1,3}hello", OptionFlags::NONE);
        let exact = opt.exact.unwrap();
        assert_eq!(exact.bytes, b"hello".to_vec());
        assert_eq!(exact.mmd, MinMax { min: 1, max: Some(3) });
    }

    #[test]
    fn test_exact_through_groups() {
        let opt = info("a(bc)d", OptionFlags::NONE);
        assert_eq!(opt.exact.unwrap().bytes, b"abcd".to_vec());
    }

    #[test]
    fn test_alternation_common_prefix() {
        let opt = info("foobar|foobaz", OptionFlags::NONE);
        let exact = opt.exact.unwrap();
        assert_eq!(exact.bytes, b"fooba".to_vec());
    }

    #[test]
    fn test_map_preferred_for_short_dispersed_literal() {
        // 先頭の文字集合が狭く、リテラルは短く位置が定まらない
        let opt = info("(?:a|b)", OptionFlags::NONE);
        assert!(opt.exact.is_none());
        let map = opt.map.unwrap();
        assert!(map.map.contains(b'a'));
        assert!(map.map.contains(b'b'));
        assert!(!map.map.contains(b'c'));
    }

    #[test]
    fn test_ignore_case_literal() {
        let opt = info("AbC", OptionFlags::IGNORECASE);
        let exact = opt.exact.unwrap();
        assert!(exact.ignore_case);
        assert_eq!(exact.bytes, b"abc".to_vec());
    }

    #[test]
    fn test_anchors() {
        assert!(info("\\Aabc", OptionFlags::NONE)
            .anchor
            .contains(Anchors::BEGIN_BUF));
        assert!(info("\\Gabc", OptionFlags::NONE)
            .anchor
            .contains(Anchors::BEGIN_POSITION));
        let opt = info("ab+\\z", OptionFlags::NONE);
        assert!(opt.anchor.contains(Anchors::END_BUF));
        assert_eq!(opt.anchor_dmin, 2);
        assert_eq!(opt.anchor_dmax, None);
        assert!(info("ab\\Z", OptionFlags::NONE)
            .anchor
            .contains(Anchors::SEMI_END_BUF));
        assert!(info(".*a", OptionFlags::NONE)
            .anchor
            .contains(Anchors::ANYCHAR_STAR));
        assert!(info(".*a", OptionFlags::MULTILINE)
            .anchor
            .contains(Anchors::ANYCHAR_STAR_ML));
        // 行単位の ^ は先頭アンカーにならない
        assert!(info("^a", OptionFlags::MULTILINE).anchor.is_empty());
        assert!(info("^a", OptionFlags::NONE)
            .anchor
            .contains(Anchors::BEGIN_BUF));
        assert!(info("a|\\Ab", OptionFlags::NONE).anchor.is_empty());
    }

    #[test]
    fn test_min_max_arith() {
        let a = MinMax { min: 1, max: Some(3) };
        assert_eq!(a.add(MinMax::fixed(2)), MinMax { min: 3, max: Some(5) });
        assert_eq!(a.alt(MinMax::ZERO), MinMax { min: 0, max: Some(3) });
        assert_eq!(a.times(2, None), MinMax { min: 2, max: None });
        assert_eq!(a.times(0, Some(0)), MinMax::ZERO);
    }
}
