//! Tree rewriting pass run between parsing and code generation.
//!
//! Marks loops whose body may match the empty string, closes character
//! classes under case folding, decides which captures need undo records,
//! computes first-byte hints for loops, validates look-behind bodies and
//! flattens small fixed repeats of literals.

use std::collections::BTreeSet;

use crate::{
    engine::{
        ast::{AnchorKind, Effect, EffectKind, Node, TargetEmpty},
        compiler::CompileError,
        encoding::{CaseFoldTable, Encoding},
    },
    options::OptionFlags,
};

/// `X{n}` with `n * len(X)` up to this many bytes becomes one literal.
const EXPAND_STRING_MAX_LENGTH: usize = 100;

const IN_ALT: u8 = 1 << 0;
const IN_NOT: u8 = 1 << 1;
const IN_REPEAT: u8 = 1 << 2;

/// Inputs shared by the whole walk.
#[derive(Debug, Clone, Copy)]
pub struct SetupEnv<'a> {
    pub enc: Encoding,
    pub case_table: Option<&'a CaseFoldTable>,
    pub backrefs: &'a BTreeSet<usize>,
}

/// Why a look-behind body has no single character length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharLenError {
    /// Variable width somewhere inside.
    VarLen,
    /// Top-level alternatives that are each fixed but differ.
    TopAltVarLen,
}

/// 構文木を最適化・検証する
pub fn setup(node: &mut Node, options: OptionFlags, env: &SetupEnv) -> Result<(), CompileError> {
    if options.contains(OptionFlags::IGNORECASE) && env.case_table.is_none() {
        return Err(CompileError::TableForIgnoreCaseNotSet);
    }
    setup_tree(node, options, 0, env)
}

fn setup_tree(
    node: &mut Node,
    options: OptionFlags,
    state: u8,
    env: &SetupEnv,
) -> Result<(), CompileError> {
    let mut replacement = None;
    match node {
        Node::List(nodes) => {
            for n in nodes.iter_mut() {
                setup_tree(n, options, state, env)?;
            }
            set_next_head_exact(nodes, options);
        }
        Node::Alt(nodes) => {
            for n in nodes.iter_mut() {
                setup_tree(n, options, state | IN_ALT, env)?;
            }
        }
        Node::CharClass(cc) => {
            if options.contains(OptionFlags::IGNORECASE) {
                let table = env
                    .case_table
                    .ok_or(CompileError::TableForIgnoreCaseNotSet)?;
                cc.apply_case_fold(table);
            }
        }
        Node::Option {
            options: inner,
            target,
        } => {
            if inner.contains(OptionFlags::IGNORECASE) && env.case_table.is_none() {
                return Err(CompileError::TableForIgnoreCaseNotSet);
            }
            setup_tree(target, *inner, state, env)?;
        }
        Node::Qualifier(q) => {
            let child_state = if q.upper != Some(q.lower) {
                state | IN_REPEAT
            } else {
                state
            };
            setup_tree(&mut q.target, options, child_state, env)?;

            if q.upper.map_or(true, |u| u > 1) && min_len(&q.target) == 0 {
                q.target_empty = if contains_memory(&q.target) {
                    TargetEmpty::MayBeEmptyMem
                } else {
                    TargetEmpty::MayBeEmpty
                };
            }
            if q.greedy && q.upper.is_none() {
                q.head_exact = head_exact_byte(&q.target, options);
            }

            if q.upper == Some(q.lower) && q.lower > 1 {
                let n = q.lower as usize;
                replacement = match &q.target {
                    Node::String(bytes) if bytes.len() * n <= EXPAND_STRING_MAX_LENGTH => {
                        Some(Node::String(bytes.repeat(n)))
                    }
                    Node::StringRaw(bytes) if bytes.len() * n <= EXPAND_STRING_MAX_LENGTH => {
                        Some(Node::StringRaw(bytes.repeat(n)))
                    }
                    _ => None,
                };
            }
        }
        Node::Effect(effect) => match effect.kind {
            EffectKind::Memory => {
                if state & (IN_ALT | IN_NOT | IN_REPEAT) != 0
                    || env.backrefs.contains(&effect.regnum)
                {
                    effect.backtrack_mem = true;
                }
                setup_tree(&mut effect.target, options, state, env)?;
            }
            EffectKind::PrecRead | EffectKind::StopBacktrack => {
                setup_tree(&mut effect.target, options, state, env)?;
            }
            EffectKind::PrecReadNot => {
                setup_tree(&mut effect.target, options, state | IN_NOT, env)?;
            }
            EffectKind::LookBehind | EffectKind::LookBehindNot => {
                let not = effect.kind == EffectKind::LookBehindNot;
                if !is_allowed_in_look_behind(&effect.target, not) {
                    return Err(CompileError::InvalidLookBehindPattern);
                }
                match char_length(&effect.target, env.enc) {
                    Ok(_) => {
                        let child_state = if not { state | IN_NOT } else { state };
                        setup_tree(&mut effect.target, options, child_state, env)?;
                    }
                    Err(CharLenError::TopAltVarLen) => {
                        replacement = Some(divide_look_behind(effect));
                    }
                    Err(CharLenError::VarLen) => {
                        return Err(CompileError::InvalidLookBehindPattern);
                    }
                }
            }
        },
        _ => {}
    }

    if let Some(new_node) = replacement {
        *node = new_node;
        if matches!(node, Node::Alt(_) | Node::List(_)) {
            return setup_tree(node, options, state, env);
        }
    }
    Ok(())
}

/// `(?<=a|bc)` becomes `(?<=a)|(?<=bc)`; `(?<!a|bc)` becomes `(?<!a)(?<!bc)`.
fn divide_look_behind(effect: &mut Effect) -> Node {
    let kind = effect.kind;
    let Node::Alt(branches) = effect.target.take() else {
        return Node::Empty;
    };
    let parts: Vec<Node> = branches
        .into_iter()
        .map(|branch| Node::effect(kind, 0, branch))
        .collect();
    if kind == EffectKind::LookBehind {
        Node::Alt(parts)
    } else {
        Node::List(parts)
    }
}

fn set_next_head_exact(nodes: &mut [Node], options: OptionFlags) {
    for i in 1..nodes.len() {
        let next = head_exact_byte(&nodes[i], options);
        if let Node::Qualifier(q) = &mut nodes[i - 1] {
            if q.greedy && q.upper.is_none() {
                q.next_head_exact = next;
            }
        }
    }
}

/// The byte every match of `node` must start with, when one is known.
pub fn head_exact_byte(node: &Node, options: OptionFlags) -> Option<u8> {
    match node {
        Node::String(bytes) => {
            if options.contains(OptionFlags::IGNORECASE) {
                None
            } else {
                bytes.first().copied()
            }
        }
        Node::StringRaw(bytes) => bytes.first().copied(),
        Node::List(nodes) => nodes.first().and_then(|n| head_exact_byte(n, options)),
        Node::Qualifier(q) if q.lower > 0 => head_exact_byte(&q.target, options),
        Node::Option { options, target } => head_exact_byte(target, *options),
        Node::Effect(effect) => match effect.kind {
            EffectKind::Memory | EffectKind::StopBacktrack | EffectKind::PrecRead => {
                head_exact_byte(&effect.target, options)
            }
            _ => None,
        },
        _ => None,
    }
}

/// Minimum number of bytes `node` can consume. Backreferences count as zero.
pub fn min_len(node: &Node) -> usize {
    match node {
        Node::List(nodes) => nodes.iter().map(min_len).fold(0, usize::saturating_add),
        Node::Alt(nodes) => nodes.iter().map(min_len).min().unwrap_or(0),
        Node::String(bytes) | Node::StringRaw(bytes) => bytes.len(),
        Node::CharClass(_) | Node::CType(_) | Node::AnyChar => 1,
        Node::Qualifier(q) => min_len(&q.target).saturating_mul(q.lower as usize),
        Node::Option { target, .. } => min_len(target),
        Node::Effect(effect) => match effect.kind {
            EffectKind::Memory | EffectKind::StopBacktrack => min_len(&effect.target),
            _ => 0,
        },
        Node::Empty | Node::Anchor(_) | Node::Backref(_) => 0,
    }
}

fn contains_memory(node: &Node) -> bool {
    match node {
        Node::List(nodes) | Node::Alt(nodes) => nodes.iter().any(contains_memory),
        Node::Qualifier(q) => contains_memory(&q.target),
        Node::Option { target, .. } => contains_memory(target),
        Node::Effect(effect) => {
            effect.kind == EffectKind::Memory || contains_memory(&effect.target)
        }
        _ => false,
    }
}

fn is_allowed_in_look_behind(node: &Node, not: bool) -> bool {
    match node {
        Node::Empty
        | Node::String(_)
        | Node::StringRaw(_)
        | Node::CharClass(_)
        | Node::CType(_)
        | Node::AnyChar => true,
        Node::List(nodes) | Node::Alt(nodes) => {
            nodes.iter().all(|n| is_allowed_in_look_behind(n, not))
        }
        Node::Qualifier(q) => is_allowed_in_look_behind(&q.target, not),
        Node::Option { target, .. } => is_allowed_in_look_behind(target, not),
        Node::Anchor(kind) => matches!(
            kind,
            AnchorKind::BeginLine
                | AnchorKind::EndLine
                | AnchorKind::BeginBuf
                | AnchorKind::BeginPosition
        ),
        Node::Effect(effect) => match effect.kind {
            EffectKind::Memory => !not && is_allowed_in_look_behind(&effect.target, not),
            EffectKind::LookBehind => true,
            EffectKind::LookBehindNot => not,
            _ => false,
        },
        Node::Backref(_) => false,
    }
}

/// Fixed number of characters `node` matches, for stepping back in
/// look-behind.
pub fn char_length(node: &Node, enc: Encoding) -> Result<usize, CharLenError> {
    char_length_at(node, enc, 0)
}

fn char_length_at(node: &Node, enc: Encoding, level: usize) -> Result<usize, CharLenError> {
    let level = level + 1;
    match node {
        Node::Empty | Node::Anchor(_) => Ok(0),
        Node::List(nodes) => nodes.iter().try_fold(0usize, |acc, n| {
            Ok(acc.saturating_add(char_length_at(n, enc, level)?))
        }),
        Node::Alt(nodes) => {
            let mut first: Option<usize> = None;
            let mut varies = false;
            for n in nodes {
                let len = char_length_at(n, enc, level)?;
                match first {
                    None => first = Some(len),
                    Some(f) if f != len => varies = true,
                    Some(_) => {}
                }
            }
            match (varies, level) {
                (false, _) => Ok(first.unwrap_or(0)),
                (true, 1) => Err(CharLenError::TopAltVarLen),
                (true, _) => Err(CharLenError::VarLen),
            }
        }
        Node::String(bytes) | Node::StringRaw(bytes) => Ok(count_chars(bytes, enc)),
        Node::CharClass(_) | Node::CType(_) | Node::AnyChar => Ok(1),
        Node::Backref(_) => Err(CharLenError::VarLen),
        Node::Qualifier(q) => {
            if q.upper != Some(q.lower) {
                return Err(CharLenError::VarLen);
            }
            let len = char_length_at(&q.target, enc, level)?;
            Ok(len.saturating_mul(q.lower as usize))
        }
        Node::Option { target, .. } => char_length_at(target, enc, level),
        Node::Effect(effect) => match effect.kind {
            EffectKind::Memory | EffectKind::StopBacktrack => {
                char_length_at(&effect.target, enc, level)
            }
            _ => Ok(0),
        },
    }
}

fn count_chars(bytes: &[u8], enc: Encoding) -> usize {
    let mut count = 0;
    let mut p = 0;
    while p < bytes.len() {
        p += enc.char_len_at(bytes, p).max(1);
        count += 1;
    }
    count
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use crate::{
        engine::{
            ast::{EffectKind, Node, TargetEmpty},
            compiler::CompileError,
            encoding::{CaseFoldTable, Encoding},
            parser::parse,
            setup::{char_length, min_len, setup, CharLenError, SetupEnv},
        },
        options::OptionFlags,
    };

    fn setup_pattern(pattern: &str, options: OptionFlags) -> Result<Node, CompileError> {
        let parsed = parse(pattern.as_bytes(), options, Encoding::Utf8).unwrap();
        let table = CaseFoldTable::ascii();
        let env = SetupEnv {
            enc: Encoding::Utf8,
            case_table: Some(&table),
            backrefs: &parsed.backrefs,
        };
        let mut root = parsed.root;
        setup(&mut root, options, &env)?;
        Ok(root)
    }

    fn qualifier_of(node: &Node) -> &crate::engine::ast::Qualifier {
        match node {
            Node::Qualifier(q) => q,
            Node::List(nodes) => nodes
                .iter()
                .find_map(|n| match n {
                    Node::Qualifier(q) => Some(q.as_ref()),
                    _ => None,
                })
                .unwrap(),
            other => panic!("no qualifier in {other:?}"),
        }
    }

    #[test]
    fn test_null_loop_detection() {
        let root = setup_pattern("(?:a*)*b", OptionFlags::NONE).unwrap();
        // (?:a*)* は a* に簡約されるので空チェックは不要
        assert_eq!(qualifier_of(&root).target_empty, TargetEmpty::NotEmpty);

        let root = setup_pattern("(?:a|)*", OptionFlags::NONE).unwrap();
        assert_eq!(qualifier_of(&root).target_empty, TargetEmpty::MayBeEmpty);

        let root = setup_pattern("(a*)*", OptionFlags::NONE).unwrap();
        assert_eq!(qualifier_of(&root).target_empty, TargetEmpty::MayBeEmptyMem);

        // 上限 1 はループしない
        let root = setup_pattern("(?:a*)?x", OptionFlags::NONE).unwrap();
        let q = qualifier_of(&root);
        assert_eq!(q.target_empty, TargetEmpty::NotEmpty);
    }

    #[test]
    fn test_ignore_case_class_closure() {
        let root = setup_pattern("[a-c]", OptionFlags::IGNORECASE).unwrap();
        let Node::CharClass(cc) = root else {
            panic!("not a class");
        };
        assert!(cc.bs.contains(b'B'));
        assert!(cc.bs.contains(b'b'));

        let root = setup_pattern("[a-c]", OptionFlags::NONE).unwrap();
        let Node::CharClass(cc) = root else {
            panic!("not a class");
        };
        assert!(!cc.bs.contains(b'B'));
    }

    #[test]
    fn test_ignore_case_without_table() {
        let parsed = parse(b"(?i)a", OptionFlags::NONE, Encoding::Ascii).unwrap();
        let backrefs = BTreeSet::new();
        let env = SetupEnv {
            enc: Encoding::Ascii,
            case_table: None,
            backrefs: &backrefs,
        };
        let mut root = parsed.root;
        assert_eq!(
            setup(&mut root, OptionFlags::NONE, &env),
            Err(CompileError::TableForIgnoreCaseNotSet)
        );
    }

    fn memory_flags(node: &Node, out: &mut Vec<(usize, bool)>) {
        match node {
            Node::List(nodes) | Node::Alt(nodes) => nodes.iter().for_each(|n| memory_flags(n, out)),
            Node::Qualifier(q) => memory_flags(&q.target, out),
            Node::Option { target, .. } => memory_flags(target, out),
            Node::Effect(e) => {
                if e.kind == EffectKind::Memory {
                    out.push((e.regnum, e.backtrack_mem));
                }
                memory_flags(&e.target, out);
            }
            _ => {}
        }
    }

    #[test]
    fn test_memory_liveness() {
        let root = setup_pattern("(a)(b)?(c|(d))(?!(e))(f)\\5", OptionFlags::NONE).unwrap();
        let mut flags = Vec::new();
        memory_flags(&root, &mut flags);
        assert_eq!(
            flags,
            vec![
                (1, false),
                (2, true),
                (3, false),
                (4, true),
                (5, true),
                (6, false),
            ]
        );
    }

    #[test]
    fn test_head_exact_hints() {
        let root = setup_pattern("a+b", OptionFlags::NONE).unwrap();
        let q = qualifier_of(&root);
        assert_eq!(q.head_exact, Some(b'a'));
        assert_eq!(q.next_head_exact, Some(b'b'));

        let root = setup_pattern("a+?b", OptionFlags::NONE).unwrap();
        let q = qualifier_of(&root);
        assert_eq!(q.head_exact, None);
        assert_eq!(q.next_head_exact, None);

        let root = setup_pattern("a*b", OptionFlags::IGNORECASE).unwrap();
        let q = qualifier_of(&root);
        assert_eq!(q.head_exact, None);
    }

    #[test]
    fn test_literal_repeat_expansion() {
        assert_eq!(
            setup_pattern("(?:ab){3}", OptionFlags::NONE).unwrap(),
            Node::String(b"ababab".to_vec())
        );
        // 100 バイトを超える場合は展開しない
        let root = setup_pattern("(?:ab){51}", OptionFlags::NONE).unwrap();
        assert!(matches!(root, Node::Qualifier(_)));
    }

    #[test]
    fn test_look_behind_validation() {
        assert!(setup_pattern("(?<=ab)c", OptionFlags::NONE).is_ok());
        assert!(setup_pattern("(?<=a.[bc])c", OptionFlags::NONE).is_ok());
        assert_eq!(
            setup_pattern("(?<=a+)c", OptionFlags::NONE),
            Err(CompileError::InvalidLookBehindPattern)
        );
        assert_eq!(
            setup_pattern("(a)(?<=\\1)", OptionFlags::NONE),
            Err(CompileError::InvalidLookBehindPattern)
        );
        assert_eq!(
            setup_pattern("(?<!(a))", OptionFlags::NONE),
            Err(CompileError::InvalidLookBehindPattern)
        );
        assert_eq!(
            setup_pattern("(?<=x(?:a|bc))", OptionFlags::NONE),
            Err(CompileError::InvalidLookBehindPattern)
        );
    }

    #[test]
    fn test_look_behind_split() {
        let root = setup_pattern("(?<=a|bc)", OptionFlags::NONE).unwrap();
        assert_eq!(
            root,
            Node::Alt(vec![
                Node::effect(EffectKind::LookBehind, 0, Node::String(b"a".to_vec())),
                Node::effect(EffectKind::LookBehind, 0, Node::String(b"bc".to_vec())),
            ])
        );

        let root = setup_pattern("(?<!a|bc)", OptionFlags::NONE).unwrap();
        assert_eq!(
            root,
            Node::List(vec![
                Node::effect(EffectKind::LookBehindNot, 0, Node::String(b"a".to_vec())),
                Node::effect(EffectKind::LookBehindNot, 0, Node::String(b"bc".to_vec())),
            ])
        );
    }

    #[test]
    fn test_char_length() {
        let root = parse("aあ.".as_bytes(), OptionFlags::NONE, Encoding::Utf8)
            .unwrap()
            .root;
        assert_eq!(char_length(&root, Encoding::Utf8), Ok(3));
        let root = parse(b"a{3}|bbb", OptionFlags::NONE, Encoding::Ascii)
            .unwrap()
            .root;
        assert_eq!(char_length(&root, Encoding::Ascii), Ok(3));
        let root = parse(b"a|bb", OptionFlags::NONE, Encoding::Ascii)
            .unwrap()
            .root;
        assert_eq!(
            char_length(&root, Encoding::Ascii),
            Err(CharLenError::TopAltVarLen)
        );
    }

    #[test]
    fn test_min_len() {
        let root = parse(b"ab(c|)d*", OptionFlags::NONE, Encoding::Ascii)
            .unwrap()
            .root;
        assert_eq!(min_len(&root), 2);
    }
}
