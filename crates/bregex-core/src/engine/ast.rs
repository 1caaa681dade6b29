//! Syntax tree produced by the parser and rewritten in place by setup.

use crate::{engine::charclass::CharClass, options::OptionFlags};

/// Zero-width position checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnchorKind {
    /// `\A`
    BeginBuf,
    /// `\z`
    EndBuf,
    /// `\Z`
    SemiEndBuf,
    /// `\G`
    BeginPosition,
    /// `^`
    BeginLine,
    /// `$`
    EndLine,
    /// `\b`
    WordBound,
    /// `\B`
    NotWordBound,
    /// `\<`
    WordBegin,
    /// `\>`
    WordEnd,
}

/// `\w` / `\W`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CTypeKind {
    Word,
    NotWord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EffectKind {
    /// `(...)`
    Memory,
    /// `(?=...)`
    PrecRead,
    /// `(?!...)`
    PrecReadNot,
    /// `(?>...)`
    StopBacktrack,
    /// `(?<=...)`
    LookBehind,
    /// `(?<!...)`
    LookBehindNot,
}

/// How a repeated target behaves when it matches nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TargetEmpty {
    /// Always consumes at least one character.
    #[default]
    NotEmpty,
    /// May match the empty string; the loop needs a null check.
    MayBeEmpty,
    /// May match the empty string and contains captures, so the null
    /// check also compares capture state.
    MayBeEmptyMem,
}

/// 繰り返し
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qualifier {
    pub target: Node,
    pub lower: u32,
    /// `None` は上限なし
    pub upper: Option<u32>,
    pub greedy: bool,
    pub target_empty: TargetEmpty,
    /// Byte every iteration of the target starts with.
    pub head_exact: Option<u8>,
    /// Byte the rest of the pattern starts with after the loop.
    pub next_head_exact: Option<u8>,
}

impl Qualifier {
    pub fn new(target: Node, lower: u32, upper: Option<u32>, greedy: bool) -> Self {
        Self {
            target,
            lower,
            upper,
            greedy,
            target_empty: TargetEmpty::NotEmpty,
            head_exact: None,
            next_head_exact: None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.upper.is_none()
    }
}

/// グループ類（捕獲、先読み、後読み、アトミックグループ）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Effect {
    pub kind: EffectKind,
    /// Capture group number, 0 for non-memory effects.
    pub regnum: usize,
    pub target: Node,
    /// Capture writes must be undone on backtrack.
    pub backtrack_mem: bool,
}

impl Effect {
    pub fn new(kind: EffectKind, regnum: usize, target: Node) -> Self {
        Self {
            kind,
            regnum,
            target,
            backtrack_mem: false,
        }
    }
}

/// 構文木のノード
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Empty,
    List(Vec<Node>),
    Alt(Vec<Node>),
    /// Literal bytes that follow the case-folding option in scope.
    String(Vec<u8>),
    /// Literal bytes from numeric escapes; never case folded.
    StringRaw(Vec<u8>),
    CharClass(Box<CharClass>),
    CType(CTypeKind),
    AnyChar,
    Anchor(AnchorKind),
    Backref(usize),
    Qualifier(Box<Qualifier>),
    Option {
        options: OptionFlags,
        target: Box<Node>,
    },
    Effect(Box<Effect>),
}

impl Node {
    pub fn qualifier(target: Node, lower: u32, upper: Option<u32>, greedy: bool) -> Node {
        Node::Qualifier(Box::new(Qualifier::new(target, lower, upper, greedy)))
    }

    pub fn effect(kind: EffectKind, regnum: usize, target: Node) -> Node {
        Node::Effect(Box::new(Effect::new(kind, regnum, target)))
    }

    pub fn char_class(cc: CharClass) -> Node {
        Node::CharClass(Box::new(cc))
    }

    /// Builds a sequence, collapsing the trivial shapes.
    pub fn list(mut nodes: Vec<Node>) -> Node {
        match nodes.len() {
            0 => Node::Empty,
            1 => nodes.pop().unwrap_or(Node::Empty),
            _ => Node::List(nodes),
        }
    }

    pub fn alt(mut nodes: Vec<Node>) -> Node {
        match nodes.len() {
            0 => Node::Empty,
            1 => nodes.pop().unwrap_or(Node::Empty),
            _ => Node::Alt(nodes),
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Node::String(_) | Node::StringRaw(_))
    }

    /// Whether a repeat operator may be applied to this node.
    ///
    /// Anchors, word boundaries and look-arounds are zero-width assertions
    /// and cannot be repeated; wrappers are looked through.
    pub fn is_valid_qualifier_target(&self) -> bool {
        match self {
            Node::Anchor(_) => false,
            Node::Effect(effect) => match effect.kind {
                EffectKind::Memory | EffectKind::StopBacktrack => true,
                _ => false,
            },
            Node::Option { target, .. } => target.is_valid_qualifier_target(),
            Node::List(nodes) => nodes.iter().any(|n| n.is_valid_qualifier_target()),
            Node::Alt(nodes) => nodes.iter().all(|n| n.is_valid_qualifier_target()),
            _ => true,
        }
    }

    /// Takes the node out, leaving `Empty` in its place.
    pub fn take(&mut self) -> Node {
        std::mem::replace(self, Node::Empty)
    }
}
