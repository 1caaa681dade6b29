//! バックトラック用のスタック
//!
//! 分岐点 (`Alt` 系) とキャプチャの巻き戻し情報を同じ配列に積む。
//! 通常の失敗では直近の分岐点まで戻し、先読みや後読みの終端では
//! 対応する目印まで戻す。

use crate::engine::evaluator::EvalError;

/// キャプチャ位置の配列。添字はグループ番号で 0 はマッチ全体。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captures {
    pub beg: Vec<Option<usize>>,
    pub end: Vec<Option<usize>>,
}

impl Captures {
    pub fn new(num_mem: usize) -> Self {
        Captures {
            beg: vec![None; num_mem + 1],
            end: vec![None; num_mem + 1],
        }
    }

    pub fn clear(&mut self) {
        self.beg.iter_mut().for_each(|b| *b = None);
        self.end.iter_mut().for_each(|e| *e = None);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Resume point for an ordinary alternative.
    Alt { pc: usize, s: usize },
    /// Resume point taken when a negative look-ahead body fails.
    PosNot { pc: usize, s: usize },
    /// Resume point taken when a negative look-behind body fails.
    LookBehindNot { pc: usize, s: usize },
    MemStart {
        mem: usize,
        prior_beg: Option<usize>,
        prior_end: Option<usize>,
    },
    MemEnd { mem: usize, prior_end: Option<usize> },
    /// Index of the `Repeat` frame whose count was bumped.
    RepeatInc { repeat: usize },
    /// `pc` is the loop body start.
    Repeat { id: usize, pc: usize, count: u32 },
    Pos { s: usize },
    StopBt,
    NullCheckStart {
        id: usize,
        s: usize,
        snapshot: Option<Box<Captures>>,
    },
    Void,
}

impl Frame {
    fn is_alt(&self) -> bool {
        matches!(
            self,
            Frame::Alt { .. } | Frame::PosNot { .. } | Frame::LookBehindNot { .. }
        )
    }
}

/// マーカーの種類 (`pop_until` 用)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    PosNot,
    LookBehindNot,
}

#[derive(Debug, Default)]
pub struct Stack {
    frames: Vec<Frame>,
    limit: Option<usize>,
}

impl Stack {
    pub fn new(limit: Option<usize>) -> Self {
        Stack {
            frames: Vec::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn push(&mut self, frame: Frame) -> Result<(), EvalError> {
        if let Some(limit) = self.limit {
            if self.frames.len() >= limit {
                return Err(EvalError::StackLimitExceeded);
            }
        }
        self.frames.push(frame);
        Ok(())
    }

    pub fn push_alt(&mut self, pc: usize, s: usize) -> Result<(), EvalError> {
        self.push(Frame::Alt { pc, s })
    }

    /// Undoes the side effect of a non-branch frame.
    fn unwind(&mut self, frame: &Frame, caps: &mut Captures) -> Result<(), EvalError> {
        match frame {
            Frame::MemStart {
                mem,
                prior_beg,
                prior_end,
            } => {
                *caps.beg.get_mut(*mem).ok_or(EvalError::StackBug)? = *prior_beg;
                *caps.end.get_mut(*mem).ok_or(EvalError::StackBug)? = *prior_end;
            }
            Frame::MemEnd { mem, prior_end } => {
                *caps.end.get_mut(*mem).ok_or(EvalError::StackBug)? = *prior_end;
            }
            Frame::RepeatInc { repeat } => match self.frames.get_mut(*repeat) {
                Some(Frame::Repeat { count, .. }) => *count = count.saturating_sub(1),
                _ => return Err(EvalError::StackBug),
            },
            _ => {}
        }
        Ok(())
    }

    /// 直近の分岐点まで戻し、再開位置 `(pc, s)` を返す。
    ///
    /// スタックが空なら `None` を返す。
    pub fn pop_one(&mut self, caps: &mut Captures) -> Result<Option<(usize, usize)>, EvalError> {
        while let Some(frame) = self.frames.pop() {
            match frame {
                Frame::Alt { pc, s }
                | Frame::PosNot { pc, s }
                | Frame::LookBehindNot { pc, s } => return Ok(Some((pc, s))),
                other => self.unwind(&other, caps)?,
            }
        }
        Ok(None)
    }

    /// Pops through the nearest `marker` frame, inclusive.
    pub fn pop_until(&mut self, marker: Marker, caps: &mut Captures) -> Result<(), EvalError> {
        while let Some(frame) = self.frames.pop() {
            match (&frame, marker) {
                (Frame::PosNot { .. }, Marker::PosNot)
                | (Frame::LookBehindNot { .. }, Marker::LookBehindNot) => return Ok(()),
                _ => self.unwind(&frame, caps)?,
            }
        }
        Err(EvalError::StackBug)
    }

    /// 先読みの終端。内部の分岐点を無効化し、開始位置を返す。
    pub fn void_to_pos(&mut self) -> Result<usize, EvalError> {
        for frame in self.frames.iter_mut().rev() {
            if let Frame::Pos { s } = *frame {
                *frame = Frame::Void;
                return Ok(s);
            }
            if frame.is_alt() {
                *frame = Frame::Void;
            }
        }
        Err(EvalError::StackBug)
    }

    /// `(?>...)` の終端。内部の分岐点を無効化する。
    pub fn void_to_stop_bt(&mut self) -> Result<(), EvalError> {
        for frame in self.frames.iter_mut().rev() {
            if *frame == Frame::StopBt {
                *frame = Frame::Void;
                return Ok(());
            }
            if frame.is_alt() {
                *frame = Frame::Void;
            }
        }
        Err(EvalError::StackBug)
    }

    /// Index of the innermost live `Repeat` frame for `id`.
    pub fn find_repeat(&self, id: usize) -> Option<usize> {
        self.frames
            .iter()
            .rposition(|f| matches!(f, Frame::Repeat { id: i, .. } if *i == id))
    }

    pub fn repeat_count_mut(&mut self, index: usize) -> Result<&mut u32, EvalError> {
        match self.frames.get_mut(index) {
            Some(Frame::Repeat { count, .. }) => Ok(count),
            _ => Err(EvalError::StackBug),
        }
    }

    /// Loop body start recorded by the `Repeat` frame at `index`.
    pub fn repeat_pc(&self, index: usize) -> Result<usize, EvalError> {
        match self.frames.get(index) {
            Some(Frame::Repeat { pc, .. }) => Ok(*pc),
            _ => Err(EvalError::StackBug),
        }
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    /// Start position and capture snapshot of the innermost null check `id`.
    pub fn find_null_check(&self, id: usize) -> Option<(usize, Option<&Captures>)> {
        self.frames.iter().rev().find_map(|f| match f {
            Frame::NullCheckStart {
                id: i,
                s,
                snapshot,
            } if *i == id => Some((*s, snapshot.as_deref())),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::engine::{
        evaluator::EvalError,
        stack::{Captures, Frame, Marker, Stack},
    };

    #[test]
    fn test_pop_one_restores_captures() {
        let mut caps = Captures::new(1);
        let mut stack = Stack::new(None);
        stack.push_alt(7, 0).unwrap();
        stack
            .push(Frame::MemStart {
                mem: 1,
                prior_beg: None,
                prior_end: None,
            })
            .unwrap();
        caps.beg[1] = Some(2);
        stack
            .push(Frame::MemEnd {
                mem: 1,
                prior_end: None,
            })
            .unwrap();
        caps.end[1] = Some(3);

        assert_eq!(stack.pop_one(&mut caps), Ok(Some((7, 0))));
        assert_eq!(caps, Captures::new(1));
        assert_eq!(stack.pop_one(&mut caps), Ok(None));
    }

    #[test]
    fn test_repeat_inc_is_undone() {
        let mut caps = Captures::new(0);
        let mut stack = Stack::new(None);
        stack
            .push(Frame::Repeat {
                id: 0,
                pc: 1,
                count: 0,
            })
            .unwrap();
        let index = stack.find_repeat(0).unwrap();
        stack.push_alt(1, 1).unwrap();
        *stack.repeat_count_mut(index).unwrap() += 1;
        stack.push(Frame::RepeatInc { repeat: index }).unwrap();

        assert_eq!(stack.pop_one(&mut caps), Ok(Some((1, 1))));
        assert_eq!(*stack.repeat_count_mut(index).unwrap(), 0);
    }

    #[test]
    fn test_void_to_pos() {
        let mut caps = Captures::new(0);
        let mut stack = Stack::new(None);
        stack.push_alt(1, 0).unwrap();
        stack.push(Frame::Pos { s: 4 }).unwrap();
        stack.push_alt(2, 5).unwrap();
        stack.push_alt(3, 6).unwrap();

        assert_eq!(stack.void_to_pos(), Ok(4));
        // 先読み内部の分岐点は使われない
        assert_eq!(stack.pop_one(&mut caps), Ok(Some((1, 0))));
    }

    #[test]
    fn test_void_to_stop_bt() {
        let mut caps = Captures::new(0);
        let mut stack = Stack::new(None);
        stack.push(Frame::StopBt).unwrap();
        stack.push_alt(2, 5).unwrap();
        assert_eq!(stack.void_to_stop_bt(), Ok(()));
        assert_eq!(stack.pop_one(&mut caps), Ok(None));

        assert_eq!(stack.void_to_stop_bt(), Err(EvalError::StackBug));
    }

    #[test]
    fn test_pop_until() {
        let mut caps = Captures::new(0);
        let mut stack = Stack::new(None);
        stack.push_alt(1, 0).unwrap();
        stack.push(Frame::PosNot { pc: 9, s: 2 }).unwrap();
        stack.push_alt(2, 3).unwrap();

        assert_eq!(stack.pop_until(Marker::PosNot, &mut caps), Ok(()));
        assert_eq!(stack.len(), 1);
        assert_eq!(
            stack.pop_until(Marker::LookBehindNot, &mut caps),
            Err(EvalError::StackBug)
        );
    }

    #[test]
    fn test_stack_limit() {
        let mut stack = Stack::new(Some(2));
        assert!(stack.push_alt(0, 0).is_ok());
        assert!(stack.push_alt(0, 0).is_ok());
        assert_eq!(stack.push_alt(0, 0), Err(EvalError::StackLimitExceeded));
    }

    #[test]
    fn test_find_null_check() {
        let mut stack = Stack::new(None);
        stack
            .push(Frame::NullCheckStart {
                id: 0,
                s: 1,
                snapshot: None,
            })
            .unwrap();
        stack
            .push(Frame::NullCheckStart {
                id: 0,
                s: 3,
                snapshot: Some(Box::new(Captures::new(0))),
            })
            .unwrap();
        let (s, snapshot) = stack.find_null_check(0).unwrap();
        assert_eq!(s, 3);
        assert!(snapshot.is_some());
        assert!(stack.find_null_check(1).is_none());
    }
}
