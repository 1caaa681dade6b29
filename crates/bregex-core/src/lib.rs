use std::sync::{Arc, PoisonError, RwLock};

use engine::{compile_pattern, search::search, stack::Captures, CompiledPattern};

mod engine;
pub mod error;
pub mod options;

pub use engine::{
    encoding::{CaseFoldTable, Encoding},
    instruction::Instruction,
};
pub use options::{MatchLimits, OptionFlags};

use crate::{engine::evaluator::Matcher, error::RegexError};

/// マッチしたグループの位置
///
/// `beg[n]` と `end[n]` はグループ n の開始・終了位置。グループ 0 はマッチ全体。
/// マッチに参加しなかったグループは None になる。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Region {
    pub beg: Vec<Option<usize>>,
    pub end: Vec<Option<usize>>,
}

impl Region {
    pub fn new() -> Self {
        Region::default()
    }

    /// Grows the region to hold at least `n` groups.
    pub fn resize(&mut self, n: usize) {
        if self.beg.len() < n {
            self.beg.resize(n, None);
            self.end.resize(n, None);
        }
    }

    pub fn len(&self) -> usize {
        self.beg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beg.is_empty()
    }

    /// グループ n の (開始位置, 終了位置) を返す
    pub fn group(&self, n: usize) -> Option<(usize, usize)> {
        match (self.beg.get(n), self.end.get(n)) {
            (Some(Some(b)), Some(Some(e))) => Some((*b, *e)),
            _ => None,
        }
    }

    fn set_from(&mut self, caps: &Captures) {
        self.resize(caps.beg.len());
        for (i, (b, e)) in caps.beg.iter().zip(&caps.end).enumerate() {
            // 終了位置が無いグループは参加していない
            let (b, e) = match (b, e) {
                (Some(b), Some(e)) if b <= e => (Some(*b), Some(*e)),
                _ => (None, None),
            };
            self.beg[i] = b;
            self.end[i] = e;
        }
    }
}

/// コンパイル済みの正規表現
///
/// 検索は読み取り専用でプログラムを共有するので、複数のスレッドから同時に使える。
/// `recompile` は新しいプログラムに差し替えるだけで、実行中の検索は古いプログラムを
/// 使い続ける。
#[derive(Debug)]
pub struct Regex {
    pattern: RwLock<Arc<CompiledPattern>>,
    limits: MatchLimits,
}

/// パターンをコンパイルする
///
/// # 引数
///
/// * pattern -> 正規表現のパターン
/// * options -> コンパイル時のオプション
/// * enc -> パターンと検索対象の文字エンコーディング
/// * case_table -> 大小文字の変換表。IGNORECASE を使う場合は必須。
///
/// # 返り値
///
/// * コンパイルに成功した場合は Regex 構造体を返す。
/// * 失敗した場合は RegexError を返す。途中まで作られたプログラムは返さない。
pub fn compile(
    pattern: &[u8],
    options: OptionFlags,
    enc: Encoding,
    case_table: Option<&CaseFoldTable>,
) -> Result<Regex, RegexError> {
    let compiled = compile_pattern(pattern, options, enc, case_table)?;
    Ok(Regex {
        pattern: RwLock::new(Arc::new(compiled)),
        limits: MatchLimits::default(),
    })
}

impl Regex {
    /// 新しい Regex 構造体を生成する
    ///
    /// # 引数
    ///
    /// * pattern -> 正規表現のパターン (UTF-8)
    /// * is_ignore_case -> 大小文字の区別をしないかどうか（ASCII のみ対象）
    ///
    /// # 返り値
    ///
    /// * 正規表現のコンパイルに成功した場合は Regex 構造体を返す。
    /// * 正規表現のコンパイルに失敗した場合は RegexError を返す。
    pub fn new(pattern: &str, is_ignore_case: bool) -> Result<Self, RegexError> {
        let mut options = OptionFlags::NONE;
        options.set(OptionFlags::IGNORECASE, is_ignore_case);
        compile(
            pattern.as_bytes(),
            options,
            Encoding::Utf8,
            Some(&CaseFoldTable::ascii()),
        )
    }

    /// 検索ごとの上限 (バックトラック回数・スタックの深さ) を設定する
    pub fn with_match_limits(mut self, limits: MatchLimits) -> Self {
        self.limits = limits;
        self
    }

    fn current(&self) -> Arc<CompiledPattern> {
        let guard = self.pattern.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// パターンを置き換える
    ///
    /// 失敗した場合は元のパターンが残る。
    pub fn recompile(
        &self,
        pattern: &[u8],
        options: OptionFlags,
        enc: Encoding,
        case_table: Option<&CaseFoldTable>,
    ) -> Result<(), RegexError> {
        let compiled = Arc::new(compile_pattern(pattern, options, enc, case_table)?);
        let mut guard = self.pattern.write().unwrap_or_else(PoisonError::into_inner);
        *guard = compiled;
        Ok(())
    }

    /// Number of capture groups, not counting group 0.
    pub fn num_groups(&self) -> usize {
        self.current().program.num_mem
    }

    /// 範囲を指定して検索する
    ///
    /// # 引数
    ///
    /// * text -> 検索対象のバイト列
    /// * start -> 検索開始位置
    /// * range -> 検索の終端 (この位置から始まるマッチも候補)。`start` より小さい場合は後方に検索する。
    /// * options -> 検索時のオプション (NOTBOL, NOTEOL, FIND_LONGEST, FIND_NOT_EMPTY)
    ///
    /// # 返り値
    ///
    /// * マッチした場合は開始位置と Region を返す。
    /// * マッチしなかった場合は None を返す。
    pub fn search(
        &self,
        text: &[u8],
        start: usize,
        range: usize,
        options: OptionFlags,
    ) -> Result<Option<(usize, Region)>, RegexError> {
        let compiled = self.current();
        let found = search(
            &compiled.program,
            &compiled.plan,
            text,
            start,
            range,
            options,
            self.limits,
        )?;
        Ok(found.map(|(s, caps)| {
            let mut region = Region::new();
            region.set_from(&caps);
            (s, region)
        }))
    }

    /// `at` の位置だけでマッチを試す
    ///
    /// # 返り値
    ///
    /// * マッチした場合はマッチの長さを返し、region にグループの位置を書き込む。
    /// * マッチしなかった場合は None を返す。
    pub fn match_at(
        &self,
        text: &[u8],
        at: usize,
        region: &mut Region,
    ) -> Result<Option<usize>, RegexError> {
        let compiled = self.current();
        let mut caps = Captures::new(compiled.program.num_mem);
        let mut matcher = Matcher::new(&compiled.program, text, at, OptionFlags::NONE, self.limits);
        let len = matcher.match_at(at, &mut caps)?;
        if len.is_some() {
            region.set_from(&caps);
        }
        Ok(len)
    }

    /// 最初のマッチの (開始位置, 終了位置) を返す
    pub fn find(&self, text: &[u8]) -> Result<Option<(usize, usize)>, RegexError> {
        let found = self.search(text, 0, text.len(), OptionFlags::NONE)?;
        Ok(found.and_then(|(_, region)| region.group(0)))
    }

    /// 行とパターンのマッチングを実行する（文字列版）
    pub fn is_match(&self, line: &str) -> Result<bool, RegexError> {
        self.is_match_bytes(line.as_bytes())
    }

    /// 行とパターンのマッチングを実行する（バイト列版）
    pub fn is_match_bytes(&self, line: &[u8]) -> Result<bool, RegexError> {
        Ok(self.find(line)?.is_some())
    }

    /// コンパイル済みの命令列を 1 行 1 命令で出力する
    pub fn dump(&self) -> String {
        let compiled = self.current();
        compiled
            .program
            .code
            .iter()
            .enumerate()
            .map(|(i, inst)| format!("{i:>04}: {inst}\n"))
            .collect()
    }
}

// ----- テストコード -----

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_match() {
        // パターン "ab(c|d)" から Regex 構造体を生成
        let regex = Regex::new("ab(c|d)", false).unwrap();

        assert!(regex.is_match("abc").unwrap());
        assert!(!regex.is_match("abe").unwrap());
        // 部分マッチ
        assert!(regex.is_match_bytes(b"zabd").unwrap());
    }

    #[test]
    fn test_is_match_ignore_case() {
        let regex1 = Regex::new("ab(c|d)", true).unwrap();
        assert!(regex1.is_match("ABC").unwrap());
        assert!(regex1.is_match("aBd").unwrap());

        let regex2 = Regex::new("ab(c|d)", false).unwrap();
        assert!(!regex2.is_match("ABC").unwrap());
    }

    #[test]
    fn test_regex_new_error_cases() {
        // 不正なパターンのテスト
        assert!(Regex::new("(", false).is_err());
        assert!(Regex::new(")", false).is_err());
        assert!(Regex::new("a**", false).is_err());
        assert!(Regex::new("[a", false).is_err());
    }

    #[test]
    fn test_anchor_patterns() {
        let regex_start = Regex::new("^hello", false).unwrap();
        assert!(regex_start.is_match("hello world").unwrap());
        assert!(!regex_start.is_match("say hello").unwrap());

        let regex_end = Regex::new("world$", false).unwrap();
        assert!(regex_end.is_match("hello world").unwrap());
        assert!(!regex_end.is_match("world peace").unwrap());

        // 空行にマッチする ^$
        let regex_empty_line = Regex::new("^$", false).unwrap();
        assert!(regex_empty_line.is_match("").unwrap());
        assert!(!regex_empty_line.is_match(" ").unwrap());
    }

    #[test]
    fn test_region_group() {
        let regex = Regex::new("(a)(b)?", false).unwrap();
        let (start, region) = regex.search(b"xa", 0, 2, OptionFlags::NONE).unwrap().unwrap();
        assert_eq!(start, 1);
        assert_eq!(region.group(0), Some((1, 2)));
        assert_eq!(region.group(1), Some((1, 2)));
        assert_eq!(region.group(2), None);
        assert_eq!(region.group(3), None);
        assert_eq!(region.len(), 3);
    }

    #[test]
    fn test_match_at() {
        let regex = Regex::new("b+", false).unwrap();
        let mut region = Region::new();
        assert_eq!(regex.match_at(b"abbc", 1, &mut region), Ok(Some(2)));
        assert_eq!(region.group(0), Some((1, 3)));
        assert_eq!(regex.match_at(b"abbc", 0, &mut region), Ok(None));
    }

    #[test]
    fn test_recompile_keeps_old_on_error() {
        let regex = Regex::new("abc", false).unwrap();
        let table = CaseFoldTable::ascii();
        assert!(regex
            .recompile(b"(", OptionFlags::NONE, Encoding::Utf8, Some(&table))
            .is_err());
        assert!(regex.is_match("abc").unwrap());

        regex
            .recompile(b"x(y)", OptionFlags::NONE, Encoding::Utf8, Some(&table))
            .unwrap();
        assert!(!regex.is_match("abc").unwrap());
        assert_eq!(regex.num_groups(), 1);
    }

    #[test]
    fn test_dump() {
        let regex = Regex::new("a*b", false).unwrap();
        assert_eq!(
            regex.dump(),
            "0000: push-or-jump-e1 0002 a\n0001: exact1 a\n0002: jump -003\n0003: exact1 b\n0004: end\n"
        );
    }

    #[test]
    fn test_regression_non_utf8_input() {
        let regex = Regex::new("ab", false).unwrap();
        let input = [0xFF, b'a', b'b'];
        assert!(regex.is_match_bytes(&input).unwrap());
    }
}
