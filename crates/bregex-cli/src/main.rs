mod error;


use std::{
    fs::File,
    io::{self, stdin, BufRead, BufReader, Write},
};

use bregex_core::{compile, CaseFoldTable, Encoding, OptionFlags, Regex};
use clap::{ArgAction, Parser, ValueEnum};
use log::{debug, info};

use crate::error::CommandLineError;

/// 検索対象のファイルの文字エンコーディング
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EncodingArg {
    Ascii,
    EucJp,
    Sjis,
    #[default]
    Utf8,
}

impl From<EncodingArg> for Encoding {
    fn from(value: EncodingArg) -> Self {
        match value {
            EncodingArg::Ascii => Encoding::Ascii,
            EncodingArg::EucJp => Encoding::EucJp,
            EncodingArg::Sjis => Encoding::Sjis,
            EncodingArg::Utf8 => Encoding::Utf8,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version)]
#[clap(disable_version_flag = true, disable_help_flag = true)]
pub struct Args {
    #[arg(value_name = "PATTERN")]
    /// パターンを指定する。
    pattern: Option<String>,

    #[arg(value_name = "FILE")]
    /// ファイルを指定する。
    pub files: Vec<String>,

    #[arg(short = 'e', long = "regexp", value_name = "PATTERN")]
    /// パターンを指定する。このオプションを使用すれば複数のパターンを指定することができる
    patterns: Vec<String>,

    #[arg(short = 'c', long = "count")]
    /// マッチした行数のみ表示する
    pub count: bool,

    #[arg(short = 'i', long = "ignore-case")]
    /// 大文字と小文字を区別しない
    pub ignore_case: bool,

    #[arg(short = 'v', long = "invert-match")]
    /// マッチしなかった行を表示する
    pub invert_match: bool,

    #[arg(short = 'h', long = "no-filename")]
    /// 出力する行の前にファイル名を付けない。検索ファイルが1つの場合、こちらがデフォルト
    pub no_filename: bool,

    #[arg(short = 'H', long = "with-filename")]
    /// 出力する行の前にファイル名を付ける。検索ファイルが2つ以上の場合、こちらがデフォルト
    pub with_filename: bool,

    #[arg(short = 'n', long = "line-number")]
    /// 入力ファイル内での行番号を表示する
    pub line_number: bool,

    #[arg(short = 'x', long = "extended")]
    /// パターン中の空白と # から行末までを無視する
    pub extended: bool,

    #[arg(short = 'm', long = "multiline")]
    /// . が改行にもマッチし、^ と $ が行単位で判定される
    pub multiline: bool,

    #[arg(long = "encoding", value_enum, default_value_t = EncodingArg::Utf8)]
    /// パターンと入力の文字エンコーディング
    pub encoding: EncodingArg,

    #[arg(long, action = ArgAction::Help)]
    /// help を表示する
    help: Option<bool>,

    #[arg(short = 'V', long = "version", action = ArgAction::Version)]
    /// Version を表示する
    version: Option<bool>,
}

impl Args {
    /// パターンの配列を取得して返す。
    /// パターンは位置引数と -e オプションに指定ができるが、
    /// -e オプションが指定されている場合、位置引数に指定した値はファイル名となる。
    pub fn get_patterns(&mut self) -> Result<Vec<String>, CommandLineError> {
        if self.patterns.is_empty() {
            match &self.pattern {
                Some(p) => self.patterns.push(p.to_owned()),
                None => return Err(CommandLineError::NoPattern),
            }
        } else if let Some(file) = self.pattern.take() {
            self.files.insert(0, file);
        }
        Ok(self.patterns.clone())
    }

    /// コマンドラインのフラグからコンパイル時のオプションを作る
    pub fn compile_options(&self) -> OptionFlags {
        let mut options = OptionFlags::NONE;
        options.set(OptionFlags::IGNORECASE, self.ignore_case);
        options.set(OptionFlags::EXTEND, self.extended);
        options.set(OptionFlags::MULTILINE, self.multiline);
        options
    }
}

/// パターンをすべてコンパイルする
///
/// # 引数
///
/// * patterns -> パターンの配列
/// * options -> コンパイル時のオプション
/// * enc -> 文字エンコーディング
///
/// # 返り値
///
/// * すべてのコンパイルに成功した場合は Regex の配列を返す。
/// * 1つでも失敗した場合は、最初に失敗したパターンとそのエラーを返す。
pub fn compile_patterns(
    patterns: &[String],
    options: OptionFlags,
    enc: Encoding,
) -> Result<Vec<Regex>, CommandLineError> {
    let table = CaseFoldTable::ascii();
    patterns
        .iter()
        .map(|p| {
            debug!("compiling pattern {p:?}");
            compile(p.as_bytes(), options, enc, Some(&table)).map_err(|source| {
                CommandLineError::InvalidPattern {
                    pattern: p.to_owned(),
                    source,
                }
            })
        })
        .collect()
}

/// 指定されたファイル (なければ標準入力) に対してマッチングを実行し、
/// 条件を満たした行数を返す
pub fn execute_matching(args: &Args, regexes: &[Regex]) -> i32 {
    let is_print_filename =
        is_print_filename(args.files.len(), args.no_filename, args.with_filename);

    let stdout = io::stdout();
    let mut out = stdout.lock();

    // -c オプションが指定されたときに使う
    let mut matching_count: i32 = 0;

    if args.files.is_empty() {
        let buf_reader = BufReader::new(stdin());
        // grep コマンドでパイプ使用時にファイル名を表示したら、(standard input) になるのでそれに合わせる。
        if let Some(c) = match_file(
            buf_reader,
            "(standard input)",
            regexes,
            args,
            is_print_filename,
            &mut out,
        ) {
            matching_count += c;
        }
    } else {
        for file in &args.files {
            let buf_reader = match File::open(file) {
                Ok(reader) => BufReader::new(reader),
                Err(e) => {
                    eprintln!("{file}: {e}");
                    continue;
                }
            };
            info!("searching {file}");
            if let Some(c) = match_file(buf_reader, file, regexes, args, is_print_filename, &mut out)
            {
                matching_count += c;
            }
        }
    }
    matching_count
}

/// ファイルもしくは、標準入力を1行ずつ read し、マッチングを実行する関数
fn match_file<R: BufRead, W: Write>(
    buf_reader: R,
    file: &str,
    regexes: &[Regex],
    args: &Args,
    is_filename: bool,
    out: &mut W,
) -> Option<i32> {
    let mut matching_count: i32 = 0;
    for (i, result) in buf_reader.split(b'\n').enumerate() {
        let line = match result {
            Ok(line) => line,
            Err(e) => {
                eprintln!("{e}");
                break;
            }
        };

        let mut is_match = false;
        for regex in regexes {
            match regex.is_match_bytes(&line) {
                Ok(true) => {
                    // 1つのパターンとマッチした時点で、残りのパターンのマッチはしない。
                    is_match = true;
                    break;
                }
                Ok(false) => {}
                Err(e) => {
                    eprintln!(
                        "Following error is occured in matching, line = '{}'\n{e}",
                        String::from_utf8_lossy(&line)
                    );
                    return None;
                }
            }
        }

        if is_match != args.invert_match {
            matching_count += 1;
            if !args.count {
                if let Err(e) = print(out, file, &line, i + 1, is_filename, args.line_number) {
                    eprintln!("{e}");
                    return None;
                }
            }
        }
    }
    Some(matching_count)
}

/// 行を表示する関数
/// 行はエンコーディングを変換せずに、そのまま出力する。
fn print<W: Write>(
    out: &mut W,
    filename: &str,
    line: &[u8],
    line_number: usize,
    is_filename: bool,
    is_line_number: bool,
) -> io::Result<()> {
    match (is_filename, is_line_number) {
        (true, true) => write!(out, "{filename}:{line_number}:")?,
        (true, false) => write!(out, "{filename}:")?,
        (false, true) => write!(out, "{line_number}:")?,
        (false, false) => {}
    }
    out.write_all(line)?;
    out.write_all(b"\n")
}

/// ファイル名を表示する・しないを判定するための関数
/// ファイル数が 1 の場合、 -H オプションに従う。
/// ファイル数が 2 以上の場合、 -h オプションに従う。
fn is_print_filename(file_count: usize, no_filename: bool, with_filename: bool) -> bool {
    if file_count <= 1 {
        with_filename
    } else {
        !no_filename
    }
}

fn main() {
    env_logger::init();
    let mut args: Args = Args::parse();

    // -h, -H が同時に指定されている場合、エラーを表示して return する
    if args.with_filename && args.no_filename {
        eprintln!("{}", CommandLineError::DuplicateFilenameOption);
        return;
    }

    let patterns = match args.get_patterns() {
        Ok(patterns) => patterns,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let regexes = match compile_patterns(&patterns, args.compile_options(), args.encoding.into())
    {
        Ok(regexes) => regexes,
        Err(e) => {
            eprintln!("{e}");
            return;
        }
    };

    let matching_count = execute_matching(&args, &regexes);

    // -c が true の場合、行数を表示する。
    if args.count {
        println!("{matching_count}");
    }
}
