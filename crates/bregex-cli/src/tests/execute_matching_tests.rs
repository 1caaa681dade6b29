use crate::{compile_patterns, execute_matching, Args, EncodingArg};
use bregex_core::Regex;
use std::io::Write;
use tempfile::NamedTempFile;

fn args(files: Vec<String>) -> Args {
    Args {
        pattern: None,
        files,
        patterns: vec![],
        count: false,
        ignore_case: false,
        invert_match: false,
        no_filename: false,
        with_filename: false,
        line_number: false,
        extended: false,
        multiline: false,
        encoding: EncodingArg::Utf8,
        help: None,
        version: None,
    }
}

fn temp_file(content: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content).unwrap();
    file
}

fn path(file: &NamedTempFile) -> String {
    file.path().to_str().unwrap().to_string()
}

#[test]
fn test_process_single_file() {
    let file = temp_file(b"test line 1\nno match\ntest line 2\n");
    let regexes = vec![Regex::new("test", false).unwrap()];

    // 2 行がマッチする
    assert_eq!(execute_matching(&args(vec![path(&file)]), &regexes), 2);
}

#[test]
fn test_process_multiple_files() {
    let file1 = temp_file(b"test line 1\nno match\n");
    let file2 = temp_file(b"test line 2\ntest line 3\n");

    let mut args = args(vec![path(&file1), path(&file2)]);
    args.with_filename = true;
    let regexes = vec![Regex::new("test", false).unwrap()];

    assert_eq!(execute_matching(&args, &regexes), 3);
}

#[test]
fn test_process_nonexistent_file() {
    let args = args(vec!["nonexistent_file_that_should_not_exist.txt".to_string()]);
    let regexes = vec![Regex::new("test", false).unwrap()];

    // panic せずに 0 を返す
    assert_eq!(execute_matching(&args, &regexes), 0);
}

#[test]
fn test_process_with_count_option() {
    let file = temp_file(b"apple\nbanana\napple pie\ncherry\napple tart\n");
    let mut args = args(vec![path(&file)]);
    args.count = true;
    let regexes = vec![Regex::new("apple", false).unwrap()];

    assert_eq!(execute_matching(&args, &regexes), 3);
}

#[test]
fn test_process_with_ignore_case() {
    let file = temp_file(b"APPLE\napple\nApple pie\nbanana\n");

    let mut case_insensitive = args(vec![path(&file)]);
    case_insensitive.ignore_case = true;
    let regexes = compile_patterns(
        &["apple".to_string()],
        case_insensitive.compile_options(),
        case_insensitive.encoding.into(),
    )
    .unwrap();
    assert_eq!(execute_matching(&case_insensitive, &regexes), 3);

    let case_sensitive = args(vec![path(&file)]);
    let regexes = vec![Regex::new("apple", false).unwrap()];
    assert_eq!(execute_matching(&case_sensitive, &regexes), 1);
}

#[test]
fn test_process_with_invert_match() {
    let file = temp_file(b"apple\nbanana\norange\ngrape\n");
    let mut args = args(vec![path(&file)]);
    args.invert_match = true;
    let regexes = vec![Regex::new("apple", false).unwrap()];

    // "apple" を含まない 3 行
    assert_eq!(execute_matching(&args, &regexes), 3);
}

#[test]
fn test_process_with_multiple_patterns() {
    let file = temp_file(b"apple\nbanana\ncherry\n");
    let args = args(vec![path(&file)]);
    let regexes = vec![
        Regex::new("^a", false).unwrap(),
        Regex::new("rr", false).unwrap(),
        // 1 行目は最初のパターンで数えられ、二重には数えない
        Regex::new("e$", false).unwrap(),
    ];

    assert_eq!(execute_matching(&args, &regexes), 2);
}

#[test]
fn test_process_euc_jp_file() {
    // "あいう" と "かき" を EUC-JP で書いたファイル
    let file = temp_file(b"\xa4\xa2\xa4\xa4\xa4\xa6\n\xa4\xab\xa4\xad\n");
    let mut args = args(vec![path(&file)]);
    args.encoding = EncodingArg::EucJp;
    let pattern = String::from("^.{3}$");
    let regexes =
        compile_patterns(&[pattern], args.compile_options(), args.encoding.into()).unwrap();

    // 3 文字の行だけがマッチする
    assert_eq!(execute_matching(&args, &regexes), 1);
}
