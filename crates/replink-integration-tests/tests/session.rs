//! Session state machine behavior over the full wire dance: raw-REPL
//! entry, output stream collection, timeout handling, and the
//! filesystem layer's snippet/parse round trips.

use replink_integration_tests::MockBoard;
use replink_protocol::fs::DEFAULT_CHUNK;
use replink_protocol::pyliteral::{self, Value};
use replink_protocol::{ProtocolError, Session};
use rstest::rstest;
use std::collections::HashMap;
use std::time::Duration;

/// Answers the snippets the filesystem layer generates.
fn fs_handler(source: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let text = String::from_utf8_lossy(source);
    if text.contains("uos.ilistdir") {
        return (
            b"('boot.py', 32768, 0, 119),('lib', 16384, 0, 0),".to_vec(),
            Vec::new(),
        );
    }
    if text.contains("uos.stat('missing.py')") {
        return (
            Vec::new(),
            b"Traceback (most recent call last):\r\nOSError: [Errno 2] ENOENT\r\n".to_vec(),
        );
    }
    if text.contains("uos.stat('boot.py')") {
        return (b"(32768, 0, 0, 0, 0, 0, 119, 1, 2, 3)\r\n".to_vec(), Vec::new());
    }
    if text.contains("os.getcwd") {
        return (b"/flash\r\n".to_vec(), Vec::new());
    }
    if text.contains("open('data.bin', 'rb')") {
        return (b"b'ab'b'\\x00\\xff'".to_vec(), Vec::new());
    }
    (Vec::new(), Vec::new())
}

/// A handler with real file state: interprets the write- and read-file
/// snippets against an in-memory map, the way the board's filesystem
/// would.
fn file_store_handler() -> impl FnMut(&[u8]) -> (Vec<u8>, Vec<u8>) + Send {
    let mut files: HashMap<String, Vec<u8>> = HashMap::new();
    let mut open_for_write: Option<String> = None;
    move |source: &[u8]| {
        let text = String::from_utf8_lossy(source).to_string();
        if let Some(rest) = text.strip_prefix("f=open('") {
            if text.contains("'wb'") {
                let path = rest.split('\'').next().unwrap().to_string();
                files.insert(path.clone(), Vec::new());
                open_for_write = Some(path);
            }
            return (Vec::new(), Vec::new());
        }
        if let Some(rest) = text.strip_prefix("w(") {
            let literal = rest.strip_suffix(')').unwrap();
            let chunk = match pyliteral::parse(literal).unwrap() {
                Value::Bytes(data) => data,
                other => panic!("unexpected write argument: {other:?}"),
            };
            let path = open_for_write.clone().expect("write without an open file");
            files.get_mut(&path).unwrap().extend(chunk);
            return (Vec::new(), Vec::new());
        }
        if text == "f.close()" {
            open_for_write = None;
            return (Vec::new(), Vec::new());
        }
        if let Some(rest) = text.strip_prefix("with open('") {
            if text.contains("'rb'") {
                let path = rest.split('\'').next().unwrap();
                let data = files.get(path).cloned().unwrap_or_default();
                // One literal per chunk, back to back, as the device's
                // print loop emits them. An empty file prints nothing.
                let out: String = data
                    .chunks(DEFAULT_CHUNK)
                    .map(|c| pyliteral::format_bytes(c))
                    .collect();
                return (out.into_bytes(), Vec::new());
            }
        }
        (Vec::new(), Vec::new())
    }
}

#[tokio::test]
async fn test_enter_and_exit_track_device_state() {
    let mut board = MockBoard::new();
    let handle = board.handle();

    let mut session = Session::new(&mut board);
    assert!(!session.in_raw_repl());
    session.enter_raw_repl(true).await.unwrap();
    assert!(session.in_raw_repl());
    assert!(!handle.at_friendly_prompt());

    session.exit_raw_repl().await;
    assert!(!session.in_raw_repl());
    assert!(handle.at_friendly_prompt());
}

#[tokio::test]
async fn test_exec_collects_both_streams() {
    let mut board = MockBoard::new()
        .with_handler(|_| (b"result\r\n".to_vec(), b"warning\r\n".to_vec()));

    let mut session = Session::new(&mut board);
    let output = session.exec_raw(b"whatever()", None).await.unwrap();
    assert_eq!(output.stdout, b"result\r\n");
    assert_eq!(output.stderr, b"warning\r\n");
    assert!(!output.success());

    match output.into_result() {
        Err(ProtocolError::Remote { stdout, stderr }) => {
            assert_eq!(stdout, b"result\r\n");
            assert_eq!(stderr, b"warning\r\n");
        }
        other => panic!("expected Remote error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_missing_first_eof_times_out_in_raw_mode() {
    let mut board = MockBoard::new()
        .omit_first_eof()
        .with_handler(|_| (b"partial".to_vec(), Vec::new()));

    let mut session = Session::new(&mut board).with_timeout(Duration::from_millis(200));
    let err = session.exec_raw(b"hang()", None).await.unwrap_err();
    assert!(
        matches!(err, ProtocolError::TimeoutWaitingForFirstEof),
        "{err:?}"
    );
    // The device is still in raw mode; only explicit exit flips this.
    assert!(session.in_raw_repl());
}

#[tokio::test]
async fn test_missing_second_eof_times_out() {
    let mut board = MockBoard::new()
        .omit_second_eof()
        .with_handler(|_| (b"done\r\n".to_vec(), Vec::new()));

    let mut session = Session::new(&mut board).with_timeout(Duration::from_millis(200));
    let err = session.exec_raw(b"x = 1", None).await.unwrap_err();
    assert!(
        matches!(err, ProtocolError::TimeoutWaitingForSecondEof),
        "{err:?}"
    );
}

#[tokio::test]
async fn test_consumer_sees_output_incrementally() {
    let mut board = MockBoard::new()
        .with_handler(|_| (b"streamed output".to_vec(), Vec::new()));

    let mut session = Session::new(&mut board);
    let mut seen = Vec::new();
    let mut consumer = |chunk: &[u8]| seen.extend_from_slice(chunk);
    let output = session
        .exec_raw(b"print('streamed output')", Some(&mut consumer))
        .await
        .unwrap();
    assert_eq!(output.stdout, b"streamed output");
    // The terminator byte never reaches the consumer.
    assert_eq!(seen, b"streamed output");
}

#[tokio::test]
async fn test_eval_parsed() {
    let mut board = MockBoard::new()
        .with_handler(|_| (b"(1, 'two')\r\n".to_vec(), Vec::new()));

    let mut session = Session::new(&mut board);
    let value = session.eval_parsed("1, 'two'").await.unwrap();
    assert_eq!(
        value,
        Value::Tuple(vec![Value::Int(1), Value::Str("two".to_string())])
    );
}

#[tokio::test]
async fn test_fs_pwd_and_listdir() {
    let mut board = MockBoard::new().with_handler(fs_handler);

    let mut session = Session::new(&mut board);
    assert_eq!(session.fs_pwd().await.unwrap(), "/flash");

    let entries = session.fs_listdir("").await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].name, "boot.py");
    assert_eq!(entries[0].size, 119);
    assert!(entries[1].is_dir());
}

#[tokio::test]
async fn test_fs_stat_and_not_found() {
    let mut board = MockBoard::new().with_handler(fs_handler);

    let mut session = Session::new(&mut board);
    let stat = session.fs_stat("boot.py").await.unwrap();
    assert_eq!(stat.size, 119);
    assert_eq!(stat.mtime, 2);

    let err = session.fs_stat("missing.py").await.unwrap_err();
    assert!(
        matches!(&err, ProtocolError::NotFound(path) if path == "missing.py"),
        "{err:?}"
    );

    assert!(!session.fs_exists("missing.py").await.unwrap());
    assert!(session.fs_exists("boot.py").await.unwrap());
}

#[tokio::test]
async fn test_fs_readfile_concatenates_chunks() {
    let mut board = MockBoard::new().with_handler(fs_handler);

    let mut session = Session::new(&mut board);
    let data = session.fs_readfile("data.bin", DEFAULT_CHUNK).await.unwrap();
    assert_eq!(data, b"ab\x00\xff");
}

#[rstest]
#[case(0)]
#[case(1)]
#[case(255)]
#[case(256)]
#[case(1000)]
#[tokio::test]
async fn test_write_then_read_returns_data_unchanged(#[case] len: usize) {
    let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
    let mut board = MockBoard::new().with_handler(file_store_handler());

    let mut session = Session::new(&mut board);
    session
        .fs_writefile("blob.bin", &data, DEFAULT_CHUNK)
        .await
        .unwrap();
    let read_back = session.fs_readfile("blob.bin", DEFAULT_CHUNK).await.unwrap();
    assert_eq!(read_back, data);
}

#[tokio::test]
async fn test_fs_writefile_emits_literals() {
    let mut board = MockBoard::new();
    let handle = board.handle();

    let mut session = Session::new(&mut board);
    session
        .fs_writefile("out.bin", b"a\x00b", 256)
        .await
        .unwrap();

    let executed = handle.executed();
    let scripts: Vec<String> = executed
        .iter()
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect();
    assert!(scripts[0].contains("open('out.bin','wb')"));
    assert!(scripts.iter().any(|s| s == r"w(b'a\x00b')"), "{scripts:?}");
    assert_eq!(scripts.last().map(String::as_str), Some("f.close()"));
}
