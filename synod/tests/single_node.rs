mod common;

use common::{solo, TIMEOUT};

#[test]
fn append_then_read_back_in_order() {
    let node = solo();
    let writer = node.log.writer_with_default_retries();
    let reader = node.log.reader();

    let first = writer
        .append(b"a".to_vec(), TIMEOUT)
        .expect("append a")
        .expect("learned within timeout");
    let second = writer
        .append(b"b".to_vec(), TIMEOUT)
        .expect("append b")
        .expect("learned within timeout");
    assert_eq!(first.value + 1, second.value);

    let records = reader.read(first, second, TIMEOUT).expect("read");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].position, first);
    assert_eq!(records[0].payload, b"a");
    assert_eq!(records[1].position, second);
    assert_eq!(records[1].payload, b"b");
}

#[test]
fn reader_reports_ending_after_appends() {
    let node = solo();
    let writer = node.log.writer_with_default_retries();
    let reader = node.log.reader();

    assert_eq!(reader.ending().value, 0);
    let position = writer
        .append(b"only".to_vec(), TIMEOUT)
        .expect("append")
        .expect("learned");
    assert_eq!(reader.ending(), position);
}
