mod common;

use common::{solo, TIMEOUT};
use synod::{Error, Position};

#[test]
fn truncate_hides_entries_below_the_cut() {
    let node = solo();
    let writer = node.log.writer_with_default_retries();
    let reader = node.log.reader();

    let a = writer.append(b"a".to_vec(), TIMEOUT).unwrap().unwrap();
    let b = writer.append(b"b".to_vec(), TIMEOUT).unwrap().unwrap();
    let c = writer.append(b"c".to_vec(), TIMEOUT).unwrap().unwrap();

    writer.truncate(b, TIMEOUT).unwrap();

    let err = reader.read(a, c, TIMEOUT).unwrap_err();
    assert!(matches!(err, Error::Truncated { begin, .. } if begin.value >= b.value));

    let records = reader.read(b, c, TIMEOUT).expect("range at or above the cut still reads");
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].position, b);
    assert_eq!(records[0].payload, b"b");
    assert_eq!(records[1].position, c);
    assert_eq!(records[1].payload, b"c");
}

#[test]
fn truncating_above_the_current_end_is_rejected() {
    let node = solo();
    let writer = node.log.writer_with_default_retries();

    writer.append(b"only".to_vec(), TIMEOUT).unwrap();

    let far_future = Position::new(1_000);
    let err = writer.truncate(far_future, TIMEOUT).unwrap_err();
    assert!(matches!(err, Error::InvalidPosition { requested, .. } if requested == far_future));
}
