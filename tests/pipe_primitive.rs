//! The bounded pipe primitive, exercised standalone (no network involved): capacity, EOF
//! stickiness, and the closed/errored terminal states.

use pipewire_http::{channel, Kind};

#[test]
fn try_write_would_block_past_capacity() {
    let (reader, writer) = channel::<u32>(1);

    writer.try_write(Some(1)).unwrap();
    let err = writer.try_write(Some(2)).unwrap_err();
    assert_eq!(err.kind(), &Kind::WouldBlock);

    // Draining one slot lets a further write through.
    assert_eq!(reader.try_read().unwrap(), Some(1));
    writer.try_write(Some(2)).unwrap();
    assert_eq!(reader.try_read().unwrap(), Some(2));
}

#[test]
fn eof_is_sticky_once_the_queue_drains() {
    let (reader, writer) = channel::<u32>(4);

    writer.try_write(Some(1)).unwrap();
    writer.try_write(None).unwrap();

    // The queued message is still delivered before EOF surfaces.
    assert_eq!(reader.try_read().unwrap(), Some(1));
    assert_eq!(reader.try_read().unwrap(), None);
    // And EOF keeps being reported on every call after, not just the first.
    assert_eq!(reader.try_read().unwrap(), None);
    assert!(reader.is_eof());

    // Writing anything past EOF is a fatal, not a would-block, condition.
    let err = writer.try_write(Some(2)).unwrap_err();
    assert_eq!(err.kind(), &Kind::BrokenPipe);
}

#[test]
fn close_tears_down_both_ends() {
    let (reader, writer) = channel::<u32>(4);
    writer.try_write(Some(1)).unwrap();

    reader.close();

    assert_eq!(reader.try_read().unwrap_err().kind(), &Kind::Closed);
    assert_eq!(writer.try_write(Some(2)).unwrap_err().kind(), &Kind::Closed);
}

#[test]
fn set_error_propagates_to_both_ends() {
    // Borrow a real `Error` value off a second, already-closed pipe rather than constructing
    // one directly — the engine never exposes a public `Error` constructor.
    let (borrowed_reader, _borrowed_writer) = channel::<()>(1);
    borrowed_reader.close();
    let err = borrowed_reader.try_read().unwrap_err();
    assert_eq!(err.kind(), &Kind::Closed);

    let (reader, writer) = channel::<u32>(4);
    writer.set_error(err);

    assert_eq!(reader.try_read().unwrap_err().kind(), &Kind::Closed);
    assert_eq!(writer.try_write(Some(1)).unwrap_err().kind(), &Kind::Closed);
}

#[tokio::test]
async fn async_read_wakes_once_a_message_is_written() {
    let (reader, writer) = channel::<&'static str>(1);

    let reading = tokio::spawn(async move { reader.read().await });

    // Give the reader task a chance to park on the empty queue before we write.
    tokio::task::yield_now().await;
    writer.write(Some("hello")).await.unwrap();

    assert_eq!(reading.await.unwrap().unwrap(), Some("hello"));
}
