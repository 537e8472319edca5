//! The bounded typed pipe primitive (§4.6).
//!
//! A [`Pipe`] is a bounded FIFO of typed messages with an end-of-stream sentinel, safe to share
//! across threads (§5, "the auxiliary pipe primitive is the only construct explicitly safe for
//! cross-thread use"). It backs worker-thread signalling inside the engine — e.g. handing a
//! resolved address or a completed write back to a `Connection`'s task — and is exposed as a
//! public building block for callers wiring their own cross-task handoffs.
//!
//! Unlike the rest of the engine, which treats the event loop as an externally supplied
//! reactor (§5, "Event-loop coupling"), this primitive's descriptors are realized directly in
//! terms of the Tokio reactor we've standardized on: `read_descr`/`write_descr` return handles
//! whose `ready()` future resolves exactly when the corresponding operation would not block,
//! which is what a hand-rolled poll/select reactor would otherwise be told to watch.

use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex},
};

use tokio::sync::Notify;

use crate::error::{Error, Result};

struct Shared<T> {
    state: Mutex<State<T>>,
    read_ready: Notify,
    write_ready: Notify,
}

enum State<T> {
    Open {
        queue: VecDeque<T>,
        capacity: usize,
        writer_eof: bool,
    },
    Errored(Error),
    Closed,
}

/// Creates a bounded pipe of capacity `capacity` (messages, not bytes), returning the read and
/// write ends. `capacity` of zero behaves as capacity one: a single message may be in flight
/// before the writer must wait for the reader to drain it.
pub fn channel<T>(capacity: usize) -> (PipeReader<T>, PipeWriter<T>) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Open {
            queue: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            writer_eof: false,
        }),
        read_ready: Notify::new(),
        write_ready: Notify::new(),
    });
    (
        PipeReader { shared: shared.clone() },
        PipeWriter { shared },
    )
}

/// The read end of a [`channel`]. Cloning shares the same underlying queue.
pub struct PipeReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for PipeReader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeReader").finish_non_exhaustive()
    }
}

/// The write end of a [`channel`]. Cloning shares the same underlying queue.
pub struct PipeWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> fmt::Debug for PipeWriter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeWriter").finish_non_exhaustive()
    }
}

/// A stable, cloneable handle usable to wait for a pipe end to become ready, the way a reactor
/// would watch a file descriptor. The same handle is returned by repeated calls to
/// `PipeReader::descriptor`/`PipeWriter::descriptor`.
#[derive(Clone)]
pub struct PipeDescriptor<T> {
    shared: Arc<Shared<T>>,
    kind: DescriptorKind,
}

impl<T> fmt::Debug for PipeDescriptor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipeDescriptor").field("kind", &self.kind).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum DescriptorKind {
    Read,
    Write,
}

impl<T> PipeDescriptor<T> {
    /// Resolves once the watched end is ready: for a read descriptor, when a message or EOF is
    /// available; for a write descriptor, when there is queue capacity or the pipe has errored
    /// or closed (so the caller can observe the failure instead of blocking forever).
    pub async fn ready(&self) {
        loop {
            {
                let state = self.shared.state.lock().unwrap();
                match (&*state, self.kind) {
                    (State::Open { queue, writer_eof, .. }, DescriptorKind::Read) => {
                        if !queue.is_empty() || *writer_eof {
                            return;
                        }
                    }
                    (State::Open { queue, capacity, .. }, DescriptorKind::Write) => {
                        if queue.len() < *capacity {
                            return;
                        }
                    }
                    (State::Errored(_), _) | (State::Closed, _) => return,
                }
            }
            let notified = match self.kind {
                DescriptorKind::Read => self.shared.read_ready.notified(),
                DescriptorKind::Write => self.shared.write_ready.notified(),
            };
            notified.await;
        }
    }
}

impl<T> PipeReader<T> {
    /// Reads the next message, waiting if none is queued yet. Returns `Ok(None)` once the
    /// writer has signalled EOF and the queue has drained — and continues returning `Ok(None)`
    /// on every call thereafter (EOF is sticky).
    pub async fn read(&self) -> Result<Option<T>> {
        loop {
            match self.try_read() {
                Err(e) if e.kind() == &crate::error::Kind::WouldBlock => {
                    self.shared.read_ready.notified().await;
                }
                other => return other,
            }
        }
    }

    /// Non-blocking read: returns `Err(would_block)` if the queue is empty and the writer has
    /// not signalled EOF yet.
    pub fn try_read(&self) -> Result<Option<T>> {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            State::Open { queue, writer_eof, .. } => {
                if let Some(msg) = queue.pop_front() {
                    self.shared.write_ready.notify_one();
                    Ok(Some(msg))
                } else if *writer_eof {
                    Ok(None)
                } else {
                    Err(Error::would_block())
                }
            }
            State::Errored(e) => Err(e.clone()),
            State::Closed => Err(Error::closed()),
        }
    }

    /// Number of messages currently queued.
    pub fn len(&self) -> usize {
        match &*self.shared.state.lock().unwrap() {
            State::Open { queue, .. } => queue.len(),
            _ => 0,
        }
    }

    /// True if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if the writer has signalled EOF (regardless of whether the queue has drained).
    pub fn is_eof(&self) -> bool {
        matches!(&*self.shared.state.lock().unwrap(), State::Open { writer_eof: true, .. })
    }

    /// Tears down the pipe; every subsequent operation on either end fails with `closed`.
    pub fn close(&self) {
        close(&self.shared);
    }

    /// Forces every subsequent operation on either end to fail with `err`.
    pub fn set_error(&self, err: Error) {
        set_error(&self.shared, err);
    }

    /// Returns this reader's stable descriptor.
    pub fn descriptor(&self) -> PipeDescriptor<T> {
        PipeDescriptor {
            shared: self.shared.clone(),
            kind: DescriptorKind::Read,
        }
    }
}

impl<T> PipeWriter<T> {
    /// Enqueues `msg`, waiting if the pipe is at capacity. `None` signals EOF: after this call
    /// succeeds, all further writes fail with `broken_pipe`.
    pub async fn write(&self, msg: Option<T>) -> Result<()> {
        let mut pending = msg;
        loop {
            match self.try_write_inner(pending) {
                Ok(()) => return Ok(()),
                Err(WriteError::Full(returned)) => {
                    pending = Some(returned);
                    self.shared.write_ready.notified().await;
                }
                Err(WriteError::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Non-blocking write: returns `Err(would_block)` if the queue is at capacity.
    pub fn try_write(&self, msg: Option<T>) -> Result<()> {
        self.try_write_inner(msg).map_err(|e| match e {
            WriteError::Full(_) => Error::would_block(),
            WriteError::Fatal(e) => e,
        })
    }

    /// Like `try_write`, but on a would-block condition hands the message back so the async
    /// `write` retry loop doesn't need `T: Clone`.
    fn try_write_inner(&self, msg: Option<T>) -> std::result::Result<(), WriteError<T>> {
        let mut state = self.shared.state.lock().unwrap();
        match &mut *state {
            State::Open { queue, capacity, writer_eof } => {
                if *writer_eof {
                    return Err(WriteError::Fatal(Error::broken_pipe()));
                }
                match msg {
                    None => {
                        *writer_eof = true;
                        self.shared.read_ready.notify_waiters();
                        Ok(())
                    }
                    Some(m) => {
                        if queue.len() >= *capacity {
                            Err(WriteError::Full(m))
                        } else {
                            queue.push_back(m);
                            self.shared.read_ready.notify_one();
                            Ok(())
                        }
                    }
                }
            }
            State::Errored(e) => Err(WriteError::Fatal(e.clone())),
            State::Closed => Err(WriteError::Fatal(Error::closed())),
        }
    }

    /// Tears down the pipe; every subsequent operation on either end fails with `closed`.
    pub fn close(&self) {
        close(&self.shared);
    }

    /// Forces every subsequent operation on either end to fail with `err`.
    pub fn set_error(&self, err: Error) {
        set_error(&self.shared, err);
    }

    /// Returns this writer's stable descriptor.
    pub fn descriptor(&self) -> PipeDescriptor<T> {
        PipeDescriptor {
            shared: self.shared.clone(),
            kind: DescriptorKind::Write,
        }
    }
}

enum WriteError<T> {
    /// The queue was at capacity; the message is handed back so the caller can retry.
    Full(T),
    /// The pipe has errored or closed; retrying cannot help.
    Fatal(Error),
}

fn close<T>(shared: &Arc<Shared<T>>) {
    let mut state = shared.state.lock().unwrap();
    *state = State::Closed;
    shared.read_ready.notify_waiters();
    shared.write_ready.notify_waiters();
}

fn set_error<T>(shared: &Arc<Shared<T>>, err: Error) {
    let mut state = shared.state.lock().unwrap();
    *state = State::Errored(err);
    shared.read_ready.notify_waiters();
    shared.write_ready.notify_waiters();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn eof_is_sticky_and_fifo_order_preserved() {
        let (reader, writer) = channel::<char>(2);
        writer.try_write(Some('a')).unwrap();
        writer.try_write(Some('b')).unwrap();
        writer.try_write(None).unwrap();

        assert_eq!(reader.try_read().unwrap(), Some('a'));
        assert_eq!(reader.try_read().unwrap(), Some('b'));
        assert_eq!(reader.try_read().unwrap(), None);
        assert_eq!(reader.try_read().unwrap(), None);
    }

    #[tokio::test]
    async fn write_after_eof_fails_broken_pipe() {
        let (_reader, writer) = channel::<u8>(1);
        writer.try_write(None).unwrap();
        let err = writer.try_write(Some(1)).unwrap_err();
        assert_eq!(err.kind(), &crate::error::Kind::BrokenPipe);
    }

    #[tokio::test]
    async fn nonblocking_write_at_capacity_would_block() {
        let (_reader, writer) = channel::<u8>(1);
        writer.try_write(Some(1)).unwrap();
        let err = writer.try_write(Some(2)).unwrap_err();
        assert_eq!(err.kind(), &crate::error::Kind::WouldBlock);
    }

    #[tokio::test]
    async fn set_error_poisons_both_ends() {
        let (reader, writer) = channel::<u8>(1);
        writer.set_error(Error::bad_message("boom"));
        assert!(matches!(reader.try_read(), Err(e) if matches!(e.kind(), crate::error::Kind::BadMessage(_))));
        assert!(matches!(writer.try_write(Some(1)), Err(e) if matches!(e.kind(), crate::error::Kind::BadMessage(_))));
    }

    #[tokio::test]
    async fn close_fails_everything_with_closed() {
        let (reader, writer) = channel::<u8>(1);
        reader.close();
        assert_eq!(reader.try_read().unwrap_err().kind(), &crate::error::Kind::Closed);
        assert_eq!(writer.try_write(Some(1)).unwrap_err().kind(), &crate::error::Kind::Closed);
    }

    #[tokio::test]
    async fn async_read_waits_for_message() {
        let (reader, writer) = channel::<u32>(4);
        let handle = tokio::spawn(async move { reader.read().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        writer.try_write(Some(42)).unwrap();
        let got = handle.await.unwrap().unwrap();
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn descriptor_ready_resolves_on_eof() {
        let (reader, writer) = channel::<u8>(1);
        let descr = reader.descriptor();
        writer.try_write(None).unwrap();
        descr.ready().await;
        assert_eq!(reader.try_read().unwrap(), None);
    }
}
