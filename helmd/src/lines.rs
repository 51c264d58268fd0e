//!
//! Newline delimited framing shared by the peer, rpc and getwork sockets.
//!

use std::io;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader},
    sync::mpsc::{Receiver, Sender, channel, error::TrySendError},
};

/// Longest line accepted from a remote socket, newline excluded
pub const MAX_LINE_LENGTH: usize = 256 * 1024;

/// Outgoing lines buffered per connection before new ones are dropped
pub const QUEUE_CAPACITY: usize = 1024;

pub type LineSender = Sender<String>;

pub type LineReceiver = Receiver<String>;

pub fn line_queue() -> (LineSender, LineReceiver) {
    channel(QUEUE_CAPACITY)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// The queue is full, the line was dropped
    Dropped,
    /// The receiving side is gone
    Closed,
}

/// Queues `line` without waiting on a slow connection
pub fn offer_line(sender: &LineSender, line: String) -> Offer {
    match sender.try_send(line) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(_)) => Offer::Dropped,
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}

/// Reads lines of at most `limit` bytes. A longer line fails with [`io::ErrorKind::InvalidData`].
pub struct LineReader<R> {
    reader: BufReader<R>,
    limit: usize,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(read: R) -> Self {
        Self::with_limit(read, MAX_LINE_LENGTH)
    }

    pub fn with_limit(read: R, limit: usize) -> Self {
        Self { reader: BufReader::new(read), limit, buf: Vec::new() }
    }

    /// Next line without its terminator, `None` at end of stream
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        self.buf.clear();
        let read = (&mut self.reader).take(self.limit as u64 + 1).read_until(b'\n', &mut self.buf).await?;
        if read == 0 {
            return Ok(None);
        }
        if self.buf.last() == Some(&b'\n') {
            self.buf.pop();
            if self.buf.last() == Some(&b'\r') {
                self.buf.pop();
            }
        } else if self.buf.len() > self.limit {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("line exceeds {} bytes", self.limit)));
        }
        String::from_utf8(std::mem::take(&mut self.buf)).map(Some).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }
}
