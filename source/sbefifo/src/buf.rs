//! Word ring buffers
//!
//! Each client owns two of these: one staging bytes it has written until the
//! poller pushes them into the upstream FIFO, one collecting response words
//! until the client reads them out.
//!
//! A `FifoBuf` has exactly one producer and one consumer. It does no locking
//! of its own; every mutation happens under the device lock. The cursors and
//! the full flag are atomics so readiness can be sampled without that lock.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use crate::{error::Error, regs::WORD_SIZE};

/// Capacity of every ring, in words.
pub const BUF_WORDS: usize = 32;

/// Capacity of every ring, in bytes.
pub const BUF_BYTES: usize = BUF_WORDS * WORD_SIZE;

pub struct FifoBuf {
    words: [AtomicU32; BUF_WORDS],
    rpos: AtomicUsize,
    wpos: AtomicUsize,
    // `rpos == wpos` is ambiguous on its own; this says which way.
    full: AtomicBool,
}

/// Fails with [`Error::Unaligned`] unless `len` is a whole number of words.
pub(crate) fn check_aligned(len: usize) -> Result<usize, Error> {
    if len % WORD_SIZE != 0 {
        return Err(Error::Unaligned(len));
    }
    Ok(len / WORD_SIZE)
}

impl FifoBuf {
    pub fn new() -> Self {
        Self {
            words: core::array::from_fn(|_| AtomicU32::new(0)),
            rpos: AtomicUsize::new(0),
            wpos: AtomicUsize::new(0),
            full: AtomicBool::new(false),
        }
    }

    /// Empties the buffer.
    pub fn reset(&self) {
        self.full.store(false, Ordering::Release);
        self.rpos.store(0, Ordering::Release);
        self.wpos.store(0, Ordering::Release);
    }

    pub fn readable_words(&self) -> usize {
        if self.full.load(Ordering::Acquire) {
            return BUF_WORDS;
        }
        let rpos = self.rpos.load(Ordering::Acquire);
        let wpos = self.wpos.load(Ordering::Acquire);
        (wpos + BUF_WORDS - rpos) % BUF_WORDS
    }

    pub fn writable_words(&self) -> usize {
        BUF_WORDS - self.readable_words()
    }

    pub fn readable_bytes(&self) -> usize {
        self.readable_words() * WORD_SIZE
    }

    pub fn writable_bytes(&self) -> usize {
        self.writable_words() * WORD_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.readable_words() == 0
    }

    pub fn is_full(&self) -> bool {
        self.full.load(Ordering::Acquire)
    }

    /// Marks `n` bytes as consumed. Returns `true` if the buffer is now empty.
    pub fn commit_read(&self, n: usize) -> Result<bool, Error> {
        let words = check_aligned(n)?;
        if words > self.readable_words() {
            return Err(Error::Protocol("ring read past the write cursor"));
        }
        if words > 0 {
            self.full.store(false, Ordering::Release);
        }
        let rpos = (self.rpos.load(Ordering::Acquire) + words) % BUF_WORDS;
        self.rpos.store(rpos, Ordering::Release);
        Ok(self.is_empty())
    }

    /// Marks `n` bytes as produced. Returns `true` if the buffer is now full.
    pub fn commit_write(&self, n: usize) -> Result<bool, Error> {
        let words = check_aligned(n)?;
        if words > self.writable_words() {
            return Err(Error::Protocol("ring write past the read cursor"));
        }
        let wpos = (self.wpos.load(Ordering::Acquire) + words) % BUF_WORDS;
        if words > 0 && wpos == self.rpos.load(Ordering::Acquire) {
            self.full.store(true, Ordering::Release);
        }
        self.wpos.store(wpos, Ordering::Release);
        Ok(self.is_full())
    }

    /// The oldest unread word, if any.
    pub(crate) fn front(&self) -> Option<u32> {
        if self.is_empty() {
            return None;
        }
        let rpos = self.rpos.load(Ordering::Acquire);
        Some(self.words[rpos].load(Ordering::Relaxed))
    }

    /// Appends one word. Returns `false` if there was no room.
    pub(crate) fn push(&self, word: u32) -> bool {
        if self.is_full() {
            return false;
        }
        let wpos = self.wpos.load(Ordering::Acquire);
        self.words[wpos].store(word, Ordering::Relaxed);
        // cannot fail, there was room for one word
        self.commit_write(WORD_SIZE).is_ok()
    }

    /// Copies as many whole words from `data` as fit and commits them.
    /// Returns the number of bytes taken.
    pub(crate) fn fill_from(&self, data: &[u8]) -> Result<usize, Error> {
        check_aligned(data.len())?;
        let words = (data.len() / WORD_SIZE).min(self.writable_words());
        let wpos = self.wpos.load(Ordering::Acquire);
        for (i, chunk) in data.chunks_exact(WORD_SIZE).take(words).enumerate() {
            let word = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            self.words[(wpos + i) % BUF_WORDS].store(word, Ordering::Relaxed);
        }
        let n = words * WORD_SIZE;
        self.commit_write(n)?;
        Ok(n)
    }

    /// Copies as many whole words into `out` as are available and commits
    /// the read. Returns the number of bytes copied and whether the buffer is
    /// now empty.
    pub(crate) fn drain_into(&self, out: &mut [u8]) -> Result<(usize, bool), Error> {
        check_aligned(out.len())?;
        let words = (out.len() / WORD_SIZE).min(self.readable_words());
        let rpos = self.rpos.load(Ordering::Acquire);
        for (i, chunk) in out.chunks_exact_mut(WORD_SIZE).take(words).enumerate() {
            let word = self.words[(rpos + i) % BUF_WORDS].load(Ordering::Relaxed);
            chunk.copy_from_slice(&word.to_ne_bytes());
        }
        let n = words * WORD_SIZE;
        let empty = self.commit_read(n)?;
        Ok((n, empty))
    }
}

impl Default for FifoBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// The pair of rings belonging to one client.
#[derive(Default)]
pub(crate) struct Rings {
    /// Response words, filled by the poller, drained by the client.
    pub(crate) rbuf: FifoBuf,
    /// Request words, filled by the client, drained by the poller.
    pub(crate) wbuf: FifoBuf,
}
