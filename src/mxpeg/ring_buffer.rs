//! Streaming byte reader with arbitrary look-ahead over a network source.
//!
//! The buffer is a power-of-two sized byte array with three cursors modulo
//! its size: `start` (first retained byte), `pos` (the parse position) and
//! `end` (first unfilled byte). The logical content is `[start, end)`;
//! parsers walk `pos` forward (or backward), then commit the consumed
//! prefix with [`RingBuffer::cut`] or materialise it with
//! [`RingBuffer::get_and_cut`].

use std::io;

use crate::error::{MxpegError, MxpegResult};
use crate::stream::ByteSource;

pub struct RingBuffer<S> {
    buf: Vec<u8>,
    size: usize,
    mask: usize,
    start: usize,
    end: usize,
    pos: usize,
    source: S,
}

impl<S: ByteSource> RingBuffer<S> {
    /// Create a buffer of at least `size` bytes, rounded up to the next
    /// power of two so wraparound arithmetic is a bitwise AND.
    pub fn new(size: usize, source: S) -> Self {
        let mut s = 1;
        while s < size {
            s <<= 1;
        }

        Self {
            buf: vec![0; s],
            size: s,
            mask: s - 1,
            start: 0,
            end: 0,
            pos: 0,
            source,
        }
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
        self.pos = 0;
    }

    fn norm(&self, pos: usize) -> usize {
        pos & self.mask
    }

    /// Ring distance from `start`.
    fn dist(&self, pos: usize) -> usize {
        self.norm(pos.wrapping_sub(self.start))
    }

    /// Pull more bytes from the source into `[end, ...)`.
    async fn fill(&mut self) -> MxpegResult<()> {
        let avail = self.size - 1 - self.dist(self.end);
        if avail == 0 {
            return Err(MxpegError::Overflow);
        }

        let end = self.end;
        let limit = if end >= self.start { self.size } else { self.start };
        let upper = limit.min(end + avail);

        let nr = match self.source.read_into(&mut self.buf[end..upper]).await {
            Ok(0) => return Err(MxpegError::Read(io::ErrorKind::UnexpectedEof.into())),
            Ok(nr) => nr,
            Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                return Err(MxpegError::Closed)
            }
            Err(e) => return Err(MxpegError::Read(e)),
        };

        self.end = self.norm(self.end + nr);
        Ok(())
    }

    async fn fill_to(&mut self, pos: usize) -> MxpegResult<()> {
        while self.dist(pos) > self.dist(self.end) {
            self.fill().await?;
        }
        Ok(())
    }

    /// Byte at the current position, filling from the source as needed.
    /// Does not advance.
    pub async fn get(&mut self) -> MxpegResult<u8> {
        self.fill_to(self.pos + 1).await?;
        Ok(self.buf[self.pos])
    }

    /// [`get`](Self::get) then advance by one.
    pub async fn next(&mut self) -> MxpegResult<u8> {
        let v = self.get().await?;
        self.move_by(1)?;
        Ok(v)
    }

    /// Advance the parse position by `step` (may be negative). Fails with
    /// `Overflow` if the position would end up more than `size - 1` bytes
    /// ahead of `start`.
    pub fn move_by(&mut self, step: isize) -> MxpegResult<()> {
        if self.dist(self.pos) as isize + step >= self.size as isize {
            return Err(MxpegError::Overflow);
        }

        self.pos = self.norm(self.pos.wrapping_add_signed(step));
        Ok(())
    }

    async fn cut_at(&mut self, pos: usize) -> MxpegResult<()> {
        let pos = self.norm(pos);
        self.fill_to(pos).await?;
        self.start = pos;
        Ok(())
    }

    /// Discard `[start, pos)`; the consumed prefix becomes reclaimable.
    pub async fn cut(&mut self) -> MxpegResult<()> {
        self.cut_at(self.pos).await
    }

    /// [`cut`](Self::cut) to `pos + step` instead of `pos`; `-1` retains one
    /// byte of look-ahead after a marker match.
    pub async fn cut_with_step(&mut self, step: isize) -> MxpegResult<()> {
        self.cut_at(self.pos.wrapping_add_signed(step)).await
    }

    /// Copy of `[start, pos)`, then cut.
    pub async fn get_and_cut(&mut self) -> MxpegResult<Vec<u8>> {
        let b = self.copy_range(self.start, self.pos).await?;
        self.cut().await?;
        Ok(b)
    }

    async fn copy_range(&mut self, from: usize, to: usize) -> MxpegResult<Vec<u8>> {
        self.fill_to(to).await?;

        let from = self.norm(from);
        let to = self.norm(to.wrapping_sub(1)) + 1;

        let s = self.norm(to.wrapping_sub(from));
        let mut b = vec![0u8; s];

        if from < to {
            b.copy_from_slice(&self.buf[from..from + s]);
        } else if from > to {
            b[..self.size - from].copy_from_slice(&self.buf[from..]);
            b[self.size - from..].copy_from_slice(&self.buf[..to]);
        }

        Ok(b)
    }
}
