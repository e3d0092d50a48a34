use bytes::Bytes;

use crate::core::model::ByteRange;
use crate::core::retry::FetchError;

/// In-memory buffer for one block. Pieces write into disjoint windows of it.
pub struct BlockBuffer {
    range: ByteRange,
    buf: Vec<u8>,
}

impl BlockBuffer {
    pub fn new(range: ByteRange) -> Self {
        Self { range, buf: vec![0; range.size() as usize] }
    }

    /// Carves the buffer into one window per piece.
    ///
    /// `pieces` must tile the block in order, which is what
    /// [`crate::core::planner::split`] produces.
    pub fn windows<I>(&mut self, pieces: I) -> Vec<PieceWindow<'_>>
    where
        I: IntoIterator<Item = ByteRange>,
    {
        let mut rest: &mut [u8] = &mut self.buf;
        let mut next = self.range.begin;
        let mut out = Vec::new();
        for piece in pieces {
            debug_assert_eq!(piece.begin, next, "pieces must be contiguous");
            let (head, tail) = std::mem::take(&mut rest).split_at_mut(piece.size() as usize);
            out.push(PieceWindow { range: piece, buf: head, cursor: 0 });
            rest = tail;
            next = piece.end.wrapping_add(1);
        }
        debug_assert!(rest.is_empty(), "pieces must cover the block");
        out
    }

    pub fn freeze(self) -> Bytes {
        Bytes::from(self.buf)
    }
}

/// A piece's exclusive slice of the block buffer plus its write cursor.
pub struct PieceWindow<'a> {
    range: ByteRange,
    buf: &'a mut [u8],
    cursor: usize,
}

impl PieceWindow<'_> {
    pub fn range(&self) -> ByteRange {
        self.range
    }

    pub fn written(&self) -> u64 {
        self.cursor as u64
    }

    pub fn is_full(&self) -> bool {
        self.cursor == self.buf.len()
    }

    /// The part of the piece still missing, `None` once full.
    pub fn remaining(&self) -> Option<ByteRange> {
        if self.is_full() {
            None
        } else {
            Some(ByteRange { begin: self.range.begin + self.written(), end: self.range.end })
        }
    }

    /// Appends at the cursor. Data past the end of the piece is rejected and
    /// nothing of that chunk is written.
    pub fn write(&mut self, chunk: &[u8]) -> Result<(), FetchError> {
        let end = self.cursor + chunk.len();
        if end > self.buf.len() {
            return Err(FetchError::Overrun { range: self.range, expected: self.range.size() });
        }
        self.buf[self.cursor..end].copy_from_slice(chunk);
        self.cursor = end;
        Ok(())
    }
}
