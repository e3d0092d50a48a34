use crate::core::model::ByteRange;

/// Tiles `range` into consecutive chunks of at most `chunk_size` bytes.
///
/// The last chunk always ends at `range.end`. A `chunk_size` of zero is
/// treated as one.
pub fn split(range: ByteRange, chunk_size: u64) -> Split {
    Split {
        next_begin: Some(range.begin),
        end: range.end,
        chunk_size: chunk_size.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct Split {
    next_begin: Option<u64>,
    end: u64,
    chunk_size: u64,
}

impl Iterator for Split {
    type Item = ByteRange;

    fn next(&mut self) -> Option<ByteRange> {
        let begin = self.next_begin?;
        let end = begin
            .checked_add(self.chunk_size - 1)
            .map_or(self.end, |e| e.min(self.end));
        self.next_begin = if end == self.end { None } else { Some(end + 1) };
        Some(ByteRange { begin, end })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self.next_begin {
            None => (0, Some(0)),
            Some(begin) => {
                let n = (self.end - begin) / self.chunk_size + 1;
                let n = usize::try_from(n).unwrap_or(usize::MAX);
                (n, Some(n))
            }
        }
    }
}
