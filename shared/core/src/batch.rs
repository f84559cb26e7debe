use std::ops::Range;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch has {rows} rows but {lengths} lengths")]
    LengthCountMismatch { rows: usize, lengths: usize },

    #[error("row {row} has width {width}, expected {expected}")]
    RaggedRow {
        row: usize,
        width: usize,
        expected: usize,
    },

    #[error("row {row} has stored length {length}, outside [0, {width}]")]
    InvalidLength { row: usize, length: i64, width: usize },

    #[error("flat buffer of {len} tokens does not split into rows of width {width}")]
    FlatShape { len: usize, width: usize },
}

/// A fixed-width grid of token ids plus each row's valid length.
///
/// A row is either right-padded (valid tokens first, then pad) or
/// left-padded (a run of pad, then the valid tokens).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    rows: Vec<Vec<i64>>,
    lengths: Vec<i64>,
    width: usize,
}

impl TokenBatch {
    pub fn new(rows: Vec<Vec<i64>>, lengths: Vec<i64>) -> Result<Self, BatchError> {
        if rows.len() != lengths.len() {
            return Err(BatchError::LengthCountMismatch {
                rows: rows.len(),
                lengths: lengths.len(),
            });
        }
        let width = rows.first().map(Vec::len).unwrap_or(0);
        for (row, tokens) in rows.iter().enumerate() {
            if tokens.len() != width {
                return Err(BatchError::RaggedRow {
                    row,
                    width: tokens.len(),
                    expected: width,
                });
            }
        }
        for (row, &length) in lengths.iter().enumerate() {
            if length < 0 || length as usize > width {
                return Err(BatchError::InvalidLength { row, length, width });
            }
        }
        Ok(Self {
            rows,
            lengths,
            width,
        })
    }

    /// Builds a batch from a row-major flat buffer, the layout tensors are read back in.
    pub fn from_flat(tokens: &[i64], width: usize, lengths: Vec<i64>) -> Result<Self, BatchError> {
        if width == 0 || tokens.len() % width != 0 {
            if tokens.is_empty() && lengths.is_empty() {
                return Self::new(Vec::new(), lengths);
            }
            return Err(BatchError::FlatShape {
                len: tokens.len(),
                width,
            });
        }
        let rows = tokens.chunks(width).map(<[i64]>::to_vec).collect();
        Self::new(rows, lengths)
    }

    /// Builds a right-padded batch from unpadded sequences.
    pub fn right_padded(sequences: &[Vec<i64>], pad: i64) -> Self {
        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let rows = sequences
            .iter()
            .map(|s| {
                let mut row = s.clone();
                row.resize(width, pad);
                row
            })
            .collect();
        let lengths = sequences.iter().map(|s| s.len() as i64).collect();
        Self {
            rows,
            lengths,
            width,
        }
    }

    /// Builds a left-padded batch from unpadded sequences.
    pub fn left_padded(sequences: &[Vec<i64>], pad: i64) -> Self {
        let width = sequences.iter().map(Vec::len).max().unwrap_or(0);
        let rows = sequences
            .iter()
            .map(|s| {
                let mut row = vec![pad; width - s.len()];
                row.extend_from_slice(s);
                row
            })
            .collect();
        let lengths = sequences.iter().map(|s| s.len() as i64).collect();
        Self {
            rows,
            lengths,
            width,
        }
    }

    pub(crate) fn from_parts_unchecked(rows: Vec<Vec<i64>>, lengths: Vec<i64>, width: usize) -> Self {
        Self {
            rows,
            lengths,
            width,
        }
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn rows(&self) -> &[Vec<i64>] {
        &self.rows
    }

    pub fn row(&self, i: usize) -> &[i64] {
        &self.rows[i]
    }

    pub fn lengths(&self) -> &[i64] {
        &self.lengths
    }

    pub fn is_left_padded(&self, i: usize, pad: i64) -> bool {
        self.rows[i].first() == Some(&pad)
    }

    /// Row-major copy of the token grid.
    pub fn to_flat(&self) -> Vec<i64> {
        self.rows.iter().flatten().copied().collect()
    }

    /// Count of non-pad tokens in the whole batch.
    pub fn ntokens(&self, pad: i64) -> usize {
        self.rows.iter().flatten().filter(|&&t| t != pad).count()
    }

    /// The `[batch; batch]` concatenation fed to the model for the consistency loss.
    pub fn doubled(&self) -> Self {
        let mut rows = self.rows.clone();
        rows.extend(self.rows.iter().cloned());
        let mut lengths = self.lengths.clone();
        lengths.extend_from_slice(&self.lengths);
        Self {
            rows,
            lengths,
            width: self.width,
        }
    }

    /// Row range of the leading half, the half that carries corruption in a doubled batch.
    pub fn leading_half(&self) -> Range<usize> {
        0..self.rows.len() / 2
    }

    /// Row range of the trailing half, the clean copy in a doubled batch.
    pub fn trailing_half(&self) -> Range<usize> {
        self.rows.len() / 2..self.rows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: i64 = 1;

    #[test]
    fn test_new_validates_shape() {
        assert_eq!(
            TokenBatch::new(vec![vec![4, 5], vec![6]], vec![2, 1]),
            Err(BatchError::RaggedRow {
                row: 1,
                width: 1,
                expected: 2
            })
        );
        assert_eq!(
            TokenBatch::new(vec![vec![4, 5]], vec![2, 2]),
            Err(BatchError::LengthCountMismatch { rows: 1, lengths: 2 })
        );
        assert_eq!(
            TokenBatch::new(vec![vec![4, 5]], vec![3]),
            Err(BatchError::InvalidLength {
                row: 0,
                length: 3,
                width: 2
            })
        );
    }

    #[test]
    fn test_padding_constructors() {
        let seqs = vec![vec![4, 5, 2], vec![6, 2]];
        let right = TokenBatch::right_padded(&seqs, PAD);
        assert_eq!(right.row(1), &[6, 2, PAD]);
        assert!(!right.is_left_padded(1, PAD));

        let left = TokenBatch::left_padded(&seqs, PAD);
        assert_eq!(left.row(1), &[PAD, 6, 2]);
        assert!(left.is_left_padded(1, PAD));
        assert_eq!(left.lengths(), &[3, 2]);
        assert_eq!(left.ntokens(PAD), 5);
    }

    #[test]
    fn test_flat_roundtrip_and_doubling() {
        let batch = TokenBatch::from_flat(&[4, 5, 2, PAD, 6, 2], 3, vec![3, 2]).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.to_flat(), vec![4, 5, 2, PAD, 6, 2]);

        let doubled = batch.doubled();
        assert_eq!(doubled.num_rows(), 4);
        assert_eq!(doubled.lengths(), &[3, 2, 3, 2]);
        assert_eq!(doubled.leading_half(), 0..2);
        assert_eq!(doubled.trailing_half(), 2..4);
        assert_eq!(doubled.row(2), batch.row(0));

        assert!(TokenBatch::from_flat(&[4, 5, 2], 2, vec![2]).is_err());
    }
}
