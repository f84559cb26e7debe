//! Source-side token corruption.
//!
//! Every operator is a pure function from a row to a new row; the
//! [`NoiseInjector`] decides per row which operator and rate apply and
//! assembles a new [`TokenBatch`]. The input batch is never modified.

use std::{collections::HashSet, fmt, str::FromStr};

use rand::{Rng, SeedableRng, rngs::StdRng, seq::index};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

use crate::{
    BatchError, ConfigError, CorruptionConfig, CurriculumSchedule, Dictionary, RESERVED_SYMBOLS,
    TokenBatch,
};

/// Fraction boundaries of the hybrid operator: replace below the first, remove
/// below the second, swap above.
const HYBRID_THIRDS: (f64, f64) = (1.0 / 3.0, 2.0 / 3.0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoiseType {
    #[default]
    Replace,
    Remove,
    Swap,
    Insert,
    /// Per row, one of replace / remove / swap chosen uniformly.
    Hybrid,
}

impl NoiseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NoiseType::Replace => "replace",
            NoiseType::Remove => "remove",
            NoiseType::Swap => "swap",
            NoiseType::Insert => "insert",
            NoiseType::Hybrid => "hybrid",
        }
    }
}

impl FromStr for NoiseType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "replace" => Ok(NoiseType::Replace),
            "remove" => Ok(NoiseType::Remove),
            "swap" => Ok(NoiseType::Swap),
            "insert" => Ok(NoiseType::Insert),
            "hybrid" => Ok(NoiseType::Hybrid),
            _ => Err(ConfigError::UnknownVariant {
                kind: "noise type",
                value: s.to_string(),
                expected: "replace, remove, swap, insert, hybrid",
            }),
        }
    }
}

impl fmt::Display for NoiseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a row whose requested corruption cannot be sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InfeasiblePolicy {
    /// Leave the row untouched and log a warning.
    #[default]
    Skip,
    /// Abort the injection with [`NoiseError::Infeasible`].
    Fail,
}

impl FromStr for InfeasiblePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "skip" => Ok(InfeasiblePolicy::Skip),
            "fail" => Ok(InfeasiblePolicy::Fail),
            _ => Err(ConfigError::UnknownVariant {
                kind: "infeasible policy",
                value: s.to_string(),
                expected: "skip, fail",
            }),
        }
    }
}

/// Which rows of the batch handed to the encoder are corrupted.
///
/// The loss criterion reads this to decide which half of a doubled batch is
/// the noised one; it never infers it from indices alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseLayout {
    Disabled,
    /// Rows `[0, n/2)` are corrupted, rows `[n/2, n)` are left clean.
    LeadingHalf,
    /// Every row is corrupted independently.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shortfall {
    Positions { requested: usize, available: usize },
    Substitutes { requested: usize, available: usize },
    SwapPairs { requested: usize, available: usize },
}

impl fmt::Display for Shortfall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shortfall::Positions {
                requested,
                available,
            } => write!(f, "{requested} positions requested, {available} eligible"),
            Shortfall::Substitutes {
                requested,
                available,
            } => write!(f, "{requested} substitute ids requested, pool has {available}"),
            Shortfall::SwapPairs {
                requested,
                available,
            } => write!(f, "{requested} swaps requested, {available} disjoint pairs available"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NoiseError {
    #[error("row {row}: infeasible corruption, {shortfall}")]
    Infeasible { row: usize, shortfall: Shortfall },

    #[error(transparent)]
    Batch(#[from] BatchError),
}

/// Eligible positions `[start, end)` of one row. `end` is the terminal
/// (end-of-sequence) position, which is never corrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionSpan {
    pub start: usize,
    pub end: usize,
}

impl CorruptionSpan {
    /// Right-padded rows span `[0, length - 1)`; left-padded rows start at
    /// their first non-pad token and end at the last column.
    pub fn of_row(row: &[i64], length: i64, pad: i64) -> Option<Self> {
        let first = *row.first()?;
        if first != pad {
            let length = usize::try_from(length).ok()?.min(row.len());
            if length == 0 {
                return None;
            }
            Some(Self {
                start: 0,
                end: length - 1,
            })
        } else {
            let start = row.iter().position(|&t| t != pad)?;
            Some(Self {
                start,
                end: row.len() - 1,
            })
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// `ceil(rate * span_len)`, the number of positions a row loses to corruption.
pub fn sample_count(rate: f64, span_len: usize) -> usize {
    (rate * span_len as f64).ceil().max(0.0) as usize
}

fn sample_positions<R: Rng + ?Sized>(
    rng: &mut R,
    span: CorruptionSpan,
    n: usize,
) -> Result<Vec<usize>, Shortfall> {
    if n > span.len() {
        return Err(Shortfall::Positions {
            requested: n,
            available: span.len(),
        });
    }
    Ok(index::sample(rng, span.len(), n)
        .into_iter()
        .map(|i| i + span.start)
        .collect())
}

/// Distinct ids from the `pool` ids past the reserved prefix. When the pool is
/// large enough, the id drawn for slot `k` also differs from `avoid[k]`.
fn sample_substitutes<R: Rng + ?Sized>(
    rng: &mut R,
    pool: usize,
    n: usize,
    avoid: &[i64],
) -> Result<Vec<i64>, Shortfall> {
    if n > pool {
        return Err(Shortfall::Substitutes {
            requested: n,
            available: pool,
        });
    }
    let mut ids: Vec<i64> = index::sample(rng, pool, n)
        .into_iter()
        .map(|i| (i + RESERVED_SYMBOLS) as i64)
        .collect();
    if pool > n && !avoid.is_empty() {
        let mut used: HashSet<i64> = ids.iter().copied().collect();
        for (id, &original) in ids.iter_mut().zip(avoid) {
            if *id != original {
                continue;
            }
            // `original` is in `used`, so at least `pool - n` candidates remain
            let replacement = loop {
                let candidate = (rng.random_range(0..pool) + RESERVED_SYMBOLS) as i64;
                if candidate != original && !used.contains(&candidate) {
                    break candidate;
                }
            };
            used.remove(id);
            used.insert(replacement);
            *id = replacement;
        }
    }
    Ok(ids)
}

/// Overwrites `n` distinct positions of the span with distinct ids drawn from
/// the `pool` non-reserved ids.
pub fn replace_row<R: Rng + ?Sized>(
    rng: &mut R,
    row: &[i64],
    span: CorruptionSpan,
    n: usize,
    pool: usize,
) -> Result<Vec<i64>, Shortfall> {
    let positions = sample_positions(rng, span, n)?;
    let originals: Vec<i64> = positions.iter().map(|&p| row[p]).collect();
    let substitutes = sample_substitutes(rng, pool, n, &originals)?;
    let mut out = row.to_vec();
    for (&pos, &id) in positions.iter().zip(&substitutes) {
        out[pos] = id;
    }
    Ok(out)
}

/// Drops `n` positions of the span, keeps the rest plus the terminal token in
/// order, and left-pads back to the original width.
pub fn remove_row<R: Rng + ?Sized>(
    rng: &mut R,
    row: &[i64],
    span: CorruptionSpan,
    n: usize,
    pad: i64,
) -> Result<Vec<i64>, Shortfall> {
    if n > span.len() {
        return Err(Shortfall::Positions {
            requested: n,
            available: span.len(),
        });
    }
    let mut kept = sample_positions(rng, span, span.len() - n)?;
    kept.sort_unstable();
    kept.push(span.end);

    let mut out = vec![pad; row.len() - kept.len()];
    out.extend(kept.iter().map(|&i| row[i]));
    Ok(out)
}

/// Swaps `n` disjoint adjacent pairs `(i, i + 1)` inside the span. Every pair
/// reads from the untouched input row, so swaps never cascade and the multiset
/// of tokens is conserved.
///
/// A span of `len` positions has `len - 1` adjacent pairs but only `len / 2`
/// of them can be disjoint. Overlapping pairs would move one token twice and
/// duplicate its neighbour, so requests above `len / 2` are a shortfall even
/// when enough overlapping pairs exist.
pub fn swap_row<R: Rng + ?Sized>(
    rng: &mut R,
    row: &[i64],
    span: CorruptionSpan,
    n: usize,
) -> Result<Vec<i64>, Shortfall> {
    // disjoint pairs only, see above
    let available = span.len() / 2;
    if span.len() < 2 || n > available {
        return Err(Shortfall::SwapPairs {
            requested: n,
            available,
        });
    }
    // choosing n of (len - n) slots and shifting the k-th by k yields
    // uniformly drawn, pairwise disjoint pair starts
    let mut slots = index::sample(rng, span.len() - n, n).into_vec();
    slots.sort_unstable();

    let mut out = row.to_vec();
    for (k, slot) in slots.into_iter().enumerate() {
        let i = span.start + slot + k;
        out[i] = row[i + 1];
        out[i + 1] = row[i];
    }
    Ok(out)
}

/// Inserts `n` distinct ids from the `pool` non-reserved ids before `n`
/// distinct span positions.
/// Returns only the valid tokens (span plus terminal), unpadded.
pub fn insert_row<R: Rng + ?Sized>(
    rng: &mut R,
    row: &[i64],
    span: CorruptionSpan,
    n: usize,
    pool: usize,
) -> Result<Vec<i64>, Shortfall> {
    let mut positions = sample_positions(rng, span, n)?;
    positions.sort_unstable();
    let substitutes = sample_substitutes(rng, pool, n, &[])?;

    let mut inserts = positions.into_iter().zip(substitutes).peekable();
    let mut out = Vec::with_capacity(span.len() + 1 + n);
    for (i, &token) in row.iter().enumerate().take(span.end + 1).skip(span.start) {
        while let Some((_, id)) = inserts.next_if(|(p, _)| *p == i) {
            out.push(id);
        }
        out.push(token);
    }
    Ok(out)
}

fn pad_to(tokens: Vec<i64>, width: usize, pad: i64, left: bool) -> Vec<i64> {
    let fill = width.saturating_sub(tokens.len());
    if left {
        let mut out = vec![pad; fill];
        out.extend(tokens);
        out
    } else {
        let mut out = tokens;
        out.resize(width, pad);
        out
    }
}

/// Result of one injection call.
#[derive(Debug, Clone)]
pub struct Injection {
    pub batch: TokenBatch,
    /// Rate applied to each row that was eligible for corruption, in row order.
    pub rates: Vec<f64>,
    /// Rows left untouched because the corruption could not be sampled.
    pub skipped: usize,
}

impl Injection {
    fn unchanged(batch: &TokenBatch) -> Self {
        Self {
            batch: batch.clone(),
            rates: Vec::new(),
            skipped: 0,
        }
    }

    pub fn mean_rate(&self) -> f64 {
        if self.rates.is_empty() {
            0.0
        } else {
            self.rates.iter().sum::<f64>() / self.rates.len() as f64
        }
    }
}

/// Applies the configured corruption to source batches, carrying the curriculum
/// state and a seeded random generator across steps.
#[derive(Debug)]
pub struct NoiseInjector {
    config: CorruptionConfig,
    schedule: Option<CurriculumSchedule>,
    rng: StdRng,
}

impl NoiseInjector {
    pub fn new(config: CorruptionConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let schedule = config.curriculum.clone().map(CurriculumSchedule::new);
        Self {
            config,
            schedule,
            rng,
        }
    }

    pub fn disabled() -> Self {
        Self::new(CorruptionConfig::disabled())
    }

    pub fn config(&self) -> &CorruptionConfig {
        &self.config
    }

    pub fn layout(&self) -> NoiseLayout {
        self.config.layout()
    }

    /// Current curriculum ceiling, if a curriculum is configured.
    pub fn ceiling(&self) -> Option<f64> {
        self.schedule.as_ref().map(CurriculumSchedule::ceiling)
    }

    /// Returns a corrupted copy of `batch`. Outside training, or with noise
    /// disabled, the copy is identical to the input.
    pub fn inject<D: Dictionary + ?Sized>(
        &mut self,
        batch: &TokenBatch,
        dict: &D,
        training: bool,
        num_updates: u64,
    ) -> Result<Injection, NoiseError> {
        if !training || !self.config.enabled || batch.is_empty() {
            return Ok(Injection::unchanged(batch));
        }
        if let Some(schedule) = &mut self.schedule {
            schedule.advance(num_updates);
        }
        let corrupt_rows = if self.config.apply_to_half_batch {
            batch.num_rows() / 2
        } else {
            batch.num_rows()
        };
        match self.config.operator {
            NoiseType::Insert => self.inject_insert(batch, dict, corrupt_rows, num_updates),
            _ => self.inject_in_place(batch, dict, corrupt_rows, num_updates),
        }
    }

    fn row_rate(&mut self, num_updates: u64) -> f64 {
        match &self.schedule {
            Some(schedule) => schedule.sample_rate(num_updates, &mut self.rng),
            None => self.config.base_rate,
        }
    }

    fn row_operator(&mut self) -> NoiseType {
        match self.config.operator {
            NoiseType::Hybrid => {
                let draw: f64 = self.rng.random();
                if draw < HYBRID_THIRDS.0 {
                    NoiseType::Replace
                } else if draw < HYBRID_THIRDS.1 {
                    NoiseType::Remove
                } else {
                    NoiseType::Swap
                }
            }
            operator => operator,
        }
    }

    fn shortfall(&self, row: usize, shortfall: Shortfall) -> Result<(), NoiseError> {
        match self.config.on_infeasible {
            InfeasiblePolicy::Skip => {
                warn!(row, %shortfall, "skipping source corruption for row");
                Ok(())
            }
            InfeasiblePolicy::Fail => Err(NoiseError::Infeasible { row, shortfall }),
        }
    }

    fn inject_in_place<D: Dictionary + ?Sized>(
        &mut self,
        batch: &TokenBatch,
        dict: &D,
        corrupt_rows: usize,
        num_updates: u64,
    ) -> Result<Injection, NoiseError> {
        let pad = dict.pad();
        let mut rows = batch.rows().to_vec();
        let mut lengths = batch.lengths().to_vec();
        let mut rates = Vec::with_capacity(corrupt_rows);
        let mut skipped = 0;

        for i in 0..corrupt_rows {
            let rate = self.row_rate(num_updates);
            rates.push(rate);
            if rate == 0.0 {
                continue;
            }
            let Some(span) = CorruptionSpan::of_row(&rows[i], lengths[i], pad) else {
                continue;
            };
            let n = sample_count(rate, span.len());
            if n == 0 {
                continue;
            }
            let operator = self.row_operator();
            let rng = &mut self.rng;
            let corrupted = match operator {
                NoiseType::Replace => replace_row(rng, &rows[i], span, n, dict.substitute_pool()),
                NoiseType::Remove => remove_row(rng, &rows[i], span, n, pad),
                NoiseType::Swap => swap_row(rng, &rows[i], span, n),
                NoiseType::Insert | NoiseType::Hybrid => {
                    unreachable!("row_operator never yields {operator}")
                }
            };
            match corrupted {
                Ok(row) => {
                    trace!(row = i, %operator, n, rate, "corrupted source row");
                    rows[i] = row;
                    if operator == NoiseType::Remove {
                        lengths[i] -= n as i64;
                    }
                }
                Err(shortfall) => {
                    self.shortfall(i, shortfall)?;
                    skipped += 1;
                }
            }
        }

        Ok(Injection {
            batch: TokenBatch::from_parts_unchecked(rows, lengths, batch.width()),
            rates,
            skipped,
        })
    }

    /// Insertion grows rows, so the whole batch widens by the largest
    /// insertion count (at least one column once any row drew a non-zero
    /// rate). Rows keep their padding side. When every rate is zero the batch
    /// comes back unchanged.
    fn inject_insert<D: Dictionary + ?Sized>(
        &mut self,
        batch: &TokenBatch,
        dict: &D,
        corrupt_rows: usize,
        num_updates: u64,
    ) -> Result<Injection, NoiseError> {
        let pad = dict.pad();
        let mut lengths = batch.lengths().to_vec();
        let mut rates = Vec::with_capacity(corrupt_rows);
        let mut contents: Vec<Option<Vec<i64>>> = vec![None; batch.num_rows()];
        let mut skipped = 0;
        let mut grow = 1;
        let mut attempted = false;

        for (i, content) in contents.iter_mut().enumerate().take(corrupt_rows) {
            let rate = self.row_rate(num_updates);
            rates.push(rate);
            if rate == 0.0 {
                continue;
            }
            attempted = true;
            let row = batch.row(i);
            let Some(span) = CorruptionSpan::of_row(row, lengths[i], pad) else {
                continue;
            };
            let n = sample_count(rate, span.len());
            if n == 0 {
                continue;
            }
            match insert_row(&mut self.rng, row, span, n, dict.substitute_pool()) {
                Ok(tokens) => {
                    trace!(row = i, n, rate, "inserted into source row");
                    *content = Some(tokens);
                    lengths[i] += n as i64;
                    grow = grow.max(n);
                }
                Err(shortfall) => {
                    self.shortfall(i, shortfall)?;
                    skipped += 1;
                }
            }
        }

        if !attempted {
            return Ok(Injection {
                batch: batch.clone(),
                rates,
                skipped,
            });
        }

        let width = batch.width() + grow;
        let rows = contents
            .into_iter()
            .enumerate()
            .map(|(i, content)| {
                let left = batch.is_left_padded(i, pad);
                match content {
                    Some(tokens) => pad_to(tokens, width, pad, left),
                    None => {
                        let original = batch.row(i);
                        let valid = if left {
                            original.iter().skip_while(|&&t| t == pad).copied().collect()
                        } else {
                            original.to_vec()
                        };
                        pad_to(valid, width, pad, left)
                    }
                }
            })
            .collect();

        Ok(Injection {
            batch: TokenBatch::from_parts_unchecked(rows, lengths, width),
            rates,
            skipped,
        })
    }
}
