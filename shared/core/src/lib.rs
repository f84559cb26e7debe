//! Source-side noise injection, curriculum scheduling and loss bookkeeping for
//! robust neural machine translation training. Nothing here touches tensors.

mod batch;
mod config;
mod curriculum;
mod dictionary;
mod noise;
mod record;

pub use batch::{BatchError, TokenBatch};
pub use config::{ConfigError, CorruptionConfig, CriterionArgs, KlDirection, NllSubset, NoiseArgs};
pub use curriculum::{
    CurriculumConfig, CurriculumSchedule, RateSampling, ScheduleDirection, curriculum_rate,
};
pub use dictionary::{
    BOS_SYMBOL, Dictionary, EOS_SYMBOL, PAD_SYMBOL, RESERVED_SYMBOLS, UNK_SYMBOL, Vocabulary,
};
pub use noise::{
    CorruptionSpan, InfeasiblePolicy, Injection, NoiseError, NoiseInjector, NoiseLayout,
    NoiseType, Shortfall, insert_row, remove_row, replace_row, sample_count, swap_row,
};
pub use record::{
    AverageMeter, DerivedMetric, LoggingRecord, Meters, MetricsSink, get_perplexity,
    reduce_metrics, safe_round,
};
