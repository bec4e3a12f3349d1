//! External transcoder invocation and progress parsing.

mod parser;
mod records;
mod runner;

pub use parser::{
    ProgressParser, ProgressRecord, TranscodeProgress, estimate, parse_duration_announcement,
    parse_speed_value, parse_stats_line, parse_time,
};
pub use records::RecordReader;
pub use runner::Transcoder;
