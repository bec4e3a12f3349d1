//! FFmpeg diagnostic output parsing.
//!
//! Pure functions and a small stateful parser, independent from process
//! plumbing. Two progress formats are understood:
//!
//! - the classic stats line `frame=  100 fps=25 ... time=00:00:04.00 ... speed=1.00x`
//! - `-progress` blocks of one `key=value` per line, closed by `progress=continue|end`

use crate::domain::REMAINING_UNKNOWN;

/// Progress derived from one record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TranscodeProgress {
    /// Percentage in `0..=100`, rounded to two decimals.
    pub percent: f64,
    /// Estimated seconds left, or `-1` when unknown.
    pub remaining: f64,
}

/// Raw values of one progress record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressRecord {
    pub frame: u64,
    /// Seconds of media processed so far.
    pub elapsed_secs: f64,
    /// Processing speed multiplier, `None` when missing or unparsable.
    pub speed: Option<f64>,
}

/// Parse time string in HH:MM:SS.ms format to seconds.
///
/// Negative or otherwise malformed values (FFmpeg prints those before the
/// first packet) yield `None`.
pub fn parse_time(time_str: &str) -> Option<f64> {
    let mut parts = time_str.trim().split(':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Parse a speed multiplier value such as `1.25x`.
pub fn parse_speed_value(value: &str) -> Option<f64> {
    let speed: f64 = value.trim().strip_suffix('x')?.trim().parse().ok()?;
    (speed.is_finite() && speed > 0.0).then_some(speed)
}

/// Parse the total duration announced once near the start of the output,
/// e.g. `  Duration: 00:01:30.50, start: 0.000000, bitrate: 1234 kb/s`.
pub fn parse_duration_announcement(line: &str) -> Option<f64> {
    let start = line.find("Duration: ")?;
    let rest = &line[start + "Duration: ".len()..];
    let end = rest.find(',').unwrap_or(rest.len());
    parse_time(&rest[..end])
}

/// Value following `key` in a stats line, tolerating padding after the `=`.
fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line
        .match_indices(key)
        .find(|(idx, _)| *idx == 0 || line.as_bytes()[idx - 1].is_ascii_whitespace())
        .map(|(idx, _)| idx + key.len())?;
    let value = line[start..].trim_start();
    let end = value.find(char::is_whitespace).unwrap_or(value.len());
    Some(&value[..end])
}

/// Parse a single-line stats record.
///
/// Requires both a frame counter and an elapsed time.
pub fn parse_stats_line(line: &str) -> Option<ProgressRecord> {
    let frame = field(line, "frame=")?.parse().ok()?;
    let elapsed_secs = parse_time(field(line, "time=")?)?;
    let speed = field(line, "speed=").and_then(parse_speed_value);
    Some(ProgressRecord {
        frame,
        elapsed_secs,
        speed,
    })
}

/// Turn a record into percent/remaining given the announced total duration.
pub fn estimate(record: &ProgressRecord, total_duration: Option<f64>) -> TranscodeProgress {
    let Some(total) = total_duration.filter(|t| *t > 0.0) else {
        return TranscodeProgress {
            percent: 0.0,
            remaining: REMAINING_UNKNOWN,
        };
    };

    let percent = (record.elapsed_secs / total * 100.0).clamp(0.0, 100.0);
    let percent = (percent * 100.0).round() / 100.0;
    let remaining = match record.speed {
        Some(speed) => ((total - record.elapsed_secs).max(0.0) / speed).round(),
        None => REMAINING_UNKNOWN,
    };

    TranscodeProgress { percent, remaining }
}

#[derive(Debug, Default)]
struct ProgressBlock {
    frame: Option<u64>,
    elapsed_secs: Option<f64>,
    speed: Option<f64>,
}

impl ProgressBlock {
    fn take_record(&mut self) -> Option<ProgressRecord> {
        let block = std::mem::take(self);
        Some(ProgressRecord {
            frame: block.frame?,
            elapsed_secs: block.elapsed_secs?,
            speed: block.speed,
        })
    }
}

/// Stateful parser fed one diagnostic record at a time.
#[derive(Debug, Default)]
pub struct ProgressParser {
    total_duration: Option<f64>,
    block: ProgressBlock,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total duration, once announced.
    pub fn total_duration(&self) -> Option<f64> {
        self.total_duration
    }

    /// Feed one record. Returns progress whenever the record completes one.
    pub fn feed(&mut self, line: &str) -> Option<TranscodeProgress> {
        let line = line.trim();

        if self.total_duration.is_none() {
            if let Some(duration) = parse_duration_announcement(line) {
                self.total_duration = Some(duration);
                return None;
            }
        }

        let record = if is_key_value(line) {
            self.feed_key_value(line)?
        } else {
            parse_stats_line(line)?
        };
        Some(estimate(&record, self.total_duration))
    }

    fn feed_key_value(&mut self, line: &str) -> Option<ProgressRecord> {
        let (key, value) = line.split_once('=')?;
        match key {
            "frame" => self.block.frame = value.parse().ok(),
            "out_time" => {
                if let Some(secs) = parse_time(value) {
                    self.block.elapsed_secs = Some(secs);
                }
            }
            // Both keys carry microseconds
            "out_time_us" | "out_time_ms" => {
                if let Ok(us) = value.parse::<i64>() {
                    if us >= 0 {
                        self.block.elapsed_secs = Some(us as f64 / 1_000_000.0);
                    }
                }
            }
            "speed" => self.block.speed = parse_speed_value(value),
            "progress" => return self.block.take_record(),
            _ => {}
        }
        None
    }
}

fn is_key_value(line: &str) -> bool {
    !line.contains(char::is_whitespace)
        && line
            .split_once('=')
            .is_some_and(|(key, _)| !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_'))
}
