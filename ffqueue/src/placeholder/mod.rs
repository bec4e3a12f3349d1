//! Placeholder resolution for task templates.
//!
//! Templates reference `${TOKEN}` placeholders that are expanded right before a
//! task executes. File tokens are derived from the input/output paths, date and
//! time tokens from the local clock at call time, and `${UUID}` yields a fresh
//! id for every occurrence. Unknown tokens are left untouched.

use std::path::Path;

use chrono::{Datelike, Local, Utc};

/// How `${INPUT_FILE}` / `${OUTPUT_FILE}` are inserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathEscaping {
    /// Insert paths as they are (file paths, sidecar paths, display strings).
    Verbatim,
    /// Protect paths so they stay a single argument once the line is split:
    /// spaces are backslash-escaped on Unix, the path is double-quoted on Windows.
    CommandLine,
}

impl PathEscaping {
    fn apply(self, path: &str) -> String {
        match self {
            Self::Verbatim => path.to_string(),
            Self::CommandLine if cfg!(windows) => format!("\"{path}\""),
            Self::CommandLine => path.replace(' ', "\\ "),
        }
    }
}

/// Resolve every known placeholder in `template`.
pub fn resolve(
    template: &str,
    input_file: &str,
    output_file: &str,
    source: &str,
    escaping: PathEscaping,
) -> String {
    if !template.contains("${") {
        return template.to_string();
    }

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated token, keep the remainder verbatim
            out.push_str(&rest[start..]);
            return out;
        };

        let token = &after[..end];
        match expand(token, input_file, output_file, source, escaping) {
            Some(value) => out.push_str(&value),
            None => out.push_str(&rest[start..start + 2 + end + 1]),
        }
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    out
}

fn expand(
    token: &str,
    input_file: &str,
    output_file: &str,
    source: &str,
    escaping: PathEscaping,
) -> Option<String> {
    let value = match token {
        "INPUT_FILE" => escaping.apply(input_file),
        "OUTPUT_FILE" => escaping.apply(output_file),
        "INPUT_FILE_BASE" => file_name(input_file),
        "OUTPUT_FILE_BASE" => file_name(output_file),
        "INPUT_FILE_EXTENSION" => extension(input_file),
        "OUTPUT_FILE_EXTENSION" => extension(output_file),
        "INPUT_FILE_BASENAME" => stem(input_file),
        "OUTPUT_FILE_BASENAME" => stem(output_file),
        "INPUT_FILE_DIR" => dir(input_file),
        "OUTPUT_FILE_DIR" => dir(output_file),

        "DATE_YEAR" => Local::now().format("%Y").to_string(),
        "DATE_SHORTYEAR" => Local::now().format("%y").to_string(),
        "DATE_MONTH" => Local::now().format("%m").to_string(),
        "DATE_DAY" => Local::now().format("%d").to_string(),
        "DATE_WEEK" => Local::now().iso_week().week().to_string(),
        "TIME_HOUR" => Local::now().format("%H").to_string(),
        "TIME_MINUTE" => Local::now().format("%M").to_string(),
        "TIME_SECOND" => Local::now().format("%S").to_string(),

        "TIMESTAMP_SECONDS" => Utc::now().timestamp().to_string(),
        "TIMESTAMP_MILLISECONDS" => Utc::now().timestamp_millis().to_string(),
        "TIMESTAMP_MICROSECONDS" => Utc::now().timestamp_micros().to_string(),
        "TIMESTAMP_NANOSECONDS" => Utc::now()
            .timestamp_nanos_opt()
            .map(|n| n.to_string())
            .unwrap_or_default(),

        "OS_NAME" => std::env::consts::OS.to_string(),
        "OS_ARCH" => std::env::consts::ARCH.to_string(),
        "UUID" => uuid::Uuid::new_v4().to_string(),
        "SOURCE" => source.to_string(),
        _ => return None,
    };
    Some(value)
}

fn file_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Extension including the leading dot, empty when there is none.
fn extension(path: &str) -> String {
    Path::new(path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default()
}

fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn dir(path: &str) -> String {
    match Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_string_lossy().into_owned(),
        _ => ".".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verbatim(template: &str) -> String {
        resolve(template, "/a/b.mp4", "/c/d.mkv", "api", PathEscaping::Verbatim)
    }

    #[test]
    fn test_literal_template_is_unchanged() {
        let literal = "-i input.mp4 -c copy output.mp4 $HOME {x} $";
        assert_eq!(verbatim(literal), literal);
    }

    #[test]
    fn test_input_file_substitution() {
        assert_eq!(verbatim("${INPUT_FILE}"), "/a/b.mp4");
        let escaped = resolve(
            "${INPUT_FILE}",
            "/a/b.mp4",
            "/c/d.mp4",
            "x",
            PathEscaping::CommandLine,
        );
        assert!(escaped.contains("/a/b.mp4"));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_line_escapes_spaces() {
        let resolved = resolve(
            "-i ${INPUT_FILE} ${OUTPUT_FILE}",
            "/media/my clip.mp4",
            "/out/x.mp4",
            "api",
            PathEscaping::CommandLine,
        );
        assert_eq!(resolved, r"-i /media/my\ clip.mp4 /out/x.mp4");
        let args =
            process_utils::split_command_line(&resolved, process_utils::Dialect::Posix).unwrap();
        assert_eq!(args, vec!["-i", "/media/my clip.mp4", "/out/x.mp4"]);
    }

    #[test]
    fn test_file_tokens() {
        assert_eq!(verbatim("${INPUT_FILE_BASE}"), "b.mp4");
        assert_eq!(verbatim("${OUTPUT_FILE_BASE}"), "d.mkv");
        assert_eq!(verbatim("${INPUT_FILE_EXTENSION}"), ".mp4");
        assert_eq!(verbatim("${OUTPUT_FILE_EXTENSION}"), ".mkv");
        assert_eq!(verbatim("${INPUT_FILE_BASENAME}"), "b");
        assert_eq!(verbatim("${OUTPUT_FILE_BASENAME}"), "d");
        assert_eq!(verbatim("${INPUT_FILE_DIR}"), "/a");
        assert_eq!(verbatim("${OUTPUT_FILE_DIR}"), "/c");
        assert_eq!(verbatim("${SOURCE}"), "api");
    }

    #[test]
    fn test_unknown_and_unterminated_tokens_stay_verbatim() {
        assert_eq!(verbatim("${NOPE} ${INPUT_FILE_BASE}"), "${NOPE} b.mp4");
        assert_eq!(verbatim("x ${INPUT_FILE"), "x ${INPUT_FILE");
    }

    #[test]
    fn test_time_tokens_are_numeric() {
        let year = verbatim("${DATE_YEAR}");
        assert_eq!(year.len(), 4);
        assert_eq!(verbatim("${DATE_SHORTYEAR}").len(), 2);
        for token in [
            "${DATE_MONTH}",
            "${DATE_DAY}",
            "${DATE_WEEK}",
            "${TIME_HOUR}",
            "${TIME_MINUTE}",
            "${TIME_SECOND}",
            "${TIMESTAMP_SECONDS}",
            "${TIMESTAMP_MILLISECONDS}",
            "${TIMESTAMP_MICROSECONDS}",
            "${TIMESTAMP_NANOSECONDS}",
        ] {
            let value = verbatim(token);
            assert!(
                !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()),
                "{token} resolved to {value}"
            );
        }
    }

    #[test]
    fn test_uuid_is_fresh_per_occurrence() {
        let resolved = verbatim("${UUID} ${UUID}");
        let parts: Vec<&str> = resolved.split(' ').collect();
        assert_eq!(parts.len(), 2);
        assert_ne!(parts[0], parts[1]);
        assert!(uuid::Uuid::parse_str(parts[0]).is_ok());
    }

    #[test]
    fn test_os_tokens() {
        assert_eq!(verbatim("${OS_NAME}"), std::env::consts::OS);
        assert_eq!(verbatim("${OS_ARCH}"), std::env::consts::ARCH);
    }

    #[test]
    fn test_dir_of_bare_file_name() {
        assert_eq!(
            resolve("${INPUT_FILE_DIR}", "in.mp4", "", "", PathEscaping::Verbatim),
            "."
        );
    }
}
