//! Small process-related helpers shared across the workspace.
//!
//! Two concerns live here: constructing child processes that never pop up a
//! console window on Windows, and splitting a user supplied command line into
//! an argument vector the way a shell would.

use std::ffi::OsStr;
use std::fmt;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// Apply the Windows `CREATE_NO_WINDOW` flag to child processes.
///
/// On non-Windows targets this is a no-op.
pub trait NoWindowExt {
    fn no_window(&mut self);
}

#[cfg(feature = "tokio")]
impl NoWindowExt for tokio::process::Command {
    fn no_window(&mut self) {
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            self.as_std_mut().creation_flags(CREATE_NO_WINDOW);
        }
    }
}

/// Create a `tokio::process::Command` with `CREATE_NO_WINDOW` applied on Windows.
///
/// The child is killed when the handle is dropped so an abandoned future never
/// leaks a running transcoder.
#[cfg(feature = "tokio")]
pub fn tokio_command(program: impl AsRef<OsStr>) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(program);
    cmd.no_window();
    cmd.kill_on_drop(true);
    cmd
}

/// Quoting rules used when splitting a command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    /// POSIX-like: single and double quotes group words, backslash escapes the
    /// next character (outside single quotes).
    Posix,
    /// Windows-like: quotes group words, backslashes are literal so that paths
    /// such as `C:\media\in.mp4` survive untouched.
    Windows,
}

impl Dialect {
    /// The dialect matching the platform we were compiled for.
    pub const fn native() -> Self {
        if cfg!(windows) {
            Self::Windows
        } else {
            Self::Posix
        }
    }
}

/// Error returned when a command line cannot be split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitError {
    /// A quote was opened but never closed.
    UnclosedQuote(char),
    /// The line ends with a lone escape character.
    TrailingEscape,
}

impl fmt::Display for SplitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnclosedQuote(q) => write!(f, "unclosed quote ({q})"),
            Self::TrailingEscape => write!(f, "trailing escape character"),
        }
    }
}

impl std::error::Error for SplitError {}

/// Split a command line into arguments.
///
/// Whitespace outside quotes separates arguments. Empty quoted strings (`""`)
/// produce an empty argument. No variable or glob expansion takes place.
pub fn split_command_line(line: &str, dialect: Dialect) -> Result<Vec<String>, SplitError> {
    let mut args = Vec::new();
    let mut current = String::new();
    // Tracks whether `current` holds an argument even if it is empty (`""`).
    let mut has_arg = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('\'') => current.push(c),
            Some(_) => {
                // Inside double quotes only `\"` and `\\` are escapes in POSIX mode.
                if c == '\\' && dialect == Dialect::Posix {
                    match chars.next() {
                        Some(next @ ('"' | '\\')) => current.push(next),
                        Some(next) => {
                            current.push('\\');
                            current.push(next);
                        }
                        None => return Err(SplitError::TrailingEscape),
                    }
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '"' | '\'' => {
                    quote = Some(c);
                    has_arg = true;
                }
                '\\' if dialect == Dialect::Posix => {
                    let next = chars.next().ok_or(SplitError::TrailingEscape)?;
                    current.push(next);
                    has_arg = true;
                }
                c if c.is_whitespace() => {
                    if has_arg {
                        args.push(std::mem::take(&mut current));
                        has_arg = false;
                    }
                }
                c => {
                    current.push(c);
                    has_arg = true;
                }
            },
        }
    }

    if let Some(q) = quote {
        return Err(SplitError::UnclosedQuote(q));
    }
    if has_arg {
        args.push(current);
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn posix(line: &str) -> Vec<String> {
        split_command_line(line, Dialect::Posix).unwrap()
    }

    #[cfg(all(unix, feature = "tokio"))]
    #[tokio::test]
    async fn tokio_command_runs_the_program() {
        let output = tokio_command("sh")
            .args(["-c", "echo ready"])
            .output()
            .await
            .unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "ready");
    }

    #[test]
    fn splits_on_whitespace() {
        assert_eq!(posix("-i  in.mp4 -c copy\tout.mp4"), vec![
            "-i", "in.mp4", "-c", "copy", "out.mp4"
        ]);
    }

    #[test]
    fn escaped_spaces_stay_in_one_argument() {
        assert_eq!(posix(r"-i /media/my\ movie.mp4"), vec!["-i", "/media/my movie.mp4"]);
    }

    #[test]
    fn quotes_group_words() {
        assert_eq!(posix(r#"-i "/a b/c.mp4" -metadata 'title=x y'"#), vec![
            "-i",
            "/a b/c.mp4",
            "-metadata",
            "title=x y"
        ]);
        assert_eq!(posix(r#"pre"fix"post"#), vec!["prefixpost"]);
    }

    #[test]
    fn empty_quotes_produce_empty_argument() {
        assert_eq!(posix(r#"a "" b"#), vec!["a", "", "b"]);
    }

    #[test]
    fn windows_keeps_backslashes() {
        let args =
            split_command_line(r#"-i "C:\media\in file.mp4" C:\out\o.mp4"#, Dialect::Windows)
                .unwrap();
        assert_eq!(args, vec!["-i", r"C:\media\in file.mp4", r"C:\out\o.mp4"]);
    }

    #[test]
    fn unicode_is_preserved() {
        let args = split_command_line("-i 'café 日本.mp4'", Dialect::Windows).unwrap();
        assert_eq!(args, vec!["-i", "café 日本.mp4"]);
    }

    #[test]
    fn reports_unclosed_quotes() {
        assert_eq!(
            split_command_line("-i \"broken", Dialect::Posix),
            Err(SplitError::UnclosedQuote('"'))
        );
        assert_eq!(
            split_command_line("trailing\\", Dialect::Posix),
            Err(SplitError::TrailingEscape)
        );
    }

    #[test]
    fn empty_line_yields_no_arguments() {
        assert!(posix("   ").is_empty());
    }
}
