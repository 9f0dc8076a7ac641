use crate::error::{Result, TransportError};

/// Flag which puts sendmail into interactive SMTP mode.
pub const SESSION_FLAG: &str = " -bs";

/// Flag which makes sendmail read recipients from the message headers.
pub const BATCH_FLAG: &str = " -t";

/// Flag carrying an explicit envelope sender.
pub const SENDER_FLAG: &str = " -f";

pub const DEFAULT_COMMAND: &str = "/usr/sbin/sendmail -bs";
pub const DEFAULT_TIMEOUT: u64 = 30;

/// What sort of connection a buffer should open. Sendmail is only ever
/// reached through a spawned process.
#[derive(Debug, PartialEq, Eq, Copy, Clone, Default)]
pub enum ConnectionKind {
    #[default]
    Process,
}

/// Parameters used to (re)initialize a process stream.
///
/// - `timeout`: seconds a read, a write, or waiting for the process to exit may block. 0 means no limit.
/// - `blocking`: whether reads wait for a line to become available
/// - `command`: full sendmail invocation, including flags
/// - `kind`: connection type
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TransportConfig {
    pub timeout: u64,
    pub blocking: bool,
    pub command: String,
    pub kind: ConnectionKind,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            timeout: DEFAULT_TIMEOUT,
            blocking: true,
            command: DEFAULT_COMMAND.to_string(),
            kind: ConnectionKind::Process,
        }
    }
}

impl TransportConfig {
    /// A copy of this config with `command` swapped out. `self` is left alone.
    pub fn with_command(&self, command: impl Into<String>) -> TransportConfig {
        TransportConfig {
            command: command.into(),
            ..self.clone()
        }
    }
}

/// How a message gets handed to sendmail.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum DeliveryMode {
    /// `-t`: pipe the rendered message, sendmail parses recipients from headers.
    Batch,
    /// `-bs`: speak SMTP over the process's stdin/stdout.
    Session,
    Unsupported,
}

impl DeliveryMode {
    /// Work out the delivery mode from a command string. `-t` is checked
    /// before `-bs`; matching is plain, case-sensitive substring search.
    ///
    /// ```
    /// use mailsubmit::DeliveryMode;
    ///
    /// assert_eq!(DeliveryMode::from_command("/usr/sbin/sendmail -oi -t"), DeliveryMode::Batch);
    /// assert_eq!(DeliveryMode::from_command("/usr/sbin/sendmail -bs"), DeliveryMode::Session);
    /// assert_eq!(DeliveryMode::from_command("/usr/sbin/sendmail"), DeliveryMode::Unsupported);
    /// ```
    pub fn from_command(command: &str) -> DeliveryMode {
        if command.contains(BATCH_FLAG) {
            DeliveryMode::Batch
        } else if command.contains(SESSION_FLAG) {
            DeliveryMode::Session
        } else {
            DeliveryMode::Unsupported
        }
    }
}

/// Check a reverse-path can be appended to a shell command as a bare flag
/// value: non-empty, and made only of characters the shell won't interpret.
pub fn is_safe_flag_value(s: &str) -> bool {
    !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "@.-_+=%/^".contains(c))
}

/// Quote `s` for `/bin/sh`, unless it's already safe as it stands.
fn shell_quote(s: &str) -> String {
    if is_safe_flag_value(s) {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\\''"))
    }
}

/// The command to run for a single `-t` delivery. If `command` has no `-f`
/// flag, `-f<reverse_path>` is appended, quoted if the shell would otherwise
/// interpret any of it.
///
/// Reverse paths are held to the same rule as `-f` on the command line:
/// printable ASCII with no whitespace.
pub fn batch_command(command: &str, reverse_path: Option<&str>) -> Result<String> {
    if command.contains(SENDER_FLAG) {
        return Ok(command.to_string());
    }

    let reverse_path = reverse_path.ok_or(TransportError::NoReversePath)?;
    if !crate::is_plausible_string(reverse_path) {
        return Err(TransportError::InvalidReversePath(reverse_path.to_string()));
    }

    Ok(format!("{}{}{}", command, SENDER_FLAG, shell_quote(reverse_path)))
}
