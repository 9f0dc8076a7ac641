use std::fs::OpenOptions;
use std::io::{BufRead, Write};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use clap::{command, Arg, ArgAction, Command};
use ini::Ini;
use nix::unistd::{Uid, User};
use simplelog::{LevelFilter, WriteLogger};

pub mod buffer;
pub mod config;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use buffer::{IoBuffer, ProcessBuffer, WriteTranslations};
pub use config::{ConnectionKind, DeliveryMode, TransportConfig};
pub use error::TransportError;
pub use message::{Mailbox, Mailboxes, Message};
pub use session::{Response, SessionEngine, SmtpSession, DEFAULT_LOCAL_DOMAIN};
pub use transport::SendmailTransport;

/// Contents of a config file.
///
/// - `transport` holds the command to run, plus timeout and blocking settings
/// - `local_domain` is the name we give in EHLO when speaking SMTP to sendmail
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Config {
    pub transport: TransportConfig,
    pub local_domain: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            transport: TransportConfig::default(),
            local_domain: DEFAULT_LOCAL_DOMAIN.to_string(),
        }
    }
}

/// Main context for the program. Represents values injected into `run()` for easy testing.
///
/// - `args`: command-line arguments
/// - `config_path`: path to the default config file. It's fine for this not to exist.
#[derive(Debug)]
pub struct MainContext {
    pub args: Vec<String>,
    pub config_path: String,
}

/// Build a CLI parser for the program.
///
/// The message is read from stdin. `-f` gives the envelope sender; if it's absent
/// and the message has no Return-Path, Sender or From, the current user is used.
/// Positional recipients are added to the message as Bcc recipients.
pub fn build_cli() -> Command {
    command!()
    .disable_version_flag(true)
    .arg(
        Arg::new("version")
            .long("version")
            .action(ArgAction::Version)
            .help("Print version")
    )
    .arg(Arg::new("config").short('C').value_name("CONFIG")
        .help("Use an alternate config file"))
    .arg(Arg::new("command").long("command").value_name("COMMAND")
        .help("Sendmail command to run. Must include either -bs or -t, e.g. '/usr/sbin/sendmail -oi -t'"))
    .arg(Arg::new("sender_env").short('f').value_name("ADDRESS")
        .help("Sender (from) envelope address. Must not contain non-ASCII, whitespace or non-printable characters."))
    .arg(Arg::new("logfile").short('X').value_name("LOGFILE")
        .help("Log debugging messages to a file. '-' and /dev/stderr mean standard error."))
    .arg(Arg::new("recipients")
         .value_name("RECIPIENT")
         .help("Additional (Bcc) recipient addresses")
         .num_args(0..)
         .required(false))
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Read a "key = value" style config file, and return the values as a Config struct.
///
/// Recognized keys, all optional:
///   - command: sendmail command, including either `-bs` or `-t`
///   - timeout: seconds to wait on the sendmail process (0 for no limit)
///   - blocking: whether reads block (`1`/`0`, `true`/`false`)
///   - localDomain: name to announce in EHLO
///
pub fn read_config_ini<P>(file_path: P) -> Result<Config>
where
    P: AsRef<Path>,
{
    let file_path_ref = file_path.as_ref();
    let conf = Ini::load_from_file(file_path_ref).map_err(|e| {
        anyhow!(
            "Error reading config file {}: {}",
            file_path_ref.display(),
            e
        )
    })?;

    let section = conf.section(None::<String>).ok_or_else(|| {
        anyhow!(
            "Error reading config file {}: sections seem malformed",
            file_path_ref.display()
        )
    })?;

    let mut config = Config::default();

    if let Some(command) = section.get("command") {
        config.transport.command = command.to_string();
    }

    if let Some(timeout) = section.get("timeout") {
        config.transport.timeout = timeout.parse().map_err(|e| {
            anyhow!(
                "Error reading config file {}: timeout '{}' is not a number of seconds: {}",
                file_path_ref.display(),
                timeout,
                e
            )
        })?;
    }

    if let Some(blocking) = section.get("blocking") {
        config.transport.blocking = parse_bool(blocking).ok_or_else(|| {
            anyhow!(
                "Error reading config file {}: blocking '{}' is not a boolean",
                file_path_ref.display(),
                blocking
            )
        })?;
    }

    if let Some(local_domain) = section.get("localDomain") {
        config.local_domain = local_domain.to_string();
    }

    Ok(config)
}

/// Return the username of the current user.
pub fn get_current_user() -> Result<String> {
    let uid: Uid = Uid::current();
    let user: User = User::from_uid(uid)
        .map_err(|err| {
            anyhow!(
                "Couldn't get username for uid {}: errno was {} ({})",
                uid,
                err,
                err.desc()
            )
        })?
        .ok_or_else(|| anyhow!("Couldn't get username for uid {}: no such user", uid))?;
    Ok(user.name)
}

/// Set up logging to a given logfile path. `-` and `/dev/stderr` both mean
/// standard error; any other path is appended to.
fn init_logfile(logfile_path: &str) -> Result<()> {
    let logfile: Box<dyn Write + Send> = if logfile_path == "-" || logfile_path == "/dev/stderr" {
        Box::new(std::io::stderr())
    } else {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(logfile_path)
            .with_context(|| format!("Error opening log file '{}'", logfile_path))?;
        Box::new(file)
    };

    WriteLogger::init(LevelFilter::Trace, simplelog::Config::default(), logfile)
        .map_err(|e| anyhow!("Couldn't set up logging: {}", e))
}

/// Check if a string is plausible as an email address, in the very loosest sense.
/// We require only that it (a) not be empty and (b) consist only of "graphical" ASCII characters
/// (basically, all letters and digits and punctuation, but not whitespace or control
/// characters).
pub fn is_plausible_string(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_graphic())
}

/// Main logic for the program: read a message from `input`, hand it to sendmail,
/// and report on `output` how many recipients were accepted, plus any rejected.
///
/// Config comes from `-C`, else from `ctx.config_path` if that exists, else defaults;
/// `--command` overrides whatever command the config names.
///
/// Returns an error if the message couldn't be sent, or no recipient was accepted.
pub fn run<R: BufRead, W: Write>(ctx: &MainContext, input: &mut R, output: &mut W) -> Result<()> {
    let cli_matches = build_cli().get_matches_from(ctx.args.iter());

    if let Some(logfile_path) = cli_matches.get_one::<String>("logfile") {
        init_logfile(logfile_path)?;
    }

    let config = match cli_matches.get_one::<String>("config") {
        Some(config_path) => read_config_ini(config_path)?,
        None if Path::new(&ctx.config_path).exists() => read_config_ini(&ctx.config_path)?,
        None => Config::default(),
    };

    log::debug!("Read config: {:?}", config);

    let mut params = config.transport.clone();
    if let Some(command) = cli_matches.get_one::<String>("command") {
        params.command = command.clone();
    }

    let mut message = Message::parse(input).context("Couldn't read message from input")?;

    match cli_matches.get_one::<String>("sender_env") {
        Some(sender) => {
            if !is_plausible_string(sender) {
                anyhow::bail!(
                    "From address '{}' contains non-ASCII, non-printable or whitespace characters, or is zero-length",
                    sender
                );
            }
            message.set_return_path(sender);
        }
        None if message.reverse_path().is_none() => {
            message.set_return_path(&get_current_user()?);
        }
        None => {}
    }

    log::debug!("Using reverse path: {:?}", message.reverse_path());

    if let Some(recipients) = cli_matches.get_many::<String>("recipients") {
        for recipient in recipients {
            if !is_plausible_string(recipient) {
                anyhow::bail!(
                    "Recipient address '{}' contains non-ASCII, non-printable or whitespace characters, or is zero-length",
                    recipient
                );
            }
            message.bcc_mut().insert(recipient, None);
        }
    }

    let mut transport = SendmailTransport::new().with_config(params);
    transport.session_mut().set_local_domain(&config.local_domain);

    transport.start().context("Couldn't start sendmail")?;

    let mut failed_recipients = Vec::new();
    let accepted = transport
        .send(&message, &mut failed_recipients)
        .context("Couldn't send message")?;

    transport.stop().context("Couldn't stop sendmail")?;

    writeln!(output, "accepted: {}", accepted)?;
    for recipient in &failed_recipients {
        writeln!(output, "rejected: {}", recipient)?;
    }

    if accepted == 0 {
        anyhow::bail!("No recipients were accepted for delivery");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_plausible_string() {
        assert!(is_plausible_string("user@example.com"));
        assert!(!is_plausible_string(""));
        assert!(!is_plausible_string("user @example.com"));
        assert!(!is_plausible_string("user@exämple.com"));
        assert!(!is_plausible_string("user@example.com\r\n"));
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_cli_parses_recipients() {
        let matches = build_cli().get_matches_from([
            "mailsubmit",
            "--command",
            "/usr/sbin/sendmail -oi -t",
            "-f",
            "a@example.com",
            "b@example.com",
            "c@example.com",
        ]);
        let recipients: Vec<&str> = matches
            .get_many::<String>("recipients")
            .unwrap()
            .map(String::as_str)
            .collect();
        assert_eq!(recipients, vec!["b@example.com", "c@example.com"]);
        assert_eq!(
            matches.get_one::<String>("command").map(String::as_str),
            Some("/usr/sbin/sendmail -oi -t")
        );
        assert_eq!(
            matches.get_one::<String>("sender_env").map(String::as_str),
            Some("a@example.com")
        );
    }
}
