use crate::buffer::{IoBuffer, ProcessBuffer, WriteTranslations};
use crate::config::{batch_command, DeliveryMode, TransportConfig};
use crate::error::{Result, TransportError};
use crate::message::Message;
use crate::session::{SessionEngine, SmtpSession};

/// Sends mail through a sendmail (or postfix, exim, ...) binary.
///
/// The configured command decides how:
///
/// - with `-t` (e.g. `/usr/sbin/sendmail -oi -t`), the rendered message is
///   piped to a fresh process and sendmail works out the recipients itself.
///   Failures only show up later as bounces, so every addressed recipient is
///   counted as accepted.
/// - with `-bs` (the default), an SMTP session is run over the process's
///   stdin and stdout, and rejected recipients are reported.
///
/// When using `-t` you'll usually want `-oi` or `-i` too. A `-f<sender>` flag
/// is added for each delivery unless the command already has one.
///
/// A transport isn't meant to be shared between threads: it owns one process
/// stream, and `send` runs to completion before returning.
#[derive(Debug)]
pub struct SendmailTransport<B: IoBuffer = ProcessBuffer, E: SessionEngine = SmtpSession> {
    params: TransportConfig,
    buffer: B,
    session: E,
}

impl SendmailTransport {
    /// A transport using `/usr/sbin/sendmail -bs`.
    pub fn new() -> Self {
        SendmailTransport::with_parts(ProcessBuffer::new(), SmtpSession::new())
    }
}

impl Default for SendmailTransport {
    fn default() -> Self {
        SendmailTransport::new()
    }
}

impl<B: IoBuffer, E: SessionEngine> SendmailTransport<B, E> {
    pub fn with_parts(buffer: B, session: E) -> Self {
        SendmailTransport {
            params: TransportConfig::default(),
            buffer,
            session,
        }
    }

    /// Replace all buffer parameters (timeout, blocking, command) at once.
    pub fn with_config(mut self, params: TransportConfig) -> Self {
        self.params = params;
        self
    }

    /// Set the command to invoke. Not checked until `start` or `send`.
    pub fn set_command(&mut self, command: &str) -> &mut Self {
        self.params.command = command.to_string();
        self
    }

    pub fn command(&self) -> &str {
        &self.params.command
    }

    /// Parameters the session engine opens the buffer with. Always reflects
    /// the configured command, never a per-delivery one.
    pub fn buffer_params(&self) -> &TransportConfig {
        &self.params
    }

    pub fn buffer(&self) -> &B {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut B {
        &mut self.buffer
    }

    pub fn session(&self) -> &E {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut E {
        &mut self.session
    }

    pub fn is_started(&self) -> bool {
        self.session.is_started()
    }

    /// Start the SMTP session if running in `-bs` mode. Otherwise there's
    /// nothing to start.
    pub fn start(&mut self) -> Result<()> {
        if self.params.command.contains(crate::config::SESSION_FLAG) {
            self.session.start(&mut self.buffer, &self.params)
        } else {
            log::debug!("not in -bs mode; nothing to start");
            Ok(())
        }
    }

    /// Stop a running SMTP session.
    pub fn stop(&mut self) -> Result<()> {
        self.session.stop(&mut self.buffer)
    }

    /// Send `message`, returning how many recipients were accepted.
    ///
    /// Rejected recipients are appended to `failed_recipients`. Only `-bs`
    /// mode can detect rejections: in `-t` mode the count is To + Cc + Bcc
    /// and `failed_recipients` is left untouched.
    pub fn send(&mut self, message: &Message, failed_recipients: &mut Vec<String>) -> Result<usize> {
        let mode = DeliveryMode::from_command(&self.params.command);
        log::debug!("delivering in {:?} mode via: {}", mode, self.params.command);

        match mode {
            DeliveryMode::Batch => self.send_batch(message),
            DeliveryMode::Session => {
                self.session
                    .send(&mut self.buffer, &self.params, message, failed_recipients)
            }
            DeliveryMode::Unsupported => Err(TransportError::UnsupportedCommand {
                command: self.params.command.clone(),
            }),
        }
    }

    fn send_batch(&mut self, message: &Message) -> Result<usize> {
        let command = batch_command(&self.params.command, message.reverse_path())?;
        log::debug!("per-delivery command: {}", command);

        // reinitializing would kill a running -bs process without a QUIT
        if self.session.is_started() {
            log::debug!("command switched to -t; stopping the running SMTP session");
            self.session.stop(&mut self.buffer)?;
        }

        self.buffer.initialize(&self.params.with_command(command))?;
        // sendmail -t wants unix line endings
        self.buffer
            .set_write_translations(WriteTranslations::none().with(b"\r\n", b"\n"))?;

        let count = message.to().len() + message.cc().len() + message.bcc().len();

        let written = message.write_to(&mut self.buffer);
        let untranslated = self.buffer.set_write_translations(WriteTranslations::none());
        let terminated = self.buffer.terminate();
        written?;
        untranslated?;
        terminated?;

        log::debug!("message piped to sendmail for {} recipient(s)", count);
        Ok(count)
    }
}

impl<B: IoBuffer, E: SessionEngine> Drop for SendmailTransport<B, E> {
    fn drop(&mut self) {
        if self.session.is_started() {
            if let Err(e) = self.stop() {
                log::warn!("error stopping SMTP session: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_COMMAND;

    #[test]
    fn test_default_command() {
        let transport = SendmailTransport::new();
        assert_eq!(transport.command(), DEFAULT_COMMAND);
        assert!(!transport.is_started());
    }

    #[test]
    fn test_set_command_chains() {
        let mut transport = SendmailTransport::new();
        let command = transport.set_command("/usr/sbin/sendmail -oi -t").command().to_string();
        assert_eq!(command, "/usr/sbin/sendmail -oi -t");
        assert_eq!(transport.buffer_params().command, "/usr/sbin/sendmail -oi -t");
    }

    /// batch mode has no session to start, so start() never touches the process
    #[test]
    fn test_start_in_batch_mode_is_noop() {
        let mut transport = SendmailTransport::new();
        transport.set_command("/usr/sbin/sendmail -t");
        assert!(transport.start().is_ok());
        assert!(!transport.buffer().is_running());
        assert!(!transport.is_started());
    }

    #[test]
    fn test_unsupported_command() {
        let mut transport = SendmailTransport::new();
        transport.set_command("/bin/true");
        let message = Message::new().with_to("b@example.com", None);
        let mut failed = Vec::new();

        let err = transport.send(&message, &mut failed).unwrap_err();
        assert!(matches!(err, TransportError::UnsupportedCommand { .. }));
        let text = err.to_string();
        assert!(text.contains("/bin/true"), "message was: {}", text);
        assert!(text.contains("\"-bs\" or \"-t\""), "message was: {}", text);
        assert!(failed.is_empty());
        assert!(!transport.buffer().is_running());
    }
}
