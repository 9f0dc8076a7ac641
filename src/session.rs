//! SMTP spoken over a sendmail process running in `-bs` mode.

use std::io::Write;

use crate::buffer::{IoBuffer, WriteTranslations};
use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::message::Message;

pub const DEFAULT_LOCAL_DOMAIN: &str = "[127.0.0.1]";

/// An engine which drives an interactive mail session over an `IoBuffer`.
///
/// The engine never owns the buffer: the transport lends it for each call.
pub trait SessionEngine {
    fn is_started(&self) -> bool;

    /// Open the buffer with `params` and perform the opening handshake.
    /// Does nothing if a session is already running.
    fn start(&mut self, buffer: &mut dyn IoBuffer, params: &TransportConfig) -> Result<()>;

    /// Send `message`, appending each rejected recipient to `failed_recipients`.
    /// Returns the number of recipients accepted.
    fn send(
        &mut self,
        buffer: &mut dyn IoBuffer,
        params: &TransportConfig,
        message: &Message,
        failed_recipients: &mut Vec<String>,
    ) -> Result<usize>;

    /// End the session and terminate the buffer. Does nothing if not started.
    fn stop(&mut self, buffer: &mut dyn IoBuffer) -> Result<()>;
}

/// A reply from the server. Multi-line replies are gathered into one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Response {
    pub fn message(&self) -> String {
        self.lines.join(" ")
    }

    /// Split a reply line into its code, whether it's the final line, and its text.
    fn parse_line(line: &str) -> Result<(u16, bool, &str)> {
        let line = line.trim_end_matches(['\r', '\n']);
        let code = line
            .get(..3)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| TransportError::MalformedResponse(line.to_string()))?;

        let last = match line.as_bytes().get(3) {
            None | Some(b' ') => true,
            Some(b'-') => false,
            Some(_) => return Err(TransportError::MalformedResponse(line.to_string())),
        };

        Ok((code, last, line.get(4..).unwrap_or("")))
    }

    /// Read a complete (possibly multi-line) reply from `buffer`.
    pub fn read(buffer: &mut dyn IoBuffer) -> Result<Response> {
        let mut lines = Vec::new();
        loop {
            let line = buffer.read_line()?;
            let (code, last, text) = Response::parse_line(&line)?;
            lines.push(text.to_string());
            if last {
                return Ok(Response { code, lines });
            }
        }
    }

    fn expect_code(self, codes: &[u16]) -> Result<Response> {
        if codes.contains(&self.code) {
            Ok(self)
        } else {
            Err(TransportError::UnexpectedResponse {
                expected: codes.to_vec(),
                code: self.code,
                message: self.message(),
            })
        }
    }
}

/// SMTP client for `sendmail -bs`.
#[derive(Debug)]
pub struct SmtpSession {
    local_domain: String,
    started: bool,
}

impl Default for SmtpSession {
    fn default() -> Self {
        SmtpSession::new()
    }
}

impl SmtpSession {
    pub fn new() -> Self {
        SmtpSession {
            local_domain: DEFAULT_LOCAL_DOMAIN.to_string(),
            started: false,
        }
    }

    /// Name we announce ourselves as in EHLO/HELO.
    pub fn set_local_domain(&mut self, domain: &str) -> &mut Self {
        self.local_domain = domain.to_string();
        self
    }

    pub fn local_domain(&self) -> &str {
        &self.local_domain
    }

    /// Write `command` and check the reply code is one of `codes`.
    fn execute(buffer: &mut dyn IoBuffer, command: &str, codes: &[u16]) -> Result<Response> {
        log::trace!(">> {}", command);
        buffer.write_all(command.as_bytes())?;
        buffer.write_all(b"\r\n")?;
        buffer.flush()?;
        Response::read(buffer)?.expect_code(codes)
    }

    fn handshake(&self, buffer: &mut dyn IoBuffer) -> Result<()> {
        Response::read(buffer)?.expect_code(&[220])?;

        let ehlo = format!("EHLO {}", self.local_domain);
        match SmtpSession::execute(buffer, &ehlo, &[250]) {
            Ok(_) => Ok(()),
            Err(TransportError::UnexpectedResponse { code, .. }) => {
                log::debug!("EHLO refused with {}; falling back to HELO", code);
                let helo = format!("HELO {}", self.local_domain);
                SmtpSession::execute(buffer, &helo, &[250]).map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

impl SessionEngine for SmtpSession {
    fn is_started(&self) -> bool {
        self.started
    }

    fn start(&mut self, buffer: &mut dyn IoBuffer, params: &TransportConfig) -> Result<()> {
        if self.started {
            return Ok(());
        }

        log::debug!("starting SMTP session with: {}", params.command);
        buffer.initialize(params)?;

        if let Err(e) = self.handshake(buffer) {
            if let Err(term_err) = buffer.terminate() {
                log::warn!("error terminating sendmail after failed handshake: {}", term_err);
            }
            return Err(e);
        }

        self.started = true;
        Ok(())
    }

    fn send(
        &mut self,
        buffer: &mut dyn IoBuffer,
        params: &TransportConfig,
        message: &Message,
        failed_recipients: &mut Vec<String>,
    ) -> Result<usize> {
        let reverse_path = message.reverse_path().ok_or(TransportError::NoReversePath)?;
        if !crate::is_plausible_string(reverse_path) {
            return Err(TransportError::InvalidReversePath(reverse_path.to_string()));
        }

        if !self.started {
            self.start(buffer, params)?;
        }

        SmtpSession::execute(buffer, &format!("MAIL FROM:<{}>", reverse_path), &[250])?;

        let mut accepted = 0;
        for recipient in message.recipients() {
            // a CR or LF here would smuggle extra commands into the session
            if !crate::is_plausible_string(recipient) {
                log::warn!("recipient {:?} can't be sent over SMTP; skipping it", recipient);
                failed_recipients.push(recipient.to_string());
                continue;
            }
            match SmtpSession::execute(buffer, &format!("RCPT TO:<{}>", recipient), &[250, 251]) {
                Ok(_) => accepted += 1,
                Err(TransportError::UnexpectedResponse { code, message, .. }) => {
                    log::warn!("recipient {} rejected: {} {}", recipient, code, message);
                    failed_recipients.push(recipient.to_string());
                }
                Err(e) => return Err(e),
            }
        }

        if accepted == 0 {
            log::debug!("no recipients accepted; resetting transaction");
            SmtpSession::execute(buffer, "RSET", &[250])?;
            return Ok(0);
        }

        SmtpSession::execute(buffer, "DATA", &[354])?;

        buffer.set_write_translations(WriteTranslations::none().with(b"\r\n.", b"\r\n.."))?;
        let written = message.write_to_without_bcc(&mut *buffer);
        buffer.set_write_translations(WriteTranslations::none())?;
        written?;

        // the rendered message always ends in CRLF
        SmtpSession::execute(buffer, ".", &[250])?;

        log::debug!("message accepted for {} recipient(s)", accepted);
        Ok(accepted)
    }

    fn stop(&mut self, buffer: &mut dyn IoBuffer) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        self.started = false;

        log::debug!("stopping SMTP session");
        if let Err(e) = SmtpSession::execute(buffer, "QUIT", &[221]) {
            log::debug!("QUIT failed: {}", e);
        }
        buffer.terminate()
    }
}
