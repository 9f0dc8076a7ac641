//! A minimal RFC 822 message: just enough to address, render and parse mail.

use std::fmt;
use std::io::{BufRead, Read, Write};

use chrono::Local;

use crate::error::{Result, TransportError};

/// An address plus an optional display name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub address: String,
    pub name: Option<String>,
}

impl Mailbox {
    pub fn new(address: &str, name: Option<&str>) -> Self {
        Mailbox {
            address: address.to_string(),
            name: name.map(str::to_string),
        }
    }

    /// Parse `Name <addr>`, `"Name" <addr>`, `<addr>` or a bare `addr`.
    /// Returns `None` for an empty address (e.g. the null reverse-path `<>`).
    pub fn parse(s: &str) -> Option<Mailbox> {
        let s = s.trim();
        let (address, name) = match (s.rfind('<'), s.rfind('>')) {
            (Some(l), Some(r)) if l < r => {
                let name = s[..l].trim().trim_matches('"').trim();
                (s[l + 1..r].trim(), (!name.is_empty()).then_some(name))
            }
            _ => (s, None),
        };

        if address.is_empty() {
            return None;
        }
        Some(Mailbox::new(address, name))
    }
}

impl fmt::Display for Mailbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            None => write!(f, "{}", self.address),
            Some(name) if name.chars().any(|c| "()<>[]:;@\\,.\"".contains(c)) => {
                write!(f, "\"{}\" <{}>", name.replace('"', "\\\""), self.address)
            }
            Some(name) => write!(f, "{} <{}>", name, self.address),
        }
    }
}

/// Insertion-ordered mapping from address to display name.
///
/// Inserting an address that's already present replaces its name but keeps
/// its position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Mailboxes(Vec<Mailbox>);

impl Mailboxes {
    pub fn new() -> Self {
        Mailboxes::default()
    }

    pub fn insert(&mut self, address: &str, name: Option<&str>) {
        self.insert_mailbox(Mailbox::new(address, name));
    }

    pub fn insert_mailbox(&mut self, mailbox: Mailbox) {
        match self.0.iter_mut().find(|m| m.address == mailbox.address) {
            Some(existing) => existing.name = mailbox.name,
            None => self.0.push(mailbox),
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.0.iter().any(|m| m.address == address)
    }

    pub fn first(&self) -> Option<&Mailbox> {
        self.0.first()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Mailbox> {
        self.0.iter()
    }

    /// Parse a comma-separated address header value. Commas inside quotes
    /// or angle brackets don't split.
    pub fn parse(value: &str) -> Mailboxes {
        let mut parts = Vec::new();
        let mut part = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for c in value.chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                '<' if !in_quotes => in_angle = true,
                '>' if !in_quotes => in_angle = false,
                ',' if !in_quotes && !in_angle => {
                    parts.push(std::mem::take(&mut part));
                    continue;
                }
                _ => {}
            }
            part.push(c);
        }
        parts.push(part);

        let mut mailboxes = Mailboxes::new();
        for mailbox in parts.iter().filter_map(|p| Mailbox::parse(p)) {
            mailboxes.insert_mailbox(mailbox);
        }
        mailboxes
    }
}

impl fmt::Display for Mailboxes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, mailbox) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", mailbox)?;
        }
        Ok(())
    }
}

/// An email message, held in memory until it's rendered onto a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    from: Mailboxes,
    sender: Option<String>,
    return_path: Option<String>,
    to: Mailboxes,
    cc: Mailboxes,
    bcc: Mailboxes,
    subject: Option<String>,
    date: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Default for Message {
    fn default() -> Self {
        Message::new()
    }
}

impl Message {
    /// An empty message dated now.
    pub fn new() -> Self {
        Message {
            from: Mailboxes::new(),
            sender: None,
            return_path: None,
            to: Mailboxes::new(),
            cc: Mailboxes::new(),
            bcc: Mailboxes::new(),
            subject: None,
            date: Local::now().to_rfc2822(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_from(mut self, address: &str, name: Option<&str>) -> Self {
        self.from.insert(address, name);
        self
    }

    pub fn with_sender(mut self, address: &str) -> Self {
        self.sender = Some(address.to_string());
        self
    }

    pub fn with_return_path(mut self, address: &str) -> Self {
        self.return_path = Some(address.to_string());
        self
    }

    pub fn with_to(mut self, address: &str, name: Option<&str>) -> Self {
        self.to.insert(address, name);
        self
    }

    pub fn with_cc(mut self, address: &str, name: Option<&str>) -> Self {
        self.cc.insert(address, name);
        self
    }

    pub fn with_bcc(mut self, address: &str, name: Option<&str>) -> Self {
        self.bcc.insert(address, name);
        self
    }

    pub fn with_subject(mut self, subject: &str) -> Self {
        self.subject = Some(subject.to_string());
        self
    }

    pub fn with_date(mut self, date: &chrono::DateTime<Local>) -> Self {
        self.date = date.to_rfc2822();
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: &str) -> Self {
        self.body = body.to_string();
        self
    }

    pub fn from(&self) -> &Mailboxes {
        &self.from
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn return_path(&self) -> Option<&str> {
        self.return_path.as_deref()
    }

    pub fn set_return_path(&mut self, address: &str) {
        self.return_path = Some(address.to_string());
    }

    pub fn to(&self) -> &Mailboxes {
        &self.to
    }

    pub fn cc(&self) -> &Mailboxes {
        &self.cc
    }

    pub fn bcc(&self) -> &Mailboxes {
        &self.bcc
    }

    pub fn bcc_mut(&mut self) -> &mut Mailboxes {
        &mut self.bcc
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Envelope sender: the Return-Path, else the Sender, else the first From address.
    pub fn reverse_path(&self) -> Option<&str> {
        self.return_path
            .as_deref()
            .or(self.sender.as_deref())
            .or_else(|| self.from.first().map(|m| m.address.as_str()))
    }

    /// Every distinct recipient address across To, Cc and Bcc, in that order.
    pub fn recipients(&self) -> Vec<&str> {
        let mut recipients: Vec<&str> = Vec::new();
        for mailbox in self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter()) {
            if !recipients.contains(&mailbox.address.as_str()) {
                recipients.push(&mailbox.address);
            }
        }
        recipients
    }

    /// Render the whole message, Bcc header included, with CRLF line endings.
    pub fn write_to<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        self.write_message(out, true)
    }

    /// Render the message without its Bcc header.
    pub fn write_to_without_bcc<W: Write + ?Sized>(&self, out: &mut W) -> std::io::Result<()> {
        self.write_message(out, false)
    }

    fn write_message<W: Write + ?Sized>(&self, out: &mut W, include_bcc: bool) -> std::io::Result<()> {
        write!(out, "Date: {}\r\n", self.date)?;

        let address_headers = [
            ("From", &self.from, true),
            ("To", &self.to, true),
            ("Cc", &self.cc, true),
            ("Bcc", &self.bcc, include_bcc),
        ];
        for (name, mailboxes, include) in address_headers {
            if include && !mailboxes.is_empty() {
                write!(out, "{}: {}\r\n", name, mailboxes)?;
            }
        }

        if let Some(sender) = &self.sender {
            write!(out, "Sender: {}\r\n", sender)?;
        }
        if let Some(subject) = &self.subject {
            write!(out, "Subject: {}\r\n", subject)?;
        }
        for (name, value) in &self.headers {
            write!(out, "{}: {}\r\n", name, value)?;
        }

        // end of headers
        out.write_all(b"\r\n")?;

        for line in self.body.lines() {
            out.write_all(line.as_bytes())?;
            out.write_all(b"\r\n")?;
        }

        out.flush()
    }

    /// Read a raw message (headers, blank line, body) from `input`.
    ///
    /// Folded header lines are unfolded. From, Sender, Return-Path, To, Cc,
    /// Bcc, Subject and Date are picked out; anything else is kept as-is.
    /// A message without a Date header is dated now.
    pub fn parse<R: BufRead>(input: &mut R) -> Result<Message> {
        let mut raw_headers: Vec<(String, String)> = Vec::new();
        let mut buffer = Vec::new();

        loop {
            buffer.clear();
            // read until newline or EOF
            let bytes_read = input.read_until(b'\n', &mut buffer)?;
            if bytes_read == 0 {
                break; // reached EOF
            }

            let line = String::from_utf8_lossy(&buffer);
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                // end of headers
                break;
            }

            if line.starts_with([' ', '\t']) {
                let (_, value) = raw_headers.last_mut().ok_or_else(|| {
                    TransportError::MalformedMessage("continuation line before any header".to_string())
                })?;
                value.push(' ');
                value.push_str(line.trim_start());
                continue;
            }

            let (name, value) = line.split_once(':').ok_or_else(|| {
                TransportError::MalformedMessage(format!("not a header line: {:?}", line))
            })?;
            raw_headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        let mut body = Vec::new();
        input.read_to_end(&mut body)?;

        let mut message = Message::new().with_body(&String::from_utf8_lossy(&body));

        for (name, value) in raw_headers {
            match name.to_ascii_lowercase().as_str() {
                "from" => message.from = Mailboxes::parse(&value),
                "sender" => message.sender = Mailbox::parse(&value).map(|m| m.address),
                "return-path" => message.return_path = Mailbox::parse(&value).map(|m| m.address),
                "to" => message.to = Mailboxes::parse(&value),
                "cc" => message.cc = Mailboxes::parse(&value),
                "bcc" => message.bcc = Mailboxes::parse(&value),
                "subject" => message.subject = Some(value),
                "date" => message.date = value,
                _ => message.headers.push((name, value)),
            }
        }

        Ok(message)
    }
}
