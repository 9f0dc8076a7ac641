//! Test doubles for the process stream and the session engine.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::{self, Write};

use mailsubmit::error::Result;
use mailsubmit::{IoBuffer, Message, SessionEngine, TransportConfig, TransportError, WriteTranslations};

/// Something done to a `MockBuffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Initialize(TransportConfig),
    Translations(WriteTranslations),
    Write(Vec<u8>),
    ReadLine,
    Terminate,
}

/// An `IoBuffer` which records every call, applies write translations the
/// way a real stream does, and answers reads from a script.
#[derive(Debug, Default)]
pub struct MockBuffer {
    pub ops: Vec<Op>,
    pub written: Vec<u8>,
    /// When set, every write fails with a broken pipe.
    pub fail_writes: bool,
    responses: VecDeque<String>,
    translations: WriteTranslations,
    pending: Vec<u8>,
}

impl MockBuffer {
    pub fn new() -> Self {
        MockBuffer::default()
    }

    pub fn with_responses(responses: &[&str]) -> Self {
        let mut buffer = MockBuffer::new();
        buffer.push_responses(responses);
        buffer
    }

    pub fn push_responses(&mut self, responses: &[&str]) {
        self.responses
            .extend(responses.iter().map(|r| format!("{}\r\n", r)));
    }

    pub fn written_string(&self) -> String {
        String::from_utf8_lossy(&self.written).into_owned()
    }

    /// Commands the buffer was initialized with, in order.
    pub fn initialized_commands(&self) -> Vec<String> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                Op::Initialize(params) => Some(params.command.clone()),
                _ => None,
            })
            .collect()
    }

    /// Everything except the writes and reads themselves.
    pub fn lifecycle_ops(&self) -> Vec<Op> {
        self.ops
            .iter()
            .filter(|op| !matches!(op, Op::Write(_) | Op::ReadLine))
            .cloned()
            .collect()
    }

    fn flush_pending(&mut self) {
        let (out, _) = self.translations.apply(&self.pending, true);
        self.pending.clear();
        self.written.extend_from_slice(&out);
    }
}

impl Write for MockBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.ops.push(Op::Write(buf.to_vec()));
        if self.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "process went away"));
        }
        self.pending.extend_from_slice(buf);
        let (out, consumed) = self.translations.apply(&self.pending, false);
        self.pending.drain(..consumed);
        self.written.extend_from_slice(&out);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_pending();
        Ok(())
    }
}

impl IoBuffer for MockBuffer {
    fn initialize(&mut self, params: &TransportConfig) -> Result<()> {
        self.ops.push(Op::Initialize(params.clone()));
        self.translations = WriteTranslations::none();
        self.pending.clear();
        Ok(())
    }

    fn set_write_translations(&mut self, translations: WriteTranslations) -> Result<()> {
        self.flush_pending();
        self.ops.push(Op::Translations(translations.clone()));
        self.translations = translations;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        self.flush_pending();
        self.ops.push(Op::ReadLine);
        self.responses
            .pop_front()
            .ok_or(TransportError::ConnectionClosed)
    }

    fn terminate(&mut self) -> Result<()> {
        self.flush_pending();
        self.ops.push(Op::Terminate);
        Ok(())
    }
}

/// A session engine that accepts a fixed number of recipients and rejects
/// a fixed list, without touching the buffer.
#[derive(Debug, Default)]
pub struct MockSession {
    pub started: bool,
    pub start_params: Vec<TransportConfig>,
    pub send_params: Vec<TransportConfig>,
    pub stop_calls: usize,
    pub accept: usize,
    pub reject: Vec<String>,
}

impl SessionEngine for MockSession {
    fn is_started(&self) -> bool {
        self.started
    }

    fn start(&mut self, _buffer: &mut dyn IoBuffer, params: &TransportConfig) -> Result<()> {
        self.start_params.push(params.clone());
        self.started = true;
        Ok(())
    }

    fn send(
        &mut self,
        _buffer: &mut dyn IoBuffer,
        params: &TransportConfig,
        _message: &Message,
        failed_recipients: &mut Vec<String>,
    ) -> Result<usize> {
        self.send_params.push(params.clone());
        failed_recipients.extend(self.reject.iter().cloned());
        Ok(self.accept)
    }

    fn stop(&mut self, _buffer: &mut dyn IoBuffer) -> Result<()> {
        if self.started {
            self.stop_calls += 1;
            self.started = false;
        }
        Ok(())
    }
}
