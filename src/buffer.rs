//! Byte streams backed by a spawned sendmail process.

use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};

/// Byte-sequence replacements applied to everything written to a buffer.
///
/// Rules are tried in order at each position; the first match wins.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteTranslations {
    rules: Vec<(Vec<u8>, Vec<u8>)>,
}

impl WriteTranslations {
    pub fn none() -> Self {
        WriteTranslations::default()
    }

    /// Add a rule replacing `from` with `to`. Empty `from` sequences are ignored.
    pub fn with(mut self, from: &[u8], to: &[u8]) -> Self {
        if !from.is_empty() {
            self.rules.push((from.to_vec(), to.to_vec()));
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Translate `input`, returning the output and how many input bytes were
    /// consumed. Unless `at_end` is set, a tail which could be the start of a
    /// rule is left unconsumed, so that a match split across two writes is
    /// still found.
    pub fn apply(&self, input: &[u8], at_end: bool) -> (Vec<u8>, usize) {
        let mut output = Vec::with_capacity(input.len());
        let mut i = 0;

        'outer: while i < input.len() {
            let rest = &input[i..];
            for (from, to) in &self.rules {
                if rest.starts_with(from) {
                    output.extend_from_slice(to);
                    i += from.len();
                    continue 'outer;
                }
            }
            if !at_end
                && self
                    .rules
                    .iter()
                    .any(|(from, _)| rest.len() < from.len() && from.starts_with(rest))
            {
                break;
            }
            output.push(input[i]);
            i += 1;
        }

        (output, i)
    }
}

/// A bidirectional byte stream the transport drives sendmail through.
///
/// Buffers can be initialized any number of times; each `initialize` starts
/// over with a fresh connection.
pub trait IoBuffer: Write {
    fn initialize(&mut self, params: &TransportConfig) -> Result<()>;

    /// Replace the current write translations. Bytes held back under the
    /// old rules are written out first.
    fn set_write_translations(&mut self, translations: WriteTranslations) -> Result<()>;

    /// Read one line of output, including its line ending. In non-blocking
    /// mode an empty string means nothing was available.
    fn read_line(&mut self) -> Result<String>;

    /// Flush pending bytes, close the connection and let the process exit.
    fn terminate(&mut self) -> Result<()>;
}

/// Time between polls while waiting for a process to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Put our end of the stdin pipe into non-blocking mode, so that a process
/// which stops reading can't stall a write past the timeout.
fn set_nonblocking(stdin: &ChildStdin) -> io::Result<()> {
    let fd = stdin.as_raw_fd();
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Wait until `stdin` can take more bytes. Gives up with a timeout error
/// (carried inside the `io::Error`) once `timeout` has passed.
fn wait_writable(stdin: &ChildStdin, timeout: Option<Duration>, seconds: u64) -> io::Result<()> {
    let poll_timeout = match timeout {
        Some(t) => i32::try_from(t.as_millis())
            .ok()
            .and_then(|ms| PollTimeout::try_from(ms).ok())
            .unwrap_or(PollTimeout::MAX),
        None => PollTimeout::NONE,
    };
    let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLOUT)];

    loop {
        match poll(&mut fds, poll_timeout) {
            Ok(0) => {
                return Err(io::Error::new(
                    ErrorKind::TimedOut,
                    TransportError::Timeout { seconds },
                ))
            }
            // POLLERR and POLLHUP also land here; the next write reports them
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// An `IoBuffer` that runs its command through `/bin/sh -c`.
///
/// Process stdout is read line by line on a background thread, so reads can
/// honour the configured timeout.
#[derive(Debug, Default)]
pub struct ProcessBuffer {
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    lines: Option<Receiver<io::Result<String>>>,
    translations: WriteTranslations,
    pending: Vec<u8>,
    timeout: u64,
    blocking: bool,
}

impl ProcessBuffer {
    pub fn new() -> Self {
        ProcessBuffer::default()
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }

    fn timeout_duration(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_secs(self.timeout))
    }

    fn stdin(&mut self) -> io::Result<&mut ChildStdin> {
        self.stdin.as_mut().ok_or_else(|| {
            io::Error::new(ErrorKind::NotConnected, "process stream is not initialized")
        })
    }

    /// Write all of `bytes` to the process. Each stretch spent waiting for
    /// the pipe to drain is limited by the timeout.
    fn write_out(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        let timeout = self.timeout_duration();
        let seconds = self.timeout;
        let stdin = self.stdin()?;

        while !bytes.is_empty() {
            match stdin.write(bytes) {
                Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
                Ok(n) => bytes = &bytes[n..],
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    wait_writable(stdin, timeout, seconds)?
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Write out anything held back waiting for a possible translation match.
    fn flush_pending(&mut self) -> io::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let (out, _) = self.translations.apply(&self.pending, true);
        self.pending.clear();
        self.write_out(&out)
    }

    /// Wait for the child to exit, up to the timeout. On expiry, ask it
    /// nicely with SIGTERM, then kill it.
    fn reap(&self, mut child: Child) -> Result<()> {
        let deadline = self.timeout_duration().map(|t| Instant::now() + t);

        loop {
            if let Some(status) = child.try_wait()? {
                if status.success() {
                    log::debug!("sendmail process exited cleanly");
                } else {
                    log::warn!("sendmail process exited with {}", status);
                }
                return Ok(());
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => break,
                _ => thread::sleep(EXIT_POLL_INTERVAL),
            }
        }

        log::warn!(
            "sendmail process (pid {}) still running after {} seconds; terminating it",
            child.id(),
            self.timeout
        );
        if let Err(e) = kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM) {
            log::debug!("SIGTERM to pid {} failed: {}", child.id(), e);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        child.wait()?;

        Err(TransportError::Timeout {
            seconds: self.timeout,
        })
    }
}

impl Write for ProcessBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.translations.is_empty() {
            self.write_out(buf)?;
            return Ok(buf.len());
        }

        self.pending.extend_from_slice(buf);
        let (out, consumed) = self.translations.apply(&self.pending, false);
        self.pending.drain(..consumed);
        self.write_out(&out)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // nothing is buffered beyond a held-back translation match
        self.flush_pending()
    }
}

impl IoBuffer for ProcessBuffer {
    fn initialize(&mut self, params: &TransportConfig) -> Result<()> {
        if self.child.is_some() {
            log::debug!("reinitializing process stream; terminating previous process");
            self.terminate()?;
        }

        log::debug!("spawning sendmail process: {}", params.command);

        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(&params.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take().ok_or(TransportError::NotInitialized)?;
        let stdout = child.stdout.take().ok_or(TransportError::NotInitialized)?;
        set_nonblocking(&stdin)?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut reader = BufReader::new(stdout);
            loop {
                let mut line = String::new();
                match reader.read_line(&mut line) {
                    Ok(0) => break,
                    Ok(_) => {
                        if tx.send(Ok(line)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        break;
                    }
                }
            }
        });

        self.child = Some(child);
        self.stdin = Some(stdin);
        self.lines = Some(rx);
        self.translations = WriteTranslations::none();
        self.pending.clear();
        self.timeout = params.timeout;
        self.blocking = params.blocking;

        Ok(())
    }

    fn set_write_translations(&mut self, translations: WriteTranslations) -> Result<()> {
        if self.stdin.is_some() {
            self.flush_pending()?;
        }
        self.pending.clear();
        self.translations = translations;
        Ok(())
    }

    fn read_line(&mut self) -> Result<String> {
        // anything we've written may be what the process is waiting on
        self.flush()?;

        let timeout = self.timeout_duration();
        let lines = self.lines.as_ref().ok_or(TransportError::NotInitialized)?;

        let received = if !self.blocking {
            match lines.try_recv() {
                Ok(line) => line,
                Err(TryRecvError::Empty) => return Ok(String::new()),
                Err(TryRecvError::Disconnected) => return Err(TransportError::ConnectionClosed),
            }
        } else if let Some(timeout) = timeout {
            match lines.recv_timeout(timeout) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::Timeout {
                        seconds: self.timeout,
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::ConnectionClosed)
                }
            }
        } else {
            lines.recv().map_err(|_| TransportError::ConnectionClosed)?
        };

        let line = received?;
        log::trace!("<< {}", line.trim_end());
        Ok(line)
    }

    fn terminate(&mut self) -> Result<()> {
        let child = match self.child.take() {
            Some(child) => child,
            None => return Ok(()),
        };

        let flushed = self.flush();
        // dropping stdin closes the pipe, which is sendmail's cue to finish up
        self.stdin = None;
        self.lines = None;
        self.translations = WriteTranslations::none();
        self.pending.clear();

        let reaped = self.reap(child);
        flushed?;
        reaped
    }
}

impl Drop for ProcessBuffer {
    fn drop(&mut self) {
        if self.child.is_some() {
            if let Err(e) = self.terminate() {
                log::warn!("error terminating sendmail process: {}", e);
            }
        }
    }
}
