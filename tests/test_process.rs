//! Tests which run real processes through `/bin/sh`.

use std::fs::{read_to_string, write};
use std::io::Write;
use std::path::Path;
use std::time::{Duration, Instant};

use tempfile::{tempdir, TempDir};

use mailsubmit::{
    IoBuffer, MainContext, Message, ProcessBuffer, SendmailTransport, TransportConfig,
    TransportError, WriteTranslations,
};

fn params(command: &str) -> TransportConfig {
    TransportConfig {
        timeout: 5,
        ..TransportConfig::default()
    }
    .with_command(command)
}

/// A stand-in for `sendmail -t`: records its arguments, one per line, and its stdin.
fn capture_script(dir: &TempDir) -> String {
    let script = dir.path().join("capture.sh");
    let conts = format!(
        "printf '%s\\n' \"$@\" > {}\ncat > {}\n",
        dir.path().join("args").display(),
        dir.path().join("message").display()
    );
    write(&script, conts).unwrap();
    format!("/bin/sh {}", script.display())
}

/// A stand-in for `sendmail -bs`: a tiny SMTP server which rejects
/// nobody@example.com, logs commands and stores message data.
fn smtp_script(dir: &TempDir) -> String {
    let script = dir.path().join("smtp.sh");
    let conts = r#"cr=$(printf '\r')
printf '220 localhost ESMTP test\r\n'
while IFS= read -r line; do
  line=${line%"$cr"}
  echo "$line" >> LOG
  case "$line" in
    EHLO*) printf '250-localhost\r\n250 8BITMIME\r\n' ;;
    "MAIL FROM:"*) printf '250 2.1.0 Ok\r\n' ;;
    "RCPT TO:<nobody@example.com>") printf '550 5.1.1 No such user\r\n' ;;
    "RCPT TO:"*) printf '250 2.1.5 Ok\r\n' ;;
    DATA)
      printf '354 End data with <CR><LF>.<CR><LF>\r\n'
      while IFS= read -r data; do
        data=${data%"$cr"}
        [ "$data" = "." ] && break
        echo "$data" >> MSG
      done
      printf '250 2.0.0 Ok: queued\r\n' ;;
    RSET) printf '250 2.0.0 Ok\r\n' ;;
    QUIT) printf '221 2.0.0 Bye\r\n'; exit 0 ;;
    *) printf '502 5.5.2 Error: command not recognized\r\n' ;;
  esac
done
"#
    .replace("LOG", &dir.path().join("log").display().to_string())
    .replace("MSG", &dir.path().join("message").display().to_string());
    write(&script, conts).unwrap();
    format!("/bin/sh {}", script.display())
}

fn read_lines(path: &Path) -> Vec<String> {
    read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[test]
fn test_batch_delivery_through_process() {
    let dir = tempdir().unwrap();
    let command = format!("{} -oi -t", capture_script(&dir));
    let mut transport = SendmailTransport::new().with_config(params(&command));

    let message = Message::new()
        .with_from("a@example.com", None)
        .with_to("b@example.com", None)
        .with_cc("c@example.com", None)
        .with_subject("batch test")
        .with_body("first\nsecond\n");
    let mut failed = Vec::new();

    let count = transport.send(&message, &mut failed).unwrap();

    assert_eq!(count, 2);
    assert!(failed.is_empty());
    assert_eq!(
        read_lines(&dir.path().join("args")),
        vec!["-oi", "-t", "-fa@example.com"]
    );

    let delivered = read_to_string(dir.path().join("message")).unwrap();
    assert!(!delivered.contains('\r'), "delivered was: {:?}", delivered);
    assert!(delivered.contains("Subject: batch test\n"));
    assert!(delivered.ends_with("\n\nfirst\nsecond\n"));
    assert!(!transport.buffer().is_running());
}

#[test]
fn test_session_delivery_through_process() {
    let dir = tempdir().unwrap();
    let command = format!("{} -bs", smtp_script(&dir));
    let mut transport = SendmailTransport::new().with_config(params(&command));

    transport.start().unwrap();
    assert!(transport.is_started());

    let message = Message::new()
        .with_from("a@example.com", None)
        .with_to("b@example.com", None)
        .with_to("nobody@example.com", None)
        .with_subject("session test")
        .with_body("Hello\n");
    let mut failed = Vec::new();

    let count = transport.send(&message, &mut failed).unwrap();
    transport.stop().unwrap();

    assert_eq!(count, 1);
    assert_eq!(failed, vec!["nobody@example.com"]);
    assert!(!transport.is_started());

    let log = read_lines(&dir.path().join("log"));
    assert_eq!(log.first().map(String::as_str), Some("EHLO [127.0.0.1]"));
    assert!(log.contains(&"MAIL FROM:<a@example.com>".to_string()));
    assert_eq!(log.last().map(String::as_str), Some("QUIT"));

    let delivered = read_to_string(dir.path().join("message")).unwrap();
    assert!(delivered.contains("Subject: session test"));
}

/// the session engine starts itself if send() is called first
#[test]
fn test_session_send_without_start() {
    let dir = tempdir().unwrap();
    let command = format!("{} -bs", smtp_script(&dir));
    let mut transport = SendmailTransport::new().with_config(params(&command));

    let message = Message::new()
        .with_from("a@example.com", None)
        .with_to("b@example.com", None);
    let mut failed = Vec::new();

    assert_eq!(transport.send(&message, &mut failed).unwrap(), 1);
    assert!(transport.is_started());
}

#[test]
fn test_session_greeting_timeout() {
    let mut transport = SendmailTransport::new().with_config(TransportConfig {
        timeout: 1,
        ..params("sleep 3; : -bs")
    });

    let result = transport.start();

    assert!(
        matches!(result, Err(TransportError::Timeout { seconds: 1 })),
        "got: {:?}",
        result
    );
    assert!(!transport.is_started());
}

#[test]
fn test_batch_sender_is_quoted_for_the_shell() {
    let dir = tempdir().unwrap();
    let command = format!("{} -t", capture_script(&dir));
    let mut transport = SendmailTransport::new().with_config(params(&command));
    let message = Message::new()
        .with_to("b@example.com", None)
        .with_return_path("o'brien&co@example.com");
    let mut failed = Vec::new();

    transport.send(&message, &mut failed).unwrap();

    assert_eq!(
        read_lines(&dir.path().join("args")),
        vec!["-t", "-fo'brien&co@example.com"]
    );
}

/// a process that never reads its input can't hold a write up past the timeout
#[test]
fn test_batch_write_times_out() {
    let mut transport = SendmailTransport::new().with_config(TransportConfig {
        timeout: 1,
        ..params("sleep 20; : -t -f x@y.com")
    });
    // well past what a pipe will hold
    let message = Message::new()
        .with_to("b@example.com", None)
        .with_body(&"x".repeat(1 << 20));
    let mut failed = Vec::new();

    let started = Instant::now();
    let result = transport.send(&message, &mut failed);
    let elapsed = started.elapsed();

    assert!(
        matches!(result, Err(TransportError::Timeout { seconds: 1 })),
        "got: {:?}",
        result
    );
    assert!(elapsed < Duration::from_secs(10), "took {:?}", elapsed);
    assert!(!transport.buffer().is_running());
}

#[test]
fn test_process_buffer_translates_across_writes() {
    let mut buffer = ProcessBuffer::new();
    buffer.initialize(&params("cat")).unwrap();
    buffer
        .set_write_translations(WriteTranslations::none().with(b"\r\n", b"\n"))
        .unwrap();

    buffer.write_all(b"a\r").unwrap();
    buffer.write_all(b"\nb\r\n").unwrap();

    assert_eq!(buffer.read_line().unwrap(), "a\n");
    assert_eq!(buffer.read_line().unwrap(), "b\n");
    buffer.terminate().unwrap();
    assert!(!buffer.is_running());
}

#[test]
fn test_process_buffer_non_blocking_read() {
    let mut buffer = ProcessBuffer::new();
    let config = TransportConfig {
        blocking: false,
        ..params("cat")
    };
    buffer.initialize(&config).unwrap();

    assert_eq!(buffer.read_line().unwrap(), "");
    buffer.terminate().unwrap();
}

#[test]
fn test_process_buffer_closed_output() {
    let mut buffer = ProcessBuffer::new();
    buffer.initialize(&params("true")).unwrap();

    let result = buffer.read_line();

    assert!(matches!(result, Err(TransportError::ConnectionClosed)), "got: {:?}", result);
    buffer.terminate().unwrap();
}

#[test]
fn test_process_buffer_reinitialize() {
    let mut buffer = ProcessBuffer::new();
    buffer.initialize(&params("cat")).unwrap();
    buffer.initialize(&params("echo second")).unwrap();

    assert_eq!(buffer.read_line().unwrap(), "second\n");
    buffer.terminate().unwrap();
}

#[test]
fn test_run_reports_accepted_recipients() {
    let dir = tempdir().unwrap();
    let command = format!("{} -oi -t", capture_script(&dir));
    let ctx = MainContext {
        args: vec![
            "mailsubmit".to_string(),
            "--command".to_string(),
            command,
            "-f".to_string(),
            "bounce@example.com".to_string(),
            "extra@example.com".to_string(),
        ],
        config_path: dir.path().join("no-such.conf").display().to_string(),
    };
    let input = b"From: a@example.com\nTo: b@example.com\nSubject: hi\n\nHello\n";
    let mut output = Vec::new();

    mailsubmit::run(&ctx, &mut &input[..], &mut output).unwrap();

    assert_eq!(String::from_utf8(output).unwrap(), "accepted: 2\n");
    assert_eq!(
        read_lines(&dir.path().join("args")),
        vec!["-oi", "-t", "-fbounce@example.com"]
    );
    let delivered = read_to_string(dir.path().join("message")).unwrap();
    assert!(delivered.contains("Bcc: extra@example.com\n"));
}

#[test]
fn test_run_rejects_unsupported_command() {
    let ctx = MainContext {
        args: vec![
            "mailsubmit".to_string(),
            "--command".to_string(),
            "/bin/true".to_string(),
            "-f".to_string(),
            "a@example.com".to_string(),
        ],
        config_path: "/nonexistent/mailsubmit.conf".to_string(),
    };
    let input = b"To: b@example.com\n\nHello\n";
    let mut output = Vec::new();

    let result = mailsubmit::run(&ctx, &mut &input[..], &mut output);

    let err = result.unwrap_err();
    assert!(format!("{:#}", err).contains("/bin/true"), "error was: {:#}", err);
    assert!(output.is_empty());
}
