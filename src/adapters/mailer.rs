//! Mail Adapters
//!
//! `SendmailMailer` hands the report to the local MTA; `LoggingMailer`
//! writes it to the log when no relay is configured.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, instrument};

use crate::domain::ports::Mailer;
use crate::error::{Error, Result};

/// Pipes an RFC 822 message into `sendmail -t -i`.
#[derive(Debug, Clone)]
pub struct SendmailMailer {
    program: String,
    sender: String,
    timeout: Duration,
}

impl SendmailMailer {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            program: "/usr/sbin/sendmail".to_string(),
            sender: sender.into(),
            timeout: Duration::from_secs(60),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn message(&self, subject: &str, body: &str, recipient: &str) -> Result<String> {
        let headers = [
            ("sender", self.sender.as_str()),
            ("recipient", recipient),
            ("subject", subject),
        ];
        for (name, value) in headers {
            if value.contains(['\r', '\n']) {
                return Err(Error::Mail(format!("{} contains a line break", name)));
            }
        }
        Ok(format!(
            concat!(
                "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\n",
                "Content-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            ),
            self.sender,
            recipient,
            subject,
            Utc::now().to_rfc2822(),
            body.replace('\n', "\r\n")
        ))
    }
}

#[async_trait]
impl Mailer for SendmailMailer {
    #[instrument(skip(self, body))]
    async fn send(&self, subject: &str, body: &str, recipient: &str) -> Result<()> {
        let message = self.message(subject, body, recipient)?;

        let mut child = Command::new(&self.program)
            .args(["-t", "-i"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Mail(format!("failed to spawn {}: {}", self.program, e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Mail("sendmail stdin unavailable".to_string()))?;
        stdin
            .write_all(message.as_bytes())
            .await
            .map_err(|e| Error::Mail(format!("failed to write message: {}", e)))?;
        drop(stdin);

        let output = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::Mail(format!("sendmail timed out after {:?}", self.timeout)))?
            .map_err(|e| Error::Mail(e.to_string()))?;

        if !output.status.success() {
            return Err(Error::Mail(format!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        debug!("Report accepted by local MTA");
        Ok(())
    }
}

/// Logs the report instead of mailing it.
#[derive(Debug, Clone, Default)]
pub struct LoggingMailer;

#[async_trait]
impl Mailer for LoggingMailer {
    async fn send(&self, subject: &str, body: &str, recipient: &str) -> Result<()> {
        info!(recipient = %recipient, "{}\n{}", subject, body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_message_headers() {
        let mailer = SendmailMailer::new("safecopy@example.com");
        let message = mailer
            .message("Daily Integrity Report", "Scan: Done\nBackup: Done", "ops@example.com")
            .unwrap();

        assert!(message.starts_with("From: safecopy@example.com\r\n"));
        assert!(message.contains("To: ops@example.com\r\n"));
        assert!(message.contains("Subject: Daily Integrity Report\r\n"));
        assert!(message.contains("\r\n\r\nScan: Done\r\nBackup: Done"));
    }

    #[test]
    fn test_rejects_header_injection() {
        let mailer = SendmailMailer::new("safecopy@example.com");
        assert_matches!(
            mailer.message("Report\nBcc: evil@example.com", "", "ops@example.com"),
            Err(Error::Mail(_))
        );
    }

    #[tokio::test]
    async fn test_missing_binary_is_mail_error() {
        let mailer = SendmailMailer::new("safecopy@example.com")
            .with_program("/nonexistent/sendmail");
        let result = mailer.send("s", "b", "ops@example.com").await;
        assert_matches!(result, Err(Error::Mail(_)));
    }

    #[tokio::test]
    async fn test_logging_mailer() {
        LoggingMailer.send("s", "b", "ops@example.com").await.unwrap();
    }
}
