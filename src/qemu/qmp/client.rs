//! QMP client for QEMU control.
//!
//! Implements the QEMU Machine Protocol over any line-oriented byte stream
//! pair. QMP has no request IDs: a reply belongs to the last command sent,
//! so commands go out strictly one at a time.

use crate::error::{HarnessError, Result};
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt;
use std::io::{BufRead, Write};

/// Top-level key of the greeting QEMU sends on connect.
const GREETING_KEY: &str = "QMP";

/// Lifecycle of a client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Unopened,
    Negotiating,
    Ready,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// QMP command structure.
#[derive(Debug, Serialize)]
struct QmpCommand<'a> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<Value>,
}

/// The reply every successful command without output gets.
pub fn empty_success() -> Value {
    json!({ "return": {} })
}

/// QMP client over a reply reader and a command writer.
pub struct QmpClient<R, W> {
    reader: R,
    writer: W,
    state: ClientState,
    greeting: Option<Value>,
    /// Events that arrived while waiting for replies, oldest first.
    events: Vec<Value>,
}

impl<R: BufRead, W: Write> QmpClient<R, W> {
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader,
            writer,
            state: ClientState::Unopened,
            greeting: None,
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    /// Read the greeting and enable command mode.
    pub fn negotiate(&mut self) -> Result<()> {
        if self.state != ClientState::Unopened {
            return Err(HarnessError::Protocol(format!(
                "cannot negotiate in state {}",
                self.state
            )));
        }
        self.state = ClientState::Negotiating;

        let line = self
            .read_line()?
            .ok_or_else(|| HarnessError::Protocol("unexpected greeting: channel closed".into()))?;
        let greeting: Value = serde_json::from_str(&line)
            .map_err(|_| HarnessError::Protocol(format!("unexpected greeting: {}", line.trim())))?;
        if greeting.get(GREETING_KEY).is_none() {
            return Err(HarnessError::Protocol(format!(
                "unexpected greeting: {}",
                line.trim()
            )));
        }
        self.greeting = Some(greeting);

        self.send("qmp_capabilities", None)?;
        let reply = self.read_line()?;
        let accepted = reply
            .as_deref()
            .and_then(|line| serde_json::from_str::<Value>(line).ok())
            .is_some_and(|value| value == empty_success());
        if !accepted {
            return Err(HarnessError::Protocol(format!(
                "handshake rejected: {}",
                reply.as_deref().map(str::trim).unwrap_or("channel closed")
            )));
        }

        self.state = ClientState::Ready;
        Ok(())
    }

    /// Execute a QMP command and return the reply object.
    ///
    /// Events that arrive before the reply are recorded, not returned.
    pub fn execute(&mut self, command: &str, arguments: Option<Value>) -> Result<Value> {
        if self.state != ClientState::Ready {
            return Err(HarnessError::Protocol(format!(
                "cannot execute `{}` in state {}",
                command, self.state
            )));
        }
        self.send(command, arguments)?;

        // Read response (may need to skip event messages)
        loop {
            let line = self.read_line()?.ok_or_else(|| {
                HarnessError::Protocol(format!("channel closed before reply to `{}`", command))
            })?;
            let value: Value = serde_json::from_str(&line).map_err(|_| {
                HarnessError::Protocol(format!("malformed reply: {}", line.trim()))
            })?;
            if !value.is_object() {
                return Err(HarnessError::Protocol(format!(
                    "malformed reply: {}",
                    line.trim()
                )));
            }

            if value.get("event").is_some() {
                self.events.push(value);
                continue;
            }
            return Ok(value);
        }
    }

    /// Take a screenshot and save it (PPM) to `filename`, relative to QEMU's cwd.
    pub fn screendump(&mut self, filename: &str) -> Result<()> {
        let reply = self.execute("screendump", Some(json!({ "filename": filename })))?;
        if reply != empty_success() {
            return Err(HarnessError::Protocol(format!(
                "screenshot command failed: {}",
                describe_error(&reply)
            )));
        }
        Ok(())
    }

    /// QEMU version from the greeting, e.g. `8.2.0`.
    pub fn qemu_version(&self) -> Option<String> {
        let version = self.greeting.as_ref()?.get(GREETING_KEY)?.get("version")?.get("qemu")?;
        Some(format!(
            "{}.{}.{}",
            version.get("major")?,
            version.get("minor")?,
            version.get("micro")?
        ))
    }

    /// Drain the events recorded so far.
    pub fn take_events(&mut self) -> Vec<Value> {
        std::mem::take(&mut self.events)
    }

    /// Stop using the connection. Tearing down the transport is the owner's job.
    pub fn close(&mut self) {
        self.state = ClientState::Closed;
    }

    fn send(&mut self, command: &str, arguments: Option<Value>) -> Result<()> {
        let cmd = QmpCommand {
            execute: command,
            arguments,
        };
        let cmd_json = serde_json::to_string(&cmd)
            .map_err(|e| HarnessError::Protocol(format!("encoding `{}`: {}", command, e)))?;
        writeln!(self.writer, "{}", cmd_json)?;
        self.writer.flush()?;
        Ok(())
    }

    /// One line, or `None` at end of stream.
    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        if self.reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

/// `class: desc` for QMP error replies, the raw reply otherwise.
fn describe_error(reply: &Value) -> String {
    match reply.get("error") {
        Some(error) => {
            let class = error
                .get("class")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            let desc = error
                .get("desc")
                .and_then(|v| v.as_str())
                .unwrap_or("No description");
            format!("{}: {}", class, desc)
        }
        None => reply.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GREETING: &str = r#"{"QMP": {"version": {"qemu": {"micro": 1, "minor": 2, "major": 8}, "package": "Debian 1:8.2.1"}, "capabilities": ["oob"]}}"#;

    fn ready_client<'a>(
        replies: &'a str,
        out: &'a mut Vec<u8>,
    ) -> QmpClient<&'a [u8], &'a mut Vec<u8>> {
        let mut client = QmpClient::new(replies.as_bytes(), out);
        client.negotiate().unwrap();
        client
    }

    #[test]
    fn test_handshake() {
        let replies = format!("{}\n{{\"return\": {{}}}}\n", GREETING);
        let mut out = Vec::new();
        let client = ready_client(&replies, &mut out);

        assert_eq!(client.state(), ClientState::Ready);
        assert_eq!(client.qemu_version().as_deref(), Some("8.2.1"));
        drop(client);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"execute\":\"qmp_capabilities\"}\n"
        );
    }

    #[test]
    fn test_unexpected_greeting() {
        let mut out = Vec::new();
        let mut client = QmpClient::new(&b"{\"hello\": 1}\n"[..], &mut out);
        let err = client.negotiate().unwrap_err();
        assert!(err.to_string().contains("unexpected greeting"), "{err}");

        let mut out = Vec::new();
        let mut client = QmpClient::new(&b"not json\n"[..], &mut out);
        assert!(client.negotiate().unwrap_err().to_string().contains("unexpected greeting"));

        let mut out = Vec::new();
        let mut client = QmpClient::new(&b""[..], &mut out);
        assert!(client.negotiate().unwrap_err().to_string().contains("unexpected greeting"));
    }

    #[test]
    fn test_handshake_rejected() {
        let replies = format!(
            "{}\n{{\"error\": {{\"class\": \"CommandNotFound\", \"desc\": \"nope\"}}}}\n",
            GREETING
        );
        let mut out = Vec::new();
        let mut client = QmpClient::new(replies.as_bytes(), &mut out);
        let err = client.negotiate().unwrap_err();
        assert!(err.to_string().contains("handshake rejected"), "{err}");
        assert_ne!(client.state(), ClientState::Ready);
    }

    #[test]
    fn test_execute_skips_events() {
        let replies = format!(
            "{}\n{{\"return\": {{}}}}\n{{\"event\":\"DEVICE_TRAY_MOVED\"}}\n{{\"return\":{{}}}}\n",
            GREETING
        );
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);

        let reply = client.execute("stop", None).unwrap();
        assert_eq!(reply, json!({"return": {}}));

        let events = client.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "DEVICE_TRAY_MOVED");
        assert!(client.take_events().is_empty());
    }

    #[test]
    fn test_execute_returns_error_reply() {
        let replies = format!(
            "{}\n{{\"return\": {{}}}}\n{{\"error\": {{\"class\": \"GenericError\", \"desc\": \"bad\"}}}}\n",
            GREETING
        );
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);
        let reply = client.execute("cont", None).unwrap();
        assert_eq!(reply["error"]["class"], "GenericError");
    }

    #[test]
    fn test_malformed_reply() {
        let replies = format!("{}\n{{\"return\": {{}}}}\n{{\"event\": \"X\"}}\ngarbage\n", GREETING);
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);
        let err = client.execute("stop", None).unwrap_err();
        assert!(err.to_string().contains("malformed reply"), "{err}");
    }

    #[test]
    fn test_closed_before_reply() {
        let replies = format!("{}\n{{\"return\": {{}}}}\n", GREETING);
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);
        let err = client.execute("stop", None).unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
    }

    #[test]
    fn test_execute_requires_ready() {
        let mut out = Vec::new();
        let mut client = QmpClient::new(&b""[..], &mut out);
        assert!(client.execute("stop", None).is_err());

        let replies = format!("{}\n{{\"return\": {{}}}}\n", GREETING);
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);
        client.close();
        assert_eq!(client.state(), ClientState::Closed);
        assert!(client.execute("stop", None).is_err());
    }

    #[test]
    fn test_screendump_command_shape() {
        let replies = format!("{}\n{{\"return\": {{}}}}\n{{\"return\": {{}}}}\n", GREETING);
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);
        client.screendump("screenshot.ppm").unwrap();
        drop(client);

        let sent = String::from_utf8(out).unwrap();
        let last: Value = serde_json::from_str(sent.lines().last().unwrap()).unwrap();
        assert_eq!(
            last,
            json!({"execute": "screendump", "arguments": {"filename": "screenshot.ppm"}})
        );
    }

    #[test]
    fn test_screendump_failure() {
        let replies = format!(
            "{}\n{{\"return\": {{}}}}\n{{\"error\": {{\"class\": \"GenericError\", \"desc\": \"no display\"}}}}\n",
            GREETING
        );
        let mut out = Vec::new();
        let mut client = ready_client(&replies, &mut out);
        let err = client.screendump("screenshot.ppm").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Protocol error: screenshot command failed: GenericError: no display"
        );
    }
}
