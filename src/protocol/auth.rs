//! # SASL Authentication
//!
//! The line-based exchange run once per connection before binary framing.
//!
//! ## Exchange
//! ```text
//! C: \0AUTH EXTERNAL 31303030
//! S: OK 1234deadbeef
//! C: NEGOTIATE_UNIX_FD          (only when fd passing was requested)
//! S: AGREE_UNIX_FD
//! C: BEGIN
//! ```
//!
//! [`Authenticator`] is a pure state machine: it produces the first request
//! and turns each server line into the next client line. [`authenticate`]
//! drives it over a [`BusStream`] with a deadline.

use crate::config::{AuthConfig, AuthMechanismKind};
use crate::error::{DbusError, Result};
use crate::transport::stream::BusStream;
use crate::utils::timeout::with_timeout_error;
use bytes::BytesMut;
use std::time::Duration;
use tracing::{debug, instrument, trace};

/// Longest line accepted from the server
pub const MAX_LINE_LEN: usize = 16 * 1024;

/// Client side SASL mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMechanism {
    /// Credentials from the socket. `None` sends an empty initial response
    /// and answers the server's DATA challenge.
    External { uid: Option<u32> },
    Anonymous,
}

impl AuthMechanism {
    pub fn from_config(config: &AuthConfig) -> Self {
        match config.mechanism {
            AuthMechanismKind::Anonymous => AuthMechanism::Anonymous,
            AuthMechanismKind::External if config.empty_initial_response => {
                AuthMechanism::External { uid: None }
            }
            AuthMechanismKind::External => AuthMechanism::External {
                uid: Some(config.uid.unwrap_or_else(current_uid)),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            AuthMechanism::External { .. } => "EXTERNAL",
            AuthMechanism::Anonymous => "ANONYMOUS",
        }
    }
}

/// Uid of the running process.
pub fn current_uid() -> u32 {
    nix::unistd::getuid().as_raw()
}

/// What the client does after handling a server line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthStep {
    /// Send this line and wait for the next server line
    Send(String),
    /// Send this final line; binary framing starts right after it
    Finished {
        line: String,
        guid: String,
        unix_fd: bool,
    },
}

/// Result of a completed exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub guid: String,
    pub unix_fd: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    WaitingForOk,
    WaitingForAgree,
    Done,
}

#[derive(Debug)]
pub struct Authenticator {
    mechanism: AuthMechanism,
    negotiate_unix_fd: bool,
    state: State,
    guid: Option<String>,
}

impl Authenticator {
    pub fn new(mechanism: AuthMechanism, negotiate_unix_fd: bool) -> Result<Self> {
        if mechanism == AuthMechanism::Anonymous && negotiate_unix_fd {
            return Err(DbusError::Auth(
                "anonymous authentication cannot negotiate unix fd passing".into(),
            ));
        }
        Ok(Self {
            mechanism,
            negotiate_unix_fd,
            state: State::WaitingForOk,
            guid: None,
        })
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self> {
        Self::new(AuthMechanism::from_config(config), config.negotiate_unix_fd)
    }

    /// The AUTH line, without the leading NUL byte.
    pub fn initial_request(&self) -> String {
        match self.mechanism {
            AuthMechanism::External { uid: Some(uid) } => {
                format!("AUTH EXTERNAL {}\r\n", hex::encode(uid.to_string()))
            }
            AuthMechanism::External { uid: None } => "AUTH EXTERNAL\r\n".to_owned(),
            AuthMechanism::Anonymous => "AUTH ANONYMOUS\r\n".to_owned(),
        }
    }

    /// Server GUID once OK has been received.
    pub fn guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    pub fn handle_line(&mut self, line: &str) -> Result<AuthStep> {
        let line = line.trim_end_matches(['\r', '\n']);
        let (command, argument) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match (self.state, command) {
            (State::WaitingForOk, "OK") => {
                if argument.is_empty() {
                    return Err(DbusError::Auth("OK without a server GUID".into()));
                }
                self.guid = Some(argument.to_owned());
                if self.negotiate_unix_fd {
                    self.state = State::WaitingForAgree;
                    Ok(AuthStep::Send("NEGOTIATE_UNIX_FD\r\n".to_owned()))
                } else {
                    self.finish(false)
                }
            }
            (State::WaitingForOk, "DATA")
                if (self.mechanism == AuthMechanism::External { uid: None }) =>
            {
                Ok(AuthStep::Send("DATA\r\n".to_owned()))
            }
            (State::WaitingForOk, "REJECTED") => Err(DbusError::Auth(format!(
                "server rejected {}; supported mechanisms: {}",
                self.mechanism.name(),
                if argument.is_empty() { "none" } else { argument }
            ))),
            (State::WaitingForAgree, "AGREE_UNIX_FD") => self.finish(true),
            (State::WaitingForAgree, "ERROR") => Err(DbusError::Auth(format!(
                "server refused unix fd passing: {argument}"
            ))),
            (State::Done, _) => Err(DbusError::Auth(
                "authentication already finished".into(),
            )),
            (_, "ERROR") => Err(DbusError::Auth(format!("server error: {argument}"))),
            _ => Err(DbusError::Auth(format!("unexpected server response '{line}'"))),
        }
    }

    fn finish(&mut self, unix_fd: bool) -> Result<AuthStep> {
        self.state = State::Done;
        let guid = self
            .guid
            .clone()
            .ok_or_else(|| DbusError::Auth("finished without a server GUID".into()))?;
        Ok(AuthStep::Finished {
            line: "BEGIN\r\n".to_owned(),
            guid,
            unix_fd,
        })
    }
}

/// Read one CRLF line from `buf`, receiving more bytes as needed.
async fn read_line(stream: &BusStream, buf: &mut BytesMut) -> Result<String> {
    let mut fds = Vec::new();
    loop {
        if let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf.split_to(end + 2);
            return String::from_utf8(line[..end].to_vec())
                .map_err(|_| DbusError::Auth("server line is not UTF-8".into()));
        }
        if buf.len() > MAX_LINE_LEN {
            return Err(DbusError::Auth(format!(
                "server line exceeds {MAX_LINE_LEN} bytes"
            )));
        }
        if stream.read_with_fds(buf, &mut fds).await? == 0 {
            return Err(DbusError::Auth(
                "connection closed during authentication".into(),
            ));
        }
        // fds are never expected before BEGIN
        fds.clear();
    }
}

/// Run the exchange on `stream`.
///
/// Bytes received after the final server line stay in `buf` for the
/// binary phase.
#[instrument(skip_all, fields(mechanism = auth.mechanism.name()))]
pub async fn authenticate(
    stream: &BusStream,
    mut auth: Authenticator,
    buf: &mut BytesMut,
    timeout: Duration,
) -> Result<AuthOutcome> {
    with_timeout_error(
        async move {
            let mut first = Vec::with_capacity(64);
            first.push(0u8);
            first.extend_from_slice(auth.initial_request().as_bytes());
            stream.write_all(&first).await?;

            loop {
                let line = read_line(stream, buf).await?;
                trace!(line = %line, "Auth line received");
                match auth.handle_line(&line)? {
                    AuthStep::Send(reply) => stream.write_all(reply.as_bytes()).await?,
                    AuthStep::Finished { line, guid, unix_fd } => {
                        stream.write_all(line.as_bytes()).await?;
                        debug!(guid = %guid, unix_fd, "Authenticated");
                        return Ok(AuthOutcome { guid, unix_fd });
                    }
                }
            }
        },
        timeout,
    )
    .await
}
