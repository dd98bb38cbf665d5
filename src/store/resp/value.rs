use bytes::Bytes;

use crate::Error;
use crate::ProtocolError;
use crate::Result;

/// One decoded RESP2 reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Nil,
    Array(Vec<RespValue>),
}

/// Cluster redirection carried by an error reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Redirect {
    Moved { slot: u16, endpoint: String },
    Ask { slot: u16, endpoint: String },
}

impl RespValue {
    /// Turns an error reply into `ProtocolError::Server`
    pub fn into_result(self) -> Result<RespValue> {
        match self {
            RespValue::Error(message) => Err(ProtocolError::Server(message).into()),
            other => Ok(other),
        }
    }

    pub fn expect_ok(
        self,
        command: &'static str,
    ) -> Result<()> {
        match self.into_result()? {
            RespValue::Simple(s) if s == "OK" => Ok(()),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_integer(
        self,
        command: &'static str,
    ) -> Result<i64> {
        match self.into_result()? {
            RespValue::Integer(n) => Ok(n),
            other => Err(other.unexpected(command)),
        }
    }

    /// Bulk or simple string; nil becomes `None`
    pub fn into_optional_bytes(
        self,
        command: &'static str,
    ) -> Result<Option<Bytes>> {
        match self.into_result()? {
            RespValue::Bulk(b) => Ok(Some(b)),
            RespValue::Simple(s) => Ok(Some(Bytes::from(s))),
            RespValue::Nil => Ok(None),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_bytes(
        self,
        command: &'static str,
    ) -> Result<Bytes> {
        match self.into_optional_bytes(command)? {
            Some(b) => Ok(b),
            None => Err(RespValue::Nil.unexpected(command)),
        }
    }

    /// Array reply; nil becomes an empty array
    pub fn into_array(
        self,
        command: &'static str,
    ) -> Result<Vec<RespValue>> {
        match self.into_result()? {
            RespValue::Array(items) => Ok(items),
            RespValue::Nil => Ok(Vec::new()),
            other => Err(other.unexpected(command)),
        }
    }

    pub fn into_string(
        self,
        command: &'static str,
    ) -> Result<String> {
        let bytes = self.into_bytes(command)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub(crate) fn unexpected(
        &self,
        command: &'static str,
    ) -> Error {
        ProtocolError::UnexpectedReply {
            command,
            reply: format!("{self:?}"),
        }
        .into()
    }

    /// Parses `MOVED <slot> <endpoint>` or `ASK <slot> <endpoint>`
    pub(crate) fn redirect(&self) -> Option<Redirect> {
        match self {
            RespValue::Error(message) => parse_redirect(message),
            _ => None,
        }
    }
}

pub(crate) fn parse_redirect(message: &str) -> Option<Redirect> {
    let mut parts = message.split_whitespace();
    let kind = parts.next()?;
    let slot = parts.next()?.parse::<u16>().ok()?;
    let endpoint = parts.next()?.to_string();
    match kind {
        "MOVED" => Some(Redirect::Moved { slot, endpoint }),
        "ASK" => Some(Redirect::Ask { slot, endpoint }),
        _ => None,
    }
}

/// Extracts the redirect from a server error surfaced through `Error`
pub(crate) fn error_redirect(error: &Error) -> Option<Redirect> {
    match error {
        Error::Protocol(ProtocolError::Server(message)) => parse_redirect(message),
        _ => None,
    }
}
