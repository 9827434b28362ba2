//! Request and response envelopes exchanged with the HTTP layer

use fdo_core::{codec, ErrorMessage, FdoError, FdoResult, MessageType};

use crate::store::SessionId;

/// Content type of every TO2 body
pub const CONTENT_TYPE_CBOR: &str = "application/cbor";

const BEARER_PREFIX: &str = "Bearer ";

/// One inbound TO2 message as handed over by the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct To2Request {
    /// Message type from the request path
    pub message_type: u8,
    /// `Authorization` header, if any
    pub authorization: Option<String>,
    /// `Content-Type` header, if any
    pub content_type: Option<String>,
    /// Raw body
    pub body: Vec<u8>,
}

impl To2Request {
    /// CBOR request without authorization
    pub fn new(message_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            message_type: message_type.id(),
            authorization: None,
            content_type: Some(CONTENT_TYPE_CBOR.to_string()),
            body,
        }
    }

    /// Attach a bearer token
    pub fn with_bearer(mut self, token: impl AsRef<str>) -> Self {
        self.authorization = Some(format!("{BEARER_PREFIX}{}", token.as_ref()));
        self
    }

    /// Session named by the `Authorization` header
    pub fn session_id(&self) -> FdoResult<SessionId> {
        let header = self
            .authorization
            .as_deref()
            .ok_or_else(|| FdoError::unauthorized("missing bearer token"))?;
        let token = header
            .strip_prefix(BEARER_PREFIX)
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| FdoError::unauthorized("authorization is not a bearer token"))?;
        token.parse()
    }

    /// Reject bodies declared as anything other than CBOR
    pub fn check_content_type(&self) -> FdoResult<()> {
        match self.content_type.as_deref() {
            None => Ok(()),
            Some(value) if value.eq_ignore_ascii_case(CONTENT_TYPE_CBOR) => Ok(()),
            Some(other) => Err(FdoError::malformed(format!(
                "unsupported content type {other:?}"
            ))),
        }
    }
}

/// Outbound TO2 message for the HTTP layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct To2Response {
    /// HTTP status
    pub status: u16,
    /// Message type of the body
    pub message_type: u8,
    /// `Authorization` header to return, set on every successful reply
    pub authorization: Option<String>,
    /// `Content-Type` header
    pub content_type: String,
    /// Encoded body
    pub body: Vec<u8>,
}

impl To2Response {
    /// 200 response carrying `body`
    pub fn ok(message_type: MessageType, body: Vec<u8>) -> Self {
        Self {
            status: 200,
            message_type: message_type.id(),
            authorization: None,
            content_type: CONTENT_TYPE_CBOR.to_string(),
            body,
        }
    }

    /// Attach the session's bearer token
    pub fn with_bearer(mut self, id: &SessionId) -> Self {
        self.authorization = Some(format!("{BEARER_PREFIX}{id}"));
        self
    }

    /// Error message (type 255) describing `error`
    pub fn error(error: &FdoError, prev_msg_id: u8, correlation_id: u64) -> Self {
        let message = ErrorMessage::from_error(error, prev_msg_id, correlation_id);
        // ErrorMessage holds only plain fields; encoding cannot fail in practice
        let body = codec::to_vec(&message).unwrap_or_default();
        Self {
            status: error.http_status(),
            message_type: MessageType::Error.id(),
            authorization: None,
            content_type: CONTENT_TYPE_CBOR.to_string(),
            body,
        }
    }

    /// Whether this is an error message
    pub fn is_error(&self) -> bool {
        self.message_type == MessageType::Error.id()
    }

    /// Decode the error message body
    pub fn error_message(&self) -> FdoResult<ErrorMessage> {
        if !self.is_error() {
            return Err(FdoError::malformed(format!(
                "message {} is not an error message",
                self.message_type
            )));
        }
        codec::from_slice(&self.body)
    }

    /// Bearer token from the `Authorization` header
    pub fn bearer_token(&self) -> Option<&str> {
        self.authorization
            .as_deref()
            .and_then(|header| header.strip_prefix(BEARER_PREFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdo_core::ErrorCode;

    #[test]
    fn test_bearer_round_trip() {
        let id = SessionId::new();
        let request = To2Request::new(MessageType::GetOvNextEntry, vec![]).with_bearer(id.to_string());
        assert_eq!(request.session_id().unwrap(), id);
    }

    #[test]
    fn test_missing_or_malformed_bearer() {
        let request = To2Request::new(MessageType::GetOvNextEntry, vec![]);
        assert!(matches!(request.session_id(), Err(FdoError::Unauthorized { .. })));

        let mut request = request;
        request.authorization = Some("Basic abc".into());
        assert!(matches!(request.session_id(), Err(FdoError::Unauthorized { .. })));

        request.authorization = Some("Bearer ".into());
        assert!(matches!(request.session_id(), Err(FdoError::Unauthorized { .. })));
    }

    #[test]
    fn test_content_type_check() {
        let mut request = To2Request::new(MessageType::HelloDevice, vec![]);
        assert!(request.check_content_type().is_ok());
        request.content_type = Some("application/json".into());
        assert!(matches!(
            request.check_content_type(),
            Err(FdoError::MalformedInput { .. })
        ));
    }

    #[test]
    fn test_error_response() {
        let err = FdoError::unauthorized("no session");
        let response = To2Response::error(&err, 62, 9);
        assert_eq!(response.status, 401);
        assert!(response.is_error());
        let message = response.error_message().unwrap();
        assert_eq!(message.code, ErrorCode::InvalidJwtToken);
        assert_eq!(message.prev_msg_id, 62);
        assert_eq!(message.correlation_id, 9);
    }
}
