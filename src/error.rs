//! Error taxonomy: codec, filter, protocol status and transport/session errors.

use crate::ber::BerError;
use crate::filter::FilterError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// LDAP result codes (RFC 4511 Appendix A).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success,
    OperationsError,
    ProtocolError,
    TimeLimitExceeded,
    SizeLimitExceeded,
    CompareFalse,
    CompareTrue,
    AuthMethodNotSupported,
    StrongerAuthRequired,
    Referral,
    AdminLimitExceeded,
    UnavailableCriticalExtension,
    ConfidentialityRequired,
    SaslBindInProgress,
    NoSuchAttribute,
    UndefinedAttributeType,
    InappropriateMatching,
    ConstraintViolation,
    AttributeOrValueExists,
    InvalidAttributeSyntax,
    NoSuchObject,
    AliasProblem,
    InvalidDnSyntax,
    AliasDereferencingProblem,
    InappropriateAuthentication,
    InvalidCredentials,
    InsufficientAccessRights,
    Busy,
    Unavailable,
    UnwillingToPerform,
    LoopDetect,
    NamingViolation,
    ObjectClassViolation,
    NotAllowedOnNonLeaf,
    NotAllowedOnRdn,
    EntryAlreadyExists,
    ObjectClassModsProhibited,
    AffectsMultipleDsas,
    Other,
    /// Cancel operation results (RFC 3909)
    Canceled,
    NoSuchOperation,
    TooLate,
    CannotCancel,
    /// Assertion control failed (RFC 4528)
    AssertionFailed,
    /// Proxied authorization denied (RFC 4370)
    AuthorizationDenied,
    Unknown(i32),
}

const RESULT_CODES: &[(i32, ResultCode, &str)] = &[
    (0, ResultCode::Success, "success"),
    (1, ResultCode::OperationsError, "operationsError"),
    (2, ResultCode::ProtocolError, "protocolError"),
    (3, ResultCode::TimeLimitExceeded, "timeLimitExceeded"),
    (4, ResultCode::SizeLimitExceeded, "sizeLimitExceeded"),
    (5, ResultCode::CompareFalse, "compareFalse"),
    (6, ResultCode::CompareTrue, "compareTrue"),
    (7, ResultCode::AuthMethodNotSupported, "authMethodNotSupported"),
    (8, ResultCode::StrongerAuthRequired, "strongerAuthRequired"),
    (10, ResultCode::Referral, "referral"),
    (11, ResultCode::AdminLimitExceeded, "adminLimitExceeded"),
    (12, ResultCode::UnavailableCriticalExtension, "unavailableCriticalExtension"),
    (13, ResultCode::ConfidentialityRequired, "confidentialityRequired"),
    (14, ResultCode::SaslBindInProgress, "saslBindInProgress"),
    (16, ResultCode::NoSuchAttribute, "noSuchAttribute"),
    (17, ResultCode::UndefinedAttributeType, "undefinedAttributeType"),
    (18, ResultCode::InappropriateMatching, "inappropriateMatching"),
    (19, ResultCode::ConstraintViolation, "constraintViolation"),
    (20, ResultCode::AttributeOrValueExists, "attributeOrValueExists"),
    (21, ResultCode::InvalidAttributeSyntax, "invalidAttributeSyntax"),
    (32, ResultCode::NoSuchObject, "noSuchObject"),
    (33, ResultCode::AliasProblem, "aliasProblem"),
    (34, ResultCode::InvalidDnSyntax, "invalidDNSyntax"),
    (36, ResultCode::AliasDereferencingProblem, "aliasDereferencingProblem"),
    (48, ResultCode::InappropriateAuthentication, "inappropriateAuthentication"),
    (49, ResultCode::InvalidCredentials, "invalidCredentials"),
    (50, ResultCode::InsufficientAccessRights, "insufficientAccessRights"),
    (51, ResultCode::Busy, "busy"),
    (52, ResultCode::Unavailable, "unavailable"),
    (53, ResultCode::UnwillingToPerform, "unwillingToPerform"),
    (54, ResultCode::LoopDetect, "loopDetect"),
    (64, ResultCode::NamingViolation, "namingViolation"),
    (65, ResultCode::ObjectClassViolation, "objectClassViolation"),
    (66, ResultCode::NotAllowedOnNonLeaf, "notAllowedOnNonLeaf"),
    (67, ResultCode::NotAllowedOnRdn, "notAllowedOnRDN"),
    (68, ResultCode::EntryAlreadyExists, "entryAlreadyExists"),
    (69, ResultCode::ObjectClassModsProhibited, "objectClassModsProhibited"),
    (71, ResultCode::AffectsMultipleDsas, "affectsMultipleDSAs"),
    (80, ResultCode::Other, "other"),
    (118, ResultCode::Canceled, "canceled"),
    (119, ResultCode::NoSuchOperation, "noSuchOperation"),
    (120, ResultCode::TooLate, "tooLate"),
    (121, ResultCode::CannotCancel, "cannotCancel"),
    (122, ResultCode::AssertionFailed, "assertionFailed"),
    (123, ResultCode::AuthorizationDenied, "authorizationDenied"),
];

impl ResultCode {
    pub fn from_code(code: i32) -> Self {
        RESULT_CODES
            .iter()
            .find(|(c, _, _)| *c == code)
            .map(|(_, kind, _)| *kind)
            .unwrap_or(ResultCode::Unknown(code))
    }

    pub fn code(&self) -> i32 {
        match self {
            ResultCode::Unknown(code) => *code,
            kind => RESULT_CODES
                .iter()
                .find(|(_, k, _)| k == kind)
                .map(|(c, _, _)| *c)
                .unwrap_or(-1),
        }
    }

    pub fn name(&self) -> &'static str {
        RESULT_CODES
            .iter()
            .find(|(_, k, _)| k == self)
            .map(|(_, _, name)| *name)
            .unwrap_or("unknownStatus")
    }

    pub fn is_success(&self) -> bool {
        *self == ResultCode::Success
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

#[derive(Debug, Error)]
pub enum LdapError {
    /// Envelope could not be decoded. Fatal to that envelope only.
    #[error("decode error (message id {message_id:?}, tag {tag:?}): {source}")]
    Decode {
        message_id: Option<i32>,
        tag: Option<u8>,
        #[source]
        source: BerError,
    },

    #[error("encode error: {0}")]
    Encode(#[from] BerError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    /// Non-zero result code in a response.
    #[error("{code}: {message} (matched dn {matched_dn:?})")]
    Status {
        code: ResultCode,
        matched_dn: String,
        message: String,
    },

    #[error("operation {message_id} timed out after {after:?}")]
    Timeout { message_id: i32, after: Duration },

    #[error("operation {message_id} abandoned")]
    Abandoned { message_id: i32 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connect to {addr} timed out after {after:?}")]
    ConnectTimeout { addr: String, after: Duration },

    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("invalid LDAP URL: {0}")]
    InvalidUrl(String),

    #[error("invalid connection state: {0}")]
    InvalidState(&'static str),

    #[error("unexpected response 0x{got:02X} for {operation}")]
    UnexpectedResponse { operation: &'static str, got: u8 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LdapError {
    pub fn status(code: i32, matched_dn: &str, message: &str) -> Self {
        LdapError::Status {
            code: ResultCode::from_code(code),
            matched_dn: matched_dn.to_string(),
            message: message.to_string(),
        }
    }

    /// Result code for status errors.
    pub fn result_code(&self) -> Option<ResultCode> {
        match self {
            LdapError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Transport-level failures leave the connection unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            LdapError::ConnectionClosed
                | LdapError::ConnectTimeout { .. }
                | LdapError::Connect { .. }
                | LdapError::Io(_)
                | LdapError::Tls(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, LdapError>;
