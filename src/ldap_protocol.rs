// LDAP v3 message envelopes (RFC 4511 section 4)
// Every operation body can be encoded and parsed, so the same code serves the
// client and the in-memory test servers.

use crate::ber::{
    BerError, BerReader, BerResult, BerWriter, Required, TAG_OCTET_STRING, TAG_SEQUENCE, TAG_SET,
};
use crate::controls::{read_controls, write_controls, Control};
use crate::error::{LdapError, ResultCode};
use crate::filter::Filter;

pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REFERENCE: u8 = 0x73;
pub const LDAP_TAG_MODIFY_REQUEST: u8 = 0x66;
pub const LDAP_TAG_MODIFY_RESPONSE: u8 = 0x67;
pub const LDAP_TAG_ADD_REQUEST: u8 = 0x68;
pub const LDAP_TAG_ADD_RESPONSE: u8 = 0x69;
pub const LDAP_TAG_DEL_REQUEST: u8 = 0x4A;
pub const LDAP_TAG_DEL_RESPONSE: u8 = 0x6B;
pub const LDAP_TAG_MODIFY_DN_REQUEST: u8 = 0x6C;
pub const LDAP_TAG_MODIFY_DN_RESPONSE: u8 = 0x6D;
pub const LDAP_TAG_COMPARE_REQUEST: u8 = 0x6E;
pub const LDAP_TAG_COMPARE_RESPONSE: u8 = 0x6F;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;
pub const LDAP_TAG_EXTENDED_RESPONSE: u8 = 0x78;
/// IntermediateResponse ::= [APPLICATION 25] SEQUENCE
pub const LDAP_TAG_INTERMEDIATE_RESPONSE: u8 = 0x79;

/// Context [0] IMPLICIT SEQUENCE OF control
pub const LDAP_CONTEXT_CONTROLS: u8 = 0xA0;

const REFERRAL_TAG: u8 = 0xA3;
const AUTH_SIMPLE: u8 = 0x80;
const AUTH_SASL: u8 = 0xA3;
const SERVER_SASL_CREDS: u8 = 0x87;
const NEW_SUPERIOR: u8 = 0x80;
const EXTENDED_REQUEST_NAME: u8 = 0x80;
const EXTENDED_REQUEST_VALUE: u8 = 0x81;
const EXTENDED_RESPONSE_NAME: u8 = 0x8A;
const EXTENDED_RESPONSE_VALUE: u8 = 0x8B;
const INTERMEDIATE_NAME: u8 = 0x80;
const INTERMEDIATE_VALUE: u8 = 0x81;

/// Unsolicited notification sent with message id 0 before the server drops
/// the connection (RFC 4511 section 4.4.1).
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    pub controls: Vec<Control>,
}

impl LdapMessage {
    pub fn new(message_id: i32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: Vec::new(),
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = controls;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDNRequest(ModifyDNRequest),
    ModifyDNResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(i32),
    ExtendedRequest(ExtendedRequest),
    ExtendedResponse(ExtendedResponse),
    IntermediateResponse(IntermediateResponse),
}

impl ProtocolOp {
    pub fn tag(&self) -> u8 {
        match self {
            ProtocolOp::BindRequest(_) => LDAP_TAG_BIND_REQUEST,
            ProtocolOp::BindResponse(_) => LDAP_TAG_BIND_RESPONSE,
            ProtocolOp::UnbindRequest => LDAP_TAG_UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => LDAP_TAG_SEARCH_REQUEST,
            ProtocolOp::SearchResultEntry(_) => LDAP_TAG_SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResultReference(_) => LDAP_TAG_SEARCH_RESULT_REFERENCE,
            ProtocolOp::SearchResultDone(_) => LDAP_TAG_SEARCH_RESULT_DONE,
            ProtocolOp::ModifyRequest(_) => LDAP_TAG_MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => LDAP_TAG_MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => LDAP_TAG_ADD_REQUEST,
            ProtocolOp::AddResponse(_) => LDAP_TAG_ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => LDAP_TAG_DEL_REQUEST,
            ProtocolOp::DelResponse(_) => LDAP_TAG_DEL_RESPONSE,
            ProtocolOp::ModifyDNRequest(_) => LDAP_TAG_MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDNResponse(_) => LDAP_TAG_MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => LDAP_TAG_COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => LDAP_TAG_COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => LDAP_TAG_ABANDON_REQUEST,
            ProtocolOp::ExtendedRequest(_) => LDAP_TAG_EXTENDED_REQUEST,
            ProtocolOp::ExtendedResponse(_) => LDAP_TAG_EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResponse(_) => LDAP_TAG_INTERMEDIATE_RESPONSE,
        }
    }

    /// Short operation name used in logs and metrics.
    pub fn name(&self) -> &'static str {
        op_name(self.tag())
    }

    /// Whether this response ends its request (search entries, references and
    /// intermediate responses do not).
    pub fn is_terminal(&self) -> bool {
        is_final_response_tag(self.tag())
    }

    /// Result part of a response, if this is one.
    pub fn result(&self) -> Option<&LdapResult> {
        match self {
            ProtocolOp::BindResponse(r) => Some(&r.result),
            ProtocolOp::ExtendedResponse(r) => Some(&r.result),
            ProtocolOp::SearchResultDone(r)
            | ProtocolOp::ModifyResponse(r)
            | ProtocolOp::AddResponse(r)
            | ProtocolOp::DelResponse(r)
            | ProtocolOp::ModifyDNResponse(r)
            | ProtocolOp::CompareResponse(r) => Some(r),
            _ => None,
        }
    }
}

pub fn op_name(tag: u8) -> &'static str {
    match tag {
        LDAP_TAG_BIND_REQUEST | LDAP_TAG_BIND_RESPONSE => "bind",
        LDAP_TAG_UNBIND_REQUEST => "unbind",
        LDAP_TAG_SEARCH_REQUEST
        | LDAP_TAG_SEARCH_RESULT_ENTRY
        | LDAP_TAG_SEARCH_RESULT_REFERENCE
        | LDAP_TAG_SEARCH_RESULT_DONE => "search",
        LDAP_TAG_MODIFY_REQUEST | LDAP_TAG_MODIFY_RESPONSE => "modify",
        LDAP_TAG_ADD_REQUEST | LDAP_TAG_ADD_RESPONSE => "add",
        LDAP_TAG_DEL_REQUEST | LDAP_TAG_DEL_RESPONSE => "delete",
        LDAP_TAG_MODIFY_DN_REQUEST | LDAP_TAG_MODIFY_DN_RESPONSE => "modify_dn",
        LDAP_TAG_COMPARE_REQUEST | LDAP_TAG_COMPARE_RESPONSE => "compare",
        LDAP_TAG_ABANDON_REQUEST => "abandon",
        LDAP_TAG_EXTENDED_REQUEST | LDAP_TAG_EXTENDED_RESPONSE => "extended",
        LDAP_TAG_INTERMEDIATE_RESPONSE => "intermediate",
        _ => "unknown",
    }
}

/// Response tags that complete a request.
pub fn is_final_response_tag(tag: u8) -> bool {
    matches!(
        tag,
        LDAP_TAG_BIND_RESPONSE
            | LDAP_TAG_SEARCH_RESULT_DONE
            | LDAP_TAG_MODIFY_RESPONSE
            | LDAP_TAG_ADD_RESPONSE
            | LDAP_TAG_DEL_RESPONSE
            | LDAP_TAG_MODIFY_DN_RESPONSE
            | LDAP_TAG_COMPARE_RESPONSE
            | LDAP_TAG_EXTENDED_RESPONSE
    )
}

/// LDAPResult components shared by every response.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Vec<String>,
}

impl LdapResult {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn with_code(result_code: i32, diagnostic_message: &str) -> Self {
        Self {
            result_code,
            diagnostic_message: diagnostic_message.to_string(),
            ..Self::default()
        }
    }

    pub fn code(&self) -> ResultCode {
        ResultCode::from_code(self.result_code)
    }

    /// Ok for success, a typed status error otherwise.
    pub fn into_result(self) -> Result<LdapResult, LdapError> {
        if self.result_code == 0 {
            Ok(self)
        } else {
            Err(self.to_error())
        }
    }

    pub fn to_error(&self) -> LdapError {
        LdapError::status(self.result_code, &self.matched_dn, &self.diagnostic_message)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl {
        mechanism: String,
        credentials: Option<Vec<u8>>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    pub fn new(base_object: &str, scope: SearchScope, filter: Filter) -> Self {
        Self {
            base_object: base_object.to_string(),
            scope,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter,
            attributes: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<i32> for SearchScope {
    type Error = BerError;
    fn try_from(value: i32) -> Result<Self, BerError> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(BerError::Invalid(format!("invalid search scope: {}", value))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl TryFrom<i32> for DerefAliases {
    type Error = BerError;
    fn try_from(value: i32) -> Result<Self, BerError> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObj),
            3 => Ok(DerefAliases::Always),
            _ => Err(BerError::Invalid(format!("invalid derefAliases: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

impl SearchResultEntry {
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.base_type().eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<ModifyChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyChange {
    pub operation: ModifyOperation,
    pub modification: Attribute,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    /// RFC 4525
    Increment = 3,
}

impl TryFrom<i32> for ModifyOperation {
    type Error = BerError;
    fn try_from(value: i32) -> Result<Self, BerError> {
        match value {
            0 => Ok(ModifyOperation::Add),
            1 => Ok(ModifyOperation::Delete),
            2 => Ok(ModifyOperation::Replace),
            3 => Ok(ModifyOperation::Increment),
            _ => Err(BerError::Invalid(format!("invalid modify operation: {}", value))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDNRequest {
    pub entry: String,
    pub newrdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub attr: String,
    pub assertion_value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Binary(Vec<u8>),
}

impl AttributeValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeValue::Text(s) => s.as_bytes(),
            AttributeValue::Binary(b) => b,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            AttributeValue::Binary(_) => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(b: Vec<u8>) -> Self {
        AttributeValue::Binary(b)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<AttributeValue>,
}

impl Attribute {
    pub fn new<V: Into<AttributeValue>>(attr_type: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            attr_type: attr_type.to_string(),
            attr_values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Type without options (`userCertificate;binary` -> `userCertificate`).
    pub fn base_type(&self) -> &str {
        self.attr_type.split(';').next().unwrap_or(&self.attr_type)
    }

    fn has_binary_option(attr_type: &str) -> bool {
        attr_type
            .split(';')
            .skip(1)
            .any(|opt| opt.eq_ignore_ascii_case("binary"))
    }

    /// Type as written on the wire: `;binary` is appended when any value is
    /// binary and the option is missing.
    pub fn wire_type(&self) -> String {
        let any_binary = self.attr_values.iter().any(|v| matches!(v, AttributeValue::Binary(_)));
        if any_binary && !Self::has_binary_option(&self.attr_type) {
            format!("{};binary", self.attr_type)
        } else {
            self.attr_type.clone()
        }
    }

    fn from_wire(attr_type: String, raw: Vec<Vec<u8>>) -> Self {
        let binary = Self::has_binary_option(&attr_type);
        let attr_values = raw
            .into_iter()
            .map(|bytes| {
                if binary {
                    return AttributeValue::Binary(bytes);
                }
                match String::from_utf8(bytes) {
                    Ok(s) => AttributeValue::Text(s),
                    Err(e) => AttributeValue::Binary(e.into_bytes()),
                }
            })
            .collect();
        Self {
            attr_type,
            attr_values,
        }
    }
}

/// Parse only the LDAP message header (SEQUENCE, messageID, protocolOp tag).
/// Used to attribute a decode failure to a pending request.
pub fn parse_ldap_message_header(data: &[u8]) -> BerResult<(i32, u8)> {
    let mut reader = BerReader::new(data);
    reader.read_container(Some(TAG_SEQUENCE))?;
    let message_id = reader.read_integer().required("message id")?;
    let tag = reader.peek().ok_or(BerError::Truncated("protocol op"))?;
    Ok((message_id, tag))
}

/// Decode exactly one envelope occupying all of `data`.
pub fn parse_ldap_message(data: &[u8]) -> BerResult<LdapMessage> {
    let mut reader = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let (_, end) = reader.read_container(Some(TAG_SEQUENCE))?;
    if end != data.len() {
        return Err(BerError::Invalid(format!(
            "envelope is {} bytes but buffer holds {}",
            end,
            data.len()
        )));
    }
    let message_id = reader.read_integer().required("message id")?;
    if message_id < 0 {
        return Err(BerError::Invalid(format!("negative message id {}", message_id)));
    }

    let tag = reader.peek().ok_or(BerError::Truncated("protocol op"))?;
    let r = &mut reader;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(r)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_bind_response(r)?),
        LDAP_TAG_UNBIND_REQUEST => {
            r.read_bytes(LDAP_TAG_UNBIND_REQUEST).required("unbind")?;
            ProtocolOp::UnbindRequest
        }
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(r)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(parse_search_result_entry(r)?),
        LDAP_TAG_SEARCH_RESULT_REFERENCE => {
            let (_, ref_end) = r.read_container(Some(LDAP_TAG_SEARCH_RESULT_REFERENCE))?;
            ProtocolOp::SearchResultReference(read_string_list(r, ref_end)?)
        }
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_result_body(r, tag)?),
        LDAP_TAG_MODIFY_REQUEST => ProtocolOp::ModifyRequest(parse_modify_request(r)?),
        LDAP_TAG_MODIFY_RESPONSE => ProtocolOp::ModifyResponse(parse_result_body(r, tag)?),
        LDAP_TAG_ADD_REQUEST => ProtocolOp::AddRequest(parse_add_request(r)?),
        LDAP_TAG_ADD_RESPONSE => ProtocolOp::AddResponse(parse_result_body(r, tag)?),
        LDAP_TAG_DEL_REQUEST => ProtocolOp::DelRequest(DelRequest {
            entry: r.read_string(LDAP_TAG_DEL_REQUEST).required("delete dn")?,
        }),
        LDAP_TAG_DEL_RESPONSE => ProtocolOp::DelResponse(parse_result_body(r, tag)?),
        LDAP_TAG_MODIFY_DN_REQUEST => ProtocolOp::ModifyDNRequest(parse_modify_dn_request(r)?),
        LDAP_TAG_MODIFY_DN_RESPONSE => ProtocolOp::ModifyDNResponse(parse_result_body(r, tag)?),
        LDAP_TAG_COMPARE_REQUEST => ProtocolOp::CompareRequest(parse_compare_request(r)?),
        LDAP_TAG_COMPARE_RESPONSE => ProtocolOp::CompareResponse(parse_result_body(r, tag)?),
        LDAP_TAG_ABANDON_REQUEST => ProtocolOp::AbandonRequest(parse_abandon_request(r)?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(r)?),
        LDAP_TAG_EXTENDED_RESPONSE => ProtocolOp::ExtendedResponse(parse_extended_response(r)?),
        LDAP_TAG_INTERMEDIATE_RESPONSE => {
            ProtocolOp::IntermediateResponse(parse_intermediate_response(r)?)
        }
        _ => {
            return Err(BerError::Invalid(format!(
                "unsupported LDAP operation tag: 0x{:02X}",
                tag
            )))
        }
    };

    let controls = if reader.offset() < end && reader.peek() == Some(LDAP_CONTEXT_CONTROLS) {
        read_controls(&mut reader, LDAP_CONTEXT_CONTROLS)?
    } else {
        Vec::new()
    };
    if reader.offset() != end {
        return Err(BerError::Invalid(format!(
            "{} trailing bytes in message {}",
            end - reader.offset(),
            message_id
        )));
    }

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn expect_end(r: &BerReader<'_>, end: usize, what: &'static str) -> BerResult<()> {
    if r.offset() != end {
        return Err(BerError::Invalid(format!(
            "{}: content ends at {} but container ends at {}",
            what,
            r.offset(),
            end
        )));
    }
    Ok(())
}

fn read_string_list(r: &mut BerReader<'_>, end: usize) -> BerResult<Vec<String>> {
    let mut out = Vec::new();
    while r.offset() < end {
        out.push(r.read_string(TAG_OCTET_STRING).required("string list item")?);
    }
    Ok(out)
}

/// resultCode, matchedDN, diagnosticMessage, referral [3] OPTIONAL
fn parse_ldap_result(r: &mut BerReader<'_>, end: usize) -> BerResult<LdapResult> {
    let result_code = r.read_enumeration().required("result code")?;
    let matched_dn = r.read_string(TAG_OCTET_STRING).required("matched dn")?;
    let diagnostic_message = r.read_string(TAG_OCTET_STRING).required("diagnostic message")?;
    let referrals = if r.offset() < end && r.peek() == Some(REFERRAL_TAG) {
        let (_, ref_end) = r.read_container(Some(REFERRAL_TAG))?;
        read_string_list(r, ref_end)?
    } else {
        Vec::new()
    };
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        referrals,
    })
}

fn parse_result_body(r: &mut BerReader<'_>, tag: u8) -> BerResult<LdapResult> {
    let (_, end) = r.read_container(Some(tag))?;
    let result = parse_ldap_result(r, end)?;
    expect_end(r, end, "result")?;
    Ok(result)
}

fn parse_bind_request(r: &mut BerReader<'_>) -> BerResult<BindRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_BIND_REQUEST))?;
    let version = r.read_integer().required("bind version")?;
    let name = r.read_string(TAG_OCTET_STRING).required("bind dn")?;
    let authentication = match r.peek() {
        Some(AUTH_SASL) => {
            let (_, sasl_end) = r.read_container(Some(AUTH_SASL))?;
            let mechanism = r.read_string(TAG_OCTET_STRING).required("sasl mechanism")?;
            let credentials = if r.offset() < sasl_end {
                Some(r.read_bytes(TAG_OCTET_STRING).required("sasl credentials")?)
            } else {
                None
            };
            BindAuthentication::Sasl {
                mechanism,
                credentials,
            }
        }
        _ => BindAuthentication::Simple(r.read_string(AUTH_SIMPLE).required("simple password")?),
    };
    expect_end(r, end, "bind request")?;
    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_bind_response(r: &mut BerReader<'_>) -> BerResult<BindResponse> {
    let (_, end) = r.read_container(Some(LDAP_TAG_BIND_RESPONSE))?;
    let result = parse_ldap_result(r, end)?;
    let server_sasl_creds = if r.offset() < end {
        Some(r.read_bytes(SERVER_SASL_CREDS).required("server sasl creds")?)
    } else {
        None
    };
    expect_end(r, end, "bind response")?;
    Ok(BindResponse {
        result,
        server_sasl_creds,
    })
}

fn parse_search_request(r: &mut BerReader<'_>) -> BerResult<SearchRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_SEARCH_REQUEST))?;
    let base_object = r.read_string(TAG_OCTET_STRING).required("base object")?;
    let scope = SearchScope::try_from(r.read_enumeration().required("scope")?)?;
    let deref_aliases = DerefAliases::try_from(r.read_enumeration().required("derefAliases")?)?;
    let size_limit = r.read_integer().required("size limit")?;
    let time_limit = r.read_integer().required("time limit")?;
    let types_only = r.read_boolean().required("typesOnly")?;
    let filter = Filter::read_ber(r)?;
    let (_, attrs_end) = r.read_container(Some(TAG_SEQUENCE))?;
    let attributes = read_string_list(r, attrs_end)?;
    expect_end(r, end, "search request")?;
    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

fn parse_attribute(r: &mut BerReader<'_>) -> BerResult<Attribute> {
    let (_, end) = r.read_container(Some(TAG_SEQUENCE))?;
    let attr_type = r.read_string(TAG_OCTET_STRING).required("attribute type")?;
    // SET OF values; some servers send SEQUENCE
    let (_, vals_end) = r.read_container(None)?;
    let mut raw = Vec::new();
    while r.offset() < vals_end {
        raw.push(r.read_bytes(TAG_OCTET_STRING).required("attribute value")?);
    }
    expect_end(r, end, "attribute")?;
    Ok(Attribute::from_wire(attr_type, raw))
}

fn parse_attribute_list(r: &mut BerReader<'_>) -> BerResult<Vec<Attribute>> {
    let (_, end) = r.read_container(Some(TAG_SEQUENCE))?;
    let mut attributes = Vec::new();
    while r.offset() < end {
        attributes.push(parse_attribute(r)?);
    }
    Ok(attributes)
}

fn parse_search_result_entry(r: &mut BerReader<'_>) -> BerResult<SearchResultEntry> {
    let (_, end) = r.read_container(Some(LDAP_TAG_SEARCH_RESULT_ENTRY))?;
    let object_name = r.read_string(TAG_OCTET_STRING).required("object name")?;
    let attributes = parse_attribute_list(r)?;
    expect_end(r, end, "search entry")?;
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_modify_request(r: &mut BerReader<'_>) -> BerResult<ModifyRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_MODIFY_REQUEST))?;
    let object = r.read_string(TAG_OCTET_STRING).required("modify dn")?;
    let (_, changes_end) = r.read_container(Some(TAG_SEQUENCE))?;
    let mut changes = Vec::new();
    while r.offset() < changes_end {
        let (_, change_end) = r.read_container(Some(TAG_SEQUENCE))?;
        let operation = ModifyOperation::try_from(r.read_enumeration().required("modify operation")?)?;
        let modification = parse_attribute(r)?;
        expect_end(r, change_end, "modify change")?;
        changes.push(ModifyChange {
            operation,
            modification,
        });
    }
    expect_end(r, end, "modify request")?;
    Ok(ModifyRequest { object, changes })
}

fn parse_add_request(r: &mut BerReader<'_>) -> BerResult<AddRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_ADD_REQUEST))?;
    let entry = r.read_string(TAG_OCTET_STRING).required("add dn")?;
    let attributes = parse_attribute_list(r)?;
    expect_end(r, end, "add request")?;
    Ok(AddRequest { entry, attributes })
}

/// ModifyDNRequest ::= [APPLICATION 12] SEQUENCE { entry, newrdn, deleteoldrdn, newSuperior [0] OPTIONAL }
fn parse_modify_dn_request(r: &mut BerReader<'_>) -> BerResult<ModifyDNRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_MODIFY_DN_REQUEST))?;
    let entry = r.read_string(TAG_OCTET_STRING).required("entry")?;
    let newrdn = r.read_string(TAG_OCTET_STRING).required("newrdn")?;
    let delete_old_rdn = r.read_boolean().required("deleteoldrdn")?;
    let new_superior = if r.offset() < end {
        Some(r.read_string(NEW_SUPERIOR).required("newSuperior")?)
    } else {
        None
    };
    expect_end(r, end, "modify dn request")?;
    Ok(ModifyDNRequest {
        entry,
        newrdn,
        delete_old_rdn,
        new_superior,
    })
}

/// CompareRequest ::= [APPLICATION 14] SEQUENCE { entry, ava AttributeValueAssertion }
fn parse_compare_request(r: &mut BerReader<'_>) -> BerResult<CompareRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_COMPARE_REQUEST))?;
    let entry = r.read_string(TAG_OCTET_STRING).required("entry")?;
    let (_, ava_end) = r.read_container(Some(TAG_SEQUENCE))?;
    let attr = r.read_string(TAG_OCTET_STRING).required("attribute")?;
    let assertion_value = r.read_bytes(TAG_OCTET_STRING).required("assertion value")?;
    expect_end(r, ava_end, "compare assertion")?;
    expect_end(r, end, "compare request")?;
    Ok(CompareRequest {
        entry,
        attr,
        assertion_value,
    })
}

/// AbandonRequest ::= [APPLICATION 16] MessageID, primitive: the content is
/// the bare integer bytes.
fn parse_abandon_request(r: &mut BerReader<'_>) -> BerResult<i32> {
    r.read_byte();
    let bytes = r.read_value_after_tag().required("abandon id")?;
    if bytes.is_empty() || bytes.len() > 4 {
        return Err(BerError::IntegerTooLong(bytes.len()));
    }
    let mut value: i32 = if bytes[0] & 0x80 != 0 { -1 } else { 0 };
    for &b in bytes {
        value = (value << 8) | b as i32;
    }
    Ok(value)
}

fn parse_extended_request(r: &mut BerReader<'_>) -> BerResult<ExtendedRequest> {
    let (_, end) = r.read_container(Some(LDAP_TAG_EXTENDED_REQUEST))?;
    let request_name = r.read_string(EXTENDED_REQUEST_NAME).required("request name")?;
    let request_value = if r.offset() < end {
        Some(r.read_bytes(EXTENDED_REQUEST_VALUE).required("request value")?)
    } else {
        None
    };
    expect_end(r, end, "extended request")?;
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_extended_response(r: &mut BerReader<'_>) -> BerResult<ExtendedResponse> {
    let (_, end) = r.read_container(Some(LDAP_TAG_EXTENDED_RESPONSE))?;
    let result = parse_ldap_result(r, end)?;
    let mut response_name = None;
    let mut response_value = None;
    if r.offset() < end && r.peek() == Some(EXTENDED_RESPONSE_NAME) {
        response_name = Some(r.read_string(EXTENDED_RESPONSE_NAME).required("response name")?);
    }
    if r.offset() < end {
        response_value = Some(r.read_bytes(EXTENDED_RESPONSE_VALUE).required("response value")?);
    }
    expect_end(r, end, "extended response")?;
    Ok(ExtendedResponse {
        result,
        response_name,
        response_value,
    })
}

fn parse_intermediate_response(r: &mut BerReader<'_>) -> BerResult<IntermediateResponse> {
    let (_, end) = r.read_container(Some(LDAP_TAG_INTERMEDIATE_RESPONSE))?;
    let mut response_name = None;
    let mut response_value = None;
    if r.offset() < end && r.peek() == Some(INTERMEDIATE_NAME) {
        response_name = Some(r.read_string(INTERMEDIATE_NAME).required("response name")?);
    }
    if r.offset() < end {
        response_value = Some(r.read_bytes(INTERMEDIATE_VALUE).required("response value")?);
    }
    expect_end(r, end, "intermediate response")?;
    Ok(IntermediateResponse {
        response_name,
        response_value,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> BerResult<Vec<u8>> {
    let mut writer = BerWriter::new();
    writer.start_sequence(TAG_SEQUENCE);
    writer.write_integer(message.message_id);

    let w = &mut writer;
    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(w, req),
        ProtocolOp::BindResponse(resp) => {
            w.start_sequence(LDAP_TAG_BIND_RESPONSE);
            encode_ldap_result(w, &resp.result);
            if let Some(creds) = &resp.server_sasl_creds {
                w.write_buffer(creds, SERVER_SASL_CREDS);
            }
            w.end_sequence();
        }
        ProtocolOp::UnbindRequest => w.write_raw(&[LDAP_TAG_UNBIND_REQUEST, 0x00]),
        ProtocolOp::SearchRequest(req) => encode_search_request(w, req),
        ProtocolOp::SearchResultEntry(entry) => {
            w.start_sequence(LDAP_TAG_SEARCH_RESULT_ENTRY);
            w.write_octet_string(&entry.object_name);
            encode_attribute_list(w, &entry.attributes);
            w.end_sequence();
        }
        ProtocolOp::SearchResultReference(uris) => {
            w.start_sequence(LDAP_TAG_SEARCH_RESULT_REFERENCE);
            for uri in uris {
                w.write_octet_string(uri);
            }
            w.end_sequence();
        }
        ProtocolOp::ModifyRequest(req) => {
            w.start_sequence(LDAP_TAG_MODIFY_REQUEST);
            w.write_octet_string(&req.object);
            w.start_sequence(TAG_SEQUENCE);
            for change in &req.changes {
                w.start_sequence(TAG_SEQUENCE);
                w.write_enumeration(change.operation as i32);
                encode_attribute(w, &change.modification);
                w.end_sequence();
            }
            w.end_sequence();
            w.end_sequence();
        }
        ProtocolOp::AddRequest(req) => {
            w.start_sequence(LDAP_TAG_ADD_REQUEST);
            w.write_octet_string(&req.entry);
            encode_attribute_list(w, &req.attributes);
            w.end_sequence();
        }
        ProtocolOp::DelRequest(req) => w.write_string(&req.entry, LDAP_TAG_DEL_REQUEST),
        ProtocolOp::ModifyDNRequest(req) => {
            w.start_sequence(LDAP_TAG_MODIFY_DN_REQUEST);
            w.write_octet_string(&req.entry);
            w.write_octet_string(&req.newrdn);
            w.write_boolean(req.delete_old_rdn);
            if let Some(sup) = &req.new_superior {
                w.write_string(sup, NEW_SUPERIOR);
            }
            w.end_sequence();
        }
        ProtocolOp::CompareRequest(req) => {
            w.start_sequence(LDAP_TAG_COMPARE_REQUEST);
            w.write_octet_string(&req.entry);
            w.start_sequence(TAG_SEQUENCE);
            w.write_octet_string(&req.attr);
            w.write_buffer(&req.assertion_value, TAG_OCTET_STRING);
            w.end_sequence();
            w.end_sequence();
        }
        ProtocolOp::AbandonRequest(id) => encode_abandon_request(w, *id),
        ProtocolOp::ExtendedRequest(req) => {
            w.start_sequence(LDAP_TAG_EXTENDED_REQUEST);
            w.write_string(&req.request_name, EXTENDED_REQUEST_NAME);
            if let Some(value) = &req.request_value {
                w.write_buffer(value, EXTENDED_REQUEST_VALUE);
            }
            w.end_sequence();
        }
        ProtocolOp::ExtendedResponse(resp) => {
            w.start_sequence(LDAP_TAG_EXTENDED_RESPONSE);
            encode_ldap_result(w, &resp.result);
            if let Some(name) = &resp.response_name {
                w.write_string(name, EXTENDED_RESPONSE_NAME);
            }
            if let Some(value) = &resp.response_value {
                w.write_buffer(value, EXTENDED_RESPONSE_VALUE);
            }
            w.end_sequence();
        }
        ProtocolOp::IntermediateResponse(resp) => {
            w.start_sequence(LDAP_TAG_INTERMEDIATE_RESPONSE);
            if let Some(name) = &resp.response_name {
                w.write_string(name, INTERMEDIATE_NAME);
            }
            if let Some(value) = &resp.response_value {
                w.write_buffer(value, INTERMEDIATE_VALUE);
            }
            w.end_sequence();
        }
        ProtocolOp::SearchResultDone(result)
        | ProtocolOp::ModifyResponse(result)
        | ProtocolOp::AddResponse(result)
        | ProtocolOp::DelResponse(result)
        | ProtocolOp::ModifyDNResponse(result)
        | ProtocolOp::CompareResponse(result) => {
            w.start_sequence(message.protocol_op.tag());
            encode_ldap_result(w, result);
            w.end_sequence();
        }
    }

    write_controls(&mut writer, &message.controls, LDAP_CONTEXT_CONTROLS);
    writer.end_sequence();
    writer.into_bytes()
}

fn encode_ldap_result(w: &mut BerWriter, result: &LdapResult) {
    w.write_enumeration(result.result_code);
    w.write_octet_string(&result.matched_dn);
    w.write_octet_string(&result.diagnostic_message);
    if !result.referrals.is_empty() {
        w.start_sequence(REFERRAL_TAG);
        for uri in &result.referrals {
            w.write_octet_string(uri);
        }
        w.end_sequence();
    }
}

fn encode_bind_request(w: &mut BerWriter, req: &BindRequest) {
    w.start_sequence(LDAP_TAG_BIND_REQUEST);
    w.write_integer(req.version);
    w.write_octet_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => w.write_string(password, AUTH_SIMPLE),
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            w.start_sequence(AUTH_SASL);
            w.write_octet_string(mechanism);
            if let Some(creds) = credentials {
                w.write_buffer(creds, TAG_OCTET_STRING);
            }
            w.end_sequence();
        }
    }
    w.end_sequence();
}

fn encode_search_request(w: &mut BerWriter, req: &SearchRequest) {
    w.start_sequence(LDAP_TAG_SEARCH_REQUEST);
    w.write_octet_string(&req.base_object);
    w.write_enumeration(req.scope as i32);
    w.write_enumeration(req.deref_aliases as i32);
    w.write_integer(req.size_limit);
    w.write_integer(req.time_limit);
    w.write_boolean(req.types_only);
    req.filter.write_ber(w);
    w.start_sequence(TAG_SEQUENCE);
    for attr in &req.attributes {
        w.write_octet_string(attr);
    }
    w.end_sequence();
    w.end_sequence();
}

/// Tag, length, then the minimal two's-complement bytes of the target id.
/// No inner INTEGER framing.
fn encode_abandon_request(w: &mut BerWriter, id: i32) {
    let mut i = id as u32;
    let mut size = 4usize;
    while (i & 0xFF80_0000 == 0 || i & 0xFF80_0000 == 0xFF80_0000) && size > 1 {
        size -= 1;
        i <<= 8;
    }
    w.write_byte(LDAP_TAG_ABANDON_REQUEST);
    w.write_byte(size as u8);
    for _ in 0..size {
        w.write_byte((i >> 24) as u8);
        i <<= 8;
    }
}

fn encode_attribute(w: &mut BerWriter, attr: &Attribute) {
    w.start_sequence(TAG_SEQUENCE);
    w.write_octet_string(&attr.wire_type());
    w.start_sequence(TAG_SET);
    for value in &attr.attr_values {
        w.write_buffer(value.as_bytes(), TAG_OCTET_STRING);
    }
    w.end_sequence();
    w.end_sequence();
}

fn encode_attribute_list(w: &mut BerWriter, attributes: &[Attribute]) {
    w.start_sequence(TAG_SEQUENCE);
    for attr in attributes {
        encode_attribute(w, attr);
    }
    w.end_sequence();
}
