// LDAP controls: generic envelope plus typed values for the OIDs we understand

use crate::ber::{
    BerError, BerReader, BerResult, BerWriter, Required, TAG_BOOLEAN, TAG_OCTET_STRING, TAG_SEQUENCE,
};

/// Simple Paged Results (RFC 2696)
pub const PAGED_RESULTS_OID: &str = "1.2.840.113556.1.4.319";
/// Persistent Search (draft-ietf-ldapext-psearch)
pub const PERSISTENT_SEARCH_OID: &str = "2.16.840.1.113730.3.4.3";
/// Entry Change Notification, returned with persistent search entries
pub const ENTRY_CHANGE_NOTIFICATION_OID: &str = "2.16.840.1.113730.3.4.7";
/// Server Side Sorting request / response (RFC 2891)
pub const SORT_REQUEST_OID: &str = "1.2.840.113556.1.4.473";
pub const SORT_RESPONSE_OID: &str = "1.2.840.113556.1.4.474";
/// RFC 4533 Sync Request Control OID
pub const SYNC_REQUEST_OID: &str = "1.3.6.1.4.1.4203.1.9.1.1";

const SORT_ORDERING_RULE: u8 = 0x80;
const SORT_REVERSE: u8 = 0x81;
const SORT_RESPONSE_ATTRIBUTE: u8 = 0x80;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub oid: String,
    pub critical: bool,
    pub value: ControlValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlValue {
    None,
    PagedResults(PagedResults),
    PersistentSearch(PersistentSearch),
    EntryChange(EntryChangeNotification),
    SortRequest(Vec<SortKey>),
    SortResponse(SortResponse),
    SyncRequest(SyncRequest),
    /// Opaque value for OIDs without a typed codec (outgoing only).
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PagedResults {
    /// Requested page size, or the server's estimate of the total in responses.
    pub size: i32,
    /// Empty cookie means no more pages.
    pub cookie: Vec<u8>,
}

/// Change type bits for persistent search.
pub const CHANGE_ADD: i32 = 1;
pub const CHANGE_DELETE: i32 = 2;
pub const CHANGE_MODIFY: i32 = 4;
pub const CHANGE_MODDN: i32 = 8;
pub const CHANGE_ANY: i32 = CHANGE_ADD | CHANGE_DELETE | CHANGE_MODIFY | CHANGE_MODDN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSearch {
    pub change_types: i32,
    pub changes_only: bool,
    pub return_ecs: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryChangeNotification {
    pub change_type: i32,
    pub previous_dn: Option<String>,
    pub change_number: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub attribute: String,
    pub ordering_rule: Option<String>,
    pub reverse: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortResponse {
    pub result: i32,
    pub attribute: Option<String>,
}

/// Parsed Sync Request control value (RFC 4533)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    /// 1 = refreshOnly, 3 = refreshAndPersist
    pub mode: i32,
    pub cookie: Option<Vec<u8>>,
    pub reload_hint: bool,
}

impl SyncRequest {
    pub fn is_refresh_and_persist(&self) -> bool {
        self.mode == 3
    }
}

type ValueParser = fn(&[u8]) -> BerResult<ControlValue>;

/// OID -> value parser. Controls with an OID not listed here are dropped on
/// decode.
static REGISTRY: &[(&str, ValueParser)] = &[
    (PAGED_RESULTS_OID, parse_paged_results),
    (PERSISTENT_SEARCH_OID, parse_persistent_search),
    (ENTRY_CHANGE_NOTIFICATION_OID, parse_entry_change),
    (SORT_REQUEST_OID, parse_sort_request),
    (SORT_RESPONSE_OID, parse_sort_response),
    (SYNC_REQUEST_OID, parse_sync_request),
];

fn parser_for(oid: &str) -> Option<ValueParser> {
    REGISTRY.iter().find(|(o, _)| *o == oid).map(|(_, parser)| *parser)
}

impl Control {
    pub fn new(oid: &str, critical: bool, value: ControlValue) -> Self {
        Self {
            oid: oid.to_string(),
            critical,
            value,
        }
    }

    pub fn paged(size: i32, cookie: Vec<u8>) -> Self {
        Self::new(
            PAGED_RESULTS_OID,
            false,
            ControlValue::PagedResults(PagedResults { size, cookie }),
        )
    }

    pub fn persistent_search(change_types: i32, changes_only: bool, return_ecs: bool) -> Self {
        Self::new(
            PERSISTENT_SEARCH_OID,
            true,
            ControlValue::PersistentSearch(PersistentSearch {
                change_types,
                changes_only,
                return_ecs,
            }),
        )
    }

    pub fn sort(keys: Vec<SortKey>, critical: bool) -> Self {
        Self::new(SORT_REQUEST_OID, critical, ControlValue::SortRequest(keys))
    }

    pub fn sync_request(mode: i32, cookie: Option<Vec<u8>>, reload_hint: bool) -> Self {
        Self::new(
            SYNC_REQUEST_OID,
            true,
            ControlValue::SyncRequest(SyncRequest {
                mode,
                cookie,
                reload_hint,
            }),
        )
    }

    /// Control ::= SEQUENCE { controlType, criticality DEFAULT FALSE, controlValue OPTIONAL }
    pub fn write(&self, w: &mut BerWriter) {
        w.start_sequence(TAG_SEQUENCE);
        w.write_octet_string(&self.oid);
        if self.critical {
            w.write_boolean(true);
        }
        if let Some(value) = self.value.encode() {
            match value {
                Ok(bytes) => w.write_buffer(&bytes, TAG_OCTET_STRING),
                Err(e) => w.fail(e),
            }
        }
        w.end_sequence();
    }

    /// Read one control. Returns `Ok(None)` for OIDs without a registered
    /// parser; a registered OID with a malformed value is an error.
    pub fn read(r: &mut BerReader<'_>) -> BerResult<Option<Control>> {
        let (_, end) = r.read_container(Some(TAG_SEQUENCE))?;
        let oid = r.read_string(TAG_OCTET_STRING).required("control type")?;
        let mut critical = false;
        let mut raw = None;
        if r.offset() < end && r.peek() == Some(TAG_BOOLEAN) {
            critical = r.read_boolean().required("criticality")?;
        }
        if r.offset() < end {
            raw = Some(r.read_bytes(TAG_OCTET_STRING).required("control value")?);
        }
        if r.offset() != end {
            return Err(BerError::Invalid(format!("trailing bytes in control {}", oid)));
        }

        let Some(parser) = parser_for(&oid) else {
            tracing::debug!("Dropping unrecognized control {}", oid);
            return Ok(None);
        };
        let value = match raw {
            Some(bytes) => parser(&bytes)?,
            None => ControlValue::None,
        };
        Ok(Some(Control { oid, critical, value }))
    }
}

impl ControlValue {
    /// Encoded controlValue, or None when the control carries no value.
    pub fn encode(&self) -> Option<BerResult<Vec<u8>>> {
        let mut w = BerWriter::new();
        match self {
            ControlValue::None => return None,
            ControlValue::Raw(bytes) => return Some(Ok(bytes.clone())),
            ControlValue::PagedResults(p) => {
                w.start_sequence(TAG_SEQUENCE);
                w.write_integer(p.size);
                w.write_buffer(&p.cookie, TAG_OCTET_STRING);
                w.end_sequence();
            }
            ControlValue::PersistentSearch(p) => {
                w.start_sequence(TAG_SEQUENCE);
                w.write_integer(p.change_types);
                w.write_boolean(p.changes_only);
                w.write_boolean(p.return_ecs);
                w.end_sequence();
            }
            ControlValue::EntryChange(e) => {
                w.start_sequence(TAG_SEQUENCE);
                w.write_enumeration(e.change_type);
                if let Some(dn) = &e.previous_dn {
                    w.write_octet_string(dn);
                }
                if let Some(n) = e.change_number {
                    w.write_integer(n);
                }
                w.end_sequence();
            }
            ControlValue::SortRequest(keys) => {
                w.start_sequence(TAG_SEQUENCE);
                for key in keys {
                    w.start_sequence(TAG_SEQUENCE);
                    w.write_octet_string(&key.attribute);
                    if let Some(rule) = &key.ordering_rule {
                        w.write_string(rule, SORT_ORDERING_RULE);
                    }
                    if key.reverse {
                        w.write_boolean_tagged(true, SORT_REVERSE);
                    }
                    w.end_sequence();
                }
                w.end_sequence();
            }
            ControlValue::SortResponse(s) => {
                w.start_sequence(TAG_SEQUENCE);
                w.write_enumeration(s.result);
                if let Some(a) = &s.attribute {
                    w.write_string(a, SORT_RESPONSE_ATTRIBUTE);
                }
                w.end_sequence();
            }
            ControlValue::SyncRequest(s) => {
                w.start_sequence(TAG_SEQUENCE);
                w.write_enumeration(s.mode);
                if let Some(cookie) = &s.cookie {
                    w.write_buffer(cookie, TAG_OCTET_STRING);
                }
                if s.reload_hint {
                    w.write_boolean(true);
                }
                w.end_sequence();
            }
        }
        Some(w.into_bytes())
    }
}

/// Write the `[0]` controls container; nothing when the list is empty.
pub fn write_controls(w: &mut BerWriter, controls: &[Control], tag: u8) {
    if controls.is_empty() {
        return;
    }
    w.start_sequence(tag);
    for control in controls {
        control.write(w);
    }
    w.end_sequence();
}

/// Read a controls container whose tag byte is at the cursor.
pub fn read_controls(r: &mut BerReader<'_>, tag: u8) -> BerResult<Vec<Control>> {
    let (_, end) = r.read_container(Some(tag))?;
    let mut controls = Vec::new();
    while r.offset() < end {
        if let Some(control) = Control::read(r)? {
            controls.push(control);
        }
    }
    Ok(controls)
}

pub fn find_paged(controls: &[Control]) -> Option<&PagedResults> {
    controls.iter().find_map(|c| match &c.value {
        ControlValue::PagedResults(p) => Some(p),
        _ => None,
    })
}

pub fn find_entry_change(controls: &[Control]) -> Option<&EntryChangeNotification> {
    controls.iter().find_map(|c| match &c.value {
        ControlValue::EntryChange(e) => Some(e),
        _ => None,
    })
}

pub fn find_sync_request(controls: &[Control]) -> Option<&SyncRequest> {
    controls.iter().find_map(|c| match &c.value {
        ControlValue::SyncRequest(s) => Some(s),
        _ => None,
    })
}

/// True when the controls ask the server to keep the search open
/// (persistent search, or sync in refreshAndPersist mode).
pub fn is_persistent(controls: &[Control]) -> bool {
    controls
        .iter()
        .any(|c| matches!(c.value, ControlValue::PersistentSearch(_)))
        || find_sync_request(controls).is_some_and(SyncRequest::is_refresh_and_persist)
}

fn value_end(r: &mut BerReader<'_>) -> BerResult<usize> {
    Ok(r.read_container(Some(TAG_SEQUENCE))?.1)
}

fn parse_paged_results(data: &[u8]) -> BerResult<ControlValue> {
    let mut r = BerReader::new(data);
    value_end(&mut r)?;
    let size = r.read_integer().required("paged size")?;
    let cookie = r.read_bytes(TAG_OCTET_STRING).required("paged cookie")?;
    Ok(ControlValue::PagedResults(PagedResults { size, cookie }))
}

fn parse_persistent_search(data: &[u8]) -> BerResult<ControlValue> {
    let mut r = BerReader::new(data);
    value_end(&mut r)?;
    Ok(ControlValue::PersistentSearch(PersistentSearch {
        change_types: r.read_integer().required("changeTypes")?,
        changes_only: r.read_boolean().required("changesOnly")?,
        return_ecs: r.read_boolean().required("returnECs")?,
    }))
}

fn parse_entry_change(data: &[u8]) -> BerResult<ControlValue> {
    let mut r = BerReader::new(data);
    let end = value_end(&mut r)?;
    let change_type = r.read_enumeration().required("changeType")?;
    let mut previous_dn = None;
    let mut change_number = None;
    while r.offset() < end {
        match r.peek() {
            Some(TAG_OCTET_STRING) => previous_dn = Some(r.read_string(TAG_OCTET_STRING).required("previousDN")?),
            _ => change_number = Some(r.read_integer().required("changeNumber")?),
        }
    }
    Ok(ControlValue::EntryChange(EntryChangeNotification {
        change_type,
        previous_dn,
        change_number,
    }))
}

fn parse_sort_request(data: &[u8]) -> BerResult<ControlValue> {
    let mut r = BerReader::new(data);
    let end = value_end(&mut r)?;
    let mut keys = Vec::new();
    while r.offset() < end {
        let key_end = value_end(&mut r)?;
        let attribute = r.read_string(TAG_OCTET_STRING).required("sort attribute")?;
        let mut ordering_rule = None;
        let mut reverse = false;
        while r.offset() < key_end {
            match r.peek() {
                Some(SORT_ORDERING_RULE) => {
                    ordering_rule = Some(r.read_string(SORT_ORDERING_RULE).required("orderingRule")?)
                }
                _ => reverse = r.read_boolean_tagged(SORT_REVERSE).required("reverseOrder")?,
            }
        }
        keys.push(SortKey {
            attribute,
            ordering_rule,
            reverse,
        });
    }
    Ok(ControlValue::SortRequest(keys))
}

fn parse_sort_response(data: &[u8]) -> BerResult<ControlValue> {
    let mut r = BerReader::new(data);
    let end = value_end(&mut r)?;
    let result = r.read_enumeration().required("sortResult")?;
    let attribute = if r.offset() < end {
        Some(r.read_string(SORT_RESPONSE_ATTRIBUTE).required("attributeType")?)
    } else {
        None
    };
    Ok(ControlValue::SortResponse(SortResponse { result, attribute }))
}

/// SEQUENCE { mode ENUMERATED, cookie OCTET STRING OPT, reloadHint BOOLEAN OPT }
fn parse_sync_request(data: &[u8]) -> BerResult<ControlValue> {
    let mut r = BerReader::new(data);
    let end = value_end(&mut r)?;
    let mode = r.read_enumeration().required("sync mode")?;
    let mut cookie = None;
    let mut reload_hint = false;
    while r.offset() < end {
        match r.peek() {
            Some(TAG_OCTET_STRING) => cookie = Some(r.read_bytes(TAG_OCTET_STRING).required("sync cookie")?),
            _ => reload_hint = r.read_boolean().required("reloadHint")?,
        }
    }
    Ok(ControlValue::SyncRequest(SyncRequest {
        mode,
        cookie,
        reload_hint,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTROLS_TAG: u8 = 0xA0;

    fn roundtrip(controls: &[Control]) -> Vec<Control> {
        let mut w = BerWriter::new();
        write_controls(&mut w, controls, CONTROLS_TAG);
        let bytes = w.into_bytes().unwrap();
        let mut r = BerReader::new(&bytes);
        let decoded = read_controls(&mut r, CONTROLS_TAG).unwrap();
        assert_eq!(r.remaining(), 0);
        decoded
    }

    #[test]
    fn test_paged_control_encoding() {
        let mut w = BerWriter::new();
        Control::paged(2, vec![]).write(&mut w);
        let bytes = w.into_bytes().unwrap();
        let mut expected = vec![0x30, 0x21, 0x04, 0x16];
        expected.extend_from_slice(PAGED_RESULTS_OID.as_bytes());
        // controlValue: OCTET STRING { SEQUENCE { INTEGER 2, OCTET STRING "" } }
        expected.extend_from_slice(&[0x04, 0x07, 0x30, 0x05, 0x02, 0x01, 0x02, 0x04, 0x00]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_typed_controls_survive_the_wire() {
        let controls = vec![
            Control::paged(100, b"cookie".to_vec()),
            Control::persistent_search(CHANGE_ANY, true, true),
            Control::sort(
                vec![
                    SortKey {
                        attribute: "cn".into(),
                        ordering_rule: None,
                        reverse: false,
                    },
                    SortKey {
                        attribute: "sn".into(),
                        ordering_rule: Some("2.5.13.3".into()),
                        reverse: true,
                    },
                ],
                true,
            ),
            Control::sync_request(3, Some(vec![1, 2, 3]), true),
            Control::new(
                ENTRY_CHANGE_NOTIFICATION_OID,
                false,
                ControlValue::EntryChange(EntryChangeNotification {
                    change_type: CHANGE_MODDN,
                    previous_dn: Some("cn=old,dc=example".into()),
                    change_number: Some(42),
                }),
            ),
            Control::new(
                SORT_RESPONSE_OID,
                false,
                ControlValue::SortResponse(SortResponse {
                    result: 0,
                    attribute: Some("cn".into()),
                }),
            ),
        ];
        assert_eq!(roundtrip(&controls), controls);
    }

    #[test]
    fn test_unknown_oid_dropped() {
        let controls = vec![
            Control::new("1.2.3.4.5", true, ControlValue::Raw(vec![0xDE, 0xAD])),
            Control::paged(5, vec![]),
            Control::new("2.16.840.1.113730.3.4.2", false, ControlValue::None),
        ];
        let decoded = roundtrip(&controls);
        assert_eq!(decoded, vec![Control::paged(5, vec![])]);
    }

    #[test]
    fn test_known_oid_without_value() {
        let controls = vec![Control::new(PAGED_RESULTS_OID, false, ControlValue::None)];
        assert_eq!(roundtrip(&controls), controls);
    }

    #[test]
    fn test_malformed_known_value_is_error() {
        let controls = vec![Control::new(
            PAGED_RESULTS_OID,
            false,
            ControlValue::Raw(vec![0x30, 0x03, 0x04, 0x01, 0x00]),
        )];
        let mut w = BerWriter::new();
        write_controls(&mut w, &controls, CONTROLS_TAG);
        let bytes = w.into_bytes().unwrap();
        assert!(read_controls(&mut BerReader::new(&bytes), CONTROLS_TAG).is_err());
    }

    #[test]
    fn test_empty_list_writes_nothing() {
        let mut w = BerWriter::new();
        write_controls(&mut w, &[], CONTROLS_TAG);
        assert!(w.into_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_find_helpers() {
        let controls = vec![
            Control::sync_request(1, None, false),
            Control::paged(10, b"c".to_vec()),
        ];
        assert_eq!(find_paged(&controls).map(|p| p.cookie.clone()), Some(b"c".to_vec()));
        assert!(!find_sync_request(&controls).unwrap().is_refresh_and_persist());
        assert!(find_entry_change(&controls).is_none());
        assert!(parser_for(SORT_REQUEST_OID).is_some());
        assert!(parser_for("1.2.3").is_none());
        assert!(!is_persistent(&controls));
        assert!(is_persistent(&[Control::sync_request(3, None, false)]));
        assert!(is_persistent(&[Control::persistent_search(CHANGE_ANY, true, true)]));
    }
}
