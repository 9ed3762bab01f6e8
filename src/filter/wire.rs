// Filter <-> BER (RFC 4511 section 4.5.1)

use super::*;
use crate::ber::{BerError, BerReader, BerResult, BerWriter, Required, TAG_OCTET_STRING, TAG_SEQUENCE};

const SUBSTRING_INITIAL: u8 = 0x80;
const SUBSTRING_ANY: u8 = 0x81;
const SUBSTRING_FINAL: u8 = 0x82;

const EXTENSIBLE_RULE: u8 = 0x81;
const EXTENSIBLE_TYPE: u8 = 0x82;
const EXTENSIBLE_VALUE: u8 = 0x83;
const EXTENSIBLE_DN: u8 = 0x84;

impl Filter {
    pub fn write_ber(&self, w: &mut BerWriter) {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                w.start_sequence(self.tag());
                for child in children {
                    child.write_ber(w);
                }
                w.end_sequence();
            }
            Filter::Not(child) => {
                w.start_sequence(FILTER_NOT);
                child.write_ber(w);
                w.end_sequence();
            }
            Filter::Equality { attribute, value }
            | Filter::GreaterOrEqual { attribute, value }
            | Filter::LessOrEqual { attribute, value }
            | Filter::Approximate { attribute, value } => {
                w.start_sequence(self.tag());
                w.write_string(attribute, TAG_OCTET_STRING);
                w.write_buffer(value, TAG_OCTET_STRING);
                w.end_sequence();
            }
            // Primitive: the content is the attribute name itself
            Filter::Presence { attribute } => w.write_string(attribute, FILTER_PRESENT),
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => {
                w.start_sequence(FILTER_SUBSTRINGS);
                w.write_string(attribute, TAG_OCTET_STRING);
                w.start_sequence(TAG_SEQUENCE);
                if let Some(v) = initial {
                    w.write_buffer(v, SUBSTRING_INITIAL);
                }
                for v in any {
                    w.write_buffer(v, SUBSTRING_ANY);
                }
                if let Some(v) = final_value {
                    w.write_buffer(v, SUBSTRING_FINAL);
                }
                w.end_sequence();
                w.end_sequence();
            }
            Filter::Extensible {
                rule,
                attribute,
                value,
                dn_attributes,
            } => {
                w.start_sequence(FILTER_EXTENSIBLE);
                if let Some(r) = rule {
                    w.write_string(r, EXTENSIBLE_RULE);
                }
                if let Some(a) = attribute {
                    w.write_string(a, EXTENSIBLE_TYPE);
                }
                w.write_buffer(value, EXTENSIBLE_VALUE);
                if *dn_attributes {
                    w.write_boolean_tagged(true, EXTENSIBLE_DN);
                }
                w.end_sequence();
            }
        }
    }

    /// Decode one filter from a complete buffer. Attribute names are
    /// lower-cased, and so are `objectclass` values.
    pub fn read_ber(r: &mut BerReader<'_>) -> BerResult<Filter> {
        let Some(tag) = r.peek() else {
            return Err(BerError::Truncated("filter"));
        };
        match tag {
            FILTER_AND | FILTER_OR => {
                let (_, end) = r.read_container(Some(tag))?;
                let mut children = Vec::new();
                while r.offset() < end {
                    children.push(Filter::read_ber(r)?);
                }
                check_end(r, end, "and/or filter")?;
                Ok(if tag == FILTER_AND {
                    Filter::And(children)
                } else {
                    Filter::Or(children)
                })
            }
            FILTER_NOT => {
                let (_, end) = r.read_container(Some(FILTER_NOT))?;
                let child = Filter::read_ber(r)?;
                check_end(r, end, "not filter")?;
                Ok(Filter::Not(Box::new(child)))
            }
            FILTER_EQUALITY | FILTER_GE | FILTER_LE | FILTER_APPROX => {
                let (_, end) = r.read_container(Some(tag))?;
                let attribute = r.read_string(TAG_OCTET_STRING).required("attribute")?.to_lowercase();
                let mut value = r.read_bytes(TAG_OCTET_STRING).required("assertion value")?;
                check_end(r, end, "attribute value assertion")?;
                if attribute == "objectclass" {
                    value = lowercase_value(value);
                }
                Ok(match tag {
                    FILTER_EQUALITY => Filter::Equality { attribute, value },
                    FILTER_GE => Filter::GreaterOrEqual { attribute, value },
                    FILTER_LE => Filter::LessOrEqual { attribute, value },
                    _ => Filter::Approximate { attribute, value },
                })
            }
            FILTER_PRESENT => {
                let attribute = r.read_string(FILTER_PRESENT).required("present filter")?;
                Ok(Filter::Presence {
                    attribute: attribute.to_lowercase(),
                })
            }
            FILTER_SUBSTRINGS => {
                let (_, end) = r.read_container(Some(FILTER_SUBSTRINGS))?;
                let attribute = r.read_string(TAG_OCTET_STRING).required("attribute")?.to_lowercase();
                let fold = attribute == "objectclass";
                let (_, parts_end) = r.read_container(Some(TAG_SEQUENCE))?;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_value = None;
                while r.offset() < parts_end {
                    let part_tag = r.peek().unwrap_or_default();
                    let mut part = match part_tag {
                        SUBSTRING_INITIAL | SUBSTRING_ANY | SUBSTRING_FINAL => {
                            r.read_bytes(part_tag).required("substring")?
                        }
                        other => {
                            return Err(BerError::Invalid(format!(
                                "unknown substring choice 0x{:02X}",
                                other
                            )))
                        }
                    };
                    if fold {
                        part = lowercase_value(part);
                    }
                    match part_tag {
                        SUBSTRING_INITIAL => initial = Some(part),
                        SUBSTRING_ANY => any.push(part),
                        _ => final_value = Some(part),
                    }
                }
                check_end(r, parts_end, "substrings")?;
                check_end(r, end, "substring filter")?;
                Ok(Filter::Substring {
                    attribute,
                    initial,
                    any,
                    final_value,
                })
            }
            FILTER_EXTENSIBLE => {
                let (_, end) = r.read_container(Some(FILTER_EXTENSIBLE))?;
                let mut rule = None;
                let mut attribute = None;
                let mut value = None;
                let mut dn_attributes = false;
                while r.offset() < end {
                    match r.peek().unwrap_or_default() {
                        EXTENSIBLE_RULE => rule = Some(r.read_string(EXTENSIBLE_RULE).required("matching rule")?),
                        EXTENSIBLE_TYPE => {
                            attribute = Some(r.read_string(EXTENSIBLE_TYPE).required("match type")?.to_lowercase())
                        }
                        EXTENSIBLE_VALUE => value = Some(r.read_bytes(EXTENSIBLE_VALUE).required("match value")?),
                        EXTENSIBLE_DN => dn_attributes = r.read_boolean_tagged(EXTENSIBLE_DN).required("dnAttributes")?,
                        other => {
                            return Err(BerError::Invalid(format!(
                                "unknown extensible match field 0x{:02X}",
                                other
                            )))
                        }
                    }
                }
                check_end(r, end, "extensible filter")?;
                let Some(value) = value else {
                    return Err(BerError::Invalid("extensible match without value".to_string()));
                };
                Ok(Filter::Extensible {
                    rule,
                    attribute,
                    value,
                    dn_attributes,
                })
            }
            other => Err(BerError::Invalid(format!("unknown filter tag 0x{:02X}", other))),
        }
    }
}

fn check_end(r: &BerReader<'_>, end: usize, what: &'static str) -> BerResult<()> {
    if r.offset() != end {
        return Err(BerError::Invalid(format!(
            "{} overruns its container ({} != {})",
            what,
            r.offset(),
            end
        )));
    }
    Ok(())
}

fn lowercase_value(value: Vec<u8>) -> Vec<u8> {
    match String::from_utf8(value) {
        Ok(s) => s.to_lowercase().into_bytes(),
        Err(e) => e.into_bytes().to_ascii_lowercase(),
    }
}
