//! LDAP search filters: text form (RFC 4515), in-memory AST and BER form.

mod matching;
mod parser;
mod wire;

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub use matching::Record;
pub use parser::parse;

/// Filter tags (context-specific, RFC 4511 section 4.5.1).
pub const FILTER_AND: u8 = 0xA0;
pub const FILTER_OR: u8 = 0xA1;
pub const FILTER_NOT: u8 = 0xA2;
pub const FILTER_EQUALITY: u8 = 0xA3;
pub const FILTER_SUBSTRINGS: u8 = 0xA4;
pub const FILTER_GE: u8 = 0xA5;
pub const FILTER_LE: u8 = 0xA6;
pub const FILTER_PRESENT: u8 = 0x87;
pub const FILTER_APPROX: u8 = 0xA8;
pub const FILTER_EXTENSIBLE: u8 = 0xA9;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("{reason}: {offending:?} in filter {input:?}")]
    Parse {
        reason: String,
        offending: String,
        input: String,
    },

    #[error("{0} matching is not implemented")]
    Unsupported(&'static str),
}

impl FilterError {
    pub(crate) fn parse(reason: impl Into<String>, offending: &str, input: &str) -> Self {
        FilterError::Parse {
            reason: reason.into(),
            offending: offending.to_string(),
            input: input.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attribute: String,
        value: Vec<u8>,
    },
    Substring {
        attribute: String,
        initial: Option<Vec<u8>>,
        any: Vec<Vec<u8>>,
        final_value: Option<Vec<u8>>,
    },
    GreaterOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    LessOrEqual {
        attribute: String,
        value: Vec<u8>,
    },
    Presence {
        attribute: String,
    },
    Approximate {
        attribute: String,
        value: Vec<u8>,
    },
    Extensible {
        /// Matching rule OID.
        rule: Option<String>,
        /// Attribute description (match type).
        attribute: Option<String>,
        value: Vec<u8>,
        dn_attributes: bool,
    },
}

impl Filter {
    pub fn equality(attribute: &str, value: impl AsRef<[u8]>) -> Self {
        Filter::Equality {
            attribute: attribute.to_lowercase(),
            value: value.as_ref().to_vec(),
        }
    }

    pub fn presence(attribute: &str) -> Self {
        Filter::Presence {
            attribute: attribute.to_lowercase(),
        }
    }

    pub fn not(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Attribute the filter tests, if it is a leaf.
    pub fn attribute(&self) -> Option<&str> {
        match self {
            Filter::And(_) | Filter::Or(_) | Filter::Not(_) => None,
            Filter::Equality { attribute, .. }
            | Filter::Substring { attribute, .. }
            | Filter::GreaterOrEqual { attribute, .. }
            | Filter::LessOrEqual { attribute, .. }
            | Filter::Presence { attribute }
            | Filter::Approximate { attribute, .. } => Some(attribute),
            Filter::Extensible { attribute, .. } => attribute.as_deref(),
        }
    }

    /// BER tag this variant is written with.
    pub fn tag(&self) -> u8 {
        match self {
            Filter::And(_) => FILTER_AND,
            Filter::Or(_) => FILTER_OR,
            Filter::Not(_) => FILTER_NOT,
            Filter::Equality { .. } => FILTER_EQUALITY,
            Filter::Substring { .. } => FILTER_SUBSTRINGS,
            Filter::GreaterOrEqual { .. } => FILTER_GE,
            Filter::LessOrEqual { .. } => FILTER_LE,
            Filter::Presence { .. } => FILTER_PRESENT,
            Filter::Approximate { .. } => FILTER_APPROX,
            Filter::Extensible { .. } => FILTER_EXTENSIBLE,
        }
    }
}

/// RFC 4515 value escaping: `*`, `(`, `)`, `\` and NUL always; every
/// non-ASCII byte too when the value is not valid UTF-8.
pub fn escape_value(value: &[u8]) -> String {
    let utf8 = std::str::from_utf8(value).is_ok();
    let mut out = String::with_capacity(value.len());
    if utf8 {
        // Safe to walk chars; only ASCII specials get escaped.
        for c in String::from_utf8_lossy(value).chars() {
            match c {
                '*' | '(' | ')' | '\\' | '\0' => out.push_str(&format!("\\{:02x}", c as u32)),
                _ => out.push(c),
            }
        }
    } else {
        for &b in value {
            match b {
                b'*' | b'(' | b')' | b'\\' | 0 | 0x80..=0xFF => {
                    out.push_str(&format!("\\{:02x}", b))
                }
                _ => out.push(b as char),
            }
        }
    }
    out
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Filter::And(children) => {
                write!(f, "(&")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Filter::Or(children) => {
                write!(f, "(|")?;
                for c in children {
                    write!(f, "{}", c)?;
                }
                write!(f, ")")
            }
            Filter::Not(child) => write!(f, "(!{})", child),
            Filter::Equality { attribute, value } => {
                write!(f, "({}={})", attribute, escape_value(value))
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => {
                write!(f, "({}=", attribute)?;
                if let Some(v) = initial {
                    write!(f, "{}", escape_value(v))?;
                }
                write!(f, "*")?;
                for v in any {
                    write!(f, "{}*", escape_value(v))?;
                }
                if let Some(v) = final_value {
                    write!(f, "{}", escape_value(v))?;
                }
                write!(f, ")")
            }
            Filter::GreaterOrEqual { attribute, value } => {
                write!(f, "({}>={})", attribute, escape_value(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                write!(f, "({}<={})", attribute, escape_value(value))
            }
            Filter::Presence { attribute } => write!(f, "({}=*)", attribute),
            Filter::Approximate { attribute, value } => {
                write!(f, "({}~={})", attribute, escape_value(value))
            }
            Filter::Extensible {
                rule,
                attribute,
                value,
                dn_attributes,
            } => {
                write!(f, "(")?;
                if let Some(a) = attribute {
                    write!(f, "{}", a)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(r) = rule {
                    write!(f, ":{}", r)?;
                }
                write!(f, ":={})", escape_value(value))
            }
        }
    }
}

impl FromStr for Filter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber::{BerReader, BerWriter};

    fn roundtrip_text(input: &str) -> String {
        parse(input).unwrap().to_string()
    }

    fn wire_fixpoint(input: &str) {
        let filter = parse(input).unwrap();
        let text = filter.to_string();
        let mut w = BerWriter::new();
        filter.write_ber(&mut w);
        let bytes = w.into_bytes().unwrap();
        let mut r = BerReader::new(&bytes);
        let decoded = Filter::read_ber(&mut r).unwrap();
        assert_eq!(r.remaining(), 0);
        assert_eq!(decoded.to_string(), text, "input {}", input);
        assert_eq!(parse(&text).unwrap(), filter, "input {}", input);
    }

    #[test]
    fn test_display_escapes() {
        let f = Filter::equality("o", "Parens (test)*\\");
        assert_eq!(f.to_string(), "(o=Parens \\28test\\29\\2a\\5c)");
        let f = Filter::equality("bin", [0x00, 0xFF, b'a']);
        assert_eq!(f.to_string(), "(bin=\\00\\ffa)");
        let f = Filter::equality("cn", "Jürgen");
        assert_eq!(f.to_string(), "(cn=Jürgen)");
    }

    #[test]
    fn test_text_roundtrip_is_normalized() {
        assert_eq!(roundtrip_text("cn=foo"), "(cn=foo)");
        assert_eq!(roundtrip_text("(CN=Foo)"), "(cn=Foo)");
        assert_eq!(roundtrip_text("(&(cn=foo)(!(sn=bar)))"), "(&(cn=foo)(!(sn=bar)))");
        assert_eq!(roundtrip_text("(cn=*foo*bar*)"), "(cn=*foo*bar*)");
        assert_eq!(roundtrip_text("(cn:dn:2.4.6.8.10:=Dino)"), "(cn:dn:2.4.6.8.10:=Dino)");
        assert_eq!(roundtrip_text("(o=Parens \\28test\\29)"), "(o=Parens \\28test\\29)");
    }

    #[test]
    fn test_filter_fixpoints() {
        for input in [
            "(cn=foo)",
            "(&(cn=foo)(!(sn=bar)))",
            "(|(uid=a)(uid=b)(&(objectClass=person)(mail=*)))",
            "(o=Parens \\28test\\29)",
            "(cn=foo*)",
            "(cn=*foo)",
            "(cn=f*o*o)",
            "(cn=*)",
            "(age>=30)",
            "(age<=40)",
            "(sn~=smith)",
            "(cn:caseExactMatch:=Fred)",
            "(:dn:2.4.6.8.10:=Dino)",
            "(cn:dn:=John)",
            "(data=\\00\\ff\\2a)",
        ] {
            wire_fixpoint(input);
        }
    }

    #[test]
    fn test_from_str_and_attribute() {
        let f: Filter = "(mail=*)".parse().unwrap();
        assert_eq!(f, Filter::presence("mail"));
        assert_eq!(f.attribute(), Some("mail"));
        assert_eq!(f.tag(), FILTER_PRESENT);
        let f: Filter = "(&(a=1))".parse().unwrap();
        assert_eq!(f.attribute(), None);
        assert!("(&(a=1)".parse::<Filter>().is_err());
    }
}
