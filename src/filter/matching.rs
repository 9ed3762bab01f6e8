// In-memory evaluation of filters against a flat attribute map

use super::{Filter, FilterError};
use std::borrow::Cow;
use std::collections::HashMap;

/// Attribute name -> values.
pub type Record = HashMap<String, Vec<String>>;

impl Filter {
    /// Evaluate against `record`. Without `strict_case`, attribute names and
    /// values compare case-insensitively.
    ///
    /// `&` and `|` with no children both evaluate to true. Approximate and
    /// extensible matches are not evaluated and return `Unsupported`.
    pub fn matches(&self, record: &Record, strict_case: bool) -> Result<bool, FilterError> {
        match self {
            Filter::And(children) => {
                for child in children {
                    if !child.matches(record, strict_case)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Filter::Or(children) => {
                if children.is_empty() {
                    return Ok(true);
                }
                for child in children {
                    if child.matches(record, strict_case)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Filter::Not(child) => Ok(!child.matches(record, strict_case)?),
            Filter::Presence { attribute } => Ok(lookup(record, attribute, strict_case).is_some()),
            Filter::Equality { attribute, value } => {
                let want = fold(value, strict_case);
                Ok(values(record, attribute, strict_case)
                    .any(|v| fold_str(v, strict_case).as_ref() == want.as_str()))
            }
            Filter::GreaterOrEqual { attribute, value } => {
                let bound = fold(value, strict_case);
                Ok(values(record, attribute, strict_case)
                    .any(|v| fold_str(v, strict_case).as_ref() >= bound.as_str()))
            }
            Filter::LessOrEqual { attribute, value } => {
                let bound = fold(value, strict_case);
                Ok(values(record, attribute, strict_case)
                    .any(|v| fold_str(v, strict_case).as_ref() <= bound.as_str()))
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => {
                let initial = initial.as_deref().map(|v| fold(v, strict_case));
                let any: Vec<String> = any.iter().map(|v| fold(v, strict_case)).collect();
                let final_value = final_value.as_deref().map(|v| fold(v, strict_case));
                Ok(values(record, attribute, strict_case).any(|v| {
                    substring_match(
                        &fold_str(v, strict_case),
                        initial.as_deref(),
                        &any,
                        final_value.as_deref(),
                    )
                }))
            }
            Filter::Approximate { .. } => Err(FilterError::Unsupported("approximate")),
            Filter::Extensible { .. } => Err(FilterError::Unsupported("extensible")),
        }
    }
}

fn lookup<'r>(record: &'r Record, attribute: &str, strict_case: bool) -> Option<&'r Vec<String>> {
    if strict_case {
        return record.get(attribute);
    }
    record.get(attribute).or_else(|| {
        record
            .iter()
            .find(|(name, _)| name.to_lowercase() == attribute.to_lowercase())
            .map(|(_, v)| v)
    })
}

fn values<'r>(
    record: &'r Record,
    attribute: &str,
    strict_case: bool,
) -> impl Iterator<Item = &'r String> {
    lookup(record, attribute, strict_case).into_iter().flatten()
}

fn fold(value: &[u8], strict_case: bool) -> String {
    let s = String::from_utf8_lossy(value);
    if strict_case {
        s.into_owned()
    } else {
        s.to_lowercase()
    }
}

fn fold_str(value: &str, strict_case: bool) -> Cow<'_, str> {
    if strict_case {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(value.to_lowercase())
    }
}

fn substring_match(value: &str, initial: Option<&str>, any: &[String], final_value: Option<&str>) -> bool {
    let mut rest = value;
    if let Some(prefix) = initial {
        match rest.strip_prefix(prefix) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    if let Some(suffix) = final_value {
        match rest.strip_suffix(suffix) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        match rest.find(part.as_str()) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    true
}
