// RFC 4515 string form -> Filter

use super::{Filter, FilterError};

type Result<T> = std::result::Result<T, FilterError>;

/// Parse a filter string. A bare `attr=value` without outer parentheses is
/// accepted and treated as `(attr=value)`.
pub fn parse(input: &str) -> Result<Filter> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(FilterError::parse("empty filter", "", input));
    }
    let wrapped;
    let text = if trimmed.starts_with('(') {
        trimmed
    } else {
        wrapped = format!("({})", trimmed);
        wrapped.as_str()
    };
    check_balance(text, input)?;

    let mut parser = Parser {
        text,
        input,
        pos: 0,
    };
    let filter = parser.parse_filter()?;
    if parser.pos != text.len() {
        return Err(FilterError::parse(
            "unexpected trailing input",
            &text[parser.pos..],
            input,
        ));
    }
    Ok(filter)
}

/// Escapes never produce literal parentheses, so raw counting is exact.
fn check_balance(text: &str, input: &str) -> Result<()> {
    let mut depth: i64 = 0;
    for b in text.bytes() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth < 0 {
                    return Err(FilterError::parse("unbalanced parentheses", input, input));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(FilterError::parse("unbalanced parentheses", input, input));
    }
    Ok(())
}

struct Parser<'a> {
    text: &'a str,
    /// Caller's original string, for error reports.
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn expect(&mut self, c: u8) -> Result<()> {
        match self.peek() {
            Some(b) if b == c => {
                self.pos += 1;
                Ok(())
            }
            _ => Err(FilterError::parse(
                format!("expected '{}'", c as char),
                &self.text[self.pos..],
                self.input,
            )),
        }
    }

    fn parse_filter(&mut self) -> Result<Filter> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.parse_list("&")?)
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.parse_list("|")?)
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.parse_filter()?))
            }
            Some(b'(') | Some(b')') => {
                return Err(FilterError::parse(
                    "invalid attribute name",
                    &self.text[self.pos..],
                    self.input,
                ))
            }
            _ => self.parse_item()?,
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn parse_list(&mut self, op: &str) -> Result<Vec<Filter>> {
        let mut children = Vec::new();
        while self.peek() == Some(b'(') {
            children.push(self.parse_filter()?);
        }
        if children.is_empty() {
            return Err(FilterError::parse(
                format!("'{}' requires at least one filter", op),
                &self.text[self.pos..],
                self.input,
            ));
        }
        Ok(children)
    }

    /// Leaf item up to (not including) the closing ')'.
    fn parse_item(&mut self) -> Result<Filter> {
        let start = self.pos;
        let bytes = self.text.as_bytes();
        let mut end = start;
        while end < bytes.len() && bytes[end] != b')' {
            if bytes[end] == b'(' {
                return Err(FilterError::parse(
                    "unescaped '(' in value",
                    &self.text[start..],
                    self.input,
                ));
            }
            end += 1;
        }
        let item = &self.text[start..end];
        self.pos = end;
        parse_item(item, self.input)
    }
}

fn parse_item(item: &str, input: &str) -> Result<Filter> {
    let Some(op_at) = item.find(['=', '~', '<', '>', ':']) else {
        return Err(FilterError::parse("missing filter operator", item, input));
    };
    let op = item.as_bytes()[op_at];
    if op == b':' {
        return parse_extensible(item, input);
    }

    let attribute = &item[..op_at];
    validate_attribute(attribute, item, input)?;
    let attribute = attribute.to_lowercase();

    let value_at = match op {
        b'=' => op_at + 1,
        _ => {
            if item.as_bytes().get(op_at + 1) != Some(&b'=') {
                return Err(FilterError::parse("invalid filter operator", item, input));
            }
            op_at + 2
        }
    };
    let raw = &item[value_at..];

    match op {
        b'=' => {
            if raw.bytes().all(|b| b == b'*') {
                // `*`, `**`, ...: no fragments to match
                Ok(Filter::Presence { attribute })
            } else if raw.contains('*') {
                parse_substring(attribute, raw, input)
            } else {
                Ok(Filter::Equality {
                    attribute,
                    value: unescape(raw, input)?,
                })
            }
        }
        b'~' => Ok(Filter::Approximate {
            attribute,
            value: unescape(raw, input)?,
        }),
        b'>' => Ok(Filter::GreaterOrEqual {
            attribute,
            value: unescape(raw, input)?,
        }),
        _ => Ok(Filter::LessOrEqual {
            attribute,
            value: unescape(raw, input)?,
        }),
    }
}

fn validate_attribute(attribute: &str, item: &str, input: &str) -> Result<()> {
    let valid = !attribute.is_empty()
        && attribute
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b';' || b == b'_');
    if valid {
        Ok(())
    } else {
        Err(FilterError::parse("invalid attribute name", item, input))
    }
}

fn parse_substring(attribute: String, raw: &str, input: &str) -> Result<Filter> {
    let parts: Vec<&str> = raw.split('*').collect();
    let last = parts.len() - 1;
    let mut initial = None;
    let mut any = Vec::new();
    let mut final_value = None;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        let value = unescape(part, input)?;
        if i == 0 {
            initial = Some(value);
        } else if i == last {
            final_value = Some(value);
        } else {
            any.push(value);
        }
    }
    Ok(Filter::Substring {
        attribute,
        initial,
        any,
        final_value,
    })
}

/// `attr[:dn][:rule]:=value`, `[:dn]:rule:=value`.
fn parse_extensible(item: &str, input: &str) -> Result<Filter> {
    let Some(assign) = item.find(":=") else {
        return Err(FilterError::parse("missing ':=' in extensible match", item, input));
    };
    let value = unescape(&item[assign + 2..], input)?;
    let mut tokens = item[..assign].split(':');

    let attribute = match tokens.next() {
        Some("") | None => None,
        Some(a) => {
            validate_attribute(a, item, input)?;
            Some(a.to_lowercase())
        }
    };
    let mut dn_attributes = false;
    let mut rule = None;
    for token in tokens {
        if token.eq_ignore_ascii_case("dn") && rule.is_none() && !dn_attributes {
            dn_attributes = true;
        } else if token.is_empty() || rule.is_some() {
            return Err(FilterError::parse("invalid extensible match", item, input));
        } else {
            rule = Some(token.to_string());
        }
    }
    if attribute.is_none() && rule.is_none() {
        return Err(FilterError::parse(
            "extensible match needs an attribute or a matching rule",
            item,
            input,
        ));
    }
    Ok(Filter::Extensible {
        rule,
        attribute,
        value,
        dn_attributes,
    })
}

/// Decode `\XX` hex escapes. Any other backslash use is an error.
pub(crate) fn unescape(raw: &str, input: &str) -> Result<Vec<u8>> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            let hex = bytes
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok());
            match hex {
                Some(b) => out.push(b),
                None => {
                    let end = (i + 3).min(bytes.len());
                    let offending = String::from_utf8_lossy(&bytes[i..end]);
                    return Err(FilterError::parse("invalid escape sequence", &offending, input));
                }
            }
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    Ok(out)
}
