use anyhow::{bail, Result};

/// Highest protocol version the collection server understands.
pub const MAX_PROTOCOL_VERSION: u32 = 5;
/// Oldest protocol version still accepted on ingress.
pub const MIN_PROTOCOL_VERSION: u32 = 1;
/// Version the client emits.
pub const PROTOCOL_VERSION: u32 = 5;
/// Schema redefinition over stream 0 became legal with this version.
pub const SCHEMA0_MIN_VERSION: u32 = 4;

/// Session header keys. Legacy spellings are folded into their canonical tag
/// on input; output always uses the canonical name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderTag {
    Encapsulation,
    Protocol,
    Domain,
    StartTime,
    SenderId,
    AppName,
    Schema,
    Content,
}

impl HeaderTag {
    pub fn name(&self) -> &'static str {
        match self {
            HeaderTag::Encapsulation => "encapsulation",
            HeaderTag::Protocol => "protocol",
            HeaderTag::Domain => "domain",
            HeaderTag::StartTime => "start-time",
            HeaderTag::SenderId => "sender-id",
            HeaderTag::AppName => "app-name",
            HeaderTag::Schema => "schema",
            HeaderTag::Content => "content",
        }
    }

    pub fn from_name(s: &str) -> Option<HeaderTag> {
        Some(match s {
            "encapsulation" => HeaderTag::Encapsulation,
            "protocol" => HeaderTag::Protocol,
            "domain" | "experiment-id" => HeaderTag::Domain,
            "start-time" | "start_time" => HeaderTag::StartTime,
            "sender-id" => HeaderTag::SenderId,
            "app-name" => HeaderTag::AppName,
            "schema" => HeaderTag::Schema,
            "content" => HeaderTag::Content,
            _ => return None,
        })
    }
}

/// Parse one `key: value` header line (without the trailing newline).
///
/// Whitespace around the colon is stripped from the value; trailing
/// whitespace is chomped. An unknown key yields `Ok(None)` so the caller can
/// warn and move on; a line without a colon is a protocol error.
pub fn parse_header_line(line: &str) -> Result<Option<(HeaderTag, String)>> {
    let colon = match line.find(':') {
        Some(i) => i,
        None => bail!("malformed header line: <{}>", line),
    };
    let key = line[..colon].trim_end();
    let value = line[colon + 1..].trim();
    match HeaderTag::from_name(key) {
        Some(tag) => Ok(Some((tag, value.to_string()))),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_keys() {
        assert_eq!(
            parse_header_line("protocol: 5").unwrap(),
            Some((HeaderTag::Protocol, "5".to_string()))
        );
        assert_eq!(
            parse_header_line("content: binary").unwrap(),
            Some((HeaderTag::Content, "binary".to_string()))
        );
    }

    #[test]
    fn legacy_aliases_fold_to_canonical() {
        assert_eq!(
            parse_header_line("experiment-id: exv3").unwrap(),
            Some((HeaderTag::Domain, "exv3".to_string()))
        );
        assert_eq!(
            parse_header_line("start_time: 1281591603").unwrap(),
            Some((HeaderTag::StartTime, "1281591603".to_string()))
        );
    }

    #[test]
    fn value_keeps_inner_spaces() {
        assert_eq!(
            parse_header_line("schema:  1 t1 size:uint32 ").unwrap(),
            Some((HeaderTag::Schema, "1 t1 size:uint32".to_string()))
        );
    }

    #[test]
    fn unknown_key_is_ignored() {
        assert_eq!(parse_header_line("x-priority: 7").unwrap(), None);
    }

    #[test]
    fn missing_colon_is_an_error() {
        assert!(parse_header_line("protocol 5").is_err());
    }
}
