//! Minimal DNS wire handling for the filter: question-name extraction and
//! NXDOMAIN synthesis. Queries originate on the local host, so compressed
//! question names are refused rather than followed.

pub const HEADER_LEN: usize = 12;
const MAX_LABEL_LEN: usize = 63;
const MAX_NAME_LEN: usize = 253;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsParseError {
    Truncated,
    NoQuestion,
    CompressedName,
    LabelTooLong,
    NameTooLong,
    InvalidLabel,
}

/// Extracts the QNAME of the first question as a dotted lowercase-preserving
/// string. Pointer-bearing (compressed) names are rejected.
#[allow(clippy::missing_errors_doc)]
pub fn parse_question_name(packet: &[u8]) -> Result<String, DnsParseError> {
    if packet.len() < HEADER_LEN {
        return Err(DnsParseError::Truncated);
    }
    let qdcount = u16::from_be_bytes([packet[4], packet[5]]);
    if qdcount == 0 {
        return Err(DnsParseError::NoQuestion);
    }

    let mut name = String::new();
    let mut pos = HEADER_LEN;
    loop {
        let Some(&len_byte) = packet.get(pos) else {
            return Err(DnsParseError::Truncated);
        };
        if len_byte == 0 {
            break;
        }
        if len_byte & 0xC0 != 0 {
            return Err(DnsParseError::CompressedName);
        }
        let len = usize::from(len_byte);
        if len > MAX_LABEL_LEN {
            return Err(DnsParseError::LabelTooLong);
        }
        let Some(label) = packet.get(pos + 1..pos + 1 + len) else {
            return Err(DnsParseError::Truncated);
        };
        if !label
            .iter()
            .all(|b| b.is_ascii_graphic() && *b != b'.' && *b != b' ')
        {
            return Err(DnsParseError::InvalidLabel);
        }
        if !name.is_empty() {
            name.push('.');
        }
        for b in label {
            name.push(char::from(*b));
        }
        if name.len() > MAX_NAME_LEN {
            return Err(DnsParseError::NameTooLong);
        }
        pos += 1 + len;
    }

    if name.is_empty() {
        return Err(DnsParseError::NoQuestion);
    }
    Ok(name)
}

/// A name is allowed iff it equals an allow-domain or is a sub-domain of
/// one. Comparison is case-insensitive; trailing dots are ignored.
pub fn is_allowed(name: &str, allow_domains: &[String]) -> bool {
    let name = name.trim_end_matches('.').to_ascii_lowercase();
    allow_domains.iter().any(|a| {
        let a = a.trim_end_matches('.').to_ascii_lowercase();
        if a.is_empty() {
            return false;
        }
        name == a || name.ends_with(&format!(".{a}"))
    })
}

/// Builds an NXDOMAIN response by copying the query and rewriting the flag
/// bytes to QR=1, RA=1, RCODE=3 (`0x81 0x83`).
pub fn synthesize_nxdomain(query: &[u8]) -> Option<Vec<u8>> {
    if query.len() < HEADER_LEN {
        return None;
    }
    let mut response = query.to_vec();
    response[2] = 0x81;
    response[3] = 0x83;
    Some(response)
}
