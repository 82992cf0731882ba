//! BER-TLV helpers
//!
//! Structured templates (dynamic authentication, admin data, metadata) go
//! through `iso7816_tlv`. Several PIV wrapper tags (`AA`, `AB`, `70`, `71`,
//! `FE`) carry the BER "constructed" bit while holding plain bytes, so the
//! outer object framing is read and written with the raw helpers below.

use iso7816_tlv::ber::{Tag, Tlv, Value};

use crate::constants::tags;
use crate::{Error, Result};

/// Parse every TLV in `data`, failing on trailing garbage
pub(crate) fn parse_all(data: &[u8]) -> Result<Vec<Tlv>> {
    let mut tlvs = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let (tlv, remaining) = Tlv::parse(rest);
        tlvs.push(tlv?);
        rest = remaining;
    }
    Ok(tlvs)
}

/// Value of the first primitive TLV tagged `tag`
pub(crate) fn find_primitive(tlvs: &[Tlv], tag: u8) -> Result<Option<&[u8]>> {
    let tag = Tag::try_from(tag)?;
    match tlvs.iter().find(|tlv| tlv.tag() == &tag).map(Tlv::value) {
        None => Ok(None),
        Some(Value::Primitive(bytes)) => Ok(Some(bytes.as_slice())),
        Some(Value::Constructed(_)) => Err(Error::ProtocolViolation("expected primitive TLV")),
    }
}

/// Children of a constructed TLV
pub(crate) fn constructed_children(tlv: &Tlv) -> Result<&[Tlv]> {
    match tlv.value() {
        Value::Constructed(children) => Ok(children),
        Value::Primitive(_) => Err(Error::ProtocolViolation("expected constructed TLV")),
    }
}

pub(crate) fn primitive(tag: u8, value: impl Into<Vec<u8>>) -> Result<Tlv> {
    Ok(Tlv::new(Tag::try_from(tag)?, Value::Primitive(value.into()))?)
}

pub(crate) fn constructed(tag: u8, children: Vec<Tlv>) -> Result<Tlv> {
    Ok(Tlv::new(Tag::try_from(tag)?, Value::Constructed(children))?)
}

/// Concatenated encodings, for primitive templates that nest other TLVs
pub(crate) fn concat(tlvs: &[Tlv]) -> Vec<u8> {
    tlvs.iter().flat_map(Tlv::to_vec).collect()
}

/// Append a BER length
pub(crate) fn write_length(out: &mut Vec<u8>, len: usize) {
    match len {
        0..=0x7F => out.push(len as u8),
        0x80..=0xFF => out.extend_from_slice(&[0x81, len as u8]),
        0x100..=0xFFFF => out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]),
        _ => out.extend_from_slice(&[0x83, (len >> 16) as u8, (len >> 8) as u8, len as u8]),
    }
}

/// Append `tag || length || value` without interpreting the tag
pub(crate) fn write(out: &mut Vec<u8>, tag: &[u8], value: &[u8]) {
    out.extend_from_slice(tag);
    write_length(out, value.len());
    out.extend_from_slice(value);
}

/// Tag and length header of the first TLV in `data`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) tag_len: usize,
    pub(crate) header_len: usize,
    pub(crate) value_len: usize,
}

impl Header {
    /// Encoded size of the whole TLV
    pub(crate) const fn total_len(&self) -> usize {
        self.header_len + self.value_len
    }
}

/// Decode the header of the first TLV, `None` if `data` ends inside it
pub(crate) fn read_header(data: &[u8]) -> Result<Option<Header>> {
    let Some(&first) = data.first() else {
        return Ok(None);
    };

    let mut tag_len = 1;
    if first & 0x1F == 0x1F {
        loop {
            let Some(&byte) = data.get(tag_len) else {
                return Ok(None);
            };
            tag_len += 1;
            if byte & 0x80 == 0 {
                break;
            }
            if tag_len > 3 {
                return Err(Error::ProtocolViolation("tag longer than three bytes"));
            }
        }
    }

    let Some(&length) = data.get(tag_len) else {
        return Ok(None);
    };
    let (value_len, length_len) = match length {
        0x00..=0x7F => (length as usize, 1),
        0x81..=0x83 => {
            let count = (length & 0x7F) as usize;
            let Some(bytes) = data.get(tag_len + 1..tag_len + 1 + count) else {
                return Ok(None);
            };
            let value_len = bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
            (value_len, 1 + count)
        }
        _ => return Err(Error::ProtocolViolation("unsupported BER length")),
    };

    Ok(Some(Header {
        tag_len,
        header_len: tag_len + length_len,
        value_len,
    }))
}

/// Split the first TLV off `data` into `(tag, value, rest)`
pub(crate) fn split(data: &[u8]) -> Result<(&[u8], &[u8], &[u8])> {
    let header = read_header(data)?.ok_or(Error::ProtocolViolation("truncated TLV header"))?;
    if data.len() < header.total_len() {
        return Err(Error::ProtocolViolation("truncated TLV value"));
    }
    let (tlv, rest) = data.split_at(header.total_len());
    Ok((&tlv[..header.tag_len], &tlv[header.header_len..], rest))
}

/// Unwrap a single TLV with the expected tag, rejecting trailing bytes
pub(crate) fn unwrap_exact<'a>(data: &'a [u8], tag: &[u8]) -> Result<&'a [u8]> {
    let (found, value, rest) = split(data)?;
    if found != tag {
        return Err(Error::ProtocolViolation("unexpected TLV tag"));
    }
    if !rest.is_empty() {
        return Err(Error::ProtocolViolation("trailing bytes after TLV"));
    }
    Ok(value)
}

/// Encode a dynamic authentication template (`7C`)
pub(crate) fn dynamic_auth(children: Vec<Tlv>) -> Result<Vec<u8>> {
    Ok(constructed(tags::DYNAMIC_AUTH, children)?.to_vec())
}

/// Value of `tag` inside the dynamic authentication template of a reply
pub(crate) fn dynamic_auth_item(payload: &[u8], tag: u8) -> Result<Vec<u8>> {
    let dynamic_auth = Tag::try_from(tags::DYNAMIC_AUTH)?;
    let tlvs = parse_all(payload)?;
    let template = tlvs
        .iter()
        .find(|tlv| tlv.tag() == &dynamic_auth)
        .ok_or(Error::ProtocolViolation("reply is not a dynamic authentication template"))?;
    find_primitive(constructed_children(template)?, tag)?
        .map(<[u8]>::to_vec)
        .ok_or(Error::ProtocolViolation("dynamic authentication template lacks the expected item"))
}
