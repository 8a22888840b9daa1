// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record decoder: turns one fixed-size segment slot into a [`RawRecord`].
//!
//! Slot layout (little-endian):
//!
//! ```text
//! 0       4     5        6          8      12
//! +-------+-----+--------+----------+------+-------------------+
//! | len   | tag | marker | reserved | vxid | payload (len) ... |
//! +-------+-----+--------+----------+------+-------------------+
//! ```
//!
//! Decoding is a pure function over the slot bytes and never panics.

use std::borrow::Cow;

use crate::errors::DecodeError;

/// Bytes in front of the payload in every slot.
pub const SLOT_HEADER_BYTES: usize = 12;

const END_OF_DATA: u8 = 0;

/// Record tags, numbered as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Begin = 1,
    End = 2,
    ReqStart = 3,
    ReqMethod = 4,
    ReqUrl = 5,
    ReqProtocol = 6,
    ReqHeader = 7,
    RespStatus = 8,
    RespHeader = 9,
    Timestamp = 10,
    ReqAcct = 11,
    BereqMethod = 12,
    BereqUrl = 13,
    BereqHeader = 14,
    BerespStatus = 15,
    BerespHeader = 16,
    BereqAcct = 17,
    Link = 18,
    Hit = 19,
    ObjHeader = 20,
    Length = 21,
    VclCall = 22,
    FetchError = 23,
}

impl Tag {
    /// Name as printed by `varnishlog`.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Begin => "Begin",
            Tag::End => "End",
            Tag::ReqStart => "ReqStart",
            Tag::ReqMethod => "ReqMethod",
            Tag::ReqUrl => "ReqURL",
            Tag::ReqProtocol => "ReqProtocol",
            Tag::ReqHeader => "ReqHeader",
            Tag::RespStatus => "RespStatus",
            Tag::RespHeader => "RespHeader",
            Tag::Timestamp => "Timestamp",
            Tag::ReqAcct => "ReqAcct",
            Tag::BereqMethod => "BereqMethod",
            Tag::BereqUrl => "BereqURL",
            Tag::BereqHeader => "BereqHeader",
            Tag::BerespStatus => "BerespStatus",
            Tag::BerespHeader => "BerespHeader",
            Tag::BereqAcct => "BereqAcct",
            Tag::Link => "Link",
            Tag::Hit => "Hit",
            Tag::ObjHeader => "ObjHeader",
            Tag::Length => "Length",
            Tag::VclCall => "VCL_call",
            Tag::FetchError => "FetchError",
        }
    }
}

impl TryFrom<u8> for Tag {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let tag = match value {
            1 => Tag::Begin,
            2 => Tag::End,
            3 => Tag::ReqStart,
            4 => Tag::ReqMethod,
            5 => Tag::ReqUrl,
            6 => Tag::ReqProtocol,
            7 => Tag::ReqHeader,
            8 => Tag::RespStatus,
            9 => Tag::RespHeader,
            10 => Tag::Timestamp,
            11 => Tag::ReqAcct,
            12 => Tag::BereqMethod,
            13 => Tag::BereqUrl,
            14 => Tag::BereqHeader,
            15 => Tag::BerespStatus,
            16 => Tag::BerespHeader,
            17 => Tag::BereqAcct,
            18 => Tag::Link,
            19 => Tag::Hit,
            20 => Tag::ObjHeader,
            21 => Tag::Length,
            22 => Tag::VclCall,
            23 => Tag::FetchError,
            other => return Err(DecodeError::UnknownTag(other)),
        };
        Ok(tag)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of varnishd wrote the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Marker {
    Client,
    Backend,
    /// Session and other records outside a request.
    Session,
}

impl Marker {
    #[must_use]
    pub fn as_byte(&self) -> u8 {
        match self {
            Marker::Client => b'c',
            Marker::Backend => b'b',
            Marker::Session => b'-',
        }
    }
}

impl TryFrom<u8> for Marker {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'c' => Ok(Marker::Client),
            b'b' => Ok(Marker::Backend),
            b'-' => Ok(Marker::Session),
            other => Err(DecodeError::UnknownMarker(other)),
        }
    }
}

/// One decoded slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub tag: Tag,
    pub marker: Marker,
    pub vxid: u32,
    pub payload: Vec<u8>,
}

impl RawRecord {
    #[must_use]
    pub fn new(marker: Marker, tag: Tag, vxid: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            marker,
            vxid,
            payload: payload.into(),
        }
    }

    /// Payload as text, lossily converted and without trailing NULs.
    #[must_use]
    pub fn payload_str(&self) -> Cow<'_, str> {
        let end = self
            .payload
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |pos| pos + 1);
        String::from_utf8_lossy(&self.payload[..end])
    }
}

/// Result of decoding a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Record(RawRecord),
    /// No valid data in this slot yet. The cursor must not advance past it.
    EndOfData,
}

/// Decode one slot.
pub fn decode(slot: &[u8]) -> Result<Decoded, DecodeError> {
    if slot.len() < SLOT_HEADER_BYTES {
        return Err(DecodeError::ShortSlot(slot.len()));
    }

    let tag_byte = slot[4];
    if tag_byte == END_OF_DATA {
        return Ok(Decoded::EndOfData);
    }

    let mut len = [0_u8; 4];
    len.copy_from_slice(&slot[0..4]);
    let declared = u32::from_le_bytes(len) as usize;
    let available = slot.len() - SLOT_HEADER_BYTES;
    if declared > available {
        return Err(DecodeError::Truncated {
            declared,
            available,
        });
    }

    let tag = Tag::try_from(tag_byte)?;
    let marker = Marker::try_from(slot[5])?;

    let mut vxid = [0_u8; 4];
    vxid.copy_from_slice(&slot[8..12]);

    Ok(Decoded::Record(RawRecord {
        tag,
        marker,
        vxid: u32::from_le_bytes(vxid),
        payload: slot[SLOT_HEADER_BYTES..SLOT_HEADER_BYTES + declared].to_vec(),
    }))
}

/// Encode a record into a slot of `slot_size` bytes.
///
/// Payloads longer than the slot capacity are cut, the way varnishd cuts
/// records longer than its configured record length.
#[must_use]
pub fn encode_slot(record: &RawRecord, slot_size: usize) -> Vec<u8> {
    let mut slot = vec![0_u8; slot_size.max(SLOT_HEADER_BYTES)];
    let capacity = slot.len() - SLOT_HEADER_BYTES;
    let len = record.payload.len().min(capacity);
    #[allow(clippy::cast_possible_truncation)]
    slot[0..4].copy_from_slice(&(len as u32).to_le_bytes());
    slot[4] = record.tag as u8;
    slot[5] = record.marker.as_byte();
    slot[8..12].copy_from_slice(&record.vxid.to_le_bytes());
    slot[SLOT_HEADER_BYTES..SLOT_HEADER_BYTES + len].copy_from_slice(&record.payload[..len]);
    slot
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn slot(len: u32, tag: u8, marker: u8, vxid: u32, payload: &[u8], size: usize) -> Vec<u8> {
        let mut bytes = vec![0_u8; size];
        bytes[0..4].copy_from_slice(&len.to_le_bytes());
        bytes[4] = tag;
        bytes[5] = marker;
        bytes[8..12].copy_from_slice(&vxid.to_le_bytes());
        bytes[12..12 + payload.len()].copy_from_slice(payload);
        bytes
    }

    #[test]
    fn test_decode_request_method() {
        let bytes = slot(3, 4, b'c', 1001, b"GET", 64);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(
            decoded,
            Decoded::Record(RawRecord::new(Marker::Client, Tag::ReqMethod, 1001, "GET"))
        );
    }

    #[test]
    fn test_decode_end_of_data() {
        assert_eq!(decode(&[0_u8; 64]).unwrap(), Decoded::EndOfData);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = slot(100, 5, b'c', 1, b"/", 32);
        assert_eq!(
            decode(&bytes).unwrap_err(),
            DecodeError::Truncated {
                declared: 100,
                available: 20
            }
        );
    }

    #[test]
    fn test_decode_unknown_tag_and_marker() {
        let bytes = slot(0, 200, b'c', 1, b"", 32);
        assert_eq!(decode(&bytes).unwrap_err(), DecodeError::UnknownTag(200));

        let bytes = slot(0, 2, b'x', 1, b"", 32);
        assert_eq!(decode(&bytes).unwrap_err(), DecodeError::UnknownMarker(b'x'));
    }

    #[test]
    fn test_decode_short_slot() {
        assert_eq!(decode(&[1, 2, 3]).unwrap_err(), DecodeError::ShortSlot(3));
    }

    #[test]
    fn test_encode_cuts_long_payload() {
        let record = RawRecord::new(Marker::Client, Tag::ReqUrl, 9, vec![b'a'; 100]);
        let bytes = encode_slot(&record, 32);
        assert_eq!(bytes.len(), 32);
        match decode(&bytes).unwrap() {
            Decoded::Record(decoded) => assert_eq!(decoded.payload.len(), 20),
            Decoded::EndOfData => panic!("expected a record"),
        }
    }

    #[test]
    fn test_payload_str_trims_nul() {
        let record = RawRecord::new(Marker::Client, Tag::ReqUrl, 9, b"/a\0\0".to_vec());
        assert_eq!(record.payload_str(), "/a");
    }

    #[test]
    fn test_tag_names() {
        assert_eq!(Tag::ReqUrl.to_string(), "ReqURL");
        assert_eq!(Tag::VclCall.to_string(), "VCL_call");
        for value in 1..=23_u8 {
            assert_eq!(Tag::try_from(value).unwrap() as u8, value);
        }
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
            match decode(&bytes) {
                Ok(Decoded::Record(record)) => {
                    let declared =
                        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
                    prop_assert_eq!(record.payload.len(), declared);
                }
                Ok(Decoded::EndOfData) | Err(_) => {}
            }
        }

        #[test]
        fn decode_accepts_every_encoded_slot(
            tag in 1..=23_u8,
            vxid in any::<u32>(),
            payload in proptest::collection::vec(any::<u8>(), 0..64),
            size in 12_usize..128,
        ) {
            let record =
                RawRecord::new(Marker::Backend, Tag::try_from(tag).unwrap(), vxid, payload);
            let bytes = encode_slot(&record, size);
            match decode(&bytes).unwrap() {
                Decoded::Record(decoded) => {
                    prop_assert_eq!(decoded.vxid, vxid);
                    prop_assert_eq!(decoded.tag as u8, tag);
                    prop_assert!(decoded.payload.len() <= size - SLOT_HEADER_BYTES);
                }
                Decoded::EndOfData => prop_assert!(false, "encoded slot decoded as end of data"),
            }
        }
    }
}
