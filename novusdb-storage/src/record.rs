//! Record slot layout inside a data page, and the per-record compression
//! helper used by the Pager's insert path.

use crate::page::{Page, PAGE_HEADER_SIZE, PAGE_SIZE};

pub const FLAG_ACTIVE: u8 = 0x00;
pub const FLAG_DELETED: u8 = 0x01;
pub const FLAG_OVERFLOW: u8 = 0x02;
pub const FLAG_DELETED_OVERFLOW: u8 = 0x03;
pub const FLAG_COMPRESSED: u8 = 0x04;
pub const FLAG_COMPRESSED_OVERFLOW: u8 = 0x06;

pub const SLOT_HEADER_LEN: usize = 8 + 2 + 1; // record_id + data_len + flags
pub const OVERFLOW_SLOT_PAYLOAD_LEN: usize = 8; // total_len:u32 + first_overflow_page:u32

/// Sufficient to fetch a record in O(1) page reads: which page, and which
/// slot offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLocation {
    pub record_id: u64,
    pub page_id: u32,
    pub slot_offset: u16,
}

pub const RECORD_LOCATION_LEN: usize = 8 + 4 + 2;

impl RecordLocation {
    pub fn encode(&self) -> [u8; RECORD_LOCATION_LEN] {
        let mut out = [0u8; RECORD_LOCATION_LEN];
        out[0..8].copy_from_slice(&self.record_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.page_id.to_le_bytes());
        out[12..14].copy_from_slice(&self.slot_offset.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            record_id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            page_id: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            slot_offset: u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
        }
    }
}

pub fn is_overflow(flags: u8) -> bool {
    matches!(flags, FLAG_OVERFLOW | FLAG_DELETED_OVERFLOW | FLAG_COMPRESSED_OVERFLOW)
}

pub fn is_deleted(flags: u8) -> bool {
    matches!(flags, FLAG_DELETED | FLAG_DELETED_OVERFLOW)
}

pub fn is_compressed(flags: u8) -> bool {
    matches!(flags, FLAG_COMPRESSED | FLAG_COMPRESSED_OVERFLOW)
}

pub fn deleted_variant_of(flags: u8) -> u8 {
    if is_overflow(flags) {
        FLAG_DELETED_OVERFLOW
    } else {
        FLAG_DELETED
    }
}

/// One decoded slot: its byte offset within the page body plus its header
/// fields. `payload` is the raw bytes following the slot header (either the
/// record bytes directly, or `(total_len, first_overflow_page)` when the
/// overflow flag is set).
#[derive(Debug, Clone)]
pub struct SlotView {
    pub offset: u16,
    pub record_id: u64,
    pub data_len: u16,
    pub flags: u8,
    pub payload_start: usize,
}

/// Iterates the slots physically present in a data page (deleted or not).
pub fn iter_slots(page: &Page) -> Vec<SlotView> {
    let mut slots = Vec::new();
    let mut off = PAGE_HEADER_SIZE;
    let end = page.free_space_offset() as usize;
    while off + SLOT_HEADER_LEN <= end {
        let record_id = u64::from_le_bytes(page.buf[off..off + 8].try_into().unwrap());
        let data_len = u16::from_le_bytes(page.buf[off + 8..off + 10].try_into().unwrap());
        let flags = page.buf[off + 10];
        let payload_start = off + SLOT_HEADER_LEN;
        slots.push(SlotView {
            offset: off as u16,
            record_id,
            data_len,
            flags,
            payload_start,
        });
        off = payload_start + data_len as usize;
    }
    slots
}

pub fn slot_payload<'a>(page: &'a Page, slot: &SlotView) -> &'a [u8] {
    &page.buf[slot.payload_start..slot.payload_start + slot.data_len as usize]
}

/// Appends a new slot at the page's current free-space offset. Caller must
/// have already verified `required_len(bytes.len()) <= page.free_space()`.
pub fn append_slot(page: &mut Page, record_id: u64, bytes: &[u8], flags: u8) -> u16 {
    let off = page.free_space_offset() as usize;
    page.buf[off..off + 8].copy_from_slice(&record_id.to_le_bytes());
    page.buf[off + 8..off + 10].copy_from_slice(&(bytes.len() as u16).to_le_bytes());
    page.buf[off + 10] = flags;
    let payload_start = off + SLOT_HEADER_LEN;
    page.buf[payload_start..payload_start + bytes.len()].copy_from_slice(bytes);
    page.set_free_space_offset((payload_start + bytes.len()) as u16);
    page.set_num_records(page.num_records() + 1);
    off as u16
}

pub fn required_len(payload_len: usize) -> usize {
    SLOT_HEADER_LEN + payload_len
}

pub fn set_flags_at(page: &mut Page, slot_offset: u16, flags: u8) {
    page.buf[slot_offset as usize + 10] = flags;
}

pub fn overwrite_payload_at(page: &mut Page, slot_offset: u16, bytes: &[u8]) {
    let payload_start = slot_offset as usize + SLOT_HEADER_LEN;
    page.buf[payload_start..payload_start + bytes.len()].copy_from_slice(bytes);
}

pub fn encode_overflow_payload(total_len: u32, first_overflow_page: u32) -> [u8; OVERFLOW_SLOT_PAYLOAD_LEN] {
    let mut out = [0u8; OVERFLOW_SLOT_PAYLOAD_LEN];
    out[0..4].copy_from_slice(&total_len.to_le_bytes());
    out[4..8].copy_from_slice(&first_overflow_page.to_le_bytes());
    out
}

pub fn decode_overflow_payload(bytes: &[u8]) -> (u32, u32) {
    let total_len = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    let first_overflow_page = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    (total_len, first_overflow_page)
}

pub const OVERFLOW_PAYLOAD_PER_PAGE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Attempts snappy-compression. Returns `Some(compressed)` only if it is
/// strictly smaller than the input, per the Pager's `insert_record` contract.
pub fn try_compress(bytes: &[u8]) -> Option<Vec<u8>> {
    let mut encoder = snap::raw::Encoder::new();
    match encoder.compress_vec(bytes) {
        Ok(compressed) if compressed.len() < bytes.len() => Some(compressed),
        _ => None,
    }
}

pub fn decompress(bytes: &[u8]) -> crate::error::Result<Vec<u8>> {
    let mut decoder = snap::raw::Decoder::new();
    decoder
        .decompress_vec(bytes)
        .map_err(|_| crate::error::Error::CorruptRecord {
            page_id: 0,
            slot_offset: 0,
            reason: "snappy decompression failed",
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_iterate_slots_roundtrip() {
        let mut page = Page::zeroed(crate::page::PAGE_TYPE_DATA, 2);
        let off1 = append_slot(&mut page, 1, b"hello", FLAG_ACTIVE);
        let off2 = append_slot(&mut page, 2, b"world!!", FLAG_ACTIVE);

        let slots = iter_slots(&page);
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].offset, off1);
        assert_eq!(slots[1].offset, off2);
        assert_eq!(slot_payload(&page, &slots[0]), b"hello");
        assert_eq!(slot_payload(&page, &slots[1]), b"world!!");
    }

    #[test]
    fn compression_rejected_when_not_smaller() {
        // Random-looking short input rarely compresses smaller than itself.
        let bytes = b"x";
        assert!(try_compress(bytes).is_none());
    }

    #[test]
    fn compression_roundtrip_for_repetitive_data() {
        let bytes = vec![b'a'; 4096];
        let compressed = try_compress(&bytes).expect("should compress smaller");
        assert!(compressed.len() < bytes.len());
        let decompressed = decompress(&compressed).unwrap();
        assert_eq!(decompressed, bytes);
    }
}
