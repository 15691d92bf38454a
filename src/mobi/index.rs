//! INDX record decoding: the variable-width, bit-masked tag encoding
//! used for every structural lookup table in the container (NCX,
//! skeleton, fragment, guide, orthographic dictionary, inflections).
//!
//! An index is a chain of records: a main INDX record carrying the TAGX
//! schema, `count` data records each with an IDXT offset table, then
//! CNCX string records. Entries are a length-prefixed name followed by
//! control bytes and variable-width values laid out per the TAGX rows.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::mobi::NULL_INDEX;
use crate::pdb::Sectionizer;

pub type TagMap = HashMap<u8, Vec<u64>>;

/// Forward variable-width integer: 7 bits per byte, big-endian, high bit
/// terminates. Returns `(consumed, value)`.
pub fn get_variable_width_value(data: &[u8], offset: usize) -> (usize, u64) {
    let mut value = 0u64;
    let mut consumed = 0;
    while offset + consumed < data.len() {
        let byte = data[offset + consumed];
        consumed += 1;
        value = (value << 7) | (byte & 0x7F) as u64;
        if byte & 0x80 != 0 {
            break;
        }
    }
    (consumed, value)
}

/// One TAGX row: `(tag, values_per_entry, bitmask, end_flag)`. An
/// end-flag row closes a control-byte group instead of describing a tag.
#[derive(Debug, Clone, Copy)]
pub struct TagxEntry {
    pub tag: u8,
    pub values_per_entry: u8,
    pub mask: u8,
    pub end_flag: u8,
}

/// Parse the TAGX region at `start`. Returns the control byte count and
/// the tag table; both empty when the magic is missing.
pub fn read_tag_section(start: usize, data: &[u8]) -> (usize, Vec<TagxEntry>) {
    let mut tags = Vec::new();
    if start + 12 > data.len() || &data[start..start + 4] != b"TAGX" {
        return (0, tags);
    }
    let first_entry_offset =
        u32::from_be_bytes([data[start + 4], data[start + 5], data[start + 6], data[start + 7]])
            as usize;
    let control_byte_count =
        u32::from_be_bytes([data[start + 8], data[start + 9], data[start + 10], data[start + 11]])
            as usize;

    let mut i = 12;
    while i + 4 <= first_entry_offset && start + i + 4 <= data.len() {
        let pos = start + i;
        tags.push(TagxEntry {
            tag: data[pos],
            values_per_entry: data[pos + 1],
            mask: data[pos + 2],
            end_flag: data[pos + 3],
        });
        i += 4;
    }
    (control_byte_count, tags)
}

/// Decode one entry's tag values against a TAGX table.
///
/// For each non-endflag row, mask the row's control byte. A result equal
/// to the full mask (when the mask has more than one set bit) means a
/// variable-width *byte length* of values follows; otherwise the shifted
/// masked value is a *count* of `values_per_entry`-sized value groups.
pub fn get_tag_map(
    control_byte_count: usize,
    table: &[TagxEntry],
    data: &[u8],
    start: usize,
    end: Option<usize>,
) -> TagMap {
    struct Pending {
        tag: u8,
        value_count: Option<u64>,
        value_bytes: Option<u64>,
        values_per_entry: u8,
    }

    let mut tag_map = TagMap::new();
    let mut control_index = 0;
    let mut data_start = start + control_byte_count;
    let mut pending = Vec::new();

    for row in table {
        if row.end_flag == 0x01 {
            control_index += 1;
            continue;
        }
        let Some(&cbyte) = data.get(start + control_index) else {
            break;
        };
        let value = cbyte & row.mask;
        if value == 0 {
            continue;
        }
        if value == row.mask {
            if row.mask.count_ones() > 1 {
                // variable-width byte length of the following values
                let (consumed, bytes) = get_variable_width_value(data, data_start);
                data_start += consumed;
                pending.push(Pending {
                    tag: row.tag,
                    value_count: None,
                    value_bytes: Some(bytes),
                    values_per_entry: row.values_per_entry,
                });
            } else {
                pending.push(Pending {
                    tag: row.tag,
                    value_count: Some(1),
                    value_bytes: None,
                    values_per_entry: row.values_per_entry,
                });
            }
        } else {
            let mut mask = row.mask;
            let mut shifted = value;
            while mask & 0x01 == 0 {
                mask >>= 1;
                shifted >>= 1;
            }
            pending.push(Pending {
                tag: row.tag,
                value_count: Some(shifted as u64),
                value_bytes: None,
                values_per_entry: row.values_per_entry,
            });
        }
    }

    for p in pending {
        let mut values = Vec::new();
        if let Some(count) = p.value_count {
            for _ in 0..count.saturating_mul(p.values_per_entry as u64) {
                if data_start >= data.len() {
                    break;
                }
                let (consumed, value) = get_variable_width_value(data, data_start);
                data_start += consumed;
                values.push(value);
            }
        } else if let Some(bytes) = p.value_bytes {
            let mut total = 0usize;
            while (total as u64) < bytes && data_start < data.len() {
                let (consumed, value) = get_variable_width_value(data, data_start);
                data_start += consumed;
                total += consumed;
                values.push(value);
            }
            if total as u64 != bytes {
                log::warn!("index entry should consume {bytes} value bytes, consumed {total}");
            }
        }
        tag_map.insert(p.tag, values);
    }

    // trailing zero padding is fine; anything else means a decode bug
    if let Some(end) = end
        && data_start < end
        && data[data_start..end.min(data.len())].iter().any(|&b| b != 0)
    {
        log::warn!(
            "unprocessed index bytes left: {:02x?}",
            &data[data_start..end.min(data.len())]
        );
    }

    tag_map
}

/// Parsed INDX record header. Field names follow the on-disk order; the
/// header length doubles as the TAGX offset in main records.
#[derive(Debug, Default)]
pub struct IndxHeader {
    pub len: u32,
    pub typ: u32,
    pub idxt_start: u32,
    pub count: u32,
    pub code: u32,
    pub lng: u32,
    pub total: u32,
    pub ordt: u32,
    pub ligt: u32,
    pub nligt: u32,
    pub nctoc: u32,
    pub otype: u32,
    pub oentries: u32,
}

/// ORDT translation tables for codepage-65002 entry names. ORDT1 holds
/// one-byte values, ORDT2 two-byte values; only ORDT2 is consulted.
#[derive(Debug)]
pub struct OrdtTables {
    pub otype: u32,
    pub ordt1: Vec<u8>,
    pub ordt2: Vec<u16>,
}

pub fn parse_indx_header(data: &[u8]) -> Result<(IndxHeader, Option<OrdtTables>)> {
    if data.len() < 56 || &data[0..4] != b"INDX" {
        return Err(Error::InvalidFormat("index record is not INDX".into()));
    }
    let u32_at = |pos: usize| -> u32 {
        u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
    };

    let header = IndxHeader {
        len: u32_at(4),
        typ: u32_at(12),
        idxt_start: u32_at(20),
        count: u32_at(24),
        code: u32_at(28),
        lng: u32_at(32),
        total: u32_at(36),
        ordt: u32_at(40),
        ligt: u32_at(44),
        nligt: u32_at(48),
        nctoc: u32_at(52),
        otype: if data.len() >= 0xA8 { u32_at(0xA4) } else { 0 },
        oentries: if data.len() >= 0xAC { u32_at(0xA8) } else { 0 },
    };

    // codepage-65002 dictionaries hide two ORDT tables after the header
    // without declaring them in the regular fields
    let ordt = if (header.code == 0xFDEA || header.oentries > 0) && data.len() >= 0xB4 {
        let op1 = u32_at(0xAC) as usize;
        let op2 = u32_at(0xB0) as usize;
        let n = header.oentries as usize;
        if data.len() >= op1 + 4 + n
            && data.len() >= op2 + 4 + 2 * n
            && &data[op1..op1 + 4] == b"ORDT"
            && &data[op2..op2 + 4] == b"ORDT"
        {
            let ordt1 = data[op1 + 4..op1 + 4 + n].to_vec();
            let ordt2 = (0..n)
                .map(|i| u16::from_be_bytes([data[op2 + 4 + 2 * i], data[op2 + 4 + 2 * i + 1]]))
                .collect();
            Some(OrdtTables { otype: header.otype, ordt1, ordt2 })
        } else {
            log::warn!("index declares ORDT tables but their magic is missing");
            None
        }
    } else {
        None
    };

    Ok((header, ordt))
}

/// Read the IDXT entry-offset table of a data record. Returns the entry
/// start positions plus the IDXT position itself as the final sentinel.
pub fn read_idxt_positions(data: &[u8], header: &IndxHeader) -> Vec<usize> {
    let idxt = header.idxt_start as usize;
    let mut positions = Vec::with_capacity(header.count as usize + 1);
    if idxt + 4 > data.len() || &data[idxt..idxt + 4] != b"IDXT" {
        log::warn!("index data record has no IDXT table");
        return positions;
    }
    for j in 0..header.count as usize {
        let off = idxt + 4 + 2 * j;
        if off + 2 > data.len() {
            break;
        }
        positions.push(u16::from_be_bytes([data[off], data[off + 1]]) as usize);
    }
    positions.push(idxt);
    positions
}

/// One decoded index entry: the length-prefixed name plus its tag map.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub text: Vec<u8>,
    pub tags: TagMap,
}

impl IndexEntry {
    pub fn tag_first(&self, tag: u8) -> Option<u64> {
        self.tags.get(&tag).and_then(|v| v.first()).copied()
    }

    pub fn tag_pair(&self, tag: u8) -> Option<(u64, u64)> {
        let values = self.tags.get(&tag)?;
        Some((*values.first()?, *values.get(1)?))
    }
}

/// CNCX string table: offsets (plus `0x10000 * record`) to raw bytes.
pub type Cncx = HashMap<u32, Vec<u8>>;

fn read_cncx_record(data: &[u8]) -> Vec<(u32, Vec<u8>)> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() && data[offset] != 0 {
        let start = offset;
        let (consumed, len) = get_variable_width_value(data, offset);
        offset += consumed;
        let end = (offset + len as usize).min(data.len());
        out.push((start as u32, data[offset..end].to_vec()));
        offset = end;
    }
    out
}

/// Read a complete index chain rooted at record `idx`.
///
/// Returns the decoded entries in IDXT order and the CNCX string table.
/// A `NULL_INDEX` root yields empty results.
pub fn read_index(sect: &Sectionizer, idx: u32, label: &str) -> Result<(Vec<IndexEntry>, Cncx)> {
    let mut entries = Vec::new();
    let mut cncx = Cncx::new();
    if idx == NULL_INDEX {
        return Ok((entries, cncx));
    }
    let idx = idx as usize;

    sect.set_section_description(idx, format!("{label} Main INDX section"));
    let data = sect.section_checked(idx)?;
    let (header, ordt) = parse_indx_header(data)?;

    let cncx_start = idx + header.count as usize + 1;
    for j in 0..header.nctoc as usize {
        let record = sect.section_checked(cncx_start + j)?;
        sect.set_section_description(cncx_start + j, format!("{label} CNCX Data {j}"));
        for (offset, text) in read_cncx_record(record) {
            cncx.insert(offset + (j as u32) * 0x10000, text);
        }
    }

    let (control_byte_count, table) = read_tag_section(header.len as usize, data);

    for i in (idx + 1)..=(idx + header.count as usize) {
        sect.set_section_description(i, format!("{label} Extra {} INDX section", i - idx));
        let data = sect.section_checked(i)?;
        let (rec_header, _) = parse_indx_header(data)?;
        let positions = read_idxt_positions(data, &rec_header);

        for j in 0..positions.len().saturating_sub(1) {
            let start = positions[j];
            let end = positions[j + 1];
            if start >= end || start >= data.len() {
                continue;
            }
            let text_len = data[start] as usize;
            let text_end = (start + 1 + text_len).min(end);
            let mut text = data[start + 1..text_end].to_vec();
            if let Some(ordt) = &ordt {
                for b in &mut text {
                    if let Some(&mapped) = ordt.ordt2.get(*b as usize) {
                        *b = mapped as u8;
                    }
                }
            }
            let tags = get_tag_map(control_byte_count, &table, data, text_end, Some(end));
            entries.push(IndexEntry { text, tags });
        }
    }

    Ok((entries, cncx))
}
