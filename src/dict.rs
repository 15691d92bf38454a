//! Mobipocket dictionary support.
//!
//! When the header carries an orthographic index the book is a
//! dictionary: each index entry names a headword and the rawML position
//! where its article starts. Entries may reference inflection groups in
//! a separate index whose rule bytes derive the inflected forms from the
//! headword. Both get injected back into the text as `<idx:entry>`
//! markup so the output stays a usable dictionary source.

use crate::error::Result;
use crate::mobi::headers::{MobiHeader, NULL_INDEX};
use crate::mobi::index::{
    get_tag_map, get_variable_width_value, parse_indx_header, read_idxt_positions,
    read_tag_section, TagxEntry,
};
use crate::mobi6::PositionMap;
use crate::pdb::Sectionizer;

/// The unified inflection dataset: one or more contiguous INDX data
/// records, looked up by a running entry number.
struct InflectionData {
    datas: Vec<Vec<u8>>,
    starts: Vec<usize>,
    counts: Vec<usize>,
}

impl InflectionData {
    fn new(datas: Vec<Vec<u8>>) -> Self {
        let mut starts = Vec::with_capacity(datas.len());
        let mut counts = Vec::with_capacity(datas.len());
        for data in &datas {
            let at = |o: usize| {
                u32::from_be_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]) as usize
            };
            if data.len() >= 0x1C {
                starts.push(at(0x14));
                counts.push(at(0x18));
            } else {
                starts.push(0);
                counts.push(0);
            }
        }
        Self { datas, starts, counts }
    }

    /// Map a global entry number to `(local value, start, data)`.
    fn lookup(&self, value: usize) -> Option<(usize, usize, &[u8])> {
        let mut rvalue = value;
        for (i, &count) in self.counts.iter().enumerate() {
            if rvalue < count {
                return Some((rvalue, self.starts[i], &self.datas[i]));
            }
            rvalue -= count;
        }
        log::warn!("inflection lookup {value} outside all data sections");
        None
    }

    /// Rule-blob offset (and the next entry's offset) for an entry.
    fn offsets(&self, value: usize) -> Option<(usize, Option<usize>, &[u8])> {
        let mut rvalue = value;
        for (i, &count) in self.counts.iter().enumerate() {
            if rvalue < count {
                let data = &self.datas[i];
                let start = self.starts[i];
                let off_at = |n: usize| -> Option<usize> {
                    let pos = start + 4 + 2 * n;
                    if pos + 2 <= data.len() {
                        Some(u16::from_be_bytes([data[pos], data[pos + 1]]) as usize)
                    } else {
                        None
                    }
                };
                let offset = off_at(rvalue)?;
                let next = if rvalue + 1 < count { off_at(rvalue + 1) } else { None };
                return Some((offset, next, data));
            }
            rvalue -= count;
        }
        None
    }
}

/// Apply one inflection rule to the headword. Rule bytes drive a small
/// state machine: 0x01..0x04 select mode and cursor, 0x0A..0x13 move the
/// cursor backwards, anything above 0x13 inserts or delete-verifies a
/// literal byte. A failed delete verification aborts the rule.
pub fn apply_inflection_rule(main_entry: &[u8], rule: &[u8]) -> Option<Vec<u8>> {
    let mut word = main_entry.to_vec();
    let mut mode: i32 = -1;
    let mut position = word.len() as i64;

    for &byte in rule {
        match byte {
            0x0A..=0x13 => {
                let offset = (byte - 0x0A) as i64;
                if mode != 0x02 && mode != 0x03 {
                    mode = 0x02;
                    position = word.len() as i64;
                }
                position -= offset;
            }
            0x01 => {
                if mode != 0x01 && mode != 0x04 {
                    position = 0;
                }
                mode = 0x01;
            }
            0x02 => {
                if mode != 0x02 && mode != 0x03 {
                    position = word.len() as i64;
                }
                mode = 0x02;
            }
            0x03 => {
                if mode != 0x02 && mode != 0x03 {
                    position = word.len() as i64;
                }
                mode = 0x03;
            }
            0x04 => {
                if mode != 0x01 && mode != 0x04 {
                    position = 0;
                }
                mode = 0x04;
            }
            b if b > 0x13 => {
                if mode == -1 || position < 0 {
                    log::warn!("unexpected first byte 0x{b:02x} of inflection rule");
                    return None;
                }
                let pos = position as usize;
                match mode {
                    0x01 => {
                        // insert at word start
                        if pos > word.len() {
                            return None;
                        }
                        word.insert(pos, b);
                        position += 1;
                    }
                    0x02 => {
                        // insert at word end
                        if pos > word.len() {
                            return None;
                        }
                        word.insert(pos, b);
                    }
                    0x03 => {
                        // delete at word end, verifying the literal
                        position -= 1;
                        if position < 0 || position as usize >= word.len() {
                            return None;
                        }
                        let deleted = word.remove(position as usize);
                        if deleted != b {
                            log::warn!("delete operation of inflection rule failed");
                            return None;
                        }
                    }
                    0x04 => {
                        // delete at word start, verifying the literal
                        if pos >= word.len() {
                            return None;
                        }
                        let deleted = word.remove(pos);
                        if deleted != b {
                            log::warn!("delete operation of inflection rule failed");
                            return None;
                        }
                    }
                    _ => {
                        log::warn!("inflection rule mode 0x{mode:x} is not implemented");
                        return None;
                    }
                }
            }
            b => {
                log::warn!("inflection rule byte 0x{b:02x} is not implemented");
                return None;
            }
        }
    }
    Some(word)
}

/// Build the `<idx:infl>` group markup for one headword.
fn inflection_groups(
    main_entry: &[u8],
    control_byte_count: usize,
    table: &[TagxEntry],
    dinfl: &InflectionData,
    inflection_names: &[u8],
    group_list: &[u64],
) -> Vec<u8> {
    let mut result = Vec::new();
    for &value in group_list {
        let Some((offset, next, data)) = dinfl.offsets(value as usize) else {
            return Vec::new();
        };
        if data.get(offset) != Some(&0x00) {
            log::warn!("inflection group blob does not start with 0x00");
            return Vec::new();
        }
        let tag_map = get_tag_map(control_byte_count, table, data, offset + 1, next);
        let (Some(names), Some(rules)) = (tag_map.get(&0x05), tag_map.get(&0x1A)) else {
            log::warn!("inflection group lacks required tags 0x05/0x1a");
            return Vec::new();
        };

        result.extend_from_slice(b"<idx:infl>");
        for (name_off, rule_value) in names.iter().zip(rules.iter()) {
            let name_off = *name_off as usize;
            let (consumed, text_len) = get_variable_width_value(inflection_names, name_off);
            let name_start = name_off + consumed;
            let name_end = (name_start + text_len as usize).min(inflection_names.len());
            let name = &inflection_names[name_start.min(inflection_names.len())..name_end];

            let Some((rvalue, start, data)) = dinfl.lookup(*rule_value as usize) else {
                continue;
            };
            let off_pos = start + 4 + 2 * rvalue;
            if off_pos + 2 > data.len() {
                continue;
            }
            let offset = u16::from_be_bytes([data[off_pos], data[off_pos + 1]]) as usize;
            let Some(&rule_len) = data.get(offset) else {
                continue;
            };
            let rule_end = (offset + 1 + rule_len as usize).min(data.len());
            if let Some(inflection) = apply_inflection_rule(main_entry, &data[offset + 1..rule_end])
            {
                result.extend_from_slice(b"  <idx:iform name=\"");
                result.extend_from_slice(name);
                result.extend_from_slice(b"\" value=\"");
                result.extend_from_slice(&inflection);
                result.extend_from_slice(b"\"/>");
            }
        }
        result.extend_from_slice(b"</idx:infl>");
    }
    result
}

/// Decode the orthographic index (and inflections, when present) into a
/// position map of `<idx:entry>` markup keyed by rawML byte position.
pub fn position_map(sect: &Sectionizer, mh: &MobiHeader) -> Result<PositionMap> {
    let mut positions = PositionMap::new();
    if mh.meta_orth_index == NULL_INDEX {
        return Ok(positions);
    }
    log::info!("document contains orthographic index, handle as dictionary");

    let mut decode_inflection = mh.meta_infl_index != NULL_INDEX;
    let mut dinfl = None;
    let mut infl_names = Vec::new();
    let mut infl_cbc = 0usize;
    let mut infl_table = Vec::new();
    if decode_inflection {
        let infl_record = sect.section_checked(mh.meta_infl_index as usize)?;
        let (header, _) = parse_indx_header(infl_record)?;
        let count = header.count as usize;
        let mut datas = Vec::with_capacity(count);
        for j in 0..count {
            datas.push(sect.section_checked(mh.meta_infl_index as usize + 1 + j)?.to_vec());
        }
        dinfl = Some(InflectionData::new(datas));
        infl_names = sect.section_checked(mh.meta_infl_index as usize + 1 + count)?.to_vec();
        let (cbc, table) = read_tag_section(header.len as usize, infl_record);
        if table.iter().any(|t| t.tag == 0x07) {
            log::warn!("dictionary uses obsolete inflection rule scheme which is not supported");
            decode_inflection = false;
        }
        infl_cbc = cbc;
        infl_table = table;
    }

    let orth_record = sect.section_checked(mh.meta_orth_index as usize)?;
    let (orth_header, ordt) = parse_indx_header(orth_record)?;
    let (cbc, table) = read_tag_section(orth_header.len as usize, orth_record);
    let has_entry_length = table.iter().any(|t| t.tag == 0x02);
    if !has_entry_length {
        log::info!("index doesn't contain entry length tags");
    }
    log::info!("orthographic index has {} entries", orth_header.total);

    for i in 1..=orth_header.count as usize {
        let data = sect.section_checked(mh.meta_orth_index as usize + i)?;
        let (rec_header, _) = parse_indx_header(data)?;
        let idx_positions = read_idxt_positions(data, &rec_header);

        for j in 0..idx_positions.len().saturating_sub(1) {
            let start = idx_positions[j];
            let end = idx_positions[j + 1];
            if start >= end || start >= data.len() {
                continue;
            }
            let text_len = data[start] as usize;
            let text_end = (start + 1 + text_len).min(end);
            let raw_text = &data[start + 1..text_end];

            // codepage-65002 headwords go through the ORDT2 table, with
            // offset width selected by the table type
            let text = match &ordt {
                Some(ordt) => {
                    let mut decoded = String::new();
                    let width = if ordt.otype == 0 { 2 } else { 1 };
                    let mut pos = 0;
                    while pos + width <= raw_text.len() {
                        let off = if width == 2 {
                            u16::from_be_bytes([raw_text[pos], raw_text[pos + 1]]) as usize
                        } else {
                            raw_text[pos] as usize
                        };
                        let ch = ordt
                            .ordt2
                            .get(off)
                            .map(|&v| v as u32)
                            .unwrap_or(off as u32);
                        decoded.push(char::from_u32(ch).unwrap_or(char::REPLACEMENT_CHARACTER));
                        pos += width;
                    }
                    decoded.into_bytes()
                }
                None => raw_text.to_vec(),
            };

            let tag_map = get_tag_map(cbc, &table, data, text_end, Some(end));
            let Some(entry_start) = tag_map.get(&0x01).and_then(|v| v.first()).copied() else {
                continue;
            };
            let entry_start = entry_start as usize;

            let infl = match (&dinfl, tag_map.get(&0x2A)) {
                (Some(dinfl), Some(groups)) if decode_inflection => {
                    inflection_groups(&text, infl_cbc, &infl_table, dinfl, &infl_names, groups)
                }
                _ => Vec::new(),
            };

            if has_entry_length {
                // "scriptable" is required for entry length tags to work
                let mut ml = b"<idx:entry scriptable=\"yes\"><idx:orth value=\"".to_vec();
                ml.extend_from_slice(&text);
                ml.extend_from_slice(b"\">");
                ml.extend_from_slice(&infl);
                ml.extend_from_slice(b"</idx:orth>");
                positions.entry(entry_start).or_default().extend_from_slice(&ml);

                if let Some(len) = tag_map.get(&0x02).and_then(|v| v.first()) {
                    let entry_end = entry_start + *len as usize;
                    let closer = positions.entry(entry_end).or_default();
                    let mut merged = b"</idx:entry>".to_vec();
                    merged.extend_from_slice(closer);
                    *closer = merged;
                }
            } else {
                let mut ml = b"<idx:entry>\n<idx:orth value=\"".to_vec();
                ml.extend_from_slice(&text);
                ml.extend_from_slice(b"\">\n");
                ml.extend_from_slice(&infl);
                ml.extend_from_slice(b"</idx:entry>\n");
                positions.entry(entry_start).or_default().extend_from_slice(&ml);
            }
        }
    }

    Ok(positions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_end_mismatch_returns_none() {
        // delete-at-end expecting 's' applied to "cat" fails
        assert_eq!(apply_inflection_rule(b"cat", &[0x02, 0x03, b's']), None);
    }

    #[test]
    fn test_delete_end_match() {
        assert_eq!(apply_inflection_rule(b"cats", &[0x03, b's']), Some(b"cat".to_vec()));
    }

    #[test]
    fn test_append_at_end() {
        assert_eq!(apply_inflection_rule(b"cat", &[0x02, b's']), Some(b"cats".to_vec()));
    }

    #[test]
    fn test_insert_at_start() {
        assert_eq!(apply_inflection_rule(b"do", &[0x01, b'u', b'n']), Some(b"undo".to_vec()));
    }

    #[test]
    fn test_delete_at_start() {
        assert_eq!(apply_inflection_rule(b"undo", &[0x04, b'u', b'n']), Some(b"do".to_vec()));
        assert_eq!(apply_inflection_rule(b"redo", &[0x04, b'u', b'n']), None);
    }

    #[test]
    fn test_cursor_move_then_append() {
        // 0x0B moves one back from the end, inserting before the last byte
        assert_eq!(apply_inflection_rule(b"cat", &[0x0B, b'r']), Some(b"cart".to_vec()));
    }

    #[test]
    fn test_literal_without_mode_fails() {
        assert_eq!(apply_inflection_rule(b"cat", &[b's']), None);
    }

    #[test]
    fn test_inflection_data_lookup_spans_sections() {
        let mut rec = vec![0u8; 0x1C];
        rec[0x14..0x18].copy_from_slice(&0u32.to_be_bytes());
        rec[0x18..0x1C].copy_from_slice(&2u32.to_be_bytes());
        let mut rec2 = vec![0u8; 0x1C];
        rec2[0x14..0x18].copy_from_slice(&0u32.to_be_bytes());
        rec2[0x18..0x1C].copy_from_slice(&3u32.to_be_bytes());
        let dinfl = InflectionData::new(vec![rec, rec2]);

        let (rvalue, _, _) = dinfl.lookup(1).unwrap();
        assert_eq!(rvalue, 1);
        // entry 3 lands in the second section as local entry 1
        let (rvalue, _, _) = dinfl.lookup(3).unwrap();
        assert_eq!(rvalue, 1);
        assert!(dinfl.lookup(5).is_none());
    }
}
