//! Combo-container splitting.
//!
//! A combination file carries a Mobi 6 payload, a `BOUNDARY` record, and
//! a KF8 payload in one Palm database. Splitting rewrites the record
//! table twice: once dropping the KF8 span (standalone mobi7), once
//! dropping the legacy span and re-inserting the shared image/resource
//! records (standalone mobi8). All mutations are pure rewrites of the
//! container image.

// Palm header offsets.
const UNIQUE_ID_SEED: usize = 68;
const NUMBER_OF_PDB_RECORDS: usize = 76;
const FIRST_PDB_RECORD: usize = 78;

// Record-0 offsets.
const MOBI_HEADER_BASE: usize = 16;
const MOBI_HEADER_LENGTH: usize = 20;
const MOBI_VERSION: usize = 36;
const TITLE_OFFSET: usize = 84;
const FIRST_RESC_RECORD: usize = 108;
const LAST_CONTENT_INDEX: usize = 194;
const KF8_FDST_INDEX: usize = 192;
const FCIS_INDEX: usize = 200;
const FLIS_INDEX: usize = 208;
const SRCS_INDEX: usize = 224;
const SRCS_COUNT: usize = 228;
const DATP_INDEX: usize = 256;
const HUFF_TABLE_OFFSET: usize = 120;

const NULL_INDEX: u32 = 0xFFFF_FFFF;

fn getint(data: &[u8], ofs: usize) -> u32 {
    u32::from_be_bytes([data[ofs], data[ofs + 1], data[ofs + 2], data[ofs + 3]])
}

fn getint16(data: &[u8], ofs: usize) -> u16 {
    u16::from_be_bytes([data[ofs], data[ofs + 1]])
}

fn writeint(data: &[u8], ofs: usize, value: u32) -> Vec<u8> {
    let mut out = data.to_vec();
    out[ofs..ofs + 4].copy_from_slice(&value.to_be_bytes());
    out
}

fn num_sections(data: &[u8]) -> usize {
    getint16(data, NUMBER_OF_PDB_RECORDS) as usize
}

fn get_sec_addr(data: &[u8], secno: usize) -> (usize, usize) {
    let nsec = num_sections(data);
    debug_assert!(secno < nsec, "secno {secno} out of range (nsec={nsec})");
    let start = getint(data, FIRST_PDB_RECORD + secno * 8) as usize;
    let end = if secno == nsec - 1 {
        data.len()
    } else {
        getint(data, FIRST_PDB_RECORD + (secno + 1) * 8) as usize
    };
    (start, end)
}

fn read_section(data: &[u8], secno: usize) -> &[u8] {
    let (start, end) = get_sec_addr(data, secno);
    &data[start..end]
}

fn descriptor(data: &[u8], secno: usize) -> (u32, u32) {
    let pos = FIRST_PDB_RECORD + secno * 8;
    (getint(data, pos), getint(data, pos + 4))
}

fn push_descriptor(out: &mut Vec<u8>, ofs: u32, flgval: u32) {
    out.extend_from_slice(&ofs.to_be_bytes());
    out.extend_from_slice(&flgval.to_be_bytes());
}

/// Overwrite one section, shifting all later offsets by the length
/// difference.
fn write_section(data: &[u8], secno: usize, secdata: &[u8]) -> Vec<u8> {
    let nsec = num_sections(data);
    let (zero_start, _) = get_sec_addr(data, 0);
    let (sec_start, sec_end) = get_sec_addr(data, secno);
    let dif = secdata.len() as i64 - (sec_end - sec_start) as i64;

    let mut out = Vec::with_capacity(data.len() + secdata.len());
    out.extend_from_slice(&data[..UNIQUE_ID_SEED]);
    out.extend_from_slice(&(2 * nsec as u32 + 1).to_be_bytes());
    out.extend_from_slice(&data[UNIQUE_ID_SEED + 4..NUMBER_OF_PDB_RECORDS]);
    out.extend_from_slice(&(nsec as u16).to_be_bytes());
    for i in 0..secno {
        let (ofs, flgval) = descriptor(data, i);
        push_descriptor(&mut out, ofs, flgval);
    }
    push_descriptor(&mut out, sec_start as u32, 2 * secno as u32);
    for i in secno + 1..nsec {
        let (ofs, flgval) = descriptor(data, i);
        push_descriptor(&mut out, (ofs as i64 + dif) as u32, flgval);
    }
    let lpad = zero_start as i64 - (FIRST_PDB_RECORD + 8 * nsec) as i64;
    if lpad > 0 {
        out.extend(std::iter::repeat_n(0u8, lpad as usize));
    }
    out.extend_from_slice(&data[zero_start..sec_start]);
    out.extend_from_slice(secdata);
    out.extend_from_slice(&data[sec_end..]);
    out
}

/// Zero a section's length without removing its slot, so record indices
/// referencing later sections stay valid.
fn null_section(data: &[u8], secno: usize) -> Vec<u8> {
    let nsec = num_sections(data);
    let (sec_start, sec_end) = get_sec_addr(data, secno);
    let (zero_start, _) = get_sec_addr(data, 0);
    let dif = sec_end - sec_start;

    let mut out = Vec::with_capacity(data.len() - dif);
    out.extend_from_slice(&data[..FIRST_PDB_RECORD]);
    for i in 0..=secno {
        let (ofs, flgval) = descriptor(data, i);
        push_descriptor(&mut out, ofs, flgval);
    }
    for i in secno + 1..nsec {
        let (ofs, flgval) = descriptor(data, i);
        push_descriptor(&mut out, ofs - dif as u32, flgval);
    }
    let lpad = zero_start as i64 - (FIRST_PDB_RECORD + 8 * nsec) as i64;
    if lpad > 0 {
        out.extend(std::iter::repeat_n(0u8, lpad as usize));
    }
    out.extend_from_slice(&data[zero_start..sec_start]);
    out.extend_from_slice(&data[sec_end..]);
    out
}

/// Delete sections `[first, last]`, renumbering the remaining record
/// flag values contiguously.
fn delete_section_range(data: &[u8], first: usize, last: usize) -> Vec<u8> {
    let nsec = num_sections(data);
    let deleted = last - first + 1;
    let (first_start, _) = get_sec_addr(data, first);
    let (_, last_end) = get_sec_addr(data, last);
    let (zero_start, _) = get_sec_addr(data, 0);
    let dif = last_end - first_start + 8 * deleted;
    let new_nsec = nsec - deleted;

    let mut out = Vec::with_capacity(data.len() - dif);
    out.extend_from_slice(&data[..UNIQUE_ID_SEED]);
    out.extend_from_slice(&(2 * new_nsec as u32 + 1).to_be_bytes());
    out.extend_from_slice(&data[UNIQUE_ID_SEED + 4..NUMBER_OF_PDB_RECORDS]);
    out.extend_from_slice(&(new_nsec as u16).to_be_bytes());
    for i in 0..first {
        let (ofs, flgval) = descriptor(data, i);
        push_descriptor(&mut out, ofs - 8 * deleted as u32, flgval);
    }
    for i in last + 1..nsec {
        let (ofs, _) = descriptor(data, i);
        push_descriptor(&mut out, ofs - dif as u32, 2 * (i - deleted) as u32);
    }
    let new_start = zero_start - 8 * deleted;
    let lpad = new_start as i64 - (FIRST_PDB_RECORD + 8 * new_nsec) as i64;
    if lpad > 0 {
        out.extend(std::iter::repeat_n(0u8, lpad as usize));
    }
    out.extend_from_slice(&data[zero_start..first_start]);
    out.extend_from_slice(&data[last_end..]);
    out
}

/// Insert sections `[first, last]` of `source` into `target` before
/// section `target_sec`.
fn insert_section_range(
    source: &[u8],
    first: usize,
    last: usize,
    target: &[u8],
    target_sec: usize,
) -> Vec<u8> {
    let nsec = num_sections(target);
    let nins = last - first + 1;
    let (zero_start, _) = get_sec_addr(target, 0);
    let (ins_start, _) = get_sec_addr(target, target_sec);
    let (src_start, _) = get_sec_addr(source, first);
    let (_, src_end) = get_sec_addr(source, last);
    let dif = src_end - src_start;

    let mut out = Vec::with_capacity(target.len() + dif + 8 * nins);
    out.extend_from_slice(&target[..UNIQUE_ID_SEED]);
    out.extend_from_slice(&(2 * (nsec + nins) as u32 + 1).to_be_bytes());
    out.extend_from_slice(&target[UNIQUE_ID_SEED + 4..NUMBER_OF_PDB_RECORDS]);
    out.extend_from_slice(&((nsec + nins) as u16).to_be_bytes());
    for i in 0..target_sec {
        let (ofs, flgval) = descriptor(target, i);
        push_descriptor(&mut out, ofs + 8 * nins as u32, flgval);
    }
    for i in 0..nins {
        let (isrc_start, _) = get_sec_addr(source, first + i);
        let ofs = ins_start + (isrc_start - src_start) + 8 * nins;
        push_descriptor(&mut out, ofs as u32, 2 * (target_sec + i) as u32);
    }
    for i in target_sec..nsec {
        let (ofs, _) = descriptor(target, i);
        push_descriptor(&mut out, (ofs as usize + dif + 8 * nins) as u32, 2 * (i + nins) as u32);
    }
    let new_start = zero_start + 8 * nins;
    let lpad = new_start as i64 - (FIRST_PDB_RECORD + 8 * (nsec + nins)) as i64;
    if lpad > 0 {
        out.extend(std::iter::repeat_n(0u8, lpad as usize));
    }
    out.extend_from_slice(&target[zero_start..ins_start]);
    out.extend_from_slice(&source[src_start..src_end]);
    out.extend_from_slice(&target[ins_start..]);
    out
}

fn get_exth_params(rec0: &[u8]) -> (usize, u32, u32) {
    let ebase = MOBI_HEADER_BASE + getint(rec0, MOBI_HEADER_LENGTH) as usize;
    (ebase, getint(rec0, ebase + 4), getint(rec0, ebase + 8))
}

/// All values of one EXTH id (ids are not unique).
fn read_exth(rec0: &[u8], exth_num: u32) -> Vec<Vec<u8>> {
    let mut values = Vec::new();
    let (ebase, _, mut count) = get_exth_params(rec0);
    let mut pos = ebase + 12;
    while count > 0 && pos + 8 <= rec0.len() {
        let size = getint(rec0, pos + 4) as usize;
        if size < 8 || pos + size > rec0.len() {
            break;
        }
        if getint(rec0, pos) == exth_num {
            values.push(rec0[pos + 8..pos + size].to_vec());
        }
        count -= 1;
        pos += size;
    }
    values
}

/// Replace the first entry of `exth_num` with new content, adjusting the
/// EXTH length and the title offset. Unchanged when the id is absent.
fn write_exth(rec0: &[u8], exth_num: u32, exth_bytes: &[u8]) -> Vec<u8> {
    let (ebase, elen, count) = get_exth_params(rec0);
    let mut pos = ebase + 12;
    let mut remaining = count;
    while remaining > 0 && pos + 8 <= rec0.len() {
        let size = getint(rec0, pos + 4) as usize;
        if size < 8 || pos + size > rec0.len() {
            break;
        }
        if getint(rec0, pos) == exth_num {
            let new_size = exth_bytes.len() + 8;
            let dif = new_size as i64 - size as i64;
            let mut out = rec0.to_vec();
            if dif != 0 {
                let title = getint(&out, TITLE_OFFSET) as i64;
                out = writeint(&out, TITLE_OFFSET, (title + dif) as u32);
            }
            let mut patched = out[..ebase + 4].to_vec();
            patched.extend_from_slice(&((elen as i64 + dif) as u32).to_be_bytes());
            patched.extend_from_slice(&count.to_be_bytes());
            patched.extend_from_slice(&out[ebase + 12..pos + 4]);
            patched.extend_from_slice(&(new_size as u32).to_be_bytes());
            patched.extend_from_slice(exth_bytes);
            patched.extend_from_slice(&out[pos + size..]);
            return patched;
        }
        remaining -= 1;
        pos += size;
    }
    rec0.to_vec()
}

/// Delete the first entry of `exth_num`.
fn del_exth(rec0: &[u8], exth_num: u32) -> Vec<u8> {
    let (ebase, elen, count) = get_exth_params(rec0);
    let mut pos = ebase + 12;
    let mut remaining = count;
    while remaining > 0 && pos + 8 <= rec0.len() {
        let size = getint(rec0, pos + 4) as usize;
        if size < 8 || pos + size > rec0.len() {
            break;
        }
        if getint(rec0, pos) == exth_num {
            let title = getint(rec0, TITLE_OFFSET) as i64;
            let mut out = writeint(rec0, TITLE_OFFSET, (title - size as i64) as u32);
            out.drain(pos..pos + size);
            let mut patched = out[..ebase + 4].to_vec();
            patched.extend_from_slice(&(elen - size as u32).to_be_bytes());
            patched.extend_from_slice(&(count - 1).to_be_bytes());
            patched.extend_from_slice(&out[ebase + 12..]);
            return patched;
        }
        remaining -= 1;
        pos += size;
    }
    rec0.to_vec()
}

pub struct MobiSplit {
    pub mobi7: Vec<u8>,
    pub mobi8: Vec<u8>,
}

/// Split a combo container. Returns `None` (splitting silently
/// disabled) when the file is pure KF8 or carries no KF8 boundary.
pub fn split(data: &[u8]) -> Option<MobiSplit> {
    let rec0 = read_section(data, 0).to_vec();
    if getint(&rec0, MOBI_VERSION) == 8 {
        return None;
    }
    let exth121 = read_exth(&rec0, 121);
    let boundary = exth121.first().filter(|v| v.len() >= 4).map(|v| getint(v, 0))?;
    if boundary == NULL_INDEX {
        return None;
    }
    let kf8_start = boundary as usize;
    let kf8_rec0 = read_section(data, kf8_start).to_vec();

    // standalone mobi7: remove BOUNDARY up to but not including the
    // trailer record
    let nsec = num_sections(data);
    let mut mobi7 = delete_section_range(data, kf8_start - 1, nsec - 2);
    let mut rec0_m7 = rec0.clone();

    let srcs = getint(&rec0_m7, SRCS_INDEX);
    let num_srcs = getint(&rec0_m7, SRCS_COUNT);
    if srcs != NULL_INDEX && num_srcs > 0 {
        mobi7 = delete_section_range(&mobi7, srcs as usize, srcs as usize + num_srcs as usize - 1);
        rec0_m7 = writeint(&rec0_m7, SRCS_INDEX, NULL_INDEX);
        rec0_m7 = writeint(&rec0_m7, SRCS_COUNT, 0);
    }
    rec0_m7 = write_exth(&rec0_m7, 121, &NULL_INDEX.to_be_bytes());
    rec0_m7 = write_exth(&rec0_m7, 129, b"");

    // flags: drop 0x0800 (shared resources) and the embedded-font bit
    let fval = getint(&rec0_m7, 0x80) & 0x07FF;
    rec0_m7 = writeint(&rec0_m7, 0x80, fval);
    mobi7 = write_section(&mobi7, 0, &rec0_m7);

    let first_image = getint(&rec0, FIRST_RESC_RECORD) as usize;
    let mut last_image = getint16(&rec0, LAST_CONTENT_INDEX) as usize;
    if last_image == 0xFFFF {
        // no last-content index: copy up to the lowest trailer pointer
        for ofs in [FCIS_INDEX, FLIS_INDEX, DATP_INDEX, HUFF_TABLE_OFFSET] {
            let n = getint(&rec0, ofs) as usize;
            if n > 0 && n < last_image {
                last_image = n - 1;
            }
        }
    }
    log::info!("first image {first_image}, last image {last_image}");

    // null out KF8-only resources, keeping the slots so legacy image
    // indices keep resolving
    for i in first_image..last_image {
        let sec = read_section(&mobi7, i);
        if sec.len() >= 4 && (&sec[..4] == b"RESC" || &sec[..4] == b"FONT") {
            mobi7 = null_section(&mobi7, i);
        }
    }

    // standalone mobi8: drop everything before the boundary, then splice
    // the shared image/font/resource records back in
    let mut mobi8 = delete_section_range(data, 0, kf8_start - 1);
    let target = getint(&kf8_rec0, FIRST_RESC_RECORD) as usize;
    mobi8 = insert_section_range(data, first_image, last_image, &mobi8, target);
    let mut rec0_m8 = read_section(&mobi8, 0).to_vec();

    // KindleGen 2.5 carries the mobi7 StartOffset over; only the last
    // one points into the KF8 part
    let mut start_count = read_exth(&rec0_m8, 116).len();
    while start_count > 1 {
        start_count -= 1;
        rec0_m8 = del_exth(&rec0_m8, 116);
    }

    let inserted = (last_image - first_image + 1) as u32;
    rec0_m8 = write_exth(&rec0_m8, 125, &inserted.to_be_bytes());

    let fval = (getint(&rec0_m8, 0x80) & 0x1FFF) | 0x0800;
    rec0_m8 = writeint(&rec0_m8, 0x80, fval);

    // index pointers shifted by the inserted records
    for ofs in [KF8_FDST_INDEX, FCIS_INDEX, FLIS_INDEX, DATP_INDEX, HUFF_TABLE_OFFSET] {
        let n = getint(&rec0_m8, ofs);
        if n != NULL_INDEX {
            rec0_m8 = writeint(&rec0_m8, ofs, n + inserted);
        }
    }
    let mobi8 = write_section(&mobi8, 0, &rec0_m8);

    Some(MobiSplit { mobi7, mobi8 })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_exth(entries: &[(u32, &[u8])]) -> Vec<u8> {
        let mut exth = Vec::new();
        exth.extend_from_slice(b"EXTH");
        let total: usize = 12 + entries.iter().map(|(_, c)| c.len() + 8).sum::<usize>();
        exth.extend_from_slice(&(total as u32).to_be_bytes());
        exth.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (id, content) in entries {
            exth.extend_from_slice(&id.to_be_bytes());
            exth.extend_from_slice(&((content.len() + 8) as u32).to_be_bytes());
            exth.extend_from_slice(content);
        }
        exth
    }

    /// Record 0 image: 16-byte PalmDOC head + 0x108-byte mobi header +
    /// EXTH + title.
    fn build_rec0(version: u32, exth: &[(u32, &[u8])]) -> Vec<u8> {
        let header_length = 0x108u32;
        let mut rec0 = vec![0u8; 16 + header_length as usize];
        rec0[16..20].copy_from_slice(b"MOBI");
        rec0[MOBI_HEADER_LENGTH..MOBI_HEADER_LENGTH + 4]
            .copy_from_slice(&header_length.to_be_bytes());
        rec0[MOBI_VERSION..MOBI_VERSION + 4].copy_from_slice(&version.to_be_bytes());
        rec0[0x80..0x84].copy_from_slice(&0x1850u32.to_be_bytes());
        for ofs in [FIRST_RESC_RECORD, FCIS_INDEX, FLIS_INDEX, SRCS_INDEX, DATP_INDEX, KF8_FDST_INDEX] {
            rec0[ofs..ofs + 4].copy_from_slice(&NULL_INDEX.to_be_bytes());
        }
        rec0[LAST_CONTENT_INDEX..LAST_CONTENT_INDEX + 2].copy_from_slice(&0xFFFFu16.to_be_bytes());
        let exth_bytes = build_exth(exth);
        rec0.extend_from_slice(&exth_bytes);
        let title_offset = rec0.len() as u32;
        rec0[TITLE_OFFSET..TITLE_OFFSET + 4].copy_from_slice(&title_offset.to_be_bytes());
        rec0.extend_from_slice(b"Combo Test");
        rec0
    }

    fn build_container(records: &[&[u8]]) -> Vec<u8> {
        let nsec = records.len();
        let mut data = vec![0u8; FIRST_PDB_RECORD + nsec * 8];
        data[..5].copy_from_slice(b"Combo");
        data[60..68].copy_from_slice(b"BOOKMOBI");
        data[NUMBER_OF_PDB_RECORDS..NUMBER_OF_PDB_RECORDS + 2]
            .copy_from_slice(&(nsec as u16).to_be_bytes());
        let mut offset = data.len() as u32;
        for (i, record) in records.iter().enumerate() {
            let pos = FIRST_PDB_RECORD + i * 8;
            data[pos..pos + 4].copy_from_slice(&offset.to_be_bytes());
            data[pos + 4..pos + 8].copy_from_slice(&(2 * i as u32).to_be_bytes());
            offset += record.len() as u32;
        }
        for record in records {
            data.extend_from_slice(record);
        }
        data
    }

    /// Layout: 0 rec0, 1 text, 2 image, 3 FONT, 4 FLIS, 5 BOUNDARY,
    /// 6 kf8 rec0, 7 kf8 text, 8 EOF.
    fn build_combo() -> Vec<u8> {
        let mut rec0 = build_rec0(6, &[(121, &6u32.to_be_bytes()), (116, &0u32.to_be_bytes())]);
        rec0[FIRST_RESC_RECORD..FIRST_RESC_RECORD + 4].copy_from_slice(&2u32.to_be_bytes());
        rec0[LAST_CONTENT_INDEX..LAST_CONTENT_INDEX + 2].copy_from_slice(&4u16.to_be_bytes());

        let mut kf8_rec0 = build_rec0(
            8,
            &[
                (116, &0xFFFF_FFFFu32.to_be_bytes()),
                (116, &1u32.to_be_bytes()),
                (125, &0u32.to_be_bytes()),
            ],
        );
        kf8_rec0[FIRST_RESC_RECORD..FIRST_RESC_RECORD + 4].copy_from_slice(&2u32.to_be_bytes());
        // fdst is payload-relative record 1
        kf8_rec0[KF8_FDST_INDEX..KF8_FDST_INDEX + 4].copy_from_slice(&1u32.to_be_bytes());

        build_container(&[
            &rec0,
            b"<html>old</html>",
            b"\xFF\xD8\xFFjpegdata\xFF\xD9",
            b"FONTfontdata",
            b"FLIS\x00\x00\x00\x08",
            b"BOUNDARY",
            &kf8_rec0,
            b"kf8 text payload",
            b"\xE9\x8E\x0D\x0A",
        ])
    }

    #[test]
    fn test_split_requires_boundary() {
        let rec0 = build_rec0(6, &[(100, b"author")]);
        let data = build_container(&[&rec0, b"text", b"\xE9\x8E\x0D\x0A"]);
        assert!(split(&data).is_none());
    }

    #[test]
    fn test_split_pure_kf8_refused() {
        let rec0 = build_rec0(8, &[(121, &1u32.to_be_bytes())]);
        let data = build_container(&[&rec0, b"text"]);
        assert!(split(&data).is_none());
    }

    #[test]
    fn test_split_record_counts() {
        let data = build_combo();
        let result = split(&data).unwrap();

        // mobi7 drops records 5..=7 (boundary, kf8 rec0, kf8 text)
        assert_eq!(num_sections(&result.mobi7), 6);
        // mobi8 drops 0..=5, keeping three records, then re-inserts the
        // three shared resource records
        assert_eq!(num_sections(&result.mobi8), 6);
    }

    #[test]
    fn test_mobi7_patches() {
        let result = split(&build_combo()).unwrap();
        let rec0 = read_section(&result.mobi7, 0);

        assert_eq!(read_exth(rec0, 121), vec![NULL_INDEX.to_be_bytes().to_vec()]);
        assert_eq!(getint(rec0, 0x80) & !0x07FF, 0);
        // the trailer record survives
        let last = read_section(&result.mobi7, 5);
        assert_eq!(last, b"\xE9\x8E\x0D\x0A");
        // shared image is still addressable at its old index
        assert_eq!(read_section(&result.mobi7, 2), b"\xFF\xD8\xFFjpegdata\xFF\xD9");
        // FONT record was nulled but its slot remains
        assert_eq!(read_section(&result.mobi7, 3), b"");
    }

    #[test]
    fn test_mobi8_patches() {
        let result = split(&build_combo()).unwrap();
        let rec0 = read_section(&result.mobi8, 0);

        // begins with the KF8 header
        assert_eq!(&rec0[16..20], b"MOBI");
        assert_eq!(getint(rec0, MOBI_VERSION), 8);
        // only the last StartOffset survives
        assert_eq!(read_exth(rec0, 116), vec![1u32.to_be_bytes().to_vec()]);
        // resource count covers the spliced range (image, font, trailer)
        assert_eq!(read_exth(rec0, 125), vec![3u32.to_be_bytes().to_vec()]);
        // shared-resource flag set
        assert_eq!(getint(rec0, 0x80) & 0x0800, 0x0800);
        // fdst pointer bumped past the three inserted records
        assert_eq!(getint(rec0, KF8_FDST_INDEX), 4);

        // the spliced image resolves to the same bytes as in the mobi7
        assert_eq!(read_section(&result.mobi8, 2), b"\xFF\xD8\xFFjpegdata\xFF\xD9");
        // the original font bytes survive in the mobi8 half
        assert_eq!(read_section(&result.mobi8, 3), b"FONTfontdata");
    }

    #[test]
    fn test_write_exth_adjusts_title_offset() {
        let rec0 = build_rec0(6, &[(129, b"kindle:embed:0001")]);
        let title_before = getint(&rec0, TITLE_OFFSET);
        let patched = write_exth(&rec0, 129, b"");
        let title_after = getint(&patched, TITLE_OFFSET);

        assert_eq!(title_after, title_before - 17);
        let start = title_after as usize;
        assert_eq!(&patched[start..start + 10], b"Combo Test");
        assert_eq!(read_exth(&patched, 129), vec![Vec::<u8>::new()]);
    }
}
