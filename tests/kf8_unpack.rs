//! End-to-end unpacking of a synthetic KF8 (azw3) container.

use mobiunpack::{UnpackOptions, unpack_book};

const NULL_INDEX: u32 = 0xFFFF_FFFF;
const INDX_HEADER_LEN: usize = 192;

fn vwi(value: u64) -> Vec<u8> {
    // forward variable-width integer, high bit terminates
    let mut septets = Vec::new();
    let mut v = value;
    loop {
        septets.push((v & 0x7F) as u8);
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    septets.reverse();
    *septets.last_mut().unwrap() |= 0x80;
    septets
}

/// Main INDX record: header, then the TAGX table at the header length.
fn make_indx_main(data_records: u32, tagx_rows: &[(u8, u8, u8, u8)]) -> Vec<u8> {
    let mut record = vec![0u8; INDX_HEADER_LEN];
    record[0..4].copy_from_slice(b"INDX");
    record[4..8].copy_from_slice(&(INDX_HEADER_LEN as u32).to_be_bytes());
    record[24..28].copy_from_slice(&data_records.to_be_bytes());
    // no CNCX records
    record[52..56].copy_from_slice(&0u32.to_be_bytes());

    record.extend_from_slice(b"TAGX");
    record.extend_from_slice(&((12 + tagx_rows.len() * 4) as u32).to_be_bytes());
    let control_bytes = tagx_rows.iter().filter(|r| r.3 == 1).count() as u32;
    record.extend_from_slice(&control_bytes.to_be_bytes());
    for &(tag, vpe, mask, end) in tagx_rows {
        record.extend_from_slice(&[tag, vpe, mask, end]);
    }
    record
}

/// Data INDX record with an IDXT offset table.
fn make_indx_data(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut record = vec![0u8; INDX_HEADER_LEN];
    record[0..4].copy_from_slice(b"INDX");
    record[4..8].copy_from_slice(&(INDX_HEADER_LEN as u32).to_be_bytes());
    record[24..28].copy_from_slice(&(entries.len() as u32).to_be_bytes());

    let mut positions = Vec::new();
    for entry in entries {
        positions.push(record.len() as u16);
        record.extend_from_slice(entry);
    }
    let idxt = record.len() as u32;
    record[20..24].copy_from_slice(&idxt.to_be_bytes());
    record.extend_from_slice(b"IDXT");
    for pos in positions {
        record.extend_from_slice(&pos.to_be_bytes());
    }
    record
}

/// One skeleton index entry: length-prefixed name, control byte, then
/// the fragment count (tag 1) and start/length pair (tag 6).
fn skeleton_entry(num: usize, frag_count: u64, start: u64, len: u64) -> Vec<u8> {
    let name = format!("SKEL{num:010}");
    let mut entry = vec![name.len() as u8];
    entry.extend_from_slice(name.as_bytes());
    entry.push(0x05); // tag 1 present (mask 0x03), tag 6 present (mask 0x0C)
    entry.extend_from_slice(&vwi(frag_count));
    entry.extend_from_slice(&vwi(start));
    entry.extend_from_slice(&vwi(len));
    entry
}

const SKEL_TAGX: &[(u8, u8, u8, u8)] = &[(1, 1, 0x03, 0), (6, 2, 0x0C, 0), (0, 0, 0, 1)];

fn make_record0(text_length: u32, skel_index: u32, first_resource: u32) -> Vec<u8> {
    let mut rec0 = vec![0u8; 0x110];
    rec0[0..2].copy_from_slice(&1u16.to_be_bytes()); // no compression
    rec0[4..8].copy_from_slice(&text_length.to_be_bytes());
    rec0[8..10].copy_from_slice(&1u16.to_be_bytes());
    rec0[16..20].copy_from_slice(b"MOBI");
    rec0[0x14..0x18].copy_from_slice(&0x100u32.to_be_bytes());
    rec0[0x1C..0x20].copy_from_slice(&65001u32.to_be_bytes());
    rec0[0x24..0x28].copy_from_slice(&8u32.to_be_bytes());
    for off in [0x28, 0x2C, 0x50, 0xC0, 0xF4, 0xF8, 0x104] {
        rec0[off..off + 4].copy_from_slice(&NULL_INDEX.to_be_bytes());
    }
    // fdst flow count of 1 leaves the pointer unreliable; single flow
    rec0[0xC4..0xC8].copy_from_slice(&1u32.to_be_bytes());
    rec0[0x6C..0x70].copy_from_slice(&first_resource.to_be_bytes());
    rec0[0xFC..0x100].copy_from_slice(&skel_index.to_be_bytes());
    rec0
}

fn make_container(records: &[&[u8]]) -> Vec<u8> {
    let nsec = records.len();
    let mut data = vec![0u8; 78 + nsec * 8];
    data[..7].copy_from_slice(b"Kf8Book");
    data[60..68].copy_from_slice(b"BOOKMOBI");
    data[76..78].copy_from_slice(&(nsec as u16).to_be_bytes());
    let mut offset = data.len() as u32;
    for (i, record) in records.iter().enumerate() {
        let pos = 78 + i * 8;
        data[pos..pos + 4].copy_from_slice(&offset.to_be_bytes());
        data[pos + 4..pos + 8].copy_from_slice(&(2 * i as u32).to_be_bytes());
        offset += record.len() as u32;
    }
    for record in records {
        data.extend_from_slice(record);
    }
    data
}

/// Records: 0 rec0, 1 text, 2 skel main INDX, 3 skel data INDX, 4 EOF.
fn make_kf8_book(text: &[u8]) -> Vec<u8> {
    let skel_main = make_indx_main(1, SKEL_TAGX);
    let skel_data = make_indx_data(&[skeleton_entry(0, 0, 0, text.len() as u64)]);
    let rec0 = make_record0(text.len() as u32, 2, 4);
    make_container(&[&rec0, text, &skel_main, &skel_data, b"\xE9\x8E\x0D\x0A"])
}

#[test]
fn single_skeleton_part_matches_flow() {
    let text = b"<html><head></head><body><p>kf8 body</p></body></html>";
    let container = make_kf8_book(text);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("book.azw3");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();

    // one XHTML part, byte-equal to flow 0 of the rawML
    let part = std::fs::read(outdir.join("mobi8/OEBPS/Text/part0000.xhtml")).unwrap();
    assert_eq!(part, text);

    let opf = std::fs::read_to_string(outdir.join("mobi8/OEBPS/content.opf")).unwrap();
    assert!(opf.contains("href=\"Text/part0000.xhtml\""), "{opf}");
    assert!(outdir.join("mobi8/OEBPS/toc.ncx").exists());
}

#[test]
fn epub_is_zipped_with_stored_mimetype() {
    let text = b"<html><head></head><body><p>zip me</p></body></html>";
    let container = make_kf8_book(text);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("book.azw3");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();

    let file = std::fs::File::open(outdir.join("mobi8/book.epub")).unwrap();
    let mut zip = zip::ZipArchive::new(file).unwrap();
    let first = zip.by_index(0).unwrap();
    assert_eq!(first.name(), "mimetype");
    assert_eq!(first.compression(), zip::CompressionMethod::Stored);
    drop(first);
    assert!(zip.by_name("META-INF/container.xml").is_ok());
    assert!(zip.by_name("OEBPS/content.opf").is_ok());
    assert!(zip.by_name("OEBPS/Text/part0000.xhtml").is_ok());
}

#[test]
fn epub3_output_has_nav() {
    let text = b"<html><head></head><body><p>three</p></body></html>";
    let container = make_kf8_book(text);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("book.azw3");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    let opts = UnpackOptions { epub_version: "3".to_string(), ..Default::default() };
    unpack_book(&infile, &outdir, &opts).unwrap();

    assert!(outdir.join("mobi8/OEBPS/Text/nav.xhtml").exists());
    let opf = std::fs::read_to_string(outdir.join("mobi8/OEBPS/content.opf")).unwrap();
    assert!(opf.contains("<package version=\"3.0\""));
    assert!(opf.contains("properties=\"nav\""));
}

#[test]
fn raw_markup_written_on_request() {
    let text = b"<html><head></head><body><p>raw</p></body></html>";
    let container = make_kf8_book(text);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("book.azw3");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    let opts = UnpackOptions { write_raw: true, ..Default::default() };
    unpack_book(&infile, &outdir, &opts).unwrap();

    let raw = std::fs::read(outdir.join("mobi8/book.rawml")).unwrap();
    assert_eq!(raw, text);
}
