//! End-to-end unpacking of a synthetic PalmDoc-compressed Mobi 6 book.

use std::path::Path;

use mobiunpack::{UnpackOptions, unpack_book};

const NULL_INDEX: u32 = 0xFFFF_FFFF;

fn make_record0(text_length: u32, text_records: u16, compression: u16) -> Vec<u8> {
    let mut rec0 = vec![0u8; 0x110];
    rec0[0..2].copy_from_slice(&compression.to_be_bytes());
    rec0[4..8].copy_from_slice(&text_length.to_be_bytes());
    rec0[8..10].copy_from_slice(&text_records.to_be_bytes());
    rec0[16..20].copy_from_slice(b"MOBI");
    rec0[0x14..0x18].copy_from_slice(&0x100u32.to_be_bytes());
    rec0[0x1C..0x20].copy_from_slice(&65001u32.to_be_bytes());
    rec0[0x24..0x28].copy_from_slice(&6u32.to_be_bytes());
    for off in [0x28, 0x2C, 0x50, 0x6C, 0xC0, 0xF4, 0xF8, 0xFC, 0x104] {
        rec0[off..off + 4].copy_from_slice(&NULL_INDEX.to_be_bytes());
    }
    rec0
}

fn make_container(records: &[&[u8]]) -> Vec<u8> {
    let nsec = records.len();
    let mut data = vec![0u8; 78 + nsec * 8];
    data[..9].copy_from_slice(b"HelloBook");
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

#[test]
fn unpacks_palmdoc_compressed_book() {
    let text = b"<html><body>Hello, world.</body></html>";
    let compressed = mobiunpack::mobi::palmdoc::compress(text);
    let rec0 = make_record0(text.len() as u32, 1, 2);
    let container = make_container(&[&rec0, &compressed, b"\xE9\x8E\x0D\x0A"]);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("hello.mobi");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();

    let html = std::fs::read_to_string(outdir.join("mobi7/book.html")).unwrap();
    assert!(html.contains("Hello, world."), "{html}");
    assert!(html.contains("charset=utf-8"));

    let opf = std::fs::read_to_string(outdir.join("mobi7/content.opf")).unwrap();
    assert!(opf.contains("<package version=\"2.0\""));
    assert!(opf.contains("href=\"book.html\""));
    // title falls back to the palm database name
    assert!(opf.contains("<dc:title>HelloBook</dc:title>"), "{opf}");

    assert!(outdir.join("mobi7/toc.ncx").exists());
    // no KF8 payload, no mobi8 tree
    assert!(!outdir.join("mobi8").exists());
}

#[test]
fn filepos_links_become_anchors() {
    // an in-document link to byte position 40 of the raw text
    let text = b"<html><body><a filepos=0000000040>go</a>7890<p>target</p></body></html>".to_vec();
    let rec0 = make_record0(text.len() as u32, 1, 1);
    let container = make_container(&[&rec0, &text, b"\xE9\x8E\x0D\x0A"]);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("links.azw");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();

    let html = std::fs::read_to_string(outdir.join("mobi7/book.html")).unwrap();
    assert!(html.contains("href=\"#filepos40\""), "{html}");
    assert!(html.contains("<a id=\"filepos40\" />"), "{html}");
    assert!(!html.contains("filepos=0"));
}

#[test]
fn rejects_encrypted_container() {
    let mut rec0 = make_record0(10, 1, 1);
    rec0[0x0C..0x0E].copy_from_slice(&2u16.to_be_bytes());
    let container = make_container(&[&rec0, b"0123456789", b"\xE9\x8E\x0D\x0A"]);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("drm.mobi");
    std::fs::write(&infile, container).unwrap();

    let err = unpack_book(&infile, &tmp.path().join("out"), &UnpackOptions::default())
        .unwrap_err();
    assert!(matches!(err, mobiunpack::Error::Encrypted));
}

#[test]
fn rejects_unknown_identifier() {
    let mut container = make_container(&[&make_record0(1, 1, 1), b"x"]);
    container[60..68].copy_from_slice(b"NOTABOOK");

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("bad.mobi");
    std::fs::write(&infile, container).unwrap();

    let err = unpack_book(&infile, &tmp.path().join("out"), &UnpackOptions::default())
        .unwrap_err();
    assert!(matches!(err, mobiunpack::Error::InvalidFormat(_)));
}

#[test]
fn extracts_images_and_rewrites_recindex() {
    let text = b"<html><body><img recindex=\"00001\"/></body></html>".to_vec();
    let mut rec0 = make_record0(text.len() as u32, 1, 1);
    // first resource record is 2
    rec0[0x6C..0x70].copy_from_slice(&2u32.to_be_bytes());
    let mut gif = b"GIF89a".to_vec();
    gif.extend_from_slice(&[0u8; 20]);
    let container = make_container(&[&rec0, &text, &gif, b"\xE9\x8E\x0D\x0A"]);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("img.mobi");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();

    assert!(outdir.join("mobi7/Images/image00002.gif").exists());
    let html = std::fs::read_to_string(outdir.join("mobi7/book.html")).unwrap();
    assert!(html.contains("src=\"Images/image00002.gif\""), "{html}");
    let opf = std::fs::read_to_string(outdir.join("mobi7/content.opf")).unwrap();
    assert!(opf.contains("href=\"Images/image00002.gif\""));
}

#[test]
fn cli_like_default_outdir() {
    // double-check the library accepts non-existent nested outdirs
    let text = b"<html><body>ok</body></html>";
    let rec0 = make_record0(text.len() as u32, 1, 1);
    let container = make_container(&[&rec0, text, b"\xE9\x8E\x0D\x0A"]);

    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("nested.prc");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("a/b/out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();
    assert!(outdir.join("mobi7/book.html").exists());
}

#[test]
fn guide_start_offset_reference() {
    let text = b"<html><body>start here</body></html>".to_vec();
    let mut rec0 = make_record0(text.len() as u32, 1, 1);
    // EXTH with StartOffset 0xffffffff then 12 (last one wins)
    rec0[0x80..0x84].copy_from_slice(&0x40u32.to_be_bytes());
    let mut exth = Vec::new();
    exth.extend_from_slice(b"EXTH");
    exth.extend_from_slice(&36u32.to_be_bytes());
    exth.extend_from_slice(&2u32.to_be_bytes());
    for value in [0xFFFF_FFFFu32, 12] {
        exth.extend_from_slice(&116u32.to_be_bytes());
        exth.extend_from_slice(&12u32.to_be_bytes());
        exth.extend_from_slice(&value.to_be_bytes());
    }
    rec0.extend_from_slice(&exth);

    let container = make_container(&[&rec0, &text, b"\xE9\x8E\x0D\x0A"]);
    let tmp = tempfile::tempdir().unwrap();
    let infile = tmp.path().join("start.mobi");
    std::fs::write(&infile, container).unwrap();
    let outdir = tmp.path().join("out");

    unpack_book(&infile, &outdir, &UnpackOptions::default()).unwrap();

    let opf = std::fs::read_to_string(outdir.join("mobi7/content.opf")).unwrap();
    assert!(opf.contains("<reference type=\"text\" href=\"book.html#filepos12\" />"), "{opf}");
}
