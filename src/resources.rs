//! Resource record classification.
//!
//! Everything between the text records and the trailer is a resource:
//! images, fonts, HD image replacements, the kindlegen source archive
//! and build log, page maps, the RESC opf snippet, container headers,
//! boundary markers, and placeholders. Each record is classified by its
//! leading bytes and routed; recognised resources land in the parallel
//! `rscnames` array so base-32 references resolve by index.

use std::io::Read;

use flate2::read::ZlibDecoder;

use crate::cover::get_image_type;
use crate::error::Result;
use crate::mobi::exth;
use crate::mobi::headers::{Codec, MobiHeader};
use crate::pagemap::{ApnxMeta, PageMapProcessor};
use crate::pdb::{Sectionizer, describe};
use crate::resc::RescDoc;
use crate::structure::{KINDLEGENLOG_FILENAME, KINDLEGENSRC_FILENAME, OutputTree};

const EOF_RECORD: &[u8] = b"\xE9\x8E\x0D\x0A";

#[derive(Default)]
pub struct ResourceOutput {
    /// One entry per resource record from `first_resource`; `None` slots
    /// keep the indices aligned with their base-32 references.
    pub rscnames: Vec<Option<String>>,
    /// Font files that need the obfuscation key reapplied at packaging.
    pub obfuscate_data: Vec<String>,
    pub k8resc: Option<RescDoc>,
    pub pagemap: Option<PageMapProcessor>,
    /// Index into rscnames of the first real resource, advanced by HD
    /// replacements so they track their low-res counterparts. Shared
    /// across both payloads of a combo file.
    rsc_ptr: i64,
}

impl ResourceOutput {
    pub fn new() -> Self {
        Self { rsc_ptr: -1, ..Default::default() }
    }
}

/// Walk the resource records `[first_resource, end)` and extract each,
/// appending to `out` (a combo file's two payloads share one resource
/// list).
pub fn process_resources(
    sect: &Sectionizer,
    mh: &MobiHeader,
    end: usize,
    tree: &OutputTree,
    use_hd: bool,
    dump: bool,
    out: &mut ResourceOutput,
) -> Result<()> {
    log::info!("unpacking images, resources, fonts, etc");
    let beg = mh.first_resource;
    let cover_offset = mh.metadata.first("CoverOffset").and_then(|v| v.parse::<usize>().ok());

    for i in beg..end {
        let data = sect.section_checked(i)?;
        let magic = &data[..4.min(data.len())];

        match magic {
            b"FLIS" | b"FCIS" | b"FDST" | b"DATP" => {
                if dump {
                    let name = format!("{}{:05}.dat", String::from_utf8_lossy(magic), i);
                    std::fs::write(tree.outdir.join(&name), data)?;
                }
                sect.set_section_description(i, format!("Type {}", String::from_utf8_lossy(magic)));
                out.rscnames.push(None);
            }
            b"SRCS" => {
                log::info!(
                    "file contains kindlegen source archive, extracting as {KINDLEGENSRC_FILENAME}"
                );
                std::fs::write(tree.outdir.join(KINDLEGENSRC_FILENAME), &data[16.min(data.len())..])?;
                sect.set_section_description(i, "Zipped Source Files");
                out.rscnames.push(None);
            }
            b"PAGE" => {
                out.pagemap = PageMapProcessor::parse(data);
                if let Some(pagemap) = &out.pagemap {
                    write_apnx(sect, mh, tree, pagemap)?;
                }
                sect.set_section_description(i, "PageMap");
                out.rscnames.push(None);
            }
            b"CMET" => {
                log::info!(
                    "file contains kindlegen build log, extracting as {KINDLEGENLOG_FILENAME}"
                );
                std::fs::write(tree.outdir.join(KINDLEGENLOG_FILENAME), &data[10.min(data.len())..])?;
                sect.set_section_description(i, "Kindlegen log");
                out.rscnames.push(None);
            }
            b"FONT" => {
                process_font(i, data, sect, tree, beg, out)?;
            }
            b"CRES" => {
                process_cres(i, data, sect, tree, use_hd, out)?;
            }
            b"CONT" => {
                if data.len() >= 12 && &data[..12] == b"CONTBOUNDARY" {
                    sect.set_section_description(i, "CONTAINER BOUNDARY");
                } else {
                    sect.set_section_description(i, "CONT Header");
                    // layout beyond the embedded EXTH is unknown
                    if dump && data.len() > 48 {
                        let cpage =
                            u32::from_be_bytes([data[12], data[13], data[14], data[15]]);
                        let codec = if cpage == 65001 { Codec::Utf8 } else { Codec::Windows1252 };
                        println!("Container EXTH dump");
                        exth::dump_exth(&data[48..], codec);
                    }
                }
                out.rscnames.push(None);
            }
            b"kind" => {
                if data.len() >= 12 && &data[..12] == b"kindle:embed" {
                    sect.set_section_description(i, "HD Image Container Description String");
                }
                out.rscnames.push(None);
            }
            b"\xA0\xA0\xA0\xA0" => {
                sect.set_section_description(i, "Empty_HD_Image/Resource_Placeholder");
                out.rscnames.push(None);
                out.rsc_ptr += 1;
            }
            b"RESC" => {
                out.k8resc = Some(RescDoc::parse(&data[16.min(data.len())..]));
                sect.set_section_description(i, "K8 RESC section");
                out.rscnames.push(None);
            }
            b"BOUN" if data.starts_with(b"BOUNDARY") => {
                sect.set_section_description(i, "BOUNDARY Marker");
                out.rscnames.push(None);
            }
            _ if data == EOF_RECORD => {
                sect.set_section_description(i, "End Of File");
                out.rscnames.push(None);
            }
            _ => {
                process_image(i, data, sect, tree, beg, cover_offset, out)?;
            }
        }
    }

    Ok(())
}

/// FONT record layout: `FONT`, u32 uncompressed size, u32 flags (0x1
/// zlib, 0x2 XOR obfuscation), u32 data offset, u32 XOR key length,
/// u32 XOR key offset.
fn process_font(
    i: usize,
    data: &[u8],
    sect: &Sectionizer,
    tree: &OutputTree,
    beg: usize,
    out: &mut ResourceOutput,
) -> Result<()> {
    let fontname = format!("font{i:05}");
    let filename = match decode_font(data) {
        Ok((font_data, ext, obfuscated)) => {
            log::info!("extracting font {fontname}{ext}");
            let filename = format!("{fontname}{ext}");
            std::fs::write(tree.imgdir.join(&filename), &font_data)?;
            if obfuscated && (ext == ".ttf" || ext == ".otf") {
                out.obfuscate_data.push(filename.clone());
            }
            sect.set_section_description(i, format!("Font {filename}"));
            filename
        }
        Err(err) => {
            log::warn!("failed to extract font {fontname} from section {i}: {err}");
            let filename = format!("{fontname}.failed");
            std::fs::write(tree.imgdir.join(&filename), data)?;
            sect.set_section_description(i, format!("Failed Font {filename}"));
            filename
        }
    };
    out.rscnames.push(Some(filename));
    if out.rsc_ptr == -1 {
        out.rsc_ptr = (i - beg) as i64;
    }
    Ok(())
}

/// Decode a FONT record payload: optional XOR deobfuscation of the
/// first 1040 bytes, optional zlib inflation, extension by magic.
pub fn decode_font(data: &[u8]) -> Result<(Vec<u8>, &'static str, bool)> {
    if data.len() < 24 {
        return Err(crate::error::Error::InvalidFormat("FONT record too short".into()));
    }
    let u32_at =
        |o: usize| u32::from_be_bytes([data[o], data[o + 1], data[o + 2], data[o + 3]]) as usize;
    let _uncompressed_size = u32_at(4);
    let flags = u32_at(8);
    let dstart = u32_at(12);
    let xor_len = u32_at(16);
    let xor_start = u32_at(20);
    if dstart > data.len() {
        return Err(crate::error::Error::InvalidFormat("FONT data offset out of range".into()));
    }

    let mut font_data = data[dstart..].to_vec();
    let obfuscated = flags & 0x0002 != 0;
    if obfuscated {
        if xor_len == 0 || xor_start + xor_len > data.len() {
            return Err(crate::error::Error::InvalidFormat("FONT XOR key out of range".into()));
        }
        let key = &data[xor_start..xor_start + xor_len];
        let extent = font_data.len().min(1040);
        for (n, byte) in font_data.iter_mut().take(extent).enumerate() {
            *byte ^= key[n % xor_len];
        }
    }
    if flags & 0x0001 != 0 {
        let mut inflated = Vec::new();
        ZlibDecoder::new(font_data.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| crate::error::Error::InvalidFormat(format!("FONT zlib: {e}")))?;
        font_data = inflated;
    }

    let ext = match font_data.get(..4) {
        Some(b"\x00\x01\x00\x00") | Some(b"true") | Some(b"ttcf") => ".ttf",
        Some(b"OTTO") => ".otf",
        _ => {
            log::warn!("unknown font header {:02x?}", font_data.get(..4).unwrap_or_default());
            ".dat"
        }
    };
    Ok((font_data, ext, obfuscated))
}

/// CRES record: a 12-byte header then an HD image which either replaces
/// its low-res counterpart (`-i`) or spills into `HDImages/`.
fn process_cres(
    i: usize,
    data: &[u8],
    sect: &Sectionizer,
    tree: &OutputTree,
    use_hd: bool,
    out: &mut ResourceOutput,
) -> Result<()> {
    let payload = &data[12.min(data.len())..];
    let Some(imgtype) = get_image_type(payload) else {
        log::warn!("CRES section {i} does not contain a recognised resource");
        out.rscnames.push(None);
        sect.set_section_description(
            i,
            format!("Mysterious CRES data, first four bytes {}", describe(&payload[..4.min(payload.len())])),
        );
        out.rsc_ptr += 1;
        return Ok(());
    };

    if use_hd && out.rsc_ptr >= 0 {
        // overwrite the lower resolution image with the HD version
        if let Some(Some(imgname)) = out.rscnames.get(out.rsc_ptr as usize) {
            log::info!("extracting HD image {imgname} from section {i}");
            std::fs::write(tree.imgdir.join(imgname), payload)?;
            sect.set_section_description(i, format!("Optional HD Image {imgname}"));
        }
    } else {
        let imgname = format!("HDimage{i:05}.{imgtype}");
        log::info!("extracting HD image {imgname} from section {i}");
        std::fs::write(tree.hdimgdir.join(&imgname), payload)?;
        sect.set_section_description(i, format!("Optional HD Image {imgname}"));
    }
    out.rscnames.push(None);
    out.rsc_ptr += 1;
    Ok(())
}

fn process_image(
    i: usize,
    data: &[u8],
    sect: &Sectionizer,
    tree: &OutputTree,
    beg: usize,
    cover_offset: Option<usize>,
    out: &mut ResourceOutput,
) -> Result<()> {
    let Some(imgtype) = get_image_type(data) else {
        log::warn!("section {i} does not contain a recognised resource");
        sect.set_section_description(
            i,
            format!("Mysterious Section, first four bytes {}", describe(&data[..4.min(data.len())])),
        );
        out.rscnames.push(None);
        return Ok(());
    };

    let imgname = if cover_offset.map(|c| i == beg + c).unwrap_or(false) {
        format!("cover{i:05}.{imgtype}")
    } else {
        format!("image{i:05}.{imgtype}")
    };
    log::info!("extracting image {imgname} from section {i}");
    std::fs::write(tree.imgdir.join(&imgname), data)?;
    sect.set_section_description(i, format!("Image {imgname}"));
    out.rscnames.push(Some(imgname));
    if out.rsc_ptr == -1 {
        out.rsc_ptr = (i - beg) as i64;
    }
    Ok(())
}

fn write_apnx(
    sect: &Sectionizer,
    mh: &MobiHeader,
    tree: &OutputTree,
    pagemap: &PageMapProcessor,
) -> Result<()> {
    let unique_id: u64 =
        mh.metadata.first("UniqueID").and_then(|v| v.parse().ok()).unwrap_or(0);
    let meta = ApnxMeta {
        acr: String::from_utf8_lossy(sect.palm_name()).into_owned(),
        cde_type: mh.metadata.first("cdeType").unwrap_or_else(|| "EBOK".to_string()),
        content_guid: format!("{unique_id:x}"),
        asin: mh.metadata.first("ASIN").unwrap_or_default(),
        format: if mh.version == 8 { "MOBI_8".to_string() } else { "MOBI_7".to_string() },
    };
    let prefix = if mh.is_k8() { "mobi8" } else { "mobi7" };
    let name = format!("{prefix}-{}.apnx", tree.input_basename());
    std::fs::write(tree.outdir.join(name), pagemap.generate_apnx(&meta))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn make_font_record(payload: &[u8], flags: u32, key: &[u8]) -> Vec<u8> {
        let mut body = payload.to_vec();
        if flags & 0x0001 != 0 {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(payload).unwrap();
            body = encoder.finish().unwrap();
        }
        let dstart = 24 + key.len();
        let mut record = Vec::new();
        record.extend_from_slice(b"FONT");
        record.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        record.extend_from_slice(&flags.to_be_bytes());
        record.extend_from_slice(&(dstart as u32).to_be_bytes());
        record.extend_from_slice(&(key.len() as u32).to_be_bytes());
        record.extend_from_slice(&24u32.to_be_bytes());
        record.extend_from_slice(key);
        if flags & 0x0002 != 0 {
            let extent = body.len().min(1040);
            for n in 0..extent {
                body[n] ^= key[n % key.len()];
            }
        }
        record.extend_from_slice(&body);
        record
    }

    fn fake_ttf() -> Vec<u8> {
        let mut ttf = b"\x00\x01\x00\x00".to_vec();
        ttf.extend_from_slice(&[0x42; 2000]);
        ttf
    }

    #[test]
    fn test_decode_plain_font() {
        let ttf = fake_ttf();
        let record = make_font_record(&ttf, 0, &[]);
        let (data, ext, obfuscated) = decode_font(&record).unwrap();
        assert_eq!(data, ttf);
        assert_eq!(ext, ".ttf");
        assert!(!obfuscated);
    }

    #[test]
    fn test_decode_obfuscated_zlib_font() {
        // flags 0x3: XOR obfuscation plus zlib compression
        let ttf = fake_ttf();
        let key: Vec<u8> = (1..=32).collect();
        let record = make_font_record(&ttf, 0x3, &key);
        let (data, ext, obfuscated) = decode_font(&record).unwrap();

        assert!(data.starts_with(b"\x00\x01\x00\x00"));
        assert_eq!(data, ttf);
        assert_eq!(ext, ".ttf");
        assert!(obfuscated);
    }

    #[test]
    fn test_decode_otf() {
        let mut otf = b"OTTO".to_vec();
        otf.extend_from_slice(&[0x11; 64]);
        let record = make_font_record(&otf, 0, &[]);
        let (_, ext, _) = decode_font(&record).unwrap();
        assert_eq!(ext, ".otf");
    }

    #[test]
    fn test_decode_truncated_font_fails() {
        assert!(decode_font(b"FONT\x00\x00").is_err());
    }
}
