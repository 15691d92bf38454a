//! Mobi header (record 0) parsing for PalmDOC, Mobi 6 and KF8 headers.

use crate::error::{Error, Result};
use crate::mobi::exth::{self, Metadata};
use crate::mobi::language_tag;
use crate::pdb::Sectionizer;

pub const NULL_INDEX: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    PalmDoc,
    HuffCdic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Windows1252,
    Utf8,
}

impl Codec {
    pub fn name(self) -> &'static str {
        match self {
            Codec::Windows1252 => "windows-1252",
            Codec::Utf8 => "utf-8",
        }
    }
}

/// Parsed Mobi header. One per payload in the container: record 0 always,
/// and a second one at `boundary + 1` for combo files.
///
/// Index pointers are absolute record numbers (the owning header's start
/// record has already been added); `NULL_INDEX` means absent.
#[derive(Debug)]
pub struct MobiHeader {
    /// Record number this header was read from.
    pub start: usize,
    /// Copy of the full record 0 bytes (EXTH lives inside it).
    pub header: Vec<u8>,
    /// Legacy `TEXtREAd` container with a bare PalmDOC header.
    pub palm: bool,

    pub compression: Compression,
    pub text_length: u32,
    pub records: u16,
    pub crypto_type: u16,
    pub length: u32,
    pub mobi_type: u32,
    pub codepage: u32,
    pub codec: Codec,
    pub unique_id: u32,
    pub version: u32,
    pub title: String,
    pub exth_flags: u32,

    pub first_nontext: usize,
    pub first_resource: usize,
    pub ncx_index: u32,
    pub skel_index: u32,
    pub frag_index: u32,
    pub guide_index: u32,
    pub fdst_index: u32,
    pub fdst_count: u32,
    pub meta_orth_index: u32,
    pub meta_infl_index: u32,
    pub huff_offset: u32,
    pub huff_count: u32,

    /// First four bytes of the first text record; `%MOP` marks a Print
    /// Replica payload.
    pub ml_start: [u8; 4],

    pub metadata: Metadata,
}

fn u16_at(data: &[u8], pos: usize) -> u16 {
    u16::from_be_bytes([data[pos], data[pos + 1]])
}

fn u32_at(data: &[u8], pos: usize) -> u32 {
    u32::from_be_bytes([data[pos], data[pos + 1], data[pos + 2], data[pos + 3]])
}

impl MobiHeader {
    pub fn parse(sect: &Sectionizer, start: usize) -> Result<Self> {
        let header = sect.section_checked(start)?.to_vec();

        let palm = if header.len() > 20 && &header[16..20] == b"MOBI" {
            sect.set_section_description(start, "Mobipocket Header");
            false
        } else if &sect.ident == b"TEXtREAd" {
            sect.set_section_description(start, "PalmDOC Header");
            true
        } else {
            return Err(Error::InvalidFormat("record 0 carries no MOBI header".into()));
        };

        let compression = match u16_at(&header, 0x00) {
            1 => Compression::None,
            2 => Compression::PalmDoc,
            0x4448 => Compression::HuffCdic,
            n => return Err(Error::UnsupportedCompression(n)),
        };
        let text_length = u32_at(&header, 0x04);
        let records = u16_at(&header, 0x08);

        let ml_start = {
            let first = sect.section_checked(start + 1)?;
            let mut magic = [0u8; 4];
            let n = first.len().min(4);
            magic[..n].copy_from_slice(&first[..n]);
            magic
        };

        let mut mh = Self {
            start,
            palm,
            compression,
            text_length,
            records,
            crypto_type: 0,
            length: header.len().saturating_sub(16) as u32,
            mobi_type: 3,
            codepage: 1252,
            codec: Codec::Windows1252,
            unique_id: 0,
            version: 0,
            title: String::from_utf8_lossy(sect.palm_name()).into_owned(),
            exth_flags: 0,
            first_nontext: start + records as usize + 1,
            first_resource: start + records as usize + 1,
            ncx_index: NULL_INDEX,
            skel_index: NULL_INDEX,
            frag_index: NULL_INDEX,
            guide_index: NULL_INDEX,
            fdst_index: NULL_INDEX,
            fdst_count: 0,
            meta_orth_index: NULL_INDEX,
            meta_infl_index: NULL_INDEX,
            huff_offset: NULL_INDEX,
            huff_count: 0,
            ml_start,
            metadata: Metadata::new(),
            header,
        };

        if mh.palm {
            mh.finish_metadata();
            return Ok(mh);
        }

        let header = mh.header.clone();
        // short ancient headers stop early; missing fields keep defaults
        let u32_or = |pos: usize, default: u32| -> u32 {
            if pos + 4 <= header.len() { u32_at(&header, pos) } else { default }
        };

        mh.length = u32_or(0x14, mh.length);
        mh.mobi_type = u32_or(0x18, mh.mobi_type);
        mh.codepage = u32_or(0x1C, mh.codepage);
        mh.unique_id = u32_or(0x20, 0);
        mh.version = u32_or(0x24, 0);
        if mh.codepage == 65001 {
            mh.codec = Codec::Utf8;
        }
        mh.crypto_type = u16_at(&header, 0x0C);

        let title_offset = u32_or(0x54, 0) as usize;
        let title_length = u32_or(0x58, 0) as usize;
        if title_offset > 0 && title_offset + title_length <= header.len() {
            mh.title =
                super::decode_text(mh.codec, &header[title_offset..title_offset + title_length]);
        }

        mh.exth_flags = u32_or(0x80, 0);
        if mh.has_exth() {
            let exth_offset = mh.length as usize + 16;
            if exth_offset + 8 <= header.len() {
                let exth_length = ((u32_at(&header, exth_offset + 4) as usize + 3) >> 2) << 2;
                let exth_end = (exth_offset + exth_length).min(header.len());
                mh.metadata = exth::parse_exth(&header[exth_offset..exth_end], mh.codec);
            }
        }

        let first_resource = u32_or(0x6C, NULL_INDEX);
        if first_resource != NULL_INDEX {
            mh.first_resource = first_resource as usize + start;
        }
        let first_nontext = u32_or(0x50, NULL_INDEX);
        if first_nontext != NULL_INDEX {
            mh.first_nontext = first_nontext as usize + start;
        }

        if mh.compression == Compression::HuffCdic {
            mh.huff_offset = u32_or(0x70, NULL_INDEX);
            mh.huff_count = u32_or(0x74, 0);
        }

        if mh.is_print_replica() {
            mh.finish_metadata();
            return Ok(mh);
        }

        if mh.version < 8 {
            mh.meta_orth_index = u32_or(0x28, NULL_INDEX);
            if mh.meta_orth_index != NULL_INDEX {
                mh.meta_orth_index += start as u32;
            }
            mh.meta_infl_index = u32_or(0x2C, NULL_INDEX);
            if mh.meta_infl_index != NULL_INDEX {
                mh.meta_infl_index += start as u32;
            }
        }

        // Older 0xE4-length headers stop before the NCX pointer.
        if (mh.length as usize + 16) < 0xF8 {
            mh.finish_metadata();
            return Ok(mh);
        }

        mh.ncx_index = u32_or(0xF4, NULL_INDEX);
        if mh.ncx_index != NULL_INDEX {
            mh.ncx_index += start as u32;
        }

        if start != 0 || mh.version == 8 {
            mh.skel_index = u32_or(0xFC, NULL_INDEX);
            if mh.skel_index != NULL_INDEX {
                mh.skel_index += start as u32;
            }
            mh.frag_index = u32_or(0xF8, NULL_INDEX);
            if mh.frag_index != NULL_INDEX {
                mh.frag_index += start as u32;
            }
            mh.guide_index = u32_or(0x104, NULL_INDEX);
            if mh.guide_index != NULL_INDEX {
                mh.guide_index += start as u32;
            }

            // KF8 payloads never carry the Mobi 6 dictionary indexes.
            mh.meta_orth_index = NULL_INDEX;
            mh.meta_infl_index = NULL_INDEX;

            mh.fdst_index = u32_or(0xC0, NULL_INDEX);
            mh.fdst_count = u32_or(0xC4, 0);
            // a flow count of 1 or less leaves the FDST pointer unreliable
            if mh.fdst_count <= 1 {
                mh.fdst_index = NULL_INDEX;
            }
            if mh.fdst_index != NULL_INDEX {
                mh.fdst_index += start as u32;
            }
        }

        mh.finish_metadata();
        Ok(mh)
    }

    fn finish_metadata(&mut self) {
        let title = self.title.clone();
        let codec = self.codec;
        let language = self.language().to_string();
        let unique_id = self.unique_id;
        exth::add_defaults(&mut self.metadata, &title, codec, &language, unique_id);
    }

    pub fn has_exth(&self) -> bool {
        self.exth_flags & 0x40 != 0
    }

    pub fn is_k8(&self) -> bool {
        self.start != 0 || self.version == 8
    }

    pub fn is_encrypted(&self) -> bool {
        self.crypto_type != 0
    }

    pub fn is_print_replica(&self) -> bool {
        &self.ml_start == b"%MOP"
    }

    pub fn has_ncx(&self) -> bool {
        self.ncx_index != NULL_INDEX
    }

    pub fn is_dictionary(&self) -> bool {
        self.meta_orth_index != NULL_INDEX
    }

    pub fn language(&self) -> &'static str {
        if self.palm || self.header.len() < 0x60 {
            return "en";
        }
        let code = u32_at(&self.header, 0x5C);
        language_tag((code & 0xFF) as u8, ((code >> 8) & 0xFF) as u8)
    }

    pub fn dict_in_language(&self) -> Option<&'static str> {
        self.dict_language(0x60)
    }

    pub fn dict_out_language(&self) -> Option<&'static str> {
        self.dict_language(0x64)
    }

    fn dict_language(&self, offset: usize) -> Option<&'static str> {
        if !self.is_dictionary() || self.header.len() < offset + 4 {
            return None;
        }
        let code = u32_at(&self.header, offset);
        let lang_id = (code & 0xFF) as u8;
        if lang_id == 0 {
            return None;
        }
        Some(language_tag(lang_id, ((code >> 10) & 0xFF) as u8))
    }

    /// Trailing-data flags at 0xF2: bit 0 is the multibyte-overlap flag,
    /// higher bits count variable-length trailer entries.
    pub fn trail_flags(&self) -> u16 {
        if self.palm || (self.length as usize) < 0xE4 || self.version < 5 {
            return 0;
        }
        if self.header.len() < 0xF4 {
            return 0;
        }
        u16_at(&self.header, 0xF2)
    }

    pub fn describe(&self, dump: bool) {
        log::info!("Mobi version: {}", self.version);
        log::info!("Codec: {}", self.codec.name());
        log::info!("Title: {}", self.title);
        match self.compression {
            Compression::HuffCdic => log::info!("Huffdic compression"),
            Compression::PalmDoc => log::info!("Palmdoc compression"),
            Compression::None => log::info!("No compression"),
        }
        if dump {
            self.dump_header();
        }
    }

    /// Dump the version-specific header field table (the `-d` surface).
    pub fn dump_header(&self) {
        println!(
            "Dumping section {}, Mobipocket header version {}, total length {}",
            self.start,
            self.version,
            self.length + 16
        );
        println!("     Offset  Value Hex  Dec        Description");
        for &(pos, size, name) in self.field_layout() {
            if pos + size > self.header.len() || pos >= self.length as usize + 16 {
                continue;
            }
            let value: u64 = match size {
                2 => u16_at(&self.header, pos) as u64,
                _ => u32_at(&self.header, pos) as u64,
            };
            println!("0x{pos:03X} ({pos:3})  0x{value:08X} {value:10} {name}");
        }
        if self.has_exth() {
            println!();
            let exth_offset = (self.length as usize + 16).min(self.header.len());
            exth::dump_exth(&self.header[exth_offset..], self.codec);
        }
    }

    fn field_layout(&self) -> &'static [(usize, usize, &'static str)] {
        if self.palm || self.version == 0 {
            PALMDOC_FIELDS
        } else if self.version < 8 {
            MOBI6_FIELDS
        } else {
            MOBI8_FIELDS
        }
    }
}

const PALMDOC_FIELDS: &[(usize, usize, &str)] = &[
    (0x00, 2, "compression_type"),
    (0x04, 4, "text_length"),
    (0x08, 2, "text_records"),
    (0x0A, 2, "max_section_size"),
    (0x0C, 4, "read_pos"),
];

const MOBI6_FIELDS: &[(usize, usize, &str)] = &[
    (0x00, 2, "compression_type"),
    (0x04, 4, "text_length"),
    (0x08, 2, "text_records"),
    (0x0A, 2, "max_section_size"),
    (0x0C, 2, "crypto_type"),
    (0x14, 4, "header_length"),
    (0x18, 4, "type"),
    (0x1C, 4, "codepage"),
    (0x20, 4, "unique_id"),
    (0x24, 4, "version"),
    (0x28, 4, "meta_orth_index"),
    (0x2C, 4, "meta_infl_index"),
    (0x50, 4, "first_nontext"),
    (0x54, 4, "title_offset"),
    (0x58, 4, "title_length"),
    (0x5C, 4, "language_code"),
    (0x60, 4, "dict_in_lang"),
    (0x64, 4, "dict_out_lang"),
    (0x68, 4, "min_version"),
    (0x6C, 4, "first_resc_offset"),
    (0x70, 4, "huff_offset"),
    (0x74, 4, "huff_num"),
    (0x80, 4, "exth_flags"),
    (0xC0, 2, "first_content"),
    (0xC2, 2, "last_content"),
    (0xC8, 4, "fcis_offset"),
    (0xD0, 4, "flis_offset"),
    (0xE0, 4, "srcs_offset"),
    (0xE4, 4, "srcs_count"),
    (0xF2, 2, "traildata_flags"),
    (0xF4, 4, "ncx_index"),
    (0x100, 4, "datp_offset"),
];

const MOBI8_FIELDS: &[(usize, usize, &str)] = &[
    (0x00, 2, "compression_type"),
    (0x04, 4, "text_length"),
    (0x08, 2, "text_records"),
    (0x0A, 2, "max_section_size"),
    (0x0C, 2, "crypto_type"),
    (0x14, 4, "header_length"),
    (0x18, 4, "type"),
    (0x1C, 4, "codepage"),
    (0x20, 4, "unique_id"),
    (0x24, 4, "version"),
    (0x50, 4, "first_nontext"),
    (0x54, 4, "title_offset"),
    (0x58, 4, "title_length"),
    (0x5C, 4, "language_code"),
    (0x68, 4, "min_version"),
    (0x6C, 4, "first_resc_offset"),
    (0x70, 4, "huff_offset"),
    (0x74, 4, "huff_num"),
    (0x80, 4, "exth_flags"),
    (0xC0, 4, "fdst_offset"),
    (0xC4, 4, "fdst_flow_count"),
    (0xC8, 4, "fcis_offset"),
    (0xD0, 4, "flis_offset"),
    (0xE0, 4, "srcs_offset"),
    (0xE4, 4, "srcs_count"),
    (0xF2, 2, "traildata_flags"),
    (0xF4, 4, "ncx_index"),
    (0xF8, 4, "fragment_index"),
    (0xFC, 4, "skeleton_index"),
    (0x100, 4, "datp_offset"),
    (0x104, 4, "guide_index"),
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdb::PALM_HEADER_LEN;

    pub(crate) fn make_container(record0: &[u8], records: &[&[u8]]) -> Sectionizer {
        let nsec = records.len() + 1;
        let mut data = vec![0u8; PALM_HEADER_LEN + nsec * 8];
        data[..4].copy_from_slice(b"Test");
        data[60..68].copy_from_slice(b"BOOKMOBI");
        data[76..78].copy_from_slice(&(nsec as u16).to_be_bytes());

        let mut offset = data.len() as u32;
        let all: Vec<&[u8]> = std::iter::once(record0).chain(records.iter().copied()).collect();
        for (i, payload) in all.iter().enumerate() {
            let pos = PALM_HEADER_LEN + i * 8;
            data[pos..pos + 4].copy_from_slice(&offset.to_be_bytes());
            offset += payload.len() as u32;
        }
        for payload in &all {
            data.extend_from_slice(payload);
        }
        Sectionizer::from_bytes(data).unwrap()
    }

    pub(crate) fn make_record0(version: u32, compression: u16) -> Vec<u8> {
        let mut rec0 = vec![0u8; 0x110];
        rec0[0..2].copy_from_slice(&compression.to_be_bytes());
        rec0[8..10].copy_from_slice(&1u16.to_be_bytes());
        rec0[16..20].copy_from_slice(b"MOBI");
        rec0[0x14..0x18].copy_from_slice(&0x100u32.to_be_bytes()); // header length
        rec0[0x1C..0x20].copy_from_slice(&65001u32.to_be_bytes());
        rec0[0x24..0x28].copy_from_slice(&version.to_be_bytes());
        // absent indexes
        for off in [0x28, 0x2C, 0x50, 0x6C, 0xC0, 0xF4, 0xF8, 0xFC, 0x104] {
            rec0[off..off + 4].copy_from_slice(&NULL_INDEX.to_be_bytes());
        }
        rec0
    }

    #[test]
    fn test_parse_minimal_kf8_header() {
        let rec0 = make_record0(8, 1);
        let sect = make_container(&rec0, &[b"<html/>"]);
        let mh = MobiHeader::parse(&sect, 0).unwrap();

        assert_eq!(mh.version, 8);
        assert!(mh.is_k8());
        assert!(!mh.is_encrypted());
        assert_eq!(mh.codec, Codec::Utf8);
        assert_eq!(mh.compression, Compression::None);
        assert_eq!(mh.skel_index, NULL_INDEX);
        assert_eq!(mh.fdst_index, NULL_INDEX);
    }

    #[test]
    fn test_index_pointers_are_rebased() {
        let mut rec0 = make_record0(8, 1);
        rec0[0xF4..0xF8].copy_from_slice(&3u32.to_be_bytes()); // ncx
        rec0[0xFC..0x100].copy_from_slice(&4u32.to_be_bytes()); // skel
        let sect = make_container(&rec0, &[b"text", b"a", b"b", b"c", b"d"]);

        let mh = MobiHeader::parse(&sect, 0).unwrap();
        assert_eq!(mh.ncx_index, 3);
        assert_eq!(mh.skel_index, 4);
    }

    #[test]
    fn test_fdst_count_sentinel_disables_pointer() {
        let mut rec0 = make_record0(8, 1);
        rec0[0xC0..0xC4].copy_from_slice(&2u32.to_be_bytes());
        rec0[0xC4..0xC8].copy_from_slice(&1u32.to_be_bytes()); // count <= 1
        let sect = make_container(&rec0, &[b"text", b"x", b"y"]);

        let mh = MobiHeader::parse(&sect, 0).unwrap();
        assert_eq!(mh.fdst_index, NULL_INDEX);
    }

    #[test]
    fn test_encryption_detected() {
        let mut rec0 = make_record0(6, 2);
        rec0[0x0C..0x0E].copy_from_slice(&2u16.to_be_bytes());
        let sect = make_container(&rec0, &[b"text"]);

        let mh = MobiHeader::parse(&sect, 0).unwrap();
        assert!(mh.is_encrypted());
    }

    #[test]
    fn test_unsupported_compression_rejected() {
        let rec0 = make_record0(6, 0x1234);
        let sect = make_container(&rec0, &[b"text"]);
        assert!(matches!(
            MobiHeader::parse(&sect, 0),
            Err(Error::UnsupportedCompression(0x1234))
        ));
    }

    #[test]
    fn test_mobi6_keeps_dictionary_indexes() {
        let mut rec0 = make_record0(6, 1);
        rec0[0x28..0x2C].copy_from_slice(&2u32.to_be_bytes());
        let sect = make_container(&rec0, &[b"text", b"orth"]);

        let mh = MobiHeader::parse(&sect, 0).unwrap();
        assert!(mh.is_dictionary());
        assert_eq!(mh.meta_orth_index, 2);
        assert!(!mh.is_k8());
    }

    #[test]
    fn test_defaults_synthesised() {
        let rec0 = make_record0(6, 1);
        let sect = make_container(&rec0, &[b"text"]);
        let mh = MobiHeader::parse(&sect, 0).unwrap();

        assert!(mh.metadata.first("ASIN").is_some());
        assert_eq!(mh.metadata.first("cdeType").as_deref(), Some("EBOK"));
        assert_eq!(mh.metadata.first("Language").as_deref(), Some("en"));
        assert_eq!(mh.metadata.first("Codec").as_deref(), Some("utf-8"));
    }
}
