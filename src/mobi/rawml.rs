//! rawML assembly: per-record trailing-data trimming, decompression, and
//! concatenation of all text records into one buffer.

use crate::error::Result;
use crate::mobi::headers::{Compression, MobiHeader, NULL_INDEX};
use crate::mobi::huffcdic::HuffCdic;
use crate::mobi::palmdoc;
use crate::pdb::Sectionizer;

/// Reverse variable-width size at the record tail: scan the last up-to-4
/// bytes in order, resetting the accumulator whenever the high bit is
/// set, accumulating 7 bits per byte.
fn trailing_entry_size(data: &[u8]) -> usize {
    let tail = &data[data.len().saturating_sub(4)..];
    let mut num = 0usize;
    for &byte in tail {
        if byte & 0x80 != 0 {
            num = 0;
        }
        num = (num << 7) | (byte & 0x7F) as usize;
    }
    num
}

/// Trim the declared trailing entries off a text record, then the
/// multibyte-overlap bytes (`1 + (last & 3)`).
pub fn trim_trailing_entries(record: &[u8], trailers: usize, multibyte: bool) -> &[u8] {
    let mut end = record.len();
    for _ in 0..trailers {
        let size = trailing_entry_size(&record[..end]);
        if size > 0 && size <= end {
            end -= size;
        }
    }
    if multibyte && end > 0 {
        let overlap = (record[end - 1] & 3) as usize + 1;
        end = end.saturating_sub(overlap);
    }
    &record[..end]
}

/// Split the 0xF2 flags word: bit 0 is the multibyte-overlap flag, each
/// higher set bit is one variable-length trailer entry.
pub fn trail_counts(flags: u16) -> (usize, bool) {
    let multibyte = flags & 1 != 0;
    let mut trailers = 0;
    let mut flags = flags;
    while flags > 1 {
        if flags & 2 != 0 {
            trailers += 1;
        }
        flags >>= 1;
    }
    (trailers, multibyte)
}

enum Decompressor {
    Identity,
    PalmDoc,
    HuffCdic(HuffCdic),
}

impl Decompressor {
    fn for_header(sect: &Sectionizer, mh: &MobiHeader) -> Result<Self> {
        Ok(match mh.compression {
            Compression::None => Decompressor::Identity,
            Compression::PalmDoc => Decompressor::PalmDoc,
            Compression::HuffCdic => {
                if mh.huff_offset == NULL_INDEX {
                    return Err(crate::error::Error::InvalidFormat(
                        "huff-compressed text without a HUFF record".into(),
                    ));
                }
                let huff_record = mh.huff_offset as usize + mh.start;
                sect.set_section_description(huff_record, "Huffman Compression Seed");
                let huff = sect.section_checked(huff_record)?;
                let mut cdics = Vec::new();
                for i in 1..mh.huff_count as usize {
                    sect.set_section_description(
                        huff_record + i,
                        format!("Huffman CDIC Compression Seed {i}"),
                    );
                    cdics.push(sect.section_checked(huff_record + i)?);
                }
                Decompressor::HuffCdic(HuffCdic::new(huff, cdics)?)
            }
        })
    }

    fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Decompressor::Identity => Ok(data.to_vec()),
            Decompressor::PalmDoc => palmdoc::decompress(data),
            Decompressor::HuffCdic(reader) => reader.decompress(data),
        }
    }
}

/// Decompress and concatenate all text records of one payload.
pub fn raw_ml(sect: &Sectionizer, mh: &MobiHeader) -> Result<Vec<u8>> {
    let (trailers, multibyte) = trail_counts(mh.trail_flags());
    let mut decompressor = Decompressor::for_header(sect, mh)?;

    log::info!("unpacking raw markup language");
    let mut raw = Vec::with_capacity(mh.text_length as usize);
    for i in 1..=mh.records as usize {
        let record = sect.section_checked(mh.start + i)?;
        let trimmed = trim_trailing_entries(record, trailers, multibyte);
        raw.extend_from_slice(&decompressor.decompress(trimmed)?);

        let kind = if mh.is_k8() {
            "KF8"
        } else if mh.version == 0 {
            "PalmDOC"
        } else {
            "Mobipocket"
        };
        sect.set_section_description(mh.start + i, format!("{kind} Text Section {i}"));
    }

    if raw.len() != mh.text_length as usize {
        log::warn!(
            "rawML length {} does not match header text length {}",
            raw.len(),
            mh.text_length
        );
    }
    Ok(raw)
}
