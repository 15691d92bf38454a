//! Huff/CDIC decompression (compression type 0x4448).
//!
//! One `HUFF` record carries two code tables; one or more `CDIC` records
//! carry the phrase dictionary. Decoding slides a 32-bit window over the
//! input bit stream, maps the top byte through the first table, walks the
//! min/max code tables for longer codes, and emits dictionary phrases.
//! Non-terminal phrases are themselves compressed and are unpacked once,
//! then memoised.

use crate::error::{Error, Result};

#[derive(Clone, Copy)]
struct Code {
    len: u8,
    terminal: bool,
    maxcode: u32,
}

enum Phrase {
    /// Literal phrase bytes (flag bit set in the CDIC entry).
    Literal(Vec<u8>),
    /// Compressed phrase, not yet unpacked.
    Packed(Vec<u8>),
}

pub struct HuffCdic {
    /// 256 entries indexed by the top byte of the code window.
    dict1: Vec<Code>,
    /// Per-code-length bounds, index 0 unused.
    mincode: [u32; 33],
    maxcode: [u32; 33],
    dictionary: Vec<Phrase>,
}

impl HuffCdic {
    pub fn new<'a>(huff: &[u8], cdics: impl IntoIterator<Item = &'a [u8]>) -> Result<Self> {
        let mut reader = Self {
            dict1: Vec::with_capacity(256),
            mincode: [0; 33],
            maxcode: [0; 33],
            dictionary: Vec::new(),
        };
        reader.load_huff(huff)?;
        for cdic in cdics {
            reader.load_cdic(cdic)?;
        }
        Ok(reader)
    }

    fn load_huff(&mut self, huff: &[u8]) -> Result<()> {
        if huff.len() < 16 || &huff[0..8] != b"HUFF\x00\x00\x00\x18" {
            return Err(Error::InvalidFormat("invalid HUFF header".into()));
        }
        let off1 = u32::from_be_bytes([huff[8], huff[9], huff[10], huff[11]]) as usize;
        let off2 = u32::from_be_bytes([huff[12], huff[13], huff[14], huff[15]]) as usize;
        if huff.len() < off1 + 256 * 4 || huff.len() < off2 + 64 * 4 {
            return Err(Error::InvalidFormat("HUFF code tables truncated".into()));
        }

        for i in 0..256 {
            let pos = off1 + i * 4;
            let v = u32::from_be_bytes([huff[pos], huff[pos + 1], huff[pos + 2], huff[pos + 3]]);
            let len = (v & 0x1F) as u8;
            if len == 0 {
                return Err(Error::InvalidFormat("HUFF entry with zero code length".into()));
            }
            let terminal = v & 0x80 != 0;
            if len <= 8 && !terminal {
                return Err(Error::InvalidFormat("HUFF short code not terminal".into()));
            }
            let maxcode = ((v >> 8) + 1).wrapping_shl(32 - len as u32).wrapping_sub(1);
            self.dict1.push(Code { len, terminal, maxcode });
        }

        for codelen in 1..=32usize {
            let pos = off2 + (codelen - 1) * 8;
            let min = u32::from_be_bytes([huff[pos], huff[pos + 1], huff[pos + 2], huff[pos + 3]]);
            let max =
                u32::from_be_bytes([huff[pos + 4], huff[pos + 5], huff[pos + 6], huff[pos + 7]]);
            self.mincode[codelen] = min.wrapping_shl(32 - codelen as u32);
            self.maxcode[codelen] = (max + 1).wrapping_shl(32 - codelen as u32).wrapping_sub(1);
        }

        Ok(())
    }

    fn load_cdic(&mut self, cdic: &[u8]) -> Result<()> {
        if cdic.len() < 16 || &cdic[0..8] != b"CDIC\x00\x00\x00\x10" {
            return Err(Error::InvalidFormat("invalid CDIC header".into()));
        }
        let phrases = u32::from_be_bytes([cdic[8], cdic[9], cdic[10], cdic[11]]) as usize;
        let bits = u32::from_be_bytes([cdic[12], cdic[13], cdic[14], cdic[15]]);

        // each CDIC holds at most 1<<bits phrases; the last one is short
        let n = (1usize << bits.min(24)).min(phrases.saturating_sub(self.dictionary.len()));
        if cdic.len() < 16 + n * 2 {
            return Err(Error::InvalidFormat("CDIC offset table truncated".into()));
        }

        for i in 0..n {
            let off_pos = 16 + i * 2;
            let off = u16::from_be_bytes([cdic[off_pos], cdic[off_pos + 1]]) as usize;
            if 16 + off + 2 > cdic.len() {
                return Err(Error::InvalidFormat("CDIC entry truncated".into()));
            }
            let blen = u16::from_be_bytes([cdic[16 + off], cdic[16 + off + 1]]);
            let start = 16 + off + 2;
            let end = (start + (blen & 0x7FFF) as usize).min(cdic.len());
            let slice = cdic[start..end].to_vec();
            self.dictionary.push(if blen & 0x8000 != 0 {
                Phrase::Literal(slice)
            } else {
                Phrase::Packed(slice)
            });
        }

        Ok(())
    }

    /// Decompress one text record.
    pub fn decompress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let mut output = Vec::with_capacity(data.len() * 4);
        self.unpack_into(data, &mut output)?;
        Ok(output)
    }

    fn unpack_into(&mut self, data: &[u8], output: &mut Vec<u8>) -> Result<()> {
        let mut bits_left = (data.len() * 8) as i64;

        // pad so the 64-bit window reads never run off the end
        let mut padded = data.to_vec();
        padded.extend_from_slice(&[0u8; 8]);

        let mut pos = 0usize;
        let mut x = u64::from_be_bytes(padded[pos..pos + 8].try_into().unwrap());
        let mut n: i32 = 32;

        while bits_left > 0 {
            if n <= 0 {
                pos += 4;
                x = u64::from_be_bytes(padded[pos..pos + 8].try_into().unwrap());
                n += 32;
            }
            let code = ((x >> n) & 0xFFFF_FFFF) as u32;

            let entry = self.dict1[(code >> 24) as usize];
            let mut codelen = entry.len as usize;
            let mut maxcode = entry.maxcode;
            if !entry.terminal {
                while codelen < 32 && code < self.mincode[codelen] {
                    codelen += 1;
                }
                maxcode = self.maxcode[codelen];
            }

            n -= codelen as i32;
            bits_left -= codelen as i64;
            if bits_left < 0 {
                break;
            }

            let index = (maxcode.wrapping_sub(code) >> (32 - codelen)) as usize;
            if index >= self.dictionary.len() {
                return Err(Error::InvalidFormat(format!(
                    "huffcdic: dictionary index {index} out of bounds ({} phrases)",
                    self.dictionary.len()
                )));
            }

            match &self.dictionary[index] {
                Phrase::Literal(slice) => output.extend_from_slice(slice),
                Phrase::Packed(slice) => {
                    let packed = slice.clone();
                    let mut unpacked = Vec::new();
                    self.unpack_into(&packed, &mut unpacked)?;
                    output.extend_from_slice(&unpacked);
                    self.dictionary[index] = Phrase::Literal(unpacked);
                }
            }
        }

        Ok(())
    }
}
