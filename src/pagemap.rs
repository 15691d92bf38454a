//! PAGE record parsing and page-number artifacts.
//!
//! A `PAGE` resource carries textual `(spos,type,value)` tuples naming
//! page labels plus a table of rawML offsets, one per page. From those
//! the unpacker emits a `page-map.xml` for the EPUB and an APNX binary
//! sidecar for Kindle firmware.

use serde_json::json;

use crate::kf8::K8Processor;

const ROMAN_TABLE: &[(&str, u32)] = &[
    ("m", 1000),
    ("cm", 900),
    ("d", 500),
    ("cd", 400),
    ("c", 100),
    ("xc", 90),
    ("l", 50),
    ("xl", 40),
    ("x", 10),
    ("ix", 9),
    ("v", 5),
    ("iv", 4),
    ("i", 1),
];

pub fn int_to_roman(value: u32) -> String {
    let mut parts = String::new();
    let mut num = value;
    for &(letter, weight) in ROMAN_TABLE {
        while weight <= num {
            num -= weight;
            parts.push_str(letter);
        }
    }
    parts
}

/// Metadata needed to frame an APNX sidecar.
pub struct ApnxMeta {
    pub acr: String,
    pub cde_type: String,
    pub content_guid: String,
    pub asin: String,
    /// `MOBI_7` or `MOBI_8`.
    pub format: String,
}

pub struct PageMapProcessor {
    pub page_names: Vec<Option<String>>,
    pub page_offsets: Vec<u32>,
    /// The normalised `(spos,type,value)` tuple list, re-emitted into the
    /// APNX page header.
    pub page_map: String,
}

impl PageMapProcessor {
    /// Parse a PAGE record (or an external APNX payload with the same
    /// layout).
    pub fn parse(data: &[u8]) -> Option<Self> {
        log::info!("extracting page map information");
        if data.len() < 0x14 {
            return None;
        }
        let rev_len =
            u32::from_be_bytes([data[0x10], data[0x11], data[0x12], data[0x13]]) as usize;
        let ptr = 0x14 + rev_len;
        if ptr + 8 > data.len() {
            return None;
        }
        let u16_at =
            |o: usize| u16::from_be_bytes([data[o], data[o + 1]]) as usize;
        let pm_len = u16_at(ptr + 2);
        let pm_count = u16_at(ptr + 4);
        let pm_bits = u16_at(ptr + 6);

        let str_start = ptr + 8;
        let str_end = (str_start + pm_len).min(data.len());
        let pm_str = String::from_utf8_lossy(&data[str_start..str_end]).into_owned();
        let off_data = &data[str_end..];

        let width = if pm_bits == 16 { 2 } else { 4 };
        let mut page_offsets = Vec::with_capacity(pm_count);
        for i in 0..pm_count {
            let pos = i * width;
            if pos + width > off_data.len() {
                break;
            }
            let offset = if width == 2 {
                u16::from_be_bytes([off_data[pos], off_data[pos + 1]]) as u32
            } else {
                u32::from_be_bytes([
                    off_data[pos],
                    off_data[pos + 1],
                    off_data[pos + 2],
                    off_data[pos + 3],
                ])
            };
            page_offsets.push(offset);
        }

        let (page_names, page_map) = parse_names(pm_count, &pm_str);
        Some(Self { page_names, page_offsets, page_map })
    }

    /// Build `page-map.xml` by resolving every page offset through the
    /// assembled KF8 parts.
    pub fn page_map_xml(&self, k8: &K8Processor) -> String {
        let mut xml = String::from("<page-map xmlns=\"http://www.idpf.org/2007/opf\">\n");
        for (i, name) in self.page_names.iter().enumerate() {
            let Some(name) = name.as_ref().filter(|n| !n.is_empty()) else {
                continue;
            };
            let Some(&pos) = self.page_offsets.get(i) else {
                continue;
            };
            let Some(info) = k8.part_for_pos(pos as usize) else {
                continue;
            };
            let mut link = info.filename.clone();
            let id = k8.page_id_tag(pos as usize);
            if !id.is_empty() {
                link.push('#');
                link.push_str(&String::from_utf8_lossy(&id));
            }
            xml.push_str(&format!("<page name=\"{}\" href=\"{}/{}\" />\n", name, info.dir, link));
        }
        xml.push_str("</page-map>\n");
        xml
    }

    /// Emit the APNX binary: two u16 version words, the content-header
    /// offset and length, the JSON content header, the page-header
    /// framing words, the JSON page header, then one u32 offset per page.
    pub fn generate_apnx(&self, meta: &ApnxMeta) -> Vec<u8> {
        let content_header = if meta.format == "MOBI_8" {
            json!({
                "contentGuid": meta.content_guid,
                "asin": meta.asin,
                "cdeType": meta.cde_type,
                "format": meta.format,
                "fileRevisionId": "1",
                "acr": meta.acr,
            })
        } else {
            json!({
                "contentGuid": meta.content_guid,
                "asin": meta.asin,
                "cdeType": meta.cde_type,
                "fileRevisionId": "1",
            })
        };
        let content_header = content_header.to_string().into_bytes();
        let page_header = json!({
            "asin": meta.asin,
            "pageMap": self.page_map,
        })
        .to_string()
        .into_bytes();

        let mut apnx = Vec::new();
        apnx.extend_from_slice(&1u16.to_be_bytes());
        apnx.extend_from_slice(&1u16.to_be_bytes());
        apnx.extend_from_slice(&(12 + content_header.len() as u32).to_be_bytes());
        apnx.extend_from_slice(&(content_header.len() as u32).to_be_bytes());
        apnx.extend_from_slice(&content_header);
        apnx.extend_from_slice(&1u16.to_be_bytes());
        apnx.extend_from_slice(&(page_header.len() as u16).to_be_bytes());
        apnx.extend_from_slice(&(self.page_offsets.len() as u16).to_be_bytes());
        apnx.extend_from_slice(&32u16.to_be_bytes());
        apnx.extend_from_slice(&page_header);
        for &offset in &self.page_offsets {
            apnx.extend_from_slice(&offset.to_be_bytes());
        }
        apnx
    }
}

/// Expand the `(spos,type,value)` tuples into one label per page.
/// Types: `a` arabic from `value`, `r` roman from `value`, `c` custom
/// labels separated by `|`. Each tuple restyles pages from `spos`
/// onwards, so later tuples override the tail.
fn parse_names(num_pages: usize, data: &str) -> (Vec<Option<String>>, String) {
    let mut names: Vec<Option<String>> = vec![None; num_pages];
    let mut page_map = String::new();

    let mut rest = data;
    while let Some(open) = rest.find('(') {
        let Some(close) = rest[open..].find(')') else {
            break;
        };
        let tuple = &rest[open + 1..open + close];
        rest = &rest[open + close + 1..];

        if !page_map.is_empty() {
            page_map.push(',');
        }
        page_map.push('(');
        page_map.push_str(tuple);
        page_map.push(')');

        let fields: Vec<&str> = tuple.splitn(3, ',').collect();
        if fields.len() != 3 {
            log::warn!("malformed page map tuple ({tuple})");
            continue;
        }
        let Ok(spos) = fields[0].parse::<usize>() else {
            continue;
        };
        let name_type = fields[1];
        let mut numeric = fields[2].parse::<u32>().unwrap_or(1);
        let mut custom = fields[2];

        for name in names.iter_mut().skip(spos.saturating_sub(1)) {
            *name = match name_type {
                "r" => {
                    let label = int_to_roman(numeric);
                    numeric += 1;
                    Some(label)
                }
                "a" => {
                    let label = numeric.to_string();
                    numeric += 1;
                    Some(label)
                }
                "c" => match custom.split_once('|') {
                    Some((head, tail)) => {
                        custom = tail;
                        Some(head.to_string())
                    }
                    None => Some(custom.to_string()),
                },
                _ => {
                    log::warn!("unknown page numbering type {name_type}");
                    None
                }
            };
        }
    }

    (names, page_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_to_roman() {
        assert_eq!(int_to_roman(1), "i");
        assert_eq!(int_to_roman(4), "iv");
        assert_eq!(int_to_roman(9), "ix");
        assert_eq!(int_to_roman(1984), "mcmlxxxiv");
    }

    #[test]
    fn test_parse_names_arabic_then_roman() {
        let (names, page_map) = parse_names(8, "(1,a,1),(5,r,1)");
        let labels: Vec<_> = names.into_iter().map(|n| n.unwrap()).collect();
        assert_eq!(labels, vec!["1", "2", "3", "4", "i", "ii", "iii", "iv"]);
        assert_eq!(page_map, "(1,a,1),(5,r,1)");
    }

    #[test]
    fn test_parse_names_custom() {
        let (names, _) = parse_names(3, "(1,c,front|middle|back)");
        let labels: Vec<_> = names.into_iter().map(|n| n.unwrap()).collect();
        assert_eq!(labels, vec!["front", "middle", "back"]);
    }

    fn make_page_record(map: &str, offsets: &[u32]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(b"PAGE");
        data.resize(0x10, 0);
        data.extend_from_slice(&0u32.to_be_bytes()); // no revision string
        data.extend_from_slice(&1u16.to_be_bytes());
        data.extend_from_slice(&(map.len() as u16).to_be_bytes());
        data.extend_from_slice(&(offsets.len() as u16).to_be_bytes());
        data.extend_from_slice(&32u16.to_be_bytes());
        data.extend_from_slice(map.as_bytes());
        for &o in offsets {
            data.extend_from_slice(&o.to_be_bytes());
        }
        data
    }

    #[test]
    fn test_parse_page_record() {
        let offsets: Vec<u32> = (0..8).map(|i| i * 100).collect();
        let record = make_page_record("(1,a,1),(5,r,1)", &offsets);
        let pm = PageMapProcessor::parse(&record).unwrap();

        assert_eq!(pm.page_offsets, offsets);
        assert_eq!(pm.page_names[0].as_deref(), Some("1"));
        assert_eq!(pm.page_names[4].as_deref(), Some("i"));
        assert_eq!(pm.page_names[7].as_deref(), Some("iv"));
    }

    #[test]
    fn test_apnx_framing() {
        let offsets: Vec<u32> = (0..4).map(|i| i * 10).collect();
        let record = make_page_record("(1,a,1)", &offsets);
        let pm = PageMapProcessor::parse(&record).unwrap();
        let apnx = pm.generate_apnx(&ApnxMeta {
            acr: "CR!TEST".into(),
            cde_type: "EBOK".into(),
            content_guid: "1a2b".into(),
            asin: "B000TEST01".into(),
            format: "MOBI_8".into(),
        });

        assert_eq!(&apnx[0..4], &[0, 1, 0, 1]);
        let ch_off = u32::from_be_bytes(apnx[4..8].try_into().unwrap()) as usize;
        let ch_len = u32::from_be_bytes(apnx[8..12].try_into().unwrap()) as usize;
        assert_eq!(ch_off, 12 + ch_len);
        let content: serde_json::Value =
            serde_json::from_slice(&apnx[12..12 + ch_len]).unwrap();
        assert_eq!(content["format"], "MOBI_8");
        assert_eq!(content["acr"], "CR!TEST");

        let mut p = 12 + ch_len;
        assert_eq!(&apnx[p..p + 2], &[0, 1]);
        let ph_len = u16::from_be_bytes(apnx[p + 2..p + 4].try_into().unwrap()) as usize;
        let page_count = u16::from_be_bytes(apnx[p + 4..p + 6].try_into().unwrap()) as usize;
        assert_eq!(page_count, 4);
        assert_eq!(&apnx[p + 6..p + 8], &[0, 32]);
        p += 8;
        let page_header: serde_json::Value =
            serde_json::from_slice(&apnx[p..p + ph_len]).unwrap();
        assert_eq!(page_header["pageMap"], "(1,a,1)");
        p += ph_len;
        let tail: Vec<u32> = apnx[p..]
            .chunks_exact(4)
            .map(|c| u32::from_be_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(tail, vec![0, 10, 20, 30]);
    }
}
