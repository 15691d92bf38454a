//! EXTH extended-metadata parsing.
//!
//! The EXTH table follows the Mobi header when flag 0x40 is set: a
//! `(id, size, content)` triple per entry, padded to a 4-byte boundary.
//! Ids are not unique, so the parsed view is an ordered multi-map from
//! canonical key names to value lists.

use indexmap::IndexMap;

use crate::mobi::headers::{Codec, NULL_INDEX};

/// A decoded EXTH value. The id→kind dispatch is a closed table; ids
/// outside it are kept as hex so nothing is dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExthValue {
    Text(String),
    Int(u32),
    Hex(Vec<u8>),
}

impl std::fmt::Display for ExthValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExthValue::Text(s) => f.write_str(s),
            ExthValue::Int(n) => write!(f, "{n}"),
            ExthValue::Hex(bytes) => {
                for b in bytes {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Ordered multi-map of metadata: key → append-only list of values.
#[derive(Debug, Default, Clone)]
pub struct Metadata {
    entries: IndexMap<String, Vec<ExthValue>>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: ExthValue) {
        self.entries.entry(name.to_string()).or_default().push(value);
    }

    pub fn add_text(&mut self, name: &str, value: impl Into<String>) {
        self.add(name, ExthValue::Text(value.into()));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&[ExthValue]> {
        self.entries.get(name).map(|v| v.as_slice())
    }

    /// First value rendered as a string.
    pub fn first(&self, name: &str) -> Option<String> {
        self.entries.get(name).and_then(|v| v.first()).map(|v| v.to_string())
    }

    /// Last value rendered as a string (StartOffset wants last-wins).
    pub fn last(&self, name: &str) -> Option<String> {
        self.entries.get(name).and_then(|v| v.last()).map(|v| v.to_string())
    }

    /// All values for a key rendered as strings.
    pub fn all(&self, name: &str) -> Vec<String> {
        self.entries
            .get(name)
            .map(|v| v.iter().map(|v| v.to_string()).collect())
            .unwrap_or_default()
    }

    pub fn remove(&mut self, name: &str) -> Option<Vec<ExthValue>> {
        self.entries.shift_remove(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<ExthValue>)> {
        self.entries.iter()
    }
}

/// Ids decoded as strings in the container codec.
#[rustfmt::skip]
const ID_MAP_STRINGS: &[(u32, &str)] = &[
    (1, "Drm Server Id"),
    (2, "Drm Commerce Id"),
    (3, "Drm Ebookbase Book Id"),
    (4, "Drm Ebookbase Dep Id"),
    (100, "Creator"),
    (101, "Publisher"),
    (102, "Imprint"),
    (103, "Description"),
    (104, "ISBN"),
    (105, "Subject"),
    (106, "Published"),
    (107, "Review"),
    (108, "Contributor"),
    (109, "Rights"),
    (110, "SubjectCode"),
    (111, "Type"),
    (112, "Source"),
    (113, "ASIN"),
    (114, "versionNumber"),
    (117, "Adult"),
    (118, "Price"),
    (119, "Currency"),
    (120, "TSC"),
    (122, "fixed-layout"),
    (123, "book-type"),
    (124, "orientation-lock"),
    (126, "original-resolution"),
    (127, "zero-gutter"),
    (128, "zero-margin"),
    (129, "MetadataResourceURI"),
    (132, "RegionMagnification"),
    (150, "LendingEnabled"),
    (200, "DictShortName"),
    (501, "cdeType"),
    (502, "last_update_time"),
    (503, "Updated_Title"),
    (504, "CDEContentKey"),
    (505, "AmazonContentReference"),
    (506, "Title-Language"),
    (507, "Title-Display-Direction"),
    (508, "Title-Pronunciation"),
    (509, "Title-Collation"),
    (510, "Secondary-Title"),
    (511, "Secondary-Title-Language"),
    (512, "Secondary-Title-Direction"),
    (513, "Secondary-Title-Pronunciation"),
    (514, "Secondary-Title-Collation"),
    (515, "Author-Language"),
    (516, "Author-Display-Direction"),
    (517, "Author-Pronunciation"),
    (518, "Author-Collation"),
    (519, "Author-Type"),
    (520, "Publisher-Language"),
    (521, "Publisher-Display-Direction"),
    (522, "Publisher-Pronunciation"),
    (523, "Publisher-Collation"),
    (524, "Content-Language-Tag"),
    (525, "primary-writing-mode"),
    (526, "NCX-Ingested-By-Software"),
    (527, "page-progression-direction"),
    (528, "override-kindle-fonts"),
    (529, "Compression-Upgraded"),
    (530, "Soft-Hyphens-In-Content"),
    (531, "Dictionary_In_Language"),
    (532, "Dictionary_Out_Language"),
    (533, "Font_Converted"),
    (534, "Amazon_Creator_Info"),
    (535, "Creator-Build-Tag"),
    (536, "HD-Media-Containers-Info"),
    (538, "Resource-Container-Fidelity"),
    (539, "HD-Container-Mimetype"),
    (540, "Sample-For_Special-Purpose"),
    (541, "Kindletool-Operation-Information"),
    (542, "Container_Id"),
    (543, "Asset-Type"),
    (544, "Unknown_544"),
];

/// Ids decoded as big-endian integers, sized by the entry length.
#[rustfmt::skip]
const ID_MAP_VALUES: &[(u32, &str)] = &[
    (115, "sample"),
    (116, "StartOffset"),
    (121, "Mobi8-Boundary-Section"),
    (125, "Embedded-Record-Count"),
    (130, "Offline-Sample"),
    (131, "Metadata-Record-Offset"),
    (201, "CoverOffset"),
    (202, "ThumbOffset"),
    (203, "HasFakeCover"),
    (204, "Creator-Software"),
    (205, "Creator-Major-Version"),
    (206, "Creator-Minor-Version"),
    (207, "Creator-Build-Number"),
    (401, "Clipping-Limit"),
    (402, "Publisher-Limit"),
    (404, "Text-to-Speech-Disabled"),
    (406, "Rental-Expiration-Time"),
];

/// Ids kept as opaque hex.
#[rustfmt::skip]
const ID_MAP_HEXSTRINGS: &[(u32, &str)] = &[
    (208, "Watermark_(hex)"),
    (209, "Tamper-Proof-Keys_(hex)"),
    (300, "Font-Signature_(hex)"),
    (403, "Unknown_(403)_(hex)"),
    (405, "Ownership-Type_(hex)"),
    (407, "Unknown_(407)_(hex)"),
    (420, "Multimedia-Content-Reference_(hex)"),
    (450, "Locations_Match_(hex)"),
    (451, "Full-Story-Length_(hex)"),
    (452, "Sample-Start_Location_(hex)"),
    (453, "Sample-End-Location_(hex)"),
];

fn lookup(table: &[(u32, &'static str)], id: u32) -> Option<&'static str> {
    table.iter().find(|&&(k, _)| k == id).map(|&(_, name)| name)
}

fn entries(exth: &[u8]) -> impl Iterator<Item = (u32, &[u8])> {
    let count = if exth.len() >= 12 && &exth[0..4] == b"EXTH" {
        u32::from_be_bytes([exth[8], exth[9], exth[10], exth[11]]) as usize
    } else {
        0
    };
    let mut pos = 12;
    (0..count).map_while(move |_| {
        if pos + 8 > exth.len() {
            return None;
        }
        let id = u32::from_be_bytes([exth[pos], exth[pos + 1], exth[pos + 2], exth[pos + 3]]);
        let size =
            u32::from_be_bytes([exth[pos + 4], exth[pos + 5], exth[pos + 6], exth[pos + 7]]) as usize;
        if size < 8 || pos + size > exth.len() {
            return None;
        }
        let content = &exth[pos + 8..pos + size];
        pos += size;
        Some((id, content))
    })
}

/// Parse an EXTH block (starting at its `EXTH` magic) into a metadata
/// multi-map.
pub fn parse_exth(exth: &[u8], codec: Codec) -> Metadata {
    let mut metadata = Metadata::new();
    for (id, content) in entries(exth) {
        if let Some(name) = lookup(ID_MAP_STRINGS, id) {
            metadata.add_text(name, super::decode_text(codec, content));
        } else if let Some(name) = lookup(ID_MAP_VALUES, id) {
            let value = match content.len() {
                1 => Some(content[0] as u32),
                2 => Some(u16::from_be_bytes([content[0], content[1]]) as u32),
                4 => Some(u32::from_be_bytes([content[0], content[1], content[2], content[3]])),
                _ => None,
            };
            match value {
                // CoverOffset/ThumbOffset use 0xffffffff for "none"
                Some(v) if (id == 201 || id == 202) && v == NULL_INDEX => {}
                Some(v) => metadata.add(name, ExthValue::Int(v)),
                None => {
                    log::warn!("bad size {} for EXTH {} ({})", content.len() + 8, id, name);
                    metadata.add(name, ExthValue::Hex(content.to_vec()));
                }
            }
        } else if let Some(name) = lookup(ID_MAP_HEXSTRINGS, id) {
            metadata.add(name, ExthValue::Hex(content.to_vec()));
        } else {
            metadata.add(&format!("{id} (hex)"), ExthValue::Hex(content.to_vec()));
        }
    }
    metadata
}

/// Add the synthesised defaults every book gets: Language, Title, Codec,
/// UniqueID, plus ASIN (random v4 UUID) and cdeType (`EBOK`) when the
/// container did not carry them.
pub fn add_defaults(
    metadata: &mut Metadata,
    title: &str,
    codec: Codec,
    language: &str,
    unique_id: u32,
) {
    metadata.add_text("Language", language);
    metadata.add_text("Title", title);
    metadata.add_text("Codec", codec.name());
    metadata.add("UniqueID", ExthValue::Int(unique_id));
    if !metadata.contains("ASIN") {
        metadata.add_text("ASIN", uuid::Uuid::new_v4().to_string());
    }
    if !metadata.contains("cdeType") {
        metadata.add_text("cdeType", "EBOK");
    }
}

/// Dump an EXTH block as a key/value table (the `-d` surface). Also used
/// for the EXTH embedded at offset 48 of CONT resource headers.
pub fn dump_exth(exth: &[u8], codec: Codec) {
    println!("Key Size Description                    Value");
    for (id, content) in entries(exth) {
        if let Some(name) = lookup(ID_MAP_STRINGS, id) {
            println!("{:3} {:4} {:<30} {}", id, content.len(), name, super::decode_text(codec, content));
        } else if let Some(name) = lookup(ID_MAP_VALUES, id) {
            let rendered = match content.len() {
                1 => format!("{}", content[0]),
                2 => format!("{}", u16::from_be_bytes([content[0], content[1]])),
                4 => format!(
                    "0x{0:08X} ({0})",
                    u32::from_be_bytes([content[0], content[1], content[2], content[3]])
                ),
                _ => hex(content),
            };
            println!("{:3} {:4} {:<30} {}", id, content.len(), name, rendered);
        } else {
            let name = lookup(ID_MAP_HEXSTRINGS, id)
                .map(str::to_string)
                .unwrap_or_else(|| format!("Unknown EXTH ID {id}"));
            println!("{:3} {:4} {:<30} 0x{}", id, content.len(), name, hex(content));
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_exth(records: &[(u32, &[u8])]) -> Vec<u8> {
        let mut exth = Vec::new();
        exth.extend_from_slice(b"EXTH");
        let total: usize = 12 + records.iter().map(|(_, c)| c.len() + 8).sum::<usize>();
        exth.extend_from_slice(&(total as u32).to_be_bytes());
        exth.extend_from_slice(&(records.len() as u32).to_be_bytes());
        for (id, content) in records {
            exth.extend_from_slice(&id.to_be_bytes());
            exth.extend_from_slice(&((content.len() + 8) as u32).to_be_bytes());
            exth.extend_from_slice(content);
        }
        exth
    }

    #[test]
    fn test_string_and_int_kinds() {
        let exth = make_exth(&[
            (100, b"Author One"),
            (100, b"Author Two"),
            (201, &5u32.to_be_bytes()),
            (116, &0u32.to_be_bytes()),
        ]);
        let md = parse_exth(&exth, Codec::Utf8);

        assert_eq!(md.all("Creator"), vec!["Author One", "Author Two"]);
        assert_eq!(md.first("CoverOffset").as_deref(), Some("5"));
        assert_eq!(md.get("StartOffset"), Some(&[ExthValue::Int(0)][..]));
    }

    #[test]
    fn test_keys_are_not_unique_and_keep_order() {
        let exth = make_exth(&[(105, b"First"), (103, b"desc"), (105, b"Second")]);
        let md = parse_exth(&exth, Codec::Utf8);

        assert_eq!(md.all("Subject"), vec!["First", "Second"]);
        let keys: Vec<_> = md.keys().cloned().collect();
        assert_eq!(keys, vec!["Subject", "Description"]);
    }

    #[test]
    fn test_null_cover_offset_is_dropped() {
        let exth = make_exth(&[(201, &NULL_INDEX.to_be_bytes())]);
        let md = parse_exth(&exth, Codec::Utf8);
        assert!(!md.contains("CoverOffset"));
    }

    #[test]
    fn test_unknown_id_kept_as_hex() {
        let exth = make_exth(&[(9999, &[0xDE, 0xAD])]);
        let md = parse_exth(&exth, Codec::Utf8);
        assert_eq!(md.first("9999 (hex)").as_deref(), Some("dead"));
    }

    #[test]
    fn test_exth_544_is_opaque_string() {
        let exth = make_exth(&[(544, b"whatever this is")]);
        let md = parse_exth(&exth, Codec::Utf8);
        assert_eq!(md.first("Unknown_544").as_deref(), Some("whatever this is"));
    }

    #[test]
    fn test_truncated_table_stops_cleanly() {
        let mut exth = make_exth(&[(100, b"Author")]);
        exth[8..12].copy_from_slice(&5u32.to_be_bytes()); // claims 5 records
        let md = parse_exth(&exth, Codec::Utf8);
        assert_eq!(md.all("Creator"), vec!["Author"]);
    }

    #[test]
    fn test_defaults() {
        let mut md = Metadata::new();
        md.add_text("ASIN", "B000TESTIT");
        add_defaults(&mut md, "A Title", Codec::Windows1252, "en-gb", 42);

        assert_eq!(md.first("ASIN").as_deref(), Some("B000TESTIT"));
        assert_eq!(md.first("cdeType").as_deref(), Some("EBOK"));
        assert_eq!(md.first("Title").as_deref(), Some("A Title"));
        assert_eq!(md.first("UniqueID").as_deref(), Some("42"));
        assert_eq!(md.first("Codec").as_deref(), Some("windows-1252"));
    }
}
