//! RESC record parsing.
//!
//! A `RESC` resource embeds a fragment of the original content.opf —
//! not well-formed XML as a whole, so a strict parser is out. A
//! two-state scanner (text vs tag) walks it to recover the spine order,
//! metadata refinements, and whether the source needed EPUB3.

use std::collections::HashMap;

use indexmap::IndexMap;

use crate::mobi::from_base32;

const OPF_PARENT_TAGS: &[&str] =
    &["xml", "package", "metadata", "dc-metadata", "x-metadata", "manifest", "spine", "tours", "guide"];

/// One scanned tag: name, attributes, optional text content.
#[derive(Debug, Clone)]
pub struct TagInfo {
    pub name: String,
    pub attrs: IndexMap<String, String>,
    pub content: Option<String>,
}

impl TagInfo {
    fn to_xml(&self) -> String {
        let mut out = format!("<{}", self.name);
        for (key, value) in &self.attrs {
            out.push_str(&format!(" {key}=\"{value}\""));
        }
        match &self.content {
            Some(content) => out.push_str(&format!(">{content}</{}>\n", self.name)),
            None => out.push_str("/>\n"),
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct RescDoc {
    pub package_version: Option<String>,
    pub spine_ppd: Option<String>,
    pub cover_name: Option<String>,
    /// Spine order by skeleton id (`"coverpage"` for a removed cover).
    pub spine_order: Vec<String>,
    pub spine_idrefs: HashMap<String, Option<String>>,
    pub spine_page_attributes: HashMap<String, IndexMap<String, String>>,
    need3: bool,
    extra_meta: Vec<TagInfo>,
    /// Rendered metadata, filled by [`RescDoc::create_metadata`].
    pub extra_metadata: Vec<String>,
    pub refines_metadata: Vec<String>,
    pub extra_attributes: Vec<String>,
}

impl RescDoc {
    /// Parse a RESC record payload (after its 16-byte prefix). The
    /// payload starts with a `size=XXXX&…` header before the first `<`.
    pub fn parse(data: &[u8]) -> Self {
        let start_pos = data.iter().position(|&b| b == b'<').unwrap_or(data.len());
        let header = &data[..start_pos];

        let declared_size = header
            .iter()
            .position(|&b| b == b'=')
            .map(|eq| {
                let rest = &header[eq + 1..];
                let end = rest.iter().position(|&b| b == b'&').unwrap_or(rest.len());
                from_base32(&rest[..end]) as usize
            })
            .unwrap_or(0);

        let raw = &data[start_pos..];
        let length = if raw.len() == declared_size {
            declared_size
        } else {
            // most RESC records end with a NUL-padded tail
            let length = memchr::memchr(0, raw).unwrap_or(raw.len());
            if length != declared_size {
                log::warn!(
                    "RESC section length ({length} bytes) does not match its declared size ({declared_size} bytes)"
                );
            }
            length
        };
        let text = String::from_utf8_lossy(&raw[..length]).into_owned();

        let mut doc = RescDoc::default();
        doc.scan(&text);
        doc
    }

    pub fn has_spine(&self) -> bool {
        !self.spine_order.is_empty()
    }

    pub fn needs_epub3(&self) -> bool {
        self.need3
    }

    pub fn has_refines(&self) -> bool {
        self.extra_meta.iter().any(|t| t.attrs.contains_key("refines"))
    }

    /// Put a synthesised cover page in front of the spine.
    pub fn prepend_to_spine(&mut self, key: &str, idref: &str, linear: &str) {
        self.spine_order.insert(0, key.to_string());
        self.spine_idrefs.insert(key.to_string(), Some(idref.to_string()));
        let mut attrs = IndexMap::new();
        attrs.insert("linear".to_string(), linear.to_string());
        self.spine_page_attributes.insert(key.to_string(), attrs);
    }

    fn scan(&mut self, text: &str) {
        let mut scanner = Scanner { text, pos: 0 };
        let mut prefix: Vec<String> = vec![String::new()];
        let mut content: Option<String> = None;
        let mut last_attrs: Option<IndexMap<String, String>> = None;

        loop {
            match scanner.next_piece() {
                Piece::End => break,
                Piece::Text(t) => {
                    content = Some(t.trim_end_matches([' ', '\r', '\n']).to_string());
                }
                Piece::Tag(tag) => {
                    let (ttype, name, attrs) = parse_tag(tag);
                    match ttype {
                        TagType::Begin => {
                            content = None;
                            prefix.push(format!("{name}."));
                            if OPF_PARENT_TAGS.contains(&name.as_str()) {
                                self.handle_tag(&name, &attrs, None);
                            } else {
                                last_attrs = Some(attrs);
                            }
                        }
                        TagType::End => {
                            prefix.pop();
                            let attrs = last_attrs.take().unwrap_or_default();
                            if !OPF_PARENT_TAGS.contains(&name.as_str()) {
                                self.handle_tag(&name, &attrs, content.take());
                            }
                            content = None;
                        }
                        TagType::Single => {
                            self.handle_tag(&name, &attrs, content.take());
                        }
                    }
                }
            }
        }
    }

    fn handle_tag(&mut self, name: &str, attrs: &IndexMap<String, String>, content: Option<String>) {
        let mut attrs = attrs.clone();
        if name == "package" {
            let version = attrs.get("version").cloned().unwrap_or_else(|| "2.0".to_string());
            let prefix = attrs.get("prefix").cloned().unwrap_or_default();
            if version.starts_with('3') || prefix.starts_with("rendition") {
                self.need3 = true;
            }
            self.package_version = Some(version);
        }
        if name == "spine" {
            self.spine_ppd = attrs.get("page-progression-direction").cloned();
            if self.spine_ppd.as_deref() == Some("rtl") {
                self.need3 = true;
            }
        }
        if name == "itemref" {
            let skelid = match attrs.shift_remove("skelid") {
                Some(skelid) => skelid,
                None if self.spine_order.is_empty() => {
                    // assume it was the removed initial coverpage
                    attrs.insert("linear".to_string(), "no".to_string());
                    "coverpage".to_string()
                }
                None => String::new(),
            };
            self.spine_order.push(skelid.clone());
            let idref = attrs.shift_remove("idref").map(|idref| format!("x_{idref}"));
            self.spine_idrefs.insert(skelid.clone(), idref);
            attrs.shift_remove("id");
            if attrs.contains_key("properties") {
                self.need3 = true;
            }
            self.spine_page_attributes.insert(skelid, attrs);
            return;
        }
        if name == "meta" || name.starts_with("dc:") {
            if attrs.contains_key("refines") || attrs.contains_key("property") {
                self.need3 = true;
            }
            if attrs.get("name").map(String::as_str) == Some("cover") {
                self.cover_name = attrs.get("content").map(|c| format!("x_{c}"));
            } else {
                self.extra_meta.push(TagInfo { name: name.to_string(), attrs, content });
            }
        }
    }

    /// Render the captured metadata for the OPF builder. Refines either
    /// stay as EPUB3 meta tags or (with `F`) collapse into `opf:`
    /// attribute hints.
    pub fn create_metadata(&mut self, epub_version: &str) {
        for tag in &self.extra_meta {
            if let Some(refines) = tag.attrs.get("refines") {
                if epub_version == "F"
                    && let Some(property) = tag.attrs.get("property")
                {
                    self.extra_attributes.push(format!(
                        " id=\"{refines}\" opf:{property}=\"{}\"\n",
                        tag.content.clone().unwrap_or_default()
                    ));
                } else {
                    self.refines_metadata.push(tag.to_xml());
                }
            } else {
                self.extra_metadata.push(tag.to_xml());
            }
        }
    }
}

enum Piece<'a> {
    Text(&'a str),
    Tag(&'a str),
    End,
}

enum TagType {
    Begin,
    End,
    Single,
}

struct Scanner<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    /// Leading text up to the next `<`, or one whole tag. Comments are
    /// consumed as single tags; a stray `<` inside a tag restarts the
    /// scan there.
    fn next_piece(&mut self) -> Piece<'a> {
        let bytes = self.text.as_bytes();
        let p = self.pos;
        if p >= bytes.len() {
            return Piece::End;
        }
        if bytes[p] != b'<' {
            let end = memchr::memchr(b'<', &bytes[p..]).map(|i| p + i).unwrap_or(bytes.len());
            self.pos = end;
            return Piece::Text(&self.text[p..end]);
        }
        let close = if self.text[p..].starts_with("<!--") {
            self.text[p + 1..].find("-->").map(|i| p + 1 + i + 2)
        } else {
            let gt = memchr::memchr(b'>', &bytes[p + 1..]).map(|i| p + 1 + i);
            let lt = memchr::memchr(b'<', &bytes[p + 1..]).map(|i| p + 1 + i);
            if let (Some(gt), Some(lt)) = (gt, lt)
                && lt < gt
            {
                self.pos = lt;
                return Piece::Text(&self.text[p..lt]);
            }
            gt
        };
        match close {
            Some(close) => {
                self.pos = close + 1;
                Piece::Tag(&self.text[p..=close])
            }
            None => {
                self.pos = bytes.len();
                Piece::Text(&self.text[p..])
            }
        }
    }
}

/// Split one tag into its type, lowercased name, and attribute map.
fn parse_tag(s: &str) -> (TagType, String, IndexMap<String, String>) {
    let bytes = s.as_bytes();
    let mut attrs = IndexMap::new();
    let mut p = 1;
    while p < bytes.len() && bytes[p] == b' ' {
        p += 1;
    }
    let mut ttype = None;
    if p < bytes.len() && bytes[p] == b'/' {
        ttype = Some(TagType::End);
        p += 1;
        while p < bytes.len() && bytes[p] == b' ' {
            p += 1;
        }
    }
    let name_start = p;
    while p < bytes.len() && !matches!(bytes[p], b'>' | b'/' | b' ' | b'"' | b'\'' | b'\r' | b'\n') {
        p += 1;
    }
    let mut name = s[name_start..p].to_lowercase();
    if name == "?xml" {
        name = "xml".to_string();
    }
    if name == "!--" {
        let comment = s[p..s.len().saturating_sub(3)].trim().to_string();
        attrs.insert("comment".to_string(), comment);
        return (TagType::Single, name, attrs);
    }

    if ttype.is_none() {
        // attributes of begin/single tags
        while s[p..].contains('=') {
            while p < bytes.len() && bytes[p] == b' ' {
                p += 1;
            }
            let attr_start = p;
            while p < bytes.len() && bytes[p] != b'=' {
                p += 1;
            }
            if p >= bytes.len() {
                break;
            }
            let aname = s[attr_start..p].trim_end().to_lowercase();
            p += 1;
            while p < bytes.len() && bytes[p] == b' ' {
                p += 1;
            }
            let value = if p < bytes.len() && (bytes[p] == b'"' || bytes[p] == b'\'') {
                let quote = bytes[p];
                p += 1;
                let v_start = p;
                while p < bytes.len() && bytes[p] != quote {
                    p += 1;
                }
                let value = &s[v_start..p];
                p += 1;
                value
            } else {
                let v_start = p;
                while p < bytes.len() && !matches!(bytes[p], b'>' | b'/' | b' ') {
                    p += 1;
                }
                &s[v_start..p]
            };
            attrs.insert(aname, value.to_string());
        }
    }

    let ttype = ttype.unwrap_or_else(|| {
        if s[p.min(s.len())..].contains('/') { TagType::Single } else { TagType::Begin }
    });
    (ttype, name, attrs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resc_payload(xml: &str) -> Vec<u8> {
        // declared size in base32, like the real records
        let size = crate::mobi::to_base32(xml.len() as u64, 4);
        format!("size={size}&version=1&type=1{xml}").into_bytes()
    }

    const SAMPLE: &str = "<?xml version=\"1.0\"?>\
<package version=\"2.0\" xmlns=\"http://www.idpf.org/2007/opf\">\
<metadata><meta name=\"cover\" content=\"cover-image\"/>\
<dc:title id=\"title01\">Example</dc:title>\
<meta refines=\"#title01\" property=\"file-as\">EXAMPLE</meta>\
</metadata>\
<spine page-progression-direction=\"rtl\">\
<itemref skelid=\"0\" idref=\"item1\" linear=\"yes\"/>\
<itemref skelid=\"1\" idref=\"item2\"/>\
</spine></package>";

    #[test]
    fn test_parse_spine() {
        let doc = RescDoc::parse(&resc_payload(SAMPLE));

        assert!(doc.has_spine());
        assert_eq!(doc.spine_order, vec!["0", "1"]);
        assert_eq!(doc.spine_idrefs["0"], Some("x_item1".to_string()));
        assert_eq!(doc.spine_page_attributes["0"].get("linear").map(String::as_str), Some("yes"));
        assert_eq!(doc.spine_ppd.as_deref(), Some("rtl"));
    }

    #[test]
    fn test_epub3_detection() {
        let doc = RescDoc::parse(&resc_payload(SAMPLE));
        // rtl progression and refines both force epub3
        assert!(doc.needs_epub3());
        assert!(doc.has_refines());
    }

    #[test]
    fn test_cover_name() {
        let doc = RescDoc::parse(&resc_payload(SAMPLE));
        assert_eq!(doc.cover_name.as_deref(), Some("x_cover-image"));
    }

    #[test]
    fn test_create_metadata_refines() {
        let mut doc = RescDoc::parse(&resc_payload(SAMPLE));
        doc.create_metadata("3");
        assert_eq!(doc.refines_metadata.len(), 1);
        assert!(doc.refines_metadata[0].contains("refines=\"#title01\""));

        let mut doc = RescDoc::parse(&resc_payload(SAMPLE));
        doc.create_metadata("F");
        assert_eq!(doc.refines_metadata.len(), 0);
        assert!(doc.extra_attributes[0].contains("opf:file-as=\"EXAMPLE\""));
    }

    #[test]
    fn test_itemref_without_skelid_is_coverpage() {
        let xml = "<package version=\"2.0\"><spine>\
                   <itemref idref=\"cover\"/><itemref skelid=\"0\" idref=\"a\"/>\
                   </spine></package>";
        let doc = RescDoc::parse(&resc_payload(xml));
        assert_eq!(doc.spine_order, vec!["coverpage", "0"]);
        assert_eq!(
            doc.spine_page_attributes["coverpage"].get("linear").map(String::as_str),
            Some("no")
        );
    }

    #[test]
    fn test_not_well_formed_tail_tolerated() {
        let mut payload = resc_payload("<package version=\"3.0\"><spine><itemref skelid=\"0\"/>");
        payload.extend_from_slice(&[0, 0, 0]);
        let doc = RescDoc::parse(&payload);
        assert!(doc.needs_epub3());
        assert_eq!(doc.spine_order, vec!["0"]);
    }
}
