//! EPUB3 navigation document generation.

use quick_xml::escape::escape;

use crate::kf8::skeleton::{attr_value, find_ci};
use crate::ncx::NcxEntry;

/// Guide reference type → epub:type landmark mapping; `None` entries are
/// recognised but have no landmark equivalent.
const LANDMARK_TYPES: &[(&str, Option<&str>)] = &[
    ("cover", Some("cover")),
    ("title-page", Some("title-page")),
    ("text", Some("bodymatter")),
    ("toc", Some("toc")),
    ("loi", Some("loi")),
    ("lot", Some("lot")),
    ("preface", Some("preface")),
    ("bibliography", Some("bibliography")),
    ("index", Some("index")),
    ("glossary", Some("glossary")),
    ("acknowledgements", Some("acknowledgements")),
    ("colophon", None),
    ("copyright-page", None),
    ("dedication", None),
    ("epigraph", None),
    ("foreword", None),
    ("notes", None),
];

/// Build the landmarks nav from the OPF guide references. Hrefs in the
/// guide are OEBPS-relative (`Text/part0000.xhtml`); the nav document
/// lives inside `Text/`, so the prefix is dropped.
fn build_landmarks(guide_text: &str) -> String {
    let mut items = String::new();
    let bytes = guide_text.as_bytes();
    let mut pos = 0;
    while let Some(rel) = find_ci(&bytes[pos..], b"<reference") {
        let start = pos + rel;
        let Some(end_rel) = memchr::memchr(b'>', &bytes[start..]) else {
            break;
        };
        let tag = &bytes[start..start + end_rel + 1];
        pos = start + end_rel + 1;

        let ref_type = attr_value(tag, b"type").map(|v| String::from_utf8_lossy(v).into_owned());
        let title = attr_value(tag, b"title").map(|v| String::from_utf8_lossy(v).into_owned());
        let href = attr_value(tag, b"href").map(|v| String::from_utf8_lossy(v).into_owned());
        let (Some(ref_type), Some(title), Some(href)) = (ref_type, title, href) else {
            continue;
        };
        let Some(epub_type) = LANDMARK_TYPES
            .iter()
            .find(|&&(t, _)| t == ref_type)
            .and_then(|&(_, mapped)| mapped)
        else {
            continue;
        };
        let link = href.strip_prefix("Text/").map(str::to_string).unwrap_or(format!("../{href}"));
        items.push_str(&format!(
            "      <li><a epub:type=\"{epub_type}\" href=\"{link}\">{title}</a></li>\n"
        ));
    }

    if items.is_empty() {
        return String::new();
    }
    format!(
        "  <nav epub:type=\"landmarks\" id=\"landmarks\" hidden=\"\">\n\
         \x20   <h2>Guide</h2>\n\
         \x20   <ol>\n\
         {items}\
         \x20   </ol>\n\
         \x20 </nav>\n"
    )
}

fn recurs_toc(
    entries: &[NcxEntry],
    xhtml: &mut String,
    num: &mut usize,
    lvl: i64,
    start: i64,
    end: i64,
) {
    let start = if start <= 0 { 0 } else { start as usize };
    let end = if end <= 0 { entries.len() } else { end as usize };
    if start > entries.len() || end > entries.len() {
        log::warn!("missing INDX child entries {start} {end} {}", entries.len());
        return;
    }
    let indent1 = "  ".repeat((2 + lvl * 2) as usize);
    let indent2 = "  ".repeat((3 + lvl * 2) as usize);

    xhtml.push_str(&indent1);
    xhtml.push_str("<ol>\n");
    for entry in &entries[start..end] {
        if entry.hlvl != lvl {
            continue;
        }
        *num += 1;
        let link = if entry.id_tag.is_empty() {
            entry.filename.clone()
        } else {
            format!("{}#{}", entry.filename, entry.id_tag)
        };
        xhtml.push_str(&indent2);
        xhtml.push_str(&format!("<li><a href=\"{link}\">{}</a>", escape(&entry.text)));
        if entry.child1 >= 0 {
            xhtml.push('\n');
            recurs_toc(entries, xhtml, num, lvl + 1, entry.child1, entry.childn + 1);
            xhtml.push_str(&indent2);
        }
        xhtml.push_str("</li>\n");
    }
    xhtml.push_str(&indent1);
    xhtml.push_str("</ol>\n");
}

fn build_toc(entries: &[NcxEntry]) -> String {
    let mut body = String::new();
    let mut num = 0;
    recurs_toc(entries, &mut body, &mut num, 0, -1, -1);
    if num != entries.len() {
        log::warn!("different number of entries in NCX: {} / {num}", entries.len());
    }
    format!(
        "  <nav epub:type=\"toc\" id=\"toc\">\n\
         \x20   <h1>Table of contents</h1>\n\
         {body}\
         \x20 </nav>\n"
    )
}

/// Build `nav.xhtml` from the resolved NCX entries and the guide text.
pub fn build_nav(entries: &[NcxEntry], guide_text: &str, title: &str, lang: &str) -> String {
    log::info!("building navigation document");
    format!(
        "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n\
         <!DOCTYPE html><html xmlns=\"http://www.w3.org/1999/xhtml\" \
         xmlns:epub=\"http://www.idpf.org/2007/ops\" lang=\"{lang}\" xml:lang=\"{lang}\">\n\
         <head>\n<title>{title}</title>\n\
         <meta charset=\"UTF-8\" />\n\
         <style type=\"text/css\">\n\
         nav#landmarks {{ display:none; }}\n\
         </style>\n</head>\n<body>\n\
         {landmarks}{toc}\
         </body>\n</html>\n",
        title = escape(title),
        landmarks = build_landmarks(guide_text),
        toc = build_toc(entries),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(text: &str, filename: &str, hlvl: i64) -> NcxEntry {
        NcxEntry {
            name: "0000".to_string(),
            pos: 0,
            len: 0,
            text: text.to_string(),
            kind: String::new(),
            hlvl,
            pos_fid: None,
            parent: -1,
            child1: -1,
            childn: -1,
            filename: filename.to_string(),
            id_tag: String::new(),
        }
    }

    #[test]
    fn test_landmarks_from_guide() {
        let guide = "<reference type=\"toc\" title=\"Contents\" href=\"Text/part0001.xhtml\" />\n\
                     <reference type=\"other.weird\" title=\"X\" href=\"Text/part0002.xhtml\" />\n";
        let nav = build_nav(&[], guide, "T", "en");

        assert!(nav.contains("epub:type=\"toc\" href=\"part0001.xhtml\">Contents<"), "{nav}");
        // unmapped guide types are dropped from the landmarks
        assert!(!nav.contains("part0002"));
    }

    #[test]
    fn test_toc_nesting() {
        let mut parent = entry("Part 1", "part0000.xhtml", 0);
        parent.child1 = 1;
        parent.childn = 1;
        let entries = vec![parent, entry("Ch 1", "part0001.xhtml", 1)];
        let nav = build_nav(&entries, "", "T", "en");

        assert!(nav.contains("<a href=\"part0000.xhtml\">Part 1</a>"));
        assert!(nav.contains("<a href=\"part0001.xhtml\">Ch 1</a>"));
        // no landmarks nav without guide entries
        assert!(!nav.contains("landmarks\" id"));
    }
}
