//! NCX index extraction and toc.ncx generation.

use quick_xml::escape::escape;

use crate::error::Result;
use crate::kf8::K8Processor;
use crate::mobi::headers::{MobiHeader, NULL_INDEX};
use crate::mobi::index::read_index;
use crate::mobi::{decode_text, to_base32};
use crate::pdb::Sectionizer;

/// One NCX entry. `pos` addresses the rawML; for KF8 books `filename`
/// and `id_tag` are filled in through the fragment table afterwards.
#[derive(Debug, Clone)]
pub struct NcxEntry {
    pub name: String,
    pub pos: i64,
    pub len: u64,
    pub text: String,
    pub kind: String,
    pub hlvl: i64,
    pub pos_fid: Option<(u64, u64)>,
    pub parent: i64,
    pub child1: i64,
    pub childn: i64,
    pub filename: String,
    pub id_tag: String,
}

/// Decode the NCX INDX chain. Tags: 1 position, 2 length, 3 text
/// offset, 4 heading level, 5 kind offset, 6 pos_fid pair, 21 parent,
/// 22 first child, 23 last child.
pub fn parse_ncx(sect: &Sectionizer, mh: &MobiHeader) -> Result<Vec<NcxEntry>> {
    let mut ncx = Vec::new();
    if mh.ncx_index == NULL_INDEX {
        return Ok(ncx);
    }
    let (entries, cncx) = read_index(sect, mh.ncx_index, "NCX")?;
    for entry in entries {
        let cncx_text = |off: Option<u64>, fallback: &str| -> String {
            off.and_then(|o| cncx.get(&(o as u32)))
                .map(|bytes| decode_text(mh.codec, bytes))
                .unwrap_or_else(|| fallback.to_string())
        };
        ncx.push(NcxEntry {
            name: String::from_utf8_lossy(&entry.text).into_owned(),
            pos: entry.tag_first(1).map(|v| v as i64).unwrap_or(-1),
            len: entry.tag_first(2).unwrap_or(0),
            text: cncx_text(entry.tag_first(3), "Unknown Text"),
            kind: cncx_text(entry.tag_first(5), "Unknown Kind"),
            hlvl: entry.tag_first(4).map(|v| v as i64).unwrap_or(-1),
            pos_fid: entry.tag_pair(6),
            parent: entry.tag_first(21).map(|v| v as i64).unwrap_or(-1),
            child1: entry.tag_first(22).map(|v| v as i64).unwrap_or(-1),
            childn: entry.tag_first(23).map(|v| v as i64).unwrap_or(-1),
            filename: String::new(),
            id_tag: String::new(),
        });
    }
    Ok(ncx)
}

/// Render an entry's `kindle:pos:fid` URI the way the container encodes
/// it (fid 4 digits, offset 10 digits).
pub fn pos_fid_uri(fid: u64, off: u64) -> String {
    format!("kindle:pos:fid:{}:off:{}", to_base32(fid, 4), to_base32(off, 10))
}

/// Resolve each entry's `pos_fid` through the assembled KF8 parts into
/// a part filename and anchor id.
pub fn resolve_pos_fids(ncx: &mut [NcxEntry], k8: &mut K8Processor) {
    for entry in ncx.iter_mut() {
        let Some((fid, off)) = entry.pos_fid else {
            continue;
        };
        let (filename, id_tag) = k8.id_tag_by_pos_fid(fid as usize, off as usize);
        entry.filename = filename;
        entry.id_tag = String::from_utf8_lossy(&id_tag).into_owned();
    }
}

fn ncx_header(lang: &str, ident: &str, depth: i64, title: &str) -> String {
    format!(
        "<?xml version='1.0' encoding='utf-8'?>\n\
         <ncx xmlns=\"http://www.daisy.org/z3986/2005/ncx/\" version=\"2005-1\" xml:lang=\"{lang}\">\n\
         <head>\n\
         <meta content=\"{ident}\" name=\"dtb:uid\"/>\n\
         <meta content=\"{depth}\" name=\"dtb:depth\"/>\n\
         <meta content=\"mobiunpack\" name=\"dtb:generator\"/>\n\
         <meta content=\"0\" name=\"dtb:totalPageCount\"/>\n\
         <meta content=\"0\" name=\"dtb:maxPageNumber\"/>\n\
         </head>\n\
         <docTitle>\n\
         <text>{title}</text>\n\
         </docTitle>\n\
         <navMap>\n",
        title = escape(title),
    )
}

const NCX_FOOTER: &str = "  </navMap>\n</ncx>\n";

/// Recursive navPoint emission over one heading level; children are the
/// `[child1, childn]` entry range.
fn recurs_indx(
    entries: &[NcxEntry],
    href: &dyn Fn(&NcxEntry) -> String,
    xml: &mut String,
    max_lvl: &mut i64,
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
    if lvl > *max_lvl {
        *max_lvl = lvl;
    }
    let indent = "  ".repeat((2 + lvl) as usize);

    for entry in &entries[start..end] {
        if entry.hlvl != lvl {
            continue;
        }
        *num += 1;
        let link = href(entry);
        xml.push_str(&format!(
            "{indent}<navPoint id=\"np_{num}\" playOrder=\"{num}\">\n\
             {indent}<navLabel>\n\
             {indent}<text>{text}</text>\n\
             {indent}</navLabel>\n\
             {indent}<content src=\"{link}\"/>",
            text = escape(&entry.text),
        ));
        xml.push('\n');
        if entry.child1 >= 0 {
            recurs_indx(entries, href, xml, max_lvl, num, lvl + 1, entry.child1, entry.childn + 1);
        }
        xml.push_str(&indent);
        xml.push_str("</navPoint>\n");
    }
}

fn build(
    entries: &[NcxEntry],
    href: &dyn Fn(&NcxEntry) -> String,
    title: &str,
    ident: &str,
    lang: &str,
) -> String {
    let mut body = String::new();
    let mut max_lvl = 0;
    let mut num = 0;
    recurs_indx(entries, href, &mut body, &mut max_lvl, &mut num, 0, -1, -1);
    if num != entries.len() {
        log::warn!("different number of entries in NCX: {} / {num}", entries.len());
    }
    format!("{}{}{}", ncx_header(lang, ident, max_lvl + 1, title), body, NCX_FOOTER)
}

/// toc.ncx for a legacy book: one HTML file addressed by filepos
/// anchors.
pub fn build_ncx(
    entries: &[NcxEntry],
    html_name: &str,
    title: &str,
    ident: &str,
    lang: &str,
) -> String {
    let html_name = html_name.to_string();
    build(entries, &move |e: &NcxEntry| format!("{html_name}#filepos{}", e.pos), title, ident, lang)
}

/// toc.ncx for a KF8 book: per-part files with resolved anchors.
pub fn build_k8_ncx(entries: &[NcxEntry], title: &str, ident: &str, lang: &str) -> String {
    build(
        entries,
        &|e: &NcxEntry| {
            if e.id_tag.is_empty() {
                format!("Text/{}", e.filename)
            } else {
                format!("Text/{}#{}", e.filename, e.id_tag)
            }
        },
        title,
        ident,
        lang,
    )
}
