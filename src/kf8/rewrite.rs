//! KF8 link rewriting.
//!
//! Internal links in the rawML are position-based `kindle:` URIs; before
//! the parts can be written out as XHTML they are resolved to relative
//! file references:
//!
//! - `kindle:pos:fid:XXXX:off:YYYYYYYYYY` → `part0007.xhtml#anchor`
//! - `kindle:embed:XXXX?mime=image/…` → `../Images/<name>`
//! - `kindle:embed:XXXX` (css url) → `../Fonts/<name>`
//! - `kindle:flow:XXXX?mime=…` → `../Styles/<name>`, `../Images/<name>`,
//!   or spliced inline for CDATA/SVG flows
//!
//! The passes run positions-first: every `pos:fid` is resolved against
//! the fragment table **before** any content is cut or pasted, so the
//! offsets recorded at build time stay valid.

use std::collections::HashSet;

use bstr::ByteSlice;
use memchr::memmem;

use super::skeleton::{K8Processor, attr_value, find_ci};
use crate::mobi::from_base32;

/// Rewrite all `kindle:` references in the assembled parts and flows.
/// Returns the set of resource names actually referenced, so the
/// manifest can exclude unused assets.
pub fn rebuild_xhtml(k8: &mut K8Processor, rscnames: &[Option<String>]) -> HashSet<String> {
    let mut used = HashSet::new();

    log::info!("building proper xhtml for each file");
    // 1. internal pos:fid links, resolved against the untouched parts
    let mut parts: Vec<Vec<u8>> = Vec::with_capacity(k8.parts.len());
    for i in 0..k8.parts.len() {
        let part = k8.parts[i].clone();
        parts.push(rewrite_pos_fid_links(&part, k8));
    }

    for part in &mut parts {
        // 2. drop Kindlegen aid attributes, keeping linked ones as ids
        *part = map_tags(part, |tag| strip_aid_attribute(tag, &k8.linked_aids));
        // 3. page-break data attributes become inline styles
        *part = map_tags(part, rewrite_amzn_page_break);
    }

    // 4. flow pieces first, since they may be inlined into parts later
    let mut flows = k8.flows.clone();
    for (j, flow) in flows.iter_mut().enumerate().skip(1) {
        *flow = rewrite_flow_piece(flow, j, k8, rscnames, &mut used);
    }

    for part in &mut parts {
        // 5. flow references: splice inline pieces, link file pieces
        *part = map_tags(part, |tag| rewrite_flow_ref(tag, k8, &flows, &mut used));
        // 6. raster images in style= urls and img/image tags
        *part = map_tags(part, |tag| {
            if attr_value(tag, b"style").is_some() && memmem::find(tag, b"kindle:embed").is_some() {
                Some(rewrite_embeds(tag, rscnames, &mut used, "../Images", false))
            } else {
                None
            }
        });
        *part = map_tags(part, |tag| {
            if is_image_tag(tag) && memmem::find(tag, b"kindle:embed").is_some() {
                Some(rewrite_embeds(tag, rscnames, &mut used, "../Images", false))
            } else {
                None
            }
        });
        // 7. general cleanups for valid xhtml
        *part = map_tags(part, tidy_tag);
    }

    k8.parts = parts;
    k8.flows = flows;
    used
}

/// Scan `< … >` tags, letting `f` replace whole tags; bytes outside tags
/// are copied through untouched.
fn map_tags(html: &[u8], mut f: impl FnMut(&[u8]) -> Option<Vec<u8>>) -> Vec<u8> {
    let mut output = Vec::with_capacity(html.len());
    let mut pos = 0;
    while pos < html.len() {
        let Some(lt) = memchr::memchr(b'<', &html[pos..]) else {
            output.extend_from_slice(&html[pos..]);
            break;
        };
        let lt = pos + lt;
        output.extend_from_slice(&html[pos..lt]);
        let Some(gt) = memchr::memchr(b'>', &html[lt..]) else {
            output.extend_from_slice(&html[lt..]);
            break;
        };
        let gt = lt + gt;
        let tag = &html[lt..=gt];
        match f(tag) {
            Some(replacement) => output.extend_from_slice(&replacement),
            None => output.extend_from_slice(tag),
        }
        pos = gt + 1;
    }
    output
}

fn is_base32_digit(b: u8) -> bool {
    b.is_ascii_digit() || (b'A'..=b'V').contains(&b) || (b'a'..=b'v').contains(&b)
}

fn is_quote(b: u8) -> bool {
    b == b'"' || b == b'\''
}

/// Resolve `kindle:pos:fid:X:off:Y` references to `filename#id` links.
fn rewrite_pos_fid_links(part: &[u8], k8: &mut K8Processor) -> Vec<u8> {
    let finder = memmem::Finder::new(b"kindle:pos:fid:");
    let mut output = Vec::with_capacity(part.len());
    let mut pos = 0;

    while let Some(rel) = finder.find(&part[pos..]) {
        let start = pos + rel;
        // the URI must be quoted; the quote is replaced along with it
        if start == 0 || !is_quote(part[start - 1]) {
            output.extend_from_slice(&part[pos..start + 15]);
            pos = start + 15;
            continue;
        }

        let mut p = start + 15;
        let fid_start = p;
        while p < part.len() && is_base32_digit(part[p]) {
            p += 1;
        }
        let fid = &part[fid_start..p];
        if fid.is_empty() || !part[p..].starts_with(b":off:") {
            output.extend_from_slice(&part[pos..p]);
            pos = p;
            continue;
        }
        p += 5;
        let off_start = p;
        while p < part.len() && is_base32_digit(part[p]) {
            p += 1;
        }
        let off = &part[off_start..p];
        // skip anything else up to the closing quote
        let Some(close_rel) = part[p..].find_byteset(b"\"'") else {
            output.extend_from_slice(&part[pos..p]);
            pos = p;
            break;
        };
        let close = p + close_rel;

        let (filename, id) =
            k8.id_tag_by_pos_fid(from_base32(fid) as usize, from_base32(off) as usize);
        output.extend_from_slice(&part[pos..start - 1]);
        output.push(b'"');
        output.extend_from_slice(filename.as_bytes());
        if !id.is_empty() {
            output.push(b'#');
            output.extend_from_slice(&id);
        }
        output.push(b'"');
        pos = close + 1;
    }
    output.extend_from_slice(&part[pos..]);
    output
}

/// Remove ` aid="…"` from a tag, or turn it into ` id="aid-…"` when the
/// aid is a link target. Returns `None` when the tag has no aid.
fn strip_aid_attribute(tag: &[u8], linked_aids: &HashSet<Vec<u8>>) -> Option<Vec<u8>> {
    let rel = find_attr(tag, b"aid")?;
    let aid = attr_value(&tag[rel.0..rel.1], b"aid").unwrap_or(b"");
    let mut out = Vec::with_capacity(tag.len());
    out.extend_from_slice(&tag[..rel.0]);
    if linked_aids.contains(aid) {
        out.extend_from_slice(b" id=\"aid-");
        out.extend_from_slice(aid);
        out.push(b'"');
    }
    out.extend_from_slice(&tag[rel.1..]);
    // a tag may carry several (malformed) aid attributes
    Some(strip_aid_attribute(&out, linked_aids).unwrap_or(out))
}

/// Rewrite ` data-AmznPageBreak="v"` into ` style="page-break-after:v"`.
fn rewrite_amzn_page_break(tag: &[u8]) -> Option<Vec<u8>> {
    let rel = find_attr(tag, b"data-AmznPageBreak")?;
    let value = attr_value(&tag[rel.0..rel.1], b"data-AmznPageBreak").unwrap_or(b"");
    let mut out = Vec::with_capacity(tag.len());
    out.extend_from_slice(&tag[..rel.0]);
    out.extend_from_slice(b" style=\"page-break-after:");
    out.extend_from_slice(value);
    out.push(b'"');
    out.extend_from_slice(&tag[rel.1..]);
    Some(out)
}

/// Byte span `(start, end)` of ` name="value"` inside a tag, including
/// the leading whitespace.
fn find_attr(tag: &[u8], name: &[u8]) -> Option<(usize, usize)> {
    let mut search = 0;
    while search < tag.len() {
        let rel = find_ci(&tag[search..], name)?;
        let start = search + rel;
        search = start + 1;
        if start == 0 || !tag[start - 1].is_ascii_whitespace() {
            continue;
        }
        let mut p = start + name.len();
        while p < tag.len() && tag[p].is_ascii_whitespace() {
            p += 1;
        }
        if p >= tag.len() || tag[p] != b'=' {
            continue;
        }
        p += 1;
        while p < tag.len() && tag[p].is_ascii_whitespace() {
            p += 1;
        }
        if p >= tag.len() || !is_quote(tag[p]) {
            continue;
        }
        let quote = tag[p];
        p += 1;
        let end = memchr::memchr(quote, &tag[p..])?;
        return Some((start - 1, p + end + 1));
    }
    None
}

fn is_image_tag(tag: &[u8]) -> bool {
    let lower = |prefix: &[u8]| {
        tag.len() > prefix.len()
            && tag[..prefix.len()].eq_ignore_ascii_case(prefix)
            && (tag[prefix.len()].is_ascii_whitespace() || tag[prefix.len()] == b'/')
    };
    lower(b"<img") || lower(b"<image")
}

/// One parsed `kindle:embed`/`kindle:flow` reference, spanning the
/// opening and closing separator (quote or paren).
struct KindleRef {
    start: usize,
    end: usize,
    number: u64,
    mime: Option<Vec<u8>>,
}

fn next_kindle_ref(data: &[u8], prefix: &[u8], from: usize) -> Option<KindleRef> {
    let mut pos = from;
    while let Some(rel) = memmem::find(&data[pos..], prefix) {
        let start = pos + rel;
        pos = start + prefix.len();
        if start == 0 {
            continue;
        }
        let osep = data[start - 1];
        if !is_quote(osep) && osep != b'(' {
            continue;
        }
        let mut p = start + prefix.len();
        let id_start = p;
        while p < data.len() && is_base32_digit(data[p]) {
            p += 1;
        }
        if p == id_start {
            continue;
        }
        let number = from_base32(&data[id_start..p]);
        let mime = if data[p..].starts_with(b"?mime=") {
            let mime_start = p + 6;
            let mut q = mime_start;
            while q < data.len() && !is_quote(data[q]) && data[q] != b')' {
                q += 1;
            }
            p = q;
            Some(data[mime_start..q].to_vec())
        } else {
            None
        };
        // tolerate junk before the closing separator
        let close = data[p..].find_byteset(b"\"')")?;
        return Some(KindleRef { start: start - 1, end: p + close + 1, number, mime });
    }
    None
}

/// Replace every `kindle:embed` reference in a buffer with a path into
/// `dir`, preserving the surrounding separators. With `fonts_fallback`,
/// mime-less references are fonts (`../Fonts`), the css `url()` case.
fn rewrite_embeds(
    data: &[u8],
    rscnames: &[Option<String>],
    used: &mut HashSet<String>,
    dir: &str,
    fonts_fallback: bool,
) -> Vec<u8> {
    let mut output = Vec::with_capacity(data.len());
    let mut pos = 0;
    while let Some(r) = next_kindle_ref(data, b"kindle:embed:", pos) {
        let is_image = r.mime.as_deref().map(|m| m.starts_with(b"image/")).unwrap_or(false);
        let target_dir = if is_image || !fonts_fallback { dir } else { "../Fonts" };
        // embed numbers are 1-based indexes into the resource names
        let name = r
            .number
            .checked_sub(1)
            .and_then(|i| rscnames.get(i as usize))
            .and_then(|n| n.clone());
        output.extend_from_slice(&data[pos..r.start]);
        match name {
            Some(name) => {
                output.push(data[r.start]);
                output.extend_from_slice(target_dir.as_bytes());
                output.push(b'/');
                output.extend_from_slice(name.as_bytes());
                output.push(data[r.end - 1]);
                used.insert(name);
            }
            None => {
                log::warn!("referenced resource {} was not recognized", r.number);
                output.extend_from_slice(&data[r.start..r.end]);
            }
        }
        pos = r.end;
    }
    output.extend_from_slice(&data[pos..]);
    output
}

/// Rewrite a non-body flow piece: image embeds inside `<img>`/`<image>`
/// tags, then font/image embeds and flow cross-references in css urls.
fn rewrite_flow_piece(
    flow: &[u8],
    _num: usize,
    k8: &K8Processor,
    rscnames: &[Option<String>],
    used: &mut HashSet<String>,
) -> Vec<u8> {
    let mut out = map_tags(flow, |tag| {
        if is_image_tag(tag) && memmem::find(tag, b"kindle:embed").is_some() {
            Some(rewrite_embeds(tag, rscnames, used, "../Images", false))
        } else {
            None
        }
    });
    // remaining embeds live in css url(): images keep their mime, fonts
    // have none
    out = rewrite_embeds(&out, rscnames, used, "../Images", true);

    // css @import / svg references to other flows
    let mut output = Vec::with_capacity(out.len());
    let mut pos = 0;
    while let Some(r) = next_kindle_ref(&out, b"kindle:flow:", pos) {
        output.extend_from_slice(&out[pos..r.start]);
        match flow_path(k8, r.number as usize) {
            Some(path) => {
                let name = path.rsplit('/').next().unwrap_or_default().to_string();
                output.push(out[r.start]);
                output.extend_from_slice(path.as_bytes());
                output.push(out[r.end - 1]);
                used.insert(name);
            }
            None => {
                log::warn!("ignoring non-existent flow link 0x{:x}", r.number);
                output.extend_from_slice(&out[r.start..r.end]);
            }
        }
        pos = r.end;
    }
    output.extend_from_slice(&out[pos..]);
    output
}

fn flow_path(k8: &K8Processor, num: usize) -> Option<String> {
    let info = k8.flow_info.get(num)?.as_ref()?;
    if info.inline {
        return None;
    }
    Some(format!("../{}/{}", info.dir, info.filename))
}

/// Handle `kindle:flow` references inside a part's tags: inline flows
/// replace the whole tag, file flows become relative hrefs.
fn rewrite_flow_ref(
    tag: &[u8],
    k8: &K8Processor,
    flows: &[Vec<u8>],
    used: &mut HashSet<String>,
) -> Option<Vec<u8>> {
    let r = next_kindle_ref(tag, b"kindle:flow:", 0)?;
    let num = r.number as usize;
    let Some(Some(info)) = k8.flow_info.get(num) else {
        log::warn!("ignoring non-existent flow link 0x{num:x}");
        return None;
    };
    if info.inline {
        return Some(flows[num].clone());
    }
    let mut out = Vec::with_capacity(tag.len());
    out.extend_from_slice(&tag[..r.start]);
    out.push(b'"');
    out.extend_from_slice(format!("../{}/{}", info.dir, info.filename).as_bytes());
    out.push(b'"');
    out.extend_from_slice(&tag[r.end..]);
    used.insert(info.filename.clone());
    // a tag carries at most one flow reference; recurse for safety
    Some(rewrite_flow_ref(&out, k8, flows, used).unwrap_or(out))
}

/// Final per-tag cleanups: canonical SVG attribute casing, and `<li>`
/// `value=` attributes which are illegal in xhtml.
fn tidy_tag(tag: &[u8]) -> Option<Vec<u8>> {
    if tag.len() >= 4 && tag[..4].eq_ignore_ascii_case(b"<svg") {
        let mut out = tag.to_vec();
        replace_all_ci(&mut out, b"preserveaspectratio", b"preserveAspectRatio");
        replace_all_ci(&mut out, b"viewbox", b"viewBox");
        return Some(out);
    }
    if tag.len() >= 4 && tag[..4].eq_ignore_ascii_case(b"<li ") {
        let (start, end) = find_attr(tag, b"value")?;
        let mut out = Vec::with_capacity(tag.len());
        out.extend_from_slice(&tag[..start]);
        out.extend_from_slice(&tag[end..]);
        return Some(out);
    }
    None
}

fn replace_all_ci(data: &mut Vec<u8>, needle: &[u8], replacement: &[u8]) {
    debug_assert_eq!(needle.len(), replacement.len());
    let mut pos = 0;
    while let Some(rel) = find_ci(&data[pos..], needle) {
        let at = pos + rel;
        data[at..at + needle.len()].copy_from_slice(replacement);
        pos = at + needle.len();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kf8::skeleton::{FlowInfo, FlowKind, FragmentEntry, PartInfo};
    use crate::mobi::headers::Codec;

    fn k8_with_one_part(part: &[u8]) -> K8Processor {
        let mut k8 = K8Processor {
            codec: Codec::Utf8,
            fdst_starts: Vec::new(),
            skel_table: Vec::new(),
            frag_table: vec![FragmentEntry {
                insert_pos: 0,
                id_text: b"P-//*[@aid='AB']".to_vec(),
                file_num: 0,
                seq: 0,
                start: 0,
                len: part.len(),
            }],
            guide_table: Vec::new(),
            parts: vec![part.to_vec()],
            part_info: vec![PartInfo {
                skel_num: 0,
                dir: "Text",
                filename: "part0000.xhtml".into(),
                start: 0,
                end: part.len(),
                aid: b"AB".to_vec(),
            }],
            flows: vec![Vec::new()],
            flow_info: vec![None],
            linked_aids: std::collections::HashSet::new(),
        };
        k8.fdst_starts = vec![0];
        k8
    }

    #[test]
    fn test_pos_fid_link_rewritten() {
        let part = b"<div id=\"top\"><a href=\"kindle:pos:fid:0000:off:0000000000\">go</a></div>";
        let mut k8 = k8_with_one_part(part);
        let used = rebuild_xhtml(&mut k8, &[]);

        let text = String::from_utf8(k8.parts[0].clone()).unwrap();
        assert!(text.contains("href=\"part0000.xhtml#top\""), "{text}");
        assert!(!text.contains("kindle:"));
        assert!(used.is_empty());
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let part = b"<div id=\"top\"><a href=\"kindle:pos:fid:0000:off:0000000000\">go</a></div>";
        let mut k8 = k8_with_one_part(part);
        rebuild_xhtml(&mut k8, &[]);
        let once = k8.parts[0].clone();
        rebuild_xhtml(&mut k8, &[]);
        assert_eq!(k8.parts[0], once);
    }

    #[test]
    fn test_unlinked_aid_stripped_linked_aid_kept() {
        let part = b"<p aid=\"AA\">x</p><p aid=\"BB\">y</p>";
        let mut k8 = k8_with_one_part(part);
        k8.linked_aids.insert(b"BB".to_vec());
        rebuild_xhtml(&mut k8, &[]);

        let text = String::from_utf8(k8.parts[0].clone()).unwrap();
        assert_eq!(text, "<p>x</p><p id=\"aid-BB\">y</p>");
    }

    #[test]
    fn test_amzn_page_break() {
        let part = b"<div data-AmznPageBreak=\"always\">x</div>";
        let mut k8 = k8_with_one_part(part);
        rebuild_xhtml(&mut k8, &[]);

        assert_eq!(
            k8.parts[0],
            b"<div style=\"page-break-after:always\">x</div>"
        );
    }

    #[test]
    fn test_img_embed_rewritten_and_used_tracked() {
        let part = b"<img src=\"kindle:embed:0002?mime=image/jpeg\"/>";
        let mut k8 = k8_with_one_part(part);
        let rscnames = vec![Some("image00001.jpeg".to_string()), Some("image00002.jpeg".to_string())];
        let used = rebuild_xhtml(&mut k8, &rscnames);

        let text = String::from_utf8(k8.parts[0].clone()).unwrap();
        assert_eq!(text, "<img src=\"../Images/image00002.jpeg\"/>");
        assert!(used.contains("image00002.jpeg"));
        assert!(!used.contains("image00001.jpeg"));
    }

    #[test]
    fn test_css_flow_ref_in_part() {
        let part = b"<link href=\"kindle:flow:0001?mime=text/css\" rel=\"stylesheet\"/>";
        let mut k8 = k8_with_one_part(part);
        k8.flows = vec![Vec::new(), b"p { margin: 0 }".to_vec()];
        k8.flow_info = vec![
            None,
            Some(FlowInfo {
                kind: FlowKind::Css,
                inline: false,
                dir: "Styles",
                filename: "style0001.css".into(),
            }),
        ];
        let used = rebuild_xhtml(&mut k8, &[]);

        let text = String::from_utf8(k8.parts[0].clone()).unwrap();
        assert!(text.contains("href=\"../Styles/style0001.css\""), "{text}");
        assert!(used.contains("style0001.css"));
    }

    #[test]
    fn test_inline_flow_spliced_in_place() {
        let part = b"<link href=\"kindle:flow:0001?mime=text/css\"/>";
        let mut k8 = k8_with_one_part(part);
        k8.flows = vec![Vec::new(), b"<style type=\"text/css\">p{}</style>".to_vec()];
        k8.flow_info = vec![
            None,
            Some(FlowInfo { kind: FlowKind::Css, inline: true, dir: "", filename: String::new() }),
        ];
        rebuild_xhtml(&mut k8, &[]);

        assert_eq!(k8.parts[0], b"<style type=\"text/css\">p{}</style>");
    }

    #[test]
    fn test_font_embed_in_css_flow() {
        let mut k8 = k8_with_one_part(b"<p>x</p>");
        k8.flows = vec![
            Vec::new(),
            b"@font-face { src: url(\"kindle:embed:0001\") }".to_vec(),
        ];
        k8.flow_info = vec![
            None,
            Some(FlowInfo {
                kind: FlowKind::Css,
                inline: false,
                dir: "Styles",
                filename: "style0001.css".into(),
            }),
        ];
        let rscnames = vec![Some("font00004.ttf".to_string())];
        let used = rebuild_xhtml(&mut k8, &rscnames);

        let css = String::from_utf8(k8.flows[1].clone()).unwrap();
        assert!(css.contains("url(\"../Fonts/font00004.ttf\")"), "{css}");
        assert!(used.contains("font00004.ttf"));
    }

    #[test]
    fn test_image_embed_in_css_url_goes_to_images() {
        let mut k8 = k8_with_one_part(b"<p>x</p>");
        k8.flows = vec![
            Vec::new(),
            b"div { background: url('kindle:embed:0001?mime=image/png') }".to_vec(),
        ];
        k8.flow_info = vec![
            None,
            Some(FlowInfo {
                kind: FlowKind::Css,
                inline: false,
                dir: "Styles",
                filename: "style0001.css".into(),
            }),
        ];
        let rscnames = vec![Some("image00001.png".to_string())];
        rebuild_xhtml(&mut k8, &rscnames);

        let css = String::from_utf8(k8.flows[1].clone()).unwrap();
        assert!(css.contains("url('../Images/image00001.png')"), "{css}");
    }

    #[test]
    fn test_svg_attrs_and_li_value() {
        let part = b"<svg preserveaspectratio=\"x\" viewbox=\"0 0 1 1\"></svg><li value=\"3\">i</li>";
        let mut k8 = k8_with_one_part(part);
        rebuild_xhtml(&mut k8, &[]);

        let text = String::from_utf8(k8.parts[0].clone()).unwrap();
        assert!(text.contains("preserveAspectRatio"));
        assert!(text.contains("viewBox"));
        assert!(text.contains("<li>i</li>"), "{text}");
    }

    #[test]
    fn test_style_attr_embed() {
        let part = b"<div style=\"background: url('kindle:embed:0001?mime=image/gif')\">x</div>";
        let mut k8 = k8_with_one_part(part);
        let rscnames = vec![Some("image00001.gif".to_string())];
        rebuild_xhtml(&mut k8, &rscnames);

        let text = String::from_utf8(k8.parts[0].clone()).unwrap();
        assert!(text.contains("url('../Images/image00001.gif')"), "{text}");
    }
}
