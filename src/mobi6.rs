//! Mobi 6 HTML post-processing.
//!
//! Legacy Mobipocket books are one HTML stream addressed by byte
//! position: links carry `filepos=NNNN` attributes and images
//! `recindex=NNNNN` record references. Reconstruction inserts
//! `<a id="fileposNNNN"/>` anchors at every referenced position (from
//! links, the NCX, and dictionary entries), then rewrites the
//! attributes into ordinary hrefs and image paths.

use std::collections::{BTreeMap, HashSet};

use memchr::memmem;

use crate::kf8::skeleton::find_ci;

/// Anchor/markup insertions keyed by byte position in the rawML. The
/// dictionary engine seeds this map with `<idx:entry>` markup; filepos
/// anchors are appended after it at the same positions.
pub type PositionMap = BTreeMap<usize, Vec<u8>>;

fn parse_filepos_at(data: &[u8], mut p: usize) -> Option<(usize, usize)> {
    // filepos=['"]{0,1}digits -> (value, end offset)
    if p < data.len() && (data[p] == b'"' || data[p] == b'\'') {
        p += 1;
    }
    let digits_start = p;
    while p < data.len() && data[p].is_ascii_digit() {
        p += 1;
    }
    if p == digits_start {
        return None;
    }
    let value = std::str::from_utf8(&data[digits_start..p]).ok()?.parse().ok()?;
    Some((value, p))
}

/// Collect every `filepos=` target inside tags.
fn collect_filepos_targets(raw: &[u8]) -> HashSet<usize> {
    let mut targets = HashSet::new();
    let finder = memmem::Finder::new(b"filepos=");
    let mut pos = 0;
    while let Some(rel) = finder.find(&raw[pos..]) {
        let at = pos + rel;
        if let Some((value, end)) = parse_filepos_at(raw, at + 8) {
            targets.insert(value);
            pos = end;
        } else {
            pos = at + 8;
        }
    }
    targets
}

/// Insert anchors for every link target (filepos attributes plus NCX
/// positions) and any dictionary markup into the raw text. Insertions
/// are merged in one sorted pass so byte offsets stay valid.
pub fn find_anchors(
    raw: &[u8],
    ncx_positions: &[usize],
    position_map: &mut PositionMap,
) -> Vec<u8> {
    log::info!("find link anchors");
    let mut positions = collect_filepos_targets(raw);
    positions.extend(ncx_positions.iter().copied().filter(|&p| p > 0));

    for position in positions {
        let anchor = format!("<a id=\"filepos{position}\" />");
        position_map.entry(position).or_default().extend_from_slice(anchor.as_bytes());
    }

    log::info!("insert data into html");
    let mut output = Vec::with_capacity(raw.len() + position_map.len() * 24);
    let mut last = 0;
    for (&end, insertion) in position_map.iter() {
        // can't place a tag at 0 or outside the document
        if end == 0 || end > raw.len() {
            continue;
        }
        output.extend_from_slice(&raw[last..end]);
        output.extend_from_slice(insertion);
        last = end;
    }
    output.extend_from_slice(&raw[last..]);
    output
}

fn is_anchor_tag(tag: &[u8]) -> bool {
    tag.len() > 2
        && (tag[1] == b'a' || tag[1] == b'A')
        && (tag[2].is_ascii_whitespace() || tag[2] == b'>' || tag[2] == b'/')
}

fn rewrite_anchor_filepos(tag: &[u8]) -> Option<Vec<u8>> {
    let at = memmem::find(tag, b"filepos=")?;
    let mut p = at + 8;
    let has_quote = p < tag.len() && (tag[p] == b'"' || tag[p] == b'\'');
    if has_quote {
        p += 1;
    }
    let digits_start = p;
    while p < tag.len() && tag[p].is_ascii_digit() {
        p += 1;
    }
    if p == digits_start {
        return None;
    }
    let value: u64 = std::str::from_utf8(&tag[digits_start..p]).ok()?.parse().ok()?;
    if has_quote && p < tag.len() && (tag[p] == b'"' || tag[p] == b'\'') {
        p += 1;
    }

    let mut out = Vec::with_capacity(tag.len() + 8);
    out.extend_from_slice(&tag[..at]);
    out.extend_from_slice(format!("href=\"#filepos{value}\"").as_bytes());
    out.extend_from_slice(&tag[p..]);
    Some(out)
}

fn rewrite_img_recindex(tag: &[u8], rscnames: &[Option<String>]) -> Option<Vec<u8>> {
    let at = find_ci(tag, b"recindex=")?;
    let mut p = at + 9;
    if p < tag.len() && (tag[p] == b'"' || tag[p] == b'\'') {
        p += 1;
    }
    let digits_start = p;
    while p < tag.len() && tag[p].is_ascii_digit() {
        p += 1;
    }
    let number: usize = std::str::from_utf8(&tag[digits_start..p]).ok()?.parse().ok()?;
    if p < tag.len() && (tag[p] == b'"' || tag[p] == b'\'') {
        p += 1;
    }

    let name = number.checked_sub(1).and_then(|i| rscnames.get(i)).and_then(|n| n.as_ref());
    let Some(name) = name else {
        log::warn!("referenced image {number} was not recognized as a valid image");
        return None;
    };
    let mut out = Vec::with_capacity(tag.len() + name.len());
    out.extend_from_slice(&tag[..at]);
    out.extend_from_slice(format!("src=\"Images/{name}\"").as_bytes());
    out.extend_from_slice(&tag[p..]);
    Some(out)
}

/// Convert `filepos=` links to hrefs, remove empty anchors, resolve
/// `recindex=` image references, and inject the charset meta tag.
/// Returns the finished HTML and the set of used resource names (for
/// legacy books every recognised resource lands in the manifest).
pub fn insert_hrefs(
    src: &[u8],
    rscnames: &[Option<String>],
    codec_name: &str,
) -> (Vec<u8>, HashSet<String>) {
    log::info!("insert hrefs into html");
    let mut output = Vec::with_capacity(src.len());
    let mut pos = 0;
    while pos < src.len() {
        let Some(lt_rel) = memchr::memchr(b'<', &src[pos..]) else {
            output.extend_from_slice(&src[pos..]);
            break;
        };
        let lt = pos + lt_rel;
        output.extend_from_slice(&src[pos..lt]);
        let Some(gt_rel) = memchr::memchr(b'>', &src[lt..]) else {
            output.extend_from_slice(&src[lt..]);
            break;
        };
        let gt = lt + gt_rel;
        let tag = &src[lt..=gt];

        if is_anchor_tag(tag) && memmem::find(tag, b"filepos=").is_some() {
            match rewrite_anchor_filepos(tag) {
                Some(rewritten) => output.extend_from_slice(&rewritten),
                None => output.extend_from_slice(tag),
            }
        } else if find_ci(tag, b"<img").is_some() && find_ci(tag, b"recindex=").is_some() {
            let mut rewritten = tag.to_vec();
            while let Some(next) = rewrite_img_recindex(&rewritten, rscnames) {
                rewritten = next;
            }
            output.extend_from_slice(&rewritten);
        } else {
            output.extend_from_slice(tag);
        }
        pos = gt + 1;
    }

    log::info!("remove empty anchors from html");
    let output = remove_empty_anchors(&output);

    // charset meta goes right after the opening <html> bytes
    let mut finished = Vec::with_capacity(output.len() + 80);
    let split = 12.min(output.len());
    finished.extend_from_slice(&output[..split]);
    finished.extend_from_slice(
        format!("<meta http-equiv=\"content-type\" content=\"text/html; charset={codec_name}\" />")
            .as_bytes(),
    );
    finished.extend_from_slice(&output[split..]);

    let used = rscnames.iter().flatten().cloned().collect();
    (finished, used)
}

/// Remove `<a/>` and `<a></a>` left behind by the filepos rewriting.
fn remove_empty_anchors(html: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(html.len());
    let mut pos = 0;
    'outer: while pos < html.len() {
        if html[pos] == b'<' && is_anchor_tag(&html[pos..]) {
            // <a ws* /> or <a ws* > ws* </a>
            let mut p = pos + 2;
            while p < html.len() && html[p].is_ascii_whitespace() {
                p += 1;
            }
            if html[p..].starts_with(b"/>") {
                pos = p + 2;
                continue 'outer;
            }
            if html[p..].starts_with(b">") {
                let mut q = p + 1;
                while q < html.len() && html[q].is_ascii_whitespace() {
                    q += 1;
                }
                if html[q..].starts_with(b"</a>") {
                    pos = q + 4;
                    continue 'outer;
                }
            }
        }
        output.push(html[pos]);
        pos += 1;
    }
    output
}

/// Extract and normalise the `<guide>` block from the rewritten HTML:
/// lowercase the attribute names, force self-closing references, and
/// point `filepos` values at `book.html` anchors.
pub fn extract_guide(src: &[u8], html_name: &str) -> Vec<u8> {
    let Some(start) = find_ci(src, b"<guide>") else {
        return Vec::new();
    };
    let Some(end_rel) = find_ci(&src[start..], b"</guide>") else {
        return Vec::new();
    };
    let guide = &src[start + 7..start + end_rel];

    let mut text: Vec<u8> = guide.iter().copied().filter(|&b| b != b'\r').collect();
    for (from, to) in [
        (b"<REFERENCE".as_slice(), b"<reference".as_slice()),
        (b" HREF=", b" href="),
        (b" TITLE=", b" title="),
        (b" TYPE=", b" type="),
    ] {
        text = replace_all(&text, from, to);
    }

    let mut out = Vec::with_capacity(text.len());
    let mut pos = 0;
    while pos < text.len() {
        let Some(lt_rel) = find_ci(&text[pos..], b"<reference") else {
            out.extend_from_slice(&text[pos..]);
            break;
        };
        let lt = pos + lt_rel;
        out.extend_from_slice(&text[pos..lt]);
        let Some(gt_rel) = memchr::memchr(b'>', &text[lt..]) else {
            out.extend_from_slice(&text[lt..]);
            break;
        };
        let gt = lt + gt_rel;
        let mut tag = text[lt..=gt].to_vec();

        // stale hrefs are dropped; filepos becomes the real href
        if let Some((start, end)) = attr_span(&tag, b"href") {
            tag.drain(start..end);
        }
        if let Some(at) = memmem::find(&tag, b"filepos=") {
            if let Some((value, end)) = parse_filepos_at(&tag, at + 8) {
                let end = if end < tag.len() && (tag[end] == b'"' || tag[end] == b'\'') {
                    end + 1
                } else {
                    end
                };
                let href = format!("href=\"{html_name}#filepos{value}\"");
                tag.splice(at..end, href.into_bytes());
            }
        }
        if !tag.ends_with(b"/>") {
            tag.truncate(tag.len() - 1);
            tag.extend_from_slice(b"/>");
        }
        out.extend_from_slice(&tag);
        pos = gt + 1;
    }
    out.push(b'\n');
    out
}

/// Span of ` name=...` (quoted or bare value) inside a tag.
fn attr_span(tag: &[u8], name: &[u8]) -> Option<(usize, usize)> {
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
        if p < tag.len() && (tag[p] == b'"' || tag[p] == b'\'') {
            let quote = tag[p];
            p += 1;
            let end = memchr::memchr(quote, &tag[p..])?;
            return Some((start - 1, p + end + 1));
        }
        while p < tag.len() && tag[p] != b' ' && tag[p] != b'>' && tag[p] != b'/' {
            p += 1;
        }
        return Some((start - 1, p));
    }
    None
}

fn replace_all(data: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut pos = 0;
    while let Some(rel) = memmem::find(&data[pos..], from) {
        let at = pos + rel;
        out.extend_from_slice(&data[pos..at]);
        out.extend_from_slice(to);
        pos = at + from.len();
    }
    out.extend_from_slice(&data[pos..]);
    out
}
