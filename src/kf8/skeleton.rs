//! KF8 part assembly.
//!
//! The KF8 payload stores the book as one rawML buffer plus three index
//! tables: FDST partitions rawML into flows, the skeleton index lists the
//! per-file HTML scaffolding inside flow 0, and the fragment index lists
//! body slices with the offsets where they are spliced back into their
//! skeleton. Reassembling them yields one XHTML part per skeleton.

use std::collections::HashSet;

use memchr::memmem;

use crate::error::Result;
use crate::mobi::headers::{Codec, MobiHeader, NULL_INDEX};
use crate::mobi::index::read_index;
use crate::pdb::Sectionizer;

#[derive(Debug, Clone)]
pub struct SkeletonEntry {
    pub num: usize,
    pub name: Vec<u8>,
    pub frag_count: usize,
    pub start: usize,
    pub len: usize,
}

#[derive(Debug, Clone)]
pub struct FragmentEntry {
    /// Offset in flow 0 where this fragment is inserted. Repaired in
    /// place when it lands inside a tag, so later link resolution sees
    /// the corrected value.
    pub insert_pos: usize,
    /// CNCX position path, e.g. `P-//*[@aid='0A4']`.
    pub id_text: Vec<u8>,
    pub file_num: usize,
    pub seq: usize,
    pub start: usize,
    pub len: usize,
}

impl FragmentEntry {
    /// The aid value embedded in the CNCX position path.
    pub fn aid(&self) -> &[u8] {
        if self.id_text.len() > 14 {
            &self.id_text[12..self.id_text.len() - 2]
        } else {
            b"0"
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuideEntry {
    pub ref_type: Vec<u8>,
    pub title: Vec<u8>,
    /// Index into the fragment table.
    pub frag_num: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Css,
    Svg,
}

#[derive(Debug, Clone)]
pub struct FlowInfo {
    pub kind: FlowKind,
    pub inline: bool,
    pub dir: &'static str,
    pub filename: String,
}

#[derive(Debug, Clone)]
pub struct PartInfo {
    pub skel_num: usize,
    pub dir: &'static str,
    pub filename: String,
    /// Byte range the part covers in flow 0.
    pub start: usize,
    pub end: usize,
    pub aid: Vec<u8>,
}

const GUIDE_TYPES: &[&[u8]] = &[
    b"cover",
    b"title-page",
    b"toc",
    b"index",
    b"glossary",
    b"acknowledgements",
    b"bibliography",
    b"colophon",
    b"copyright-page",
    b"dedication",
    b"epigraph",
    b"foreward",
    b"loi",
    b"lot",
    b"notes",
    b"preface",
    b"text",
];

pub struct K8Processor {
    pub codec: Codec,
    /// Flow start offsets from FDST; the rawML length is appended at
    /// build time to close the last flow.
    pub(crate) fdst_starts: Vec<usize>,
    pub skel_table: Vec<SkeletonEntry>,
    pub frag_table: Vec<FragmentEntry>,
    pub guide_table: Vec<GuideEntry>,
    /// Assembled XHTML parts, one per skeleton.
    pub parts: Vec<Vec<u8>>,
    pub part_info: Vec<PartInfo>,
    /// Flow pieces; index 0 is emptied once the parts are built.
    pub flows: Vec<Vec<u8>>,
    /// Classification per flow; index 0 is `None`.
    pub flow_info: Vec<Option<FlowInfo>>,
    /// aid values that are targets of `pos:fid` links and therefore must
    /// survive as `id="aid-…"` anchors.
    pub linked_aids: HashSet<Vec<u8>>,
}

impl K8Processor {
    pub fn new(sect: &Sectionizer, mh: &MobiHeader) -> Result<Self> {
        let mut fdst_starts = vec![0usize];
        if mh.fdst_index != NULL_INDEX {
            let header = sect.section_checked(mh.fdst_index as usize)?;
            if header.len() >= 12 && &header[0..4] == b"FDST" {
                sect.set_section_description(mh.fdst_index as usize, "KF8 FDST INDX");
                let num_sections =
                    u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
                fdst_starts.clear();
                for j in 0..num_sections {
                    let pos = 12 + j * 8;
                    if pos + 4 > header.len() {
                        break;
                    }
                    fdst_starts.push(u32::from_be_bytes([
                        header[pos],
                        header[pos + 1],
                        header[pos + 2],
                        header[pos + 3],
                    ]) as usize);
                }
            } else {
                log::warn!("KF8 book with missing FDST info");
            }
        }

        let mut skel_table = Vec::new();
        let (entries, _) = read_index(sect, mh.skel_index, "KF8 Skeleton")?;
        for (num, entry) in entries.iter().enumerate() {
            let frag_count = entry.tag_first(1).unwrap_or(0) as usize;
            let (start, len) = entry.tag_pair(6).unwrap_or((0, 0));
            skel_table.push(SkeletonEntry {
                num,
                name: entry.text.clone(),
                frag_count,
                start: start as usize,
                len: len as usize,
            });
        }

        let mut frag_table = Vec::new();
        let (entries, cncx) = read_index(sect, mh.frag_index, "KF8 Fragment")?;
        for entry in &entries {
            let insert_pos: usize =
                String::from_utf8_lossy(&entry.text).trim().parse().unwrap_or(0);
            let id_text = entry
                .tag_first(2)
                .and_then(|off| cncx.get(&(off as u32)).cloned())
                .unwrap_or_default();
            let (start, len) = entry.tag_pair(6).unwrap_or((0, 0));
            frag_table.push(FragmentEntry {
                insert_pos,
                id_text,
                file_num: entry.tag_first(3).unwrap_or(0) as usize,
                seq: entry.tag_first(4).unwrap_or(0) as usize,
                start: start as usize,
                len: len as usize,
            });
        }

        let mut guide_table = Vec::new();
        let (entries, cncx) = read_index(sect, mh.guide_index, "KF8 Guide elements")?;
        for entry in &entries {
            let title = entry
                .tag_first(1)
                .and_then(|off| cncx.get(&(off as u32)).cloned())
                .unwrap_or_default();
            // tag 6 supersedes tag 3 when both are present
            let frag_num = entry.tag_first(6).or_else(|| entry.tag_first(3));
            if let Some(frag_num) = frag_num {
                guide_table.push(GuideEntry {
                    ref_type: entry.text.clone(),
                    title,
                    frag_num: frag_num as usize,
                });
            }
        }

        Ok(Self {
            codec: mh.codec,
            fdst_starts,
            skel_table,
            frag_table,
            guide_table,
            parts: Vec::new(),
            part_info: Vec::new(),
            flows: Vec::new(),
            flow_info: Vec::new(),
            linked_aids: HashSet::new(),
        })
    }

    /// Split rawML into flows, then walk the skeleton and fragment
    /// tables to reassemble the per-file XHTML parts.
    pub fn build_parts(&mut self, raw_ml: &[u8]) {
        let mut bounds = self.fdst_starts.clone();
        bounds.push(raw_ml.len());
        self.flows.clear();
        for w in bounds.windows(2) {
            let start = w[0].min(raw_ml.len());
            let end = w[1].clamp(start, raw_ml.len());
            self.flows.push(raw_ml[start..end].to_vec());
        }

        let text = std::mem::take(&mut self.flows[0]);

        self.parts.clear();
        self.part_info.clear();
        let mut frag_ptr = 0usize;
        for skel in &self.skel_table.clone() {
            let skel_end = (skel.start + skel.len).min(text.len());
            let mut baseptr = skel_end;
            let mut skeleton = text[skel.start.min(text.len())..skel_end].to_vec();
            let mut filename = format!("part{:04}.xhtml", skel.num);
            let mut aidtext: Vec<u8> = b"0".to_vec();

            for i in 0..skel.frag_count {
                let Some(frag) = self.frag_table.get(frag_ptr).cloned() else {
                    break;
                };
                if i == 0 {
                    aidtext = frag.aid().to_vec();
                    filename = format!("part{:04}.xhtml", frag.file_num);
                }
                let slice_end = (baseptr + frag.len).min(text.len());
                let slice = &text[baseptr.min(text.len())..slice_end];

                let mut insert_pos = frag.insert_pos.saturating_sub(skel.start).min(skeleton.len());
                let head = &skeleton[..insert_pos];
                let tail = &skeleton[insert_pos..];
                if tag_is_split(head, tail) {
                    // badly formed fragment tables point inside a tag;
                    // retarget to just past the tag carrying this aid
                    log::warn!(
                        "fragment table for {} has incorrect insert position, calculating manually",
                        String::from_utf8_lossy(&skel.name)
                    );
                    if let Some((_, gt)) = locate_tag_with_aid(&skeleton, frag.aid()) {
                        let repaired = gt + 1;
                        if repaired != insert_pos {
                            log::warn!(
                                "fixed corrupt fragment insert position {} -> {}",
                                frag.insert_pos,
                                repaired + skel.start
                            );
                            insert_pos = repaired;
                            self.frag_table[frag_ptr].insert_pos = repaired + skel.start;
                        }
                    }
                }

                skeleton.splice(insert_pos..insert_pos, slice.iter().copied());
                baseptr = slice_end;
                frag_ptr += 1;
            }

            self.part_info.push(PartInfo {
                skel_num: skel.num,
                dir: "Text",
                filename,
                start: skel.start,
                end: baseptr,
                aid: aidtext,
            });
            self.parts.push(skeleton);
        }

        self.classify_flows();
    }

    /// Classify the non-body flows: SVG pieces referencing raster
    /// `<image>` tags get inlined, other SVG and CSS become files, CDATA
    /// snippets get wrapped in `<style>` and inlined.
    fn classify_flows(&mut self) {
        self.flow_info.clear();
        self.flow_info.push(None);
        for j in 1..self.flows.len() {
            let flow = &self.flows[j];
            let nstr = format!("{j:04}");
            let info = if let Some(svg_start) = find_ci(flow, b"<svg") {
                if find_ci(flow, b"<image").is_some() {
                    self.flows[j] = flow[svg_start..].to_vec();
                    FlowInfo { kind: FlowKind::Svg, inline: true, dir: "", filename: String::new() }
                } else {
                    FlowInfo {
                        kind: FlowKind::Svg,
                        inline: false,
                        dir: "Images",
                        filename: format!("svgimg{nstr}.svg"),
                    }
                }
            } else if memmem::find(flow, b"[CDATA[").is_some() {
                let mut wrapped = b"<style type=\"text/css\">\n".to_vec();
                wrapped.extend_from_slice(flow);
                wrapped.extend_from_slice(b"\n</style>\n");
                self.flows[j] = wrapped;
                FlowInfo { kind: FlowKind::Css, inline: true, dir: "", filename: String::new() }
            } else {
                FlowInfo {
                    kind: FlowKind::Css,
                    inline: false,
                    dir: "Styles",
                    filename: format!("style{nstr}.css"),
                }
            };
            self.flow_info.push(Some(info));
        }
    }

    /// The part containing a flow-0 position.
    pub fn part_for_pos(&self, pos: usize) -> Option<&PartInfo> {
        self.part_info.iter().find(|p| pos >= p.start && pos < p.end)
    }

    /// Fragment-table sequence number and position path for a flow-0
    /// position (`in:` when inside the fragment, `before:` otherwise).
    pub fn frag_info(&self, pos: usize) -> Option<(usize, Vec<u8>)> {
        for frag in &self.frag_table {
            if pos >= frag.insert_pos && pos < frag.insert_pos + frag.len {
                let mut id = b"in: ".to_vec();
                id.extend_from_slice(&frag.id_text);
                return Some((frag.seq, id));
            }
            if pos < frag.insert_pos {
                let mut id = b"before: ".to_vec();
                id.extend_from_slice(&frag.id_text);
                return Some((frag.seq, id));
            }
        }
        None
    }

    /// Resolve a `kindle:pos:fid` pair (fragment row, byte offset) to a
    /// part filename and the nearest preceding anchor id.
    pub fn id_tag_by_pos_fid(&mut self, row: usize, offset: usize) -> (String, Vec<u8>) {
        let pos = match self.frag_table.get(row) {
            Some(frag) => frag.insert_pos + offset,
            None => 0,
        };
        let pos = match self.part_for_pos(pos) {
            Some(_) => pos,
            None => {
                log::warn!("link to position {pos} does not exist, retargeting to top of target");
                let file_num = self.frag_table.get(row).map(|f| f.file_num).unwrap_or(0);
                self.skel_table.get(file_num).map(|s| s.start).unwrap_or(0)
            }
        };
        let filename = self
            .part_for_pos(pos)
            .map(|p| p.filename.clone())
            .unwrap_or_else(|| "part0000.xhtml".to_string());
        let id = self.id_tag(pos);
        (filename, id)
    }

    /// Nearest anchor (`id=`/`name=` attribute, or a linkable `aid=`)
    /// at-or-before a flow-0 position, searched in the assembled part.
    pub fn id_tag(&mut self, pos: usize) -> Vec<u8> {
        let Some(part_index) = self.part_info.iter().position(|p| pos >= p.start && pos < p.end)
        else {
            log::warn!("no file contains position {pos}");
            return Vec::new();
        };
        let info = &self.part_info[part_index];
        let text = &self.parts[part_index];
        let mut npos = (pos - info.start).min(text.len());

        // if npos is inside a tag, search everything before its '>'
        let pgt = memchr::memchr(b'>', &text[npos..]).map(|p| npos + p);
        let plt = memchr::memchr(b'<', &text[npos..]).map(|p| npos + p);
        if plt == Some(npos) || lt_opt(pgt, plt) {
            npos = pgt.map(|p| p + 1).unwrap_or(npos);
        }

        let block = &text[..npos.min(text.len())];
        for tag in ReverseTagIter::new(block) {
            if tag.starts_with(b"<body ") {
                return Vec::new();
            }
            if tag.starts_with(b"<meta ") {
                continue;
            }
            if let Some(id) = attr_value(tag, b"id").or_else(|| attr_value(tag, b"name")) {
                return id.to_vec();
            }
            if let Some(aid) = attr_value(tag, b"aid") {
                self.linked_aids.insert(aid.to_vec());
                let mut out = b"aid-".to_vec();
                out.extend_from_slice(aid);
                return out;
            }
        }
        Vec::new()
    }

    /// Like [`id_tag`], but page-map offsets may point inside a tag and
    /// need more leeway: move to the next closing tag first.
    pub fn page_id_tag(&self, pos: usize) -> Vec<u8> {
        let Some(part_index) = self.part_info.iter().position(|p| pos >= p.start && pos < p.end)
        else {
            log::warn!("no file contains position {pos}");
            return Vec::new();
        };
        let info = &self.part_info[part_index];
        let text = &self.parts[part_index];
        let mut npos = (pos - info.start).min(text.len());

        let pgt = memchr::memchr(b'>', &text[npos..]).map(|p| npos + p);
        let plt = memchr::memchr(b'<', &text[npos..]).map(|p| npos + p);
        if plt == Some(npos) || lt_opt(pgt, plt) {
            let pend1 = memmem::find(&text[npos..], b"/>").map(|p| npos + p);
            let pend2 = memmem::find(&text[npos..], b"</").map(|p| npos + p);
            npos = match (pend1, pend2) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => pgt.map(|p| p + 1).unwrap_or(npos),
            };
        }

        let block = &text[..npos.min(text.len())];
        for tag in ReverseTagIter::new(block) {
            if tag.starts_with(b"<body ") {
                return Vec::new();
            }
            if tag.starts_with(b"<meta ") {
                continue;
            }
            if let Some(id) = attr_value(tag, b"id").or_else(|| attr_value(tag, b"name")) {
                return id.to_vec();
            }
        }
        Vec::new()
    }

    /// Build the `<reference/>` lines for the OPF guide from the guide
    /// index.
    pub fn guide_text(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        for guide in self.guide_table.clone() {
            if guide.ref_type == b"thumbimagestandard" {
                continue;
            }
            let mut ref_type = guide.ref_type.clone();
            if !GUIDE_TYPES.contains(&ref_type.as_slice()) && !ref_type.starts_with(b"other.") {
                if ref_type == b"start" {
                    ref_type = b"text".to_vec();
                } else {
                    let mut prefixed = b"other.".to_vec();
                    prefixed.extend_from_slice(&ref_type);
                    ref_type = prefixed;
                }
            }
            let Some(frag) = self.frag_table.get(guide.frag_num).cloned() else {
                continue;
            };
            let Some(info) = self.part_for_pos(frag.insert_pos) else {
                continue;
            };
            let dir = info.dir;
            let filename = info.filename.clone();
            let id = self.id_tag(frag.insert_pos);

            out.extend_from_slice(b"<reference type=\"");
            out.extend_from_slice(&ref_type);
            out.extend_from_slice(b"\" title=\"");
            out.extend_from_slice(&guide.title);
            out.extend_from_slice(b"\" href=\"");
            out.extend_from_slice(dir.as_bytes());
            out.push(b'/');
            out.extend_from_slice(filename.as_bytes());
            if !id.is_empty() {
                out.push(b'#');
                out.extend_from_slice(&id);
            }
            out.extend_from_slice(b"\" />\n");
        }
        // the OPF is UTF-8; re-encode titles that came in as cp1252
        crate::mobi::decode_text(self.codec, &out).into_bytes()
    }
}

/// True when an insertion point splits an open tag: the nearest `>` in
/// the tail precedes the nearest `<`, or the head ends inside a tag.
fn tag_is_split(head: &[u8], tail: &[u8]) -> bool {
    let tail_gt = memchr::memchr(b'>', tail).map(|p| p as i64).unwrap_or(-1);
    let tail_lt = memchr::memchr(b'<', tail).map(|p| p as i64).unwrap_or(-1);
    let head_gt = memchr::memrchr(b'>', head).map(|p| p as i64).unwrap_or(-1);
    let head_lt = memchr::memrchr(b'<', head).map(|p| p as i64).unwrap_or(-1);
    tail_gt < tail_lt || head_gt < head_lt
}

fn lt_opt(a: Option<usize>, b: Option<usize>) -> bool {
    let a = a.map(|v| v as i64).unwrap_or(-1);
    let b = b.map(|v| v as i64).unwrap_or(-1);
    a < b
}

/// Locate the `<`/`>` positions of the tag whose `aid` attribute equals
/// `aid`, scanning forward through the block.
fn locate_tag_with_aid(block: &[u8], aid: &[u8]) -> Option<(usize, usize)> {
    let mut pos = 0;
    while let Some(lt_rel) = memchr::memchr(b'<', &block[pos..]) {
        let lt = pos + lt_rel;
        let Some(gt_rel) = memchr::memchr(b'>', &block[lt..]) else {
            return None;
        };
        let gt = lt + gt_rel;
        if attr_value(&block[lt..=gt], b"aid") == Some(aid) {
            return Some((lt, gt));
        }
        pos = lt + 1;
    }
    None
}

/// Extract the quoted value of an attribute inside one tag's bytes,
/// matching ` name = "value"` with optional whitespace and either quote.
pub(crate) fn attr_value<'a>(tag: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    let mut search = 0;
    while search < tag.len() {
        let rel = find_ci(&tag[search..], name)?;
        let start = search + rel;
        search = start + 1;
        // must be preceded by whitespace to avoid matching e.g. `said`
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
        if p >= tag.len() || (tag[p] != b'"' && tag[p] != b'\'') {
            continue;
        }
        let quote = tag[p];
        p += 1;
        let end = memchr::memchr(quote, &tag[p..])?;
        return Some(&tag[p..p + end]);
    }
    None
}

/// ASCII case-insensitive substring search.
pub(crate) fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

/// Iterate tags last-to-first over a block.
pub(crate) struct ReverseTagIter<'a> {
    block: &'a [u8],
    end: usize,
}

impl<'a> ReverseTagIter<'a> {
    pub fn new(block: &'a [u8]) -> Self {
        Self { block, end: block.len() }
    }
}

impl<'a> Iterator for ReverseTagIter<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        let gt = memchr::memrchr(b'>', &self.block[..self.end])?;
        let lt = memchr::memrchr(b'<', &self.block[..gt])?;
        self.end = lt;
        Some(&self.block[lt..=gt])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor_with(
        skel_table: Vec<SkeletonEntry>,
        frag_table: Vec<FragmentEntry>,
    ) -> K8Processor {
        K8Processor {
            codec: Codec::Utf8,
            fdst_starts: vec![0],
            skel_table,
            frag_table,
            guide_table: Vec::new(),
            parts: Vec::new(),
            part_info: Vec::new(),
            flows: Vec::new(),
            flow_info: Vec::new(),
            linked_aids: HashSet::new(),
        }
    }

    fn skel(num: usize, frag_count: usize, start: usize, len: usize) -> SkeletonEntry {
        SkeletonEntry { num, name: format!("SKEL{num:010}").into_bytes(), frag_count, start, len }
    }

    fn frag(insert_pos: usize, aid: &str, file_num: usize, seq: usize, len: usize) -> FragmentEntry {
        FragmentEntry {
            insert_pos,
            id_text: format!("P-//*[@aid='{aid}']").into_bytes(),
            file_num,
            seq,
            start: 0,
            len,
        }
    }

    #[test]
    fn test_fragment_aid_slice() {
        let f = frag(0, "0A4", 0, 0, 0);
        assert_eq!(f.aid(), b"0A4");
    }

    #[test]
    fn test_zero_fragment_skeleton_verbatim() {
        let text = b"<html><body>static</body></html>";
        let mut proc = processor_with(vec![skel(0, 0, 0, text.len())], vec![]);
        proc.build_parts(text);

        assert_eq!(proc.parts.len(), 1);
        assert_eq!(proc.parts[0], text);
        assert_eq!(proc.part_info[0].filename, "part0000.xhtml");
        assert_eq!(proc.part_info[0].aid, b"0");
    }

    #[test]
    fn test_fragment_insertion() {
        // skeleton covers bytes 0..26, fragment spliced at position 19
        let skeleton = b"<html><head/><body></body></html>";
        let fragment = b"<p aid='01'>hi</p>";
        let mut text = skeleton.to_vec();
        text.extend_from_slice(fragment);

        let mut proc = processor_with(
            vec![skel(0, 1, 0, skeleton.len())],
            vec![frag(19, "01", 0, 0, fragment.len())],
        );
        proc.build_parts(&text);

        assert_eq!(proc.parts[0], b"<html><head/><body><p aid='01'>hi</p></body></html>");
        assert_eq!(proc.part_info[0].end, text.len());
    }

    #[test]
    fn test_assembled_length_matches_flow0() {
        let skel0 = b"<body id='a'></body>";
        let skel1 = b"<body id='b'></body>";
        let frag0 = b"<p aid='01'>one</p>";
        let frag1 = b"<p aid='02'>two</p>";
        let mut text = Vec::new();
        text.extend_from_slice(skel0);
        text.extend_from_slice(frag0);
        text.extend_from_slice(skel1);
        text.extend_from_slice(frag1);
        // NB fragment slices are consumed sequentially after each skeleton
        let mut proc = processor_with(
            vec![
                skel(0, 1, 0, skel0.len()),
                skel(1, 1, skel0.len() + frag0.len(), skel1.len()),
            ],
            vec![
                frag(13, "01", 0, 0, frag0.len()),
                frag(skel0.len() + frag0.len() + 13, "02", 1, 1, frag1.len()),
            ],
        );
        proc.build_parts(&text);

        let total: usize = proc.parts.iter().map(|p| p.len()).sum();
        assert_eq!(total, text.len());
        assert_eq!(proc.parts[0], b"<body id='a'><p aid='01'>one</p></body>");
        assert_eq!(proc.parts[1], b"<body id='b'><p aid='02'>two</p></body>");
    }

    #[test]
    fn test_mid_tag_insert_position_repaired() {
        // insert position 10 lands inside <body aid='01'>; the repair
        // retargets to just after that tag (position 16)
        let skeleton = b"<body aid='7Q'></body>";
        let fragment = b"<p>x</p>";
        let mut text = skeleton.to_vec();
        text.extend_from_slice(fragment);

        let mut proc = processor_with(
            vec![skel(0, 1, 0, skeleton.len())],
            vec![frag(10, "7Q", 0, 0, fragment.len())],
        );
        proc.build_parts(&text);

        assert_eq!(proc.parts[0], b"<body aid='7Q'><p>x</p></body>");
        // fragment table was corrected in place
        assert_eq!(proc.frag_table[0].insert_pos, 15);
    }

    #[test]
    fn test_flow_classification() {
        let mut proc = processor_with(vec![], vec![]);
        proc.fdst_starts = vec![0, 4, 30, 74];
        let mut text = b"body".to_vec();
        text.extend_from_slice(b"p { margin: 0 } /* css */ ");
        text.extend_from_slice(b"<svg xmlns='x'><image href='i'/></svg>      ");
        text.extend_from_slice(b"<svg xmlns='x'><rect/></svg>");
        proc.build_parts(&text);

        assert_eq!(proc.flows.len(), 4);
        let css = proc.flow_info[1].as_ref().unwrap();
        assert_eq!(css.kind, FlowKind::Css);
        assert!(!css.inline);
        assert_eq!(css.filename, "style0001.css");

        let svg_inline = proc.flow_info[2].as_ref().unwrap();
        assert_eq!(svg_inline.kind, FlowKind::Svg);
        assert!(svg_inline.inline);

        let svg_file = proc.flow_info[3].as_ref().unwrap();
        assert!(!svg_file.inline);
        assert_eq!(svg_file.filename, "svgimg0003.svg");
        assert_eq!(svg_file.dir, "Images");
    }

    #[test]
    fn test_cdata_flow_wrapped_inline() {
        let mut proc = processor_with(vec![], vec![]);
        proc.fdst_starts = vec![0, 1];
        let text = b"x/*<![CDATA[*/ p{} /*]]>*/";
        proc.build_parts(text);

        let info = proc.flow_info[1].as_ref().unwrap();
        assert!(info.inline);
        assert!(proc.flows[1].starts_with(b"<style type=\"text/css\">"));
        assert!(proc.flows[1].ends_with(b"</style>\n"));
    }

    #[test]
    fn test_id_tag_finds_nearest_anchor() {
        let part = b"<body><div id=\"ch1\"><p>text here</p><p aid=\"ZZ\">more</p></body>";
        let mut proc = processor_with(vec![], vec![]);
        proc.parts = vec![part.to_vec()];
        proc.part_info = vec![PartInfo {
            skel_num: 0,
            dir: "Text",
            filename: "part0000.xhtml".into(),
            start: 0,
            end: part.len(),
            aid: b"0".to_vec(),
        }];

        // position inside the first <p>: nearest preceding id is ch1
        assert_eq!(proc.id_tag(25), b"ch1");
        // position after the aid tag resolves to aid-ZZ and records it
        let pos = part.len() - 8;
        assert_eq!(proc.id_tag(pos), b"aid-ZZ");
        assert!(proc.linked_aids.contains(b"ZZ".as_slice()));
    }

    #[test]
    fn test_attr_value() {
        assert_eq!(attr_value(b"<p id=\"x\">", b"id"), Some(b"x".as_slice()));
        assert_eq!(attr_value(b"<p id = 'y'>", b"id"), Some(b"y".as_slice()));
        // `said` must not match `id`
        assert_eq!(attr_value(b"<p said=\"no\">", b"id"), None);
        assert_eq!(attr_value(b"<p ID=\"up\">", b"id"), Some(b"up".as_slice()));
    }

    #[test]
    fn test_reverse_tag_iter() {
        let tags: Vec<&[u8]> = ReverseTagIter::new(b"<a><b>text</b>").collect();
        assert_eq!(tags, vec![b"</b>".as_slice(), b"<b>".as_slice(), b"<a>".as_slice()]);
    }
}
