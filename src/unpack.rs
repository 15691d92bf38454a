//! The unpack pipeline: scan headers, extract resources, rebuild the
//! mobi7 and mobi8 trees, split combos.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::cover::CoverProcessor;
use crate::error::{Error, Result};
use crate::kf8::K8Processor;
use crate::mobi::headers::{MobiHeader, NULL_INDEX};
use crate::mobi::rawml;
use crate::mobi6;
use crate::opf::{FileInfo, NAVIGATION_DOCUMENT, OpfBuilder, TOC_NCX};
use crate::pagemap::PageMapProcessor;
use crate::pdb::{Sectionizer, describe};
use crate::resources::{ResourceOutput, process_resources};
use crate::structure::OutputTree;
use crate::{dict, nav, ncx, split};

#[derive(Debug, Clone)]
pub struct UnpackOptions {
    /// Dump headers and section tables.
    pub dump: bool,
    /// Write the raw decompressed markup beside the output.
    pub write_raw: bool,
    /// Split combination containers into standalone mobi7/mobi8 files.
    pub split_combos: bool,
    /// Overwrite low-resolution images with their HD variants.
    pub use_hd: bool,
    /// External APNX file standing in for a missing PAGE record.
    pub apnx_file: Option<PathBuf>,
    /// `2`, `3`, `A` (auto) or `F` (force epub2 definitions).
    pub epub_version: String,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            dump: false,
            write_raw: false,
            split_combos: false,
            use_hd: false,
            apnx_file: None,
            epub_version: "2".to_string(),
        }
    }
}

/// Unpack a Mobipocket/Kindle container into `outdir`.
pub fn unpack_book(infile: &Path, outdir: &Path, opts: &UnpackOptions) -> Result<()> {
    let tree = OutputTree::new(infile, outdir)?;
    let sect = Sectionizer::open(infile)?;
    if opts.dump {
        sect.dump_palm_header();
    }
    log::info!(
        "Palm DB type {}, {} sections",
        String::from_utf8_lossy(&sect.ident),
        sect.num_sections
    );

    // scan for a combo boundary and collect every header to process
    let mut headers = vec![MobiHeader::parse(&sect, 0)?];
    let mut k8_boundary = None;
    if headers[0].is_k8() {
        log::info!("unpacking a KF8 book");
    } else {
        for i in 0..sect.num_sections.saturating_sub(1) {
            let data = sect.section(i);
            if data == b"BOUNDARY" {
                sect.set_section_description(i, "Mobi/KF8 Boundary Section");
                headers.push(MobiHeader::parse(&sect, i + 1)?);
                k8_boundary = Some(i);
                break;
            }
        }
        if k8_boundary.is_some() {
            log::info!("unpacking a combination M{}/KF8 book", headers[0].version);
            if opts.split_combos {
                match split::split(sect.raw()) {
                    Some(result) => {
                        let base = tree.input_basename();
                        std::fs::write(outdir.join(format!("mobi7-{base}.mobi")), result.mobi7)?;
                        std::fs::write(outdir.join(format!("mobi8-{base}.azw3")), result.mobi8)?;
                    }
                    None => log::warn!("no KF8 boundary found, split skipped"),
                }
            }
        } else {
            log::info!("unpacking a Mobipocket {} book", headers[0].version);
        }
    }

    if headers.iter().any(|mh| mh.is_k8()) {
        tree.make_k8_struct()?;
    }

    let mut resources = ResourceOutput::new();
    for mh in &headers {
        let label = if mh.is_k8() {
            "KF8 Header"
        } else if mh.is_print_replica() {
            "Print Replica Header"
        } else if mh.version == 0 {
            "PalmDOC Header"
        } else {
            "Mobipocket Header"
        };
        sect.set_section_description(mh.start, label);
        mh.describe(opts.dump);
        if mh.is_encrypted() {
            return Err(Error::Encrypted);
        }

        // the first payload of a combo stops at the boundary
        let end = match k8_boundary {
            Some(boundary) if mh.start < boundary => boundary,
            _ => sect.num_sections,
        };

        process_resources(&sect, mh, end, &tree, opts.use_hd, opts.dump, &mut resources)?;

        if mh.is_print_replica() {
            process_print_replica(&sect, mh, &tree, &resources, opts)?;
        } else if mh.is_k8() {
            process_mobi8(&sect, mh, &tree, &mut resources, opts)?;
        } else {
            process_mobi7(&sect, mh, &tree, &resources, opts)?;
        }

        process_unknown_sections(&sect, mh.start, end, &tree, opts.dump)?;
    }

    if opts.dump {
        sect.dump_sections_info();
    }
    Ok(())
}

fn process_mobi8(
    sect: &Sectionizer,
    mh: &MobiHeader,
    tree: &OutputTree,
    resources: &mut ResourceOutput,
    opts: &UnpackOptions,
) -> Result<()> {
    log::info!("processing KF8 section of book");
    let raw_ml = rawml::raw_ml(sect, mh)?;
    if opts.dump || opts.write_raw {
        std::fs::write(tree.k8dir.join(format!("{}.rawml", tree.input_basename())), &raw_ml)?;
    }

    let mut k8 = K8Processor::new(sect, mh)?;
    k8.build_parts(&raw_ml);

    // guide and NCX resolution both populate linked_aids, and must run
    // before any content is rewritten
    let mut guide_text = String::from_utf8_lossy(&k8.guide_text()).into_owned();
    if guide_text.is_empty()
        && let Some(start) = mh.metadata.last("StartOffset")
    {
        // KindleGen 2.5 carries the mobi7 StartOffset over; only the
        // last one points into this payload
        let mut start: usize = start.parse().unwrap_or(0);
        if start == NULL_INDEX as usize {
            start = 0;
        }
        if let Some((seq, _)) = k8.frag_info(start) {
            let (filename, id) = k8.id_tag_by_pos_fid(seq, 0);
            let mut link = filename;
            if !id.is_empty() {
                link.push('#');
                link.push_str(&String::from_utf8_lossy(&id));
            }
            guide_text.push_str(&format!("<reference type=\"text\" href=\"Text/{link}\" />\n"));
        }
    }

    if resources.pagemap.is_none()
        && let Some(apnx_file) = &opts.apnx_file
    {
        // external APNX payloads lack the PAGE header; pad to realign
        let mut data = b"00000000".to_vec();
        data.extend_from_slice(&std::fs::read(apnx_file)?);
        resources.pagemap = PageMapProcessor::parse(&data);
    }
    let mut pagemap_xml = String::new();
    if let Some(pagemap) = &resources.pagemap {
        pagemap_xml = pagemap.page_map_xml(&k8);
        std::fs::write(tree.k8oebps.join("page-map.xml"), &pagemap_xml)?;
    }

    log::info!("processing ncx / toc");
    let mut ncx_data = ncx::parse_ncx(sect, mh)?;
    ncx::resolve_pos_fids(&mut ncx_data, &mut k8);

    log::info!("building an epub-like structure");
    let mut used = crate::kf8::rebuild_xhtml(&mut k8, &resources.rscnames);

    // a cover page is synthesised when no part (and no RESC spine)
    // already references the cover image
    let mut fileinfo = Vec::new();
    let cover = CoverProcessor::new(tree, &mh.metadata, &resources.rscnames);
    if let Some(cover_img) = cover.image_name().map(str::to_string) {
        let part_has_cover = |index: usize| {
            k8.parts
                .get(index)
                .map(|p| memchr::memmem::find(p, cover_img.as_bytes()).is_some())
                .unwrap_or(false)
        };
        let mut create_cover_page = false;
        match resources.k8resc.as_mut() {
            Some(resc) if resc.has_spine() => {
                if !resc.spine_idrefs.contains_key("coverpage") {
                    let first = resc
                        .spine_order
                        .first()
                        .and_then(|k| k.parse::<usize>().ok())
                        .unwrap_or(0);
                    if !part_has_cover(first) {
                        resc.prepend_to_spine("coverpage", "inserted", "no");
                    }
                }
                if resc.spine_order.first().map(String::as_str) == Some("coverpage") {
                    create_cover_page = true;
                }
            }
            _ => {
                if !part_has_cover(0) {
                    create_cover_page = true;
                }
            }
        }
        if create_cover_page {
            fileinfo.push(FileInfo {
                key: Some("coverpage".to_string()),
                dir: "Text".to_string(),
                filename: cover.xhtml_name().to_string(),
            });
            guide_text.push_str(&cover.guide_entry());
            cover.write_xhtml()?;
            used.insert(cover_img);
        }
    }

    for (info, part) in k8.part_info.iter().zip(k8.parts.iter()) {
        fileinfo.push(FileInfo {
            key: Some(info.skel_num.to_string()),
            dir: info.dir.to_string(),
            filename: info.filename.clone(),
        });
        std::fs::write(tree.k8oebps.join(info.dir).join(&info.filename), part)?;
    }
    for (flow, info) in k8.flows.iter().zip(k8.flow_info.iter()).skip(1) {
        let Some(info) = info else { continue };
        if !info.inline {
            fileinfo.push(FileInfo {
                key: None,
                dir: info.dir.to_string(),
                filename: info.filename.clone(),
            });
            std::fs::write(tree.k8oebps.join(info.dir).join(&info.filename), flow)?;
        }
    }

    let has_obfuscated_fonts = !resources.obfuscate_data.is_empty();
    let mut opf = OpfBuilder::new(
        &mh.metadata,
        fileinfo,
        &resources.rscnames,
        true,
        true,
        false,
        used,
        guide_text.clone(),
        resources.k8resc.take(),
        pagemap_xml,
        &opts.epub_version,
    );
    let opf_data = opf.build_epub_opf(has_obfuscated_fonts);
    std::fs::write(tree.k8oebps.join(crate::opf::EPUB_OPF), opf_data)?;

    let title = mh.metadata.first("Title").unwrap_or_else(|| "Untitled".to_string());
    let ident = mh.metadata.first("UniqueID").unwrap_or_else(|| "0".to_string());
    let lang = mh.metadata.first("Language").unwrap_or_else(|| "en".to_string());
    if opf.has_ncx() {
        log::info!("write K8 ncx");
        let ncx_xml = ncx::build_k8_ncx(&ncx_data, &title, &ident, &lang);
        std::fs::write(tree.k8oebps.join(TOC_NCX), ncx_xml)?;
    }
    if opf.has_nav() {
        let nav_xml = nav::build_nav(&ncx_data, &guide_text, &title, &lang);
        std::fs::write(tree.k8text.join(NAVIGATION_DOCUMENT), nav_xml)?;
    }

    tree.make_epub(opf.used(), &resources.obfuscate_data, opf.book_id())?;
    Ok(())
}

fn process_mobi7(
    sect: &Sectionizer,
    mh: &MobiHeader,
    tree: &OutputTree,
    resources: &ResourceOutput,
    opts: &UnpackOptions,
) -> Result<()> {
    log::info!("processing Mobipocket {} section of book", mh.version);
    let raw_ml = rawml::raw_ml(sect, mh)?;
    if opts.dump || opts.write_raw {
        std::fs::write(tree.mobi7dir.join(format!("{}.rawml", tree.input_basename())), &raw_ml)?;
    }

    let mut metadata = mh.metadata.clone();

    let ncx_data = ncx::parse_ncx(sect, mh)?;
    let title = metadata.first("Title").unwrap_or_else(|| "Untitled".to_string());
    let ident = metadata.first("UniqueID").unwrap_or_else(|| "0".to_string());
    let lang = metadata.first("Language").unwrap_or_else(|| "en".to_string());
    log::info!("write ncx");
    let html_name = "book.html";
    std::fs::write(
        tree.mobi7dir.join(TOC_NCX),
        ncx::build_ncx(&ncx_data, html_name, &title, &ident, &lang),
    )?;

    // dictionaries inject idx:entry markup at the indexed positions
    let mut position_map = mobi6::PositionMap::new();
    if mh.is_dictionary() {
        if let Some(in_lang) = mh.dict_in_language() {
            metadata.add_text("DictInLanguage", in_lang);
        }
        if let Some(out_lang) = mh.dict_out_language() {
            metadata.add_text("DictOutLanguage", out_lang);
        }
        position_map = dict::position_map(sect, mh)?;
    }

    let ncx_positions: Vec<usize> =
        ncx_data.iter().filter(|e| e.pos > 0).map(|e| e.pos as usize).collect();
    let src = mobi6::find_anchors(&raw_ml, &ncx_positions, &mut position_map);
    let codec_name = metadata.first("Codec").unwrap_or_else(|| "utf-8".to_string());
    let (html, used) = mobi6::insert_hrefs(&src, &resources.rscnames, &codec_name);

    std::fs::write(tree.mobi7dir.join(html_name), &html)?;

    let mut guide_text = String::from_utf8_lossy(&mobi6::extract_guide(&html, html_name)).into_owned();
    if let Some(start) = metadata.last("StartOffset") {
        let mut start: u64 = start.parse().unwrap_or(0);
        if start == NULL_INDEX as u64 {
            start = 0;
        }
        guide_text.push_str(&format!(
            "<reference type=\"text\" href=\"{html_name}#filepos{start}\" />\n"
        ));
    }

    let fileinfo =
        vec![FileInfo { key: None, dir: String::new(), filename: html_name.to_string() }];
    let mut opf = OpfBuilder::new(
        &metadata,
        fileinfo,
        &resources.rscnames,
        true,
        false,
        false,
        used,
        guide_text,
        None,
        String::new(),
        "2",
    );
    std::fs::write(tree.mobi7dir.join(crate::opf::EPUB_OPF), opf.build_mobi7_opf())?;
    Ok(())
}

/// Print Replica (azw4): the rawML is a table of PDF payloads plus
/// optional auxiliary blobs.
fn process_print_replica(
    sect: &Sectionizer,
    mh: &MobiHeader,
    tree: &OutputTree,
    resources: &ResourceOutput,
    opts: &UnpackOptions,
) -> Result<()> {
    log::info!("print replica ebook detected");
    let raw_ml = rawml::raw_ml(sect, mh)?;
    if opts.dump || opts.write_raw {
        std::fs::write(tree.outdir.join(format!("{}.rawpr", tree.input_basename())), &raw_ml)?;
    }
    let base = tree.input_basename().to_string();

    let u32_at = |o: usize| -> Option<u32> {
        raw_ml
            .get(o..o + 4)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    };
    let num_tables = u32_at(0x04).unwrap_or(0) as usize;
    let mut table_index_offset = 8 + 4 * num_tables;
    for table in 0..num_tables {
        let section_count = u32_at(0x08 + 4 * table).unwrap_or(0) as usize;
        for section in 0..section_count {
            let Some(offset) = u32_at(table_index_offset) else { break };
            let Some(length) = u32_at(table_index_offset + 4) else { break };
            table_index_offset += 8;
            let start = offset as usize;
            let end = (start + length as usize).min(raw_ml.len());
            if start > end {
                continue;
            }
            let name = if section == 0 {
                format!("{base}.{:03}.pdf", table + 1)
            } else {
                format!("{base}.{:03}.{:03}.data", table + 1, section)
            };
            std::fs::write(tree.outdir.join(name), &raw_ml[start..end])?;
        }
    }

    let used: HashSet<String> = resources.rscnames.iter().flatten().cloned().collect();
    let fileinfo =
        vec![FileInfo { key: None, dir: String::new(), filename: format!("{base}.pdf") }];
    let mut opf = OpfBuilder::new(
        &mh.metadata,
        fileinfo,
        &resources.rscnames,
        false,
        false,
        true,
        used,
        String::new(),
        None,
        String::new(),
        &opts.epub_version,
    );
    std::fs::write(tree.mobi7dir.join(crate::opf::EPUB_OPF), opf.build_mobi7_opf())?;
    Ok(())
}

/// Describe whatever the resource pass left unclassified.
fn process_unknown_sections(
    sect: &Sectionizer,
    beg: usize,
    end: usize,
    tree: &OutputTree,
    dump: bool,
) -> Result<()> {
    for i in beg..end {
        if !sect.section_description(i).is_empty() {
            continue;
        }
        let data = sect.section(i);
        let description = match data {
            b"\x00\x00\x00" => "Termination Marker 3 Nulls".to_string(),
            b"\x00\x00" => "Termination Marker 2 Nulls".to_string(),
            b"\x00" => "Termination Marker 1 Null".to_string(),
            _ if data.starts_with(b"INDX") => {
                if dump {
                    std::fs::write(tree.outdir.join(format!("Unknown{i:05}_INDX.dat")), data)?;
                }
                "Unknown INDX section".to_string()
            }
            _ => {
                if dump {
                    std::fs::write(tree.outdir.join(format!("unknown{i:05}.dat")), data)?;
                }
                format!("Mysterious Section, first four bytes {}", describe(&data[..4.min(data.len())]))
            }
        };
        sect.set_section_description(i, description);
    }
    Ok(())
}
