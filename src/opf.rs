//! content.opf generation for the mobi7 tree and the mobi8 EPUB.

use std::collections::{HashMap, HashSet};

use quick_xml::escape::{escape, unescape};

use crate::mobi::exth::Metadata;
use crate::resc::RescDoc;

pub const EPUB_OPF: &str = "content.opf";
pub const TOC_NCX: &str = "toc.ncx";
pub const NAVIGATION_DOCUMENT: &str = "nav.xhtml";

/// NCX and <guide> are deprecated in EPUB3 but still emitted for
/// compatibility with EPUB2 reading systems.
const EPUB3_WITH_NCX: bool = true;
const EPUB3_WITH_GUIDE: bool = true;

const BEGIN_INFO_ONLY: &str = "<!-- BEGIN INFORMATION ONLY ";
const END_INFO_ONLY: &str = "END INFORMATION ONLY -->";

const EXTH_TITLE_FURIGANA: &str = "Title-Pronunciation";
const EXTH_CREATOR_FURIGANA: &str = "Author-Pronunciation";
const EXTH_PUBLISHER_FURIGANA: &str = "Publisher-Pronunciation";

/// Metadata keys preserved verbatim inside the information-only comment.
const META_TAGS: &[&str] = &[
    "Drm Server Id",
    "Drm Commerce Id",
    "Drm Ebookbase Book Id",
    "ASIN",
    "HasFakeCover",
    "Creator-Software",
    "Creator-Major-Version",
    "Creator-Minor-Version",
    "Creator-Build-Number",
    "Watermark_(hex)",
    "Clipping-Limit",
    "Publisher-Limit",
    "Text-to-Speech-Disabled",
    "cdeType",
    "Updated_Title",
    "Font-Signature_(hex)",
    "Tamper-Proof-Keys_(hex)",
];

const MEDIA_MAP: &[(&str, &str)] = &[
    (".jpg", "image/jpeg"),
    (".jpeg", "image/jpeg"),
    (".png", "image/png"),
    (".gif", "image/gif"),
    (".svg", "image/svg+xml"),
    (".xhtml", "application/xhtml+xml"),
    (".html", "text/html"),
    (".pdf", "application/pdf"),
    (".ttf", "application/x-font-ttf"),
    (".otf", "application/x-font-opentype"),
    (".css", "text/css"),
];

fn media_type(filename: &str) -> String {
    let lower = filename.to_lowercase();
    for &(ext, media) in MEDIA_MAP {
        if lower.ends_with(ext) {
            return media.to_string();
        }
    }
    lower.rsplit('.').next().unwrap_or("bin").to_string()
}

fn escapeit(value: &str) -> String {
    let unescaped = unescape(value).map(|s| s.into_owned()).unwrap_or_else(|_| value.to_string());
    escape(&unescaped).into_owned()
}

/// One output file for the manifest: the spine key (skeleton number or
/// `coverpage`), the directory under OEBPS, and the file name.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub key: Option<String>,
    pub dir: String,
    pub filename: String,
}

pub struct OpfBuilder<'a> {
    metadata: Metadata,
    fileinfo: Vec<FileInfo>,
    rscnames: &'a [Option<String>],
    has_ncx: bool,
    is_k8: bool,
    print_replica: bool,
    guide_text: String,
    used: HashSet<String>,
    k8resc: Option<RescDoc>,
    pagemap_xml: String,
    cover_id: String,
    cover_name: Option<String>,
    book_id: String,
    page_progression_direction: Option<String>,
    epub_version: String,
    target_version: String,
    title_attrib: HashMap<usize, String>,
    creator_attrib: HashMap<usize, String>,
    publisher_attrib: HashMap<usize, String>,
    extra_attributes: Vec<String>,
    exth_solved_refines_metadata: Vec<String>,
    exth_refines_metadata: Vec<String>,
    exth_fixedlayout_metadata: Vec<String>,
    ncx_name: Option<String>,
    nav_name: Option<String>,
}

impl<'a> OpfBuilder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        metadata: &Metadata,
        fileinfo: Vec<FileInfo>,
        rscnames: &'a [Option<String>],
        has_ncx: bool,
        is_k8: bool,
        print_replica: bool,
        used: HashSet<String>,
        guide_text: String,
        mut k8resc: Option<RescDoc>,
        pagemap_xml: String,
        epub_version: &str,
    ) -> Self {
        let mut metadata = metadata.clone();

        // page-progression-direction only appears on the spine element
        let mut ppd = metadata
            .remove("page-progression-direction")
            .and_then(|v| v.first().map(|v| v.to_string()));
        if metadata.first("primary-writing-mode").unwrap_or_default().contains("rl") {
            ppd = Some("rtl".to_string());
        }

        let cover_id = k8resc
            .as_ref()
            .and_then(|r| r.cover_name.clone())
            .unwrap_or_else(|| "cover_img".to_string());

        let mut builder = Self {
            metadata,
            fileinfo,
            rscnames,
            has_ncx,
            is_k8,
            print_replica,
            guide_text,
            used,
            k8resc: None,
            pagemap_xml,
            cover_id,
            cover_name: None,
            book_id: uuid::Uuid::new_v4().to_string(),
            page_progression_direction: ppd,
            epub_version: epub_version.to_string(),
            target_version: String::new(),
            title_attrib: HashMap::new(),
            creator_attrib: HashMap::new(),
            publisher_attrib: HashMap::new(),
            extra_attributes: Vec::new(),
            exth_solved_refines_metadata: Vec::new(),
            exth_refines_metadata: Vec::new(),
            exth_fixedlayout_metadata: Vec::new(),
            ncx_name: None,
            nav_name: None,
        };

        builder.target_version = match epub_version {
            "A" => builder.autodetect_epub_version(k8resc.as_ref()),
            "3" => "3".to_string(),
            _ => "2".to_string(),
        };

        builder.define_refines_ids(k8resc.as_ref());
        builder.process_refines_metadata();
        if let Some(resc) = k8resc.as_mut() {
            resc.create_metadata(epub_version);
        }
        builder.k8resc = k8resc;
        if builder.target_version == "3" {
            builder.create_fixed_layout_metadata();
        }
        builder
    }

    pub fn book_id(&self) -> &str {
        &self.book_id
    }

    pub fn target_epub_version(&self) -> &str {
        &self.target_version
    }

    pub fn has_ncx(&self) -> bool {
        self.ncx_name.is_some() && self.has_ncx
    }

    pub fn has_nav(&self) -> bool {
        self.nav_name.is_some()
    }

    /// Resource names the manifest references; packaging copies exactly
    /// these.
    pub fn used(&self) -> &HashSet<String> {
        &self.used
    }

    fn autodetect_epub_version(&self, k8resc: Option<&RescDoc>) -> String {
        let md = &self.metadata;
        let fixed = md.first("fixed-layout").unwrap_or_default().to_lowercase() == "true";
        let orientation = md.first("orientation-lock").unwrap_or_default().to_lowercase();
        if fixed
            || orientation == "portrait"
            || orientation == "landscape"
            || self.page_progression_direction.as_deref() == Some("rtl")
            || md.contains(EXTH_TITLE_FURIGANA)
            || md.contains(EXTH_CREATOR_FURIGANA)
            || md.contains(EXTH_PUBLISHER_FURIGANA)
            || k8resc.map(|r| r.needs_epub3()).unwrap_or(false)
        {
            "3".to_string()
        } else {
            "2".to_string()
        }
    }

    /// KDP books carry furigana (file-as) EXTH values; give the dc
    /// elements ids so refines can point at them. Pairing titles to
    /// pronunciations is guesswork when there is more than one, so the
    /// unmatched ones land in a comment for manual editing.
    fn define_refines_ids(&mut self, k8resc: Option<&RescDoc>) {
        let need_ids = k8resc.map(|r| r.has_refines()).unwrap_or(false);
        let specs = [
            (EXTH_TITLE_FURIGANA, "Title"),
            (EXTH_CREATOR_FURIGANA, "Creator"),
            (EXTH_PUBLISHER_FURIGANA, "Publisher"),
        ];
        for (idx, (furigana, key)) in specs.into_iter().enumerate() {
            if (need_ids || self.metadata.contains(furigana)) && self.metadata.contains(key) {
                let prefix = key.to_lowercase();
                let ids: HashMap<usize, String> = (0..self.metadata.all(key).len())
                    .map(|i| (i, format!("{prefix}{:02}", i + 1)))
                    .collect();
                match idx {
                    0 => self.title_attrib = ids,
                    1 => self.creator_attrib = ids,
                    _ => self.publisher_attrib = ids,
                }
            }
        }
    }

    fn process_refines_metadata(&mut self) {
        let specs: [(&str, &str); 3] = [
            (EXTH_TITLE_FURIGANA, "title00"),
            (EXTH_CREATOR_FURIGANA, "creator00"),
            (EXTH_PUBLISHER_FURIGANA, "publisher00"),
        ];
        let any = specs.iter().any(|(key, _)| self.metadata.contains(key));
        if !any {
            return;
        }
        for (i, (furigana, default_id)) in specs.into_iter().enumerate() {
            let ids = match i {
                0 => self.title_attrib.clone(),
                1 => self.creator_attrib.clone(),
                _ => self.publisher_attrib.clone(),
            };
            let values = self.metadata.all(furigana);
            if self.target_version == "3" {
                let attrib = match i {
                    0 => &mut self.title_attrib,
                    1 => &mut self.creator_attrib,
                    _ => &mut self.publisher_attrib,
                };
                for (k, id) in &ids {
                    attrib.insert(*k, format!(" id=\"{id}\""));
                }
                if values.len() == 1 && ids.len() == 1 {
                    let id = ids.values().next().unwrap().clone();
                    self.exth_solved_refines_metadata.push(meta_tag("file-as", &values[0], &id));
                } else {
                    for (k, value) in values.iter().enumerate() {
                        let id = ids.get(&k).cloned().unwrap_or_else(|| default_id.to_string());
                        self.exth_refines_metadata.push(meta_tag("file-as", value, &id));
                    }
                }
            } else if values.len() == 1 && ids.len() == 1 {
                let attrib = match i {
                    0 => &mut self.title_attrib,
                    1 => &mut self.creator_attrib,
                    _ => &mut self.publisher_attrib,
                };
                attrib.insert(0, format!(" opf:file-as=\"{}\"", values[0]));
            } else {
                for (k, value) in values.iter().enumerate() {
                    let id = ids.get(&k).cloned().unwrap_or_else(|| default_id.to_string());
                    self.extra_attributes.push(format!(" id=\"#{id}\" opf:file-as=\"{value}\"\n"));
                }
            }
        }
    }

    fn create_fixed_layout_metadata(&mut self) {
        if let Some(layout) = self.metadata.first("fixed-layout") {
            let content =
                if layout.to_lowercase() == "true" { "pre-paginated" } else { "reflowable" };
            self.exth_fixedlayout_metadata.push(meta_tag("rendition:layout", content, ""));
        }
        if let Some(lock) = self.metadata.first("orientation-lock") {
            let content = lock.to_lowercase();
            if content == "portrait" || content == "landscape" {
                self.exth_fixedlayout_metadata.push(meta_tag("rendition:orientation", &content, ""));
            }
        }
    }

    fn handle_tag(&mut self, data: &mut String, key: &str, tag: &str, attribs: &HashMap<usize, String>) {
        if let Some(values) = self.metadata.remove(key) {
            let closing = tag.split(' ').next().unwrap_or(tag);
            for (i, value) in values.iter().enumerate() {
                let attrib = attribs.get(&i).map(String::as_str).unwrap_or("");
                data.push_str(&format!(
                    "<{tag}{attrib}>{}</{closing}>\n",
                    escapeit(&value.to_string())
                ));
            }
        }
    }

    fn handle_meta_pairs(&mut self, data: &mut String, key: &str, name: &str) {
        if let Some(values) = self.metadata.remove(key) {
            for value in values {
                data.push_str(&format!(
                    "<meta name=\"{name}\" content=\"{}\" />\n",
                    escapeit(&value.to_string())
                ));
            }
        }
    }

    fn build_metadata(&mut self, start_tag: &str, has_obfuscated_fonts: bool) -> String {
        let mut data = String::new();
        data.push_str(start_tag);
        data.push('\n');

        let epub3 = self.target_version == "3";

        if self.metadata.contains("Title") {
            let attribs = self.title_attrib.clone();
            self.handle_tag(&mut data, "Title", "dc:title", &attribs);
        } else {
            data.push_str("<dc:title>Untitled</dc:title>\n");
        }
        self.handle_tag(&mut data, "Language", "dc:language", &HashMap::new());
        if self.metadata.contains("UniqueID") {
            self.handle_tag(&mut data, "UniqueID", "dc:identifier id=\"uid\"", &HashMap::new());
        } else {
            data.push_str("<dc:identifier id=\"uid\">0</dc:identifier>\n");
        }

        if epub3 {
            // epub3 minimal metadata requires a dcterms:modified date
            let modified = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string();
            data.push_str(&meta_tag("dcterms:modified", &modified, ""));
        }

        if self.is_k8 && has_obfuscated_fonts {
            // any urn:uuid with the UUID scheme works as the obfuscation
            // key for Sigil, ADE and calibre
            if epub3 {
                data.push_str(&format!("<dc:identifier>urn:uuid:{}</dc:identifier>\n", self.book_id));
            } else {
                data.push_str(&format!(
                    "<dc:identifier opf:scheme=\"UUID\">urn:uuid:{}</dc:identifier>\n",
                    self.book_id
                ));
            }
        }

        let creator_attrib = self.creator_attrib.clone();
        self.handle_tag(&mut data, "Creator", "dc:creator", &creator_attrib);
        self.handle_tag(&mut data, "Contributor", "dc:contributor", &HashMap::new());
        let publisher_attrib = self.publisher_attrib.clone();
        self.handle_tag(&mut data, "Publisher", "dc:publisher", &publisher_attrib);
        self.handle_tag(&mut data, "Source", "dc:source", &HashMap::new());
        self.handle_tag(&mut data, "Type", "dc:type", &HashMap::new());
        if epub3 {
            for value in self.metadata.all("ISBN") {
                data.push_str(&format!(
                    "<dc:identifier>urn:isbn:{}</dc:identifier>\n",
                    escapeit(&value)
                ));
            }
            self.metadata.remove("ISBN");
        } else {
            self.handle_tag(&mut data, "ISBN", "dc:identifier opf:scheme=\"ISBN\"", &HashMap::new());
        }
        if self.metadata.contains("Subject") {
            let codes = self.metadata.remove("SubjectCode").unwrap_or_default();
            for (i, subject) in self.metadata.all("Subject").iter().enumerate() {
                match codes.get(i) {
                    Some(code) => data
                        .push_str(&format!("<dc:subject BASICCode=\"{code}\">")),
                    None => data.push_str("<dc:subject>"),
                }
                data.push_str(&format!("{}</dc:subject>\n", escapeit(subject)));
            }
            self.metadata.remove("Subject");
        }
        self.handle_tag(&mut data, "Description", "dc:description", &HashMap::new());
        if epub3 {
            for value in self.metadata.all("Published") {
                data.push_str(&format!("<dc:date>{}</dc:date>\n", escapeit(&value)));
            }
            self.metadata.remove("Published");
        } else {
            self.handle_tag(&mut data, "Published", "dc:date opf:event=\"publication\"", &HashMap::new());
        }
        self.handle_tag(&mut data, "Rights", "dc:rights", &HashMap::new());

        let resc_extra_attributes =
            self.k8resc.as_ref().map(|r| r.extra_attributes.clone()).unwrap_or_default();
        let resc_refines =
            self.k8resc.as_ref().map(|r| r.refines_metadata.clone()).unwrap_or_default();
        if self.epub_version == "F" {
            if !self.extra_attributes.is_empty() || !resc_extra_attributes.is_empty() {
                data.push_str("<!-- THE FOLLOWINGS ARE REQUIRED TO INSERT INTO <dc:xxx> MANUALLY\n");
                for attr in &self.extra_attributes {
                    data.push_str(attr);
                }
                for attr in &resc_extra_attributes {
                    data.push_str(attr);
                }
                data.push_str("-->\n");
            }
        } else {
            if !self.exth_solved_refines_metadata.is_empty() {
                data.push_str("<!-- Refines MetaData from EXTH -->\n");
                for tag in &self.exth_solved_refines_metadata {
                    data.push_str(tag);
                }
            }
            if !self.exth_refines_metadata.is_empty() || !resc_refines.is_empty() {
                data.push_str("<!-- THE FOLLOWINGS ARE REQUIRED TO EDIT IDS MANUALLY\n");
                for tag in &self.exth_refines_metadata {
                    data.push_str(tag);
                }
                for tag in &resc_refines {
                    data.push_str(tag);
                }
                data.push_str("-->\n");
            }
        }

        let resc_extra_metadata =
            self.k8resc.as_ref().map(|r| r.extra_metadata.clone()).unwrap_or_default();
        if !resc_extra_metadata.is_empty() {
            data.push_str("<!-- Extra MetaData from RESC\n");
            for tag in &resc_extra_metadata {
                data.push_str(tag);
            }
            data.push_str("-->\n");
        }

        if let Some(offset) = self.metadata.first("CoverOffset") {
            let index: usize = offset.parse().unwrap_or(usize::MAX);
            self.cover_name = self.rscnames.get(index).cloned().flatten();
            match &self.cover_name {
                Some(name) => {
                    // obsolete in epub3, but kindlegen still requires it
                    data.push_str(&format!("<meta name=\"cover\" content=\"{}\" />\n", self.cover_id));
                    self.used.insert(name.clone());
                }
                None => log::warn!("cover image {offset} was not recognized as a valid image"),
            }
            self.metadata.remove("CoverOffset");
        }

        self.handle_meta_pairs(&mut data, "Codec", "output encoding");
        self.handle_tag(&mut data, "DictInLanguage", "DictionaryInLanguage", &HashMap::new());
        self.handle_tag(&mut data, "DictOutLanguage", "DictionaryOutLanguage", &HashMap::new());
        self.handle_meta_pairs(&mut data, "RegionMagnification", "RegionMagnification");
        self.handle_meta_pairs(&mut data, "book-type", "book-type");
        self.handle_meta_pairs(&mut data, "zero-gutter", "zero-gutter");
        self.handle_meta_pairs(&mut data, "zero-margin", "zero-margin");
        self.handle_meta_pairs(&mut data, "primary-writing-mode", "primary-writing-mode");
        self.handle_meta_pairs(&mut data, "fixed-layout", "fixed-layout");
        self.handle_meta_pairs(&mut data, "orientation-lock", "orientation-lock");
        self.handle_meta_pairs(&mut data, "original-resolution", "original-resolution");
        self.handle_meta_pairs(&mut data, "Review", "review");
        self.handle_meta_pairs(&mut data, "Imprint", "imprint");
        self.handle_meta_pairs(&mut data, "Adult", "adult");
        self.handle_meta_pairs(&mut data, "DictShortName", "DictionaryVeryShortName");

        // kobo wants SRP elements when price metadata exists
        let prices = self.metadata.all("Price");
        let currencies = self.metadata.all("Currency");
        if !prices.is_empty() && !currencies.is_empty() {
            if prices.len() != currencies.len() {
                log::warn!(
                    "found {} price entries, but {} currency entries",
                    prices.len(),
                    currencies.len()
                );
            } else {
                for (price, currency) in prices.iter().zip(currencies.iter()) {
                    data.push_str(&format!("<SRP Currency=\"{currency}\">{price}</SRP>\n"));
                }
            }
            self.metadata.remove("Price");
            self.metadata.remove("Currency");
        }

        if epub3 && !self.exth_fixedlayout_metadata.is_empty() {
            data.push_str("<!-- EPUB3 MetaData converted from EXTH -->\n");
            for tag in &self.exth_fixedlayout_metadata {
                data.push_str(tag);
            }
        }

        // everything left is stashed in a comment where kindlegen (and a
        // future repack) can find it without it affecting the package
        data.push_str(BEGIN_INFO_ONLY);
        data.push('\n');
        if let Some(offset) = self.metadata.first("ThumbOffset") {
            let index: usize = offset.parse().unwrap_or(usize::MAX);
            match self.rscnames.get(index).cloned().flatten() {
                Some(name) => {
                    data.push_str(&format!(
                        "<meta name=\"Cover ThumbNail Image\" content=\"Images/{name}\" />\n"
                    ));
                    // thumbnails are regenerated by kindlegen; keep them
                    // out of the manifest
                    self.used.remove(&name);
                }
                None => {
                    log::warn!("cover thumbnail image {offset} was not recognized as a valid image")
                }
            }
            self.metadata.remove("ThumbOffset");
        }
        for name in META_TAGS {
            self.handle_meta_pairs(&mut data, name, name);
        }
        let remaining: Vec<String> = self.metadata.keys().cloned().collect();
        for key in remaining {
            self.handle_meta_pairs(&mut data, &key, &key);
        }
        data.push_str(END_INFO_ONLY);
        data.push('\n');
        data.push_str("</metadata>\n");
        data
    }

    fn build_manifest(&mut self, ncx_name: Option<&str>, nav_name: Option<&str>) -> (String, Vec<String>) {
        self.ncx_name = ncx_name.map(str::to_string);
        self.nav_name = nav_name.map(str::to_string);
        let has_resc_spine = self.k8resc.as_ref().map(|r| r.has_spine()).unwrap_or(false);

        let mut data = String::from("<manifest>\n");
        let mut spine_refs = Vec::new();
        let mut idcnt = 0usize;

        for info in &self.fileinfo {
            let media = media_type(&info.filename);
            let mut idref = format!("item{idcnt}");
            if has_resc_spine
                && let Some(key) = &info.key
                && let Some(Some(resc_ref)) =
                    self.k8resc.as_ref().and_then(|r| r.spine_idrefs.get(key))
            {
                idref = resc_ref.clone();
            }
            let path = if info.dir.is_empty() {
                info.filename.clone()
            } else {
                format!("{}/{}", info.dir, info.filename)
            };
            data.push_str(&format!(
                "<item id=\"{idref}\" media-type=\"{media}\" href=\"{path}\" />\n"
            ));
            let lower = info.filename.to_lowercase();
            if lower.ends_with(".xhtml") || lower.ends_with(".html") {
                spine_refs.push(idref);
            }
            idcnt += 1;
        }

        for name in self.rscnames.iter().flatten() {
            if !self.used.contains(name) {
                continue;
            }
            let media = media_type(name);
            let lower = name.to_lowercase();
            let mut properties = "";
            let idref = if Some(name) == self.cover_name.as_ref() {
                if self.target_version == "3" {
                    properties = " properties=\"cover-image\"";
                }
                self.cover_id.clone()
            } else {
                format!("item{idcnt}")
            };
            if lower.ends_with(".ttf") || lower.ends_with(".otf") {
                // fonts only exist in mobi8 output
                if self.is_k8 {
                    data.push_str(&format!(
                        "<item id=\"{idref}\" media-type=\"{media}\" href=\"Fonts/{name}\"{properties} />\n"
                    ));
                }
            } else {
                data.push_str(&format!(
                    "<item id=\"{idref}\" media-type=\"{media}\" href=\"Images/{name}\"{properties} />\n"
                ));
            }
            idcnt += 1;
        }

        if self.target_version == "3"
            && let Some(nav) = nav_name
        {
            data.push_str(&format!(
                "<item id=\"nav\" media-type=\"application/xhtml+xml\" href=\"Text/{nav}\" properties=\"nav\"/>\n"
            ));
        }
        if self.has_ncx
            && let Some(ncx) = ncx_name
        {
            data.push_str(&format!(
                "<item id=\"ncx\" media-type=\"application/x-dtbncx+xml\" href=\"{ncx}\" />\n"
            ));
        }
        if !self.pagemap_xml.is_empty() {
            data.push_str(
                "<item id=\"map\" media-type=\"application/oebs-page-map+xml\" href=\"page-map.xml\" />\n",
            );
        }
        data.push_str("</manifest>\n");
        (data, spine_refs)
    }

    fn build_spine(&self, spine_refs: &[String], has_ncx: bool) -> String {
        let mut ppd = String::new();
        if self.is_k8
            && let Some(direction) = &self.page_progression_direction
        {
            ppd = format!(" page-progression-direction=\"{direction}\"");
        }
        let ncx = if has_ncx { " toc=\"ncx\"" } else { "" };
        let map = if self.pagemap_xml.is_empty() { "" } else { " page-map=\"map\"" };

        let mut data = if self.epub_version == "F" && !ppd.is_empty() {
            format!("<spine{map}{ncx}><!--{ppd} -->\n")
        } else {
            format!("<spine{ppd}{map}{ncx}>\n")
        };

        let has_resc_spine = self.k8resc.as_ref().map(|r| r.has_spine()).unwrap_or(false);
        if has_resc_spine {
            let resc = self.k8resc.as_ref().unwrap();
            for key in &resc.spine_order {
                let idref = resc.spine_idrefs.get(key).cloned().flatten().unwrap_or_default();
                let mut tag = format!("<itemref idref=\"{idref}\"");
                let mut commented_properties = None;
                if let Some(attribs) = resc.spine_page_attributes.get(key) {
                    for (name, value) in attribs {
                        if self.epub_version == "F" && name == "properties" {
                            commented_properties = Some(value.clone());
                            continue;
                        }
                        tag.push_str(&format!(" {name}=\"{value}\""));
                    }
                }
                tag.push_str("/>");
                if let Some(properties) = commented_properties {
                    tag.push_str(&format!("<!-- properties=\"{properties}\" -->"));
                }
                tag.push('\n');
                data.push_str(&tag);
            }
        } else {
            let mut start = 0;
            if let Some(info) = self.fileinfo.first()
                && info.key.as_deref() == Some("coverpage")
                && !spine_refs.is_empty()
            {
                data.push_str(&format!("<itemref idref=\"{}\" linear=\"no\"/>\n", spine_refs[0]));
                start = 1;
            }
            for idref in &spine_refs[start.min(spine_refs.len())..] {
                data.push_str(&format!("<itemref idref=\"{idref}\"/>\n"));
            }
        }
        data.push_str("</spine>\n");
        data
    }

    /// OPF for the mobi7 tree (and print replica).
    pub fn build_mobi7_opf(&mut self) -> String {
        log::info!("building an opf for mobi7");
        let mut data = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        data.push_str(
            "<package version=\"2.0\" xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"uid\">\n",
        );
        let metadata_tag = "<metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">";
        data.push_str(&self.build_metadata(metadata_tag, false));
        let ncx_name = if self.has_ncx { Some(TOC_NCX) } else { None };
        let (manifest, spine_refs) = self.build_manifest(ncx_name, None);
        data.push_str(&manifest);
        data.push_str(&self.build_spine(&spine_refs, self.has_ncx));
        data.push_str("<tours>\n</tours>\n");
        if !self.print_replica {
            data.push_str(&format!("<guide>\n{}</guide>\n", self.guide_text));
        }
        data.push_str("</package>\n");
        data
    }

    /// OPF for the mobi8 EPUB, version per `--epub_version`.
    pub fn build_epub_opf(&mut self, has_obfuscated_fonts: bool) -> String {
        log::info!("building an opf for mobi8 using epub version {}", self.target_version);
        let epub3 = self.target_version == "3";
        let (has_ncx, has_guide, ncx_name, nav_name, package, tours, metadata_tag) = if epub3 {
            (
                EPUB3_WITH_NCX,
                EPUB3_WITH_GUIDE,
                EPUB3_WITH_NCX.then_some(TOC_NCX),
                Some(NAVIGATION_DOCUMENT),
                "<package version=\"3.0\" xmlns=\"http://www.idpf.org/2007/opf\" prefix=\"rendition: http://www.idpf.org/vocab/rendition/#\" unique-identifier=\"uid\">\n",
                "",
                "<metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\">",
            )
        } else {
            (
                self.has_ncx,
                true,
                Some(TOC_NCX),
                None,
                "<package version=\"2.0\" xmlns=\"http://www.idpf.org/2007/opf\" unique-identifier=\"uid\">\n",
                "<tours>\n</tours>\n",
                "<metadata xmlns:dc=\"http://purl.org/dc/elements/1.1/\" xmlns:opf=\"http://www.idpf.org/2007/opf\">",
            )
        };

        let mut data = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n");
        data.push_str(package);
        data.push_str(&self.build_metadata(metadata_tag, has_obfuscated_fonts));
        let (manifest, spine_refs) = self.build_manifest(ncx_name, nav_name);
        data.push_str(&manifest);
        data.push_str(&self.build_spine(&spine_refs, has_ncx));
        data.push_str(tours);
        if has_guide {
            data.push_str(&format!("<guide>\n{}</guide>\n", self.guide_text));
        }
        data.push_str("</package>\n");
        data
    }
}

fn meta_tag(property: &str, content: &str, refid: &str) -> String {
    let refines = if refid.is_empty() { String::new() } else { format!(" refines=\"#{refid}\"") };
    format!("<meta property=\"{property}\"{refines}>{content}</meta>\n")
}
