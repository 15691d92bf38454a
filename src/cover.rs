//! Image sniffing and cover-page synthesis.

use std::path::Path;

use crate::mobi::exth::Metadata;
use crate::structure::OutputTree;

const MAX_WIDTH: u32 = 4096;
const MAX_HEIGHT: u32 = 4096;

pub const COVER_PAGE_FILENAME: &str = "coverpage.xhtml";

/// Identify an image by magic bytes. JPEGs missing the JFIF/Exif marker
/// are still accepted when they frame correctly (`FF D8 … FF D9`,
/// tolerating trailing NULs).
pub fn get_image_type(data: &[u8]) -> Option<&'static str> {
    if data.len() < 10 {
        return None;
    }
    if data.starts_with(b"\xFF\xD8\xFF") && (&data[6..10] == b"JFIF" || &data[6..10] == b"Exif") {
        return Some("jpeg");
    }
    if data.starts_with(b"\x89PNG\r\n\x1a\n") {
        return Some("png");
    }
    if data.starts_with(b"GIF87a") || data.starts_with(b"GIF89a") {
        return Some("gif");
    }
    if data.starts_with(b"BM") {
        return Some("bmp");
    }
    if data.starts_with(b"\xFF\xD8") {
        let mut last = data.len();
        while last > 2 && data[last - 1] == 0 {
            last -= 1;
        }
        if &data[last - 2..last] == b"\xFF\xD9" {
            return Some("jpeg");
        }
    }
    None
}

/// Probe image dimensions: PNG IHDR, GIF logical screen, or a JPEG SOFn
/// scan.
pub fn get_image_size(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 {
        return None;
    }
    match get_image_type(data)? {
        "png" => {
            let check = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
            if check != 0x0D0A1A0A {
                return None;
            }
            let width = u32::from_be_bytes([data[16], data[17], data[18], data[19]]);
            let height = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
            Some((width, height))
        }
        "gif" => {
            let width = u16::from_le_bytes([data[6], data[7]]) as u32;
            let height = u16::from_le_bytes([data[8], data[9]]) as u32;
            Some((width, height))
        }
        "jpeg" => jpeg_size(data),
        _ => None,
    }
}

fn jpeg_size(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2usize;
    loop {
        // scan to the next marker
        while pos < data.len() && data[pos] != 0xFF {
            pos += 1;
        }
        while pos < data.len() && data[pos] == 0xFF {
            pos += 1;
        }
        if pos + 1 >= data.len() {
            return None;
        }
        let marker = data[pos];
        pos += 1;
        if pos + 2 > data.len() {
            return None;
        }
        let size = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
        if (0xC0..=0xCF).contains(&marker) && marker != 0xC4 && marker != 0xC8 && marker != 0xCC {
            if pos + 7 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 3], data[pos + 4]]) as u32;
            let width = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
            return Some((width, height));
        }
        pos += size;
    }
}

/// Synthesises a cover XHTML page from the cover image named by the
/// metadata (`CoverOffset` resolved through the resource names).
pub struct CoverProcessor<'a> {
    tree: &'a OutputTree,
    title: String,
    lang: String,
    cover_image: Option<String>,
    size: Option<(u32, u32)>,
}

impl<'a> CoverProcessor<'a> {
    pub fn new(tree: &'a OutputTree, metadata: &Metadata, rscnames: &[Option<String>]) -> Self {
        let cover_image = metadata
            .first("CoverOffset")
            .and_then(|v| v.parse::<usize>().ok())
            .and_then(|offset| rscnames.get(offset).cloned().flatten());
        if metadata.contains("CoverOffset") && cover_image.is_none() {
            log::warn!("cannot identify the cover image");
        }

        let size = cover_image
            .as_ref()
            .and_then(|name| std::fs::read(tree.imgdir.join(name)).ok())
            .and_then(|data| get_image_size(&data));

        Self {
            tree,
            title: metadata.first("Title").unwrap_or_else(|| "Cover".to_string()),
            lang: metadata.first("Language").unwrap_or_else(|| "en".to_string()),
            cover_image,
            size,
        }
    }

    pub fn image_name(&self) -> Option<&str> {
        self.cover_image.as_deref()
    }

    pub fn xhtml_name(&self) -> &'static str {
        COVER_PAGE_FILENAME
    }

    fn use_svg_wrapper(&self) -> bool {
        match self.size {
            Some((w, h)) => w > 0 && h > 0 && w <= MAX_WIDTH && h <= MAX_HEIGHT,
            None => false,
        }
    }

    pub fn build_xhtml(&self) -> String {
        log::info!("building a cover page");
        let image = self.cover_image.as_deref().unwrap_or_default();
        let image_path = format!("../Images/{image}");
        if !self.use_svg_wrapper() {
            return format!(
                "<?xml version=\"1.0\" encoding=\"utf-8\"?><!DOCTYPE html>\
                 <html xmlns=\"http://www.w3.org/1999/xhtml\" xmlns:epub=\"http://www.idpf.org/2007/ops\" xml:lang=\"{lang}\">\n\
                 <head>\n<title>{title}</title>\n\
                 <style type=\"text/css\">\n\
                 body {{\n  margin: 0;\n  padding: 0;\n  text-align: center;\n}}\n\
                 div {{\n  height: 100%;\n  width: 100%;\n  text-align: center;\n  page-break-inside: avoid;\n}}\n\
                 img {{\n  display: inline-block;\n  height: 100%;\n  margin: 0 auto;\n}}\n\
                 </style>\n</head>\n\
                 <body><div>\n  <img src=\"{image_path}\" alt=\"\"/>\n</div></body>\n</html>",
                lang = self.lang,
                title = self.title,
            );
        }
        let (width, height) = self.size.unwrap_or((0, 0));
        format!(
            "<?xml version=\"1.0\" encoding=\"utf-8\"?><!DOCTYPE html>\
             <html xmlns=\"http://www.w3.org/1999/xhtml\" xml:lang=\"{lang}\">\n\
             <head>\n  <title>{title}</title>\n\
             <style type=\"text/css\">\n\
             svg {{padding: 0pt; margin:0pt}}\n\
             body {{ text-align: center; padding:0pt; margin: 0pt; }}\n\
             </style>\n</head>\n\
             <body>\n  <div>\n\
             \x20   <svg xmlns=\"http://www.w3.org/2000/svg\" height=\"100%\" preserveAspectRatio=\"xMidYMid meet\" version=\"1.1\" viewBox=\"0 0 {width} {height}\" width=\"100%\" xmlns:xlink=\"http://www.w3.org/1999/xlink\">\n\
             \x20     <image height=\"{height}\" width=\"{width}\" xlink:href=\"{image_path}\"/>\n\
             \x20   </svg>\n\
             \x20 </div>\n</body>\n</html>",
            lang = self.lang,
            title = self.title,
        )
    }

    pub fn write_xhtml(&self) -> crate::error::Result<()> {
        let path = self.tree.k8text.join(COVER_PAGE_FILENAME);
        if path.exists() {
            log::warn!("{COVER_PAGE_FILENAME} already exists");
        }
        std::fs::write(path, self.build_xhtml())?;
        Ok(())
    }

    pub fn guide_entry(&self) -> String {
        format!("<reference type=\"cover\" title=\"Cover\" href=\"Text/{COVER_PAGE_FILENAME}\" />\n")
    }
}

/// Best-effort type sniff for a staged image file (used when deciding
/// whether an HD replacement matches).
pub fn image_type_of_file(path: &Path) -> Option<&'static str> {
    std::fs::read(path).ok().as_deref().and_then(get_image_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_png_and_size() {
        let mut png = b"\x89PNG\r\n\x1a\n".to_vec();
        png.extend_from_slice(&13u32.to_be_bytes());
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        png.extend_from_slice(&[8, 6, 0, 0, 0]);

        assert_eq!(get_image_type(&png), Some("png"));
        assert_eq!(get_image_size(&png), Some((640, 480)));
    }

    #[test]
    fn test_detect_gif_size() {
        let mut gif = b"GIF89a".to_vec();
        gif.extend_from_slice(&320u16.to_le_bytes());
        gif.extend_from_slice(&200u16.to_le_bytes());
        gif.extend_from_slice(&[0u8; 20]);

        assert_eq!(get_image_type(&gif), Some("gif"));
        assert_eq!(get_image_size(&gif), Some((320, 200)));
    }

    #[test]
    fn test_detect_bare_jpeg() {
        // no JFIF marker, but valid SOI...EOI framing with trailing NULs
        let mut jpg = vec![0xFF, 0xD8, 0xFF, 0xE1, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00];
        jpg.extend_from_slice(&[0xFF, 0xD9, 0x00, 0x00]);
        assert_eq!(get_image_type(&jpg), Some("jpeg"));
    }

    #[test]
    fn test_jpeg_sofn_size() {
        let mut jpg = vec![0xFF, 0xD8];
        jpg.extend_from_slice(&[0xFF, 0xE0, 0x00, 0x10]);
        jpg.extend_from_slice(b"JFIF\x00\x01\x01\x00\x00\x01\x00\x01\x00\x00");
        // SOF0: len 17, precision 8, height 600, width 800
        jpg.extend_from_slice(&[0xFF, 0xC0, 0x00, 0x11, 0x08]);
        jpg.extend_from_slice(&600u16.to_be_bytes());
        jpg.extend_from_slice(&800u16.to_be_bytes());
        jpg.extend_from_slice(&[3, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        jpg.extend_from_slice(&[0xFF, 0xD9]);

        assert_eq!(get_image_size(&jpg), Some((800, 600)));
    }

    #[test]
    fn test_unknown_type() {
        assert_eq!(get_image_type(b"not an image at all"), None);
    }
}
