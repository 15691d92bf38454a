//! Output tree staging and EPUB packaging.
//!
//! The unpacker writes a `mobi7/` tree (legacy HTML), an optional
//! `mobi8/` tree staged as an exploded EPUB, and an `HDImages/` spill
//! directory. Resources are staged once under `mobi7/Images` and copied
//! into the EPUB layout at packaging time.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

use crate::error::Result;

pub const KINDLEGENSRC_FILENAME: &str = "kindlegensrc.zip";
pub const KINDLEGENLOG_FILENAME: &str = "kindlegenbuild.log";

/// All output paths for one unpack run.
pub struct OutputTree {
    pub outdir: PathBuf,
    pub mobi7dir: PathBuf,
    /// Shared staging directory for images, fonts, and other resources.
    pub imgdir: PathBuf,
    pub hdimgdir: PathBuf,
    pub k8dir: PathBuf,
    pub k8metainf: PathBuf,
    pub k8oebps: PathBuf,
    pub k8images: PathBuf,
    pub k8fonts: PathBuf,
    pub k8styles: PathBuf,
    pub k8text: PathBuf,
    input_basename: String,
}

impl OutputTree {
    pub fn new(infile: &Path, outdir: &Path) -> Result<Self> {
        let mobi7dir = outdir.join("mobi7");
        let imgdir = mobi7dir.join("Images");
        let hdimgdir = outdir.join("HDImages");
        fs::create_dir_all(&imgdir)?;
        fs::create_dir_all(&hdimgdir)?;

        let k8dir = outdir.join("mobi8");
        let input_basename = infile
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "book".to_string());

        Ok(Self {
            outdir: outdir.to_path_buf(),
            mobi7dir,
            imgdir,
            hdimgdir,
            k8metainf: k8dir.join("META-INF"),
            k8oebps: k8dir.join("OEBPS"),
            k8images: k8dir.join("OEBPS/Images"),
            k8fonts: k8dir.join("OEBPS/Fonts"),
            k8styles: k8dir.join("OEBPS/Styles"),
            k8text: k8dir.join("OEBPS/Text"),
            k8dir,
            input_basename,
        })
    }

    pub fn input_basename(&self) -> &str {
        &self.input_basename
    }

    /// Create the exploded-EPUB directory skeleton for the mobi8 output.
    pub fn make_k8_struct(&self) -> Result<()> {
        for dir in [
            &self.k8dir,
            &self.k8metainf,
            &self.k8oebps,
            &self.k8images,
            &self.k8fonts,
            &self.k8styles,
            &self.k8text,
        ] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    /// Copy used resources into the EPUB layout, write container and
    /// encryption documents, and zip `<basename>.epub`.
    pub fn make_epub(
        &self,
        used: &HashSet<String>,
        obfuscate_data: &[String],
        uid: &str,
    ) -> Result<()> {
        let key = obfuscation_key(uid);

        // fonts move from the shared staging dir into Fonts/ (mobi7 has
        // no font support); everything else used lands in Images/
        for entry in fs::read_dir(&self.imgdir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !used.contains(&name) {
                continue;
            }
            let is_font =
                name.ends_with(".ttf") || name.ends_with(".otf") || name.ends_with(".failed");
            let dest = if is_font { self.k8fonts.join(&name) } else { self.k8images.join(&name) };
            let mut data = fs::read(entry.path())?;
            if obfuscate_data.contains(&name) {
                data = mangle_fonts(&key, &data);
            }
            fs::write(dest, data)?;
            if name.ends_with(".ttf") || name.ends_with(".otf") {
                fs::remove_file(entry.path())?;
            }
        }

        fs::write(self.k8metainf.join("container.xml"), CONTAINER_XML)?;

        if !obfuscate_data.is_empty() {
            let mut encryption = String::from(
                "<encryption xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\" \
                 xmlns:enc=\"http://www.w3.org/2001/04/xmlenc#\" \
                 xmlns:deenc=\"http://ns.adobe.com/digitaleditions/enc\">\n",
            );
            for font in obfuscate_data {
                encryption.push_str("  <enc:EncryptedData>\n");
                encryption.push_str(
                    "    <enc:EncryptionMethod Algorithm=\"http://ns.adobe.com/pdf/enc#RC\"/>\n",
                );
                encryption.push_str("    <enc:CipherData>\n");
                encryption
                    .push_str(&format!("      <enc:CipherReference URI=\"OEBPS/Fonts/{font}\"/>\n"));
                encryption.push_str("    </enc:CipherData>\n");
                encryption.push_str("  </enc:EncryptedData>\n");
            }
            encryption.push_str("</encryption>\n");
            fs::write(self.k8metainf.join("encryption.xml"), encryption)?;
        }

        log::info!("creating an epub-like file");
        let epub_path = self.k8dir.join(format!("{}.epub", self.input_basename));
        let file = fs::File::create(&epub_path)?;
        let mut zip = ZipWriter::new(file);

        // mimetype must be the first entry and stay uncompressed
        let stored = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
            .unix_permissions(0o600);
        let mimetype = b"application/epub+zip";
        fs::write(self.k8dir.join("mimetype"), mimetype)?;
        zip.start_file("mimetype", stored)?;
        zip.write_all(mimetype)?;

        let deflated =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for localdir in ["META-INF", "OEBPS"] {
            let root = self.k8dir.join(localdir);
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = entry.map_err(|e| {
                    std::io::Error::other(format!("walking {}: {e}", root.display()))
                })?;
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = entry
                    .path()
                    .strip_prefix(&self.k8dir)
                    .unwrap_or(entry.path())
                    .to_string_lossy()
                    .replace('\\', "/");
                zip.start_file(rel, deflated)?;
                zip.write_all(&fs::read(entry.path())?)?;
            }
        }
        zip.finish()?;
        Ok(())
    }
}

const CONTAINER_XML: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
<container version=\"1.0\" xmlns=\"urn:oasis:names:tc:opendocument:xmlns:container\">\n\
    <rootfiles>\n\
<rootfile full-path=\"OEBPS/content.opf\" media-type=\"application/oebps-package+xml\"/>\
    </rootfiles>\n</container>\n";

/// Derive the Adobe font-obfuscation key from the book uuid: keep the
/// hex digits, double them, and unhexlify the first 32.
pub fn obfuscation_key(uid: &str) -> Vec<u8> {
    let hex: String = uid.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    let doubled = format!("{hex}{hex}");
    doubled
        .as_bytes()
        .chunks_exact(2)
        .take(16)
        .map(|pair| {
            let high = (pair[0] as char).to_digit(16).unwrap_or(0) as u8;
            let low = (pair[1] as char).to_digit(16).unwrap_or(0) as u8;
            (high << 4) | low
        })
        .collect()
}

/// XOR the first 1024 bytes with the cyclic key. Its own inverse, so it
/// both obfuscates and deobfuscates.
pub fn mangle_fonts(key: &[u8], data: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    let mut out = data.to_vec();
    for (i, byte) in out.iter_mut().take(1024).enumerate() {
        *byte ^= key[i % key.len()];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_obfuscation_key() {
        let key = obfuscation_key("8c2f-11");
        // hex digits: 8c2f11 doubled = 8c2f118c2f11 -> 6 bytes
        assert_eq!(key, vec![0x8C, 0x2F, 0x11, 0x8C, 0x2F, 0x11]);

        let key = obfuscation_key("0a1b2c3d-4e5f-6071-8293-a4b5c6d7e8f9");
        assert_eq!(key.len(), 16);
        assert_eq!(key[0], 0x0A);
    }

    #[test]
    fn test_mangle_roundtrip() {
        let key = obfuscation_key("deadbeefdeadbeefdeadbeefdeadbeef");
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        let mangled = mangle_fonts(&key, &data);
        assert_ne!(mangled[..1024], data[..1024]);
        // bytes past 1024 are untouched
        assert_eq!(mangled[1024..], data[1024..]);
        assert_eq!(mangle_fonts(&key, &mangled), data);
    }

    #[test]
    fn test_epub_zip_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let tree = OutputTree::new(Path::new("sample.azw3"), tmp.path()).unwrap();
        tree.make_k8_struct().unwrap();
        std::fs::write(tree.k8oebps.join("content.opf"), b"<package/>").unwrap();
        std::fs::write(tree.k8text.join("part0000.xhtml"), b"<html/>").unwrap();

        tree.make_epub(&HashSet::new(), &[], "uid").unwrap();

        let file = std::fs::File::open(tree.k8dir.join("sample.epub")).unwrap();
        let mut zip = zip::ZipArchive::new(file).unwrap();
        // mimetype first, stored
        let entry = zip.by_index(0).unwrap();
        assert_eq!(entry.name(), "mimetype");
        assert_eq!(entry.compression(), zip::CompressionMethod::Stored);
        drop(entry);
        let entry = zip.by_name("OEBPS/content.opf").unwrap();
        assert_eq!(entry.compression(), zip::CompressionMethod::Deflated);
        drop(entry);
        assert!(zip.by_name("META-INF/container.xml").is_ok());
    }
}
