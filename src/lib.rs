//! # mobiunpack
//!
//! A library and CLI for unpacking Amazon/Mobipocket ebook containers
//! (`.mobi`, `.prc`, `.azw`, `.azw3`, `.azw4`) into a publishable
//! directory tree: an EPUB-like package for KF8 content and a legacy
//! HTML-plus-NCX tree for Mobi 6 content.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::path::Path;
//! use mobiunpack::{UnpackOptions, unpack_book};
//!
//! let opts = UnpackOptions::default();
//! unpack_book(Path::new("book.azw3"), Path::new("book"), &opts)?;
//! # Ok::<(), mobiunpack::Error>(())
//! ```
//!
//! ## What it does
//!
//! - Splits the Palm database into records and parses the Mobi/EXTH
//!   headers
//! - Decompresses the text (PalmDoc LZ77 or Huff/CDIC) into rawML
//! - Decodes the INDX/TAGX index tables (NCX, skeleton, fragment,
//!   guide, dictionary, page map)
//! - Reassembles KF8 parts from the skeleton and fragment tables and
//!   rewrites `kindle:` URIs into relative file references
//! - Extracts images, fonts (with XOR deobfuscation and zlib
//!   inflation), HD variants, and build artifacts
//! - Generates content.opf, toc.ncx, nav.xhtml, page-map.xml and APNX
//!   sidecars, and zips the EPUB
//! - Optionally splits a combination Mobi6/KF8 container into two
//!   standalone files
//!
//! Encrypted containers are rejected.

pub mod cover;
pub mod dict;
mod error;
pub mod kf8;
pub mod mobi;
pub mod mobi6;
pub mod nav;
pub mod ncx;
pub mod opf;
pub mod pagemap;
pub mod pdb;
pub mod resc;
pub mod resources;
pub mod split;
pub mod structure;
pub mod unpack;

pub use error::{Error, Result};
pub use pdb::Sectionizer;
pub use unpack::{UnpackOptions, unpack_book};
