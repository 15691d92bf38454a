//! CLI: unpack an unencrypted Kindle/Mobipocket ebook into a folder.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use mobiunpack::{UnpackOptions, unpack_book};

#[derive(Parser, Debug)]
#[command(name = "mobiunpack")]
#[command(about = "Unpacks an unencrypted Kindle/Mobipocket ebook to html and images, \
or an unencrypted Kindle/Print Replica ebook to PDF and images, into the output folder")]
struct Args {
    /// Dump headers and other info to output and extra files
    #[arg(short = 'd')]
    dump: bool,

    /// Write raw data to the output folder
    #[arg(short = 'r')]
    write_raw: bool,

    /// Split combination mobis into mobi7 and mobi8 ebooks
    #[arg(short = 's')]
    split: bool,

    /// Use HD images, if present, to overwrite reduced resolution images
    #[arg(short = 'i')]
    use_hd: bool,

    /// Path to an .apnx file associated with the azw3 input
    #[arg(short = 'p', value_name = "APNXFILE")]
    apnx_file: Option<PathBuf>,

    /// Epub version to unpack to: 2, 3, A (automatic) or F (force to
    /// fit epub2 definitions)
    #[arg(long = "epub_version", default_value = "2", value_parser = ["2", "3", "A", "F"])]
    epub_version: String,

    /// Input .mobi/.prc/.azw/.azw3/.azw4 file
    infile: PathBuf,

    /// Output directory (defaults to the input file name without
    /// extension)
    outdir: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_target(false)
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let extension = args
        .infile
        .extension()
        .map(|e| e.to_string_lossy().to_uppercase())
        .unwrap_or_default();
    if !matches!(extension.as_str(), "MOBI" | "PRC" | "AZW" | "AZW3" | "AZW4") {
        eprintln!(
            "Error: first parameter must be a Kindle/Mobipocket ebook or a Kindle/Print Replica ebook."
        );
        return ExitCode::from(1);
    }

    let outdir = args.outdir.clone().unwrap_or_else(|| args.infile.with_extension(""));
    let opts = UnpackOptions {
        dump: args.dump,
        write_raw: args.write_raw,
        split_combos: args.split,
        use_hd: args.use_hd,
        apnx_file: args.apnx_file.clone(),
        epub_version: args.epub_version.clone(),
    };

    log::info!("unpacking book...");
    match unpack_book(&args.infile, &outdir, &opts) {
        Ok(()) => {
            log::info!("completed");
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Error: {err}");
            ExitCode::from(1)
        }
    }
}
