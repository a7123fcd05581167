//! pdfslideguard CLI - rasterize a PDF and keep it searchable

use std::io::Write;
use std::path::PathBuf;

use clap::Parser;
use log::{Level, LevelFilter};

use pdfslideguard::{
    DEFAULT_FONT_PATH, DEFAULT_JPEG_QUALITY, DEFAULT_ZOOM_FACTOR, SlideGuard, SlideGuardError,
};

#[derive(Parser)]
#[command(name = "pdfslideguard")]
#[command(version)]
#[command(
    about = "Convert a PDF into a high-resolution image PDF that keeps an invisible, searchable text layer",
    long_about = None
)]
struct Cli {
    /// Input PDF file path.
    #[arg(value_name = "INPUT_PDF")]
    input_pdf: PathBuf,

    /// Output PDF file path.
    #[arg(value_name = "OUTPUT_PDF")]
    output_pdf: PathBuf,

    /// Zoom factor for high-resolution image conversion (default: 3.0).
    #[arg(short = 'z', long = "zoom_factor", default_value_t = DEFAULT_ZOOM_FACTOR)]
    zoom_factor: f32,

    /// JPEG image quality (1-100). Lower values result in smaller file sizes (default: 85).
    #[arg(
        short = 'j',
        long = "jpeg_quality",
        default_value_t = DEFAULT_JPEG_QUALITY,
        value_parser = clap::value_parser!(u8).range(1..=100)
    )]
    jpeg_quality: u8,

    /// Output PDF retains the original size.
    #[arg(short = 'k', long = "keep_size")]
    keep_size: bool,

    /// Path to the Japanese TrueType/OpenType font file (e.g., ipaexg.ttf).
    #[arg(short = 'f', long = "font_path", default_value = DEFAULT_FONT_PATH)]
    font_path: PathBuf,

    /// Suppress INFO messages and only show WARNING/ERROR/FATAL logs.
    #[arg(short = 'q', long = "quiet")]
    quiet: bool,
}

fn init_logging(quiet: bool) {
    let level = if quiet {
        LevelFilter::Warn
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format(|buf, record| {
            let level = match record.level() {
                Level::Warn => "WARNING",
                other => other.as_str(),
            };
            writeln!(buf, "{}: {}", level, record.args())
        })
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.quiet);

    let built = SlideGuard::builder(cli.input_pdf, cli.output_pdf)
        .zoom_factor(cli.zoom_factor)
        .jpeg_quality(cli.jpeg_quality)
        .keep_size(cli.keep_size)
        .font_path(cli.font_path)
        .build();
    let mut guard = match built {
        Ok(guard) => guard,
        Err(err @ SlideGuardError::InvalidConfiguration(_)) => {
            log::error!("{err}");
            std::process::exit(2);
        }
        Err(err) => {
            log::error!("FATAL ERROR occurred. Process aborted: {err}");
            std::process::exit(1);
        }
    };

    if guard.run().is_err() {
        std::process::exit(1);
    }
}
