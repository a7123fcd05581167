mod canvas;
mod error;
mod extract;
mod font;
mod overlay;
mod pdf_parse;
mod raster;
mod rasterize;
mod types;

pub use error::SlideGuardError;
pub use extract::extract_page_texts;
pub use font::{
    BUILTIN_FALLBACK_FONT, DEFAULT_FONT_ALIAS, FontRegistry, OverlayFont, resolve_overlay_font,
};
pub use overlay::{OverlaySummary, apply_search_layer};
pub use rasterize::{RasterizedDocument, rasterize_to_image_pdf};
pub use types::{PageGeometry, Pt, Size};

use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_ZOOM_FACTOR: f32 = 3.0;
pub const DEFAULT_JPEG_QUALITY: u8 = 85;
pub const DEFAULT_FONT_PATH: &str = "/usr/share/fonts/opentype/ipaexfont-gothic/ipaexg.ttf";

/// Validated settings for one conversion.
#[derive(Debug, Clone, PartialEq)]
pub struct SlideGuardOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    pub zoom_factor: f32,
    pub jpeg_quality: u8,
    pub keep_size: bool,
    pub font_path: PathBuf,
    pub font_alias: String,
}

impl SlideGuardOptions {
    /// The intermediate image document, `<output>.temp.pdf`.
    pub fn temp_path(&self) -> PathBuf {
        let mut name = self.output.as_os_str().to_owned();
        name.push(".temp.pdf");
        PathBuf::from(name)
    }
}

#[derive(Debug, Clone)]
pub struct SlideGuardBuilder {
    input: PathBuf,
    output: PathBuf,
    zoom_factor: f32,
    jpeg_quality: u8,
    keep_size: bool,
    font_path: PathBuf,
    font_alias: String,
}

impl SlideGuardBuilder {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            zoom_factor: DEFAULT_ZOOM_FACTOR,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            keep_size: false,
            font_path: PathBuf::from(DEFAULT_FONT_PATH),
            font_alias: DEFAULT_FONT_ALIAS.to_string(),
        }
    }

    pub fn zoom_factor(mut self, zoom: f32) -> Self {
        self.zoom_factor = zoom;
        self
    }

    pub fn jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality;
        self
    }

    /// Restore the source page size in the output instead of keeping the
    /// zoomed size.
    pub fn keep_size(mut self, enabled: bool) -> Self {
        self.keep_size = enabled;
        self
    }

    pub fn font_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.font_path = path.into();
        self
    }

    pub fn font_alias(mut self, alias: impl Into<String>) -> Self {
        self.font_alias = alias.into();
        self
    }

    pub fn build(self) -> Result<SlideGuard, SlideGuardError> {
        rasterize::validate_raster_options(self.zoom_factor, self.jpeg_quality)?;
        if self.font_alias.trim().is_empty() {
            return Err(SlideGuardError::InvalidConfiguration(
                "font alias must not be empty".to_string(),
            ));
        }
        Ok(SlideGuard {
            options: SlideGuardOptions {
                input: self.input,
                output: self.output,
                zoom_factor: self.zoom_factor,
                jpeg_quality: self.jpeg_quality,
                keep_size: self.keep_size,
                font_path: self.font_path,
                font_alias: self.font_alias,
            },
            state: RunState::Idle,
        })
    }
}

/// Pipeline stage a run is in, or ended in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    FontSetup,
    TextExtraction,
    Rasterization,
    Overlay,
    Cleanup,
    Done,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Idle => "idle",
            RunState::FontSetup => "font setup",
            RunState::TextExtraction => "text extraction",
            RunState::Rasterization => "rasterization",
            RunState::Overlay => "overlay",
            RunState::Cleanup => "cleanup",
            RunState::Done => "done",
            RunState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub pages_written: usize,
    pub font: OverlayFont,
    pub zoom_factor: f32,
    pub keep_size: bool,
}

/// A failed run: the stage that failed and why.
#[derive(Debug)]
pub struct RunError {
    pub state: RunState,
    pub source: SlideGuardError,
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.state, self.source)
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// Removes the intermediate file when dropped, whichever way the run ends.
struct TempFileGuard {
    path: PathBuf,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::info!("Cleaned up temporary file '{}'.", self.path.display()),
            Err(err) => log::warn!(
                "Could not remove temporary file '{}': {err}",
                self.path.display()
            ),
        }
    }
}

pub struct SlideGuard {
    options: SlideGuardOptions,
    state: RunState,
}

impl SlideGuard {
    pub fn builder(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> SlideGuardBuilder {
        SlideGuardBuilder::new(input, output)
    }

    pub fn options(&self) -> &SlideGuardOptions {
        &self.options
    }

    /// Last stage entered; `Done` or `Failed` once `run` returns.
    pub fn state(&self) -> RunState {
        self.state
    }

    /// Converts the input into a searchable image PDF at the output path.
    ///
    /// Any error aborts the remaining stages. The intermediate file is removed
    /// on every path.
    pub fn run(&mut self) -> Result<RunReport, RunError> {
        let guard = TempFileGuard::new(self.options.temp_path());
        let result = self.run_stages(guard.path());
        if let Err(err) = &result {
            log::error!("FATAL ERROR occurred. Process aborted: {}", err.source);
        }

        self.state = RunState::Cleanup;
        drop(guard);

        self.state = match result {
            Ok(_) => RunState::Done,
            Err(_) => RunState::Failed,
        };
        result
    }

    fn run_stages(&mut self, temp_path: &Path) -> Result<RunReport, RunError> {
        let options = self.options.clone();

        self.state = RunState::FontSetup;
        let mut fonts = FontRegistry::new();
        let font = resolve_overlay_font(&mut fonts, &options.font_path, &options.font_alias);

        self.state = RunState::TextExtraction;
        let texts = extract_page_texts(&options.input).map_err(|err| self.fail(err))?;

        self.state = RunState::Rasterization;
        let raster = rasterize_to_image_pdf(
            &options.input,
            temp_path,
            options.zoom_factor,
            options.jpeg_quality,
            &fonts,
        )
        .map_err(|err| self.fail(err))?;

        self.state = RunState::Overlay;
        let summary = apply_search_layer(
            temp_path,
            &texts,
            &options.output,
            &fonts,
            &font,
            options.keep_size,
            raster.zoom_factor,
        )
        .map_err(|err| self.fail(err))?;

        Ok(RunReport {
            pages_written: summary.pages_written,
            font,
            zoom_factor: raster.zoom_factor,
            keep_size: options.keep_size,
        })
    }

    fn fail(&self, source: SlideGuardError) -> RunError {
        RunError {
            state: self.state,
            source,
        }
    }
}

/// Runs one conversion with `options`.
pub fn run(options: SlideGuardOptions) -> Result<RunReport, RunError> {
    let mut guard = SlideGuardBuilder::new(options.input, options.output)
        .zoom_factor(options.zoom_factor)
        .jpeg_quality(options.jpeg_quality)
        .keep_size(options.keep_size)
        .font_path(options.font_path)
        .font_alias(options.font_alias)
        .build()
        .map_err(|source| RunError {
            state: RunState::Idle,
            source,
        })?;
    guard.run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults_match_cli_defaults() {
        let guard = SlideGuard::builder("in.pdf", "out.pdf").build().expect("build");
        let options = guard.options();
        assert_eq!(options.zoom_factor, 3.0);
        assert_eq!(options.jpeg_quality, 85);
        assert!(!options.keep_size);
        assert_eq!(options.font_path, PathBuf::from(DEFAULT_FONT_PATH));
        assert_eq!(options.font_alias, "JapaneseGothic");
        assert_eq!(guard.state(), RunState::Idle);
    }

    #[test]
    fn temp_path_appends_suffix_to_output() {
        let guard = SlideGuard::builder("in.pdf", "/tmp/slides/out.pdf")
            .build()
            .expect("build");
        assert_eq!(
            guard.options().temp_path(),
            PathBuf::from("/tmp/slides/out.pdf.temp.pdf")
        );
    }

    #[test]
    fn builder_rejects_invalid_settings() {
        for builder in [
            SlideGuard::builder("a", "b").zoom_factor(0.0),
            SlideGuard::builder("a", "b").zoom_factor(f32::INFINITY),
            SlideGuard::builder("a", "b").jpeg_quality(0),
            SlideGuard::builder("a", "b").jpeg_quality(101),
            SlideGuard::builder("a", "b").font_alias("  "),
        ] {
            assert!(matches!(
                builder.build(),
                Err(SlideGuardError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn failure_reports_stage_and_removes_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let output = dir.path().join("out.pdf");
        let mut guard = SlideGuard::builder(dir.path().join("missing.pdf"), &output)
            .font_path(dir.path().join("nofont.ttf"))
            .build()
            .expect("build");
        std::fs::write(guard.options().temp_path(), b"stale").expect("stale temp");

        let err = guard.run().expect_err("missing input");
        assert_eq!(err.state, RunState::TextExtraction);
        assert!(matches!(err.source, SlideGuardError::DocumentOpen(_)));
        assert_eq!(guard.state(), RunState::Failed);
        assert!(!guard.options().temp_path().exists());
        assert!(!output.exists());
    }

    #[test]
    fn run_error_exposes_its_cause() {
        use std::error::Error;
        let err = RunError {
            state: RunState::Overlay,
            source: SlideGuardError::Render("boom".to_string()),
        };
        assert_eq!(err.to_string(), "overlay failed: render error: boom");
        assert!(err.source().is_some());
    }
}
