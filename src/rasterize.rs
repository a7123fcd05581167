use crate::error::SlideGuardError;
use crate::font::FontRegistry;
use crate::pdf_parse::{ParseCache, PdfSource};
use crate::raster;
use crate::types::{PageGeometry, Size};
use image::codecs::jpeg::JpegEncoder;
use lopdf::content::{Content, Operation};
use lopdf::{Document as LoDocument, Object as LoObject, ObjectId, Stream as LoStream, dictionary};
use std::collections::HashSet;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

/// The intermediate image-only document, with the geometry of each page.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterizedDocument {
    pub zoom_factor: f32,
    pub pages: Vec<PageGeometry>,
}

pub(crate) fn validate_raster_options(zoom_factor: f32, jpeg_quality: u8) -> Result<(), SlideGuardError> {
    if !zoom_factor.is_finite() || zoom_factor <= 0.0 {
        return Err(SlideGuardError::InvalidConfiguration(format!(
            "zoom factor must be a positive number, got {zoom_factor}"
        )));
    }
    if !(1..=100).contains(&jpeg_quality) {
        return Err(SlideGuardError::InvalidConfiguration(format!(
            "JPEG quality must be between 1 and 100, got {jpeg_quality}"
        )));
    }
    Ok(())
}

/// Renders every page of `source` to a JPEG and writes an image-only PDF to
/// `destination`.
///
/// Each output page is declared at the zoomed size (`logical * zoom_factor`
/// points) and shows one image of `zoom_factor` pixels per source point.
pub fn rasterize_to_image_pdf(
    source: &Path,
    destination: &Path,
    zoom_factor: f32,
    jpeg_quality: u8,
    fonts: &FontRegistry,
) -> Result<RasterizedDocument, SlideGuardError> {
    validate_raster_options(zoom_factor, jpeg_quality)?;
    log::info!("Generating high-resolution image PDF (Zoom x{zoom_factor:.1})...");

    let pdf = PdfSource::open(source)?;
    let mut builder = ImagePdfBuilder::new();
    let mut cache = ParseCache::default();
    let mut embedded = FontRegistry::new();
    let mut embedded_names: HashSet<String> = HashSet::new();
    let mut pages = Vec::with_capacity(pdf.page_count());

    for index in 0..pdf.page_count() {
        let size = pdf.page_size(index)?;
        let pixmap = match pdf.parse_page(index, &mut cache) {
            Ok(parsed) => {
                register_embedded_fonts(&cache, &mut embedded, &mut embedded_names);
                raster::render_page(&parsed.commands, parsed.size, zoom_factor, &[&embedded, fonts])?
            }
            Err(err) => {
                log::warn!("Page {} could not be rendered, leaving it blank: {err}", index + 1);
                raster::blank_page(size, zoom_factor)?
            }
        };

        let rgb = raster::pixmap_to_rgb(&pixmap);
        let (width_px, height_px) = rgb.dimensions();
        let mut jpeg = Vec::new();
        JpegEncoder::new_with_quality(&mut jpeg, jpeg_quality)
            .encode_image(&rgb)
            .map_err(|err| {
                SlideGuardError::Render(format!("JPEG encoding of page {} failed: {err}", index + 1))
            })?;

        let geometry = PageGeometry {
            logical: Size::new(width_px as f32 / zoom_factor, height_px as f32 / zoom_factor),
            zoom: zoom_factor,
        };
        builder.add_page(jpeg, width_px, height_px, geometry.declared())?;
        log::debug!(
            "page {}: {}x{} px, declared {:.2}x{:.2} pt",
            index + 1,
            width_px,
            height_px,
            geometry.declared().width.to_f32(),
            geometry.declared().height.to_f32()
        );
        pages.push(geometry);
    }

    builder.save(destination)?;
    log::info!(
        "Saved high-resolution image PDF to temporary file: {}",
        destination.display()
    );
    Ok(RasterizedDocument { zoom_factor, pages })
}

fn register_embedded_fonts(
    cache: &ParseCache,
    registry: &mut FontRegistry,
    seen: &mut HashSet<String>,
) {
    for (name, data) in cache.embedded_fonts() {
        if !seen.insert(name.to_string()) {
            continue;
        }
        if let Err(err) = registry.register_bytes_as(data.to_vec(), name) {
            log::debug!("embedded font skipped: {err}");
        }
    }
}

struct ImagePdfBuilder {
    doc: LoDocument,
    pages_id: ObjectId,
    kids: Vec<LoObject>,
}

impl ImagePdfBuilder {
    fn new() -> Self {
        let mut doc = LoDocument::with_version("1.7");
        let pages_id = doc.new_object_id();
        Self {
            doc,
            pages_id,
            kids: Vec::new(),
        }
    }

    fn add_page(
        &mut self,
        jpeg: Vec<u8>,
        width_px: u32,
        height_px: u32,
        declared: Size,
    ) -> Result<(), SlideGuardError> {
        let image_id = self.doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => width_px as i64,
                "Height" => height_px as i64,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
                "Filter" => "DCTDecode",
            },
            jpeg,
        ));

        let width = declared.width.to_f32();
        let height = declared.height.to_f32();
        let content = Content {
            operations: vec![
                Operation::new("q", vec![]),
                Operation::new(
                    "cm",
                    vec![
                        width.into(),
                        0.into(),
                        0.into(),
                        height.into(),
                        0.into(),
                        0.into(),
                    ],
                ),
                Operation::new("Do", vec![LoObject::Name(b"Im0".to_vec())]),
                Operation::new("Q", vec![]),
            ],
        };
        let content_bytes = content
            .encode()
            .map_err(|err| SlideGuardError::Render(format!("content encoding failed: {err}")))?;
        let content_id = self
            .doc
            .add_object(LoStream::new(dictionary! {}, content_bytes));

        let page_id = self.doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => self.pages_id,
            "MediaBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "XObject" => dictionary! { "Im0" => image_id },
            },
        });
        self.kids.push(page_id.into());
        Ok(())
    }

    fn save(mut self, destination: &Path) -> Result<(), SlideGuardError> {
        let count = self.kids.len() as i64;
        self.doc.objects.insert(
            self.pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => self.kids,
                "Count" => count,
            }),
        );
        let catalog_id = self.doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => self.pages_id,
        });
        self.doc.trailer.set("Root", catalog_id);
        self.doc.compress();
        save_document(&mut self.doc, destination)
    }
}

/// Writes `doc` to `destination`, mapping every failure to `Write`.
pub(crate) fn save_document(doc: &mut LoDocument, destination: &Path) -> Result<(), SlideGuardError> {
    let file = File::create(destination).map_err(SlideGuardError::Write)?;
    let mut writer = BufWriter::new(file);
    doc.save_to(&mut writer).map_err(|err| {
        SlideGuardError::Write(std::io::Error::other(format!(
            "{}: {err}",
            destination.display()
        )))
    })?;
    Ok(())
}
