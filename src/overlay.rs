//! Invisible text layer merged onto rasterized pages.
//!
//! Each page of the intermediate image document gets a Form XObject that
//! writes its extracted text at near-zero size with zero fill alpha. Page
//! content is optionally scaled back to the source size.

use crate::error::SlideGuardError;
use crate::font::{FontProgramKind, FontRegistry, OverlayFont, RegisteredFont};
use crate::pdf_parse::winansi_char;
use crate::rasterize::save_document;
use crate::types::{PageGeometry, Size};
use lopdf::content::{Content, Operation};
use lopdf::{
    Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId,
    Stream as LoStream, StringFormat, dictionary,
};
use std::collections::BTreeMap;
use std::path::Path;

const OVERLAY_FONT_SIZE: f32 = 0.1;
const OVERLAY_LEADING: f32 = 0.12;
const OVERLAY_MARGIN: f32 = 50.0;
const OVERLAY_FONT_RESOURCE: &str = "SGF1";
const OVERLAY_GSTATE_RESOURCE: &str = "SGGS0";
const OVERLAY_XOBJECT_RESOURCE: &str = "SGText";

#[derive(Debug, Clone, PartialEq)]
pub struct OverlaySummary {
    pub pages_written: usize,
    pub page_sizes: Vec<Size>,
}

/// Writes `texts` as an invisible layer onto the pages of `intermediate` and
/// saves the result to `destination`.
///
/// Only pages with a text entry are kept. With `keep_size` every page is
/// scaled back by `1 / zoom_factor`.
pub fn apply_search_layer(
    intermediate: &Path,
    texts: &[String],
    destination: &Path,
    fonts: &FontRegistry,
    font: &OverlayFont,
    keep_size: bool,
    zoom_factor: f32,
) -> Result<OverlaySummary, SlideGuardError> {
    log::info!("Overlaying transparent text and finalizing file...");
    if keep_size {
        log::info!("Finalizing PDF. Size mode: Original size will be restored.");
    } else {
        log::info!("Finalizing PDF. Size mode: Scaled page size will be retained.");
    }

    let mut doc = LoDocument::load(intermediate).map_err(|err| {
        SlideGuardError::DocumentOpen(format!("{}: {err}", intermediate.display()))
    })?;
    if doc.is_encrypted() {
        return Err(SlideGuardError::DocumentOpen(format!(
            "{}: document is encrypted",
            intermediate.display()
        )));
    }

    let page_ids: Vec<ObjectId> = doc.get_pages().into_values().collect();
    if texts.len() > page_ids.len() {
        log::warn!("Extracted text pages exceeded base PDF page count.");
    }
    let written = texts.len().min(page_ids.len());

    let mut encoder = TextEncoder::for_font(fonts, font);
    let encoded: Vec<Vec<Vec<u8>>> = texts[..written]
        .iter()
        .map(|text| text.lines().map(|line| encoder.encode(line)).collect())
        .collect();
    encoder.report();

    let font_id = encoder.add_font_objects(&mut doc)?;
    let gstate_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "ca" => 0,
    });

    let mut page_sizes = Vec::with_capacity(written);
    for (page_id, lines) in page_ids.iter().copied().zip(&encoded) {
        let declared = declared_size(&doc, page_id)?;
        let geometry = PageGeometry {
            logical: declared.scaled(1.0 / zoom_factor),
            zoom: zoom_factor,
        };
        let (final_size, scale) = if keep_size {
            geometry.output(true)
        } else {
            (declared, 1.0)
        };
        let form_id = add_text_form(
            &mut doc,
            final_size,
            lines,
            encoder.string_format(),
            font_id,
            gstate_id,
        )?;
        rewrite_page(&mut doc, page_id, final_size, scale, form_id)?;
        page_sizes.push(final_size);
    }

    if written < page_ids.len() {
        let dropped: Vec<u32> = ((written + 1)..=page_ids.len()).map(|n| n as u32).collect();
        log::debug!("dropping {} pages without text entries", dropped.len());
        doc.delete_pages(&dropped);
    }

    doc.prune_objects();
    doc.renumber_objects();
    doc.compress();
    save_document(&mut doc, destination)?;
    log::info!("Final searchable PDF saved to: {}", destination.display());

    Ok(OverlaySummary {
        pages_written: written,
        page_sizes,
    })
}

fn declared_size(doc: &LoDocument, page_id: ObjectId) -> Result<Size, SlideGuardError> {
    let page = doc.get_object(page_id)?.as_dict()?;
    let media_box = page
        .get(b"MediaBox")
        .ok()
        .and_then(|obj| match obj {
            LoObject::Reference(id) => doc.get_object(*id).ok(),
            other => Some(other),
        })
        .and_then(|obj| obj.as_array().ok())
        .map(|arr| arr.iter().filter_map(number).collect::<Vec<f32>>());
    match media_box.as_deref() {
        Some([x0, y0, x1, y1]) => Ok(Size::new((x1 - x0).abs(), (y1 - y0).abs())),
        _ => Ok(Size::letter()),
    }
}

fn number(obj: &LoObject) -> Option<f32> {
    match obj {
        LoObject::Integer(value) => Some(*value as f32),
        LoObject::Real(value) => Some(*value),
        _ => None,
    }
}

fn add_text_form(
    doc: &mut LoDocument,
    size: Size,
    lines: &[Vec<u8>],
    format: StringFormat,
    font_id: ObjectId,
    gstate_id: ObjectId,
) -> Result<ObjectId, SlideGuardError> {
    let width = size.width.to_f32();
    let height = size.height.to_f32();

    let mut operations = vec![
        Operation::new("q", vec![]),
        Operation::new(
            "gs",
            vec![LoObject::Name(OVERLAY_GSTATE_RESOURCE.as_bytes().to_vec())],
        ),
        Operation::new("k", vec![0.into(), 0.into(), 0.into(), 1.into()]),
        Operation::new("BT", vec![]),
        Operation::new(
            "Tf",
            vec![
                LoObject::Name(OVERLAY_FONT_RESOURCE.as_bytes().to_vec()),
                OVERLAY_FONT_SIZE.into(),
            ],
        ),
        Operation::new("TL", vec![OVERLAY_LEADING.into()]),
        Operation::new("Td", vec![OVERLAY_MARGIN.into(), (height - OVERLAY_MARGIN).into()]),
    ];
    for (index, line) in lines.iter().enumerate() {
        if index > 0 {
            operations.push(Operation::new("T*", vec![]));
        }
        operations.push(Operation::new(
            "Tj",
            vec![LoObject::String(line.clone(), format)],
        ));
    }
    operations.push(Operation::new("ET", vec![]));
    operations.push(Operation::new("Q", vec![]));

    let content = Content { operations }
        .encode()
        .map_err(|err| SlideGuardError::Render(format!("overlay encoding failed: {err}")))?;
    let form = LoStream::new(
        dictionary! {
            "Type" => "XObject",
            "Subtype" => "Form",
            "FormType" => 1,
            "BBox" => vec![0.into(), 0.into(), width.into(), height.into()],
            "Resources" => dictionary! {
                "Font" => dictionary! { OVERLAY_FONT_RESOURCE => font_id },
                "ExtGState" => dictionary! { OVERLAY_GSTATE_RESOURCE => gstate_id },
            },
        },
        content,
    );
    Ok(doc.add_object(form))
}

fn rewrite_page(
    doc: &mut LoDocument,
    page_id: ObjectId,
    size: Size,
    scale: f32,
    form_id: ObjectId,
) -> Result<(), SlideGuardError> {
    let original = doc.get_page_content(page_id)?;
    let mut content = format!("q {scale} 0 0 {scale} 0 0 cm\n").into_bytes();
    content.extend_from_slice(&original);
    content.extend_from_slice(format!("\nQ\nq /{OVERLAY_XOBJECT_RESOURCE} Do Q\n").as_bytes());
    let content_id = doc.add_object(LoStream::new(dictionary! {}, content));

    let page = doc.get_object(page_id)?.as_dict()?;
    let mut resources = page_resources(doc, page);
    let mut xobjects = match resources.get(b"XObject") {
        Ok(LoObject::Dictionary(dict)) => dict.clone(),
        Ok(LoObject::Reference(id)) => doc
            .get_object(*id)
            .ok()
            .and_then(|obj| obj.as_dict().ok())
            .cloned()
            .unwrap_or_default(),
        _ => LoDictionary::new(),
    };
    xobjects.set(OVERLAY_XOBJECT_RESOURCE, form_id);
    resources.set("XObject", xobjects);

    let width = size.width.to_f32();
    let height = size.height.to_f32();
    let page = doc.get_object_mut(page_id)?.as_dict_mut()?;
    page.set("Contents", content_id);
    page.set("Resources", resources);
    page.set(
        "MediaBox",
        vec![0.into(), 0.into(), width.into(), height.into()],
    );
    page.set(
        "CropBox",
        vec![0.into(), 0.into(), width.into(), height.into()],
    );
    Ok(())
}

fn page_resources(doc: &LoDocument, page: &LoDictionary) -> LoDictionary {
    match page.get(b"Resources") {
        Ok(LoObject::Dictionary(dict)) => dict.clone(),
        Ok(LoObject::Reference(id)) => doc
            .get_object(*id)
            .ok()
            .and_then(|obj| obj.as_dict().ok())
            .cloned()
            .unwrap_or_default(),
        _ => LoDictionary::new(),
    }
}

/// Turns overlay lines into font-specific string bytes and later writes the
/// font objects covering every glyph that was used.
enum TextEncoder<'a> {
    Cid {
        font: &'a RegisteredFont,
        used: BTreeMap<u16, String>,
        missing: usize,
    },
    WinAnsi {
        base_font: &'static str,
        replaced: usize,
    },
}

impl<'a> TextEncoder<'a> {
    fn for_font(fonts: &'a FontRegistry, font: &OverlayFont) -> Self {
        match font {
            OverlayFont::Registered { alias, .. } => match fonts.resolve(alias) {
                Some(registered) => TextEncoder::Cid {
                    font: registered,
                    used: BTreeMap::new(),
                    missing: 0,
                },
                None => {
                    log::warn!(
                        "Font '{alias}' is not registered. Using default font ({}).",
                        crate::font::BUILTIN_FALLBACK_FONT
                    );
                    TextEncoder::WinAnsi {
                        base_font: crate::font::BUILTIN_FALLBACK_FONT,
                        replaced: 0,
                    }
                }
            },
            OverlayFont::Builtin(name) => TextEncoder::WinAnsi {
                base_font: *name,
                replaced: 0,
            },
        }
    }

    fn encode(&mut self, line: &str) -> Vec<u8> {
        match self {
            TextEncoder::Cid {
                font,
                used,
                missing,
            } => {
                let gids = font.glyph_ids(line);
                let mut out = Vec::with_capacity(gids.len() * 2);
                for (ch, gid) in line.chars().zip(gids) {
                    if gid == 0 {
                        *missing += 1;
                    } else {
                        used.entry(gid).or_insert_with(|| ch.to_string());
                    }
                    out.extend_from_slice(&gid.to_be_bytes());
                }
                out
            }
            TextEncoder::WinAnsi { replaced, .. } => {
                let (bytes, count) = encode_winansi(line);
                *replaced += count;
                bytes
            }
        }
    }

    fn report(&self) {
        match self {
            TextEncoder::Cid { font, missing, .. } if *missing > 0 => {
                log::warn!(
                    "{missing} characters have no glyph in font '{}' and will not be searchable.",
                    font.name
                );
            }
            TextEncoder::WinAnsi {
                base_font,
                replaced,
            } if *replaced > 0 => {
                log::warn!("{replaced} characters are not encodable in {base_font} and were replaced with '?'.");
            }
            _ => {}
        }
    }

    fn string_format(&self) -> StringFormat {
        match self {
            TextEncoder::Cid { .. } => StringFormat::Hexadecimal,
            TextEncoder::WinAnsi { .. } => StringFormat::Literal,
        }
    }

    fn add_font_objects(&self, doc: &mut LoDocument) -> Result<ObjectId, SlideGuardError> {
        match self {
            TextEncoder::Cid { font, used, .. } => add_cid_font(doc, font, used),
            TextEncoder::WinAnsi { base_font, .. } => Ok(doc.add_object(dictionary! {
                "Type" => "Font",
                "Subtype" => "Type1",
                "BaseFont" => *base_font,
                "Encoding" => "WinAnsiEncoding",
            })),
        }
    }
}

fn add_cid_font(
    doc: &mut LoDocument,
    font: &RegisteredFont,
    used: &BTreeMap<u16, String>,
) -> Result<ObjectId, SlideGuardError> {
    let base_font = font.postscript_name.as_str();
    let metrics = &font.metrics;

    let mut file_dict = dictionary! {};
    match font.program_kind {
        FontProgramKind::TrueType => file_dict.set("Length1", font.data.len() as i64),
        FontProgramKind::OpenTypeCff => file_dict.set("Subtype", "OpenType"),
    }
    let file_id = doc.add_object(LoStream::new(file_dict, font.data.to_vec()));

    let mut flags: i64 = if metrics.symbolic { 4 } else { 32 };
    if metrics.is_fixed_pitch {
        flags |= 1;
    }
    let file_key = match font.program_kind {
        FontProgramKind::TrueType => "FontFile2",
        FontProgramKind::OpenTypeCff => "FontFile3",
    };
    let mut descriptor = dictionary! {
        "Type" => "FontDescriptor",
        "FontName" => base_font,
        "Flags" => flags,
        "FontBBox" => vec![
            (metrics.bbox.0 as i64).into(),
            (metrics.bbox.1 as i64).into(),
            (metrics.bbox.2 as i64).into(),
            (metrics.bbox.3 as i64).into(),
        ],
        "ItalicAngle" => metrics.italic_angle as i64,
        "Ascent" => metrics.ascent as i64,
        "Descent" => metrics.descent as i64,
        "CapHeight" => metrics.cap_height as i64,
        "StemV" => metrics.stem_v as i64,
        "MissingWidth" => metrics.missing_width as i64,
    };
    descriptor.set(file_key, file_id);
    let descriptor_id = doc.add_object(descriptor);

    let mut widths = Vec::with_capacity(used.len() * 2);
    for gid in used.keys() {
        let advance = match font.glyph_advance(*gid) {
            0 => metrics.missing_width,
            advance => advance,
        };
        widths.push(LoObject::Integer(*gid as i64));
        widths.push(LoObject::Array(vec![LoObject::Integer(advance as i64)]));
    }

    let subtype = match font.program_kind {
        FontProgramKind::TrueType => "CIDFontType2",
        FontProgramKind::OpenTypeCff => "CIDFontType0",
    };
    let mut cid_font = dictionary! {
        "Type" => "Font",
        "Subtype" => subtype,
        "BaseFont" => base_font,
        "CIDSystemInfo" => dictionary! {
            "Registry" => LoObject::string_literal("Adobe"),
            "Ordering" => LoObject::string_literal("Identity"),
            "Supplement" => 0,
        },
        "FontDescriptor" => descriptor_id,
        "DW" => metrics.missing_width as i64,
        "W" => widths,
    };
    if font.program_kind == FontProgramKind::TrueType {
        cid_font.set("CIDToGIDMap", "Identity");
    }
    let cid_font_id = doc.add_object(cid_font);

    let to_unicode_id = doc.add_object(LoStream::new(
        dictionary! {},
        to_unicode_cmap(used).into_bytes(),
    ));

    Ok(doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type0",
        "BaseFont" => base_font,
        "Encoding" => "Identity-H",
        "DescendantFonts" => vec![cid_font_id.into()],
        "ToUnicode" => to_unicode_id,
    }))
}

fn to_unicode_cmap(glyphs: &BTreeMap<u16, String>) -> String {
    let mut out = String::new();
    out.push_str("/CIDInit /ProcSet findresource begin\n");
    out.push_str("12 dict begin\n");
    out.push_str("begincmap\n");
    out.push_str("/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n");
    out.push_str("/CMapName /Adobe-Identity-UCS def\n");
    out.push_str("/CMapType 2 def\n");
    out.push_str("1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n");

    let entries: Vec<(&u16, &String)> = glyphs.iter().collect();
    // bfchar blocks are limited to 100 entries.
    for chunk in entries.chunks(100) {
        out.push_str(&format!("{} beginbfchar\n", chunk.len()));
        for (gid, text) in chunk {
            let mut hex = String::new();
            let mut units = [0u16; 2];
            for ch in text.chars() {
                for unit in ch.encode_utf16(&mut units) {
                    hex.push_str(&format!("{:04X}", unit));
                }
            }
            out.push_str(&format!("<{:04X}> <{}>\n", gid, hex));
        }
        out.push_str("endbfchar\n");
    }

    out.push_str("endcmap\n");
    out.push_str("CMapName currentdict /CMap defineresource pop\n");
    out.push_str("end\nend\n");
    out
}

/// cp1252 bytes for `text` and the number of chars replaced with `?`.
fn encode_winansi(text: &str) -> (Vec<u8>, usize) {
    let mut out = Vec::with_capacity(text.len());
    let mut replaced = 0usize;
    for ch in text.chars() {
        let byte = match ch as u32 {
            0x20..=0x7E | 0xA0..=0xFF => Some(ch as u8),
            _ => (0x80u8..=0x9F).find(|b| winansi_char(*b) == ch),
        };
        match byte {
            Some(byte) => out.push(byte),
            None => {
                out.push(b'?');
                replaced += 1;
            }
        }
    }
    (out, replaced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::extract_page_texts;
    use crate::font::BUILTIN_FALLBACK_FONT;
    use crate::pdf_parse::tests::build_pdf;
    use crate::pdf_parse::{ParseCache, PdfSource};
    use crate::rasterize::rasterize_to_image_pdf;
    use std::path::PathBuf;

    struct Fixture {
        _dir: tempfile::TempDir,
        source: PathBuf,
        intermediate: PathBuf,
        output: PathBuf,
    }

    fn fixture(pages: &[(&str, i64, i64)], zoom: f32) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let pages: Vec<(String, i64, i64)> = pages
            .iter()
            .map(|(content, w, h)| (content.to_string(), *w, *h))
            .collect();
        let source = dir.path().join("source.pdf");
        std::fs::write(&source, build_pdf(&pages)).expect("write source");
        let intermediate = dir.path().join("out.pdf.temp.pdf");
        rasterize_to_image_pdf(&source, &intermediate, zoom, 70, &FontRegistry::new())
            .expect("rasterize");
        let output = dir.path().join("out.pdf");
        Fixture {
            _dir: dir,
            source,
            intermediate,
            output,
        }
    }

    fn helvetica() -> OverlayFont {
        OverlayFont::Builtin(BUILTIN_FALLBACK_FONT)
    }

    const TWO_PAGES: &[(&str, i64, i64)] = &[
        ("BT /F1 12 Tf 72 300 Td (Quarterly results) Tj 0 -20 Td (Revenue up) Tj ET", 400, 360),
        ("BT /F1 12 Tf 40 100 Td (Thank you) Tj ET", 300, 200),
    ];

    #[test]
    fn overlay_text_round_trips_through_extraction() {
        let fx = fixture(TWO_PAGES, 2.0);
        let texts = extract_page_texts(&fx.source).expect("extract");
        assert_eq!(texts, vec!["Quarterly results\nRevenue up\n", "Thank you\n"]);

        apply_search_layer(
            &fx.intermediate,
            &texts,
            &fx.output,
            &FontRegistry::new(),
            &helvetica(),
            false,
            2.0,
        )
        .expect("overlay");
        assert_eq!(extract_page_texts(&fx.output).expect("reextract"), texts);
    }

    #[test]
    fn keep_size_restores_source_page_sizes() {
        let fx = fixture(TWO_PAGES, 3.0);
        let texts = extract_page_texts(&fx.source).expect("extract");
        let summary = apply_search_layer(
            &fx.intermediate,
            &texts,
            &fx.output,
            &FontRegistry::new(),
            &helvetica(),
            true,
            3.0,
        )
        .expect("overlay");

        assert_eq!(summary.pages_written, 2);
        let out = PdfSource::open(&fx.output).expect("open");
        assert!(out.page_size(0).unwrap().approx_eq(Size::new(400.0, 360.0), 0.05));
        assert!(out.page_size(1).unwrap().approx_eq(Size::new(300.0, 200.0), 0.05));
    }

    #[test]
    fn without_keep_size_pages_stay_zoomed() {
        let fx = fixture(TWO_PAGES, 2.0);
        let texts = extract_page_texts(&fx.source).expect("extract");
        apply_search_layer(
            &fx.intermediate,
            &texts,
            &fx.output,
            &FontRegistry::new(),
            &helvetica(),
            false,
            2.0,
        )
        .expect("overlay");

        let doc = LoDocument::load(&fx.output).expect("load");
        let first = *doc.get_pages().get(&1).expect("page");
        let crop = doc
            .get_object(first)
            .and_then(LoObject::as_dict)
            .and_then(|page| page.get(b"CropBox"))
            .and_then(LoObject::as_array)
            .expect("crop box");
        let crop: Vec<f32> = crop.iter().filter_map(number).collect();
        assert_eq!(crop, vec![0.0, 0.0, 800.0, 720.0]);
    }

    #[test]
    fn surplus_texts_are_ignored_and_missing_texts_drop_pages() {
        let fx = fixture(TWO_PAGES, 1.0);
        let surplus = vec!["a\n".to_string(), "b\n".to_string(), "c\n".to_string()];
        let summary = apply_search_layer(
            &fx.intermediate,
            &surplus,
            &fx.output,
            &FontRegistry::new(),
            &helvetica(),
            false,
            1.0,
        )
        .expect("overlay");
        assert_eq!(summary.pages_written, 2);

        let short = vec!["only\n".to_string()];
        let summary = apply_search_layer(
            &fx.intermediate,
            &short,
            &fx.output,
            &FontRegistry::new(),
            &helvetica(),
            false,
            1.0,
        )
        .expect("overlay");
        assert_eq!(summary.pages_written, 1);
        assert_eq!(extract_page_texts(&fx.output).expect("extract"), short);
    }

    #[test]
    fn overlay_does_not_change_the_rendered_page() {
        let fx = fixture(&[("0 0 1 rg 20 20 60 60 re f", 100, 100)], 1.0);
        apply_search_layer(
            &fx.intermediate,
            &["IIIIIIIIIIIIIIII\n".repeat(40)],
            &fx.output,
            &FontRegistry::new(),
            &helvetica(),
            false,
            1.0,
        )
        .expect("overlay");

        let render = |path: &Path| {
            let source = PdfSource::open(path).expect("open");
            let page = source.parse_page(0, &mut ParseCache::default()).expect("parse");
            crate::raster::render_page(&page.commands, page.size, 1.0, &[])
                .expect("render")
                .data()
                .to_vec()
        };
        assert_eq!(render(&fx.intermediate), render(&fx.output));
    }

    #[test]
    fn non_winansi_characters_become_question_marks() {
        let (bytes, replaced) = encode_winansi("Préis €5 日本");
        assert_eq!(replaced, 2);
        assert_eq!(bytes, b"Pr\xE9is \x805 ??".to_vec());
    }

    #[test]
    fn registered_font_text_round_trips() {
        let Some(path) = crate::font::tests::system_ttf() else {
            return;
        };
        let fx = fixture(&[("0 0 m 1 1 l S", 200, 200)], 1.0);
        let mut fonts = FontRegistry::new();
        let font = crate::font::resolve_overlay_font(&mut fonts, &path, "Overlay");
        assert!(!font.is_builtin());

        let texts = vec!["Grüße aus Köln\nzweite Zeile\n".to_string()];
        apply_search_layer(&fx.intermediate, &texts, &fx.output, &fonts, &font, true, 1.0)
            .expect("overlay");
        assert_eq!(extract_page_texts(&fx.output).expect("extract"), texts);
    }

    #[test]
    fn to_unicode_encodes_astral_chars_as_surrogate_pairs() {
        let mut glyphs = BTreeMap::new();
        glyphs.insert(7u16, "\u{1F600}".to_string());
        glyphs.insert(3u16, "A".to_string());
        let cmap = to_unicode_cmap(&glyphs);
        assert!(cmap.contains("2 beginbfchar"));
        assert!(cmap.contains("<0003> <0041>"));
        assert!(cmap.contains("<0007> <D83DDE00>"));
    }

    #[test]
    fn invalid_intermediate_is_document_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bogus = dir.path().join("bogus.pdf");
        std::fs::write(&bogus, b"nope").expect("write");
        let err = apply_search_layer(
            &bogus,
            &[],
            &dir.path().join("out.pdf"),
            &FontRegistry::new(),
            &helvetica(),
            false,
            3.0,
        )
        .expect_err("invalid");
        assert!(matches!(err, SlideGuardError::DocumentOpen(_)));
    }
}
