use crate::canvas::Command;
use crate::error::SlideGuardError;
use crate::types::{Color, Pt, Size};
use base64::Engine;
use image::codecs::png::PngEncoder;
use image::{ColorType, ImageEncoder};
use lopdf::content::{Content, Operation};
use lopdf::{Dictionary as LoDictionary, Document as LoDocument, Object as LoObject, ObjectId};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use ttf_parser::Face;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Matrix {
    a: f32,
    b: f32,
    c: f32,
    d: f32,
    e: f32,
    f: f32,
}

impl Matrix {
    fn identity() -> Self {
        Self::from_operands(1.0, 0.0, 0.0, 1.0, 0.0, 0.0)
    }

    fn from_operands(a: f32, b: f32, c: f32, d: f32, e: f32, f: f32) -> Self {
        Self { a, b, c, d, e, f }
    }

    fn translation(tx: f32, ty: f32) -> Self {
        Self::from_operands(1.0, 0.0, 0.0, 1.0, tx, ty)
    }

    /// `self` applied first, then `rhs` (row-vector convention of ISO 32000).
    fn concat(self, rhs: Self) -> Self {
        Self {
            a: self.a * rhs.a + self.b * rhs.c,
            b: self.a * rhs.b + self.b * rhs.d,
            c: self.c * rhs.a + self.d * rhs.c,
            d: self.c * rhs.b + self.d * rhs.d,
            e: self.e * rhs.a + self.f * rhs.c + rhs.e,
            f: self.e * rhs.b + self.f * rhs.d + rhs.f,
        }
    }

    fn transform_point(self, x: f32, y: f32) -> (f32, f32) {
        (
            self.a * x + self.c * y + self.e,
            self.b * x + self.d * y + self.f,
        )
    }

    fn transform_delta(self, dx: f32, dy: f32) -> (f32, f32) {
        (self.a * dx + self.c * dy, self.b * dx + self.d * dy)
    }

    fn scale_y(self) -> f32 {
        (self.c * self.c + self.d * self.d).sqrt()
    }

    fn scale_x(self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    fn axis_aligned_unit_rect(self) -> Option<(f32, f32, f32, f32)> {
        if self.b.abs() > 0.0001 || self.c.abs() > 0.0001 {
            return None;
        }
        let x0 = self.e;
        let x1 = self.e + self.a;
        let y0 = self.f;
        let y1 = self.f + self.d;
        Some((x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
enum CodeWidth {
    #[default]
    SingleByte,
    TwoByte,
}

#[derive(Clone, Default)]
struct FontMetrics {
    default_width: f32,
    widths: HashMap<u16, f32>,
    code_width: CodeWidth,
}

#[derive(Clone, Default)]
struct PdfFont {
    // Name the raster backend resolves: unique per embedded program, plain base name otherwise.
    render_name: String,
    to_unicode: HashMap<u16, String>,
    embedded: bool,
    cid_to_gid: Option<Arc<Vec<u16>>>,
    metrics: FontMetrics,
    face_data: Option<Arc<Vec<u8>>>,
}

#[derive(Clone, Default)]
struct PdfResources {
    fonts: HashMap<String, PdfFont>,
    xobjects: HashMap<String, ObjectId>,
    extgstates: HashMap<String, (Option<f32>, Option<f32>)>,
}

impl PdfResources {
    fn merged(&self, child: &PdfResources) -> PdfResources {
        let mut out = self.clone();
        out.fonts
            .extend(child.fonts.iter().map(|(k, v)| (k.clone(), v.clone())));
        out.xobjects.extend(child.xobjects.iter().map(|(k, v)| (k.clone(), *v)));
        out.extgstates
            .extend(child.extgstates.iter().map(|(k, v)| (k.clone(), *v)));
        out
    }
}

#[derive(Clone)]
struct ParseState {
    ctm: Matrix,
    font_resource: Option<String>,
    font_size: f32,
    text_matrix: Matrix,
    text_line_matrix: Matrix,
    text_leading: f32,
    char_spacing: f32,
    word_spacing: f32,
    text_h_scale: f32,
    text_rise: f32,
    text_render_mode: i64,
    fill_opacity: f32,
    stroke_opacity: f32,
}

impl Default for ParseState {
    fn default() -> Self {
        Self {
            ctm: Matrix::identity(),
            font_resource: None,
            font_size: 12.0,
            text_matrix: Matrix::identity(),
            text_line_matrix: Matrix::identity(),
            text_leading: 0.0,
            char_spacing: 0.0,
            word_spacing: 0.0,
            text_h_scale: 1.0,
            text_rise: 0.0,
            text_render_mode: 0,
            fill_opacity: 1.0,
            stroke_opacity: 1.0,
        }
    }
}

/// A piece of shown text with its page-space placement.
///
/// `x` is the left edge and `baseline` the distance of the baseline from the
/// top edge of the page, both in points.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct TextRun {
    pub(crate) text: String,
    pub(crate) x: f32,
    pub(crate) baseline: f32,
    pub(crate) font_size: f32,
    pub(crate) width: f32,
}

#[derive(Debug, Clone)]
pub(crate) struct ParsedPage {
    pub(crate) size: Size,
    pub(crate) commands: Vec<Command>,
    pub(crate) text_runs: Vec<TextRun>,
}

/// Objects shared between pages of one document: decoded images and fonts.
#[derive(Default)]
pub(crate) struct ParseCache {
    image_data_uri_by_object: HashMap<ObjectId, String>,
    fonts_by_object: HashMap<ObjectId, PdfFont>,
    embedded_fonts: HashMap<String, Arc<Vec<u8>>>,
}

impl ParseCache {
    /// Embedded font programs seen so far, keyed by the name draw commands use.
    pub(crate) fn embedded_fonts(&self) -> impl Iterator<Item = (&str, &Arc<Vec<u8>>)> {
        self.embedded_fonts.iter().map(|(k, v)| (k.as_str(), v))
    }
}

pub(crate) struct PdfSource {
    doc: LoDocument,
    page_ids: Vec<ObjectId>,
}

impl PdfSource {
    pub(crate) fn open(path: &Path) -> Result<Self, SlideGuardError> {
        let bytes = std::fs::read(path).map_err(|err| {
            SlideGuardError::DocumentOpen(format!("{}: {err}", path.display()))
        })?;
        Self::from_bytes(&bytes).map_err(|err| match err {
            SlideGuardError::DocumentOpen(message) => {
                SlideGuardError::DocumentOpen(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Result<Self, SlideGuardError> {
        let doc = LoDocument::load_mem(bytes)?;
        if doc.is_encrypted() {
            return Err(SlideGuardError::DocumentOpen(
                "document is encrypted".to_string(),
            ));
        }
        let page_ids = doc.get_pages().into_values().collect();
        Ok(Self { doc, page_ids })
    }

    pub(crate) fn page_count(&self) -> usize {
        self.page_ids.len()
    }

    pub(crate) fn page_size(&self, index: usize) -> Result<Size, SlideGuardError> {
        let page_id = self.page_id(index)?;
        Ok(page_frame(&self.doc, page_id)?.size())
    }

    pub(crate) fn parse_page(
        &self,
        index: usize,
        cache: &mut ParseCache,
    ) -> Result<ParsedPage, SlideGuardError> {
        let page_id = self.page_id(index)?;
        let frame = page_frame(&self.doc, page_id)?;
        let size = frame.size();
        let resources = match inherited_entry(&self.doc, page_id, b"Resources")? {
            Some(obj) => resources_from_object(&self.doc, obj, cache)?,
            None => PdfResources::default(),
        };
        let content_bytes = self.doc.get_page_content(page_id)?;
        let content = Content::decode(&content_bytes)?;

        let mut interpreter = Interpreter {
            doc: &self.doc,
            cache,
            page_height: size.height.to_f32(),
            commands: Vec::new(),
            text_runs: Vec::new(),
            visited_forms: HashSet::new(),
        };
        let mut state = ParseState {
            ctm: frame.base_matrix(),
            ..ParseState::default()
        };
        interpreter.run(&content.operations, &resources, &mut state)?;

        Ok(ParsedPage {
            size,
            commands: interpreter.commands,
            text_runs: interpreter.text_runs,
        })
    }

    fn page_id(&self, index: usize) -> Result<ObjectId, SlideGuardError> {
        self.page_ids.get(index).copied().ok_or_else(|| {
            SlideGuardError::DocumentOpen(format!(
                "page {} out of range ({} pages)",
                index + 1,
                self.page_ids.len()
            ))
        })
    }
}

struct Interpreter<'a> {
    doc: &'a LoDocument,
    cache: &'a mut ParseCache,
    page_height: f32,
    commands: Vec<Command>,
    text_runs: Vec<TextRun>,
    visited_forms: HashSet<ObjectId>,
}

impl Interpreter<'_> {
    fn run(
        &mut self,
        operations: &[Operation],
        resources: &PdfResources,
        state: &mut ParseState,
    ) -> Result<(), SlideGuardError> {
        let mut stack: Vec<ParseState> = Vec::new();
        for op in operations {
            match op.operator.as_str() {
                "q" => {
                    stack.push(state.clone());
                    self.commands.push(Command::SaveState);
                }
                "Q" => {
                    if let Some(prev) = stack.pop() {
                        *state = prev;
                        self.commands.push(Command::RestoreState);
                    }
                }
                "cm" => {
                    if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                        state.ctm = Matrix::from_operands(a, b, c, d, e, f).concat(state.ctm);
                    }
                }
                "w" => {
                    if let Some(width) = op_f32(op, 0) {
                        let scaled = width.max(0.0) * state.ctm.scale_x().max(0.0001);
                        self.commands.push(Command::SetLineWidth(Pt::from_f32(scaled)));
                    }
                }
                "J" => {
                    if let Some(cap) = op_i64(op, 0) {
                        self.commands.push(Command::SetLineCap(cap.clamp(0, 2) as u8));
                    }
                }
                "j" => {
                    if let Some(join) = op_i64(op, 0) {
                        self.commands.push(Command::SetLineJoin(join.clamp(0, 2) as u8));
                    }
                }
                "M" => {
                    if let Some(limit) = op_f32(op, 0) {
                        self.commands
                            .push(Command::SetMiterLimit(Pt::from_f32(limit.max(0.0))));
                    }
                }
                "d" => {
                    if op.operands.len() >= 2 {
                        let pattern = op
                            .operands
                            .first()
                            .and_then(|o| o.as_array().ok())
                            .map(|arr| {
                                arr.iter()
                                    .filter_map(obj_to_f32)
                                    .map(|v| Pt::from_f32(v.abs()))
                                    .collect::<Vec<_>>()
                            })
                            .unwrap_or_default();
                        let phase = op.operands.get(1).and_then(obj_to_f32).unwrap_or(0.0);
                        self.commands.push(Command::SetDash {
                            pattern,
                            phase: Pt::from_f32(phase),
                        });
                    }
                }
                "gs" => {
                    if let Some(name) = op_name(op, 0) {
                        if let Some((fill, stroke)) = resources.extgstates.get(&name).copied() {
                            state.fill_opacity = fill.unwrap_or(state.fill_opacity);
                            state.stroke_opacity = stroke.unwrap_or(state.stroke_opacity);
                            self.commands.push(Command::SetOpacity {
                                fill: state.fill_opacity,
                                stroke: state.stroke_opacity,
                            });
                        }
                    }
                }
                "rg" | "RG" | "g" | "G" | "k" | "K" => {
                    if let Some(color) = color_from_operands(op) {
                        if op.operator.chars().all(|ch| ch.is_ascii_lowercase()) {
                            self.commands.push(Command::SetFillColor(color));
                        } else {
                            self.commands.push(Command::SetStrokeColor(color));
                        }
                    }
                }
                "sc" | "scn" | "SC" | "SCN" => {
                    if let Some(color) = color_from_operands(op) {
                        if op.operator.starts_with('s') {
                            self.commands.push(Command::SetFillColor(color));
                        } else {
                            self.commands.push(Command::SetStrokeColor(color));
                        }
                    }
                }
                "m" => {
                    if let Some([x, y]) = op_f32_2(op) {
                        let (x, y) = self.to_page(state, x, y);
                        self.commands.push(Command::MoveTo { x, y });
                    }
                }
                "l" => {
                    if let Some([x, y]) = op_f32_2(op) {
                        let (x, y) = self.to_page(state, x, y);
                        self.commands.push(Command::LineTo { x, y });
                    }
                }
                "c" => {
                    if let Some([x1, y1, x2, y2, x, y]) = op_f32_6(op) {
                        let (x1, y1) = self.to_page(state, x1, y1);
                        let (x2, y2) = self.to_page(state, x2, y2);
                        let (x, y) = self.to_page(state, x, y);
                        self.commands.push(Command::CurveTo {
                            x1,
                            y1,
                            x2,
                            y2,
                            x,
                            y,
                        });
                    }
                }
                "re" => {
                    if let Some([x, y, w, h]) = op_f32_4(op) {
                        let corners = [(x, y), (x + w, y), (x + w, y + h), (x, y + h)];
                        for (idx, (cx, cy)) in corners.into_iter().enumerate() {
                            let (px, py) = self.to_page(state, cx, cy);
                            if idx == 0 {
                                self.commands.push(Command::MoveTo { x: px, y: py });
                            } else {
                                self.commands.push(Command::LineTo { x: px, y: py });
                            }
                        }
                        self.commands.push(Command::ClosePath);
                    }
                }
                "h" => self.commands.push(Command::ClosePath),
                "W" => self.commands.push(Command::ClipPath { evenodd: false }),
                "W*" => self.commands.push(Command::ClipPath { evenodd: true }),
                "n" => self.commands.push(Command::EndPath),
                "f" | "F" => self.commands.push(Command::Fill),
                "f*" => self.commands.push(Command::FillEvenOdd),
                "S" => self.commands.push(Command::Stroke),
                "B" => self.commands.push(Command::FillStroke),
                "B*" => self.commands.push(Command::FillStrokeEvenOdd),
                "s" => {
                    self.commands.push(Command::ClosePath);
                    self.commands.push(Command::Stroke);
                }
                "b" => {
                    self.commands.push(Command::ClosePath);
                    self.commands.push(Command::FillStroke);
                }
                "b*" => {
                    self.commands.push(Command::ClosePath);
                    self.commands.push(Command::FillStrokeEvenOdd);
                }
                "BT" => {
                    state.text_matrix = Matrix::identity();
                    state.text_line_matrix = Matrix::identity();
                }
                "ET" => {}
                "TL" => {
                    if let Some(leading) = op_f32(op, 0) {
                        state.text_leading = leading;
                    }
                }
                "Tc" => {
                    if let Some(spacing) = op_f32(op, 0) {
                        state.char_spacing = spacing;
                    }
                }
                "Tw" => {
                    if let Some(spacing) = op_f32(op, 0) {
                        state.word_spacing = spacing;
                    }
                }
                "Tz" => {
                    if let Some(scale_percent) = op_f32(op, 0) {
                        state.text_h_scale = (scale_percent / 100.0).max(0.0);
                    }
                }
                "Ts" => {
                    if let Some(rise) = op_f32(op, 0) {
                        state.text_rise = rise;
                    }
                }
                "Tr" => {
                    if let Some(mode) = op_i64(op, 0) {
                        state.text_render_mode = mode.clamp(0, 7);
                    }
                }
                "Tf" => {
                    if let Some(font_res_name) = op_name(op, 0) {
                        let size = op_f32(op, 1).unwrap_or(12.0).abs();
                        let render_name = resources
                            .fonts
                            .get(&font_res_name)
                            .map(|font| font.render_name.clone())
                            .unwrap_or_else(|| font_res_name.clone());
                        state.font_resource = Some(font_res_name);
                        state.font_size = size;
                        self.commands.push(Command::SetFontName(render_name));
                    }
                }
                "Td" | "TD" => {
                    if let Some([tx, ty]) = op_f32_2(op) {
                        if op.operator == "TD" {
                            state.text_leading = -ty;
                        }
                        move_text_line(state, tx, ty);
                    }
                }
                "T*" => {
                    let leading = state.text_leading;
                    move_text_line(state, 0.0, -leading);
                }
                "Tm" => {
                    if let Some([a, b, c, d, e, f]) = op_f32_6(op) {
                        let tm = Matrix::from_operands(a, b, c, d, e, f);
                        state.text_matrix = tm;
                        state.text_line_matrix = tm;
                    }
                }
                "Tj" => {
                    if let Some(obj) = op.operands.first() {
                        self.show_string(state, resources, obj);
                    }
                }
                "'" => {
                    let leading = state.text_leading;
                    move_text_line(state, 0.0, -leading);
                    if let Some(obj) = op.operands.first() {
                        self.show_string(state, resources, obj);
                    }
                }
                "\"" => {
                    if let Some(word) = op_f32(op, 0) {
                        state.word_spacing = word;
                    }
                    if let Some(chr) = op_f32(op, 1) {
                        state.char_spacing = chr;
                    }
                    let leading = state.text_leading;
                    move_text_line(state, 0.0, -leading);
                    if let Some(obj) = op.operands.get(2) {
                        self.show_string(state, resources, obj);
                    }
                }
                "TJ" => {
                    if let Some(arr) = op.operands.first().and_then(|o| o.as_array().ok()) {
                        for item in arr {
                            if item.as_str().is_ok() {
                                self.show_string(state, resources, item);
                            } else if let Some(adj) = obj_to_f32(item) {
                                // TJ adjustment is thousandths of text-space units.
                                let tx = -(adj / 1000.0)
                                    * state.font_size
                                    * state.text_h_scale.max(0.0);
                                advance_text_matrix(state, tx);
                            }
                        }
                    }
                }
                "Do" => {
                    if let Some(name) = op_name(op, 0) {
                        if let Some(obj_id) = resources.xobjects.get(&name).copied() {
                            self.draw_xobject(obj_id, resources, state)?;
                        }
                    }
                }
                _ => {}
            }
        }
        // Unbalanced q at the end of a stream must not leak into the caller.
        for _ in stack {
            self.commands.push(Command::RestoreState);
        }
        Ok(())
    }

    fn to_page(&self, state: &ParseState, x: f32, y: f32) -> (Pt, Pt) {
        let (x_pdf, y_pdf) = state.ctm.transform_point(x, y);
        (Pt::from_f32(x_pdf), Pt::from_f32(self.page_height - y_pdf))
    }

    fn draw_xobject(
        &mut self,
        obj_id: ObjectId,
        parent_resources: &PdfResources,
        state: &ParseState,
    ) -> Result<(), SlideGuardError> {
        let doc = self.doc;
        let stream = doc.get_object(obj_id)?.as_stream()?;
        let subtype = stream
            .dict
            .get(b"Subtype")
            .ok()
            .and_then(|o| o.as_name().ok())
            .map(name_bytes_to_string)
            .unwrap_or_default();

        if subtype == "Form" {
            if !self.visited_forms.insert(obj_id) {
                return Ok(());
            }
            let form_bytes = stream
                .get_plain_content()
                .map_err(|e| SlideGuardError::DocumentOpen(format!("form xobject: {e}")))?;
            let form_content = Content::decode(&form_bytes)?;
            let form_resources = match stream.dict.get(b"Resources") {
                Ok(obj) => resources_from_object(doc, obj, self.cache)?,
                Err(_) => PdfResources::default(),
            };
            let merged_resources = parent_resources.merged(&form_resources);
            let form_matrix = stream
                .dict
                .get(b"Matrix")
                .ok()
                .and_then(parse_matrix_object)
                .unwrap_or_else(Matrix::identity);

            let mut nested_state = state.clone();
            nested_state.ctm = form_matrix.concat(nested_state.ctm);
            self.commands.push(Command::SaveState);
            self.run(&form_content.operations, &merged_resources, &mut nested_state)?;
            self.commands.push(Command::RestoreState);
            self.visited_forms.remove(&obj_id);
            return Ok(());
        }

        if subtype == "Image" {
            let data_uri = match self.cache.image_data_uri_by_object.get(&obj_id) {
                Some(cached) => cached.clone(),
                None => {
                    let Some(built) = image_stream_to_data_uri(doc, stream) else {
                        log::debug!("skipping image xobject {:?}: unsupported encoding", obj_id);
                        return Ok(());
                    };
                    self.cache
                        .image_data_uri_by_object
                        .insert(obj_id, built.clone());
                    built
                }
            };
            if let Some((left, bottom, right, top)) = state.ctm.axis_aligned_unit_rect() {
                let width = right - left;
                let height = top - bottom;
                if width > 0.0 && height > 0.0 {
                    self.commands.push(Command::DrawImage {
                        x: Pt::from_f32(left),
                        y: Pt::from_f32(self.page_height - top),
                        width: Pt::from_f32(width),
                        height: Pt::from_f32(height),
                        resource_id: data_uri,
                    });
                }
            } else {
                let m = state.ctm;
                self.commands.push(Command::DrawImageMatrix {
                    matrix: [m.a, m.b, m.c, m.d, m.e, m.f],
                    resource_id: data_uri,
                });
            }
        }

        Ok(())
    }

    fn show_string(&mut self, state: &mut ParseState, resources: &PdfResources, obj: &LoObject) {
        let font = state
            .font_resource
            .as_ref()
            .and_then(|res| resources.fonts.get(res));
        let Ok(bytes) = obj.as_str() else {
            return;
        };
        let text = decode_text_bytes(bytes, font);
        let advance = font
            .and_then(|font| advance_from_pdf_codes(bytes, state, font))
            .unwrap_or_else(|| estimate_text_advance_fallback(&text, state, font));

        if !text.is_empty() {
            self.emit_text(state, font, bytes, &text, advance);
        }
        advance_text_matrix(state, advance);
    }

    fn emit_text(
        &mut self,
        state: &ParseState,
        font: Option<&PdfFont>,
        bytes: &[u8],
        text: &str,
        advance: f32,
    ) {
        let (tx, ty) = state.text_matrix.transform_point(0.0, state.text_rise);
        let (x_pdf, y_pdf) = state.ctm.transform_point(tx, ty);
        let (end_tx, end_ty) = state.text_matrix.transform_point(advance, state.text_rise);
        let (end_x_pdf, _) = state.ctm.transform_point(end_tx, end_ty);
        let rendering = state.text_matrix.concat(state.ctm);
        let page_size = (state.font_size * rendering.scale_y()).max(0.01);

        self.text_runs.push(TextRun {
            text: text.to_string(),
            x: x_pdf.min(end_x_pdf),
            baseline: self.page_height - y_pdf,
            font_size: page_size,
            width: (end_x_pdf - x_pdf).abs(),
        });

        // Modes 3 and 7 paint nothing; the text only exists for extraction.
        if state.text_render_mode == 3 || state.text_render_mode == 7 {
            return;
        }
        self.commands.push(Command::SetFontSize(Pt::from_f32(page_size)));

        if let Some(font) = font.filter(|f| f.embedded && f.metrics.code_width == CodeWidth::TwoByte)
        {
            if let Some(run) = glyph_run(state, font, bytes, x_pdf, self.page_height - y_pdf) {
                self.commands.push(run);
                return;
            }
        }
        self.commands.push(Command::DrawString {
            x: Pt::from_f32(x_pdf),
            y: Pt::from_f32(self.page_height - y_pdf - page_size),
            text: text.to_string(),
        });
    }
}

fn glyph_run(state: &ParseState, font: &PdfFont, bytes: &[u8], x: f32, y: f32) -> Option<Command> {
    let codes = pdf_string_codes(bytes, CodeWidth::TwoByte)?;
    if codes.is_empty() {
        return None;
    }
    let rendering = state.text_matrix.concat(state.ctm);
    let sy = rendering.scale_y().max(0.0001);
    let h_scale = state.text_h_scale.max(0.0);

    let mut glyph_ids = Vec::with_capacity(codes.len());
    let mut advances = Vec::with_capacity(codes.len());
    for code in codes {
        let gid = font
            .cid_to_gid
            .as_ref()
            .and_then(|map| map.get(code as usize).copied())
            .unwrap_or(code);
        glyph_ids.push(gid);
        let width = font
            .metrics
            .widths
            .get(&code)
            .copied()
            .unwrap_or(font.metrics.default_width)
            .max(0.0);
        let mut tx = (width / 1000.0) * state.font_size + state.char_spacing;
        if code_is_space(font, code) {
            tx += state.word_spacing;
        }
        let (dx, dy) = rendering.transform_delta(tx * h_scale, 0.0);
        advances.push((Pt::from_f32(dx), Pt::from_f32(dy)));
    }

    Some(Command::DrawGlyphRun {
        x: Pt::from_f32(x),
        y: Pt::from_f32(y),
        glyph_ids,
        advances,
        m00: rendering.a / sy * h_scale,
        m01: rendering.b / sy * h_scale,
        m10: rendering.c / sy,
        m11: rendering.d / sy,
    })
}

fn move_text_line(state: &mut ParseState, tx: f32, ty: f32) {
    let (ux, uy) = state.text_line_matrix.transform_delta(tx, ty);
    state.text_line_matrix = state.text_line_matrix.concat(Matrix::translation(ux, uy));
    state.text_matrix = state.text_line_matrix;
}

fn advance_text_matrix(state: &mut ParseState, tx: f32) {
    let (ux, uy) = state.text_matrix.transform_delta(tx, 0.0);
    state.text_matrix = state.text_matrix.concat(Matrix::translation(ux, uy));
}

fn advance_from_pdf_codes(bytes: &[u8], state: &ParseState, font: &PdfFont) -> Option<f32> {
    if font.metrics.widths.is_empty() && font.face_data.is_some() {
        return None;
    }
    let codes = pdf_string_codes(bytes, font.metrics.code_width)?;
    let mut sum = 0.0f32;
    for code in codes {
        let width = font
            .metrics
            .widths
            .get(&code)
            .copied()
            .unwrap_or(font.metrics.default_width)
            .max(0.0);
        sum += (width / 1000.0) * state.font_size + state.char_spacing;
        if code_is_space(font, code) {
            sum += state.word_spacing;
        }
    }
    Some(sum * state.text_h_scale.max(0.0))
}

fn pdf_string_codes(bytes: &[u8], width: CodeWidth) -> Option<Vec<u16>> {
    match width {
        CodeWidth::SingleByte => Some(bytes.iter().map(|b| *b as u16).collect()),
        CodeWidth::TwoByte => {
            if bytes.len() < 2 {
                return None;
            }
            Some(
                bytes
                    .chunks_exact(2)
                    .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
                    .collect(),
            )
        }
    }
}

fn code_is_space(font: &PdfFont, code: u16) -> bool {
    if code == 0x0020 && font.metrics.code_width == CodeWidth::SingleByte {
        return true;
    }
    font.to_unicode
        .get(&code)
        .map(|mapped| mapped.as_str() == " ")
        .unwrap_or(false)
}

fn estimate_text_advance_fallback(text: &str, state: &ParseState, font: Option<&PdfFont>) -> f32 {
    let fallback = state.font_size.max(0.01) * 0.5;
    let face = font
        .and_then(|f| f.face_data.as_ref())
        .and_then(|data| Face::parse(data.as_slice(), 0).ok());
    let scale = face
        .as_ref()
        .map(|face| state.font_size / face.units_per_em().max(1) as f32)
        .unwrap_or(0.0);
    let mut sum = 0.0f32;
    for ch in text.chars() {
        let glyph_advance = face
            .as_ref()
            .and_then(|face| face.glyph_index(ch))
            .and_then(|gid| face.as_ref().and_then(|face| face.glyph_hor_advance(gid)))
            .map(|w| w as f32 * scale)
            .unwrap_or(fallback);
        sum += glyph_advance + state.char_spacing;
        if ch == ' ' {
            sum += state.word_spacing;
        }
    }
    sum * state.text_h_scale.max(0.0)
}

fn decode_text_bytes(bytes: &[u8], font: Option<&PdfFont>) -> String {
    let Some(font) = font else {
        return decode_single_byte_text(bytes);
    };
    match font.metrics.code_width {
        CodeWidth::TwoByte => {
            let mut out = String::new();
            for chunk in bytes.chunks_exact(2) {
                let code = u16::from_be_bytes([chunk[0], chunk[1]]);
                if let Some(mapped) = font.to_unicode.get(&code) {
                    out.push_str(mapped);
                } else if font.to_unicode.is_empty() && code != 0 {
                    // Without a ToUnicode map the best guess for Identity text is UCS-2.
                    out.push(char::from_u32(code as u32).unwrap_or('\u{FFFD}'));
                }
            }
            out
        }
        CodeWidth::SingleByte => {
            if font.to_unicode.is_empty() {
                return decode_single_byte_text(bytes);
            }
            let mut out = String::new();
            for b in bytes {
                match font.to_unicode.get(&(*b as u16)) {
                    Some(mapped) => out.push_str(mapped),
                    None => out.push(winansi_char(*b)),
                }
            }
            out
        }
    }
}

fn decode_single_byte_text(bytes: &[u8]) -> String {
    if bytes.len() >= 2 && bytes[0] == 0xFE && bytes[1] == 0xFF {
        let units: Vec<u16> = bytes[2..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    bytes.iter().map(|b| winansi_char(*b)).collect()
}

/// Decodes one WinAnsiEncoding (cp1252) byte.
pub(crate) fn winansi_char(byte: u8) -> char {
    match byte {
        0x80 => '\u{20AC}',
        0x82 => '\u{201A}',
        0x83 => '\u{0192}',
        0x84 => '\u{201E}',
        0x85 => '\u{2026}',
        0x86 => '\u{2020}',
        0x87 => '\u{2021}',
        0x88 => '\u{02C6}',
        0x89 => '\u{2030}',
        0x8A => '\u{0160}',
        0x8B => '\u{2039}',
        0x8C => '\u{0152}',
        0x8E => '\u{017D}',
        0x91 => '\u{2018}',
        0x92 => '\u{2019}',
        0x93 => '\u{201C}',
        0x94 => '\u{201D}',
        0x95 => '\u{2022}',
        0x96 => '\u{2013}',
        0x97 => '\u{2014}',
        0x98 => '\u{02DC}',
        0x99 => '\u{2122}',
        0x9A => '\u{0161}',
        0x9B => '\u{203A}',
        0x9C => '\u{0153}',
        0x9E => '\u{017E}',
        0x9F => '\u{0178}',
        other => other as char,
    }
}

/// Walks `/Parent` from `id` and returns the first value stored under `key`.
fn inherited_entry<'a>(
    doc: &'a LoDocument,
    id: ObjectId,
    key: &[u8],
) -> Result<Option<&'a LoObject>, SlideGuardError> {
    let mut visited = HashSet::new();
    let mut current = Some(id);
    while let Some(node_id) = current {
        if !visited.insert(node_id) {
            return Err(SlideGuardError::DocumentOpen(format!(
                "page tree cycle through object {} {}",
                node_id.0, node_id.1
            )));
        }
        let dict = doc.get_object(node_id)?.as_dict()?;
        if let Ok(obj) = dict.get(key) {
            return Ok(Some(obj));
        }
        current = dict.get(b"Parent").and_then(LoObject::as_reference).ok();
    }
    Ok(None)
}

fn resources_from_object(
    doc: &LoDocument,
    obj: &LoObject,
    cache: &mut ParseCache,
) -> Result<PdfResources, SlideGuardError> {
    let dict = match resolve_object(doc, obj)? {
        LoObject::Dictionary(d) => d,
        _ => return Ok(PdfResources::default()),
    };

    let mut out = PdfResources::default();

    if let Ok(font_obj) = dict.get(b"Font") {
        let font_dict = resolve_dict(doc, font_obj)?;
        for (name, font_ref_obj) in font_dict.iter() {
            let font = resolve_font(doc, font_ref_obj, cache)?;
            out.fonts.insert(name_bytes_to_string(name), font);
        }
    }

    if let Ok(xobj_obj) = dict.get(b"XObject") {
        let xobj_dict = resolve_dict(doc, xobj_obj)?;
        for (name, ref_obj) in xobj_dict.iter() {
            if let Ok(id) = ref_obj.as_reference() {
                out.xobjects.insert(name_bytes_to_string(name), id);
            }
        }
    }

    if let Ok(gs_obj) = dict.get(b"ExtGState") {
        let gs_dict = resolve_dict(doc, gs_obj)?;
        for (name, gs_ref_obj) in gs_dict.iter() {
            let LoObject::Dictionary(gs) = resolve_object(doc, gs_ref_obj)? else {
                continue;
            };
            let fill = gs.get(b"ca").ok().and_then(obj_to_f32).map(|v| v.clamp(0.0, 1.0));
            let stroke = gs.get(b"CA").ok().and_then(obj_to_f32).map(|v| v.clamp(0.0, 1.0));
            out.extgstates.insert(name_bytes_to_string(name), (fill, stroke));
        }
    }

    Ok(out)
}

fn resolve_font(
    doc: &LoDocument,
    obj: &LoObject,
    cache: &mut ParseCache,
) -> Result<PdfFont, SlideGuardError> {
    let object_id = obj.as_reference().ok();
    if let Some(cached) = object_id.and_then(|id| cache.fonts_by_object.get(&id)) {
        return Ok(cached.clone());
    }
    let LoObject::Dictionary(dict) = resolve_object(doc, obj)? else {
        return Ok(PdfFont {
            render_name: "Helvetica".to_string(),
            ..PdfFont::default()
        });
    };
    let base_name = dict
        .get(b"BaseFont")
        .ok()
        .and_then(|obj| obj.as_name().ok())
        .map(name_bytes_to_string)
        .map(|name| normalize_pdf_font_name(&name))
        .unwrap_or_else(|| "Helvetica".to_string());
    let to_unicode = parse_to_unicode_cmap(doc, dict);
    let metrics = parse_font_metrics(doc, dict, &to_unicode);
    let face_data = resolve_embedded_font_bytes(doc, dict)
        .filter(|data| Face::parse(data, 0).is_ok())
        .map(Arc::new);

    let render_name = match (&face_data, object_id) {
        (Some(data), Some(id)) => {
            let key = format!("{base_name}#{}", id.0);
            cache
                .embedded_fonts
                .entry(key.clone())
                .or_insert_with(|| data.clone());
            key
        }
        _ => base_name,
    };

    let font = PdfFont {
        render_name,
        to_unicode,
        embedded: face_data.is_some(),
        cid_to_gid: parse_cid_to_gid_map(doc, dict).map(Arc::new),
        metrics,
        face_data,
    };
    if let Some(id) = object_id {
        cache.fonts_by_object.insert(id, font.clone());
    }
    Ok(font)
}

fn descendant_font(doc: &LoDocument, font_dict: &LoDictionary) -> Option<LoDictionary> {
    font_dict
        .get(b"DescendantFonts")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_array().ok())
        .and_then(|arr| arr.first())
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_dict().ok())
        .cloned()
}

fn font_subtype(font_dict: &LoDictionary) -> String {
    font_dict
        .get(b"Subtype")
        .ok()
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default()
}

fn parse_font_metrics(
    doc: &LoDocument,
    font_dict: &LoDictionary,
    to_unicode: &HashMap<u16, String>,
) -> FontMetrics {
    if font_subtype(font_dict) == "Type0" {
        return parse_type0_font_metrics(doc, font_dict, to_unicode);
    }
    parse_simple_font_metrics(doc, font_dict)
}

fn parse_type0_font_metrics(
    doc: &LoDocument,
    font_dict: &LoDictionary,
    to_unicode: &HashMap<u16, String>,
) -> FontMetrics {
    let encoding_name = font_dict
        .get(b"Encoding")
        .ok()
        .and_then(|o| resolve_object(doc, o).ok())
        .and_then(|o| o.as_name().ok())
        .map(name_bytes_to_string)
        .unwrap_or_default();
    let code_width = if encoding_name == "Identity-H"
        || encoding_name == "Identity-V"
        || to_unicode.keys().any(|code| *code > 0x00FF)
    {
        CodeWidth::TwoByte
    } else {
        CodeWidth::SingleByte
    };

    let mut default_width = 1000.0f32;
    let mut widths = HashMap::new();
    if let Some(descendant) = descendant_font(doc, font_dict) {
        if let Some(dw) = descendant
            .get(b"DW")
            .ok()
            .and_then(|obj| resolved_obj_to_f32(doc, obj))
        {
            default_width = dw.max(0.0);
        }
        if let Ok(w_obj) = descendant.get(b"W") {
            widths = parse_cid_font_widths(doc, w_obj);
        }
    }

    FontMetrics {
        default_width,
        widths,
        code_width,
    }
}

fn parse_simple_font_metrics(doc: &LoDocument, font_dict: &LoDictionary) -> FontMetrics {
    let default_width = font_dict
        .get(b"FontDescriptor")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_dict().ok())
        .and_then(|descriptor| descriptor.get(b"MissingWidth").ok())
        .and_then(|obj| resolved_obj_to_f32(doc, obj))
        .map(|w| w.max(0.0))
        .unwrap_or(500.0);

    let first_char = font_dict
        .get(b"FirstChar")
        .ok()
        .and_then(|obj| resolved_obj_to_u16(doc, obj))
        .unwrap_or(0u16);
    let mut widths = HashMap::new();
    if let Some(width_arr) = font_dict
        .get(b"Widths")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_array().ok())
    {
        for (idx, width_obj) in width_arr.iter().enumerate() {
            let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
                continue;
            };
            let Some(code) = u16::try_from(idx)
                .ok()
                .and_then(|offset| first_char.checked_add(offset))
            else {
                break;
            };
            widths.insert(code, width.max(0.0));
        }
    }

    FontMetrics {
        default_width,
        widths,
        code_width: CodeWidth::SingleByte,
    }
}

fn parse_cid_font_widths(doc: &LoDocument, obj: &LoObject) -> HashMap<u16, f32> {
    let mut out = HashMap::new();
    let Some(items) = resolve_object(doc, obj)
        .ok()
        .and_then(|resolved| resolved.as_array().ok())
    else {
        return out;
    };

    let mut idx = 0usize;
    while idx + 1 < items.len() {
        let Some(start_cid) = resolved_obj_to_u16(doc, &items[idx]) else {
            idx += 1;
            continue;
        };
        let Ok(next_obj) = resolve_object(doc, &items[idx + 1]) else {
            idx += 1;
            continue;
        };

        // Either `c [w1 w2 ...]` or `c_first c_last w`.
        if let Ok(width_list) = next_obj.as_array() {
            for (offset, width_obj) in width_list.iter().enumerate() {
                let Some(width) = resolved_obj_to_f32(doc, width_obj) else {
                    continue;
                };
                let Some(code) = u16::try_from(offset)
                    .ok()
                    .and_then(|step| start_cid.checked_add(step))
                else {
                    break;
                };
                out.insert(code, width.max(0.0));
            }
            idx += 2;
            continue;
        }

        let Some(end_cid) = resolved_obj_to_u16(doc, &items[idx + 1]) else {
            idx += 1;
            continue;
        };
        let Some(width) = items.get(idx + 2).and_then(|o| resolved_obj_to_f32(doc, o)) else {
            idx += 3;
            continue;
        };
        for code in start_cid..=end_cid {
            out.insert(code, width.max(0.0));
        }
        idx += 3;
    }

    out
}

fn parse_cid_to_gid_map(doc: &LoDocument, font_dict: &LoDictionary) -> Option<Vec<u16>> {
    let descendant = descendant_font(doc, font_dict)?;
    let stream = descendant
        .get(b"CIDToGIDMap")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_stream().ok())?;
    let data = stream.get_plain_content().ok()?;
    Some(
        data.chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect(),
    )
}

fn resolved_obj_to_f32(doc: &LoDocument, obj: &LoObject) -> Option<f32> {
    obj_to_f32(resolve_object(doc, obj).ok()?)
}

fn resolved_obj_to_u16(doc: &LoDocument, obj: &LoObject) -> Option<u16> {
    let resolved = resolve_object(doc, obj).ok()?;
    if let Ok(v) = resolved.as_i64() {
        return u16::try_from(v).ok();
    }
    let v = obj_to_f32(resolved)?;
    if !(0.0..=(u16::MAX as f32)).contains(&v) {
        return None;
    }
    Some(v.round() as u16)
}

fn resolve_embedded_font_bytes(doc: &LoDocument, font_dict: &LoDictionary) -> Option<Vec<u8>> {
    let descriptor_owner = if font_subtype(font_dict) == "Type0" {
        descendant_font(doc, font_dict)?
    } else {
        font_dict.clone()
    };
    let descriptor = descriptor_owner
        .get(b"FontDescriptor")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_dict().ok())?;
    for key in [
        b"FontFile2".as_slice(),
        b"FontFile3".as_slice(),
        b"FontFile".as_slice(),
    ] {
        let data = descriptor
            .get(key)
            .ok()
            .and_then(|obj| resolve_object(doc, obj).ok())
            .and_then(|o| o.as_stream().ok())
            .and_then(|s| s.get_plain_content().ok());
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            return Some(data);
        }
    }
    None
}

/// Visible area of a page: the CropBox clipped to the MediaBox, turned by `/Rotate`.
#[derive(Clone, Copy, Debug, PartialEq)]
struct PageFrame {
    /// Lower-left corner of the visible box in default user space.
    origin: (f32, f32),
    /// Unrotated extent of the visible box.
    width: f32,
    height: f32,
    /// Clockwise quarter turns in degrees: 0, 90, 180 or 270.
    rotate: u16,
}

impl PageFrame {
    /// Size of the page as displayed.
    fn size(&self) -> Size {
        match self.rotate {
            90 | 270 => Size::new(self.height, self.width),
            _ => Size::new(self.width, self.height),
        }
    }

    /// Maps default user space onto the displayed page, origin bottom-left.
    fn base_matrix(&self) -> Matrix {
        let shift = Matrix::translation(-self.origin.0, -self.origin.1);
        let (w, h) = (self.width, self.height);
        let turn = match self.rotate {
            90 => Matrix::from_operands(0.0, -1.0, 1.0, 0.0, 0.0, w),
            180 => Matrix::from_operands(-1.0, 0.0, 0.0, -1.0, w, h),
            270 => Matrix::from_operands(0.0, 1.0, -1.0, 0.0, h, 0.0),
            _ => return shift,
        };
        shift.concat(turn)
    }
}

fn page_frame(doc: &LoDocument, id: ObjectId) -> Result<PageFrame, SlideGuardError> {
    let letter = Size::letter();
    let media = inherited_entry(doc, id, b"MediaBox")?
        .and_then(|obj| page_box(doc, obj))
        .unwrap_or([0.0, 0.0, letter.width.to_f32(), letter.height.to_f32()]);
    let visible = inherited_entry(doc, id, b"CropBox")?
        .and_then(|obj| page_box(doc, obj))
        .and_then(|crop| intersect_boxes(crop, media))
        .unwrap_or(media);
    let rotate = inherited_entry(doc, id, b"Rotate")?
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(obj_to_f32)
        .map(quarter_turns)
        .unwrap_or(0);
    Ok(PageFrame {
        origin: (visible[0], visible[1]),
        width: (visible[2] - visible[0]).max(1.0),
        height: (visible[3] - visible[1]).max(1.0),
        rotate,
    })
}

/// A page boundary rectangle as `[x0, y0, x1, y1]` with `x0 <= x1` and `y0 <= y1`.
fn page_box(doc: &LoDocument, obj: &LoObject) -> Option<[f32; 4]> {
    let arr = resolve_object(doc, obj).ok()?.as_array().ok()?;
    if arr.len() < 4 {
        return None;
    }
    let x0 = obj_to_f32(resolve_object(doc, &arr[0]).ok()?)?;
    let y0 = obj_to_f32(resolve_object(doc, &arr[1]).ok()?)?;
    let x1 = obj_to_f32(resolve_object(doc, &arr[2]).ok()?)?;
    let y1 = obj_to_f32(resolve_object(doc, &arr[3]).ok()?)?;
    Some([x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1)])
}

fn intersect_boxes(a: [f32; 4], b: [f32; 4]) -> Option<[f32; 4]> {
    let clipped = [a[0].max(b[0]), a[1].max(b[1]), a[2].min(b[2]), a[3].min(b[3])];
    (clipped[2] > clipped[0] && clipped[3] > clipped[1]).then_some(clipped)
}

/// Snaps a `/Rotate` value to 0, 90, 180 or 270.
fn quarter_turns(degrees: f32) -> u16 {
    ((degrees / 90.0).round() as i64).rem_euclid(4) as u16 * 90
}

#[derive(Clone, Copy)]
enum DirectColor {
    Gray,
    Rgb,
    Cmyk,
}

impl DirectColor {
    fn channels(self) -> usize {
        match self {
            Self::Gray => 1,
            Self::Rgb => 3,
            Self::Cmyk => 4,
        }
    }

    fn rgb_from_bytes(self, bytes: &[u8]) -> Option<(u8, u8, u8)> {
        match self {
            Self::Gray => {
                let v = *bytes.first()?;
                Some((v, v, v))
            }
            Self::Rgb => Some((*bytes.first()?, *bytes.get(1)?, *bytes.get(2)?)),
            Self::Cmyk => {
                let color = Color::cmyk(
                    *bytes.first()? as f32 / 255.0,
                    *bytes.get(1)? as f32 / 255.0,
                    *bytes.get(2)? as f32 / 255.0,
                    *bytes.get(3)? as f32 / 255.0,
                );
                Some((
                    (color.r * 255.0) as u8,
                    (color.g * 255.0) as u8,
                    (color.b * 255.0) as u8,
                ))
            }
        }
    }
}

enum ImageColorSpace {
    Direct(DirectColor),
    Indexed { base: DirectColor, lookup: Vec<u8> },
}

fn direct_color_from_name(name: &[u8]) -> Option<DirectColor> {
    match name {
        b"DeviceGray" | b"CalGray" => Some(DirectColor::Gray),
        b"DeviceRGB" | b"CalRGB" => Some(DirectColor::Rgb),
        b"DeviceCMYK" => Some(DirectColor::Cmyk),
        _ => None,
    }
}

fn parse_image_color_space(doc: &LoDocument, obj: &LoObject) -> Option<ImageColorSpace> {
    match resolve_object(doc, obj).ok()? {
        LoObject::Name(name) => Some(ImageColorSpace::Direct(direct_color_from_name(name)?)),
        LoObject::Array(arr) => {
            let head = resolve_object(doc, arr.first()?).ok()?.as_name().ok()?;
            if let Some(direct) = direct_color_from_name(head) {
                return Some(ImageColorSpace::Direct(direct));
            }
            if head == b"ICCBased" {
                let channels = arr
                    .get(1)
                    .and_then(|o| resolve_object(doc, o).ok())
                    .and_then(|o| o.as_stream().ok())
                    .and_then(|s| s.dict.get(b"N").ok())
                    .and_then(|n| n.as_i64().ok())
                    .unwrap_or(3);
                return Some(ImageColorSpace::Direct(match channels {
                    1 => DirectColor::Gray,
                    4 => DirectColor::Cmyk,
                    _ => DirectColor::Rgb,
                }));
            }
            if head != b"Indexed" || arr.len() < 4 {
                return None;
            }
            let base = match parse_image_color_space(doc, arr.get(1)?)? {
                ImageColorSpace::Direct(mode) => mode,
                ImageColorSpace::Indexed { .. } => return None,
            };
            let lookup = match resolve_object(doc, arr.get(3)?).ok()? {
                LoObject::String(bytes, _) => bytes.clone(),
                LoObject::Stream(stream) => stream.get_plain_content().ok()?,
                _ => return None,
            };
            Some(ImageColorSpace::Indexed { base, lookup })
        }
        _ => None,
    }
}

fn image_stream_to_data_uri(doc: &LoDocument, stream: &lopdf::Stream) -> Option<String> {
    let filters = stream.filters().unwrap_or_default();
    if filters.iter().any(|f| *f == b"DCTDecode") {
        return Some(data_uri("image/jpeg", stream.content.as_slice()));
    }

    let plain = stream.get_plain_content().ok()?;
    if let Some(uri) = raw_image_data_to_png_uri(doc, stream, &plain) {
        return Some(uri);
    }

    match image::guess_format(&plain).ok()? {
        image::ImageFormat::Png => Some(data_uri("image/png", &plain)),
        image::ImageFormat::Jpeg => Some(data_uri("image/jpeg", &plain)),
        _ => None,
    }
}

fn raw_image_data_to_png_uri(
    doc: &LoDocument,
    stream: &lopdf::Stream,
    plain: &[u8],
) -> Option<String> {
    let dim = |key: &[u8]| {
        stream
            .dict
            .get(key)
            .ok()
            .and_then(|o| o.as_i64().ok())
            .and_then(|v| u32::try_from(v).ok())
    };
    let width = dim(b"Width")?;
    let height = dim(b"Height")?;
    let bpc = stream
        .dict
        .get(b"BitsPerComponent")
        .ok()
        .and_then(obj_to_f32)
        .unwrap_or(8.0);
    if (bpc - 8.0).abs() > 0.01 {
        return None;
    }

    let color_space = match stream.dict.get(b"ColorSpace") {
        Ok(obj) => parse_image_color_space(doc, obj)?,
        Err(_) => ImageColorSpace::Direct(DirectColor::Gray),
    };
    let pixels = (width as usize).saturating_mul(height as usize);
    let expected = match &color_space {
        ImageColorSpace::Direct(mode) => pixels.saturating_mul(mode.channels()),
        ImageColorSpace::Indexed { .. } => pixels,
    };
    if plain.len() < expected {
        return None;
    }

    let mut rgba = Vec::with_capacity(pixels * 4);
    let mut src = 0usize;
    for _ in 0..pixels {
        let (r, g, b) = match &color_space {
            ImageColorSpace::Direct(mode) => {
                let channels = mode.channels();
                let rgb = mode.rgb_from_bytes(plain.get(src..src + channels)?)?;
                src += channels;
                rgb
            }
            ImageColorSpace::Indexed { base, lookup } => {
                let offset = (*plain.get(src)? as usize).saturating_mul(base.channels());
                src += 1;
                base.rgb_from_bytes(lookup.get(offset..offset + base.channels())?)?
            }
        };
        rgba.extend_from_slice(&[r, g, b, 255]);
    }

    let mut png = Vec::new();
    PngEncoder::new(&mut png)
        .write_image(&rgba, width, height, ColorType::Rgba8.into())
        .ok()?;
    Some(data_uri("image/png", &png))
}

fn parse_matrix_object(obj: &LoObject) -> Option<Matrix> {
    let arr = obj.as_array().ok()?;
    if arr.len() < 6 {
        return None;
    }
    Some(Matrix::from_operands(
        obj_to_f32(&arr[0])?,
        obj_to_f32(&arr[1])?,
        obj_to_f32(&arr[2])?,
        obj_to_f32(&arr[3])?,
        obj_to_f32(&arr[4])?,
        obj_to_f32(&arr[5])?,
    ))
}

fn resolve_object<'a>(
    doc: &'a LoDocument,
    mut obj: &'a LoObject,
) -> Result<&'a LoObject, SlideGuardError> {
    // Bounded so reference cycles cannot spin forever.
    for _ in 0..32 {
        match obj {
            LoObject::Reference(id) => obj = doc.get_object(*id)?,
            _ => return Ok(obj),
        }
    }
    Err(SlideGuardError::DocumentOpen(
        "reference chain too deep".to_string(),
    ))
}

fn resolve_dict(doc: &LoDocument, obj: &LoObject) -> Result<LoDictionary, SlideGuardError> {
    match resolve_object(doc, obj)? {
        LoObject::Dictionary(d) => Ok(d.clone()),
        _ => Ok(LoDictionary::new()),
    }
}

fn color_from_operands(op: &Operation) -> Option<Color> {
    let values: Vec<f32> = op.operands.iter().filter_map(obj_to_f32).collect();
    match values.as_slice() {
        [gray] => Some(Color::gray(*gray)),
        [r, g, b] => Some(Color::rgb(*r, *g, *b)),
        [c, m, y, k] => Some(Color::cmyk(*c, *m, *y, *k)),
        _ => None,
    }
}

fn op_name(op: &Operation, idx: usize) -> Option<String> {
    let name = op.operands.get(idx)?.as_name().ok()?;
    Some(name_bytes_to_string(name))
}

fn op_f32(op: &Operation, idx: usize) -> Option<f32> {
    obj_to_f32(op.operands.get(idx)?)
}

fn op_i64(op: &Operation, idx: usize) -> Option<i64> {
    op.operands.get(idx)?.as_i64().ok()
}

fn op_f32_2(op: &Operation) -> Option<[f32; 2]> {
    Some([op_f32(op, 0)?, op_f32(op, 1)?])
}

fn op_f32_4(op: &Operation) -> Option<[f32; 4]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
    ])
}

fn op_f32_6(op: &Operation) -> Option<[f32; 6]> {
    Some([
        op_f32(op, 0)?,
        op_f32(op, 1)?,
        op_f32(op, 2)?,
        op_f32(op, 3)?,
        op_f32(op, 4)?,
        op_f32(op, 5)?,
    ])
}

fn obj_to_f32(obj: &LoObject) -> Option<f32> {
    if let Ok(v) = obj.as_float() {
        return Some(v);
    }
    obj.as_i64().ok().map(|v| v as f32)
}

fn name_bytes_to_string(name: &[u8]) -> String {
    String::from_utf8_lossy(name).to_string()
}

fn normalize_pdf_font_name(name: &str) -> String {
    let trimmed = name.trim().trim_start_matches('/');
    if let Some((prefix, rest)) = trimmed.split_once('+') {
        if prefix.len() == 6 && prefix.chars().all(|c| c.is_ascii_uppercase()) {
            return rest.to_string();
        }
    }
    trimmed.to_string()
}

fn parse_to_unicode_cmap(doc: &LoDocument, font_dict: &LoDictionary) -> HashMap<u16, String> {
    let Some(bytes) = font_dict
        .get(b"ToUnicode")
        .ok()
        .and_then(|obj| resolve_object(doc, obj).ok())
        .and_then(|obj| obj.as_stream().ok())
        .and_then(|stream| stream.get_plain_content().ok())
    else {
        return HashMap::new();
    };
    parse_to_unicode_text(&String::from_utf8_lossy(&bytes))
}

fn parse_to_unicode_text(text: &str) -> HashMap<u16, String> {
    let mut map = HashMap::new();
    let mut in_bfchar = false;
    let mut in_bfrange = false;
    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.ends_with("beginbfchar") {
            in_bfchar = true;
            continue;
        }
        if line.ends_with("endbfchar") {
            in_bfchar = false;
            continue;
        }
        if line.ends_with("beginbfrange") {
            in_bfrange = true;
            continue;
        }
        if line.ends_with("endbfrange") {
            in_bfrange = false;
            continue;
        }
        let tokens = extract_hex_tokens(line);
        if in_bfchar && tokens.len() >= 2 {
            if let Some(src) = hex_bytes_to_code(&tokens[0]) {
                map.insert(src, hex_bytes_to_unicode(&tokens[1]));
            }
        } else if in_bfrange && tokens.len() >= 3 {
            let (Some(start), Some(end)) =
                (hex_bytes_to_code(&tokens[0]), hex_bytes_to_code(&tokens[1]))
            else {
                continue;
            };
            if start > end {
                continue;
            }
            if line.contains('[') {
                for (idx, token) in tokens.iter().skip(2).enumerate() {
                    let code = start.saturating_add(idx as u16);
                    if code > end {
                        break;
                    }
                    map.insert(code, hex_bytes_to_unicode(token));
                }
            } else {
                let base: Vec<u16> = tokens[2]
                    .chunks_exact(2)
                    .map(|c| u16::from_be_bytes([c[0], c[1]]))
                    .collect();
                let Some((last, prefix)) = base.split_last() else {
                    continue;
                };
                for code in start..=end {
                    let mut units = prefix.to_vec();
                    units.push(last.saturating_add(code - start));
                    map.insert(code, String::from_utf16_lossy(&units));
                }
            }
        }
    }
    map
}

fn extract_hex_tokens(line: &str) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut rest = line;
    while let Some(start) = rest.find('<') {
        let after = &rest[start + 1..];
        let Some(end) = after.find('>') else {
            break;
        };
        if let Some(decoded) = parse_hex(&after[..end]) {
            out.push(decoded);
        }
        rest = &after[end + 1..];
    }
    out
}

fn parse_hex(token: &str) -> Option<Vec<u8>> {
    let mut nibbles = Vec::new();
    for ch in token.chars().filter(|c| !c.is_whitespace()) {
        nibbles.push(ch.to_digit(16)? as u8);
    }
    if nibbles.len() % 2 != 0 {
        nibbles.push(0);
    }
    Some(
        nibbles
            .chunks_exact(2)
            .map(|pair| (pair[0] << 4) | pair[1])
            .collect(),
    )
}

fn hex_bytes_to_code(bytes: &[u8]) -> Option<u16> {
    match bytes {
        [single] => Some(*single as u16),
        [hi, lo] => Some(u16::from_be_bytes([*hi, *lo])),
        _ => None,
    }
}

fn hex_bytes_to_unicode(bytes: &[u8]) -> String {
    if bytes.len() % 2 == 0 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect();
        return String::from_utf16_lossy(&units);
    }
    String::from_utf8_lossy(bytes).to_string()
}

fn data_uri(mime: &str, data: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(data);
    format!("data:{mime};base64,{b64}")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use lopdf::{Stream as LoStream, dictionary};

    /// One page per entry: (content stream, width, height). Pages share a Helvetica F1.
    pub(crate) fn build_pdf(pages: &[(String, i64, i64)]) -> Vec<u8> {
        let mut doc = LoDocument::with_version("1.7");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let mut kids = Vec::new();
        for (content, width, height) in pages {
            let content_id = doc.add_object(LoStream::new(
                LoDictionary::new(),
                content.clone().into_bytes(),
            ));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), (*width).into(), (*height).into()],
            });
            kids.push(page_id.into());
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            LoObject::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        let mut out = Vec::new();
        doc.save_to(&mut out).expect("save pdf");
        out
    }

    fn parse_single(content: &str) -> ParsedPage {
        let bytes = build_pdf(&[(content.to_string(), 612, 792)]);
        let source = PdfSource::from_bytes(&bytes).expect("open");
        source
            .parse_page(0, &mut ParseCache::default())
            .expect("parse page")
    }

    #[test]
    fn text_runs_are_positioned_top_left() {
        let page = parse_single("BT /F1 20 Tf 72 700 Td (Hello) Tj ET");
        assert_eq!(page.text_runs.len(), 1);
        let run = &page.text_runs[0];
        assert_eq!(run.text, "Hello");
        assert!((run.x - 72.0).abs() < 0.01);
        assert!((run.baseline - 92.0).abs() < 0.01);
        assert!((run.font_size - 20.0).abs() < 0.01);
        assert!(run.width > 0.0);
        assert!(
            page.commands
                .iter()
                .any(|cmd| matches!(cmd, Command::DrawString { text, .. } if text == "Hello"))
        );
    }

    #[test]
    fn invisible_render_mode_is_extracted_but_not_drawn() {
        let page = parse_single("BT 3 Tr /F1 12 Tf 10 10 Td (ghost) Tj ET");
        assert_eq!(page.text_runs.len(), 1);
        assert!(
            !page
                .commands
                .iter()
                .any(|cmd| matches!(cmd, Command::DrawString { .. }))
        );
    }

    #[test]
    fn cm_composes_new_matrix_before_current() {
        // Scale by 2, then translate by (10, 10) in the scaled space: origin lands at (20, 20).
        let page = parse_single("q 2 0 0 2 0 0 cm 1 0 0 1 10 10 cm 0 0 m 5 0 l S Q");
        let Some(Command::MoveTo { x, y }) = page
            .commands
            .iter()
            .find(|cmd| matches!(cmd, Command::MoveTo { .. }))
        else {
            panic!("no MoveTo");
        };
        assert!((x.to_f32() - 20.0).abs() < 0.01);
        assert!((y.to_f32() - (792.0 - 20.0)).abs() < 0.01);
    }

    #[test]
    fn quote_operator_moves_to_next_line() {
        let page = parse_single("BT /F1 10 Tf 14 TL 50 700 Td (one) Tj (two) ' ET");
        assert_eq!(page.text_runs.len(), 2);
        let delta = page.text_runs[1].baseline - page.text_runs[0].baseline;
        assert!((delta - 14.0).abs() < 0.01);
    }

    #[test]
    fn to_unicode_ranges_and_chars_are_parsed() {
        let cmap = "2 beginbfchar\n<0003> <0020>\n<0010> <3042>\nendbfchar\n1 beginbfrange\n<0020> <0022> <0041>\nendbfrange\n";
        let map = parse_to_unicode_text(cmap);
        assert_eq!(map.get(&0x0003).map(String::as_str), Some(" "));
        assert_eq!(map.get(&0x0010).map(String::as_str), Some("あ"));
        assert_eq!(map.get(&0x0021).map(String::as_str), Some("B"));
    }

    /// A single page under one Pages node, with extra entries on either level.
    fn page_tree(
        content: &str,
        page_entries: LoDictionary,
        tree_entries: LoDictionary,
    ) -> (LoDocument, ObjectId) {
        let mut doc = LoDocument::with_version("1.7");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });
        let content_id = doc.add_object(LoStream::new(
            LoDictionary::new(),
            content.as_bytes().to_vec(),
        ));
        let mut page = dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
        };
        page.extend(&page_entries);
        let page_id = doc.add_object(page);
        let mut tree = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        };
        tree.extend(&tree_entries);
        doc.objects.insert(pages_id, LoObject::Dictionary(tree));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        (doc, pages_id)
    }

    fn source_of(doc: LoDocument) -> PdfSource {
        let page_ids = doc.get_pages().into_values().collect();
        PdfSource { doc, page_ids }
    }

    fn media_box(x0: i64, y0: i64, x1: i64, y1: i64) -> LoObject {
        vec![x0.into(), y0.into(), x1.into(), y1.into()].into()
    }

    #[test]
    fn rotated_page_is_interpreted_in_display_orientation() {
        let (doc, _) = page_tree(
            "BT /F1 10 Tf 20 50 Td (Hi) Tj ET",
            dictionary! { "MediaBox" => media_box(0, 0, 200, 100), "Rotate" => 90 },
            LoDictionary::new(),
        );
        let source = source_of(doc);
        assert!(source.page_size(0).unwrap().approx_eq(Size::new(100.0, 200.0), 0.01));

        let page = source.parse_page(0, &mut ParseCache::default()).expect("parse");
        assert!(page.size.approx_eq(Size::new(100.0, 200.0), 0.01));
        let run = &page.text_runs[0];
        assert_eq!(run.text, "Hi");
        assert!((run.x - 50.0).abs() < 0.01, "x = {}", run.x);
        assert!((run.baseline - 20.0).abs() < 0.01, "baseline = {}", run.baseline);
    }

    #[test]
    fn rotation_and_media_box_are_inherited_from_the_page_tree() {
        let (doc, _) = page_tree(
            "BT /F1 10 Tf 20 50 Td (Hi) Tj ET",
            LoDictionary::new(),
            dictionary! { "MediaBox" => media_box(0, 0, 200, 100), "Rotate" => -90 },
        );
        let page = source_of(doc)
            .parse_page(0, &mut ParseCache::default())
            .expect("parse");
        assert!(page.size.approx_eq(Size::new(100.0, 200.0), 0.01));
        let run = &page.text_runs[0];
        assert!((run.x - 50.0).abs() < 0.01, "x = {}", run.x);
        assert!((run.baseline - 180.0).abs() < 0.01, "baseline = {}", run.baseline);
    }

    #[test]
    fn crop_box_is_clipped_to_media_box() {
        let (doc, _) = page_tree(
            "BT /F1 10 Tf 60 40 Td (Hi) Tj ET",
            dictionary! {
                "MediaBox" => media_box(0, 0, 200, 100),
                "CropBox" => media_box(50, -20, 250, 80),
            },
            LoDictionary::new(),
        );
        let page = source_of(doc)
            .parse_page(0, &mut ParseCache::default())
            .expect("parse");
        assert!(page.size.approx_eq(Size::new(150.0, 80.0), 0.01));
        let run = &page.text_runs[0];
        assert!((run.x - 10.0).abs() < 0.01, "x = {}", run.x);
        assert!((run.baseline - 40.0).abs() < 0.01, "baseline = {}", run.baseline);
    }

    #[test]
    fn disjoint_crop_box_falls_back_to_media_box() {
        let (doc, _) = page_tree(
            "",
            dictionary! {
                "MediaBox" => media_box(0, 0, 200, 100),
                "CropBox" => media_box(300, 300, 400, 400),
            },
            LoDictionary::new(),
        );
        assert!(source_of(doc).page_size(0).unwrap().approx_eq(Size::new(200.0, 100.0), 0.01));
    }

    #[test]
    fn parent_cycle_is_a_document_error() {
        let (mut doc, pages_id) = page_tree(
            "BT /F1 10 Tf 20 50 Td (Hi) Tj ET",
            LoDictionary::new(),
            LoDictionary::new(),
        );
        doc.get_object_mut(pages_id)
            .and_then(LoObject::as_dict_mut)
            .expect("pages node")
            .set("Parent", pages_id);
        let source = source_of(doc);
        assert_eq!(source.page_count(), 1);

        let err = source.page_size(0).err().expect("cycle");
        assert!(matches!(err, SlideGuardError::DocumentOpen(_)));
        let err = source
            .parse_page(0, &mut ParseCache::default())
            .err()
            .expect("cycle");
        assert!(matches!(err, SlideGuardError::DocumentOpen(_)));
    }

    #[test]
    fn images_on_rotated_pages_keep_their_placement() {
        let (mut doc, _) = page_tree(
            "q 40 0 0 20 10 30 cm /Im0 Do Q",
            dictionary! { "MediaBox" => media_box(0, 0, 200, 100), "Rotate" => 90 },
            LoDictionary::new(),
        );
        let image_id = doc.add_object(LoStream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 1,
                "Height" => 1,
                "ColorSpace" => "DeviceRGB",
                "BitsPerComponent" => 8,
            },
            vec![255, 0, 0],
        ));
        let page_id = *doc.get_pages().get(&1).expect("page");
        doc.get_object_mut(page_id)
            .and_then(LoObject::as_dict_mut)
            .expect("page dict")
            .set(
                "Resources",
                dictionary! { "XObject" => dictionary! { "Im0" => image_id } },
            );

        let page = source_of(doc)
            .parse_page(0, &mut ParseCache::default())
            .expect("parse");
        let Some(Command::DrawImageMatrix { matrix, .. }) = page
            .commands
            .iter()
            .find(|cmd| matches!(cmd, Command::DrawImageMatrix { .. }))
        else {
            panic!("image was dropped");
        };
        let expected = [0.0, -40.0, 20.0, 0.0, 30.0, 190.0];
        for (got, want) in matrix.iter().zip(expected) {
            assert!((got - want).abs() < 0.01, "{matrix:?}");
        }
    }

    #[test]
    fn rotate_values_snap_to_quarter_turns() {
        assert_eq!(quarter_turns(0.0), 0);
        assert_eq!(quarter_turns(-90.0), 270);
        assert_eq!(quarter_turns(450.0), 90);
        assert_eq!(quarter_turns(540.0), 180);
    }

    #[test]
    fn garbage_is_rejected_as_document_open() {
        let err = PdfSource::from_bytes(b"%PDF-1.4 nothing here").err().expect("error");
        assert!(matches!(err, SlideGuardError::DocumentOpen(_)));
    }

    #[test]
    fn winansi_bytes_decode_to_unicode() {
        assert_eq!(decode_single_byte_text(b"caf\xe9 \x93q\x94"), "café \u{201C}q\u{201D}");
    }
}
