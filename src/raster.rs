use crate::canvas::Command;
use crate::error::SlideGuardError;
use crate::font::FontRegistry;
use crate::types::{Color, Pt, Size};
use base64::Engine;
use rustybuzz::{Direction as HbDirection, Face as HbFace, UnicodeBuffer};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use tiny_skia::{
    FillRule, FilterQuality, LineCap, LineJoin, Mask, Paint, Path, PathBuilder, Pixmap,
    PixmapPaint, Stroke, StrokeDash, Transform,
};
use ttf_parser::{GlyphId, OutlineBuilder};

#[derive(Clone)]
struct RasterState {
    fill_color: Color,
    stroke_color: Color,
    line_width: Pt,
    line_cap: u8,
    line_join: u8,
    miter_limit: Pt,
    dash_pattern: Vec<Pt>,
    dash_phase: Pt,
    fill_opacity: f32,
    stroke_opacity: f32,
    font_name: String,
    font_size: Pt,
    clip_mask: Option<Mask>,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            fill_color: Color::BLACK,
            stroke_color: Color::BLACK,
            line_width: Pt::from_f32(1.0),
            line_cap: 0,
            line_join: 0,
            miter_limit: Pt::from_f32(10.0),
            dash_pattern: Vec::new(),
            dash_phase: Pt::ZERO,
            fill_opacity: 1.0,
            stroke_opacity: 1.0,
            font_name: "Helvetica".to_string(),
            font_size: Pt::from_f32(12.0),
            clip_mask: None,
        }
    }
}

/// Raster size in pixels for a page of `size` points at `zoom` pixels per point.
pub(crate) fn pixel_size(size: Size, zoom: f32) -> Result<(u32, u32), SlideGuardError> {
    let to_px = |pt: Pt| -> Result<u32, SlideGuardError> {
        let px = (pt.to_f32() as f64 * zoom as f64).round();
        if !px.is_finite() || px < 1.0 || px > u32::MAX as f64 {
            return Err(SlideGuardError::Render(format!(
                "invalid raster dimension for {:.2}pt at zoom {zoom}",
                pt.to_f32()
            )));
        }
        Ok(px as u32)
    };
    Ok((to_px(size.width)?, to_px(size.height)?))
}

/// A white page of the right pixel size, used when a page cannot be interpreted.
pub(crate) fn blank_page(size: Size, zoom: f32) -> Result<Pixmap, SlideGuardError> {
    let (width_px, height_px) = pixel_size(size, zoom)?;
    let mut pixmap = Pixmap::new(width_px, height_px).ok_or_else(|| {
        SlideGuardError::Render(format!(
            "cannot allocate raster surface {width_px}x{height_px}"
        ))
    })?;
    pixmap.fill(tiny_skia::Color::WHITE);
    Ok(pixmap)
}

/// Paints `commands` onto a white page at `zoom` pixels per point.
///
/// Fonts named by the commands are looked up in `fonts` in order, then among
/// installed system fonts.
pub(crate) fn render_page(
    commands: &[Command],
    size: Size,
    zoom: f32,
    fonts: &[&FontRegistry],
) -> Result<Pixmap, SlideGuardError> {
    let page_height_pt = size.height.to_f32();
    let mut renderer = Renderer {
        pixmap: blank_page(size, zoom)?,
        page_height_pt,
        base_transform: Transform::from_row(zoom, 0.0, 0.0, -zoom, 0.0, page_height_pt * zoom),
        fonts,
        image_cache: HashMap::new(),
        state: RasterState::default(),
        stack: Vec::new(),
        path_builder: PathBuilder::new(),
        has_path: false,
    };
    for cmd in commands {
        renderer.apply(cmd);
    }
    Ok(renderer.pixmap)
}

/// Flattens a rendered page onto white and drops alpha.
pub(crate) fn pixmap_to_rgb(pixmap: &Pixmap) -> image::RgbImage {
    let mut out = image::RgbImage::new(pixmap.width(), pixmap.height());
    for (src, dst) in pixmap.pixels().iter().zip(out.pixels_mut()) {
        let color = src.demultiply();
        let alpha = color.alpha() as u32;
        let over_white = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha) + 127) / 255) as u8;
        dst.0 = [
            over_white(color.red()),
            over_white(color.green()),
            over_white(color.blue()),
        ];
    }
    out
}

struct Renderer<'a> {
    pixmap: Pixmap,
    page_height_pt: f32,
    base_transform: Transform,
    fonts: &'a [&'a FontRegistry],
    image_cache: HashMap<String, Option<Pixmap>>,
    state: RasterState,
    stack: Vec<RasterState>,
    path_builder: PathBuilder,
    has_path: bool,
}

impl Renderer<'_> {
    fn apply(&mut self, cmd: &Command) {
        let page_h = self.page_height_pt;
        match cmd {
            Command::SaveState => self.stack.push(self.state.clone()),
            Command::RestoreState => {
                if let Some(restored) = self.stack.pop() {
                    self.state = restored;
                }
            }
            Command::SetFillColor(color) => self.state.fill_color = *color,
            Command::SetStrokeColor(color) => self.state.stroke_color = *color,
            Command::SetLineWidth(width) => self.state.line_width = width.max(Pt::ZERO),
            Command::SetLineCap(cap) => self.state.line_cap = *cap,
            Command::SetLineJoin(join) => self.state.line_join = *join,
            Command::SetMiterLimit(limit) => self.state.miter_limit = limit.max(Pt::ZERO),
            Command::SetDash { pattern, phase } => {
                self.state.dash_pattern = pattern.clone();
                self.state.dash_phase = *phase;
            }
            Command::SetOpacity { fill, stroke } => {
                self.state.fill_opacity = fill.clamp(0.0, 1.0);
                self.state.stroke_opacity = stroke.clamp(0.0, 1.0);
            }
            Command::SetFontName(name) => self.state.font_name = name.clone(),
            Command::SetFontSize(size) => self.state.font_size = *size,
            Command::ClipPath { evenodd } => {
                if let Some(path) = self.take_path() {
                    self.apply_clip_path(&path, fill_rule(*evenodd));
                }
            }
            Command::MoveTo { x, y } => {
                self.path_builder.move_to(x.to_f32(), page_h - y.to_f32());
                self.has_path = true;
            }
            Command::LineTo { x, y } => {
                self.path_builder.line_to(x.to_f32(), page_h - y.to_f32());
                self.has_path = true;
            }
            Command::CurveTo {
                x1,
                y1,
                x2,
                y2,
                x,
                y,
            } => {
                self.path_builder.cubic_to(
                    x1.to_f32(),
                    page_h - y1.to_f32(),
                    x2.to_f32(),
                    page_h - y2.to_f32(),
                    x.to_f32(),
                    page_h - y.to_f32(),
                );
                self.has_path = true;
            }
            Command::ClosePath => {
                if self.has_path {
                    self.path_builder.close();
                }
            }
            Command::EndPath => {
                let _ = self.take_path();
            }
            Command::Fill => self.paint_path(Some(FillRule::Winding), false),
            Command::FillEvenOdd => self.paint_path(Some(FillRule::EvenOdd), false),
            Command::Stroke => self.paint_path(None, true),
            Command::FillStroke => self.paint_path(Some(FillRule::Winding), true),
            Command::FillStrokeEvenOdd => self.paint_path(Some(FillRule::EvenOdd), true),
            Command::DrawString { x, y, text } => {
                self.draw_string(x.to_f32(), y.to_f32(), text);
            }
            Command::DrawGlyphRun {
                x,
                y,
                glyph_ids,
                advances,
                m00,
                m01,
                m10,
                m11,
            } => {
                let run = GlyphRun {
                    x: x.to_f32(),
                    y: y.to_f32(),
                    glyph_ids,
                    advances,
                    matrix: [*m00, *m01, *m10, *m11],
                };
                self.draw_glyph_run(&run);
            }
            Command::DrawImage {
                x,
                y,
                width,
                height,
                resource_id,
            } => {
                self.draw_image(
                    x.to_f32(),
                    y.to_f32(),
                    width.to_f32(),
                    height.to_f32(),
                    resource_id,
                );
            }
            Command::DrawImageMatrix {
                matrix,
                resource_id,
            } => {
                let [a, b, c, d, e, f] = *matrix;
                self.paint_image(resource_id, |src_w, src_h| {
                    Transform::from_row(a, b, c, d, e, f).pre_concat(Transform::from_row(
                        1.0 / src_w,
                        0.0,
                        0.0,
                        -1.0 / src_h,
                        0.0,
                        1.0,
                    ))
                });
            }
        }
    }

    fn take_path(&mut self) -> Option<Path> {
        if !self.has_path {
            return None;
        }
        self.has_path = false;
        std::mem::replace(&mut self.path_builder, PathBuilder::new()).finish()
    }

    fn paint_path(&mut self, fill: Option<FillRule>, stroke: bool) {
        let Some(path) = self.take_path() else {
            return;
        };
        let state = &self.state;
        if let Some(rule) = fill {
            let paint = fill_paint(state.fill_color, state.fill_opacity);
            self.pixmap.fill_path(
                &path,
                &paint,
                rule,
                self.base_transform,
                state.clip_mask.as_ref(),
            );
        }
        if stroke {
            let paint = fill_paint(state.stroke_color, state.stroke_opacity);
            self.pixmap.stroke_path(
                &path,
                &paint,
                &build_stroke(state),
                self.base_transform,
                state.clip_mask.as_ref(),
            );
        }
    }

    fn apply_clip_path(&mut self, path: &Path, rule: FillRule) {
        if let Some(mask) = self.state.clip_mask.as_mut() {
            mask.intersect_path(path, rule, true, self.base_transform);
            return;
        }
        let Some(mut mask) = Mask::new(self.pixmap.width(), self.pixmap.height()) else {
            return;
        };
        mask.fill_path(path, rule, true, self.base_transform);
        self.state.clip_mask = Some(mask);
    }

    // Registered fonts by exact name, then a system font for the base name.
    fn font_candidates(&self) -> Vec<Arc<Vec<u8>>> {
        let mut out = Vec::new();
        for registry in self.fonts {
            if let Some(font) = registry.resolve(&self.state.font_name) {
                out.push(font.data.clone());
                break;
            }
        }
        let base_name = self
            .state
            .font_name
            .split_once('#')
            .map(|(base, _)| base)
            .unwrap_or(&self.state.font_name);
        if let Some(system) = resolve_system_font_bytes(base_name) {
            out.push(system);
        }
        out
    }

    fn draw_string(&mut self, x: f32, y: f32, text: &str) {
        let font_size = self.state.font_size.to_f32();
        if font_size <= 0.0 || text.trim().is_empty() {
            return;
        }
        let baseline_y = self.page_height_pt - y - font_size;
        let paint = fill_paint(self.state.fill_color, self.state.fill_opacity);

        for font_data in self.font_candidates() {
            let Ok(face) = ttf_parser::Face::parse(font_data.as_slice(), 0) else {
                continue;
            };
            let placements = layout_text_glyphs(font_data.as_slice(), text, font_size, x, baseline_y);
            let mut drawn = 0usize;
            for placement in placements {
                let mut builder =
                    GlyphPathBuilder::new(placement.origin_x, placement.origin_y, placement.scale);
                if face
                    .outline_glyph(GlyphId(placement.glyph_id), &mut builder)
                    .is_none()
                {
                    continue;
                }
                let Some(path) = builder.finish() else {
                    continue;
                };
                self.pixmap.fill_path(
                    &path,
                    &paint,
                    FillRule::Winding,
                    self.base_transform,
                    self.state.clip_mask.as_ref(),
                );
                drawn += 1;
            }
            if drawn > 0 {
                return;
            }
        }
        log::debug!(
            "no usable font for '{}', text skipped in raster",
            self.state.font_name
        );
    }

    fn draw_glyph_run(&mut self, run: &GlyphRun<'_>) {
        let font_size = self.state.font_size.to_f32();
        if run.glyph_ids.is_empty() || font_size <= 0.0 {
            return;
        }
        // Glyph ids are only meaningful in the program they came from.
        let Some(font) = self
            .fonts
            .iter()
            .find_map(|registry| registry.resolve(&self.state.font_name))
        else {
            log::debug!("embedded font '{}' not registered", self.state.font_name);
            return;
        };
        let Ok(face) = ttf_parser::Face::parse(font.data.as_slice(), 0) else {
            return;
        };
        let scale = font_size / face.units_per_em().max(1) as f32;
        let paint = fill_paint(self.state.fill_color, self.state.fill_opacity);
        let [m00, m01, m10, m11] = run.matrix;

        let mut pen_x = run.x;
        let mut pen_y = self.page_height_pt - run.y;
        for (idx, gid) in run.glyph_ids.iter().enumerate() {
            if *gid != 0 {
                let mut builder = GlyphPathBuilder::new(0.0, 0.0, scale);
                if face.outline_glyph(GlyphId(*gid), &mut builder).is_some() {
                    if let Some(path) = builder.finish() {
                        let local = Transform::from_row(m00, m01, m10, m11, pen_x, pen_y);
                        self.pixmap.fill_path(
                            &path,
                            &paint,
                            FillRule::Winding,
                            self.base_transform.pre_concat(local),
                            self.state.clip_mask.as_ref(),
                        );
                    }
                }
            }
            let (adv_x, adv_y) = run
                .advances
                .get(idx)
                .map(|(dx, dy)| (dx.to_f32(), dy.to_f32()))
                .or_else(|| {
                    face.glyph_hor_advance(GlyphId(*gid)).map(|w| {
                        let adv = (w as f32) * scale;
                        (m00 * adv, m01 * adv)
                    })
                })
                .unwrap_or((font_size * 0.5, 0.0));
            if adv_x.is_finite() {
                pen_x += adv_x;
            }
            if adv_y.is_finite() {
                pen_y += adv_y;
            }
        }
    }

    fn draw_image(&mut self, x: f32, y: f32, width: f32, height: f32, resource_id: &str) {
        let top = self.page_height_pt - y;
        // Local y-flip so source row 0 lands at the visual top, matching /Im Do.
        self.paint_image(resource_id, |src_w, src_h| {
            Transform::from_row(width / src_w, 0.0, 0.0, -height / src_h, x, top)
        });
    }

    /// Draws a cached image; `placement` maps source pixels to bottom-left page points.
    fn paint_image(&mut self, resource_id: &str, placement: impl FnOnce(f32, f32) -> Transform) {
        let source = self
            .image_cache
            .entry(resource_id.to_string())
            .or_insert_with(|| load_image_pixmap(resource_id));
        let Some(image) = source.as_ref() else {
            return;
        };
        let src_w = image.width() as f32;
        let src_h = image.height() as f32;
        if src_w <= 0.0 || src_h <= 0.0 {
            return;
        }
        let mut paint = PixmapPaint::default();
        paint.quality = FilterQuality::Bilinear;
        paint.opacity = self.state.fill_opacity.clamp(0.0, 1.0);
        self.pixmap.draw_pixmap(
            0,
            0,
            image.as_ref(),
            &paint,
            self.base_transform.pre_concat(placement(src_w, src_h)),
            self.state.clip_mask.as_ref(),
        );
    }
}

struct GlyphRun<'a> {
    x: f32,
    y: f32,
    glyph_ids: &'a [u16],
    advances: &'a [(Pt, Pt)],
    matrix: [f32; 4],
}

#[derive(Clone, Copy)]
struct GlyphPlacement {
    glyph_id: u16,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

fn layout_text_glyphs(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    baseline_x: f32,
    baseline_y: f32,
) -> Vec<GlyphPlacement> {
    let Some(face) = HbFace::from_slice(font_data, 0) else {
        return layout_text_glyphs_unshaped(font_data, text, font_size, baseline_x, baseline_y);
    };
    let hb_units = face.units_per_em().max(1) as f32;
    let scale = font_size / hb_units;
    let mut buffer = UnicodeBuffer::new();
    buffer.set_direction(detect_direction(text));
    buffer.push_str(text);
    let output = rustybuzz::shape(&face, &[], buffer);
    let infos = output.glyph_infos();
    let positions = output.glyph_positions();
    if infos.is_empty() || infos.len() != positions.len() {
        return layout_text_glyphs_unshaped(font_data, text, font_size, baseline_x, baseline_y);
    }

    let mut out = Vec::with_capacity(infos.len());
    let mut pen_x = 0.0f32;
    let mut pen_y = 0.0f32;
    for (info, pos) in infos.iter().zip(positions.iter()) {
        let gid = info.glyph_id as u16;
        if gid != 0 {
            out.push(GlyphPlacement {
                glyph_id: gid,
                origin_x: baseline_x + pen_x + pos.x_offset as f32 * scale,
                origin_y: baseline_y + pen_y + pos.y_offset as f32 * scale,
                scale,
            });
        }
        pen_x += pos.x_advance as f32 * scale;
        pen_y += pos.y_advance as f32 * scale;
    }
    out
}

fn layout_text_glyphs_unshaped(
    font_data: &[u8],
    text: &str,
    font_size: f32,
    baseline_x: f32,
    baseline_y: f32,
) -> Vec<GlyphPlacement> {
    let Ok(face) = ttf_parser::Face::parse(font_data, 0) else {
        return Vec::new();
    };
    let units_per_em = face.units_per_em().max(1) as f32;
    let scale = font_size / units_per_em;

    let mut out = Vec::new();
    let mut pen_x = 0.0f32;
    for ch in text.chars() {
        let gid = face.glyph_index(ch).map(|id| id.0).unwrap_or(0);
        if gid == 0 {
            pen_x += font_size * 0.5;
            continue;
        }
        out.push(GlyphPlacement {
            glyph_id: gid,
            origin_x: baseline_x + pen_x,
            origin_y: baseline_y,
            scale,
        });
        let advance_units = face.glyph_hor_advance(GlyphId(gid)).unwrap_or(0) as f32;
        let adv = (advance_units / units_per_em) * font_size;
        pen_x += if adv > 0.0 { adv } else { font_size * 0.5 };
    }
    out
}

fn detect_direction(text: &str) -> HbDirection {
    let rtl = text.chars().any(|ch| {
        matches!(
            ch as u32,
            0x0590..=0x08FF | 0xFB1D..=0xFDFF | 0xFE70..=0xFEFF | 0x1EE00..=0x1EEFF
        )
    });
    if rtl {
        HbDirection::RightToLeft
    } else {
        HbDirection::LeftToRight
    }
}

static SYSTEM_FONT_CACHE: OnceLock<Mutex<HashMap<String, Option<Arc<Vec<u8>>>>>> = OnceLock::new();
static SYSTEM_FONT_FILES: OnceLock<HashMap<String, PathBuf>> = OnceLock::new();

fn resolve_system_font_bytes(font_name: &str) -> Option<Arc<Vec<u8>>> {
    let key = font_name.trim().to_ascii_lowercase();
    let cache = SYSTEM_FONT_CACHE.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = cache.lock() {
        if let Some(entry) = guard.get(&key) {
            return entry.clone();
        }
    }

    let files = SYSTEM_FONT_FILES.get_or_init(index_system_font_files);
    let loaded = system_font_file_candidates(font_name)
        .into_iter()
        .filter_map(|candidate| files.get(&candidate.to_ascii_lowercase()))
        .find_map(|path| {
            let bytes = std::fs::read(path).ok()?;
            ttf_parser::Face::parse(&bytes, 0).ok()?;
            Some(Arc::new(bytes))
        });
    if let Ok(mut guard) = cache.lock() {
        guard.insert(key, loaded.clone());
    }
    loaded
}

fn system_font_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "windows")]
    {
        dirs.push(PathBuf::from(r"C:\Windows\Fonts"));
        if let Ok(windir) = std::env::var("WINDIR") {
            dirs.push(PathBuf::from(windir).join("Fonts"));
        }
    }

    #[cfg(target_os = "linux")]
    {
        dirs.push(PathBuf::from("/usr/share/fonts"));
        dirs.push(PathBuf::from("/usr/local/share/fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(&home).join(".fonts"));
            dirs.push(PathBuf::from(home).join(".local/share/fonts"));
        }
    }

    #[cfg(target_os = "macos")]
    {
        dirs.push(PathBuf::from("/System/Library/Fonts"));
        dirs.push(PathBuf::from("/Library/Fonts"));
        if let Ok(home) = std::env::var("HOME") {
            dirs.push(PathBuf::from(home).join("Library/Fonts"));
        }
    }

    dirs
}

// Lowercased file name -> first path found. Font trees nest a few levels deep.
fn index_system_font_files() -> HashMap<String, PathBuf> {
    const MAX_DEPTH: usize = 5;
    let mut out = HashMap::new();
    let mut pending: Vec<(PathBuf, usize)> =
        system_font_dirs().into_iter().map(|dir| (dir, 0)).collect();
    while let Some((dir, depth)) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                if depth < MAX_DEPTH {
                    pending.push((path, depth + 1));
                }
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                out.entry(name.to_ascii_lowercase()).or_insert(path);
            }
        }
    }
    out
}

fn system_font_file_candidates(font_name: &str) -> Vec<&'static str> {
    let lower = font_name.to_ascii_lowercase();
    let compact: String = lower
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect();
    let bold = compact.contains("bold") || compact.contains("black") || compact.ends_with("bd");
    let italic = compact.contains("italic") || compact.contains("oblique");

    let sans: [&[&str]; 4] = [
        &["arial.ttf", "LiberationSans-Regular.ttf", "DejaVuSans.ttf"],
        &["arialbd.ttf", "LiberationSans-Bold.ttf", "DejaVuSans-Bold.ttf"],
        &["ariali.ttf", "LiberationSans-Italic.ttf", "DejaVuSans-Oblique.ttf"],
        &[
            "arialbi.ttf",
            "LiberationSans-BoldItalic.ttf",
            "DejaVuSans-BoldOblique.ttf",
        ],
    ];
    let serif: [&[&str]; 4] = [
        &["times.ttf", "LiberationSerif-Regular.ttf", "DejaVuSerif.ttf"],
        &["timesbd.ttf", "LiberationSerif-Bold.ttf", "DejaVuSerif-Bold.ttf"],
        &["timesi.ttf", "LiberationSerif-Italic.ttf", "DejaVuSerif-Italic.ttf"],
        &[
            "timesbi.ttf",
            "LiberationSerif-BoldItalic.ttf",
            "DejaVuSerif-BoldItalic.ttf",
        ],
    ];
    let mono: [&[&str]; 4] = [
        &["cour.ttf", "LiberationMono-Regular.ttf", "DejaVuSansMono.ttf"],
        &["courbd.ttf", "LiberationMono-Bold.ttf", "DejaVuSansMono-Bold.ttf"],
        &["couri.ttf", "LiberationMono-Italic.ttf", "DejaVuSansMono-Oblique.ttf"],
        &[
            "courbi.ttf",
            "LiberationMono-BoldItalic.ttf",
            "DejaVuSansMono-BoldOblique.ttf",
        ],
    ];
    let gothic: [&[&str]; 4] = [
        &[
            "ipaexg.ttf",
            "ipag.ttf",
            "NotoSansCJK-Regular.ttc",
            "NotoSansCJKjp-Regular.otf",
            "msgothic.ttc",
        ],
        &["NotoSansCJK-Bold.ttc", "NotoSansCJKjp-Bold.otf"],
        &[],
        &[],
    ];
    let mincho: [&[&str]; 4] = [
        &[
            "ipaexm.ttf",
            "ipam.ttf",
            "NotoSerifCJK-Regular.ttc",
            "msmincho.ttc",
        ],
        &["NotoSerifCJK-Bold.ttc"],
        &[],
        &[],
    ];

    let family = if compact.contains("courier") || compact.contains("mono") {
        mono
    } else if compact.contains("mincho") || compact.contains("ming") || compact.contains("serifcjk")
    {
        mincho
    } else if compact.contains("gothic") || compact.contains("cjk") || compact.contains("meiryo") {
        gothic
    } else if compact.contains("times") || compact.contains("serif") || compact.contains("roman") {
        serif
    } else {
        sans
    };

    let order = match (bold, italic) {
        (false, false) => [0, 1, 2, 3],
        (true, false) => [1, 0, 3, 2],
        (false, true) => [2, 0, 3, 1],
        (true, true) => [3, 1, 2, 0],
    };
    let mut out: Vec<&'static str> = Vec::new();
    for idx in order {
        out.extend(family[idx].iter().copied());
    }
    // Anything legible beats dropping the text.
    out.extend(sans[0].iter().copied());
    out.extend(gothic[0].iter().copied());
    out.dedup();
    out
}

struct GlyphPathBuilder {
    builder: PathBuilder,
    origin_x: f32,
    origin_y: f32,
    scale: f32,
}

impl GlyphPathBuilder {
    fn new(origin_x: f32, origin_y: f32, scale: f32) -> Self {
        Self {
            builder: PathBuilder::new(),
            origin_x,
            origin_y,
            scale,
        }
    }

    fn finish(self) -> Option<Path> {
        self.builder.finish()
    }

    fn map(&self, x: f32, y: f32) -> (f32, f32) {
        (self.origin_x + x * self.scale, self.origin_y + y * self.scale)
    }
}

impl OutlineBuilder for GlyphPathBuilder {
    fn move_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.move_to(x, y);
    }

    fn line_to(&mut self, x: f32, y: f32) {
        let (x, y) = self.map(x, y);
        self.builder.line_to(x, y);
    }

    fn quad_to(&mut self, x1: f32, y1: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x, y) = self.map(x, y);
        self.builder.quad_to(x1, y1, x, y);
    }

    fn curve_to(&mut self, x1: f32, y1: f32, x2: f32, y2: f32, x: f32, y: f32) {
        let (x1, y1) = self.map(x1, y1);
        let (x2, y2) = self.map(x2, y2);
        let (x, y) = self.map(x, y);
        self.builder.cubic_to(x1, y1, x2, y2, x, y);
    }

    fn close(&mut self) {
        self.builder.close();
    }
}

fn fill_rule(evenodd: bool) -> FillRule {
    if evenodd {
        FillRule::EvenOdd
    } else {
        FillRule::Winding
    }
}

fn build_stroke(state: &RasterState) -> Stroke {
    let mut stroke = Stroke::default();
    stroke.width = state.line_width.to_f32().max(0.0);
    stroke.miter_limit = state.miter_limit.to_f32().max(0.0);
    stroke.line_cap = match state.line_cap {
        1 => LineCap::Round,
        2 => LineCap::Square,
        _ => LineCap::Butt,
    };
    stroke.line_join = match state.line_join {
        1 => LineJoin::Round,
        2 => LineJoin::Bevel,
        _ => LineJoin::Miter,
    };

    if !state.dash_pattern.is_empty() {
        let mut pattern: Vec<f32> = state
            .dash_pattern
            .iter()
            .map(|p| p.to_f32().abs())
            .collect();
        if pattern.len() % 2 == 1 {
            let copy = pattern.clone();
            pattern.extend(copy);
        }
        stroke.dash = StrokeDash::new(pattern, state.dash_phase.to_f32());
    }

    stroke
}

fn fill_paint(color: Color, opacity: f32) -> Paint<'static> {
    let mut paint = Paint::default();
    paint.set_color(to_sk_color(color, opacity));
    paint.anti_alias = true;
    paint
}

fn to_sk_color(color: Color, opacity: f32) -> tiny_skia::Color {
    tiny_skia::Color::from_rgba(
        color.r.clamp(0.0, 1.0),
        color.g.clamp(0.0, 1.0),
        color.b.clamp(0.0, 1.0),
        opacity.clamp(0.0, 1.0),
    )
    .unwrap_or(tiny_skia::Color::BLACK)
}

fn load_image_pixmap(source: &str) -> Option<Pixmap> {
    let (mime, data) = parse_data_uri(source)?;
    decode_image_to_pixmap(&data, &mime)
}

fn decode_image_to_pixmap(data: &[u8], mime: &str) -> Option<Pixmap> {
    let format = if mime.contains("png") {
        image::ImageFormat::Png
    } else if mime.contains("jpeg") || mime.contains("jpg") {
        image::ImageFormat::Jpeg
    } else {
        image::guess_format(data).ok()?
    };
    let decoded = image::load_from_memory_with_format(data, format).ok()?;
    let rgba = decoded.to_rgba8();
    let (width, height) = rgba.dimensions();
    let mut pixmap = Pixmap::new(width, height)?;
    for (src_px, dst_px) in rgba
        .as_raw()
        .chunks_exact(4)
        .zip(pixmap.data_mut().chunks_exact_mut(4))
    {
        let a = src_px[3];
        dst_px[0] = premul_u8(src_px[0], a);
        dst_px[1] = premul_u8(src_px[1], a);
        dst_px[2] = premul_u8(src_px[2], a);
        dst_px[3] = a;
    }
    Some(pixmap)
}

fn premul_u8(channel: u8, alpha: u8) -> u8 {
    let prod = (channel as u16) * (alpha as u16) + 127;
    ((prod + (prod >> 8)) >> 8) as u8
}

fn parse_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (header, payload) = rest.split_once(',')?;
    let mime = header
        .split(';')
        .next()
        .filter(|v| !v.is_empty())
        .unwrap_or("application/octet-stream")
        .to_string();
    let data = if header.contains(";base64") {
        base64::engine::general_purpose::STANDARD
            .decode(payload)
            .ok()?
    } else {
        payload.as_bytes().to_vec()
    };
    Some((mime, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;

    fn has_non_white_pixel(img: &image::RgbImage) -> bool {
        img.pixels().any(|p| p.0 != [255, 255, 255])
    }

    fn square(x: f32, y: f32, side: f32) -> Vec<Command> {
        vec![
            Command::MoveTo {
                x: Pt::from_f32(x),
                y: Pt::from_f32(y),
            },
            Command::LineTo {
                x: Pt::from_f32(x + side),
                y: Pt::from_f32(y),
            },
            Command::LineTo {
                x: Pt::from_f32(x + side),
                y: Pt::from_f32(y + side),
            },
            Command::LineTo {
                x: Pt::from_f32(x),
                y: Pt::from_f32(y + side),
            },
            Command::ClosePath,
        ]
    }

    #[test]
    fn pixel_size_rounds_zoomed_points() {
        assert_eq!(pixel_size(Size::new(612.0, 792.0), 2.0).unwrap(), (1224, 1584));
        assert_eq!(pixel_size(Size::new(100.4, 10.6), 1.0).unwrap(), (100, 11));
        assert!(pixel_size(Size::new(0.1, 10.0), 1.0).is_err());
    }

    #[test]
    fn filled_path_lands_top_left_scaled_by_zoom() {
        let mut commands = vec![Command::SetFillColor(Color::rgb(1.0, 0.0, 0.0))];
        commands.extend(square(10.0, 10.0, 20.0));
        commands.push(Command::Fill);
        let pixmap = render_page(&commands, Size::new(100.0, 100.0), 2.0, &[]).unwrap();
        let rgb = pixmap_to_rgb(&pixmap);
        assert_eq!(rgb.dimensions(), (200, 200));
        assert_eq!(rgb.get_pixel(40, 40).0, [255, 0, 0]);
        assert_eq!(rgb.get_pixel(150, 150).0, [255, 255, 255]);
    }

    #[test]
    fn zero_fill_opacity_paints_nothing() {
        let mut commands = vec![Command::SetOpacity {
            fill: 0.0,
            stroke: 0.0,
        }];
        commands.extend(square(0.0, 0.0, 50.0));
        commands.push(Command::Fill);
        commands.push(Command::SetFontSize(Pt::from_f32(20.0)));
        commands.push(Command::DrawString {
            x: Pt::from_f32(5.0),
            y: Pt::from_f32(5.0),
            text: "hidden".to_string(),
        });
        let pixmap = render_page(&commands, Size::new(60.0, 60.0), 1.0, &[]).unwrap();
        assert!(!has_non_white_pixel(&pixmap_to_rgb(&pixmap)));
    }

    #[test]
    fn clip_restricts_fill_until_restore() {
        let mut commands = vec![Command::SaveState];
        commands.extend(square(0.0, 0.0, 10.0));
        commands.push(Command::ClipPath { evenodd: false });
        commands.push(Command::EndPath);
        commands.extend(square(0.0, 0.0, 40.0));
        commands.push(Command::Fill);
        commands.push(Command::RestoreState);
        let pixmap = render_page(&commands, Size::new(40.0, 40.0), 1.0, &[]).unwrap();
        let rgb = pixmap_to_rgb(&pixmap);
        assert_eq!(rgb.get_pixel(5, 5).0, [0, 0, 0]);
        assert_eq!(rgb.get_pixel(30, 30).0, [255, 255, 255]);
    }

    #[test]
    fn draw_image_preserves_top_to_bottom_source_orientation() {
        let mut src = RgbaImage::new(1, 2);
        src.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        src.put_pixel(0, 1, image::Rgba([0, 0, 255, 255]));
        let mut bytes = Vec::new();
        src.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        let data_uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        );

        let commands = vec![Command::DrawImage {
            x: Pt::from_f32(10.0),
            y: Pt::from_f32(10.0),
            width: Pt::from_f32(20.0),
            height: Pt::from_f32(20.0),
            resource_id: data_uri,
        }];
        let pixmap = render_page(&commands, Size::new(72.0, 72.0), 1.0, &[]).unwrap();
        let rgb = pixmap_to_rgb(&pixmap);
        let top = rgb.get_pixel(20, 13).0;
        let bottom = rgb.get_pixel(20, 27).0;
        assert!(top[0] > top[2], "top sample {:?}", top);
        assert!(bottom[2] > bottom[0], "bottom sample {:?}", bottom);
    }

    #[test]
    fn matrix_placed_image_is_turned_a_quarter() {
        let mut src = RgbaImage::new(1, 2);
        src.put_pixel(0, 0, image::Rgba([255, 0, 0, 255]));
        src.put_pixel(0, 1, image::Rgba([0, 0, 255, 255]));
        let mut bytes = Vec::new();
        src.write_to(
            &mut std::io::Cursor::new(&mut bytes),
            image::ImageFormat::Png,
        )
        .unwrap();
        let data_uri = format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        );

        // Clockwise quarter turn into the 20x20 box whose bottom-left is (10, 42).
        let commands = vec![Command::DrawImageMatrix {
            matrix: [0.0, -20.0, 20.0, 0.0, 10.0, 62.0],
            resource_id: data_uri,
        }];
        let pixmap = render_page(&commands, Size::new(72.0, 72.0), 1.0, &[]).unwrap();
        let rgb = pixmap_to_rgb(&pixmap);
        let left = rgb.get_pixel(13, 20).0;
        let right = rgb.get_pixel(27, 20).0;
        assert!(right[0] > right[2], "right sample {:?}", right);
        assert!(left[2] > left[0], "left sample {:?}", left);
    }

    #[test]
    fn text_draws_with_registered_font() {
        let Some(path) = crate::font::tests::system_ttf() else {
            return;
        };
        let mut registry = FontRegistry::new();
        registry.register_file_as(&path, "Body").unwrap();
        let commands = vec![
            Command::SetFontName("Body".to_string()),
            Command::SetFontSize(Pt::from_f32(24.0)),
            Command::DrawString {
                x: Pt::from_f32(10.0),
                y: Pt::from_f32(10.0),
                text: "Hello".to_string(),
            },
        ];
        let pixmap = render_page(&commands, Size::new(200.0, 60.0), 1.0, &[&registry]).unwrap();
        assert!(has_non_white_pixel(&pixmap_to_rgb(&pixmap)));
    }

    #[test]
    fn system_candidates_follow_family_and_style() {
        assert_eq!(system_font_file_candidates("Helvetica-Bold")[0], "arialbd.ttf");
        assert_eq!(system_font_file_candidates("Times-Italic")[0], "timesi.ttf");
        assert_eq!(system_font_file_candidates("Courier")[0], "cour.ttf");
        assert_eq!(system_font_file_candidates("MS-Gothic")[0], "ipaexg.ttf");
    }

    #[test]
    fn parse_data_uri_base64_decodes_payload() {
        let (mime, data) = parse_data_uri("data:text/plain;base64,SGVsbG8=").unwrap();
        assert_eq!(mime, "text/plain");
        assert_eq!(data, b"Hello");
    }
}
