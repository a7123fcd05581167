use crate::error::SlideGuardError;
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use ttf_parser::GlyphId;

pub const DEFAULT_FONT_ALIAS: &str = "JapaneseGothic";
pub const BUILTIN_FALLBACK_FONT: &str = "Helvetica";

/// Fonts available to one run, addressed by alias.
///
/// The primary alias a font is registered under always points at the latest
/// registration; secondary names taken from the font's own name table never
/// shadow an existing entry.
#[derive(Debug, Default)]
pub struct FontRegistry {
    fonts: Vec<RegisteredFont>,
    lookup: HashMap<String, usize>,
}

#[derive(Debug)]
pub(crate) struct RegisteredFont {
    pub(crate) name: String,
    pub(crate) postscript_name: String,
    pub(crate) data: Arc<Vec<u8>>,
    pub(crate) metrics: FontMetrics,
    pub(crate) program_kind: FontProgramKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FontProgramKind {
    TrueType,
    OpenTypeCff,
}

/// Face metrics in 1000-unit glyph space.
#[derive(Debug, Clone)]
pub(crate) struct FontMetrics {
    pub(crate) ascent: i16,
    pub(crate) descent: i16,
    pub(crate) cap_height: i16,
    pub(crate) italic_angle: i16,
    pub(crate) stem_v: i16,
    pub(crate) bbox: (i16, i16, i16, i16),
    pub(crate) missing_width: u16,
    pub(crate) is_fixed_pitch: bool,
    pub(crate) symbolic: bool,
}

impl FontRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.fonts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fonts.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    /// Registers the font at `path` under `alias`, plus its own names as
    /// secondary aliases.
    pub fn register_file_as(
        &mut self,
        path: impl AsRef<Path>,
        alias: &str,
    ) -> Result<(), SlideGuardError> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|err| {
            SlideGuardError::FontRegistration(format!("{}: {err}", path.display()))
        })?;
        let face = ttf_parser::Face::parse(&data, 0).map_err(|err| {
            SlideGuardError::FontRegistration(format!("{}: {err}", path.display()))
        })?;
        let (primary, aliases) = font_names(&face, path);
        let (metrics, program_kind) = FontMetrics::from_face(&face);
        drop(face);

        let index = self.push(primary.clone(), data, metrics, program_kind);
        self.lookup.insert(normalize_name(alias), index);
        for name in std::iter::once(primary).chain(aliases) {
            let key = normalize_name(&name);
            if key.is_empty() || self.lookup.contains_key(&key) {
                continue;
            }
            self.lookup.insert(key, index);
        }
        Ok(())
    }

    /// Registers an in-memory font program under exactly `alias`.
    pub(crate) fn register_bytes_as(
        &mut self,
        data: Vec<u8>,
        alias: &str,
    ) -> Result<(), SlideGuardError> {
        let face = ttf_parser::Face::parse(&data, 0).map_err(|err| {
            SlideGuardError::FontRegistration(format!("invalid font data for {alias}: {err}"))
        })?;
        let (metrics, program_kind) = FontMetrics::from_face(&face);
        drop(face);
        let index = self.push(alias.to_string(), data, metrics, program_kind);
        self.lookup.insert(normalize_name(alias), index);
        Ok(())
    }

    fn push(
        &mut self,
        name: String,
        data: Vec<u8>,
        metrics: FontMetrics,
        program_kind: FontProgramKind,
    ) -> usize {
        let postscript_name = postscript_safe(&name);
        let index = self.fonts.len();
        self.fonts.push(RegisteredFont {
            name,
            postscript_name,
            data: Arc::new(data),
            metrics,
            program_kind,
        });
        index
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        let key = normalize_name(name);
        self.lookup
            .get(&key)
            .and_then(|index| self.fonts.get(*index))
    }
}

impl RegisteredFont {
    pub(crate) fn face(&self) -> Option<ttf_parser::Face<'_>> {
        ttf_parser::Face::parse(self.data.as_slice(), 0).ok()
    }

    /// Glyph id of every char in `text`, 0 where the font has no glyph.
    pub(crate) fn glyph_ids(&self, text: &str) -> Vec<u16> {
        let Some(face) = self.face() else {
            return vec![0; text.chars().count()];
        };
        let (_symbolic, symbol_subtable) = select_symbol_subtable(&face);
        text.chars()
            .map(|ch| {
                glyph_index_for_codepoint(&face, ch as u32, symbol_subtable)
                    .map(|gid| gid.0)
                    .unwrap_or(0)
            })
            .collect()
    }

    /// Horizontal advance of `gid` in 1000-unit glyph space.
    pub(crate) fn glyph_advance(&self, gid: u16) -> u16 {
        let Some(face) = self.face() else {
            return self.metrics.missing_width;
        };
        let Some(advance) = face.glyph_hor_advance(GlyphId(gid)) else {
            return self.metrics.missing_width;
        };
        let units = face.units_per_em().max(1) as i64;
        let scaled = ((advance as i64) * 1000 + (units / 2)) / units;
        scaled.clamp(0, u16::MAX as i64) as u16
    }
}

impl FontMetrics {
    fn from_face(face: &ttf_parser::Face<'_>) -> (Self, FontProgramKind) {
        let units_per_em = face.units_per_em().max(1);
        let scale = 1000.0 / units_per_em as f32;
        let (symbolic, symbol_subtable) = select_symbol_subtable(face);

        let missing_width = glyph_index_for_codepoint(face, ' ' as u32, symbol_subtable)
            .and_then(|id| face.glyph_hor_advance(id))
            .map(|w| (w as f32 * scale).round().clamp(0.0, u16::MAX as f32) as u16)
            .unwrap_or(500);
        let ascent = scale_i16(face.ascender(), scale);
        let descent = scale_i16(face.descender(), scale);
        let cap_height = face
            .capital_height()
            .map(|value| scale_i16(value, scale))
            .unwrap_or(ascent);
        let bbox = face.global_bounding_box();
        let bbox = (
            scale_i16(bbox.x_min, scale),
            scale_i16(bbox.y_min, scale),
            scale_i16(bbox.x_max, scale),
            scale_i16(bbox.y_max, scale),
        );
        let italic_angle = face
            .italic_angle()
            .map(|value| value.round() as i16)
            .unwrap_or(0);

        let program_kind = if face.tables().cff.is_some() {
            FontProgramKind::OpenTypeCff
        } else {
            FontProgramKind::TrueType
        };

        (
            Self {
                ascent,
                descent,
                cap_height,
                italic_angle,
                stem_v: 80,
                bbox,
                missing_width,
                is_fixed_pitch: face.is_monospaced(),
                symbolic,
            },
            program_kind,
        )
    }
}

/// Font the invisible overlay text is written with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OverlayFont {
    /// Embedded program registered under `alias`.
    Registered { alias: String, path: PathBuf },
    /// A standard-14 font that needs no embedding.
    Builtin(&'static str),
}

impl OverlayFont {
    pub fn name(&self) -> &str {
        match self {
            OverlayFont::Registered { alias, .. } => alias,
            OverlayFont::Builtin(name) => name,
        }
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, OverlayFont::Builtin(_))
    }
}

impl fmt::Display for OverlayFont {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Registers the overlay font, falling back to Helvetica on any failure.
pub fn resolve_overlay_font(registry: &mut FontRegistry, path: &Path, alias: &str) -> OverlayFont {
    if !path.exists() {
        log::warn!(
            "Font file not found: {}. Using default font ({}).",
            path.display(),
            BUILTIN_FALLBACK_FONT
        );
        return OverlayFont::Builtin(BUILTIN_FALLBACK_FONT);
    }
    match registry.register_file_as(path, alias) {
        Ok(()) => {
            log::info!("Registered font '{}' from {}", alias, path.display());
            OverlayFont::Registered {
                alias: alias.to_string(),
                path: path.to_path_buf(),
            }
        }
        Err(err) => {
            log::error!("{err}. Using default font ({BUILTIN_FALLBACK_FONT}).");
            OverlayFont::Builtin(BUILTIN_FALLBACK_FONT)
        }
    }
}

fn select_symbol_subtable<'a>(
    face: &'a ttf_parser::Face<'a>,
) -> (bool, Option<ttf_parser::cmap::Subtable<'a>>) {
    let Some(cmap) = face.tables().cmap else {
        return (false, None);
    };
    let mut first = None;
    let mut symbol = None;
    let mut has_unicode = false;
    for subtable in cmap.subtables {
        if first.is_none() {
            first = Some(subtable);
        }
        if subtable.platform_id == ttf_parser::name::PlatformId::Windows
            && subtable.encoding_id == 0
        {
            symbol = Some(subtable);
        }
        if subtable.is_unicode() {
            has_unicode = true;
        }
    }
    if has_unicode {
        (false, None)
    } else {
        (symbol.is_some(), symbol.or(first))
    }
}

fn glyph_index_for_codepoint<'a>(
    face: &'a ttf_parser::Face<'a>,
    codepoint: u32,
    fallback: Option<ttf_parser::cmap::Subtable<'a>>,
) -> Option<GlyphId> {
    if let Some(ch) = char::from_u32(codepoint) {
        if let Some(id) = face.glyph_index(ch) {
            return Some(id);
        }
    }
    let subtable = fallback?;
    if let Some(id) = subtable.glyph_index(codepoint) {
        return Some(id);
    }
    // Symbol fonts map their glyphs into the private-use range.
    subtable.glyph_index(codepoint + 0xF000)
}

fn scale_i16(value: i16, scale: f32) -> i16 {
    let scaled = (value as f32 * scale).round() as i32;
    scaled.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

fn font_names(face: &ttf_parser::Face<'_>, path: &Path) -> (String, Vec<String>) {
    use ttf_parser::name::name_id;

    let mut family = None;
    let mut full = None;
    let mut post = None;

    for entry in face.names() {
        let Some(name) = entry.to_string() else {
            continue;
        };
        match entry.name_id {
            name_id::TYPOGRAPHIC_FAMILY | name_id::FAMILY => {
                if family.is_none() {
                    family = Some(name);
                }
            }
            name_id::FULL_NAME => {
                if full.is_none() {
                    full = Some(name);
                }
            }
            name_id::POST_SCRIPT_NAME => {
                if post.is_none() {
                    post = Some(name);
                }
            }
            _ => {}
        }
    }

    let stem = path
        .file_stem()
        .and_then(|v| v.to_str())
        .map(|v| v.to_string());
    let primary = post
        .clone()
        .or_else(|| full.clone())
        .or_else(|| family.clone())
        .or_else(|| stem.clone())
        .unwrap_or_else(|| "EmbeddedFont".to_string());

    let mut aliases = Vec::new();
    for candidate in [family, full, post, stem].into_iter().flatten() {
        if candidate != primary {
            aliases.push(candidate);
        }
    }

    (primary, aliases)
}

// PDF names in BaseFont must not carry spaces or delimiters.
fn postscript_safe(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|ch| ch.is_ascii_graphic() && !"()<>[]{}/%#".contains(*ch))
        .collect();
    if cleaned.is_empty() {
        "EmbeddedFont".to_string()
    } else {
        cleaned
    }
}

fn normalize_name(name: &str) -> String {
    name.trim()
        .trim_matches('"')
        .trim_matches('\'')
        .to_ascii_lowercase()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// First TrueType font found on this machine, if any.
    pub(crate) fn system_ttf() -> Option<PathBuf> {
        [
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/dejavu/DejaVuSans.ttf",
            "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
            "/usr/share/fonts/liberation/LiberationSans-Regular.ttf",
            "/usr/share/fonts/opentype/ipaexfont-gothic/ipaexg.ttf",
            "/Library/Fonts/Arial.ttf",
            "C:\\Windows\\Fonts\\arial.ttf",
        ]
        .iter()
        .map(PathBuf::from)
        .find(|path| path.is_file())
    }

    #[test]
    fn missing_path_falls_back_to_helvetica() {
        let mut registry = FontRegistry::new();
        let font = resolve_overlay_font(
            &mut registry,
            Path::new("/nonexistent/fonts/ipaexg.ttf"),
            DEFAULT_FONT_ALIAS,
        );
        assert_eq!(font, OverlayFont::Builtin(BUILTIN_FALLBACK_FONT));
        assert!(registry.is_empty());
    }

    #[test]
    fn unparsable_font_falls_back_to_helvetica() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("broken.ttf");
        std::fs::write(&path, b"definitely not a font").expect("write");
        let mut registry = FontRegistry::new();
        let font = resolve_overlay_font(&mut registry, &path, DEFAULT_FONT_ALIAS);
        assert!(font.is_builtin());
        assert!(!registry.contains(DEFAULT_FONT_ALIAS));
    }

    #[test]
    fn unparsable_font_data_is_a_registration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("font.ttf");
        std::fs::write(&path, b"whatever").expect("write");
        let err = FontRegistry::new()
            .register_file_as(&path, DEFAULT_FONT_ALIAS)
            .expect_err("not a font program");
        assert!(matches!(err, SlideGuardError::FontRegistration(_)));
    }

    #[test]
    fn font_without_known_extension_is_registered_by_content() {
        let Some(source) = system_ttf() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["gothic", "gothic.font", "GOTHIC.TTF"] {
            let path = dir.path().join(name);
            std::fs::copy(&source, &path).expect("copy font");
            let mut registry = FontRegistry::new();
            registry
                .register_file_as(&path, DEFAULT_FONT_ALIAS)
                .expect("registered by content");
            assert!(registry.contains(DEFAULT_FONT_ALIAS), "{name}");
            let font = resolve_overlay_font(&mut FontRegistry::new(), &path, DEFAULT_FONT_ALIAS);
            assert!(matches!(font, OverlayFont::Registered { .. }), "{name}");
        }
    }

    #[test]
    fn registered_font_is_resolvable_by_alias_and_own_name() {
        let Some(path) = system_ttf() else {
            return;
        };
        let mut registry = FontRegistry::new();
        let font = resolve_overlay_font(&mut registry, &path, "MyAlias");
        assert_eq!(font.name(), "MyAlias");
        let registered = registry.resolve("myalias").expect("alias resolves");
        assert!(registry.resolve(&registered.name).is_some());
        let gids = registered.glyph_ids("A\u{10FFFD}");
        assert_ne!(gids[0], 0);
        assert_eq!(gids[1], 0);
        assert!(registered.glyph_advance(gids[0]) > 0);
    }

    #[test]
    fn re_registering_an_alias_replaces_the_earlier_font() {
        let Some(path) = system_ttf() else {
            return;
        };
        let mut registry = FontRegistry::new();
        registry.register_file_as(&path, "Body").expect("first");
        registry.register_file_as(&path, "Body").expect("second");
        assert_eq!(registry.len(), 2);
        let resolved = registry.resolve("Body").expect("resolves") as *const RegisteredFont;
        assert!(std::ptr::eq(resolved, &registry.fonts[1]));
    }

    #[test]
    fn postscript_names_drop_delimiters() {
        assert_eq!(postscript_safe("IPAex Gothic"), "IPAexGothic");
        assert_eq!(postscript_safe("  "), "EmbeddedFont");
    }
}
