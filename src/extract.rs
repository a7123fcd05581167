//! Per-page plain text in reading order.

use crate::error::SlideGuardError;
use crate::pdf_parse::{ParseCache, PdfSource, TextRun};
use std::cmp::Ordering;
use std::path::Path;

/// Baseline distance, as a fraction of font size, within which runs share a line.
const LINE_TOLERANCE: f32 = 0.3;
/// Horizontal gap, as a fraction of font size, that reads as a word break.
const WORD_GAP: f32 = 0.15;

/// Extracts one string per page of the document at `path`.
///
/// Every line is terminated by `\n`; a page without text, or whose content
/// cannot be interpreted, yields an empty string.
pub fn extract_page_texts(path: &Path) -> Result<Vec<String>, SlideGuardError> {
    let source = PdfSource::open(path)?;
    let texts = page_texts(&source);
    log::info!("Extracted text from {} pages.", texts.len());
    Ok(texts)
}

pub(crate) fn page_texts(source: &PdfSource) -> Vec<String> {
    let mut cache = ParseCache::default();
    (0..source.page_count())
        .map(|index| match source.parse_page(index, &mut cache) {
            Ok(page) => lines_to_text(group_runs_into_lines(page.text_runs)),
            Err(err) => {
                log::warn!("Could not extract text from page {}: {err}", index + 1);
                String::new()
            }
        })
        .collect()
}

fn group_runs_into_lines(runs: Vec<TextRun>) -> Vec<Vec<TextRun>> {
    let mut runs: Vec<TextRun> = runs.into_iter().filter(|run| !run.text.is_empty()).collect();
    runs.sort_by(|a, b| {
        a.baseline
            .partial_cmp(&b.baseline)
            .unwrap_or(Ordering::Equal)
            .then(a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal))
    });

    let mut lines: Vec<Vec<TextRun>> = Vec::new();
    let mut current: Vec<TextRun> = Vec::new();
    let mut current_baseline: Option<f32> = None;
    for run in runs {
        let tolerance = run.font_size * LINE_TOLERANCE;
        match current_baseline {
            Some(baseline) if (run.baseline - baseline).abs() <= tolerance => current.push(run),
            _ => {
                if !current.is_empty() {
                    lines.push(std::mem::take(&mut current));
                }
                current_baseline = Some(run.baseline);
                current.push(run);
            }
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }

    for line in &mut lines {
        line.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal));
    }
    lines
}

fn lines_to_text(lines: Vec<Vec<TextRun>>) -> String {
    let mut out = String::new();
    for line in lines {
        let mut prev: Option<&TextRun> = None;
        for run in &line {
            if let Some(prev) = prev {
                if needs_space(prev, run) {
                    out.push(' ');
                }
            }
            out.push_str(&run.text);
            prev = Some(run);
        }
        out.push('\n');
    }
    out
}

fn needs_space(prev: &TextRun, next: &TextRun) -> bool {
    let (Some(last), Some(first)) = (prev.text.chars().last(), next.text.chars().next()) else {
        return false;
    };
    if last.is_whitespace() || first.is_whitespace() {
        return false;
    }
    if is_spaceless_script_char(last) && is_spaceless_script_char(first) {
        return false;
    }
    let gap = next.x - (prev.x + prev.width);
    gap > prev.font_size.max(next.font_size) * WORD_GAP
}

/// Scripts written without spaces between words (Chinese and Japanese).
fn is_spaceless_script_char(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0x20000..=0x2EBEF
            | 0x3040..=0x309F
            | 0x30A0..=0x30FF
            | 0x3000..=0x303F
            | 0xFF00..=0xFFEF
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdf_parse::tests::build_pdf;

    fn run(text: &str, x: f32, baseline: f32, width: f32) -> TextRun {
        TextRun {
            text: text.to_string(),
            x,
            baseline,
            font_size: 10.0,
            width,
        }
    }

    fn texts_of(pages: &[(&str, i64, i64)]) -> Vec<String> {
        let pages: Vec<(String, i64, i64)> = pages
            .iter()
            .map(|(content, w, h)| (content.to_string(), *w, *h))
            .collect();
        let source = PdfSource::from_bytes(&build_pdf(&pages)).expect("open");
        page_texts(&source)
    }

    #[test]
    fn lines_are_ordered_top_to_bottom_then_left_to_right() {
        let lines = group_runs_into_lines(vec![
            run("second", 10.0, 40.0, 30.0),
            run("world", 45.0, 20.5, 25.0),
            run("Hello", 10.0, 20.0, 25.0),
        ]);
        assert_eq!(lines_to_text(lines), "Hello world\nsecond\n");
    }

    #[test]
    fn adjacent_runs_join_without_space() {
        let lines = group_runs_into_lines(vec![
            run("Hel", 10.0, 20.0, 15.0),
            run("lo", 25.5, 20.0, 10.0),
        ]);
        assert_eq!(lines_to_text(lines), "Hello\n");
    }

    #[test]
    fn cjk_runs_join_without_space_even_with_gap() {
        let lines = group_runs_into_lines(vec![
            run("日本", 10.0, 20.0, 20.0),
            run("語", 40.0, 20.0, 10.0),
        ]);
        assert_eq!(lines_to_text(lines), "日本語\n");
    }

    #[test]
    fn pages_extract_in_order_with_empty_pages() {
        let texts = texts_of(&[
            ("BT /F1 12 Tf 72 700 Td (First page) Tj 0 -20 Td (line two) Tj ET", 612, 792),
            ("0 0 m 10 10 l S", 612, 792),
            ("BT /F1 12 Tf 72 700 Td (Third) Tj ET", 612, 792),
        ]);
        assert_eq!(texts, vec!["First page\nline two\n", "", "Third\n"]);
    }

    #[test]
    fn invisible_text_is_extracted() {
        let texts = texts_of(&[("BT 3 Tr /F1 12 Tf 72 700 Td (secret) Tj ET", 200, 200)]);
        assert_eq!(texts, vec!["secret\n"]);
    }

    #[test]
    fn tj_word_gap_becomes_a_space() {
        let texts = texts_of(&[("BT /F1 10 Tf 20 100 Td [(one) -600 (two)] TJ ET", 200, 200)]);
        assert_eq!(texts, vec!["one two\n"]);
    }

    #[test]
    fn broken_page_resources_yield_empty_text() {
        let mut doc = lopdf::Document::load_mem(&build_pdf(&[
            ("BT /F1 12 Tf 72 700 Td (ok) Tj ET".to_string(), 612, 792),
            ("BT /F1 12 Tf 72 700 Td (lost) Tj ET".to_string(), 612, 792),
        ]))
        .expect("load");
        let second = *doc.get_pages().get(&2).expect("page 2");
        doc.get_object_mut(second)
            .and_then(|obj| obj.as_dict_mut())
            .expect("page dict")
            .set("Resources", lopdf::Object::Reference((9999, 0)));
        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("save");

        let source = PdfSource::from_bytes(&bytes).expect("open");
        assert_eq!(page_texts(&source), vec!["ok\n".to_string(), String::new()]);
    }

    #[test]
    fn missing_file_is_document_open_error() {
        let err = extract_page_texts(Path::new("/nonexistent/input.pdf")).expect_err("missing");
        assert!(matches!(err, SlideGuardError::DocumentOpen(_)));
    }
}
