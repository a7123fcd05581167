use log::{Level, LevelFilter, Log, Metadata, Record};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};
use pdfslideguard::{OverlayFont, RunState, SlideGuard};
use std::path::Path;
use std::sync::{Mutex, Once};

/// Keeps every record so a test can look for the lines a user would see.
struct CapturingLogger {
    records: Mutex<Vec<(Level, String)>>,
}

impl Log for CapturingLogger {
    fn enabled(&self, _metadata: &Metadata<'_>) -> bool {
        true
    }

    fn log(&self, record: &Record<'_>) {
        if let Ok(mut records) = self.records.lock() {
            records.push((record.level(), record.args().to_string()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger {
    records: Mutex::new(Vec::new()),
};
static INSTALL: Once = Once::new();

fn install_logger() {
    INSTALL.call_once(|| {
        log::set_logger(&LOGGER).expect("no other logger in this test binary");
        log::set_max_level(LevelFilter::Debug);
    });
}

/// Records at `level` whose message mentions `needle`.
fn records_mentioning(level: Level, needle: &str) -> Vec<String> {
    LOGGER
        .records
        .lock()
        .expect("records")
        .iter()
        .filter(|(lvl, message)| *lvl == level && message.contains(needle))
        .map(|(_, message)| message.clone())
        .collect()
}

fn write_one_page(path: &Path) {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let content = Content {
        operations: vec![
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec!["F1".into(), 12.into()]),
            Operation::new("Td", vec![36.into(), 300.into()]),
            Operation::new("Tj", vec![Object::string_literal("Welcome")]),
            Operation::new("ET", vec![]),
        ],
    }
    .encode()
    .expect("encode content");
    let content_id = doc.add_object(Stream::new(dictionary! {}, content));
    let page_id = doc.add_object(dictionary! {
        "Type" => "Page",
        "Parent" => pages_id,
        "MediaBox" => vec![0.into(), 0.into(), 400.into(), 350.into()],
        "Contents" => content_id,
        "Resources" => dictionary! { "Font" => dictionary! { "F1" => font_id } },
    });
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);
    doc.save(path).expect("save fixture");
}

#[test]
fn missing_font_warns_with_its_path_and_run_completes() {
    install_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("deck.pdf");
    let output = dir.path().join("deck.out.pdf");
    let missing = dir.path().join("missing-gothic.ttf");
    write_one_page(&input);

    let mut guard = SlideGuard::builder(&input, &output)
        .zoom_factor(1.0)
        .font_path(&missing)
        .build()
        .expect("build");
    let report = guard.run().expect("run falls back to Helvetica");

    assert_eq!(report.font, OverlayFont::Builtin("Helvetica"));
    assert_eq!(guard.state(), RunState::Done);
    let warnings = records_mentioning(Level::Warn, &missing.display().to_string());
    assert_eq!(warnings.len(), 1, "{warnings:?}");
    assert!(warnings[0].contains("Font file not found"), "{}", warnings[0]);
    assert!(warnings[0].contains("Helvetica"), "{}", warnings[0]);
}

#[test]
fn unparsable_font_logs_an_error_and_run_completes() {
    install_logger();
    let dir = tempfile::tempdir().expect("tempdir");
    let input = dir.path().join("deck.pdf");
    let output = dir.path().join("deck.out.pdf");
    let broken = dir.path().join("broken-gothic.ttf");
    std::fs::write(&broken, b"not a font program").expect("write font");
    write_one_page(&input);

    let mut guard = SlideGuard::builder(&input, &output)
        .zoom_factor(1.0)
        .font_path(&broken)
        .build()
        .expect("build");
    let report = guard.run().expect("run falls back to Helvetica");

    assert_eq!(report.font, OverlayFont::Builtin("Helvetica"));
    assert_eq!(guard.state(), RunState::Done);
    let errors = records_mentioning(Level::Error, &broken.display().to_string());
    assert_eq!(errors.len(), 1, "{errors:?}");
    assert!(errors[0].contains("Using default font (Helvetica)"), "{}", errors[0]);
}
