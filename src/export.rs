use std::{
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDateTime;
use printpdf::{IndirectFontRef, Mm, PdfDocument, PdfDocumentReference};
use thiserror::Error;
use ttf_parser::{Face, FaceParsingError};

use crate::{
    clock::Clock,
    reminder::{DISPLAY_FORMAT, Reminder},
    storage::{ReminderStorage, StorageError},
};

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 20.0;
const FOOTER_HEIGHT: f32 = 8.0;
const WRAP_WIDTH: usize = 80;
const HEADING_WRAP_WIDTH: usize = 64;
const NO_DETAILS: &str = "(no details)";

const REGULAR_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans.ttf");
const BOLD_FONT: &[u8] = include_bytes!("../assets/fonts/DejaVuSans-Bold.ttf");
const REPLACEMENT_CHAR: char = '?';

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("Could not read stored reminders")]
    Storage(#[from] StorageError),

    #[error("Could not write {}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not load the report font")]
    Font(#[from] FaceParsingError),

    #[error("Could not render the PDF document")]
    Pdf(#[from] printpdf::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Empty,
    Written {
        path: PathBuf,
        reminders: usize,
        pages: usize,
        /// Characters the report font has no glyph for, printed as `?`.
        unrendered: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Title,
    Heading,
    Body,
    Spacer,
}

impl LineStyle {
    fn font_size(self) -> f32 {
        match self {
            LineStyle::Title => 18.0,
            LineStyle::Heading => 12.0,
            LineStyle::Body | LineStyle::Spacer => 10.0,
        }
    }

    // millimetres
    fn height(self) -> f32 {
        match self {
            LineStyle::Title => 12.0,
            LineStyle::Heading => 7.0,
            LineStyle::Body => 5.5,
            LineStyle::Spacer => 4.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportLine {
    pub style: LineStyle,
    pub text: String,
}

impl ReportLine {
    fn new(style: LineStyle, text: impl Into<String>) -> Self {
        Self {
            style,
            text: text.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReportLayout {
    pub pages: Vec<Vec<ReportLine>>,
}

impl ReportLayout {
    pub fn build(reminders: &[Reminder], generated_at: NaiveDateTime) -> Self {
        let mut builder = PageBuilder::default();

        builder.push_block(vec![
            ReportLine::new(LineStyle::Title, "Reminders"),
            ReportLine::new(
                LineStyle::Body,
                format!(
                    "Exported {}, {} reminder(s)",
                    generated_at.format(DISPLAY_FORMAT),
                    reminders.len()
                ),
            ),
            ReportLine::new(LineStyle::Spacer, ""),
        ]);

        for reminder in reminders {
            builder.push_block(reminder_block(reminder));
        }

        builder.finish()
    }

    #[cfg(test)]
    pub fn headings(&self) -> impl Iterator<Item = &str> {
        self.pages
            .iter()
            .flatten()
            .filter(|line| line.style == LineStyle::Heading)
            .map(|line| line.text.as_str())
    }
}

fn reminder_block(reminder: &Reminder) -> Vec<ReportLine> {
    let heading = format!(
        "{}  {}",
        reminder.fire_at.datetime().format(DISPLAY_FORMAT),
        reminder.description
    );

    let mut lines: Vec<_> = wrap_text(&heading, HEADING_WRAP_WIDTH)
        .into_iter()
        .enumerate()
        .map(|(index, text)| {
            // continuation lines of a long title are not separate blocks
            let style = if index == 0 {
                LineStyle::Heading
            } else {
                LineStyle::Body
            };
            ReportLine::new(style, text)
        })
        .collect();

    let details = reminder.details.as_deref().unwrap_or(NO_DETAILS);
    lines.extend(
        wrap_text(details, WRAP_WIDTH)
            .into_iter()
            .map(|text| ReportLine::new(LineStyle::Body, text)),
    );
    lines.push(ReportLine::new(LineStyle::Spacer, ""));
    lines
}

#[derive(Default)]
struct PageBuilder {
    pages: Vec<Vec<ReportLine>>,
    current: Vec<ReportLine>,
    used: f32,
}

impl PageBuilder {
    const AVAILABLE: f32 = PAGE_HEIGHT - 2.0 * MARGIN - FOOTER_HEIGHT;

    /// Keeps a block on one page unless it is taller than a whole page.
    fn push_block(&mut self, block: Vec<ReportLine>) {
        let height: f32 = block.iter().map(|line| line.style.height()).sum();
        if self.used + height > Self::AVAILABLE && !self.current.is_empty() {
            self.break_page();
        }

        for line in block {
            if self.used + line.style.height() > Self::AVAILABLE {
                self.break_page();
            }
            if line.style == LineStyle::Spacer && self.current.is_empty() {
                continue;
            }
            self.used += line.style.height();
            self.current.push(line);
        }
    }

    fn break_page(&mut self) {
        self.pages.push(std::mem::take(&mut self.current));
        self.used = 0.0;
    }

    fn finish(mut self) -> ReportLayout {
        if !self.current.is_empty() {
            self.break_page();
        }
        ReportLayout { pages: self.pages }
    }
}

/// Greedy wrap that keeps spacing inside a line as typed. Whitespace at a
/// break is dropped, words longer than `width` are split.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();

    for paragraph in text.lines() {
        let mut line = String::new();
        let mut line_len = 0;
        let mut rest = paragraph;

        while !rest.is_empty() {
            let gap_end = rest
                .find(|c: char| !c.is_whitespace())
                .unwrap_or(rest.len());
            let (gap, tail) = rest.split_at(gap_end);
            let word_end = tail.find(char::is_whitespace).unwrap_or(tail.len());
            let (mut word, tail) = tail.split_at(word_end);
            rest = tail;

            if word.is_empty() {
                break;
            }

            let gap_len = gap.chars().count();
            if line_len > 0 && line_len + gap_len + word.chars().count() > width {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            } else {
                let kept: String = gap.chars().take(width - line_len).collect();
                line_len += kept.chars().count();
                line.push_str(&kept);
            }

            while line_len + word.chars().count() > width {
                let room = width - line_len;
                if room > 0 {
                    let split_at = word
                        .char_indices()
                        .nth(room)
                        .map_or(word.len(), |(index, _)| index);
                    line.push_str(&word[..split_at]);
                    word = &word[split_at..];
                }
                lines.push(std::mem::take(&mut line));
                line_len = 0;
            }

            line_len += word.chars().count();
            line.push_str(word);
        }
        lines.push(line);
    }

    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

pub fn export_file_name(now: NaiveDateTime) -> String {
    format!("database_export_{}.pdf", now.format("%Y%m%d_%H%M%S"))
}

/// Swaps characters the face cannot draw for `?` and counts them.
fn renderable_text(face: &Face<'_>, text: &str) -> (String, usize) {
    let mut unrendered = 0;
    let rendered: String = text
        .chars()
        .map(|c| match face.glyph_index(c) {
            Some(glyph) if glyph.0 != 0 => c,
            _ => {
                unrendered += 1;
                REPLACEMENT_CHAR
            }
        })
        .collect();

    (rendered, unrendered)
}

struct ReportFont<'a> {
    face: Face<'a>,
    reference: IndirectFontRef,
}

impl<'a> ReportFont<'a> {
    fn load(doc: &PdfDocumentReference, data: &'a [u8]) -> Result<Self, ExportError> {
        Ok(Self {
            face: Face::parse(data, 0)?,
            reference: doc.add_external_font(data)?,
        })
    }
}

fn write_pdf(path: &Path, layout: &ReportLayout) -> Result<usize, ExportError> {
    let (doc, first_page, first_layer) =
        PdfDocument::new("Reminders", Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
    let regular = ReportFont::load(&doc, REGULAR_FONT)?;
    let bold = ReportFont::load(&doc, BOLD_FONT)?;
    let page_count = layout.pages.len();
    let mut unrendered = 0;

    for (index, lines) in layout.pages.iter().enumerate() {
        let (page, layer) = if index == 0 {
            (first_page, first_layer)
        } else {
            doc.add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1")
        };
        let layer = doc.get_page(page).get_layer(layer);

        let mut y = PAGE_HEIGHT - MARGIN;
        for line in lines {
            y -= line.style.height();
            let font = match line.style {
                LineStyle::Spacer => continue,
                LineStyle::Title | LineStyle::Heading => &bold,
                LineStyle::Body => &regular,
            };
            let (text, missing) = renderable_text(&font.face, &line.text);
            unrendered += missing;
            layer.use_text(
                text,
                line.style.font_size(),
                Mm(MARGIN),
                Mm(y),
                &font.reference,
            );
        }

        layer.use_text(
            format!("Page {} of {}", index + 1, page_count),
            8.0,
            Mm(MARGIN),
            Mm(MARGIN / 2.0),
            &regular.reference,
        );
    }

    let file = File::create(path).map_err(|source| ExportError::Io {
        path: path.to_owned(),
        source,
    })?;
    doc.save(&mut BufWriter::new(file))?;

    Ok(unrendered)
}

pub struct PdfExporter {
    directory: PathBuf,
    clock: Arc<dyn Clock>,
}

impl PdfExporter {
    pub fn new(directory: PathBuf, clock: Arc<dyn Clock>) -> Self {
        Self { directory, clock }
    }

    pub async fn export(
        &self,
        storage: &dyn ReminderStorage,
    ) -> Result<ExportOutcome, ExportError> {
        let reminders = storage.get_all().await?;
        if reminders.is_empty() {
            log::info!("Nothing to export");
            return Ok(ExportOutcome::Empty);
        }

        let now = self.clock.now();
        let layout = ReportLayout::build(&reminders, now);
        let path = self.directory.join(export_file_name(now));

        let unrendered = write_pdf(&path, &layout)?;
        if unrendered > 0 {
            log::warn!(
                "{} character(s) have no glyph in the report font [path = {}]",
                unrendered,
                path.display()
            );
        }
        log::info!(
            "Exported {} reminder(s) on {} page(s) to {}",
            reminders.len(),
            layout.pages.len(),
            path.display()
        );

        Ok(ExportOutcome::Written {
            path,
            reminders: reminders.len(),
            pages: layout.pages.len(),
            unrendered,
        })
    }
}
