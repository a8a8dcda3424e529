use crate::canvas::{Command, Document, Page};
use crate::font::FontRegistry;
use crate::types::{Color, Margins, Pt, Size};

// Greedy word/line typesetter feeding the page graph: words buffer into a
// line, lines flush into column flow, full columns advance, full pages
// start a new one. Widths come straight from the font advances.
#[derive(Debug, Clone)]
pub struct TypesetterOptions {
    pub page_size: Size,
    pub margins: Margins,
    pub columns: u16,
    pub gutter: Pt,
    // Distribute line slack into inter-word gaps (the last line of a
    // paragraph stays ragged).
    pub justify: bool,
    // Line height fallback as a multiple of the font size.
    pub leading: f32,
}

impl Default for TypesetterOptions {
    fn default() -> Self {
        Self {
            page_size: Size::a4(),
            margins: Margins::all(54.0),
            columns: 1,
            gutter: Pt::from_i32(18),
            justify: false,
            leading: 1.25,
        }
    }
}

struct Word {
    text: String,
    width: Pt,
    space_before: Pt,
    font: String,
    size: Pt,
    color: Color,
    rise: Pt,
}

pub struct Typesetter<'a> {
    registry: &'a FontRegistry,
    options: TypesetterOptions,

    font_name: String,
    font_size: Pt,
    color: Color,
    rise: Pt,

    line: Vec<Word>,
    line_width: Pt,
    cursor_y: Pt,
    column: u16,
    current: Vec<Command>,
    pages: Vec<Page>,

    emitted_font: Option<(String, Pt)>,
    emitted_color: Option<Color>,
    emitted_rise: Pt,
}

impl<'a> Typesetter<'a> {
    pub fn new(registry: &'a FontRegistry, options: TypesetterOptions) -> Self {
        let top = options.margins.top;
        Self {
            registry,
            options,
            font_name: String::new(),
            font_size: Pt::from_i32(12),
            color: Color::BLACK,
            rise: Pt::ZERO,
            line: Vec::new(),
            line_width: Pt::ZERO,
            cursor_y: top,
            column: 0,
            current: Vec::new(),
            pages: Vec::new(),
            emitted_font: None,
            emitted_color: None,
            emitted_rise: Pt::ZERO,
        }
    }

    pub fn set_font(&mut self, name: impl Into<String>, size: Pt) {
        self.font_name = name.into();
        self.font_size = size;
    }

    pub fn set_color(&mut self, color: Color) {
        self.color = color;
    }

    // Superscript level: positive raises, zero restores the baseline.
    pub fn set_super(&mut self, level: i32) {
        self.rise = Pt::from_f32(self.font_size.to_f32() * 0.33 * level as f32);
    }

    pub fn text(&mut self, text: &str) {
        for token in text.split_whitespace() {
            let width = self
                .registry
                .measure_text_width(&self.font_name, self.font_size, token);
            let space = if self.line.is_empty() {
                Pt::ZERO
            } else {
                self.registry
                    .measure_text_width(&self.font_name, self.font_size, " ")
            };
            if !self.line.is_empty() && self.line_width + space + width > self.column_width() {
                self.flush_line(self.options.justify);
            }
            let space_before = if self.line.is_empty() { Pt::ZERO } else { space };
            self.line_width += space_before + width;
            self.line.push(Word {
                text: token.to_string(),
                width,
                space_before,
                font: self.font_name.clone(),
                size: self.font_size,
                color: self.color,
                rise: self.rise,
            });
        }
    }

    pub fn new_line(&mut self) {
        if self.line.is_empty() {
            // Blank line: advance by one leading step.
            self.cursor_y += self.fallback_line_height();
        } else {
            self.flush_line(false);
        }
    }

    pub fn new_page(&mut self) {
        self.flush_line(false);
        self.close_page();
    }

    pub fn finish(mut self) -> Document {
        self.flush_line(false);
        if !self.current.is_empty() || self.pages.is_empty() {
            let commands = std::mem::take(&mut self.current);
            self.pages.push(Page { commands });
        }
        Document {
            page_size: self.options.page_size,
            pages: std::mem::take(&mut self.pages),
        }
    }

    fn content_width(&self) -> Pt {
        self.options.page_size.width - self.options.margins.left - self.options.margins.right
    }

    fn column_width(&self) -> Pt {
        let cols = self.options.columns.max(1) as i32;
        (self.content_width() - self.options.gutter * (cols - 1)) / cols
    }

    fn column_x(&self) -> Pt {
        self.options.margins.left
            + (self.column_width() + self.options.gutter) * self.column as i32
    }

    fn fallback_line_height(&self) -> Pt {
        self.font_size * self.options.leading
    }

    fn line_height(&self) -> Pt {
        let mut height = Pt::ZERO;
        for word in &self.line {
            let fallback = word.size * self.options.leading;
            height = height.max(self.registry.line_height(&word.font, word.size, fallback));
        }
        if height == Pt::ZERO {
            self.fallback_line_height()
        } else {
            height
        }
    }

    fn close_page(&mut self) {
        let commands = std::mem::take(&mut self.current);
        self.pages.push(Page { commands });
        self.column = 0;
        self.cursor_y = self.options.margins.top;
        self.emitted_font = None;
        self.emitted_color = None;
        self.emitted_rise = Pt::ZERO;
    }

    fn advance_column(&mut self) {
        self.column += 1;
        if self.column >= self.options.columns.max(1) {
            self.close_page();
        } else {
            self.cursor_y = self.options.margins.top;
        }
    }

    fn flush_line(&mut self, justify: bool) {
        if self.line.is_empty() {
            return;
        }
        let line_height = self.line_height();
        let bottom = self.options.page_size.height - self.options.margins.bottom;
        if self.cursor_y + line_height > bottom {
            self.advance_column();
        }
        let baseline = self.cursor_y + line_height;

        let gaps = self.line.len().saturating_sub(1) as i32;
        let slack = self.column_width() - self.line_width;
        let extra = if justify && gaps > 0 && slack > Pt::ZERO {
            slack / gaps
        } else {
            Pt::ZERO
        };

        let words = std::mem::take(&mut self.line);
        let mut x = self.column_x();
        for (index, word) in words.iter().enumerate() {
            if index > 0 {
                x += word.space_before + extra;
            }
            if self
                .emitted_font
                .as_ref()
                .map(|(name, size)| name != &word.font || *size != word.size)
                .unwrap_or(true)
            {
                self.current.push(Command::SetFontName(word.font.clone()));
                self.current.push(Command::SetFontSize(word.size));
                self.emitted_font = Some((word.font.clone(), word.size));
            }
            if self.emitted_color != Some(word.color) {
                self.current.push(Command::SetFillColor(word.color));
                self.emitted_color = Some(word.color);
            }
            if self.emitted_rise != word.rise {
                self.current.push(Command::SetTextRise(word.rise));
                self.emitted_rise = word.rise;
            }
            self.current.push(Command::DrawString {
                x,
                y: baseline,
                text: word.text.clone(),
            });
            x += word.width;
        }
        self.line_width = Pt::ZERO;
        self.cursor_y += line_height;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::font::testfont;

    fn registry() -> FontRegistry {
        let mut registry = FontRegistry::new();
        registry
            .register_bytes("Sample", testfont::sample_font())
            .expect("register");
        registry
    }

    fn draw_positions(document: &Document) -> Vec<(i64, i64, String)> {
        let mut out = Vec::new();
        for page in &document.pages {
            for command in &page.commands {
                if let Command::DrawString { x, y, text } = command {
                    out.push((x.to_milli_i64(), y.to_milli_i64(), text.clone()));
                }
            }
        }
        out
    }

    #[test]
    fn words_wrap_when_the_line_fills() {
        let registry = registry();
        let options = TypesetterOptions {
            page_size: Size::from_inches(2.2, 5.0),
            margins: Margins::all(10.0),
            ..Default::default()
        };
        let mut ts = Typesetter::new(&registry, options);
        ts.set_font("Sample", Pt::from_i32(12));
        // Unmapped glyphs advance 500 units, so each 10-char word is
        // 60pt wide against a 138pt column: two fit, the third wraps.
        ts.text("wwwwwwwwww wwwwwwwwww wwwwwwwwww");
        let document = ts.finish();
        let positions = draw_positions(&document);
        assert_eq!(positions.len(), 3);
        assert_eq!(positions[0].1, positions[1].1, "two words share line one");
        assert!(positions[2].1 > positions[0].1, "third word wrapped");
    }

    #[test]
    fn justification_spreads_the_slack() {
        let registry = registry();
        let base = TypesetterOptions {
            page_size: Size::from_inches(2.2, 5.0),
            margins: Margins::all(10.0),
            ..Default::default()
        };
        let ragged = {
            let mut ts = Typesetter::new(&registry, base.clone());
            ts.set_font("Sample", Pt::from_i32(12));
            ts.text("wwwwwwwwww wwwwwwwwww wwwwwwwwww");
            draw_positions(&ts.finish())
        };
        let justified = {
            let mut ts = Typesetter::new(
                &registry,
                TypesetterOptions {
                    justify: true,
                    ..base
                },
            );
            ts.set_font("Sample", Pt::from_i32(12));
            ts.text("wwwwwwwwww wwwwwwwwww wwwwwwwwww");
            draw_positions(&ts.finish())
        };
        assert_eq!(ragged[0].0, justified[0].0, "first word stays put");
        assert!(
            justified[1].0 > ragged[1].0,
            "second word absorbs the line slack"
        );
    }

    #[test]
    fn columns_fill_before_the_page_breaks() {
        let registry = registry();
        let options = TypesetterOptions {
            page_size: Size::from_inches(4.0, 1.2),
            margins: Margins::all(10.0),
            columns: 2,
            ..Default::default()
        };
        let mut ts = Typesetter::new(&registry, options);
        ts.set_font("Sample", Pt::from_i32(12));
        for _ in 0..12 {
            ts.text("wwwwwwwwww");
            ts.new_line();
        }
        let document = ts.finish();
        assert!(document.pages.len() >= 2, "overflow reaches a second page");
        let first_page_x: Vec<i64> = document.pages[0]
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::DrawString { x, .. } => Some(x.to_milli_i64()),
                _ => None,
            })
            .collect();
        let left = first_page_x.iter().min().copied().unwrap_or(0);
        let right = first_page_x.iter().max().copied().unwrap_or(0);
        assert!(right > left, "both columns were used");
    }

    #[test]
    fn explicit_page_breaks_take_effect() {
        let registry = registry();
        let mut ts = Typesetter::new(&registry, TypesetterOptions::default());
        ts.set_font("Sample", Pt::from_i32(12));
        ts.text("one");
        ts.new_page();
        ts.text("two");
        let document = ts.finish();
        assert_eq!(document.pages.len(), 2);
    }

    #[test]
    fn superscript_emits_a_text_rise() {
        let registry = registry();
        let mut ts = Typesetter::new(&registry, TypesetterOptions::default());
        ts.set_font("Sample", Pt::from_i32(12));
        ts.text("base");
        ts.set_super(1);
        ts.text("sup");
        ts.set_super(0);
        ts.text("base");
        let document = ts.finish();
        let rises: Vec<i64> = document.pages[0]
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::SetTextRise(v) => Some(v.to_milli_i64()),
                _ => None,
            })
            .collect();
        assert_eq!(rises.len(), 2);
        assert!(rises[0] > 0);
        assert_eq!(rises[1], 0);
    }

    #[test]
    fn mixed_fonts_measure_with_their_own_size() {
        let registry = registry();
        let mut ts = Typesetter::new(&registry, TypesetterOptions::default());
        ts.set_font("Sample", Pt::from_i32(12));
        ts.text("AB");
        ts.set_font("Sample", Pt::from_i32(24));
        ts.text("AB");
        let document = ts.finish();
        let sizes: Vec<i64> = document.pages[0]
            .commands
            .iter()
            .filter_map(|c| match c {
                Command::SetFontSize(v) => Some(v.to_milli_i64()),
                _ => None,
            })
            .collect();
        assert_eq!(sizes, vec![12_000, 24_000]);
    }
}
