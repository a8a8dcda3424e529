use std::collections::HashMap;
use std::path::Path;

use crate::error::VellumError;
use crate::types::Pt;

// TrueType reader. Only the tables the subsetter and layout need are
// parsed: head, hhea, maxp, OS/2 (cap height), cmap (formats 4, 6, 12),
// hmtx, loca, glyf.

const MAX_COMPONENT_DEPTH: usize = 8;

fn be_u16(data: &[u8], off: usize) -> Result<u16, VellumError> {
    match data.get(off..off + 2) {
        Some(b) => Ok(u16::from_be_bytes([b[0], b[1]])),
        None => Err(VellumError::Font(format!("truncated read at offset {off}"))),
    }
}

fn be_i16(data: &[u8], off: usize) -> Result<i16, VellumError> {
    Ok(be_u16(data, off)? as i16)
}

fn be_u32(data: &[u8], off: usize) -> Result<u32, VellumError> {
    match data.get(off..off + 4) {
        Some(b) => Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        None => Err(VellumError::Font(format!("truncated read at offset {off}"))),
    }
}

#[derive(Debug, Clone, Copy)]
struct TableSlice {
    offset: usize,
    len: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Component {
    pub glyph_ix: u16,
    // Byte offset of the glyph index field, relative to the glyph start.
    pub offset: usize,
}

// One glyf entry, addressed by its byte range in the source font.
// Negative contour counts mark composites.
#[derive(Debug, Clone)]
pub(crate) struct Glyph {
    pub contours: i16,
    pub x_min: i16,
    pub y_min: i16,
    pub x_max: i16,
    pub y_max: i16,
    pub start: usize,
    pub len: usize,
    pub components: Vec<Component>,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct GlyphStats {
    pub points: usize,
    pub contours: usize,
    pub depth: usize,
}

#[derive(Debug)]
pub struct FontFace {
    data: Vec<u8>,
    units_per_em: u16,
    index_to_loc_long: bool,
    ascent: i16,
    descent: i16,
    line_gap: i16,
    cap_height: i16,
    num_hmetrics: u16,
    num_glyphs: u16,
    // Absolute offsets of usable cmap subtables, in preference order.
    cmap_subtables: Vec<usize>,
    glyf: TableSlice,
    loca: TableSlice,
    hmtx: TableSlice,
}

impl FontFace {
    pub fn parse(data: Vec<u8>) -> Result<FontFace, VellumError> {
        let scaler = be_u32(&data, 0)?;
        if scaler != 0x0001_0000 && scaler != 0x7472_7565 {
            return Err(VellumError::Font(format!(
                "unsupported scaler type 0x{scaler:08X}"
            )));
        }
        let num_tables = be_u16(&data, 4)? as usize;
        let mut tables: HashMap<u32, TableSlice> = HashMap::new();
        for i in 0..num_tables {
            let entry = 12 + i * 16;
            let tag = be_u32(&data, entry)?;
            let offset = be_u32(&data, entry + 8)? as usize;
            let len = be_u32(&data, entry + 12)? as usize;
            if offset.saturating_add(len) > data.len() {
                return Err(VellumError::Font(format!(
                    "table 0x{tag:08X} overruns the file at offset {offset}"
                )));
            }
            tables.insert(tag, TableSlice { offset, len });
        }
        let require = |tag: &[u8; 4]| -> Result<TableSlice, VellumError> {
            tables
                .get(&u32::from_be_bytes(*tag))
                .copied()
                .ok_or_else(|| {
                    VellumError::Font(format!(
                        "missing required table {}",
                        String::from_utf8_lossy(tag)
                    ))
                })
        };

        let head = require(b"head")?;
        let hhea = require(b"hhea")?;
        let maxp = require(b"maxp")?;
        let cmap = require(b"cmap")?;
        let glyf = require(b"glyf")?;
        let loca = require(b"loca")?;
        let hmtx = require(b"hmtx")?;

        let units_per_em = be_u16(&data, head.offset + 18)?;
        let index_to_loc_long = be_i16(&data, head.offset + 50)? != 0;
        let ascent = be_i16(&data, hhea.offset + 4)?;
        let descent = be_i16(&data, hhea.offset + 6)?;
        let line_gap = be_i16(&data, hhea.offset + 8)?;
        let num_hmetrics = be_u16(&data, hhea.offset + 34)?;
        let num_glyphs = be_u16(&data, maxp.offset + 4)?;

        // Cap height lives in OS/2 from version 2 on; older fonts fall
        // back to 0.7 em.
        let mut cap_height = (units_per_em as i32 * 7 / 10) as i16;
        if let Some(os2) = tables.get(&u32::from_be_bytes(*b"OS/2")) {
            if be_u16(&data, os2.offset)? >= 2 {
                cap_height = be_i16(&data, os2.offset + 88)?;
            }
        }

        let cmap_subtables = collect_cmap_subtables(&data, cmap)?;
        if cmap_subtables.is_empty() {
            return Err(VellumError::Font(
                "no usable Unicode cmap subtable (need format 4, 6, or 12)".to_string(),
            ));
        }

        Ok(FontFace {
            data,
            units_per_em,
            index_to_loc_long,
            ascent,
            descent,
            line_gap,
            cap_height,
            num_hmetrics,
            num_glyphs,
            cmap_subtables,
            glyf,
            loca,
            hmtx,
        })
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn units_per_em(&self) -> u16 {
        self.units_per_em
    }

    pub fn ascent(&self) -> i16 {
        self.ascent
    }

    pub fn descent(&self) -> i16 {
        self.descent
    }

    pub fn line_gap(&self) -> i16 {
        self.line_gap
    }

    pub fn cap_height(&self) -> i16 {
        self.cap_height
    }

    pub fn num_glyphs(&self) -> u16 {
        self.num_glyphs
    }

    // Walks the registered cmap subtables in order; the first nonzero
    // mapping wins.
    pub fn find_glyph(&self, codepoint: u32) -> Option<u16> {
        for &offset in &self.cmap_subtables {
            let gid = match be_u16(&self.data, offset).ok()? {
                4 => self.cmap4_lookup(offset, codepoint),
                6 => self.cmap6_lookup(offset, codepoint),
                12 => self.cmap12_lookup(offset, codepoint),
                _ => None,
            };
            if let Some(gid) = gid {
                if gid != 0 {
                    return Some(gid);
                }
            }
        }
        None
    }

    fn cmap4_lookup(&self, table: usize, codepoint: u32) -> Option<u16> {
        if codepoint > 0xFFFF {
            return None;
        }
        let cp = codepoint as u16;
        let data = &self.data;
        let seg_count_x2 = be_u16(data, table + 6).ok()? as usize;
        let end_codes = table + 14;
        let start_codes = end_codes + seg_count_x2 + 2;
        let deltas = start_codes + seg_count_x2;
        let range_offsets = deltas + seg_count_x2;
        for seg in (0..seg_count_x2).step_by(2) {
            let end = be_u16(data, end_codes + seg).ok()?;
            if cp > end {
                continue;
            }
            let start = be_u16(data, start_codes + seg).ok()?;
            if cp < start {
                return None;
            }
            let delta = be_u16(data, deltas + seg).ok()?;
            let range_offset = be_u16(data, range_offsets + seg).ok()?;
            if range_offset == 0 {
                return Some(cp.wrapping_add(delta));
            }
            let at = range_offsets + seg + range_offset as usize + (cp - start) as usize * 2;
            let gid = be_u16(data, at).ok()?;
            if gid == 0 {
                return None;
            }
            return Some(gid.wrapping_add(delta));
        }
        None
    }

    fn cmap6_lookup(&self, table: usize, codepoint: u32) -> Option<u16> {
        let data = &self.data;
        let first = be_u16(data, table + 6).ok()? as u32;
        let count = be_u16(data, table + 8).ok()? as u32;
        if codepoint < first || codepoint >= first + count {
            return None;
        }
        be_u16(data, table + 10 + (codepoint - first) as usize * 2).ok()
    }

    fn cmap12_lookup(&self, table: usize, codepoint: u32) -> Option<u16> {
        let data = &self.data;
        let groups = be_u32(data, table + 12).ok()? as usize;
        let mut lo = 0usize;
        let mut hi = groups;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let at = table + 16 + mid * 12;
            let start = be_u32(data, at).ok()?;
            let end = be_u32(data, at + 4).ok()?;
            if codepoint < start {
                hi = mid;
            } else if codepoint > end {
                lo = mid + 1;
            } else {
                let start_gid = be_u32(data, at + 8).ok()?;
                return Some((start_gid + (codepoint - start)) as u16);
            }
        }
        None
    }

    fn glyph_range(&self, gi: u16) -> Result<(usize, usize), VellumError> {
        if gi >= self.num_glyphs {
            return Err(VellumError::Font(format!(
                "glyph {gi} out of range ({} glyphs)",
                self.num_glyphs
            )));
        }
        let gi = gi as usize;
        let (start, end) = if self.index_to_loc_long {
            (
                be_u32(&self.data, self.loca.offset + gi * 4)? as usize,
                be_u32(&self.data, self.loca.offset + gi * 4 + 4)? as usize,
            )
        } else {
            (
                be_u16(&self.data, self.loca.offset + gi * 2)? as usize * 2,
                be_u16(&self.data, self.loca.offset + gi * 2 + 2)? as usize * 2,
            )
        };
        if end < start || end > self.glyf.len {
            return Err(VellumError::Font(format!(
                "glyph {gi} has a bad loca range {start}..{end}"
            )));
        }
        Ok((self.glyf.offset + start, self.glyf.offset + end))
    }

    pub(crate) fn read_glyph(&self, gi: u16) -> Result<Glyph, VellumError> {
        let (start, end) = self.glyph_range(gi)?;
        if start == end {
            return Ok(Glyph {
                contours: 0,
                x_min: 0,
                y_min: 0,
                x_max: 0,
                y_max: 0,
                start,
                len: 0,
                components: Vec::new(),
            });
        }
        let bytes = &self.data[start..end];
        let contours = be_i16(bytes, 0)?;
        let mut glyph = Glyph {
            contours,
            x_min: be_i16(bytes, 2)?,
            y_min: be_i16(bytes, 4)?,
            x_max: be_i16(bytes, 6)?,
            y_max: be_i16(bytes, 8)?,
            start,
            len: end - start,
            components: Vec::new(),
        };
        if contours < 0 {
            let mut pos = 10usize;
            loop {
                let flags = be_u16(bytes, pos)?;
                let glyph_ix = be_u16(bytes, pos + 2)?;
                glyph.components.push(Component {
                    glyph_ix,
                    offset: pos + 2,
                });
                pos += 4;
                pos += if flags & 0x0001 != 0 { 4 } else { 2 };
                if flags & 0x0008 != 0 {
                    pos += 2;
                } else if flags & 0x0040 != 0 {
                    pos += 4;
                } else if flags & 0x0080 != 0 {
                    pos += 8;
                }
                if flags & 0x0020 == 0 {
                    break;
                }
            }
        }
        Ok(glyph)
    }

    // Point/contour totals across the composite tree.
    pub(crate) fn glyph_stats(&self, gi: u16) -> Result<GlyphStats, VellumError> {
        self.glyph_stats_at(gi, 0)
    }

    fn glyph_stats_at(&self, gi: u16, depth: usize) -> Result<GlyphStats, VellumError> {
        if depth > MAX_COMPONENT_DEPTH {
            return Err(VellumError::Font(format!(
                "glyph {gi} exceeds composite depth {MAX_COMPONENT_DEPTH}"
            )));
        }
        let glyph = self.read_glyph(gi)?;
        if glyph.len == 0 {
            return Ok(GlyphStats::default());
        }
        if glyph.contours >= 0 {
            let nc = glyph.contours as usize;
            let mut points = 0usize;
            if nc > 0 {
                let bytes = &self.data[glyph.start..glyph.start + glyph.len];
                points = be_u16(bytes, 10 + (nc - 1) * 2)? as usize + 1;
            }
            return Ok(GlyphStats {
                points,
                contours: nc,
                depth: 0,
            });
        }
        let mut stats = GlyphStats::default();
        for component in &glyph.components {
            let child = self.glyph_stats_at(component.glyph_ix, depth + 1)?;
            stats.points += child.points;
            stats.contours += child.contours;
            stats.depth = stats.depth.max(child.depth + 1);
        }
        Ok(stats)
    }

    pub fn advance_width(&self, gi: u16) -> u16 {
        let gi = gi.min(self.num_glyphs.saturating_sub(1)) as usize;
        let nh = self.num_hmetrics.max(1) as usize;
        let at = if gi < nh {
            self.hmtx.offset + gi * 4
        } else {
            self.hmtx.offset + (nh - 1) * 4
        };
        be_u16(&self.data, at).unwrap_or(0)
    }

    pub(crate) fn left_side_bearing(&self, gi: u16) -> i16 {
        let gi = gi.min(self.num_glyphs.saturating_sub(1)) as usize;
        let nh = self.num_hmetrics.max(1) as usize;
        let at = if gi < nh {
            self.hmtx.offset + gi * 4 + 2
        } else {
            self.hmtx.offset + nh * 4 + (gi - nh) * 2
        };
        be_i16(&self.data, at).unwrap_or(0)
    }
}

fn collect_cmap_subtables(data: &[u8], cmap: TableSlice) -> Result<Vec<usize>, VellumError> {
    let count = be_u16(data, cmap.offset + 2)? as usize;
    let mut out = Vec::new();
    for i in 0..count {
        let record = cmap.offset + 4 + i * 8;
        let platform = be_u16(data, record)?;
        let encoding = be_u16(data, record + 2)?;
        let offset = be_u32(data, record + 4)? as usize;
        let unicode = platform == 0 || (platform == 3 && (encoding == 1 || encoding == 10));
        if !unicode {
            continue;
        }
        let table = cmap.offset + offset;
        let format = be_u16(data, table)?;
        if format == 4 || format == 6 || format == 12 {
            out.push(table);
        }
    }
    Ok(out)
}

// Named faces a document can reference. Faces register once and are
// subset per document at write time.
pub struct FontRegistry {
    fonts: Vec<RegisteredFont>,
}

pub(crate) struct RegisteredFont {
    pub(crate) name: String,
    pub(crate) face: FontFace,
}

impl Default for FontRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FontRegistry {
    pub fn new() -> Self {
        Self { fonts: Vec::new() }
    }

    pub fn register_bytes(
        &mut self,
        name: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<(), VellumError> {
        let face = FontFace::parse(data)?;
        self.fonts.push(RegisteredFont {
            name: name.into(),
            face,
        });
        Ok(())
    }

    pub fn register_file(&mut self, path: impl AsRef<Path>) -> Result<(), VellumError> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let name = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("font")
            .to_string();
        self.register_bytes(name, data)
    }

    pub(crate) fn resolve(&self, name: &str) -> Option<&RegisteredFont> {
        self.fonts.iter().find(|font| font.name == name)
    }

    pub fn measure_text_width(&self, name: &str, font_size: Pt, text: &str) -> Pt {
        let Some(font) = self.resolve(name) else {
            return Pt::ZERO;
        };
        let upem = font.face.units_per_em().max(1) as f32;
        let mut units = 0u32;
        for ch in text.chars() {
            let gid = font.face.find_glyph(ch as u32).unwrap_or(0);
            units += font.face.advance_width(gid) as u32;
        }
        Pt::from_f32(font_size.to_f32() * units as f32 / upem)
    }

    pub fn line_height(&self, name: &str, font_size: Pt, fallback: Pt) -> Pt {
        let Some(font) = self.resolve(name) else {
            return fallback;
        };
        let face = &font.face;
        let upem = face.units_per_em().max(1) as f32;
        let units = face.ascent() as i32 - face.descent() as i32 + face.line_gap() as i32;
        Pt::from_f32(font_size.to_f32() * units as f32 / upem)
    }
}


#[cfg(test)]
mod tests {
    use super::testfont::*;
    use super::*;

    fn face() -> FontFace {
        FontFace::parse(testfont::sample_font()).expect("parse sample font")
    }

    #[test]
    fn header_metrics_are_read() {
        let face = face();
        assert_eq!(face.units_per_em(), 1000);
        assert_eq!(face.ascent(), 800);
        assert_eq!(face.descent(), -200);
        assert_eq!(face.line_gap(), 90);
        assert_eq!(face.cap_height(), 690);
        assert_eq!(face.num_glyphs(), NUM_GLYPHS);
    }

    #[test]
    fn cmap_format4_maps_basic_latin() {
        let face = face();
        assert_eq!(face.find_glyph('A' as u32), Some(GLYPH_A));
        assert_eq!(face.find_glyph('B' as u32), Some(GLYPH_B));
        assert_eq!(face.find_glyph('C' as u32), Some(GLYPH_COMPOSITE));
        assert_eq!(face.find_glyph('D' as u32), None);
    }

    #[test]
    fn cmap_format12_maps_supplementary_plane() {
        let face = face();
        assert_eq!(face.find_glyph(0x1F600), Some(GLYPH_PART));
        assert_eq!(face.find_glyph(0x1F601), None);
    }

    #[test]
    fn cmap_format6_maps_digits() {
        let face = face();
        assert_eq!(face.find_glyph('0' as u32), Some(21));
        assert_eq!(face.find_glyph('2' as u32), Some(23));
        assert_eq!(face.find_glyph('3' as u32), None);
    }

    #[test]
    fn simple_glyph_reads_contours_and_bbox() {
        let face = face();
        let glyph = face.read_glyph(GLYPH_A).expect("glyph");
        assert_eq!(glyph.contours, 1);
        assert_eq!((glyph.x_max, glyph.y_max), (700, 700));
        assert!(glyph.components.is_empty());
        assert!(glyph.len > 0);
    }

    #[test]
    fn empty_glyph_has_no_bytes() {
        let face = face();
        let glyph = face.read_glyph(0).expect("glyph");
        assert_eq!(glyph.len, 0);
        assert_eq!(glyph.contours, 0);
    }

    #[test]
    fn composite_lists_both_components() {
        let face = face();
        let glyph = face.read_glyph(GLYPH_COMPOSITE).expect("glyph");
        assert!(glyph.contours < 0);
        let ids: Vec<u16> = glyph.components.iter().map(|c| c.glyph_ix).collect();
        assert_eq!(ids, vec![GLYPH_A, GLYPH_PART]);
    }

    #[test]
    fn stats_cross_composites() {
        let face = face();
        let stats = face.glyph_stats(GLYPH_COMPOSITE).expect("stats");
        assert_eq!(stats.points, 8);
        assert_eq!(stats.contours, 2);
        assert_eq!(stats.depth, 1);
    }

    #[test]
    fn hmtx_advances_resolve_per_glyph() {
        let face = face();
        assert_eq!(face.advance_width(GLYPH_A), 600);
        assert_eq!(face.advance_width(GLYPH_B), 650);
        assert_eq!(face.advance_width(0), 500);
    }

    #[test]
    fn missing_table_is_reported() {
        let mut data = testfont::sample_font();
        // Corrupt the glyf tag so the table goes missing.
        let pos = data
            .windows(4)
            .position(|w| w == b"glyf")
            .expect("glyf tag");
        data[pos] = b'x';
        let err = FontFace::parse(data).expect_err("parse must fail");
        assert!(err.to_string().contains("glyf"));
    }

    #[test]
    fn registry_measures_with_advances() {
        let mut registry = FontRegistry::new();
        registry
            .register_bytes("Sample", testfont::sample_font())
            .expect("register");
        let width = registry.measure_text_width("Sample", Pt::from_i32(10), "AB");
        // (600 + 650) / 1000 * 10pt
        assert_eq!(width.to_milli_i64(), 12_500);
        assert_eq!(
            registry.measure_text_width("Missing", Pt::from_i32(10), "AB"),
            Pt::ZERO
        );
    }
}
