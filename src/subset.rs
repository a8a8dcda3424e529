use std::collections::HashMap;

use crate::error::VellumError;
use crate::font::FontFace;

// TrueType subsetter. Glyphs are interned in first-use order; the subset
// index doubles as the CID in the embedded font. Composite references are
// interned while their parent is being written, so the glyph list can grow
// mid-iteration; the emission loop runs to the fixpoint.
pub(crate) struct FontSubset<'a> {
    face: &'a FontFace,
    g_list: Vec<u16>,
    xlat: HashMap<u16, u16>,
    lookup: HashMap<u32, u16>,
    unicode: Vec<u32>,
}

// Running metric accumulators for the synthesized head/hhea/maxp tables.
struct SubsetMetrics {
    x_min: i16,
    y_min: i16,
    x_max: i16,
    y_max: i16,
    advance_width_max: u16,
    min_lsb: i16,
    min_rsb: i16,
    x_max_extent: i16,
    max_points: usize,
    max_contours: usize,
    max_composite_points: usize,
    max_composite_contours: usize,
    max_component_elements: usize,
    max_component_depth: usize,
    seen_outline: bool,
}

impl SubsetMetrics {
    fn new() -> Self {
        Self {
            x_min: 0,
            y_min: 0,
            x_max: 0,
            y_max: 0,
            advance_width_max: 0,
            min_lsb: 0,
            min_rsb: 0,
            x_max_extent: 0,
            max_points: 0,
            max_contours: 0,
            max_composite_points: 0,
            max_composite_contours: 0,
            max_component_elements: 0,
            max_component_depth: 0,
            seen_outline: false,
        }
    }
}

impl<'a> FontSubset<'a> {
    pub fn new(face: &'a FontFace) -> Self {
        Self {
            face,
            g_list: Vec::new(),
            xlat: HashMap::new(),
            lookup: HashMap::new(),
            unicode: Vec::new(),
        }
    }

    pub fn face(&self) -> &'a FontFace {
        self.face
    }

    pub fn glyph_count(&self) -> usize {
        self.g_list.len()
    }

    // Codepoint to subset index, interning the source glyph on first use.
    // Unmapped codepoints land on glyph 0 so text extraction still works.
    pub fn map_char(&mut self, ch: char) -> u16 {
        let cp = ch as u32;
        let source = match self.lookup.get(&cp) {
            Some(&gid) => gid,
            None => {
                let gid = self.face.find_glyph(cp).unwrap_or(0);
                self.lookup.insert(cp, gid);
                gid
            }
        };
        self.intern(source, cp)
    }

    fn intern(&mut self, source: u16, codepoint: u32) -> u16 {
        if let Some(&ix) = self.xlat.get(&source) {
            return ix;
        }
        let ix = self.g_list.len() as u16;
        self.g_list.push(source);
        self.unicode.push(codepoint);
        self.xlat.insert(source, ix);
        ix
    }

    // Advance widths per subset index, in source glyph units.
    pub fn widths(&self) -> Vec<u16> {
        self.g_list
            .iter()
            .map(|&gid| self.face.advance_width(gid))
            .collect()
    }

    // Emits the reduced font: glyf/head/hmtx/hhea/loca/maxp, directory in
    // tag order, tables 4-byte aligned, checkSumAdjustment patched last.
    pub fn build(&mut self) -> Result<Vec<u8>, VellumError> {
        let face = self.face;
        let mut glyf: Vec<u8> = Vec::new();
        let mut loca: Vec<u32> = Vec::new();
        let mut metrics = SubsetMetrics::new();

        // Index loop on purpose: interning a composite's components below
        // appends to g_list, and those glyphs must be emitted too.
        let mut i = 0usize;
        while i < self.g_list.len() {
            let source = self.g_list[i];
            loca.push(glyf.len() as u32);
            let glyph = face.read_glyph(source)?;
            let advance = face.advance_width(source);
            metrics.advance_width_max = metrics.advance_width_max.max(advance);

            if glyph.len > 0 {
                let lsb = face.left_side_bearing(source);
                let width = glyph.x_max as i32 - glyph.x_min as i32;
                let rsb = advance as i32 - lsb as i32 - width;
                let extent = lsb as i32 + width;
                if metrics.seen_outline {
                    metrics.x_min = metrics.x_min.min(glyph.x_min);
                    metrics.y_min = metrics.y_min.min(glyph.y_min);
                    metrics.x_max = metrics.x_max.max(glyph.x_max);
                    metrics.y_max = metrics.y_max.max(glyph.y_max);
                    metrics.min_lsb = metrics.min_lsb.min(lsb);
                    metrics.min_rsb = metrics.min_rsb.min(rsb as i16);
                    metrics.x_max_extent = metrics.x_max_extent.max(extent as i16);
                } else {
                    metrics.x_min = glyph.x_min;
                    metrics.y_min = glyph.y_min;
                    metrics.x_max = glyph.x_max;
                    metrics.y_max = glyph.y_max;
                    metrics.min_lsb = lsb;
                    metrics.min_rsb = rsb as i16;
                    metrics.x_max_extent = extent as i16;
                    metrics.seen_outline = true;
                }

                let bytes = &face.bytes()[glyph.start..glyph.start + glyph.len];
                if glyph.contours >= 0 {
                    let nc = glyph.contours as usize;
                    let instr_at = 10 + nc * 2;
                    let instr_len = u16::from_be_bytes([bytes[instr_at], bytes[instr_at + 1]]);
                    glyf.extend_from_slice(&bytes[..instr_at]);
                    glyf.extend_from_slice(&[0, 0]);
                    glyf.extend_from_slice(&bytes[instr_at + 2 + instr_len as usize..]);

                    let stats = face.glyph_stats(source)?;
                    metrics.max_points = metrics.max_points.max(stats.points);
                    metrics.max_contours = metrics.max_contours.max(stats.contours);
                } else {
                    let base = glyf.len();
                    glyf.extend_from_slice(bytes);
                    for component in &glyph.components {
                        let subset_ix = self.intern(component.glyph_ix, 0);
                        let at = base + component.offset;
                        glyf[at..at + 2].copy_from_slice(&subset_ix.to_be_bytes());
                    }
                    let stats = face.glyph_stats(source)?;
                    metrics.max_composite_points = metrics.max_composite_points.max(stats.points);
                    metrics.max_composite_contours =
                        metrics.max_composite_contours.max(stats.contours);
                    metrics.max_component_elements =
                        metrics.max_component_elements.max(glyph.components.len());
                    metrics.max_component_depth = metrics.max_component_depth.max(stats.depth);
                }
            }
            while glyf.len() % 4 != 0 {
                glyf.push(0);
            }
            i += 1;
        }
        loca.push(glyf.len() as u32);

        let glyph_count = self.g_list.len();
        let head = self.build_head(&metrics);
        let hhea = self.build_hhea(&metrics, glyph_count);
        let hmtx = self.build_hmtx();
        let maxp = self.build_maxp(&metrics, glyph_count);
        let mut loca_bytes = Vec::with_capacity(loca.len() * 4);
        for value in &loca {
            loca_bytes.extend_from_slice(&value.to_be_bytes());
        }

        // Directory entries sorted by tag value.
        let tables: [([u8; 4], Vec<u8>); 6] = [
            (*b"glyf", glyf),
            (*b"head", head),
            (*b"hhea", hhea),
            (*b"hmtx", hmtx),
            (*b"loca", loca_bytes),
            (*b"maxp", maxp),
        ];

        let num_tables = tables.len() as u16;
        let entry_selector = 15 - (num_tables.leading_zeros() as u16).min(15);
        let search_range = 16u16 << entry_selector;
        let mut out = Vec::new();
        out.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        out.extend_from_slice(&num_tables.to_be_bytes());
        out.extend_from_slice(&search_range.to_be_bytes());
        out.extend_from_slice(&entry_selector.to_be_bytes());
        out.extend_from_slice(&(num_tables * 16 - search_range).to_be_bytes());

        let mut offset = 12 + tables.len() * 16;
        let mut head_offset = 0usize;
        for (tag, body) in &tables {
            let checksum = table_checksum(body);
            out.extend_from_slice(tag);
            out.extend_from_slice(&checksum.to_be_bytes());
            out.extend_from_slice(&(offset as u32).to_be_bytes());
            out.extend_from_slice(&(body.len() as u32).to_be_bytes());
            if tag == b"head" {
                head_offset = offset;
            }
            offset += (body.len() + 3) & !3;
        }
        for (_, body) in tables {
            out.extend_from_slice(&body);
            while out.len() % 4 != 0 {
                out.push(0);
            }
        }

        // File checksum with checkSumAdjustment still zero; the stored
        // adjustment brings the total to 0xB1B0AFBA.
        let file_sum = table_checksum(&out);
        let adjustment = 0xB1B0_AFBAu32.wrapping_sub(file_sum);
        out[head_offset + 8..head_offset + 12].copy_from_slice(&adjustment.to_be_bytes());
        Ok(out)
    }

    fn build_head(&self, metrics: &SubsetMetrics) -> Vec<u8> {
        let mut head = Vec::with_capacity(54);
        head.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        head.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        head.extend_from_slice(&0u32.to_be_bytes()); // checkSumAdjustment
        head.extend_from_slice(&0x5F0F_3CF5u32.to_be_bytes());
        head.extend_from_slice(&0u16.to_be_bytes()); // flags
        head.extend_from_slice(&self.face.units_per_em().to_be_bytes());
        head.extend_from_slice(&[0u8; 16]); // created + modified
        for v in [metrics.x_min, metrics.y_min, metrics.x_max, metrics.y_max] {
            head.extend_from_slice(&v.to_be_bytes());
        }
        head.extend_from_slice(&0u16.to_be_bytes()); // macStyle
        head.extend_from_slice(&7u16.to_be_bytes()); // lowestRecPPEM
        head.extend_from_slice(&2i16.to_be_bytes()); // fontDirectionHint
        head.extend_from_slice(&1i16.to_be_bytes()); // long loca offsets
        head.extend_from_slice(&0i16.to_be_bytes());
        head
    }

    fn build_hhea(&self, metrics: &SubsetMetrics, glyph_count: usize) -> Vec<u8> {
        let mut hhea = Vec::with_capacity(36);
        hhea.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        hhea.extend_from_slice(&metrics.y_max.to_be_bytes()); // ascent
        hhea.extend_from_slice(&metrics.y_min.to_be_bytes()); // descent
        hhea.extend_from_slice(&self.face.line_gap().to_be_bytes());
        hhea.extend_from_slice(&metrics.advance_width_max.to_be_bytes());
        hhea.extend_from_slice(&metrics.min_lsb.to_be_bytes());
        hhea.extend_from_slice(&metrics.min_rsb.to_be_bytes());
        hhea.extend_from_slice(&metrics.x_max_extent.to_be_bytes());
        hhea.extend_from_slice(&1i16.to_be_bytes()); // caretSlopeRise
        hhea.extend_from_slice(&0i16.to_be_bytes()); // caretSlopeRun
        hhea.extend_from_slice(&0i16.to_be_bytes()); // caretOffset
        hhea.extend_from_slice(&[0u8; 8]); // reserved
        hhea.extend_from_slice(&0i16.to_be_bytes()); // metricDataFormat
        hhea.extend_from_slice(&(glyph_count as u16).to_be_bytes());
        hhea
    }

    fn build_hmtx(&self) -> Vec<u8> {
        let mut hmtx = Vec::with_capacity(self.g_list.len() * 4);
        for &gid in &self.g_list {
            hmtx.extend_from_slice(&self.face.advance_width(gid).to_be_bytes());
            hmtx.extend_from_slice(&self.face.left_side_bearing(gid).to_be_bytes());
        }
        hmtx
    }

    fn build_maxp(&self, metrics: &SubsetMetrics, glyph_count: usize) -> Vec<u8> {
        let mut maxp = Vec::with_capacity(32);
        maxp.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        maxp.extend_from_slice(&(glyph_count as u16).to_be_bytes());
        for value in [
            metrics.max_points as u16,
            metrics.max_contours as u16,
            metrics.max_composite_points as u16,
            metrics.max_composite_contours as u16,
            2, // maxZones
            0, // maxTwilightPoints
            0, // maxStorage
            0, // maxFunctionDefs
            0, // maxInstructionDefs
            0, // maxStackElements
            0, // maxSizeOfInstructions
            metrics.max_component_elements as u16,
            metrics.max_component_depth as u16,
        ] {
            maxp.extend_from_slice(&value.to_be_bytes());
        }
        maxp
    }

    // ToUnicode CMap: one bfrange over the whole subset, each index mapped
    // to the UTF-16BE form of its codepoint (surrogate pairs above BMP).
    // Closure-only glyphs carry no codepoint and map to U+0000.
    pub fn to_unicode_cmap(&self) -> String {
        let mut out = String::new();
        out.push_str("/CIDInit /ProcSet findresource begin\n");
        out.push_str("12 dict begin\n");
        out.push_str("begincmap\n");
        out.push_str(
            "/CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> def\n",
        );
        out.push_str("/CMapName /Adobe-Identity-UCS def\n");
        out.push_str("/CMapType 2 def\n");
        out.push_str("1 begincodespacerange\n<0000> <FFFF>\nendcodespacerange\n");
        if !self.unicode.is_empty() {
            out.push_str("1 beginbfrange\n");
            out.push_str(&format!("<0000> <{:04X}> [", self.unicode.len() - 1));
            for (i, &cp) in self.unicode.iter().enumerate() {
                if i > 0 {
                    out.push(' ');
                }
                out.push('<');
                if cp <= 0xFFFF {
                    out.push_str(&format!("{cp:04X}"));
                } else {
                    let v = cp - 0x1_0000;
                    let high = 0xD800 | (v >> 10);
                    let low = 0xDC00 | (v & 0x3FF);
                    out.push_str(&format!("{high:04X}{low:04X}"));
                }
                out.push('>');
            }
            out.push_str("]\nendbfrange\n");
        }
        out.push_str("endcmap\n");
        out.push_str("CMapName currentdict /CMap defineresource pop\n");
        out.push_str("end\nend\n");
        out
    }
}

// Sum of big-endian u32 words, zero-padded at the tail.
fn table_checksum(data: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    let rest = chunks.remainder();
    if !rest.is_empty() {
        let mut word = [0u8; 4];
        word[..rest.len()].copy_from_slice(rest);
        sum = sum.wrapping_add(u32::from_be_bytes(word));
    }
    sum
}
