use std::collections::HashMap;
use std::io::{self, Write};
use std::path::PathBuf;

use base64::Engine;

use crate::canvas::{Command, Document};
use crate::debug::DebugLogger;
use crate::deflate::{self, DeflateOptions};
use crate::font::FontRegistry;
use crate::png::{decode_png, ColorSpaceSpec, MaskKind};
use crate::subset::FontSubset;
use crate::types::{Color, Pt, Size};

#[derive(Debug, Clone)]
pub struct PdfOptions {
    // Deflate page streams, font programs, and resampled images.
    pub compress: bool,
    pub title: Option<String>,
    // Pixels-per-inch assumed for images placed at natural size when the
    // file carries no physical-size information.
    pub default_dpi: u32,
    pub deflate: DeflateOptions,
    pub debug_path: Option<PathBuf>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            compress: true,
            title: None,
            default_dpi: 72,
            deflate: DeflateOptions::default(),
            debug_path: None,
        }
    }
}

const PDF_HEADER: &[u8] = b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n";

struct DocFont<'a> {
    name: String,
    resource: String,
    // Five consecutive ids: font file, descriptor, CID font, ToUnicode,
    // Type0.
    start_id: usize,
    subset: FontSubset<'a>,
}

// Objects whose bytes exist only at finish time; drained in allocation
// order.
enum DeferredObject {
    FontSubset { font_index: usize },
}

struct ImageHandle {
    name: String,
    width: u32,
    height: u32,
    dpi: Option<u32>,
}

pub(crate) struct PdfStreamWriter<'a, W: Write> {
    writer: &'a mut W,
    offset: usize,
    // Byte offset per object id, index id - 1.
    offsets: Vec<usize>,
    next_id: usize,
    page_size: Size,
    options: PdfOptions,
    registry: Option<&'a FontRegistry>,
    debug: Option<DebugLogger>,

    fonts: Vec<DocFont<'a>>,
    font_index: HashMap<String, usize>,
    deferred: Vec<DeferredObject>,

    images: Vec<(String, usize)>,
    image_index: HashMap<String, ImageHandle>,
    image_content: HashMap<u64, String>,
    next_image_index: usize,

    pages_id: usize,
    page_refs: Vec<usize>,
}

impl<'a, W: Write> PdfStreamWriter<'a, W> {
    pub(crate) fn new(
        writer: &'a mut W,
        page_size: Size,
        registry: Option<&'a FontRegistry>,
        options: PdfOptions,
    ) -> io::Result<Self> {
        let debug = match options.debug_path.as_ref() {
            Some(path) => Some(DebugLogger::new(path)?),
            None => None,
        };
        let mut s = Self {
            writer,
            offset: 0,
            offsets: Vec::new(),
            next_id: 1,
            page_size,
            options,
            registry,
            debug,
            fonts: Vec::new(),
            font_index: HashMap::new(),
            deferred: Vec::new(),
            images: Vec::new(),
            image_index: HashMap::new(),
            image_content: HashMap::new(),
            next_image_index: 1,
            pages_id: 0,
            page_refs: Vec::new(),
        };
        s.write_bytes(PDF_HEADER)?;
        s.pages_id = s.alloc_obj();
        Ok(s)
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.offset += bytes.len();
        Ok(())
    }

    fn alloc_obj(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.offsets.push(0);
        id
    }

    fn start_obj(&mut self, id: usize) -> io::Result<()> {
        self.offsets[id - 1] = self.offset;
        self.write_bytes(format!("{id} 0 obj\n").as_bytes())
    }

    fn end_obj(&mut self) -> io::Result<()> {
        self.write_bytes(b"\nendobj\n")
    }

    fn write_object(&mut self, id: usize, body: &[u8]) -> io::Result<()> {
        self.start_obj(id)?;
        self.write_bytes(body)?;
        self.end_obj()
    }

    // Stream object with a pre-allocated id. `pre_compressed` payloads are
    // embedded verbatim but still declared /FlateDecode (they carry their
    // own zlib framing).
    fn stream_object_at(
        &mut self,
        id: usize,
        extra: &str,
        data: &[u8],
        pre_compressed: bool,
    ) -> io::Result<()> {
        let compressed;
        let (payload, filtered): (&[u8], bool) = if pre_compressed {
            (data, true)
        } else if self.options.compress {
            compressed = deflate::deflate(data, &self.options.deflate).map_err(io::Error::from)?;
            (compressed.as_slice(), true)
        } else {
            (data, false)
        };
        self.start_obj(id)?;
        let filter = if filtered { " /Filter /FlateDecode" } else { "" };
        let space = if extra.is_empty() { "" } else { " " };
        self.write_bytes(
            format!(
                "<<{space}{extra}{filter} /Length {} >>stream\n",
                payload.len()
            )
            .as_bytes(),
        )?;
        self.write_bytes(payload)?;
        self.write_bytes(b"\nendstream")?;
        self.end_obj()
    }

    fn put_stream(&mut self, extra: &str, data: &[u8], pre_compressed: bool) -> io::Result<usize> {
        let id = self.alloc_obj();
        self.stream_object_at(id, extra, data, pre_compressed)?;
        Ok(id)
    }

    pub(crate) fn add_page(&mut self, commands: &[Command]) -> io::Result<()> {
        let content = self.render_commands(commands)?;
        let content_id = self.put_stream("", content.as_bytes(), false)?;
        let page_id = self.alloc_obj();
        let page = format!(
            "<< /Type /Page /Parent {} 0 R /MediaBox [0 0 {} {}] /Resources << {} >> /Contents {} 0 R >>",
            self.pages_id,
            fmt_pt(self.page_size.width),
            fmt_pt(self.page_size.height),
            self.resources(),
            content_id
        );
        self.write_object(page_id, page.as_bytes())?;
        self.page_refs.push(page_id);
        if let Some(logger) = &self.debug {
            logger.increment("pages", 1);
            logger.increment("content_bytes", content.len() as u64);
        }
        Ok(())
    }

    fn resources(&self) -> String {
        let mut out = String::new();
        if !self.fonts.is_empty() {
            out.push_str("/Font << ");
            for font in &self.fonts {
                out.push_str(&format!("/{} {} 0 R ", font.resource, font.start_id + 4));
            }
            out.push_str(">> ");
        }
        if !self.images.is_empty() {
            out.push_str("/XObject << ");
            for (name, id) in &self.images {
                out.push_str(&format!("/{name} {id} 0 R "));
            }
            out.push_str(">> ");
        }
        out.trim_end().to_string()
    }

    fn ensure_font(&mut self, name: &str) -> io::Result<usize> {
        if let Some(&index) = self.font_index.get(name) {
            return Ok(index);
        }
        let registry = self.registry.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("text uses font {name:?} but no font registry was supplied"),
            )
        })?;
        let font = registry.resolve(name).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("font {name:?} is not registered"),
            )
        })?;
        let start_id = self.alloc_obj();
        for _ in 0..4 {
            self.alloc_obj();
        }
        let index = self.fonts.len();
        self.fonts.push(DocFont {
            name: name.to_string(),
            resource: format!("F{}", index + 1),
            start_id,
            subset: FontSubset::new(&font.face),
        });
        self.font_index.insert(name.to_string(), index);
        self.deferred.push(DeferredObject::FontSubset { font_index: index });
        Ok(index)
    }

    fn ensure_image(&mut self, source: &str) -> io::Result<(String, u32, u32, Option<u32>)> {
        if let Some(handle) = self.image_index.get(source) {
            return Ok((
                handle.name.clone(),
                handle.width,
                handle.height,
                handle.dpi,
            ));
        }
        let bytes = load_image_bytes(source)?;
        let hash = hash_bytes(&bytes);
        if let Some(existing) = self.image_content.get(&hash) {
            let name = existing.clone();
            let handle = self
                .image_index
                .values()
                .find(|handle| handle.name == name)
                .map(|handle| (handle.name.clone(), handle.width, handle.height, handle.dpi));
            if let Some(found) = handle {
                self.image_index.insert(
                    source.to_string(),
                    ImageHandle {
                        name: found.0.clone(),
                        width: found.1,
                        height: found.2,
                        dpi: found.3,
                    },
                );
                return Ok(found);
            }
        }

        let png = decode_png(&bytes).map_err(io::Error::from)?;
        let image = png.to_pdf_image().map_err(io::Error::from)?;
        let color_space = self.color_space_entry(&image.color_space)?;

        let mask_entry = match &image.mask {
            MaskKind::None => String::new(),
            MaskKind::ColorKey(pairs) => {
                let values: Vec<String> = pairs.iter().map(|v| v.to_string()).collect();
                format!(" /Mask [{}]", values.join(" "))
            }
            MaskKind::Soft(data) => {
                let extra = format!(
                    "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace /DeviceGray /BitsPerComponent 8",
                    image.width, image.height
                );
                let id = self.put_stream(&extra, data, false)?;
                format!(" /SMask {id} 0 R")
            }
            MaskKind::Stencil(data) => {
                let extra = format!(
                    "/Type /XObject /Subtype /Image /Width {} /Height {} /ImageMask true /BitsPerComponent 1 /Decode [0 1]",
                    image.width, image.height
                );
                let id = self.put_stream(&extra, data, false)?;
                format!(" /Mask {id} 0 R")
            }
        };

        let mut extra = format!(
            "/Type /XObject /Subtype /Image /Width {} /Height {} /ColorSpace {} /BitsPerComponent {}{}",
            image.width, image.height, color_space, image.bits_per_component, mask_entry
        );
        if let Some(parms) = &image.decode_parms {
            extra.push_str(&format!(" /DecodeParms {parms}"));
        }
        let id = self.put_stream(&extra, &image.data, image.passthrough)?;

        let name = format!("X{}", self.next_image_index);
        self.next_image_index += 1;
        self.images.push((name.clone(), id));
        self.image_content.insert(hash, name.clone());
        self.image_index.insert(
            source.to_string(),
            ImageHandle {
                name: name.clone(),
                width: image.width,
                height: image.height,
                dpi: image.dpi,
            },
        );
        if let Some(logger) = &self.debug {
            logger.increment("images", 1);
            logger.increment("image_bytes", image.data.len() as u64);
        }
        Ok((name, image.width, image.height, image.dpi))
    }

    fn color_space_entry(&mut self, spec: &ColorSpaceSpec) -> io::Result<String> {
        match spec {
            ColorSpaceSpec::Name(name) => Ok((*name).to_string()),
            ColorSpaceSpec::Cal(array) => Ok(array.clone()),
            ColorSpaceSpec::Icc {
                components,
                profile,
            } => {
                let id = self.put_stream(&format!("/N {components}"), profile, false)?;
                Ok(format!("[/ICCBased {id} 0 R]"))
            }
            ColorSpaceSpec::Indexed { base, last, table } => {
                let base = self.color_space_entry(base.as_ref())?;
                Ok(format!(
                    "[/Indexed {base} {last} <{}>]",
                    hex_encode(table)
                ))
            }
        }
    }

    fn render_commands(&mut self, commands: &[Command]) -> io::Result<String> {
        let page_height = self.page_size.height;
        let mut out = String::new();
        let mut font_name: Option<String> = None;
        let mut font_size = Pt::from_i32(12);
        let mut char_spacing = Pt::ZERO;
        let mut text_rise = Pt::ZERO;

        for command in commands {
            match command {
                Command::SaveState => out.push_str("q\n"),
                Command::RestoreState => out.push_str("Q\n"),
                Command::Translate(x, y) => {
                    out.push_str(&format!("1 0 0 1 {} {} cm\n", fmt_pt(*x), fmt_pt(*y)));
                }
                Command::Scale(x, y) => {
                    out.push_str(&format!("{} 0 0 {} 0 0 cm\n", fmt(*x), fmt(*y)));
                }
                Command::Rotate(angle) => {
                    let sin = libm::sinf(*angle);
                    let cos = libm::cosf(*angle);
                    out.push_str(&format!(
                        "{} {} {} {} 0 0 cm\n",
                        fmt(cos),
                        fmt(sin),
                        fmt(-sin),
                        fmt(cos)
                    ));
                }
                Command::ConcatMatrix { a, b, c, d, e, f } => {
                    out.push_str(&format!(
                        "{} {} {} {} {} {} cm\n",
                        fmt(*a),
                        fmt(*b),
                        fmt(*c),
                        fmt(*d),
                        fmt_pt(*e),
                        fmt_pt(*f)
                    ));
                }
                Command::SetFillColor(color) => {
                    out.push_str(&color_to_fill(*color));
                }
                Command::SetFontName(name) => font_name = Some(name.clone()),
                Command::SetFontSize(size) => font_size = *size,
                Command::SetCharSpacing(spacing) => char_spacing = *spacing,
                Command::SetTextRise(rise) => text_rise = *rise,
                Command::DrawString { x, y, text } => {
                    let name = font_name.clone().ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::InvalidInput,
                            "text drawn before any font was selected",
                        )
                    })?;
                    let index = self.ensure_font(&name)?;
                    let mut glyphs = String::new();
                    for ch in text.chars() {
                        let ix = self.fonts[index].subset.map_char(ch);
                        glyphs.push_str(&format!("{ix:04X}"));
                    }
                    out.push_str("BT\n");
                    out.push_str(&format!(
                        "/{} {} Tf\n",
                        self.fonts[index].resource,
                        fmt_pt(font_size)
                    ));
                    if char_spacing != Pt::ZERO {
                        out.push_str(&format!("{} Tc\n", fmt_pt(char_spacing)));
                    }
                    if text_rise != Pt::ZERO {
                        out.push_str(&format!("{} Ts\n", fmt_pt(text_rise)));
                    }
                    out.push_str(&format!(
                        "{} {} Td\n",
                        fmt_pt(*x),
                        fmt_pt(page_height - *y)
                    ));
                    out.push_str(&format!("<{glyphs}> Tj\n"));
                    out.push_str("ET\n");
                }
                Command::MoveTo { x, y } => {
                    out.push_str(&format!("{} {} m\n", fmt_pt(*x), fmt_pt(page_height - *y)));
                }
                Command::LineTo { x, y } => {
                    out.push_str(&format!("{} {} l\n", fmt_pt(*x), fmt_pt(page_height - *y)));
                }
                Command::CurveTo {
                    x1,
                    y1,
                    x2,
                    y2,
                    x,
                    y,
                } => {
                    out.push_str(&format!(
                        "{} {} {} {} {} {} c\n",
                        fmt_pt(*x1),
                        fmt_pt(page_height - *y1),
                        fmt_pt(*x2),
                        fmt_pt(page_height - *y2),
                        fmt_pt(*x),
                        fmt_pt(page_height - *y)
                    ));
                }
                Command::ClosePath => out.push_str("h\n"),
                Command::Fill => out.push_str("f\n"),
                Command::Stroke => out.push_str("S\n"),
                Command::DrawRect {
                    x,
                    y,
                    width,
                    height,
                } => {
                    out.push_str(&format!(
                        "{} {} {} {} re\n",
                        fmt_pt(*x),
                        fmt_pt(page_height - *y - *height),
                        fmt_pt(*width),
                        fmt_pt(*height)
                    ));
                }
                Command::DrawImage {
                    x,
                    y,
                    width,
                    height,
                    source,
                } => {
                    let (name, px_w, px_h, dpi) = self.ensure_image(source)?;
                    let dpi = dpi.unwrap_or(self.options.default_dpi).max(1);
                    let w = if *width == Pt::ZERO {
                        Pt::from_f32(px_w as f32 * 72.0 / dpi as f32)
                    } else {
                        *width
                    };
                    let h = if *height == Pt::ZERO {
                        Pt::from_f32(px_h as f32 * 72.0 / dpi as f32)
                    } else {
                        *height
                    };
                    out.push_str("q\n");
                    out.push_str(&format!(
                        "{} 0 0 {} {} {} cm\n",
                        fmt_pt(w),
                        fmt_pt(h),
                        fmt_pt(*x),
                        fmt_pt(page_height - *y - h)
                    ));
                    out.push_str(&format!("/{name} Do\n"));
                    out.push_str("Q\n");
                }
            }
        }
        Ok(out)
    }

    pub(crate) fn finish(&mut self) -> io::Result<usize> {
        let t_finish = std::time::Instant::now();

        let kids: Vec<String> = self.page_refs.iter().map(|id| format!("{id} 0 R")).collect();
        let pages = format!(
            "<< /Type /Pages /Kids [{}] /Count {} >>",
            kids.join(" "),
            self.page_refs.len()
        );
        let pages_id = self.pages_id;
        self.write_object(pages_id, pages.as_bytes())?;

        let catalog_id = self.alloc_obj();
        let catalog = format!("<< /Type /Catalog /Pages {pages_id} 0 R >>");
        self.write_object(catalog_id, catalog.as_bytes())?;

        let info_id = self.alloc_obj();
        let title = self.options.title.clone().unwrap_or_else(|| "Untitled".to_string());
        let mut info = b"<< /Title ".to_vec();
        info.extend_from_slice(&pdf_string(&title));
        info.extend_from_slice(b" /Producer (vellum) >>");
        self.write_object(info_id, &info)?;

        // Font subsets materialize last; their object ids were reserved
        // when the font was first used.
        let deferred = std::mem::take(&mut self.deferred);
        let mut fonts = std::mem::take(&mut self.fonts);
        for item in deferred {
            match item {
                DeferredObject::FontSubset { font_index } => {
                    self.write_font_objects(&mut fonts[font_index])?;
                }
            }
        }

        let total_objects = self.next_id - 1;
        let xref_start = self.offset;
        self.write_bytes(format!("xref\n0 {}\n", total_objects + 1).as_bytes())?;
        self.write_bytes(b"0000000000 65535 f \n")?;
        for index in 0..total_objects {
            let entry = format!("{:010} 00000 n \n", self.offsets[index]);
            self.write_bytes(entry.as_bytes())?;
        }
        let trailer = format!(
            "trailer\n<< /Size {} /Root {} 0 R /Info {} 0 R >>\nstartxref\n{}\n%%EOF\n",
            total_objects + 1,
            catalog_id,
            info_id,
            xref_start
        );
        self.write_bytes(trailer.as_bytes())?;

        if let Some(logger) = &self.debug {
            logger.increment("fonts", fonts.len() as u64);
            logger.increment("bytes", self.offset as u64);
            logger.log_span_ms("finish", t_finish.elapsed().as_secs_f64() * 1000.0);
            logger.emit_summary("document");
            logger.flush();
        }
        Ok(self.offset)
    }

    fn write_font_objects(&mut self, font: &mut DocFont<'a>) -> io::Result<()> {
        let font_file_id = font.start_id;
        let descriptor_id = font.start_id + 1;
        let cid_font_id = font.start_id + 2;
        let to_unicode_id = font.start_id + 3;
        let type0_id = font.start_id + 4;

        let program = font.subset.build().map_err(io::Error::from)?;
        self.stream_object_at(
            font_file_id,
            &format!("/Length1 {}", program.len()),
            &program,
            false,
        )?;

        let face = font.subset.face();
        let scale = 1000.0 / face.units_per_em().max(1) as f32;
        let scaled = |v: i16| (v as f32 * scale).round() as i32;
        let base_name = format!("{}+{}", subset_tag(&font.name), sanitize_name(&font.name));

        let descriptor = format!(
            "<< /Type /FontDescriptor /FontName /{} /Flags 4 /FontBBox [{} {} {} {}] /ItalicAngle 0 /Ascent {} /Descent {} /CapHeight {} /StemV 80 /FontFile2 {} 0 R >>",
            base_name,
            0,
            scaled(face.descent()),
            1000,
            scaled(face.ascent()),
            scaled(face.ascent()),
            scaled(face.descent()),
            scaled(face.cap_height()),
            font_file_id
        );
        self.write_object(descriptor_id, descriptor.as_bytes())?;

        let widths: Vec<String> = font
            .subset
            .widths()
            .iter()
            .map(|&w| ((w as f32 * scale).round() as i32).to_string())
            .collect();
        let cid_font = format!(
            "<< /Type /Font /Subtype /CIDFontType2 /BaseFont /{} /CIDSystemInfo << /Registry (Adobe) /Ordering (UCS) /Supplement 0 >> /FontDescriptor {} 0 R /W [0 [{}]] /CIDToGIDMap /Identity >>",
            base_name,
            descriptor_id,
            widths.join(" ")
        );
        self.write_object(cid_font_id, cid_font.as_bytes())?;

        let cmap = font.subset.to_unicode_cmap();
        self.stream_object_at(to_unicode_id, "", cmap.as_bytes(), false)?;

        let type0 = format!(
            "<< /Type /Font /Subtype /Type0 /BaseFont /{} /Encoding /Identity-H /DescendantFonts [{} 0 R] /ToUnicode {} 0 R >>",
            base_name, cid_font_id, to_unicode_id
        );
        self.write_object(type0_id, type0.as_bytes())?;

        if let Some(logger) = &self.debug {
            logger.increment("font_bytes", program.len() as u64);
            logger.increment("subset_glyphs", font.subset.glyph_count() as u64);
        }
        Ok(())
    }
}

pub fn write_document<W: Write>(
    document: &Document,
    registry: Option<&FontRegistry>,
    options: &PdfOptions,
    writer: &mut W,
) -> io::Result<usize> {
    let mut stream = PdfStreamWriter::new(writer, document.page_size, registry, options.clone())?;
    for page in &document.pages {
        stream.add_page(&page.commands)?;
    }
    stream.finish()
}

pub fn document_to_pdf(document: &Document) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_document(document, None, &PdfOptions::default(), &mut out)?;
    Ok(out)
}

pub fn document_to_pdf_with_registry(
    document: &Document,
    registry: &FontRegistry,
) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_document(document, Some(registry), &PdfOptions::default(), &mut out)?;
    Ok(out)
}

pub fn document_to_pdf_with_options(
    document: &Document,
    registry: Option<&FontRegistry>,
    options: &PdfOptions,
) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_document(document, registry, options, &mut out)?;
    Ok(out)
}

fn load_image_bytes(source: &str) -> io::Result<Vec<u8>> {
    if let Some(rest) = source.strip_prefix("data:") {
        let (meta, payload) = rest.split_once(',').ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "malformed data URI")
        })?;
        if !meta.ends_with(";base64") {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "only base64 data URIs are supported",
            ));
        }
        return base64::engine::general_purpose::STANDARD
            .decode(payload)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err));
    }
    std::fs::read(source)
}

fn hash_bytes(data: &[u8]) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    data.hash(&mut hasher);
    hasher.finish()
}

// Six uppercase letters derived from the font name, prefixed to subset
// base names.
fn subset_tag(name: &str) -> String {
    let mut hash = hash_bytes(name.as_bytes());
    let mut tag = String::with_capacity(6);
    for _ in 0..6 {
        tag.push((b'A' + (hash % 26) as u8) as char);
        hash /= 26;
    }
    tag
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if cleaned.is_empty() {
        "Font".to_string()
    } else {
        cleaned
    }
}

// PDF string: pure-ASCII text stays literal; anything else is UTF-16BE
// with a BOM. Backslash, parens, and CR are escaped byte-wise.
fn pdf_string(text: &str) -> Vec<u8> {
    let bytes: Vec<u8> = if text.bytes().all(|b| b < 128) {
        text.as_bytes().to_vec()
    } else {
        let mut utf16 = vec![0xFE, 0xFF];
        for unit in text.encode_utf16() {
            utf16.extend_from_slice(&unit.to_be_bytes());
        }
        utf16
    };
    let mut out = vec![b'('];
    for b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b'(' => out.extend_from_slice(b"\\("),
            b')' => out.extend_from_slice(b"\\)"),
            b'\r' => out.extend_from_slice(b"\\015"),
            other => out.push(other),
        }
    }
    out.push(b')');
    out
}

fn hex_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 2);
    for b in data {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

fn color_to_fill(color: Color) -> String {
    format!(
        "{} {} {} rg\n",
        fmt(color.r),
        fmt(color.g),
        fmt(color.b)
    )
}

fn format_milli(milli: i64) -> String {
    if milli == 0 {
        return "0".to_string();
    }
    let sign = if milli < 0 { "-" } else { "" };
    let abs = milli.abs();
    let int_part = abs / 1000;
    let frac_part = abs % 1000;
    if frac_part == 0 {
        format!("{}{}", sign, int_part)
    } else {
        let mut s = format!("{}{}.{:03}", sign, int_part, frac_part);
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
        s
    }
}

fn fmt_pt(value: Pt) -> String {
    format_milli(value.to_milli_i64())
}

fn fmt(value: f32) -> String {
    if !value.is_finite() {
        return "0".to_string();
    }
    format_milli((value as f64 * 1000.0).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canvas::{Document, Page};
    use crate::font::testfont;
    use std::io::Read as _;
    use std::io::Write as _;

    fn one_page_document(commands: Vec<Command>) -> Document {
        Document {
            page_size: Size::a4(),
            pages: vec![Page { commands }],
        }
    }

    fn load(bytes: &[u8]) -> lopdf::Document {
        lopdf::Document::load_mem(bytes).expect("lopdf parses our output")
    }

    fn png_chunk(ctype: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(ctype);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0u8; 4]);
        out
    }

    fn tiny_png(color_type: u8, scanlines: &[u8], width: u32, height: u32) -> Vec<u8> {
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(scanlines).expect("compress");
        let idat = enc.finish().expect("finish");
        let mut ihdr = Vec::new();
        ihdr.extend_from_slice(&width.to_be_bytes());
        ihdr.extend_from_slice(&height.to_be_bytes());
        ihdr.extend_from_slice(&[8, color_type, 0, 0, 0]);
        let mut out = vec![137, 80, 78, 71, 13, 10, 26, 10];
        out.extend_from_slice(&png_chunk(b"IHDR", &ihdr));
        out.extend_from_slice(&png_chunk(b"IDAT", &idat));
        out.extend_from_slice(&png_chunk(b"IEND", &[]));
        out
    }

    fn data_uri(bytes: &[u8]) -> String {
        format!(
            "data:image/png;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(bytes)
        )
    }

    #[test]
    fn empty_page_produces_five_objects() {
        let document = one_page_document(vec![]);
        let options = PdfOptions {
            title: Some("X".to_string()),
            ..Default::default()
        };
        let bytes = document_to_pdf_with_options(&document, None, &options).expect("pdf");
        assert!(bytes.starts_with(b"%PDF-1.4\n"));
        assert!(bytes.ends_with(b"%%EOF\n"));
        let text = String::from_utf8_lossy(&bytes);
        // pages, content, page, catalog, info
        assert!(text.contains("xref\n0 6\n"));
        assert!(text.contains("/Size 6"));
        assert!(text.contains("/Root"));
        assert!(text.contains("/Info"));
        assert!(text.contains("/Title (X)"));

        let doc = load(&bytes);
        assert_eq!(doc.get_pages().len(), 1);
    }

    #[test]
    fn xref_offsets_point_at_object_headers() {
        let document = one_page_document(vec![Command::DrawRect {
            x: Pt::from_i32(10),
            y: Pt::from_i32(10),
            width: Pt::from_i32(100),
            height: Pt::from_i32(50),
        }]);
        let bytes = document_to_pdf(&document).expect("pdf");
        // Byte-level checks: the header's binary comment line keeps the
        // whole file out of valid UTF-8.
        let find_last = |needle: &[u8]| {
            bytes
                .windows(needle.len())
                .rposition(|w| w == needle)
                .expect("needle present")
        };
        let xref_at = find_last(b"\nxref\n") + 1;
        let startxref_at = find_last(b"startxref\n") + 10;
        let tail = std::str::from_utf8(&bytes[startxref_at..]).expect("ascii tail");
        let start_value: usize = tail.lines().next().expect("value").trim().parse().expect("number");
        assert_eq!(start_value, xref_at);

        // Every in-use entry points at "N 0 obj".
        let table = std::str::from_utf8(&bytes[xref_at..]).expect("ascii table");
        for (index, line) in table.lines().skip(3).take_while(|l| l.ends_with("n ")).enumerate() {
            let offset: usize = line[..10].parse().expect("offset");
            let header = format!("{} 0 obj", index + 1);
            assert!(
                bytes[offset..].starts_with(header.as_bytes()),
                "object {} not at {}",
                index + 1,
                offset
            );
        }
    }

    #[test]
    fn content_stream_decodes_and_carries_operators() {
        let document = one_page_document(vec![
            Command::SetFillColor(Color::rgb(1.0, 0.0, 0.0)),
            Command::DrawRect {
                x: Pt::from_i32(72),
                y: Pt::from_i32(72),
                width: Pt::from_i32(100),
                height: Pt::from_i32(40),
            },
            Command::Fill,
        ]);
        let bytes = document_to_pdf(&document).expect("pdf");
        let doc = load(&bytes);
        let page_id = *doc.get_pages().get(&1).expect("page 1");
        let content = doc.get_page_content(page_id).expect("content");
        let text = String::from_utf8_lossy(&content);
        assert!(text.contains("1 0 0 rg"));
        assert!(text.contains("re"));
        assert!(text.contains("f"));
    }

    #[test]
    fn text_page_embeds_a_font_subset() {
        let mut registry = FontRegistry::new();
        registry
            .register_bytes("Sample", testfont::sample_font())
            .expect("register");
        let document = one_page_document(vec![
            Command::SetFontName("Sample".to_string()),
            Command::SetFontSize(Pt::from_i32(14)),
            Command::DrawString {
                x: Pt::from_i32(72),
                y: Pt::from_i32(100),
                text: "AB".to_string(),
            },
        ]);
        let bytes = document_to_pdf_with_registry(&document, &registry).expect("pdf");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/Subtype /Type0"));
        assert!(text.contains("/Encoding /Identity-H"));
        assert!(text.contains("/Subtype /CIDFontType2"));
        assert!(text.contains("/W [0 [600 650]]"));
        assert!(text.contains("/CIDToGIDMap /Identity"));

        let doc = load(&bytes);
        // The font program stream carries /Length1 and decodes to an sfnt
        // with the six subset tables.
        let (program, length1) = doc
            .objects
            .iter()
            .find_map(|(_, object)| {
                let stream = object.as_stream().ok()?;
                let length1 = stream.dict.get(b"Length1").ok()?.as_i64().ok()?;
                Some((stream.clone(), length1))
            })
            .expect("font file stream");
        let sfnt = program.get_plain_content().expect("inflate font");
        assert_eq!(sfnt.len() as i64, length1);
        assert_eq!(&sfnt[..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(u16::from_be_bytes([sfnt[4], sfnt[5]]), 6);

        // Page content references the font and both glyphs.
        let page_id = *doc.get_pages().get(&1).expect("page 1");
        let content = doc.get_page_content(page_id).expect("content");
        let content_text = String::from_utf8_lossy(&content);
        assert!(content_text.contains("/F1 14 Tf"));
        assert!(content_text.contains("<00000001> Tj"));
    }

    #[test]
    fn tounicode_stream_round_trips() {
        let mut registry = FontRegistry::new();
        registry
            .register_bytes("Sample", testfont::sample_font())
            .expect("register");
        let document = one_page_document(vec![
            Command::SetFontName("Sample".to_string()),
            Command::DrawString {
                x: Pt::from_i32(10),
                y: Pt::from_i32(10),
                text: "AB".to_string(),
            },
        ]);
        let bytes = document_to_pdf_with_registry(&document, &registry).expect("pdf");
        let doc = load(&bytes);
        let cmap = doc
            .objects
            .iter()
            .find_map(|(_, object)| {
                let stream = object.as_stream().ok()?;
                let plain = stream.get_plain_content().ok()?;
                let text = String::from_utf8(plain).ok()?;
                text.contains("beginbfrange").then_some(text)
            })
            .expect("tounicode stream");
        assert!(cmap.contains("<0000> <0001> [<0041> <0042>]"));
    }

    #[test]
    fn image_page_embeds_an_xobject_with_decode_parms() {
        // 2x2 truecolor, filter 0 rows.
        let png = tiny_png(
            2,
            &[
                0, 255, 0, 0, 0, 255, 0, //
                0, 0, 0, 255, 255, 255, 255,
            ],
            2,
            2,
        );
        let document = one_page_document(vec![Command::DrawImage {
            x: Pt::from_i32(10),
            y: Pt::from_i32(10),
            width: Pt::from_i32(144),
            height: Pt::from_i32(144),
            source: data_uri(&png),
        }]);
        let bytes = document_to_pdf(&document).expect("pdf");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/Subtype /Image"));
        assert!(text.contains("/Width 2"));
        assert!(text.contains("/DecodeParms << /Predictor 15 /Colors 3 /BitsPerComponent 8 /Columns 2 >>"));
        assert!(text.contains("/X1 Do"));

        let doc = load(&bytes);
        let image = doc
            .objects
            .iter()
            .find_map(|(_, object)| {
                let stream = object.as_stream().ok()?;
                (stream.dict.get(b"Subtype").ok()?.as_name().ok()? == b"Image").then(|| stream.clone())
            })
            .expect("image stream");
        // The embedded stream is the PNG's own IDAT payload; inflating it
        // yields the filtered scanlines untouched.
        let mut scanlines = Vec::new();
        flate2::read::ZlibDecoder::new(image.content.as_slice())
            .read_to_end(&mut scanlines)
            .expect("inflate image stream");
        assert_eq!(
            scanlines,
            vec![0, 255, 0, 0, 0, 255, 0, 0, 0, 0, 255, 255, 255, 255]
        );
    }

    #[test]
    fn rgba_image_gets_a_soft_mask() {
        let png = tiny_png(6, &[0, 10, 20, 30, 255, 40, 50, 60, 0], 2, 1);
        let document = one_page_document(vec![Command::DrawImage {
            x: Pt::ZERO,
            y: Pt::ZERO,
            width: Pt::from_i32(72),
            height: Pt::from_i32(36),
            source: data_uri(&png),
        }]);
        let bytes = document_to_pdf(&document).expect("pdf");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("/SMask"));
        load(&bytes);
    }

    #[test]
    fn identical_image_content_is_embedded_once() {
        let png = tiny_png(2, &[0, 1, 2, 3, 4, 5, 6], 2, 1);
        let uri = data_uri(&png);
        let commands = vec![
            Command::DrawImage {
                x: Pt::ZERO,
                y: Pt::ZERO,
                width: Pt::from_i32(10),
                height: Pt::from_i32(10),
                source: uri.clone(),
            },
            Command::DrawImage {
                x: Pt::from_i32(20),
                y: Pt::ZERO,
                width: Pt::from_i32(10),
                height: Pt::from_i32(10),
                source: uri,
            },
        ];
        let document = one_page_document(commands);
        let bytes = document_to_pdf(&document).expect("pdf");
        let text = String::from_utf8_lossy(&bytes);
        assert_eq!(text.matches("/Subtype /Image").count(), 1);
    }

    #[test]
    fn pdf_strings_escape_and_promote_to_utf16() {
        assert_eq!(pdf_string("X"), b"(X)".to_vec());
        assert_eq!(pdf_string("a(b)\\"), b"(a\\(b\\)\\\\)".to_vec());
        assert_eq!(pdf_string("a\rb"), b"(a\\015b)".to_vec());
        let unicode = pdf_string("né");
        assert_eq!(&unicode[..3], &[b'(', 0xFE, 0xFF]);
        assert!(unicode.ends_with(b")"));
    }

    #[test]
    fn uncompressed_output_skips_the_filter() {
        let document = one_page_document(vec![Command::DrawRect {
            x: Pt::ZERO,
            y: Pt::ZERO,
            width: Pt::from_i32(10),
            height: Pt::from_i32(10),
        }]);
        let options = PdfOptions {
            compress: false,
            ..Default::default()
        };
        let bytes = document_to_pdf_with_options(&document, None, &options).expect("pdf");
        let text = String::from_utf8_lossy(&bytes);
        assert!(!text.contains("/Filter /FlateDecode"));
        assert!(text.contains("re"));
        load(&bytes);
    }

    #[test]
    fn missing_font_is_an_input_error() {
        let document = one_page_document(vec![
            Command::SetFontName("Ghost".to_string()),
            Command::DrawString {
                x: Pt::ZERO,
                y: Pt::ZERO,
                text: "x".to_string(),
            },
        ]);
        let err = document_to_pdf(&document).expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
