use std::io::Read;

use crate::error::VellumError;

// PNG decoder feeding the PDF image path. Chunk CRCs are not verified.
// The zlib layer inside IDAT and iCCP is delegated to flate2; everything
// above it (filters, interlacing, masks, colorspaces) is handled here.

const SIGNATURE: [u8; 8] = [137, 80, 78, 71, 13, 10, 26, 10];

// Adam7 pass origins and steps: (x0, y0, dx, dy).
const ADAM7: [(usize, usize, usize, usize); 7] = [
    (0, 0, 8, 8),
    (4, 0, 8, 8),
    (0, 4, 4, 8),
    (2, 0, 4, 4),
    (0, 2, 2, 4),
    (1, 0, 2, 2),
    (0, 1, 1, 2),
];

#[derive(Debug)]
pub struct PngImage {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub color_type: u8,
    channels: u8,
    interlaced: bool,
    // Post-filter, deinterlaced scanlines at source depth, alpha included.
    raw: Vec<u8>,
    // The deflated IDAT payload exactly as stored.
    idat: Vec<u8>,
    gamma: Option<f32>,
    chrm: Option<[f32; 8]>,
    srgb: bool,
    icc: Option<Vec<u8>>,
    dpi: Option<u32>,
    palette: Option<Vec<u8>>,
    trns_palette: Option<Vec<u8>>,
    trns_key: Option<[u16; 3]>,
}

// What the assembler embeds: either the untouched IDAT stream plus
// /DecodeParms for PDF-side filter inversion, or repacked sample rows.
pub(crate) struct PdfImage {
    pub width: u32,
    pub height: u32,
    pub components: u8,
    pub bits_per_component: u8,
    pub color_space: ColorSpaceSpec,
    pub data: Vec<u8>,
    pub passthrough: bool,
    pub decode_parms: Option<String>,
    pub mask: MaskKind,
    pub dpi: Option<u32>,
}

pub(crate) enum ColorSpaceSpec {
    Name(&'static str),
    Cal(String),
    Icc { components: u8, profile: Vec<u8> },
    Indexed {
        base: Box<ColorSpaceSpec>,
        last: usize,
        table: Vec<u8>,
    },
}

pub(crate) enum MaskKind {
    None,
    // /Mask array, value pairs per component at the output depth.
    ColorKey(Vec<u32>),
    // 1-bit stencil, rows packed MSB-first; set bits are masked out.
    Stencil(Vec<u8>),
    // 8-bit alpha plane.
    Soft(Vec<u8>),
}

fn channel_count(color_type: u8) -> Option<u8> {
    match color_type {
        0 | 3 => Some(1),
        2 => Some(3),
        4 => Some(2),
        6 => Some(4),
        _ => None,
    }
}

fn depth_valid(color_type: u8, depth: u8) -> bool {
    match color_type {
        0 => matches!(depth, 1 | 2 | 4 | 8 | 16),
        3 => matches!(depth, 1 | 2 | 4 | 8),
        2 | 4 | 6 => matches!(depth, 8 | 16),
        _ => false,
    }
}

fn inflate(data: &[u8], what: &str) -> Result<Vec<u8>, VellumError> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|err| VellumError::Image(format!("{what} inflate failed: {err}")))?;
    Ok(out)
}

// Reads pixel `i` from a packed scanline. Sub-byte pixels are MSB-first
// within each byte; multi-byte pixels are big-endian.
fn pixel_get(row: &[u8], bits_per_pixel: usize, i: usize) -> u64 {
    if bits_per_pixel % 8 == 0 {
        let bytes = bits_per_pixel / 8;
        let mut v = 0u64;
        for k in 0..bytes {
            v = (v << 8) | row[i * bytes + k] as u64;
        }
        v
    } else {
        let bit = i * bits_per_pixel;
        let shift = 8 - (bit % 8) - bits_per_pixel;
        ((row[bit / 8] >> shift) as u64) & ((1u64 << bits_per_pixel) - 1)
    }
}

fn pixel_put(row: &mut [u8], bits_per_pixel: usize, i: usize, value: u64) {
    if bits_per_pixel % 8 == 0 {
        let bytes = bits_per_pixel / 8;
        for k in 0..bytes {
            row[i * bytes + k] = (value >> ((bytes - 1 - k) * 8)) as u8;
        }
    } else {
        let bit = i * bits_per_pixel;
        let shift = 8 - (bit % 8) - bits_per_pixel;
        let mask = (((1u64 << bits_per_pixel) - 1) << shift) as u8;
        let byte = &mut row[bit / 8];
        *byte = (*byte & !mask) | (((value << shift) as u8) & mask);
    }
}

fn paeth(a: i32, b: i32, c: i32) -> i32 {
    let p = a + b - c;
    let pa = (p - a).abs();
    let pb = (p - b).abs();
    let pc = (p - c).abs();
    if pa <= pb && pa <= pc {
        a
    } else if pb <= pc {
        b
    } else {
        c
    }
}

// Reconstructs `height` filtered scanlines starting at src[*offset].
fn unfilter(
    src: &[u8],
    offset: &mut usize,
    width_px: usize,
    height: usize,
    bits_per_pixel: usize,
) -> Result<Vec<u8>, VellumError> {
    let bpr = (width_px * bits_per_pixel + 7) / 8;
    let unit = ((bits_per_pixel + 7) / 8).max(1);
    let mut out = vec![0u8; bpr * height];
    for y in 0..height {
        let need = *offset + 1 + bpr;
        if need > src.len() {
            return Err(VellumError::Image(format!(
                "image data truncated in row {y} (need {need}, have {})",
                src.len()
            )));
        }
        let filter = src[*offset];
        *offset += 1;
        let (prev_rows, tail) = out.split_at_mut(y * bpr);
        let row = &mut tail[..bpr];
        row.copy_from_slice(&src[*offset..*offset + bpr]);
        *offset += bpr;
        let prior = if y > 0 {
            &prev_rows[(y - 1) * bpr..]
        } else {
            &[][..]
        };
        match filter {
            0 => {}
            1 => {
                for i in unit..bpr {
                    row[i] = row[i].wrapping_add(row[i - unit]);
                }
            }
            2 => {
                if y > 0 {
                    for i in 0..bpr {
                        row[i] = row[i].wrapping_add(prior[i]);
                    }
                }
            }
            3 => {
                for i in 0..bpr {
                    let left = if i >= unit { row[i - unit] as u32 } else { 0 };
                    let up = if y > 0 { prior[i] as u32 } else { 0 };
                    row[i] = row[i].wrapping_add(((left + up) / 2) as u8);
                }
            }
            4 => {
                for i in 0..bpr {
                    let left = if i >= unit { row[i - unit] as i32 } else { 0 };
                    let up = if y > 0 { prior[i] as i32 } else { 0 };
                    let corner = if y > 0 && i >= unit {
                        prior[i - unit] as i32
                    } else {
                        0
                    };
                    row[i] = row[i].wrapping_add(paeth(left, up, corner) as u8);
                }
            }
            other => {
                return Err(VellumError::Image(format!(
                    "unknown filter {other} in row {y}"
                )));
            }
        }
    }
    Ok(out)
}

pub fn decode_png(bytes: &[u8]) -> Result<PngImage, VellumError> {
    if bytes.len() < 8 || bytes[..8] != SIGNATURE {
        return Err(VellumError::Image("bad PNG signature".to_string()));
    }

    let mut width = 0u32;
    let mut height = 0u32;
    let mut bit_depth = 0u8;
    let mut color_type = 0u8;
    let mut interlaced = false;
    let mut seen_ihdr = false;
    let mut idat: Vec<u8> = Vec::new();
    let mut palette: Option<Vec<u8>> = None;
    let mut trns_palette: Option<Vec<u8>> = None;
    let mut trns_key: Option<[u16; 3]> = None;
    let mut gamma: Option<f32> = None;
    let mut chrm: Option<[f32; 8]> = None;
    let mut srgb = false;
    let mut icc: Option<Vec<u8>> = None;
    let mut dpi: Option<u32> = None;

    let mut pos = 8usize;
    loop {
        if pos + 8 > bytes.len() {
            return Err(VellumError::Image(format!(
                "truncated chunk header at offset {pos}"
            )));
        }
        let len = u32::from_be_bytes([bytes[pos], bytes[pos + 1], bytes[pos + 2], bytes[pos + 3]])
            as usize;
        let ctype = &bytes[pos + 4..pos + 8];
        let body_at = pos + 8;
        if body_at + len + 4 > bytes.len() {
            return Err(VellumError::Image(format!(
                "truncated chunk payload at offset {pos}"
            )));
        }
        let body = &bytes[body_at..body_at + len];
        match ctype {
            b"IHDR" => {
                if len < 13 {
                    return Err(VellumError::Image("short IHDR".to_string()));
                }
                width = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                height = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
                bit_depth = body[8];
                color_type = body[9];
                if body[10] != 0 || body[11] != 0 {
                    return Err(VellumError::Image(
                        "unsupported compression or filter method".to_string(),
                    ));
                }
                interlaced = match body[12] {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(VellumError::Image(format!(
                            "unknown interlace method {other}"
                        )));
                    }
                };
                if width == 0 || height == 0 {
                    return Err(VellumError::Image("zero image dimension".to_string()));
                }
                if !depth_valid(color_type, bit_depth) {
                    return Err(VellumError::Image(format!(
                        "color type {color_type} with bit depth {bit_depth} is not valid"
                    )));
                }
                seen_ihdr = true;
            }
            b"PLTE" => palette = Some(body.to_vec()),
            b"IDAT" => idat.extend_from_slice(body),
            b"tRNS" => match color_type {
                3 => trns_palette = Some(body.to_vec()),
                0 => {
                    if len >= 2 {
                        let v = u16::from_be_bytes([body[0], body[1]]);
                        trns_key = Some([v, v, v]);
                    }
                }
                2 => {
                    if len >= 6 {
                        trns_key = Some([
                            u16::from_be_bytes([body[0], body[1]]),
                            u16::from_be_bytes([body[2], body[3]]),
                            u16::from_be_bytes([body[4], body[5]]),
                        ]);
                    }
                }
                _ => {}
            },
            b"pHYs" => {
                if len >= 9 && body[8] == 1 {
                    let ppm = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    dpi = Some((ppm as f64 * 0.0254).round() as u32);
                }
            }
            b"gAMA" => {
                if len >= 4 {
                    let raw = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    gamma = Some(raw as f32 / 100_000.0);
                }
            }
            b"cHRM" => {
                if len >= 32 {
                    let mut values = [0f32; 8];
                    for (i, value) in values.iter_mut().enumerate() {
                        let at = i * 4;
                        *value = u32::from_be_bytes([
                            body[at],
                            body[at + 1],
                            body[at + 2],
                            body[at + 3],
                        ]) as f32
                            / 100_000.0;
                    }
                    // Stored white-first; keep primaries first, white last.
                    chrm = Some([
                        values[2], values[3], values[4], values[5], values[6], values[7],
                        values[0], values[1],
                    ]);
                }
            }
            b"sRGB" => srgb = true,
            b"iCCP" => {
                // Name, null, compression method, deflated profile.
                if let Some(null) = body.iter().position(|&b| b == 0) {
                    if null + 2 <= body.len() && body[null + 1] == 0 {
                        icc = Some(inflate(&body[null + 2..], "iCCP")?);
                    }
                }
            }
            b"IEND" => break,
            _ => {}
        }
        pos = body_at + len + 4;
    }

    if !seen_ihdr {
        return Err(VellumError::Image("missing IHDR".to_string()));
    }
    if color_type == 3 && palette.is_none() {
        return Err(VellumError::Image("palette image without PLTE".to_string()));
    }

    let channels = channel_count(color_type)
        .ok_or_else(|| VellumError::Image(format!("unknown color type {color_type}")))?;
    let bits_per_pixel = channels as usize * bit_depth as usize;
    let inflated = inflate(&idat, "IDAT")?;

    let w = width as usize;
    let h = height as usize;
    let full_bpr = (w * bits_per_pixel + 7) / 8;
    let mut raw = vec![0u8; full_bpr * h];
    let mut offset = 0usize;
    if !interlaced {
        raw = unfilter(&inflated, &mut offset, w, h, bits_per_pixel)?;
    } else {
        for &(x0, y0, dx, dy) in &ADAM7 {
            if x0 >= w || y0 >= h {
                continue;
            }
            let pw = (w - x0 + dx - 1) / dx;
            let ph = (h - y0 + dy - 1) / dy;
            if pw == 0 || ph == 0 {
                continue;
            }
            let pass = unfilter(&inflated, &mut offset, pw, ph, bits_per_pixel)?;
            let pass_bpr = (pw * bits_per_pixel + 7) / 8;
            for j in 0..ph {
                let src_row = &pass[j * pass_bpr..(j + 1) * pass_bpr];
                let y = y0 + j * dy;
                let dst_row = &mut raw[y * full_bpr..(y + 1) * full_bpr];
                for i in 0..pw {
                    let value = pixel_get(src_row, bits_per_pixel, i);
                    pixel_put(dst_row, bits_per_pixel, x0 + i * dx, value);
                }
            }
        }
    }

    Ok(PngImage {
        width,
        height,
        bit_depth,
        color_type,
        channels,
        interlaced,
        raw,
        idat,
        gamma,
        chrm,
        srgb,
        icc,
        dpi,
        palette,
        trns_palette,
        trns_key,
    })
}

impl PngImage {
    // Reconstructed scanlines at source depth, alpha included.
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }

    fn bits_per_pixel(&self) -> usize {
        self.channels as usize * self.bit_depth as usize
    }

    fn row_bytes(&self) -> usize {
        (self.width as usize * self.bits_per_pixel() + 7) / 8
    }

    // Channel sample at source depth.
    fn sample(&self, x: usize, y: usize, channel: usize) -> u16 {
        let row = &self.raw[y * self.row_bytes()..];
        let pixel = pixel_get(row, self.bits_per_pixel(), x);
        let depth = self.bit_depth as usize;
        let shift = (self.channels as usize - 1 - channel) * depth;
        ((pixel >> shift) & ((1u64 << depth) - 1)) as u16
    }

    fn alpha_at(&self, x: usize, y: usize) -> u8 {
        match self.color_type {
            4 | 6 => {
                let a = self.sample(x, y, self.channels as usize - 1);
                if self.bit_depth == 16 {
                    (a >> 8) as u8
                } else {
                    a as u8
                }
            }
            3 => {
                let index = self.sample(x, y, 0) as usize;
                self.trns_palette
                    .as_ref()
                    .and_then(|t| t.get(index).copied())
                    .unwrap_or(255)
            }
            _ => 255,
        }
    }

    fn soft_mask(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let mut mask = Vec::with_capacity(w * h);
        for y in 0..h {
            for x in 0..w {
                mask.push(self.alpha_at(x, y));
            }
        }
        mask
    }

    // 1-bit stencil rows, set bits marking transparent pixels.
    fn stencil_mask(&self) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let bpr = (w + 7) / 8;
        let mut mask = vec![0u8; bpr * h];
        for y in 0..h {
            for x in 0..w {
                if self.alpha_at(x, y) == 0 {
                    mask[y * bpr + x / 8] |= 0x80 >> (x % 8);
                }
            }
        }
        mask
    }

    fn color_space(&self) -> ColorSpaceSpec {
        let components: u8 = if self.color_type == 2 || self.color_type == 6 {
            3
        } else if self.color_type == 3 {
            3 // the palette base space
        } else {
            1
        };
        let base = if let Some(profile) = self
            .icc
            .as_ref()
            .filter(|profile| !profile.is_empty())
        {
            ColorSpaceSpec::Icc {
                components,
                profile: profile.clone(),
            }
        } else if self.srgb {
            ColorSpaceSpec::Cal(cal_color_space(
                components == 1,
                2.2,
                Some([0.64, 0.33, 0.30, 0.60, 0.15, 0.06, 0.3127, 0.3290]),
            ))
        } else if self.gamma.map(|g| (g - 1.0).abs() < 1e-6).unwrap_or(true) && self.chrm.is_none()
        {
            if components == 1 {
                ColorSpaceSpec::Name("/DeviceGray")
            } else {
                ColorSpaceSpec::Name("/DeviceRGB")
            }
        } else {
            let gamma = self.gamma.map(|g| 1.0 / g).unwrap_or(1.0);
            ColorSpaceSpec::Cal(cal_color_space(components == 1, gamma, self.chrm))
        };
        if self.color_type == 3 {
            let table = self.palette.clone().unwrap_or_default();
            let last = (table.len() / 3).saturating_sub(1);
            ColorSpaceSpec::Indexed {
                base: Box::new(base),
                last,
                table,
            }
        } else {
            base
        }
    }

    pub(crate) fn to_pdf_image(&self) -> Result<PdfImage, VellumError> {
        let out_depth = self.bit_depth.min(8);
        let components: u8 = match self.color_type {
            2 | 6 => 3,
            _ => 1,
        };

        let mask = match self.color_type {
            4 | 6 => MaskKind::Soft(self.soft_mask()),
            3 => match &self.trns_palette {
                Some(alphas) => {
                    if alphas.iter().any(|&a| a != 0 && a != 255) {
                        MaskKind::Soft(self.soft_mask())
                    } else {
                        MaskKind::Stencil(self.stencil_mask())
                    }
                }
                None => MaskKind::None,
            },
            0 | 2 => match self.trns_key {
                Some(key) => {
                    let shift = if self.bit_depth == 16 { 8 } else { 0 };
                    let mut pairs = Vec::new();
                    for c in 0..components as usize {
                        let v = (key[c] >> shift) as u32;
                        pairs.push(v);
                        pairs.push(v);
                    }
                    MaskKind::ColorKey(pairs)
                }
                None => MaskKind::None,
            },
            _ => MaskKind::None,
        };

        // The stored IDAT stream can be embedded untouched whenever PDF
        // can undo the PNG filters itself: no interlacing, no alpha to
        // strip, and a sample depth PDF 1.4 accepts.
        let passthrough =
            !self.interlaced && matches!(self.color_type, 0 | 2 | 3) && self.bit_depth <= 8;
        let (data, decode_parms) = if passthrough {
            let parms = format!(
                "<< /Predictor 15 /Colors {} /BitsPerComponent {} /Columns {} >>",
                self.channels, self.bit_depth, self.width
            );
            (self.idat.clone(), Some(parms))
        } else {
            (self.repack(components, out_depth), None)
        };

        Ok(PdfImage {
            width: self.width,
            height: self.height,
            components,
            bits_per_component: out_depth,
            color_space: self.color_space(),
            data,
            passthrough,
            decode_parms,
            mask,
            dpi: self.dpi,
        })
    }

    // Packs the reconstructed samples into PDF raster rows, dropping any
    // alpha channel and folding 16-bit samples down to 8.
    fn repack(&self, components: u8, out_depth: u8) -> Vec<u8> {
        let w = self.width as usize;
        let h = self.height as usize;
        let out_bits = components as usize * out_depth as usize;
        let out_bpr = (w * out_bits + 7) / 8;
        let mut out = vec![0u8; out_bpr * h];
        for y in 0..h {
            let row = &mut out[y * out_bpr..(y + 1) * out_bpr];
            for x in 0..w {
                let mut value = 0u64;
                for c in 0..components as usize {
                    let mut sample = self.sample(x, y, c);
                    if self.bit_depth == 16 {
                        sample >>= 8;
                    }
                    value = (value << out_depth) | sample as u64;
                }
                pixel_put(row, out_bits, x, value);
            }
        }
        out
    }
}

// CalGray/CalRGB dictionary from a white point, gamma, and primaries.
// The matrix maps RGB to XYZ with the primaries scaled so their sum hits
// the white point.
fn cal_color_space(gray: bool, gamma: f32, chrm: Option<[f32; 8]>) -> String {
    let [xr, yr, xg, yg, xb, yb, xw, yw] =
        chrm.unwrap_or([0.64, 0.33, 0.30, 0.60, 0.15, 0.06, 0.3127, 0.3290]);
    let white = [xw / yw, 1.0, (1.0 - xw - yw) / yw];
    if gray {
        return format!(
            "[/CalGray << /WhitePoint [{} {} {}] /Gamma {} >>]",
            fmt_cal(white[0]),
            fmt_cal(white[1]),
            fmt_cal(white[2]),
            fmt_cal(gamma)
        );
    }

    // Unscaled primary vectors.
    let pr = [xr / yr, 1.0, (1.0 - xr - yr) / yr];
    let pg = [xg / yg, 1.0, (1.0 - xg - yg) / yg];
    let pb = [xb / yb, 1.0, (1.0 - xb - yb) / yb];
    let scale = solve3(pr, pg, pb, white);
    let col = |p: [f32; 3], s: f32| [p[0] * s, p[1] * s, p[2] * s];
    let r = col(pr, scale[0]);
    let g = col(pg, scale[1]);
    let b = col(pb, scale[2]);
    format!(
        "[/CalRGB << /WhitePoint [{} {} {}] /Gamma [{} {} {}] /Matrix [{} {} {} {} {} {} {} {} {}] >>]",
        fmt_cal(white[0]),
        fmt_cal(white[1]),
        fmt_cal(white[2]),
        fmt_cal(gamma),
        fmt_cal(gamma),
        fmt_cal(gamma),
        fmt_cal(r[0]),
        fmt_cal(r[1]),
        fmt_cal(r[2]),
        fmt_cal(g[0]),
        fmt_cal(g[1]),
        fmt_cal(g[2]),
        fmt_cal(b[0]),
        fmt_cal(b[1]),
        fmt_cal(b[2])
    )
}

// Solves [a b c] * s = w for s by Cramer's rule; columns are the
// primary vectors.
fn solve3(a: [f32; 3], b: [f32; 3], c: [f32; 3], w: [f32; 3]) -> [f32; 3] {
    let det = |m: [[f32; 3]; 3]| -> f32 {
        m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
            - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
            + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
    };
    let full = [
        [a[0], b[0], c[0]],
        [a[1], b[1], c[1]],
        [a[2], b[2], c[2]],
    ];
    let d = det(full);
    if d.abs() < 1e-9 {
        return [1.0, 1.0, 1.0];
    }
    let with = |col: usize| {
        let mut m = full;
        for row in 0..3 {
            m[row][col] = w[row];
        }
        det(m) / d
    };
    [with(0), with(1), with(2)]
}

fn fmt_cal(value: f32) -> String {
    let s = format!("{value:.5}");
    let s = s.trim_end_matches('0').trim_end_matches('.');
    if s.is_empty() {
        "0".to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn chunk(ctype: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        out.extend_from_slice(ctype);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0u8; 4]); // CRC is not verified
        out
    }

    fn zlib(data: &[u8]) -> Vec<u8> {
        let mut enc =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(data).expect("compress");
        enc.finish().expect("finish")
    }

    fn ihdr(width: u32, height: u32, depth: u8, color_type: u8, interlace: u8) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&width.to_be_bytes());
        body.extend_from_slice(&height.to_be_bytes());
        body.extend_from_slice(&[depth, color_type, 0, 0, interlace]);
        chunk(b"IHDR", &body)
    }

    fn build_png(
        width: u32,
        height: u32,
        depth: u8,
        color_type: u8,
        interlace: u8,
        scanlines: &[u8],
        extra: &[Vec<u8>],
    ) -> Vec<u8> {
        let mut out = SIGNATURE.to_vec();
        out.extend_from_slice(&ihdr(width, height, depth, color_type, interlace));
        for chunk in extra {
            out.extend_from_slice(chunk);
        }
        out.extend_from_slice(&chunk(b"IDAT", &zlib(scanlines)));
        out.extend_from_slice(&chunk(b"IEND", &[]));
        out
    }

    #[test]
    fn rejects_bad_signature() {
        let err = decode_png(b"not a png at all").expect_err("must fail");
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn rejects_invalid_depth_for_color_type() {
        // Palette images cap at 8 bits.
        let png = build_png(1, 1, 16, 3, 0, &[0, 0], &[]);
        assert!(decode_png(&png).is_err());
    }

    #[test]
    fn truecolor_two_by_two_reconstructs() {
        let rows = [
            0u8, 255, 0, 0, 0, 255, 0, // row 0: filter none
            0, 0, 0, 255, 255, 255, 255, // row 1
        ];
        let png = build_png(2, 2, 8, 2, 0, &rows, &[]);
        let image = decode_png(&png).expect("decode");
        assert_eq!(
            image.raw_bytes(),
            &[255, 0, 0, 0, 255, 0, 0, 0, 255, 255, 255, 255]
        );
        let pdf = image.to_pdf_image().expect("pdf image");
        assert_eq!((pdf.width, pdf.height), (2, 2));
        assert_eq!(pdf.components, 3);
        assert_eq!(pdf.bits_per_component, 8);
        assert!(pdf.passthrough);
        let parms = pdf.decode_parms.expect("parms");
        assert!(parms.contains("/Predictor 15"));
        assert!(parms.contains("/Colors 3"));
        assert!(parms.contains("/Columns 2"));
        assert!(matches!(pdf.color_space, ColorSpaceSpec::Name("/DeviceRGB")));
    }

    #[test]
    fn all_filters_reconstruct() {
        // 4x5 grayscale: one row per filter type.
        let flat: Vec<u8> = (0u8..20).map(|v| v.wrapping_mul(13)).collect();
        let mut rows = Vec::new();
        // none
        rows.push(0u8);
        rows.extend_from_slice(&flat[0..4]);
        // sub
        rows.push(1);
        let mut prev = 0u8;
        for &v in &flat[4..8] {
            rows.push(v.wrapping_sub(prev));
            prev = v;
        }
        // up
        rows.push(2);
        for i in 0..4 {
            rows.push(flat[8 + i].wrapping_sub(flat[4 + i]));
        }
        // average
        rows.push(3);
        for i in 0..4 {
            let left = if i > 0 { flat[12 + i - 1] as u32 } else { 0 };
            let up = flat[8 + i] as u32;
            rows.push(flat[12 + i].wrapping_sub(((left + up) / 2) as u8));
        }
        // paeth
        rows.push(4);
        for i in 0..4 {
            let left = if i > 0 { flat[16 + i - 1] as i32 } else { 0 };
            let up = flat[12 + i] as i32;
            let corner = if i > 0 { flat[12 + i - 1] as i32 } else { 0 };
            rows.push(flat[16 + i].wrapping_sub(paeth(left, up, corner) as u8));
        }
        let png = build_png(4, 5, 8, 0, 0, &rows, &[]);
        let image = decode_png(&png).expect("decode");
        assert_eq!(image.raw_bytes(), &flat[..]);
    }

    #[test]
    fn adam7_covers_every_pixel_once() {
        // 9x9 grayscale ramp, encoded interlaced by scattering the
        // reference image into the seven passes.
        let w = 9usize;
        let h = 9usize;
        let reference: Vec<u8> = (0..w * h).map(|v| (v * 3 % 251) as u8).collect();
        let mut scanlines = Vec::new();
        for &(x0, y0, dx, dy) in &ADAM7 {
            if x0 >= w || y0 >= h {
                continue;
            }
            let pw = (w - x0 + dx - 1) / dx;
            let ph = (h - y0 + dy - 1) / dy;
            if pw == 0 || ph == 0 {
                continue;
            }
            for j in 0..ph {
                scanlines.push(0u8); // filter none
                for i in 0..pw {
                    scanlines.push(reference[(y0 + j * dy) * w + x0 + i * dx]);
                }
            }
        }
        let png = build_png(w as u32, h as u32, 8, 0, 1, &scanlines, &[]);
        let image = decode_png(&png).expect("decode");
        assert_eq!(image.raw_bytes(), &reference[..]);
        // Interlaced streams cannot pass through.
        let pdf = image.to_pdf_image().expect("pdf image");
        assert!(!pdf.passthrough);
        assert_eq!(pdf.data, reference);
    }

    #[test]
    fn palette_with_partial_alpha_builds_a_soft_mask() {
        let plte = chunk(b"PLTE", &[255, 0, 0, 0, 255, 0, 0, 0, 255]);
        let trns = chunk(b"tRNS", &[255, 128, 0]);
        // 3x1, one pixel per palette entry.
        let png = build_png(3, 1, 8, 3, 0, &[0, 0, 1, 2], &[plte, trns]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        assert!(pdf.passthrough);
        match pdf.mask {
            MaskKind::Soft(mask) => assert_eq!(mask, vec![255, 128, 0]),
            _ => panic!("expected a soft mask"),
        }
        match pdf.color_space {
            ColorSpaceSpec::Indexed { last, table, .. } => {
                assert_eq!(last, 2);
                assert_eq!(table.len(), 9);
            }
            _ => panic!("expected an indexed space"),
        }
    }

    #[test]
    fn palette_with_binary_alpha_builds_a_stencil() {
        let plte = chunk(b"PLTE", &[10, 10, 10, 20, 20, 20]);
        let trns = chunk(b"tRNS", &[0, 255]);
        let png = build_png(2, 1, 8, 3, 0, &[0, 0, 1], &[plte, trns]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        match pdf.mask {
            MaskKind::Stencil(mask) => assert_eq!(mask, vec![0x80]),
            _ => panic!("expected a stencil mask"),
        }
    }

    #[test]
    fn gray_sixteen_bit_downshifts_and_keys() {
        let trns = chunk(b"tRNS", &[0x12, 0x34]);
        // 2x1, 16-bit gray: samples 0x1234 and 0xFFEE.
        let png = build_png(2, 1, 16, 0, 0, &[0, 0x12, 0x34, 0xFF, 0xEE], &[trns]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        assert!(!pdf.passthrough);
        assert_eq!(pdf.bits_per_component, 8);
        assert_eq!(pdf.data, vec![0x12, 0xFF]);
        match pdf.mask {
            MaskKind::ColorKey(pairs) => assert_eq!(pairs, vec![0x12, 0x12]),
            _ => panic!("expected color-key masking"),
        }
    }

    #[test]
    fn truecolor_alpha_splits_into_rgb_and_soft_mask() {
        let rows = [
            0u8, 10, 20, 30, 255, 40, 50, 60, 0, // row 0: two RGBA pixels
        ];
        let png = build_png(2, 1, 8, 6, 0, &rows, &[]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        assert!(!pdf.passthrough);
        assert_eq!(pdf.components, 3);
        assert_eq!(pdf.data, vec![10, 20, 30, 40, 50, 60]);
        match pdf.mask {
            MaskKind::Soft(mask) => assert_eq!(mask, vec![255, 0]),
            _ => panic!("expected a soft mask"),
        }
    }

    #[test]
    fn sub_byte_rows_pad_to_byte_boundaries() {
        // 3x2 at 4 bits: each row is 2 bytes, low nibble of the second
        // byte padded.
        let rows = [0u8, 0x12, 0x30, 0, 0x45, 0x60];
        let png = build_png(3, 2, 4, 0, 0, &rows, &[]);
        let image = decode_png(&png).expect("decode");
        assert_eq!(image.raw_bytes(), &[0x12, 0x30, 0x45, 0x60]);
        let pdf = image.to_pdf_image().expect("pdf image");
        assert!(pdf.passthrough);
        assert_eq!(pdf.bits_per_component, 4);
    }

    #[test]
    fn gamma_and_chromaticities_build_a_cal_space() {
        let gama = chunk(b"gAMA", &45455u32.to_be_bytes());
        let mut chrm_body = Vec::new();
        for v in [31270u32, 32900, 64000, 33000, 30000, 60000, 15000, 6000] {
            chrm_body.extend_from_slice(&v.to_be_bytes());
        }
        // cHRM stores white first, then r, g, b.
        let chrm = chunk(b"cHRM", &chrm_body);
        let png = build_png(1, 1, 8, 2, 0, &[0, 1, 2, 3], &[gama, chrm]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        match pdf.color_space {
            ColorSpaceSpec::Cal(s) => {
                assert!(s.starts_with("[/CalRGB"));
                assert!(s.contains("/WhitePoint"));
                assert!(s.contains("/Matrix"));
                // 1 / 0.45455, formatted to five places.
                assert!(s.contains("/Gamma [2.19998 2.19998 2.19998]"));
            }
            _ => panic!("expected a CalRGB space"),
        }
    }

    #[test]
    fn unit_gamma_without_chromaticities_stays_device() {
        let gama = chunk(b"gAMA", &100_000u32.to_be_bytes());
        let png = build_png(1, 1, 8, 0, 0, &[0, 7], &[gama]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        assert!(matches!(pdf.color_space, ColorSpaceSpec::Name("/DeviceGray")));
    }

    #[test]
    fn phys_meters_convert_to_dpi() {
        let mut body = Vec::new();
        body.extend_from_slice(&2835u32.to_be_bytes());
        body.extend_from_slice(&2835u32.to_be_bytes());
        body.push(1);
        let phys = chunk(b"pHYs", &body);
        let png = build_png(1, 1, 8, 0, 0, &[0, 0], &[phys]);
        let image = decode_png(&png).expect("decode");
        assert_eq!(image.dpi, Some(72));
    }

    #[test]
    fn iccp_profile_is_inflated_and_attached() {
        let profile = b"fake icc profile bytes".to_vec();
        let mut body = b"name".to_vec();
        body.push(0);
        body.push(0);
        body.extend_from_slice(&zlib(&profile));
        let iccp = chunk(b"iCCP", &body);
        let png = build_png(1, 1, 8, 2, 0, &[0, 1, 2, 3], &[iccp]);
        let image = decode_png(&png).expect("decode");
        let pdf = image.to_pdf_image().expect("pdf image");
        match pdf.color_space {
            ColorSpaceSpec::Icc {
                components,
                profile: attached,
            } => {
                assert_eq!(components, 3);
                assert_eq!(attached, profile);
            }
            _ => panic!("expected an ICC space"),
        }
    }

    #[test]
    fn truncated_stream_reports_the_row() {
        // Second row missing from the stream.
        let png = build_png(2, 2, 8, 0, 0, &[0, 1, 2], &[]);
        let err = decode_png(&png).expect_err("must fail");
        assert!(err.to_string().contains("truncated"));
    }

    #[test]
    fn gamma_values_round_trip_through_the_header() {
        let gama = chunk(b"gAMA", &45455u32.to_be_bytes());
        let png = build_png(1, 1, 8, 0, 0, &[0, 0], &[gama]);
        let image = decode_png(&png).expect("decode");
        let gamma = image.gamma.expect("gamma");
        assert!((gamma - 0.45455).abs() < 1e-6);
    }
}
