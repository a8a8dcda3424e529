mod bits;
mod canvas;
mod debug;
mod deflate;
mod error;
mod font;
mod heap;
mod huffman;
mod layout;
mod lz77;
mod pdf;
mod png;
mod subset;
mod types;

pub use canvas::{Command, Document, Page};
pub use deflate::{deflate, zlib_deflate, DeflateOptions};
pub use error::VellumError;
pub use font::{FontFace, FontRegistry};
pub use layout::{Typesetter, TypesetterOptions};
pub use pdf::{
    document_to_pdf, document_to_pdf_with_options, document_to_pdf_with_registry, write_document,
    PdfOptions,
};
pub use png::{decode_png, PngImage};
pub use types::{Color, Margins, Pt, Size};
