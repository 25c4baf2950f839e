use std::path::Path;

use lopdf::content::{Content, Operation};
use lopdf::{Dictionary, Document, Object, Stream, dictionary};

use crate::error::SpiderError;

/// Letter-sized portrait page, 7.5 x 10 inches of drawing area.
pub(crate) const PAGE_WIDTH: f32 = 540.0;
pub(crate) const PAGE_HEIGHT: f32 = 720.0;

const FONT: &str = "F1";
// Average Helvetica glyph width as a fraction of the font size.
const GLYPH_WIDTH: f32 = 0.5;

/// 8-bit raster placed on a page as an image XObject.
#[derive(Debug, Clone)]
pub(crate) struct Raster {
    pub width: usize,
    pub height: usize,
    pub rgb: bool,
    pub pixels: Vec<u8>,
}

/// Collects drawing operations for one page and writes it as a standalone
/// single-page document.
pub(crate) struct PageBuilder {
    operations: Vec<Operation>,
    images: Vec<Raster>,
}

impl PageBuilder {
    pub fn new() -> Self {
        Self {
            operations: Vec::new(),
            images: Vec::new(),
        }
    }

    pub fn text(&mut self, x: f32, y: f32, size: f32, text: &str) {
        self.operations.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![FONT.into(), real(size)]),
            Operation::new("Td", vec![real(x), real(y)]),
            Operation::new("Tj", vec![Object::string_literal(text)]),
            Operation::new("ET", vec![]),
        ]);
    }

    pub fn centered_text(&mut self, center_x: f32, y: f32, size: f32, text: &str) {
        let width = text.chars().count() as f32 * size * GLYPH_WIDTH;
        self.text(center_x - width / 2.0, y, size, text);
    }

    pub fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: [f32; 3]) {
        self.operations.extend([
            Operation::new("q", vec![]),
            Operation::new("rg", color.iter().copied().map(real).collect()),
            Operation::new("re", vec![real(x), real(y), real(width), real(height)]),
            Operation::new("f", vec![]),
            Operation::new("Q", vec![]),
        ]);
    }

    pub fn stroke_line(&mut self, from: (f32, f32), to: (f32, f32)) {
        self.operations.extend([
            Operation::new("q", vec![]),
            Operation::new("w", vec![real(0.5)]),
            Operation::new("m", vec![real(from.0), real(from.1)]),
            Operation::new("l", vec![real(to.0), real(to.1)]),
            Operation::new("S", vec![]),
            Operation::new("Q", vec![]),
        ]);
    }

    /// Draws `raster` stretched into the box at (`x`, `y`).
    pub fn image(&mut self, raster: Raster, x: f32, y: f32, width: f32, height: f32) {
        let name = format!("Im{}", self.images.len());
        self.images.push(raster);
        self.operations.extend([
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![real(width), real(0.0), real(0.0), real(height), real(x), real(y)],
            ),
            Operation::new("Do", vec![Object::Name(name.into_bytes())]),
            Operation::new("Q", vec![]),
        ]);
    }

    pub fn save(self, path: &Path) -> Result<(), SpiderError> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Helvetica",
        });

        let mut xobjects = Dictionary::new();
        for (index, raster) in self.images.into_iter().enumerate() {
            let color_space = if raster.rgb { "DeviceRGB" } else { "DeviceGray" };
            let image = Stream::new(
                dictionary! {
                    "Type" => "XObject",
                    "Subtype" => "Image",
                    "Width" => raster.width as i64,
                    "Height" => raster.height as i64,
                    "ColorSpace" => color_space,
                    "BitsPerComponent" => 8i64,
                },
                raster.pixels,
            );
            let image_id = doc.add_object(image);
            xobjects.set(format!("Im{index}"), image_id);
        }

        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { FONT => font_id },
            "XObject" => xobjects,
        });
        let content = Content {
            operations: self.operations,
        };
        let encoded = content
            .encode()
            .map_err(|err| SpiderError::Report(err.to_string()))?;
        let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        let pages = dictionary! {
            "Type" => "Pages",
            "Kids" => vec![page_id.into()],
            "Count" => 1i64,
            "Resources" => resources_id,
            "MediaBox" => vec![real(0.0), real(0.0), real(PAGE_WIDTH), real(PAGE_HEIGHT)],
        };
        doc.objects.insert(pages_id, Object::Dictionary(pages));
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();

        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|err| SpiderError::Filesystem(err.to_string()))?;
        }
        doc.save(path)
            .map_err(|err| SpiderError::Report(format!("save {}: {err}", path.display())))?;
        Ok(())
    }
}

fn real(value: f32) -> Object {
    Object::Real(value)
}
