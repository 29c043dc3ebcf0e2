//! Generated test images

use image::{ImageBuffer, ImageFormat, Rgb};
use std::io::Cursor;

/// An image fixture and how the producer should treat it.
#[derive(Debug, Clone)]
pub struct ImageFixture {
    pub name: &'static str,
    pub format: Option<ImageFormat>,
    pub mime: &'static str,
    pub accepted: bool,
}

pub const IMAGE_FIXTURES: &[ImageFixture] = &[
    ImageFixture {
        name: "gradient.png",
        format: Some(ImageFormat::Png),
        mime: "image/png",
        accepted: true,
    },
    ImageFixture {
        name: "gradient.jpg",
        format: Some(ImageFormat::Jpeg),
        mime: "image/jpeg",
        accepted: true,
    },
    ImageFixture {
        name: "notes.txt",
        format: None,
        mime: "text/plain",
        accepted: false,
    },
];

impl ImageFixture {
    pub fn bytes(&self) -> Vec<u8> {
        match self.format {
            Some(format) => encode(format, 64, 64),
            None => b"this is not an image".to_vec(),
        }
    }
}

/// A small RGB gradient encoded in `format`.
pub fn encode(format: ImageFormat, width: u32, height: u32) -> Vec<u8> {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x * 255 / width) as u8, (y * 255 / height) as u8, 96])
    });
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("Failed to encode fixture image");
    out.into_inner()
}
