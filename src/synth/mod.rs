//! Frame synthesis: every strategy yields a finite stream of RGBA frames at
//! the output size.

pub mod kenburns;
pub mod sequence;
pub mod video;

use std::path::Path;

use image::ImageReader;

use crate::error::{ConvertError, ConvertResult};

pub type Frame = image::RgbaImage;

/// Boxed frame stream handed from a synthesizer to the pipeline.
pub type Frames<'a> = Box<dyn Iterator<Item = ConvertResult<Frame>> + Send + 'a>;

fn reader(path: &Path) -> ConvertResult<ImageReader<std::io::BufReader<std::fs::File>>> {
    // uploads carry no file extension, so sniff the format from the bytes
    ImageReader::open(path)
        .and_then(|reader| reader.with_guessed_format())
        .map_err(|e| ConvertError::unsupported(format!("{}: {e}", path.display())))
}

pub fn open_image(path: &Path) -> ConvertResult<image::RgbaImage> {
    Ok(reader(path)?.decode()?.to_rgba8())
}

pub fn image_dimensions(path: &Path) -> ConvertResult<(u32, u32)> {
    Ok(reader(path)?.into_dimensions()?)
}

/// Rounds each dimension down to an even number (at least 2), as yuv420p output requires.
pub fn even_size((width, height): (u32, u32)) -> (u32, u32) {
    ((width & !1).max(2), (height & !1).max(2))
}
