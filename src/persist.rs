// Persistence - names output files and writes finished images to disk

use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use imagent::GeneratedImage;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Characters that are not allowed in file names on common filesystems
pub const ILLEGAL_FILENAME_CHARS: &[char] = &['\\', '/', '*', '?', ':', '"', '<', '>', '|'];

/// Maximum slug length, in characters
pub const SLUG_MAX_CHARS: usize = 50;

/// Drop illegal characters and keep at most 50 characters
pub fn slugify(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| !ILLEGAL_FILENAME_CHARS.contains(c))
        .take(SLUG_MAX_CHARS)
        .collect()
}

/// `YYYYMMDD_HHMMSS_<slug>.png`. Same second and same slug give the same name.
pub fn image_filename(timestamp: &DateTime<Local>, prompt: &str) -> String {
    format!("{}_{}.png", timestamp.format("%Y%m%d_%H%M%S"), slugify(prompt))
}

/// Create the output directory (and parents) if needed
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| Error::OutputDir {
        path: dir.to_path_buf(),
        source,
    })
}

/// Encode `image` as PNG and write it to `dir`, named from `prompt` and the current time.
///
/// The bytes go to a temporary file in the same directory which is then renamed
/// into place, so a reader never sees a partial PNG. An existing file with the
/// same name is replaced.
pub fn save_image(image: &GeneratedImage, prompt: &str, dir: &Path) -> Result<PathBuf> {
    save_image_at(image, prompt, dir, &Local::now())
}

pub fn save_image_at(
    image: &GeneratedImage,
    prompt: &str,
    dir: &Path,
    timestamp: &DateTime<Local>,
) -> Result<PathBuf> {
    ensure_dir(dir)?;

    let png = image.encode_png()?;
    let path = dir.join(image_filename(timestamp, prompt));

    let write_err = |source: std::io::Error| Error::Write {
        path: path.clone(),
        source,
    };

    let mut tmp = tempfile::Builder::new()
        .prefix(".promptcanvas-")
        .suffix(".png.part")
        .tempfile_in(dir)
        .map_err(write_err)?;
    tmp.write_all(&png).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(&path).map_err(|e| write_err(e.error))?;

    tracing::debug!("Wrote {} bytes to {}", png.len(), path.display());
    Ok(path)
}
