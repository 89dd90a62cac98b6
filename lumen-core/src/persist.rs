//! Best-effort archival of generated images. Nothing here is authoritative:
//! the files are never read back, and write failures must stay invisible to
//! the request that triggered them.

use std::path::{Path, PathBuf};

use anyhow::Context;
use image::RgbImage;

use crate::GenerateError;

/// Fixed output directory, relative to the working directory.
pub const OUTPUT_DIR: &str = "data/generated_images";

const MAX_STEM_LEN: usize = 50;

/// Derives a filename stem from a raw prompt: alphanumerics, spaces, dashes
/// and underscores only, trailing whitespace stripped, at most 50 chars.
pub fn sanitize_file_stem(prompt: &str) -> String {
    prompt
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '-' | '_'))
        .collect::<String>()
        .trim_end()
        .chars()
        .take(MAX_STEM_LEN)
        .collect()
}

/// Writes the image as `<dir>/<sanitized prompt>.png`, creating the
/// directory if needed. Two prompts that sanitize identically overwrite each
/// other; last writer wins.
pub fn save(dir: &Path, prompt: &str, image: &RgbImage) -> Result<PathBuf, GenerateError> {
    let write = || -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = dir.join(format!("{}.png", sanitize_file_stem(prompt)));
        image
            .save(&path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    };
    write().map_err(GenerateError::Persistence)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn sanitize_keeps_safe_characters() {
        assert_eq!(sanitize_file_stem("a red fox"), "a red fox");
        assert_eq!(sanitize_file_stem("snow_cap-2"), "snow_cap-2");
    }

    #[test]
    fn sanitize_drops_punctuation_and_trailing_space() {
        assert_eq!(sanitize_file_stem("a fox! (paint) "), "a fox paint");
        assert_eq!(sanitize_file_stem("what?!"), "what");
    }

    #[test]
    fn sanitize_truncates_to_fifty_chars() {
        let long = "x".repeat(80);
        assert_eq!(sanitize_file_stem(&long).len(), 50);
    }

    #[test]
    fn save_writes_png_in_directory() {
        let dir = tempfile::tempdir().unwrap();
        let image = RgbImage::new(8, 8);
        let path = save(dir.path(), "tiny test", &image).unwrap();
        assert_eq!(path, dir.path().join("tiny test.png"));
        assert!(path.exists());
    }

    #[test]
    fn save_reports_unwritable_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("occupied");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let image = RgbImage::new(8, 8);
        let err = save(&blocker, "tiny test", &image).unwrap_err();
        assert!(matches!(err, GenerateError::Persistence(_)));
    }
}
