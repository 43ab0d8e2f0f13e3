//! Upload checks that do not need the filesystem.

use crate::{Error, Result};
use image::ImageFormat;
use once_cell::sync::Lazy;
use regex::Regex;

/// Accepted upload filenames: prefix, device, run number for unsynced frames,
/// UTC timestamp, optional counter.
pub const FILENAME_PATTERN: &str = concat!(
    r"^(pic_[A-Za-z0-9-]{1,32}|unsynced_[A-Za-z0-9-]{1,32}_r\d{6,})",
    r"_\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}(_\d{2,})?\.jpg$",
);

static FILENAME_RE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(FILENAME_PATTERN).expect("filename pattern is valid")
});

/// Returns `true` if `name` is an acceptable upload filename.
///
/// Path separators never match, so an accepted name cannot escape the
/// device directory.
#[must_use]
pub fn is_valid_filename(name: &str) -> bool {
    FILENAME_RE.is_match(name)
}

/// Checks for a JPEG SOI marker followed by an APPn segment.
#[must_use]
pub fn has_jpeg_magic(data: &[u8]) -> bool {
    matches!(data, [0xFF, 0xD8, 0xFF, app, ..] if (0xE0..=0xEF).contains(app))
}

/// Fully decodes the upload to make sure it is a usable JPEG.
///
/// Returns the image dimensions.
///
/// # Errors
///
/// Returns [`Error::InvalidInput`] if decoding fails.
pub fn verify_jpeg(data: &[u8]) -> Result<(u32, u32)> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| Error::InvalidInput(format!("invalid jpeg: {e}")))?;
    Ok((image.width(), image.height()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("pic_01_2026-03-14_18-30-00.jpg" ; "plain")]
    #[test_case("unsynced_01_r000003_1970-01-01_00-00-42.jpg" ; "unsynced")]
    #[test_case("unsynced_01_r1234567_1970-01-01_00-00-42_02.jpg" ; "unsynced long run")]
    #[test_case("pic_roof-cam_2026-03-14_18-30-00_01.jpg" ; "counter")]
    #[test_case("pic_01_2026-03-14_18-30-00_123.jpg" ; "long counter")]
    fn test_accepts_agent_filenames(name: &str) {
        assert!(is_valid_filename(name));
    }

    #[test_case("../pic_01_2026-03-14_18-30-00.jpg" ; "traversal")]
    #[test_case("pic_01_2026-03-14_18-30-00.png" ; "extension")]
    #[test_case("img_01_2026-03-14_18-30-00.jpg" ; "prefix")]
    #[test_case("pic_01_2026-03-14_18-30-00_1.jpg" ; "one digit counter")]
    #[test_case("pic_01_2026-03-14_18-30-00-01.jpg" ; "dash counter")]
    #[test_case("unsynced_01_1970-01-01_00-00-42.jpg" ; "unsynced without run")]
    #[test_case("pic_01_r000003_2026-03-14_18-30-00.jpg" ; "run on sane name")]
    #[test_case("pic_a/b_2026-03-14_18-30-00.jpg" ; "slash in device")]
    #[test_case("" ; "empty")]
    fn test_rejects_other_filenames(name: &str) {
        assert!(!is_valid_filename(name));
    }

    #[test]
    fn test_jpeg_magic() {
        assert!(has_jpeg_magic(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00]));
        assert!(has_jpeg_magic(&[0xFF, 0xD8, 0xFF, 0xE1]));
        assert!(!has_jpeg_magic(&[0xFF, 0xD8, 0xFF]));
        assert!(!has_jpeg_magic(&[0x89, 0x50, 0x4E, 0x47]));
        assert!(!has_jpeg_magic(&[0xFF, 0xD8, 0xFF, 0xDB]));
    }

    #[test]
    fn test_verify_rejects_truncated_jpeg() {
        assert!(verify_jpeg(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]).is_err());
    }
}
