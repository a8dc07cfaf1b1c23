//! Primary file selection.

use crate::models::FileInfo;

/// Extensions treated as directly playable video.
pub const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mkv", "mov", "m4v"];

/// Extensions the preview generator accepts as still images.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp"];

fn extension(name: &str) -> Option<String> {
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn is_video(name: &str) -> bool {
    extension(name).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

pub fn is_image(name: &str) -> bool {
    extension(name).is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.as_str()))
}

/// Picks the file most likely to be the main feature: the largest video.
///
/// Ties keep the first file in list order. Lists without any video, including
/// the empty list, yield 0.
pub fn pick_primary_file(files: &[FileInfo]) -> usize {
    let mut best: Option<(usize, u64)> = None;
    for (position, file) in files.iter().enumerate() {
        if !is_video(&file.name) {
            continue;
        }
        match best {
            Some((_, length)) if length >= file.length => {}
            _ => best = Some((position, file.length)),
        }
    }
    best.map(|(position, _)| position).unwrap_or(0)
}
