use indicatif::{ProgressBar, ProgressStyle};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

use crate::enhancement::Variant;

/// Camera RAW extensions that need a JPEG preview before processing
pub const RAW_EXTENSIONS: &[&str] = &[
    "cr2", "cr3", "nef", "arw", "dng", "raf", "orf", "rw2", "pef", "srw",
];

/// Extensions the crop engine can decode directly
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "webp", "tif", "tiff"];

/// Kind of file produced for a variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Final enhanced JPEG
    Jpeg,
    /// Background removed PNG
    Transparent,
    /// Transparent result composited over a solid color
    Background,
}

/// Create a styled spinner for long running queue work
pub fn create_spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.blue} [{elapsed_precise}] {msg}") {
        pb.set_style(style);
    }
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Format duration in a human-readable way
pub fn format_duration(duration: Duration) -> String {
    let total_secs = duration.as_secs();
    let millis = duration.subsec_millis();

    if total_secs >= 60 {
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        format!("{}m {}s", mins, secs)
    } else if total_secs > 0 {
        format!("{}.{:03}s", total_secs, millis)
    } else {
        format!("{}ms", duration.as_millis())
    }
}

/// Parse a `#RGB` or `#RRGGBB` color into its channels
pub fn parse_hex_color(color: &str) -> Option<[u8; 3]> {
    let hex_part = color.strip_prefix('#')?;
    if !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }

    match hex_part.len() {
        3 => {
            let mut rgb = [0u8; 3];
            for (i, c) in hex_part.chars().enumerate() {
                let v = c.to_digit(16)? as u8;
                rgb[i] = v * 17;
            }
            Some(rgb)
        }
        6 => {
            let r = u8::from_str_radix(&hex_part[0..2], 16).ok()?;
            let g = u8::from_str_radix(&hex_part[2..4], 16).ok()?;
            let b = u8::from_str_radix(&hex_part[4..6], 16).ok()?;
            Some([r, g, b])
        }
        _ => None,
    }
}

/// Get file extension in lowercase
pub fn get_file_extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_lowercase())
}

/// Check if a file has one of the specified extensions
pub fn has_valid_extension(path: &Path, extensions: &[&str]) -> bool {
    get_file_extension(path)
        .map(|ext| extensions.contains(&ext.as_str()))
        .unwrap_or(false)
}

pub fn is_raw_file(path: &Path) -> bool {
    has_valid_extension(path, RAW_EXTENSIONS)
}

/// Turn a caller supplied name into something safe for every filesystem
///
/// Runs of anything other than ASCII letters, digits, `-`, `.` and `_`
/// collapse into a single underscore.
pub fn sanitize_base_name(name: &str) -> String {
    static INVALID: OnceLock<Regex> = OnceLock::new();
    let invalid = INVALID.get_or_init(|| {
        Regex::new(r"[^A-Za-z0-9._-]+").expect("static pattern is valid")
    });

    let replaced = invalid.replace_all(name.trim(), "_");
    let trimmed = replaced.trim_matches(|c| c == '_' || c == '.');

    if trimmed.is_empty() {
        "image".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Output file name for a variant
///
/// Downstream uploaders match on these suffixes, keep them stable.
pub fn output_file_name(base_name: &str, variant: Variant, kind: OutputKind) -> String {
    match kind {
        OutputKind::Jpeg => format!("{}_{}.jpg", base_name, variant),
        OutputKind::Transparent => format!("{}_{}_transparent.png", base_name, variant),
        OutputKind::Background => format!("{}_{}_background.jpg", base_name, variant),
    }
}

/// Temporary working file name for one step of a variant
pub fn work_file_name(base_name: &str, variant: Variant, step: &str, extension: &str) -> String {
    format!("{}_{}_{}.{}", base_name, variant, step, extension)
}
