use std::path::{Path, PathBuf};
use std::process::Command;

/// Outcome of a single preview strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Preview {
    Resolved(PathBuf),
    Unavailable(String),
}

/// Turns a camera RAW file into a decodable JPEG
///
/// Strategies are tried in order by [`resolve_preview`]; each one either
/// produces a path or explains why it could not.
pub trait PreviewResolver: Send + Sync {
    fn name(&self) -> &'static str;
    fn resolve(&self, raw_path: &Path, work_dir: &Path) -> Preview;
}

/// Looks for the JPEG a camera writes next to the RAW in JPEG+RAW mode
#[derive(Debug, Clone, Default)]
pub struct SiblingJpeg;

const JPEG_EXTENSIONS: &[&str] = &["jpg", "JPG", "jpeg", "JPEG"];
const JPEG_SUBDIRS: &[&str] = &["JPG", "jpg", "JPEG", "jpeg"];

impl SiblingJpeg {
    fn candidates(raw_path: &Path) -> Vec<PathBuf> {
        let Some(stem) = raw_path.file_stem() else {
            return Vec::new();
        };
        let dir = raw_path.parent().unwrap_or_else(|| Path::new("."));

        let mut dirs = vec![dir.to_path_buf()];
        dirs.extend(JPEG_SUBDIRS.iter().map(|sub| dir.join(sub)));
        if let Some(parent) = dir.parent() {
            dirs.push(parent.to_path_buf());
            dirs.extend(JPEG_SUBDIRS.iter().map(|sub| parent.join(sub)));
        }

        let mut candidates = Vec::new();
        for d in dirs {
            for ext in JPEG_EXTENSIONS {
                let mut name = stem.to_os_string();
                name.push(".");
                name.push(ext);
                candidates.push(d.join(name));
            }
        }
        candidates
    }
}

impl PreviewResolver for SiblingJpeg {
    fn name(&self) -> &'static str {
        "sibling-jpeg"
    }

    fn resolve(&self, raw_path: &Path, _work_dir: &Path) -> Preview {
        match Self::candidates(raw_path).into_iter().find(|p| p.is_file()) {
            Some(path) => Preview::Resolved(path),
            None => Preview::Unavailable(format!(
                "no JPEG next to {} (enable JPEG+RAW capture on the camera)",
                raw_path.display()
            )),
        }
    }
}

/// Converts the RAW with an external tool
///
/// Tries `sips` (macOS) first, then ImageMagick v7 (`magick`) and v6
/// (`convert`).
#[derive(Debug, Clone)]
pub struct ExternalConverter {
    pub programs: Vec<String>,
}

impl Default for ExternalConverter {
    fn default() -> Self {
        Self {
            programs: vec!["sips".to_string(), "magick".to_string(), "convert".to_string()],
        }
    }
}

impl ExternalConverter {
    fn command(program: &str, input: &Path, output: &Path) -> Command {
        let mut cmd = Command::new(program);
        if program == "sips" {
            cmd.arg("-s").arg("format").arg("jpeg").arg(input).arg("--out").arg(output);
        } else {
            cmd.arg(input).arg("-quality").arg("95").arg(output);
        }
        cmd
    }
}

impl PreviewResolver for ExternalConverter {
    fn name(&self) -> &'static str {
        "external-converter"
    }

    fn resolve(&self, raw_path: &Path, work_dir: &Path) -> Preview {
        let stem = raw_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("raw");
        let output = work_dir.join(format!("{}_raw_preview.jpg", stem));

        let mut failures = Vec::new();
        for program in &self.programs {
            match Self::command(program, raw_path, &output).output() {
                Ok(out) if out.status.success() && output.is_file() => {
                    tracing::info!(program = %program, raw = %raw_path.display(), "Converted RAW to JPEG");
                    return Preview::Resolved(output);
                }
                Ok(out) => {
                    let stderr = String::from_utf8_lossy(&out.stderr);
                    failures.push(format!("{} failed: {}", program, stderr.trim()));
                }
                Err(e) => failures.push(format!("{} not available: {}", program, e)),
            }
        }

        Preview::Unavailable(format!(
            "no RAW converter succeeded (install ImageMagick): {}",
            failures.join("; ")
        ))
    }
}

/// Default strategy chain: sibling JPEG first, then external conversion
pub fn default_resolvers() -> Vec<Box<dyn PreviewResolver>> {
    vec![Box::new(SiblingJpeg), Box::new(ExternalConverter::default())]
}

/// Try each resolver in order, collecting the reasons of the ones that fail
pub fn resolve_preview(
    resolvers: &[Box<dyn PreviewResolver>],
    raw_path: &Path,
    work_dir: &Path,
) -> Result<PathBuf, Vec<String>> {
    let mut reasons = Vec::new();
    for resolver in resolvers {
        match resolver.resolve(raw_path, work_dir) {
            Preview::Resolved(path) => {
                tracing::debug!(resolver = resolver.name(), preview = %path.display(), "RAW preview resolved");
                return Ok(path);
            }
            Preview::Unavailable(reason) => reasons.push(format!("{}: {}", resolver.name(), reason)),
        }
    }
    Err(reasons)
}
