//! Subject seed list.

use std::fs;
use std::path::Path;

use tracing::warn;

use crate::error::AppError;

/// Split a comma- and/or newline-delimited list. Names are trimmed, empties
/// dropped, repeats removed (first occurrence wins).
pub fn parse_names(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for name in text.split([',', '\n']).map(str::trim).filter(|n| !n.is_empty()) {
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
    }
    names
}

/// Read the seed file. A missing file seeds nothing.
pub fn load_names(path: &Path) -> Result<Vec<String>, AppError> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_names(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "seed file not found, no subjects seeded");
            Ok(Vec::new())
        }
        Err(e) => Err(AppError::Config(format!("cannot read seed file {}: {e}", path.display()))),
    }
}
