//! Document text extraction for context stuffing.
//!
//! Only PDF is supported; text is pulled page by page via `oxidize_pdf` and
//! joined with newlines. Pages that fail to extract (scanned images, broken
//! content streams) are skipped with a warning.

use std::io::Cursor;
use std::path::Path;

use tracing::{info, warn};

use crate::error::{LlamaDeskError, Result};

/// Extract all text from the PDF at `path`.
pub fn extract_text(path: &Path) -> Result<String> {
    if !path.is_file() {
        return Err(LlamaDeskError::Document(format!(
            "file not found: {}",
            path.display()
        )));
    }

    let bytes = std::fs::read(path).map_err(|e| {
        LlamaDeskError::Document(format!("failed to read PDF {}: {e}", path.display()))
    })?;

    let reader = oxidize_pdf::parser::reader::PdfReader::new(Cursor::new(bytes)).map_err(|e| {
        LlamaDeskError::Document(format!(
            "failed to extract text from PDF {}: {e}",
            display_name(path)
        ))
    })?;

    let doc = oxidize_pdf::parser::document::PdfDocument::new(reader);

    let page_count = doc.page_count().map_err(|e| {
        LlamaDeskError::Document(format!(
            "failed to get page count for {}: {e}",
            display_name(path)
        ))
    })?;

    let mut all_text = String::new();
    for i in 0..page_count {
        match doc.extract_text_from_page(i) {
            Ok(extracted) => {
                if !all_text.is_empty() && !extracted.text.is_empty() {
                    all_text.push('\n');
                }
                all_text.push_str(&extracted.text);
            }
            Err(e) => {
                warn!(page = i, error = %e, "skipping page with extraction error");
            }
        }
    }

    info!(
        file = %display_name(path),
        pages = page_count,
        chars = all_text.chars().count(),
        "PDF text extracted"
    );

    Ok(all_text)
}

/// File name for status lines and messages.
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
