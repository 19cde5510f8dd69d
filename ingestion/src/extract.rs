use crate::router::ParserKey;
use calamine::{Reader, Xls, Xlsx};
use serde_json::Value;
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("pdf extraction failed: {0}")]
    Pdf(String),
    #[error("docx extraction failed: {0}")]
    Docx(String),
    #[error("spreadsheet extraction failed: {0}")]
    Excel(String),
    #[error("csv extraction failed: {0}")]
    Csv(String),
    #[error("json extraction failed: {0}")]
    Json(String),
    #[error("unsupported_format")]
    Unsupported,
}

/// Turn raw source bytes into text for the chunker. Parser libraries here
/// are blocking; callers run this on the blocking pool.
pub fn extract_text(
    parser: ParserKey,
    file_name: &str,
    bytes: &[u8],
) -> Result<String, ExtractError> {
    match parser {
        // Feed and API entries arrive pre-rendered as text by the poller.
        ParserKey::Txt | ParserKey::Rss | ParserKey::Api => {
            Ok(String::from_utf8_lossy(bytes).into_owned())
        }
        ParserKey::Json => extract_json(bytes),
        ParserKey::Pdf => extract_pdf(bytes),
        ParserKey::Docx => extract_docx(bytes),
        ParserKey::Excel => extract_excel(file_name, bytes),
        ParserKey::Unsupported => Err(ExtractError::Unsupported),
    }
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    if text.trim().is_empty() {
        return Err(ExtractError::Pdf("document contains no text".to_string()));
    }
    Ok(text)
}

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let docx = docx_rs::read_docx(bytes).map_err(|e| ExtractError::Docx(e.to_string()))?;
    let mut out = String::new();
    for child in &docx.document.children {
        match child {
            docx_rs::DocumentChild::Paragraph(paragraph) => {
                let line = paragraph_text(paragraph);
                if !line.trim().is_empty() {
                    out.push_str(line.trim());
                    out.push('\n');
                }
            }
            docx_rs::DocumentChild::Table(table) => {
                for row in &table.rows {
                    let docx_rs::TableChild::TableRow(row) = row;
                    let mut cells = Vec::new();
                    for cell in &row.cells {
                        let docx_rs::TableRowChild::TableCell(cell) = cell;
                        let mut text = String::new();
                        for content in &cell.children {
                            if let docx_rs::TableCellContent::Paragraph(p) = content {
                                let line = paragraph_text(p);
                                if !line.trim().is_empty() {
                                    if !text.is_empty() {
                                        text.push(' ');
                                    }
                                    text.push_str(line.trim());
                                }
                            }
                        }
                        if !text.is_empty() {
                            cells.push(text);
                        }
                    }
                    if !cells.is_empty() {
                        out.push_str(&cells.join(", "));
                        out.push('\n');
                    }
                }
            }
            _ => {}
        }
    }
    if out.trim().is_empty() {
        return Err(ExtractError::Docx("document contains no text".to_string()));
    }
    Ok(out)
}

fn paragraph_text(paragraph: &docx_rs::Paragraph) -> String {
    let mut text = String::new();
    for child in &paragraph.children {
        if let docx_rs::ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                if let docx_rs::RunChild::Text(t) = run_child {
                    text.push_str(&t.text);
                }
            }
        }
    }
    text
}

fn extract_excel(file_name: &str, bytes: &[u8]) -> Result<String, ExtractError> {
    let lower = file_name.to_lowercase();
    if lower.ends_with(".csv") {
        return extract_csv(bytes);
    }
    let cursor = Cursor::new(bytes.to_vec());
    if lower.ends_with(".xls") {
        let workbook = Xls::new(cursor).map_err(|e| ExtractError::Excel(e.to_string()))?;
        Ok(sheets_text(workbook))
    } else {
        let workbook = Xlsx::new(cursor).map_err(|e| ExtractError::Excel(e.to_string()))?;
        Ok(sheets_text(workbook))
    }
}

fn sheets_text<RS: std::io::Read + std::io::Seek, R: Reader<RS>>(mut workbook: R) -> String {
    let mut out = String::new();
    for (name, range) in workbook.worksheets() {
        out.push_str(&format!("Sheet: {}\n", name));
        for row in range.rows() {
            let cells: Vec<String> = row
                .iter()
                .map(|cell| cell.to_string())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if !cells.is_empty() {
                out.push_str(&cells.join(", "));
                out.push('\n');
            }
        }
        out.push('\n');
    }
    out
}

fn extract_csv(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut out = String::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::Csv(e.to_string()))?;
        let cells: Vec<&str> = record
            .iter()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if !cells.is_empty() {
            out.push_str(&cells.join(", "));
            out.push('\n');
        }
    }
    Ok(out)
}

/// JSON payloads flatten to one `path: value` line per scalar, so nested
/// API responses still chunk and classify as prose.
fn extract_json(bytes: &[u8]) -> Result<String, ExtractError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| ExtractError::Json(e.to_string()))?;
    let mut lines = Vec::new();
    flatten_value("", &value, &mut lines);
    Ok(lines.join("\n"))
}

fn flatten_value(path: &str, value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let child_path = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", path, key)
                };
                flatten_value(&child_path, child, out);
            }
        }
        Value::Array(items) => {
            for (index, child) in items.iter().enumerate() {
                flatten_value(&format!("{}[{}]", path, index), child, out);
            }
        }
        Value::String(s) => out.push(format!("{}: {}", path, s)),
        Value::Number(n) => out.push(format!("{}: {}", path, n)),
        Value::Bool(b) => out.push(format!("{}: {}", path, b)),
        Value::Null => out.push(format!("{}: null", path)),
    }
}
