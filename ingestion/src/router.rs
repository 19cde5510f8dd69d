use millrace_core::model::FileType;
use std::path::Path;

/// Parser selected for a source path or URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserKey {
    Rss,
    Api,
    Excel,
    Pdf,
    Docx,
    Txt,
    Json,
    Unsupported,
}

impl ParserKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParserKey::Rss => "rss",
            ParserKey::Api => "api",
            ParserKey::Excel => "excel",
            ParserKey::Pdf => "pdf",
            ParserKey::Docx => "docx",
            ParserKey::Txt => "txt",
            ParserKey::Json => "json",
            ParserKey::Unsupported => "unsupported",
        }
    }
}

/// Dispatch on URL scheme first, extension second.
pub fn route(source: &str) -> ParserKey {
    let lower = source.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        if lower.contains("feed") || lower.contains("rss") {
            return ParserKey::Rss;
        }
        return ParserKey::Api;
    }
    match extension(&lower).as_deref() {
        Some("xlsx") | Some("xls") | Some("csv") => ParserKey::Excel,
        Some("pdf") => ParserKey::Pdf,
        Some("docx") => ParserKey::Docx,
        Some("txt") => ParserKey::Txt,
        Some("json") => ParserKey::Json,
        _ => ParserKey::Unsupported,
    }
}

/// The catalog's `file_type`, which distinguishes csv from xlsx where the
/// parser key does not.
pub fn file_type_for(source: &str) -> Option<FileType> {
    let lower = source.to_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        if lower.contains("feed") || lower.contains("rss") {
            return Some(FileType::Rss);
        }
        return Some(FileType::Api);
    }
    extension(&lower).as_deref().and_then(FileType::parse)
}

/// True for the temporary names editors and office suites leave behind.
pub fn is_temporary_name(file_name: &str) -> bool {
    file_name.starts_with("~$") || file_name.ends_with(".tmp") || file_name.contains('~')
}

fn extension(lower: &str) -> Option<String> {
    Path::new(lower)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_split_into_rss_and_api() {
        assert_eq!(route("https://example.com/rss.xml"), ParserKey::Rss);
        assert_eq!(route("https://example.com/news/feed"), ParserKey::Rss);
        assert_eq!(route("https://api.example.com/v1/items"), ParserKey::Api);
        assert_eq!(route("http://example.com/data"), ParserKey::Api);
    }

    #[test]
    fn extensions_pick_their_parsers() {
        assert_eq!(route("report.xlsx"), ParserKey::Excel);
        assert_eq!(route("data/metrics.XLS"), ParserKey::Excel);
        assert_eq!(route("export.csv"), ParserKey::Excel);
        assert_eq!(route("brief.pdf"), ParserKey::Pdf);
        assert_eq!(route("notes.docx"), ParserKey::Docx);
        assert_eq!(route("readme.txt"), ParserKey::Txt);
        assert_eq!(route("payload.json"), ParserKey::Json);
    }

    #[test]
    fn unknown_extensions_are_unsupported() {
        assert_eq!(route("image.png"), ParserKey::Unsupported);
        assert_eq!(route("no_extension"), ParserKey::Unsupported);
    }

    #[test]
    fn file_type_keeps_csv_and_xlsx_distinct() {
        assert_eq!(file_type_for("a.csv"), Some(FileType::Csv));
        assert_eq!(file_type_for("a.xlsx"), Some(FileType::Xlsx));
        assert_eq!(file_type_for("a.xls"), Some(FileType::Xlsx));
        assert_eq!(
            file_type_for("https://example.com/feed"),
            Some(FileType::Rss)
        );
        assert_eq!(file_type_for("a.png"), None);
    }

    #[test]
    fn temporary_names_are_flagged() {
        assert!(is_temporary_name("~$report.docx"));
        assert!(is_temporary_name("upload.tmp"));
        assert!(is_temporary_name("draft~1.txt"));
        assert!(!is_temporary_name("report.docx"));
    }
}
