//! MIME detection from magic bytes with extension fallback.

use std::path::Path;

use crate::types::ContentType;

pub const OCTET_STREAM: &str = "application/octet-stream";

/// Detect the MIME type of a file from its name and the first bytes of its
/// content. Magic signatures win over the extension; no I/O happens here.
pub fn detect(filename: &str, prefix: &[u8]) -> String {
    if let Some(kind) = infer::get(prefix) {
        let magic = kind.mime_type();
        // Office documents are zip archives; when the signature only proves
        // "zip" but the extension names a concrete document type, the
        // extension is the better answer.
        if magic == "application/zip" {
            let by_name = guess_from_name(filename);
            if by_name.starts_with("application/vnd.openxmlformats-officedocument")
                || by_name.starts_with("application/vnd.oasis.opendocument")
            {
                return by_name;
            }
        }
        return magic.to_string();
    }
    mime_guess::from_path(Path::new(filename))
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Extension-only hint used by the scanner before any bytes are read.
pub fn guess_from_name(filename: &str) -> String {
    mime_guess::from_path(Path::new(filename))
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| OCTET_STREAM.to_string())
}

/// Map a MIME string onto the coarse [`ContentType`] buckets.
pub fn content_type_for(mime: &str) -> ContentType {
    let mime = mime.to_ascii_lowercase();
    if mime.starts_with("image/") {
        return ContentType::Image;
    }
    if mime.starts_with("video/") {
        return ContentType::Video;
    }
    if mime.starts_with("audio/") {
        return ContentType::Audio;
    }
    match mime.as_str() {
        "application/pdf"
        | "application/msword"
        | "application/rtf"
        | "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
        | "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
        | "application/vnd.openxmlformats-officedocument.presentationml.presentation"
        | "application/vnd.ms-excel"
        | "application/vnd.ms-powerpoint"
        | "application/vnd.oasis.opendocument.text"
        | "application/vnd.oasis.opendocument.spreadsheet"
        | "application/vnd.oasis.opendocument.presentation" => ContentType::Document,
        "application/zip"
        | "application/gzip"
        | "application/x-tar"
        | "application/x-7z-compressed"
        | "application/x-rar-compressed"
        | "application/x-bzip2"
        | "application/vnd.rar" => ContentType::Archive,
        "application/json" | "application/xml" | "application/javascript"
        | "application/x-yaml" => ContentType::Document,
        OCTET_STREAM => ContentType::Unknown,
        _ if mime.starts_with("text/") => ContentType::Document,
        _ => ContentType::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_bytes_beat_extension() {
        // PNG signature with a lying extension.
        let png = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
        assert_eq!(detect("photo.txt", &png), "image/png");
    }

    #[test]
    fn extension_fallback() {
        assert_eq!(detect("notes.txt", b"plain words"), "text/plain");
        assert_eq!(detect("unknown.bin", &[0x00, 0x01]), OCTET_STREAM);
    }

    #[test]
    fn content_type_buckets() {
        assert_eq!(content_type_for("image/jpeg"), ContentType::Image);
        assert_eq!(content_type_for("video/mp4"), ContentType::Video);
        assert_eq!(content_type_for("audio/flac"), ContentType::Audio);
        assert_eq!(content_type_for("application/pdf"), ContentType::Document);
        assert_eq!(content_type_for("text/markdown"), ContentType::Document);
        assert_eq!(content_type_for("application/zip"), ContentType::Archive);
        assert_eq!(content_type_for(OCTET_STREAM), ContentType::Unknown);
        assert_eq!(content_type_for("application/x-sqlite3"), ContentType::Other);
    }
}
