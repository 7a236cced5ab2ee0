//! Archive inspection
//!
//! Best-effort look inside a finished upload. If the bytes form a ZIP archive
//! the distinct top-level entry names are reported; anything else (not an
//! archive, truncated, unreadable) yields an empty set.

use std::collections::BTreeSet;
use std::fs::File;
use std::path::Path;

use zip::ZipArchive;

/// Something that can list the top-level entries of an archive on disk
pub trait ArchiveInspector: Send + Sync {
    /// Distinct top-level path segments, empty on any failure
    fn top_level_entries(&self, path: &Path) -> BTreeSet<String>;
}

/// ZIP inspector
///
/// Only the central directory is read, never the entry contents.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipInspector;

impl ArchiveInspector for ZipInspector {
    fn top_level_entries(&self, path: &Path) -> BTreeSet<String> {
        let archive = File::open(path)
            .map_err(|e| e.to_string())
            .and_then(|file| ZipArchive::new(file).map_err(|e| e.to_string()));

        match archive {
            Ok(archive) => top_level_names(archive.file_names()),
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "Not a readable archive");
                BTreeSet::new()
            }
        }
    }
}

/// First non-empty segment of each entry name
fn top_level_names<'a>(names: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    names
        .filter_map(|name| name.split('/').find(|segment| !segment.is_empty()))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    #[test]
    fn test_top_level_names_dedup_and_strip() {
        let names = ["docs/a.txt", "docs/b/c.txt", "/root.txt", "bin/", "README"];
        let result = top_level_names(names.into_iter());
        let expected: Vec<&str> = vec!["README", "bin", "docs", "root.txt"];
        assert_eq!(result.iter().map(String::as_str).collect::<Vec<_>>(), expected);
    }

    #[test]
    fn test_zip_entries() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bundle.zip");

        let file = File::create(&path).unwrap();
        let mut zip = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.start_file("mimetype", options).unwrap();
        zip.write_all(b"application/epub+zip").unwrap();
        zip.start_file("OEBPS/content.opf", options).unwrap();
        zip.write_all(b"<package/>").unwrap();
        zip.start_file("OEBPS/text/ch1.xhtml", options).unwrap();
        zip.write_all(b"<html/>").unwrap();
        zip.finish().unwrap();

        let entries = ZipInspector.top_level_entries(&path);
        assert_eq!(
            entries.into_iter().collect::<Vec<_>>(),
            vec!["OEBPS".to_string(), "mimetype".to_string()]
        );
    }

    #[test]
    fn test_non_archive_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("plain.bin");
        std::fs::write(&path, b"definitely not a zip file").unwrap();

        assert!(ZipInspector.top_level_entries(&path).is_empty());
    }

    #[test]
    fn test_missing_file_is_empty() {
        let temp_dir = TempDir::new().unwrap();
        assert!(ZipInspector
            .top_level_entries(&temp_dir.path().join("nope.zip"))
            .is_empty());
    }
}
