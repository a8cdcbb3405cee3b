//! Segment file naming: `{component}.{startStep}-{endStep}.{ext}`.
//!
//! Steps are transaction numbers divided by the aggregation step. The
//! extension selects the role of the artifact within a component.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    /// Latest-value data words (`.kv`)
    Values,
    /// Perfect-hash index over the value keys (`.kvi`)
    ValuesIndex,
    /// Historical value words (`.v`)
    HistoryValues,
    /// Perfect-hash index over `txNum || key` (`.vi`)
    HistoryIndex,
    /// Elias-Fano touched-txNum sequences (`.ef`)
    Ef,
    /// Perfect-hash index over the Elias-Fano keys (`.efi`)
    EfIndex,
}

impl FileKind {
    pub fn ext(&self) -> &'static str {
        match self {
            FileKind::Values => "kv",
            FileKind::ValuesIndex => "kvi",
            FileKind::HistoryValues => "v",
            FileKind::HistoryIndex => "vi",
            FileKind::Ef => "ef",
            FileKind::EfIndex => "efi",
        }
    }

    pub fn from_ext(ext: &str) -> Option<FileKind> {
        match ext {
            // dat/idx are accepted as legacy spellings of kv/kvi
            "kv" | "dat" => Some(FileKind::Values),
            "kvi" | "idx" => Some(FileKind::ValuesIndex),
            "v" => Some(FileKind::HistoryValues),
            "vi" => Some(FileKind::HistoryIndex),
            "ef" => Some(FileKind::Ef),
            "efi" => Some(FileKind::EfIndex),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    pub component: String,
    pub start_step: u64,
    pub end_step: u64,
    pub kind: FileKind,
}

impl SegmentName {
    pub fn new(component: &str, start_step: u64, end_step: u64, kind: FileKind) -> Self {
        Self {
            component: component.to_string(),
            start_step,
            end_step,
            kind,
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}.{}-{}.{}",
            self.component,
            self.start_step,
            self.end_step,
            self.kind.ext()
        )
    }

    pub fn path(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }

    /// Transaction range covered, given the aggregation step.
    pub fn tx_range(&self, step: u64) -> (u64, u64) {
        (self.start_step * step, self.end_step * step)
    }

    pub fn parse(name: &str) -> Option<SegmentName> {
        let (stem, ext) = name.rsplit_once('.')?;
        let kind = FileKind::from_ext(ext)?;
        let (component, range) = stem.rsplit_once('.')?;
        let (start, end) = range.split_once('-')?;
        let start_step: u64 = start.parse().ok()?;
        let end_step: u64 = end.parse().ok()?;
        if component.is_empty() || start_step >= end_step {
            return None;
        }
        Some(SegmentName {
            component: component.to_string(),
            start_step,
            end_step,
            kind,
        })
    }
}

/// List the files of one component in `dir`, sorted by (end_step, wider first).
/// Unparseable names are ignored; other components' files are skipped.
pub fn scan_component(dir: &Path, component: &str, kind: FileKind) -> Result<Vec<SegmentName>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let os_name = entry.file_name();
        let Some(name) = os_name.to_str() else {
            continue;
        };
        if let Some(parsed) = SegmentName::parse(name) {
            if parsed.component == component && parsed.kind == kind {
                found.push(parsed);
            }
        }
    }
    found.sort_by(|a, b| {
        a.end_step
            .cmp(&b.end_step)
            .then(a.start_step.cmp(&b.start_step))
    });
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_roundtrip() {
        let name = SegmentName::new("accounts", 0, 4, FileKind::Values);
        assert_eq!(name.file_name(), "accounts.0-4.kv");
        assert_eq!(SegmentName::parse("accounts.0-4.kv"), Some(name));
    }

    #[test]
    fn test_parse_all_kinds() {
        for (ext, kind) in [
            ("kv", FileKind::Values),
            ("kvi", FileKind::ValuesIndex),
            ("v", FileKind::HistoryValues),
            ("vi", FileKind::HistoryIndex),
            ("ef", FileKind::Ef),
            ("efi", FileKind::EfIndex),
        ] {
            let parsed = SegmentName::parse(&format!("storage.8-16.{}", ext)).unwrap();
            assert_eq!(parsed.kind, kind);
            assert_eq!(parsed.start_step, 8);
            assert_eq!(parsed.end_step, 16);
        }
    }

    #[test]
    fn test_parse_legacy_extensions() {
        assert_eq!(
            SegmentName::parse("code.0-1.dat").map(|n| n.kind),
            Some(FileKind::Values)
        );
        assert_eq!(
            SegmentName::parse("code.0-1.idx").map(|n| n.kind),
            Some(FileKind::ValuesIndex)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(SegmentName::parse("accounts.kv"), None);
        assert_eq!(SegmentName::parse("accounts.4-4.kv"), None);
        assert_eq!(SegmentName::parse("accounts.4-2.kv"), None);
        assert_eq!(SegmentName::parse("accounts.a-b.kv"), None);
        assert_eq!(SegmentName::parse("accounts.0-4.bin"), None);
        assert_eq!(SegmentName::parse(".0-4.kv"), None);
    }

    #[test]
    fn test_tx_range() {
        let name = SegmentName::new("accounts", 2, 4, FileKind::Ef);
        assert_eq!(name.tx_range(4), (8, 16));
    }

    #[test]
    fn test_scan_component() {
        let dir = crate::tmpfs::TempDir::new().unwrap();
        for file in [
            "accounts.0-1.kv",
            "accounts.1-2.kv",
            "accounts.0-2.kv",
            "accounts.0-2.kvi",
            "storage.0-1.kv",
            "junk.txt",
        ] {
            std::fs::write(dir.path().join(file), b"x").unwrap();
        }
        let found = scan_component(dir.path(), "accounts", FileKind::Values).unwrap();
        let names: Vec<String> = found.iter().map(|n| n.file_name()).collect();
        assert_eq!(
            names,
            vec!["accounts.0-1.kv", "accounts.0-2.kv", "accounts.1-2.kv"]
        );
    }
}
