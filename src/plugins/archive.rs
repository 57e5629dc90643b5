//! Module archive unpacking.
//!
//! Every entry of a module archive lives under `<path>@<version>/`. Entries
//! outside that prefix, entries that would resolve outside the destination,
//! duplicate entries and entries that inflate past their declared size all
//! fail the whole extraction.

use std::fs::OpenOptions;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};

use super::error::ExtractionError;
use super::traits::ModuleVersion;

/// Resolve an archive member name against `dest`.
///
/// Returns `None` for names that carry no file (empty or directory entries).
fn member_path(dest: &Path, name: &str, prefix: &str) -> Result<Option<PathBuf>, ExtractionError> {
    let Some(rel) = name.strip_prefix(prefix) else {
        return Err(ExtractionError::UnexpectedEntry {
            name: name.to_string(),
            prefix: prefix.to_string(),
        });
    };
    if rel.is_empty() || rel.ends_with('/') {
        return Ok(None);
    }

    let mut out = dest.to_path_buf();
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(seg) => out.push(seg),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExtractionError::UnsafePath {
                    name: name.to_string(),
                });
            }
        }
    }
    if out == dest {
        return Ok(None);
    }
    Ok(Some(out))
}

/// Unpack the archive `data` of `module` into `dest`.
///
/// `dest` must exist. Blocking; run it off the async executor.
pub fn unzip(data: &[u8], module: &ModuleVersion, dest: &Path) -> Result<usize, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data))?;
    let prefix = module.archive_prefix();
    let mut written = 0;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index)?;
        let name = entry.name().to_string();
        let Some(target) = member_path(dest, &name, &prefix)? else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ExtractionError::io("could not create directory", parent, e))?;
        }
        let mut out = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&target)
            .map_err(|e| ExtractionError::io("could not create file", &target, e))?;

        let declared = entry.size();
        let copied = std::io::copy(&mut (&mut entry).take(declared.saturating_add(1)), &mut out)
            .map_err(|e| ExtractionError::io("could not write file", &target, e))?;
        if copied > declared {
            return Err(ExtractionError::SizeMismatch { name, declared });
        }
        written += 1;
    }

    Ok(written)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::plugins::cache::tests::zip_bytes;
    use tempfile::TempDir;

    fn module() -> ModuleVersion {
        ModuleVersion::new("test-module", "v0.1.0")
    }

    /// Rewrite the declared uncompressed size of every entry.
    pub(crate) fn spoof_declared_size(mut data: Vec<u8>, size: u32) -> Vec<u8> {
        let local = [0x50, 0x4b, 0x03, 0x04];
        let central = [0x50, 0x4b, 0x01, 0x02];
        let mut i = 0;
        while i + 4 <= data.len() {
            let offset = if data[i..i + 4] == local {
                Some(22)
            } else if data[i..i + 4] == central {
                Some(24)
            } else {
                None
            };
            if let Some(offset) = offset {
                data[i + offset..i + offset + 4].copy_from_slice(&size.to_le_bytes());
                i += 4;
            } else {
                i += 1;
            }
        }
        data
    }

    #[test]
    fn unzip_strips_prefix() {
        let dir = TempDir::new().unwrap();
        let data = zip_bytes(&[
            ("test-module@v0.1.0/", b""),
            ("test-module@v0.1.0/main.go", b"test-module\n"),
            ("test-module@v0.1.0/assets/", b""),
            ("test-module@v0.1.0/assets/style.css", b"body {}"),
        ]);

        let count = unzip(&data, &module(), dir.path()).unwrap();

        assert_eq!(count, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("main.go")).unwrap(),
            "test-module\n"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("assets/style.css")).unwrap(),
            "body {}"
        );
    }

    #[test]
    fn unzip_rejects_foreign_prefix() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let data = zip_bytes(&[("../escape.txt", b"pwned")]);

        let err = unzip(&data, &module(), &dest).unwrap_err();

        assert!(matches!(err, ExtractionError::UnexpectedEntry { .. }));
        assert!(!root.path().join("escape.txt").exists());
    }

    #[test]
    fn unzip_rejects_traversal_after_prefix() {
        let root = TempDir::new().unwrap();
        let dest = root.path().join("dest");
        std::fs::create_dir(&dest).unwrap();
        let data = zip_bytes(&[("test-module@v0.1.0/../../escape.txt", b"pwned")]);

        let err = unzip(&data, &module(), &dest).unwrap_err();

        assert!(matches!(err, ExtractionError::UnsafePath { .. }));
        assert!(!root.path().join("escape.txt").exists());
    }

    #[test]
    fn unzip_rejects_duplicate_entries() {
        let dir = TempDir::new().unwrap();
        let data = zip_bytes(&[
            ("test-module@v0.1.0/a.txt", b"one"),
            ("test-module@v0.1.0/./a.txt", b"two"),
        ]);

        let err = unzip(&data, &module(), dir.path()).unwrap_err();

        assert!(matches!(err, ExtractionError::Io { .. }));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    }

    #[test]
    fn unzip_rejects_entries_larger_than_declared() {
        let dir = TempDir::new().unwrap();
        let data = zip_bytes(&[("test-module@v0.1.0/big.txt", b"abcdefgh")]);
        let data = spoof_declared_size(data, 3);

        let err = unzip(&data, &module(), dir.path()).unwrap_err();

        assert!(matches!(err, ExtractionError::SizeMismatch { declared: 3, .. }), "{err}");
    }

    #[test]
    fn declared_size_allows_no_extra_byte() {
        let payload: &[u8] = b"test-module\n";
        assert_eq!(payload.len(), 12);

        for (declared, ok) in [(12u32, true), (11, false), (3, false)] {
            let dir = TempDir::new().unwrap();
            let data = zip_bytes(&[("test-module@v0.1.0/main.go", payload)]);
            let data = spoof_declared_size(data, declared);

            let result = unzip(&data, &module(), dir.path());

            if ok {
                assert_eq!(result.unwrap(), 1, "declared {declared}");
            } else {
                let err = result.unwrap_err();
                assert!(
                    matches!(err, ExtractionError::SizeMismatch { declared: d, .. } if d == u64::from(declared)),
                    "declared {declared}: {err}"
                );
            }
        }
    }

    #[test]
    fn member_path_skips_directories() {
        let dest = Path::new("/srv/mod");
        assert_eq!(member_path(dest, "m@v1/", "m@v1/").unwrap(), None);
        assert_eq!(member_path(dest, "m@v1/dir/", "m@v1/").unwrap(), None);
        assert_eq!(
            member_path(dest, "m@v1/dir/a.txt", "m@v1/").unwrap(),
            Some(PathBuf::from("/srv/mod/dir/a.txt"))
        );
    }
}
