//! Temp file naming.
//!
//! An in-progress pull writes into a hidden sibling of the target named
//! `.syncmesh.<basename>.<version fingerprint>`. The same file and version
//! always map to the same temp name, so an interrupted pull resumes into
//! the existing temp file, while different versions never share one.

use sync_types::{FileInfo, VersionVector};

use crate::names::{base_name, parent};

/// Tool prefix of temp file names.
pub const TEMP_PREFIX: &str = "syncmesh";

/// Temp name for pulling `file`.
pub fn temp_name(file: &FileInfo) -> String {
    temp_name_for(&file.name, &file.version)
}

/// Temp name for pulling version `version` of `name`.
pub fn temp_name_for(name: &str, version: &VersionVector) -> String {
    let base = format!(".{TEMP_PREFIX}.{}.{}", base_name(name), version.fingerprint());
    match parent(name) {
        Some(dir) => format!("{dir}/{base}"),
        None => base,
    }
}

/// True if the final component of `name` is a temp file name.
pub fn is_temporary(name: &str) -> bool {
    base_name(name).starts_with(&format!(".{TEMP_PREFIX}."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_types::ShortId;

    #[test]
    fn temp_name_is_hidden_sibling() {
        let mut file = FileInfo::directory("dir/sub/file.txt");
        file.version = file.version.update(ShortId::new(1));
        let temp = temp_name(&file);

        assert!(temp.starts_with("dir/sub/.syncmesh.file.txt."));
        assert!(is_temporary(&temp));
        assert!(!is_temporary("dir/sub/file.txt"));
    }

    #[test]
    fn top_level_temp_name() {
        let temp = temp_name_for("testfile", &VersionVector::new());
        assert!(temp.starts_with(".syncmesh.testfile."));
        assert!(!temp.contains('/'));
    }

    #[test]
    fn same_version_same_name_different_version_different_name() {
        let v1 = VersionVector::new().update(ShortId::new(1));
        let v2 = v1.update(ShortId::new(1));
        assert_eq!(temp_name_for("a", &v1), temp_name_for("a", &v1));
        assert_ne!(temp_name_for("a", &v1), temp_name_for("a", &v2));
    }
}
