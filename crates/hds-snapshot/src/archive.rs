//! 診断フォルダの zip アーカイブ作成

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::SnapshotError;

/// アーカイブから外すもの
#[derive(Debug, Clone, Default)]
pub struct ArchiveRules {
    /// 丸ごと外すサブフォルダ（絶対パス）
    pub excluded_dirs: Vec<PathBuf>,
    /// このファイル名で始まる、`prefix_dir` 直下のファイルを外す（分割ログ）
    pub excluded_prefix: Option<(PathBuf, String)>,
}

impl ArchiveRules {
    fn excludes(&self, path: &Path, dest: &Path) -> bool {
        if path == dest {
            return true;
        }
        if self.excluded_dirs.iter().any(|dir| path.starts_with(dir)) {
            return true;
        }
        match (&self.excluded_prefix, path.parent(), path.file_name()) {
            (Some((dir, prefix)), Some(parent), Some(name)) => {
                parent == dir.as_path() && name.to_string_lossy().starts_with(prefix.as_str())
            }
            _ => false,
        }
    }
}

/// `root` 以下のファイルを `dest` に zip でまとめる
///
/// エントリ名は `<root のフォルダ名>/<相対パス>`。
///
/// # 戻り値
/// 書き込んだエントリ数
pub fn build_zip(root: &Path, dest: &Path, rules: &ArchiveRules) -> Result<usize, SnapshotError> {
    let mut files = Vec::new();
    collect_files(root, rules, dest, &mut files)?;
    files.sort();

    let top = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut zip = ZipWriter::new(File::create(dest)?);
    for path in &files {
        let relative = path.strip_prefix(root).unwrap_or(path);
        let mut name = top.clone();
        for part in relative.components() {
            if !name.is_empty() {
                name.push('/');
            }
            name.push_str(&part.as_os_str().to_string_lossy());
        }
        debug!(entry = %name, "adding file to diagnostics archive");
        zip.start_file(name, options)?;
        io::copy(&mut File::open(path)?, &mut zip)?;
    }
    zip.finish()?;
    Ok(files.len())
}

fn collect_files(dir: &Path, rules: &ArchiveRules, dest: &Path, out: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if rules.excludes(&path, dest) {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, rules, dest, out)?;
        } else {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_names(path: &Path) -> Vec<String> {
        let archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
        let mut names: Vec<String> = archive.file_names().map(str::to_owned).collect();
        names.sort();
        names
    }

    #[test]
    fn test_zip_applies_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("diagnostics");
        fs::create_dir_all(root.join("audio")).unwrap();
        fs::create_dir_all(root.join("bt")).unwrap();
        fs::create_dir_all(root.join("misc")).unwrap();
        fs::write(root.join("adk.log"), b"joined").unwrap();
        fs::write(root.join("adk.log.0"), b"seg0").unwrap();
        fs::write(root.join("adk.log.1"), b"seg1").unwrap();
        fs::write(root.join("audio/a.log"), b"audio").unwrap();
        fs::write(root.join("bt/b.log"), b"bt").unwrap();
        fs::write(root.join("misc/config.txt"), b"cfg").unwrap();

        let rules = ArchiveRules {
            excluded_dirs: vec![root.join("audio"), root.join("bt")],
            excluded_prefix: Some((root.clone(), "adk.log.".to_owned())),
        };
        let dest = dir.path().join("out.zip");
        assert_eq!(build_zip(&root, &dest, &rules).unwrap(), 2);
        assert_eq!(
            entry_names(&dest),
            vec!["diagnostics/adk.log", "diagnostics/misc/config.txt"]
        );
    }

    #[test]
    fn test_zip_skips_destination_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("diagnostics");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.txt"), b"a").unwrap();

        let dest = root.join("snapshot.zip");
        build_zip(&root, &dest, &ArchiveRules::default()).unwrap();
        assert_eq!(entry_names(&dest), vec!["diagnostics/a.txt"]);
    }
}
