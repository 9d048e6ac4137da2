//! スナップショットの保存先
//!
//! `Storage` はプリペアラが使う狭いファイル操作インターフェース。
//! 実装は `FsStorage`（診断フォルダ + ローテーションログ）。

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use hds_proto::{SnapshotFormat, SnapshotType};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::archive::{build_zip, ArchiveRules};
use crate::error::SnapshotError;
use crate::log_file::{segment_path, RotatingLogFile};

/// プリペアラから見たファイル操作
pub trait Storage: Send + Sync + fmt::Debug {
    /// 診断フォルダが存在するか
    fn folder_exists(&self) -> bool;

    /// 形式ごとの送信ファイルのパス
    fn output_path(&self, format: SnapshotFormat) -> PathBuf;

    fn remove_if_exists(&self, path: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn file_size(&self, path: &Path) -> io::Result<u64>;

    /// 送信ファイルを先頭から読むリーダーを開く
    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>>;

    /// キャプチャ中のログへ追記する（キャプチャしていなければ何もしない）
    fn append_to_log(&self, bytes: &[u8]) -> io::Result<()>;

    fn flush_log(&self) -> io::Result<()>;

    /// ローテーション済みのセグメントを古い順に 1 ファイルへ連結し、
    /// 先頭を削って `max_bytes` 以下にする
    ///
    /// # 戻り値
    /// 連結したファイルのパス。キャプチャしていない場合は `None`
    fn rotate_or_concatenate(&self, max_bytes: u64) -> io::Result<Option<PathBuf>>;

    /// 診断フォルダを `dest` へ zip でまとめる
    ///
    /// `concatenated` がある場合は分割セグメントを外す。
    fn archive(
        &self,
        snapshot_type: SnapshotType,
        concatenated: Option<&Path>,
        dest: &Path,
    ) -> Result<(), SnapshotError>;
}

/// 診断フォルダの配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    /// 診断フォルダ
    pub folder: PathBuf,
    /// ログファイル名（セグメントは `<name>.0` ...）
    pub log_file_name: String,
    /// セグメント数
    pub num_log_files: usize,
    /// Manufacturer スナップショットで外すサブフォルダ（フォルダからの相対名）
    pub excluded_folders: Vec<String>,
    /// zip 形式の送信ファイル
    pub zip_file: PathBuf,
    /// テキスト形式の送信ファイル
    pub text_file: PathBuf,
}

impl StorageLayout {
    /// 連結ログのパス（= セグメントのベースパス）
    pub fn log_path(&self) -> PathBuf {
        self.folder.join(&self.log_file_name)
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        StorageLayout {
            folder: PathBuf::from("diagnostics"),
            log_file_name: "adk.log".to_owned(),
            num_log_files: 4,
            excluded_folders: vec!["audio".to_owned(), "bt".to_owned()],
            zip_file: PathBuf::from("diagnostics.zip"),
            text_file: PathBuf::from("diagnostics.txt"),
        }
    }
}

/// ファイルシステム上の `Storage`
///
/// ログキャプチャは 1 つだけ。2 つ目の `start_log_capture` は `CaptureBusy`。
#[derive(Debug)]
pub struct FsStorage {
    layout: StorageLayout,
    capture: Mutex<Option<RotatingLogFile>>,
}

impl FsStorage {
    pub fn new(layout: StorageLayout) -> Self {
        FsStorage {
            layout,
            capture: Mutex::new(None),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// 診断フォルダを作り、ローテーションログへのキャプチャを始める
    ///
    /// # 戻り値
    /// ログの書き込みハンドル（fmt レイヤーの出力先に使う）
    ///
    /// # エラー
    /// - `SnapshotError::CaptureBusy`: 既にキャプチャ中
    /// - `SnapshotError::Io`: フォルダ作成やセグメント準備の失敗
    pub fn start_log_capture(&self, total_bytes: u64) -> Result<RotatingLogFile, SnapshotError> {
        let mut capture = self.capture.lock();
        if capture.is_some() {
            warn!("diagnostics log capture in progress, cannot start another");
            return Err(SnapshotError::CaptureBusy);
        }
        fs::create_dir_all(&self.layout.folder)?;
        let log = RotatingLogFile::setup(self.layout.log_path(), self.layout.num_log_files, total_bytes)?;
        *capture = Some(log.clone());
        info!(folder = %self.layout.folder.display(), total_bytes, "diagnostics log capture started");
        Ok(log)
    }

    /// キャプチャを止める（していなければ何もしない）
    pub fn stop_log_capture(&self) {
        if let Some(log) = self.capture.lock().take() {
            log.close();
            info!("diagnostics log capture stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.capture.lock().is_some()
    }

    fn capture(&self) -> Option<RotatingLogFile> {
        self.capture.lock().clone()
    }
}

impl Storage for FsStorage {
    fn folder_exists(&self) -> bool {
        self.layout.folder.is_dir()
    }

    fn output_path(&self, format: SnapshotFormat) -> PathBuf {
        match format {
            SnapshotFormat::Zip => self.layout.zip_file.clone(),
            SnapshotFormat::Text => self.layout.text_file.clone(),
        }
    }

    fn remove_if_exists(&self, path: &Path) -> io::Result<()> {
        match fs::remove_file(path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn file_size(&self, path: &Path) -> io::Result<u64> {
        Ok(fs::metadata(path)?.len())
    }

    fn open_read(&self, path: &Path) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(path)?))
    }

    fn append_to_log(&self, bytes: &[u8]) -> io::Result<()> {
        match self.capture() {
            Some(log) if log.is_open() => log.write_record(bytes),
            _ => Ok(()),
        }
    }

    fn flush_log(&self) -> io::Result<()> {
        match self.capture() {
            Some(log) => log.flush(),
            None => Ok(()),
        }
    }

    fn rotate_or_concatenate(&self, max_bytes: u64) -> io::Result<Option<PathBuf>> {
        let Some(log) = self.capture() else {
            return Ok(None);
        };
        if !self.folder_exists() {
            return Ok(None);
        }
        log.flush()?;

        let target = log.base_path();
        let temp = segment_path(&target, 0).with_extension("temp");
        {
            let mut out = File::create(&temp)?;
            for segment in log.segments_oldest_first() {
                io::copy(&mut File::open(&segment)?, &mut out)?;
            }
        }

        let size = fs::metadata(&temp)?.len();
        let trim = size.saturating_sub(max_bytes);
        debug!(size, max_bytes, trim, "concatenated diagnostics log segments");

        if trim > 0 {
            let mut src = File::open(&temp)?;
            src.seek(SeekFrom::Start(trim))?;
            let mut dst = OpenOptions::new().create(true).write(true).truncate(true).open(&target)?;
            io::copy(&mut src, &mut dst)?;
            drop(src);
            fs::remove_file(&temp)?;
        } else {
            fs::rename(&temp, &target)?;
        }
        Ok(Some(target))
    }

    fn archive(
        &self,
        snapshot_type: SnapshotType,
        concatenated: Option<&Path>,
        dest: &Path,
    ) -> Result<(), SnapshotError> {
        let excluded_dirs = match snapshot_type {
            SnapshotType::Adk => Vec::new(),
            SnapshotType::Manufacturer => self
                .layout
                .excluded_folders
                .iter()
                .map(|name| self.layout.folder.join(name))
                .collect(),
        };
        let excluded_prefix = concatenated.map(|_| {
            (
                self.layout.folder.clone(),
                format!("{}.", self.layout.log_file_name),
            )
        });
        let rules = ArchiveRules {
            excluded_dirs,
            excluded_prefix,
        };
        let entries = build_zip(&self.layout.folder, dest, &rules)?;
        info!(entries, dest = %dest.display(), "diagnostics archive built");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout_in(dir: &Path) -> StorageLayout {
        StorageLayout {
            folder: dir.join("diagnostics"),
            log_file_name: "adk.log".to_owned(),
            num_log_files: 3,
            excluded_folders: vec!["audio".to_owned()],
            zip_file: dir.join("out.zip"),
            text_file: dir.join("out.txt"),
        }
    }

    #[test]
    fn test_second_capture_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(layout_in(dir.path()));
        storage.start_log_capture(3000).unwrap();
        assert!(matches!(
            storage.start_log_capture(3000),
            Err(SnapshotError::CaptureBusy)
        ));

        storage.stop_log_capture();
        assert!(!storage.is_capturing());
        storage.start_log_capture(3000).unwrap();
    }

    #[test]
    fn test_concatenate_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(layout_in(dir.path()));
        let log = storage.start_log_capture(30).unwrap(); // 1 セグメント 10 バイト
        log.write_record(b"11111111").unwrap();
        log.write_record(b"22222222").unwrap();
        log.write_record(b"33333333").unwrap();

        let joined = storage.rotate_or_concatenate(1000).unwrap().unwrap();
        assert_eq!(joined, dir.path().join("diagnostics/adk.log"));
        assert_eq!(fs::read(&joined).unwrap(), b"111111112222222233333333");
    }

    #[test]
    fn test_concatenate_trims_head() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(layout_in(dir.path()));
        let log = storage.start_log_capture(30).unwrap();
        log.write_record(b"aaaaaaaa").unwrap();
        log.write_record(b"bbbbbbbb").unwrap();

        let joined = storage.rotate_or_concatenate(10).unwrap().unwrap();
        assert_eq!(fs::read(&joined).unwrap(), b"aabbbbbbbb");
        assert!(!segment_path(&joined, 0).with_extension("temp").exists());
    }

    #[test]
    fn test_concatenate_without_capture() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(layout_in(dir.path()));
        assert_eq!(storage.rotate_or_concatenate(10).unwrap(), None);
    }

    #[test]
    fn test_append_without_capture_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(layout_in(dir.path()));
        storage.append_to_log(b"config").unwrap();
        storage.flush_log().unwrap();
    }

    #[test]
    fn test_remove_missing_file_ok() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(layout_in(dir.path()));
        storage.remove_if_exists(&dir.path().join("nope")).unwrap();
    }
}
