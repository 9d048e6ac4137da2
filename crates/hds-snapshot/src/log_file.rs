//! ローテーションする診断ログファイル
//!
//! ## セグメント配置
//!
//! ```text
//! <log>.0      ← 書き込み中（最新）
//! <log>.1
//! ...
//! <log>.{N-1}  ← 最古（次のローテーションで削除）
//! ```
//!
//! 1 セグメントの上限は `total / N` バイト。書き込みで上限を超える場合は
//! 全セグメントを 1 つずつ後ろにずらし、新しい `<log>.0` を開く。
//!
//! このファイルは fmt レイヤーの出力先にもなるので、内部のロックを
//! 持ったまま tracing のイベントを出してはならない（同じロックで止まる）。

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{info, warn};
use tracing_subscriber::fmt::MakeWriter;

use crate::error::SnapshotError;

/// 既存セグメントがこれ以上 per-file サイズを超えていたら作り直す
const OVERSIZE_SLACK: u64 = 1024;

#[derive(Debug)]
struct LogFileState {
    base: PathBuf,
    num_files: usize,
    per_file: u64,
    file: Option<File>,
    /// `<log>.0` に書ける残りバイト数
    remaining: i64,
}

/// ローテーションする診断ログファイルへのハンドル
///
/// `Clone` で同じファイル状態を共有する。`tracing_subscriber::fmt::MakeWriter`
/// を実装しているので fmt レイヤーの出力先にできる。
#[derive(Debug, Clone)]
pub struct RotatingLogFile {
    inner: Arc<Mutex<LogFileState>>,
}

impl RotatingLogFile {
    /// ログセグメントを検査して `<log>.0` を追記モードで開く
    ///
    /// # 引数
    /// - `base`: セグメントのベースパス（`<folder>/<log file name>`）
    /// - `num_files`: セグメント数 N
    /// - `total_bytes`: 全セグメント合計の上限
    ///
    /// 番号の抜けや大きすぎるセグメントが見つかった場合は全セグメントを消す。
    pub fn setup(base: impl Into<PathBuf>, num_files: usize, total_bytes: u64) -> Result<Self, SnapshotError> {
        let base = base.into();
        let num_files = num_files.max(1);
        let per_file = total_bytes / num_files as u64;
        info!(path = %base.display(), num_files, per_file, "setting up diagnostics log files");

        if needs_reset(&base, num_files, per_file) {
            info!("deleting all existing diagnostics logs");
            delete_segments(&base, num_files)?;
        }

        let current = segment_path(&base, 0);
        let file = OpenOptions::new().create(true).append(true).open(&current)?;
        let len = file.metadata()?.len();

        let mut state = LogFileState {
            base,
            num_files,
            per_file,
            file: Some(file),
            remaining: per_file as i64 - len as i64,
        };
        if state.remaining <= 0 {
            state.rotate()?;
        }

        Ok(RotatingLogFile {
            inner: Arc::new(Mutex::new(state)),
        })
    }

    /// 1 レコードを書き込む（必要なら先にローテーション）
    ///
    /// # エラー
    /// - `io::ErrorKind::NotConnected`: `close()` 済み
    pub fn write_record(&self, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.inner.lock();
        if state.file.is_none() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "diagnostics log file is closed"));
        }
        if state.remaining < bytes.len() as i64 {
            state.rotate()?;
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(bytes)?;
        }
        state.remaining -= bytes.len() as i64;
        Ok(())
    }

    pub fn flush(&self) -> io::Result<()> {
        match self.inner.lock().file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }

    /// 書き込み中のファイルを閉じる（以降の書き込みはエラー）
    pub fn close(&self) {
        let file = self.inner.lock().file.take();
        if let Some(mut file) = file {
            if let Err(e) = file.flush() {
                warn!(error = %e, "flushing diagnostics log on close failed");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().file.is_some()
    }

    pub fn base_path(&self) -> PathBuf {
        self.inner.lock().base.clone()
    }

    pub fn num_files(&self) -> usize {
        self.inner.lock().num_files
    }

    pub fn per_file_bytes(&self) -> u64 {
        self.inner.lock().per_file
    }

    /// 存在するセグメントを古い順に返す
    pub fn segments_oldest_first(&self) -> Vec<PathBuf> {
        let state = self.inner.lock();
        (0..state.num_files)
            .rev()
            .map(|i| segment_path(&state.base, i))
            .filter(|p| p.exists())
            .collect()
    }
}

impl LogFileState {
    fn rotate(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        let mut found_highest = false;
        for i in (0..self.num_files).rev() {
            let current = segment_path(&self.base, i);
            if !current.exists() {
                if found_highest {
                    return Err(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("gap in rotated diagnostics logs at {}", current.display()),
                    ));
                }
                continue;
            }
            found_highest = true;
            if i + 1 == self.num_files {
                fs::remove_file(&current)?;
            } else {
                fs::rename(&current, segment_path(&self.base, i + 1))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(segment_path(&self.base, 0))?;
        self.file = Some(file);
        self.remaining = self.per_file as i64;
        Ok(())
    }
}

/// `<base>.<index>`
pub fn segment_path(base: &Path, index: usize) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}

/// 全セグメントを削除する（存在しないものは無視）
pub fn delete_segments(base: &Path, num_files: usize) -> io::Result<()> {
    for i in (0..num_files).rev() {
        match fs::remove_file(segment_path(base, i)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn needs_reset(base: &Path, num_files: usize, per_file: u64) -> bool {
    let mut found_highest = false;
    for i in (0..num_files).rev() {
        let path = segment_path(base, i);
        match fs::metadata(&path) {
            Ok(meta) => {
                found_highest = true;
                if meta.len() > per_file + OVERSIZE_SLACK {
                    info!(path = %path.display(), "existing rotated log is too large");
                    return true;
                }
            }
            Err(_) if found_highest => {
                info!(path = %path.display(), "inconsistency found in rotated logs");
                return true;
            }
            Err(_) => {}
        }
    }
    false
}

/// fmt レイヤーに渡す書き込み側
#[derive(Debug)]
pub struct LogFileWriter {
    log: RotatingLogFile,
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.log.write_record(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.log.flush()
    }
}

impl<'a> MakeWriter<'a> for RotatingLogFile {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogFileWriter { log: self.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read(path: &Path) -> Vec<u8> {
        fs::read(path).unwrap()
    }

    #[test]
    fn test_setup_creates_first_segment() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("diag.log");
        let log = RotatingLogFile::setup(&base, 3, 300).unwrap();

        assert!(segment_path(&base, 0).exists());
        assert_eq!(log.per_file_bytes(), 100);
        assert_eq!(log.num_files(), 3);
    }

    #[test]
    fn test_rotation_shifts_segments() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("diag.log");
        let log = RotatingLogFile::setup(&base, 3, 30).unwrap();

        log.write_record(b"aaaaaaaa").unwrap(); // .0 = a (8)
        log.write_record(b"bbbbbbbb").unwrap(); // 10 を超えるので回転: .1 = a, .0 = b
        log.write_record(b"cccccccc").unwrap(); // .2 = a, .1 = b, .0 = c
        log.write_record(b"dddddddd").unwrap(); // a は削除
        log.flush().unwrap();

        assert_eq!(read(&segment_path(&base, 0)), b"dddddddd");
        assert_eq!(read(&segment_path(&base, 1)), b"cccccccc");
        assert_eq!(read(&segment_path(&base, 2)), b"bbbbbbbb");
        assert!(!segment_path(&base, 3).exists());

        let oldest_first = log.segments_oldest_first();
        assert_eq!(oldest_first.len(), 3);
        assert_eq!(oldest_first[0], segment_path(&base, 2));
    }

    #[test]
    fn test_gap_in_segments_resets_all() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("diag.log");
        fs::write(segment_path(&base, 0), b"keep?").unwrap();
        fs::write(segment_path(&base, 2), b"orphan").unwrap(); // .1 が抜けている

        let _log = RotatingLogFile::setup(&base, 3, 300).unwrap();
        assert!(!segment_path(&base, 2).exists());
        assert_eq!(read(&segment_path(&base, 0)), b"");
    }

    #[test]
    fn test_oversized_segment_resets_all() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("diag.log");
        fs::write(segment_path(&base, 0), vec![b'x'; 2000]).unwrap();

        let _log = RotatingLogFile::setup(&base, 2, 200).unwrap();
        assert_eq!(read(&segment_path(&base, 0)).len(), 0);
    }

    #[test]
    fn test_existing_segment_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("diag.log");
        fs::write(segment_path(&base, 0), b"old-").unwrap();

        let log = RotatingLogFile::setup(&base, 2, 200).unwrap();
        log.write_record(b"new").unwrap();
        log.flush().unwrap();
        assert_eq!(read(&segment_path(&base, 0)), b"old-new");
    }

    #[test]
    fn test_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = RotatingLogFile::setup(dir.path().join("diag.log"), 2, 200).unwrap();
        log.close();
        assert!(!log.is_open());
        assert!(log.write_record(b"late").is_err());
    }

    #[test]
    fn test_make_writer_feeds_log() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("diag.log");
        let log = RotatingLogFile::setup(&base, 2, 200).unwrap();

        let mut writer = log.make_writer();
        writer.write_all(b"line\n").unwrap();
        writer.flush().unwrap();
        assert_eq!(read(&segment_path(&base, 0)), b"line\n");
    }
}
