//! スナップショットのバイト列の取り出し元
//!
//! - `File`: 準備済みの送信ファイルを先頭から順に読む
//! - `LogBuffer`: freeze したリングバッファから取り出す
//!
//! どちらも Ready 時に報告したサイズを数え、最後のバイトを返した呼び出しで
//! `is_eof = true` を返す。

use std::fmt;
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::SnapshotError;
use crate::log_buffer::SharedLogBuffer;
use crate::storage::Storage;

/// 送信ファイルからの読み出し
pub struct FileSource {
    storage: Arc<dyn Storage>,
    path: PathBuf,
    reader: Option<Box<dyn Read + Send>>,
    remaining: u64,
}

impl FileSource {
    pub fn new(storage: Arc<dyn Storage>, path: PathBuf, size: u64) -> Self {
        FileSource {
            storage,
            path,
            reader: None,
            remaining: size,
        }
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<(usize, bool), SnapshotError> {
        if self.remaining == 0 {
            self.reader = None;
            return Ok((0, true));
        }
        if self.reader.is_none() {
            self.reader = Some(self.storage.open_read(&self.path)?);
        }

        let want = buf.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let mut filled = 0;
        while filled < want {
            let Some(reader) = self.reader.as_mut() else {
                break;
            };
            match reader.read(&mut buf[filled..want]) {
                Ok(0) => {
                    self.reader = None;
                    return Err(SnapshotError::Truncated {
                        missing: self.remaining - filled as u64,
                    });
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    self.reader = None;
                    return Err(e.into());
                }
            }
        }

        self.remaining -= filled as u64;
        let is_eof = self.remaining == 0;
        if is_eof {
            debug!(path = %self.path.display(), "end of snapshot file reached");
            self.reader = None;
        }
        Ok((filled, is_eof))
    }
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSource")
            .field("path", &self.path)
            .field("open", &self.reader.is_some())
            .field("remaining", &self.remaining)
            .finish()
    }
}

/// freeze したリングバッファからの読み出し
///
/// drop 時に freeze を解除する。
#[derive(Debug)]
pub struct RingSource {
    buffer: SharedLogBuffer,
    remaining: usize,
}

impl RingSource {
    /// バッファを freeze し、その時点の使用量を送信サイズとする
    pub fn freeze(buffer: SharedLogBuffer) -> Self {
        let remaining = buffer.freeze();
        RingSource { buffer, remaining }
    }

    pub fn size(&self) -> usize {
        self.remaining
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<(usize, bool), SnapshotError> {
        let want = buf.len().min(self.remaining);
        let n = self.buffer.read_into(&mut buf[..want]);
        if n < want {
            return Err(SnapshotError::Truncated {
                missing: (self.remaining - n) as u64,
            });
        }
        self.remaining -= n;
        if self.remaining == 0 {
            debug!("full log buffer copied");
            self.buffer.unfreeze();
        }
        Ok((n, self.remaining == 0))
    }
}

impl Drop for RingSource {
    fn drop(&mut self) {
        self.buffer.unfreeze();
    }
}

/// スナップショットの取り出し元
#[derive(Debug)]
pub enum SnapshotSource {
    File(FileSource),
    LogBuffer(RingSource),
}

impl SnapshotSource {
    /// 最大 `buf.len()` バイトを読む
    ///
    /// # 戻り値
    /// `(読んだバイト数, 最後のバイトまで読んだか)`
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<(usize, bool), SnapshotError> {
        match self {
            SnapshotSource::File(src) => src.read_chunk(buf),
            SnapshotSource::LogBuffer(src) => src.read_chunk(buf),
        }
    }
}
