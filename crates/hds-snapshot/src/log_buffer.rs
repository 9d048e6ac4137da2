//! メモリ上の診断ログ（制約ターゲット用）
//!
//! `CircularLogBuffer` を共有し、ログの書き込み側とスナップショットの
//! 読み出し側の両方から使う。転送中は書き込みを止め（freeze）、報告した
//! サイズと実際に送るバイト数を一致させる。

use std::io;
use std::sync::Arc;

use hds_logbuf::{CircularLogBuffer, LogBufferError};
use parking_lot::Mutex;
use tracing_subscriber::fmt::MakeWriter;

#[derive(Debug)]
struct LogBufferState {
    ring: CircularLogBuffer,
    frozen: bool,
}

/// 共有リングバッファ
#[derive(Debug, Clone)]
pub struct SharedLogBuffer {
    inner: Arc<Mutex<LogBufferState>>,
}

impl SharedLogBuffer {
    /// 容量 `capacity` バイトのバッファを作る
    ///
    /// # エラー
    /// - `LogBufferError::ZeroCapacity`: 容量 0
    pub fn new(capacity: usize) -> Result<Self, LogBufferError> {
        Ok(SharedLogBuffer {
            inner: Arc::new(Mutex::new(LogBufferState {
                ring: CircularLogBuffer::new(capacity)?,
                frozen: false,
            })),
        })
    }

    /// ログ 1 レコードを書き込む
    ///
    /// freeze 中は黙って捨てる。容量を超えるレコードはエラー（内容は変わらない）。
    ///
    /// # 戻り値
    /// 書き込んだら `true`、freeze 中で捨てたら `false`
    pub fn write_record(&self, bytes: &[u8]) -> Result<bool, LogBufferError> {
        let mut state = self.inner.lock();
        if state.frozen {
            return Ok(false);
        }
        state.ring.enqueue(bytes)?;
        Ok(true)
    }

    /// 書き込みを止め、その時点の使用量（転送するバイト数）を返す
    pub fn freeze(&self) -> usize {
        let mut state = self.inner.lock();
        state.frozen = true;
        state.ring.used_space()
    }

    pub fn unfreeze(&self) {
        self.inner.lock().frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.lock().frozen
    }

    /// 最古のバイトから `out` へ取り出す
    pub fn read_into(&self, out: &mut [u8]) -> usize {
        self.inner.lock().ring.dequeue_into(out)
    }

    pub fn used_space(&self) -> usize {
        self.inner.lock().ring.used_space()
    }

    pub fn total_size(&self) -> usize {
        self.inner.lock().ring.total_size()
    }
}

/// fmt レイヤーに渡す書き込み側
#[derive(Debug)]
pub struct LogBufferWriter {
    buffer: SharedLogBuffer,
}

impl io::Write for LogBufferWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 大きすぎるレコードや freeze 中のレコードは捨てる（ログ出力自体は失敗させない）
        let _ = self.buffer.write_record(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for SharedLogBuffer {
    type Writer = LogBufferWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogBufferWriter {
            buffer: self.clone(),
        }
    }
}
