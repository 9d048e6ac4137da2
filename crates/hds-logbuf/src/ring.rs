//! CircularLogBuffer 本体

use alloc::vec;
use alloc::vec::Vec;

use crate::error::LogBufferError;
use crate::EVICTION_GRANULE;

/// 固定容量の FIFO リングバッファ
///
/// 常に `used_space() + remaining_space() == total_size()` が成り立つ。
#[derive(Debug, Clone)]
pub struct CircularLogBuffer {
    /// 実データ（長さ = total）
    storage: Vec<u8>,
    /// 使用中バイト数
    used: usize,
    /// 次に読み出す位置
    head: usize,
    /// 次に書き込む位置
    tail: usize,
}

impl CircularLogBuffer {
    /// 容量 `total_size` バイトのバッファを作る
    ///
    /// # エラー
    /// - `LogBufferError::ZeroCapacity`: `total_size == 0`
    pub fn new(total_size: usize) -> Result<Self, LogBufferError> {
        if total_size == 0 {
            return Err(LogBufferError::ZeroCapacity);
        }
        Ok(CircularLogBuffer {
            storage: vec![0u8; total_size],
            used: 0,
            head: 0,
            tail: 0,
        })
    }

    pub fn total_size(&self) -> usize {
        self.storage.len()
    }

    pub fn used_space(&self) -> usize {
        self.used
    }

    pub fn remaining_space(&self) -> usize {
        self.storage.len() - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// バイト列を末尾に書き込む
    ///
    /// 空きが足りなければ最古のバイトを `EVICTION_GRANULE` 単位で捨ててから書く。
    ///
    /// # 戻り値
    /// 追い出したバイト数
    ///
    /// # エラー
    /// - `LogBufferError::WriteTooLarge`: `bytes` がバッファ全体より大きい（状態は変わらない）
    pub fn enqueue(&mut self, bytes: &[u8]) -> Result<usize, LogBufferError> {
        let total = self.total_size();
        if bytes.len() > total {
            return Err(LogBufferError::WriteTooLarge {
                len: bytes.len(),
                total,
            });
        }

        let mut evicted = 0;
        while self.remaining_space() < bytes.len() {
            let step = EVICTION_GRANULE.min(self.used);
            self.discard(step);
            evicted += step;
        }

        // tail から末尾まで、残りを先頭から
        let first = bytes.len().min(total - self.tail);
        self.storage[self.tail..self.tail + first].copy_from_slice(&bytes[..first]);
        let rest = bytes.len() - first;
        if rest > 0 {
            self.storage[..rest].copy_from_slice(&bytes[first..]);
        }
        self.tail = (self.tail + bytes.len()) % total;
        self.used += bytes.len();

        Ok(evicted)
    }

    /// 最古のバイトから最大 `out.len()` バイトを取り出して `out` に書く
    ///
    /// # 戻り値
    /// 取り出したバイト数（`used_space() < out.len()` のときだけ要求より少ない）
    pub fn dequeue_into(&mut self, out: &mut [u8]) -> usize {
        let total = self.total_size();
        let n = out.len().min(self.used);

        let first = n.min(total - self.head);
        out[..first].copy_from_slice(&self.storage[self.head..self.head + first]);
        let rest = n - first;
        if rest > 0 {
            out[first..n].copy_from_slice(&self.storage[..rest]);
        }
        self.advance_head(n);
        n
    }

    /// 最古のバイトから最大 `max_bytes` バイトを取り出す
    pub fn dequeue(&mut self, max_bytes: usize) -> Vec<u8> {
        let mut out = vec![0u8; max_bytes.min(self.used)];
        let n = self.dequeue_into(&mut out);
        out.truncate(n);
        out
    }

    /// 最古のバイトから最大 `n` バイトを捨てる
    pub fn discard(&mut self, n: usize) -> usize {
        let n = n.min(self.used);
        self.advance_head(n);
        n
    }

    /// 全データを捨てる（容量はそのまま）
    pub fn clear(&mut self) {
        self.used = 0;
        self.head = 0;
        self.tail = 0;
    }

    fn advance_head(&mut self, n: usize) {
        self.head = (self.head + n) % self.total_size();
        self.used -= n;
        if self.used == 0 {
            // 空になったら位置を揃えておく
            self.head = 0;
            self.tail = 0;
        }
    }
}
