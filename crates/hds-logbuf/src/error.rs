//! hds-logbuf エラー型

/// リングバッファ操作のエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LogBufferError {
    /// 容量 0 のバッファは作れない
    #[error("log buffer capacity must be non-zero")]
    ZeroCapacity,
    /// 1 回の書き込みがバッファ全体より大きい（何も書き込まない）
    #[error("write of {len} bytes exceeds log buffer capacity of {total} bytes")]
    WriteTooLarge {
        /// 書き込もうとしたバイト数
        len: usize,
        /// バッファの総容量
        total: usize,
    },
}
