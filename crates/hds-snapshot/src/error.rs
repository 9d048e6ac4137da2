//! hds-snapshot エラー型

use std::io;

use hds_logbuf::LogBufferError;
use hds_proto::SnapshotFormat;

/// スナップショットの準備・読み出しのエラー
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    /// ファイル I/O 失敗
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] io::Error),
    /// zip アーカイブ作成失敗
    #[error("archive build failed: {0}")]
    Archive(#[from] zip::result::ZipError),
    /// リングバッファ操作失敗
    #[error("log buffer: {0}")]
    LogBuffer(#[from] LogBufferError),
    /// 診断フォルダが存在しない
    #[error("diagnostics folder does not exist")]
    FolderMissing,
    /// ログキャプチャが既に動作中
    #[error("diagnostics log capture already in progress")]
    CaptureBusy,
    /// 完成したスナップショットが上限を超えた
    #[error("snapshot is {size} bytes, exceeds maximum allowed size of {max} bytes")]
    TooLarge {
        /// スナップショットのサイズ
        size: u64,
        /// 実効最大サイズ
        max: u64,
    },
    /// このバックエンドで扱えない形式
    #[error("snapshot format {0:?} is not supported by this backend")]
    UnsupportedFormat(SnapshotFormat),
    /// 読み出し可能な状態ではない（Ready 前、または解放済み）
    #[error("snapshot data is not ready for upload")]
    NotReady,
    /// 報告したサイズより前にデータが尽きた
    #[error("snapshot source ended {missing} bytes early")]
    Truncated {
        /// 足りなかったバイト数
        missing: u64,
    },
    /// 中断要求を検出した
    #[error("snapshot preparation aborted")]
    Aborted,
    /// ワーカースレッドを起動できなかった
    #[error("failed to spawn snapshot worker: {0}")]
    WorkerSpawn(io::Error),
}
