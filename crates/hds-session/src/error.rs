//! hds-session エラー型

use hds_proto::ProtoError;
use hds_snapshot::SnapshotError;

/// セッション内部の失敗
///
/// どれもセッション単位で処理され、`CloseReason::UnexpectedFailure` での
/// cancel になる（プロセスは止めない）。
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// フレームのエンコード失敗（スクラッチ不足を含む）
    #[error("frame encoding failed: {0}")]
    Frame(#[from] ProtoError),
    /// スナップショットの準備・読み出し失敗
    #[error("snapshot: {0}")]
    Snapshot(#[from] SnapshotError),
    /// タイマーを登録できない
    #[error("timer registration failed: {0}")]
    TimerUnavailable(String),
    /// ディスパッチャが送信を受け付けない
    #[error("data send rejected by dispatcher: {0}")]
    SendRejected(String),
    /// 下位層がストリームを無効化した
    #[error("data stream invalidated")]
    StreamInvalidated,
    /// 前のチャンクの送信完了を待たずに次を送ろうとした
    #[error("previous chunk still in flight")]
    ChunkInFlight,
    /// 読み出したバイト数が報告サイズと合わない
    #[error("chunk accounting mismatch: {remaining} bytes remaining, end of stream = {end_of_stream}")]
    SizeMismatch {
        /// 読み出し後の残りバイト数
        remaining: i64,
        /// ソースが EOF を返したか
        end_of_stream: bool,
    },
}
