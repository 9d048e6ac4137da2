//! セッション統計情報

use serde::Serialize;

use crate::manager::SessionState;

/// `DiagnosticsSessionManager::stats()` が返すスナップショット
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    /// 現在のセッション状態（セッションなしは `None`）
    pub state: Option<SessionState>,
    /// 次に送るデータシーケンス番号（転送前は 0）
    pub sequence_number: i64,
    /// 送信済みのペイロードバイト数
    pub bytes_sent: u64,
    /// まだ送っていないバイト数
    pub remaining_bytes: i64,
    /// 受理したセッション数
    pub sessions_opened: u64,
    /// 拒否した open 数
    pub sessions_rejected: u64,
    /// ack まで届いたセッション数
    pub sessions_completed: u64,
}

impl SessionStats {
    /// JSON 文字列にする（デバッグ出力・ログ用）
    ///
    /// # エラー
    /// serde_json のシリアライズ失敗
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
