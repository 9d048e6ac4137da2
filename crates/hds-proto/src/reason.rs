//! open 拒否理由と close 理由

/// request:open を拒否する理由
///
/// 拒否はセッションを生成しない（`response:open{status}` で返すだけ）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// サポートしないストリーム種別
    Unsupported,
    /// 既に診断ストリームが開いている
    Busy,
    /// メタデータ（maxLogSize / snapshotType）が不正
    InvalidConfiguration,
}

impl RejectReason {
    /// response:open の status 値（0 は受理なので使わない）
    pub fn status_code(self) -> u32 {
        match self {
            RejectReason::Unsupported => 1,
            RejectReason::Busy => 2,
            RejectReason::InvalidConfiguration => 3,
        }
    }

    /// ログ用の説明
    pub fn description(self) -> &'static str {
        match self {
            RejectReason::Unsupported => "Unsupported incoming \"dataSend\" stream type.",
            RejectReason::Busy => "\"dataSend\" stream already open.",
            RejectReason::InvalidConfiguration => "Open metadata failed validation.",
        }
    }
}

impl core::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.description())
    }
}

/// event:close の理由（どちらの方向からも送られる）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum CloseReason {
    /// 正常終了
    Normal = 0,
    /// コントローラが転送を許可しない
    NotAllowed = 1,
    /// コントローラが今は受け付けられない
    Busy = 2,
    /// アクセサリが転送を完了しない
    Canceled = 3,
    /// コントローラがストリーム種別をサポートしない
    Unsupported = 4,
    /// 予期しない失敗（準備失敗・タイムアウト・トランスポート無効化）
    UnexpectedFailure = 5,
    /// アクセサリがセッションを開始できなかった
    Timeout = 6,
    /// コントローラがデータを解析できなかった
    BadData = 7,
    /// プロトコルエラー
    ProtocolError = 8,
    /// アクセサリがリクエストを処理できる設定になっていない
    InvalidConfiguration = 9,
}

impl CloseReason {
    /// ログ用の説明
    pub fn description(self) -> &'static str {
        match self {
            CloseReason::Normal => "Normal close.",
            CloseReason::NotAllowed => "Controller will not allow the Accessory to send this transfer.",
            CloseReason::Busy => "Controller cannot accept this transfer right now.",
            CloseReason::Canceled => "Accessory will not finish the transfer.",
            CloseReason::Unsupported => "Controller does not support this stream type.",
            CloseReason::UnexpectedFailure => "Protocol error occurred and the stream has failed.",
            CloseReason::Timeout => "Accessory could not start the session.",
            CloseReason::BadData => "Controller failed to parse the data.",
            CloseReason::ProtocolError => "A protocol error occurred.",
            CloseReason::InvalidConfiguration => "Accessory not configured to perform the request.",
        }
    }
}

impl core::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.description())
    }
}
