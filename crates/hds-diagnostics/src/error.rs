//! hds-diagnostics エラー型

use std::io;

use hds_logbuf::LogBufferError;
use hds_snapshot::SnapshotError;

/// 設定ファイルの読み込み・検証のエラー
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Io(#[source] io::Error),
    #[error("failed to parse configuration: {0}")]
    Parse(#[source] toml::de::Error),
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[source] toml::ser::Error),
    /// 値の組み合わせが不正
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// サービス組み立てのエラー
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// ログキャプチャの開始失敗
    #[error("diagnostics storage: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("diagnostics log buffer: {0}")]
    LogBuffer(#[from] LogBufferError),
    /// subscriber の設定失敗（フィルタ不正・二重初期化）
    #[error("logging initialisation failed: {0}")]
    Logging(String),
}
