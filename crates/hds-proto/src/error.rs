//! hds-proto エラー型

use alloc::string::String;

/// dataSend メッセージのエンコード/デコードのエラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtoError {
    /// Protobuf デコード失敗
    #[error("proto decode failed: {0}")]
    DecodeFailed(prost::DecodeError),
    /// スクラッチバッファにプロトコルエンベロープが収まらない
    #[error("scratch buffer too small: frame needs {needed} bytes, {available} available")]
    ScratchTooSmall {
        /// エンコード後のフレーム長
        needed: usize,
        /// スクラッチバッファ長
        available: usize,
    },
    /// サポートしないストリーム種別
    #[error("unsupported stream type: {0}")]
    UnsupportedType(String),
    /// open リクエストにメタデータがない
    #[error("open request carries no metadata")]
    MissingMetadata,
}
