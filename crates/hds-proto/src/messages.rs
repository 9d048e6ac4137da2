//! dataSend サブプロトコルのメッセージ
//!
//! フィールド番号はコントローラ側と共有する固定値。

use alloc::string::String;
use alloc::vec::Vec;

use prost::Message;

use crate::error::ProtoError;
use crate::reason::CloseReason;
use crate::DIAGNOSTICS_SNAPSHOT_TYPE;

/// request:open のメタデータ
#[derive(Clone, PartialEq, Message)]
pub struct OpenMetadata {
    /// 要求する最大ログサイズ（0 = エンジン既定）
    #[prost(uint64, tag = "1")]
    pub max_log_size: u64,
    /// 要求するスナップショット種別（ビットマスク）
    #[prost(uint32, tag = "2")]
    pub snapshot_type: u32,
}

/// request:open（controller → accessory）
#[derive(Clone, PartialEq, Message)]
pub struct OpenRequest {
    #[prost(string, tag = "1")]
    pub target: String,
    /// ストリーム種別。診断では `"diagnostics.snapshot"`
    #[prost(string, tag = "2")]
    pub r#type: String,
    #[prost(uint64, tag = "3")]
    pub stream_id: u64,
    #[prost(message, optional, tag = "4")]
    pub metadata: Option<OpenMetadata>,
}

impl OpenRequest {
    /// バイト列から request:open をデコードする
    ///
    /// # エラー
    /// - `ProtoError::DecodeFailed`: protobuf デコード失敗
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        OpenRequest::decode(bytes).map_err(ProtoError::DecodeFailed)
    }

    /// 診断スナップショット向けのリクエストか
    pub fn is_diagnostics_snapshot(&self) -> bool {
        self.r#type == DIAGNOSTICS_SNAPSHOT_TYPE
    }

    /// メタデータを取り出す
    ///
    /// # エラー
    /// - `ProtoError::MissingMetadata`: metadata フィールドがない
    pub fn metadata_or_err(&self) -> Result<OpenMetadata, ProtoError> {
        self.metadata.clone().ok_or(ProtoError::MissingMetadata)
    }
}

/// response:open（accessory → controller）
#[derive(Clone, PartialEq, Message)]
pub struct OpenResponse {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    /// 0 = 受理、それ以外は拒否理由
    #[prost(uint32, tag = "2")]
    pub status: u32,
}

/// URL パラメータの 1 組
#[derive(Clone, PartialEq, Eq, Message)]
pub struct UrlParameter {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

impl UrlParameter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        UrlParameter {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// event:data（accessory → controller）
///
/// `url_parameters` はシーケンス番号 1 のチャンクにだけ載せる。
#[derive(Clone, PartialEq, Message)]
pub struct DataEvent {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub data: Vec<u8>,
    #[prost(int64, tag = "3")]
    pub data_sequence_number: i64,
    #[prost(bool, tag = "4")]
    pub end_of_stream: bool,
    #[prost(message, repeated, tag = "5")]
    pub url_parameters: Vec<UrlParameter>,
}

impl DataEvent {
    /// チャンク 1 つ分の event:data を組み立てる
    ///
    /// # 引数
    /// - `sequence_number`: 1 始まりのデータシーケンス番号
    /// - `data`: チャンク本体
    /// - `end_of_stream`: 最終チャンクか
    /// - `url_parameters`: 最初のチャンクでのみ渡す（それ以外は空）
    pub fn chunk(
        stream_id: u64,
        sequence_number: i64,
        data: Vec<u8>,
        end_of_stream: bool,
        url_parameters: Vec<UrlParameter>,
    ) -> Self {
        DataEvent {
            stream_id,
            data,
            data_sequence_number: sequence_number,
            end_of_stream,
            url_parameters,
        }
    }

    /// バイト列から event:data をデコードする
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        DataEvent::decode(bytes).map_err(ProtoError::DecodeFailed)
    }
}

/// event:ack（controller → accessory）
#[derive(Clone, PartialEq, Message)]
pub struct AckEvent {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(bool, tag = "2")]
    pub end_of_stream: bool,
}

impl AckEvent {
    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        AckEvent::decode(bytes).map_err(ProtoError::DecodeFailed)
    }
}

/// event:close（双方向）
#[derive(Clone, PartialEq, Message)]
pub struct CloseEvent {
    #[prost(uint64, tag = "1")]
    pub stream_id: u64,
    #[prost(enumeration = "CloseReason", tag = "2")]
    pub reason: i32,
}

impl CloseEvent {
    pub fn new(stream_id: u64, reason: CloseReason) -> Self {
        CloseEvent {
            stream_id,
            reason: reason.into(),
        }
    }

    /// 理由コードを列挙値に変換する（未知のコードは ProtocolError 扱い）
    pub fn close_reason(&self) -> CloseReason {
        CloseReason::try_from(self.reason).unwrap_or(CloseReason::ProtocolError)
    }

    pub fn decode_from_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        CloseEvent::decode(bytes).map_err(ProtoError::DecodeFailed)
    }
}
