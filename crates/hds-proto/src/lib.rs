//! # hds-proto
//!
//! データストリーム上の `dataSend` サブプロトコル（`diagnostics.snapshot`）の
//! メッセージ定義とエンコード/デコードユーティリティ。
//!
//! ## メッセージの流れ
//!
//! ```text
//! controller                                   accessory
//!     │ request:open{type, streamId, metadata}     │
//!     │ ─────────────────────────────────────────▶ │
//!     │ response:open{status}                       │
//!     │ ◀───────────────────────────────────────── │
//!     │ event:data{seq=1, urlParameters, bytes}     │
//!     │ ◀───────────────────────────────────────── │
//!     │ event:data{seq=2, bytes} ...                │
//!     │ ◀───────────────────────────────────────── │
//!     │ event:data{seq=N, bytes, endOfStream}       │
//!     │ ◀───────────────────────────────────────── │
//!     │ event:ack{streamId, endOfStream}            │
//!     │ ─────────────────────────────────────────▶ │
//!     │ event:close{streamId, reason}               │
//!     │ ◀────────────────────────────────────────▶ │
//! ```
//!
//! 各メッセージは prost の derive で直接定義している（`.proto` のビルド手順なし）。

#![no_std]
extern crate alloc;

pub mod error;
pub mod frame;
pub mod messages;
pub mod metadata;
pub mod reason;

pub use error::ProtoError;
pub use frame::encode_into_scratch;
pub use messages::{AckEvent, CloseEvent, DataEvent, OpenMetadata, OpenRequest, OpenResponse, UrlParameter};
pub use metadata::{SnapshotFormat, SnapshotMetadata, SnapshotOptions, SnapshotType, SnapshotTypes};
pub use reason::{CloseReason, RejectReason};

/// `dataSend` プロトコル名
pub const DATA_SEND_PROTOCOL: &str = "dataSend";

/// 診断スナップショットのストリーム種別
pub const DIAGNOSTICS_SNAPSHOT_TYPE: &str = "diagnostics.snapshot";

/// response:open の成功ステータス（0 以外は拒否）
pub const OPEN_STATUS_ACCEPTED: u32 = 0;

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// 1 GiB（maxLogSize の上限）
pub const GIB: u64 = 1024 * MIB;

/// エンジン既定の最大スナップショットサイズ（5 MiB）
///
/// maxLogSize に 0 以外を指定する場合の下限でもある。
pub const DEFAULT_MAX_LOG_SIZE: u64 = 5 * MIB;

/// maxLogSize に指定できる上限
pub const MAX_LOG_SIZE_LIMIT: u64 = GIB;
