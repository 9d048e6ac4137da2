//! # hds-snapshot
//!
//! 診断スナップショットの組み立てと読み出し。
//!
//! ## 2 つのバックエンド
//!
//! | バックエンド | 保存先 | 準備 | 形式 |
//! |--------------|--------|------|------|
//! | `Files`      | 診断フォルダ + ローテーションログ | ワーカースレッド | zip / text |
//! | `LogBuffer`  | `SharedLogBuffer`（リングバッファ） | `start()` 内で完了 | text |
//!
//! どちらも結果は `PrepareEvent` として単一スロットのチャンネルで消費ループへ届き、
//! 読み出しは `PrepareContext::get_bytes_to_upload` で行う。

pub mod archive;
pub mod error;
pub mod log_buffer;
pub mod log_file;
pub mod preparer;
pub mod source;
pub mod storage;

pub use error::SnapshotError;
pub use log_buffer::SharedLogBuffer;
pub use log_file::RotatingLogFile;
pub use preparer::{
    DataState, PrepareCallbacks, PrepareContext, PrepareEvent, PreparerBackend, SnapshotPreparer, Wake,
    DEFAULT_SIZE_TOLERANCE, SIGNED_TIMESTAMP_KEY,
};
pub use source::SnapshotSource;
pub use storage::{FsStorage, Storage, StorageLayout};

/// crossbeam の受信側（消費ループが保持する）
pub use crossbeam_channel::Receiver as EventReceiver;
