//! チャンク単位のアップロード
//!
//! ```text
//! PrepareContext ──get_bytes_to_upload──▶ chunk ──DataEvent──▶ scratch ──send_data──▶ Dispatcher
//!                                                                               │
//!                    upload_next() ◀──────── on_send_complete() ◀───────────────┘
//! ```
//!
//! 送信中のチャンクは常に 1 つだけ。次のチャンクは前のチャンクの送信完了から
//! しか読まないので、シーケンス番号は必ず昇順で届く。

use hds_proto::{encode_into_scratch, DataEvent, UrlParameter};
use hds_snapshot::PrepareContext;
use tracing::debug;

use crate::collaborators::{Dispatcher, StreamHandle, TransportKind};
use crate::error::SessionError;
use crate::{
    CONSTRAINED_CHUNK_BYTES, CONSTRAINED_SCRATCH_BYTES, LOW_MTU_CHUNK_BYTES, SCRATCH_BYTES,
    STREAM_CHUNK_BYTES,
};

/// チャンクとスクラッチの大きさ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferSizes {
    /// IP でのチャンクサイズ
    pub stream_chunk_bytes: usize,
    /// BLE / Thread でのチャンクサイズ
    pub low_mtu_chunk_bytes: usize,
    /// event:data を組み立てるスクラッチバッファ
    pub scratch_bytes: usize,
}

impl TransferSizes {
    /// ファイルバックエンド（POSIX 系ターゲット）
    pub const FILE_BACKED: TransferSizes = TransferSizes {
        stream_chunk_bytes: STREAM_CHUNK_BYTES,
        low_mtu_chunk_bytes: LOW_MTU_CHUNK_BYTES,
        scratch_bytes: SCRATCH_BYTES,
    };

    /// メモリ上のリングバッファ（制約ターゲット）
    pub const CONSTRAINED: TransferSizes = TransferSizes {
        stream_chunk_bytes: CONSTRAINED_CHUNK_BYTES,
        low_mtu_chunk_bytes: LOW_MTU_CHUNK_BYTES,
        scratch_bytes: CONSTRAINED_SCRATCH_BYTES,
    };

    pub fn chunk_bytes(&self, transport: TransportKind) -> usize {
        if transport.is_low_mtu() {
            self.low_mtu_chunk_bytes
        } else {
            self.stream_chunk_bytes
        }
    }
}

impl Default for TransferSizes {
    fn default() -> Self {
        TransferSizes::FILE_BACKED
    }
}

/// 送信したチャンクの情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSent {
    pub sequence_number: i64,
    pub len: usize,
    pub end_of_stream: bool,
}

/// 準備済みスナップショットをチャンクに分けて送る
#[derive(Debug)]
pub struct ChunkedUploader {
    stream: StreamHandle,
    chunk_bytes: usize,
    /// event:data のエンコード先（セッション中は再利用）
    scratch: Vec<u8>,
    /// 次に送るシーケンス番号（1 始まり）
    sequence_number: i64,
    /// 未送信バイト数（常に 0 以上）
    remaining_bytes: i64,
    bytes_sent: u64,
    /// 最初のチャンクで取り出す
    url_parameters: Option<Vec<UrlParameter>>,
    in_flight: bool,
    eof_sent: bool,
}

impl ChunkedUploader {
    /// # 引数
    /// - `stream`: 送信先ストリーム
    /// - `sizes`: チャンク・スクラッチの大きさ
    /// - `transport`: チャンクサイズを決めるトランスポート種別
    /// - `total_bytes`: Ready で報告されたサイズ
    /// - `url_parameters`: シーケンス番号 1 のチャンクに付けるパラメータ
    pub fn new(
        stream: StreamHandle,
        sizes: &TransferSizes,
        transport: TransportKind,
        total_bytes: u64,
        url_parameters: Option<Vec<UrlParameter>>,
    ) -> Self {
        ChunkedUploader {
            stream,
            chunk_bytes: sizes.chunk_bytes(transport),
            scratch: vec![0; sizes.scratch_bytes],
            sequence_number: 1,
            remaining_bytes: i64::try_from(total_bytes).unwrap_or(i64::MAX),
            bytes_sent: 0,
            url_parameters,
            in_flight: false,
            eof_sent: false,
        }
    }

    /// 次のチャンクを読んで送信する
    ///
    /// # エラー
    /// - `SessionError::ChunkInFlight`: 前のチャンクの送信完了前
    /// - `SessionError::Snapshot`: ソースの読み出し失敗
    /// - `SessionError::SizeMismatch`: 読み出し量が報告サイズと食い違う
    /// - `SessionError::Frame`: スクラッチにフレームが収まらない
    /// - ディスパッチャの送信エラー
    pub fn upload_next<D: Dispatcher>(
        &mut self,
        ctx: &PrepareContext,
        dispatcher: &mut D,
    ) -> Result<ChunkSent, SessionError> {
        if self.in_flight {
            return Err(SessionError::ChunkInFlight);
        }

        let mut data = vec![0; self.chunk_bytes];
        let (len, end_of_stream) = ctx.get_bytes_to_upload(&mut data)?;
        data.truncate(len);

        let remaining = self.remaining_bytes - len as i64;
        if remaining < 0 || end_of_stream != (remaining == 0) {
            return Err(SessionError::SizeMismatch {
                remaining,
                end_of_stream,
            });
        }

        let sequence_number = self.sequence_number;
        let url_parameters = if sequence_number == 1 {
            self.url_parameters.take().unwrap_or_default()
        } else {
            Vec::new()
        };
        let event = DataEvent::chunk(self.stream.0, sequence_number, data, end_of_stream, url_parameters);
        let frame_len = encode_into_scratch(&event, &mut self.scratch)?;

        self.remaining_bytes = remaining;
        self.sequence_number += 1;
        dispatcher.send_data(self.stream, &self.scratch[..frame_len], end_of_stream)?;

        self.in_flight = true;
        self.eof_sent = end_of_stream;
        self.bytes_sent += len as u64;
        debug!(
            sequence_number,
            len,
            frame_len,
            remaining,
            end_of_stream,
            "diagnostics chunk sent"
        );
        Ok(ChunkSent {
            sequence_number,
            len,
            end_of_stream,
        })
    }

    /// 送信完了を記録する
    ///
    /// # 戻り値
    /// 完了したのが最終チャンクなら `Some(true)`。送信中のチャンクがなければ `None`
    pub fn on_send_complete(&mut self) -> Option<bool> {
        if !self.in_flight {
            return None;
        }
        self.in_flight = false;
        Some(self.eof_sent)
    }

    pub fn sequence_number(&self) -> i64 {
        self.sequence_number
    }

    pub fn remaining_bytes(&self) -> i64 {
        self.remaining_bytes
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// 最終チャンクを送信したか
    pub fn is_eof_sent(&self) -> bool {
        self.eof_sent
    }
}
