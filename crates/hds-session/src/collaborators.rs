//! 外部協調者のインターフェース
//!
//! ストリーム多重化ディスパッチャ・タイマー・時計はこのクレートの外にある。
//! マネージャはここで定義するトレイト越しにだけ使う。

use hds_proto::{CloseReason, RejectReason};

use crate::error::SessionError;

/// ディスパッチャが管理するストリームの識別子（セッションは参照だけを持つ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

/// 登録したタイマーの識別子
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(pub u64);

/// 下位トランスポートの種類（チャンクサイズが変わる）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Ip,
    Ble,
    Thread,
}

impl TransportKind {
    /// MTU が小さいトランスポートか
    pub fn is_low_mtu(self) -> bool {
        matches!(self, TransportKind::Ble | TransportKind::Thread)
    }
}

/// dataSend ストリームのディスパッチャ
pub trait Dispatcher {
    /// response:open{status = 0} を返す
    fn accept(&mut self, stream: StreamHandle);

    /// response:open{status = reason} を返す
    fn reject(&mut self, stream: StreamHandle, reason: RejectReason);

    /// エンコード済みの event:data を送る
    ///
    /// 完了は後で `DiagnosticsSessionManager::on_send_complete` で通知される。
    /// `frame` は呼び出しの間だけ有効（スクラッチバッファを再利用するため）。
    ///
    /// # エラー
    /// その場で送信を受け付けられない場合
    fn send_data(&mut self, stream: StreamHandle, frame: &[u8], end_of_stream: bool) -> Result<(), SessionError>;

    /// event:close{reason} を送ってストリームを閉じる
    fn cancel(&mut self, stream: StreamHandle, reason: CloseReason);
}

/// ワンショットタイマー
///
/// 期限が来たら `DiagnosticsSessionManager::on_timer_fired` に `TimerId` が渡される。
pub trait Timer {
    /// # エラー
    /// タイマー資源が尽きている場合
    fn register(&mut self, deadline_ms: u64) -> Result<TimerId, SessionError>;

    fn deregister(&mut self, id: TimerId);
}

/// 単調時計（ミリ秒）
pub trait Clock {
    fn now_ms(&self) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_low_mtu_transports() {
        assert!(!TransportKind::Ip.is_low_mtu());
        assert!(TransportKind::Ble.is_low_mtu());
        assert!(TransportKind::Thread.is_low_mtu());
    }
}
