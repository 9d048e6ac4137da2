//! スクラッチバッファへのフレームエンコード
//!
//! 送信フレームは固定長のスクラッチバッファに組み立てる。
//! 収まらない場合は `ProtoError::ScratchTooSmall` を返し、呼び出し側が
//! セッション単位で処理する（プロセスは止めない）。

use prost::Message;

use crate::error::ProtoError;

/// メッセージを `scratch` の先頭にエンコードし、書き込んだバイト数を返す
///
/// # 引数
/// - `msg`: エンコードするメッセージ
/// - `scratch`: 出力先（セッションごとに再利用される）
///
/// # エラー
/// - `ProtoError::ScratchTooSmall`: エンコード長がスクラッチを超える
pub fn encode_into_scratch<M: Message>(msg: &M, scratch: &mut [u8]) -> Result<usize, ProtoError> {
    let needed = msg.encoded_len();
    if needed > scratch.len() {
        return Err(ProtoError::ScratchTooSmall {
            needed,
            available: scratch.len(),
        });
    }

    let mut cursor: &mut [u8] = &mut scratch[..needed];
    msg.encode(&mut cursor).map_err(|_| ProtoError::ScratchTooSmall {
        needed,
        available: needed,
    })?;
    Ok(needed)
}
