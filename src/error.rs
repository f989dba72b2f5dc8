use std::path::PathBuf;
use bitcoin::consensus::encode::Error as BitcoinEncodeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("コンセンサスエンコードエラー: {0}")]
    Consensus(#[from] BitcoinEncodeError),

    /// マーカー不一致・チャンク欠落・範囲外の数値オペコード
    #[error("不正なインスクリプションエンベロープ: {0}")]
    MalformedEnvelope(String),

    #[error("資金不足{}: 利用可能な総額 {available}, 要求額 {required} (手数料 {fee} を含む)", stage_label(.stage))]
    InsufficientFunds {
        /// チェーンのステップ番号。単発トランザクションでは None
        stage: Option<usize>,
        available: u64,
        required: u64,
        fee: u64,
    },

    #[error("Sighash計算エラー (入力インデックス {input_index}): {reason}")]
    Sighash { input_index: usize, reason: String },

    #[error("署名エラー (入力インデックス {input_index}): {reason}")]
    SigningFailure { input_index: usize, reason: String },

    #[error("アドレスのデコードに失敗しました ({address}): {reason}")]
    AddressDecode { address: String, reason: String },

    #[error("スクリプトのデコードに失敗しました: {0}")]
    ScriptDecode(String),

    #[error("秘密鍵の読み込みに失敗しました: {0}")]
    PrivateKey(String),

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("不明なスクリプトタイプ: {script_hex}")]
    UnknownScriptType { script_hex: String },
}

fn stage_label(stage: &Option<usize>) -> String {
    match stage {
        Some(index) => format!(" (ステップ {})", index),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_funds_message_names_stage() {
        let err = AppError::InsufficientFunds { stage: Some(2), available: 10, required: 20, fee: 5 };
        let message = err.to_string();
        assert!(message.contains("ステップ 2"), "{}", message);
        assert!(message.contains("20"));

        let err = AppError::InsufficientFunds { stage: None, available: 10, required: 20, fee: 5 };
        assert!(!err.to_string().contains("ステップ"));
    }
}
