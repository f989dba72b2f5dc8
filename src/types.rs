use bitcoin::{Amount, OutPoint, PrivateKey, ScriptBuf, TxOut, script::Script};
use serde::Deserialize;

use crate::error::AppError;

/// 入力の署名方式
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignMode {
    #[default]
    Legacy,
    NestedSegwit,
    NativeSegwit,
    Taproot,
}

/// scriptPubKey から判定したアドレス種別。手数料見積もりのテンプレート選択に使う
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AddressClass {
    PubKeyHash,
    ScriptHash,
    WitnessV1Taproot,
    Witness,
}

impl AddressClass {
    pub fn from_script(script: &Script) -> Result<Self, AppError> {
        if script.is_p2pkh() {
            Ok(AddressClass::PubKeyHash)
        } else if script.is_p2sh() {
            Ok(AddressClass::ScriptHash)
        } else if script.is_p2tr() {
            Ok(AddressClass::WitnessV1Taproot)
        } else if script.is_witness_program() {
            Ok(AddressClass::Witness)
        } else {
            Err(AppError::UnknownScriptType { script_hex: script.to_hex_string() })
        }
    }
}

/// 使用可能なUTXO。チェーン全体を通して一度だけ消費される
#[derive(Debug, Clone)]
pub struct Utxo {
    pub out_point: OutPoint,
    pub script_pubkey: ScriptBuf,
    pub value: Amount,
    pub private_key: PrivateKey,
    pub sign_mode: SignMode,
}

impl Utxo {
    pub fn tx_out(&self) -> TxOut {
        TxOut { value: self.value, script_pubkey: self.script_pubkey.clone() }
    }
}

/// 資金調達前に追加するユーザー指定の出力
#[derive(Debug, Clone)]
pub struct PaymentOutput {
    pub address: String,
    pub value: Amount,
}
