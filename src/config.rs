use std::fs;
use std::path::Path;
use std::str::FromStr;

use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::{
    envelope::{EnvelopeKind, InscriptionFormat, MetaIdOptions},
    error::AppError,
    network::Network,
    types::{SignMode, PaymentOutput, Utxo},
};

const DEFAULT_DOGINAL_CONTENT_TYPE: &str = "text/plain;charset=utf-8";

/// `send` サブコマンドの入力
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct SendConfig {
    pub utxos: Vec<UtxoInput>,
    pub outputs: Vec<OutputInput>,
    pub fee_rate: u64,
    #[serde(default)]
    pub change_address: Option<String>,
    #[serde(default)]
    pub unsigned: bool,
}

/// `inscribe` サブコマンドの入力
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InscribeConfig {
    pub utxos: Vec<UtxoInput>,
    pub payload: String,
    #[serde(default)]
    pub payload_encoding: PayloadEncoding,
    #[serde(default)]
    pub format: InscriptionFormat,
    /// Doginal のみ。MetaID は `metaid.contentType` を使う
    #[serde(default)]
    pub content_type: Option<String>,
    /// MetaID のみ
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub metaid: MetaIdOptions,
    #[serde(default)]
    pub destination: Option<String>,
    #[serde(default)]
    pub output_value_sats: u64,
    #[serde(default)]
    pub change_address: Option<String>,
    pub fee_rate: u64,
    #[serde(default)]
    pub one_time_key: Option<String>,
}

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PayloadEncoding {
    #[default]
    Utf8,
    Hex,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UtxoInput {
    pub txid: String,
    pub vout: u32,
    pub script_pubkey_hex: String,
    pub value_sats: u64,
    /// WIF または 64桁の16進数
    pub private_key: String,
    #[serde(default)]
    pub sign_mode: SignMode,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct OutputInput {
    pub address: String,
    pub value_sats: u64,
}

/// JSONファイルを読み込んで設定型にデシリアライズする
pub fn load_config<T: DeserializeOwned>(path: &Path) -> Result<T, AppError> {
    let content = fs::read_to_string(path).map_err(|e| {
        log::error!("入力ファイルの読み込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    serde_json::from_str(&content).map_err(|e| {
        log::error!("入力JSONのパースに失敗しました。");
        AppError::JsonParse { file_path: path.to_path_buf(), source: e }
    })
}

impl UtxoInput {
    pub fn resolve(&self, network: Network) -> Result<Utxo, AppError> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", self.txid, e)))?;
        let script_pubkey = hex::decode(&self.script_pubkey_hex)
            .map(ScriptBuf::from_bytes)
            .map_err(|e| AppError::InputValidation(format!("scriptPubKeyHexのデコード失敗: {}", e)))?;
        let private_key = network.parse_private_key(&self.private_key)?;

        log::debug!(
            "UTXO読み込み: txid={}, vout={}, value={}, signMode={:?}",
            self.txid, self.vout, self.value_sats, self.sign_mode
        );
        Ok(Utxo {
            out_point: OutPoint::new(txid, self.vout),
            script_pubkey,
            value: Amount::from_sat(self.value_sats),
            private_key,
            sign_mode: self.sign_mode,
        })
    }
}

pub fn resolve_utxos(inputs: &[UtxoInput], network: Network) -> Result<Vec<Utxo>, AppError> {
    inputs.iter().map(|input| input.resolve(network)).collect()
}

impl SendConfig {
    pub fn payment_outputs(&self) -> Vec<PaymentOutput> {
        self.outputs
            .iter()
            .map(|o| PaymentOutput { address: o.address.clone(), value: Amount::from_sat(o.value_sats) })
            .collect()
    }
}

impl InscribeConfig {
    pub fn payload_bytes(&self) -> Result<Vec<u8>, AppError> {
        match self.payload_encoding {
            PayloadEncoding::Utf8 => Ok(self.payload.as_bytes().to_vec()),
            PayloadEncoding::Hex => hex::decode(self.payload.trim())
                .map_err(|e| AppError::InputValidation(format!("payloadの16進数デコード失敗: {}", e))),
        }
    }

    pub fn envelope_kind(&self) -> Result<EnvelopeKind, AppError> {
        match self.format {
            InscriptionFormat::Doginal => Ok(EnvelopeKind::Doginal {
                content_type: self
                    .content_type
                    .clone()
                    .unwrap_or_else(|| DEFAULT_DOGINAL_CONTENT_TYPE.to_string()),
            }),
            InscriptionFormat::MetaId => {
                let path = self
                    .path
                    .clone()
                    .ok_or_else(|| AppError::InputValidation("MetaID形式には path が必要です".to_string()))?;
                Ok(EnvelopeKind::MetaId { path, options: self.metaid.clone() })
            }
        }
    }

    pub fn one_time_key(&self, network: Network) -> Result<Option<bitcoin::PrivateKey>, AppError> {
        self.one_time_key.as_deref().map(|key| network.parse_private_key(key)).transpose()
    }
}
