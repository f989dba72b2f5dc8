//! インスクリプションエンベロープのエンコード/デコード。
//!
//! 2つの形式を扱う:
//! - Doginal: `"ord" <parts> <content-type> (<index> <chunk>)*`。indexは parts-1 から 0 へ降順
//! - MetaID: `"metaid" <operation> <path> <encryption> <version> <content-type> <chunk>*`
//!
//! 各チャンクは `MAX_CHUNK_LEN` バイト以下。プッシュは bitcoinjs の compile と同じく最小化する
//! (空 → OP_0, 1..=16 の1バイト → OP_N)。

use std::fmt;

use bitcoin::opcodes::{self, Opcode};
use bitcoin::opcodes::all::{OP_PUSHNUM_1, OP_PUSHNUM_16, OP_PUSHNUM_NEG1};
use bitcoin::script::{Builder, Instruction, PushBytes, Script, ScriptBuf};
use bitcoin::Transaction;
use serde::Deserialize;

use crate::error::AppError;
use crate::script_num::{push_number, read_small_number};

pub const ORD_MARKER: &[u8] = b"ord";
pub const METAID_MARKER: &[u8] = b"metaid";

/// 1回のデータプッシュの上限
pub const MAX_CHUNK_LEN: usize = 240;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InscriptionFormat {
    #[default]
    Doginal,
    #[serde(alias = "metaid")]
    MetaId,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetaIdOperation {
    Init,
    #[default]
    Create,
    Modify,
    Revoke,
}

impl MetaIdOperation {
    pub fn as_str(self) -> &'static str {
        match self {
            MetaIdOperation::Init => "init",
            MetaIdOperation::Create => "create",
            MetaIdOperation::Modify => "modify",
            MetaIdOperation::Revoke => "revoke",
        }
    }
}

impl fmt::Display for MetaIdOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MetaID のヘッダフィールド。既定値は `create` / `"0"` / `"0.0.1"` / `application/json`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetaIdOptions {
    pub operation: MetaIdOperation,
    pub encryption: String,
    pub version: String,
    pub content_type: String,
}

impl Default for MetaIdOptions {
    fn default() -> Self {
        MetaIdOptions {
            operation: MetaIdOperation::Create,
            encryption: "0".to_string(),
            version: "0.0.1".to_string(),
            content_type: "application/json".to_string(),
        }
    }
}

/// 構築するエンベロープの種類と形式固有のメタデータ
#[derive(Debug, Clone)]
pub enum EnvelopeKind {
    Doginal { content_type: String },
    MetaId { path: String, options: MetaIdOptions },
}

impl EnvelopeKind {
    pub fn format(&self) -> InscriptionFormat {
        match self {
            EnvelopeKind::Doginal { .. } => InscriptionFormat::Doginal,
            EnvelopeKind::MetaId { .. } => InscriptionFormat::MetaId,
        }
    }

    pub fn build(&self, payload: &[u8]) -> Result<ScriptBuf, AppError> {
        match self {
            EnvelopeKind::Doginal { content_type } => build_doginal(payload, content_type),
            EnvelopeKind::MetaId { path, options } => build_metaid(payload, path, options),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InscriptionFields {
    Doginal {
        parts_count: u8,
        /// 最初に現れたチャンクのインデックス
        index: u8,
    },
    MetaId {
        operation: String,
        path: String,
        encryption: String,
        version: String,
    },
}

/// デコード結果。OP_CODEの位置情報は保持しないため、元のスクリプトへは戻せない
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InscriptionRecord {
    pub content_type: String,
    pub payload: Vec<u8>,
    pub fields: InscriptionFields,
}

impl InscriptionRecord {
    pub fn format(&self) -> InscriptionFormat {
        match self.fields {
            InscriptionFields::Doginal { .. } => InscriptionFormat::Doginal,
            InscriptionFields::MetaId { .. } => InscriptionFormat::MetaId,
        }
    }
}

pub fn build_doginal(payload: &[u8], content_type: &str) -> Result<ScriptBuf, AppError> {
    let parts: Vec<&[u8]> = payload.chunks(MAX_CHUNK_LEN).collect();
    let parts_count = u16::try_from(parts.len())
        .map_err(|_| AppError::MalformedEnvelope(format!("チャンク数が多すぎます: {}", parts.len())))?;

    let mut builder = push_data(Builder::new(), ORD_MARKER)?;
    builder = push_number(builder, parts_count);
    builder = push_data(builder, content_type.as_bytes())?;

    // 先頭チャンクから順にプッシュし、インデックスは降順に振る
    for (n, part) in parts.iter().enumerate() {
        builder = push_number(builder, parts_count - n as u16 - 1);
        builder = push_data(builder, part)?;
    }

    Ok(builder.into_script())
}

pub fn build_metaid(payload: &[u8], path: &str, options: &MetaIdOptions) -> Result<ScriptBuf, AppError> {
    let mut builder = Builder::new();
    for field in [
        METAID_MARKER,
        options.operation.as_str().as_bytes(),
        path.as_bytes(),
        options.encryption.as_bytes(),
        options.version.as_bytes(),
        options.content_type.as_bytes(),
    ] {
        builder = push_data(builder, field)?;
    }
    for part in payload.chunks(MAX_CHUNK_LEN) {
        builder = push_data(builder, part)?;
    }
    Ok(builder.into_script())
}

/// エンベロープ単体のスクリプトをデコードする。形式は先頭のマーカーで判定する
pub fn decode(script: &Script) -> Result<InscriptionRecord, AppError> {
    let tokens = tokenize(script)?;
    decode_tokens(&tokens)
}

/// P2SHのアンロックスクリプト (`<partial> <sig> <lock>`) から末尾2要素を除いてデコードする
pub fn decode_unlock_script(script: &Script) -> Result<InscriptionRecord, AppError> {
    let tokens = tokenize(script)?;
    if tokens.len() < 2 {
        return Err(AppError::MalformedEnvelope(
            "アンロックスクリプトに署名とロックスクリプトがありません".to_string(),
        ));
    }
    decode_tokens(&tokens[..tokens.len() - 2])
}

/// 最初の入力の scriptSig に含まれるインスクリプションをデコードする
pub fn decode_transaction_inscription(tx: &Transaction) -> Result<InscriptionRecord, AppError> {
    let input = tx
        .input
        .first()
        .ok_or_else(|| AppError::MalformedEnvelope("トランザクションに入力がありません".to_string()))?;
    if input.script_sig.is_empty() {
        return Err(AppError::MalformedEnvelope("最初の入力に署名スクリプトがありません".to_string()));
    }
    decode_unlock_script(&input.script_sig)
}

pub(crate) fn tokenize(script: &Script) -> Result<Vec<Instruction<'_>>, AppError> {
    script
        .instructions()
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::ScriptDecode(e.to_string()))
}

fn decode_tokens(tokens: &[Instruction<'_>]) -> Result<InscriptionRecord, AppError> {
    let marker = tokens
        .first()
        .and_then(push_data_of)
        .ok_or_else(|| malformed("マーカーがありません"))?;

    match marker.as_slice() {
        ORD_MARKER => parse_doginal(tokens),
        METAID_MARKER => parse_metaid(tokens),
        other => Err(AppError::MalformedEnvelope(format!(
            "不明なマーカー: {}",
            String::from_utf8_lossy(other)
        ))),
    }
}

enum DoginalState {
    Marker,
    PartsCount,
    ContentType,
    Index,
    Chunk,
}

fn parse_doginal(tokens: &[Instruction<'_>]) -> Result<InscriptionRecord, AppError> {
    let mut state = DoginalState::Marker;
    let mut parts_count = 0u8;
    let mut content_type = String::new();
    let mut first_index: Option<u8> = None;
    let mut last_index: Option<u8> = None;
    let mut payload = Vec::new();

    for token in tokens {
        state = match state {
            DoginalState::Marker => {
                if push_data_of(token).as_deref() != Some(ORD_MARKER) {
                    return Err(malformed("'ord' マーカーがありません"));
                }
                DoginalState::PartsCount
            }
            DoginalState::PartsCount => {
                parts_count = read_small_number(token).ok_or_else(|| {
                    AppError::MalformedEnvelope(format!("パーツ数を解析できません: {:?}", token))
                })?;
                DoginalState::ContentType
            }
            DoginalState::ContentType => {
                let data = push_data_of(token).ok_or_else(|| malformed("contentType がありません"))?;
                content_type = String::from_utf8_lossy(&data).into_owned();
                DoginalState::Index
            }
            DoginalState::Index => {
                let index = read_small_number(token).ok_or_else(|| {
                    AppError::MalformedEnvelope(format!("インデックスを解析できません: {:?}", token))
                })?;
                let in_sequence = match last_index {
                    None => index < parts_count,
                    Some(previous) => previous.checked_sub(1) == Some(index),
                };
                if !in_sequence {
                    return Err(AppError::MalformedEnvelope(format!(
                        "インデックスの順序が不正です: {} (パーツ数 {})",
                        index, parts_count
                    )));
                }
                first_index.get_or_insert(index);
                last_index = Some(index);
                DoginalState::Chunk
            }
            DoginalState::Chunk => {
                let data = push_data_of(token).ok_or_else(|| malformed("データチャンクがありません"))?;
                payload.extend_from_slice(&data);
                DoginalState::Index
            }
        };
    }

    match (state, first_index) {
        (DoginalState::Index, Some(index)) => Ok(InscriptionRecord {
            content_type,
            payload,
            fields: InscriptionFields::Doginal { parts_count, index },
        }),
        (DoginalState::Index, None) => Err(malformed("データがありません")),
        (DoginalState::Chunk, _) => Err(malformed("インデックスに対応するデータチャンクがありません")),
        (DoginalState::PartsCount, _) => Err(malformed("パーツ数がありません")),
        (DoginalState::Marker | DoginalState::ContentType, _) => Err(malformed("contentType がありません")),
    }
}

/// MetaID 固定ヘッダのフィールド数 (マーカーを含む)
const METAID_HEADER_FIELDS: usize = 6;

fn parse_metaid(tokens: &[Instruction<'_>]) -> Result<InscriptionRecord, AppError> {
    const FIELD_NAMES: [&str; METAID_HEADER_FIELDS] =
        ["metaid", "operation", "path", "encryption", "version", "contentType"];

    if tokens.len() <= METAID_HEADER_FIELDS {
        return Err(AppError::MalformedEnvelope(format!(
            "MetaID形式には少なくとも{}個のチャンクが必要です (実際: {})",
            METAID_HEADER_FIELDS + 1,
            tokens.len()
        )));
    }

    let mut header: Vec<String> = Vec::with_capacity(METAID_HEADER_FIELDS);
    for (token, name) in tokens.iter().zip(FIELD_NAMES) {
        let data = push_data_of(token)
            .ok_or_else(|| AppError::MalformedEnvelope(format!("{} がありません", name)))?;
        header.push(String::from_utf8_lossy(&data).into_owned());
    }
    if header[0].as_bytes() != METAID_MARKER {
        return Err(malformed("'metaid' マーカーがありません"));
    }

    let mut payload = Vec::new();
    for token in &tokens[METAID_HEADER_FIELDS..] {
        let data = push_data_of(token).ok_or_else(|| malformed("ペイロードにデータ以外のオペコードがあります"))?;
        payload.extend_from_slice(&data);
    }

    let [_, operation, path, encryption, version, content_type]: [String; METAID_HEADER_FIELDS] =
        header.try_into().map_err(|_| malformed("MetaIDヘッダが不完全です"))?;

    Ok(InscriptionRecord {
        content_type,
        payload,
        fields: InscriptionFields::MetaId { operation, path, encryption, version },
    })
}

fn malformed(message: &str) -> AppError {
    AppError::MalformedEnvelope(message.to_string())
}

/// データプッシュとして最小化されたオペコードも含めて、プッシュされるバイト列を返す
fn push_data_of(instruction: &Instruction<'_>) -> Option<Vec<u8>> {
    match instruction {
        Instruction::PushBytes(bytes) => Some(bytes.as_bytes().to_vec()),
        Instruction::Op(op) if *op == OP_PUSHNUM_NEG1 => Some(vec![0x81]),
        Instruction::Op(op) => {
            let code = op.to_u8();
            (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8())
                .contains(&code)
                .then(|| vec![code - OP_PUSHNUM_1.to_u8() + 1])
        }
    }
}

fn push_data(builder: Builder, data: &[u8]) -> Result<Builder, AppError> {
    Ok(match data {
        [] => builder.push_opcode(opcodes::OP_0),
        [n @ 1..=16] => builder.push_opcode(Opcode::from(OP_PUSHNUM_1.to_u8() + n - 1)),
        [0x81] => builder.push_opcode(OP_PUSHNUM_NEG1),
        _ => {
            let push = <&PushBytes>::try_from(data)
                .map_err(|e| AppError::MalformedEnvelope(format!("プッシュできないデータ: {}", e)))?;
            builder.push_slice(push)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8 + 0x20).collect()
    }

    #[test]
    fn doginal_single_chunk_round_trips() {
        let payload = b"Hello, Dogecoin Inscription!".to_vec();
        let script = build_doginal(&payload, "text/plain").unwrap();

        let record = decode(&script).unwrap();
        assert_eq!(record.format(), InscriptionFormat::Doginal);
        assert_eq!(record.content_type, "text/plain");
        assert_eq!(record.payload, payload);
        assert_eq!(record.fields, InscriptionFields::Doginal { parts_count: 1, index: 0 });
    }

    #[test]
    fn doginal_multi_chunk_round_trips() {
        let payload = sample_payload(2600);
        let script = build_doginal(&payload, "image/png").unwrap();

        let record = decode(&script).unwrap();
        assert_eq!(record.content_type, "image/png");
        assert_eq!(record.payload, payload);
        assert_eq!(record.fields, InscriptionFields::Doginal { parts_count: 11, index: 10 });
    }

    #[test]
    fn doginal_pushes_respect_chunk_ceiling() {
        let payload = sample_payload(1000);
        let script = build_doginal(&payload, "text/plain").unwrap();

        let pushes: Vec<usize> = script
            .instructions()
            .filter_map(|i| match i.unwrap() {
                Instruction::PushBytes(b) => Some(b.len()),
                Instruction::Op(_) => None,
            })
            .collect();
        assert!(pushes.iter().all(|len| *len <= MAX_CHUNK_LEN));

        // 1000 / 240 の切り上げ
        let tokens = tokenize(&script).unwrap();
        assert_eq!(read_small_number(&tokens[1]), Some(5));
    }

    #[test]
    fn doginal_layout_matches_reference_order() {
        let mut payload = vec![b'a'; MAX_CHUNK_LEN];
        payload.extend_from_slice(b"tail");
        let script = build_doginal(&payload, "text/plain").unwrap();

        let mut expected = vec![0x03];
        expected.extend_from_slice(b"ord");
        expected.push(0x52); // OP_2
        expected.push(10);
        expected.extend_from_slice(b"text/plain");
        expected.push(0x51); // OP_1: 先頭チャンク
        expected.extend_from_slice(&[0x4c, 240]);
        expected.extend_from_slice(&[b'a'; MAX_CHUNK_LEN]);
        expected.push(0x00); // OP_0: 最終チャンク
        expected.push(4);
        expected.extend_from_slice(b"tail");

        assert_eq!(script.as_bytes(), expected.as_slice());
    }

    #[test]
    fn doginal_rejects_large_numeric_push() {
        // パーツ数を OP_N ではなくデータプッシュで表現したもの
        let script = Builder::new()
            .push_slice(b"ord")
            .push_slice([17u8])
            .push_slice(b"text/plain")
            .push_opcode(opcodes::OP_0)
            .push_slice(b"data")
            .into_script();

        let err = decode(&script).unwrap_err();
        assert!(matches!(err, AppError::MalformedEnvelope(ref m) if m.contains("パーツ数")), "{}", err);
    }

    #[test]
    fn doginal_rejects_missing_chunk() {
        let script = Builder::new()
            .push_slice(b"ord")
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(b"text/plain")
            .push_opcode(opcodes::OP_0)
            .into_script();
        assert!(decode(&script).is_err());

        let script = Builder::new().push_slice(b"ord").push_opcode(OP_PUSHNUM_1).into_script();
        assert!(decode(&script).is_err());
    }

    #[test]
    fn doginal_rejects_out_of_order_index() {
        let script = Builder::new()
            .push_slice(b"ord")
            .push_opcode(bitcoin::opcodes::all::OP_PUSHNUM_2)
            .push_slice(b"text/plain")
            .push_opcode(opcodes::OP_0)
            .push_slice(b"first")
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(b"second")
            .into_script();
        assert!(decode(&script).is_err());
    }

    #[test]
    fn unknown_marker_is_rejected() {
        let script = Builder::new().push_slice(b"brc20").push_slice(b"x").into_script();
        let err = decode(&script).unwrap_err();
        assert!(matches!(err, AppError::MalformedEnvelope(_)));
    }

    #[test]
    fn metaid_round_trips_with_overriding_content_type() {
        let payload = sample_payload(50);
        let options = MetaIdOptions::default();
        let script = build_metaid(&payload, "/file", &options).unwrap();

        let record = decode(&script).unwrap();
        assert_eq!(record.format(), InscriptionFormat::MetaId);
        assert_eq!(record.content_type, "application/json");
        assert_eq!(record.payload, payload);
        assert_eq!(
            record.fields,
            InscriptionFields::MetaId {
                operation: "create".to_string(),
                path: "/file".to_string(),
                encryption: "0".to_string(),
                version: "0.0.1".to_string(),
            }
        );
    }

    #[test]
    fn metaid_multi_chunk_payload_is_forward_order() {
        let payload = sample_payload(700);
        let options = MetaIdOptions { content_type: "text/plain".to_string(), ..MetaIdOptions::default() };
        let script = build_metaid(&payload, "/info/name", &options).unwrap();

        let record = decode(&script).unwrap();
        assert_eq!(record.payload, payload);
        assert_eq!(record.content_type, "text/plain");
    }

    #[test]
    fn metaid_requires_payload_chunk() {
        let script = build_metaid(&[], "/file", &MetaIdOptions::default()).unwrap();
        assert!(decode(&script).is_err());
    }

    #[test]
    fn unlock_script_strips_signature_and_lock() {
        let payload = sample_payload(50);
        let envelope = build_metaid(&payload, "/file", &MetaIdOptions::default()).unwrap();

        let mut unlock = envelope.into_bytes();
        let tail = Builder::new().push_slice([0x30u8; 71]).push_slice([0x21u8; 40]).into_script();
        unlock.extend_from_slice(tail.as_bytes());

        let record = decode_unlock_script(Script::from_bytes(&unlock)).unwrap();
        assert_eq!(record.payload, payload);
    }

    #[test]
    fn small_payload_bytes_are_minimally_pushed() {
        // 最終チャンクが 0x05 の1バイトになる場合は OP_5 として出力される
        let mut payload = vec![0xaa; MAX_CHUNK_LEN];
        payload.push(0x05);
        let script = build_doginal(&payload, "text/plain").unwrap();
        assert_eq!(script.as_bytes().last(), Some(&0x55));

        let record = decode(&script).unwrap();
        assert_eq!(record.payload, payload);
    }
}
