//! P2SH コミット/リビールチェーンの構築。
//!
//! エンベロープを `MAX_PAYLOAD_LEN` 以下の断片 (partial) に分け、断片ごとに
//! `<pubkey> OP_CHECKSIGVERIFY OP_DROP*n OP_TRUE` をロックスクリプトとするP2SH出力を作る。
//! 次のトランザクションはその出力を `<partial> <sig> <lock>` で使い、断片をチェーン上に公開する。
//! 各ステップは前のステップの txid に依存するため、順番にしか構築できない。

use std::collections::VecDeque;

use bitcoin::{
    absolute::LockTime,
    hashes::{hash160, Hash},
    opcodes::{self, all::{OP_CHECKSIGVERIFY, OP_DROP}},
    script::{Builder, PushBytes, PushBytesBuf},
    secp256k1::{rand, All, Secp256k1, SecretKey},
    transaction::Version,
    Amount, NetworkKind, OutPoint, PrivateKey, PublicKey, Script, ScriptBuf, ScriptHash, Sequence,
    Transaction, TxIn, TxOut, Witness,
};

use crate::{
    envelope::EnvelopeKind,
    error::AppError,
    funding::{fund_transaction, Funded, FundingParams},
    network::Network,
    signer::{sign_inputs, sign_legacy_script},
    types::{SignMode, Utxo},
};

/// 1つの断片スクリプトの上限
pub const MAX_PAYLOAD_LEN: usize = 1500;

/// 各ステップのP2SH出力額
pub const STEP_OUTPUT_VALUE: Amount = Amount::from_sat(100_000);

/// リビール出力額の既定値
pub const DEFAULT_REVEAL_VALUE: Amount = Amount::from_sat(100_000);

// アンロックスクリプトの見積もり: 署名 72 バイト + プッシュ長などの余裕 10 バイト
const SIGNATURE_ESTIMATE: usize = 72;
const UNLOCK_OVERHEAD: usize = 10;

/// エンベロープの断片。`items` はスタックに積まれる要素数 (= 必要な OP_DROP の数)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partial {
    pub bytes: Vec<u8>,
    pub items: usize,
}

impl Partial {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// エンベロープを断片に分割する。
///
/// 最初の要素 (マーカー) を単独で、以降は2要素ずつ (数値 + データ) まとめて詰める。
/// プッシュの途中では切らないので、各断片はそれ単体で有効なスクリプトになる。
pub fn split_envelope(envelope: &Script) -> Result<Vec<Partial>, AppError> {
    let bytes = envelope.as_bytes();
    let mut bounds = envelope
        .instruction_indices()
        .map(|r| r.map(|(index, _)| index))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| AppError::ScriptDecode(e.to_string()))?;
    bounds.push(bytes.len());

    let tokens: Vec<&[u8]> = bounds.windows(2).map(|w| &bytes[w[0]..w[1]]).collect();
    let Some((first, rest)) = tokens.split_first() else {
        return Ok(Vec::new());
    };

    let groups = std::iter::once(std::slice::from_ref(first)).chain(rest.chunks(2));

    let mut partials = Vec::new();
    let mut current = Partial::default();
    for group in groups {
        let group_len: usize = group.iter().map(|t| t.len()).sum();
        if group_len > MAX_PAYLOAD_LEN {
            return Err(AppError::MalformedEnvelope(format!(
                "1つの要素が断片の上限 {} バイトを超えています: {}",
                MAX_PAYLOAD_LEN, group_len
            )));
        }
        if !current.is_empty() && current.len() + group_len > MAX_PAYLOAD_LEN {
            partials.push(std::mem::take(&mut current));
        }
        for token in group {
            current.bytes.extend_from_slice(token);
            current.items += 1;
        }
    }
    if !current.is_empty() {
        partials.push(current);
    }

    Ok(partials)
}

/// `<pubkey> OP_CHECKSIGVERIFY` の後に断片の要素数だけ OP_DROP を並べ、OP_TRUE で終える
pub fn build_lock_script(public_key: &PublicKey, partial: &Partial) -> ScriptBuf {
    let mut builder = Builder::new().push_key(public_key).push_opcode(OP_CHECKSIGVERIFY);
    for _ in 0..partial.items {
        builder = builder.push_opcode(OP_DROP);
    }
    builder.push_opcode(opcodes::OP_TRUE).into_script()
}

/// OP_HASH160 <hash160(lock)> OP_EQUAL
pub fn p2sh_script(lock_script: &Script) -> ScriptBuf {
    let hash = hash160::Hash::hash(lock_script.as_bytes());
    ScriptBuf::new_p2sh(&ScriptHash::from_raw_hash(hash))
}

/// 断片のバイト列をそのまま先頭に置き、署名とロックスクリプトをプッシュとして続ける
pub fn build_unlock_script(partial: &Partial, signature: Vec<u8>, lock_script: &Script) -> Result<ScriptBuf, AppError> {
    let signature = PushBytesBuf::try_from(signature)
        .map_err(|e| AppError::SigningFailure { input_index: 0, reason: e.to_string() })?;
    let lock = <&PushBytes>::try_from(lock_script.as_bytes())
        .map_err(|e| AppError::ScriptDecode(e.to_string()))?;
    let tail = Builder::new().push_slice(signature).push_slice(lock).into_script();

    let mut bytes = Vec::with_capacity(partial.len() + tail.len());
    bytes.extend_from_slice(&partial.bytes);
    bytes.extend_from_slice(tail.as_bytes());
    Ok(ScriptBuf::from_bytes(bytes))
}

#[derive(Debug)]
pub struct ChainRequest<'a> {
    pub network: Network,
    pub payload: &'a [u8],
    pub envelope: EnvelopeKind,
    pub utxos: Vec<Utxo>,
    /// 指定がなければリビールトランザクションを作らない
    pub destination: Option<&'a str>,
    /// 0 なら `DEFAULT_REVEAL_VALUE`
    pub output_value: Amount,
    pub change_address: Option<&'a str>,
    pub fee_rate: u64,
    /// P2SHロック用のワンタイム鍵。指定がなければ生成する
    pub one_time_key: Option<PrivateKey>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StepKind {
    Commit,
    Reveal,
}

#[derive(Debug, Clone)]
pub struct BuiltStep {
    pub kind: StepKind,
    pub transaction: Transaction,
    pub fee: Amount,
}

#[derive(Debug, Clone)]
pub struct InscriptionChain {
    pub steps: Vec<BuiltStep>,
    pub one_time_public_key: PublicKey,
    /// 最後のステップのおつりを含む、未使用のUTXO
    pub remaining_utxos: Vec<Utxo>,
}

impl InscriptionChain {
    pub fn transactions(&self) -> impl Iterator<Item = &Transaction> {
        self.steps.iter().map(|s| &s.transaction)
    }

    pub fn commits(&self) -> impl Iterator<Item = &Transaction> {
        self.steps.iter().filter(|s| s.kind == StepKind::Commit).map(|s| &s.transaction)
    }

    pub fn reveal(&self) -> Option<&Transaction> {
        self.steps.iter().find(|s| s.kind == StepKind::Reveal).map(|s| &s.transaction)
    }

    pub fn total_fee(&self) -> Amount {
        self.steps.iter().map(|s| s.fee).sum()
    }
}

/// 前のステップ。次のステップのアンロックスクリプトを作るためだけに保持する
#[derive(Debug)]
struct PreviousStep {
    out_point: OutPoint,
    lock_script: ScriptBuf,
    partial: Partial,
}

impl PreviousStep {
    fn prevout(&self) -> TxOut {
        TxOut { value: STEP_OUTPUT_VALUE, script_pubkey: p2sh_script(&self.lock_script) }
    }

    fn unlock_size_estimate(&self) -> usize {
        self.partial.len() + SIGNATURE_ESTIMATE + self.lock_script.len() + UNLOCK_OVERHEAD
    }
}

struct StepContext<'a> {
    secp: &'a Secp256k1<All>,
    one_time_key: &'a PrivateKey,
    change_script: Option<&'a Script>,
    fee_rate: u64,
}

pub fn build_inscription_chain(secp: &Secp256k1<All>, request: ChainRequest<'_>) -> Result<InscriptionChain, AppError> {
    log::info!("インスクリプションチェーンの構築を開始します。形式: {:?}", request.envelope.format());

    // アドレスは構築を始める前にすべて検証する
    let change_script = request
        .change_address
        .map(|address| request.network.address_to_script(address))
        .transpose()?;
    let destination_script = request
        .destination
        .map(|address| request.network.address_to_script(address))
        .transpose()?;

    let one_time_key = match request.one_time_key {
        Some(key) => key,
        None => PrivateKey::new(SecretKey::new(&mut rand::thread_rng()), NetworkKind::Main),
    };
    let public_key = one_time_key.public_key(secp);
    log::debug!("P2SHロック用ワンタイム公開鍵: {}", public_key);

    let envelope = request.envelope.build(request.payload)?;
    let partials = split_envelope(&envelope)?;
    log::info!("エンベロープ {} バイトを {} 個の断片に分割しました。", envelope.len(), partials.len());

    let ctx = StepContext { secp, one_time_key: &one_time_key, change_script: change_script.as_deref(), fee_rate: request.fee_rate };
    let mut pool: VecDeque<Utxo> = request.utxos.into();
    let mut previous: Option<PreviousStep> = None;
    let mut steps = Vec::with_capacity(partials.len() + 1);

    for (stage, partial) in partials.into_iter().enumerate() {
        let lock_script = build_lock_script(&public_key, &partial);
        let output = TxOut { value: STEP_OUTPUT_VALUE, script_pubkey: p2sh_script(&lock_script) };

        let (transaction, fee, next_pool) = build_step(&ctx, previous.as_ref(), output, pool, stage)?;
        pool = next_pool;
        log::info!(
            "コミット {} を構築しました: txid={}, 断片 {} バイト, 手数料 {}",
            stage, transaction.compute_txid(), partial.len(), fee.to_sat()
        );

        previous = Some(PreviousStep {
            out_point: OutPoint::new(transaction.compute_txid(), 0),
            lock_script,
            partial,
        });
        steps.push(BuiltStep { kind: StepKind::Commit, transaction, fee });
    }

    if let (Some(script_pubkey), Some(last)) = (destination_script, previous.as_ref()) {
        let value = if request.output_value == Amount::ZERO { DEFAULT_REVEAL_VALUE } else { request.output_value };
        let stage = steps.len();
        let (transaction, fee, next_pool) = build_step(&ctx, Some(last), TxOut { value, script_pubkey }, pool, stage)?;
        pool = next_pool;
        log::info!("リビールを構築しました: txid={}, 手数料 {}", transaction.compute_txid(), fee.to_sat());
        steps.push(BuiltStep { kind: StepKind::Reveal, transaction, fee });
    }

    log::info!("インスクリプションチェーンの構築が完了しました。トランザクション数: {}", steps.len());
    Ok(InscriptionChain { steps, one_time_public_key: public_key, remaining_utxos: pool.into() })
}

/// 1ステップ分: 入力と出力を組み、資金を調達し、資金入力 → チェーン入力の順に署名する
fn build_step(
    ctx: &StepContext<'_>,
    previous: Option<&PreviousStep>,
    output: TxOut,
    pool: VecDeque<Utxo>,
    stage: usize,
) -> Result<(Transaction, Amount, VecDeque<Utxo>), AppError> {
    let mut tx = Transaction { version: Version(2), lock_time: LockTime::ZERO, input: Vec::new(), output: vec![output] };
    if let Some(previous) = previous {
        tx.input.push(TxIn {
            previous_output: previous.out_point,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });
    }

    let params = FundingParams {
        change_script: ctx.change_script,
        fee_rate: ctx.fee_rate,
        existing_input: previous.map_or(Amount::ZERO, |_| STEP_OUTPUT_VALUE),
        extra_sig_size: previous.map_or(0, PreviousStep::unlock_size_estimate),
        stage: Some(stage),
    };
    let Funded { used, change_index, fee, pool } = fund_transaction(&mut tx, pool, &params)?;

    let mut prevouts: Vec<TxOut> = previous.iter().map(|p| p.prevout()).collect();
    prevouts.extend(used.iter().map(Utxo::tx_out));
    let start_index = usize::from(previous.is_some());
    sign_inputs(ctx.secp, &mut tx, &used, start_index, &prevouts)?;

    // P2SH入力の署名は資金入力の追加・署名がすべて終わってから行う
    if let Some(previous) = previous {
        let signature = sign_legacy_script(ctx.secp, &tx, 0, &previous.lock_script, ctx.one_time_key)?;
        tx.input[0].script_sig = build_unlock_script(&previous.partial, signature, &previous.lock_script)?;
    }

    let mut pool = pool;
    if let (Some(index), Some(first)) = (change_index, used.first()) {
        let change = &tx.output[index];
        pool.push_back(Utxo {
            out_point: OutPoint::new(tx.compute_txid(), index as u32),
            script_pubkey: change.script_pubkey.clone(),
            value: change.value,
            private_key: first.private_key.clone(),
            sign_mode: change_sign_mode(&change.script_pubkey),
        });
    }

    Ok((tx, fee, pool))
}

/// おつり出力の形式から次に使うときの署名方式を決める
fn change_sign_mode(script: &Script) -> SignMode {
    if script.is_p2wpkh() {
        SignMode::NativeSegwit
    } else if script.is_p2sh() {
        SignMode::NestedSegwit
    } else if script.is_p2tr() {
        SignMode::Taproot
    } else {
        SignMode::Legacy
    }
}
