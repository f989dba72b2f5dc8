//! UTXOの選択と手数料計算。
//!
//! 手数料は最終的なサイズに依存し、サイズは選んだ入力数に依存するため、
//! 入力を1つ追加するごとに手数料を計算し直す。プールは呼び出し側が決めた順に先頭から使う。

use std::collections::VecDeque;

use bitcoin::{Amount, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::{error::AppError, types::Utxo};

/// これ未満のおつりは出力せずに手数料へ回す
pub const DUST_LIMIT: Amount = Amount::from_sat(600);

/// 未署名のレガシー入力に後から付く scriptSig (署名 + 圧縮公開鍵) の見積もりサイズ
pub const LEGACY_SIG_SCRIPT_SIZE: usize = 107;

#[derive(Debug, Clone)]
pub struct FundingParams<'a> {
    pub change_script: Option<&'a Script>,
    /// 1バイトあたりの手数料
    pub fee_rate: u64,
    /// プール以外から既に確保されている入力額 (チェーン入力など)
    pub existing_input: Amount,
    /// 既存入力の scriptSig に後から付くバイト数の見積もり
    pub extra_sig_size: usize,
    /// エラー報告用のステップ番号
    pub stage: Option<usize>,
}

/// 資金調達の結果。`pool` は残りのUTXO
#[derive(Debug)]
pub struct Funded {
    pub used: Vec<Utxo>,
    pub change_index: Option<usize>,
    pub fee: Amount,
    pub pool: VecDeque<Utxo>,
}

pub fn fund_transaction(
    tx: &mut Transaction,
    mut pool: VecDeque<Utxo>,
    params: &FundingParams<'_>,
) -> Result<Funded, AppError> {
    let output_total: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();

    let mut change_index = params.change_script.map(|script| {
        tx.output.push(TxOut { value: Amount::ZERO, script_pubkey: script.to_owned() });
        tx.output.len() - 1
    });

    let mut input_total = params.existing_input.to_sat();
    let mut used: Vec<Utxo> = Vec::new();

    loop {
        let fee = estimate_fee(tx, params, used.len());
        let required = output_total + fee;
        if input_total >= required {
            break;
        }

        let utxo = pool.pop_front().ok_or(AppError::InsufficientFunds {
            stage: params.stage,
            available: input_total,
            required,
            fee,
        })?;
        log::debug!(
            "UTXO追加: txid={}, vout={}, value={}",
            utxo.out_point.txid, utxo.out_point.vout, utxo.value.to_sat()
        );
        tx.input.push(unsigned_input(&utxo));
        input_total += utxo.value.to_sat();
        used.push(utxo);
    }

    let fee = estimate_fee(tx, params, used.len());
    let required = output_total + fee;
    if input_total < required {
        return Err(AppError::InsufficientFunds { stage: params.stage, available: input_total, required, fee });
    }

    let change = Amount::from_sat(input_total - required);
    if let Some(index) = change_index {
        if change >= DUST_LIMIT {
            tx.output[index].value = change;
        } else {
            log::warn!("おつり {} はダスト閾値 {} 未満のため手数料に含めます。", change.to_sat(), DUST_LIMIT.to_sat());
            tx.output.remove(index);
            change_index = None;
        }
    }

    log::debug!(
        "資金調達完了: 入力 {} 件, 入力額 {}, 出力額 {}, 手数料 {}, おつり出力 {:?}",
        used.len(), input_total, output_total, fee, change_index
    );

    Ok(Funded { used, change_index, fee: Amount::from_sat(fee), pool })
}

/// 現在のサイズ + 既存入力の署名見積もり + 追加した入力ごとのレガシー署名見積もり
fn estimate_fee(tx: &Transaction, params: &FundingParams<'_>, used_inputs: usize) -> u64 {
    let size = tx.total_size() + params.extra_sig_size + used_inputs * LEGACY_SIG_SCRIPT_SIZE;
    size as u64 * params.fee_rate
}

pub(crate) fn unsigned_input(utxo: &Utxo) -> TxIn {
    TxIn {
        previous_output: utxo.out_point,
        script_sig: ScriptBuf::new(),
        sequence: Sequence::MAX,
        witness: Witness::new(),
    }
}
