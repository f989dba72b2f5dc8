use bitcoin::{
    absolute::LockTime,
    script::Builder,
    secp256k1::{All, Secp256k1},
    transaction::Version,
    Amount, Transaction, TxOut, Witness,
};

use crate::{
    error::AppError,
    funding::{unsigned_input, DUST_LIMIT},
    network::Network,
    signer::sign_inputs,
    types::{AddressClass, PaymentOutput, Utxo},
};

// トランザクションサイズの推定に使用するダミーデータ
const DUMMY_SIGNATURE_LEN: usize = 72;
const DUMMY_WITNESS_SIGNATURE_LEN: usize = 71;
const DUMMY_PUBKEY_LEN: usize = 33;
const DUMMY_SCHNORR_SIGNATURE_LEN: usize = 64;
// P2SH-P2WPKH の redeem script (OP_0 <20バイト>)
const DUMMY_NESTED_REDEEM_LEN: usize = 22;

/// 単発トランザクションの組み立て要求
#[derive(Debug)]
pub struct AssembleRequest<'a> {
    pub network: Network,
    pub utxos: &'a [Utxo],
    pub outputs: &'a [PaymentOutput],
    pub change_address: Option<&'a str>,
    /// vバイトあたりの手数料
    pub fee_rate: u64,
    pub unsigned: bool,
}

/// 与えられたUTXOをすべて使い、指定の出力とおつりを持つトランザクションを組み立てて署名する。
///
/// 手数料は入力のアドレス種別ごとのダミー署名で埋めたトランザクションの vsize から計算する。
pub fn assemble_transaction(secp: &Secp256k1<All>, request: &AssembleRequest<'_>) -> Result<Transaction, AppError> {
    log::info!("トランザクション構築処理を開始します。");

    let mut outputs = Vec::with_capacity(request.outputs.len() + 1);
    let mut output_total: u64 = 0;
    for output in request.outputs {
        let script_pubkey = request.network.address_to_script(&output.address)?;
        outputs.push(TxOut { value: output.value, script_pubkey });
        output_total += output.value.to_sat();
        log::debug!("受信者出力追加: address={}, value={}", output.address, output.value.to_sat());
    }

    let change_script = request
        .change_address
        .map(|address| request.network.address_to_script(address))
        .transpose()?;
    if let Some(script_pubkey) = &change_script {
        outputs.push(TxOut { value: Amount::ZERO, script_pubkey: script_pubkey.clone() });
    }

    let input_total: u64 = request.utxos.iter().map(|u| u.value.to_sat()).sum();
    let mut transaction = Transaction {
        version: Version(2),
        lock_time: LockTime::ZERO,
        input: request.utxos.iter().map(unsigned_input).collect(),
        output: outputs,
    };

    let estimated_vsize = estimate_vsize(&transaction, request.utxos);
    let fee = estimated_vsize as u64 * request.fee_rate;
    log::debug!(
        "推定vsize: {} vB, 手数料率: {} sats/vB, 計算された手数料: {} sats",
        estimated_vsize, request.fee_rate, fee
    );

    if input_total < output_total + fee {
        return Err(AppError::InsufficientFunds {
            stage: None,
            available: input_total,
            required: output_total + fee,
            fee,
        });
    }

    let change = Amount::from_sat(input_total - output_total - fee);
    if change_script.is_some() {
        let last = transaction.output.len() - 1;
        if change >= DUST_LIMIT {
            log::debug!("おつり発生: {} sats", change.to_sat());
            transaction.output[last].value = change;
        } else {
            log::warn!("おつり {} sats はダスト閾値 {} sats 未満のため手数料に含めます。", change.to_sat(), DUST_LIMIT.to_sat());
            transaction.output.truncate(last);
        }
    }

    if request.unsigned {
        log::info!("未署名のトランザクションを返します。");
        return Ok(transaction);
    }

    log::info!("トランザクション署名処理を開始します。");
    let prevouts: Vec<TxOut> = request.utxos.iter().map(Utxo::tx_out).collect();
    sign_inputs(secp, &mut transaction, request.utxos, 0, &prevouts)?;
    log::info!("全ての入力の署名が完了しました。");

    Ok(transaction)
}

/// 入力をアドレス種別ごとのダミー scriptSig / witness で埋めて vsize を求める。
/// 判定できない scriptPubKey の入力は推定に含めない
fn estimate_vsize(transaction: &Transaction, utxos: &[Utxo]) -> usize {
    let mut template = transaction.clone();
    for (tx_in, utxo) in template.input.iter_mut().zip(utxos) {
        let class = match AddressClass::from_script(&utxo.script_pubkey) {
            Ok(class) => class,
            Err(e) => {
                log::warn!("入力 {} のサイズ推定をスキップします: {}", utxo.out_point, e);
                continue;
            }
        };
        match class {
            AddressClass::PubKeyHash => {
                tx_in.script_sig = Builder::new()
                    .push_slice([0u8; DUMMY_SIGNATURE_LEN])
                    .push_slice([0u8; DUMMY_PUBKEY_LEN])
                    .into_script();
            }
            AddressClass::ScriptHash => {
                tx_in.script_sig = Builder::new().push_slice([0u8; DUMMY_NESTED_REDEEM_LEN]).into_script();
                tx_in.witness = dummy_segwit_witness();
            }
            AddressClass::WitnessV1Taproot => {
                tx_in.witness = Witness::from_slice(&[vec![0u8; DUMMY_SCHNORR_SIGNATURE_LEN]]);
            }
            AddressClass::Witness => {
                tx_in.witness = dummy_segwit_witness();
            }
        }
    }
    template.vsize()
}

fn dummy_segwit_witness() -> Witness {
    Witness::from_slice(&[vec![0u8; DUMMY_WITNESS_SIGNATURE_LEN], vec![0u8; DUMMY_PUBKEY_LEN]])
}
