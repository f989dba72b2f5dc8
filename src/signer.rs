use bitcoin::{
    hashes::Hash,
    key::TapTweak,
    script::{Builder, PushBytesBuf},
    secp256k1::{All, Keypair, Message, Secp256k1},
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    PrivateKey, Script, ScriptBuf, Transaction, TxOut, Witness,
};

use crate::{
    error::AppError,
    types::{SignMode, Utxo},
};

/// 入力を UTXO の署名方式に従って署名し、scriptSig / witness を設定する。
///
/// `prevouts` はトランザクションの全入力分を入力順に渡す (Taprootの署名ハッシュで使用)。
pub fn sign_input(
    secp: &Secp256k1<All>,
    tx: &mut Transaction,
    input_index: usize,
    utxo: &Utxo,
    prevouts: &[TxOut],
) -> Result<(), AppError> {
    if input_index >= tx.input.len() {
        return Err(AppError::SigningFailure {
            input_index,
            reason: format!("入力数 {} を超えています", tx.input.len()),
        });
    }
    let public_key = utxo.private_key.public_key(secp);
    log::debug!("入力 {} ({:?}) の署名を開始します。", input_index, utxo.sign_mode);

    match utxo.sign_mode {
        SignMode::Legacy => {
            let signature = sign_legacy_script(secp, tx, input_index, &utxo.script_pubkey, &utxo.private_key)?;
            tx.input[input_index].script_sig = Builder::new()
                .push_slice(to_push_bytes(signature, input_index)?)
                .push_key(&public_key)
                .into_script();
        }
        SignMode::NativeSegwit | SignMode::NestedSegwit => {
            let wpubkey_hash = public_key.wpubkey_hash().map_err(|e| AppError::SigningFailure {
                input_index,
                reason: e.to_string(),
            })?;
            let p2wpkh = ScriptBuf::new_p2wpkh(&wpubkey_hash);
            let sighash_type = EcdsaSighashType::AllPlusAnyoneCanPay;

            let sighash = SighashCache::new(&*tx)
                .p2wpkh_signature_hash(input_index, &p2wpkh, utxo.value, sighash_type)
                .map_err(|e| AppError::Sighash { input_index, reason: e.to_string() })?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::ecdsa::Signature {
                signature: secp.sign_ecdsa(&message, &utxo.private_key.inner),
                sighash_type,
            };

            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            witness.push(public_key.to_bytes());
            tx.input[input_index].witness = witness;

            if utxo.sign_mode == SignMode::NestedSegwit {
                tx.input[input_index].script_sig = Builder::new()
                    .push_slice(to_push_bytes(p2wpkh.into_bytes(), input_index)?)
                    .into_script();
            }
        }
        SignMode::Taproot => {
            let keypair = Keypair::from_secret_key(secp, &utxo.private_key.inner);
            let tweaked = keypair.tap_tweak(secp, None);
            let sighash_type = TapSighashType::Default;

            let sighash = SighashCache::new(&*tx)
                .taproot_key_spend_signature_hash(input_index, &Prevouts::All(prevouts), sighash_type)
                .map_err(|e| AppError::Sighash { input_index, reason: e.to_string() })?;
            let message = Message::from_digest(sighash.to_byte_array());
            let signature = bitcoin::taproot::Signature {
                signature: secp.sign_schnorr_no_aux_rand(&message, &tweaked.to_inner()),
                sighash_type,
            };

            let mut witness = Witness::new();
            witness.push(signature.to_vec());
            tx.input[input_index].witness = witness;
        }
    }

    log::debug!("入力 {} の署名適用完了。", input_index);
    Ok(())
}

/// `utxos[i]` を入力 `start_index + i` として順に署名する
pub fn sign_inputs(
    secp: &Secp256k1<All>,
    tx: &mut Transaction,
    utxos: &[Utxo],
    start_index: usize,
    prevouts: &[TxOut],
) -> Result<(), AppError> {
    for (offset, utxo) in utxos.iter().enumerate() {
        sign_input(secp, tx, start_index + offset, utxo, prevouts)?;
    }
    Ok(())
}

/// レガシー (SIGHASH_ALL) 署名を DER + sighashバイトで返す。`script_code` はP2SHならredeem script
pub fn sign_legacy_script(
    secp: &Secp256k1<All>,
    tx: &Transaction,
    input_index: usize,
    script_code: &Script,
    private_key: &PrivateKey,
) -> Result<Vec<u8>, AppError> {
    let sighash_type = EcdsaSighashType::All;
    let sighash = SighashCache::new(tx)
        .legacy_signature_hash(input_index, script_code, sighash_type.to_u32())
        .map_err(|e| AppError::Sighash { input_index, reason: e.to_string() })?;
    let message = Message::from_digest(sighash.to_byte_array());

    let signature = bitcoin::ecdsa::Signature {
        signature: secp.sign_ecdsa(&message, &private_key.inner),
        sighash_type,
    };
    Ok(signature.to_vec())
}

fn to_push_bytes(bytes: Vec<u8>, input_index: usize) -> Result<PushBytesBuf, AppError> {
    PushBytesBuf::try_from(bytes).map_err(|e| AppError::SigningFailure { input_index, reason: e.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::{
        absolute::LockTime, transaction::Version, Amount, CompressedPublicKey, NetworkKind, OutPoint,
        ScriptHash, Sequence, TxIn, Txid,
    };
    use bitcoin::secp256k1::{SecretKey, XOnlyPublicKey};

    fn key(byte: u8) -> PrivateKey {
        PrivateKey::new(SecretKey::from_slice(&[byte; 32]).unwrap(), NetworkKind::Main)
    }

    fn spend(utxo: &Utxo) -> Transaction {
        Transaction {
            version: Version(2),
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: utxo.out_point,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(1000), script_pubkey: utxo.script_pubkey.clone() }],
        }
    }

    fn utxo(private_key: PrivateKey, script_pubkey: ScriptBuf, sign_mode: SignMode) -> Utxo {
        Utxo {
            out_point: OutPoint::new(Txid::all_zeros(), 0),
            script_pubkey,
            value: Amount::from_sat(50_000),
            private_key,
            sign_mode,
        }
    }

    #[test]
    fn legacy_input_gets_signature_and_pubkey() {
        let secp = Secp256k1::new();
        let private_key = key(3);
        let public_key = private_key.public_key(&secp);
        let utxo = utxo(private_key, ScriptBuf::new_p2pkh(&public_key.pubkey_hash()), SignMode::Legacy);
        let mut tx = spend(&utxo);

        sign_input(&secp, &mut tx, 0, &utxo, &[utxo.tx_out()]).unwrap();

        let pushes: Vec<_> = tx.input[0].script_sig.instructions().map(|i| i.unwrap()).collect();
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].push_bytes().unwrap().as_bytes(), public_key.to_bytes().as_slice());
        assert!(tx.input[0].witness.is_empty());
    }

    #[test]
    fn nested_segwit_input_carries_redeem_script() {
        let secp = Secp256k1::new();
        let private_key = key(4);
        let compressed = CompressedPublicKey::from_private_key(&secp, &private_key).unwrap();
        let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
        let utxo = utxo(private_key, ScriptBuf::new_p2sh(&ScriptHash::hash(redeem.as_bytes())), SignMode::NestedSegwit);
        let mut tx = spend(&utxo);

        sign_input(&secp, &mut tx, 0, &utxo, &[utxo.tx_out()]).unwrap();

        assert_eq!(tx.input[0].witness.len(), 2);
        let signature = tx.input[0].witness.nth(0).unwrap();
        assert_eq!(*signature.last().unwrap(), EcdsaSighashType::AllPlusAnyoneCanPay.to_u32() as u8);
        let pushed = tx.input[0].script_sig.instructions().next().unwrap().unwrap();
        assert_eq!(pushed.push_bytes().unwrap().as_bytes(), redeem.as_bytes());
    }

    #[test]
    fn taproot_input_gets_single_schnorr_signature() {
        let secp = Secp256k1::new();
        let private_key = key(5);
        let keypair = Keypair::from_secret_key(&secp, &private_key.inner);
        let (internal, _) = XOnlyPublicKey::from_keypair(&keypair);
        let utxo = utxo(private_key, ScriptBuf::new_p2tr(&secp, internal, None), SignMode::Taproot);
        let mut tx = spend(&utxo);

        sign_input(&secp, &mut tx, 0, &utxo, &[utxo.tx_out()]).unwrap();

        assert_eq!(tx.input[0].witness.len(), 1);
        assert_eq!(tx.input[0].witness.nth(0).unwrap().len(), 64);
        assert!(tx.input[0].script_sig.is_empty());
    }

    #[test]
    fn signing_out_of_range_input_fails() {
        let secp = Secp256k1::new();
        let private_key = key(6);
        let public_key = private_key.public_key(&secp);
        let utxo = utxo(private_key, ScriptBuf::new_p2pkh(&public_key.pubkey_hash()), SignMode::Legacy);
        let mut tx = spend(&utxo);

        let err = sign_input(&secp, &mut tx, 3, &utxo, &[utxo.tx_out()]).unwrap_err();
        assert!(matches!(err, AppError::SigningFailure { input_index: 3, .. }));
    }
}
