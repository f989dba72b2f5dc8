use std::fs::File;
use std::io::Write;
use std::path::Path;

use bitcoin::consensus::encode;
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{Amount, Script, Transaction};
use clap::Parser;

use doge_inscribe::chain::{build_inscription_chain, ChainRequest};
use doge_inscribe::cli::{parse_network, CliArgs, Command};
use doge_inscribe::config::{load_config, resolve_utxos, InscribeConfig, SendConfig};
use doge_inscribe::envelope::{self, InscriptionRecord};
use doge_inscribe::error::AppError;
use doge_inscribe::network::Network;
use doge_inscribe::transaction::{assemble_transaction, AssembleRequest};

fn main() -> Result<(), AppError> {
    env_logger::init();

    let args = CliArgs::parse();
    log::info!("アプリケーションを開始します。引数: {:?}", args);

    let network = parse_network(&args.network)?;
    log::info!("指定されたネットワーク: {}", network);

    let secp = Secp256k1::new();

    match &args.command {
        Command::Send { input_file, output_file } => run_send(&secp, network, input_file, output_file)?,
        Command::Inscribe { input_file, output_file } => run_inscribe(&secp, network, input_file, output_file)?,
        Command::Decode { input_file, script } => run_decode(input_file, *script)?,
    }

    log::info!("処理が正常に完了しました。");
    Ok(())
}

fn run_send(secp: &Secp256k1<All>, network: Network, input_file: &Path, output_file: &Path) -> Result<(), AppError> {
    let config: SendConfig = load_config(input_file)?;
    log::debug!("入力設定ファイルのパース成功: {:?}", config);

    let utxos = resolve_utxos(&config.utxos, network)?;
    let outputs = config.payment_outputs();
    let request = AssembleRequest {
        network,
        utxos: &utxos,
        outputs: &outputs,
        change_address: config.change_address.as_deref(),
        fee_rate: config.fee_rate,
        unsigned: config.unsigned,
    };

    let tx = assemble_transaction(secp, &request)?;
    log::info!("トランザクションの生成に成功しました。txid: {}", tx.compute_txid());

    write_transactions(output_file, [&tx])
}

fn run_inscribe(secp: &Secp256k1<All>, network: Network, input_file: &Path, output_file: &Path) -> Result<(), AppError> {
    let config: InscribeConfig = load_config(input_file)?;
    log::debug!("入力設定ファイルのパース成功: {:?}", config);

    let payload = config.payload_bytes()?;
    let request = ChainRequest {
        network,
        payload: &payload,
        envelope: config.envelope_kind()?,
        utxos: resolve_utxos(&config.utxos, network)?,
        destination: config.destination.as_deref(),
        output_value: Amount::from_sat(config.output_value_sats),
        change_address: config.change_address.as_deref(),
        fee_rate: config.fee_rate,
        one_time_key: config.one_time_key(network)?,
    };

    let chain = build_inscription_chain(secp, request)?;
    log::info!(
        "コミット {} 件, リビール {} 件, 手数料合計 {} sats",
        chain.commits().count(),
        usize::from(chain.reveal().is_some()),
        chain.total_fee().to_sat()
    );

    write_transactions(output_file, chain.transactions())
}

fn run_decode(input_file: &Path, script: bool) -> Result<(), AppError> {
    let content = std::fs::read_to_string(input_file).map_err(|e| {
        log::error!("入力ファイルの読み込みに失敗しました: {:?}", input_file);
        AppError::Io(e)
    })?;
    let bytes = hex::decode(content.trim())
        .map_err(|e| AppError::InputValidation(format!("hexのデコード失敗: {}", e)))?;

    let record = if script {
        envelope::decode(Script::from_bytes(&bytes))?
    } else {
        let tx: Transaction = encode::deserialize(&bytes)?;
        log::info!("トランザクションを読み込みました。txid: {}", tx.compute_txid());
        envelope::decode_transaction_inscription(&tx)?
    };

    print_record(&record);
    Ok(())
}

fn print_record(record: &InscriptionRecord) {
    println!("format: {:?}", record.format());
    println!("contentType: {}", record.content_type);
    println!("fields: {:?}", record.fields);
    println!("payloadLength: {}", record.payload.len());
    match std::str::from_utf8(&record.payload) {
        Ok(text) => println!("payload: {}", text),
        Err(_) => println!("payloadHex: {}", hex::encode(&record.payload)),
    }
}

/// ブロードキャスト順に1行1トランザクションで標準出力とファイルへ書き出す
fn write_transactions<'a>(output_file: &Path, txs: impl IntoIterator<Item = &'a Transaction>) -> Result<(), AppError> {
    let mut output = File::create(output_file).map_err(|e| {
        log::error!("出力ファイルの作成に失敗しました: {:?}", output_file);
        AppError::Io(e)
    })?;

    for tx in txs {
        let serialized_tx = encode::serialize_hex(tx);
        log::info!("Raw transaction hex: {}", serialized_tx);
        println!("{}", serialized_tx);
        writeln!(output, "{}", serialized_tx).map_err(|e| {
            log::error!("出力ファイルへの書き込みに失敗しました。");
            AppError::Io(e)
        })?;
    }

    log::info!("Raw transactionを {:?} に保存しました。", output_file);
    Ok(())
}
