use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use crate::error::AppError;
use crate::network::Network;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 使用するネットワーク ("dogecoin", "dogecoin-testnet", "dogecoin-regtest", "bitcoin", "testnet", "regtest")
    #[clap(short, long, value_parser, default_value = "dogecoin", global = true)]
    pub network: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// 任意の出力を持つ単発トランザクションを作成する
    Send {
        /// SendConfig を記述したJSONファイルへのパス
        #[clap(short, long, value_parser)]
        input_file: PathBuf,

        /// 生成されたraw transaction hexを保存するファイルへのパス
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
    },

    /// コミット/リビールチェーンを作成する。出力ファイルにはブロードキャスト順に1行1トランザクション
    Inscribe {
        /// InscribeConfig を記述したJSONファイルへのパス
        #[clap(short, long, value_parser)]
        input_file: PathBuf,

        #[clap(short, long, value_parser)]
        output_file: PathBuf,
    },

    /// トランザクション (またはスクリプト) のhexからインスクリプションを読み出す
    Decode {
        /// raw transaction hex を記述したファイルへのパス
        #[clap(short, long, value_parser)]
        input_file: PathBuf,

        /// 入力をトランザクションではなくエンベロープスクリプトのhexとして扱う
        #[clap(long)]
        script: bool,
    },
}

pub fn parse_network(network_str: &str) -> Result<Network, AppError> {
    Network::from_str(network_str)
}
