//! Dogecoin インスクリプション (Doginal / MetaID) の構築ツールキット。
//!
//! エンベロープのエンコード/デコード、UTXOによる資金調達、P2SHコミット/リビールチェーンの構築、
//! 4種類の署名方式に対応した単発トランザクションの組み立てを提供する。

pub mod chain;
pub mod cli;
pub mod config;
pub mod envelope;
pub mod error;
pub mod funding;
pub mod network;
pub mod script_num;
pub mod signer;
pub mod transaction;
pub mod types;

pub use error::AppError;
