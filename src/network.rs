//! Dogecoin系/Bitcoin系ネットワークのアドレス・WIF処理。
//!
//! `bitcoin` クレートはDogecoinのバージョンバイトを知らないため、
//! Dogecoin系ではBase58Checkを直接扱い、Bitcoin系では `bitcoin::Address` に委譲する。

use std::fmt;
use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::SecretKey;
use bitcoin::{base58, Address, NetworkKind, PrivateKey, PubkeyHash, Script, ScriptBuf, ScriptHash};

use crate::error::AppError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Network {
    Dogecoin,
    DogecoinTestnet,
    DogecoinRegtest,
    Bitcoin,
    Testnet,
    Regtest,
}

/// Base58Check のバージョンバイト
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Base58Prefixes {
    pub pubkey_hash: u8,
    pub script_hash: u8,
    pub wif: u8,
}

impl Network {
    pub fn prefixes(self) -> Base58Prefixes {
        match self {
            Network::Dogecoin => Base58Prefixes { pubkey_hash: 0x1e, script_hash: 0x16, wif: 0x9e },
            Network::DogecoinTestnet => Base58Prefixes { pubkey_hash: 0x71, script_hash: 0xc4, wif: 0xf1 },
            Network::DogecoinRegtest => Base58Prefixes { pubkey_hash: 0x6f, script_hash: 0xc4, wif: 0xef },
            Network::Bitcoin => Base58Prefixes { pubkey_hash: 0x00, script_hash: 0x05, wif: 0x80 },
            Network::Testnet | Network::Regtest => Base58Prefixes { pubkey_hash: 0x6f, script_hash: 0xc4, wif: 0xef },
        }
    }

    /// Bitcoin系ネットワークであれば対応する `bitcoin::Network` を返す
    pub fn bitcoin_network(self) -> Option<bitcoin::Network> {
        match self {
            Network::Bitcoin => Some(bitcoin::Network::Bitcoin),
            Network::Testnet => Some(bitcoin::Network::Testnet),
            Network::Regtest => Some(bitcoin::Network::Regtest),
            _ => None,
        }
    }

    fn kind(self) -> NetworkKind {
        match self {
            Network::Dogecoin | Network::Bitcoin => NetworkKind::Main,
            _ => NetworkKind::Test,
        }
    }

    pub fn address_to_script(self, address: &str) -> Result<ScriptBuf, AppError> {
        let decode_err = |reason: String| AppError::AddressDecode { address: address.to_string(), reason };

        if let Some(network) = self.bitcoin_network() {
            let parsed = Address::from_str(address)
                .map_err(|e| decode_err(e.to_string()))?
                .require_network(network)
                .map_err(|e| decode_err(e.to_string()))?;
            return Ok(parsed.script_pubkey());
        }

        let data = base58::decode_check(address).map_err(|e| decode_err(e.to_string()))?;
        if data.len() != 21 {
            return Err(decode_err(format!("ペイロード長が不正です: {}", data.len())));
        }
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&data[1..]);

        let prefixes = self.prefixes();
        match data[0] {
            p if p == prefixes.pubkey_hash => Ok(ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array(hash))),
            p if p == prefixes.script_hash => Ok(ScriptBuf::new_p2sh(&ScriptHash::from_byte_array(hash))),
            p => Err(decode_err(format!("{} のバージョンバイトではありません: 0x{:02x}", self, p))),
        }
    }

    pub fn script_to_address(self, script: &Script) -> Result<String, AppError> {
        if let Some(network) = self.bitcoin_network() {
            return Address::from_script(script, network)
                .map(|a| a.to_string())
                .map_err(|_| AppError::UnknownScriptType { script_hex: script.to_hex_string() });
        }

        let bytes = script.as_bytes();
        let prefixes = self.prefixes();
        let (version, hash) = if script.is_p2pkh() {
            (prefixes.pubkey_hash, &bytes[3..23])
        } else if script.is_p2sh() {
            (prefixes.script_hash, &bytes[2..22])
        } else {
            return Err(AppError::UnknownScriptType { script_hex: script.to_hex_string() });
        };

        let mut payload = Vec::with_capacity(21);
        payload.push(version);
        payload.extend_from_slice(hash);
        Ok(base58::encode_check(&payload))
    }

    /// 64桁の16進数 (圧縮公開鍵扱い) またはこのネットワークのWIFを受け付ける
    pub fn parse_private_key(self, text: &str) -> Result<PrivateKey, AppError> {
        let text = text.trim();
        if text.len() == 64 && text.chars().all(|c| c.is_ascii_hexdigit()) {
            let bytes = hex::decode(text).map_err(|e| AppError::PrivateKey(e.to_string()))?;
            let secret = SecretKey::from_slice(&bytes).map_err(|e| AppError::PrivateKey(e.to_string()))?;
            return Ok(PrivateKey::new(secret, self.kind()));
        }

        let data = base58::decode_check(text).map_err(|e| AppError::PrivateKey(format!("WIFのデコード失敗: {}", e)))?;
        let wif = self.prefixes().wif;
        if data.first() != Some(&wif) {
            return Err(AppError::PrivateKey(format!(
                "{} のWIFではありません (期待値 0x{:02x})",
                self, wif
            )));
        }
        let compressed = match data.len() {
            33 => false,
            34 if data[33] == 0x01 => true,
            n => return Err(AppError::PrivateKey(format!("WIFの長さが不正です: {}", n))),
        };
        let secret = SecretKey::from_slice(&data[1..33]).map_err(|e| AppError::PrivateKey(e.to_string()))?;
        Ok(if compressed {
            PrivateKey::new(secret, self.kind())
        } else {
            PrivateKey::new_uncompressed(secret, self.kind())
        })
    }

    pub fn private_key_to_wif(self, key: &PrivateKey) -> String {
        let mut payload = Vec::with_capacity(34);
        payload.push(self.prefixes().wif);
        payload.extend_from_slice(&key.inner.secret_bytes());
        if key.compressed {
            payload.push(0x01);
        }
        base58::encode_check(&payload)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Dogecoin => "dogecoin",
            Network::DogecoinTestnet => "dogecoin-testnet",
            Network::DogecoinRegtest => "dogecoin-regtest",
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        f.write_str(name)
    }
}

impl FromStr for Network {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dogecoin" | "doge" => Ok(Network::Dogecoin),
            "dogecoin-testnet" | "doge-testnet" => Ok(Network::DogecoinTestnet),
            "dogecoin-regtest" | "doge-regtest" => Ok(Network::DogecoinRegtest),
            "bitcoin" | "mainnet" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    #[test]
    fn dogecoin_p2pkh_address_round_trips() {
        let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([7u8; 20]));
        let address = Network::Dogecoin.script_to_address(&script).unwrap();
        assert!(address.starts_with('D'), "{}", address);
        assert_eq!(Network::Dogecoin.address_to_script(&address).unwrap(), script);
    }

    #[test]
    fn dogecoin_p2sh_address_round_trips() {
        let script = ScriptBuf::new_p2sh(&ScriptHash::from_byte_array([9u8; 20]));
        let address = Network::Dogecoin.script_to_address(&script).unwrap();
        assert!(address.starts_with('9') || address.starts_with('A'), "{}", address);
        assert_eq!(Network::Dogecoin.address_to_script(&address).unwrap(), script);
    }

    #[test]
    fn address_from_other_network_is_rejected() {
        let script = ScriptBuf::new_p2pkh(&PubkeyHash::from_byte_array([7u8; 20]));
        let testnet_address = Network::DogecoinTestnet.script_to_address(&script).unwrap();
        let err = Network::Dogecoin.address_to_script(&testnet_address).unwrap_err();
        assert!(matches!(err, AppError::AddressDecode { .. }));
        assert!(Network::Dogecoin.address_to_script("not-an-address").is_err());
    }

    #[test]
    fn bitcoin_networks_accept_segwit_addresses() {
        let script = Network::Bitcoin
            .address_to_script("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
            .unwrap();
        assert!(script.is_p2wpkh());
    }

    #[test]
    fn private_key_accepts_hex_and_wif() {
        let hex_key = "0101010101010101010101010101010101010101010101010101010101010101";
        let key = Network::Dogecoin.parse_private_key(hex_key).unwrap();
        assert!(key.compressed);

        let wif = Network::Dogecoin.private_key_to_wif(&key);
        assert!(wif.starts_with('Q'), "{}", wif);
        let parsed = Network::Dogecoin.parse_private_key(&wif).unwrap();
        assert_eq!(parsed.inner, key.inner);

        let secp = Secp256k1::new();
        assert_eq!(parsed.public_key(&secp), key.public_key(&secp));

        assert!(Network::DogecoinTestnet.parse_private_key(&wif).is_err());
    }

    #[test]
    fn network_names_parse() {
        assert_eq!("doge".parse::<Network>().unwrap(), Network::Dogecoin);
        assert_eq!("Dogecoin-Testnet".parse::<Network>().unwrap(), Network::DogecoinTestnet);
        assert!("litecoin".parse::<Network>().is_err());
    }
}
