//! Calldata builder and mint authorizer
//!
//! The authorization is an HMAC-SHA256 over the tuple the buyer is allowed to
//! mint, checked by the minting contract's backend signer.

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;

use super::chain::abi;
use crate::config::ChainConfig;
use crate::core::{
    to_wei, Collectible, Collection, MintAuthorizer, PhaseKind, PipelineError, PipelineResult,
    PreparedMint, UnsignedTx, ValidationError,
};

type HmacSha256 = Hmac<Sha256>;

pub struct CalldataAuthorizer {
    chain_id: u64,
    native_decimals: u32,
    mint_selector: String,
    transfer_selector: String,
    secret: Vec<u8>,
}

impl CalldataAuthorizer {
    pub fn new(
        chain_id: u64,
        native_decimals: u32,
        mint_selector: impl Into<String>,
        transfer_selector: impl Into<String>,
        secret: impl AsRef<[u8]>,
    ) -> Self {
        Self {
            chain_id,
            native_decimals,
            mint_selector: mint_selector.into().to_ascii_lowercase(),
            transfer_selector: transfer_selector.into().to_ascii_lowercase(),
            secret: secret.as_ref().to_vec(),
        }
    }

    pub fn from_config(config: &ChainConfig) -> Self {
        Self::new(
            config.chain_id,
            config.native_decimals,
            &config.mint_selector,
            &config.transfer_selector,
            &config.authorizer_secret,
        )
    }

    fn mac(&self) -> PipelineResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| PipelineError::Configuration(format!("authorizer secret: {}", e)))
    }

    fn message(
        &self,
        contract: &str,
        nft_id: i64,
        buyer_address: &str,
        price_wei: u128,
        phase: PhaseKind,
    ) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.chain_id,
            contract.to_ascii_lowercase(),
            nft_id,
            buyer_address.to_ascii_lowercase(),
            price_wei,
            phase
        )
    }

    /// Check a hex authorization produced by `prepare`
    pub fn verify(
        &self,
        contract: &str,
        nft_id: i64,
        buyer_address: &str,
        price_wei: u128,
        phase: PhaseKind,
        signature: &str,
    ) -> PipelineResult<bool> {
        let Ok(expected) = hex::decode(signature.trim_start_matches("0x")) else {
            return Ok(false);
        };
        let mut mac = self.mac()?;
        mac.update(self.message(contract, nft_id, buyer_address, price_wei, phase).as_bytes());
        Ok(mac.verify_slice(&expected).is_ok())
    }

    fn token_word(token_id: i64) -> PipelineResult<String> {
        if token_id < 0 {
            return Err(ValidationError::Mismatch {
                field: "token id",
                expected: "non-negative".to_string(),
                found: token_id.to_string(),
            }
            .into());
        }
        Ok(abi::encode_uint(token_id as u128))
    }
}

impl MintAuthorizer for CalldataAuthorizer {
    fn prepare(
        &self,
        collection: &Collection,
        collectible: &Collectible,
        buyer_address: &str,
        price: Decimal,
        phase: PhaseKind,
    ) -> PipelineResult<PreparedMint> {
        let price_wei = to_wei(price, self.native_decimals).ok_or_else(|| {
            ValidationError::Mismatch {
                field: "price",
                expected: "non-negative amount".to_string(),
                found: price.to_string(),
            }
        })?;

        let mut mac = self.mac()?;
        mac.update(
            self.message(
                &collection.contract_address,
                collectible.nft_id,
                buyer_address,
                price_wei,
                phase,
            )
            .as_bytes(),
        );
        let signature = format!("0x{}", hex::encode(mac.finalize().into_bytes()));

        Ok(PreparedMint {
            unsigned_tx: UnsignedTx {
                to: collection.contract_address.to_ascii_lowercase(),
                data: self.mint_calldata(buyer_address, collectible.nft_id)?,
                value_wei: price_wei,
                chain_id: self.chain_id,
                gas: None,
            },
            signature,
        })
    }

    fn mint_calldata(&self, recipient: &str, token_id: i64) -> PipelineResult<String> {
        Ok(abi::encode_call(
            &self.mint_selector,
            &[abi::encode_address(recipient)?, Self::token_word(token_id)?],
        ))
    }

    fn transfer_calldata(&self, from: &str, to: &str, token_id: i64) -> PipelineResult<String> {
        Ok(abi::encode_call(
            &self.transfer_selector,
            &[
                abi::encode_address(from)?,
                abi::encode_address(to)?,
                Self::token_word(token_id)?,
            ],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CollectibleStatus, MintingModel};
    use chrono::Utc;
    use uuid::Uuid;

    const BUYER: &str = "0x00000000000000000000000000000000000000b1";

    fn fixtures() -> (Collection, Collectible) {
        let collection = Collection {
            id: Uuid::new_v4(),
            name: "Genesis".to_string(),
            contract_address: "0x00000000000000000000000000000000000000C0".to_string(),
            minting_model: MintingModel::BuyerSigned,
            last_nft_id: 0,
            metadata_template: None,
        };
        let collectible = Collectible {
            id: Uuid::new_v4(),
            collection_id: collection.id,
            nft_id: 7,
            cid: None,
            status: CollectibleStatus::Pending,
            unique_idx: None,
            created_at: Utc::now(),
        };
        (collection, collectible)
    }

    fn authorizer() -> CalldataAuthorizer {
        CalldataAuthorizer::new(1, 18, "0x40c10f19", "0x23b872dd", "secret")
    }

    #[test]
    fn test_prepare_builds_payable_mint() {
        let (collection, collectible) = fixtures();
        let prepared = authorizer()
            .prepare(&collection, &collectible, BUYER, Decimal::new(1, 1), PhaseKind::Public)
            .unwrap();

        assert_eq!(prepared.unsigned_tx.value_wei, 100_000_000_000_000_000);
        assert_eq!(prepared.unsigned_tx.to, "0x00000000000000000000000000000000000000c0");
        let (selector, words) = abi::decode_call(&prepared.unsigned_tx.data).unwrap();
        assert_eq!(selector, "0x40c10f19");
        assert_eq!(abi::decode_address(&words[0]).unwrap(), BUYER);
        assert_eq!(abi::decode_uint(&words[1]).unwrap(), 7);
    }

    #[test]
    fn test_signature_binds_the_tuple() {
        let (collection, collectible) = fixtures();
        let auth = authorizer();
        let prepared = auth
            .prepare(&collection, &collectible, BUYER, Decimal::new(1, 1), PhaseKind::Public)
            .unwrap();
        let price_wei = prepared.unsigned_tx.value_wei;

        assert!(auth
            .verify(&collection.contract_address, 7, BUYER, price_wei, PhaseKind::Public, &prepared.signature)
            .unwrap());
        assert!(!auth
            .verify(&collection.contract_address, 7, BUYER, price_wei, PhaseKind::Whitelist, &prepared.signature)
            .unwrap());
        assert!(!auth
            .verify(&collection.contract_address, 8, BUYER, price_wei, PhaseKind::Public, &prepared.signature)
            .unwrap());
    }

    #[test]
    fn test_transfer_calldata() {
        let data = authorizer()
            .transfer_calldata("0x00000000000000000000000000000000000000aa", BUYER, 3)
            .unwrap();
        let (selector, words) = abi::decode_call(&data).unwrap();
        assert_eq!(selector, "0x23b872dd");
        assert_eq!(words.len(), 3);
        assert!(authorizer().mint_calldata(BUYER, -1).is_err());
    }
}
