//! Mint work messages carried by the durable queue

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::types::normalize_address;
use crate::core::{MintingModel, ValidationError};

/// Mint request shared by every operation kind
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MintRequest {
    /// Idempotency key
    pub message_id: Uuid,
    pub order_id: Uuid,
    pub buyer_id: Uuid,
    /// Wallet that ends up owning the token
    pub buyer_address: String,
    pub launch_id: Uuid,
    pub collection_id: Uuid,
    pub launch_item_id: Uuid,
    pub collectible_id: Uuid,
    pub nft_id: i64,
    pub contract_address: String,
    pub price: Decimal,
}

/// Queue payload, tagged by the collection's minting operation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum WorkMessage {
    /// Backend mints straight to the buyer
    DirectMint(MintRequest),
    /// Backend mints to custody, then transfers to the buyer
    CustodialMint(MintRequest),
}

impl WorkMessage {
    /// Build the message variant matching a collection's minting model
    pub fn for_model(model: MintingModel, request: MintRequest) -> Option<Self> {
        match model {
            MintingModel::BackendDirect => Some(WorkMessage::DirectMint(request)),
            MintingModel::BackendCustodial => Some(WorkMessage::CustodialMint(request)),
            MintingModel::BuyerSigned => None,
        }
    }

    /// Parse and validate a raw queue body before any business logic runs
    pub fn parse(body: &str) -> Result<Self, ValidationError> {
        let mut message: WorkMessage = serde_json::from_str(body)
            .map_err(|e| ValidationError::MalformedMessage(e.to_string()))?;

        let request = message.request_mut();
        request.buyer_address = normalize_address(&request.buyer_address)?;
        request.contract_address = normalize_address(&request.contract_address)?;

        if request.nft_id < 0 {
            return Err(ValidationError::MalformedMessage(format!(
                "negative nft id {}",
                request.nft_id
            )));
        }
        if request.price.is_sign_negative() {
            return Err(ValidationError::MalformedMessage(format!(
                "negative price {}",
                request.price
            )));
        }

        Ok(message)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn request(&self) -> &MintRequest {
        match self {
            WorkMessage::DirectMint(request) | WorkMessage::CustodialMint(request) => request,
        }
    }

    fn request_mut(&mut self) -> &mut MintRequest {
        match self {
            WorkMessage::DirectMint(request) | WorkMessage::CustodialMint(request) => request,
        }
    }

    pub fn message_id(&self) -> Uuid {
        self.request().message_id
    }

    pub fn is_custodial(&self) -> bool {
        matches!(self, WorkMessage::CustodialMint(_))
    }

    pub fn operation(&self) -> &'static str {
        match self {
            WorkMessage::DirectMint(_) => "direct_mint",
            WorkMessage::CustodialMint(_) => "custodial_mint",
        }
    }
}

/// Best-effort extraction of the idempotency key from an unparseable body
pub fn peek_message_id(body: &str) -> Option<Uuid> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("message_id")?.as_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> MintRequest {
        MintRequest {
            message_id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            buyer_address: "0xAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string(),
            launch_id: Uuid::new_v4(),
            collection_id: Uuid::new_v4(),
            launch_item_id: Uuid::new_v4(),
            collectible_id: Uuid::new_v4(),
            nft_id: 42,
            contract_address: "0x00000000000000000000000000000000000000c0".to_string(),
            price: Decimal::new(1, 1),
        }
    }

    #[test]
    fn test_tagged_payload_shape() {
        let message = WorkMessage::CustodialMint(request());
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["operation"], "custodial_mint");
        assert_eq!(json["nft_id"], 42);
    }

    #[test]
    fn test_parse_normalizes_addresses() {
        let body = WorkMessage::DirectMint(request()).to_json().unwrap();
        let parsed = WorkMessage::parse(&body).unwrap();
        assert_eq!(
            parsed.request().buyer_address,
            "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"
        );
    }

    #[test]
    fn test_parse_rejects_bad_payloads() {
        assert!(matches!(
            WorkMessage::parse(r#"{"operation":"burn"}"#),
            Err(ValidationError::MalformedMessage(_))
        ));

        let mut bad = request();
        bad.buyer_address = "not-an-address".to_string();
        let body = WorkMessage::DirectMint(bad).to_json().unwrap();
        assert!(matches!(
            WorkMessage::parse(&body),
            Err(ValidationError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_peek_message_id() {
        let req = request();
        let id = req.message_id;
        let body = WorkMessage::DirectMint(req).to_json().unwrap();
        assert_eq!(peek_message_id(&body), Some(id));
        assert_eq!(peek_message_id("garbage"), None);
    }
}
