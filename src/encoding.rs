//! Request validation and ABI encoding.
//!
//! All caller input faults surface here, before the pipeline touches the
//! network.

use crate::error::EncodingError;
use crate::types::{CallIntent, EstimateRequest, ExecuteRequest};
use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::id;

/// The single-call account method every relayed operation targets.
const EXECUTE_SIGNATURE: &str = "execute(address,uint256,bytes)";

/// Strict address shape from the API contract: 0x followed by 40 hex chars.
pub fn parse_address(s: &str) -> Result<Address, EncodingError> {
    let invalid = || EncodingError::InvalidAddress(s.to_string());
    let digits = s.strip_prefix("0x").ok_or_else(invalid)?;
    if digits.len() != 40 {
        return Err(invalid());
    }
    let bytes = hex::decode(digits).map_err(|_| invalid())?;
    Ok(Address::from_slice(&bytes))
}

/// JSON-RPC "quantity" parsing. Bare hex is tolerated; empty means zero.
pub fn parse_quantity(s: &str) -> Result<U256, EncodingError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return Ok(U256::zero());
    }
    U256::from_str_radix(digits, 16).map_err(|_| EncodingError::InvalidQuantity(s.to_string()))
}

pub fn parse_bytes(s: &str) -> Result<Bytes, EncodingError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|_| EncodingError::InvalidBytes(s.to_string()))?;
    Ok(Bytes::from(bytes))
}

pub fn parse_h256(s: &str) -> Result<H256, EncodingError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    let bytes = hex::decode(digits).map_err(|_| EncodingError::InvalidHash(s.to_string()))?;
    if bytes.len() != 32 {
        return Err(EncodingError::InvalidHash(s.to_string()));
    }
    Ok(H256::from_slice(&bytes))
}

/// Format check only. The key is parsed into a signer at the signing stage
/// and never leaves the run that received it.
pub fn validate_private_key(s: &str) -> Result<(), EncodingError> {
    let digits = s.strip_prefix("0x").ok_or(EncodingError::InvalidPrivateKey)?;
    if digits.len() != 64 || hex::decode(digits).is_err() {
        return Err(EncodingError::InvalidPrivateKey);
    }
    Ok(())
}

pub fn validate_execute_request(req: &ExecuteRequest) -> Result<CallIntent, EncodingError> {
    validate_private_key(&req.private_key)?;
    Ok(CallIntent {
        sender: parse_address(&req.sender)?,
        target: parse_address(&req.target)?,
        value: parse_quantity(&req.value)?,
        data: parse_bytes(&req.data)?,
    })
}

pub fn validate_estimate_request(req: &EstimateRequest) -> Result<CallIntent, EncodingError> {
    Ok(CallIntent {
        sender: parse_address(&req.sender)?,
        target: parse_address(&req.target)?,
        value: parse_quantity(&req.value)?,
        data: parse_bytes(&req.data)?,
    })
}

/// ABI encoding of `execute(target, value, payload)`, the callData of every
/// relayed operation. Deterministic; total on typed inputs.
pub fn encode_execute_call(target: Address, value: U256, payload: &Bytes) -> Bytes {
    let mut out = id(EXECUTE_SIGNATURE).to_vec();
    out.extend(encode(&[
        Token::Address(target),
        Token::Uint(value),
        Token::Bytes(payload.to_vec()),
    ]));
    Bytes::from(out)
}
