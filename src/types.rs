use ethers::abi::{encode, Token};
use ethers::types::{Address, Bytes, H256, U256};
use ethers::utils::keccak256;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Transaction class tag for fully sponsored operations.
///
/// The relay only handles class `0` (paymaster covers all gas). The marker
/// serializes as the literal `0` and refuses any other value on input, so a
/// different class cannot enter through any boundary. A missing tag on an
/// inbound draft defaults to `0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Type0;

impl Serialize for Type0 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(0)
    }
}

impl<'de> Deserialize<'de> for Type0 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Type0Visitor;

        impl<'de> Visitor<'de> for Type0Visitor {
            type Value = Type0;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("the literal 0")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Type0, E> {
                if v == 0 {
                    Ok(Type0)
                } else {
                    Err(E::custom(format!(
                        "unsupported transaction class {v}; only type 0 is relayed"
                    )))
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Type0, E> {
                if v == 0 {
                    Ok(Type0)
                } else {
                    Err(E::custom(format!(
                        "unsupported transaction class {v}; only type 0 is relayed"
                    )))
                }
            }
        }

        deserializer.deserialize_u64(Type0Visitor)
    }
}

/// ERC-4337 UserOperation (EntryPoint v0.6 layout) plus the relay's
/// sponsorship class tag.
///
/// Note: EntryPoint v0.7 uses a *different* packed struct layout.
///
/// Wire format follows the bundler JSON-RPC convention: camelCase keys,
/// quantities and byte strings as 0x-prefixed hex (the ethers serde impls
/// produce exactly that). The `type` member is nonstandard but expected by
/// the paymaster network this relay fronts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserOperation {
    pub sender: Address,
    pub nonce: U256,
    pub init_code: Bytes,
    pub call_data: Bytes,
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    pub max_fee_per_gas: U256,
    pub max_priority_fee_per_gas: U256,
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
    /// Sponsorship class; always `0`.
    #[serde(rename = "type", default)]
    pub class: Type0,
}

impl UserOperation {
    /// Fresh draft: empty initCode (existing accounts only), zero gas fields,
    /// no sponsorship, no signature. Every later field completion happens
    /// exactly once, in pipeline order.
    pub fn draft(sender: Address, call_data: Bytes) -> Self {
        Self {
            sender,
            nonce: U256::zero(),
            init_code: Bytes::default(),
            call_data,
            call_gas_limit: U256::zero(),
            verification_gas_limit: U256::zero(),
            pre_verification_gas: U256::zero(),
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
            paymaster_and_data: Bytes::default(),
            signature: Bytes::default(),
            class: Type0,
        }
    }

    /// A non-empty `paymasterAndData` is the sole signal that sponsorship was
    /// granted; the class is `0` by construction.
    pub fn is_gas_sponsored(&self) -> bool {
        !self.paymaster_and_data.is_empty()
    }

    /// Returns a tuple matching the Solidity struct layout, suitable for
    /// calling `EntryPoint.getUserOpHash((...))`.
    #[allow(clippy::type_complexity)]
    pub fn as_abi_tuple(
        &self,
    ) -> (
        Address,
        U256,
        Bytes,
        Bytes,
        U256,
        U256,
        U256,
        U256,
        U256,
        Bytes,
        Bytes,
    ) {
        (
            self.sender,
            self.nonce,
            self.init_code.clone(),
            self.call_data.clone(),
            self.call_gas_limit,
            self.verification_gas_limit,
            self.pre_verification_gas,
            self.max_fee_per_gas,
            self.max_priority_fee_per_gas,
            self.paymaster_and_data.clone(),
            self.signature.clone(),
        )
    }

    /// ABI encoding of the ten hashable fields, byte strings pre-hashed,
    /// signature excluded. This is the inner encoding of the EntryPoint v0.6
    /// `getUserOpHash` rule.
    pub fn packed_for_hash(&self) -> Bytes {
        let encoded = encode(&[
            Token::Address(self.sender),
            Token::Uint(self.nonce),
            Token::FixedBytes(keccak256(self.init_code.as_ref()).into()),
            Token::FixedBytes(keccak256(self.call_data.as_ref()).into()),
            Token::Uint(self.call_gas_limit),
            Token::Uint(self.verification_gas_limit),
            Token::Uint(self.pre_verification_gas),
            Token::Uint(self.max_fee_per_gas),
            Token::Uint(self.max_priority_fee_per_gas),
            Token::FixedBytes(keccak256(self.paymaster_and_data.as_ref()).into()),
        ]);

        Bytes::from(encoded)
    }

    /// Local recomputation of the EntryPoint v0.6 userOpHash:
    /// `keccak(abi.encode(keccak(packed), entryPoint, chainId))`.
    ///
    /// Best effort. The EntryPoint itself is authoritative; this only backs
    /// up the remote call and callers must be told when it was used.
    pub fn local_hash(&self, entry_point: Address, chain_id: u64) -> H256 {
        let packed_hash = keccak256(self.packed_for_hash().as_ref());
        let bound = encode(&[
            Token::FixedBytes(packed_hash.to_vec()),
            Token::Address(entry_point),
            Token::Uint(U256::from(chain_id)),
        ]);
        H256::from(keccak256(bound))
    }
}

/// The five gas/fee fields a bundler estimate covers.
///
/// The three gas limits are required on the wire; fee caps default to zero
/// when the bundler omits them (they start at zero in the draft anyway and a
/// paymaster override supersedes them).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub call_gas_limit: U256,
    pub verification_gas_limit: U256,
    pub pre_verification_gas: U256,
    #[serde(default)]
    pub max_fee_per_gas: U256,
    #[serde(default)]
    pub max_priority_fee_per_gas: U256,
}

impl GasEstimate {
    /// Fixed estimate substituted whenever the live one is unavailable.
    /// A sponsored operation is never blocked on estimator availability;
    /// the paymaster, not the user, bears the fee.
    pub fn fallback() -> Self {
        Self {
            call_gas_limit: U256::from(21_000u64),
            verification_gas_limit: U256::from(100_000u64),
            pre_verification_gas: U256::from(21_000u64),
            max_fee_per_gas: U256::zero(),
            max_priority_fee_per_gas: U256::zero(),
        }
    }
}

/// Gas estimation result with its provenance, so the degraded path stays
/// visible to callers and tests instead of hiding behind a catch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EstimateOutcome {
    /// Live values from the bundler.
    Estimated(GasEstimate),
    /// The fixed fallback, after an estimation failure.
    Defaulted(GasEstimate),
}

impl EstimateOutcome {
    pub fn values(&self) -> &GasEstimate {
        match self {
            EstimateOutcome::Estimated(e) | EstimateOutcome::Defaulted(e) => e,
        }
    }

    pub fn is_defaulted(&self) -> bool {
        matches!(self, EstimateOutcome::Defaulted(_))
    }

    pub fn source(&self) -> &'static str {
        match self {
            EstimateOutcome::Estimated(_) => "estimated",
            EstimateOutcome::Defaulted(_) => "defaulted",
        }
    }
}

/// Operation hash with its provenance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpHash {
    /// Canonical hash from the EntryPoint contract.
    Hashed(H256),
    /// Locally recomputed after the EntryPoint call failed.
    HashedLocally(H256),
}

impl OpHash {
    pub fn value(&self) -> H256 {
        match self {
            OpHash::Hashed(h) | OpHash::HashedLocally(h) => *h,
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, OpHash::HashedLocally(_))
    }

    pub fn source(&self) -> &'static str {
        match self {
            OpHash::Hashed(_) => "entryPoint",
            OpHash::HashedLocally(_) => "local",
        }
    }
}

/// Per-request sponsorship context sent as the third `pm_sponsor_userop`
/// param. Built fresh for each call, never stored.
#[derive(Clone, Serialize)]
pub struct SponsorshipContext {
    /// Sponsorship class; always `0`.
    #[serde(rename = "type")]
    pub class: Type0,
    /// Paymaster api key. Omitted from the payload when unset.
    #[serde(rename = "apikey", skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl SponsorshipContext {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            class: Type0,
            api_key,
        }
    }
}

impl fmt::Debug for SponsorshipContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SponsorshipContext")
            .field("class", &0u64)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Paymaster response to `pm_sponsor_userop`. Fee caps, when present, are
/// authoritative and replace the estimator's values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SponsorshipData {
    pub paymaster_and_data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_fee_per_gas: Option<U256>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee_per_gas: Option<U256>,
}

/// Full-execute request as received on the wire. Field-level validation
/// happens before any network call; see `encoding`.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub sender: String,
    pub target: String,
    #[serde(default = "default_value")]
    pub value: String,
    #[serde(default = "default_data")]
    pub data: String,
    pub private_key: String,
}

// Key material must never reach logs, so Debug is hand-written.
impl fmt::Debug for ExecuteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecuteRequest")
            .field("sender", &self.sender)
            .field("target", &self.target)
            .field("value", &self.value)
            .field("data", &self.data)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Estimate-only request. Extra members (the original clients also sent a
/// `privateKey` here) are ignored; estimation never needs key material.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateRequest {
    pub sender: String,
    pub target: String,
    #[serde(default = "default_value")]
    pub value: String,
    #[serde(default = "default_data")]
    pub data: String,
}

fn default_value() -> String {
    "0x0".to_string()
}

fn default_data() -> String {
    "0x".to_string()
}

/// Validated, typed form of a request's call intent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallIntent {
    pub sender: Address,
    pub target: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Draft taken through the estimation stage and no further.
#[derive(Clone, Debug)]
pub struct EstimatedDraft {
    pub operation: UserOperation,
    pub estimate: EstimateOutcome,
}

/// Successful run result: the submitted operation's identifiers, the raw
/// bundler receipt, and the provenance of the degradable stages.
#[derive(Clone, Debug)]
pub struct GaslessReceipt {
    pub user_op_hash: H256,
    pub transaction_hash: H256,
    pub receipt: Value,
    pub estimate: EstimateOutcome,
    pub op_hash: OpHash,
}

impl GaslessReceipt {
    pub fn estimate_defaulted(&self) -> bool {
        self.estimate.is_defaulted()
    }

    pub fn hash_fallback_used(&self) -> bool {
        self.op_hash.is_local()
    }
}

/// Best-effort event published when a run reaches a terminal state.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionBroadcast {
    /// Sponsorship class; always `0`.
    #[serde(rename = "type")]
    pub class: Type0,
    pub sender: Address,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<H256>,
    pub gas_sponsored: bool,
    pub timestamp: u64,
}

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0))
        .as_secs()
}
