use crate::jsonrpc::RpcError;
use ethers::types::H256;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Pipeline states, in transition order. Linear, no retries; `Failed` is
/// reached from whichever state's entry action errored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Drafted,
    NonceSet,
    GasEstimated,
    Sponsored,
    Hashed,
    Signed,
    Submitted,
    Confirmed,
}

/// Caller input faults, raised before any network call.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid address {0:?} (want 0x followed by 40 hex chars)")]
    InvalidAddress(String),
    #[error("invalid quantity {0:?} (want 0x-prefixed hex)")]
    InvalidQuantity(String),
    #[error("invalid hex payload {0:?}")]
    InvalidBytes(String),
    // Never echo the offending value here; it may be a mistyped real key.
    #[error("invalid private key format (want 0x followed by 64 hex chars)")]
    InvalidPrivateKey,
    #[error("invalid hash {0:?} (want 0x followed by 64 hex chars)")]
    InvalidHash(String),
}

/// Why sponsorship was not granted. All of these halt the run; an
/// unsponsored operation must never go out.
#[derive(Debug, Error)]
pub enum SponsorError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("paymaster returned empty paymasterAndData")]
    EmptySponsorship,
    #[error("malformed paymaster response: {0}")]
    Malformed(String),
}

/// Fatal pipeline failures. Estimation degradation and local-hash fallback
/// are not here: those continue the run and surface as outcome branches.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("request rejected: {0}")]
    Encoding(#[from] EncodingError),
    #[error("nonce fetch failed: {0}")]
    NonceFetch(#[source] RpcError),
    #[error("sponsorship denied: {0}")]
    SponsorshipDenied(#[source] SponsorError),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("submission rejected: {0}")]
    Submission(#[source] RpcError),
    #[error("operation {user_op_hash} submitted but unconfirmed after {waited:?}")]
    ReceiptTimeout { user_op_hash: H256, waited: Duration },
}

impl PipelineError {
    /// The state whose entry action failed.
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Encoding(_) => Stage::Drafted,
            PipelineError::NonceFetch(_) => Stage::NonceSet,
            PipelineError::SponsorshipDenied(_) => Stage::Sponsored,
            PipelineError::Signing(_) => Stage::Signed,
            PipelineError::Submission(_) => Stage::Submitted,
            PipelineError::ReceiptTimeout { .. } => Stage::Confirmed,
        }
    }
}
