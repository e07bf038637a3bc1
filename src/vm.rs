// Copyright 2019-2023 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

//! Types at the boundary to the actor execution engine.
//!
//! The engine itself is a black box behind [`Interpreter`]. Message-level
//! aborts are ordinary values: a [`Receipt`] carrying a non-zero
//! [`ExitCode`]. Only genuinely broken preconditions (missing state,
//! corrupted objects) surface as [`InterpreterError`].

use async_trait::async_trait;
use cid::Cid;
use fvm_ipld_encoding::tuple::*;
use num_bigint::BigInt;
use thiserror::Error;

use crate::blocks::FullTipset;

/// Value moved by messages and held in actor balances.
pub type TokenAmount = BigInt;

/// Exit status of a message execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ExitCode(pub u32);

impl ExitCode {
    pub const OK: ExitCode = ExitCode(0);
    /// Sender does not exist or cannot cover the message cost.
    pub const SYS_SENDER_INVALID: ExitCode = ExitCode(1);
    /// Message sequence did not match the sender actor.
    pub const SYS_SENDER_STATE_INVALID: ExitCode = ExitCode(2);
    /// Execution ran out of gas.
    pub const SYS_OUT_OF_GAS: ExitCode = ExitCode(7);
    /// The receiving actor aborted the call.
    pub const USR_ASSERTION_FAILED: ExitCode = ExitCode(24);

    pub fn is_success(self) -> bool {
        self.0 == 0
    }
}

/// Result of applying one message, stored per tipset under the receipts
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize_tuple, Deserialize_tuple)]
pub struct Receipt {
    pub exit_code: ExitCode,
    #[serde(with = "serde_bytes")]
    pub return_data: Vec<u8>,
    pub gas_used: i64,
}

impl Receipt {
    /// Receipt of a message that aborted with the given code.
    pub fn aborted(exit_code: ExitCode, gas_used: i64) -> Self {
        Self {
            exit_code,
            return_data: Vec::new(),
            gas_used,
        }
    }
}

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("state root {0} is not available in the store")]
    MissingState(Cid),
    #[error("message execution failed fatally: {0}")]
    Fatal(String),
}

/// The actor execution engine, invoked as a black box per tipset.
///
/// Implementations apply the canonically ordered messages of `ts` on top of
/// `parent_state_root` and return the resulting state root together with one
/// receipt per applied message.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn apply_tipset(
        &self,
        ts: &FullTipset,
        parent_state_root: &Cid,
    ) -> Result<(Cid, Vec<Receipt>), InterpreterError>;
}
