//! Admin request payloads carried over the WebSocket channel.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::{
    dto::validation::validate_display_name,
    state::ledger::{AccountId, MAX_SCORE, MIN_SCORE},
};

/// Target of an admin action.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AccountTarget {
    #[validate(length(min = 1))]
    pub account_id: AccountId,
}

/// Add a signed amount to an account score.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ScoreDeltaRequest {
    #[validate(length(min = 1))]
    pub account_id: AccountId,
    #[validate(range(min = MIN_SCORE, max = MAX_SCORE))]
    pub delta: i64,
}

/// Overwrite an account score.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SetScoreRequest {
    #[validate(length(min = 1))]
    pub account_id: AccountId,
    #[validate(range(min = MIN_SCORE, max = MAX_SCORE))]
    pub value: i64,
}

/// Rename an account.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct RenameAccountRequest {
    #[validate(length(min = 1))]
    pub account_id: AccountId,
    #[validate(length(min = 1, max = 32), custom(function = "validate_display_name"))]
    pub new_name: String,
}

/// Replace an account credential.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct ChangeCredentialRequest {
    #[validate(length(min = 1))]
    pub account_id: AccountId,
    #[validate(length(min = 6))]
    pub new_credential: String,
}
