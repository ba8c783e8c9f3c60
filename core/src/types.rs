//! Shared primitive types used across the entire pipeline.

/// A unique transaction identifier (UUID v4 text form).
pub type TxnId = String;

/// A stable user identifier, `user_NNNN`.
pub type UserId = String;

/// A merchant identifier, `merchant_NNNN`.
pub type MerchantId = String;

/// A fraud alert identifier.
pub type AlertId = String;
