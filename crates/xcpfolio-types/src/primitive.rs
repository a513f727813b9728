//! Small newtypes around the bare strings/hex the ledger and chain APIs deal
//! in. Keeping these distinct from `String` means a buyer address can never
//! be silently swapped for an asset name at a call site.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A Bitcoin address, base58 or bech32, exactly as returned by the ledger or
/// chain API. We never decode it ourselves outside the signer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BtcAddress(pub String);

impl fmt::Display for BtcAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for BtcAddress {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for BtcAddress {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A Counterparty asset's short name, e.g. `"MYASSET"` (no `XCPFOLIO.` prefix).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AssetName(pub String);

impl AssetName {
    /// The `XCPFOLIO.<asset>` long name under which the sell order is listed.
    pub fn xcpfolio_long_name(&self) -> String {
        format!("{XCPFOLIO_PREFIX}{}", self.0)
    }

    /// Strips the `XCPFOLIO.` prefix from a give-asset long name, returning
    /// `None` if the long name does not carry it.
    pub fn from_xcpfolio_long_name(long_name: &str) -> Option<Self> {
        long_name
            .strip_prefix(XCPFOLIO_PREFIX)
            .map(|short| Self(short.to_string()))
    }
}

impl fmt::Display for AssetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The namespace every asset this bot handles is listed under.
pub const XCPFOLIO_PREFIX: &str = "XCPFOLIO.";

/// A DEX order transaction hash. Primary key for [`crate::order::Order`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderHash(pub String);

impl fmt::Display for OrderHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for OrderHash {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A Bitcoin transaction id, hex-encoded, big-endian (display order).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TxId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_name_round_trip() {
        let asset = AssetName("RAREPEPE".to_string());
        let long = asset.xcpfolio_long_name();
        assert_eq!(long, "XCPFOLIO.RAREPEPE");
        assert_eq!(AssetName::from_xcpfolio_long_name(&long), Some(asset));
    }

    #[test]
    fn rejects_non_xcpfolio_long_names() {
        assert_eq!(AssetName::from_xcpfolio_long_name("SOMEASSET"), None);
    }
}
