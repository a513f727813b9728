//! Error-message classification for the maintenance run-abort conditions
//! (spec.md §4.2 step 11, §7 "Insufficient-funds family").

/// Substring match against ledger/chain error text — these errors don't
/// carry a typed variant upstream, only a preserved message (spec.md §9
/// "keep the string heuristic").
pub fn is_insufficient_funds(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["insufficient", "not enough", "no utxos", "balance"]
        .iter()
        .any(|needle| lower.contains(needle))
}

/// Extracts a `txid:vout`-shaped substring from an error message, if present,
/// for the "recurrent identical stale-UTXO failure" run-abort check.
pub fn extract_outpoint(message: &str) -> Option<String> {
    for token in message.split(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        let token = token.trim_matches(|c: char| !c.is_alphanumeric() && c != ':');
        if let Some((txid, vout)) = token.split_once(':') {
            if txid.len() >= 16 && txid.chars().all(|c| c.is_ascii_hexdigit()) && vout.parse::<u32>().is_ok() {
                return Some(token.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_insufficient_funds_family() {
        assert!(is_insufficient_funds("Insufficient funds for fee"));
        assert!(is_insufficient_funds("not enough BTC"));
        assert!(is_insufficient_funds("no UTXOs available"));
        assert!(!is_insufficient_funds("invalid signature"));
    }

    #[test]
    fn extracts_outpoint_from_error_text() {
        let msg = "UTXO 1a2b3c4d5e6f7081a2b3c4d5e6f7081:0 already spent";
        assert_eq!(extract_outpoint(msg), Some("1a2b3c4d5e6f7081a2b3c4d5e6f7081:0".to_string()));
    }

    #[test]
    fn returns_none_without_an_outpoint_shape() {
        assert_eq!(extract_outpoint("compose rejected"), None);
    }
}
