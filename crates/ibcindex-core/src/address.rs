//! Address normalization.
//!
//! The same account shows up as `osmo1…`, `union1…` or `0x…` depending on
//! which chain emitted the event. Statistics group by a canonical form: the
//! raw address bytes as lowercase hex without a prefix.

/// Normalize an address to lowercase hex of its payload bytes.
///
/// - bech32 (`cosmos1…`, `union1…`): decoded payload bytes.
/// - `0x`-prefixed hex: lowercased, prefix stripped.
/// - anything else: lowercased as-is, so unknown formats still group
///   consistently.
pub fn normalize_address(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(hex_part) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return hex_part.to_ascii_lowercase();
    }
    match bech32::decode(trimmed) {
        Ok((_hrp, data)) => hex::encode(data),
        Err(_) => trimmed.to_ascii_lowercase(),
    }
}

/// The human-readable part of a bech32 address, if `raw` is one.
pub fn bech32_prefix(raw: &str) -> Option<String> {
    bech32::decode(raw.trim())
        .ok()
        .map(|(hrp, _)| hrp.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bech32::{Bech32, Hrp};

    #[test]
    fn bech32_and_hex_agree() {
        let bytes = [0xab_u8; 20];
        let osmo = bech32::encode::<Bech32>(Hrp::parse("osmo").unwrap(), &bytes).unwrap();
        let union = bech32::encode::<Bech32>(Hrp::parse("union").unwrap(), &bytes).unwrap();
        let evm = format!("0x{}", hex::encode_upper(bytes));

        assert_eq!(normalize_address(&osmo), hex::encode(bytes));
        assert_eq!(normalize_address(&osmo), normalize_address(&union));
        assert_eq!(normalize_address(&osmo), normalize_address(&evm));
        assert_eq!(bech32_prefix(&union).as_deref(), Some("union"));
    }

    #[test]
    fn unknown_format_is_lowercased() {
        assert_eq!(normalize_address(" NotAnAddress "), "notanaddress");
        assert_eq!(bech32_prefix("0xabc"), None);
    }
}
