use crate::error::ConversionError;

const UNITS: [(&str, u64); 4] = [("T", 1 << 40), ("G", 1 << 30), ("M", 1 << 20), ("K", 1 << 10)];

/// Parses a byte-suffixed size such as `20GB`, `500mb`, `4K` or a bare `1024`.
///
/// Suffixes are binary multiples and case-insensitive; the trailing `B` is optional.
pub fn parse_size(input: &str) -> Result<u64, ConversionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(ConversionError::InvalidSize(input.to_string()));
    }

    let upper = trimmed.to_uppercase();
    let without_b = upper.strip_suffix('B').unwrap_or(&upper);

    let (number, multiplier) = UNITS
        .iter()
        .find_map(|(suffix, multiplier)| without_b.strip_suffix(suffix).map(|n| (n, *multiplier)))
        .unwrap_or((without_b, 1));

    let value: u64 = number.trim().parse().map_err(|_| ConversionError::InvalidSize(input.to_string()))?;

    value.checked_mul(multiplier).ok_or_else(|| ConversionError::InvalidSize(input.to_string()))
}
