//! Game-signature classification for broadcast payloads.
//!
//! Purely cosmetic for routing purposes - it only feeds the QUERY response counters - so a
//! short or unrecognized payload simply classifies as `Unknown` rather than erroring.

/// Order matches the QUERY response's per-game counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GameTag {
    #[default]
    Unknown,
    Cnc95,
    Ra95,
    Ts,
    TsDta,
    Ra2,
}

impl GameTag {
    pub const ALL: [GameTag; 6] = [
        GameTag::Unknown,
        GameTag::Cnc95,
        GameTag::Ra95,
        GameTag::Ts,
        GameTag::TsDta,
        GameTag::Ra2,
    ];

    pub fn query_key(self) -> &'static str {
        match self {
            GameTag::Unknown => "unk",
            GameTag::Cnc95 => "cnc95",
            GameTag::Ra95 => "ra95",
            GameTag::Ts => "ts",
            GameTag::TsDta => "tsdta",
            GameTag::Ra2 => "ra2",
        }
    }
}

/// Classifies a broadcast payload by matching fixed byte patterns, first match wins.
/// Payloads too short for a given pattern simply fail that match and fall through.
pub fn classify(payload: &[u8]) -> GameTag {
    if payload.len() >= 2 && payload[0] == 0x34 && payload[1] == 0x12 {
        return GameTag::Cnc95;
    }
    if payload.len() >= 2 && payload[0] == 0x35 && payload[1] == 0x12 {
        return GameTag::Ra95;
    }
    if payload.len() >= 6 && payload[4] == 0x35 && payload[5] == 0x12 {
        return GameTag::Ts;
    }
    if payload.len() >= 6 && payload[4] == 0x35 && payload[5] == 0x13 {
        return GameTag::TsDta;
    }
    if payload.len() >= 6 && payload[4] == 0x36 && payload[5] == 0x12 {
        return GameTag::Ra2;
    }
    GameTag::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_each_signature() {
        assert_eq!(classify(&[0x34, 0x12]), GameTag::Cnc95);
        assert_eq!(classify(&[0x35, 0x12]), GameTag::Ra95);
        assert_eq!(classify(&[0, 0, 0, 0, 0x35, 0x12]), GameTag::Ts);
        assert_eq!(classify(&[0, 0, 0, 0, 0x35, 0x13]), GameTag::TsDta);
        assert_eq!(classify(&[0, 0, 0, 0, 0x36, 0x12]), GameTag::Ra2);
    }

    #[test]
    fn unrecognized_or_short_payload_is_unknown() {
        assert_eq!(classify(&[]), GameTag::Unknown);
        assert_eq!(classify(&[0x01]), GameTag::Unknown);
        assert_eq!(classify(&[0, 0, 0, 0, 0x99, 0x99]), GameTag::Unknown);
    }

    #[test]
    fn cnc95_pattern_checked_before_longer_patterns() {
        // First two bytes match cnc95 even though the buffer is long enough for the
        // offset-4 patterns too - first match wins.
        assert_eq!(classify(&[0x34, 0x12, 0, 0, 0x36, 0x12]), GameTag::Cnc95);
    }
}
