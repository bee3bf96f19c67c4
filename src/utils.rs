//! Utility functions for the bt-bridge crate.

/// Format the start of a byte buffer as hex for log output.
///
/// At most `max` bytes are rendered; the remainder is summarized.
///
/// # Example
///
/// ```
/// use bt_bridge::utils::hex_preview;
///
/// assert_eq!(hex_preview(&[0x01, 0xAB], 4), "01 AB");
/// assert_eq!(hex_preview(&[0x01, 0xAB, 0xFF], 2), "01 AB ..(1 more)");
/// ```
pub fn hex_preview(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = data[..shown]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");

    if data.len() > shown {
        out.push_str(&format!(" ..({} more)", data.len() - shown));
    }

    out
}
