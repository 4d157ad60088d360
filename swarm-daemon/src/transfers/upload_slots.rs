//! Upload slot count for a transfer

/// Slots used when the upload rate is unlimited
pub const UNLIMITED_RATE_SLOTS: usize = 7;

/// Number of peers a transfer uploads to at once
///
/// An explicit `max_uploads` wins. Otherwise the count grows with the square
/// root of the upload rate in KiB/s, with fixed steps at low rates.
pub fn auto_upload_slots(max_uploads: usize, max_upload_rate_kib: u64) -> usize {
    if max_uploads > 0 {
        return max_uploads;
    }
    match max_upload_rate_kib {
        0 => UNLIMITED_RATE_SLOTS,
        1..=8 => 2,
        9..=14 => 3,
        15..=41 => 4,
        rate => (rate as f64 * 0.6).sqrt() as usize,
    }
}
