use chrono::Utc;

/// Generates `run-<unix seconds>-<8 hex chars>`; falls back to the
/// nanosecond clock when the OS entropy source is unavailable.
pub fn generate_run_id() -> String {
    let now = Utc::now();
    let mut bytes = [0u8; 4];
    let suffix = match getrandom::getrandom(&mut bytes) {
        Ok(()) => u32::from_be_bytes(bytes),
        Err(_) => now.timestamp_subsec_nanos(),
    };
    format!("run-{}-{suffix:08x}", now.timestamp())
}
