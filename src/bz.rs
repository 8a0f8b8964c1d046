//! Internal id namespace.
//!
//! Every row the gateway creates carries an opaque id whose two-letter
//! prefix names the owning subsystem. Relay webhooks arrive with nothing
//! but a stream id, so the prefix is also how callbacks are routed back to
//! the protocol that owns the stream.

/// GB28181 device.
pub const ID_PREFIX_GB: &str = "gb";
/// GB28181 channel.
pub const ID_PREFIX_GB_CHANNEL: &str = "ch";
/// ONVIF device.
pub const ID_PREFIX_ONVIF: &str = "on";
/// ONVIF channel (one per media profile).
pub const ID_PREFIX_ONVIF_CHANNEL: &str = "pr";
/// RTMP push stream.
pub const ID_PREFIX_RTMP: &str = "mp";
/// RTSP pull proxy.
pub const ID_PREFIX_RTSP: &str = "sp";

pub fn is_gb28181(stream: &str) -> bool {
    stream.starts_with(ID_PREFIX_GB) || stream.starts_with(ID_PREFIX_GB_CHANNEL)
}

pub fn is_onvif(stream: &str) -> bool {
    stream.starts_with(ID_PREFIX_ONVIF) || stream.starts_with(ID_PREFIX_ONVIF_CHANNEL)
}

pub fn is_rtmp(stream: &str) -> bool {
    stream.starts_with(ID_PREFIX_RTMP)
}

pub fn is_rtsp(stream: &str) -> bool {
    stream.starts_with(ID_PREFIX_RTSP)
}

/// Mint a prefixed internal id, e.g. `unique_id("ch")` -> `chX7f2…`.
pub fn unique_id(prefix: &str) -> String {
    format!("{}{}", prefix, crate::transaction::random_text(14))
}
