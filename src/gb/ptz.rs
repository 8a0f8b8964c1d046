//! PTZ command frames, GB/T 28181-2016 appendix A.3.
//!
//! A frame is 8 bytes sent as ASCII hex: `A5 0F 01 cmd hSpeed vSpeed
//! (zSpeed<<4) checksum`, checksum being the low byte of the sum of the
//! first seven.

pub const PTZ_CMD_STOP: u8 = 0x00;
pub const PTZ_CMD_RIGHT: u8 = 0x01;
pub const PTZ_CMD_LEFT: u8 = 0x02;
pub const PTZ_CMD_DOWN: u8 = 0x04;
pub const PTZ_CMD_UP: u8 = 0x08;
pub const PTZ_CMD_ZOOM_IN: u8 = 0x10;
pub const PTZ_CMD_ZOOM_OUT: u8 = 0x20;
// diagonals are OR combinations of the axis bits
pub const PTZ_CMD_LEFT_UP: u8 = 0x0A;
pub const PTZ_CMD_LEFT_DOWN: u8 = 0x06;
pub const PTZ_CMD_RIGHT_UP: u8 = 0x09;
pub const PTZ_CMD_RIGHT_DOWN: u8 = 0x05;

pub const PTZ_CMD_IRIS_IN: u8 = 0x44;
pub const PTZ_CMD_IRIS_OUT: u8 = 0x48;
pub const PTZ_CMD_FOCUS_IN: u8 = 0x41;
pub const PTZ_CMD_FOCUS_OUT: u8 = 0x42;

pub const PTZ_CMD_PRESET_SET: u8 = 0x81;
pub const PTZ_CMD_PRESET_CALL: u8 = 0x82;
pub const PTZ_CMD_PRESET_DELETE: u8 = 0x83;

const FRAME_HEAD: [u8; 3] = [0xA5, 0x0F, 0x01];
const DEFAULT_SPEED: u8 = 50;

fn clamp_speed(speed: u8) -> u8 {
    if speed == 0 {
        DEFAULT_SPEED
    } else {
        speed
    }
}

/// Build a movement/zoom frame. Zero speeds fall back to the default of 50;
/// the zoom nibble keeps only its low four bits.
pub fn build_ptz_cmd(cmd: u8, h_speed: u8, v_speed: u8, z_speed: u8) -> String {
    let b4 = cmd;
    let b5 = clamp_speed(h_speed);
    let b6 = clamp_speed(v_speed);
    let b7 = (z_speed & 0x0F) << 4;
    let b8 = checksum(b4, b5, b6, b7);
    format!("A50F01{:02X}{:02X}{:02X}{:02X}{:02X}", b4, b5, b6, b7, b8)
}

/// Preset set/call/delete frame; the preset index rides in the vertical
/// speed byte.
pub fn build_preset_cmd(cmd: u8, preset_index: u8) -> String {
    let b8 = checksum(cmd, 0, preset_index, 0);
    format!("A50F01{:02X}00{:02X}00{:02X}", cmd, preset_index, b8)
}

fn checksum(b4: u8, b5: u8, b6: u8, b7: u8) -> u8 {
    FRAME_HEAD
        .iter()
        .fold(0u16, |acc, b| acc + *b as u16)
        .wrapping_add(b4 as u16)
        .wrapping_add(b5 as u16)
        .wrapping_add(b6 as u16)
        .wrapping_add(b7 as u16) as u8
}

impl super::server::GbServer {
    /// Ship a PTZ frame to a channel inside a DeviceControl MESSAGE. The
    /// frame string comes from `build_ptz_cmd` or `build_preset_cmd`.
    pub async fn ptz_control(
        &self,
        device_id: &str,
        channel_id: &str,
        ptz_cmd: &str,
    ) -> Result<(), crate::Error> {
        let channel = self
            .registry
            .get_channel(device_id, channel_id)
            .ok_or_else(|| {
                crate::Error::ChannelNotExist(format!("{}:{}", device_id, channel_id))
            })?;
        let entry = self
            .registry
            .load(device_id)
            .ok_or_else(|| crate::Error::DeviceNotExist(device_id.to_string()))?;

        let body = super::xml::DeviceControl::new(
            crate::transaction::random_sn(),
            &channel.channel_id,
            ptz_cmd,
        )
        .to_xml()?;
        self.message_request_no_wait(&channel.channel_id, &entry, body)
            .await
    }
}
