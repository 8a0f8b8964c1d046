//! MANSCDP+xml bodies carried in MESSAGE requests.
//!
//! Devices answer queries with `Response` documents and push state with
//! `Notify`; the gateway sends `Query` and `Control`. The closed CmdType
//! set is: Keepalive, Catalog, DeviceInfo, RecordInfo, Alarm,
//! DeviceControl.

use crate::Result;
use quick_xml::de::from_str;
use quick_xml::events::Event;
use serde::{Deserialize, Serialize};

pub const CMD_KEEPALIVE: &str = "Keepalive";
pub const CMD_CATALOG: &str = "Catalog";
pub const CMD_DEVICE_INFO: &str = "DeviceInfo";
pub const CMD_RECORD_INFO: &str = "RecordInfo";
pub const CMD_ALARM: &str = "Alarm";
pub const CMD_DEVICE_CONTROL: &str = "DeviceControl";

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"GB2312\"?>\n";

/// Minimal probe parsed from any MANSCDP body before dispatch.
#[derive(Debug, Deserialize)]
pub struct CmdHead {
    #[serde(rename = "CmdType", default)]
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
}

pub fn parse_head(xml: &str) -> Result<CmdHead> {
    from_str(xml.trim()).map_err(|e| crate::Error::Xml(e.to_string()))
}

/// Name of the document element: Notify, Response, Query or Control.
pub fn root_tag(xml: &str) -> Option<String> {
    let mut reader = quick_xml::Reader::from_str(xml.trim());
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                return String::from_utf8(e.name().as_ref().to_vec()).ok();
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }
}

#[derive(Debug, Deserialize)]
pub struct KeepaliveNotify {
    #[serde(rename = "CmdType", default)]
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl KeepaliveNotify {
    /// Devices report OK or ON when healthy.
    pub fn is_ok(&self) -> bool {
        self.status == "OK" || self.status == "ON"
    }
}

#[derive(Debug, Deserialize)]
pub struct CatalogResponse {
    #[serde(rename = "CmdType", default)]
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "SumNum", default)]
    pub sum_num: usize,
    #[serde(rename = "DeviceList", default)]
    pub device_list: Option<DeviceList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceList {
    #[serde(rename = "@Num", default)]
    pub num: Option<usize>,
    #[serde(rename = "Item", default)]
    pub items: Vec<CatalogItem>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct CatalogItem {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Manufacturer", default)]
    pub manufacturer: String,
    #[serde(rename = "Model", default)]
    pub model: String,
    #[serde(rename = "Owner", default)]
    pub owner: String,
    #[serde(rename = "CivilCode", default)]
    pub civil_code: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Parental", default)]
    pub parental: u8,
    #[serde(rename = "ParentID", default)]
    pub parent_id: String,
    #[serde(rename = "Secrecy", default)]
    pub secrecy: u8,
    #[serde(rename = "Status", default)]
    pub status: String,
}

impl CatalogItem {
    pub fn is_on(&self) -> bool {
        self.status == "ON" || self.status == "OK"
    }
}

#[derive(Debug, Deserialize)]
pub struct DeviceInfoResponse {
    #[serde(rename = "CmdType", default)]
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "DeviceName", default)]
    pub device_name: String,
    #[serde(rename = "Manufacturer", default)]
    pub manufacturer: String,
    #[serde(rename = "Model", default)]
    pub model: String,
    #[serde(rename = "Firmware", default)]
    pub firmware: String,
    #[serde(rename = "Result", default)]
    pub result: String,
}

#[derive(Debug, Deserialize)]
pub struct RecordInfoResponse {
    #[serde(rename = "CmdType", default)]
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "SumNum", default)]
    pub sum_num: usize,
    #[serde(rename = "RecordList", default)]
    pub record_list: Option<RecordList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RecordList {
    #[serde(rename = "@Num", default)]
    pub num: Option<usize>,
    #[serde(rename = "Item", default)]
    pub items: Vec<RecordItem>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RecordItem {
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "FilePath", default)]
    pub file_path: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "StartTime", default)]
    pub start_time: String,
    #[serde(rename = "EndTime", default)]
    pub end_time: String,
    #[serde(rename = "Secrecy", default)]
    pub secrecy: u8,
    #[serde(rename = "Type", default)]
    pub r#type: String,
}

/// Device-initiated alarm report (`<Notify>` with CmdType Alarm).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AlarmNotify {
    #[serde(rename = "CmdType", default)]
    pub cmd_type: String,
    #[serde(rename = "SN", default)]
    pub sn: u32,
    #[serde(rename = "DeviceID", default)]
    pub device_id: String,
    #[serde(rename = "AlarmPriority", default)]
    pub alarm_priority: String,
    #[serde(rename = "AlarmMethod", default)]
    pub alarm_method: String,
    #[serde(rename = "AlarmTime", default)]
    pub alarm_time: String,
    #[serde(rename = "AlarmDescription", default)]
    pub alarm_description: String,
    #[serde(rename = "Longitude", default)]
    pub longitude: f64,
    #[serde(rename = "Latitude", default)]
    pub latitude: f64,
    #[serde(rename = "Info", default)]
    pub info: Option<AlarmInfo>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AlarmInfo {
    #[serde(rename = "AlarmType", default)]
    pub alarm_type: String,
}

// ---- outbound bodies ----

#[derive(Debug, Serialize)]
pub struct CatalogQuery {
    #[serde(rename = "CmdType")]
    pub cmd_type: &'static str,
    #[serde(rename = "SN")]
    pub sn: u32,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

impl CatalogQuery {
    pub fn new(sn: u32, device_id: &str) -> Self {
        Self {
            cmd_type: CMD_CATALOG,
            sn,
            device_id: device_id.to_string(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        serialize_root("Query", self)
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceInfoQuery {
    #[serde(rename = "CmdType")]
    pub cmd_type: &'static str,
    #[serde(rename = "SN")]
    pub sn: u32,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

impl DeviceInfoQuery {
    pub fn new(sn: u32, device_id: &str) -> Self {
        Self {
            cmd_type: CMD_DEVICE_INFO,
            sn,
            device_id: device_id.to_string(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        serialize_root("Query", self)
    }
}

#[derive(Debug, Serialize)]
pub struct RecordInfoQuery {
    #[serde(rename = "CmdType")]
    pub cmd_type: &'static str,
    #[serde(rename = "SN")]
    pub sn: u32,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "StartTime")]
    pub start_time: String,
    #[serde(rename = "EndTime")]
    pub end_time: String,
    #[serde(rename = "Secrecy")]
    pub secrecy: u8,
    #[serde(rename = "Type")]
    pub r#type: String,
}

impl RecordInfoQuery {
    pub fn new(sn: u32, device_id: &str, start: i64, end: i64) -> Self {
        Self {
            cmd_type: CMD_RECORD_INFO,
            sn,
            device_id: device_id.to_string(),
            start_time: format_gb_time(start),
            end_time: format_gb_time(end),
            secrecy: 0,
            r#type: "all".to_string(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        serialize_root("Query", self)
    }
}

#[derive(Debug, Serialize)]
pub struct AlarmQuery {
    #[serde(rename = "CmdType")]
    pub cmd_type: &'static str,
    #[serde(rename = "SN")]
    pub sn: u32,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
}

impl AlarmQuery {
    pub fn new(sn: u32, device_id: &str) -> Self {
        Self {
            cmd_type: CMD_ALARM,
            sn,
            device_id: device_id.to_string(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        serialize_root("Query", self)
    }
}

#[derive(Debug, Serialize)]
pub struct DeviceControl {
    #[serde(rename = "CmdType")]
    pub cmd_type: &'static str,
    #[serde(rename = "SN")]
    pub sn: u32,
    #[serde(rename = "DeviceID")]
    pub device_id: String,
    #[serde(rename = "PTZCmd")]
    pub ptz_cmd: String,
}

impl DeviceControl {
    pub fn new(sn: u32, device_id: &str, ptz_cmd: &str) -> Self {
        Self {
            cmd_type: CMD_DEVICE_CONTROL,
            sn,
            device_id: device_id.to_string(),
            ptz_cmd: ptz_cmd.to_string(),
        }
    }

    pub fn to_xml(&self) -> Result<String> {
        serialize_root("Control", self)
    }
}

fn serialize_root<T: Serialize>(root: &str, value: &T) -> Result<String> {
    let body = quick_xml::se::to_string_with_root(root, value)
        .map_err(|e| crate::Error::Xml(e.to_string()))?;
    Ok(format!("{}{}", XML_DECL, body))
}

/// GB28181 time literal, e.g. `2023-11-14T20:13:20`.
pub fn format_gb_time(unix: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(unix, 0)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%S").to_string())
        .unwrap_or_default()
}
