//! DOOR.SYS drop-file generation.
//!
//! DOOR.SYS is the 52-line GAP format most DOS doors understand. Field order
//! and CRLF endings must match exactly; doors read it positionally.

use crate::codepage::encode_cp437;
use crate::error::BridgeError;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Drop-file name written for every door.
pub const DOOR_SYS: &str = "DOOR.SYS";

/// Number of lines in a DOOR.SYS record.
pub const DOOR_SYS_LINES: usize = 52;

/// Serial port the emulated modem is attached to.
const COMM_PORT: &str = "COM1:";
/// Locked rate reported to doors.
const BAUD_RATE: u32 = 38400;

const DATE_FORMAT: &str = "%m/%d/%y";
const TIME_FORMAT: &str = "%H:%M";

/// Caller profile carried in the session row's `user_data` column.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub real_name: String,
    pub alias: String,
    pub location: String,
    pub home_phone: String,
    pub data_phone: String,
    pub security_level: u32,
    pub times_on: u32,
    pub last_call: Option<NaiveDate>,
    pub minutes_remaining: u32,
    pub ansi: bool,
    pub page_length: u32,
    pub expert: bool,
    pub expiration: Option<NaiveDate>,
    pub record_number: u32,
    pub uploads: u32,
    pub downloads: u32,
    pub birthdate: Option<NaiveDate>,
    pub upload_kb: u64,
    pub download_kb: u64,
    pub comment: String,
    pub doors_opened: u32,
    pub messages_posted: u32,
}

impl UserProfile {
    /// Parse the JSON profile stored on a session row. Missing fields fall
    /// back to defaults suitable for a first-time caller.
    pub fn from_json(raw: &str) -> Result<Self, BridgeError> {
        if raw.trim().is_empty() {
            return Ok(Self::first_call());
        }
        let mut profile: UserProfile = serde_json::from_str(raw)?;
        if profile.security_level == 0 {
            profile.security_level = 10;
        }
        if profile.minutes_remaining == 0 {
            profile.minutes_remaining = 60;
        }
        if profile.page_length == 0 {
            profile.page_length = 24;
        }
        Ok(profile)
    }

    fn first_call() -> Self {
        Self {
            security_level: 10,
            minutes_remaining: 60,
            page_length: 24,
            ansi: true,
            ..Self::default()
        }
    }
}

/// Session-specific values that are not part of the caller profile.
#[derive(Debug, Clone)]
pub struct DropFileContext<'a> {
    pub node: u32,
    pub call_time: NaiveDateTime,
    pub sysop_name: &'a str,
    /// DOS path of the door directory, e.g. `C:\LORD`.
    pub door_dos_dir: &'a str,
}

/// Render a DOOR.SYS record as text (CRLF line endings).
pub fn render_door_sys(profile: &UserProfile, ctx: &DropFileContext<'_>) -> String {
    let yn = |b: bool| if b { "Y" } else { "N" };
    let date_or = |d: Option<NaiveDate>, fallback: &str| {
        d.map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| fallback.to_string())
    };
    let call_date = ctx.call_time.format(DATE_FORMAT).to_string();
    let real_name = if profile.real_name.is_empty() {
        &profile.alias
    } else {
        &profile.real_name
    };
    let alias = if profile.alias.is_empty() {
        &profile.real_name
    } else {
        &profile.alias
    };
    let data_phone = if profile.data_phone.is_empty() {
        &profile.home_phone
    } else {
        &profile.data_phone
    };
    let last_call = date_or(profile.last_call, &call_date);

    let lines: [String; DOOR_SYS_LINES] = [
        COMM_PORT.to_string(),
        BAUD_RATE.to_string(),
        "8".to_string(),
        ctx.node.to_string(),
        BAUD_RATE.to_string(),
        "Y".to_string(),
        "N".to_string(),
        "Y".to_string(),
        "Y".to_string(),
        field(real_name),
        field(&profile.location),
        field(&profile.home_phone),
        field(data_phone),
        String::new(),
        profile.security_level.to_string(),
        profile.times_on.to_string(),
        last_call.clone(),
        (u64::from(profile.minutes_remaining) * 60).to_string(),
        profile.minutes_remaining.to_string(),
        if profile.ansi { "GR" } else { "NG" }.to_string(),
        profile.page_length.to_string(),
        yn(profile.expert).to_string(),
        "1,2,3,4,5,6,7".to_string(),
        "1".to_string(),
        date_or(profile.expiration, "12/31/99"),
        profile.record_number.to_string(),
        "Z".to_string(),
        profile.uploads.to_string(),
        profile.downloads.to_string(),
        "0".to_string(),
        "999999".to_string(),
        date_or(profile.birthdate, "01/01/80"),
        ctx.door_dos_dir.to_string(),
        ctx.door_dos_dir.to_string(),
        field(ctx.sysop_name),
        field(alias),
        "00:00".to_string(),
        "Y".to_string(),
        "N".to_string(),
        "Y".to_string(),
        "7".to_string(),
        "0".to_string(),
        last_call,
        ctx.call_time.format(TIME_FORMAT).to_string(),
        "00:00".to_string(),
        "999".to_string(),
        "0".to_string(),
        profile.upload_kb.to_string(),
        profile.download_kb.to_string(),
        field(&profile.comment),
        profile.doors_opened.to_string(),
        profile.messages_posted.to_string(),
    ];

    let mut out = String::with_capacity(512);
    for line in &lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}

/// Write DOOR.SYS into `dir`, creating the directory if needed. The file is
/// CP437-encoded since the door reads it from DOS.
pub fn write_door_sys(
    dir: &Path,
    profile: &UserProfile,
    ctx: &DropFileContext<'_>,
) -> Result<std::path::PathBuf, BridgeError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(DOOR_SYS);
    std::fs::write(&path, encode_cp437(&render_door_sys(profile, ctx)))?;
    Ok(path)
}

/// Free-text values are single-line; stray CR/LF would shift every field
/// after them.
fn field(value: &str) -> String {
    value
        .chars()
        .filter(|c| *c != '\r' && *c != '\n')
        .collect::<String>()
        .trim()
        .to_string()
}
