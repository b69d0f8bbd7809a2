//! Door Lock Protocol
//!
//! Wire format for the dormitory door locks: command frame encoding,
//! the room-open additional data block, and response decoding.
//! Everything here is pure; time and device identity are passed in.

use crate::infrastructure::bluetooth::error::LinkError;
use chrono::{Datelike, NaiveDateTime, Timelike};
use std::fmt;
use uuid::Uuid;

/// Main door-lock GATT service
pub const SERVICE_UUID: &str = "8c2e1f04-37b3-4e4e-8c1a-f2d57ab8c3b6";

/// Notify Characteristic UUID - where the lock pushes responses
pub const NOTIFY_CHAR_UUID: &str = "a7c384d0-5fc2-41a1-bf3a-1a8d0fc167be";

/// Command Characteristic UUID - where command bytes are written
pub const COMMAND_CHAR_UUID: &str = "c5bd6ef7-94ab-4ac6-a2dc-9235d7aa22cd";

pub const SERVICE: Uuid = Uuid::from_u128(0x8c2e1f04_37b3_4e4e_8c1a_f2d57ab8c3b6);
pub const NOTIFY_CHAR: Uuid = Uuid::from_u128(0xa7c384d0_5fc2_41a1_bf3a_1a8d0fc167be);
pub const COMMAND_CHAR: Uuid = Uuid::from_u128(0xc5bd6ef7_94ab_4ac6_a2dc_9235d7aa22cd);

/// Advertised name prefix shared by every lock
pub const DEVICE_NAME_PREFIX: &str = "unist";

pub const FRAME_HEADER: u8 = 0xCC;
pub const STANDARD_FRAME_LEN: usize = 10;
pub const EXTENDED_FRAME_LEN: usize = 13;

pub const RESPONSE_SUCCESS: u8 = 0x81;
pub const RESPONSE_FAILURE: u8 = 0x80;
/// Minimum bytes for a decodable response: header, code, echoed command
pub const RESPONSE_MIN_LEN: usize = 3;

const MODE_STANDARD: u8 = 0x00;
const MODE_ENTRANCE: u8 = 0x01;

const BLOCK_DELIMITER: u8 = b'/';
const BLOCK_TERMINATOR: u8 = 0x0D;
const ROOM_KEY: &str = "1";
const DEVICE_IDENTITY_MARKER: &str = "unist_";
pub const DEFAULT_DEVICE_IDENTITY: &str = "000000";

const NUMBER_SEQUENCE_LEN: usize = 7;
const HEX_FILL: u8 = 0xFF;

/// Command codes understood by the lock firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandCode {
    Close = 0x00,
    Open = 0x01,
    StatusQuery = 0x02,
    Reserved3 = 0x03,
    Reserved4 = 0x04,
    SetTime = 0x05,
    UseControlSet = 0x06,
    UseControlRelease = 0x07,
    ManualLockMode = 0x08,
    AutoLockMode = 0x09,
    BleOpen = 0x0A,
    BleAuthChange = 0x0B,
    KeypadTimeWindow = 0x0C,
    FactoryReset = 0x0D,
    SuperAdminChange = 0x0E,
    TouchPassword4 = 0x0F,
    BleClose = 0x10,
    RecentEvent = 0x11,
    MuteSet = 0x12,
    MuteRelease = 0x13,
    DoorOpenEvent = 0x14,
    CardSetting = 0x15,
    CardSettingQuery = 0x16,
    ManagerPassword = 0x17,
    MaidPassword = 0x18,
    PasswordUserCheck = 0x19,
    TouchPasswordDynamic = 0x1A,
    PasswordModeCheck = 0x1B,
    BatteryQuery = 0x1C,
    RegisterCard = 0x1D,
    DeleteCard = 0x1E,
    DeleteAllCards = 0x1F,
    EntranceOpen = 0x21,
}

impl CommandCode {
    const ALL: [CommandCode; 33] = [
        Self::Close,
        Self::Open,
        Self::StatusQuery,
        Self::Reserved3,
        Self::Reserved4,
        Self::SetTime,
        Self::UseControlSet,
        Self::UseControlRelease,
        Self::ManualLockMode,
        Self::AutoLockMode,
        Self::BleOpen,
        Self::BleAuthChange,
        Self::KeypadTimeWindow,
        Self::FactoryReset,
        Self::SuperAdminChange,
        Self::TouchPassword4,
        Self::BleClose,
        Self::RecentEvent,
        Self::MuteSet,
        Self::MuteRelease,
        Self::DoorOpenEvent,
        Self::CardSetting,
        Self::CardSettingQuery,
        Self::ManagerPassword,
        Self::MaidPassword,
        Self::PasswordUserCheck,
        Self::TouchPasswordDynamic,
        Self::PasswordModeCheck,
        Self::BatteryQuery,
        Self::RegisterCard,
        Self::DeleteCard,
        Self::DeleteAllCards,
        Self::EntranceOpen,
    ];

    /// Look up a named command by its raw code
    pub fn from_u8(code: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| *c as u8 == code)
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Short human description of the command
    pub fn description(self) -> &'static str {
        match self {
            Self::Close => "Remote lock close",
            Self::Open => "Remote lock open",
            Self::StatusQuery => "Lock status query",
            Self::Reserved3 | Self::Reserved4 => "Reserved",
            Self::SetTime => "Set current time",
            Self::UseControlSet => "Enable use control",
            Self::UseControlRelease => "Release use control",
            Self::ManualLockMode => "Manual lock mode",
            Self::AutoLockMode => "Automatic lock mode",
            Self::BleOpen => "Smartphone BLE open",
            Self::BleAuthChange => "Change smartphone auth number",
            Self::KeypadTimeWindow => "Keypad availability time",
            Self::FactoryReset => "Factory reset",
            Self::SuperAdminChange => "Change super admin number",
            Self::TouchPassword4 => "Change 4-digit keypad password",
            Self::BleClose => "Smartphone BLE close",
            Self::RecentEvent => "Recent event query",
            Self::MuteSet => "Mute on",
            Self::MuteRelease => "Mute off",
            Self::DoorOpenEvent => "Door opened time query",
            Self::CardSetting => "Card lock settings",
            Self::CardSettingQuery => "Card lock settings query",
            Self::ManagerPassword => "Change manager keypad password",
            Self::MaidPassword => "Change maid keypad password",
            Self::PasswordUserCheck => "Password user check",
            Self::TouchPasswordDynamic => "Change 8-digit keypad password",
            Self::PasswordModeCheck => "Keypad password mode query",
            Self::BatteryQuery => "Battery level query",
            Self::RegisterCard => "Register student card",
            Self::DeleteCard => "Delete student card",
            Self::DeleteAllCards => "Delete all student cards",
            Self::EntranceOpen => "Shared entrance open",
        }
    }
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> Self {
        code as u8
    }
}

/// Free-form inputs for the card registration/deletion commands
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandParams {
    pub order: String,
    pub number_sequence: String,
    pub cycle: String,
}

/// One command invocation, built fresh for every send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub code: u8,
    pub requires_extended_packet: bool,
    pub parameters: Option<CommandParams>,
}

impl CommandDescriptor {
    pub fn new(code: impl Into<u8>, parameters: Option<CommandParams>) -> Self {
        let code = code.into();
        Self {
            code,
            requires_extended_packet: is_extended_command(code),
            parameters,
        }
    }

    pub fn frame_len(&self) -> usize {
        if self.requires_extended_packet {
            EXTENDED_FRAME_LEN
        } else {
            STANDARD_FRAME_LEN
        }
    }

    /// The entrance lock never answers, every other command does
    pub fn expects_response(&self) -> bool {
        self.code != CommandCode::EntranceOpen as u8
    }
}

/// Inputs the encoder needs from the outside world
#[derive(Debug, Clone)]
pub struct EncodeContext {
    pub now: NaiveDateTime,
    pub device_name: Option<String>,
}

impl EncodeContext {
    pub fn new(now: NaiveDateTime, device_name: Option<String>) -> Self {
        Self { now, device_name }
    }
}

/// Parse a UUID string coming from settings
pub fn parse_uuid(value: &str) -> Result<Uuid, LinkError> {
    Uuid::parse_str(value.trim()).map_err(|e| LinkError::InvalidUuid {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// True for the 13-byte card management commands
pub fn is_extended_command(code: u8) -> bool {
    matches!(code, 0x1D..=0x1F)
}

/// Display name of a raw command code, e.g. `0x1D`
pub fn command_name(code: u8) -> String {
    format!("0x{:02X}", code)
}

/// Low 8 bits of the sum of `data`
pub fn calculate_checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Encode a command into the exact byte sequence written to the lock
///
/// # Frame Structure
///
/// ```text
/// [0]      : Header 0xCC
/// [1]      : Command code
/// [2]      : Mode (0x01 for entrance open, else 0x00)
/// [3..n-1] : Payload (6 bytes standard, 9 bytes extended)
/// [n-1]    : Checksum, sum of bytes [0..n-1] mod 256
/// ```
///
/// Open (0x01) is followed by the unchecksummed additional data block.
pub fn encode_command(descriptor: &CommandDescriptor, ctx: &EncodeContext) -> Vec<u8> {
    let len = descriptor.frame_len();
    let mut frame = vec![0u8; len];
    frame[0] = FRAME_HEADER;
    frame[1] = descriptor.code;
    frame[2] = if descriptor.code == CommandCode::EntranceOpen as u8 {
        MODE_ENTRANCE
    } else {
        MODE_STANDARD
    };

    match CommandCode::from_u8(descriptor.code) {
        Some(CommandCode::SetTime) | Some(CommandCode::KeypadTimeWindow) => {
            frame[4..9].copy_from_slice(&time_components(&ctx.now));
        }
        Some(CommandCode::RegisterCard) if len == EXTENDED_FRAME_LEN => {
            let params = descriptor.parameters.clone().unwrap_or_default();
            frame[3] = parse_hex_input(&params.order, HEX_FILL);
            frame[4..11].copy_from_slice(&parse_number_text(&params.number_sequence));
            frame[11] = parse_hex_input(&params.cycle, HEX_FILL);
        }
        Some(CommandCode::DeleteCard) if len == EXTENDED_FRAME_LEN => {
            let params = descriptor.parameters.clone().unwrap_or_default();
            frame[3] = parse_hex_input(&params.order, HEX_FILL);
        }
        // Administrative passwords are sent as zeros
        _ => {}
    }

    let checksum_index = len - 1;
    frame[checksum_index] = calculate_checksum(&frame[..checksum_index]);

    if descriptor.code == CommandCode::Open as u8 {
        let identity = ctx
            .device_name
            .as_deref()
            .and_then(device_identity_from_name)
            .unwrap_or_else(|| DEFAULT_DEVICE_IDENTITY.to_string());
        frame.extend(additional_data_block(&identity, &ctx.now, ROOM_KEY));
    }

    frame
}

/// `[year % 100, month, day, hour, minute]`
fn time_components(now: &NaiveDateTime) -> [u8; 5] {
    [
        (now.year().rem_euclid(100)) as u8,
        now.month() as u8,
        now.day() as u8,
        now.hour() as u8,
        now.minute() as u8,
    ]
}

/// Build the room-open suffix
///
/// ```text
/// '/' identity digits '/' YYYYMMDD digits '/' key digit '/' 0x0D
/// ```
///
/// Digits are sent as their numeric value (0x00-0x09), not ASCII.
pub fn additional_data_block(identity: &str, now: &NaiveDateTime, key: &str) -> Vec<u8> {
    let date = now.format("%Y%m%d").to_string();

    let mut block = Vec::with_capacity(identity.len() + date.len() + key.len() + 5);
    block.push(BLOCK_DELIMITER);
    block.extend(digit_values(identity));
    block.push(BLOCK_DELIMITER);
    block.extend(digit_values(&date));
    block.push(BLOCK_DELIMITER);
    block.extend(digit_values(key));
    block.push(BLOCK_DELIMITER);
    block.push(BLOCK_TERMINATOR);
    block
}

fn digit_values(text: &str) -> impl Iterator<Item = u8> + '_ {
    text.chars().filter_map(|c| c.to_digit(10)).map(|d| d as u8)
}

/// Extract the numeric identity from an advertised name (`unist_306301` -> `306301`)
pub fn device_identity_from_name(name: &str) -> Option<String> {
    let start = name.find(DEVICE_IDENTITY_MARKER)? + DEVICE_IDENTITY_MARKER.len();
    let digits: String = name[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Parse a card number like `"11 22 33 44 55 66 1"` into exactly 7 bytes
///
/// Whitespace is stripped, odd lengths get a trailing `F`, pairs that are
/// not hex become 0xFF and missing pairs are filled with 0xFF.
pub fn parse_number_text(text: &str) -> [u8; NUMBER_SEQUENCE_LEN] {
    let mut numbers = [HEX_FILL; NUMBER_SEQUENCE_LEN];

    let mut clean: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if clean.len() % 2 != 0 {
        clean.push('F');
    }

    for (slot, pair) in numbers.iter_mut().zip(clean.chunks(2)) {
        let pair: String = pair.iter().collect();
        *slot = u8::from_str_radix(&pair, 16).unwrap_or(HEX_FILL);
    }

    numbers
}

/// Parse a single hex byte field, falling back to `default`
pub fn parse_hex_input(text: &str, default: u8) -> u8 {
    let text = text.trim();
    if text.is_empty() {
        return default;
    }
    let padded = format!("{:0>2}", text);
    u8::from_str_radix(&padded, 16).unwrap_or(default)
}

/// Space separated upper-case hex, for logs only
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Classification of the response code byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Success,
    Failure,
    Unrecognized(u8),
}

/// Decoded lock response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseFrame {
    pub header: u8,
    pub response_code: u8,
    pub command_echo: u8,
}

impl ResponseFrame {
    pub fn kind(&self) -> ResponseKind {
        match self.response_code {
            RESPONSE_SUCCESS => ResponseKind::Success,
            RESPONSE_FAILURE => ResponseKind::Failure,
            other => ResponseKind::Unrecognized(other),
        }
    }

    pub fn is_success(&self) -> bool {
        self.kind() == ResponseKind::Success
    }
}

impl fmt::Display for ResponseFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "header=0x{:02X} response=0x{:02X} command=0x{:02X}",
            self.header, self.response_code, self.command_echo
        )
    }
}

/// Decode a notification payload
///
/// Returns `None` for payloads shorter than three bytes; callers keep
/// waiting instead of treating them as failures.
pub fn decode_response(bytes: &[u8]) -> Option<ResponseFrame> {
    if bytes.len() < RESPONSE_MIN_LEN {
        return None;
    }
    Some(ResponseFrame {
        header: bytes[0],
        response_code: bytes[1],
        command_echo: bytes[2],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ctx(device_name: Option<&str>) -> EncodeContext {
        let now = NaiveDate::from_ymd_opt(2025, 1, 15)
            .unwrap()
            .and_hms_opt(9, 41, 0)
            .unwrap();
        EncodeContext::new(now, device_name.map(str::to_string))
    }

    #[test]
    fn test_uuid_constants_match_strings() {
        assert_eq!(parse_uuid(SERVICE_UUID).unwrap(), SERVICE);
        assert_eq!(parse_uuid(NOTIFY_CHAR_UUID).unwrap(), NOTIFY_CHAR);
        assert_eq!(parse_uuid(COMMAND_CHAR_UUID).unwrap(), COMMAND_CHAR);
        assert!(matches!(
            parse_uuid("not-a-uuid"),
            Err(LinkError::InvalidUuid { .. })
        ));
    }

    fn encode(code: u8) -> Vec<u8> {
        encode_command(&CommandDescriptor::new(code, None), &ctx(None))
    }

    #[test]
    fn test_checksum_is_low_byte_of_sum() {
        for code in [0x00u8, 0x02, 0x05, 0x0C, 0x1C, 0x1D, 0x1E, 0x1F, 0x21] {
            let frame = encode(code);
            let (body, checksum) = frame.split_at(frame.len() - 1);
            let sum: u32 = body.iter().map(|b| *b as u32).sum();
            assert_eq!(checksum[0], (sum % 256) as u8, "code 0x{:02X}", code);

            let total: u32 = frame.iter().map(|b| *b as u32).sum();
            assert_eq!(((total - checksum[0] as u32) % 256) as u8, checksum[0]);
        }
    }

    #[test]
    fn test_frame_lengths() {
        for code in (0x00u8..=0x1C).chain([0x20, 0x21, 0x30]) {
            if code == 0x01 {
                continue;
            }
            assert_eq!(encode(code).len(), STANDARD_FRAME_LEN, "code 0x{:02X}", code);
        }
        for code in [0x1D, 0x1E, 0x1F] {
            assert_eq!(encode(code).len(), EXTENDED_FRAME_LEN);
        }
        let open = encode_command(
            &CommandDescriptor::new(CommandCode::Open, None),
            &ctx(Some("unist_306301")),
        );
        let block = additional_data_block("306301", &ctx(None).now, "1");
        assert_eq!(open.len(), STANDARD_FRAME_LEN + block.len());
    }

    #[test]
    fn test_room_open_composite_frame() {
        let frame = encode_command(
            &CommandDescriptor::new(CommandCode::Open, None),
            &ctx(Some("unist_306301")),
        );
        assert_eq!(
            &frame[..10],
            &[0xCC, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xCD]
        );
        assert_eq!(
            &frame[10..],
            &[
                0x2F, 3, 0, 6, 3, 0, 1, 0x2F, 2, 0, 2, 5, 0, 1, 1, 5, 0x2F, 1, 0x2F, 0x0D
            ]
        );
    }

    #[test]
    fn test_room_open_without_identity_uses_default() {
        let frame = encode_command(
            &CommandDescriptor::new(CommandCode::Open, None),
            &ctx(Some("some-other-lock")),
        );
        assert_eq!(&frame[10..18], &[0x2F, 0, 0, 0, 0, 0, 0, 0x2F]);
    }

    #[test]
    fn test_entrance_open_frame() {
        let frame = encode(CommandCode::EntranceOpen.as_u8());
        assert_eq!(frame, vec![0xCC, 0x21, 0x01, 0, 0, 0, 0, 0, 0, 0xEE]);
    }

    #[test]
    fn test_time_payload() {
        let frame = encode(CommandCode::SetTime.as_u8());
        assert_eq!(&frame[..9], &[0xCC, 0x05, 0x00, 0x00, 25, 1, 15, 9, 41]);
        let keypad = encode(CommandCode::KeypadTimeWindow.as_u8());
        assert_eq!(&keypad[3..9], &frame[3..9]);
    }

    #[test]
    fn test_register_card_payload() {
        let params = CommandParams {
            order: "3".to_string(),
            number_sequence: "11 22 33 44 55 66 1".to_string(),
            cycle: "a".to_string(),
        };
        let frame = encode_command(
            &CommandDescriptor::new(CommandCode::RegisterCard, Some(params)),
            &ctx(None),
        );
        assert_eq!(
            &frame[..12],
            &[0xCC, 0x1D, 0x00, 0x03, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x1F, 0x0A]
        );
        assert_eq!(frame[12], calculate_checksum(&frame[..12]));
    }

    #[test]
    fn test_delete_card_defaults_order() {
        let frame = encode(CommandCode::DeleteCard.as_u8());
        assert_eq!(frame[3], 0xFF);
        assert!(frame[4..12].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_parse_number_text() {
        assert_eq!(parse_number_text(""), [0xFF; 7]);
        assert_eq!(parse_number_text("   "), [0xFF; 7]);
        assert_eq!(
            parse_number_text("AA"),
            [0xAA, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            parse_number_text("1122334455661"),
            [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x1F]
        );
        assert_eq!(
            parse_number_text("11ZZ22"),
            [0x11, 0xFF, 0x22, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        // Extra pairs past seven are dropped
        assert_eq!(parse_number_text("0102030405060708")[6], 0x07);
    }

    #[test]
    fn test_parse_hex_input() {
        assert_eq!(parse_hex_input("", 0xFF), 0xFF);
        assert_eq!(parse_hex_input("5", 0xFF), 0x05);
        assert_eq!(parse_hex_input("1f", 0xFF), 0x1F);
        assert_eq!(parse_hex_input("zz", 0xFF), 0xFF);
        assert_eq!(parse_hex_input("123", 0x00), 0x00);
    }

    #[test]
    fn test_decode_response() {
        let ok = decode_response(&[0xCC, 0x81, 0x01]).unwrap();
        assert_eq!(ok.kind(), ResponseKind::Success);
        assert_eq!(ok.command_echo, 0x01);

        let failed = decode_response(&[0xCC, 0x80, 0x01]).unwrap();
        assert_eq!(failed.kind(), ResponseKind::Failure);

        let odd = decode_response(&[0xCC, 0x7F, 0x01]).unwrap();
        assert_eq!(odd.kind(), ResponseKind::Unrecognized(0x7F));
        assert!(!odd.is_success());

        assert_eq!(decode_response(&[0xCC, 0x81]), None);
        assert_eq!(decode_response(&[]), None);
    }

    #[test]
    fn test_device_identity_from_name() {
        assert_eq!(
            device_identity_from_name("unist_306301").as_deref(),
            Some("306301")
        );
        assert_eq!(device_identity_from_name("unistdoor_306"), None);
        assert_eq!(device_identity_from_name("unist_"), None);
    }

    #[test]
    fn test_command_table() {
        assert_eq!(CommandCode::from_u8(0x1C), Some(CommandCode::BatteryQuery));
        assert_eq!(CommandCode::from_u8(0x20), None);
        assert_eq!(command_name(0x1D), "0x1D");
        assert!(is_extended_command(0x1E));
        assert!(!is_extended_command(0x21));
        assert!(!CommandDescriptor::new(CommandCode::EntranceOpen, None).expects_response());
        assert_eq!(bytes_to_hex(&[0xCC, 0x01, 0x0D]), "CC 01 0D");
    }
}
