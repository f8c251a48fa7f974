//! # Domain Types
//!
//! Core domain types used throughout the portal.
//!
//! ## Type Map
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  TagIdentity    │   │   RssiSample    │   │   SensorEdge    │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  EPC bytes      │   │  antenna 1..4   │   │  sensor 1|2     │       │
//! │  │  hex display    │   │  rssi (dBm)     │   │  rising|falling │       │
//! │  │  store key      │   │  at (Instant)   │   │                 │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                       ReaderConfig                              │   │
//! │  │  antennas: AntennaMask   session: S0..S3   target: A|B          │   │
//! │  │  power: PowerDbm (0..=33)  region: FrequencyRegion              │   │
//! │  │  profile: RfProfile (0..=3)                                     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Range-restricted values are newtypes that can only be built through
//! `TryFrom`, so a `ReaderConfig` that exists is a `ReaderConfig` the reader
//! accepts.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::codec::Command;
use crate::error::ValidationError;
use crate::validation;
use crate::{ANTENNA_COUNT, RSSI_DBM_OFFSET};

// =============================================================================
// Tag Identity
// =============================================================================

/// A tag's EPC, used as the inventory key.
///
/// Displayed and serialised as upper-case hex (`E28011606000020A1B2C3D4E`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TagIdentity(Vec<u8>);

impl TagIdentity {
    /// Creates an identity from raw EPC bytes.
    pub fn new(epc: impl Into<Vec<u8>>) -> Result<Self, ValidationError> {
        let epc = epc.into();
        validation::validate_epc(&epc)?;
        Ok(TagIdentity(epc))
    }

    /// Raw EPC bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// EPC length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Always false: an identity is never empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// EPCs `000000` and `000001`, which some readers report for an empty
    /// or unreadable EPC bank. They never name a real tag.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.0.as_slice(), [0x00, 0x00, 0x00] | [0x00, 0x00, 0x01])
    }

    /// Upper-case hex rendering.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02X}", b)).collect()
    }
}

impl fmt::Display for TagIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

impl FromStr for TagIdentity {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        if cleaned.len() % 2 != 0 {
            return Err(ValidationError::InvalidFormat {
                field: "epc".into(),
                reason: "hex string has an odd number of digits".into(),
            });
        }
        let bytes = (0..cleaned.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&cleaned[i..i + 2], 16))
            .collect::<Result<Vec<u8>, _>>()
            .map_err(|e| ValidationError::InvalidFormat {
                field: "epc".into(),
                reason: e.to_string(),
            })?;
        TagIdentity::new(bytes)
    }
}

impl TryFrom<String> for TagIdentity {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TagIdentity> for String {
    fn from(value: TagIdentity) -> Self {
        value.to_hex()
    }
}

// =============================================================================
// Antennas
// =============================================================================

/// Antenna port number, 1 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct AntennaId(u8);

impl AntennaId {
    pub const ONE: AntennaId = AntennaId(1);
    pub const TWO: AntennaId = AntennaId(2);
    pub const THREE: AntennaId = AntennaId(3);
    pub const FOUR: AntennaId = AntennaId(4);

    /// All antenna ports in order.
    pub const ALL: [AntennaId; ANTENNA_COUNT] = [Self::ONE, Self::TWO, Self::THREE, Self::FOUR];

    /// Antenna number (1-based).
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Zero-based index, as used on the wire and for per-antenna arrays.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0 - 1) as usize
    }

    /// Builds an antenna from its zero-based wire index.
    pub fn from_index(index: u8) -> Result<Self, ValidationError> {
        AntennaId::try_from(index.wrapping_add(1))
    }
}

impl TryFrom<u8> for AntennaId {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        validation::validate_antenna(value)?;
        Ok(AntennaId(value))
    }
}

impl From<AntennaId> for u8 {
    fn from(value: AntennaId) -> Self {
        value.0
    }
}

impl fmt::Display for AntennaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ANT{}", self.0)
    }
}

/// Non-empty set of enabled antennas.
///
/// Serialised as a list of antenna numbers, e.g. `[1, 2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct AntennaMask(u8);

impl AntennaMask {
    /// Builds a mask from antenna ids. Fails if the set is empty.
    pub fn new(antennas: impl IntoIterator<Item = AntennaId>) -> Result<Self, ValidationError> {
        let bits = antennas
            .into_iter()
            .fold(0u8, |bits, ant| bits | (1 << ant.index()));
        if bits == 0 {
            return Err(ValidationError::Required {
                field: "antennas".into(),
            });
        }
        Ok(AntennaMask(bits))
    }

    /// Every antenna enabled.
    pub const fn all() -> Self {
        AntennaMask(0b1111)
    }

    /// Returns true if the antenna is enabled.
    #[inline]
    pub const fn contains(self, antenna: AntennaId) -> bool {
        self.0 & (1 << antenna.index()) != 0
    }

    /// Enabled antennas in ascending order.
    pub fn iter(self) -> impl Iterator<Item = AntennaId> {
        AntennaId::ALL.into_iter().filter(move |a| self.contains(*a))
    }

    /// Number of enabled antennas.
    pub fn count(self) -> usize {
        self.0.count_ones() as usize
    }
}

impl Default for AntennaMask {
    /// The two portal antennas.
    fn default() -> Self {
        AntennaMask(0b0011)
    }
}

impl TryFrom<Vec<u8>> for AntennaMask {
    type Error = ValidationError;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        let ids = value
            .into_iter()
            .map(AntennaId::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        AntennaMask::new(ids)
    }
}

impl From<AntennaMask> for Vec<u8> {
    fn from(value: AntennaMask) -> Self {
        value.iter().map(u8::from).collect()
    }
}

impl fmt::Display for AntennaMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter().map(|a| a.to_string()).collect();
        write!(f, "{}", names.join("+"))
    }
}

// =============================================================================
// RSSI
// =============================================================================

/// Raw RSSI byte as reported by the reader.
///
/// ## Conversion
/// `dBm = raw - 129`, the R2000-family linear mapping (raw 0x6E → -19 dBm).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rssi(u8);

impl Rssi {
    #[inline]
    pub const fn from_raw(raw: u8) -> Self {
        Rssi(raw)
    }

    /// Builds the raw value for a dBm reading. Values outside the encodable
    /// range (-129..=126) are clamped.
    pub fn from_dbm(dbm: i16) -> Self {
        let raw = (dbm + RSSI_DBM_OFFSET).clamp(0, u8::MAX as i16);
        Rssi(raw as u8)
    }

    #[inline]
    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Signed dBm value.
    #[inline]
    pub const fn dbm(self) -> i16 {
        self.0 as i16 - RSSI_DBM_OFFSET
    }
}

/// One RSSI observation of a tag on one antenna.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RssiSample {
    pub antenna: AntennaId,
    /// Signed dBm.
    pub rssi: i16,
    pub at: Instant,
}

impl RssiSample {
    pub fn new(antenna: AntennaId, rssi: i16, at: Instant) -> Self {
        RssiSample { antenna, rssi, at }
    }
}

// =============================================================================
// Sensors
// =============================================================================

/// Physical presence sensor. Sensor 1 is on the inside of the portal by
/// default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum SensorId {
    One,
    Two,
}

impl SensorId {
    /// Wire / config number (1 or 2).
    pub const fn number(self) -> u8 {
        match self {
            SensorId::One => 1,
            SensorId::Two => 2,
        }
    }

    /// Zero-based index for per-sensor arrays.
    pub const fn index(self) -> usize {
        match self {
            SensorId::One => 0,
            SensorId::Two => 1,
        }
    }

    /// The other sensor of the pair.
    pub const fn other(self) -> SensorId {
        match self {
            SensorId::One => SensorId::Two,
            SensorId::Two => SensorId::One,
        }
    }
}

impl TryFrom<u8> for SensorId {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(SensorId::One),
            2 => Ok(SensorId::Two),
            other => Err(ValidationError::out_of_range("sensor", 1, 2, other as i64)),
        }
    }
}

impl From<SensorId> for u8 {
    fn from(value: SensorId) -> Self {
        value.number()
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.number())
    }
}

/// Signal transition on a sensor line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Edge implied by a line level change to `level`.
    pub const fn from_level(level: bool) -> Edge {
        if level {
            Edge::Rising
        } else {
            Edge::Falling
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Rising => write!(f, "rising"),
            Edge::Falling => write!(f, "falling"),
        }
    }
}

/// A sensor transition, as reported by the reader or the modem lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SensorEdge {
    pub sensor: SensorId,
    pub edge: Edge,
}

impl SensorEdge {
    pub const fn rising(sensor: SensorId) -> Self {
        SensorEdge {
            sensor,
            edge: Edge::Rising,
        }
    }

    pub const fn falling(sensor: SensorId) -> Self {
        SensorEdge {
            sensor,
            edge: Edge::Falling,
        }
    }
}

/// Direction of travel through the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

// =============================================================================
// Reader Settings
// =============================================================================

/// Transmit power in dBm, 0 through 33.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct PowerDbm(u8);

impl PowerDbm {
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for PowerDbm {
    fn default() -> Self {
        PowerDbm(30)
    }
}

impl TryFrom<u8> for PowerDbm {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        validation::validate_power(value)?;
        Ok(PowerDbm(value))
    }
}

impl From<PowerDbm> for u8 {
    fn from(value: PowerDbm) -> Self {
        value.0
    }
}

/// GPIO output pin, 1 through 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct GpioPin(u8);

impl GpioPin {
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for GpioPin {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        validation::validate_gpio_pin(value)?;
        Ok(GpioPin(value))
    }
}

impl From<GpioPin> for u8 {
    fn from(value: GpioPin) -> Self {
        value.0
    }
}

/// Gen2 inventory session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Session {
    S0,
    #[default]
    S1,
    S2,
    S3,
}

impl Session {
    pub const fn code(self) -> u8 {
        match self {
            Session::S0 => 0,
            Session::S1 => 1,
            Session::S2 => 2,
            Session::S3 => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Session::S0),
            1 => Some(Session::S1),
            2 => Some(Session::S2),
            3 => Some(Session::S3),
            _ => None,
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S{}", self.code())
    }
}

impl FromStr for Session {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches(['s', 'S']);
        digits
            .parse::<u8>()
            .ok()
            .and_then(Session::from_code)
            .ok_or_else(|| ValidationError::InvalidFormat {
                field: "session".into(),
                reason: format!("'{}' is not one of S0, S1, S2, S3", s),
            })
    }
}

/// Gen2 inventoried-flag target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    #[default]
    A,
    B,
}

impl Target {
    pub const fn code(self) -> u8 {
        match self {
            Target::A => 0,
            Target::B => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Target::A),
            1 => Some(Target::B),
            _ => None,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::A => write!(f, "A"),
            Target::B => write!(f, "B"),
        }
    }
}

impl FromStr for Target {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "a" | "0" => Ok(Target::A),
            "b" | "1" => Ok(Target::B),
            other => Err(ValidationError::InvalidFormat {
                field: "target".into(),
                reason: format!("'{}' is not one of A, B", other),
            }),
        }
    }
}

/// Regulatory frequency plan.
///
/// ## Wire Parameters
/// ```text
/// Region    code  start  end     Band
/// ───────── ────  ─────  ────    ──────────────
/// US        0x01  0x07   0x3B    902-928 MHz
/// China     0x01  0x2B   0x35    920-925 MHz
/// Vietnam   0x01  0x27   0x31    918-923 MHz
/// Europe    0x02  0x00   0x06    865-868 MHz
/// Manual    0x01  start  end     caller chosen
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrequencyRegion {
    #[default]
    Us,
    China,
    Vietnam,
    Europe,
    Manual {
        start: u8,
        end: u8,
    },
}

impl FrequencyRegion {
    /// `(region_code, start_channel, end_channel)` as sent to the reader.
    pub const fn wire_params(self) -> (u8, u8, u8) {
        match self {
            FrequencyRegion::Us => (0x01, 0x07, 0x3B),
            FrequencyRegion::China => (0x01, 0x2B, 0x35),
            FrequencyRegion::Vietnam => (0x01, 0x27, 0x31),
            FrequencyRegion::Europe => (0x02, 0x00, 0x06),
            FrequencyRegion::Manual { start, end } => (0x01, start, end),
        }
    }
}

impl fmt::Display for FrequencyRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrequencyRegion::Us => write!(f, "US"),
            FrequencyRegion::China => write!(f, "China"),
            FrequencyRegion::Vietnam => write!(f, "Vietnam"),
            FrequencyRegion::Europe => write!(f, "Europe"),
            FrequencyRegion::Manual { start, end } => {
                write!(f, "Manual[0x{:02X}-0x{:02X}]", start, end)
            }
        }
    }
}

impl FromStr for FrequencyRegion {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "us" | "fcc" => Ok(FrequencyRegion::Us),
            "china" | "cn" => Ok(FrequencyRegion::China),
            "vietnam" | "vn" => Ok(FrequencyRegion::Vietnam),
            "europe" | "eu" | "etsi" => Ok(FrequencyRegion::Europe),
            other => Err(ValidationError::InvalidFormat {
                field: "region".into(),
                reason: format!("unknown region '{}'", other),
            }),
        }
    }
}

/// RF link profile, 0 through 3 (sent as `0xD0 + n`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct RfProfile(u8);

impl RfProfile {
    #[inline]
    pub const fn get(self) -> u8 {
        self.0
    }

    /// Byte sent with the set-profile command.
    #[inline]
    pub const fn wire_code(self) -> u8 {
        0xD0 + self.0
    }

    /// Human-readable link parameters.
    pub const fn description(self) -> &'static str {
        match self.0 {
            0 => "Tari 25us, FM0, LF 40KHz",
            1 => "Tari 25us, Miller 4, LF 250KHz",
            2 => "Tari 25us, Miller 4, LF 300KHz",
            _ => "Tari 6.25us, FM0, LF 400KHz",
        }
    }
}

impl Default for RfProfile {
    fn default() -> Self {
        RfProfile(1)
    }
}

impl TryFrom<u8> for RfProfile {
    type Error = ValidationError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        validation::validate_rf_profile(value)?;
        Ok(RfProfile(value))
    }
}

impl From<RfProfile> for u8 {
    fn from(value: RfProfile) -> Self {
        value.0
    }
}

impl fmt::Display for RfProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Profile {} ({})", self.0, self.description())
    }
}

/// Reader settings applied before an inventory session starts.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReaderConfig {
    #[serde(default)]
    pub antennas: AntennaMask,
    #[serde(default)]
    pub session: Session,
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub power_dbm: PowerDbm,
    #[serde(default)]
    pub region: FrequencyRegion,
    #[serde(default)]
    pub rf_profile: RfProfile,
}

impl ReaderConfig {
    /// Checks cross-field constraints the newtypes cannot express.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let FrequencyRegion::Manual { start, end } = self.region {
            validation::validate_channel_range(start, end)?;
        }
        Ok(())
    }

    /// Setup commands in the order they are sent before `StartInventory`.
    pub fn commands(&self) -> Vec<Command> {
        vec![
            Command::SetPower(self.power_dbm),
            Command::SetRegion(self.region),
            Command::SetProfile(self.rf_profile),
            Command::SetSession(self.session),
            Command::SetTarget(self.target),
        ]
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
