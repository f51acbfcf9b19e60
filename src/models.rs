use time::OffsetDateTime;

/// Control point commands understood by the Progressor firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    TareScale,
    StartWeightMeasurement,
    StopWeightMeasurement,
    StartPeakRfdMeasurement,
    StartPeakRfdMeasurementSeries,
    AddCalibrationPoint,
    SaveCalibration,
    GetAppVersion,
    GetErrorInformation,
    ClearErrorInformation,
    EnterSleep,
    GetBatteryVoltage,
}

impl Command {
    pub fn opcode(self) -> u8 {
        match self {
            Command::TareScale => 100,
            Command::StartWeightMeasurement => 101,
            Command::StopWeightMeasurement => 102,
            Command::StartPeakRfdMeasurement => 103,
            Command::StartPeakRfdMeasurementSeries => 104,
            Command::AddCalibrationPoint => 105,
            Command::SaveCalibration => 106,
            Command::GetAppVersion => 107,
            Command::GetErrorInformation => 108,
            Command::ClearErrorInformation => 109,
            Command::EnterSleep => 110,
            Command::GetBatteryVoltage => 111,
        }
    }
}

/// Leading byte of every notification on the data characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    CommandResponse,
    WeightMeasurement,
    RfdPeak,
    RfdPeakSeries,
    LowPowerWarning,
}

impl ResponseType {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ResponseType::CommandResponse),
            1 => Some(ResponseType::WeightMeasurement),
            2 => Some(ResponseType::RfdPeak),
            3 => Some(ResponseType::RfdPeakSeries),
            4 => Some(ResponseType::LowPowerWarning),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightSample {
    /// Seconds since the device started measuring
    pub timestamp: f64,
    /// Kilograms
    pub weight: f32,
}

/// A decoded notification
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEnvelope {
    CommandResponse(Vec<u8>),
    WeightMeasurement(Vec<WeightSample>),
    RfdPeak(Vec<u8>),
    RfdPeakSeries(Vec<u8>),
    LowPowerWarning,
}

/// A command response interpreted under the pending command
#[derive(Debug, Clone, PartialEq)]
pub enum InterpretedResponse {
    AppVersion(String),
    /// Millivolts
    BatteryVoltage(u32),
    /// `None` means the device reported an empty crash log
    ErrorInformation(Option<String>),
}

/// A peripheral seen during discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peripheral {
    pub name: Option<String>,
    pub address: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceInfo {
    pub name: String,
    pub address: String,
    pub firmware_version: Option<String>,
    pub battery_millivolts: Option<u32>,
    pub crash_log: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Summary {
    pub median: f32,
    pub mad: f32,
}

/// Everything a finished session hands to downstream analysis
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub device: DeviceInfo,
    pub started_at: OffsetDateTime,
    pub samples: Vec<WeightSample>,
    pub summary: Option<Summary>,
    pub low_power_warnings: u32,
}
