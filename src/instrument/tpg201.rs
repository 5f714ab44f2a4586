//! Pfeiffer TPG 201 vacuum gauge controller.
//!
//! ASCII protocol, frames terminated by `\r`. Every frame starts with the
//! address `001`, followed by a command letter, up to six data bytes and a
//! checksum byte: `sum(preceding bytes) % 64 + 64`.

use crate::device::{DeviceProtocol, DeviceState, VariableInfo, VariableType};
use crate::error::{AppResult, DaqError};
use bytes::{Bytes, BytesMut};
use std::time::Duration;

const ADDRESS: &[u8] = b"001";

/// Coarse vacuum state reported in `__status__`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VacuumStatus {
    NoVacuum,
    MediumVacuum,
    VacuumOk,
}

impl VacuumStatus {
    /// Classifies a pressure in mbar.
    pub fn from_pressure(mbar: f64) -> Self {
        if mbar >= 1.0 {
            VacuumStatus::NoVacuum
        } else if mbar >= 0.1 {
            VacuumStatus::MediumVacuum
        } else {
            VacuumStatus::VacuumOk
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VacuumStatus::NoVacuum => "No vacuum",
            VacuumStatus::MediumVacuum => "Medium vacuum",
            VacuumStatus::VacuumOk => "Vacuum OK",
        }
    }
}

/// Checksum byte of a frame body.
pub fn checksum(body: &[u8]) -> u8 {
    let sum: u32 = body.iter().map(|&b| u32::from(b)).sum();
    (sum % 64) as u8 + 64
}

fn request(command: u8) -> Bytes {
    let mut frame = ADDRESS.to_vec();
    frame.push(command);
    frame.push(checksum(&frame));
    frame.push(b'\r');
    Bytes::from(frame)
}

#[derive(Debug, Default)]
pub struct Tpg201;

impl Tpg201 {
    fn parse_pressure(data: &[u8]) -> AppResult<f64> {
        let field = |range: std::ops::Range<usize>| -> AppResult<f64> {
            data.get(range)
                .and_then(|raw| std::str::from_utf8(raw).ok())
                .and_then(|text| text.trim().parse::<f64>().ok())
                .ok_or_else(|| {
                    DaqError::Protocol(format!(
                        "Invalid pressure reading {}",
                        data.escape_ascii()
                    ))
                })
        };
        let mantissa = field(0..4)?;
        let exponent = field(4..6)?;
        Ok(mantissa * 10f64.powf(exponent - 23.0))
    }

    fn text(data: &[u8]) -> AppResult<String> {
        std::str::from_utf8(data)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| DaqError::Protocol(format!("Non-ASCII reply: {e}")))
    }
}

impl DeviceProtocol for Tpg201 {
    fn variables(&self) -> Vec<VariableInfo> {
        vec![
            VariableInfo::new("pressure")
                .every(Duration::from_millis(500))
                .kind(VariableType::Float),
            VariableInfo::new("version").once().kind(VariableType::Str),
            VariableInfo::new("units").once().kind(VariableType::Str),
        ]
    }

    fn query(&mut self, device: &mut DeviceState, variable: &str) -> AppResult<()> {
        let command = match variable {
            "pressure" => b'M',
            "version" => b'T',
            "units" => b'U',
            other => return Err(DaqError::UnknownVariable(other.to_string())),
        };
        device.enqueue(request(command), 1);
        Ok(())
    }

    fn cut_messages(&mut self, buffer: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(end) = buffer.iter().position(|&b| b == b'\r') {
            let mut frame = buffer.split_to(end + 1);
            frame.truncate(end);
            frames.push(frame.freeze());
        }
        frames
    }

    fn interpret_message(
        &mut self,
        device: &mut DeviceState,
        frame: &[u8],
        _sent: Option<&[u8]>,
    ) -> AppResult<()> {
        if !frame.starts_with(ADDRESS) || frame.len() < ADDRESS.len() + 2 {
            return Err(DaqError::Protocol(format!(
                "Invalid message: does not start with \"001\" ({})",
                frame.escape_ascii()
            )));
        }
        let (body, check) = frame.split_at(frame.len() - 1);
        if checksum(body) != check[0] {
            return Err(DaqError::Protocol(format!(
                "Message checksum error {}",
                frame.escape_ascii()
            )));
        }
        let data = &body[ADDRESS.len() + 1..];
        match body[ADDRESS.len()] {
            b'M' => {
                let pressure = Self::parse_pressure(data)?;
                device.update_variable("pressure", pressure)?;
                device.set_status(VacuumStatus::from_pressure(pressure).as_str())?;
                device.set_aux_status(format!("{pressure:.4} mbar"))?;
            }
            b'T' => {
                device.update_variable("version", Self::text(data)?)?;
            }
            b'U' => {
                device.update_variable("units", Self::text(data)?)?;
            }
            _ => device.error(format!("Unknown message: {}", frame.escape_ascii())),
        }
        Ok(())
    }

    fn issue_command(
        &mut self,
        _device: &mut DeviceState,
        _name: &str,
        _args: &[serde_json::Value],
    ) -> AppResult<()> {
        Err(DaqError::Command(
            "No commands supported by this device".to_string(),
        ))
    }
}
