//! JSON payloads carried on the four channels.

use crate::model::{Model, ModelError, Scenario};
use montecarlo_env::WorkerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Command kind that asks the controller to load and broadcast a model.
pub const SWAP_MODEL: &str = "cambiar_modelo";

/// Command kind that asks the controller to stop generating.
pub const STOP: &str = "detener";

/// Wire decode/encode errors.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed model: {0}")]
    Model(#[from] ModelError),

    #[error("Command '{0}' is missing its model reference")]
    MissingModelRef(String),
}

/// The model evaluated at one scenario, tagged with producer and model identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRecord {
    #[serde(default = "unknown_worker")]
    pub worker_id: WorkerId,

    #[serde(rename = "escenario", alias = "scenario")]
    pub scenario: Scenario,

    #[serde(rename = "resultado", alias = "value")]
    pub value: f64,

    /// Seconds since the Unix epoch
    pub timestamp: f64,

    #[serde(rename = "modelo", alias = "model_name", default)]
    pub model_name: String,
}

fn unknown_worker() -> WorkerId {
    WorkerId::from("desconocido")
}

impl ResultRecord {
    /// True if the record names the model it was computed under.
    pub fn has_known_model(&self) -> bool {
        let name = self.model_name.trim();
        !name.is_empty() && name != "N/A"
    }
}

/// Monitor-to-controller instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Stop current generation, load `model_ref`, broadcast it, restart generation
    SwapModel {
        model_ref: String,
        timestamp: Option<f64>,
    },

    /// Stop current generation
    Stop { timestamp: Option<f64> },

    /// Unrecognized `comando`; acknowledged and ignored
    Unknown(String),
}

/// Flat on-the-wire shape of a command.
#[derive(Debug, Serialize, Deserialize)]
struct CommandFrame {
    comando: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    modelo: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    timestamp: Option<f64>,
}

impl Command {
    /// Swap command stamped with `timestamp`.
    pub fn swap(model_ref: impl Into<String>, timestamp: f64) -> Self {
        Command::SwapModel {
            model_ref: model_ref.into(),
            timestamp: Some(timestamp),
        }
    }

    /// Short name for logging.
    pub fn kind(&self) -> &str {
        match self {
            Command::SwapModel { .. } => SWAP_MODEL,
            Command::Stop { .. } => STOP,
            Command::Unknown(kind) => kind,
        }
    }

    fn into_frame(self) -> CommandFrame {
        match self {
            Command::SwapModel { model_ref, timestamp } => CommandFrame {
                comando: SWAP_MODEL.to_string(),
                modelo: Some(model_ref),
                timestamp,
            },
            Command::Stop { timestamp } => CommandFrame {
                comando: STOP.to_string(),
                modelo: None,
                timestamp,
            },
            Command::Unknown(kind) => CommandFrame {
                comando: kind,
                modelo: None,
                timestamp: None,
            },
        }
    }

    fn from_frame(frame: CommandFrame) -> Result<Self, CodecError> {
        match frame.comando.as_str() {
            SWAP_MODEL => match frame.modelo {
                Some(model_ref) if !model_ref.trim().is_empty() => Ok(Command::SwapModel {
                    model_ref,
                    timestamp: frame.timestamp,
                }),
                _ => Err(CodecError::MissingModelRef(frame.comando)),
            },
            STOP => Ok(Command::Stop {
                timestamp: frame.timestamp,
            }),
            _ => Ok(Command::Unknown(frame.comando)),
        }
    }
}

/// Serializes any payload to UTF-8 JSON bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CodecError> {
    Ok(serde_json::to_vec(value)?)
}

/// Serializes a command.
pub fn encode_command(command: Command) -> Result<Vec<u8>, CodecError> {
    encode(&command.into_frame())
}

/// Decodes and validates a broadcast model.
pub fn decode_model(payload: &[u8]) -> Result<Model, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    Ok(Model::from_value(value)?)
}

/// Decodes a scenario; every value must be a number.
pub fn decode_scenario(payload: &[u8]) -> Result<Scenario, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decodes a result record.
pub fn decode_result(payload: &[u8]) -> Result<ResultRecord, CodecError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Decodes a command; unknown kinds decode to [`Command::Unknown`].
pub fn decode_command(payload: &[u8]) -> Result<Command, CodecError> {
    let frame: CommandFrame = serde_json::from_slice(payload)?;
    Command::from_frame(frame)
}

/// Compact JSON of a scenario, keys sorted; the de-duplication key.
pub fn scenario_fingerprint(scenario: &Scenario) -> Result<String, CodecError> {
    Ok(serde_json::to_string(scenario)?)
}
