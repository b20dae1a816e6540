use thiserror::Error;
use waypoint_store::StoreError;

pub type EngineResult<T> = Result<T, EngineError>;

/// Failures that stop a run and surface to the caller.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("No journey with reference '{reference}' (source:{namespace})")]
    JourneyNotFound { reference: String, namespace: String },

    #[error("Plan configuration error: {0}")]
    Config(String),

    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    #[error("Unknown source '{0}'")]
    UnknownSource(String),
}

/// Conditions raised while a step is being evaluated. The two data variants
/// become WAITING/ERROR step records; `Engine` propagates.
#[derive(Error, Debug)]
pub enum StepError {
    #[error("Data not available in step {step}{}", exception_suffix(.cause))]
    DataNotAvailable { step: String, cause: Option<String> },

    #[error("Data invalid in step {step}{}", exception_suffix(.cause))]
    InvalidData { step: String, cause: Option<String> },

    #[error(transparent)]
    Engine(#[from] EngineError),
}

fn exception_suffix(cause: &Option<String>) -> String {
    match cause {
        Some(cause) => format!(" [exception:{cause}]"),
        None => String::new(),
    }
}

impl StepError {
    pub fn not_available(step: &str) -> Self {
        StepError::DataNotAvailable {
            step: step.to_string(),
            cause: None,
        }
    }

    pub fn not_available_because(step: &str, cause: impl ToString) -> Self {
        StepError::DataNotAvailable {
            step: step.to_string(),
            cause: Some(cause.to_string()),
        }
    }

    pub fn invalid(step: &str, cause: impl ToString) -> Self {
        StepError::InvalidData {
            step: step.to_string(),
            cause: Some(cause.to_string()),
        }
    }
}

impl From<StoreError> for StepError {
    fn from(err: StoreError) -> Self {
        StepError::Engine(EngineError::Store(err))
    }
}
