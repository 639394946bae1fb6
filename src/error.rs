use serde::{Deserialize, Serialize};

/// Coarse classification of every failure the crate can report.
///
/// Calibration errors carry a full [`Error`]; per-sample failures only keep the kind, as the
/// `reason` of an invalid [`DoseEstimate`](crate::margin::DoseEstimate).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Fewer calibration points than free parameters, or no degrees of freedom left.
    InsufficientData,
    /// Every tier of the iteration schedule was exhausted.
    FitDidNotConverge,
    /// A parameter that has to be divided by is numerically zero.
    DegenerateModel,
    /// The response lies outside the range the model can be inverted over.
    InvalidInverseDomain,
    /// The covariance is not positive-semidefinite, or cannot be formed.
    IllConditionedCovariance,
    /// The model has no closed-form inverse (sum of Lorentzians).
    NoClosedFormInverse,
    /// Malformed input: mismatched lengths, NaNs, unparsable files.
    InvalidInput,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::InsufficientData => "insufficient data",
            Self::FitDidNotConverge => "fit did not converge",
            Self::DegenerateModel => "degenerate model",
            Self::InvalidInverseDomain => "invalid inverse domain",
            Self::IllConditionedCovariance => "ill-conditioned covariance",
            Self::NoClosedFormInverse => "no closed-form inverse",
            Self::InvalidInput => "invalid input",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{points} calibration points cannot constrain {parameters} parameters")]
    InsufficientData { points: usize, parameters: usize },

    #[error(
        "fit did not converge after {attempts} attempts \
         ({iterations} iterations in the last): {diagnostic}"
    )]
    FitDidNotConverge {
        attempts: usize,
        iterations: u64,
        diagnostic: String,
    },

    #[error("parameter `{parameter}` = {value:e} is numerically zero and cannot be inverted")]
    DegenerateModel { parameter: &'static str, value: f64 },

    #[error("response {response} is outside the invertible domain: {detail}")]
    InvalidInverseDomain { response: f64, detail: &'static str },

    #[error("covariance is ill-conditioned: {detail}")]
    IllConditionedCovariance { detail: String },

    #[error("model `{model}` has no closed-form inverse")]
    NoClosedFormInverse { model: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("line {line} of parameter file: {detail}")]
    ParameterFile { line: usize, detail: String },

    #[error("solver backend failed: {0}")]
    Solver(String),

    #[error("linear algebra failure: {0}")]
    Linalg(#[from] ndarray_linalg::error::LinalgError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    TomlDe(#[from] toml::de::Error),

    #[error(transparent)]
    TomlSer(#[from] toml::ser::Error),
}

impl Error {
    /// The taxonomy kind of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InsufficientData { .. } => ErrorKind::InsufficientData,
            Self::FitDidNotConverge { .. } | Self::Solver(_) => ErrorKind::FitDidNotConverge,
            Self::DegenerateModel { .. } => ErrorKind::DegenerateModel,
            Self::InvalidInverseDomain { .. } => ErrorKind::InvalidInverseDomain,
            Self::IllConditionedCovariance { .. } | Self::Linalg(_) => {
                ErrorKind::IllConditionedCovariance
            }
            Self::NoClosedFormInverse { .. } => ErrorKind::NoClosedFormInverse,
            Self::InvalidInput(_)
            | Self::ParameterFile { .. }
            | Self::Io(_)
            | Self::Csv(_)
            | Self::TomlDe(_)
            | Self::TomlSer(_) => ErrorKind::InvalidInput,
        }
    }
}

impl From<argmin::core::Error> for Error {
    fn from(value: argmin::core::Error) -> Self {
        Self::Solver(value.to_string())
    }
}
