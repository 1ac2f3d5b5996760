use std::{
    error::Error,
    fmt::{self, Display},
};

/// The result type used in the entire machine learning module.
pub type Result<T> = std::result::Result<T, MlErr>;

/// The machine learning module's error type.
#[derive(Debug, Clone, PartialEq)]
pub enum MlErr {
    SizeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },
    UnknownGroup(String),
    InvalidLabel {
        label: u8,
        nclass: usize,
    },
    TooManyClasses(usize),
    BackwardBeforeForward,
    UnknownBackbone(String),
    Init(String),
    Shape(String),
}

impl Display for MlErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MlErr::SizeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a size mismatch in {what}, got {got} and expected {expected}"
            ),
            MlErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(
                f,
                "There's a shape mismatch in {what}, got {got:?} and expected {expected:?}"
            ),
            MlErr::UnknownGroup(name) => write!(f, "There's no parameter group named {name}"),
            MlErr::InvalidLabel { label, nclass } => write!(
                f,
                "Found label {label} which is neither a class in [0, {nclass}) nor the ignore label"
            ),
            MlErr::TooManyClasses(nclass) => write!(
                f,
                "Predictions are stored as bytes, {nclass} classes don't fit"
            ),
            MlErr::BackwardBeforeForward => {
                write!(f, "Tried to run a backward pass without a previous forward pass")
            }
            MlErr::UnknownBackbone(name) => write!(
                f,
                "Unknown backbone {name}, its size must be one of small, base, large or giant"
            ),
            MlErr::Init(detail) => write!(f, "Failed to initialize the parameters: {detail}"),
            MlErr::Shape(detail) => write!(f, "Invalid array shape: {detail}"),
        }
    }
}

impl Error for MlErr {}

impl From<ndarray::ShapeError> for MlErr {
    fn from(value: ndarray::ShapeError) -> Self {
        Self::Shape(value.to_string())
    }
}

impl From<rand_distr::NormalError> for MlErr {
    fn from(value: rand_distr::NormalError) -> Self {
        Self::Init(value.to_string())
    }
}
