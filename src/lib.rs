#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

//! Dose calibration: fit response models to calibration measurements, invert them for new
//! samples and propagate the fit and measurement uncertainties into the dose.

extern crate blas_src;

pub mod calibration;
pub mod config;
pub mod error;
pub mod fit;
pub mod invert;
pub mod io;
pub mod margin;
pub mod math;
pub mod model;
pub mod params;
pub mod pipeline;
pub mod propagate;
pub mod spectrum;

pub use error::{Error, ErrorKind};

pub type Result<T> = ::std::result::Result<T, Error>;
